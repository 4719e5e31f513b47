//! Per-operation and system-wide call metrics.
//!
//! Counters are individually atomic. Reading several fields of the same
//! metric is *not* atomic as a group: under concurrent load a reader may see
//! `total_calls` from before a completion and `success_calls` from after it.
//! Tests that need consistent values must quiesce the workload first.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

/// Default number of recent errors retained for the query surface.
pub const DEFAULT_ERROR_CAPACITY: usize = 100;

// ---------------------------------------------------------------------------
// OperationMetrics
// ---------------------------------------------------------------------------

/// Live counters for one named operation.
#[derive(Debug, Default)]
pub struct OperationMetrics {
    total_calls: AtomicU64,
    success_calls: AtomicU64,
    failed_calls: AtomicU64,
    total_duration_ms: AtomicU64,
    max_duration_ms: AtomicU64,
}

impl OperationMetrics {
    fn record_start(&self) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
    }

    fn record_completion(&self, duration_ms: u64, success: bool) {
        self.total_duration_ms.fetch_add(duration_ms, Ordering::Relaxed);
        self.max_duration_ms.fetch_max(duration_ms, Ordering::Relaxed);
        if success {
            self.success_calls.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_calls.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn clear(&self) {
        self.total_calls.store(0, Ordering::Relaxed);
        self.success_calls.store(0, Ordering::Relaxed);
        self.failed_calls.store(0, Ordering::Relaxed);
        self.total_duration_ms.store(0, Ordering::Relaxed);
        self.max_duration_ms.store(0, Ordering::Relaxed);
    }

    #[must_use]
    pub fn total_calls(&self) -> u64 {
        self.total_calls.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn success_calls(&self) -> u64 {
        self.success_calls.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failed_calls(&self) -> u64 {
        self.failed_calls.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn total_duration_ms(&self) -> u64 {
        self.total_duration_ms.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn max_duration_ms(&self) -> u64 {
        self.max_duration_ms.load(Ordering::Relaxed)
    }

    /// Mean duration over completed calls, 0.0 when nothing has completed.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn average_duration_ms(&self) -> f64 {
        let completed = self.success_calls() + self.failed_calls();
        if completed == 0 {
            0.0
        } else {
            self.total_duration_ms() as f64 / completed as f64
        }
    }

    /// Fraction of completed calls that succeeded, in `[0.0, 1.0]`.
    ///
    /// Returns 1.0 when nothing has completed yet.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        let success = self.success_calls();
        let completed = success + self.failed_calls();
        if completed == 0 {
            1.0
        } else {
            success as f64 / completed as f64
        }
    }

    fn snapshot(&self, name: &str) -> OperationSnapshot {
        OperationSnapshot {
            name: name.to_string(),
            total_calls: self.total_calls(),
            success_calls: self.success_calls(),
            failed_calls: self.failed_calls(),
            total_duration_ms: self.total_duration_ms(),
            max_duration_ms: self.max_duration_ms(),
            average_duration_ms: self.average_duration_ms(),
            success_rate: self.success_rate(),
        }
    }
}

// ---------------------------------------------------------------------------
// SystemMetrics
// ---------------------------------------------------------------------------

/// System-wide aggregate: every call's counters plus concurrency tracking.
#[derive(Debug, Default)]
pub struct SystemMetrics {
    calls: OperationMetrics,
    active_calls: AtomicU64,
    peak_concurrent_calls: AtomicU64,
}

impl SystemMetrics {
    /// Aggregate call counters shared by tool calls and resource accesses.
    #[must_use]
    pub fn calls(&self) -> &OperationMetrics {
        &self.calls
    }

    #[must_use]
    pub fn total_calls(&self) -> u64 {
        self.calls.total_calls()
    }

    #[must_use]
    pub fn success_calls(&self) -> u64 {
        self.calls.success_calls()
    }

    #[must_use]
    pub fn failed_calls(&self) -> u64 {
        self.calls.failed_calls()
    }

    /// Calls started but not yet completed.
    #[must_use]
    pub fn active_calls(&self) -> u64 {
        self.active_calls.load(Ordering::Relaxed)
    }

    /// Highest `active_calls` observed since start or the last reset.
    #[must_use]
    pub fn peak_concurrent_calls(&self) -> u64 {
        self.peak_concurrent_calls.load(Ordering::Relaxed)
    }

    fn enter(&self) -> u64 {
        let active = self.active_calls.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_concurrent_calls.fetch_max(active, Ordering::Relaxed);
        active
    }

    fn exit(&self) -> u64 {
        let previous = self
            .active_calls
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            })
            .unwrap_or(0);
        previous.saturating_sub(1)
    }
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// Field-by-field copy of an [`OperationMetrics`] for serialization.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationSnapshot {
    pub name: String,
    pub total_calls: u64,
    pub success_calls: u64,
    pub failed_calls: u64,
    pub total_duration_ms: u64,
    pub max_duration_ms: u64,
    pub average_duration_ms: f64,
    pub success_rate: f64,
}

/// Field-by-field copy of the [`SystemMetrics`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemSnapshot {
    pub total_calls: u64,
    pub success_calls: u64,
    pub failed_calls: u64,
    pub total_duration_ms: u64,
    pub max_duration_ms: u64,
    pub average_duration_ms: f64,
    pub success_rate: f64,
    pub active_calls: u64,
    pub peak_concurrent_calls: u64,
}

/// One entry in the recent-error list.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub operation: String,
    pub message: String,
}

/// Which named table a timer reports into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// Tool calls: engine tasks, message sends and receives.
    Tool,
    /// Resource accesses.
    Resource,
}

impl MetricKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            MetricKind::Tool => "tool",
            MetricKind::Resource => "resource",
        }
    }
}

// ---------------------------------------------------------------------------
// CallMetricsRegistry
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct RegistryInner {
    tools: DashMap<String, Arc<OperationMetrics>>,
    resources: DashMap<String, Arc<OperationMetrics>>,
    system: SystemMetrics,
    errors: Mutex<VecDeque<ErrorRecord>>,
    error_capacity: usize,
}

impl RegistryInner {
    fn table(&self, kind: MetricKind) -> &DashMap<String, Arc<OperationMetrics>> {
        match kind {
            MetricKind::Tool => &self.tools,
            MetricKind::Resource => &self.resources,
        }
    }

    fn bucket(&self, kind: MetricKind, name: &str) -> Arc<OperationMetrics> {
        if let Some(existing) = self.table(kind).get(name) {
            return Arc::clone(existing.value());
        }
        Arc::clone(
            self.table(kind)
                .entry(name.to_string())
                .or_default()
                .value(),
        )
    }
}

/// Thread-safe call counters and timers.
///
/// Cloning is cheap and every clone observes the same tables. Construct one
/// per process and hand clones to the components that record into it.
#[derive(Debug, Clone)]
pub struct CallMetricsRegistry {
    inner: Arc<RegistryInner>,
}

impl CallMetricsRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::with_error_capacity(DEFAULT_ERROR_CAPACITY)
    }

    /// Creates a registry that keeps at most `error_capacity` recent errors.
    #[must_use]
    pub fn with_error_capacity(error_capacity: usize) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                tools: DashMap::new(),
                resources: DashMap::new(),
                system: SystemMetrics::default(),
                errors: Mutex::new(VecDeque::with_capacity(error_capacity)),
                error_capacity,
            }),
        }
    }

    /// Starts timing a tool call named `name`.
    pub fn start_timer(&self, name: &str) -> TimerHandle {
        self.start(MetricKind::Tool, name)
    }

    /// Starts timing a resource access named `name`.
    pub fn start_resource_access(&self, name: &str) -> TimerHandle {
        self.start(MetricKind::Resource, name)
    }

    fn start(&self, kind: MetricKind, name: &str) -> TimerHandle {
        self.inner.system.calls.record_start();
        self.inner.bucket(kind, name).record_start();
        let active = self.inner.system.enter();
        #[allow(clippy::cast_precision_loss)]
        ::metrics::gauge!("mcp_active_calls").set(active as f64);

        TimerHandle {
            inner: Arc::clone(&self.inner),
            kind,
            name: name.to_string(),
            started: Instant::now(),
            completed: false,
        }
    }

    /// Runs `fut` under a tool-call timer named `name`.
    ///
    /// The timer completes with `success = result.is_ok()`.
    ///
    /// # Errors
    ///
    /// Returns whatever error `fut` resolves to, unchanged.
    pub async fn timed<T, E, F>(&self, name: &str, fut: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
    {
        let timer = self.start_timer(name);
        let result = fut.await;
        timer.complete(result.is_ok());
        result
    }

    /// Live system-wide aggregate.
    #[must_use]
    pub fn system_metrics(&self) -> &SystemMetrics {
        &self.inner.system
    }

    /// Live counters for a tool call, if it has been seen.
    #[must_use]
    pub fn operation_metrics(&self, name: &str) -> Option<Arc<OperationMetrics>> {
        self.inner.tools.get(name).map(|e| Arc::clone(e.value()))
    }

    /// Live counters for a resource access, if it has been seen.
    #[must_use]
    pub fn resource_metrics(&self, name: &str) -> Option<Arc<OperationMetrics>> {
        self.inner.resources.get(name).map(|e| Arc::clone(e.value()))
    }

    #[must_use]
    pub fn system_snapshot(&self) -> SystemSnapshot {
        let system = &self.inner.system;
        SystemSnapshot {
            total_calls: system.calls.total_calls(),
            success_calls: system.calls.success_calls(),
            failed_calls: system.calls.failed_calls(),
            total_duration_ms: system.calls.total_duration_ms(),
            max_duration_ms: system.calls.max_duration_ms(),
            average_duration_ms: system.calls.average_duration_ms(),
            success_rate: system.calls.success_rate(),
            active_calls: system.active_calls(),
            peak_concurrent_calls: system.peak_concurrent_calls(),
        }
    }

    /// Tool-call snapshots sorted by name.
    #[must_use]
    pub fn operation_snapshots(&self) -> Vec<OperationSnapshot> {
        Self::snapshots(&self.inner.tools)
    }

    /// Resource-access snapshots sorted by name.
    #[must_use]
    pub fn resource_snapshots(&self) -> Vec<OperationSnapshot> {
        Self::snapshots(&self.inner.resources)
    }

    fn snapshots(table: &DashMap<String, Arc<OperationMetrics>>) -> Vec<OperationSnapshot> {
        let mut out: Vec<_> = table
            .iter()
            .map(|entry| entry.value().snapshot(entry.key()))
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Appends to the bounded recent-error list, evicting the oldest entry.
    pub fn record_error(&self, operation: &str, message: impl Into<String>) {
        let record = ErrorRecord {
            timestamp: Utc::now(),
            operation: operation.to_string(),
            message: message.into(),
        };
        ::metrics::counter!("mcp_errors_total", "operation" => operation.to_string()).increment(1);

        let mut errors = self.inner.errors.lock();
        if self.inner.error_capacity == 0 {
            return;
        }
        if errors.len() >= self.inner.error_capacity {
            errors.pop_back();
        }
        errors.push_front(record);
    }

    /// Up to `limit` recent errors, newest first.
    #[must_use]
    pub fn recent_errors(&self, limit: usize) -> Vec<ErrorRecord> {
        self.inner.errors.lock().iter().take(limit).cloned().collect()
    }

    /// Clears every named metric, zeroes the system counters, and empties the
    /// recent-error list.
    ///
    /// `active_calls` tracks timers still in flight and is left alone; the
    /// peak restarts from it. Those timers complete into freshly created
    /// buckets.
    pub fn reset(&self) {
        self.inner.tools.clear();
        self.inner.resources.clear();
        self.inner.system.calls.clear();
        self.inner
            .system
            .peak_concurrent_calls
            .store(self.inner.system.active_calls(), Ordering::Relaxed);
        self.inner.errors.lock().clear();
        tracing::info!("call metrics reset");
    }
}

impl Default for CallMetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// TimerHandle
// ---------------------------------------------------------------------------

/// A started call. Complete it exactly once with the call's outcome.
///
/// Dropping a handle without calling [`complete`](Self::complete) records a
/// failure, so a panicking or cancelled unit of work is still counted.
#[derive(Debug)]
#[must_use = "a timer records a failure if dropped without complete()"]
pub struct TimerHandle {
    inner: Arc<RegistryInner>,
    kind: MetricKind,
    name: String,
    started: Instant,
    completed: bool,
}

impl TimerHandle {
    /// Name the timer reports under.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stops the stopwatch and records the outcome.
    pub fn complete(mut self, success: bool) {
        self.finish(success);
    }

    fn finish(&mut self, success: bool) {
        if self.completed {
            return;
        }
        self.completed = true;

        let elapsed = self.started.elapsed();
        #[allow(clippy::cast_possible_truncation)]
        let duration_ms = elapsed.as_millis() as u64;

        self.inner
            .bucket(self.kind, &self.name)
            .record_completion(duration_ms, success);
        self.inner.system.calls.record_completion(duration_ms, success);
        let active = self.inner.system.exit();

        let outcome = if success { "success" } else { "failure" };
        ::metrics::counter!(
            "mcp_calls_total",
            "kind" => self.kind.as_str(),
            "operation" => self.name.clone(),
            "outcome" => outcome
        )
        .increment(1);
        ::metrics::histogram!(
            "mcp_call_duration_seconds",
            "kind" => self.kind.as_str(),
            "operation" => self.name.clone()
        )
        .record(elapsed.as_secs_f64());
        #[allow(clippy::cast_precision_loss)]
        ::metrics::gauge!("mcp_active_calls").set(active as f64);

        tracing::trace!(
            kind = self.kind.as_str(),
            operation = %self.name,
            duration_ms,
            outcome,
            "call complete"
        );
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.finish(false);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
