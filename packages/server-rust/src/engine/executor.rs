//! Timed task execution on the worker pool.
//!
//! Every unit of work is dispatched through [`WorkerPool`] and timed in the
//! [`CallMetricsRegistry`] under its own name. Results come back through
//! [`TaskHandle`], a future resolving to `Result<T, ExecutionError>`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use super::pool::WorkerPool;
use crate::metrics::CallMetricsRegistry;

// ---------------------------------------------------------------------------
// Config and task types
// ---------------------------------------------------------------------------

/// Engine sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Worker-pool slots shared by every task.
    pub max_workers: usize,
    /// Items per batch in [`AsyncExecutionEngine::execute_batch_async`].
    pub batch_size: usize,
    /// Batches allowed to run at the same time.
    pub max_parallelism: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: super::pool::DEFAULT_MAX_WORKERS,
            batch_size: 10,
            max_parallelism: 4,
        }
    }
}

/// Type-erased future produced by a [`BoxedTask`].
pub type TaskFuture<T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send>>;

/// Type-erased task for [`AsyncExecutionEngine::execute_parallel_async`].
pub type BoxedTask<T> = Box<dyn FnOnce() -> TaskFuture<T> + Send>;

/// Boxes an async closure into a [`BoxedTask`].
pub fn boxed_task<T, F, Fut>(f: F) -> BoxedTask<T>
where
    T: 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    Box::new(move || -> TaskFuture<T> { Box::pin(f()) })
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why a task did not produce a value.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("task {name} failed: {source}")]
    Failed {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("task {name} timed out after {timeout_ms}ms")]
    Timeout { name: String, timeout_ms: u64 },

    #[error("task {name} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        name: String,
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("task {name} panicked")]
    Panicked { name: String },

    #[error("task {name} was cancelled")]
    Cancelled { name: String },
}

impl ExecutionError {
    /// Name of the task the error belongs to.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Failed { name, .. }
            | Self::Timeout { name, .. }
            | Self::RetriesExhausted { name, .. }
            | Self::Panicked { name }
            | Self::Cancelled { name } => name,
        }
    }

    fn from_join(name: &str, err: &JoinError) -> Self {
        let name = name.to_string();
        if err.is_panic() {
            Self::Panicked { name }
        } else {
            Self::Cancelled { name }
        }
    }
}

// ---------------------------------------------------------------------------
// TaskHandle
// ---------------------------------------------------------------------------

/// Pending result of a submitted task.
///
/// The task runs whether or not the handle is awaited; dropping the handle
/// only discards the result.
#[must_use = "dropping a TaskHandle discards the task's result"]
#[derive(Debug)]
pub struct TaskHandle<T> {
    name: String,
    inner: JoinHandle<Result<T, ExecutionError>>,
}

impl<T> TaskHandle<T> {
    fn new(name: impl Into<String>, inner: JoinHandle<Result<T, ExecutionError>>) -> Self {
        Self {
            name: name.into(),
            inner,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, ExecutionError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(join_err)) => {
                Poll::Ready(Err(ExecutionError::from_join(&this.name, &join_err)))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// AsyncExecutionEngine
// ---------------------------------------------------------------------------

/// Submits timed work to a shared [`WorkerPool`].
#[derive(Debug, Clone)]
pub struct AsyncExecutionEngine {
    pool: Arc<WorkerPool>,
    metrics: CallMetricsRegistry,
    config: EngineConfig,
}

impl AsyncExecutionEngine {
    #[must_use]
    pub fn new(pool: Arc<WorkerPool>, metrics: CallMetricsRegistry, config: EngineConfig) -> Self {
        Self {
            pool,
            metrics,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Runs `task` on the pool, timed under `name`.
    ///
    /// The timer starts here, before the task is queued, so pool wait time
    /// counts toward the duration.
    pub fn execute_async<T, F, Fut>(&self, name: &str, task: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let timer = self.metrics.start_timer(name);
        let metrics = self.metrics.clone();
        let task_name = name.to_string();

        let handle = self.pool.spawn(async move {
            match task().await {
                Ok(value) => {
                    timer.complete(true);
                    Ok(value)
                }
                Err(source) => {
                    timer.complete(false);
                    metrics.record_error(&task_name, format!("{source:#}"));
                    debug!(task = %task_name, error = %source, "task failed");
                    Err(ExecutionError::Failed {
                        name: task_name,
                        source,
                    })
                }
            }
        });
        TaskHandle::new(name, handle)
    }

    /// Processes `items` in batches of `batch_size`, at most
    /// `max_parallelism` batches at a time.
    ///
    /// Items within a batch run one after another, each timed under `name`.
    /// An item whose processor fails is logged and left out of the result;
    /// the batch carries on with the next item. Result order across batches
    /// follows completion order.
    pub fn execute_batch_async<I, R, P, Fut>(
        &self,
        name: &str,
        items: Vec<I>,
        processor: P,
    ) -> TaskHandle<Vec<R>>
    where
        I: Send + 'static,
        R: Send + 'static,
        P: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let batches = into_batches(items, self.config.batch_size.max(1));
        let limiter = Arc::new(Semaphore::new(self.config.max_parallelism.max(1)));
        let processor = Arc::new(processor);
        let pool = Arc::clone(&self.pool);
        let metrics = self.metrics.clone();
        let task_name = name.to_string();

        // The coordinator itself holds no pool slot so it cannot starve
        // the batches it waits on.
        let handle = tokio::spawn(async move {
            let batch_count = batches.len();
            let mut running = JoinSet::new();
            for (index, batch) in batches.into_iter().enumerate() {
                let limiter = Arc::clone(&limiter);
                let pool = Arc::clone(&pool);
                let processor = Arc::clone(&processor);
                let metrics = metrics.clone();
                let name = task_name.clone();
                running.spawn(async move {
                    let _slot = limiter.acquire_owned().await.ok();
                    pool.run(process_batch(&metrics, &name, index, batch, processor.as_ref()))
                        .await
                });
            }

            let mut results = Vec::new();
            while let Some(joined) = running.join_next().await {
                match joined {
                    Ok(mut batch) => results.append(&mut batch),
                    Err(e) => {
                        warn!(task = %task_name, error = %e, "batch aborted, its items are dropped");
                    }
                }
            }
            debug!(
                task = %task_name,
                batches = batch_count,
                results = results.len(),
                "batch run finished"
            );
            Ok(results)
        });
        TaskHandle::new(name, handle)
    }

    /// Runs every task concurrently, each timed under its own key.
    ///
    /// A task that fails maps to `None`; the others are unaffected.
    pub fn execute_parallel_async<T>(
        &self,
        tasks: HashMap<String, BoxedTask<T>>,
    ) -> TaskHandle<HashMap<String, Option<T>>>
    where
        T: Send + 'static,
    {
        let handles: Vec<(String, TaskHandle<T>)> = tasks
            .into_iter()
            .map(|(name, task)| {
                let handle = self.execute_async(&name, task);
                (name, handle)
            })
            .collect();

        let handle = tokio::spawn(async move {
            let mut results = HashMap::with_capacity(handles.len());
            for (name, handle) in handles {
                let value = match handle.await {
                    Ok(value) => Some(value),
                    Err(e) => {
                        warn!(task = %name, error = %e, "parallel task failed");
                        None
                    }
                };
                results.insert(name, value);
            }
            Ok(results)
        });
        TaskHandle::new("parallel", handle)
    }

    /// Like [`execute_async`](Self::execute_async) but resolves to
    /// [`ExecutionError::Timeout`] if the task has not finished within
    /// `timeout_ms`.
    ///
    /// The underlying task is not cancelled; it keeps running and its timer
    /// completes when it does.
    pub fn execute_async_with_timeout<T, F, Fut>(
        &self,
        name: &str,
        task: F,
        timeout_ms: u64,
    ) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let inner = self.execute_async(name, task);
        let task_name = name.to_string();

        let handle = tokio::spawn(async move {
            match tokio::time::timeout(Duration::from_millis(timeout_ms), inner).await {
                Ok(result) => result,
                Err(_elapsed) => {
                    warn!(task = %task_name, timeout_ms, "task timed out");
                    Err(ExecutionError::Timeout {
                        name: task_name,
                        timeout_ms,
                    })
                }
            }
        });
        TaskHandle::new(name, handle)
    }

    /// Runs `task` up to `max_retries + 1` times until it succeeds.
    ///
    /// Attempt `n` (from 1) is timed as `<name>_attempt_<n>`. After a failed
    /// attempt `n` that is not the last, waits `initial_backoff_ms * 2^(n-1)`.
    /// When every attempt fails the handle resolves to
    /// [`ExecutionError::RetriesExhausted`] carrying the last error.
    pub fn execute_async_with_retry<T, F, Fut>(
        &self,
        name: &str,
        task: F,
        max_retries: u32,
        initial_backoff_ms: u64,
    ) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let pool = Arc::clone(&self.pool);
        let metrics = self.metrics.clone();
        let task_name = name.to_string();

        // Slots are held per attempt only, never across a backoff sleep.
        let handle = tokio::spawn(async move {
            let attempts = max_retries.saturating_add(1);
            let mut attempt: u32 = 1;
            loop {
                let attempt_name = format!("{task_name}_attempt_{attempt}");
                match pool.run(metrics.timed(&attempt_name, task())).await {
                    Ok(value) => {
                        if attempt > 1 {
                            info!(task = %task_name, attempt, "task succeeded after retry");
                        }
                        return Ok(value);
                    }
                    Err(source) if attempt >= attempts => {
                        metrics.record_error(&task_name, format!("{source:#}"));
                        error!(task = %task_name, attempts, error = %source, "all attempts failed");
                        return Err(ExecutionError::RetriesExhausted {
                            name: task_name,
                            attempts,
                            source,
                        });
                    }
                    Err(source) => {
                        let backoff = backoff_delay(initial_backoff_ms, attempt);
                        warn!(
                            task = %task_name,
                            attempt,
                            backoff = ?backoff,
                            error = %source,
                            "attempt failed, retrying"
                        );
                        tokio::time::sleep(backoff).await;
                        attempt += 1;
                    }
                }
            }
        });
        TaskHandle::new(name, handle)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn into_batches<I>(items: Vec<I>, batch_size: usize) -> Vec<Vec<I>> {
    let mut batches = Vec::with_capacity(items.len().div_ceil(batch_size));
    let mut items = items.into_iter().peekable();
    while items.peek().is_some() {
        batches.push(items.by_ref().take(batch_size).collect());
    }
    batches
}

async fn process_batch<I, R, P, Fut>(
    metrics: &CallMetricsRegistry,
    name: &str,
    index: usize,
    batch: Vec<I>,
    processor: &P,
) -> Vec<R>
where
    P: Fn(I) -> Fut,
    Fut: Future<Output = anyhow::Result<R>>,
{
    let mut out = Vec::with_capacity(batch.len());
    for item in batch {
        let timer = metrics.start_timer(name);
        match processor(item).await {
            Ok(result) => {
                timer.complete(true);
                out.push(result);
            }
            Err(e) => {
                timer.complete(false);
                metrics.record_error(name, format!("{e:#}"));
                warn!(task = %name, batch = index, error = %e, "batch item failed, dropping it");
            }
        }
    }
    out
}

/// `initial_ms * 2^(attempt-1)`, saturating.
fn backoff_delay(initial_ms: u64, attempt: u32) -> Duration {
    let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
    Duration::from_millis(initial_ms.saturating_mul(factor))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
