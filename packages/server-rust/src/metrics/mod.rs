//! Call and message instrumentation.
//!
//! - [`registry`]: in-process counters and timers backing the query surface
//! - [`exporter`]: optional Prometheus scrape endpoint for the same calls

pub mod exporter;
pub mod registry;

pub use exporter::install_prometheus_exporter;
pub use registry::{
    CallMetricsRegistry, ErrorRecord, MetricKind, OperationMetrics, OperationSnapshot,
    SystemMetrics, SystemSnapshot, TimerHandle,
};
