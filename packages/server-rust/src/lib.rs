//! MCP hub server: version gate, async execution engine, message routing to
//! sibling systems, and call metrics behind an axum HTTP surface.

pub mod config;
pub mod engine;
pub mod gate;
pub mod messaging;
pub mod metrics;
pub mod network;
pub mod runtime;

pub use config::{HubConfig, MessagingConfig};
pub use engine::{AsyncExecutionEngine, EngineConfig, ExecutionError, TaskHandle, WorkerPool};
pub use gate::{VersionGate, VersionGateLayer};
pub use messaging::{MessageListener, MessageRouter, MessagingError};
pub use metrics::CallMetricsRegistry;
pub use network::{NetworkConfig, NetworkModule, ShutdownController};
pub use runtime::HubRuntime;
