//! Async execution engine: single, batch, parallel, timeout-bounded and
//! retried tasks over a bounded worker pool.

pub mod executor;
pub mod pool;

pub use executor::{
    boxed_task, AsyncExecutionEngine, BoxedTask, EngineConfig, ExecutionError, TaskFuture,
    TaskHandle,
};
pub use pool::{WorkerPool, DEFAULT_MAX_WORKERS};
