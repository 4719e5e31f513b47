//! HTTP handlers and the shared state they extract.

pub mod admin;
pub mod health;
pub mod messages;
pub mod version;

pub use admin::{
    cache_clear_handler, cache_stats_handler, errors_handler, operations_handler,
    queues_handler, reset_metrics_handler, resources_handler, system_metrics_handler,
};
pub use health::{health_handler, liveness_handler, readiness_handler};
pub use messages::{list_systems_handler, send_message_handler};
pub use version::version_handler;

use std::sync::Arc;
use std::time::Instant;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use super::ShutdownController;
use crate::runtime::HubRuntime;

/// State carried through axum's `State` extractor. Cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<HubRuntime>,
    pub shutdown: Arc<ShutdownController>,
    pub start_time: Instant,
}

/// JSON error body `{"error", "code"}` with a status.
pub(crate) fn error_response(status: StatusCode, code: &str, error: impl ToString) -> Response {
    (
        status,
        Json(json!({ "error": error.to_string(), "code": code })),
    )
        .into_response()
}

/// Fallback for unmatched routes.
pub async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "NOT_FOUND", "no such route")
}

#[cfg(test)]
pub(crate) fn test_state() -> AppState {
    use crate::config::HubConfig;

    let config = HubConfig {
        server_version: "1.5.0".to_string(),
        ..HubConfig::default()
    };
    AppState {
        hub: Arc::new(HubRuntime::new(config).expect("valid test config")),
        shutdown: Arc::new(ShutdownController::new()),
        start_time: Instant::now(),
    }
}
