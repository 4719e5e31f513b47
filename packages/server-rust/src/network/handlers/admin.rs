//! Operator endpoints: call metrics, the compatibility cache and queue depths.
//!
//! Reads are `GET`; the two mutating endpoints (`reset`, `clear`) are `POST`.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::AppState;
use crate::gate::CacheStats;
use crate::messaging::SourceStats;
use crate::metrics::{ErrorRecord, OperationSnapshot, SystemSnapshot};

const DEFAULT_ERROR_LIMIT: usize = 50;

pub async fn system_metrics_handler(State(state): State<AppState>) -> Json<SystemSnapshot> {
    Json(state.hub.metrics().system_snapshot())
}

/// Per-operation snapshots, sorted by name.
pub async fn operations_handler(State(state): State<AppState>) -> Json<Vec<OperationSnapshot>> {
    Json(state.hub.metrics().operation_snapshots())
}

pub async fn resources_handler(State(state): State<AppState>) -> Json<Vec<OperationSnapshot>> {
    Json(state.hub.metrics().resource_snapshots())
}

#[derive(Debug, Deserialize)]
pub struct ErrorsQuery {
    pub limit: Option<usize>,
}

/// Recent errors, newest first. `?limit=` defaults to 50.
pub async fn errors_handler(
    State(state): State<AppState>,
    Query(query): Query<ErrorsQuery>,
) -> Json<Vec<ErrorRecord>> {
    let limit = query.limit.unwrap_or(DEFAULT_ERROR_LIMIT);
    Json(state.hub.metrics().recent_errors(limit))
}

pub async fn cache_stats_handler(State(state): State<AppState>) -> Json<CacheStats> {
    Json(state.hub.gate().cache().stats())
}

#[derive(Debug, Serialize)]
pub struct QueueDepth {
    pub queue: String,
    pub depth: usize,
}

#[derive(Debug, Serialize)]
pub struct QueueReport {
    pub broker_available: bool,
    pub queues: Vec<QueueDepth>,
    pub sources: Vec<SourceStats>,
}

/// Declared queues with their pending depth plus per-source receive counters.
pub async fn queues_handler(State(state): State<AppState>) -> Json<QueueReport> {
    let broker = state.hub.broker();
    let queues = broker
        .queue_names()
        .into_iter()
        .map(|queue| {
            let depth = broker.queue_depth(&queue).unwrap_or(0);
            QueueDepth { queue, depth }
        })
        .collect();

    Json(QueueReport {
        broker_available: broker.is_available(),
        queues,
        sources: state.hub.listener().stats(),
    })
}

pub async fn reset_metrics_handler(State(state): State<AppState>) -> StatusCode {
    state.hub.metrics().reset();
    info!("call metrics reset");
    StatusCode::NO_CONTENT
}

pub async fn cache_clear_handler(State(state): State<AppState>) -> StatusCode {
    state.hub.gate().cache().clear();
    StatusCode::NO_CONTENT
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::handlers::test_state;

    #[tokio::test]
    async fn reset_clears_operations_and_errors() {
        let state = test_state();
        let metrics = state.hub.metrics();
        metrics.start_timer("ping").complete(true);
        metrics.record_error("ping", "boom");

        assert_eq!(operations_handler(State(state.clone())).await.0.len(), 1);
        assert_eq!(
            system_metrics_handler(State(state.clone())).await.0.total_calls,
            1
        );

        let status = reset_metrics_handler(State(state.clone())).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(operations_handler(State(state.clone())).await.0.is_empty());
        let errors = errors_handler(State(state), Query(ErrorsQuery { limit: None }))
            .await
            .0;
        assert!(errors.is_empty());
    }

    #[tokio::test]
    async fn errors_respect_limit() {
        let state = test_state();
        for i in 0..5 {
            state.hub.metrics().record_error("op", format!("failure {i}"));
        }

        let errors = errors_handler(State(state), Query(ErrorsQuery { limit: Some(2) }))
            .await
            .0;
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].message, "failure 4");
    }

    #[tokio::test]
    async fn resources_list_timed_accesses() {
        let state = test_state();
        state
            .hub
            .metrics()
            .start_resource_access("systems")
            .complete(true);

        let resources = resources_handler(State(state)).await.0;
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].name, "systems");
    }

    #[tokio::test]
    async fn cache_stats_and_clear() {
        let state = test_state();
        let gate = state.hub.gate();
        gate.cache().insert("MES", "1.2.0", true);
        assert!(gate.cache().get("MES", "1.2.0").is_some());

        let stats = cache_stats_handler(State(state.clone())).await.0;
        assert_eq!(stats.size, 1);
        assert_eq!(stats.hits, 1);

        assert_eq!(
            cache_clear_handler(State(state.clone())).await,
            StatusCode::NO_CONTENT
        );
        let stats = cache_stats_handler(State(state)).await.0;
        assert_eq!(stats.size, 0);
        assert_eq!(stats.hits, 0);
    }

    #[tokio::test]
    async fn queues_report_depths() {
        let state = test_state();
        state
            .hub
            .router()
            .send("lims", "SAMPLE_READY", serde_json::json!({}))
            .await
            .unwrap();

        let report = queues_handler(State(state)).await.0;
        assert!(report.broker_available);
        assert_eq!(report.queues.len(), 13);
        let lims = report
            .queues
            .iter()
            .find(|q| q.queue == "lims.qms.queue")
            .unwrap();
        assert_eq!(lims.depth, 1);
    }
}
