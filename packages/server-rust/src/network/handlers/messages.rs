//! Gated message endpoints: sending to sibling systems and listing them.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use mcp_hub_core::SystemId;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use super::{error_response, AppState};
use crate::gate::{ClientVersion, UNKNOWN_SYSTEM};

/// Body of `POST /mcp/systems/{system}/messages`.
#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub operation: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Broker priority, clamped to `0..=10`.
    pub priority: Option<i64>,
    /// Visibility delay in milliseconds.
    pub delay_ms: Option<u64>,
}

/// How a send is published; `priority` and `delay_ms` are mutually exclusive.
#[derive(Debug, Clone, Copy)]
enum SendMode {
    Plain,
    Priority(i64),
    Delayed(u64),
}

/// Sends one message to `system` through the router.
///
/// The publish runs on the execution engine as `send_<system>` and is retried
/// per [`MessagingConfig`](crate::MessagingConfig). 202 with `{"message_id"}`
/// once the broker accepts it, 404 for an unknown system, 400 when both
/// `priority` and `delay_ms` are given, 502 when every attempt fails.
pub async fn send_message_handler(
    State(state): State<AppState>,
    Path(system): Path<String>,
    client: Option<Extension<ClientVersion>>,
    Json(request): Json<SendMessageRequest>,
) -> Response {
    let _guard = state.shutdown.in_flight_guard();

    let target = match system.parse::<SystemId>() {
        Ok(target) => target,
        Err(e) => return error_response(StatusCode::NOT_FOUND, "UNKNOWN_SYSTEM", e),
    };

    let caller = client.map_or_else(|| UNKNOWN_SYSTEM.to_string(), |Extension(c)| c.system);
    info!(caller = %caller, target = %target, operation = %request.operation, "send requested");

    let SendMessageRequest {
        operation,
        payload,
        priority,
        delay_ms,
    } = request;
    let mode = match (priority, delay_ms) {
        (Some(_), Some(_)) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "INVALID_REQUEST",
                "priority and delay_ms cannot be combined",
            );
        }
        (Some(priority), None) => SendMode::Priority(priority),
        (None, Some(delay_ms)) => SendMode::Delayed(delay_ms),
        (None, None) => SendMode::Plain,
    };

    let router = Arc::clone(state.hub.router());
    let messaging = &state.hub.config().messaging;
    let result = state
        .hub
        .engine()
        .execute_async_with_retry(
            &format!("send_{target}"),
            move || {
                let router = Arc::clone(&router);
                let operation = operation.clone();
                let payload = payload.clone();
                async move {
                    let target = target.as_str();
                    let sent = match mode {
                        SendMode::Plain => router.send(target, &operation, payload).await,
                        SendMode::Priority(priority) => {
                            router
                                .send_priority(target, &operation, payload, priority)
                                .await
                        }
                        SendMode::Delayed(delay_ms) => {
                            router
                                .send_delayed(target, &operation, payload, delay_ms)
                                .await
                        }
                    };
                    sent.map_err(anyhow::Error::from)
                }
            },
            messaging.send_max_retries,
            messaging.send_backoff_ms,
        )
        .await;

    match result {
        Ok(message_id) => (
            StatusCode::ACCEPTED,
            Json(json!({ "message_id": message_id })),
        )
            .into_response(),
        Err(e) => error_response(StatusCode::BAD_GATEWAY, "PUBLISH_FAILED", e),
    }
}

#[derive(Debug, Serialize)]
pub struct SystemRoute {
    pub system: SystemId,
    pub outbound_key: String,
    pub inbound_queue: String,
}

/// `GET /mcp/systems`: known sibling systems and their bus names.
pub async fn list_systems_handler(State(state): State<AppState>) -> Json<Vec<SystemRoute>> {
    let timer = state.hub.metrics().start_resource_access("systems");
    let routing = state.hub.routing();
    let routes = SystemId::ALL
        .into_iter()
        .map(|system| SystemRoute {
            system,
            outbound_key: routing.outbound_key(system.as_str()),
            inbound_queue: routing.inbound_queue(system.as_str()),
        })
        .collect();
    timer.complete(true);
    Json(routes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::handlers::test_state;

    fn request(body: serde_json::Value) -> Json<SendMessageRequest> {
        Json(serde_json::from_value(body).unwrap())
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn send_returns_accepted_with_id() {
        let state = test_state();
        let response = send_message_handler(
            State(state.clone()),
            Path("mes".to_string()),
            None,
            request(json!({"operation": "ALERT", "payload": {"lot": "A1"}})),
        )
        .await;

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = body_json(response).await;
        assert!(body["message_id"].is_string());
        assert_eq!(state.hub.broker().queue_depth("mes.qms.queue"), Some(1));
        assert_eq!(state.shutdown.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn unknown_system_is_not_found() {
        let response = send_message_handler(
            State(test_state()),
            Path("crm".to_string()),
            None,
            request(json!({"operation": "ALERT"})),
        )
        .await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["code"], "UNKNOWN_SYSTEM");
    }

    #[tokio::test(start_paused = true)]
    async fn broker_outage_is_bad_gateway() {
        let state = test_state();
        state.hub.broker().set_available(false);

        let response = send_message_handler(
            State(state.clone()),
            Path("erp".to_string()),
            None,
            request(json!({"operation": "ALERT"})),
        )
        .await;

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(body_json(response).await["code"], "PUBLISH_FAILED");
        // One initial attempt plus the default two retries.
        let stats = state.hub.metrics().operation_metrics("mq_send_erp").unwrap();
        assert_eq!(stats.failed_calls(), 3);
        assert!(state
            .hub
            .metrics()
            .operation_metrics("send_erp_attempt_4")
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn send_recovers_when_broker_returns_between_attempts() {
        let state = test_state();
        state.hub.broker().set_available(false);

        let broker = Arc::clone(state.hub.broker());
        let recover = tokio::spawn(async move {
            // Lands inside the first backoff window.
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            broker.set_available(true);
        });

        let response = send_message_handler(
            State(state.clone()),
            Path("lims".to_string()),
            None,
            request(json!({"operation": "SAMPLE_READY", "priority": 7})),
        )
        .await;
        recover.await.unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(state.hub.broker().queue_depth("lims.qms.queue"), Some(1));
        let metrics = state.hub.metrics();
        assert_eq!(
            metrics
                .operation_metrics("send_lims_attempt_1")
                .unwrap()
                .failed_calls(),
            1
        );
        assert_eq!(
            metrics
                .operation_metrics("send_lims_attempt_2")
                .unwrap()
                .success_calls(),
            1
        );
    }

    #[tokio::test]
    async fn priority_and_delay_are_exclusive() {
        let response = send_message_handler(
            State(test_state()),
            Path("mes".to_string()),
            None,
            request(json!({"operation": "ALERT", "priority": 5, "delay_ms": 10})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn list_systems_is_timed_as_resource() {
        let state = test_state();
        let routes = list_systems_handler(State(state.clone())).await.0;

        assert_eq!(routes.len(), 6);
        assert_eq!(routes[1].outbound_key, "qms.to.mes");
        assert_eq!(routes[1].inbound_queue, "qms.mes.queue");
        let stats = state.hub.metrics().resource_metrics("systems").unwrap();
        assert_eq!(stats.success_calls(), 1);
    }
}
