//! HTTP responses for requests the version gate turns away.

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use super::layer::VERSION_HEADER;

/// Why a request was rejected at the gate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GateRejection {
    #[error("missing required X-MCP-Version header")]
    MissingVersionHeader,

    #[error("{message}")]
    InvalidVersionFormat { message: String },

    #[error("client version {client} is not compatible with server version {server}")]
    IncompatibleVersion { client: String, server: String },
}

impl GateRejection {
    /// Stable machine-readable code placed in the response body.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingVersionHeader => "MISSING_VERSION_HEADER",
            Self::InvalidVersionFormat { .. } => "INVALID_VERSION_FORMAT",
            Self::IncompatibleVersion { .. } => "INCOMPATIBLE_VERSION",
        }
    }
}

impl IntoResponse for GateRejection {
    fn into_response(self) -> Response {
        let code = self.code();
        let error = self.to_string();
        match self {
            Self::IncompatibleVersion { server, .. } => {
                let body = json!({
                    "error": error,
                    "code": code,
                    "required_version": server,
                });
                let mut response = (StatusCode::BAD_REQUEST, Json(body)).into_response();
                if let Ok(value) = HeaderValue::from_str(&server) {
                    response.headers_mut().insert(VERSION_HEADER, value);
                }
                response
            }
            _ => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": error, "code": code })),
            )
                .into_response(),
        }
    }
}
