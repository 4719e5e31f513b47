//! Version discovery, reachable without a version header.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use super::AppState;

#[derive(Debug, Serialize)]
pub struct VersionInfo {
    pub current_version: String,
    pub minimum_compatible_version: String,
    pub node: String,
}

/// `GET /mcp/version`: what this node speaks and the oldest client it accepts.
pub async fn version_handler(State(state): State<AppState>) -> Json<VersionInfo> {
    let compat = state.hub.compatibility();
    Json(VersionInfo {
        current_version: compat.current_str().to_string(),
        minimum_compatible_version: compat.minimum_compatible().to_string(),
        node: state.hub.config().system_name.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::handlers::test_state;

    #[tokio::test]
    async fn reports_current_and_minimum_version() {
        let info = version_handler(State(test_state())).await.0;
        assert_eq!(info.current_version, "1.5.0");
        assert_eq!(info.minimum_compatible_version, "1.0.0");
        assert_eq!(info.node, "QMS");
    }
}
