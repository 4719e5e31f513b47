//! Hub configuration.
//!
//! Every section has a `Default` suitable for a single-node deployment; the
//! binary overrides fields from command-line flags and `MCP_HUB_*` variables.

use std::net::SocketAddr;

use mcp_hub_core::SystemId;

use crate::engine::EngineConfig;
use crate::gate::GateConfig;
use crate::metrics::registry::DEFAULT_ERROR_CAPACITY;
use crate::network::NetworkConfig;

/// Top-level configuration for one hub node.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Name this node stamps into `sourceSystem` of outbound envelopes.
    pub system_name: String,
    /// Protocol version this node speaks, `MAJOR.MINOR.PATCH`.
    pub server_version: String,
    pub messaging: MessagingConfig,
    pub engine: EngineConfig,
    pub gate: GateConfig,
    pub network: NetworkConfig,
    /// Prometheus scrape address; no exporter is installed when `None`.
    pub metrics_addr: Option<SocketAddr>,
    /// How many recent errors the metrics registry keeps.
    pub error_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            system_name: "QMS".to_string(),
            server_version: "1.0.0".to_string(),
            messaging: MessagingConfig::default(),
            engine: EngineConfig::default(),
            gate: GateConfig::default(),
            network: NetworkConfig::default(),
            metrics_addr: None,
            error_capacity: DEFAULT_ERROR_CAPACITY,
        }
    }
}

/// Message-bus addressing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagingConfig {
    pub exchange: String,
    /// Prefix of this node's routing keys and queue names.
    pub routing_prefix: String,
    /// Siblings this node consumes from, one inbound queue each.
    pub inbound_sources: Vec<SystemId>,
    /// Extra publish attempts for a gated send after the first one fails.
    pub send_max_retries: u32,
    /// Wait before the first send retry; doubles on each later one.
    pub send_backoff_ms: u64,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            exchange: "mcp.exchange".to_string(),
            routing_prefix: "qms".to_string(),
            inbound_sources: SystemId::ALL.to_vec(),
            send_max_retries: 2,
            send_backoff_ms: 100,
        }
    }
}
