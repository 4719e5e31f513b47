//! `mcp-hub`: runs one hub node with its HTTP surface and bus consumers.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use mcp_hub_core::SystemId;
use mcp_hub_server::gate::GateConfig;
use mcp_hub_server::metrics::install_prometheus_exporter;
use mcp_hub_server::network::TlsConfig;
use mcp_hub_server::{
    EngineConfig, HubConfig, HubRuntime, MessagingConfig, NetworkConfig, NetworkModule,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mcp-hub", version, about = "MCP integration hub node")]
struct Args {
    #[arg(long, env = "MCP_HUB_HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "MCP_HUB_PORT", default_value_t = 8080)]
    port: u16,

    /// Protocol version this node speaks.
    #[arg(long, env = "MCP_HUB_SERVER_VERSION", default_value = "1.0.0")]
    server_version: String,

    /// Name stamped into outbound envelopes.
    #[arg(long, env = "MCP_HUB_SYSTEM_NAME", default_value = "QMS")]
    system_name: String,

    #[arg(long, env = "MCP_HUB_ROUTING_PREFIX", default_value = "qms")]
    routing_prefix: String,

    #[arg(long, env = "MCP_HUB_EXCHANGE", default_value = "mcp.exchange")]
    exchange: String,

    /// Siblings to consume from; defaults to all known systems.
    #[arg(long, env = "MCP_HUB_INBOUND_SOURCES", value_delimiter = ',')]
    inbound_sources: Vec<SystemId>,

    /// Publish retries for a gated send.
    #[arg(long, env = "MCP_HUB_SEND_MAX_RETRIES", default_value_t = 2)]
    send_max_retries: u32,

    #[arg(long, env = "MCP_HUB_SEND_BACKOFF_MS", default_value_t = 100)]
    send_backoff_ms: u64,

    #[arg(long, env = "MCP_HUB_MAX_WORKERS", default_value_t = 16)]
    max_workers: usize,

    #[arg(long, env = "MCP_HUB_BATCH_SIZE", default_value_t = 10)]
    batch_size: usize,

    #[arg(long, env = "MCP_HUB_MAX_PARALLELISM", default_value_t = 4)]
    max_parallelism: usize,

    /// Compatibility verdicts kept by the version gate.
    #[arg(long, env = "MCP_HUB_CACHE_CAPACITY", default_value_t = 1000)]
    cache_capacity: usize,

    #[arg(long, env = "MCP_HUB_CORS_ORIGINS", value_delimiter = ',', default_value = "*")]
    cors_origins: Vec<String>,

    #[arg(long, env = "MCP_HUB_REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    request_timeout_secs: u64,

    #[arg(long, env = "MCP_HUB_DRAIN_TIMEOUT_SECS", default_value_t = 30)]
    drain_timeout_secs: u64,

    /// Prometheus scrape address; disabled when unset.
    #[arg(long, env = "MCP_HUB_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    #[arg(long, env = "MCP_HUB_TLS_CERT", requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    #[arg(long, env = "MCP_HUB_TLS_KEY", requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, env = "MCP_HUB_LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn hub_config(self) -> HubConfig {
        let tls = match (self.tls_cert, self.tls_key) {
            (Some(cert_path), Some(key_path)) => Some(TlsConfig {
                cert_path,
                key_path,
            }),
            _ => None,
        };
        let inbound_sources = if self.inbound_sources.is_empty() {
            SystemId::ALL.to_vec()
        } else {
            self.inbound_sources
        };

        HubConfig {
            system_name: self.system_name,
            server_version: self.server_version,
            messaging: MessagingConfig {
                exchange: self.exchange,
                routing_prefix: self.routing_prefix,
                inbound_sources,
                send_max_retries: self.send_max_retries,
                send_backoff_ms: self.send_backoff_ms,
            },
            engine: EngineConfig {
                max_workers: self.max_workers,
                batch_size: self.batch_size,
                max_parallelism: self.max_parallelism,
            },
            gate: GateConfig {
                cache_capacity: self.cache_capacity,
                ..GateConfig::default()
            },
            network: NetworkConfig {
                host: self.host,
                port: self.port,
                tls,
                cors_origins: self.cors_origins,
                request_timeout: Duration::from_secs(self.request_timeout_secs),
                drain_timeout: Duration::from_secs(self.drain_timeout_secs),
            },
            metrics_addr: self.metrics_addr,
            ..HubConfig::default()
        }
    }
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| anyhow::anyhow!("failed to initialise tracing: {e}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json)?;

    let config = args.hub_config();
    if let Some(addr) = config.metrics_addr {
        install_prometheus_exporter(addr)?;
    }

    let network_config = config.network.clone();
    let hub = Arc::new(HubRuntime::new(config).context("invalid hub configuration")?);
    let consumers = hub.start_consumers();

    let mut network = NetworkModule::new(network_config, Arc::clone(&hub));
    let port = network.start().await?;
    info!(port, "mcp-hub ready");

    let served = network.serve(shutdown_signal()).await;
    consumers.stop().await;
    info!("mcp-hub stopped");
    served
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sigterm) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            sigterm.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
