//! HTTP surface of the hub with a deferred startup lifecycle.
//!
//! `new()` allocates shared state, `start()` binds the listener, and `serve()`
//! accepts connections until the shutdown future resolves. Handlers and
//! consumers can be wired between `start()` and `serve()`.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::config::{NetworkConfig, TlsConfig};
use super::handlers::{
    cache_clear_handler, cache_stats_handler, errors_handler, health_handler,
    list_systems_handler, liveness_handler, not_found_handler, operations_handler,
    queues_handler, readiness_handler, reset_metrics_handler, resources_handler,
    send_message_handler, system_metrics_handler, version_handler, AppState,
};
use super::middleware::build_http_layers;
use super::shutdown::ShutdownController;
use crate::gate::VersionGateLayer;
use crate::runtime::HubRuntime;

/// Owns the listener and shutdown controller for the hub's HTTP server.
pub struct NetworkModule {
    config: NetworkConfig,
    listener: Option<TcpListener>,
    hub: Arc<HubRuntime>,
    shutdown: Arc<ShutdownController>,
    start_time: Instant,
}

impl NetworkModule {
    /// Creates the module without binding any port.
    #[must_use]
    pub fn new(config: NetworkConfig, hub: Arc<HubRuntime>) -> Self {
        Self {
            config,
            listener: None,
            hub,
            shutdown: Arc::new(ShutdownController::new()),
            start_time: Instant::now(),
        }
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Assembles the router.
    ///
    /// Probes:
    /// - `GET /health`, `GET /health/live`, `GET /health/ready`
    ///
    /// Hub (gated except `/mcp/version`):
    /// - `GET /mcp/version`
    /// - `GET /mcp/systems`
    /// - `POST /mcp/systems/{system}/messages`
    ///
    /// Admin:
    /// - `GET /admin/metrics/{system,operations,resources,errors,cache,queues}`
    /// - `POST /admin/metrics/reset`, `POST /admin/cache/clear`
    ///
    /// Unmatched paths get a JSON 404. The fallback sits inside the version
    /// gate, so an unknown `/mcp/...` path still needs a valid header.
    pub fn build_router(&self) -> Router {
        let state = AppState {
            hub: Arc::clone(&self.hub),
            shutdown: Arc::clone(&self.shutdown),
            start_time: self.start_time,
        };

        Router::new()
            .route("/health", get(health_handler))
            .route("/health/live", get(liveness_handler))
            .route("/health/ready", get(readiness_handler))
            .route("/mcp/version", get(version_handler))
            .route("/mcp/systems", get(list_systems_handler))
            .route("/mcp/systems/{system}/messages", post(send_message_handler))
            .route("/admin/metrics/system", get(system_metrics_handler))
            .route("/admin/metrics/operations", get(operations_handler))
            .route("/admin/metrics/resources", get(resources_handler))
            .route("/admin/metrics/errors", get(errors_handler))
            .route("/admin/metrics/cache", get(cache_stats_handler))
            .route("/admin/metrics/queues", get(queues_handler))
            .route("/admin/metrics/reset", post(reset_metrics_handler))
            .route("/admin/cache/clear", post(cache_clear_handler))
            .fallback(not_found_handler)
            .layer(VersionGateLayer::new(self.hub.gate().clone()))
            .layer(build_http_layers(&self.config))
            .with_state(state)
    }

    /// Binds the TCP listener and returns the bound port (useful with port 0).
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();

        info!(host = %self.config.host, port, "TCP listener bound");

        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves until `shutdown` resolves, then drains in-flight requests.
    ///
    /// Health moves to `Ready` when serving begins, to `Draining` as soon as
    /// the shutdown future resolves, and to `Stopped` once in-flight requests
    /// finish within `drain_timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called first, if TLS material
    /// cannot be loaded, or on a fatal I/O error.
    pub async fn serve(
        mut self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| anyhow::anyhow!("start() must be called before serve()"))?;
        let router = self.build_router();
        let controller = Arc::clone(&self.shutdown);

        let signal_ctrl = Arc::clone(&controller);
        let shutdown = async move {
            shutdown.await;
            info!("shutdown signal received, draining");
            signal_ctrl.trigger_shutdown();
        };

        controller.set_ready();

        match &self.config.tls {
            Some(tls) => serve_tls(listener, router, tls, shutdown).await?,
            None => serve_plain(listener, router, shutdown).await?,
        }

        if controller.wait_for_drain(self.config.drain_timeout).await {
            info!("all requests drained");
        } else {
            warn!(
                in_flight = controller.in_flight_count(),
                "drain timeout expired with requests in flight"
            );
        }
        Ok(())
    }
}

async fn serve_plain(
    listener: TcpListener,
    router: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    info!("serving plain HTTP");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Serves HTTPS through `axum-server`, reusing the pre-bound listener.
async fn serve_tls(
    listener: TcpListener,
    router: Router,
    tls: &TlsConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    use axum_server::tls_rustls::RustlsConfig;

    let rustls_config = RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
        .await
        .map_err(|e| anyhow::anyhow!("failed to load TLS certificates: {e}"))?;

    let addr = listener.local_addr()?;
    let std_listener = listener.into_std()?;
    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();

    tokio::spawn(async move {
        shutdown.await;
        shutdown_handle.graceful_shutdown(None);
    });

    info!(%addr, "serving HTTPS");
    axum_server::from_tcp_rustls(std_listener, rustls_config)
        .handle(handle)
        .serve(router.into_make_service())
        .await?;
    Ok(())
}
