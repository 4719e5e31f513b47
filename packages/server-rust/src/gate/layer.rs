//! Protocol version gate as a Tower layer.
//!
//! Requests under the hub prefix must carry `X-MCP-Version`. The version is
//! checked against the server's version; compatible requests continue with a
//! [`ClientVersion`] extension attached, everything else is answered with a
//! [`GateRejection`] and never reaches the handler.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::response::{IntoResponse, Response};
use http::{HeaderMap, HeaderValue, Request};
use mcp_hub_core::{CompatibilityError, VersionCompatibility};
use tower::{Layer, Service};
use tracing::{debug, warn};

use super::cache::{CompatibilityCache, DEFAULT_CACHE_CAPACITY};
use super::rejection::GateRejection;

/// Header carrying the client's protocol version (and the server's, on responses).
pub const VERSION_HEADER: &str = "x-mcp-version";
/// Header naming the calling system.
pub const SYSTEM_HEADER: &str = "x-mcp-system";
/// System name used when `X-MCP-System` is absent.
pub const UNKNOWN_SYSTEM: &str = "Unknown-System";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Which paths the gate applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateConfig {
    /// Only paths under this prefix are checked.
    pub hub_prefix: String,
    /// Paths under the prefix that are never checked, including their subpaths.
    pub excluded_paths: Vec<String>,
    pub cache_capacity: usize,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            hub_prefix: "/mcp".to_string(),
            excluded_paths: vec!["/mcp/version".to_string(), "/mcp/health".to_string()],
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

impl GateConfig {
    /// Whether `path` bypasses the gate.
    #[must_use]
    pub fn is_excluded(&self, path: &str) -> bool {
        !is_under(path, &self.hub_prefix)
            || self.excluded_paths.iter().any(|p| is_under(path, p))
    }
}

/// `path` equals `prefix` or lies beneath it on a segment boundary.
fn is_under(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

// ---------------------------------------------------------------------------
// Gate decision
// ---------------------------------------------------------------------------

/// Validated caller identity, attached to requests that pass the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientVersion {
    pub version: String,
    pub system: String,
}

/// Outcome of evaluating one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// Path is not gated.
    Passthrough,
    /// Compatible caller.
    Forward(ClientVersion),
    Reject(GateRejection),
}

/// Shared gate state: the server version, exclusions and verdict cache.
#[derive(Debug, Clone)]
pub struct VersionGate {
    compat: Arc<VersionCompatibility>,
    cache: Arc<CompatibilityCache>,
    config: Arc<GateConfig>,
    server_header: Option<HeaderValue>,
}

impl VersionGate {
    #[must_use]
    pub fn new(
        compat: Arc<VersionCompatibility>,
        cache: Arc<CompatibilityCache>,
        config: GateConfig,
    ) -> Self {
        let server_header = HeaderValue::from_str(compat.current_str()).ok();
        Self {
            compat,
            cache,
            config: Arc::new(config),
            server_header,
        }
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<CompatibilityCache> {
        &self.cache
    }

    #[must_use]
    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Decides what to do with a request to `path` carrying `headers`.
    ///
    /// A cached `true` verdict short-circuits the version check. Misses and
    /// cached `false` verdicts run the full check so the rejection stays
    /// specific.
    #[must_use]
    pub fn evaluate(&self, path: &str, headers: &HeaderMap) -> GateDecision {
        if self.config.is_excluded(path) {
            return GateDecision::Passthrough;
        }

        let Some(raw_version) = headers.get(VERSION_HEADER) else {
            warn!(path, "request without {VERSION_HEADER} header rejected");
            return GateDecision::Reject(GateRejection::MissingVersionHeader);
        };
        let Ok(version) = raw_version.to_str() else {
            return GateDecision::Reject(GateRejection::InvalidVersionFormat {
                message: format!("{VERSION_HEADER} header is not valid text"),
            });
        };
        let version = version.trim();
        let system = system_of(path, headers);

        if self.cache.get(&system, version) == Some(true) {
            return GateDecision::Forward(ClientVersion {
                version: version.to_string(),
                system,
            });
        }

        match self.compat.check(version) {
            Ok(_) => {
                self.cache.insert(&system, version, true);
                debug!(system = %system, version, "client version accepted");
                GateDecision::Forward(ClientVersion {
                    version: version.to_string(),
                    system,
                })
            }
            Err(CompatibilityError::InvalidFormat(e)) => {
                self.cache.insert(&system, version, false);
                warn!(system = %system, version, "malformed client version rejected");
                GateDecision::Reject(GateRejection::InvalidVersionFormat {
                    message: e.to_string(),
                })
            }
            Err(CompatibilityError::Incompatible { client, server }) => {
                self.cache.insert(&system, version, false);
                warn!(
                    system = %system,
                    client = %client,
                    server = %server,
                    "incompatible client version rejected"
                );
                GateDecision::Reject(GateRejection::IncompatibleVersion {
                    client: client.to_string(),
                    server: self.compat.current_str().to_string(),
                })
            }
        }
    }
}

/// Calling system from `X-MCP-System`, or [`UNKNOWN_SYSTEM`] when absent.
fn system_of(path: &str, headers: &HeaderMap) -> String {
    match headers
        .get(SYSTEM_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
    {
        Some(system) if !system.is_empty() => system.to_string(),
        _ => {
            warn!(path, "request without {SYSTEM_HEADER} header, using {UNKNOWN_SYSTEM}");
            UNKNOWN_SYSTEM.to_string()
        }
    }
}

// ---------------------------------------------------------------------------
// VersionGateLayer
// ---------------------------------------------------------------------------

/// Tower layer applying a [`VersionGate`] to every request.
#[derive(Debug, Clone)]
pub struct VersionGateLayer {
    gate: VersionGate,
}

impl VersionGateLayer {
    #[must_use]
    pub fn new(gate: VersionGate) -> Self {
        Self { gate }
    }
}

impl<S> Layer<S> for VersionGateLayer {
    type Service = VersionGateService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        VersionGateService {
            inner,
            gate: self.gate.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// VersionGateService
// ---------------------------------------------------------------------------

/// Service wrapper produced by [`VersionGateLayer`].
#[derive(Debug, Clone)]
pub struct VersionGateService<S> {
    inner: S,
    gate: VersionGate,
}

impl<S, B> Service<Request<B>> for VersionGateService<S>
where
    S: Service<Request<B>, Response = Response> + Send,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    B: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Response, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<B>) -> Self::Future {
        match self.gate.evaluate(req.uri().path(), req.headers()) {
            GateDecision::Passthrough => Box::pin(self.inner.call(req)),
            GateDecision::Reject(rejection) => {
                ::metrics::counter!("mcp_gate_rejections_total", "code" => rejection.code())
                    .increment(1);
                Box::pin(async move { Ok(rejection.into_response()) })
            }
            GateDecision::Forward(client) => {
                req.extensions_mut().insert(client);
                let server_header = self.gate.server_header.clone();
                let fut = self.inner.call(req);
                Box::pin(async move {
                    let mut response = fut.await?;
                    if let Some(value) = server_header {
                        response.headers_mut().insert(VERSION_HEADER, value);
                    }
                    Ok(response)
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
