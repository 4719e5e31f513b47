//! Process-wide hub state, constructed once and shared via `Arc`.
//!
//! `HubRuntime::new` builds the metrics registry, version gate, broker
//! topology, router, listener and execution engine from a [`HubConfig`].
//! Nothing here is global; tests build as many runtimes as they like.

use std::sync::Arc;

use mcp_hub_core::{RoutingScheme, SystemId, VersionCompatibility, VersionError};
use tracing::info;

use crate::config::HubConfig;
use crate::engine::{AsyncExecutionEngine, WorkerPool};
use crate::gate::{CompatibilityCache, VersionGate};
use crate::messaging::{
    ConsumerContext, ConsumerGroup, InMemoryBroker, MessageBroker, MessageListener,
    MessageRouter, MessageSource, RouterConfig,
};
use crate::metrics::CallMetricsRegistry;

/// Shared components of one hub node.
pub struct HubRuntime {
    config: HubConfig,
    routing: RoutingScheme,
    metrics: CallMetricsRegistry,
    compat: Arc<VersionCompatibility>,
    gate: VersionGate,
    broker: Arc<InMemoryBroker>,
    router: Arc<MessageRouter>,
    listener: Arc<MessageListener>,
    engine: AsyncExecutionEngine,
}

impl HubRuntime {
    /// Builds every component and declares the broker topology.
    ///
    /// # Errors
    ///
    /// Returns [`VersionError`] if `config.server_version` is not a valid
    /// `MAJOR.MINOR.PATCH` version.
    pub fn new(config: HubConfig) -> Result<Self, VersionError> {
        let compat = Arc::new(VersionCompatibility::new(&config.server_version)?);
        let metrics = CallMetricsRegistry::with_error_capacity(config.error_capacity);
        let routing = RoutingScheme::new(config.messaging.routing_prefix.clone());

        let cache = Arc::new(CompatibilityCache::new(config.gate.cache_capacity));
        let gate = VersionGate::new(Arc::clone(&compat), cache, config.gate.clone());

        let broker = Arc::new(InMemoryBroker::new(config.messaging.exchange.clone()));
        declare_topology(&broker, &routing, &config.messaging.inbound_sources);

        let router = Arc::new(MessageRouter::new(
            Arc::clone(&broker) as Arc<dyn MessageBroker>,
            metrics.clone(),
            RouterConfig {
                exchange: config.messaging.exchange.clone(),
                source_system: config.system_name.clone(),
                routing: routing.clone(),
            },
        ));
        let listener = Arc::new(MessageListener::new(metrics.clone()));

        let pool = Arc::new(WorkerPool::new(config.engine.max_workers));
        let engine = AsyncExecutionEngine::new(pool, metrics.clone(), config.engine);

        info!(
            system = %config.system_name,
            version = %compat.current(),
            exchange = %config.messaging.exchange,
            prefix = %routing.prefix(),
            "hub runtime initialised"
        );

        Ok(Self {
            config,
            routing,
            metrics,
            compat,
            gate,
            broker,
            router,
            listener,
            engine,
        })
    }

    /// Starts one consumer per configured inbound source plus the
    /// dead-letter consumer. Must be called from within a tokio runtime.
    #[must_use]
    pub fn start_consumers(&self) -> ConsumerGroup {
        let ctx = ConsumerContext {
            source: Arc::clone(&self.broker) as Arc<dyn MessageSource>,
            broker: Arc::clone(&self.broker) as Arc<dyn MessageBroker>,
            listener: Arc::clone(&self.listener),
            routing: self.routing.clone(),
            exchange: self.config.messaging.exchange.clone(),
        };
        let sources: Vec<&str> = self
            .config
            .messaging
            .inbound_sources
            .iter()
            .map(|s| s.as_str())
            .collect();
        ConsumerGroup::start(&ctx, &sources)
    }

    #[must_use]
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    #[must_use]
    pub fn routing(&self) -> &RoutingScheme {
        &self.routing
    }

    #[must_use]
    pub fn metrics(&self) -> &CallMetricsRegistry {
        &self.metrics
    }

    #[must_use]
    pub fn compatibility(&self) -> &Arc<VersionCompatibility> {
        &self.compat
    }

    #[must_use]
    pub fn gate(&self) -> &VersionGate {
        &self.gate
    }

    #[must_use]
    pub fn broker(&self) -> &Arc<InMemoryBroker> {
        &self.broker
    }

    #[must_use]
    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    #[must_use]
    pub fn listener(&self) -> &Arc<MessageListener> {
        &self.listener
    }

    #[must_use]
    pub fn engine(&self) -> &AsyncExecutionEngine {
        &self.engine
    }
}

/// Binds every routing key this node sends or receives on.
///
/// Outbound keys land in the sibling's own inbound queue
/// (`<target>.<prefix>.queue`), inbound keys in this node's queue per source,
/// and the dead-letter key in the dead-letter queue.
fn declare_topology(broker: &InMemoryBroker, routing: &RoutingScheme, sources: &[SystemId]) {
    for target in SystemId::ALL {
        let sibling = RoutingScheme::new(target.as_str());
        broker.bind(
            &routing.outbound_key(target.as_str()),
            &sibling.inbound_queue(routing.prefix()),
        );
    }
    for source in sources {
        broker.bind(
            &routing.inbound_key(source.as_str()),
            &routing.inbound_queue(source.as_str()),
        );
    }
    broker.bind(&routing.dead_letter_key(), &routing.dead_letter_queue());
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn rejects_malformed_server_version() {
        let config = HubConfig {
            server_version: "one".to_string(),
            ..HubConfig::default()
        };
        assert!(HubRuntime::new(config).is_err());
    }

    #[test]
    fn declares_inbound_outbound_and_dead_letter_queues() {
        let hub = HubRuntime::new(HubConfig::default()).unwrap();
        let queues = hub.broker().queue_names();

        assert!(queues.contains(&"qms.mes.queue".to_string()));
        assert!(queues.contains(&"mes.qms.queue".to_string()));
        assert!(queues.contains(&"qms.dead-letter.queue".to_string()));
        // Six inbound, six sibling, one dead-letter.
        assert_eq!(queues.len(), 13);
    }

    #[tokio::test]
    async fn outbound_send_lands_in_sibling_queue() {
        let hub = HubRuntime::new(HubConfig::default()).unwrap();
        hub.router().send("lims", "SAMPLE", json!({})).await.unwrap();
        assert_eq!(hub.broker().queue_depth("lims.qms.queue"), Some(1));
    }

    #[tokio::test]
    async fn consumers_cover_configured_sources() {
        let mut config = HubConfig::default();
        config.messaging.inbound_sources = vec![SystemId::Mes, SystemId::Erp];
        let hub = HubRuntime::new(config).unwrap();

        let group = hub.start_consumers();
        assert_eq!(
            group.queues(),
            vec!["qms.mes.queue", "qms.erp.queue", "qms.dead-letter.queue"]
        );
        group.stop().await;
    }
}
