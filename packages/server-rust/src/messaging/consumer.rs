//! Background consumers: one task per inbound queue plus one for the
//! dead-letter queue.
//!
//! Inbound deliveries are decoded and handed to the [`MessageListener`]. A
//! delivery that fails to decode or whose handler fails is re-published to
//! the dead-letter queue with `retryCount` advanced. The dead-letter consumer
//! only records what arrives there.

use std::sync::Arc;
use std::time::Duration;

use mcp_hub_core::{MessageEnvelope, RoutingScheme};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::broker::{Delivery, MessageBroker, MessageSource, OutboundMessage};
use super::listener::MessageListener;

/// Pause after a transport error before polling the queue again.
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_millis(250);

/// Everything a consumer task needs, shared across tasks.
#[derive(Clone)]
pub struct ConsumerContext {
    pub source: Arc<dyn MessageSource>,
    pub broker: Arc<dyn MessageBroker>,
    pub listener: Arc<MessageListener>,
    pub routing: RoutingScheme,
    pub exchange: String,
}

/// Running set of consumer tasks.
pub struct ConsumerGroup {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<(String, JoinHandle<()>)>,
}

impl ConsumerGroup {
    /// Spawns one consumer per `sources` entry plus the dead-letter consumer.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn start<S: AsRef<str>>(ctx: &ConsumerContext, sources: &[S]) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let mut handles = Vec::with_capacity(sources.len() + 1);

        for system in sources {
            let system = system.as_ref().to_string();
            let queue = ctx.routing.inbound_queue(&system);
            let task = tokio::spawn(inbound_loop(
                ctx.clone(),
                system,
                queue.clone(),
                shutdown_tx.subscribe(),
            ));
            handles.push((queue, task));
        }

        let dlq = ctx.routing.dead_letter_queue();
        let task = tokio::spawn(dead_letter_loop(
            ctx.clone(),
            dlq.clone(),
            shutdown_tx.subscribe(),
        ));
        handles.push((dlq, task));

        info!(consumers = handles.len(), "message consumers started");
        Self {
            shutdown_tx,
            handles,
        }
    }

    /// Queues being consumed, in start order.
    #[must_use]
    pub fn queues(&self) -> Vec<&str> {
        self.handles.iter().map(|(q, _)| q.as_str()).collect()
    }

    /// Signals every consumer to stop and waits for them to exit.
    ///
    /// A delivery already being handled finishes first.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        for (queue, handle) in self.handles {
            if let Err(e) = handle.await {
                error!(queue = %queue, error = %e, "consumer task ended abnormally");
            }
        }
        info!("message consumers stopped");
    }
}

// ---------------------------------------------------------------------------
// Consumer loops
// ---------------------------------------------------------------------------

async fn inbound_loop(
    ctx: ConsumerContext,
    system: String,
    queue: String,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    debug!(queue = %queue, "inbound consumer running");
    loop {
        let delivery = tokio::select! {
            _ = shutdown_rx.changed() => break,
            delivery = ctx.source.next_delivery(&queue) => delivery,
        };
        match delivery {
            Ok(delivery) => handle_inbound(&ctx, &system, delivery).await,
            Err(e) => {
                warn!(queue = %queue, error = %e, "receive failed");
                tokio::time::sleep(RECEIVE_ERROR_BACKOFF).await;
            }
        }
    }
    debug!(queue = %queue, "inbound consumer exiting");
}

async fn dead_letter_loop(
    ctx: ConsumerContext,
    queue: String,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    debug!(queue = %queue, "dead-letter consumer running");
    loop {
        let delivery = tokio::select! {
            _ = shutdown_rx.changed() => break,
            delivery = ctx.source.next_delivery(&queue) => delivery,
        };
        match delivery {
            Ok(delivery) => match MessageEnvelope::from_json_slice(&delivery.body) {
                Ok(envelope) => ctx.listener.on_dead_letter(&envelope),
                Err(e) => error!(
                    message_id = %delivery.properties.message_id,
                    error = %e,
                    "undecodable message in dead-letter queue"
                ),
            },
            Err(e) => {
                warn!(queue = %queue, error = %e, "receive failed");
                tokio::time::sleep(RECEIVE_ERROR_BACKOFF).await;
            }
        }
    }
    debug!(queue = %queue, "dead-letter consumer exiting");
}

async fn handle_inbound(ctx: &ConsumerContext, system: &str, delivery: Delivery) {
    let envelope = match MessageEnvelope::from_json_slice(&delivery.body) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(
                queue = %delivery.queue,
                message_id = %delivery.properties.message_id,
                error = %e,
                "undecodable inbound message"
            );
            // Forward the raw body; there is no envelope to advance.
            dead_letter(ctx, &delivery, delivery.body.clone()).await;
            return;
        }
    };

    if ctx.listener.on_message(system, &envelope).await.is_err() {
        match envelope.for_redelivery().to_json_bytes() {
            Ok(body) => dead_letter(ctx, &delivery, body).await,
            Err(e) => error!(
                message_id = %envelope.message_id,
                error = %e,
                "failed to re-encode message for dead-lettering"
            ),
        }
    }
}

async fn dead_letter(ctx: &ConsumerContext, delivery: &Delivery, body: Vec<u8>) {
    let mut properties = delivery.properties.clone();
    properties.delay = None;
    let message = OutboundMessage {
        exchange: ctx.exchange.clone(),
        routing_key: ctx.routing.dead_letter_key(),
        properties,
        body,
    };
    if let Err(e) = ctx.broker.publish(message).await {
        error!(
            message_id = %delivery.properties.message_id,
            error = %e,
            "failed to dead-letter message, dropping it"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::messaging::broker::MessageProperties;
    use crate::messaging::listener::handler_fn;
    use crate::messaging::InMemoryBroker;
    use crate::metrics::CallMetricsRegistry;

    fn setup() -> (Arc<InMemoryBroker>, Arc<MessageListener>, ConsumerContext) {
        let routing = RoutingScheme::new("qms");
        let broker = Arc::new(InMemoryBroker::new("mcp.exchange"));
        broker.bind(&routing.inbound_key("mes"), &routing.inbound_queue("mes"));
        broker.bind(&routing.dead_letter_key(), &routing.dead_letter_queue());
        let listener = Arc::new(MessageListener::new(CallMetricsRegistry::new()));
        let ctx = ConsumerContext {
            source: Arc::clone(&broker) as Arc<dyn MessageSource>,
            broker: Arc::clone(&broker) as Arc<dyn MessageBroker>,
            listener: Arc::clone(&listener),
            routing,
            exchange: "mcp.exchange".to_string(),
        };
        (broker, listener, ctx)
    }

    async fn publish_raw(broker: &InMemoryBroker, body: Vec<u8>) {
        broker
            .publish(OutboundMessage {
                exchange: "mcp.exchange".to_string(),
                routing_key: "mes.to.qms".to_string(),
                properties: MessageProperties {
                    message_id: uuid::Uuid::new_v4(),
                    content_type: "application/json".to_string(),
                    timestamp: chrono::Utc::now(),
                    priority: None,
                    delay: None,
                },
                body,
            })
            .await
            .unwrap();
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn inbound_message_reaches_handler() {
        let (broker, listener, ctx) = setup();
        let handled = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&handled);
        listener.register_handler(
            "ALERT",
            handler_fn(move |_env: MessageEnvelope| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    anyhow::Ok(())
                }
            }),
        );

        let group = ConsumerGroup::start(&ctx, &["mes"]);
        assert_eq!(group.queues(), vec!["qms.mes.queue", "qms.dead-letter.queue"]);

        let envelope = MessageEnvelope::new("MES", "ALERT", json!({}));
        publish_raw(&broker, envelope.to_json_bytes().unwrap()).await;

        wait_for(|| handled.load(Ordering::SeqCst) == 1).await;
        group.stop().await;

        assert_eq!(listener.stats()[0].received, 1);
    }

    #[tokio::test]
    async fn failed_handler_dead_letters_with_incremented_retry() {
        let (broker, listener, ctx) = setup();
        listener.register_handler(
            "ALERT",
            handler_fn(|_env: MessageEnvelope| async {
                Err::<(), _>(anyhow::anyhow!("rejected"))
            }),
        );

        let group = ConsumerGroup::start(&ctx, &["mes"]);
        let envelope = MessageEnvelope::new("MES", "ALERT", json!({"n": 1}));
        publish_raw(&broker, envelope.to_json_bytes().unwrap()).await;

        let l = Arc::clone(&listener);
        wait_for(move || l.stats().iter().any(|s| s.dead_letters == 1)).await;
        group.stop().await;

        let stats = listener.stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].source, "mes");
        assert_eq!(stats[0].received, 1);
        assert_eq!(stats[0].process_errors, 1);
        assert_eq!(stats[0].dead_letters, 1);
    }

    #[tokio::test]
    async fn dead_lettered_envelope_carries_retry_count() {
        let (broker, listener, ctx) = setup();
        listener.register_handler(
            "ALERT",
            handler_fn(|_env: MessageEnvelope| async {
                Err::<(), _>(anyhow::anyhow!("rejected"))
            }),
        );

        // Only the inbound consumer runs here so the dead letter stays queued.
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(inbound_loop(
            ctx.clone(),
            "mes".to_string(),
            "qms.mes.queue".to_string(),
            rx,
        ));

        let envelope = MessageEnvelope::new("MES", "ALERT", json!({}));
        publish_raw(&broker, envelope.to_json_bytes().unwrap()).await;

        let b = Arc::clone(&broker);
        wait_for(move || b.queue_depth("qms.dead-letter.queue") == Some(1)).await;
        let _ = tx.send(true);
        task.await.unwrap();

        let dead = broker.try_next("qms.dead-letter.queue").unwrap();
        let redelivered = MessageEnvelope::from_json_slice(&dead.body).unwrap();
        assert_eq!(redelivered.message_id, envelope.message_id);
        assert_eq!(redelivered.retry_count, 1);
    }

    #[tokio::test]
    async fn undecodable_body_goes_to_dead_letter_queue() {
        let (broker, _listener, ctx) = setup();
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(inbound_loop(
            ctx,
            "mes".to_string(),
            "qms.mes.queue".to_string(),
            rx,
        ));

        publish_raw(&broker, b"not json".to_vec()).await;

        let b = Arc::clone(&broker);
        wait_for(move || b.queue_depth("qms.dead-letter.queue") == Some(1)).await;
        let _ = tx.send(true);
        task.await.unwrap();

        let dead = broker.try_next("qms.dead-letter.queue").unwrap();
        assert_eq!(dead.body, b"not json");
    }

    #[tokio::test]
    async fn panicking_handler_does_not_stop_the_consumer() {
        let (broker, listener, ctx) = setup();
        let handled = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&handled);
        listener.register_handler(
            "ALERT",
            handler_fn(move |_env: MessageEnvelope| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    anyhow::Ok(())
                }
            }),
        );
        listener.register_handler(
            "BOOM",
            handler_fn(|env: MessageEnvelope| async move {
                if env.operation == "BOOM" {
                    panic!("handler bug");
                }
                anyhow::Ok(())
            }),
        );

        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(inbound_loop(
            ctx,
            "mes".to_string(),
            "qms.mes.queue".to_string(),
            rx,
        ));

        let boom = MessageEnvelope::new("MES", "BOOM", json!({}));
        publish_raw(&broker, boom.to_json_bytes().unwrap()).await;
        let alert = MessageEnvelope::new("MES", "ALERT", json!({}));
        publish_raw(&broker, alert.to_json_bytes().unwrap()).await;

        wait_for(|| handled.load(Ordering::SeqCst) == 1).await;
        let _ = tx.send(true);
        task.await.unwrap();

        let stats = listener.stats();
        assert_eq!(stats[0].received, 2);
        assert_eq!(stats[0].process_errors, 1);
        assert_eq!(broker.queue_depth("qms.mes.queue"), Some(0));

        let dead = broker.try_next("qms.dead-letter.queue").unwrap();
        let redelivered = MessageEnvelope::from_json_slice(&dead.body).unwrap();
        assert_eq!(redelivered.message_id, boom.message_id);
        assert_eq!(redelivered.retry_count, 1);
    }

    #[tokio::test]
    async fn stop_returns_while_queues_are_idle() {
        let (_broker, _listener, ctx) = setup();
        let group = ConsumerGroup::start(&ctx, &["mes"]);
        tokio::time::timeout(Duration::from_secs(1), group.stop())
            .await
            .expect("consumers did not stop");
    }
}
