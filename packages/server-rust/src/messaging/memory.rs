//! In-process broker with one exchange, routing-key bindings, priority
//! queues and delayed visibility.
//!
//! Used for single-node deployments and tests. Each queue is a max-heap
//! ordered by priority, then by publish sequence, so messages of equal
//! priority come out FIFO.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::broker::{BrokerError, Delivery, MessageBroker, MessageSource, OutboundMessage};

// ---------------------------------------------------------------------------
// Queue internals
// ---------------------------------------------------------------------------

struct Pending {
    priority: u8,
    seq: u64,
    delivery: Delivery,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Pending {}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Higher priority first, then lower sequence number first.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct Queue {
    heap: Mutex<BinaryHeap<Pending>>,
    notify: Notify,
}

impl Queue {
    fn push(&self, pending: Pending) {
        self.heap.lock().push(pending);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Delivery> {
        self.heap.lock().pop().map(|p| p.delivery)
    }

    fn len(&self) -> usize {
        self.heap.lock().len()
    }
}

// ---------------------------------------------------------------------------
// InMemoryBroker
// ---------------------------------------------------------------------------

/// Single-exchange broker living inside the process.
pub struct InMemoryBroker {
    exchange: String,
    bindings: DashMap<String, Vec<String>>,
    queues: DashMap<String, Arc<Queue>>,
    available: AtomicBool,
    seq: AtomicU64,
}

impl InMemoryBroker {
    #[must_use]
    pub fn new(exchange: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            bindings: DashMap::new(),
            queues: DashMap::new(),
            available: AtomicBool::new(true),
            seq: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Declares `queue` if it does not exist yet.
    pub fn declare_queue(&self, queue: &str) {
        self.queues.entry(queue.to_string()).or_default();
    }

    /// Routes messages published under `routing_key` into `queue`.
    pub fn bind(&self, routing_key: &str, queue: &str) {
        self.declare_queue(queue);
        let mut queues = self.bindings.entry(routing_key.to_string()).or_default();
        if !queues.iter().any(|q| q == queue) {
            queues.push(queue.to_string());
        }
    }

    /// Simulates an outage: while unavailable every publish fails.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        tracing::info!(exchange = %self.exchange, available, "broker availability changed");
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Number of visible messages waiting in `queue`, `None` if undeclared.
    #[must_use]
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.queues.get(queue).map(|q| q.len())
    }

    /// Names of all declared queues, sorted.
    #[must_use]
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.queues.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Pops the next visible delivery without waiting.
    #[must_use]
    pub fn try_next(&self, queue: &str) -> Option<Delivery> {
        self.queue(queue)?.pop()
    }

    fn queue(&self, name: &str) -> Option<Arc<Queue>> {
        self.queues.get(name).map(|q| Arc::clone(q.value()))
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn publish(&self, message: OutboundMessage) -> Result<(), BrokerError> {
        if !self.is_available() {
            return Err(BrokerError::Unavailable {
                reason: format!("exchange {} is not accepting messages", self.exchange),
            });
        }
        if message.exchange != self.exchange {
            return Err(BrokerError::UnknownExchange {
                exchange: message.exchange,
            });
        }

        let bound: Vec<String> = self
            .bindings
            .get(&message.routing_key)
            .map(|names| names.clone())
            .unwrap_or_default();
        let targets: Vec<(String, Arc<Queue>)> = bound
            .into_iter()
            .filter_map(|name| self.queue(&name).map(|q| (name, q)))
            .collect();
        if targets.is_empty() {
            return Err(BrokerError::Unroutable {
                routing_key: message.routing_key,
            });
        }

        let priority = message.properties.priority.unwrap_or(0);
        let delay = message.properties.delay;

        for (queue_name, queue) in targets {
            let pending = Pending {
                priority,
                seq: self.seq.fetch_add(1, Ordering::Relaxed),
                delivery: Delivery {
                    queue: queue_name,
                    routing_key: message.routing_key.clone(),
                    properties: message.properties.clone(),
                    body: message.body.clone(),
                },
            };
            match delay {
                Some(delay) if !delay.is_zero() => {
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        queue.push(pending);
                    });
                }
                _ => queue.push(pending),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl MessageSource for InMemoryBroker {
    async fn next_delivery(&self, queue: &str) -> Result<Delivery, BrokerError> {
        let state = self.queue(queue).ok_or_else(|| BrokerError::UnknownQueue {
            queue: queue.to_string(),
        })?;
        loop {
            if let Some(delivery) = state.pop() {
                return Ok(delivery);
            }
            // notify_one stores a permit when nobody is waiting, so a push
            // between pop() and this await is not missed.
            state.notify.notified().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::messaging::broker::MessageProperties;

    fn message(key: &str, priority: Option<u8>, delay: Option<Duration>, body: &str) -> OutboundMessage {
        OutboundMessage {
            exchange: "mcp.exchange".to_string(),
            routing_key: key.to_string(),
            properties: MessageProperties {
                message_id: Uuid::new_v4(),
                content_type: "application/json".to_string(),
                timestamp: Utc::now(),
                priority,
                delay,
            },
            body: body.as_bytes().to_vec(),
        }
    }

    fn broker() -> InMemoryBroker {
        let broker = InMemoryBroker::new("mcp.exchange");
        broker.bind("qms.to.mes", "mes.inbox");
        broker
    }

    #[tokio::test]
    async fn publish_routes_to_bound_queue() {
        let broker = broker();
        broker.publish(message("qms.to.mes", None, None, "a")).await.unwrap();

        assert_eq!(broker.queue_depth("mes.inbox"), Some(1));
        let delivery = broker.next_delivery("mes.inbox").await.unwrap();
        assert_eq!(delivery.body, b"a");
        assert_eq!(delivery.queue, "mes.inbox");
    }

    #[tokio::test]
    async fn unbound_key_is_unroutable() {
        let broker = broker();
        let err = broker.publish(message("qms.to.nowhere", None, None, "a")).await.unwrap_err();
        assert!(matches!(err, BrokerError::Unroutable { .. }));
    }

    #[tokio::test]
    async fn wrong_exchange_is_rejected() {
        let broker = broker();
        let mut msg = message("qms.to.mes", None, None, "a");
        msg.exchange = "other".to_string();
        let err = broker.publish(msg).await.unwrap_err();
        assert!(matches!(err, BrokerError::UnknownExchange { .. }));
    }

    #[tokio::test]
    async fn unavailable_broker_fails_publish() {
        let broker = broker();
        broker.set_available(false);
        let err = broker.publish(message("qms.to.mes", None, None, "a")).await.unwrap_err();
        assert!(matches!(err, BrokerError::Unavailable { .. }));

        broker.set_available(true);
        assert!(broker.publish(message("qms.to.mes", None, None, "a")).await.is_ok());
    }

    #[tokio::test]
    async fn equal_priority_is_fifo_and_higher_priority_jumps_ahead() {
        let broker = broker();
        for (body, priority) in [("first", None), ("second", None), ("urgent", Some(9)), ("third", Some(0))] {
            broker.publish(message("qms.to.mes", priority, None, body)).await.unwrap();
        }

        let order: Vec<String> = std::iter::from_fn(|| broker.try_next("mes.inbox"))
            .map(|d| String::from_utf8(d.body).unwrap())
            .collect();
        assert_eq!(order, vec!["urgent", "first", "second", "third"]);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_message_becomes_visible_after_delay() {
        let broker = broker();
        broker
            .publish(message("qms.to.mes", None, Some(Duration::from_millis(500)), "later"))
            .await
            .unwrap();

        tokio::task::yield_now().await;
        assert_eq!(broker.queue_depth("mes.inbox"), Some(0));

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(broker.queue_depth("mes.inbox"), Some(1));
    }

    #[tokio::test]
    async fn next_delivery_waits_for_publish() {
        let broker = Arc::new(broker());
        let consumer = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move { broker.next_delivery("mes.inbox").await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        broker.publish(message("qms.to.mes", None, None, "wake")).await.unwrap();

        let delivery = consumer.await.unwrap().unwrap();
        assert_eq!(delivery.body, b"wake");
    }

    #[tokio::test]
    async fn unknown_queue_errors() {
        let broker = broker();
        let err = broker.next_delivery("missing").await.unwrap_err();
        assert!(matches!(err, BrokerError::UnknownQueue { .. }));
    }

    #[tokio::test]
    async fn one_key_can_fan_out_to_several_queues() {
        let broker = broker();
        broker.bind("qms.to.mes", "audit");
        broker.bind("qms.to.mes", "audit");
        broker.publish(message("qms.to.mes", None, None, "x")).await.unwrap();

        assert_eq!(broker.queue_depth("mes.inbox"), Some(1));
        assert_eq!(broker.queue_depth("audit"), Some(1));
        assert_eq!(broker.queue_names(), vec!["audit", "mes.inbox"]);
    }
}
