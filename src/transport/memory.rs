//! In-process transport with real routing semantics (fanout, direct, topic
//! patterns with `*`/`#`). Deliveries happen synchronously inside `publish`
//! or when a consumer attaches and drains its queue's backlog, which makes
//! test runs deterministic without a broker. The broker state records every
//! declare, publish and ack so tests can assert on transport activity.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, error};
use uuid::Uuid;

use crate::config::{
    BindOptions, ConnectOptions, ConsumeOptions, ExchangeKind, ExchangeOptions, QueueOptions,
};
use crate::error::{Error, Result};
use crate::transport::{
    AckHandle, ConsumerHandle, Delivery, DeliveryHandler, DeliveryInfo, ExchangeHandle, Metadata,
    PublishMeta, QueueHandle, Transport, TransportChannel, TransportConnection,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub data: Vec<u8>,
}

struct ExchangeRecord {
    options: ExchangeOptions,
    declare_count: usize,
}

struct ConsumerRecord {
    tag: String,
    manual_ack: bool,
    handler: DeliveryHandler,
}

struct PendingDelivery {
    info: DeliveryInfo,
    metadata: Metadata,
    data: Vec<u8>,
}

#[derive(Default)]
struct QueueRecord {
    pending: VecDeque<PendingDelivery>,
    consumers: Vec<ConsumerRecord>,
    // Competing consumers on one queue split deliveries round-robin, the
    // same way a broker distributes them.
    next_consumer: usize,
}

struct Binding {
    exchange: String,
    queue: String,
    routing_key: String,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeRecord>,
    queues: HashMap<String, QueueRecord>,
    bindings: Vec<Binding>,
    published: Vec<PublishedMessage>,
    acked: Vec<u64>,
    nacked: Vec<u64>,
    next_tag: u64,
}

/// The shared in-memory broker. Clone it (or connect twice) to look at the
/// same state from tests and from the client under test.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        MemoryTransport::default()
    }

    pub fn declare_count(&self, exchange: &str) -> usize {
        self.state
            .lock()
            .expect("broker state poisoned")
            .exchanges
            .get(exchange)
            .map_or(0, |e| e.declare_count)
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state.lock().expect("broker state poisoned").published.clone()
    }

    pub fn queue_depth(&self, queue: &str) -> usize {
        self.state
            .lock()
            .expect("broker state poisoned")
            .queues
            .get(queue)
            .map_or(0, |q| q.pending.len())
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .expect("broker state poisoned")
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers.len())
    }

    pub fn acked_count(&self) -> usize {
        self.state.lock().expect("broker state poisoned").acked.len()
    }

    pub fn nacked_count(&self) -> usize {
        self.state.lock().expect("broker state poisoned").nacked.len()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, _options: &ConnectOptions) -> Result<Box<dyn TransportConnection>> {
        Ok(Box::new(MemoryConnection {
            state: self.state.clone(),
        }))
    }
}

struct MemoryConnection {
    state: Arc<Mutex<BrokerState>>,
}

#[async_trait]
impl TransportConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn TransportChannel>> {
        Ok(Arc::new(MemoryChannel {
            state: self.state.clone(),
        }))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct MemoryChannel {
    state: Arc<Mutex<BrokerState>>,
}

#[async_trait]
impl TransportChannel for MemoryChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        options: &ExchangeOptions,
    ) -> Result<Arc<dyn ExchangeHandle>> {
        let mut state = self.state.lock().expect("broker state poisoned");
        let record = state
            .exchanges
            .entry(name.to_string())
            .or_insert_with(|| ExchangeRecord {
                options: options.clone(),
                declare_count: 0,
            });
        record.declare_count += 1;
        debug!("Declared exchange '{}' (count {})", name, record.declare_count);

        Ok(Arc::new(MemoryExchange {
            state: self.state.clone(),
            name: name.to_string(),
        }))
    }

    async fn declare_queue(
        &self,
        name: &str,
        _options: &QueueOptions,
    ) -> Result<Box<dyn QueueHandle>> {
        let mut state = self.state.lock().expect("broker state poisoned");
        state.queues.entry(name.to_string()).or_default();
        Ok(Box::new(MemoryQueue {
            state: self.state.clone(),
            name: name.to_string(),
        }))
    }
}

struct MemoryExchange {
    state: Arc<Mutex<BrokerState>>,
    name: String,
}

#[async_trait]
impl ExchangeHandle for MemoryExchange {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, payload: &[u8], meta: &PublishMeta) -> Result<()> {
        // Route under the lock, then invoke handlers outside it.
        let mut ready: Vec<(DeliveryHandler, Delivery, String)> = Vec::new();
        {
            let mut state = self.state.lock().expect("broker state poisoned");
            state.published.push(PublishedMessage {
                exchange: self.name.clone(),
                routing_key: meta.routing_key.clone(),
                data: payload.to_vec(),
            });

            let kind = state
                .exchanges
                .get(&self.name)
                .map_or(ExchangeKind::Fanout, |e| e.options.kind);
            let targets: Vec<String> = state
                .bindings
                .iter()
                .filter(|b| b.exchange == self.name && routes(kind, &b.routing_key, &meta.routing_key))
                .map(|b| b.queue.clone())
                .collect();

            for queue_name in targets {
                state.next_tag += 1;
                let tag = state.next_tag;
                let info = DeliveryInfo {
                    exchange: self.name.clone(),
                    routing_key: meta.routing_key.clone(),
                    delivery_tag: tag,
                    redelivered: false,
                };
                let metadata = Metadata {
                    content_type: meta.content_type.clone(),
                    message_id: Some(Uuid::new_v4().to_string()),
                    headers: meta.headers.clone(),
                };

                let picked = match state.queues.get_mut(&queue_name) {
                    None => continue,
                    Some(queue) if queue.consumers.is_empty() => {
                        queue.pending.push_back(PendingDelivery {
                            info,
                            metadata,
                            data: payload.to_vec(),
                        });
                        continue;
                    }
                    Some(queue) => {
                        queue.next_consumer = (queue.next_consumer + 1) % queue.consumers.len();
                        let consumer = &queue.consumers[queue.next_consumer];
                        (consumer.handler.clone(), consumer.tag.clone(), consumer.manual_ack)
                    }
                };

                let (handler, consumer_tag, manual_ack) = picked;
                if !manual_ack {
                    // Auto-ack on receipt, before the handler runs.
                    state.acked.push(tag);
                }
                let acker = Arc::new(MemoryAcker {
                    state: self.state.clone(),
                    tag,
                });
                let delivery = Delivery::new(info, metadata, payload.to_vec(), acker);
                ready.push((handler, delivery, consumer_tag));
            }
        }

        for (handler, delivery, consumer_tag) in ready {
            deliver(&self.state, handler, delivery, &consumer_tag).await;
        }
        Ok(())
    }
}

struct MemoryQueue {
    state: Arc<Mutex<BrokerState>>,
    name: String,
}

#[async_trait]
impl QueueHandle for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn bind(&self, exchange: &dyn ExchangeHandle, options: &BindOptions) -> Result<()> {
        let mut state = self.state.lock().expect("broker state poisoned");
        state.bindings.push(Binding {
            exchange: exchange.name().to_string(),
            queue: self.name.clone(),
            routing_key: options.routing_key.clone().unwrap_or_default(),
        });
        Ok(())
    }

    async fn consume(
        &self,
        options: &ConsumeOptions,
        handler: DeliveryHandler,
    ) -> Result<Box<dyn ConsumerHandle>> {
        let tag = format!("mem-consumer-{}", Uuid::new_v4());
        let manual_ack = options.manual_ack;

        // Attach, then drain whatever was queued before we arrived.
        let backlog: Vec<PendingDelivery> = {
            let mut state = self.state.lock().expect("broker state poisoned");
            let queue = state
                .queues
                .get_mut(&self.name)
                .ok_or_else(|| Error::Transport(format!("unknown queue {:?}", self.name)))?;
            queue.consumers.push(ConsumerRecord {
                tag: tag.clone(),
                manual_ack,
                handler: handler.clone(),
            });
            let drained: Vec<PendingDelivery> = queue.pending.drain(..).collect();

            if !manual_ack {
                for pending in &drained {
                    state.acked.push(pending.info.delivery_tag);
                }
            }
            drained
        };

        for pending in backlog {
            let acker = Arc::new(MemoryAcker {
                state: self.state.clone(),
                tag: pending.info.delivery_tag,
            });
            let delivery = Delivery::new(pending.info, pending.metadata, pending.data, acker);
            deliver(&self.state, handler.clone(), delivery, &tag).await;
        }

        Ok(Box::new(MemoryConsumer {
            state: self.state.clone(),
            queue: self.name.clone(),
            tag,
        }))
    }
}

struct MemoryConsumer {
    state: Arc<Mutex<BrokerState>>,
    queue: String,
    tag: String,
}

#[async_trait]
impl ConsumerHandle for MemoryConsumer {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn cancel(&self) -> Result<()> {
        remove_consumer(&self.state, &self.queue, &self.tag);
        Ok(())
    }
}

struct MemoryAcker {
    state: Arc<Mutex<BrokerState>>,
    tag: u64,
}

#[async_trait]
impl AckHandle for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.state.lock().expect("broker state poisoned").acked.push(self.tag);
        Ok(())
    }

    async fn nack(&self, _requeue: bool) -> Result<()> {
        self.state.lock().expect("broker state poisoned").nacked.push(self.tag);
        Ok(())
    }
}

async fn deliver(
    state: &Arc<Mutex<BrokerState>>,
    handler: DeliveryHandler,
    delivery: Delivery,
    consumer_tag: &str,
) {
    if let Err(e) = handler(delivery).await {
        // The error handler re-raised; drop the consumer like a broker whose
        // delivery callback blew up.
        error!("Unhandled error from consumer '{}': {}", consumer_tag, e);
        remove_all_consumers_with_tag(state, consumer_tag);
    }
}

fn remove_consumer(state: &Arc<Mutex<BrokerState>>, queue: &str, tag: &str) {
    let mut state = state.lock().expect("broker state poisoned");
    if let Some(queue) = state.queues.get_mut(queue) {
        queue.consumers.retain(|c| c.tag != tag);
        queue.next_consumer = 0;
    }
}

fn remove_all_consumers_with_tag(state: &Arc<Mutex<BrokerState>>, tag: &str) {
    let mut state = state.lock().expect("broker state poisoned");
    for queue in state.queues.values_mut() {
        queue.consumers.retain(|c| c.tag != tag);
        queue.next_consumer = 0;
    }
}

/// Does a message published with `routing_key` reach a queue bound with
/// `binding_key` on an exchange of `kind`?
fn routes(kind: ExchangeKind, binding_key: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Fanout | ExchangeKind::Headers => true,
        ExchangeKind::Direct => binding_key == routing_key,
        ExchangeKind::Topic => topic_matches(binding_key, routing_key),
    }
}

/// AMQP topic matching: `*` matches exactly one word, `#` matches zero or
/// more words, words are dot-separated.
fn topic_matches(pattern: &str, key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(&word), Some(&segment)) if word == segment => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    matches(&pattern, &key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_patterns() {
        assert!(topic_matches("orders.created", "orders.created"));
        assert!(topic_matches("orders.*", "orders.created"));
        assert!(!topic_matches("orders.*", "orders.created.v2"));
        assert!(topic_matches("orders.#", "orders.created.v2"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("orders.#", "orders"));
        assert!(!topic_matches("orders.*", "payments.created"));
        assert!(topic_matches("*.created.#", "orders.created"));
    }

    #[test]
    fn direct_and_fanout_routing() {
        assert!(routes(ExchangeKind::Fanout, "", "anything"));
        assert!(routes(ExchangeKind::Direct, "key", "key"));
        assert!(!routes(ExchangeKind::Direct, "key", "other"));
    }
}
