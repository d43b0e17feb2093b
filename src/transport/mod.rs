//! The broker transport contract. The core treats the broker as opaque:
//! connect, declare, bind, consume, publish, ack. Two implementations live
//! here: `amqp` over lapin for production and `memory` for tests.

pub mod amqp;
pub mod memory;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::config::{BindOptions, ConnectOptions, ConsumeOptions, ExchangeOptions, QueueOptions};
use crate::error::Result;

/// Per-message metadata as carried on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishMeta {
    pub routing_key: String,
    pub content_type: Option<String>,
    pub headers: BTreeMap<String, String>,
}

/// Broker-assigned facts about a single delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryInfo {
    pub exchange: String,
    pub routing_key: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
}

/// Application-visible message metadata (properties/headers).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    pub content_type: Option<String>,
    pub message_id: Option<String>,
    pub headers: BTreeMap<String, String>,
}

/// Acknowledgement handle for one delivery. With manual ack enabled the
/// subscriber callback or the error handler must call one of these; the
/// dispatch loop never acks on its own.
#[async_trait]
pub trait AckHandle: Send + Sync {
    async fn ack(&self) -> Result<()>;
    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// One inbound message, handed to subscriber callbacks and, on failure, to
/// the error handler. Cheap to clone; the payload and ack handle are shared.
#[derive(Clone)]
pub struct Delivery {
    pub info: DeliveryInfo,
    pub metadata: Metadata,
    pub data: Arc<Vec<u8>>,
    acker: Arc<dyn AckHandle>,
}

impl Delivery {
    pub fn new(
        info: DeliveryInfo,
        metadata: Metadata,
        data: Vec<u8>,
        acker: Arc<dyn AckHandle>,
    ) -> Self {
        Delivery {
            info,
            metadata,
            data: Arc::new(data),
            acker,
        }
    }

    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("info", &self.info)
            .field("metadata", &self.metadata)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Per-delivery handler installed by the dispatch loop. An `Err` return
/// means the configured error handler re-raised; the transport logs it and
/// tears down that consumer.
pub type DeliveryHandler =
    Arc<dyn Fn(Delivery) -> BoxFuture<'static, Result<()>> + Send + Sync>;

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, options: &ConnectOptions) -> Result<Box<dyn TransportConnection>>;
}

#[async_trait]
pub trait TransportConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn TransportChannel>>;
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait TransportChannel: Send + Sync {
    async fn declare_exchange(
        &self,
        name: &str,
        options: &ExchangeOptions,
    ) -> Result<Arc<dyn ExchangeHandle>>;

    async fn declare_queue(
        &self,
        name: &str,
        options: &QueueOptions,
    ) -> Result<Box<dyn QueueHandle>>;
}

#[async_trait]
pub trait ExchangeHandle: Send + Sync {
    fn name(&self) -> &str;
    async fn publish(&self, payload: &[u8], meta: &PublishMeta) -> Result<()>;
}

#[async_trait]
pub trait QueueHandle: Send + Sync {
    fn name(&self) -> &str;

    async fn bind(&self, exchange: &dyn ExchangeHandle, options: &BindOptions) -> Result<()>;

    /// Attach a consumer. The transport drives deliveries through `handler`
    /// on its own schedule; the returned handle cancels the consumer.
    async fn consume(
        &self,
        options: &ConsumeOptions,
        handler: DeliveryHandler,
    ) -> Result<Box<dyn ConsumerHandle>>;
}

#[async_trait]
pub trait ConsumerHandle: Send + Sync {
    fn tag(&self) -> &str;
    async fn cancel(&self) -> Result<()>;
}
