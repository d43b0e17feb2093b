//! Production transport over lapin.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_lite::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::{
    BindOptions, ConnectOptions, ConsumeOptions, ExchangeKind, ExchangeOptions, QueueOptions,
};
use crate::error::{Error, Result};
use crate::transport::{
    AckHandle, ConsumerHandle, Delivery, DeliveryHandler, DeliveryInfo, ExchangeHandle, Metadata,
    PublishMeta, QueueHandle, Transport, TransportChannel, TransportConnection,
};

pub struct AmqpTransport;

#[async_trait]
impl Transport for AmqpTransport {
    async fn connect(&self, options: &ConnectOptions) -> Result<Box<dyn TransportConnection>> {
        let uri = options.to_uri();
        info!("Connecting to RabbitMQ at {}:{}", options.host, options.port);
        let connection = Connection::connect(&uri, ConnectionProperties::default())
            .await
            .map_err(|e| Error::Transport(format!("failed to connect: {e}")))?;
        Ok(Box::new(AmqpConnection { connection }))
    }
}

struct AmqpConnection {
    connection: Connection,
}

#[async_trait]
impl TransportConnection for AmqpConnection {
    async fn create_channel(&self) -> Result<Arc<dyn TransportChannel>> {
        let channel = self.connection.create_channel().await?;
        Ok(Arc::new(AmqpChannel { channel }))
    }

    async fn close(&self) -> Result<()> {
        info!("Closing RabbitMQ connection");
        self.connection.close(0, "closing").await?;
        Ok(())
    }
}

struct AmqpChannel {
    channel: Channel,
}

#[async_trait]
impl TransportChannel for AmqpChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        options: &ExchangeOptions,
    ) -> Result<Arc<dyn ExchangeHandle>> {
        self.channel
            .exchange_declare(
                name,
                exchange_kind(options.kind),
                ExchangeDeclareOptions {
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    ..ExchangeDeclareOptions::default()
                },
                field_table(&options.arguments),
            )
            .await
            .map_err(|e| Error::Transport(format!("failed to declare exchange {name:?}: {e}")))?;

        debug!("Declared exchange '{}'", name);
        Ok(Arc::new(AmqpExchange {
            channel: self.channel.clone(),
            name: name.to_string(),
        }))
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: &QueueOptions,
    ) -> Result<Box<dyn QueueHandle>> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    exclusive: options.exclusive,
                    ..QueueDeclareOptions::default()
                },
                field_table(&options.arguments),
            )
            .await
            .map_err(|e| Error::Transport(format!("failed to declare queue {name:?}: {e}")))?;

        debug!("Declared queue '{}'", name);
        Ok(Box::new(AmqpQueue {
            channel: self.channel.clone(),
            name: name.to_string(),
        }))
    }
}

struct AmqpExchange {
    channel: Channel,
    name: String,
}

#[async_trait]
impl ExchangeHandle for AmqpExchange {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, payload: &[u8], meta: &PublishMeta) -> Result<()> {
        let mut properties = BasicProperties::default()
            .with_message_id(Uuid::new_v4().to_string().into())
            .with_timestamp(chrono::Utc::now().timestamp() as u64);
        if let Some(content_type) = &meta.content_type {
            properties = properties.with_content_type(content_type.clone().into());
        }
        if !meta.headers.is_empty() {
            properties = properties.with_headers(field_table(&meta.headers));
        }

        self.channel
            .basic_publish(
                &self.name,
                &meta.routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(|e| Error::Transport(format!("failed to publish: {e}")))?;

        debug!(
            "Published {} bytes to exchange '{}' with routing key '{}'",
            payload.len(),
            self.name,
            meta.routing_key
        );
        Ok(())
    }
}

struct AmqpQueue {
    channel: Channel,
    name: String,
}

#[async_trait]
impl QueueHandle for AmqpQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn bind(&self, exchange: &dyn ExchangeHandle, options: &BindOptions) -> Result<()> {
        self.channel
            .queue_bind(
                &self.name,
                exchange.name(),
                options.routing_key.as_deref().unwrap_or(""),
                QueueBindOptions::default(),
                field_table(&options.arguments),
            )
            .await
            .map_err(|e| Error::Transport(format!("failed to bind queue {:?}: {e}", self.name)))?;
        Ok(())
    }

    async fn consume(
        &self,
        options: &ConsumeOptions,
        handler: DeliveryHandler,
    ) -> Result<Box<dyn ConsumerHandle>> {
        let tag = format!("consumer-{}", Uuid::new_v4());
        let mut consumer = self
            .channel
            .basic_consume(
                &self.name,
                &tag,
                BasicConsumeOptions {
                    no_ack: !options.manual_ack,
                    exclusive: options.exclusive,
                    ..BasicConsumeOptions::default()
                },
                field_table(&options.arguments),
            )
            .await
            .map_err(|e| Error::Transport(format!("failed to consume {:?}: {e}", self.name)))?;

        info!("Started consuming from queue '{}'", self.name);

        let queue = self.name.clone();
        tokio::spawn(async move {
            while let Some(delivery_result) = consumer.next().await {
                match delivery_result {
                    Ok(delivery) => {
                        let converted = convert_delivery(delivery);
                        if let Err(e) = handler(converted).await {
                            // The error handler re-raised; fail loud and tear
                            // this consumer down.
                            error!("Unhandled error on queue '{}': {}", queue, e);
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Error receiving message on queue '{}': {}", queue, e);
                    }
                }
            }
            debug!("Consumer stream for queue '{}' ended", queue);
        });

        Ok(Box::new(AmqpConsumer {
            channel: self.channel.clone(),
            tag,
        }))
    }
}

struct AmqpConsumer {
    channel: Channel,
    tag: String,
}

#[async_trait]
impl ConsumerHandle for AmqpConsumer {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn cancel(&self) -> Result<()> {
        self.channel
            .basic_cancel(&self.tag, BasicCancelOptions::default())
            .await
            .map_err(|e| Error::Transport(format!("failed to cancel consumer: {e}")))?;
        Ok(())
    }
}

struct AmqpAcker {
    acker: lapin::acker::Acker,
}

#[async_trait]
impl AckHandle for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| Error::Transport(format!("failed to ack: {e}")))
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            })
            .await
            .map_err(|e| Error::Transport(format!("failed to nack: {e}")))
    }
}

fn convert_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let info = DeliveryInfo {
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        delivery_tag: delivery.delivery_tag,
        redelivered: delivery.redelivered,
    };

    let mut headers = BTreeMap::new();
    if let Some(table) = delivery.properties.headers() {
        for (key, value) in table.inner() {
            if let AMQPValue::LongString(s) = value {
                headers.insert(
                    key.as_str().to_string(),
                    String::from_utf8_lossy(s.as_bytes()).into_owned(),
                );
            }
        }
    }
    let metadata = Metadata {
        content_type: delivery
            .properties
            .content_type()
            .as_ref()
            .map(|c| c.as_str().to_string()),
        message_id: delivery
            .properties
            .message_id()
            .as_ref()
            .map(|m| m.as_str().to_string()),
        headers,
    };

    let acker = Arc::new(AmqpAcker {
        acker: delivery.acker,
    });
    Delivery::new(info, metadata, delivery.data, acker)
}

fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
    }
}

fn field_table(arguments: &BTreeMap<String, String>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in arguments {
        table.insert(
            ShortString::from(key.clone()),
            AMQPValue::LongString(LongString::from(value.clone())),
        );
    }
    table
}
