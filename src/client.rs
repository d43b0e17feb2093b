use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::codec::{Codec, JsonCodec, Payload};
use crate::config::{ConnectOptions, Defaults, ExchangeSpec};
use crate::error::{BoxError, Error, Result};
use crate::exchange::ExchangeCache;
use crate::subscription::{SubscribeOptions, Subscription, SubscriptionRegistry};
use crate::transaction::{PendingPublish, TransactionBuffer};
use crate::transport::{
    ConsumerHandle, Delivery, DeliveryHandler, ExchangeHandle, PublishMeta, QueueHandle,
    Transport, TransportChannel, TransportConnection,
};

/// Everything the error handler gets about one failed delivery: the error
/// itself, the queue it arrived on, and the delivery (raw bytes, metadata,
/// delivery info, ack handle).
pub struct ErrorContext {
    pub error: Error,
    pub queue: Option<String>,
    pub delivery: Delivery,
}

impl ErrorContext {
    /// The raw, undecoded message bytes.
    pub fn raw(&self) -> &[u8] {
        &self.delivery.data
    }
}

/// The single replaceable failure hook. Returning `Err` re-raises into the
/// transport, which tears down the consumer; that is the default. Production
/// embedders override this to log (and usually ack or nack) and return `Ok`
/// so one bad message cannot kill the consume loop.
pub type ErrorHandler =
    Arc<dyn Fn(ErrorContext) -> BoxFuture<'static, Result<()>> + Send + Sync>;

fn default_error_handler() -> ErrorHandler {
    Arc::new(|context| Box::pin(async move { Err(context.error) }))
}

/// Per-publish overrides.
#[derive(Clone, Default)]
pub struct PublishOptions {
    /// Target exchange; an unset name means the current default exchange.
    pub exchange: ExchangeSpec,
    pub routing_key: Option<String>,
    pub content_type: Option<String>,
    pub headers: BTreeMap<String, String>,
}

impl PublishOptions {
    pub fn exchange(spec: ExchangeSpec) -> Self {
        PublishOptions {
            exchange: spec,
            ..PublishOptions::default()
        }
    }
}

/// One broker connection and everything scoped to it: the exchange cache,
/// the subscription registry, the transaction buffer, the codec and the
/// error handler. Independent clients share nothing, so one process can hold
/// several connections and tests stay isolated.
pub struct Client {
    connection: Box<dyn TransportConnection>,
    channel: Arc<dyn TransportChannel>,
    codec: Arc<dyn Codec>,
    defaults: Defaults,
    exchanges: ExchangeCache,
    registry: SubscriptionRegistry,
    tx: TransactionBuffer,
    error_handler: Arc<RwLock<ErrorHandler>>,
    consumers: Mutex<Vec<(String, Box<dyn ConsumerHandle>)>>,
    stopped: AtomicBool,
    stop_signal: Notify,
}

impl Client {
    pub async fn connect(transport: &dyn Transport, options: ConnectOptions) -> Result<Self> {
        Self::connect_with(transport, options, Defaults::default()).await
    }

    pub async fn connect_with(
        transport: &dyn Transport,
        options: ConnectOptions,
        defaults: Defaults,
    ) -> Result<Self> {
        let connection = transport.connect(&options).await?;
        let channel = connection.create_channel().await?;
        let exchanges = ExchangeCache::new(
            channel.clone(),
            defaults.exchange.clone(),
            defaults.default_exchange.clone(),
        );

        Ok(Client {
            connection,
            channel,
            codec: Arc::new(JsonCodec),
            defaults,
            exchanges,
            registry: SubscriptionRegistry::new(),
            tx: TransactionBuffer::new(),
            error_handler: Arc::new(RwLock::new(default_error_handler())),
            consumers: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
            stop_signal: Notify::new(),
        })
    }

    /// Swap the connection-wide codec. Configuration-time only: call before
    /// registering subscriptions or publishing.
    pub fn set_codec(&mut self, codec: Arc<dyn Codec>) {
        self.codec = codec;
    }

    /// Replace the error handler. The hook must not itself fail unless it
    /// means to re-raise; an `Err` return propagates into the transport and
    /// kills that consumer.
    pub fn set_error_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(ErrorContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler: ErrorHandler = Arc::new(move |context| Box::pin(handler(context)));
        *self
            .error_handler
            .write()
            .expect("error handler lock poisoned") = handler;
    }

    pub async fn default_exchange_name(&self) -> String {
        self.exchanges.default_exchange_name().await
    }

    /// Point publishes and subscriptions with no explicit exchange at a new
    /// default. Exchanges already cached under other names are untouched.
    pub async fn change_default_exchange(&self, name: impl Into<String>, spec: ExchangeSpec) {
        self.exchanges.change_default(name, spec).await;
    }

    /// Declare a subscription: a queue bound to an exchange, with a callback
    /// invoked per decoded delivery once `run` starts.
    pub fn register<F, Fut>(&self, queue_name: &str, options: SubscribeOptions, callback: F)
    where
        F: Fn(Delivery, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        self.registry
            .register(queue_name, options, wrap_callback(callback));
    }

    /// `register` with kind=topic forced and the routing key injected into
    /// the binding.
    pub fn register_topic<F, Fut>(
        &self,
        queue_name: &str,
        routing_key: &str,
        options: SubscribeOptions,
        callback: F,
    ) where
        F: Fn(Delivery, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        self.registry
            .register_topic(queue_name, routing_key, options, wrap_callback(callback));
    }

    /// Encode and send one message. Structured payloads go through the
    /// codec; raw bytes and strings pass through untouched. Inside a
    /// transaction the publish is staged instead of sent. Returns the
    /// encoded bytes either way, so callers can assert on wire content.
    pub async fn publish<P: Into<Payload>>(
        &self,
        payload: P,
        options: PublishOptions,
    ) -> Result<Vec<u8>> {
        let encoded = payload.into().into_bytes(self.codec.as_ref())?;
        let exchange = self
            .exchanges
            .resolve(options.exchange.name.as_deref(), &options.exchange)
            .await?;
        let meta = PublishMeta {
            routing_key: options.routing_key.unwrap_or_default(),
            content_type: options
                .content_type
                .or_else(|| Some(self.codec.content_type().to_string())),
            headers: options.headers,
        };

        let staged = self.tx.try_buffer(PendingPublish {
            exchange: exchange.clone(),
            payload: encoded.clone(),
            meta: meta.clone(),
        });
        if staged {
            debug!(
                "Staged {} bytes for exchange '{}' in open transaction",
                encoded.len(),
                exchange.name()
            );
            return Ok(encoded);
        }

        exchange.publish(&encoded, &meta).await?;
        Ok(encoded)
    }

    /// `publish` with the routing key set, for topic exchanges.
    pub async fn publish_topic<P: Into<Payload>>(
        &self,
        payload: P,
        routing_key: &str,
        mut options: PublishOptions,
    ) -> Result<Vec<u8>> {
        options.routing_key = Some(routing_key.to_string());
        self.publish(payload, options).await
    }

    /// Run `body` with publishes staged into a shared buffer. If `body`
    /// returns `Ok` and this is the outermost transaction, every staged
    /// entry is flushed in insertion order and the encoded payloads are
    /// returned. If `body` fails, nothing is flushed, the buffer is
    /// discarded, and the error comes back unchanged. Nested calls reuse the
    /// outer buffer and report its contents so far; only the outermost exit
    /// flushes, and an inner failure discards the entire accumulation.
    pub async fn transaction<F, Fut>(&self, body: F) -> Result<Vec<Vec<u8>>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let guard = self.tx.begin();
        body().await?;

        if !guard.is_outermost() {
            return Ok(self.tx.staged_payloads());
        }

        let entries = self.tx.take_entries();
        debug!("Flushing {} transactional publishes", entries.len());
        let mut flushed = Vec::with_capacity(entries.len());
        for entry in entries {
            entry.exchange.publish(&entry.payload, &entry.meta).await?;
            flushed.push(entry.payload);
        }
        Ok(flushed)
    }

    /// Dispatch every registered subscription, then block until `stop` (or
    /// connection teardown) releases the transport's wait. The blocking is
    /// all the transport's: this loop only waits on the stop signal.
    pub async fn run(&self) -> Result<()> {
        let subscriptions = self.registry.snapshot();
        info!("Dispatching {} subscription(s)", subscriptions.len());
        for subscription in &subscriptions {
            self.dispatch(subscription).await?;
        }

        loop {
            let notified = self.stop_signal.notified();
            if self.stopped.load(Ordering::Acquire) {
                break;
            }
            notified.await;
        }

        self.teardown().await;
        Ok(())
    }

    /// Request shutdown. Idempotent, synchronous, and safe to call from any
    /// context, including subscriber callbacks and signal handlers.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            info!("Stop requested");
        }
        self.stop_signal.notify_waiters();
    }

    /// Cancel the live consumers for one queue, leaving the rest running.
    pub async fn cancel(&self, queue_name: &str) -> Result<()> {
        let cancelled: Vec<Box<dyn ConsumerHandle>> = {
            let mut consumers = self.consumers.lock().expect("consumer list poisoned");
            let (matching, rest): (Vec<_>, Vec<_>) = consumers
                .drain(..)
                .partition(|(name, _)| name.as_str() == queue_name);
            *consumers = rest;
            matching.into_iter().map(|(_, handle)| handle).collect()
        };
        for consumer in cancelled {
            consumer.cancel().await?;
        }
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        self.stop();
        self.connection.close().await
    }

    async fn dispatch(&self, subscription: &Subscription) -> Result<()> {
        let options = &subscription.options;
        let exchange = self
            .exchanges
            .resolve(options.exchange.name.as_deref(), &options.exchange)
            .await?;

        let queue_options = options.queue.resolve(&self.defaults.queue);
        let queue = self
            .channel
            .declare_queue(&subscription.queue_name, &queue_options)
            .await?;
        queue.bind(exchange.as_ref(), &options.bind).await?;

        let consume_options = options.consume.resolve(&self.defaults.consume);
        let handler = self.delivery_handler(subscription);
        let consumer = queue.consume(&consume_options, handler).await?;
        debug!(
            "Subscribed queue '{}' to exchange '{}'",
            subscription.queue_name,
            exchange.name()
        );

        self.consumers
            .lock()
            .expect("consumer list poisoned")
            .push((subscription.queue_name.clone(), consumer));
        Ok(())
    }

    /// Wrap a subscription's callback with decode and error handling. Decode
    /// and callback failures both go to the error handler with full context;
    /// the handler's verdict decides whether the consumer survives. Acking
    /// is left entirely to the callback and the handler.
    fn delivery_handler(&self, subscription: &Subscription) -> DeliveryHandler {
        let codec = subscription
            .options
            .decoder
            .clone()
            .unwrap_or_else(|| self.codec.clone());
        let callback = subscription.callback.clone();
        let error_handler = self.error_handler.clone();
        let queue_name = subscription.queue_name.clone();

        Arc::new(move |delivery: Delivery| {
            let codec = codec.clone();
            let callback = callback.clone();
            let error_handler = error_handler.clone();
            let queue_name = queue_name.clone();

            Box::pin(async move {
                let outcome = match codec.decode(&delivery.data) {
                    Ok(value) => callback(delivery.clone(), value)
                        .await
                        .map_err(Error::callback),
                    Err(error) => Err(error),
                };

                match outcome {
                    Ok(()) => Ok(()),
                    Err(error) => {
                        warn!("Delivery on queue '{}' failed: {}", queue_name, error);
                        let handler = error_handler
                            .read()
                            .expect("error handler lock poisoned")
                            .clone();
                        handler(ErrorContext {
                            error,
                            queue: Some(queue_name),
                            delivery,
                        })
                        .await
                    }
                }
            })
        })
    }

    async fn teardown(&self) {
        let consumers: Vec<(String, Box<dyn ConsumerHandle>)> = {
            let mut consumers = self.consumers.lock().expect("consumer list poisoned");
            consumers.drain(..).collect()
        };
        for (queue_name, consumer) in consumers {
            if let Err(e) = consumer.cancel().await {
                warn!("Failed to cancel consumer on queue '{}': {}", queue_name, e);
            }
        }
    }
}

fn wrap_callback<F, Fut>(callback: F) -> crate::subscription::SubscriberCallback
where
    F: Fn(Delivery, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
{
    Arc::new(move |delivery, value| Box::pin(callback(delivery, value)))
}
