use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use serde_json::Value;

use crate::codec::Codec;
use crate::config::{BindOptions, ConsumeSpec, ExchangeKind, ExchangeSpec, QueueSpec};
use crate::error::BoxError;
use crate::transport::Delivery;

/// Subscriber callback: receives the delivery (info, metadata, ack handle)
/// and the decoded payload. Errors are routed to the client's error handler,
/// never propagated out of the dispatch loop.
pub type SubscriberCallback =
    Arc<dyn Fn(Delivery, Value) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Everything configurable per subscription. Unset fields merge over the
/// connection-wide defaults at dispatch time.
#[derive(Clone, Default)]
pub struct SubscribeOptions {
    pub exchange: ExchangeSpec,
    pub queue: QueueSpec,
    pub bind: BindOptions,
    pub consume: ConsumeSpec,
    /// Codec override for this subscription only.
    pub decoder: Option<Arc<dyn Codec>>,
}

/// One declared subscription. Immutable once registered.
#[derive(Clone)]
pub struct Subscription {
    pub queue_name: String,
    pub options: SubscribeOptions,
    pub callback: SubscriberCallback,
}

/// Ordered collection of subscriptions; order is dispatch order. Registering
/// the same queue name twice appends a second independent subscription:
/// both get dispatched, and the broker splits deliveries between competing
/// consumers on the one queue. That split is a caveat, not a feature.
#[derive(Default)]
pub struct SubscriptionRegistry {
    subscriptions: Mutex<Vec<Subscription>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        SubscriptionRegistry::default()
    }

    pub fn register(
        &self,
        queue_name: impl Into<String>,
        options: SubscribeOptions,
        callback: SubscriberCallback,
    ) {
        let subscription = Subscription {
            queue_name: queue_name.into(),
            options,
            callback,
        };
        self.subscriptions
            .lock()
            .expect("subscription registry poisoned")
            .push(subscription);
    }

    /// Sugar for topic-routed subscriptions: forces kind=topic and injects
    /// the routing key into the binding before registering.
    pub fn register_topic(
        &self,
        queue_name: impl Into<String>,
        routing_key: impl Into<String>,
        mut options: SubscribeOptions,
        callback: SubscriberCallback,
    ) {
        options.exchange.kind = Some(ExchangeKind::Topic);
        options.bind.routing_key = Some(routing_key.into());
        self.register(queue_name, options, callback);
    }

    /// Snapshot in registration order for the dispatch loop.
    pub fn snapshot(&self) -> Vec<Subscription> {
        self.subscriptions
            .lock()
            .expect("subscription registry poisoned")
            .clone()
    }

    pub fn len(&self) -> usize {
        self.subscriptions
            .lock()
            .expect("subscription registry poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_callback() -> SubscriberCallback {
        Arc::new(|_, _| Box::pin(async { Ok(()) }))
    }

    #[test]
    fn registration_preserves_order() {
        let registry = SubscriptionRegistry::new();
        registry.register("first", SubscribeOptions::default(), noop_callback());
        registry.register("second", SubscribeOptions::default(), noop_callback());

        let names: Vec<String> = registry
            .snapshot()
            .into_iter()
            .map(|s| s.queue_name)
            .collect();
        assert_eq!(names, ["first", "second"]);
    }

    #[test]
    fn duplicate_queue_name_appends_not_replaces() {
        let registry = SubscriptionRegistry::new();
        registry.register("dup", SubscribeOptions::default(), noop_callback());
        registry.register("dup", SubscribeOptions::default(), noop_callback());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn register_topic_forces_kind_and_routing_key() {
        let registry = SubscriptionRegistry::new();
        registry.register_topic(
            "bounces",
            "mail.bounced",
            SubscribeOptions::default(),
            noop_callback(),
        );

        let subscription = registry.snapshot().remove(0);
        assert_eq!(subscription.options.exchange.kind, Some(ExchangeKind::Topic));
        assert_eq!(
            subscription.options.bind.routing_key.as_deref(),
            Some("mail.bounced")
        );
    }
}
