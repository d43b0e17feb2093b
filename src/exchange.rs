use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::config::{ExchangeOptions, ExchangeSpec};
use crate::error::Result;
use crate::transport::{ExchangeHandle, TransportChannel};

/// Resolves logical exchange names to live handles, declaring each distinct
/// name through the transport at most once per connection lifetime. Options
/// only matter on first resolution; later calls get the cached handle back
/// no matter what they pass.
pub struct ExchangeCache {
    channel: Arc<dyn TransportChannel>,
    defaults: ExchangeOptions,
    /// Identity `resolve(None, ..)` maps to: name plus first-resolution opts.
    default_exchange: Mutex<(String, ExchangeSpec)>,
    cache: Mutex<HashMap<String, Arc<dyn ExchangeHandle>>>,
}

impl ExchangeCache {
    pub fn new(
        channel: Arc<dyn TransportChannel>,
        defaults: ExchangeOptions,
        default_exchange: String,
    ) -> Self {
        ExchangeCache {
            channel,
            defaults,
            default_exchange: Mutex::new((default_exchange, ExchangeSpec::default())),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn default_exchange_name(&self) -> String {
        self.default_exchange.lock().await.0.clone()
    }

    /// Swap what the default exchange resolves to. Handles already cached
    /// under other names stay valid; the new default is declared (and cached
    /// under its own name) on first use.
    pub async fn change_default(&self, name: impl Into<String>, spec: ExchangeSpec) {
        let mut default = self.default_exchange.lock().await;
        *default = (name.into(), spec);
    }

    /// Resolve `name` (or the default exchange when `None`) to a handle,
    /// declaring it with `defaults.merge(spec)` on first sight. The cache
    /// lock is held across the declare so concurrent resolves of the same
    /// name still produce exactly one handle.
    pub async fn resolve(
        &self,
        name: Option<&str>,
        spec: &ExchangeSpec,
    ) -> Result<Arc<dyn ExchangeHandle>> {
        let (name, spec) = match name {
            Some(name) => (name.to_string(), spec.clone()),
            None => {
                let default = self.default_exchange.lock().await;
                (default.0.clone(), default.1.overlay(spec))
            }
        };

        let mut cache = self.cache.lock().await;
        if let Some(handle) = cache.get(&name) {
            return Ok(handle.clone());
        }

        let options = spec.resolve(&self.defaults);
        debug!("Resolving exchange '{}' ({:?})", name, options.kind);
        let handle = self.channel.declare_exchange(&name, &options).await?;
        cache.insert(name, handle.clone());
        Ok(handle)
    }
}
