//! Shared state for the proxy handlers.

use std::sync::Arc;

use storage::EdgeCache;
use tile_common::ProviderRegistry;

use crate::config::ProxyConfig;
use crate::cors::CorsPolicy;
use crate::upstream::Upstream;

/// Everything a request needs. The cache is the only mutable part.
pub struct ProxyState {
    pub registry: Arc<ProviderRegistry>,
    pub cache: EdgeCache,
    pub upstream: Arc<dyn Upstream>,
    pub cors: CorsPolicy,
}

impl ProxyState {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        upstream: Arc<dyn Upstream>,
        config: &ProxyConfig,
    ) -> Self {
        Self {
            registry,
            cache: EdgeCache::new(config.cache_size_mb),
            upstream,
            cors: CorsPolicy::new(config.allowed_origins.iter().cloned()),
        }
    }
}
