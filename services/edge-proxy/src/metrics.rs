//! Prometheus metrics for the proxy.

use std::sync::atomic::Ordering;

use metrics::{counter, gauge};
use storage::EdgeCache;

pub fn record_cache_hit(provider: &str) {
    counter!("edge_cache_hits_total", "provider" => provider.to_string()).increment(1);
}

pub fn record_cache_miss(provider: &str) {
    counter!("edge_cache_misses_total", "provider" => provider.to_string()).increment(1);
}

/// `kind` is `status`, `timeout` or `transport`.
pub fn record_upstream_error(provider: &str, kind: &'static str) {
    counter!(
        "edge_upstream_errors_total",
        "provider" => provider.to_string(),
        "kind" => kind
    )
    .increment(1);
}

pub fn record_unknown_provider() {
    counter!("edge_unknown_provider_total").increment(1);
}

/// Export the cache's own counters alongside its size.
pub fn record_cache_size(cache: &EdgeCache) {
    let stats = cache.stats();
    gauge!("edge_cache_size_bytes").set(cache.size_bytes() as f64);
    gauge!("edge_cache_entries").set(cache.len() as f64);
    gauge!("edge_cache_hit_rate").set(stats.hit_rate());
    counter!("edge_cache_evictions_total").absolute(stats.evictions.load(Ordering::Relaxed));
    counter!("edge_cache_expired_total").absolute(stats.expired.load(Ordering::Relaxed));
}
