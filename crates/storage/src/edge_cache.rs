//! Shared in-memory cache of upstream tile responses.
//!
//! Entries are keyed by the fully resolved upstream URL (query included) and
//! only successful responses are ever stored. Each entry carries its own
//! lifetime, taken from the provider descriptor at insert time.
//!
//! ## Memory-Based Eviction
//!
//! The cache is bounded by total body bytes rather than entry count. When an
//! insert would exceed the limit, ~5% of the capacity (by memory) is evicted
//! in LRU order in a single batch.
//!
//! Expiry is lazy: an expired entry is dropped on the read that finds it.

use bytes::Bytes;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info};

/// A stored upstream response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    pub body: Bytes,
    pub content_type: String,
    /// Lifetime on insert; what is left of it when returned by a lookup
    pub ttl: Duration,
}

struct Entry {
    response: CachedResponse,
    inserted_at: Instant,
}

impl Entry {
    fn remaining(&self, now: Instant) -> Duration {
        self.response
            .ttl
            .saturating_sub(now.duration_since(self.inserted_at))
    }

    fn size(&self) -> u64 {
        self.response.body.len() as u64
    }
}

/// Counters for the edge cache, readable without taking the cache lock.
#[derive(Debug, Default)]
pub struct EdgeCacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
    pub expired: AtomicU64,
    pub size_bytes: AtomicU64,
    pub entry_count: AtomicU64,
    pub eviction_runs: AtomicU64,
}

impl EdgeCacheStats {
    /// Hit rate as a percentage (0-100).
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            (hits as f64 / total as f64) * 100.0
        }
    }

    fn snapshot(&self) -> Self {
        let copy = |v: &AtomicU64| AtomicU64::new(v.load(Ordering::Relaxed));
        Self {
            hits: copy(&self.hits),
            misses: copy(&self.misses),
            evictions: copy(&self.evictions),
            expired: copy(&self.expired),
            size_bytes: copy(&self.size_bytes),
            entry_count: copy(&self.entry_count),
            eviction_runs: copy(&self.eviction_runs),
        }
    }
}

/// Byte-bounded LRU of upstream responses with per-entry TTL.
#[derive(Clone)]
pub struct EdgeCache {
    cache: Arc<RwLock<LruCache<String, Entry>>>,
    max_bytes: u64,
    stats: Arc<EdgeCacheStats>,
}

impl EdgeCache {
    /// Create a cache holding at most `max_size_mb` megabytes of bodies.
    pub fn new(max_size_mb: usize) -> Self {
        Self::with_max_bytes((max_size_mb as u64) * 1024 * 1024)
    }

    pub fn with_max_bytes(max_bytes: u64) -> Self {
        // Eviction is by memory; the entry bound only has to stay out of the way.
        let capacity = NonZeroUsize::new(1_000_000).unwrap_or(NonZeroUsize::MIN);

        Self {
            cache: Arc::new(RwLock::new(LruCache::new(capacity))),
            max_bytes,
            stats: Arc::new(EdgeCacheStats::default()),
        }
    }

    /// Look up a URL. Expired entries are removed and reported as a miss.
    ///
    /// A hit carries the entry's remaining lifetime in `ttl`.
    pub async fn get(&self, url: &str) -> Option<CachedResponse> {
        let mut cache = self.cache.write().await;
        let now = Instant::now();

        let expired_size = match cache.get(url) {
            Some(entry) => {
                let remaining = entry.remaining(now);
                if !remaining.is_zero() {
                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(CachedResponse {
                        ttl: remaining,
                        ..entry.response.clone()
                    });
                }
                Some(entry.size())
            }
            None => None,
        };

        if let Some(size) = expired_size {
            cache.pop(url);
            self.stats.expired.fetch_add(1, Ordering::Relaxed);
            self.stats.size_bytes.fetch_sub(size, Ordering::Relaxed);
            self.stats.entry_count.fetch_sub(1, Ordering::Relaxed);
            debug!(url = %url, "Edge cache entry expired");
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store a successful response under `url`.
    ///
    /// Bodies larger than the whole cache are not stored.
    pub async fn insert(&self, url: &str, response: CachedResponse) {
        let size = response.body.len() as u64;
        if size > self.max_bytes || response.ttl.is_zero() {
            return;
        }

        let mut cache = self.cache.write().await;

        if let Some(existing) = cache.pop(url) {
            self.stats
                .size_bytes
                .fetch_sub(existing.size(), Ordering::Relaxed);
            self.stats.entry_count.fetch_sub(1, Ordering::Relaxed);
        }

        while self.stats.size_bytes.load(Ordering::Relaxed) + size > self.max_bytes {
            if self.evict_batch_locked(&mut cache) == 0 {
                break;
            }
        }

        cache.put(
            url.to_string(),
            Entry {
                response,
                inserted_at: Instant::now(),
            },
        );
        self.stats.size_bytes.fetch_add(size, Ordering::Relaxed);
        self.stats.entry_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Evict ~5% of capacity (by memory) in LRU order. Returns entries evicted.
    fn evict_batch_locked(&self, cache: &mut LruCache<String, Entry>) -> usize {
        let target_free = (self.max_bytes / 20).max(1);
        let mut bytes_freed = 0u64;
        let mut evicted = 0usize;

        while bytes_freed < target_free {
            match cache.pop_lru() {
                Some((_, entry)) => {
                    bytes_freed += entry.size();
                    evicted += 1;
                }
                None => break,
            }
        }

        self.stats
            .size_bytes
            .fetch_sub(bytes_freed, Ordering::Relaxed);
        self.stats
            .entry_count
            .fetch_sub(evicted as u64, Ordering::Relaxed);
        self.stats
            .evictions
            .fetch_add(evicted as u64, Ordering::Relaxed);
        self.stats.eviction_runs.fetch_add(1, Ordering::Relaxed);

        info!(
            entries_evicted = evicted,
            bytes_freed_kb = bytes_freed / 1024,
            max_size_mb = format!("{:.2}", self.max_bytes as f64 / (1024.0 * 1024.0)),
            "Edge cache batch eviction completed"
        );

        evicted
    }

    /// Point-in-time copy of the counters.
    pub fn stats(&self) -> EdgeCacheStats {
        self.stats.snapshot()
    }

    pub fn len(&self) -> usize {
        self.stats.entry_count.load(Ordering::Relaxed) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn size_bytes(&self) -> u64 {
        self.stats.size_bytes.load(Ordering::Relaxed)
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub async fn clear(&self) {
        let mut cache = self.cache.write().await;
        cache.clear();
        self.stats.size_bytes.store(0, Ordering::Relaxed);
        self.stats.entry_count.store(0, Ordering::Relaxed);
    }
}
