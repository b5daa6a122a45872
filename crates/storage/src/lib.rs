//! Tile caches for the weather tile services.
//!
//! - [`EdgeCache`]: byte-bounded in-memory LRU shared by every client of the
//!   edge proxy
//! - [`LocalCache`]: per-client SQLite store of decoded tiles with
//!   age-based expiry

pub mod edge_cache;
pub mod local_cache;

pub use edge_cache::{CachedResponse, EdgeCache, EdgeCacheStats};
pub use local_cache::{CacheOutcome, CachedImage, LocalCache, LocalCacheError, LocalCacheStats};
