//! Tile fetching over HTTP, optionally through the local persistent cache.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode};
use storage::{CacheOutcome, LocalCache, LocalCacheError};
use thiserror::Error;
use tile_common::TileError;
use tracing::{debug, instrument, warn};

/// Why a single tile could not be obtained. Never fatal to a job.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("Upstream returned HTTP {status}")]
    Upstream { status: u16 },

    #[error("Upstream rate limit exceeded")]
    RateLimited,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Frame not yet published")]
    NotYetPublished,

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Invalid request: {0}")]
    Invalid(String),
}

impl FetchError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, FetchError::RateLimited)
    }
}

impl From<LocalCacheError> for FetchError {
    fn from(e: LocalCacheError) -> Self {
        FetchError::Cache(e.to_string())
    }
}

impl From<TileError> for FetchError {
    fn from(e: TileError) -> Self {
        match e {
            TileError::NotYetPublished { .. } => FetchError::NotYetPublished,
            TileError::RateLimitExceeded => FetchError::RateLimited,
            TileError::UpstreamError { status } => FetchError::Upstream { status },
            TileError::Timeout => FetchError::Timeout(Duration::ZERO),
            TileError::NetworkError(msg) => FetchError::Network(msg),
            other => FetchError::Invalid(other.to_string()),
        }
    }
}

/// Source of tile bytes. `group` is the owning provider id.
#[async_trait]
pub trait TileFetcher: Send + Sync {
    async fn fetch(&self, url: &str, group: &str) -> Result<Bytes, FetchError>;

    /// Fetch a URL whose content changes in place. A cached copy older than
    /// `max_age` must not be returned. Fetchers without a cache just fetch.
    async fn fetch_within(
        &self,
        url: &str,
        group: &str,
        _max_age: Duration,
    ) -> Result<Bytes, FetchError> {
        self.fetch(url, group).await
    }
}

#[async_trait]
impl<T: TileFetcher + ?Sized> TileFetcher for Arc<T> {
    async fn fetch(&self, url: &str, group: &str) -> Result<Bytes, FetchError> {
        (**self).fetch(url, group).await
    }

    async fn fetch_within(
        &self,
        url: &str,
        group: &str,
        max_age: Duration,
    ) -> Result<Bytes, FetchError> {
        (**self).fetch_within(url, group, max_age).await
    }
}

/// Plain HTTP fetcher.
#[derive(Debug, Clone)]
pub struct HttpTileFetcher {
    client: Client,
}

impl HttpTileFetcher {
    pub fn new(request_timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(8)
            .user_agent(concat!("weather-tiles/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TileFetcher for HttpTileFetcher {
    #[instrument(skip(self))]
    async fn fetch(&self, url: &str, group: &str) -> Result<Bytes, FetchError> {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout(Duration::ZERO)
            } else {
                FetchError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            warn!(url = %url, "Upstream rate limited request");
            return Err(FetchError::RateLimited);
        }
        if !status.is_success() {
            debug!(url = %url, status = status.as_u16(), "Upstream error");
            return Err(FetchError::Upstream {
                status: status.as_u16(),
            });
        }

        response
            .bytes()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))
    }
}

/// Fetcher that serves from the local cache and fills it on a miss.
pub struct CachedFetcher<F> {
    inner: F,
    cache: LocalCache,
}

impl<F: TileFetcher> CachedFetcher<F> {
    pub fn new(inner: F, cache: LocalCache) -> Self {
        Self { inner, cache }
    }

    pub fn cache(&self) -> &LocalCache {
        &self.cache
    }
}

#[async_trait]
impl<F: TileFetcher> TileFetcher for CachedFetcher<F> {
    async fn fetch(&self, url: &str, group: &str) -> Result<Bytes, FetchError> {
        let (image, _) = self
            .cache
            .get_or_fetch(url, group, || self.inner.fetch(url, group))
            .await?;
        Ok(image.bytes)
    }

    async fn fetch_within(
        &self,
        url: &str,
        group: &str,
        max_age: Duration,
    ) -> Result<Bytes, FetchError> {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or_else(|_| self.cache.max_age());
        let (image, outcome) = self
            .cache
            .get_or_fetch_within(url, group, max_age, || self.inner.fetch(url, group))
            .await?;
        if outcome == CacheOutcome::Fetched {
            debug!(url = %url, max_age_secs = max_age.num_seconds(), "Refreshed mutable tile");
        }
        Ok(image.bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tile_error_mapping() {
        assert_eq!(
            FetchError::from(TileError::NotYetPublished {
                provider: "nexrad".into(),
                instant: "x".into(),
            }),
            FetchError::NotYetPublished
        );
        assert!(FetchError::from(TileError::RateLimitExceeded).is_rate_limited());
        assert_eq!(
            FetchError::from(TileError::UpstreamError { status: 503 }),
            FetchError::Upstream { status: 503 }
        );
    }
}
