//! Per-client persistent tile cache using SQLite with sqlx.
//!
//! Tiles are keyed by the URL they were fetched from and grouped by the
//! owning provider id. Entries older than the configured maximum age are
//! deleted before a lookup can see them, so an expired tile is never
//! returned. [`LocalCache::purge_older_than`] sweeps the rest.

use std::future::Future;
use std::io::Cursor;
use std::path::Path;

use bytes::Bytes;
use chrono::{DateTime, Duration, TimeZone, Utc};
use image::ImageFormat;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Errors from the local tile cache.
#[derive(Debug, Error)]
pub enum LocalCacheError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Payload from {url} is not a raster image")]
    NotAnImage { url: String },

    #[error("Unreadable image from {url}: {message}")]
    Decode { url: String, message: String },
}

/// A decoded tile as stored in the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedImage {
    pub url: String,
    pub group: String,
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    pub bytes: Bytes,
    pub inserted_at: DateTime<Utc>,
}

/// Whether a lookup was served from disk or required a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    Hit,
    Fetched,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalCacheStats {
    pub count: u64,
    pub total_bytes: u64,
}

/// Persistent tile store with a maximum entry age.
#[derive(Debug, Clone)]
pub struct LocalCache {
    pool: SqlitePool,
    max_age: Duration,
}

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS tiles (
        url TEXT PRIMARY KEY,
        group_id TEXT NOT NULL,
        format TEXT NOT NULL,
        width INTEGER NOT NULL,
        height INTEGER NOT NULL,
        bytes BLOB NOT NULL,
        size INTEGER NOT NULL,
        inserted_at INTEGER NOT NULL
    )
"#;

impl LocalCache {
    /// Open or create the cache database at the given path.
    pub async fn open(path: &Path, max_age: Duration) -> Result<Self, LocalCacheError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let cache = Self::init(pool, max_age).await?;
        info!(
            path = %path.display(),
            max_age_secs = max_age.num_seconds(),
            "Opened local tile cache"
        );
        Ok(cache)
    }

    /// Open an in-memory cache (for testing).
    pub async fn open_memory(max_age: Duration) -> Result<Self, LocalCacheError> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .create_if_missing(true);

        // A single connection, since each in-memory connection is its own database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        Self::init(pool, max_age).await
    }

    async fn init(pool: SqlitePool, max_age: Duration) -> Result<Self, LocalCacheError> {
        sqlx::query(SCHEMA).execute(&pool).await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tiles_group ON tiles(group_id)")
            .execute(&pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tiles_inserted ON tiles(inserted_at)")
            .execute(&pool)
            .await?;

        Ok(Self { pool, max_age })
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Return the cached tile for `url`, fetching and storing it on a miss.
    ///
    /// `fetch` is only called when no unexpired entry exists. Its bytes must
    /// be a recognised raster format; anything else is rejected unstored.
    /// Cache failures surface through the caller's error type.
    #[instrument(skip(self, fetch))]
    pub async fn get_or_fetch<F, Fut, E>(
        &self,
        url: &str,
        group: &str,
        fetch: F,
    ) -> Result<(CachedImage, CacheOutcome), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes, E>>,
        E: From<LocalCacheError>,
    {
        self.fetch_at(url, group, self.max_age, Utc::now(), fetch).await
    }

    /// Like [`LocalCache::get_or_fetch`], but an entry older than `max_age`
    /// is refetched. Used for URLs whose content changes in place. The
    /// cache-wide maximum age still applies when it is shorter.
    #[instrument(skip(self, fetch), fields(max_age_secs = max_age.num_seconds()))]
    pub async fn get_or_fetch_within<F, Fut, E>(
        &self,
        url: &str,
        group: &str,
        max_age: Duration,
        fetch: F,
    ) -> Result<(CachedImage, CacheOutcome), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes, E>>,
        E: From<LocalCacheError>,
    {
        let max_age = max_age.min(self.max_age);
        self.fetch_at(url, group, max_age, Utc::now(), fetch).await
    }

    async fn fetch_at<F, Fut, E>(
        &self,
        url: &str,
        group: &str,
        max_age: Duration,
        now: DateTime<Utc>,
        fetch: F,
    ) -> Result<(CachedImage, CacheOutcome), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes, E>>,
        E: From<LocalCacheError>,
    {
        if let Some(image) = self.lookup(url, max_age, now).await? {
            debug!(url = %url, "Local cache hit");
            return Ok((image, CacheOutcome::Hit));
        }

        let bytes = fetch().await?;
        let image = decode(url, group, bytes, now)?;
        self.store(&image).await?;
        debug!(url = %url, size = image.bytes.len(), "Local cache stored");

        Ok((image, CacheOutcome::Fetched))
    }

    /// Unexpired entry for `url`, if any. An expired entry is deleted first.
    pub async fn get(&self, url: &str) -> Result<Option<CachedImage>, LocalCacheError> {
        self.lookup(url, self.max_age, Utc::now()).await
    }

    async fn lookup(
        &self,
        url: &str,
        max_age: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<CachedImage>, LocalCacheError> {
        let cutoff = (now - max_age).timestamp_millis();

        sqlx::query("DELETE FROM tiles WHERE url = ? AND inserted_at <= ?")
            .bind(url)
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        let row = sqlx::query(
            "SELECT url, group_id, format, width, height, bytes, inserted_at \
             FROM tiles WHERE url = ?",
        )
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let format_name: String = row.get("format");
        let Some(format) = ImageFormat::from_extension(&format_name) else {
            warn!(url = %url, format = %format_name, "Dropping cache row with unknown format");
            self.remove(url).await?;
            return Ok(None);
        };

        let bytes: Vec<u8> = row.get("bytes");
        let inserted_ms: i64 = row.get("inserted_at");
        let width: i64 = row.get("width");
        let height: i64 = row.get("height");

        Ok(Some(CachedImage {
            url: row.get("url"),
            group: row.get("group_id"),
            format,
            width: width as u32,
            height: height as u32,
            bytes: Bytes::from(bytes),
            inserted_at: Utc
                .timestamp_millis_opt(inserted_ms)
                .single()
                .unwrap_or(now),
        }))
    }

    async fn store(&self, image: &CachedImage) -> Result<(), LocalCacheError> {
        sqlx::query(
            r#"
            INSERT INTO tiles (url, group_id, format, width, height, bytes, size, inserted_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(url) DO UPDATE SET
                group_id = excluded.group_id,
                format = excluded.format,
                width = excluded.width,
                height = excluded.height,
                bytes = excluded.bytes,
                size = excluded.size,
                inserted_at = excluded.inserted_at
            "#,
        )
        .bind(&image.url)
        .bind(&image.group)
        .bind(format_name(image.format))
        .bind(i64::from(image.width))
        .bind(i64::from(image.height))
        .bind(image.bytes.as_ref())
        .bind(image.bytes.len() as i64)
        .bind(image.inserted_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn remove(&self, url: &str) -> Result<(), LocalCacheError> {
        sqlx::query("DELETE FROM tiles WHERE url = ?")
            .bind(url)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete every entry older than `max_age`. Returns rows removed.
    pub async fn purge_older_than(&self, max_age: Duration) -> Result<u64, LocalCacheError> {
        let cutoff = (Utc::now() - max_age).timestamp_millis();
        let result = sqlx::query("DELETE FROM tiles WHERE inserted_at <= ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        let removed = result.rows_affected();
        if removed > 0 {
            info!(removed = removed, max_age_secs = max_age.num_seconds(), "Purged expired tiles");
        }
        Ok(removed)
    }

    /// Delete every entry owned by `group`. Returns rows removed.
    pub async fn purge_group(&self, group: &str) -> Result<u64, LocalCacheError> {
        let result = sqlx::query("DELETE FROM tiles WHERE group_id = ?")
            .bind(group)
            .execute(&self.pool)
            .await?;
        info!(group = %group, removed = result.rows_affected(), "Purged tile group");
        Ok(result.rows_affected())
    }

    pub async fn stats(&self) -> Result<LocalCacheStats, LocalCacheError> {
        let row = sqlx::query("SELECT COUNT(*) AS count, COALESCE(SUM(size), 0) AS total FROM tiles")
            .fetch_one(&self.pool)
            .await?;

        let count: i64 = row.get("count");
        let total: i64 = row.get("total");
        Ok(LocalCacheStats {
            count: count as u64,
            total_bytes: total as u64,
        })
    }
}

fn format_name(format: ImageFormat) -> &'static str {
    format.extensions_str().first().copied().unwrap_or("bin")
}

fn decode(
    url: &str,
    group: &str,
    bytes: Bytes,
    now: DateTime<Utc>,
) -> Result<CachedImage, LocalCacheError> {
    let format = image::guess_format(&bytes).map_err(|_| LocalCacheError::NotAnImage {
        url: url.to_string(),
    })?;

    let (width, height) = image::io::Reader::with_format(Cursor::new(&bytes[..]), format)
        .into_dimensions()
        .map_err(|e| LocalCacheError::Decode {
            url: url.to_string(),
            message: e.to_string(),
        })?;

    Ok(CachedImage {
        url: url.to_string(),
        group: group.to_string(),
        format,
        width,
        height,
        bytes,
        inserted_at: now,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn png() -> Bytes {
        let img = image::RgbaImage::from_pixel(2, 3, image::Rgba([10, 20, 30, 255]));
        let mut out = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut out, image::ImageOutputFormat::Png)
            .unwrap();
        Bytes::from(out.into_inner())
    }

    #[tokio::test]
    async fn test_decode_detects_png() {
        let image = decode("u", "g", png(), Utc::now()).unwrap();
        assert_eq!(image.format, ImageFormat::Png);
        assert_eq!((image.width, image.height), (2, 3));
    }

    #[tokio::test]
    async fn test_rejects_xml_exception() {
        let cache = LocalCache::open_memory(Duration::hours(1)).await.unwrap();
        let result: Result<_, LocalCacheError> = cache
            .get_or_fetch("https://wms/err", "mrms", || async {
                Ok(Bytes::from_static(b"<?xml version=\"1.0\"?><ServiceExceptionReport/>"))
            })
            .await;

        assert!(matches!(result, Err(LocalCacheError::NotAnImage { .. })));
        assert_eq!(cache.stats().await.unwrap().count, 0);
    }

    #[tokio::test]
    async fn test_fetch_error_not_stored() {
        let cache = LocalCache::open_memory(Duration::hours(1)).await.unwrap();
        let calls = AtomicUsize::new(0);

        let result: Result<_, LocalCacheError> = cache
            .get_or_fetch("https://a/1.png", "nexrad", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(LocalCacheError::Io(std::io::Error::new(std::io::ErrorKind::Other, "offline")))
            })
            .await;
        assert!(result.is_err());
        assert!(cache.get("https://a/1.png").await.unwrap().is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_purge_group_and_stats() {
        let cache = LocalCache::open_memory(Duration::hours(1)).await.unwrap();
        let tile = png();

        for (url, group) in [("a", "nexrad"), ("b", "nexrad"), ("c", "gibs")] {
            let tile = tile.clone();
            let _: (CachedImage, CacheOutcome) = cache
                .get_or_fetch::<_, _, LocalCacheError>(url, group, || async { Ok(tile) })
                .await
                .unwrap();
        }

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.total_bytes, 3 * tile.len() as u64);

        assert_eq!(cache.purge_group("nexrad").await.unwrap(), 2);
        assert_eq!(cache.stats().await.unwrap().count, 1);
        assert!(cache.get("c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_mutable_entry_refetched_after_its_lifetime() {
        let cache = LocalCache::open_memory(Duration::hours(2)).await.unwrap();
        let calls = AtomicUsize::new(0);
        let url = "https://a/ridge::USCOMP-N0Q-0/3/1/3.png";
        let start = Utc.with_ymd_and_hms(2024, 1, 15, 12, 3, 0).unwrap();

        for (minutes, expected) in [(0, 1), (2, 1), (30, 2)] {
            let (_, outcome) = cache
                .fetch_at::<_, _, LocalCacheError>(
                    url,
                    "nexrad",
                    Duration::minutes(5),
                    start + Duration::minutes(minutes),
                    || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(png())
                    },
                )
                .await
                .unwrap();
            assert_eq!(calls.load(Ordering::SeqCst), expected, "at +{} min", minutes);
            assert_eq!(outcome == CacheOutcome::Fetched, minutes != 2);
        }
    }

    #[tokio::test]
    async fn test_mutable_lifetime_capped_by_cache_max_age() {
        let cache = LocalCache::open_memory(Duration::zero()).await.unwrap();
        let calls = AtomicUsize::new(0);

        for _ in 0..2 {
            let _: (CachedImage, CacheOutcome) = cache
                .get_or_fetch_within::<_, _, LocalCacheError>(
                    "https://a/current.png",
                    "gibs",
                    Duration::hours(1),
                    || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(png())
                    },
                )
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
