//! Shared fakes for tile-client integration tests.

#![allow(dead_code)]

use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use tile_client::{FetchError, TileFetcher};
use tile_common::{TileCoord, Timeline};
use tokio::time::Instant;

/// Fetcher that sleeps for a fixed latency and records every dispatch and
/// completion. URLs containing `busy` are answered with a rate limit error.
pub struct RecordingFetcher {
    latency: Duration,
    body: Bytes,
    pub dispatched: Mutex<Vec<(Instant, String)>>,
    pub completed: Mutex<Vec<String>>,
    /// URLs requested with a bounded cache lifetime
    pub bounded: Mutex<Vec<(String, Duration)>>,
    pub calls: AtomicUsize,
}

impl RecordingFetcher {
    pub fn new(latency: Duration) -> Self {
        Self::with_body(latency, Bytes::from_static(b"tile"))
    }

    pub fn with_body(latency: Duration, body: Bytes) -> Self {
        Self {
            latency,
            body,
            dispatched: Mutex::new(Vec::new()),
            completed: Mutex::new(Vec::new()),
            bounded: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn dispatch_times(&self) -> Vec<Instant> {
        self.dispatched.lock().unwrap().iter().map(|(t, _)| *t).collect()
    }

    pub fn completions(&self) -> Vec<String> {
        self.completed.lock().unwrap().clone()
    }

    pub fn bounded_requests(&self) -> Vec<(String, Duration)> {
        self.bounded.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TileFetcher for RecordingFetcher {
    async fn fetch(&self, url: &str, _group: &str) -> Result<Bytes, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.dispatched
            .lock()
            .unwrap()
            .push((Instant::now(), url.to_string()));

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.completed.lock().unwrap().push(url.to_string());

        if url.contains("busy") {
            return Err(FetchError::RateLimited);
        }
        Ok(self.body.clone())
    }

    async fn fetch_within(
        &self,
        url: &str,
        group: &str,
        max_age: Duration,
    ) -> Result<Bytes, FetchError> {
        self.bounded
            .lock()
            .unwrap()
            .push((url.to_string(), max_age));
        self.fetch(url, group).await
    }
}

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap()
}

/// `n` observed frames five minutes apart, ending at `base_time()`.
pub fn timeline(n: usize) -> Timeline {
    let end = base_time();
    let instants = (0..n)
        .map(|i| end - ChronoDuration::minutes(5 * (n - 1 - i) as i64))
        .collect();
    Timeline::from_instants(instants, end)
}

/// `n` distinct tiles at zoom 4, row-major.
pub fn tiles(n: usize) -> Vec<TileCoord> {
    (0..n as u32).map(|i| TileCoord::new(4, i % 16, i / 16)).collect()
}

pub fn png_tile() -> Bytes {
    let img = image::RgbaImage::from_pixel(2, 2, image::Rgba([0, 128, 255, 255]));
    let mut out = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgba8(img)
        .write_to(&mut out, image::ImageOutputFormat::Png)
        .unwrap();
    Bytes::from(out.into_inner())
}
