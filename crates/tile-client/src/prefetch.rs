//! Rate-limited prefetch scheduling.
//!
//! A job is the cross product of frames and viewport tiles for one provider,
//! ordered newest frame first. Jobs run in fixed-size batches: every member
//! of a batch is dispatched concurrently, the batch is awaited, then the
//! scheduler sleeps long enough to stay at 80% of the provider's budget.
//!
//! Submitting a new set of jobs supersedes the previous generation. A
//! superseded job lets its in-flight items settle but starts no further
//! batches.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use tile_common::timeline::Frame;
use tile_common::{ProviderDescriptor, RequestBudget, TileCoord, TileResult};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::fetcher::{FetchError, TileFetcher};
use crate::rate::{self, SlidingWindowLimiter};

/// One tile of one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefetchItem {
    pub provider: String,
    pub frame: Frame,
    pub tile: TileCoord,
    pub url: String,
    /// Longest a locally cached copy may be reused. `None` for immutable
    /// timestamped URLs; set for URLs whose content moves every cadence.
    pub max_age: Option<Duration>,
}

/// A built URL and how long its content stays valid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedUrl {
    pub url: String,
    pub max_age: Option<Duration>,
}

impl PlannedUrl {
    /// A URL whose content changes in place, such as a provider's latest image.
    pub fn mutable(url: impl Into<String>, max_age: Duration) -> Self {
        Self {
            url: url.into(),
            max_age: Some(max_age),
        }
    }
}

impl From<String> for PlannedUrl {
    fn from(url: String) -> Self {
        Self { url, max_age: None }
    }
}

/// Ordered work for one provider.
#[derive(Debug, Clone)]
pub struct PrefetchJob {
    pub id: Uuid,
    pub provider: String,
    pub budget: RequestBudget,
    pub items: Vec<PrefetchItem>,
}

impl PrefetchJob {
    /// Expand `frames x tiles` into items, newest frame first.
    ///
    /// Within a frame, tiles keep the given order. Items whose URL was
    /// already planned earlier in the job are dropped; items whose URL cannot
    /// be built are skipped with a warning.
    pub fn plan<F, U>(
        provider: &ProviderDescriptor,
        frames: &[Frame],
        tiles: &[TileCoord],
        mut url_for: F,
    ) -> Self
    where
        F: FnMut(&Frame, TileCoord) -> TileResult<U>,
        U: Into<PlannedUrl>,
    {
        let mut ordered: Vec<&Frame> = frames.iter().collect();
        ordered.sort_by(|a, b| b.instant.cmp(&a.instant).then(b.index.cmp(&a.index)));

        let mut seen = HashSet::new();
        let mut items = Vec::with_capacity(frames.len() * tiles.len());

        for frame in ordered {
            for &tile in tiles {
                match url_for(frame, tile).map(Into::into) {
                    Ok(PlannedUrl { url, max_age }) => {
                        if seen.insert(url.clone()) {
                            items.push(PrefetchItem {
                                provider: provider.id.clone(),
                                frame: *frame,
                                tile,
                                url,
                                max_age,
                            });
                        }
                    }
                    Err(e) => {
                        warn!(provider = %provider.id, tile = %tile, error = %e, "Skipping tile")
                    }
                }
            }
        }

        Self {
            id: Uuid::new_v4(),
            provider: provider.id.clone(),
            budget: provider.budget,
            items,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Snapshot of the current generation, published after every settled item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PrefetchProgress {
    pub generation: u64,
    pub completed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub total: usize,
    /// Every job finished or was superseded
    pub done: bool,
}

impl PrefetchProgress {
    /// Completed fraction in `0.0..=1.0`. An empty generation is complete.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.completed as f64 / self.total as f64
        }
    }
}

/// Final tally for a generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PrefetchReport {
    pub generation: u64,
    pub total: usize,
    /// Items that were dispatched and settled
    pub attempted: usize,
    pub succeeded: usize,
    /// All unsuccessful items, including the two counts below
    pub failed: usize,
    pub rate_limited: usize,
    pub timed_out: usize,
    pub superseded: bool,
}

impl PrefetchReport {
    fn merge(&mut self, other: &PrefetchReport) {
        self.total += other.total;
        self.attempted += other.attempted;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.rate_limited += other.rate_limited;
        self.timed_out += other.timed_out;
        self.superseded |= other.superseded;
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Upper bound on a single tile request
    pub tile_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tile_timeout: Duration::from_secs(15),
        }
    }
}

/// Runs prefetch generations against a [`TileFetcher`].
pub struct PrefetchScheduler {
    fetcher: Arc<dyn TileFetcher>,
    config: SchedulerConfig,
    progress: Arc<watch::Sender<PrefetchProgress>>,
    current: Mutex<Option<CancellationToken>>,
    generation: AtomicU64,
}

/// Handle to a submitted generation.
pub struct PrefetchHandle {
    generation: u64,
    cancel: CancellationToken,
    progress: watch::Receiver<PrefetchProgress>,
    task: JoinHandle<PrefetchReport>,
}

impl PrefetchHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn progress(&self) -> watch::Receiver<PrefetchProgress> {
        self.progress.clone()
    }

    /// Stop scheduling further batches.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the generation to finish.
    pub async fn wait(self) -> PrefetchReport {
        match self.task.await {
            Ok(report) => report,
            Err(e) => {
                warn!(generation = self.generation, error = %e, "Prefetch task failed");
                PrefetchReport {
                    generation: self.generation,
                    superseded: true,
                    ..Default::default()
                }
            }
        }
    }
}

impl PrefetchScheduler {
    pub fn new(fetcher: Arc<dyn TileFetcher>, config: SchedulerConfig) -> Self {
        let (progress, _) = watch::channel(PrefetchProgress {
            done: true,
            ..Default::default()
        });

        Self {
            fetcher,
            config,
            progress: Arc::new(progress),
            current: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// Progress of whichever generation is current.
    pub fn progress(&self) -> watch::Receiver<PrefetchProgress> {
        self.progress.subscribe()
    }

    /// Supersede the running generation without starting a new one.
    pub fn cancel_current(&self) {
        if let Ok(mut current) = self.current.lock() {
            if let Some(token) = current.take() {
                token.cancel();
            }
        }
    }

    /// Start a new generation made of `jobs`, superseding the previous one.
    ///
    /// Jobs for different providers run side by side, each paced by its own
    /// budget.
    pub fn submit(&self, jobs: Vec<PrefetchJob>) -> PrefetchHandle {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();

        if let Ok(mut current) = self.current.lock() {
            if let Some(previous) = current.replace(cancel.clone()) {
                previous.cancel();
            }
        }

        let total: usize = jobs.iter().map(PrefetchJob::len).sum();
        self.progress.send_replace(PrefetchProgress {
            generation,
            total,
            done: total == 0,
            ..Default::default()
        });

        info!(
            generation = generation,
            jobs = jobs.len(),
            total = total,
            "Submitting prefetch generation"
        );

        let fetcher = self.fetcher.clone();
        let progress = self.progress.clone();
        let tile_timeout = self.config.tile_timeout;
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let runs = jobs.into_iter().map(|job| {
                run_job(
                    job,
                    fetcher.clone(),
                    tile_timeout,
                    token.clone(),
                    Reporter {
                        generation,
                        progress: progress.clone(),
                    },
                )
            });
            let reports = futures::future::join_all(runs).await;

            let mut report = PrefetchReport {
                generation,
                ..Default::default()
            };
            for r in &reports {
                report.merge(r);
            }
            report.superseded |= token.is_cancelled();

            progress.send_modify(|p| {
                if p.generation == generation {
                    p.done = true;
                }
            });

            info!(
                generation = generation,
                total = report.total,
                succeeded = report.succeeded,
                failed = report.failed,
                rate_limited = report.rate_limited,
                superseded = report.superseded,
                "Prefetch generation finished"
            );
            report
        });

        PrefetchHandle {
            generation,
            cancel,
            progress: self.progress.subscribe(),
            task,
        }
    }
}

/// Publishes settled items into the shared progress channel, ignoring
/// results that arrive after a newer generation took over.
struct Reporter {
    generation: u64,
    progress: Arc<watch::Sender<PrefetchProgress>>,
}

impl Reporter {
    fn settled(&self, ok: bool) {
        self.progress.send_modify(|p| {
            if p.generation == self.generation {
                p.completed += 1;
                if ok {
                    p.succeeded += 1;
                } else {
                    p.failed += 1;
                }
            }
        });
    }
}

async fn run_job(
    job: PrefetchJob,
    fetcher: Arc<dyn TileFetcher>,
    tile_timeout: Duration,
    cancel: CancellationToken,
    reporter: Reporter,
) -> PrefetchReport {
    let batch = rate::batch_size(&job.budget);
    let delay = rate::batch_delay(&job.budget);
    let limiter = Arc::new(SlidingWindowLimiter::for_budget(&job.budget));

    let mut report = PrefetchReport {
        generation: reporter.generation,
        total: job.items.len(),
        ..Default::default()
    };

    debug!(
        job = %job.id,
        provider = %job.provider,
        items = job.items.len(),
        batch = batch,
        delay_ms = delay.as_millis() as u64,
        "Starting prefetch job"
    );

    for (index, chunk) in job.items.chunks(batch).enumerate() {
        if index > 0 {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }
        if cancel.is_cancelled() {
            report.superseded = true;
            debug!(job = %job.id, provider = %job.provider, "Prefetch job superseded");
            break;
        }

        let mut in_flight: FuturesUnordered<_> = chunk
            .iter()
            .map(|item| {
                let fetcher = fetcher.clone();
                let limiter = limiter.clone();
                async move {
                    limiter.acquire().await;
                    let fetch = match item.max_age {
                        Some(max_age) => fetcher.fetch_within(&item.url, &item.provider, max_age),
                        None => fetcher.fetch(&item.url, &item.provider),
                    };
                    match tokio::time::timeout(tile_timeout, fetch).await {
                        Ok(result) => (item, result.map(|_| ())),
                        Err(_) => (item, Err(FetchError::Timeout(tile_timeout))),
                    }
                }
            })
            .collect();

        while let Some((item, result)) = in_flight.next().await {
            report.attempted += 1;
            reporter.settled(result.is_ok());
            match result {
                Ok(()) => report.succeeded += 1,
                Err(e) => {
                    report.failed += 1;
                    match e {
                        FetchError::RateLimited => report.rate_limited += 1,
                        FetchError::Timeout(_) => report.timed_out += 1,
                        _ => {}
                    }
                    debug!(url = %item.url, error = %e, "Prefetch item failed");
                }
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use tile_common::timeline::{FrameKind, Timeline};
    use tile_common::ProviderRegistry;

    fn frames(n: usize) -> Vec<Frame> {
        let start = Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap();
        let instants = (0..n)
            .map(|i| start + ChronoDuration::minutes(5 * i as i64))
            .collect();
        Timeline::from_instants(instants, start + ChronoDuration::hours(6))
            .frames()
            .to_vec()
    }

    #[test]
    fn test_plan_orders_newest_first() {
        let registry = ProviderRegistry::builtin();
        let provider = registry.get("nexrad").unwrap();
        let tiles = [TileCoord::new(2, 0, 0), TileCoord::new(2, 1, 0)];

        let job = PrefetchJob::plan(provider, &frames(3), &tiles, |f, t| {
            Ok(format!("{}/{}", f.index, t))
        });

        let urls: Vec<&str> = job.items.iter().map(|i| i.url.as_str()).collect();
        assert_eq!(
            urls,
            vec!["2/2/0/0", "2/2/1/0", "1/2/0/0", "1/2/1/0", "0/2/0/0", "0/2/1/0"]
        );
        assert!(job.items.iter().all(|i| i.frame.kind == FrameKind::Observed));
        assert_eq!(job.budget, provider.budget);
    }

    #[test]
    fn test_plan_drops_duplicate_urls() {
        let registry = ProviderRegistry::builtin();
        let provider = registry.get("nexrad").unwrap();
        let tiles = [TileCoord::new(1, 0, 0)];

        // Every frame resolves to the same upstream image
        let job = PrefetchJob::plan(provider, &frames(4), &tiles, |_, t| Ok(format!("latest/{}", t)));
        assert_eq!(job.len(), 1);
        assert_eq!(job.items[0].frame.index, 3);
    }

    #[test]
    fn test_plan_keeps_mutable_lifetime() {
        let registry = ProviderRegistry::builtin();
        let provider = registry.get("nexrad").unwrap();
        let tiles = [TileCoord::new(1, 0, 0)];

        let job = PrefetchJob::plan(provider, &frames(2), &tiles, |f, t| {
            Ok(if f.index == 1 {
                PlannedUrl::mutable(format!("latest/{}", t), Duration::from_secs(300))
            } else {
                PlannedUrl::from(format!("{}/{}", f.index, t))
            })
        });

        assert_eq!(job.items[0].max_age, Some(Duration::from_secs(300)));
        assert_eq!(job.items[1].max_age, None);
    }

    #[test]
    fn test_fraction_of_empty_generation() {
        let p = PrefetchProgress::default();
        assert_eq!(p.fraction(), 1.0);
    }
}
