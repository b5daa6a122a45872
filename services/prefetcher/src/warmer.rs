//! One warm-up cycle: rebuild the timeline, prefetch every frame, purge old tiles.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use storage::LocalCache;
use tile_client::{PrefetchPlanner, PrefetchReport, PrefetchScheduler};
use tile_common::{LayerSet, ProviderRegistry, Timeline, TimelineConfig, Viewport};
use tokio::sync::broadcast;
use tracing::{info, warn};

/// What to keep warm.
#[derive(Debug, Clone)]
pub struct WarmTarget {
    pub layers: LayerSet,
    pub viewport: Viewport,
    pub refresh: Duration,
}

pub struct Warmer {
    registry: Arc<ProviderRegistry>,
    planner: PrefetchPlanner,
    scheduler: PrefetchScheduler,
    cache: LocalCache,
    target: WarmTarget,
}

impl Warmer {
    pub fn new(
        planner: PrefetchPlanner,
        scheduler: PrefetchScheduler,
        cache: LocalCache,
        target: WarmTarget,
    ) -> Self {
        Self {
            registry: planner.registry().clone(),
            planner,
            scheduler,
            cache,
            target,
        }
    }

    pub fn timeline(&self, now: DateTime<Utc>) -> Timeline {
        let ids = self.target.layers.iter();
        let config = TimelineConfig {
            refresh_secs: self.target.refresh.as_secs(),
            ..TimelineConfig::for_providers(&self.registry, ids)
        };
        Timeline::build(now, config)
    }

    /// Prefetch the timeline anchored at `now` and wait for it to settle.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<PrefetchReport> {
        let timeline = self.timeline(now);
        let jobs = self
            .planner
            .plan(&self.target.layers, &self.target.viewport, &timeline, now);

        info!(
            frames = timeline.len(),
            jobs = jobs.len(),
            items = jobs.iter().map(|j| j.len()).sum::<usize>(),
            "Starting warm-up cycle"
        );

        let report = self.scheduler.submit(jobs).wait().await;
        self.log_report(&report);
        self.purge().await;

        Ok(report)
    }

    /// Repeat cycles every refresh period until shutdown.
    ///
    /// A shutdown during a cycle cancels it; tiles already stored are kept.
    pub async fn run_forever(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        loop {
            tokio::select! {
                result = self.run_once(Utc::now()) => {
                    result?;
                }
                _ = shutdown.recv() => {
                    self.scheduler.cancel_current();
                    info!("Shutting down mid-cycle");
                    break;
                }
            }

            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Shutting down warmer");
                    break;
                }
                _ = tokio::time::sleep(self.target.refresh) => {}
            }
        }

        Ok(())
    }

    fn log_report(&self, report: &PrefetchReport) {
        if report.failed > 0 {
            warn!(
                generation = report.generation,
                total = report.total,
                succeeded = report.succeeded,
                failed = report.failed,
                rate_limited = report.rate_limited,
                timed_out = report.timed_out,
                "Warm-up cycle finished with failures"
            );
        } else {
            info!(
                generation = report.generation,
                total = report.total,
                succeeded = report.succeeded,
                "Warm-up cycle complete"
            );
        }
    }

    async fn purge(&self) {
        match self.cache.purge_older_than(self.cache.max_age()).await {
            Ok(removed) if removed > 0 => info!(removed = removed, "Purged expired tiles"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to purge expired tiles"),
        }

        if let Ok(stats) = self.cache.stats().await {
            info!(
                tiles = stats.count,
                total_bytes = stats.total_bytes,
                "Local cache size"
            );
        }
    }
}
