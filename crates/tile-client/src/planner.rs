//! Builds prefetch jobs from the viewer's current selection.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tile_common::{
    LayerSet, ProviderRegistry, Reconciler, ResolvedTime, TileUrlBuilder, Timeline, Viewport,
};
use tracing::{debug, warn};

use crate::playback::PrefetchLauncher;
use crate::prefetch::{PlannedUrl, PrefetchJob, PrefetchScheduler};

/// Turns (layers, viewport, timeline) into one job per active provider.
#[derive(Debug, Clone)]
pub struct PrefetchPlanner {
    registry: Arc<ProviderRegistry>,
    reconciler: Reconciler,
    urls: TileUrlBuilder,
}

impl PrefetchPlanner {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self {
            reconciler: Reconciler::new(registry.clone()),
            urls: TileUrlBuilder::new(registry.clone()),
            registry,
        }
    }

    /// Route every planned URL through the edge proxy at `proxy_base`.
    pub fn with_proxy(mut self, proxy_base: impl Into<String>) -> Self {
        self.urls = self.urls.with_proxy(proxy_base);
        self
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Plan against an explicit wall clock.
    ///
    /// Instants a provider cannot have published yet are planned as that
    /// provider's latest image, and the job then fetches it once.
    pub fn plan(
        &self,
        layers: &LayerSet,
        viewport: &Viewport,
        timeline: &Timeline,
        now: DateTime<Utc>,
    ) -> Vec<PrefetchJob> {
        let mut jobs = Vec::with_capacity(layers.len());

        for id in layers.iter() {
            let provider = match self.registry.get(id) {
                Ok(provider) => provider,
                Err(e) => {
                    warn!(provider = %id, error = %e, "Active layer has no provider");
                    continue;
                }
            };

            let tiles = viewport.tiles(provider.max_zoom);
            let latest_lifetime = Duration::from_secs(u64::from(provider.cadence_minutes) * 60);
            let job = PrefetchJob::plan(provider, timeline.frames(), &tiles, |frame, tile| {
                let time = self.reconciler.resolve_or_latest(id, frame.instant, now)?;
                let url = self.urls.build(id, &time, tile)?;
                // The latest image is replaced in place every cadence
                Ok(match time {
                    ResolvedTime::Latest => PlannedUrl::mutable(url, latest_lifetime),
                    _ => PlannedUrl::from(url),
                })
            });

            debug!(
                provider = %id,
                frames = timeline.len(),
                tiles = tiles.len(),
                items = job.len(),
                "Planned prefetch job"
            );
            jobs.push(job);
        }

        jobs
    }
}

/// Launches planned jobs on a scheduler; each launch supersedes the last.
pub struct PlannedPrefetch {
    planner: PrefetchPlanner,
    scheduler: Arc<PrefetchScheduler>,
}

impl PlannedPrefetch {
    pub fn new(planner: PrefetchPlanner, scheduler: Arc<PrefetchScheduler>) -> Self {
        Self { planner, scheduler }
    }
}

impl PrefetchLauncher for PlannedPrefetch {
    fn launch(&self, layers: &LayerSet, viewport: &Viewport, timeline: &Timeline) {
        let jobs = self.planner.plan(layers, viewport, timeline, Utc::now());
        // The task keeps running after the handle is dropped
        let _ = self.scheduler.submit(jobs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tile_common::{BoundingBox, TimelineConfig};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 12, 3, 0).unwrap()
    }

    fn viewport() -> Viewport {
        Viewport::new(BoundingBox::new(-100.0, 30.0, -90.0, 40.0), 5)
    }

    #[test]
    fn test_one_job_per_active_layer() {
        let planner = PrefetchPlanner::new(Arc::new(ProviderRegistry::builtin()));
        let layers = LayerSet::new(["nexrad", "gibs", "unknown"]);
        let timeline = Timeline::build(now(), TimelineConfig::default());

        let jobs = planner.plan(&layers, &viewport(), &timeline, now());
        let providers: Vec<&str> = jobs.iter().map(|j| j.provider.as_str()).collect();
        assert_eq!(providers, vec!["gibs", "nexrad"]);

        let nexrad = &jobs[1];
        let tiles = viewport().tiles(12).len();
        assert_eq!(nexrad.len(), timeline.len() * tiles);
        assert_eq!(nexrad.items[0].frame.index, timeline.len() - 1);

        // Every frame of the two hour window falls on the same day
        let gibs = &jobs[0];
        assert_eq!(gibs.len(), tiles);
    }

    #[test]
    fn test_proxy_routing() {
        let planner = PrefetchPlanner::new(Arc::new(ProviderRegistry::builtin()))
            .with_proxy("http://edge.local");
        let timeline = Timeline::build(now(), TimelineConfig::default());

        let jobs = planner.plan(&LayerSet::new(["rainviewer"]), &viewport(), &timeline, now());
        assert!(jobs[0]
            .items
            .iter()
            .all(|i| i.url.starts_with("http://edge.local/rainviewer/")));
    }

    #[test]
    fn test_future_frames_collapse_to_latest() {
        let planner = PrefetchPlanner::new(Arc::new(ProviderRegistry::builtin()));
        let timeline = Timeline::build(
            now(),
            TimelineConfig {
                forecast_minutes: vec![60, 120, 180],
                ..TimelineConfig::default()
            },
        );
        let vp = Viewport::new(BoundingBox::new(-95.0, 35.0, -94.9, 35.1), 3);

        let jobs = planner.plan(&LayerSet::new(["nexrad"]), &vp, &timeline, now());
        let latest: Vec<_> = jobs[0]
            .items
            .iter()
            .filter(|i| i.url.contains("USCOMP-N0Q-0/"))
            .collect();
        assert_eq!(latest.len(), vp.tiles(12).len());
        assert_eq!(latest[0].frame.instant, timeline.frames().last().unwrap().instant);

        // Only the in-place latest image expires after one cadence
        let five_minutes = Some(Duration::from_secs(300));
        assert!(latest.iter().all(|i| i.max_age == five_minutes));
        assert!(jobs[0]
            .items
            .iter()
            .filter(|i| !i.url.contains("USCOMP-N0Q-0/"))
            .all(|i| i.max_age.is_none()));
    }
}
