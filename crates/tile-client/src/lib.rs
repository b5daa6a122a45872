//! Client side of the weather tile subsystem.
//!
//! Turns an active layer set, a viewport and the canonical timeline into
//! rate-limited prefetch jobs, and drives the animation loop that consumes
//! them.

pub mod fetcher;
pub mod planner;
pub mod playback;
pub mod prefetch;
pub mod rate;

pub use fetcher::{CachedFetcher, FetchError, HttpTileFetcher, TileFetcher};
pub use planner::{PlannedPrefetch, PrefetchPlanner};
pub use playback::{
    FetchTrigger, PlaybackConfig, PlaybackEngine, PlaybackError, PlaybackHandle, PlaybackState,
    PlaybackStatus, PrefetchLauncher, TriggerReason,
};
pub use prefetch::{
    PlannedUrl, PrefetchHandle, PrefetchItem, PrefetchJob, PrefetchProgress, PrefetchReport,
    PrefetchScheduler, SchedulerConfig,
};
pub use rate::SlidingWindowLimiter;
