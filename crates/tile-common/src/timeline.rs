//! Canonical animation timeline shared by every layer.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration as StdDuration;

use crate::provider::ProviderRegistry;
use crate::time::Quantization;

/// One instant on the canonical timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Frame {
    pub instant: DateTime<Utc>,
    pub index: usize,
    pub kind: FrameKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    /// At or before the anchor instant
    Observed,
    /// Short-range forecast instant after the anchor
    Forecast,
}

/// Shape of the timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineConfig {
    /// Spacing between observed frames
    pub step_minutes: u32,
    /// Length of the observed window
    pub history_minutes: u32,
    /// Offsets after the anchor for forecast frames
    #[serde(default)]
    pub forecast_minutes: Vec<u32>,
    /// How long a built timeline stays current
    pub refresh_secs: u64,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            step_minutes: 10,
            history_minutes: 120,
            forecast_minutes: Vec::new(),
            refresh_secs: 300,
        }
    }
}

impl TimelineConfig {
    /// Step the timeline at the cadence of the highest-frequency active provider.
    pub fn for_providers<'a>(
        registry: &ProviderRegistry,
        ids: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let mut config = Self::default();
        if let Some(cadence) = registry.finest_cadence(ids) {
            config.step_minutes = cadence;
        }
        config
    }

    pub fn refresh_period(&self) -> StdDuration {
        StdDuration::from_secs(self.refresh_secs)
    }
}

/// Ordered, immutable sequence of frames, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timeline {
    frames: Vec<Frame>,
    built_at: DateTime<Utc>,
    config: TimelineConfig,
}

impl Timeline {
    /// Build the timeline anchored at `now` floored to the step.
    pub fn build(now: DateTime<Utc>, config: TimelineConfig) -> Self {
        let step = config.step_minutes.max(1);
        let anchor = Quantization::RoundDown.apply(now, step);
        let observed = config.history_minutes / step;

        let mut instants: Vec<(DateTime<Utc>, FrameKind)> = (0..=observed)
            .rev()
            .map(|i| {
                (
                    anchor - Duration::minutes(i64::from(i * step)),
                    FrameKind::Observed,
                )
            })
            .collect();

        let mut offsets: Vec<u32> = config
            .forecast_minutes
            .iter()
            .copied()
            .filter(|m| *m > 0)
            .collect();
        offsets.sort_unstable();
        offsets.dedup();
        instants.extend(
            offsets
                .into_iter()
                .map(|m| (anchor + Duration::minutes(i64::from(m)), FrameKind::Forecast)),
        );

        let frames = instants
            .into_iter()
            .enumerate()
            .map(|(index, (instant, kind))| Frame {
                instant,
                index,
                kind,
            })
            .collect();

        Self {
            frames,
            built_at: now,
            config,
        }
    }

    /// Timeline over explicit instants (sorted and deduplicated).
    pub fn from_instants(mut instants: Vec<DateTime<Utc>>, built_at: DateTime<Utc>) -> Self {
        instants.sort_unstable();
        instants.dedup();
        let frames = instants
            .into_iter()
            .enumerate()
            .map(|(index, instant)| Frame {
                instant,
                index,
                kind: if instant > built_at {
                    FrameKind::Forecast
                } else {
                    FrameKind::Observed
                },
            })
            .collect();

        Self {
            frames,
            built_at,
            config: TimelineConfig::default(),
        }
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn get(&self, index: usize) -> Option<&Frame> {
        self.frames.get(index)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    pub fn config(&self) -> &TimelineConfig {
        &self.config
    }

    /// Index of the newest observed frame, where playback normally rests.
    pub fn latest_observed_index(&self) -> Option<usize> {
        self.frames
            .iter()
            .rev()
            .find(|f| f.kind == FrameKind::Observed)
            .map(|f| f.index)
    }

    /// Whether the refresh period has elapsed since the timeline was built.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        let age = now - self.built_at;
        age >= Duration::seconds(self.config.refresh_secs as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 12, 7, 30).unwrap()
    }

    #[test]
    fn test_build_two_hour_window() {
        let timeline = Timeline::build(
            now(),
            TimelineConfig {
                step_minutes: 10,
                history_minutes: 120,
                forecast_minutes: vec![],
                refresh_secs: 300,
            },
        );

        assert_eq!(timeline.len(), 13);
        let frames = timeline.frames();
        assert_eq!(
            frames[0].instant,
            Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap()
        );
        assert_eq!(
            frames[12].instant,
            Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap()
        );
        assert!(frames.windows(2).all(|w| w[0].instant < w[1].instant));
        assert!(frames.iter().enumerate().all(|(i, f)| f.index == i));
    }

    #[test]
    fn test_forecast_frames_appended() {
        let timeline = Timeline::build(
            now(),
            TimelineConfig {
                step_minutes: 5,
                history_minutes: 30,
                forecast_minutes: vec![60, 30, 30, 0],
                refresh_secs: 300,
            },
        );

        assert_eq!(timeline.len(), 7 + 2);
        assert_eq!(timeline.latest_observed_index(), Some(6));
        let last = timeline.frames().last().unwrap();
        assert_eq!(last.kind, FrameKind::Forecast);
        assert_eq!(
            last.instant,
            Utc.with_ymd_and_hms(2024, 1, 15, 13, 5, 0).unwrap()
        );
    }

    #[test]
    fn test_step_from_registry() {
        let registry = ProviderRegistry::builtin();
        let config = TimelineConfig::for_providers(&registry, ["nexrad", "gibs"]);
        assert_eq!(config.step_minutes, 5);
    }

    #[test]
    fn test_staleness() {
        let timeline = Timeline::build(now(), TimelineConfig::default());
        assert!(!timeline.is_stale(now() + Duration::seconds(299)));
        assert!(timeline.is_stale(now() + Duration::seconds(300)));
    }
}
