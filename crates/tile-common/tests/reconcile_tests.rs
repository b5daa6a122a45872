//! Property-style tests for timestamp reconciliation and URL building.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use tile_common::{
    ProviderRegistry, Reconciler, ResolvedTime, TileCoord, TileUrlBuilder, Timeline,
    TimelineConfig,
};

fn registry() -> Arc<ProviderRegistry> {
    Arc::new(ProviderRegistry::builtin())
}

fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 18, 0, 0).unwrap()
}

// ============================================================================
// Determinism
// ============================================================================

#[test]
fn test_resolve_is_deterministic_for_every_provider() {
    let reconciler = Reconciler::new(registry());
    let now = base();

    for id in registry().ids() {
        for minutes in (-180..=60).step_by(7) {
            let instant = now + Duration::minutes(minutes) + Duration::seconds(13);
            let first = reconciler.resolve_at(&id, instant, now).unwrap();

            // Interleave unrelated calls to prove there is no hidden state
            let _ = reconciler.resolve_at("nexrad", now, now).unwrap();
            let _ = reconciler.resolve_at("gibs", now - Duration::days(3), now).unwrap();

            let second = reconciler.resolve_at(&id, instant, now).unwrap();
            assert_eq!(first, second, "provider {} instant {}", id, instant);
        }
    }
}

// ============================================================================
// Quantization law
// ============================================================================

#[test]
fn test_same_bucket_same_timestamp() {
    let reconciler = Reconciler::new(registry());
    let now = base();

    // nexrad: 5 minute cadence, rainviewer and mrms: 10 minute cadence
    for (id, cadence) in [("nexrad", 5i64), ("rainviewer", 10), ("mrms", 10)] {
        let bucket_start = Utc.with_ymd_and_hms(2024, 6, 1, 17, 0, 0).unwrap();
        let expected = reconciler.resolve_at(id, bucket_start, now).unwrap();
        assert_eq!(expected, ResolvedTime::Timestamp(bucket_start));

        for secs in 0..(cadence * 60) {
            let instant = bucket_start + Duration::seconds(secs);
            assert_eq!(
                reconciler.resolve_at(id, instant, now).unwrap(),
                expected,
                "{} at +{}s",
                id,
                secs
            );
        }

        let next_bucket = bucket_start + Duration::minutes(cadence);
        assert_ne!(reconciler.resolve_at(id, next_bucket, now).unwrap(), expected);
    }
}

#[test]
fn test_daily_provider_buckets_by_date() {
    let reconciler = Reconciler::new(registry());
    let now = base();
    let morning = Utc.with_ymd_and_hms(2024, 5, 30, 1, 0, 0).unwrap();
    let evening = Utc.with_ymd_and_hms(2024, 5, 30, 23, 59, 0).unwrap();

    assert_eq!(
        reconciler.resolve_at("gibs", morning, now).unwrap(),
        reconciler.resolve_at("gibs", evening, now).unwrap()
    );
}

// ============================================================================
// Scenario: future instant
// ============================================================================

#[test]
fn test_two_hours_ahead_is_unavailable() {
    let reconciler = Reconciler::new(registry());
    let now = base();

    // nexrad has a 20 minute latency tolerance
    assert_eq!(
        reconciler
            .resolve_at("nexrad", now + Duration::hours(2), now)
            .unwrap(),
        ResolvedTime::Unavailable
    );
}

// ============================================================================
// URL stability across a timeline
// ============================================================================

#[test]
fn test_timeline_urls_are_stable_and_distinct() {
    let registry = registry();
    let reconciler = Reconciler::new(registry.clone());
    let builder = TileUrlBuilder::new(registry.clone());
    let now = base() + Duration::seconds(42);
    let timeline = Timeline::build(now, TimelineConfig::for_providers(&registry, ["nexrad"]));
    let tile = TileCoord::new(6, 15, 24);

    let urls: Vec<String> = timeline
        .frames()
        .iter()
        .map(|f| {
            let time = reconciler.resolve_or_latest("nexrad", f.instant, now).unwrap();
            builder.build("nexrad", &time, tile).unwrap()
        })
        .collect();

    let again: Vec<String> = timeline
        .frames()
        .iter()
        .map(|f| {
            let time = reconciler.resolve_or_latest("nexrad", f.instant, now).unwrap();
            builder.build("nexrad", &time, tile).unwrap()
        })
        .collect();

    assert_eq!(urls, again);

    let mut unique = urls.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), timeline.len());
}
