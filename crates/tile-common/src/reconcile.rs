//! Maps canonical instants onto each provider's upstream timestamps.
//!
//! Resolution is a closed-form transform over the provider descriptor, so a
//! whole prefetch job can be planned without a discovery request per frame.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::provider::{ProviderDescriptor, ProviderRegistry};
use crate::TileResult;

/// Outcome of resolving one canonical instant for one provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "instant", rename_all = "snake_case")]
pub enum ResolvedTime {
    /// Quantized upstream instant
    Timestamp(DateTime<Utc>),
    /// The provider's newest image
    Latest,
    /// The instant cannot have been published yet
    Unavailable,
}

impl ResolvedTime {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, ResolvedTime::Unavailable)
    }
}

/// Resolve an instant against a single descriptor.
pub fn resolve_for(
    provider: &ProviderDescriptor,
    instant: DateTime<Utc>,
    now: DateTime<Utc>,
) -> ResolvedTime {
    let tolerance = Duration::minutes(i64::from(provider.latency_tolerance_minutes));
    if instant - now > tolerance {
        return ResolvedTime::Unavailable;
    }

    ResolvedTime::Timestamp(
        provider
            .quantization
            .apply(instant, provider.cadence_minutes),
    )
}

/// Per-provider timestamp reconciliation.
#[derive(Debug, Clone)]
pub struct Reconciler {
    registry: Arc<ProviderRegistry>,
}

impl Reconciler {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Resolve against the system clock.
    pub fn resolve(&self, provider_id: &str, instant: DateTime<Utc>) -> TileResult<ResolvedTime> {
        self.resolve_at(provider_id, instant, Utc::now())
    }

    /// Resolve against an explicit wall clock.
    pub fn resolve_at(
        &self,
        provider_id: &str,
        instant: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> TileResult<ResolvedTime> {
        let provider = self.registry.get(provider_id)?;
        Ok(resolve_for(provider, instant, now))
    }

    /// Resolve, substituting `Latest` for instants that are not yet published.
    ///
    /// This is the single policy used when planning frames: a frame is never
    /// dropped for one layer while other layers still render it.
    pub fn resolve_or_latest(
        &self,
        provider_id: &str,
        instant: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> TileResult<ResolvedTime> {
        Ok(match self.resolve_at(provider_id, instant, now)? {
            ResolvedTime::Unavailable => ResolvedTime::Latest,
            resolved => resolved,
        })
    }
}
