//! Upstream tile URL construction.
//!
//! Output is a pure function of (provider, resolved time, tile). Both cache
//! tiers key on the returned string, so formatting must never vary.

use std::sync::Arc;

use crate::provider::{ProviderDescriptor, ProviderRegistry, TileScheme};
use crate::reconcile::ResolvedTime;
use crate::{TileCoord, TileError, TileResult};

/// Build the upstream URL for one tile of one provider.
pub fn build_url(
    provider: &ProviderDescriptor,
    time: &ResolvedTime,
    tile: TileCoord,
) -> TileResult<String> {
    tile.validate()?;
    if tile.z > provider.max_zoom {
        return Err(TileError::ZoomOutOfRange {
            provider: provider.id.clone(),
            zoom: tile.z,
            max_zoom: provider.max_zoom,
        });
    }

    let time_value = match time {
        ResolvedTime::Timestamp(instant) => provider.encoding.format(instant),
        ResolvedTime::Latest => provider.latest_token.clone(),
        ResolvedTime::Unavailable => {
            return Err(TileError::NotYetPublished {
                provider: provider.id.clone(),
                instant: "unavailable".to_string(),
            })
        }
    };

    let path = match provider.scheme {
        TileScheme::Xyz => provider
            .url_template
            .replace("{z}", &tile.z.to_string())
            .replace("{x}", &tile.x.to_string())
            .replace("{y}", &tile.y.to_string())
            .replace("{time}", &time_value),
        TileScheme::Wms => provider
            .url_template
            .replace("{bbox}", &tile.mercator_bounds().to_wms_string())
            .replace("{time}", &time_value),
    };

    Ok(format!("{}{}", provider.origin.trim_end_matches('/'), path))
}

/// Rewrite an upstream URL into its edge-proxy form:
/// `{proxy_base}/{provider}/{path}?{query}`.
pub fn proxied_url(proxy_base: &str, provider: &ProviderDescriptor, upstream: &str) -> String {
    let origin = provider.origin.trim_end_matches('/');
    let rest = upstream.strip_prefix(origin).unwrap_or(upstream);
    format!(
        "{}/{}/{}",
        proxy_base.trim_end_matches('/'),
        provider.id,
        rest.trim_start_matches('/')
    )
}

/// Registry-backed builder, optionally routing through an edge proxy.
#[derive(Debug, Clone)]
pub struct TileUrlBuilder {
    registry: Arc<ProviderRegistry>,
    proxy_base: Option<String>,
}

impl TileUrlBuilder {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self {
            registry,
            proxy_base: None,
        }
    }

    /// Route every built URL through the edge proxy at `proxy_base`.
    pub fn with_proxy(mut self, proxy_base: impl Into<String>) -> Self {
        self.proxy_base = Some(proxy_base.into());
        self
    }

    pub fn build(
        &self,
        provider_id: &str,
        time: &ResolvedTime,
        tile: TileCoord,
    ) -> TileResult<String> {
        let provider = self.registry.get(provider_id)?;
        let upstream = build_url(provider, time, tile)?;
        Ok(match &self.proxy_base {
            Some(base) => proxied_url(base, provider, &upstream),
            None => upstream,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn builder() -> TileUrlBuilder {
        TileUrlBuilder::new(Arc::new(ProviderRegistry::builtin()))
    }

    fn ts() -> ResolvedTime {
        ResolvedTime::Timestamp(Utc.with_ymd_and_hms(2024, 1, 15, 12, 5, 0).unwrap())
    }

    #[test]
    fn test_xyz_compact() {
        let url = builder().build("nexrad", &ts(), TileCoord::new(5, 7, 12)).unwrap();
        assert_eq!(
            url,
            "https://mesonet.agron.iastate.edu/cache/tile.py/1.0.0/ridge::USCOMP-N0Q-202401151205/5/7/12.png"
        );
    }

    #[test]
    fn test_latest_token() {
        let url = builder()
            .build("nexrad", &ResolvedTime::Latest, TileCoord::new(0, 0, 0))
            .unwrap();
        assert!(url.contains("USCOMP-N0Q-0/0/0/0.png"));
    }

    #[test]
    fn test_wms_bbox() {
        let url = builder().build("mrms", &ts(), TileCoord::new(1, 1, 0)).unwrap();
        assert!(url.contains("BBOX=0.000000,0.000000,20037508.342789,20037508.342789"));
        assert!(url.contains("TIME=2024-01-15T12:05:00Z"));
    }

    #[test]
    fn test_zoom_and_validity_rejected() {
        let b = builder();
        assert!(matches!(
            b.build("rainviewer", &ts(), TileCoord::new(8, 0, 0)),
            Err(TileError::ZoomOutOfRange { .. })
        ));
        assert!(matches!(
            b.build("nexrad", &ts(), TileCoord::new(1, 2, 0)),
            Err(TileError::InvalidTile { .. })
        ));
        assert!(matches!(
            b.build("nexrad", &ResolvedTime::Unavailable, TileCoord::new(1, 0, 0)),
            Err(TileError::NotYetPublished { .. })
        ));
    }

    #[test]
    fn test_proxied() {
        let url = builder()
            .with_proxy("http://localhost:8787/")
            .build("mrms", &ts(), TileCoord::new(0, 0, 0))
            .unwrap();
        assert!(url.starts_with(
            "http://localhost:8787/mrms/geoserver/conus/conus_bref_qcd/ows?SERVICE=WMS"
        ));
    }
}
