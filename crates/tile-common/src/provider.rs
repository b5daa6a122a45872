//! Provider registry: static description of each upstream imagery source.
//!
//! Loaded from `config/providers.yaml` when present, otherwise the built-in
//! table below is used.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::time::{Quantization, TimestampEncoding};
use crate::{TileError, TileResult};

/// How tiles are addressed upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TileScheme {
    /// `{z}/{x}/{y}` gridded raster tiles
    Xyz,
    /// WMS GetMap keyed by a `{bbox}` placeholder
    Wms,
}

/// Maximum request rate an upstream tolerates from one caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestBudget {
    /// Maximum concurrent requests
    pub max_in_flight: usize,
    /// Maximum requests per rolling 60 second window
    pub per_minute: u32,
}

impl Default for RequestBudget {
    fn default() -> Self {
        Self {
            max_in_flight: 6,
            per_minute: 300,
        }
    }
}

/// Static description of one upstream provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Scheme and host, e.g. `https://mesonet.agron.iastate.edu`
    pub origin: String,
    /// Path and query template appended to the origin
    pub url_template: String,
    #[serde(default = "default_scheme")]
    pub scheme: TileScheme,
    /// Native update cadence in minutes
    pub cadence_minutes: u32,
    pub quantization: Quantization,
    pub encoding: TimestampEncoding,
    /// Value substituted for `{time}` when the latest image is wanted
    #[serde(default = "default_latest_token")]
    pub latest_token: String,
    #[serde(default = "default_max_zoom")]
    pub max_zoom: u32,
    #[serde(default)]
    pub budget: RequestBudget,
    /// How far past wall clock an instant may be before it is "not yet published"
    #[serde(default = "default_latency_tolerance")]
    pub latency_tolerance_minutes: u32,
    /// Edge cache lifetime for successful responses
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
}

fn default_scheme() -> TileScheme {
    TileScheme::Xyz
}

fn default_latest_token() -> String {
    "latest".to_string()
}

fn default_max_zoom() -> u32 {
    18
}

fn default_latency_tolerance() -> u32 {
    20
}

fn default_cache_ttl() -> u64 {
    300
}

impl ProviderDescriptor {
    /// Upstream host without scheme, used for logging.
    pub fn host(&self) -> &str {
        self.origin
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.origin)
            .trim_end_matches('/')
    }

    fn validate(&self) -> TileResult<()> {
        if self.id.is_empty() || self.id.contains('/') {
            return Err(TileError::ConfigError(format!(
                "provider id '{}' must be a non-empty path segment",
                self.id
            )));
        }
        if !(self.origin.starts_with("http://") || self.origin.starts_with("https://")) {
            return Err(TileError::ConfigError(format!(
                "provider '{}' origin must be an http(s) URL",
                self.id
            )));
        }
        if !self.url_template.starts_with('/') {
            return Err(TileError::ConfigError(format!(
                "provider '{}' url_template must start with '/'",
                self.id
            )));
        }
        let needs = match self.scheme {
            TileScheme::Xyz => &["{z}", "{x}", "{y}"][..],
            TileScheme::Wms => &["{bbox}"][..],
        };
        for placeholder in needs {
            if !self.url_template.contains(placeholder) {
                return Err(TileError::ConfigError(format!(
                    "provider '{}' url_template is missing {}",
                    self.id, placeholder
                )));
            }
        }
        if self.budget.max_in_flight == 0 || self.budget.per_minute == 0 {
            return Err(TileError::ConfigError(format!(
                "provider '{}' request budget must be non-zero",
                self.id
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    providers: Vec<ProviderDescriptor>,
}

/// Lookup table of providers by id.
#[derive(Debug, Clone)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<ProviderDescriptor>>,
}

impl ProviderRegistry {
    /// Build a registry, rejecting duplicate or malformed entries.
    pub fn new(providers: Vec<ProviderDescriptor>) -> TileResult<Self> {
        let mut map = BTreeMap::new();
        for provider in providers {
            provider.validate()?;
            let id = provider.id.clone();
            if map.insert(id.clone(), Arc::new(provider)).is_some() {
                return Err(TileError::ConfigError(format!("duplicate provider id '{}'", id)));
            }
        }
        Ok(Self { providers: map })
    }

    /// Parse a registry from YAML text.
    pub fn from_yaml(content: &str) -> TileResult<Self> {
        let file: RegistryFile = serde_yaml::from_str(content)?;
        Self::new(file.providers)
    }

    /// Load from a YAML file, falling back to the built-in table if the file is missing.
    pub fn load_or_default(path: &Path) -> TileResult<Self> {
        if !path.exists() {
            warn!(path = %path.display(), "Provider config not found, using built-in providers");
            return Ok(Self::builtin());
        }

        let content = std::fs::read_to_string(path)?;
        let registry = Self::from_yaml(&content)?;
        info!(
            path = %path.display(),
            count = registry.len(),
            "Loaded provider registry"
        );
        Ok(registry)
    }

    pub fn get(&self, id: &str) -> TileResult<&Arc<ProviderDescriptor>> {
        self.providers
            .get(id)
            .ok_or_else(|| TileError::UnknownProvider(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.providers.contains_key(id)
    }

    /// Provider ids in sorted order.
    pub fn ids(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ProviderDescriptor>> {
        self.providers.values()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Shortest sub-daily cadence among the given providers.
    ///
    /// Daily products do not drive the animation step.
    pub fn finest_cadence<'a>(&self, ids: impl IntoIterator<Item = &'a str>) -> Option<u32> {
        let cadence = ids
            .into_iter()
            .filter_map(|id| self.providers.get(id))
            .filter(|p| p.quantization != Quantization::DateOnly)
            .map(|p| p.cadence_minutes.max(1))
            .min();
        debug!(?cadence, "Computed finest provider cadence");
        cadence
    }

    /// Providers shipped with the service.
    pub fn builtin() -> Self {
        let providers = vec![
            ProviderDescriptor {
                id: "nexrad".to_string(),
                name: "IEM NEXRAD base reflectivity composite".to_string(),
                origin: "https://mesonet.agron.iastate.edu".to_string(),
                url_template: "/cache/tile.py/1.0.0/ridge::USCOMP-N0Q-{time}/{z}/{x}/{y}.png"
                    .to_string(),
                scheme: TileScheme::Xyz,
                cadence_minutes: 5,
                quantization: Quantization::RoundDown,
                encoding: TimestampEncoding::Compact,
                latest_token: "0".to_string(),
                max_zoom: 12,
                budget: RequestBudget {
                    max_in_flight: 6,
                    per_minute: 300,
                },
                latency_tolerance_minutes: 20,
                cache_ttl_secs: 300,
            },
            ProviderDescriptor {
                id: "rainviewer".to_string(),
                name: "RainViewer global radar".to_string(),
                origin: "https://tilecache.rainviewer.com".to_string(),
                url_template: "/v2/radar/{time}/256/{z}/{x}/{y}/2/1_1.png".to_string(),
                scheme: TileScheme::Xyz,
                cadence_minutes: 10,
                quantization: Quantization::RoundDown,
                encoding: TimestampEncoding::UnixSeconds,
                latest_token: "nowcast_0".to_string(),
                max_zoom: 7,
                budget: RequestBudget {
                    max_in_flight: 4,
                    per_minute: 100,
                },
                latency_tolerance_minutes: 20,
                cache_ttl_secs: 600,
            },
            ProviderDescriptor {
                id: "mrms".to_string(),
                name: "NOAA MRMS reflectivity (WMS)".to_string(),
                origin: "https://opengeo.ncep.noaa.gov".to_string(),
                url_template: "/geoserver/conus/conus_bref_qcd/ows?SERVICE=WMS&VERSION=1.3.0&REQUEST=GetMap&LAYERS=conus_bref_qcd&STYLES=&FORMAT=image/png&TRANSPARENT=true&CRS=EPSG:3857&WIDTH=256&HEIGHT=256&BBOX={bbox}&TIME={time}".to_string(),
                scheme: TileScheme::Wms,
                cadence_minutes: 10,
                quantization: Quantization::RoundDown,
                encoding: TimestampEncoding::Iso8601,
                latest_token: "current".to_string(),
                max_zoom: 10,
                budget: RequestBudget {
                    max_in_flight: 4,
                    per_minute: 120,
                },
                latency_tolerance_minutes: 20,
                cache_ttl_secs: 300,
            },
            ProviderDescriptor {
                id: "gibs".to_string(),
                name: "NASA GIBS MODIS true color".to_string(),
                origin: "https://gibs.earthdata.nasa.gov".to_string(),
                url_template: "/wmts/epsg3857/best/MODIS_Terra_CorrectedReflectance_TrueColor/default/{time}/GoogleMapsCompatible_Level9/{z}/{y}/{x}.jpg".to_string(),
                scheme: TileScheme::Xyz,
                cadence_minutes: 1440,
                quantization: Quantization::DateOnly,
                encoding: TimestampEncoding::DateOnly,
                latest_token: "default".to_string(),
                max_zoom: 9,
                budget: RequestBudget {
                    max_in_flight: 8,
                    per_minute: 600,
                },
                latency_tolerance_minutes: 1440,
                cache_ttl_secs: 86_400,
            },
        ];

        Self {
            providers: providers
                .into_iter()
                .map(|p| (p.id.clone(), Arc::new(p)))
                .collect(),
        }
    }
}
