//! Runtime settings for the proxy.

use std::time::Duration;

/// Proxy settings assembled from the command line and environment.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Origins allowed to read responses cross-origin
    pub allowed_origins: Vec<String>,
    /// Edge cache capacity in megabytes
    pub cache_size_mb: usize,
    /// Upper bound on a single upstream request
    pub upstream_timeout: Duration,
    pub user_agent: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            allowed_origins: Vec::new(),
            cache_size_mb: 256,
            upstream_timeout: Duration::from_secs(15),
            user_agent: default_user_agent(),
        }
    }
}

pub fn default_user_agent() -> String {
    format!(
        "weather-tiles-edge-proxy/{} (+https://github.com/yourorg/weather-tiles)",
        env!("CARGO_PKG_VERSION")
    )
}

/// Split a comma-separated origin list, dropping blanks and trailing slashes.
pub fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().trim_end_matches('/'))
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
