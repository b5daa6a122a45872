//! Error types shared by the tile delivery crates.

use thiserror::Error;

/// Result type alias using TileError.
pub type TileResult<T> = Result<T, TileError>;

/// Primary error type for tile planning and delivery.
#[derive(Debug, Error)]
pub enum TileError {
    // === Planning Errors ===
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Invalid tile {z}/{x}/{y}: column and row must be below 2^z")]
    InvalidTile { z: u32, x: u32, y: u32 },

    #[error("Zoom {zoom} exceeds max zoom {max_zoom} for provider '{provider}'")]
    ZoomOutOfRange {
        provider: String,
        zoom: u32,
        max_zoom: u32,
    },

    #[error("Instant {instant} is not yet published by provider '{provider}'")]
    NotYetPublished { provider: String, instant: String },

    // === Delivery Errors ===
    #[error("Upstream returned HTTP {status}")]
    UpstreamError { status: u16 },

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Rate limit exceeded by upstream")]
    RateLimitExceeded,

    #[error("Request timeout")]
    Timeout,

    // === Infrastructure Errors ===
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl TileError {
    /// Get the HTTP status code for this error.
    pub fn http_status_code(&self) -> u16 {
        match self {
            TileError::InvalidTile { .. } | TileError::ZoomOutOfRange { .. } => 400,

            TileError::UnknownProvider(_) | TileError::NotYetPublished { .. } => 404,

            TileError::UpstreamError { status } => *status,
            TileError::RateLimitExceeded => 429,
            TileError::NetworkError(_) => 502,
            TileError::Timeout => 504,

            _ => 500,
        }
    }
}

impl From<serde_yaml::Error> for TileError {
    fn from(err: serde_yaml::Error) -> Self {
        TileError::ConfigError(format!("YAML error: {}", err))
    }
}

impl From<std::io::Error> for TileError {
    fn from(err: std::io::Error) -> Self {
        TileError::ConfigError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(TileError::UnknownProvider("x".into()).http_status_code(), 404);
        assert_eq!(TileError::UpstreamError { status: 503 }.http_status_code(), 503);
        assert_eq!(TileError::RateLimitExceeded.http_status_code(), 429);
        assert_eq!(TileError::Timeout.http_status_code(), 504);
    }
}
