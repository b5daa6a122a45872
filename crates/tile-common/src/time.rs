//! Time quantization and upstream timestamp encodings.
//!
//! Everything upstream of the URL builder works with `DateTime<Utc>`.
//! Provider-specific string formats only appear in [`TimestampEncoding::format`].

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// How a provider rounds an instant onto its native update boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quantization {
    /// Floor to the provider cadence (N minutes since the epoch)
    RoundDown,
    /// Floor to UTC midnight (daily products)
    DateOnly,
    /// Keep the instant, truncated to whole seconds
    None,
}

impl Quantization {
    /// Quantize `instant` under this rule.
    ///
    /// Total for every instant; `cadence_minutes` of zero is treated as one.
    pub fn apply(&self, instant: DateTime<Utc>, cadence_minutes: u32) -> DateTime<Utc> {
        let secs = instant.timestamp();
        let floored = match self {
            Quantization::RoundDown => {
                let step = i64::from(cadence_minutes.max(1)) * 60;
                secs - secs.rem_euclid(step)
            }
            Quantization::DateOnly => secs - secs.rem_euclid(86_400),
            Quantization::None => secs,
        };
        Utc.timestamp_opt(floored, 0).single().unwrap_or(instant)
    }
}

/// Upstream timestamp string formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampEncoding {
    /// `2024-01-15T12:05:00Z`
    Iso8601,
    /// `202401151205`
    Compact,
    /// `2024-01-15`
    DateOnly,
    /// `1705320300`
    UnixSeconds,
}

impl TimestampEncoding {
    pub fn format(&self, instant: &DateTime<Utc>) -> String {
        match self {
            TimestampEncoding::Iso8601 => instant.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            TimestampEncoding::Compact => instant.format("%Y%m%d%H%M").to_string(),
            TimestampEncoding::DateOnly => instant.format("%Y-%m-%d").to_string(),
            TimestampEncoding::UnixSeconds => instant.timestamp().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, h, m, s).unwrap()
    }

    #[test]
    fn test_round_down() {
        assert_eq!(Quantization::RoundDown.apply(at(12, 7, 31), 5), at(12, 5, 0));
        assert_eq!(Quantization::RoundDown.apply(at(12, 10, 0), 10), at(12, 10, 0));
        assert_eq!(Quantization::RoundDown.apply(at(12, 19, 59), 10), at(12, 10, 0));
    }

    #[test]
    fn test_date_only() {
        assert_eq!(Quantization::DateOnly.apply(at(23, 59, 59), 1440), at(0, 0, 0));
    }

    #[test]
    fn test_zero_cadence_is_total() {
        assert_eq!(Quantization::RoundDown.apply(at(12, 7, 31), 0), at(12, 7, 0));
    }

    #[test]
    fn test_encodings() {
        let t = at(12, 5, 0);
        assert_eq!(TimestampEncoding::Iso8601.format(&t), "2024-01-15T12:05:00Z");
        assert_eq!(TimestampEncoding::Compact.format(&t), "202401151205");
        assert_eq!(TimestampEncoding::DateOnly.format(&t), "2024-01-15");
        assert_eq!(TimestampEncoding::UnixSeconds.format(&t), "1705320300");
    }
}
