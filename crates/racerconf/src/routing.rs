//! Routing and polling behaviour.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lower bound for the poll interval. Anything faster is clamped.
pub const MIN_POLL_INTERVAL_MS: u64 = 250;
/// Upper bound for the poll interval.
pub const MAX_POLL_INTERVAL_MS: u64 = 60 * 1000;

/// Polling cadence against the matrix API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollingConfig {
    /// Milliseconds between transient polls.
    /// Default: 1000
    #[serde(default = "PollingConfig::default_interval_ms")]
    pub interval_ms: u64,
}

impl PollingConfig {
    fn default_interval_ms() -> u64 {
        1000
    }

    /// Poll interval, clamped to the supported range.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(
            self.interval_ms
                .clamp(MIN_POLL_INTERVAL_MS, MAX_POLL_INTERVAL_MS),
        )
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: Self::default_interval_ms(),
        }
    }
}

/// Operator-facing routing behaviour.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RoutingConfig {
    /// Stage routes until an explicit take.
    #[serde(default)]
    pub take: bool,

    /// Comma-separated protocol substrings to hide, e.g. "MADI,IP,GPI,GPO".
    #[serde(default)]
    pub proto_filter: String,
}

impl RoutingConfig {
    /// Normalized filter entries: upper-cased, trimmed, empties dropped.
    pub fn proto_filter_set(&self) -> Vec<String> {
        let mut entries: Vec<String> = self
            .proto_filter
            .split(',')
            .map(|p| p.trim().to_uppercase())
            .filter(|p| !p.is_empty())
            .collect();
        entries.sort();
        entries.dedup();
        entries
    }
}
