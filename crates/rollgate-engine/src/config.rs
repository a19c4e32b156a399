//! Engine tuning knobs.

use serde::{Deserialize, Serialize};

/// Maximum number of floors returned in a single response.
pub const DEFAULT_MAX_FLOORS_PER_RESPONSE: usize = 5;

/// Window in which identical milestone activity entries are collapsed.
pub const DEFAULT_ACTIVITY_DEDUPE_WINDOW_SECS: u64 = 24 * 60 * 60;

/// `max_updates_per_period` at or above this value means "no limit".
pub const UNLIMITED_UPDATES_PER_PERIOD: u32 = 1_000_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_floors_per_response: usize,
    pub activity_dedupe_window_secs: u64,
    /// Upper bound for a single check-in, applied by callers that wrap
    /// engine calls in `tokio::time::timeout`.
    pub request_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_floors_per_response: DEFAULT_MAX_FLOORS_PER_RESPONSE,
            activity_dedupe_window_secs: DEFAULT_ACTIVITY_DEDUPE_WINDOW_SECS,
            request_timeout_secs: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_fills_defaults() {
        let cfg: EngineConfig = serde_json::from_str(r#"{"max_floors_per_response": 2}"#).unwrap();
        assert_eq!(cfg.max_floors_per_response, 2);
        assert_eq!(cfg.activity_dedupe_window_secs, DEFAULT_ACTIVITY_DEDUPE_WINDOW_SECS);
        assert_eq!(cfg.request_timeout_secs, 10);
    }
}
