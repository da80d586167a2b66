// =============================================================================
// Runtime Configuration — subscription and dashboard settings
// =============================================================================
//
// Loaded once at startup from `stockwatch.json`; defaults apply when the file
// or individual fields are absent. Every field carries `#[serde(default)]` so
// that adding new fields never breaks loading an older config file.
// Credentials never live here — they come from the environment.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_exchange() -> String {
    "MOEX".to_string()
}

fn default_timeframe_secs() -> u32 {
    300 // 5-minute bars
}

fn default_history_days() -> i64 {
    2
}

fn default_throttle_frequency() -> u64 {
    1_000_000_000
}

fn default_bind_addr() -> String {
    "127.0.0.1:3001".to_string()
}

fn default_log_timezone() -> String {
    "Europe/Moscow".to_string()
}

// =============================================================================
// RuntimeConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Exchange code passed to the bar subscription.
    #[serde(default = "default_exchange")]
    pub exchange: String,

    /// Bar timeframe in seconds.
    #[serde(default = "default_timeframe_secs")]
    pub timeframe_secs: u32,

    /// How many days of historical bars the subscription replays on start.
    #[serde(default = "default_history_days")]
    pub history_days: i64,

    /// Server-side push throttle in nanoseconds.
    #[serde(default = "default_throttle_frequency")]
    pub throttle_frequency: u64,

    /// Dashboard bind address.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// IANA timezone name used for log timestamps.
    #[serde(default = "default_log_timezone")]
    pub log_timezone: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            exchange: default_exchange(),
            timeframe_secs: default_timeframe_secs(),
            history_days: default_history_days(),
            throttle_frequency: default_throttle_frequency(),
            bind_addr: default_bind_addr(),
            log_timezone: default_log_timezone(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(
            path = %path.display(),
            exchange = %config.exchange,
            timeframe_secs = config.timeframe_secs,
            "config loaded"
        );

        Ok(config)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.exchange, "MOEX");
        assert_eq!(cfg.timeframe_secs, 300);
        assert_eq!(cfg.history_days, 2);
        assert_eq!(cfg.throttle_frequency, 1_000_000_000);
        assert_eq!(cfg.bind_addr, "127.0.0.1:3001");
        assert_eq!(cfg.log_timezone, "Europe/Moscow");
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.exchange, "MOEX");
        assert_eq!(cfg.timeframe_secs, 300);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "timeframe_secs": 60, "bind_addr": "0.0.0.0:8080" }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.timeframe_secs, 60);
        assert_eq!(cfg.bind_addr, "0.0.0.0:8080");
        assert_eq!(cfg.exchange, "MOEX");
        assert_eq!(cfg.history_days, 2);
    }
}
