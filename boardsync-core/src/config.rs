/// Sync tuning shared by every front end.
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSettings {
    /// A write not answered within this many milliseconds is reverted.
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    /// Neighbouring positions closer than this trigger a renumber warning.
    #[serde(default = "default_min_position_gap")]
    pub min_position_gap: f64,
}

fn default_write_timeout_ms() -> u64 {
    10_000
}

fn default_min_position_gap() -> f64 {
    1e-9
}

impl SyncSettings {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            write_timeout_ms: default_write_timeout_ms(),
            min_position_gap: default_min_position_gap(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let settings: SyncSettings = serde_json::from_str(r#"{"writeTimeoutMs": 2500}"#).unwrap();
        assert_eq!(settings.write_timeout(), Duration::from_millis(2500));
        assert_eq!(settings.min_position_gap, 1e-9);

        let empty: SyncSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(empty, SyncSettings::default());
    }
}
