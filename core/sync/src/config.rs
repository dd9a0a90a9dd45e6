//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use edgesync_common::{Error, Result};

use crate::conflict::ConflictStrategy;

/// Configuration for the sync engine.
///
/// Durations are stored as plain millisecond counts so the JSON form
/// stays readable; use the accessor methods to get `Duration`s.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Endpoints probed to derive connectivity.
    pub endpoints: Vec<String>,
    /// Connectivity loop period.
    pub probe_interval_ms: u64,
    /// Timeout for a single endpoint probe.
    pub probe_timeout_ms: u64,
    /// Number of connectivity samples kept for diagnostics.
    pub history_limit: usize,
    /// Maximum number of queued operations.
    pub queue_capacity: usize,
    /// Directory holding the queue snapshot and version map.
    pub state_dir: PathBuf,
    /// Queue snapshot document name.
    pub queue_file: String,
    /// Version map document name.
    pub versions_file: String,
    /// Sync loop period.
    pub sync_interval_ms: u64,
    /// Operations dequeued per sync pass.
    pub batch_size: usize,
    /// Maximum concurrent handler invocations.
    pub max_in_flight: usize,
    /// Timeout for a single handler invocation.
    pub handler_timeout_ms: u64,
    /// Maximum number of retries per operation.
    pub max_retries: u32,
    /// Backoff base; retry `n` waits `backoff_base^n` seconds.
    pub backoff_base: f64,
    /// Cap for the backoff delay.
    pub max_backoff_ms: u64,
    /// Optional transfer cap in bytes per second. Unset means unthrottled.
    pub bandwidth_cap_bytes_per_sec: Option<u64>,
    /// Conflict resolution strategy.
    pub conflict_strategy: ConflictStrategy,
    /// Data kinds whose transfer score is doubled.
    pub high_priority_data_kinds: Vec<String>,
    /// Payloads larger than this get their score halved.
    pub large_payload_threshold_bytes: u64,
    /// Records modified within this window get a score boost.
    pub recency_window_ms: u64,
    /// Number of dropped operations kept for reporting.
    pub dropped_history_limit: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            probe_interval_ms: 10_000,
            probe_timeout_ms: 3_000,
            history_limit: 100,
            queue_capacity: 10_000,
            state_dir: default_state_dir(),
            queue_file: "queue.json".to_string(),
            versions_file: "versions.json".to_string(),
            sync_interval_ms: 30_000,
            batch_size: 10,
            max_in_flight: 4,
            handler_timeout_ms: 30_000,
            max_retries: 3,
            backoff_base: 2.0,
            max_backoff_ms: 300_000,
            bandwidth_cap_bytes_per_sec: None,
            conflict_strategy: ConflictStrategy::LatestWins,
            high_priority_data_kinds: Vec::new(),
            large_payload_threshold_bytes: 1024 * 1024,
            recency_window_ms: 60_000,
            dropped_history_limit: 100,
        }
    }
}

fn default_state_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("edgesync")
}

impl SyncConfig {
    /// Load a configuration from a JSON file.
    ///
    /// Missing fields take their default values. The result is validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("reading {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("parsing {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Check the configuration for values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("probe_interval_ms", self.probe_interval_ms),
            ("probe_timeout_ms", self.probe_timeout_ms),
            ("sync_interval_ms", self.sync_interval_ms),
            ("handler_timeout_ms", self.handler_timeout_ms),
            ("queue_capacity", self.queue_capacity as u64),
            ("batch_size", self.batch_size as u64),
            ("max_in_flight", self.max_in_flight as u64),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(Error::Config(format!("{} must be greater than zero", name)));
            }
        }

        if !self.backoff_base.is_finite() || self.backoff_base < 1.0 {
            return Err(Error::Config(format!(
                "backoff_base must be a finite number >= 1.0, got {}",
                self.backoff_base
            )));
        }

        if self.bandwidth_cap_bytes_per_sec == Some(0) {
            return Err(Error::Config(
                "bandwidth_cap_bytes_per_sec must be greater than zero when set".to_string(),
            ));
        }

        if self.queue_file == self.versions_file {
            return Err(Error::Config(
                "queue_file and versions_file must differ".to_string(),
            ));
        }

        Ok(())
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn recency_window(&self) -> Duration {
        Duration::from_millis(self.recency_window_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_is_valid() {
        SyncConfig::default().validate().unwrap();
    }

    #[test]
    fn test_rejects_zero_batch() {
        let config = SyncConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_shrinking_backoff() {
        let config = SyncConfig {
            backoff_base: 0.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = SyncConfig {
            backoff_base: f64::NAN,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_bandwidth_cap() {
        let config = SyncConfig {
            bandwidth_cap_bytes_per_sec: Some(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "endpoints": ["https://example.com/health"], "batch_size": 25, "conflict_strategy": "cloud-wins" }}"#
        )
        .unwrap();

        let config = SyncConfig::load(file.path()).unwrap();
        assert_eq!(config.endpoints.len(), 1);
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.conflict_strategy, ConflictStrategy::CloudWins);
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "max_in_flight": 0 }}"#).unwrap();

        assert!(SyncConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_round_trip_json() {
        let config = SyncConfig {
            bandwidth_cap_bytes_per_sec: Some(4096),
            ..Default::default()
        };
        let json = config.to_json().unwrap();
        let parsed: SyncConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.bandwidth_cap_bytes_per_sec, Some(4096));
    }
}
