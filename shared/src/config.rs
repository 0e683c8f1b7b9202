use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const MIN_TIMEOUT_MS: u64 = 1_000;
pub const MAX_TIMEOUT_MS: u64 = 300_000;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid sync config: {0}")]
    Invalid(String),

    #[error("malformed sync config: {0}")]
    Parse(String),
}

/// Tuning knobs for the sync engine and the Local Store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Failed drain attempts before a queue entry is dropped and marked failed.
    pub max_retries: u32,
    pub sync_interval_ms: u64,
    pub remote_timeout_ms: u64,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter_ms: u64,
    pub batch_size: usize,
    pub max_journeys: usize,
    pub max_queue_entries: usize,
    /// Treat non-retryable remote rejections as an exhausted budget.
    pub fail_fast_on_rejection: bool,
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            sync_interval_ms: 5 * 60 * 1000,
            remote_timeout_ms: DEFAULT_TIMEOUT_MS,
            base_backoff_ms: 30_000,
            max_backoff_ms: 10 * 60 * 1000,
            jitter_ms: 1_000,
            batch_size: 25,
            max_journeys: 10_000,
            max_queue_entries: 10_000,
            fail_fast_on_rejection: false,
            event_capacity: 64,
        }
    }
}

impl SyncConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries == 0 {
            return Err(ConfigError::Invalid("max_retries must be > 0".into()));
        }
        if self.sync_interval_ms < 1_000 {
            return Err(ConfigError::Invalid(
                "sync_interval_ms should be at least 1000ms".into(),
            ));
        }
        if !(MIN_TIMEOUT_MS..=MAX_TIMEOUT_MS).contains(&self.remote_timeout_ms) {
            return Err(ConfigError::Invalid(format!(
                "remote_timeout_ms must be between {} and {}",
                MIN_TIMEOUT_MS, MAX_TIMEOUT_MS
            )));
        }
        if self.base_backoff_ms == 0 {
            return Err(ConfigError::Invalid("base_backoff_ms must be > 0".into()));
        }
        if self.max_backoff_ms < self.base_backoff_ms {
            return Err(ConfigError::Invalid(
                "max_backoff_ms must be >= base_backoff_ms".into(),
            ));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be > 0".into()));
        }
        if self.max_journeys == 0 || self.max_queue_entries == 0 {
            return Err(ConfigError::Invalid(
                "store capacity limits must be > 0".into(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid("event_capacity must be > 0".into()));
        }
        Ok(())
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    /// Exponential backoff before the next background attempt, capped at
    /// `max_backoff_ms`, plus up to `jitter_ms` of random spread.
    pub fn backoff_ms(&self, retry_count: u32) -> u64 {
        use rand::Rng;

        let exponent = retry_count.saturating_sub(1).min(16);
        let base_delay = self.base_backoff_ms.saturating_mul(1u64 << exponent);
        let capped = base_delay.min(self.max_backoff_ms);
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        };
        capped.saturating_add(jitter)
    }
}
