//! Engine configuration, loaded from TOML.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SpindleError;
use crate::queue::RetryPolicy;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub wal_path: PathBuf,
    /// Background dispatcher workers.
    pub dispatchers: usize,
    /// Upper bound on handler executions in flight across all dispatchers.
    pub max_concurrency: usize,
    pub poll_interval_ms: u64,
    /// How long terminal jobs are kept before compaction drops them.
    pub retention_secs: u64,
    /// Run compaction periodically when set.
    pub compact_interval_secs: Option<u64>,
    pub log_format: LogFormat,
    pub retry: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            wal_path: PathBuf::from("spindle.wal"),
            dispatchers: 1,
            max_concurrency: 8,
            poll_interval_ms: 1_000,
            retention_secs: 7 * 24 * 60 * 60,
            compact_interval_secs: None,
            log_format: LogFormat::Text,
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: Option<u64>,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            base_delay_ms: policy.base_delay.as_millis() as u64,
            multiplier: policy.multiplier,
            max_delay_ms: policy.max_delay.map(|d| d.as_millis() as u64),
            jitter: policy.jitter,
        }
    }
}

impl EngineConfig {
    /// Load from a TOML file, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, SpindleError> {
        match path {
            Some(p) => {
                let data = fs::read_to_string(p)?;
                Self::from_toml_str(&data)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn from_toml_str(data: &str) -> Result<Self, SpindleError> {
        let cfg: Self = toml::from_str(data)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn with_wal_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.wal_path = path.into();
        self
    }

    pub fn validate(&self) -> Result<(), SpindleError> {
        if self.dispatchers == 0 {
            return Err(SpindleError::Config("dispatchers must be at least 1".into()));
        }
        if self.max_concurrency == 0 {
            return Err(SpindleError::Config("max_concurrency must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(SpindleError::Config("retry.max_attempts must be at least 1".into()));
        }
        if !(self.retry.multiplier.is_finite() && self.retry.multiplier >= 1.0) {
            return Err(SpindleError::Config("retry.multiplier must be a finite number >= 1".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(SpindleError::Config("poll_interval_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn compact_interval(&self) -> Option<Duration> {
        self.compact_interval_secs.filter(|s| *s > 0).map(Duration::from_secs)
    }

    /// Engine-wide retry policy; tasks may override it.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            multiplier: self.retry.multiplier,
            max_delay: self.retry.max_delay_ms.map(Duration::from_millis),
            jitter: self.retry.jitter,
        }
    }
}
