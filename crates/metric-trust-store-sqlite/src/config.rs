use std::time::Duration;

use metric_trust_core::{MetricError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Connection and retry settings for [`crate::SqliteMetricStore`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreConfig {
    /// How long SQLite itself waits on a locked database before reporting busy.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Extra attempts after a busy or locked failure.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Linear backoff step between attempts.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Rows fetched per page by `list_all`.
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    25
}

fn default_page_size() -> u32 {
    256
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: default_busy_timeout_ms(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            page_size: default_page_size(),
        }
    }
}

impl StoreConfig {
    /// # Errors
    /// Returns [`MetricError::Configuration`] when the page size is zero.
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(MetricError::Configuration(
                "page_size MUST be >= 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Decodes a config from JSON, filling omitted fields with defaults.
    ///
    /// # Errors
    /// Returns [`MetricError::Configuration`] when decoding or validation fails.
    pub fn from_json(value: &Value) -> Result<Self> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            MetricError::Configuration(format!("invalid store config JSON payload: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(u64::from(attempt)))
    }
}
