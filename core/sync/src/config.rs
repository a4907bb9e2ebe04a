//! Configuration for the sync engine.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use offsync_common::{Error, Result};

use crate::conflict::ConflictStrategy;
use crate::retry::RetryConfig;

/// Configuration for the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Attempt ceiling applied when an operation is enqueued without one.
    pub default_max_attempts: u32,
    /// Backoff between attempts of a failing operation.
    pub retry: RetryConfig,
    /// Strategy applied when a conflict is detected.
    pub conflict_strategy: ConflictStrategy,
    /// Local/remote timestamps closer than this are not a conflict.
    #[serde(with = "duration_ms")]
    pub conflict_tolerance: Duration,
    /// Interval of the defensive periodic drain. `None` disables it.
    #[serde(with = "option_duration_ms")]
    pub periodic_interval: Option<Duration>,
}

impl SyncConfig {
    /// Set the default attempt ceiling.
    pub fn with_default_max_attempts(mut self, attempts: u32) -> Self {
        self.default_max_attempts = attempts;
        self
    }

    /// Set the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set the conflict resolution strategy.
    pub fn with_conflict_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.conflict_strategy = strategy;
        self
    }

    /// Set the conflict tolerance window.
    pub fn with_conflict_tolerance(mut self, tolerance: Duration) -> Self {
        self.conflict_tolerance = tolerance;
        self
    }

    /// Set or disable the periodic drain.
    pub fn with_periodic_interval(mut self, interval: Option<Duration>) -> Self {
        self.periodic_interval = interval;
        self
    }

    /// Check the configuration for values the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.default_max_attempts == 0 {
            return Err(Error::InvalidInput(
                "default_max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(Error::InvalidInput(
                "backoff_multiplier must be at least 1.0".to_string(),
            ));
        }
        if self.retry.max_delay < self.retry.base_delay {
            return Err(Error::InvalidInput(
                "max_delay must not be below base_delay".to_string(),
            ));
        }
        if matches!(self.periodic_interval, Some(d) if d.is_zero()) {
            return Err(Error::InvalidInput(
                "periodic_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: 3,
            retry: RetryConfig::default(),
            conflict_strategy: ConflictStrategy::Manual,
            conflict_tolerance: Duration::from_secs(1),
            periodic_interval: Some(Duration::from_secs(30)),
        }
    }
}

/// Serde adapter storing a `Duration` as whole milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Serde adapter storing an optional `Duration` as milliseconds or `null`.
pub(crate) mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
