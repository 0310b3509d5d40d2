//! Pool configuration

use crate::core::{PoolError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment variable holding the initial capacity
pub const ENV_CAPACITY: &str = "TRANSCODE_POOL_CAPACITY";
/// Environment variable holding the default task timeout in milliseconds
pub const ENV_TASK_TIMEOUT_MS: &str = "TRANSCODE_POOL_TASK_TIMEOUT_MS";
/// Environment variable selecting the zero-capacity policy (`stall` or `inline`)
pub const ENV_ZERO_CAPACITY: &str = "TRANSCODE_POOL_ZERO_CAPACITY";
/// Environment variable holding the unit thread name prefix
pub const ENV_THREAD_PREFIX: &str = "TRANSCODE_POOL_THREAD_PREFIX";

/// What the pool does with work while its capacity is zero
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZeroCapacityPolicy {
    /// Keep tasks queued until capacity rises again (default)
    #[default]
    Stall,
    /// Run tasks on the submitting thread, one inline runner at a time
    ///
    /// A submitter that becomes the inline runner first drains tasks that
    /// are already queued, in order, then runs its own. Tasks queued while
    /// capacity was positive are only picked up by the next submission.
    Inline,
}

impl std::str::FromStr for ZeroCapacityPolicy {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stall" => Ok(ZeroCapacityPolicy::Stall),
            "inline" => Ok(ZeroCapacityPolicy::Inline),
            other => Err(PoolError::invalid_config(
                "zero_capacity_policy",
                format!("expected 'stall' or 'inline', got '{}'", other),
            )),
        }
    }
}

/// How [`TranscodePool::close`](crate::TranscodePool::close) treats outstanding work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloseMode {
    /// Finish queued and running tasks, then stop the units
    Graceful,
    /// Fail everything outstanding with `PoolClosed` and stop now
    Immediate,
}

/// Configuration for a transcoding pool
///
/// Durations are (de)serialized as milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Target number of live execution units
    pub capacity: usize,
    /// Unit thread name prefix
    pub thread_name_prefix: String,
    /// Behaviour while capacity is zero
    pub zero_capacity_policy: ZeroCapacityPolicy,
    /// Deadline applied to every task without its own timeout
    #[serde(rename = "task_timeout_ms", with = "opt_millis")]
    pub task_timeout: Option<Duration>,
    /// How long an immediate close waits for unit threads to exit
    #[serde(rename = "shutdown_timeout_ms", with = "millis")]
    pub shutdown_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: num_cpus::get(),
            thread_name_prefix: "transcode".to_string(),
            zero_capacity_policy: ZeroCapacityPolicy::default(),
            task_timeout: None,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl PoolConfig {
    /// Create a configuration with the given capacity
    ///
    /// Unlike the default, a capacity of 0 is kept as 0.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ..Default::default()
        }
    }

    /// Set unit thread name prefix
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_thread_name_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Set the zero-capacity policy
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_zero_capacity_policy(mut self, policy: ZeroCapacityPolicy) -> Self {
        self.zero_capacity_policy = policy;
        self
    }

    /// Set the default per-task deadline
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = Some(timeout);
        self
    }

    /// Set how long an immediate close waits for unit threads
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.thread_name_prefix.trim().is_empty() {
            return Err(PoolError::invalid_config(
                "thread_name_prefix",
                "Thread name prefix must not be empty",
            ));
        }
        if self.task_timeout.is_some_and(|t| t.is_zero()) {
            return Err(PoolError::invalid_config(
                "task_timeout",
                "Task timeout must be greater than 0",
            ));
        }
        if self.shutdown_timeout.is_zero() {
            return Err(PoolError::invalid_config(
                "shutdown_timeout",
                "Shutdown timeout must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Parse and validate a JSON configuration
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| PoolError::invalid_config("json", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `TRANSCODE_POOL_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(raw) = lookup(ENV_CAPACITY) {
            config.capacity = raw.trim().parse().map_err(|_| {
                PoolError::invalid_config("capacity", format!("'{}' is not a count", raw))
            })?;
        }
        if let Some(raw) = lookup(ENV_TASK_TIMEOUT_MS) {
            let ms: u64 = raw.trim().parse().map_err(|_| {
                PoolError::invalid_config("task_timeout", format!("'{}' is not milliseconds", raw))
            })?;
            config.task_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(raw) = lookup(ENV_ZERO_CAPACITY) {
            config.zero_capacity_policy = raw.parse()?;
        }
        if let Some(raw) = lookup(ENV_THREAD_PREFIX) {
            config.thread_name_prefix = raw;
        }
        config.validate()?;
        Ok(config)
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod opt_millis {
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
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}
