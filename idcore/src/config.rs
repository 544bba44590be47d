//! Runtime configuration.
//!
//! Every bounded parameter is a validated `nutype` so that an out-of-range
//! value fails when the configuration is loaded, not when a spooler starts.

use nutype::nutype;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Maximum number of events fetched per spooler tick.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 10_000),
    default = 200,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct BulkLimit(usize);

/// Catch-up poll interval in milliseconds, between 10ms and one hour.
#[nutype(
    validate(greater_or_equal = 10, less_or_equal = 3_600_000),
    default = 2_000,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct RequeueEveryMs(u64);

impl RequeueEveryMs {
    /// Convert to Duration for use with tokio::time::sleep.
    pub fn as_duration(self) -> Duration {
        Duration::from_millis(self.into_inner())
    }
}

/// Handler lock lease in milliseconds, between 100ms and one hour.
#[nutype(
    validate(greater_or_equal = 100, less_or_equal = 3_600_000),
    default = 30_000,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct LockLeaseMs(u64);

impl LockLeaseMs {
    /// Convert to Duration for use with tokio::time::sleep.
    pub fn as_duration(self) -> Duration {
        Duration::from_millis(self.into_inner())
    }
}

/// Pause after a failed tick in milliseconds, at most one minute.
#[nutype(
    validate(less_or_equal = 60_000),
    default = 100,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct RetryDelayMs(u64);

impl RetryDelayMs {
    /// Convert to Duration for use with tokio::time::sleep.
    pub fn as_duration(self) -> Duration {
        Duration::from_millis(self.into_inner())
    }
}

/// Command retry base delay in milliseconds, at most ten seconds.
#[nutype(
    validate(less_or_equal = 10_000),
    default = 10,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct BaseDelayMs(u64);

impl BaseDelayMs {
    /// Convert to Duration for use with tokio::time::sleep.
    pub fn as_duration(self) -> Duration {
        Duration::from_millis(self.into_inner())
    }
}

/// Maximum attempts for a command that keeps hitting concurrency conflicts.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 20),
    default = 5,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct MaxAttempts(u32);

/// Capacity of each subscription channel.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 65_536),
    default = 256,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct ChannelCapacity(usize);

/// Spooler tuning for one handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpoolerConfig {
    /// Events fetched per tick.
    pub bulk_limit: BulkLimit,
    /// Catch-up poll interval when no push notification arrives.
    pub requeue_every: RequeueEveryMs,
    /// Failures tolerated per event before it is skipped.
    pub failure_count_until_skip: u32,
    /// How long a handler lock is held before another worker may take it.
    pub lock_lease: LockLeaseMs,
    /// Pause after a failed tick before the next attempt.
    pub retry_delay: RetryDelayMs,
}

impl Default for SpoolerConfig {
    fn default() -> Self {
        Self {
            bulk_limit: BulkLimit::default(),
            requeue_every: RequeueEveryMs::default(),
            failure_count_until_skip: 3,
            lock_lease: LockLeaseMs::default(),
            retry_delay: RetryDelayMs::default(),
        }
    }
}

impl SpoolerConfig {
    /// Same configuration with a different skip threshold.
    #[must_use]
    pub const fn with_failure_count_until_skip(mut self, threshold: u32) -> Self {
        self.failure_count_until_skip = threshold;
        self
    }

    /// Same configuration with a different batch size.
    #[must_use]
    pub const fn with_bulk_limit(mut self, bulk_limit: BulkLimit) -> Self {
        self.bulk_limit = bulk_limit;
        self
    }

    /// Same configuration with a different poll interval.
    #[must_use]
    pub const fn with_requeue_every(mut self, interval: RequeueEveryMs) -> Self {
        self.requeue_every = interval;
        self
    }
}

/// Retry policy of the command layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    /// Attempts before a concurrency conflict is returned to the caller.
    pub max_attempts: MaxAttempts,
    /// Delay before the second attempt; doubled for each further one.
    pub base_delay: BaseDelayMs,
}

impl CommandConfig {
    /// Backoff before attempt `attempt` (1-based); zero before the first.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 2).min(16);
        self.base_delay.as_duration() * 2_u32.pow(exponent)
    }
}

/// Subscription channel settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    /// Capacity of each subscription channel.
    pub channel_capacity: ChannelCapacity,
}

/// Complete engine configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdcoreConfig {
    /// Spooler defaults for every handler.
    pub spooler: SpoolerConfig,
    /// Command retry policy.
    pub command: CommandConfig,
    /// Subscription channels.
    pub subscription: SubscriptionConfig,
}

/// Failure to load configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The document is malformed or a value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(#[from] serde_json::Error),
}

impl IdcoreConfig {
    /// Parses a JSON document; missing keys take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = IdcoreConfig::default();

        assert_eq!(config.spooler.bulk_limit.into_inner(), 200);
        assert_eq!(config.spooler.requeue_every.as_duration(), Duration::from_secs(2));
        assert_eq!(config.spooler.failure_count_until_skip, 3);
        assert_eq!(config.spooler.lock_lease.as_duration(), Duration::from_secs(30));
        assert_eq!(config.subscription.channel_capacity.into_inner(), 256);
        assert_eq!(config.command.max_attempts.into_inner(), 5);
    }

    #[test]
    fn partial_json_keeps_defaults_for_missing_keys() {
        let config = IdcoreConfig::from_json(
            r#"{"spooler": {"bulk_limit": 50, "failure_count_until_skip": 1}}"#,
        )
        .unwrap();

        assert_eq!(config.spooler.bulk_limit.into_inner(), 50);
        assert_eq!(config.spooler.failure_count_until_skip, 1);
        assert_eq!(config.spooler.requeue_every.as_duration(), Duration::from_secs(2));
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let result = IdcoreConfig::from_json(r#"{"spooler": {"bulk_limit": 0}}"#);

        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn command_backoff_doubles_per_attempt() {
        let config = CommandConfig {
            max_attempts: MaxAttempts::default(),
            base_delay: BaseDelayMs::try_new(10).unwrap(),
        };

        assert_eq!(config.delay_for_attempt(1), Duration::ZERO);
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(10));
        assert_eq!(config.delay_for_attempt(4), Duration::from_millis(40));
    }
}
