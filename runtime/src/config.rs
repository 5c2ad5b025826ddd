//! Runtime configuration.
//!
//! Loads configuration from `LEDGER_*` environment variables with sensible
//! defaults. Durations are stored as plain integers so the structs stay
//! readable in JSON and env form.

use crate::retry::RetryPolicy;
use balance_ledger_core::policy::PolicyConfig;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Complete ledger configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Business-rule limits
    pub policy: PolicyConfig,
    /// Balance cache
    pub cache: CacheConfig,
    /// Ledger service
    pub service: LedgerServiceConfig,
    /// Timeout sweeper
    pub sweeper: SweeperConfig,
}

impl LedgerConfig {
    /// Load every section from the environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            policy: PolicyConfig::from_env(),
            cache: CacheConfig::from_env(),
            service: LedgerServiceConfig::from_env(),
            sweeper: SweeperConfig::from_env(),
        }
    }
}

/// Balance cache configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Seconds an entry stays fresh (default: 300)
    pub ttl_seconds: u64,
    /// Maximum number of entries (default: 5000)
    pub max_size: usize,
    /// Number of independently locked shards (default: 16)
    pub shard_count: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 300,
            max_size: 5_000,
            shard_count: 16,
        }
    }
}

impl CacheConfig {
    /// Load from `LEDGER_CACHE_*` variables.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            ttl_seconds: env_or("LEDGER_CACHE_TTL_SECONDS", defaults.ttl_seconds),
            max_size: env_or("LEDGER_CACHE_MAX_SIZE", defaults.max_size),
            shard_count: env_or("LEDGER_CACHE_SHARDS", defaults.shard_count),
        }
    }

    /// Entry time-to-live.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

/// Ledger service configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerServiceConfig {
    /// Reload-and-retry attempts after a version conflict (default: 3)
    pub max_retries: usize,
    /// First backoff delay in milliseconds (default: 10)
    pub retry_initial_delay_ms: u64,
    /// Backoff cap in milliseconds (default: 500)
    pub retry_max_delay_ms: u64,
    /// Recorded as `processed_by` on every transaction
    pub processed_by: String,
    /// Whether per-user velocity limits are enforced (default: true)
    pub enforce_rate_limit: bool,
}

impl Default for LedgerServiceConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_initial_delay_ms: 10,
            retry_max_delay_ms: 500,
            processed_by: "balance-ledger".to_string(),
            enforce_rate_limit: true,
        }
    }
}

impl LedgerServiceConfig {
    /// Load from `LEDGER_SERVICE_*` variables.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_retries: env_or("LEDGER_SERVICE_MAX_RETRIES", defaults.max_retries),
            retry_initial_delay_ms: env_or(
                "LEDGER_SERVICE_RETRY_INITIAL_DELAY_MS",
                defaults.retry_initial_delay_ms,
            ),
            retry_max_delay_ms: env_or(
                "LEDGER_SERVICE_RETRY_MAX_DELAY_MS",
                defaults.retry_max_delay_ms,
            ),
            processed_by: env::var("LEDGER_SERVICE_PROCESSED_BY")
                .unwrap_or(defaults.processed_by),
            enforce_rate_limit: env_or(
                "LEDGER_SERVICE_ENFORCE_RATE_LIMIT",
                defaults.enforce_rate_limit,
            ),
        }
    }

    /// Backoff policy for version conflicts.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::builder()
            .max_retries(self.max_retries)
            .initial_delay(Duration::from_millis(self.retry_initial_delay_ms))
            .max_delay(Duration::from_millis(self.retry_max_delay_ms))
            .build()
    }
}

/// Timeout sweeper configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    /// Seconds between sweeps (default: 60)
    pub interval_seconds: u64,
    /// Records cancelled per kind per sweep (default: 100)
    pub batch_limit: usize,
    /// Pending transactions older than this are cancelled (default: 30)
    pub transaction_timeout_minutes: i64,
    /// Pending transfers older than this are cancelled (default: 15)
    pub transfer_timeout_minutes: i64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 60,
            batch_limit: 100,
            transaction_timeout_minutes: balance_ledger_core::transaction::DEFAULT_TIMEOUT_MINUTES,
            transfer_timeout_minutes: balance_ledger_core::transfer::DEFAULT_TRANSFER_TIMEOUT_MINUTES,
        }
    }
}

impl SweeperConfig {
    /// Load from `LEDGER_SWEEPER_*` variables.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            interval_seconds: env_or("LEDGER_SWEEPER_INTERVAL_SECONDS", defaults.interval_seconds),
            batch_limit: env_or("LEDGER_SWEEPER_BATCH_LIMIT", defaults.batch_limit),
            transaction_timeout_minutes: env_or(
                "LEDGER_SWEEPER_TRANSACTION_TIMEOUT_MINUTES",
                defaults.transaction_timeout_minutes,
            ),
            transfer_timeout_minutes: env_or(
                "LEDGER_SWEEPER_TRANSFER_TIMEOUT_MINUTES",
                defaults.transfer_timeout_minutes,
            ),
        }
    }

    /// Time between sweeps.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    /// Transaction timeout threshold.
    #[must_use]
    pub fn transaction_timeout(&self) -> chrono::Duration {
        chrono::Duration::try_minutes(self.transaction_timeout_minutes)
            .unwrap_or_else(balance_ledger_core::transaction::default_timeout)
    }

    /// Transfer timeout threshold.
    #[must_use]
    pub fn transfer_timeout(&self) -> chrono::Duration {
        chrono::Duration::try_minutes(self.transfer_timeout_minutes)
            .unwrap_or_else(balance_ledger_core::transfer::default_transfer_timeout)
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = LedgerConfig::default();
        assert_eq!(config.cache.ttl(), Duration::from_secs(300));
        assert_eq!(config.cache.max_size, 5_000);
        assert_eq!(config.sweeper.transaction_timeout(), chrono::Duration::minutes(30));
        assert_eq!(config.sweeper.transfer_timeout(), chrono::Duration::minutes(15));
        assert_eq!(config.service.retry_policy().max_retries, 3);
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: LedgerConfig =
            serde_json::from_str(r#"{"cache": {"max_size": 10}, "sweeper": {"batch_limit": 5}}"#)
                .unwrap();
        assert_eq!(config.cache.max_size, 10);
        assert_eq!(config.cache.ttl_seconds, 300);
        assert_eq!(config.sweeper.batch_limit, 5);
        assert_eq!(config.service, LedgerServiceConfig::default());
    }
}
