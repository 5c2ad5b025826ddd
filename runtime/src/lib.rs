//! # Balance Ledger Runtime
//!
//! Imperative shell around `balance-ledger-core`.
//!
//! ## Core Components
//!
//! - **[`LedgerService`]**: per-user serialization, limits, optimistic
//!   save with retry, transaction records and event publication
//! - **[`BalanceCacheService`]**: sharded read-through cache for balances
//! - **[`TimeoutSweeper`]**: cancels `PENDING` records past their timeout
//! - **Observability**: tracing setup and Prometheus metrics
//!
//! ## Example
//!
//! ```ignore
//! use balance_ledger_runtime::{LedgerConfig, LedgerService, BalanceCacheService};
//!
//! let config = LedgerConfig::from_env();
//! let cache = Arc::new(BalanceCacheService::new(balances.clone(), clock.clone(), config.cache));
//! let service = LedgerService::new(repositories, cache, publisher, env, config.service);
//!
//! service.open_balance(user_id, Currency::USD).await?;
//! let outcome = service.deposit(user_id, amount, "Top-up", None).await?;
//! ```

/// Sharded balance cache
pub mod cache;

/// Environment-driven configuration
pub mod config;

/// Prometheus metrics for observability
pub mod metrics;

/// Retry logic with exponential backoff
pub mod retry;

/// Ledger orchestration
pub mod service;

/// Timeout sweeper
pub mod sweeper;

/// Tracing subscriber setup
pub mod telemetry;

pub use cache::{BalanceCacheService, CacheError, CacheMetricsSnapshot};
pub use config::{CacheConfig, LedgerConfig, LedgerServiceConfig, SweeperConfig};
pub use metrics::MetricsServer;
pub use retry::RetryPolicy;
pub use service::{
    BalanceOperationOutcome, DualOperationOutcome, LedgerRepositories, LedgerService,
    LedgerServiceError, ServiceResult,
};
pub use sweeper::{SweepReport, SweeperHandle, TimeoutSweeper};
pub use telemetry::init_tracing;
