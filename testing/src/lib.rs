//! # Balance Ledger Testing
//!
//! Testing utilities for the balance ledger.
//!
//! This crate provides:
//! - Deterministic clocks ([`FixedClock`], [`ManualClock`])
//! - In-memory repositories with version checks and failure injection
//! - A publisher that records every event it is handed
//! - proptest strategies for amounts and operation sequences
//!
//! ## Example
//!
//! ```
//! use balance_ledger_testing::{InMemoryBalanceRepository, test_clock};
//! use balance_ledger_core::balance::{BalanceAggregate, BalanceEnvironment};
//! use balance_ledger_core::ids::UserId;
//! use balance_ledger_core::money::Currency;
//! use balance_ledger_core::policy::BalancePolicy;
//! use balance_ledger_core::repository::Repository;
//! use balance_ledger_core::version::{Version, Versioned};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let env = BalanceEnvironment::new(Arc::new(test_clock()), Arc::new(BalancePolicy::default()));
//! let repo = InMemoryBalanceRepository::new();
//!
//! let balance = BalanceAggregate::open(UserId::new(1), Currency::USD, &env)?;
//! let saved = repo.save(balance, Version::INITIAL).await?;
//! assert_eq!(saved.version(), Version::new(1));
//! # Ok(())
//! # }
//! ```

pub mod properties;
pub mod publisher_mocks;
pub mod repository_mocks;

use balance_ledger_core::environment::Clock;
use chrono::{DateTime, Utc};

/// Mock implementations of environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, PoisonError, RwLock};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use balance_ledger_testing::mocks::FixedClock;
    /// use balance_ledger_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(test_epoch())
    }

    /// 2025-01-01 00:00:00 UTC, the instant [`test_clock`] is pinned to.
    ///
    /// # Panics
    ///
    /// Never in practice; the timestamp is hardcoded.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_epoch() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .expect("hardcoded timestamp should always parse")
            .with_timezone(&Utc)
    }

    /// Clock that only moves when told to.
    ///
    /// Clones share the same instant, so a test can keep one handle and
    /// advance the time seen by services holding another.
    ///
    /// # Example
    ///
    /// ```
    /// use balance_ledger_testing::mocks::ManualClock;
    /// use balance_ledger_core::environment::Clock;
    ///
    /// let clock = ManualClock::starting_at_epoch();
    /// let start = clock.now();
    /// clock.advance(chrono::Duration::minutes(31));
    /// assert_eq!(clock.now() - start, chrono::Duration::minutes(31));
    /// ```
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<RwLock<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Create a manual clock at `time`
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(RwLock::new(time)),
            }
        }

        /// Create a manual clock at [`test_epoch`]
        #[must_use]
        pub fn starting_at_epoch() -> Self {
            Self::new(test_epoch())
        }

        /// Move the clock forward (or backward, for a negative duration)
        pub fn advance(&self, by: chrono::Duration) {
            let mut time = self.time.write().unwrap_or_else(PoisonError::into_inner);
            *time += by;
        }

        /// Jump to an absolute instant
        pub fn set(&self, to: DateTime<Utc>) {
            *self.time.write().unwrap_or_else(PoisonError::into_inner) = to;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.read().unwrap_or_else(PoisonError::into_inner)
        }
    }
}

// Re-export commonly used items
pub use mocks::{FixedClock, ManualClock, test_clock, test_epoch};
pub use publisher_mocks::RecordingPublisher;
pub use repository_mocks::{
    InMemoryBalanceRepository, InMemoryDualBalanceRepository, InMemoryRepository,
    InMemoryTransactionRepository, InMemoryTransferRepository,
};
