//! Persistence contracts consumed by the ledger.
//!
//! The ledger never talks to a storage engine directly; it only needs these
//! traits. Every save carries the version the caller loaded, and a stale
//! version fails with [`RepositoryError::ConcurrencyConflict`] so it can be
//! told apart from business-rule failures and retried after a reload.
//!
//! # Dyn Compatibility
//!
//! Methods return `Pin<Box<dyn Future>>` instead of using `async fn` so the
//! repositories can be shared as `Arc<dyn BalanceRepository>` and friends.
//!
//! # Implementations
//!
//! - In-memory repositories in the `balance-ledger-testing` crate

use crate::balance::BalanceAggregate;
use crate::dual_balance::DualBalanceAggregate;
use crate::ids::{BalanceId, DualBalanceId, TransactionId, TransferId, UserId};
use crate::transaction::TransactionAggregate;
use crate::transfer::BalanceTransferAggregate;
use crate::version::{Version, Versioned};
use chrono::{DateTime, Utc};
use std::fmt::{Debug, Display};
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during repository operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    /// The stored copy is not at the version the caller expected.
    #[error("Concurrency conflict on {entity} {id}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        /// Kind of aggregate
        entity: &'static str,
        /// Aggregate identity
        id: String,
        /// Version the caller loaded
        expected: Version,
        /// Version currently stored
        actual: Version,
    },

    /// The backing store could not be reached or failed.
    #[error("Repository unavailable: {0}")]
    Unavailable(String),

    /// A stored record could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl RepositoryError {
    /// Whether this is a stale-version conflict (reload and retry).
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }
}

/// Boxed future returned by repository methods.
pub type RepositoryFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, RepositoryError>> + Send + 'a>>;

/// An aggregate that can be stored by a [`Repository`].
pub trait Persisted: Versioned + Clone + Debug + Send + Sync + 'static {
    /// Identity type.
    type Id: Clone + Eq + Hash + Display + Debug + Send + Sync + 'static;

    /// Name used in conflict errors and logs.
    const ENTITY: &'static str;

    /// Identity of this instance.
    fn persistence_id(&self) -> Self::Id;

    /// Owning user.
    fn owner(&self) -> UserId;
}

/// Operations shared by every repository.
pub trait Repository<A: Persisted>: Send + Sync {
    /// Stores `aggregate` if the stored copy is at `expected_version`.
    ///
    /// A new aggregate is saved with [`Version::INITIAL`]. On success the
    /// returned copy carries the new version (`expected_version.next()`).
    ///
    /// # Errors
    ///
    /// - `ConcurrencyConflict`: the stored version differs
    /// - `Unavailable`: the store failed
    fn save(&self, aggregate: A, expected_version: Version) -> RepositoryFuture<'_, A>;

    /// Loads an aggregate by identity. Absence is `Ok(None)`.
    ///
    /// # Errors
    ///
    /// `Unavailable` or `Serialization`; never used to signal absence.
    fn find_by_id(&self, id: A::Id) -> RepositoryFuture<'_, Option<A>>;

    /// Saves a batch atomically: either every entry matches its expected
    /// version and all are stored, or nothing is.
    ///
    /// # Errors
    ///
    /// Same as [`Repository::save`].
    fn save_all(&self, aggregates: Vec<(A, Version)>) -> RepositoryFuture<'_, Vec<A>>;
}

/// Storage for single-pool balances. At most one per user.
pub trait BalanceRepository: Repository<BalanceAggregate> {
    /// Loads the balance owned by `user_id`.
    fn find_by_user_id(&self, user_id: UserId) -> RepositoryFuture<'_, Option<BalanceAggregate>>;
}

/// Storage for dual balances. At most one per user.
pub trait DualBalanceRepository: Repository<DualBalanceAggregate> {
    /// Loads the dual balance owned by `user_id`.
    fn find_by_user_id(
        &self,
        user_id: UserId,
    ) -> RepositoryFuture<'_, Option<DualBalanceAggregate>>;
}

/// Storage for transaction records.
pub trait TransactionRepository: Repository<TransactionAggregate> {
    /// Records of `user_id` created at or after `since`, oldest first.
    fn find_by_user_id(
        &self,
        user_id: UserId,
        since: DateTime<Utc>,
    ) -> RepositoryFuture<'_, Vec<TransactionAggregate>>;

    /// Up to `limit` `PENDING` records created before `cutoff`, oldest first.
    fn find_pending_created_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> RepositoryFuture<'_, Vec<TransactionAggregate>>;
}

/// Storage for transfer records.
pub trait TransferRepository: Repository<BalanceTransferAggregate> {
    /// Transfers of `user_id`, oldest first.
    fn find_by_user_id(&self, user_id: UserId)
    -> RepositoryFuture<'_, Vec<BalanceTransferAggregate>>;

    /// Up to `limit` `PENDING` transfers created before `cutoff`, oldest first.
    fn find_pending_created_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> RepositoryFuture<'_, Vec<BalanceTransferAggregate>>;
}

impl Persisted for BalanceAggregate {
    type Id = BalanceId;
    const ENTITY: &'static str = "balance";

    fn persistence_id(&self) -> BalanceId {
        self.id()
    }

    fn owner(&self) -> UserId {
        self.user_id()
    }
}

impl Persisted for DualBalanceAggregate {
    type Id = DualBalanceId;
    const ENTITY: &'static str = "dual_balance";

    fn persistence_id(&self) -> DualBalanceId {
        self.id()
    }

    fn owner(&self) -> UserId {
        self.user_id()
    }
}

impl Persisted for TransactionAggregate {
    type Id = TransactionId;
    const ENTITY: &'static str = "transaction";

    fn persistence_id(&self) -> TransactionId {
        self.transaction_id().clone()
    }

    fn owner(&self) -> UserId {
        self.user_id()
    }
}

impl Persisted for BalanceTransferAggregate {
    type Id = TransferId;
    const ENTITY: &'static str = "transfer";

    fn persistence_id(&self) -> TransferId {
        self.transfer_id()
    }

    fn owner(&self) -> UserId {
        self.user_id()
    }
}
