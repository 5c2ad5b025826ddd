//! In-memory repositories for fast, deterministic tests.
//!
//! One generic [`InMemoryRepository`] implements the shared
//! [`Repository`] contract for every aggregate, including the version check
//! a real store would enforce, and the per-aggregate query traits on top.
//!
//! Failures can be injected to exercise the retry and error paths:
//! - [`InMemoryRepository::conflict_next_saves`] makes saves report a
//!   concurrency conflict
//! - [`InMemoryRepository::fail_next_operations`] makes any call report the
//!   store as unavailable

use balance_ledger_core::balance::BalanceAggregate;
use balance_ledger_core::dual_balance::DualBalanceAggregate;
use balance_ledger_core::ids::UserId;
use balance_ledger_core::repository::{
    BalanceRepository, DualBalanceRepository, Persisted, Repository, RepositoryError,
    RepositoryFuture, TransactionRepository, TransferRepository,
};
use balance_ledger_core::transaction::{TransactionAggregate, TransactionStatus};
use balance_ledger_core::transfer::BalanceTransferAggregate;
use balance_ledger_core::version::Version;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// In-memory balances.
pub type InMemoryBalanceRepository = InMemoryRepository<BalanceAggregate>;
/// In-memory dual balances.
pub type InMemoryDualBalanceRepository = InMemoryRepository<DualBalanceAggregate>;
/// In-memory transaction records.
pub type InMemoryTransactionRepository = InMemoryRepository<TransactionAggregate>;
/// In-memory transfer records.
pub type InMemoryTransferRepository = InMemoryRepository<BalanceTransferAggregate>;

/// `HashMap`-backed repository with optimistic version checks.
///
/// Clones share storage, so a test can keep a handle for assertions while the
/// service under test owns another.
///
/// # Example
///
/// ```
/// use balance_ledger_testing::InMemoryBalanceRepository;
///
/// let repo = InMemoryBalanceRepository::new();
/// assert!(repo.is_empty());
/// repo.conflict_next_saves(1);
/// ```
#[derive(Debug)]
pub struct InMemoryRepository<A: Persisted> {
    records: Arc<RwLock<HashMap<A::Id, A>>>,
    pending_conflicts: Arc<AtomicUsize>,
    pending_failures: Arc<AtomicUsize>,
    saves: Arc<AtomicUsize>,
    queries: Arc<AtomicUsize>,
}

impl<A: Persisted> Clone for InMemoryRepository<A> {
    fn clone(&self) -> Self {
        Self {
            records: Arc::clone(&self.records),
            pending_conflicts: Arc::clone(&self.pending_conflicts),
            pending_failures: Arc::clone(&self.pending_failures),
            saves: Arc::clone(&self.saves),
            queries: Arc::clone(&self.queries),
        }
    }
}

impl<A: Persisted> Default for InMemoryRepository<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Persisted> InMemoryRepository<A> {
    /// Create an empty repository
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            pending_conflicts: Arc::new(AtomicUsize::new(0)),
            pending_failures: Arc::new(AtomicUsize::new(0)),
            saves: Arc::new(AtomicUsize::new(0)),
            queries: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The next `count` saves fail with a concurrency conflict and store nothing.
    pub fn conflict_next_saves(&self, count: usize) {
        self.pending_conflicts.store(count, Ordering::SeqCst);
    }

    /// The next `count` calls of any kind fail with `Unavailable`.
    pub fn fail_next_operations(&self, count: usize) {
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    /// Successful and failed save attempts so far.
    #[must_use]
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Read calls so far.
    #[must_use]
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    /// Number of stored aggregates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Every stored aggregate, in no particular order.
    #[must_use]
    pub fn all(&self) -> Vec<A> {
        self.read().values().cloned().collect()
    }

    /// Stores `aggregate` as-is, bypassing version checks.
    ///
    /// Handy for seeding a scenario.
    pub fn insert(&self, aggregate: A) {
        self.write().insert(aggregate.persistence_id(), aggregate);
    }

    /// Drop everything (for test isolation).
    pub fn clear(&self) {
        self.write().clear();
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<A::Id, A>> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<A::Id, A>> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_one(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn check_available(&self) -> Result<(), RepositoryError> {
        if Self::take_one(&self.pending_failures) {
            Err(RepositoryError::Unavailable("injected failure".to_string()))
        } else {
            Ok(())
        }
    }

    /// Version check for one aggregate against the stored map.
    ///
    /// A new aggregate (expected `INITIAL`) is also rejected when its owner
    /// already has a stored aggregate of this kind under another id, which is
    /// how a unique `user_id` column behaves.
    fn check_version(
        records: &HashMap<A::Id, A>,
        aggregate: &A,
        expected: Version,
        one_per_owner: bool,
    ) -> Result<(), RepositoryError> {
        let id = aggregate.persistence_id();
        let actual = records.get(&id).map_or(Version::INITIAL, A::version);
        if actual != expected {
            return Err(RepositoryError::ConcurrencyConflict {
                entity: A::ENTITY,
                id: id.to_string(),
                expected,
                actual,
            });
        }
        if one_per_owner && expected.is_initial() {
            let owner = aggregate.owner();
            if let Some(existing) = records
                .values()
                .find(|stored| stored.owner() == owner && stored.persistence_id() != id)
            {
                return Err(RepositoryError::ConcurrencyConflict {
                    entity: A::ENTITY,
                    id: existing.persistence_id().to_string(),
                    expected,
                    actual: existing.version(),
                });
            }
        }
        Ok(())
    }

    fn save_batch(
        &self,
        batch: Vec<(A, Version)>,
        one_per_owner: bool,
    ) -> Result<Vec<A>, RepositoryError> {
        self.saves.fetch_add(batch.len(), Ordering::SeqCst);
        self.check_available()?;
        if Self::take_one(&self.pending_conflicts) {
            let (first, expected) = batch.first().map_or_else(
                || (String::new(), Version::INITIAL),
                |(aggregate, expected)| (aggregate.persistence_id().to_string(), *expected),
            );
            return Err(RepositoryError::ConcurrencyConflict {
                entity: A::ENTITY,
                id: first,
                expected,
                actual: expected.next(),
            });
        }

        let mut records = self.write();
        for (aggregate, expected) in &batch {
            Self::check_version(&records, aggregate, *expected, one_per_owner)?;
        }
        Ok(batch
            .into_iter()
            .map(|(mut aggregate, expected)| {
                aggregate.set_version(expected.next());
                records.insert(aggregate.persistence_id(), aggregate.clone());
                aggregate
            })
            .collect())
    }

    fn query<T>(&self, f: impl FnOnce(&HashMap<A::Id, A>) -> T) -> Result<T, RepositoryError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        Ok(f(&self.read()))
    }
}

/// Whether an aggregate kind is limited to one instance per user.
pub trait OwnerUniqueness {
    /// `true` for balances, `false` for transaction and transfer records.
    const ONE_PER_OWNER: bool;
}

impl OwnerUniqueness for BalanceAggregate {
    const ONE_PER_OWNER: bool = true;
}

impl OwnerUniqueness for DualBalanceAggregate {
    const ONE_PER_OWNER: bool = true;
}

impl OwnerUniqueness for TransactionAggregate {
    const ONE_PER_OWNER: bool = false;
}

impl OwnerUniqueness for BalanceTransferAggregate {
    const ONE_PER_OWNER: bool = false;
}

impl<A: Persisted + OwnerUniqueness> Repository<A> for InMemoryRepository<A> {
    fn save(&self, aggregate: A, expected_version: Version) -> RepositoryFuture<'_, A> {
        Box::pin(async move {
            let mut saved = self.save_batch(vec![(aggregate, expected_version)], A::ONE_PER_OWNER)?;
            saved
                .pop()
                .ok_or_else(|| RepositoryError::Unavailable("empty save result".to_string()))
        })
    }

    fn find_by_id(&self, id: A::Id) -> RepositoryFuture<'_, Option<A>> {
        Box::pin(async move { self.query(|records| records.get(&id).cloned()) })
    }

    fn save_all(&self, aggregates: Vec<(A, Version)>) -> RepositoryFuture<'_, Vec<A>> {
        Box::pin(async move { self.save_batch(aggregates, A::ONE_PER_OWNER) })
    }
}

fn owned_by<A: Persisted>(records: &HashMap<A::Id, A>, user_id: UserId) -> Option<A> {
    records.values().find(|a| a.owner() == user_id).cloned()
}

impl BalanceRepository for InMemoryBalanceRepository {
    fn find_by_user_id(&self, user_id: UserId) -> RepositoryFuture<'_, Option<BalanceAggregate>> {
        Box::pin(async move { self.query(|records| owned_by(records, user_id)) })
    }
}

impl DualBalanceRepository for InMemoryDualBalanceRepository {
    fn find_by_user_id(
        &self,
        user_id: UserId,
    ) -> RepositoryFuture<'_, Option<DualBalanceAggregate>> {
        Box::pin(async move { self.query(|records| owned_by(records, user_id)) })
    }
}

impl TransactionRepository for InMemoryTransactionRepository {
    fn find_by_user_id(
        &self,
        user_id: UserId,
        since: DateTime<Utc>,
    ) -> RepositoryFuture<'_, Vec<TransactionAggregate>> {
        Box::pin(async move {
            self.query(|records| {
                let mut found: Vec<_> = records
                    .values()
                    .filter(|t| t.user_id() == user_id && t.created_at() >= since)
                    .cloned()
                    .collect();
                found.sort_by_key(TransactionAggregate::created_at);
                found
            })
        })
    }

    fn find_pending_created_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> RepositoryFuture<'_, Vec<TransactionAggregate>> {
        Box::pin(async move {
            self.query(|records| {
                let mut found: Vec<_> = records
                    .values()
                    .filter(|t| t.status() == TransactionStatus::Pending && t.created_at() < cutoff)
                    .cloned()
                    .collect();
                found.sort_by_key(TransactionAggregate::created_at);
                found.truncate(limit);
                found
            })
        })
    }
}

impl TransferRepository for InMemoryTransferRepository {
    fn find_by_user_id(
        &self,
        user_id: UserId,
    ) -> RepositoryFuture<'_, Vec<BalanceTransferAggregate>> {
        Box::pin(async move {
            self.query(|records| {
                let mut found: Vec<_> = records
                    .values()
                    .filter(|t| t.user_id() == user_id)
                    .cloned()
                    .collect();
                found.sort_by_key(BalanceTransferAggregate::created_at);
                found
            })
        })
    }

    fn find_pending_created_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> RepositoryFuture<'_, Vec<BalanceTransferAggregate>> {
        Box::pin(async move {
            self.query(|records| {
                let mut found: Vec<_> = records
                    .values()
                    .filter(|t| t.status() == TransactionStatus::Pending && t.created_at() < cutoff)
                    .cloned()
                    .collect();
                found.sort_by_key(BalanceTransferAggregate::created_at);
                found.truncate(limit);
                found
            })
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_clock;
    use balance_ledger_core::balance::BalanceEnvironment;
    use balance_ledger_core::money::Currency;
    use balance_ledger_core::policy::BalancePolicy;
    use balance_ledger_core::version::Versioned;

    fn env() -> BalanceEnvironment {
        BalanceEnvironment::new(Arc::new(test_clock()), Arc::new(BalancePolicy::default()))
    }

    fn balance(user: i64) -> BalanceAggregate {
        BalanceAggregate::open(UserId::new(user), Currency::USD, &env()).unwrap()
    }

    #[tokio::test]
    async fn save_advances_version() {
        let repo = InMemoryBalanceRepository::new();
        let saved = repo.save(balance(1), Version::INITIAL).await.unwrap();
        assert_eq!(saved.version(), Version::new(1));

        let again = repo.save(saved.clone(), saved.version()).await.unwrap();
        assert_eq!(again.version(), Version::new(2));
    }

    #[tokio::test]
    async fn stale_save_is_a_conflict() {
        let repo = InMemoryBalanceRepository::new();
        let saved = repo.save(balance(1), Version::INITIAL).await.unwrap();
        repo.save(saved.clone(), saved.version()).await.unwrap();

        let err = repo.save(saved, Version::new(1)).await.unwrap_err();
        assert!(matches!(
            err,
            RepositoryError::ConcurrencyConflict {
                entity: "balance",
                expected,
                actual,
                ..
            } if expected == Version::new(1) && actual == Version::new(2)
        ));
    }

    #[tokio::test]
    async fn second_balance_for_same_user_is_rejected() {
        let repo = InMemoryBalanceRepository::new();
        repo.save(balance(1), Version::INITIAL).await.unwrap();
        let err = repo.save(balance(1), Version::INITIAL).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(repo.len(), 1);
    }

    #[tokio::test]
    async fn save_all_is_all_or_nothing() {
        let repo = InMemoryBalanceRepository::new();
        let first = repo.save(balance(1), Version::INITIAL).await.unwrap();

        let result = repo
            .save_all(vec![(balance(2), Version::INITIAL), (first, Version::new(7))])
            .await;
        assert!(result.unwrap_err().is_conflict());
        assert_eq!(repo.len(), 1);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let repo = InMemoryBalanceRepository::new();
        repo.fail_next_operations(1);
        assert!(matches!(
            repo.find_by_user_id(UserId::new(1)).await,
            Err(RepositoryError::Unavailable(_))
        ));
        assert!(repo.find_by_user_id(UserId::new(1)).await.unwrap().is_none());

        repo.conflict_next_saves(1);
        assert!(repo.save(balance(1), Version::INITIAL).await.unwrap_err().is_conflict());
        assert!(repo.save(balance(1), Version::INITIAL).await.is_ok());
    }
}
