//! Read-through, write-invalidate cache in front of the balance repository.
//!
//! Entries live in independently locked shards keyed by user id, expire
//! after a TTL, and are dropped around every write so a reader never sees a
//! balance older than the last committed save.
//!
//! # Stale re-insertion
//!
//! A lookup that misses releases its shard lock while it awaits the
//! repository. If an invalidation lands in that window, the loaded value may
//! predate the write that caused it. Each shard therefore carries a
//! generation counter bumped by every invalidation; a load only inserts when
//! the generation it observed before awaiting is still current.
//!
//! # Example
//!
//! ```
//! use balance_ledger_runtime::cache::BalanceCacheService;
//! use balance_ledger_runtime::config::CacheConfig;
//! use balance_ledger_testing::{InMemoryBalanceRepository, test_clock};
//! use balance_ledger_core::ids::UserId;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let cache = BalanceCacheService::new(
//!     Arc::new(InMemoryBalanceRepository::new()),
//!     Arc::new(test_clock()),
//!     CacheConfig::default(),
//! );
//! assert!(cache.get_balance(UserId::new(1)).await?.is_none());
//! assert_eq!(cache.metrics().misses, 1);
//! # Ok(())
//! # }
//! ```

use crate::config::CacheConfig;
use crate::metrics::CacheMetrics;
use balance_ledger_core::balance::BalanceAggregate;
use balance_ledger_core::environment::Clock;
use balance_ledger_core::ids::UserId;
use balance_ledger_core::money::Money;
use balance_ledger_core::repository::{BalanceRepository, Repository, RepositoryError};
use balance_ledger_core::version::Version;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Errors from the cache service.
///
/// The cache never turns a repository failure into a miss.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Loading a balance from the repository failed.
    #[error("Balance retrieval failed: {0}")]
    Retrieval(#[source] RepositoryError),

    /// Saving a balance through the cache failed.
    #[error("Balance save failed: {0}")]
    Save(#[source] RepositoryError),
}

impl CacheError {
    /// The underlying repository error.
    #[must_use]
    pub const fn repository_error(&self) -> &RepositoryError {
        match self {
            Self::Retrieval(err) | Self::Save(err) => err,
        }
    }

    /// Whether the failure was a stale-version save.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        self.repository_error().is_conflict()
    }
}

/// Point-in-time view of the cache counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheMetricsSnapshot {
    /// Lookups answered from memory
    pub hits: u64,
    /// Lookups that went to the repository
    pub misses: u64,
    /// `hits / (hits + misses)`, zero before the first lookup
    pub hit_ratio: f64,
    /// Entries currently held
    pub size: usize,
    /// Entry limit
    pub max_size: usize,
    /// Repository calls made by lookups
    pub repository_queries: u64,
    /// Lookups, saves and invalidations
    pub total_operations: u64,
    /// Mean lookup latency
    pub average_response_time: Duration,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    balance: BalanceAggregate,
    cached_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Shard {
    entries: HashMap<UserId, CacheEntry>,
    generation: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    repository_queries: AtomicU64,
    total_operations: AtomicU64,
    lookups: AtomicU64,
    lookup_micros: AtomicU64,
}

/// Concurrent balance cache.
pub struct BalanceCacheService {
    repository: Arc<dyn BalanceRepository>,
    clock: Arc<dyn Clock>,
    ttl: chrono::Duration,
    max_size: usize,
    shards: Box<[RwLock<Shard>]>,
    size: AtomicUsize,
    counters: Counters,
}

impl BalanceCacheService {
    /// Create an empty cache over `repository`.
    #[must_use]
    pub fn new(
        repository: Arc<dyn BalanceRepository>,
        clock: Arc<dyn Clock>,
        config: CacheConfig,
    ) -> Self {
        let shards = (0..config.shard_count.max(1))
            .map(|_| RwLock::new(Shard::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            repository,
            clock,
            ttl: chrono::Duration::from_std(config.ttl()).unwrap_or(chrono::Duration::MAX),
            max_size: config.max_size,
            shards,
            size: AtomicUsize::new(0),
            counters: Counters::default(),
        }
    }

    fn shard(&self, user_id: UserId) -> &RwLock<Shard> {
        let mut hasher = DefaultHasher::new();
        user_id.hash(&mut hasher);
        #[allow(clippy::cast_possible_truncation)]
        let index = hasher.finish() as usize % self.shards.len();
        &self.shards[index]
    }

    fn is_fresh(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        now - entry.cached_at < self.ttl
    }

    /// Balance of `user_id`, from memory when fresh, else from the repository.
    ///
    /// # Errors
    ///
    /// [`CacheError::Retrieval`] if the repository fails. Absence is `Ok(None)`.
    #[tracing::instrument(skip_all, fields(user_id = %user_id))]
    pub async fn get_balance(&self, user_id: UserId) -> Result<Option<BalanceAggregate>, CacheError> {
        let started = Instant::now();
        self.counters.total_operations.fetch_add(1, Ordering::Relaxed);
        let now = self.clock.now();

        let (cached, generation) = {
            let shard = self.shard(user_id).read().unwrap_or_else(PoisonError::into_inner);
            let cached = shard
                .entries
                .get(&user_id)
                .filter(|entry| self.is_fresh(entry, now))
                .map(|entry| entry.balance.clone());
            (cached, shard.generation)
        };
        if let Some(balance) = cached {
            self.record_lookup(true, started.elapsed());
            return Ok(Some(balance));
        }

        self.counters.repository_queries.fetch_add(1, Ordering::Relaxed);
        let loaded = self.repository.find_by_user_id(user_id).await;
        let loaded = match loaded {
            Ok(loaded) => loaded,
            Err(err) => {
                tracing::warn!(user_id = %user_id, error = %err, "Balance lookup failed");
                self.record_lookup(false, started.elapsed());
                return Err(CacheError::Retrieval(err));
            }
        };

        {
            let mut shard = self.shard(user_id).write().unwrap_or_else(PoisonError::into_inner);
            if shard.entries.remove(&user_id).is_some() {
                self.size.fetch_sub(1, Ordering::Relaxed);
            }
            if let Some(balance) = &loaded {
                if shard.generation == generation && self.size.load(Ordering::Relaxed) < self.max_size {
                    shard.entries.insert(
                        user_id,
                        CacheEntry {
                            balance: balance.clone(),
                            cached_at: now,
                        },
                    );
                    self.size.fetch_add(1, Ordering::Relaxed);
                } else {
                    tracing::debug!(user_id = %user_id, "Skipped caching balance");
                }
            }
        }

        self.record_lookup(false, started.elapsed());
        Ok(loaded)
    }

    /// Whether `user_id` has at least `amount` available.
    ///
    /// A missing balance has no funds.
    ///
    /// # Errors
    ///
    /// [`CacheError::Retrieval`] if the repository fails.
    pub async fn check_sufficient_funds(
        &self,
        user_id: UserId,
        amount: Money,
    ) -> Result<bool, CacheError> {
        Ok(self
            .get_balance(user_id)
            .await?
            .is_some_and(|balance| balance.has_sufficient_funds(amount)))
    }

    /// Drop the entry of `user_id` and fence out in-flight loads.
    pub fn invalidate(&self, user_id: UserId) {
        self.counters.total_operations.fetch_add(1, Ordering::Relaxed);
        let mut shard = self.shard(user_id).write().unwrap_or_else(PoisonError::into_inner);
        shard.generation = shard.generation.wrapping_add(1);
        if shard.entries.remove(&user_id).is_some() {
            self.size.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Save through the repository, invalidating before and after the write.
    ///
    /// # Errors
    ///
    /// [`CacheError::Save`] carrying the repository error, including
    /// version conflicts.
    #[tracing::instrument(skip_all, fields(user_id = %balance.user_id()))]
    pub async fn save_balance(
        &self,
        balance: BalanceAggregate,
        expected_version: Version,
    ) -> Result<BalanceAggregate, CacheError> {
        let user_id = balance.user_id();
        self.invalidate(user_id);
        let saved = self.repository.save(balance, expected_version).await;
        self.invalidate(user_id);
        saved.map_err(CacheError::Save)
    }

    /// Remove every expired entry. Returns how many were removed.
    pub fn cleanup_expired_cache(&self) -> usize {
        let now = self.clock.now();
        let removed: usize = self
            .shards
            .iter()
            .map(|shard| {
                let mut shard = shard.write().unwrap_or_else(PoisonError::into_inner);
                let before = shard.entries.len();
                shard.entries.retain(|_, entry| self.is_fresh(entry, now));
                before - shard.entries.len()
            })
            .sum();
        if removed > 0 {
            self.size.fetch_sub(removed, Ordering::Relaxed);
            tracing::debug!(removed, "Expired balance cache entries removed");
        }
        CacheMetrics::record_size(self.len());
        removed
    }

    /// Entries currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the counters.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn metrics(&self) -> CacheMetricsSnapshot {
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let lookups = self.counters.lookups.load(Ordering::Relaxed);
        let micros = self.counters.lookup_micros.load(Ordering::Relaxed);
        CacheMetricsSnapshot {
            hits,
            misses,
            hit_ratio: if hits + misses == 0 {
                0.0
            } else {
                hits as f64 / (hits + misses) as f64
            },
            size: self.len(),
            max_size: self.max_size,
            repository_queries: self.counters.repository_queries.load(Ordering::Relaxed),
            total_operations: self.counters.total_operations.load(Ordering::Relaxed),
            average_response_time: Duration::from_micros(micros.checked_div(lookups).unwrap_or(0)),
        }
    }

    fn record_lookup(&self, hit: bool, elapsed: Duration) {
        if hit {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            CacheMetrics::record_hit(elapsed);
        } else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            CacheMetrics::record_miss(elapsed);
        }
        self.counters.lookups.fetch_add(1, Ordering::Relaxed);
        self.counters
            .lookup_micros
            .fetch_add(u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX), Ordering::Relaxed);
        CacheMetrics::record_size(self.len());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use balance_ledger_core::balance::BalanceEnvironment;
    use balance_ledger_core::ids::TransactionId;
    use balance_ledger_core::money::Currency;
    use balance_ledger_core::policy::BalancePolicy;
    use balance_ledger_core::version::Versioned;
    use balance_ledger_testing::{InMemoryBalanceRepository, ManualClock};

    struct Fixture {
        repo: InMemoryBalanceRepository,
        clock: ManualClock,
        cache: BalanceCacheService,
        env: BalanceEnvironment,
    }

    fn fixture(config: CacheConfig) -> Fixture {
        let repo = InMemoryBalanceRepository::new();
        let clock = ManualClock::starting_at_epoch();
        let cache = BalanceCacheService::new(
            Arc::new(repo.clone()),
            Arc::new(clock.clone()),
            config,
        );
        let env = BalanceEnvironment::new(Arc::new(clock.clone()), Arc::new(BalancePolicy::default()));
        Fixture { repo, clock, cache, env }
    }

    async fn seed(f: &Fixture, user: i64) -> BalanceAggregate {
        let balance = BalanceAggregate::open(UserId::new(user), Currency::USD, &f.env).unwrap();
        f.repo.save(balance, Version::INITIAL).await.unwrap()
    }

    #[tokio::test]
    async fn second_lookup_is_a_hit() {
        let f = fixture(CacheConfig::default());
        seed(&f, 1).await;

        assert!(f.cache.get_balance(UserId::new(1)).await.unwrap().is_some());
        assert!(f.cache.get_balance(UserId::new(1)).await.unwrap().is_some());

        let metrics = f.cache.metrics();
        assert_eq!(metrics.hits, 1);
        assert_eq!(metrics.misses, 1);
        assert_eq!(metrics.repository_queries, 1);
        assert!((metrics.hit_ratio - 0.5).abs() < f64::EPSILON);
        assert_eq!(metrics.size, 1);
    }

    #[tokio::test]
    async fn expired_entries_are_reloaded() {
        let f = fixture(CacheConfig::default());
        seed(&f, 1).await;
        f.cache.get_balance(UserId::new(1)).await.unwrap();

        f.clock.advance(chrono::Duration::minutes(6));
        f.cache.get_balance(UserId::new(1)).await.unwrap();
        assert_eq!(f.cache.metrics().repository_queries, 2);
    }

    #[tokio::test]
    async fn save_invalidates_so_readers_see_the_write() {
        let f = fixture(CacheConfig::default());
        seed(&f, 1).await;
        let mut balance = f.cache.get_balance(UserId::new(1)).await.unwrap().unwrap();

        let version = balance.version();
        balance
            .deposit(
                Money::from_major_units(40, Currency::USD),
                "top up",
                TransactionId::generate(),
                &f.env,
            )
            .unwrap();
        f.cache.save_balance(balance, version).await.unwrap();

        let fresh = f.cache.get_balance(UserId::new(1)).await.unwrap().unwrap();
        assert_eq!(fresh.current_balance(), Money::from_major_units(40, Currency::USD));
    }

    #[tokio::test]
    async fn repository_failure_is_not_a_miss() {
        let f = fixture(CacheConfig::default());
        f.repo.fail_next_operations(1);
        let err = f.cache.get_balance(UserId::new(1)).await.unwrap_err();
        assert!(matches!(err, CacheError::Retrieval(RepositoryError::Unavailable(_))));
    }

    #[tokio::test]
    async fn respects_max_size() {
        let f = fixture(CacheConfig {
            max_size: 1,
            ..CacheConfig::default()
        });
        seed(&f, 1).await;
        seed(&f, 2).await;
        f.cache.get_balance(UserId::new(1)).await.unwrap();
        f.cache.get_balance(UserId::new(2)).await.unwrap();
        assert_eq!(f.cache.len(), 1);
    }

    #[tokio::test]
    async fn cleanup_removes_only_expired() {
        let f = fixture(CacheConfig::default());
        seed(&f, 1).await;
        seed(&f, 2).await;
        f.cache.get_balance(UserId::new(1)).await.unwrap();
        f.clock.advance(chrono::Duration::minutes(4));
        f.cache.get_balance(UserId::new(2)).await.unwrap();
        f.clock.advance(chrono::Duration::minutes(2));

        assert_eq!(f.cache.cleanup_expired_cache(), 1);
        assert_eq!(f.cache.len(), 1);
    }

    #[tokio::test]
    async fn check_sufficient_funds_uses_available_balance() {
        let f = fixture(CacheConfig::default());
        assert!(!f
            .cache
            .check_sufficient_funds(UserId::new(9), Money::from_major_units(1, Currency::USD))
            .await
            .unwrap());

        let mut balance = seed(&f, 9).await;
        let version = balance.version();
        balance
            .deposit(
                Money::from_major_units(10, Currency::USD),
                "seed",
                TransactionId::generate(),
                &f.env,
            )
            .unwrap();
        f.cache.save_balance(balance, version).await.unwrap();

        assert!(f
            .cache
            .check_sufficient_funds(UserId::new(9), Money::from_major_units(10, Currency::USD))
            .await
            .unwrap());
        assert!(!f
            .cache
            .check_sufficient_funds(UserId::new(9), Money::from_major_units(11, Currency::USD))
            .await
            .unwrap());
    }
}
