//! Ledger service: load, mutate, save, publish.
//!
//! The aggregates in `balance-ledger-core` are plain values. This service is
//! the imperative shell around them:
//!
//! 1. Serialize operations per user (one async mutex per user id)
//! 2. Apply velocity and daily limits
//! 3. Load the aggregate, run the operation, write the `PENDING` record
//! 4. Save the aggregate with the version it was loaded at
//! 5. Complete (or fail) the record and publish the events
//!
//! A stale-version save reloads and replays the whole attempt with backoff.
//! Business failures are returned as they are and never retried.
//!
//! # Transaction records
//!
//! Every single-pool mutation is recorded as a [`TransactionAggregate`].
//! Reservations are the exception to "complete right away": their `PURCHASE`
//! record stays `PENDING` until [`LedgerService::capture`] completes it or
//! [`LedgerService::release`] cancels it. A reservation left alone is
//! cancelled by the timeout sweeper, which also releases its hold.
//!
//! Dual-balance pool mutations are recorded the same way, tagged with the
//! pool they hit. Bank-to-main transfers keep their own transfer record.
//! Daily limits are per user and count records from both kinds of balance.

use crate::cache::{BalanceCacheService, CacheError};
use crate::config::LedgerServiceConfig;
use crate::metrics::LedgerMetrics;
use crate::retry::{RetryPolicy, retry_with_predicate};
use balance_ledger_core::balance::{BalanceAggregate, BalanceEnvironment};
use balance_ledger_core::dual_balance::DualBalanceAggregate;
use balance_ledger_core::error::{LedgerError, ValidationError};
use balance_ledger_core::event::{Events, LedgerEvent};
use balance_ledger_core::ids::{OrderId, TransactionId, UserId};
use balance_ledger_core::money::{Currency, Money};
use balance_ledger_core::publisher::{EventPublisher, publish_event};
use balance_ledger_core::repository::{
    BalanceRepository, DualBalanceRepository, Repository, RepositoryError, TransactionRepository,
    TransferRepository,
};
use balance_ledger_core::transaction::{TransactionAggregate, TransactionStatus, TransactionType};
use balance_ledger_core::transfer::BalanceTransferAggregate;
use balance_ledger_core::version::{Version, Versioned};
use chrono::{DateTime, Duration, NaiveTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;

/// Once the lock table tracks this many users, idle entries are dropped.
const USER_LOCK_PRUNE_THRESHOLD: usize = 4_096;

/// Errors returned by [`LedgerService`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerServiceError {
    /// An aggregate or the policy rejected the operation.
    #[error(transparent)]
    Domain(#[from] LedgerError),

    /// The repository failed, or a save hit a stale version.
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    /// The addressed aggregate does not exist (or belongs to another user).
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of aggregate
        entity: &'static str,
        /// Identity or owner that was looked up
        id: String,
    },

    /// The per-user velocity limit rejected the operation.
    #[error("Rate limited: {0}")]
    RateLimited(ValidationError),

    /// Version conflicts persisted through every retry.
    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Attempts made, including the first
        attempts: usize,
        /// Conflict seen on the final attempt
        #[source]
        last: RepositoryError,
    },
}

impl LedgerServiceError {
    /// Whether reloading and replaying the operation may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Repository(err) if err.is_conflict())
    }

    fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    const fn outcome_label(&self) -> &'static str {
        match self {
            Self::Domain(_) | Self::NotFound { .. } => "rejected",
            Self::RateLimited(_) => "rate_limited",
            Self::Repository(_) | Self::RetriesExhausted { .. } => "error",
        }
    }
}

impl From<CacheError> for LedgerServiceError {
    fn from(err: CacheError) -> Self {
        Self::Repository(err.repository_error().clone())
    }
}

/// Result alias for service operations.
pub type ServiceResult<T> = Result<T, LedgerServiceError>;

/// Storage the service writes through.
#[derive(Clone)]
pub struct LedgerRepositories {
    /// Single-pool balances
    pub balances: Arc<dyn BalanceRepository>,
    /// Transaction records
    pub transactions: Arc<dyn TransactionRepository>,
    /// Dual balances
    pub dual_balances: Arc<dyn DualBalanceRepository>,
    /// Transfer records
    pub transfers: Arc<dyn TransferRepository>,
}

/// Result of a single-pool operation.
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceOperationOutcome {
    /// The balance as saved
    pub balance: BalanceAggregate,
    /// The transaction record as saved
    pub transaction: TransactionAggregate,
    /// Everything published for this operation, in order
    pub events: Vec<LedgerEvent>,
}

/// Result of a dual-balance operation.
#[derive(Debug, Clone, PartialEq)]
pub struct DualOperationOutcome {
    /// The dual balance as saved
    pub dual_balance: DualBalanceAggregate,
    /// The pool mutation record as saved, for everything but transfers
    pub transaction: Option<TransactionAggregate>,
    /// The transfer record, for transfers
    pub transfer: Option<BalanceTransferAggregate>,
    /// Everything published for this operation, in order
    pub events: Vec<LedgerEvent>,
}

/// How a reservation is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Capture,
    Release,
}

/// One async mutex per user id.
#[derive(Default)]
struct UserLocks {
    locks: Mutex<HashMap<UserId, Arc<tokio::sync::Mutex<()>>>>,
}

impl UserLocks {
    async fn acquire(&self, user_id: UserId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            if locks.len() > USER_LOCK_PRUNE_THRESHOLD {
                locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            Arc::clone(locks.entry(user_id).or_default())
        };
        lock.lock_owned().await
    }
}

/// Orchestrates balance operations end to end.
pub struct LedgerService {
    repositories: LedgerRepositories,
    cache: Arc<BalanceCacheService>,
    publisher: Arc<dyn EventPublisher>,
    env: BalanceEnvironment,
    config: LedgerServiceConfig,
    retry_policy: RetryPolicy,
    user_locks: UserLocks,
}

impl LedgerService {
    /// Create a service.
    ///
    /// `cache` must front `repositories.balances`; balances are loaded and
    /// saved through it.
    #[must_use]
    pub fn new(
        repositories: LedgerRepositories,
        cache: Arc<BalanceCacheService>,
        publisher: Arc<dyn EventPublisher>,
        env: BalanceEnvironment,
        config: LedgerServiceConfig,
    ) -> Self {
        let retry_policy = config.retry_policy();
        Self {
            repositories,
            cache,
            publisher,
            env,
            config,
            retry_policy,
            user_locks: UserLocks::default(),
        }
    }

    /// The balance cache.
    #[must_use]
    pub const fn cache(&self) -> &Arc<BalanceCacheService> {
        &self.cache
    }

    /// Clock and policy.
    #[must_use]
    pub const fn environment(&self) -> &BalanceEnvironment {
        &self.env
    }

    /// Storage handles.
    #[must_use]
    pub const fn repositories(&self) -> &LedgerRepositories {
        &self.repositories
    }

    // ---------------------------------------------------------------------
    // Single-pool balances
    // ---------------------------------------------------------------------

    /// Open a balance for `user_id`, or return the one already open.
    ///
    /// # Errors
    ///
    /// Unsupported currency, or repository failure.
    #[tracing::instrument(skip_all, fields(user_id = %user_id))]
    pub async fn open_balance(
        &self,
        user_id: UserId,
        currency: Currency,
    ) -> ServiceResult<BalanceAggregate> {
        let _guard = self.user_locks.acquire(user_id).await;
        let result = retry_with_predicate(
            self.retry_policy.clone(),
            || self.open_balance_attempt(user_id, currency),
            LedgerServiceError::is_retryable,
        )
        .await;
        self.finish("open_balance", result)
    }

    /// Current balance of `user_id`.
    ///
    /// # Errors
    ///
    /// [`LedgerServiceError::NotFound`] if the user has no balance.
    pub async fn get_balance(&self, user_id: UserId) -> ServiceResult<BalanceAggregate> {
        self.load_balance(user_id).await
    }

    /// Credit funds.
    ///
    /// `transaction_id` doubles as an idempotency key: a second call with
    /// an id that is already recorded is rejected.
    ///
    /// # Errors
    ///
    /// Policy, rate-limit and daily-limit rejections, inactive balance,
    /// duplicate transaction id, or repository failure.
    #[tracing::instrument(skip_all, fields(user_id = %user_id, amount = %amount))]
    pub async fn deposit(
        &self,
        user_id: UserId,
        amount: Money,
        description: &str,
        transaction_id: Option<TransactionId>,
    ) -> ServiceResult<BalanceOperationOutcome> {
        self.run_balance_operation(
            "deposit",
            user_id,
            transaction_id,
            Some((TransactionType::Deposit, amount)),
            true,
            |balance, id, env| balance.deposit(amount, description, id, env),
        )
        .await
    }

    /// Debit funds.
    ///
    /// # Errors
    ///
    /// Insufficient funds plus everything [`LedgerService::deposit`] can
    /// return.
    #[tracing::instrument(skip_all, fields(user_id = %user_id, amount = %amount))]
    pub async fn withdraw(
        &self,
        user_id: UserId,
        amount: Money,
        description: &str,
        transaction_id: Option<TransactionId>,
    ) -> ServiceResult<BalanceOperationOutcome> {
        self.run_balance_operation(
            "withdraw",
            user_id,
            transaction_id,
            Some((TransactionType::Withdrawal, amount)),
            true,
            |balance, id, env| balance.withdraw(amount, description, id, env),
        )
        .await
    }

    /// Hold funds for an order.
    ///
    /// The returned `PURCHASE` record stays `PENDING`; its id is what
    /// [`LedgerService::capture`] and [`LedgerService::release`] take.
    ///
    /// # Errors
    ///
    /// Same as [`LedgerService::withdraw`].
    #[tracing::instrument(
        skip_all,
        fields(user_id = %user_id, amount = %amount, order_id = %order_id)
    )]
    pub async fn reserve(
        &self,
        user_id: UserId,
        amount: Money,
        order_id: OrderId,
        description: &str,
        transaction_id: Option<TransactionId>,
    ) -> ServiceResult<BalanceOperationOutcome> {
        self.run_balance_operation(
            "reserve",
            user_id,
            transaction_id,
            Some((TransactionType::Purchase, amount)),
            false,
            |balance, id, env| balance.reserve(amount, order_id.clone(), description, id, env),
        )
        .await
    }

    /// Charge the full hold of a reservation and complete its record.
    ///
    /// # Errors
    ///
    /// [`LedgerServiceError::NotFound`] for an unknown reservation, and
    /// [`LedgerError::InvalidTransaction`] unless it is still `PENDING`.
    #[tracing::instrument(skip_all, fields(user_id = %user_id, transaction_id = %transaction_id))]
    pub async fn capture(
        &self,
        user_id: UserId,
        transaction_id: &TransactionId,
        description: &str,
    ) -> ServiceResult<BalanceOperationOutcome> {
        self.settle_reservation("capture", user_id, transaction_id, description, Settlement::Capture)
            .await
    }

    /// Drop the hold of a reservation and cancel its record.
    ///
    /// # Errors
    ///
    /// Same as [`LedgerService::capture`].
    #[tracing::instrument(skip_all, fields(user_id = %user_id, transaction_id = %transaction_id))]
    pub async fn release(
        &self,
        user_id: UserId,
        transaction_id: &TransactionId,
        reason: &str,
    ) -> ServiceResult<BalanceOperationOutcome> {
        self.settle_reservation("release", user_id, transaction_id, reason, Settlement::Release)
            .await
    }

    /// Return funds, optionally against an order.
    ///
    /// # Errors
    ///
    /// Same as [`LedgerService::deposit`], with the withdrawal bounds.
    #[tracing::instrument(skip_all, fields(user_id = %user_id, amount = %amount))]
    pub async fn refund(
        &self,
        user_id: UserId,
        amount: Money,
        description: &str,
        order_id: Option<OrderId>,
        transaction_id: Option<TransactionId>,
    ) -> ServiceResult<BalanceOperationOutcome> {
        self.run_balance_operation(
            "refund",
            user_id,
            transaction_id,
            Some((TransactionType::Refund, amount)),
            true,
            |balance, id, env| balance.refund(amount, description, id, order_id.clone(), env),
        )
        .await
    }

    /// Apply a signed admin correction.
    ///
    /// Adjustments are subject to the velocity limit but not the daily caps.
    ///
    /// # Errors
    ///
    /// Blank admin or reason, a result below zero or below the holds, or
    /// repository failure.
    #[tracing::instrument(skip_all, fields(user_id = %user_id, amount = %amount, admin_user = admin_user))]
    pub async fn adjust(
        &self,
        user_id: UserId,
        amount: Money,
        reason: &str,
        admin_user: &str,
        transaction_id: Option<TransactionId>,
    ) -> ServiceResult<BalanceOperationOutcome> {
        self.run_balance_operation(
            "adjust",
            user_id,
            transaction_id,
            None,
            true,
            |balance, id, env| balance.adjust_balance(amount, reason, admin_user, id, env),
        )
        .await
    }

    /// Disable mutations on a balance. No-op if already inactive.
    ///
    /// # Errors
    ///
    /// Blank admin or reason, unknown balance, or repository failure.
    pub async fn deactivate_balance(
        &self,
        user_id: UserId,
        reason: &str,
        admin_user: &str,
    ) -> ServiceResult<BalanceAggregate> {
        self.set_balance_status(user_id, reason, admin_user, false).await
    }

    /// Re-enable mutations on a balance. No-op if already active.
    ///
    /// # Errors
    ///
    /// Same as [`LedgerService::deactivate_balance`].
    pub async fn activate_balance(
        &self,
        user_id: UserId,
        reason: &str,
        admin_user: &str,
    ) -> ServiceResult<BalanceAggregate> {
        self.set_balance_status(user_id, reason, admin_user, true).await
    }

    /// Reverse a completed transaction with a new, linked record.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InvalidTransaction`] unless the original is `COMPLETED`,
    /// not an adjustment, not a dual-balance pool record, and not already
    /// rolled back. The reversing
    /// operation itself may fail, e.g. with insufficient funds.
    #[tracing::instrument(skip_all, fields(user_id = %user_id, transaction_id = %transaction_id))]
    pub async fn rollback_transaction(
        &self,
        user_id: UserId,
        transaction_id: &TransactionId,
        reason: &str,
    ) -> ServiceResult<BalanceOperationOutcome> {
        let _guard = self.user_locks.acquire(user_id).await;
        if let Err(err) = self.admit(user_id) {
            return self.finish("rollback", Err(err));
        }
        let result = retry_with_predicate(
            self.retry_policy.clone(),
            || self.rollback_attempt(user_id, transaction_id, reason),
            LedgerServiceError::is_retryable,
        )
        .await;
        let result = self.finish("rollback", result);
        if let Ok(outcome) = &result {
            self.publish_all(&outcome.events).await;
        }
        result
    }

    // ---------------------------------------------------------------------
    // Dual balances
    // ---------------------------------------------------------------------

    /// Open a dual balance for `user_id`, or return the one already open.
    ///
    /// # Errors
    ///
    /// Unsupported currency, or repository failure.
    #[tracing::instrument(skip_all, fields(user_id = %user_id))]
    pub async fn open_dual_balance(
        &self,
        user_id: UserId,
        currency: Currency,
    ) -> ServiceResult<DualBalanceAggregate> {
        let _guard = self.user_locks.acquire(user_id).await;
        let result = retry_with_predicate(
            self.retry_policy.clone(),
            || self.open_dual_balance_attempt(user_id, currency),
            LedgerServiceError::is_retryable,
        )
        .await;
        self.finish("open_dual_balance", result)
    }

    /// Current dual balance of `user_id`.
    ///
    /// # Errors
    ///
    /// [`LedgerServiceError::NotFound`] if the user has none.
    pub async fn get_dual_balance(&self, user_id: UserId) -> ServiceResult<DualBalanceAggregate> {
        self.load_dual_balance(user_id).await
    }

    /// Credit the bank pool.
    ///
    /// Like every pool mutation except transfers, this writes a pool-tagged
    /// transaction record and counts toward the user's daily limits.
    ///
    /// # Errors
    ///
    /// Policy, daily-limit and rate-limit rejections, inactive balance, or
    /// repository failure.
    #[tracing::instrument(skip_all, fields(user_id = %user_id, amount = %amount))]
    pub async fn deposit_to_bank(
        &self,
        user_id: UserId,
        amount: Money,
        description: &str,
    ) -> ServiceResult<DualOperationOutcome> {
        let limit = Some((TransactionType::Deposit, amount));
        self.run_dual_operation("deposit_to_bank", user_id, limit, |dual, env| {
            Ok((None, dual.deposit_to_bank_balance(amount, description, env)?))
        })
        .await
    }

    /// Move funds from the bank pool to the main pool and record the transfer.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InsufficientBankFunds`] plus everything
    /// [`LedgerService::deposit_to_bank`] can return.
    #[tracing::instrument(skip_all, fields(user_id = %user_id, amount = %amount))]
    pub async fn transfer_bank_to_main(
        &self,
        user_id: UserId,
        amount: Money,
        description: &str,
    ) -> ServiceResult<DualOperationOutcome> {
        self.run_dual_operation("transfer_bank_to_main", user_id, None, |dual, env| {
            let (transfer, events) = dual.transfer_bank_to_main(amount, description, env)?;
            Ok((Some(transfer), events))
        })
        .await
    }

    /// Pay a purchase from the main pool.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InsufficientMainFunds`] plus everything
    /// [`LedgerService::deposit_to_bank`] can return.
    #[tracing::instrument(skip_all, fields(user_id = %user_id, amount = %amount))]
    pub async fn withdraw_from_main(
        &self,
        user_id: UserId,
        amount: Money,
        description: &str,
        purchase_id: Option<&str>,
    ) -> ServiceResult<DualOperationOutcome> {
        let limit = Some((TransactionType::Purchase, amount));
        self.run_dual_operation("withdraw_from_main", user_id, limit, |dual, env| {
            Ok((None, dual.withdraw_from_main_balance(amount, description, purchase_id, env)?))
        })
        .await
    }

    /// Refund a purchase into the main pool.
    ///
    /// # Errors
    ///
    /// Same as [`LedgerService::deposit_to_bank`].
    #[tracing::instrument(skip_all, fields(user_id = %user_id, amount = %amount))]
    pub async fn refund_to_main(
        &self,
        user_id: UserId,
        amount: Money,
        description: &str,
        purchase_id: Option<&str>,
    ) -> ServiceResult<DualOperationOutcome> {
        let limit = Some((TransactionType::Refund, amount));
        self.run_dual_operation("refund_to_main", user_id, limit, |dual, env| {
            Ok((None, dual.refund_to_main_balance(amount, description, purchase_id, env)?))
        })
        .await
    }

    // ---------------------------------------------------------------------
    // Timeouts
    // ---------------------------------------------------------------------

    /// Cancel up to `limit` `PENDING` transaction records older than
    /// `threshold`. Returns how many were cancelled.
    ///
    /// A timed-out reservation also has its hold released.
    ///
    /// # Errors
    ///
    /// Only if the pending records cannot be listed; failures on individual
    /// records are logged and skipped.
    pub async fn expire_pending_transactions(
        &self,
        threshold: Duration,
        limit: usize,
    ) -> ServiceResult<usize> {
        let now = self.env.clock.now();
        let candidates = self
            .repositories
            .transactions
            .find_pending_created_before(now - threshold, limit)
            .await?;

        let mut expired = 0;
        for candidate in candidates {
            let id = candidate.transaction_id().clone();
            match self.expire_transaction(candidate.user_id(), &id, threshold).await {
                Ok(true) => expired += 1,
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(transaction_id = %id, error = %err, "Failed to expire transaction");
                }
            }
        }
        if expired > 0 {
            LedgerMetrics::record_timed_out("transaction", expired);
        }
        Ok(expired)
    }

    /// Cancel up to `limit` `PENDING` transfers older than `threshold`.
    /// Returns how many were cancelled.
    ///
    /// # Errors
    ///
    /// Only if the pending transfers cannot be listed.
    pub async fn expire_pending_transfers(
        &self,
        threshold: Duration,
        limit: usize,
    ) -> ServiceResult<usize> {
        let now = self.env.clock.now();
        let candidates = self
            .repositories
            .transfers
            .find_pending_created_before(now - threshold, limit)
            .await?;

        let mut expired = 0;
        for mut transfer in candidates {
            let _guard = self.user_locks.acquire(transfer.user_id()).await;
            let version = transfer.version();
            let event = match transfer.timeout_cancel(threshold, self.env.clock.now()) {
                Ok(event) => event,
                Err(err) => {
                    tracing::debug!(transfer_id = %transfer.transfer_id(), error = %err, "Transfer not expired");
                    continue;
                }
            };
            match self.repositories.transfers.save(transfer, version).await {
                Ok(saved) => {
                    expired += 1;
                    tracing::info!(transfer_id = %saved.transfer_id(), "Pending transfer timed out");
                    self.publish_all(std::slice::from_ref(&event)).await;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "Failed to save expired transfer");
                }
            }
        }
        if expired > 0 {
            LedgerMetrics::record_timed_out("transfer", expired);
        }
        Ok(expired)
    }

    // ---------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------

    async fn open_balance_attempt(
        &self,
        user_id: UserId,
        currency: Currency,
    ) -> ServiceResult<BalanceAggregate> {
        if let Some(existing) = self.cache.get_balance(user_id).await? {
            return Ok(existing);
        }
        let balance = BalanceAggregate::open(user_id, currency, &self.env)?;
        let saved = self.save_balance(balance, Version::INITIAL).await?;
        tracing::info!(user_id = %user_id, balance_id = %saved.id(), "Balance opened");
        Ok(saved)
    }

    async fn open_dual_balance_attempt(
        &self,
        user_id: UserId,
        currency: Currency,
    ) -> ServiceResult<DualBalanceAggregate> {
        if let Some(existing) = self.repositories.dual_balances.find_by_user_id(user_id).await? {
            return Ok(existing);
        }
        let dual = DualBalanceAggregate::open(user_id, currency, &self.env)?;
        let saved = self.repositories.dual_balances.save(dual, Version::INITIAL).await?;
        tracing::info!(user_id = %user_id, dual_balance_id = %saved.id(), "Dual balance opened");
        Ok(saved)
    }

    fn admit(&self, user_id: UserId) -> ServiceResult<()> {
        if !self.config.enforce_rate_limit {
            return Ok(());
        }
        self.env
            .policy
            .check_balance_operation(user_id, self.env.clock.now())
            .map_err(LedgerServiceError::RateLimited)
    }

    /// Daily caps, computed from today's (UTC) records that did not fail or
    /// get cancelled.
    async fn check_daily_limits(
        &self,
        user_id: UserId,
        transaction_type: TransactionType,
        amount: Money,
    ) -> ServiceResult<()> {
        let now = self.env.clock.now();
        let today = self
            .repositories
            .transactions
            .find_by_user_id(user_id, start_of_day(now))
            .await?;

        let mut count_today: u32 = 0;
        let mut total_today = Money::zero(amount.currency());
        for record in today.iter().filter(|t| counts_toward_limits(t.status())) {
            count_today = count_today.saturating_add(1);
            if same_direction(record.transaction_type(), transaction_type)
                && record.amount().currency() == amount.currency()
            {
                total_today = total_today
                    .checked_add(record.amount())
                    .map_err(LedgerError::from)?;
            }
        }

        self.env
            .policy
            .validate_daily_limits(transaction_type, amount, total_today, count_today)
            .map_err(|err| LedgerError::from(err).into())
    }

    async fn load_balance(&self, user_id: UserId) -> ServiceResult<BalanceAggregate> {
        self.cache
            .get_balance(user_id)
            .await?
            .ok_or_else(|| LedgerServiceError::not_found("balance", user_id))
    }

    async fn load_dual_balance(&self, user_id: UserId) -> ServiceResult<DualBalanceAggregate> {
        self.repositories
            .dual_balances
            .find_by_user_id(user_id)
            .await?
            .ok_or_else(|| LedgerServiceError::not_found("dual balance", user_id))
    }

    async fn load_user_transaction(
        &self,
        user_id: UserId,
        transaction_id: &TransactionId,
    ) -> ServiceResult<TransactionAggregate> {
        self.repositories
            .transactions
            .find_by_id(transaction_id.clone())
            .await?
            .filter(|t| t.user_id() == user_id)
            .ok_or_else(|| LedgerServiceError::not_found("transaction", transaction_id))
    }

    async fn save_balance(
        &self,
        balance: BalanceAggregate,
        expected: Version,
    ) -> ServiceResult<BalanceAggregate> {
        self.cache.save_balance(balance, expected).await.map_err(|err| {
            if err.is_conflict() {
                LedgerMetrics::record_version_conflict("balance");
            }
            err.into()
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_balance_operation<F>(
        &self,
        operation: &'static str,
        user_id: UserId,
        transaction_id: Option<TransactionId>,
        daily_limit: Option<(TransactionType, Money)>,
        complete: bool,
        apply: F,
    ) -> ServiceResult<BalanceOperationOutcome>
    where
        F: Fn(&mut BalanceAggregate, TransactionId, &BalanceEnvironment) -> balance_ledger_core::Result<Events>,
    {
        let transaction_id = transaction_id.unwrap_or_else(TransactionId::generate);
        let _guard = self.user_locks.acquire(user_id).await;

        if let Err(err) = self.admit(user_id) {
            return self.finish(operation, Err(err));
        }
        if let Some((transaction_type, amount)) = daily_limit {
            if let Err(err) = self.check_daily_limits(user_id, transaction_type, amount).await {
                return self.finish(operation, Err(err));
            }
        }

        let pending_written = AtomicBool::new(false);
        let id = &transaction_id;
        let apply = &apply;
        let written = &pending_written;
        let mut attempt = 0usize;
        let result = retry_with_predicate(
            self.retry_policy.clone(),
            move || {
                let retrying = attempt > 0;
                attempt += 1;
                self.balance_attempt(user_id, id, retrying, complete, written, apply)
            },
            LedgerServiceError::is_retryable,
        )
        .await;

        if let Err(err) = &result {
            if pending_written.load(Ordering::SeqCst) {
                self.fail_pending(&transaction_id, &err.to_string()).await;
            }
        }
        let result = self.finish(operation, result);
        if let Ok(outcome) = &result {
            self.publish_all(&outcome.events).await;
        }
        result
    }

    async fn balance_attempt<F>(
        &self,
        user_id: UserId,
        transaction_id: &TransactionId,
        retrying: bool,
        complete: bool,
        pending_written: &AtomicBool,
        apply: &F,
    ) -> ServiceResult<BalanceOperationOutcome>
    where
        F: Fn(&mut BalanceAggregate, TransactionId, &BalanceEnvironment) -> balance_ledger_core::Result<Events>,
    {
        let mut balance = self.load_balance(user_id).await?;
        let expected = balance.version();
        let balance_events = apply(&mut balance, transaction_id.clone(), &self.env)?;

        let mut pending = None;
        for event in &balance_events {
            pending = balance.pending_transaction(event, Some(self.config.processed_by.as_str()))?;
            if pending.is_some() {
                break;
            }
        }
        let (transaction, created) = pending.ok_or_else(|| {
            LedgerError::invalid_state(
                format!("balance {}", balance.id()),
                "unchanged",
                "a recordable change",
            )
        })?;

        let transaction = self.write_pending(transaction, retrying).await?;
        pending_written.store(true, Ordering::SeqCst);

        let balance = self.save_balance(balance, expected).await?;

        let mut events = Vec::with_capacity(balance_events.len() + 2);
        events.push(created);
        events.extend(balance_events);
        let transaction = if complete {
            self.complete_transaction(transaction, &mut events).await
        } else {
            transaction
        };

        Ok(BalanceOperationOutcome {
            balance,
            transaction,
            events,
        })
    }

    /// Stores a fresh `PENDING` record.
    ///
    /// On a retry the record left by the previous attempt is overwritten; any
    /// other existing record with the same id makes the id a duplicate.
    async fn write_pending(
        &self,
        transaction: TransactionAggregate,
        retrying: bool,
    ) -> ServiceResult<TransactionAggregate> {
        let id = transaction.transaction_id().clone();
        let expected = match self.repositories.transactions.find_by_id(id.clone()).await? {
            None => Version::INITIAL,
            Some(existing) if retrying && existing.status() == TransactionStatus::Pending => {
                existing.version()
            }
            Some(existing) => {
                return Err(LedgerError::invalid_state(
                    format!("transaction {id}"),
                    format!("already recorded as {}", existing.status()),
                    "an unused transaction id",
                )
                .into());
            }
        };
        Ok(self.repositories.transactions.save(transaction, expected).await?)
    }

    /// Completes a record whose balance change has been committed.
    ///
    /// The balance write is the source of truth at this point, so a failed
    /// status save is logged rather than failing the operation.
    async fn complete_transaction(
        &self,
        transaction: TransactionAggregate,
        events: &mut Vec<LedgerEvent>,
    ) -> TransactionAggregate {
        let mut completed = transaction.clone();
        let version = completed.version();
        match completed.complete(self.env.clock.now()) {
            Ok(Some(event)) => match self.repositories.transactions.save(completed, version).await {
                Ok(saved) => {
                    events.push(event);
                    saved
                }
                Err(err) => {
                    tracing::error!(
                        transaction_id = %transaction.transaction_id(),
                        error = %err,
                        "Balance committed but transaction completion was not saved"
                    );
                    transaction
                }
            },
            Ok(None) => transaction,
            Err(err) => {
                tracing::error!(transaction_id = %transaction.transaction_id(), error = %err, "Cannot complete transaction");
                transaction
            }
        }
    }

    /// Marks a `PENDING` record `FAILED` after its operation gave up.
    async fn fail_pending(&self, transaction_id: &TransactionId, reason: &str) {
        let Ok(Some(mut transaction)) = self
            .repositories
            .transactions
            .find_by_id(transaction_id.clone())
            .await
        else {
            return;
        };
        let version = transaction.version();
        match transaction.fail(reason, self.env.clock.now()) {
            Ok(Some(event)) => {
                match self.repositories.transactions.save(transaction, version).await {
                    Ok(_) => self.publish_all(std::slice::from_ref(&event)).await,
                    Err(err) => {
                        tracing::warn!(transaction_id = %transaction_id, error = %err, "Failed to mark transaction FAILED");
                    }
                }
            }
            Ok(None) | Err(_) => {}
        }
    }

    async fn settle_reservation(
        &self,
        operation: &'static str,
        user_id: UserId,
        transaction_id: &TransactionId,
        description: &str,
        settlement: Settlement,
    ) -> ServiceResult<BalanceOperationOutcome> {
        let _guard = self.user_locks.acquire(user_id).await;
        if let Err(err) = self.admit(user_id) {
            return self.finish(operation, Err(err));
        }
        let result = retry_with_predicate(
            self.retry_policy.clone(),
            || self.settle_attempt(user_id, transaction_id, description, settlement),
            LedgerServiceError::is_retryable,
        )
        .await;
        let result = self.finish(operation, result);
        if let Ok(outcome) = &result {
            self.publish_all(&outcome.events).await;
        }
        result
    }

    async fn settle_attempt(
        &self,
        user_id: UserId,
        transaction_id: &TransactionId,
        description: &str,
        settlement: Settlement,
    ) -> ServiceResult<BalanceOperationOutcome> {
        let mut transaction = self.load_user_transaction(user_id, transaction_id).await?;
        let order_id = reservation_order(&transaction)?;

        let mut balance = self.load_balance(user_id).await?;
        let expected = balance.version();
        let amount = transaction.amount();
        let mut events: Vec<LedgerEvent> = match settlement {
            Settlement::Capture => balance.capture_reservation(
                amount,
                order_id,
                description,
                transaction_id.clone(),
                &self.env,
            )?,
            Settlement::Release => {
                balance.release(amount, order_id, description, transaction_id.clone(), &self.env)?
            }
        }
        .into_vec();

        if settlement == Settlement::Capture {
            let (before, after) = applied_snapshot(&events, transaction_id)?;
            transaction.record_applied_snapshot(before, after, self.env.clock.now())?;
        }

        let balance = self.save_balance(balance, expected).await?;

        let transaction = match settlement {
            Settlement::Capture => self.complete_transaction(transaction, &mut events).await,
            Settlement::Release => {
                let version = transaction.version();
                let cancelled = transaction.cancel(description, self.env.clock.now());
                match cancelled {
                    Ok(Some(event)) => {
                        match self.repositories.transactions.save(transaction.clone(), version).await {
                            Ok(saved) => {
                                events.push(event);
                                saved
                            }
                            Err(err) => {
                                tracing::error!(
                                    transaction_id = %transaction_id,
                                    error = %err,
                                    "Hold released but reservation cancel was not saved"
                                );
                                transaction
                            }
                        }
                    }
                    _ => transaction,
                }
            }
        };

        Ok(BalanceOperationOutcome {
            balance,
            transaction,
            events,
        })
    }

    async fn rollback_attempt(
        &self,
        user_id: UserId,
        transaction_id: &TransactionId,
        reason: &str,
    ) -> ServiceResult<BalanceOperationOutcome> {
        let original = self.load_user_transaction(user_id, transaction_id).await?;
        if let Some(pool) = original.pool() {
            return Err(LedgerError::invalid_state(
                format!("transaction {transaction_id}"),
                format!("{pool} pool record"),
                "a single-pool balance record",
            )
            .into());
        }
        let now = self.env.clock.now();
        let (mut rollback, created) = original.create_rollback_transaction(reason, now)?;

        let related = self
            .repositories
            .transactions
            .find_by_user_id(user_id, original.created_at())
            .await?;
        if related.iter().any(|t| {
            t.parent_transaction_id() == Some(original.transaction_id())
                && counts_toward_limits(t.status())
        }) {
            return Err(LedgerError::invalid_state(
                format!("transaction {transaction_id}"),
                "ROLLED_BACK",
                "COMPLETED without an active rollback",
            )
            .into());
        }

        let mut balance = self.load_balance(user_id).await?;
        let expected = balance.version();
        let rollback_id = rollback.transaction_id().clone();
        let amount = rollback.amount();
        let description = rollback.description().to_string();
        let balance_events = match rollback.transaction_type() {
            TransactionType::Deposit => {
                balance.deposit(amount, &description, rollback_id.clone(), &self.env)?
            }
            TransactionType::Withdrawal | TransactionType::Purchase => {
                balance.withdraw(amount, &description, rollback_id.clone(), &self.env)?
            }
            TransactionType::Refund => balance.refund(
                amount,
                &description,
                rollback_id.clone(),
                rollback.order_id().cloned(),
                &self.env,
            )?,
            TransactionType::Adjustment => {
                return Err(LedgerError::invalid_state(
                    format!("transaction {transaction_id}"),
                    TransactionType::Adjustment,
                    "a rollback-eligible type",
                )
                .into());
            }
        };
        let (before, after) = applied_snapshot(&balance_events, &rollback_id)?;
        rollback.record_applied_snapshot(before, after, now)?;

        let rollback = self.repositories.transactions.save(rollback, Version::INITIAL).await?;
        let balance = match self.save_balance(balance, expected).await {
            Ok(balance) => balance,
            Err(err) => {
                // Each attempt builds a new rollback id, so this one is dead.
                self.fail_pending(rollback.transaction_id(), &err.to_string()).await;
                return Err(err);
            }
        };

        let mut events = Vec::with_capacity(balance_events.len() + 2);
        events.push(created);
        events.extend(balance_events);
        let transaction = self.complete_transaction(rollback, &mut events).await;

        tracing::info!(
            original = %transaction_id,
            rollback = %transaction.transaction_id(),
            "Transaction rolled back"
        );
        Ok(BalanceOperationOutcome {
            balance,
            transaction,
            events,
        })
    }

    async fn set_balance_status(
        &self,
        user_id: UserId,
        reason: &str,
        admin_user: &str,
        active: bool,
    ) -> ServiceResult<BalanceAggregate> {
        let operation = if active { "activate" } else { "deactivate" };
        let _guard = self.user_locks.acquire(user_id).await;
        let result = retry_with_predicate(
            self.retry_policy.clone(),
            || self.status_attempt(user_id, reason, admin_user, active),
            LedgerServiceError::is_retryable,
        )
        .await;

        let (balance, events) = self.finish(operation, result)?;
        if !events.is_empty() {
            tracing::info!(user_id = %user_id, admin_user, active, "Balance status changed");
            self.publish_all(&events).await;
        }
        Ok(balance)
    }

    async fn status_attempt(
        &self,
        user_id: UserId,
        reason: &str,
        admin_user: &str,
        active: bool,
    ) -> ServiceResult<(BalanceAggregate, Events)> {
        let mut balance = self.load_balance(user_id).await?;
        let expected = balance.version();
        let events = if active {
            balance.activate(reason, admin_user, &self.env)?
        } else {
            balance.deactivate(reason, admin_user, &self.env)?
        };
        if events.is_empty() {
            return Ok((balance, events));
        }
        let saved = self.save_balance(balance, expected).await?;
        Ok((saved, events))
    }

    async fn run_dual_operation<F>(
        &self,
        operation: &'static str,
        user_id: UserId,
        daily_limit: Option<(TransactionType, Money)>,
        apply: F,
    ) -> ServiceResult<DualOperationOutcome>
    where
        F: Fn(
            &mut DualBalanceAggregate,
            &BalanceEnvironment,
        ) -> balance_ledger_core::Result<(Option<BalanceTransferAggregate>, Events)>,
    {
        let transaction_id = TransactionId::generate();
        let _guard = self.user_locks.acquire(user_id).await;
        if let Err(err) = self.admit(user_id) {
            return self.finish(operation, Err(err));
        }
        if let Some((transaction_type, amount)) = daily_limit {
            if let Err(err) = self.check_daily_limits(user_id, transaction_type, amount).await {
                return self.finish(operation, Err(err));
            }
        }

        let pending_written = AtomicBool::new(false);
        let id = &transaction_id;
        let apply = &apply;
        let written = &pending_written;
        let mut attempt = 0usize;
        let result = retry_with_predicate(
            self.retry_policy.clone(),
            move || {
                let retrying = attempt > 0;
                attempt += 1;
                self.dual_attempt(user_id, id, retrying, written, apply)
            },
            LedgerServiceError::is_retryable,
        )
        .await;

        if let Err(err) = &result {
            if pending_written.load(Ordering::SeqCst) {
                self.fail_pending(&transaction_id, &err.to_string()).await;
            }
        }
        let result = self.finish(operation, result);
        if let Ok(outcome) = &result {
            self.publish_all(&outcome.events).await;
        }
        result
    }

    async fn dual_attempt<F>(
        &self,
        user_id: UserId,
        transaction_id: &TransactionId,
        retrying: bool,
        pending_written: &AtomicBool,
        apply: &F,
    ) -> ServiceResult<DualOperationOutcome>
    where
        F: Fn(
            &mut DualBalanceAggregate,
            &BalanceEnvironment,
        ) -> balance_ledger_core::Result<(Option<BalanceTransferAggregate>, Events)>,
    {
        let mut dual = self.load_dual_balance(user_id).await?;
        let expected = dual.version();
        let (transfer, dual_events) = apply(&mut dual, &self.env)?;

        let mut pending = None;
        for event in &dual_events {
            pending = dual.pending_transaction(
                event,
                transaction_id.clone(),
                Some(self.config.processed_by.as_str()),
            )?;
            if pending.is_some() {
                break;
            }
        }

        let mut events = Vec::with_capacity(dual_events.len() + 2);
        let transaction = match pending {
            Some((transaction, created)) => {
                let transaction = self.write_pending(transaction, retrying).await?;
                pending_written.store(true, Ordering::SeqCst);
                events.push(created);
                Some(transaction)
            }
            None => None,
        };

        let dual_balance = self
            .repositories
            .dual_balances
            .save(dual, expected)
            .await
            .inspect_err(|err| {
                if err.is_conflict() {
                    LedgerMetrics::record_version_conflict("dual_balance");
                }
            })?;
        events.extend(dual_events);

        let transaction = match transaction {
            Some(transaction) => Some(self.complete_transaction(transaction, &mut events).await),
            None => None,
        };

        // The pools are committed; a lost transfer record is logged, not fatal.
        let transfer = match transfer {
            Some(transfer) => {
                let transfer_id = transfer.transfer_id();
                match self.repositories.transfers.save(transfer.clone(), Version::INITIAL).await {
                    Ok(saved) => Some(saved),
                    Err(err) => {
                        tracing::error!(
                            transfer_id = %transfer_id,
                            error = %err,
                            "Pools updated but transfer record was not saved"
                        );
                        Some(transfer)
                    }
                }
            }
            None => None,
        };

        Ok(DualOperationOutcome {
            dual_balance,
            transaction,
            transfer,
            events,
        })
    }

    async fn expire_transaction(
        &self,
        user_id: UserId,
        transaction_id: &TransactionId,
        threshold: Duration,
    ) -> ServiceResult<bool> {
        let _guard = self.user_locks.acquire(user_id).await;

        // Reload under the lock; it may have been settled since it was listed.
        let mut transaction = self.load_user_transaction(user_id, transaction_id).await?;
        let now = self.env.clock.now();
        if !transaction.is_timed_out(threshold, now) {
            return Ok(false);
        }

        let mut events = Vec::new();
        if let Ok(order_id) = reservation_order(&transaction) {
            let released = retry_with_predicate(
                self.retry_policy.clone(),
                || self.release_expired_hold(user_id, &transaction, order_id.clone()),
                LedgerServiceError::is_retryable,
            )
            .await;
            match released {
                Ok(released) => events.extend(released),
                // The record is cancelled regardless; the hold stays on the
                // balance until an admin releases it.
                Err(LedgerServiceError::Domain(err)) => {
                    LedgerMetrics::record_stuck_hold();
                    tracing::error!(
                        user_id = %user_id,
                        transaction_id = %transaction_id,
                        amount = %transaction.amount(),
                        error = %err,
                        "Expired reservation cancelled but its hold could not be released"
                    );
                }
                Err(err) => return Err(err),
            }
        }

        let version = transaction.version();
        let cancelled = transaction.timeout_cancel(threshold, now)?;
        self.repositories.transactions.save(transaction, version).await?;
        events.push(cancelled);

        tracing::info!(transaction_id = %transaction_id, "Pending transaction timed out");
        self.publish_all(&events).await;
        Ok(true)
    }

    /// Releases what is left of an expired reservation's hold.
    async fn release_expired_hold(
        &self,
        user_id: UserId,
        transaction: &TransactionAggregate,
        order_id: OrderId,
    ) -> ServiceResult<Vec<LedgerEvent>> {
        let mut balance = self.load_balance(user_id).await?;
        let amount = transaction.amount().min(balance.reserved_amount()).map_err(LedgerError::from)?;
        if !amount.is_positive() {
            tracing::warn!(transaction_id = %transaction.transaction_id(), "Expired reservation has no hold left");
            return Ok(Vec::new());
        }
        let expected = balance.version();
        let events = balance.release(
            amount,
            order_id,
            "Reservation expired",
            transaction.transaction_id().clone(),
            &self.env,
        )?;
        self.save_balance(balance, expected).await?;
        Ok(events.into_vec())
    }

    fn finish<T>(&self, operation: &'static str, result: ServiceResult<T>) -> ServiceResult<T> {
        match result {
            Ok(value) => {
                LedgerMetrics::record_operation(operation, "ok");
                Ok(value)
            }
            Err(err) => {
                LedgerMetrics::record_operation(operation, err.outcome_label());
                let err = match err {
                    LedgerServiceError::Repository(last) if last.is_conflict() => {
                        LedgerServiceError::RetriesExhausted {
                            attempts: self.retry_policy.max_retries + 1,
                            last,
                        }
                    }
                    other => other,
                };
                if matches!(err, LedgerServiceError::Domain(_) | LedgerServiceError::RateLimited(_)) {
                    tracing::debug!(operation, error = %err, "Operation rejected");
                } else {
                    tracing::warn!(operation, error = %err, "Operation failed");
                }
                Err(err)
            }
        }
    }

    async fn publish_all(&self, events: &[LedgerEvent]) {
        for event in events {
            if let Err(err) = publish_event(self.publisher.as_ref(), event, None).await {
                tracing::warn!(error = %err, "Failed to publish ledger event");
            }
        }
    }
}

/// The order of a `PENDING` reservation record.
/// Before and after of the balance change recorded under `transaction_id`.
fn applied_snapshot<'a>(
    events: impl IntoIterator<Item = &'a LedgerEvent>,
    transaction_id: &TransactionId,
) -> ServiceResult<(Money, Money)> {
    events
        .into_iter()
        .find_map(|event| match event {
            LedgerEvent::BalanceChanged {
                transaction_id: id,
                balance_before,
                balance_after,
                ..
            } if id == transaction_id => Some((*balance_before, *balance_after)),
            _ => None,
        })
        .ok_or_else(|| {
            LedgerError::invalid_state(
                format!("transaction {transaction_id}"),
                "NO_BALANCE_CHANGE",
                "a recorded balance change",
            )
            .into()
        })
}

fn reservation_order(transaction: &TransactionAggregate) -> ServiceResult<OrderId> {
    let entity = format!("transaction {}", transaction.transaction_id());
    if transaction.status() != TransactionStatus::Pending {
        return Err(LedgerError::invalid_state(entity, transaction.status(), "PENDING").into());
    }
    match (transaction.transaction_type(), transaction.order_id()) {
        (TransactionType::Purchase, Some(order_id)) if transaction.pool().is_none() => {
            Ok(order_id.clone())
        }
        (transaction_type, _) => {
            Err(LedgerError::invalid_state(entity, transaction_type, "a PURCHASE reservation").into())
        }
    }
}

/// Cancelled and failed records never moved money.
const fn counts_toward_limits(status: TransactionStatus) -> bool {
    !matches!(status, TransactionStatus::Cancelled | TransactionStatus::Failed)
}

const fn same_direction(recorded: TransactionType, requested: TransactionType) -> bool {
    matches!(
        (recorded, requested),
        (TransactionType::Deposit, TransactionType::Deposit)
            | (
                TransactionType::Withdrawal | TransactionType::Purchase,
                TransactionType::Withdrawal | TransactionType::Purchase
            )
    )
}

fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive().and_time(NaiveTime::MIN).and_utc()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn only_conflicts_are_retryable() {
        let conflict = LedgerServiceError::Repository(RepositoryError::ConcurrencyConflict {
            entity: "balance",
            id: "b".to_string(),
            expected: Version::new(1),
            actual: Version::new(2),
        });
        assert!(conflict.is_retryable());
        assert!(!LedgerServiceError::Repository(RepositoryError::Unavailable("x".into())).is_retryable());
        assert!(!LedgerServiceError::not_found("balance", 1).is_retryable());
    }

    #[test]
    fn directions_group_withdrawals_and_purchases() {
        assert!(same_direction(TransactionType::Purchase, TransactionType::Withdrawal));
        assert!(!same_direction(TransactionType::Deposit, TransactionType::Withdrawal));
        assert!(!same_direction(TransactionType::Refund, TransactionType::Refund));
    }

    #[test]
    fn start_of_day_truncates_to_utc_midnight() {
        let now = Utc.with_ymd_and_hms(2025, 3, 9, 17, 45, 12).unwrap();
        assert_eq!(start_of_day(now), Utc.with_ymd_and_hms(2025, 3, 9, 0, 0, 0).unwrap());
    }
}
