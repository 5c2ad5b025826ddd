//! Transaction records and their status state machine.
//!
//! One [`TransactionAggregate`] is written per balance mutation attempt. It is
//! created `PENDING` and moves exactly once to a terminal status:
//!
//! ```text
//! PENDING ──► COMPLETED
//!    │
//!    ├──────► CANCELLED
//!    │
//!    └──────► FAILED
//! ```
//!
//! Repeating a transition to the status a record already has is a no-op;
//! any other transition out of a terminal status is rejected.

use crate::error::{LedgerError, Result, ValidationCode, ValidationError};
use crate::event::LedgerEvent;
use crate::ids::{OrderId, TransactionId, UserId};
use crate::money::Money;
use crate::transfer::BalanceType;
use crate::version::{Version, Versioned};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default age after which a pending balance transaction may be cancelled.
pub const DEFAULT_TIMEOUT_MINUTES: i64 = 30;

/// Kind of balance mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    /// Funds added from outside
    Deposit,
    /// Funds paid out
    Withdrawal,
    /// Funds spent on an order
    Purchase,
    /// Funds returned for an order
    Refund,
    /// Signed manual correction by an administrator
    Adjustment,
}

impl TransactionType {
    /// The type that reverses this one, if any.
    ///
    /// Adjustments have no inverse.
    #[must_use]
    pub const fn inverse(self) -> Option<Self> {
        match self {
            Self::Deposit => Some(Self::Withdrawal),
            Self::Withdrawal => Some(Self::Deposit),
            Self::Purchase => Some(Self::Refund),
            Self::Refund => Some(Self::Purchase),
            Self::Adjustment => None,
        }
    }

    /// Applies the direction of this type to `amount`.
    ///
    /// Credits keep the sign, debits negate it, adjustments pass the signed
    /// amount through unchanged.
    #[must_use]
    pub fn signed(self, amount: Money) -> Money {
        match self {
            Self::Deposit | Self::Refund => amount.abs(),
            Self::Withdrawal | Self::Purchase => amount.abs().negate(),
            Self::Adjustment => amount,
        }
    }

    /// Stable upper-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Deposit => "DEPOSIT",
            Self::Withdrawal => "WITHDRAWAL",
            Self::Purchase => "PURCHASE",
            Self::Refund => "REFUND",
            Self::Adjustment => "ADJUSTMENT",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status shared by transactions and transfers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    /// Created, awaiting an outcome
    Pending,
    /// Applied successfully
    Completed,
    /// Abandoned before completion (by a caller or the timeout sweep)
    Cancelled,
    /// Could not be applied
    Failed,
}

impl TransactionStatus {
    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Stable upper-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of [`validate_can_change_status`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusChange {
    /// The transition must be applied.
    Apply,
    /// The entity is already in the target status; nothing to do.
    AlreadyApplied,
}

/// Guard shared by every status transition, including timeout cancellation.
///
/// # Errors
///
/// [`LedgerError::InvalidTransaction`] when `current` is terminal and differs
/// from `target`, or when `target` is `Pending`.
pub fn validate_can_change_status(
    entity: &str,
    current: TransactionStatus,
    target: TransactionStatus,
) -> Result<StatusChange> {
    if target == TransactionStatus::Pending {
        return Err(LedgerError::invalid_state(entity, current, "a terminal target status"));
    }
    if current == target {
        return Ok(StatusChange::AlreadyApplied);
    }
    if current.is_terminal() {
        return Err(LedgerError::invalid_state(entity, current, "PENDING"));
    }
    Ok(StatusChange::Apply)
}

/// Input for [`TransactionAggregate::create`].
#[derive(Clone, Debug)]
pub struct NewTransaction {
    /// Identity; generate one with [`TransactionId::generate`]
    pub transaction_id: TransactionId,
    /// Owner
    pub user_id: UserId,
    /// Kind of mutation
    pub transaction_type: TransactionType,
    /// Amount, signed only for adjustments
    pub amount: Money,
    /// Balance before the mutation
    pub balance_before: Money,
    /// Balance after the mutation
    pub balance_after: Money,
    /// Related order
    pub order_id: Option<OrderId>,
    /// Free-text description
    pub description: String,
    /// Operator who triggered the mutation
    pub processed_by: Option<String>,
}

/// Audit record of one balance mutation attempt.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransactionAggregate {
    transaction_id: TransactionId,
    user_id: UserId,
    transaction_type: TransactionType,
    amount: Money,
    balance_before: Money,
    balance_after: Money,
    status: TransactionStatus,
    order_id: Option<OrderId>,
    description: String,
    processed_by: Option<String>,
    failure_reason: Option<String>,
    parent_transaction_id: Option<TransactionId>,
    /// Dual-balance pool the mutation hit; `None` for single-pool balances
    #[serde(default)]
    pool: Option<BalanceType>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    version: Version,
}

impl TransactionAggregate {
    /// Creates a `PENDING` record.
    ///
    /// # Errors
    ///
    /// - [`ValidationCode::AmountNotPositive`] for a zero amount, or a
    ///   negative one on any type but `ADJUSTMENT`
    /// - [`ValidationCode::CurrencyMismatch`] if the snapshots and amount
    ///   disagree on currency
    /// - [`ValidationCode::InconsistentSnapshot`] unless
    ///   `balance_after - balance_before` equals the signed amount
    pub fn create(new: NewTransaction, now: DateTime<Utc>) -> Result<(Self, LedgerEvent)> {
        let negative_allowed = new.transaction_type == TransactionType::Adjustment;
        if new.amount.is_zero() || (new.amount.is_negative() && !negative_allowed) {
            return Err(ValidationError::new(
                ValidationCode::AmountNotPositive,
                new.amount,
                if negative_allowed { "!= 0" } else { "> 0" },
            )
            .into());
        }

        check_snapshot(
            new.transaction_type,
            new.amount,
            new.balance_before,
            new.balance_after,
        )?;

        let transaction = Self {
            transaction_id: new.transaction_id,
            user_id: new.user_id,
            transaction_type: new.transaction_type,
            amount: new.amount,
            balance_before: new.balance_before,
            balance_after: new.balance_after,
            status: TransactionStatus::Pending,
            order_id: new.order_id,
            description: new.description,
            processed_by: new.processed_by,
            failure_reason: None,
            parent_transaction_id: None,
            pool: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            version: Version::INITIAL,
        };
        let event = LedgerEvent::TransactionCreated {
            transaction_id: transaction.transaction_id.clone(),
            user_id: transaction.user_id,
            transaction_type: transaction.transaction_type,
            amount: transaction.amount,
            status: transaction.status,
            timestamp: now,
        };
        Ok((transaction, event))
    }

    /// Tags the record with the dual-balance pool it describes.
    #[must_use]
    pub const fn with_pool(mut self, pool: BalanceType) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Re-bases a `PENDING` record on the balance change actually applied.
    ///
    /// Reservations and rollbacks are recorded before the balance mutation
    /// they describe; other writes may land in between, so the final
    /// snapshot is taken from the mutation itself.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InvalidTransaction`] unless the record is `PENDING`
    /// - [`ValidationCode::InconsistentSnapshot`] unless
    ///   `balance_after - balance_before` equals the signed amount
    pub fn record_applied_snapshot(
        &mut self,
        balance_before: Money,
        balance_after: Money,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if self.status != TransactionStatus::Pending {
            return Err(LedgerError::invalid_state(self.entity(), self.status, "PENDING"));
        }
        check_snapshot(self.transaction_type, self.amount, balance_before, balance_after)?;
        self.balance_before = balance_before;
        self.balance_after = balance_after;
        self.updated_at = now;
        Ok(())
    }

    /// Marks the record `COMPLETED`.
    ///
    /// Returns `None` if it already was.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InvalidTransaction`] if the record is cancelled or failed.
    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<Option<LedgerEvent>> {
        if self.transition(TransactionStatus::Completed, now)? == StatusChange::AlreadyApplied {
            return Ok(None);
        }
        self.completed_at = Some(now);
        Ok(Some(LedgerEvent::TransactionCompleted {
            transaction_id: self.transaction_id.clone(),
            status: self.status,
            timestamp: now,
        }))
    }

    /// Marks the record `CANCELLED`.
    ///
    /// Returns `None` if it already was.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InvalidTransaction`] if the record is completed or failed.
    pub fn cancel(&mut self, reason: &str, now: DateTime<Utc>) -> Result<Option<LedgerEvent>> {
        if self.transition(TransactionStatus::Cancelled, now)? == StatusChange::AlreadyApplied {
            return Ok(None);
        }
        self.failure_reason = Some(reason.to_string());
        Ok(Some(LedgerEvent::TransactionCancelled {
            transaction_id: self.transaction_id.clone(),
            status: self.status,
            reason: reason.to_string(),
            timestamp: now,
        }))
    }

    /// Marks the record `FAILED`.
    ///
    /// Returns `None` if it already was.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InvalidTransaction`] if the record is completed or cancelled.
    pub fn fail(&mut self, reason: &str, now: DateTime<Utc>) -> Result<Option<LedgerEvent>> {
        if self.transition(TransactionStatus::Failed, now)? == StatusChange::AlreadyApplied {
            return Ok(None);
        }
        self.failure_reason = Some(reason.to_string());
        Ok(Some(LedgerEvent::TransactionFailed {
            transaction_id: self.transaction_id.clone(),
            status: self.status,
            reason: reason.to_string(),
            timestamp: now,
        }))
    }

    fn transition(&mut self, target: TransactionStatus, now: DateTime<Utc>) -> Result<StatusChange> {
        let change = validate_can_change_status(&self.entity(), self.status, target)?;
        if change == StatusChange::Apply {
            self.status = target;
            self.updated_at = now;
        }
        Ok(change)
    }

    /// True only while `PENDING` and older than `threshold`.
    #[must_use]
    pub fn is_timed_out(&self, threshold: Duration, now: DateTime<Utc>) -> bool {
        self.status == TransactionStatus::Pending && now - self.created_at > threshold
    }

    /// Cancels a pending record that outlived `threshold`.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InvalidTransaction`] if the record is terminal or has
    /// not timed out yet.
    pub fn timeout_cancel(&mut self, threshold: Duration, now: DateTime<Utc>) -> Result<LedgerEvent> {
        validate_can_change_status(&self.entity(), self.status, TransactionStatus::Cancelled)?;
        if !self.is_timed_out(threshold, now) {
            return Err(LedgerError::invalid_state(
                self.entity(),
                format!("{} for {}m", self.status, (now - self.created_at).num_minutes()),
                format!("{} for more than {}m", TransactionStatus::Pending, threshold.num_minutes()),
            ));
        }
        let reason = format!("Timed out after {} minutes", threshold.num_minutes());
        self.cancel(&reason, now)?
            .ok_or_else(|| LedgerError::invalid_state(self.entity(), self.status, "PENDING"))
    }

    /// Builds the `PENDING` record that reverses this one.
    ///
    /// The type is inverted and the before/after balances are swapped, so
    /// applying it restores the balance this record started from.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InvalidTransaction`] unless the record is `COMPLETED`
    /// and not an `ADJUSTMENT`.
    pub fn create_rollback_transaction(
        &self,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(Self, LedgerEvent)> {
        if self.status != TransactionStatus::Completed {
            return Err(LedgerError::invalid_state(
                self.entity(),
                self.status,
                "COMPLETED",
            ));
        }
        let inverse = self.transaction_type.inverse().ok_or_else(|| {
            LedgerError::invalid_state(
                self.entity(),
                self.transaction_type,
                "a rollback-eligible type",
            )
        })?;

        let (mut rollback, event) = Self::create(
            NewTransaction {
                transaction_id: TransactionId::generate(),
                user_id: self.user_id,
                transaction_type: inverse,
                amount: self.amount,
                balance_before: self.balance_after,
                balance_after: self.balance_before,
                order_id: self.order_id.clone(),
                description: format!("Rollback of {}: {reason}", self.transaction_id),
                processed_by: self.processed_by.clone(),
            },
            now,
        )?;
        rollback.parent_transaction_id = Some(self.transaction_id.clone());
        rollback.pool = self.pool;
        Ok((rollback, event))
    }

    fn entity(&self) -> String {
        format!("transaction {}", self.transaction_id)
    }

    /// Identity.
    #[must_use]
    pub const fn transaction_id(&self) -> &TransactionId {
        &self.transaction_id
    }

    /// Owner.
    #[must_use]
    pub const fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Kind of mutation.
    #[must_use]
    pub const fn transaction_type(&self) -> TransactionType {
        self.transaction_type
    }

    /// Amount as recorded (signed only for adjustments).
    #[must_use]
    pub const fn amount(&self) -> Money {
        self.amount
    }

    /// Amount with the direction of the type applied.
    #[must_use]
    pub fn signed_amount(&self) -> Money {
        self.transaction_type.signed(self.amount)
    }

    /// Balance before the mutation.
    #[must_use]
    pub const fn balance_before(&self) -> Money {
        self.balance_before
    }

    /// Balance after the mutation.
    #[must_use]
    pub const fn balance_after(&self) -> Money {
        self.balance_after
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> TransactionStatus {
        self.status
    }

    /// Whether the status is terminal.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Related order.
    #[must_use]
    pub const fn order_id(&self) -> Option<&OrderId> {
        self.order_id.as_ref()
    }

    /// Free-text description.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Operator who triggered the mutation.
    #[must_use]
    pub fn processed_by(&self) -> Option<&str> {
        self.processed_by.as_deref()
    }

    /// Why the record was cancelled or failed.
    #[must_use]
    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    /// The record this one rolls back.
    #[must_use]
    pub const fn parent_transaction_id(&self) -> Option<&TransactionId> {
        self.parent_transaction_id.as_ref()
    }

    /// Dual-balance pool, if this records a pool mutation.
    #[must_use]
    pub const fn pool(&self) -> Option<BalanceType> {
        self.pool
    }

    /// Creation time.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Time of the last status change.
    #[must_use]
    pub const fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Completion time, once completed.
    #[must_use]
    pub const fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }
}

impl Versioned for TransactionAggregate {
    fn version(&self) -> Version {
        self.version
    }

    fn set_version(&mut self, version: Version) {
        self.version = version;
    }
}

fn check_snapshot(
    transaction_type: TransactionType,
    amount: Money,
    balance_before: Money,
    balance_after: Money,
) -> Result<()> {
    let delta = balance_after
        .checked_sub(balance_before)
        .map_err(|_| currency_mismatch(balance_before, balance_after))?;
    let expected = transaction_type.signed(amount);
    if delta.currency() != expected.currency() {
        return Err(currency_mismatch(balance_before, amount).into());
    }
    if delta != expected {
        return Err(ValidationError::new(
            ValidationCode::InconsistentSnapshot,
            format!("{balance_before} -> {balance_after}"),
            format!("difference of {expected} for {transaction_type}"),
        )
        .into());
    }
    Ok(())
}

/// Default pending timeout for balance transactions.
#[must_use]
pub fn default_timeout() -> Duration {
    Duration::minutes(DEFAULT_TIMEOUT_MINUTES)
}

fn currency_mismatch(left: Money, right: Money) -> ValidationError {
    crate::policy::currency_mismatch(left.currency(), right.currency())
}
