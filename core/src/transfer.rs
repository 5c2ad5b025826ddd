//! Pool-to-pool transfer records.
//!
//! A [`BalanceTransferAggregate`] audits one movement between the bank and
//! main pools of a dual balance. It follows the same status state machine as
//! [`TransactionAggregate`](crate::transaction::TransactionAggregate), with a
//! shorter default timeout.

use crate::error::{LedgerError, Result, ValidationCode, ValidationError};
use crate::event::{LedgerEvent, PoolSnapshot};
use crate::ids::{DualBalanceId, TransferId, UserId};
use crate::money::Money;
use crate::transaction::{StatusChange, TransactionStatus, validate_can_change_status};
use crate::version::{Version, Versioned};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default age after which a pending transfer may be cancelled.
pub const DEFAULT_TRANSFER_TIMEOUT_MINUTES: i64 = 15;

/// One of the two pools of a dual balance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BalanceType {
    /// Inbound funding pool
    Bank,
    /// Spendable pool
    Main,
}

impl BalanceType {
    /// The other pool.
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Bank => Self::Main,
            Self::Main => Self::Bank,
        }
    }
}

impl fmt::Display for BalanceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Bank => "BANK",
            Self::Main => "MAIN",
        })
    }
}

/// Pool balances on both sides of a transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferSnapshots {
    /// Source pool before
    pub from_before: Money,
    /// Source pool after
    pub from_after: Money,
    /// Destination pool before
    pub to_before: Money,
    /// Destination pool after
    pub to_after: Money,
}

/// Audit record of one transfer between pools.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BalanceTransferAggregate {
    transfer_id: TransferId,
    dual_balance_id: DualBalanceId,
    user_id: UserId,
    from_type: BalanceType,
    to_type: BalanceType,
    amount: Money,
    from_before: Money,
    from_after: Money,
    to_before: Money,
    to_after: Money,
    status: TransactionStatus,
    description: String,
    failure_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    version: Version,
}

impl BalanceTransferAggregate {
    /// Starts a `PENDING` transfer and returns the initiation event.
    ///
    /// # Errors
    ///
    /// - [`ValidationCode::InvalidTransferDirection`] if `from == to`
    /// - [`ValidationCode::AmountNotPositive`] for a non-positive amount
    /// - [`ValidationCode::InconsistentSnapshot`] unless the source drops and
    ///   the destination grows by exactly `amount`
    #[allow(clippy::too_many_arguments)]
    pub fn initiate(
        dual_balance_id: DualBalanceId,
        user_id: UserId,
        from_type: BalanceType,
        to_type: BalanceType,
        amount: Money,
        snapshots: TransferSnapshots,
        description: &str,
        now: DateTime<Utc>,
    ) -> Result<(Self, LedgerEvent)> {
        if from_type == to_type {
            return Err(ValidationError::new(
                ValidationCode::InvalidTransferDirection,
                format!("{from_type} -> {to_type}"),
                "distinct pools",
            )
            .into());
        }
        if !amount.is_positive() {
            return Err(ValidationError::new(ValidationCode::AmountNotPositive, amount, "> 0").into());
        }
        let from_delta = snapshots.from_before.checked_sub(snapshots.from_after)?;
        let to_delta = snapshots.to_after.checked_sub(snapshots.to_before)?;
        if from_delta != amount || to_delta != amount {
            return Err(ValidationError::new(
                ValidationCode::InconsistentSnapshot,
                format!("-{from_delta} / +{to_delta}"),
                format!("-{amount} / +{amount}"),
            )
            .into());
        }

        let transfer = Self {
            transfer_id: TransferId::new(),
            dual_balance_id,
            user_id,
            from_type,
            to_type,
            amount,
            from_before: snapshots.from_before,
            from_after: snapshots.from_after,
            to_before: snapshots.to_before,
            to_after: snapshots.to_after,
            status: TransactionStatus::Pending,
            description: description.to_string(),
            failure_reason: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            version: Version::INITIAL,
        };
        let (before, after) = transfer.pool_snapshots();
        let event = LedgerEvent::BalanceTransferInitiated {
            dual_balance_id,
            user_id,
            from_type,
            to_type,
            amount,
            before,
            after,
            transfer_id: transfer.transfer_id,
            occurred_at: now,
        };
        Ok((transfer, event))
    }

    /// Marks the transfer `COMPLETED`. Returns `None` if it already was.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InvalidTransaction`] if cancelled or failed.
    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<Option<LedgerEvent>> {
        if self.transition(TransactionStatus::Completed, now)? == StatusChange::AlreadyApplied {
            return Ok(None);
        }
        self.completed_at = Some(now);
        let (before, after) = self.pool_snapshots();
        Ok(Some(LedgerEvent::BalanceTransferCompleted {
            dual_balance_id: self.dual_balance_id,
            user_id: self.user_id,
            from_type: self.from_type,
            to_type: self.to_type,
            amount: self.amount,
            before,
            after,
            transfer_id: self.transfer_id,
            occurred_at: now,
        }))
    }

    /// Marks the transfer `CANCELLED`. Returns `None` if it already was.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InvalidTransaction`] if completed or failed.
    pub fn cancel(&mut self, reason: &str, now: DateTime<Utc>) -> Result<Option<LedgerEvent>> {
        if self.transition(TransactionStatus::Cancelled, now)? == StatusChange::AlreadyApplied {
            return Ok(None);
        }
        self.failure_reason = Some(reason.to_string());
        Ok(Some(LedgerEvent::BalanceTransferCancelled {
            transfer_id: self.transfer_id,
            reason: reason.to_string(),
            timestamp: now,
        }))
    }

    /// Marks the transfer `FAILED`. Returns `None` if it already was.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InvalidTransaction`] if completed or cancelled.
    pub fn fail(&mut self, reason: &str, now: DateTime<Utc>) -> Result<Option<LedgerEvent>> {
        if self.transition(TransactionStatus::Failed, now)? == StatusChange::AlreadyApplied {
            return Ok(None);
        }
        self.failure_reason = Some(reason.to_string());
        Ok(Some(LedgerEvent::BalanceTransferFailed {
            transfer_id: self.transfer_id,
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

    /// Cancels a pending transfer that outlived `threshold`.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InvalidTransaction`] if terminal or not yet timed out.
    pub fn timeout_cancel(&mut self, threshold: Duration, now: DateTime<Utc>) -> Result<LedgerEvent> {
        validate_can_change_status(&self.entity(), self.status, TransactionStatus::Cancelled)?;
        if !self.is_timed_out(threshold, now) {
            return Err(LedgerError::invalid_state(
                self.entity(),
                format!("{} for {}m", self.status, (now - self.created_at).num_minutes()),
                format!("PENDING for more than {}m", threshold.num_minutes()),
            ));
        }
        let reason = format!("Timed out after {} minutes", threshold.num_minutes());
        self.cancel(&reason, now)?
            .ok_or_else(|| LedgerError::invalid_state(self.entity(), self.status, "PENDING"))
    }

    /// Builds the `PENDING` transfer that reverses this one: direction
    /// swapped, and each pool's before/after swapped.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InvalidTransaction`] unless `COMPLETED`.
    pub fn create_rollback_transfer(
        &self,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(Self, LedgerEvent)> {
        if self.status != TransactionStatus::Completed {
            return Err(LedgerError::invalid_state(self.entity(), self.status, "COMPLETED"));
        }
        Self::initiate(
            self.dual_balance_id,
            self.user_id,
            self.to_type,
            self.from_type,
            self.amount,
            TransferSnapshots {
                from_before: self.to_after,
                from_after: self.to_before,
                to_before: self.from_after,
                to_after: self.from_before,
            },
            &format!("Rollback of transfer {}: {reason}", self.transfer_id),
            now,
        )
    }

    /// Both pools before and after, regardless of direction.
    #[must_use]
    pub const fn pool_snapshots(&self) -> (PoolSnapshot, PoolSnapshot) {
        match self.from_type {
            BalanceType::Bank => (
                PoolSnapshot { bank: self.from_before, main: self.to_before },
                PoolSnapshot { bank: self.from_after, main: self.to_after },
            ),
            BalanceType::Main => (
                PoolSnapshot { bank: self.to_before, main: self.from_before },
                PoolSnapshot { bank: self.to_after, main: self.from_after },
            ),
        }
    }

    fn entity(&self) -> String {
        format!("transfer {}", self.transfer_id)
    }

    /// Identity.
    #[must_use]
    pub const fn transfer_id(&self) -> TransferId {
        self.transfer_id
    }

    /// Dual balance the transfer belongs to.
    #[must_use]
    pub const fn dual_balance_id(&self) -> DualBalanceId {
        self.dual_balance_id
    }

    /// Owner.
    #[must_use]
    pub const fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Source pool.
    #[must_use]
    pub const fn from_type(&self) -> BalanceType {
        self.from_type
    }

    /// Destination pool.
    #[must_use]
    pub const fn to_type(&self) -> BalanceType {
        self.to_type
    }

    /// Amount moved.
    #[must_use]
    pub const fn amount(&self) -> Money {
        self.amount
    }

    /// Source/destination snapshots.
    #[must_use]
    pub const fn snapshots(&self) -> TransferSnapshots {
        TransferSnapshots {
            from_before: self.from_before,
            from_after: self.from_after,
            to_before: self.to_before,
            to_after: self.to_after,
        }
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> TransactionStatus {
        self.status
    }

    /// Free-text description.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Why the transfer was cancelled or failed.
    #[must_use]
    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
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

    /// Completion time.
    #[must_use]
    pub const fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }
}

impl Versioned for BalanceTransferAggregate {
    fn version(&self) -> Version {
        self.version
    }

    fn set_version(&mut self, version: Version) {
        self.version = version;
    }
}

/// Default pending timeout for transfers.
#[must_use]
pub fn default_transfer_timeout() -> Duration {
    Duration::minutes(DEFAULT_TRANSFER_TIMEOUT_MINUTES)
}
