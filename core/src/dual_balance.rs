//! Two-pool balance: an inbound bank pool and a spendable main pool.
//!
//! Deposits land in the bank pool. The only way deposited funds reach the
//! main pool is [`DualBalanceAggregate::transfer_bank_to_main`], which moves
//! both pools in one mutation and returns the completed transfer record.

use crate::balance::BalanceEnvironment;
use crate::error::{LedgerError, Result};
use crate::event::{Events, LedgerEvent, PoolOperation};
use crate::ids::{DualBalanceId, OrderId, TransactionId, UserId};
use crate::money::{Currency, Money};
use crate::policy::currency_mismatch;
use crate::transaction::{NewTransaction, TransactionAggregate, TransactionType};
use crate::transfer::{BalanceTransferAggregate, BalanceType, TransferSnapshots};
use crate::version::{Version, Versioned};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smallvec::smallvec;

/// A user's bank and main pools.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DualBalanceAggregate {
    id: DualBalanceId,
    user_id: UserId,
    bank_balance: Money,
    main_balance: Money,
    total_deposited_to_bank: Money,
    total_transferred_to_main: Money,
    total_spent_from_main: Money,
    currency: Currency,
    is_active: bool,
    created_at: DateTime<Utc>,
    last_updated: DateTime<Utc>,
    version: Version,
}

impl DualBalanceAggregate {
    /// Opens an active dual balance with both pools empty.
    ///
    /// # Errors
    ///
    /// Unsupported currency.
    pub fn open(user_id: UserId, currency: Currency, env: &BalanceEnvironment) -> Result<Self> {
        env.policy.validate_currency_operation(currency, currency)?;
        let now = env.clock.now();
        let zero = Money::zero(currency);
        Ok(Self {
            id: DualBalanceId::new(),
            user_id,
            bank_balance: zero,
            main_balance: zero,
            total_deposited_to_bank: zero,
            total_transferred_to_main: zero,
            total_spent_from_main: zero,
            currency,
            is_active: true,
            created_at: now,
            last_updated: now,
            version: Version::INITIAL,
        })
    }

    /// Credits the bank pool.
    ///
    /// # Errors
    ///
    /// Inactive balance, currency mismatch or an amount outside the deposit
    /// bounds.
    pub fn deposit_to_bank_balance(
        &mut self,
        amount: Money,
        description: &str,
        env: &BalanceEnvironment,
    ) -> Result<Events> {
        self.ensure_active()?;
        self.ensure_currency(amount)?;
        env.policy.validate_deposit_amount(amount)?;

        let bank_after = self.bank_balance.checked_add(amount)?;
        let total = self.total_deposited_to_bank.checked_add(amount)?;
        let now = env.clock.now();

        let event = self.pool_changed(
            BalanceType::Bank,
            PoolOperation::BankDeposit,
            amount,
            self.bank_balance,
            bank_after,
            None,
            description,
            now,
        );
        self.bank_balance = bank_after;
        self.total_deposited_to_bank = total;
        self.last_updated = now;
        Ok(smallvec![event])
    }

    /// Moves funds from the bank pool to the main pool.
    ///
    /// Returns the completed transfer record together with the initiation
    /// and completion events that bracket the single state change.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InsufficientBankFunds`] if the bank pool is short, plus
    /// the activity, currency and transfer-bound checks. Both pools are
    /// untouched on error.
    pub fn transfer_bank_to_main(
        &mut self,
        amount: Money,
        description: &str,
        env: &BalanceEnvironment,
    ) -> Result<(BalanceTransferAggregate, Events)> {
        self.ensure_active()?;
        self.ensure_currency(amount)?;
        env.policy.validate_transfer_amount(amount)?;
        if self.bank_balance < amount {
            return Err(LedgerError::InsufficientBankFunds {
                balance_id: self.id.to_string(),
                available: self.bank_balance,
                requested: amount,
            });
        }

        let snapshots = TransferSnapshots {
            from_before: self.bank_balance,
            from_after: self.bank_balance.checked_sub(amount)?,
            to_before: self.main_balance,
            to_after: self.main_balance.checked_add(amount)?,
        };
        let total_transferred = self.total_transferred_to_main.checked_add(amount)?;
        let now = env.clock.now();

        let (mut transfer, initiated) = BalanceTransferAggregate::initiate(
            self.id,
            self.user_id,
            BalanceType::Bank,
            BalanceType::Main,
            amount,
            snapshots,
            description,
            now,
        )?;
        let completed = transfer.complete(now)?;

        self.bank_balance = snapshots.from_after;
        self.main_balance = snapshots.to_after;
        self.total_transferred_to_main = total_transferred;
        self.last_updated = now;

        let mut events: Events = smallvec![initiated];
        events.extend(completed);
        Ok((transfer, events))
    }

    /// Pays a purchase out of the main pool.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InsufficientMainFunds`] if the main pool is short, plus
    /// the activity, currency and withdrawal-bound checks.
    pub fn withdraw_from_main_balance(
        &mut self,
        amount: Money,
        description: &str,
        purchase_id: Option<&str>,
        env: &BalanceEnvironment,
    ) -> Result<Events> {
        self.ensure_active()?;
        self.ensure_currency(amount)?;
        env.policy.validate_withdrawal_amount(amount)?;
        if self.main_balance < amount {
            return Err(LedgerError::InsufficientMainFunds {
                balance_id: self.id.to_string(),
                available: self.main_balance,
                requested: amount,
            });
        }

        let main_after = self.main_balance.checked_sub(amount)?;
        let total_spent = self.total_spent_from_main.checked_add(amount)?;
        let now = env.clock.now();

        let event = self.pool_changed(
            BalanceType::Main,
            PoolOperation::MainWithdrawal,
            amount,
            self.main_balance,
            main_after,
            purchase_id,
            description,
            now,
        );
        self.main_balance = main_after;
        self.total_spent_from_main = total_spent;
        self.last_updated = now;
        Ok(smallvec![event])
    }

    /// Returns a purchase to the main pool. `total_spent_from_main` is
    /// reduced but never below zero.
    ///
    /// # Errors
    ///
    /// Inactive balance, currency mismatch or an amount outside the
    /// withdrawal bounds.
    pub fn refund_to_main_balance(
        &mut self,
        amount: Money,
        description: &str,
        purchase_id: Option<&str>,
        env: &BalanceEnvironment,
    ) -> Result<Events> {
        self.ensure_active()?;
        self.ensure_currency(amount)?;
        env.policy.validate_withdrawal_amount(amount)?;

        let main_after = self.main_balance.checked_add(amount)?;
        let total_spent = self.total_spent_from_main.saturating_sub(amount)?;
        let now = env.clock.now();

        let event = self.pool_changed(
            BalanceType::Main,
            PoolOperation::MainRefund,
            amount,
            self.main_balance,
            main_after,
            purchase_id,
            description,
            now,
        );
        self.main_balance = main_after;
        self.total_spent_from_main = total_spent;
        self.last_updated = now;
        Ok(smallvec![event])
    }

    /// Disables mutations. No-op if already inactive.
    ///
    /// # Errors
    ///
    /// Blank `reason` or `admin_user`.
    pub fn deactivate(
        &mut self,
        reason: &str,
        admin_user: &str,
        env: &BalanceEnvironment,
    ) -> Result<Events> {
        env.policy.validate_admin_operation(admin_user, reason)?;
        if !self.is_active {
            return Ok(Events::new());
        }
        let now = env.clock.now();
        self.is_active = false;
        self.last_updated = now;
        Ok(smallvec![LedgerEvent::BalanceDeactivated {
            balance_id: self.id.to_string(),
            user_id: self.user_id,
            reason: reason.to_string(),
            admin_user: admin_user.to_string(),
            occurred_at: now,
        }])
    }

    /// Re-enables mutations. No-op if already active.
    ///
    /// # Errors
    ///
    /// Blank `reason` or `admin_user`.
    pub fn activate(
        &mut self,
        reason: &str,
        admin_user: &str,
        env: &BalanceEnvironment,
    ) -> Result<Events> {
        env.policy.validate_admin_operation(admin_user, reason)?;
        if self.is_active {
            return Ok(Events::new());
        }
        let now = env.clock.now();
        self.is_active = true;
        self.last_updated = now;
        Ok(smallvec![LedgerEvent::BalanceActivated {
            balance_id: self.id.to_string(),
            user_id: self.user_id,
            reason: reason.to_string(),
            admin_user: admin_user.to_string(),
            occurred_at: now,
        }])
    }

    /// Builds the `PENDING` record for a pool mutation this aggregate
    /// produced, tagged with the pool it hit.
    ///
    /// Bank deposits record as `DEPOSIT`, main-pool purchases as `PURCHASE`
    /// and main-pool refunds as `REFUND`; the snapshot is the pool's
    /// before/after. Transfers carry their own record, so every other event
    /// returns `None`.
    ///
    /// # Errors
    ///
    /// Propagates [`TransactionAggregate::create`] validation.
    pub fn pending_transaction(
        &self,
        event: &LedgerEvent,
        transaction_id: TransactionId,
        processed_by: Option<&str>,
    ) -> Result<Option<(TransactionAggregate, LedgerEvent)>> {
        let LedgerEvent::DualBalanceChanged {
            pool,
            operation,
            amount,
            before,
            after,
            reference,
            description,
            occurred_at,
            ..
        } = event
        else {
            return Ok(None);
        };
        let transaction_type = match operation {
            PoolOperation::BankDeposit => TransactionType::Deposit,
            PoolOperation::MainWithdrawal => TransactionType::Purchase,
            PoolOperation::MainRefund => TransactionType::Refund,
        };
        let (transaction, created) = TransactionAggregate::create(
            NewTransaction {
                transaction_id,
                user_id: self.user_id,
                transaction_type,
                amount: *amount,
                balance_before: *before,
                balance_after: *after,
                order_id: reference.as_deref().map(OrderId::new),
                description: description.clone(),
                processed_by: processed_by.map(str::to_string),
            },
            *occurred_at,
        )?;
        Ok(Some((transaction.with_pool(*pool), created)))
    }

    #[allow(clippy::too_many_arguments)]
    fn pool_changed(
        &self,
        pool: BalanceType,
        operation: PoolOperation,
        amount: Money,
        before: Money,
        after: Money,
        reference: Option<&str>,
        description: &str,
        now: DateTime<Utc>,
    ) -> LedgerEvent {
        LedgerEvent::DualBalanceChanged {
            dual_balance_id: self.id,
            user_id: self.user_id,
            pool,
            operation,
            amount,
            before,
            after,
            reference: reference.map(str::to_string),
            description: description.to_string(),
            occurred_at: now,
        }
    }

    fn ensure_active(&self) -> Result<()> {
        if self.is_active {
            Ok(())
        } else {
            Err(LedgerError::invalid_state(
                format!("dual balance {}", self.id),
                "INACTIVE",
                "ACTIVE",
            ))
        }
    }

    fn ensure_currency(&self, amount: Money) -> Result<()> {
        if amount.currency() == self.currency {
            Ok(())
        } else {
            Err(currency_mismatch(self.currency, amount.currency()).into())
        }
    }

    /// Identity.
    #[must_use]
    pub const fn id(&self) -> DualBalanceId {
        self.id
    }

    /// Owner.
    #[must_use]
    pub const fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Inbound pool.
    #[must_use]
    pub const fn bank_balance(&self) -> Money {
        self.bank_balance
    }

    /// Spendable pool.
    #[must_use]
    pub const fn main_balance(&self) -> Money {
        self.main_balance
    }

    /// Sum of bank deposits.
    #[must_use]
    pub const fn total_deposited_to_bank(&self) -> Money {
        self.total_deposited_to_bank
    }

    /// Sum of bank-to-main transfers.
    #[must_use]
    pub const fn total_transferred_to_main(&self) -> Money {
        self.total_transferred_to_main
    }

    /// Sum of main-pool purchases, net of refunds.
    #[must_use]
    pub const fn total_spent_from_main(&self) -> Money {
        self.total_spent_from_main
    }

    /// Currency of both pools.
    #[must_use]
    pub const fn currency(&self) -> Currency {
        self.currency
    }

    /// Whether mutations are allowed.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.is_active
    }

    /// When the balance was opened.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// When the balance last changed.
    #[must_use]
    pub const fn last_updated(&self) -> DateTime<Utc> {
        self.last_updated
    }
}

impl Versioned for DualBalanceAggregate {
    fn version(&self) -> Version {
        self.version
    }

    fn set_version(&mut self, version: Version) {
        self.version = version;
    }
}
