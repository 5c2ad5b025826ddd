//! Single-pool balance aggregate.
//!
//! Operations validate first and mutate only after every check has passed,
//! so a failed call leaves the aggregate exactly as it was. Each successful
//! call returns the [`LedgerEvent`]s it produced; persisting the aggregate
//! and dispatching those events is the caller's job.
//!
//! Funds on hold are tracked in `reserved_amount`. Spendable funds are
//! `current_balance - reserved_amount`, and every sufficiency check uses that
//! figure.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use balance_ledger_core::balance::{BalanceAggregate, BalanceEnvironment};
//! use balance_ledger_core::environment::SystemClock;
//! use balance_ledger_core::ids::{TransactionId, UserId};
//! use balance_ledger_core::money::{Currency, Money};
//! use balance_ledger_core::policy::BalancePolicy;
//!
//! let env = BalanceEnvironment::new(Arc::new(SystemClock), Arc::new(BalancePolicy::default()));
//! let mut balance = BalanceAggregate::open(UserId::new(1), Currency::USD, &env).unwrap();
//! balance
//!     .deposit(Money::from_major_units(100, Currency::USD), "top up", TransactionId::new("tx1"), &env)
//!     .unwrap();
//! assert_eq!(balance.current_balance(), Money::from_major_units(100, Currency::USD));
//! ```

use crate::environment::Clock;
use crate::error::{LedgerError, Result, ValidationCode, ValidationError};
use crate::event::{Events, LedgerEvent};
use crate::ids::{BalanceId, OrderId, TransactionId, UserId};
use crate::money::{Currency, Money};
use crate::policy::{BalancePolicy, currency_mismatch};
use crate::transaction::{NewTransaction, TransactionAggregate, TransactionType};
use crate::version::{Version, Versioned};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smallvec::smallvec;
use std::sync::Arc;

/// Environment dependencies for balance operations
#[derive(Clone)]
pub struct BalanceEnvironment {
    /// Clock for generating timestamps
    pub clock: Arc<dyn Clock>,
    /// Business rules applied before every mutation
    pub policy: Arc<BalancePolicy>,
}

impl BalanceEnvironment {
    /// Creates a new `BalanceEnvironment`
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, policy: Arc<BalancePolicy>) -> Self {
        Self { clock, policy }
    }
}

/// A user's spendable balance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BalanceAggregate {
    id: BalanceId,
    user_id: UserId,
    current_balance: Money,
    reserved_amount: Money,
    total_deposited: Money,
    total_spent: Money,
    currency: Currency,
    is_active: bool,
    created_at: DateTime<Utc>,
    last_updated: DateTime<Utc>,
    version: Version,
    notes: String,
}

impl BalanceAggregate {
    /// Opens an active balance with every amount at zero.
    ///
    /// # Errors
    ///
    /// [`ValidationCode::UnsupportedCurrency`] if the currency is not supported.
    pub fn open(user_id: UserId, currency: Currency, env: &BalanceEnvironment) -> Result<Self> {
        env.policy.validate_currency_operation(currency, currency)?;
        let now = env.clock.now();
        let zero = Money::zero(currency);
        Ok(Self {
            id: BalanceId::new(),
            user_id,
            current_balance: zero,
            reserved_amount: zero,
            total_deposited: zero,
            total_spent: zero,
            currency,
            is_active: true,
            created_at: now,
            last_updated: now,
            version: Version::INITIAL,
            notes: String::new(),
        })
    }

    /// Adds funds.
    ///
    /// # Errors
    ///
    /// Inactive balance, currency mismatch, or an amount outside the deposit
    /// bounds.
    pub fn deposit(
        &mut self,
        amount: Money,
        description: &str,
        transaction_id: TransactionId,
        env: &BalanceEnvironment,
    ) -> Result<Events> {
        self.ensure_active()?;
        self.ensure_currency(amount)?;
        env.policy.validate_deposit_amount(amount)?;

        let balance_after = self.current_balance.checked_add(amount)?;
        let total_deposited = self.total_deposited.checked_add(amount)?;

        let event = self.balance_changed(
            TransactionType::Deposit,
            amount,
            balance_after,
            transaction_id,
            description,
            None,
            env.clock.now(),
        );
        self.current_balance = balance_after;
        self.total_deposited = total_deposited;
        Ok(smallvec![event])
    }

    /// Pays funds out.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InsufficientFunds`] if the available balance is short,
    /// plus the usual activity, currency and withdrawal-bound checks.
    pub fn withdraw(
        &mut self,
        amount: Money,
        description: &str,
        transaction_id: TransactionId,
        env: &BalanceEnvironment,
    ) -> Result<Events> {
        self.ensure_active()?;
        self.ensure_currency(amount)?;
        env.policy.validate_withdrawal_amount(amount)?;
        self.ensure_available(amount)?;

        let balance_after = self.current_balance.checked_sub(amount)?;
        let total_spent = self.total_spent.checked_add(amount)?;

        let event = self.balance_changed(
            TransactionType::Withdrawal,
            amount,
            balance_after,
            transaction_id,
            description,
            None,
            env.clock.now(),
        );
        self.current_balance = balance_after;
        self.total_spent = total_spent;
        Ok(smallvec![event])
    }

    /// Places a hold for an order. The current balance is untouched; the hold
    /// only reduces what is available.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InsufficientFunds`] if the available balance is short,
    /// plus the usual activity, currency and withdrawal-bound checks.
    pub fn reserve(
        &mut self,
        amount: Money,
        order_id: OrderId,
        description: &str,
        transaction_id: TransactionId,
        env: &BalanceEnvironment,
    ) -> Result<Events> {
        self.ensure_active()?;
        self.ensure_currency(amount)?;
        env.policy.validate_withdrawal_amount(amount)?;
        self.ensure_available(amount)?;

        let reserved_after = self.reserved_amount.checked_add(amount)?;
        let now = env.clock.now();

        self.reserved_amount = reserved_after;
        self.last_updated = now;
        Ok(smallvec![LedgerEvent::FundsReserved {
            balance_id: self.id,
            user_id: self.user_id,
            amount,
            reserved_after,
            order_id,
            transaction_id,
            description: description.to_string(),
            occurred_at: now,
        }])
    }

    /// Drops (part of) a hold without charging.
    ///
    /// # Errors
    ///
    /// [`ValidationCode::ReleaseExceedsReserved`] when releasing more than is
    /// held, plus the activity, currency and positivity checks.
    pub fn release(
        &mut self,
        amount: Money,
        order_id: OrderId,
        description: &str,
        transaction_id: TransactionId,
        env: &BalanceEnvironment,
    ) -> Result<Events> {
        self.ensure_active()?;
        self.ensure_currency(amount)?;
        ensure_positive(amount)?;
        self.ensure_reserved(amount)?;

        let reserved_after = self.reserved_amount.checked_sub(amount)?;
        let now = env.clock.now();

        self.reserved_amount = reserved_after;
        self.last_updated = now;
        Ok(smallvec![LedgerEvent::ReservationReleased {
            balance_id: self.id,
            user_id: self.user_id,
            amount,
            reserved_after,
            order_id,
            transaction_id,
            description: description.to_string(),
            occurred_at: now,
        }])
    }

    /// Settles (part of) a hold as a purchase.
    ///
    /// The held amount leaves both `reserved_amount` and `current_balance`.
    ///
    /// # Errors
    ///
    /// [`ValidationCode::ReleaseExceedsReserved`] when capturing more than is
    /// held, plus the activity, currency and positivity checks.
    pub fn capture_reservation(
        &mut self,
        amount: Money,
        order_id: OrderId,
        description: &str,
        transaction_id: TransactionId,
        env: &BalanceEnvironment,
    ) -> Result<Events> {
        self.ensure_active()?;
        self.ensure_currency(amount)?;
        ensure_positive(amount)?;
        self.ensure_reserved(amount)?;

        let reserved_after = self.reserved_amount.checked_sub(amount)?;
        let balance_after = self.current_balance.checked_sub(amount)?;
        let total_spent = self.total_spent.checked_add(amount)?;

        let event = self.balance_changed(
            TransactionType::Purchase,
            amount,
            balance_after,
            transaction_id,
            description,
            Some(order_id),
            env.clock.now(),
        );
        self.reserved_amount = reserved_after;
        self.current_balance = balance_after;
        self.total_spent = total_spent;
        Ok(smallvec![event])
    }

    /// Returns funds for an order. `total_spent` is reduced but never below zero.
    ///
    /// # Errors
    ///
    /// Inactive balance, currency mismatch, or an amount outside the
    /// withdrawal bounds.
    pub fn refund(
        &mut self,
        amount: Money,
        description: &str,
        transaction_id: TransactionId,
        order_id: Option<OrderId>,
        env: &BalanceEnvironment,
    ) -> Result<Events> {
        self.ensure_active()?;
        self.ensure_currency(amount)?;
        env.policy.validate_withdrawal_amount(amount)?;

        let balance_after = self.current_balance.checked_add(amount)?;
        let total_spent = self.total_spent.saturating_sub(amount)?;

        let event = self.balance_changed(
            TransactionType::Refund,
            amount,
            balance_after,
            transaction_id,
            description,
            order_id,
            env.clock.now(),
        );
        self.current_balance = balance_after;
        self.total_spent = total_spent;
        Ok(smallvec![event])
    }

    /// Applies a signed manual correction. Totals are not affected.
    ///
    /// # Errors
    ///
    /// - [`ValidationCode::BlankAdminUser`] / [`ValidationCode::BlankOperation`]
    ///   for a blank admin or reason
    /// - [`ValidationCode::AmountNotPositive`] for a zero amount
    /// - [`ValidationCode::NegativeResultingBalance`] if the result would be
    ///   negative or below the amount on hold
    pub fn adjust_balance(
        &mut self,
        amount: Money,
        reason: &str,
        admin_user: &str,
        transaction_id: TransactionId,
        env: &BalanceEnvironment,
    ) -> Result<Events> {
        self.ensure_active()?;
        env.policy.validate_admin_operation(admin_user, reason)?;
        self.ensure_currency(amount)?;
        if amount.is_zero() {
            return Err(ValidationError::new(ValidationCode::AmountNotPositive, amount, "!= 0").into());
        }

        let balance_after = self.current_balance.checked_add(amount)?;
        if balance_after.is_negative() || balance_after < self.reserved_amount {
            return Err(ValidationError::new(
                ValidationCode::NegativeResultingBalance,
                balance_after,
                format!(">= {} (reserved)", self.reserved_amount),
            )
            .into());
        }

        let now = env.clock.now();
        let event = self.balance_changed(
            TransactionType::Adjustment,
            amount,
            balance_after,
            transaction_id,
            reason,
            None,
            now,
        );
        self.current_balance = balance_after;
        self.append_note(now, &format!("ADJUSTED by {admin_user} ({amount}): {reason}"));
        Ok(smallvec![event])
    }

    /// Whether `amount` can be spent right now.
    #[must_use]
    pub fn has_sufficient_funds(&self, amount: Money) -> bool {
        amount.currency() == self.currency && self.available_balance() >= amount
    }

    /// Current balance minus funds on hold.
    #[must_use]
    pub fn available_balance(&self) -> Money {
        // reserved <= current always holds, so the subtraction stays in range.
        self.current_balance
            .saturating_sub(self.reserved_amount)
            .unwrap_or_else(|_| Money::zero(self.currency))
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
        self.append_note(now, &format!("DEACTIVATED by {admin_user}: {reason}"));
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
        self.append_note(now, &format!("ACTIVATED by {admin_user}: {reason}"));
        Ok(smallvec![LedgerEvent::BalanceActivated {
            balance_id: self.id.to_string(),
            user_id: self.user_id,
            reason: reason.to_string(),
            admin_user: admin_user.to_string(),
            occurred_at: now,
        }])
    }

    /// Builds the `PENDING` transaction record for an event this balance
    /// emitted.
    ///
    /// `BalanceChanged` maps one to one. `FundsReserved` yields a `PURCHASE`
    /// whose snapshot projects the capture of the hold against the current
    /// balance; [`TransactionAggregate::record_applied_snapshot`] moves it onto
    /// the actual capture. Other events have no record and return `None`.
    ///
    /// # Errors
    ///
    /// Propagates [`TransactionAggregate::create`] validation.
    pub fn pending_transaction(
        &self,
        event: &LedgerEvent,
        processed_by: Option<&str>,
    ) -> Result<Option<(TransactionAggregate, LedgerEvent)>> {
        let new = match event {
            LedgerEvent::BalanceChanged {
                transaction_type,
                amount,
                balance_before,
                balance_after,
                transaction_id,
                description,
                order_id,
                ..
            } => NewTransaction {
                transaction_id: transaction_id.clone(),
                user_id: self.user_id,
                transaction_type: *transaction_type,
                amount: *amount,
                balance_before: *balance_before,
                balance_after: *balance_after,
                order_id: order_id.clone(),
                description: description.clone(),
                processed_by: processed_by.map(str::to_string),
            },
            LedgerEvent::FundsReserved {
                amount,
                order_id,
                transaction_id,
                description,
                ..
            } => NewTransaction {
                transaction_id: transaction_id.clone(),
                user_id: self.user_id,
                transaction_type: TransactionType::Purchase,
                amount: *amount,
                balance_before: self.current_balance,
                balance_after: self.current_balance.checked_sub(*amount)?,
                order_id: Some(order_id.clone()),
                description: description.clone(),
                processed_by: processed_by.map(str::to_string),
            },
            _ => return Ok(None),
        };
        TransactionAggregate::create(new, self.last_updated).map(Some)
    }

    #[allow(clippy::too_many_arguments)]
    fn balance_changed(
        &mut self,
        transaction_type: TransactionType,
        amount: Money,
        balance_after: Money,
        transaction_id: TransactionId,
        description: &str,
        order_id: Option<OrderId>,
        now: DateTime<Utc>,
    ) -> LedgerEvent {
        self.last_updated = now;
        LedgerEvent::BalanceChanged {
            balance_id: self.id,
            user_id: self.user_id,
            transaction_type,
            amount,
            balance_before: self.current_balance,
            balance_after,
            transaction_id,
            description: description.to_string(),
            order_id,
            occurred_at: now,
        }
    }

    fn ensure_active(&self) -> Result<()> {
        if self.is_active {
            Ok(())
        } else {
            Err(LedgerError::invalid_state(
                format!("balance {}", self.id),
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

    fn ensure_available(&self, amount: Money) -> Result<()> {
        let available = self.available_balance();
        if available < amount {
            return Err(LedgerError::InsufficientFunds {
                balance_id: self.id.to_string(),
                available,
                requested: amount,
            });
        }
        Ok(())
    }

    fn ensure_reserved(&self, amount: Money) -> Result<()> {
        if amount > self.reserved_amount {
            return Err(ValidationError::new(
                ValidationCode::ReleaseExceedsReserved,
                amount,
                format!("<= {} (reserved)", self.reserved_amount),
            )
            .into());
        }
        Ok(())
    }

    fn append_note(&mut self, at: DateTime<Utc>, note: &str) {
        if !self.notes.is_empty() {
            self.notes.push('\n');
        }
        self.notes.push_str(&format!("[{}] {note}", at.to_rfc3339()));
        self.last_updated = at;
    }

    /// Identity.
    #[must_use]
    pub const fn id(&self) -> BalanceId {
        self.id
    }

    /// Owner.
    #[must_use]
    pub const fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Total funds, including those on hold.
    #[must_use]
    pub const fn current_balance(&self) -> Money {
        self.current_balance
    }

    /// Funds on hold.
    #[must_use]
    pub const fn reserved_amount(&self) -> Money {
        self.reserved_amount
    }

    /// Sum of all deposits.
    #[must_use]
    pub const fn total_deposited(&self) -> Money {
        self.total_deposited
    }

    /// Sum of withdrawals and purchases, net of refunds.
    #[must_use]
    pub const fn total_spent(&self) -> Money {
        self.total_spent
    }

    /// Currency of every amount on this balance.
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

    /// Audit notes, one per line.
    #[must_use]
    pub fn notes(&self) -> &str {
        &self.notes
    }
}

impl Versioned for BalanceAggregate {
    fn version(&self) -> Version {
        self.version
    }

    fn set_version(&mut self, version: Version) {
        self.version = version;
    }
}

fn ensure_positive(amount: Money) -> Result<()> {
    if amount.is_positive() {
        Ok(())
    } else {
        Err(ValidationError::new(ValidationCode::AmountNotPositive, amount, "> 0").into())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::policy::PolicyConfig;
    use chrono::TimeZone;
    use proptest::prelude::*;

    struct TestClock;

    impl Clock for TestClock {
        fn now(&self) -> DateTime<Utc> {
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
        }
    }

    fn env() -> BalanceEnvironment {
        BalanceEnvironment::new(Arc::new(TestClock), Arc::new(BalancePolicy::default()))
    }

    fn usd(major: i64) -> Money {
        Money::from_major_units(major, Currency::USD)
    }

    fn tx(id: &str) -> TransactionId {
        TransactionId::new(id)
    }

    fn opened(env: &BalanceEnvironment) -> BalanceAggregate {
        BalanceAggregate::open(UserId::new(1), Currency::USD, env).unwrap()
    }

    #[test]
    fn deposit_then_withdraw_scenario() {
        let env = env();
        let mut balance = opened(&env);

        balance.deposit(usd(100), "test", tx("tx1"), &env).unwrap();
        assert_eq!(balance.current_balance(), usd(100));
        assert_eq!(balance.total_deposited(), usd(100));

        let before = balance.clone();
        let err = balance.withdraw(usd(150), "test", tx("tx2"), &env).unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFunds { .. }));
        assert_eq!(balance, before);

        balance.withdraw(usd(40), "test", tx("tx3"), &env).unwrap();
        assert_eq!(balance.current_balance(), usd(60));
        assert_eq!(balance.total_spent(), usd(40));
    }

    #[test]
    fn deposit_emits_balance_changed_snapshot() {
        let env = env();
        let mut balance = opened(&env);
        let events = balance.deposit(usd(25), "top up", tx("tx1"), &env).unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            LedgerEvent::BalanceChanged {
                transaction_type,
                balance_before,
                balance_after,
                ..
            } => {
                assert_eq!(*transaction_type, TransactionType::Deposit);
                assert_eq!(*balance_before, usd(0));
                assert_eq!(*balance_after, usd(25));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn validation_failure_leaves_state_unchanged() {
        let env = env();
        let mut balance = opened(&env);
        balance.deposit(usd(10), "seed", tx("tx1"), &env).unwrap();
        let before = balance.clone();

        assert!(balance.deposit(usd(0), "zero", tx("tx2"), &env).is_err());
        assert!(
            balance
                .deposit(Money::from_major_units(5, Currency::EUR), "eur", tx("tx3"), &env)
                .is_err()
        );
        assert_eq!(balance, before);
    }

    #[test]
    fn reservation_limits_available_funds() {
        let env = env();
        let mut balance = opened(&env);
        balance.deposit(usd(100), "seed", tx("tx1"), &env).unwrap();

        balance
            .reserve(usd(70), OrderId::new("o1"), "hold", tx("tx2"), &env)
            .unwrap();
        assert_eq!(balance.current_balance(), usd(100));
        assert_eq!(balance.available_balance(), usd(30));
        assert!(!balance.has_sufficient_funds(usd(31)));

        let err = balance.withdraw(usd(31), "too much", tx("tx3"), &env).unwrap_err();
        assert!(err.is_insufficient_funds());
        let err = balance
            .reserve(usd(31), OrderId::new("o2"), "hold", tx("tx4"), &env)
            .unwrap_err();
        assert!(err.is_insufficient_funds());

        balance
            .release(usd(20), OrderId::new("o1"), "partial", tx("tx2"), &env)
            .unwrap();
        assert_eq!(balance.reserved_amount(), usd(50));

        let err = balance
            .release(usd(51), OrderId::new("o1"), "too much", tx("tx2"), &env)
            .unwrap_err();
        assert_eq!(err.validation_code(), Some(ValidationCode::ReleaseExceedsReserved));
    }

    #[test]
    fn capture_settles_hold_as_purchase() {
        let env = env();
        let mut balance = opened(&env);
        balance.deposit(usd(100), "seed", tx("tx1"), &env).unwrap();
        balance
            .reserve(usd(40), OrderId::new("o1"), "hold", tx("tx2"), &env)
            .unwrap();

        let events = balance
            .capture_reservation(usd(40), OrderId::new("o1"), "buy", tx("tx2"), &env)
            .unwrap();
        assert_eq!(balance.current_balance(), usd(60));
        assert_eq!(balance.reserved_amount(), usd(0));
        assert_eq!(balance.total_spent(), usd(40));
        assert!(matches!(
            events[0],
            LedgerEvent::BalanceChanged { transaction_type: TransactionType::Purchase, .. }
        ));
    }

    #[test]
    fn refund_floors_total_spent_at_zero() {
        let env = env();
        let mut balance = opened(&env);
        balance.deposit(usd(50), "seed", tx("tx1"), &env).unwrap();
        balance.withdraw(usd(10), "spend", tx("tx2"), &env).unwrap();

        balance
            .refund(usd(30), "goodwill", tx("tx3"), Some(OrderId::new("o1")), &env)
            .unwrap();
        assert_eq!(balance.current_balance(), usd(70));
        assert_eq!(balance.total_spent(), usd(0));
    }

    #[test]
    fn adjustment_is_signed_and_guarded() {
        let env = env();
        let mut balance = opened(&env);
        balance.deposit(usd(100), "seed", tx("tx1"), &env).unwrap();
        balance
            .reserve(usd(30), OrderId::new("o1"), "hold", tx("tx2"), &env)
            .unwrap();

        balance
            .adjust_balance(usd(-50), "correction", "root", tx("adj1"), &env)
            .unwrap();
        assert_eq!(balance.current_balance(), usd(50));
        assert_eq!(balance.total_deposited(), usd(100));
        assert!(balance.notes().contains("ADJUSTED by root"));

        let err = balance
            .adjust_balance(usd(-21), "below hold", "root", tx("adj2"), &env)
            .unwrap_err();
        assert_eq!(err.validation_code(), Some(ValidationCode::NegativeResultingBalance));

        let err = balance
            .adjust_balance(usd(5), "bonus", " ", tx("adj3"), &env)
            .unwrap_err();
        assert_eq!(err.validation_code(), Some(ValidationCode::BlankAdminUser));
    }

    #[test]
    fn inactive_balance_rejects_mutations() {
        let env = env();
        let mut balance = opened(&env);

        let events = balance.deactivate("fraud review", "root", &env).unwrap();
        assert_eq!(events.len(), 1);
        assert!(balance.deactivate("again", "root", &env).unwrap().is_empty());
        assert!(!balance.is_active());

        let err = balance.deposit(usd(10), "x", tx("tx1"), &env).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransaction { .. }));

        balance.activate("cleared", "root", &env).unwrap();
        assert!(balance.deposit(usd(10), "x", tx("tx1"), &env).is_ok());
        assert_eq!(balance.notes().lines().count(), 2);
    }

    #[test]
    fn pending_transaction_matches_event() {
        let env = env();
        let mut balance = opened(&env);
        let events = balance.deposit(usd(10), "x", tx("tx1"), &env).unwrap();
        let (record, created) = balance
            .pending_transaction(&events[0], Some("api"))
            .unwrap()
            .expect("balance change has a record");
        assert_eq!(record.transaction_id(), &tx("tx1"));
        assert_eq!(record.balance_after(), usd(10));
        assert_eq!(record.processed_by(), Some("api"));
        assert!(matches!(created, LedgerEvent::TransactionCreated { .. }));

        let events = balance
            .reserve(usd(4), OrderId::new("o1"), "hold", tx("tx2"), &env)
            .unwrap();
        let (hold, _) = balance
            .pending_transaction(&events[0], None)
            .unwrap()
            .expect("reservation has a record");
        assert_eq!(hold.transaction_type(), TransactionType::Purchase);
        assert_eq!(hold.balance_after(), usd(6));
    }

    #[test]
    fn unsupported_currency_cannot_open() {
        let env = env();
        let gbp = Currency::from_code("GBP").unwrap();
        assert!(BalanceAggregate::open(UserId::new(1), gbp, &env).is_err());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Deposit(i64),
        Withdraw(i64),
        Refund(i64),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1i64..=5_000).prop_map(Op::Deposit),
            (1i64..=5_000).prop_map(Op::Withdraw),
            (1i64..=5_000).prop_map(Op::Refund),
        ]
    }

    proptest! {
        #[test]
        fn balance_never_goes_negative(ops in proptest::collection::vec(op(), 1..60)) {
            let env = BalanceEnvironment::new(
                Arc::new(TestClock),
                Arc::new(BalancePolicy::new(PolicyConfig::default())),
            );
            let mut balance = opened(&env);
            for (i, op) in ops.into_iter().enumerate() {
                let id = tx(&format!("tx{i}"));
                let before = balance.clone();
                let result = match op {
                    Op::Deposit(n) => balance.deposit(usd(n), "p", id, &env),
                    Op::Withdraw(n) => balance.withdraw(usd(n), "p", id, &env),
                    Op::Refund(n) => balance.refund(usd(n), "p", id, None, &env),
                };
                if result.is_err() {
                    prop_assert_eq!(&balance, &before);
                }
                prop_assert!(!balance.current_balance().is_negative());
                prop_assert!(!balance.total_spent().is_negative());
                prop_assert!(balance.reserved_amount() <= balance.current_balance());
            }
        }
    }
}
