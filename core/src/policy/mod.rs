//! Business-rule policy for balance operations.
//!
//! Every check raises a typed [`ValidationError`] carrying a reason code, the
//! rejected value, and the expected constraint. Nothing is silently clamped.
//!
//! # Example
//!
//! ```
//! use balance_ledger_core::money::{Currency, Money};
//! use balance_ledger_core::policy::{BalancePolicy, PolicyConfig};
//!
//! let policy = BalancePolicy::new(PolicyConfig::default());
//! assert!(policy.validate_deposit_amount(Money::from_major_units(50, Currency::USD)).is_ok());
//! assert!(policy.validate_deposit_amount(Money::zero(Currency::USD)).is_err());
//! ```

mod config;
mod rate_limit;

pub use config::PolicyConfig;
pub use rate_limit::{RateLimiter, WINDOW_RETENTION_MINUTES, WindowState, minute_key};

use crate::error::{ValidationCode, ValidationError};
use crate::ids::UserId;
use crate::money::{Currency, Money};
use crate::transaction::TransactionType;
use chrono::{DateTime, Utc};

/// Which amount bounds a check applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AmountKind {
    Deposit,
    Withdrawal,
    Transfer,
}

/// Validator for amounts, daily caps, velocity, currencies and admin actions.
///
/// Stateless apart from the per-user [`RateLimiter`]; share one instance
/// behind an `Arc`.
#[derive(Debug)]
pub struct BalancePolicy {
    config: PolicyConfig,
    rate_limiter: RateLimiter,
}

impl BalancePolicy {
    /// Creates a policy with the given limits.
    #[must_use]
    pub fn new(config: PolicyConfig) -> Self {
        Self {
            config,
            rate_limiter: RateLimiter::new(),
        }
    }

    /// Returns the configured limits.
    #[must_use]
    pub const fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Validates a deposit amount against the deposit bounds.
    ///
    /// # Errors
    ///
    /// Fails on non-positive, below-minimum, above-maximum or unsupported
    /// currency amounts.
    pub fn validate_deposit_amount(&self, amount: Money) -> Result<(), ValidationError> {
        self.validate_amount(AmountKind::Deposit, amount)
    }

    /// Validates a withdrawal or purchase amount.
    ///
    /// # Errors
    ///
    /// Same conditions as [`BalancePolicy::validate_deposit_amount`], with the
    /// withdrawal bounds.
    pub fn validate_withdrawal_amount(&self, amount: Money) -> Result<(), ValidationError> {
        self.validate_amount(AmountKind::Withdrawal, amount)
    }

    /// Validates a pool-to-pool transfer amount.
    ///
    /// # Errors
    ///
    /// Same conditions as [`BalancePolicy::validate_deposit_amount`], with the
    /// transfer bounds.
    pub fn validate_transfer_amount(&self, amount: Money) -> Result<(), ValidationError> {
        self.validate_amount(AmountKind::Transfer, amount)
    }

    fn validate_amount(&self, kind: AmountKind, amount: Money) -> Result<(), ValidationError> {
        let (min, max) = match kind {
            AmountKind::Deposit => (self.config.min_deposit_amount, self.config.max_deposit_amount),
            AmountKind::Withdrawal => (
                self.config.min_withdrawal_amount,
                self.config.max_withdrawal_amount,
            ),
            AmountKind::Transfer => (
                self.config.min_transfer_amount,
                self.config.max_transfer_amount,
            ),
        };

        if !amount.currency().is_supported() {
            return Err(ValidationError::new(
                ValidationCode::UnsupportedCurrency,
                amount.currency(),
                supported_list(),
            ));
        }
        if !amount.is_positive() {
            return Err(ValidationError::new(
                ValidationCode::AmountNotPositive,
                amount,
                "> 0",
            ));
        }
        if amount.amount() < min {
            return Err(ValidationError::new(
                ValidationCode::AmountBelowMinimum,
                amount,
                format!(">= {min}"),
            ));
        }
        if amount.amount() > max {
            return Err(ValidationError::new(
                ValidationCode::AmountAboveMaximum,
                amount,
                format!("<= {max}"),
            ));
        }
        Ok(())
    }

    /// Validates the daily count and per-direction monetary caps.
    ///
    /// `total_today` is the sum of today's transactions in the same direction
    /// as `transaction_type`; `count_today` counts all of today's transactions.
    ///
    /// # Errors
    ///
    /// [`ValidationCode::DailyCountLimitExceeded`] when one more transaction
    /// would exceed the count cap, and the deposit/withdrawal limit codes when
    /// the amount would push the day's total over its cap.
    pub fn validate_daily_limits(
        &self,
        transaction_type: TransactionType,
        amount: Money,
        total_today: Money,
        count_today: u32,
    ) -> Result<(), ValidationError> {
        let limit = self.config.daily_transaction_count_limit;
        if count_today.saturating_add(1) > limit {
            return Err(ValidationError::new(
                ValidationCode::DailyCountLimitExceeded,
                count_today.saturating_add(1),
                format!("<= {limit} transactions per day"),
            ));
        }

        let (cap, code) = match transaction_type {
            TransactionType::Deposit => (
                self.config.daily_deposit_limit,
                ValidationCode::DailyDepositLimitExceeded,
            ),
            TransactionType::Withdrawal | TransactionType::Purchase => (
                self.config.daily_withdrawal_limit,
                ValidationCode::DailyWithdrawalLimitExceeded,
            ),
            TransactionType::Refund | TransactionType::Adjustment => return Ok(()),
        };

        let projected = total_today
            .checked_add(amount.abs())
            .map_err(|_| currency_mismatch(total_today.currency(), amount.currency()))?;
        if projected.amount() > cap {
            return Err(ValidationError::new(
                code,
                projected,
                format!("<= {cap} per day"),
            ));
        }
        Ok(())
    }

    /// Validates a velocity snapshot.
    ///
    /// # Errors
    ///
    /// [`ValidationCode::RateLimitExceeded`] when `count_last_minute` already
    /// reached the per-minute ceiling, [`ValidationCode::TransactionTooFrequent`]
    /// when the previous operation is closer than the minimum interval.
    pub fn validate_rate_limit(
        &self,
        count_last_minute: u32,
        last_transaction_time: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), ValidationError> {
        let max = self.config.max_transactions_per_minute;
        if count_last_minute >= max {
            return Err(ValidationError::new(
                ValidationCode::RateLimitExceeded,
                count_last_minute,
                format!("< {max} operations per minute"),
            ));
        }

        if let Some(last) = last_transaction_time {
            let min_interval = i64::try_from(self.config.min_interval_between_transactions_seconds)
                .ok()
                .and_then(chrono::Duration::try_seconds)
                .unwrap_or(chrono::Duration::MAX);
            let elapsed = now - last;
            if elapsed < min_interval {
                return Err(ValidationError::new(
                    ValidationCode::TransactionTooFrequent,
                    format!("{}ms since last operation", elapsed.num_milliseconds()),
                    format!(">= {}s between operations", min_interval.num_seconds()),
                ));
            }
        }
        Ok(())
    }

    /// Admits or rejects an operation for `user_id`, recording it if admitted.
    ///
    /// # Errors
    ///
    /// Same as [`BalancePolicy::validate_rate_limit`].
    pub fn check_balance_operation(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<(), ValidationError> {
        self.rate_limiter.check_and_record(user_id, now, |window| {
            self.validate_rate_limit(window.count_this_minute, window.last_operation, now)
        })
    }

    /// Boolean form of [`BalancePolicy::check_balance_operation`].
    pub fn is_balance_operation_allowed(&self, user_id: UserId, now: DateTime<Utc>) -> bool {
        match self.check_balance_operation(user_id, now) {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!(user_id = %user_id, code = %err.code, "Balance operation rate limited");
                false
            }
        }
    }

    /// Evicts idle users from the rate limiter. Returns how many were removed.
    pub fn sweep_rate_limiter(&self, now: DateTime<Utc>) -> usize {
        self.rate_limiter.sweep(now)
    }

    /// Validates a currency pair.
    ///
    /// # Errors
    ///
    /// [`ValidationCode::UnsupportedCurrency`] if either side is unsupported,
    /// [`ValidationCode::CrossCurrencyNotAllowed`] if they differ while
    /// cross-currency operations are disabled.
    pub fn validate_currency_operation(
        &self,
        from: Currency,
        to: Currency,
    ) -> Result<(), ValidationError> {
        for currency in [from, to] {
            if !currency.is_supported() {
                return Err(ValidationError::new(
                    ValidationCode::UnsupportedCurrency,
                    currency,
                    supported_list(),
                ));
            }
        }
        if from != to && !self.config.allow_cross_currency_transactions {
            return Err(ValidationError::new(
                ValidationCode::CrossCurrencyNotAllowed,
                format!("{from} -> {to}"),
                "same currency",
            ));
        }
        Ok(())
    }

    /// Flat-percentage conversion fee; zero for same-currency operations.
    #[must_use]
    pub fn calculate_currency_conversion_fee(
        &self,
        amount: Money,
        from: Currency,
        to: Currency,
    ) -> Money {
        if from == to {
            return Money::zero(amount.currency());
        }
        amount
            .abs()
            .percent(self.config.max_currency_conversion_fee_percent)
    }

    /// Validates that an admin action names both the actor and the action.
    ///
    /// # Errors
    ///
    /// [`ValidationCode::BlankAdminUser`] or [`ValidationCode::BlankOperation`].
    pub fn validate_admin_operation(
        &self,
        admin_user: &str,
        operation: &str,
    ) -> Result<(), ValidationError> {
        if admin_user.trim().is_empty() {
            return Err(ValidationError::new(
                ValidationCode::BlankAdminUser,
                format!("{admin_user:?}"),
                "non-blank admin user",
            ));
        }
        if operation.trim().is_empty() {
            return Err(ValidationError::new(
                ValidationCode::BlankOperation,
                format!("{operation:?}"),
                "non-blank operation",
            ));
        }
        Ok(())
    }
}

impl Default for BalancePolicy {
    fn default() -> Self {
        Self::new(PolicyConfig::default())
    }
}

/// Currency mismatch between an operand and the balance it targets.
#[must_use]
pub fn currency_mismatch(expected: Currency, actual: Currency) -> ValidationError {
    ValidationError::new(ValidationCode::CurrencyMismatch, actual, format!("== {expected}"))
}

fn supported_list() -> String {
    let codes: Vec<&str> = Currency::SUPPORTED.iter().map(Currency::code).collect();
    format!("one of {}", codes.join(", "))
}
