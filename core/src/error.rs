//! Error taxonomy for ledger operations.
//!
//! - [`ValidationError`]: a policy rule rejected the request (never retried)
//! - [`LedgerError`]: everything the aggregates can raise, including
//!   insufficient funds and invalid state transitions
//!
//! Persistence conflicts live in [`crate::repository::RepositoryError`] so
//! callers can tell a stale-version save apart from a business failure.

use crate::money::{Money, MoneyError};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Machine-readable reason for a validation failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationCode {
    /// Amount is zero or negative
    AmountNotPositive,
    /// Amount is below the configured minimum
    AmountBelowMinimum,
    /// Amount is above the configured maximum
    AmountAboveMaximum,
    /// Daily transaction count would be exceeded
    DailyCountLimitExceeded,
    /// Daily deposit total would be exceeded
    DailyDepositLimitExceeded,
    /// Daily withdrawal/purchase total would be exceeded
    DailyWithdrawalLimitExceeded,
    /// Too many operations in the current minute
    RateLimitExceeded,
    /// Operation follows the previous one too closely
    TransactionTooFrequent,
    /// Currency is not in the supported set
    UnsupportedCurrency,
    /// Cross-currency operations are disabled
    CrossCurrencyNotAllowed,
    /// Operand currency differs from the balance currency
    CurrencyMismatch,
    /// Admin user identifier is blank
    BlankAdminUser,
    /// Admin operation name is blank
    BlankOperation,
    /// Transfer source and destination pools are the same
    InvalidTransferDirection,
    /// Release exceeds the amount currently reserved
    ReleaseExceedsReserved,
    /// Recorded before/after balances disagree with the signed amount
    InconsistentSnapshot,
    /// An adjustment would leave the balance below zero or below holds
    NegativeResultingBalance,
}

impl ValidationCode {
    /// Stable string form, suitable for logs and API payloads.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AmountNotPositive => "AMOUNT_NOT_POSITIVE",
            Self::AmountBelowMinimum => "AMOUNT_BELOW_MINIMUM",
            Self::AmountAboveMaximum => "AMOUNT_ABOVE_MAXIMUM",
            Self::DailyCountLimitExceeded => "DAILY_COUNT_LIMIT_EXCEEDED",
            Self::DailyDepositLimitExceeded => "DAILY_DEPOSIT_LIMIT_EXCEEDED",
            Self::DailyWithdrawalLimitExceeded => "DAILY_WITHDRAWAL_LIMIT_EXCEEDED",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::TransactionTooFrequent => "TRANSACTION_TOO_FREQUENT",
            Self::UnsupportedCurrency => "UNSUPPORTED_CURRENCY",
            Self::CrossCurrencyNotAllowed => "CROSS_CURRENCY_NOT_ALLOWED",
            Self::CurrencyMismatch => "CURRENCY_MISMATCH",
            Self::BlankAdminUser => "BLANK_ADMIN_USER",
            Self::BlankOperation => "BLANK_OPERATION",
            Self::InvalidTransferDirection => "INVALID_TRANSFER_DIRECTION",
            Self::ReleaseExceedsReserved => "RELEASE_EXCEEDS_RESERVED",
            Self::InconsistentSnapshot => "INCONSISTENT_SNAPSHOT",
            Self::NegativeResultingBalance => "NEGATIVE_RESULTING_BALANCE",
        }
    }
}

impl fmt::Display for ValidationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rejected value together with the constraint it violated.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{code}: {value} violates {constraint}")]
pub struct ValidationError {
    /// Machine-readable reason
    pub code: ValidationCode,
    /// The offending value, rendered
    pub value: String,
    /// The expected constraint, rendered
    pub constraint: String,
}

impl ValidationError {
    /// Creates a validation error
    #[must_use]
    pub fn new(code: ValidationCode, value: impl ToString, constraint: impl Into<String>) -> Self {
        Self {
            code,
            value: value.to_string(),
            constraint: constraint.into(),
        }
    }
}

/// Errors raised by aggregates and the policy.
///
/// A failed operation never leaves partial state behind.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    /// A policy rule rejected the request.
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// The single-pool balance cannot cover the request.
    #[error("Insufficient funds on balance {balance_id}: available {available}, requested {requested}")]
    InsufficientFunds {
        /// Balance that was short
        balance_id: String,
        /// Funds available (current minus reserved)
        available: Money,
        /// Amount requested
        requested: Money,
    },

    /// The bank pool of a dual balance cannot cover a transfer.
    #[error("Insufficient bank funds on {balance_id}: available {available}, requested {requested}")]
    InsufficientBankFunds {
        /// Dual balance that was short
        balance_id: String,
        /// Bank pool balance
        available: Money,
        /// Amount requested
        requested: Money,
    },

    /// The main pool of a dual balance cannot cover a purchase.
    #[error("Insufficient main funds on {balance_id}: available {available}, requested {requested}")]
    InsufficientMainFunds {
        /// Dual balance that was short
        balance_id: String,
        /// Main pool balance
        available: Money,
        /// Amount requested
        requested: Money,
    },

    /// The entity is not in a state that permits the operation.
    #[error("Invalid transaction: {entity} is {state}, requires {required}")]
    InvalidTransaction {
        /// Entity description (e.g. `transaction txn_...`)
        entity: String,
        /// Current state
        state: String,
        /// State required by the operation
        required: String,
    },

    /// Money arithmetic failed.
    #[error("Money error: {0}")]
    Money(#[from] MoneyError),
}

impl LedgerError {
    /// Shorthand for an [`LedgerError::InvalidTransaction`].
    #[must_use]
    pub fn invalid_state(
        entity: impl Into<String>,
        state: impl ToString,
        required: impl Into<String>,
    ) -> Self {
        Self::InvalidTransaction {
            entity: entity.into(),
            state: state.to_string(),
            required: required.into(),
        }
    }

    /// Returns the validation code, if this is a validation failure.
    #[must_use]
    pub const fn validation_code(&self) -> Option<ValidationCode> {
        match self {
            Self::Validation(err) => Some(err.code),
            _ => None,
        }
    }

    /// Whether this is one of the insufficient-funds variants.
    #[must_use]
    pub const fn is_insufficient_funds(&self) -> bool {
        matches!(
            self,
            Self::InsufficientFunds { .. }
                | Self::InsufficientBankFunds { .. }
                | Self::InsufficientMainFunds { .. }
        )
    }
}

/// Result alias for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;
