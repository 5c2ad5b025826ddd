//! Money and currency value types.
//!
//! `Money` is an immutable `(Decimal, Currency)` pair with a fixed scale of two
//! decimal places. Arithmetic between different currencies is rejected rather
//! than silently converted.
//!
//! # Example
//!
//! ```
//! use balance_ledger_core::money::{Currency, Money};
//! use rust_decimal::Decimal;
//!
//! let price = Money::new(Decimal::new(1250, 2), Currency::USD);
//! let fee = Money::from_minor_units(50, Currency::USD);
//! let total = price.checked_add(fee).unwrap();
//! assert_eq!(total.to_string(), "13.00 USD");
//! ```

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Number of decimal places every `Money` amount carries.
pub const MONEY_SCALE: u32 = 2;

/// Errors produced by money arithmetic and currency parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MoneyError {
    /// Two amounts with different currencies were combined.
    #[error("Currency mismatch: {left} vs {right}")]
    CurrencyMismatch {
        /// Currency of the left operand
        left: Currency,
        /// Currency of the right operand
        right: Currency,
    },

    /// A currency code was not three ASCII letters.
    #[error("Invalid currency code: {0:?}")]
    InvalidCurrencyCode(String),

    /// Decimal arithmetic overflowed.
    #[error("Arithmetic overflow")]
    Overflow,
}

/// ISO-4217 style currency: a three-letter uppercase code.
///
/// Equality and hashing use the code only. Any well-formed code can be
/// constructed; whether it is accepted for ledger operations is a policy
/// decision (see [`Currency::is_supported`]).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Currency {
    code: [u8; 3],
}

impl Currency {
    /// US dollar
    pub const USD: Self = Self { code: *b"USD" };
    /// Euro
    pub const EUR: Self = Self { code: *b"EUR" };
    /// Russian ruble
    pub const RUB: Self = Self { code: *b"RUB" };

    /// Currency used when none is specified.
    pub const DEFAULT: Self = Self::USD;

    /// Currencies the ledger accepts.
    pub const SUPPORTED: [Self; 3] = [Self::USD, Self::EUR, Self::RUB];

    /// Parses a currency code. Lowercase input is normalized to uppercase.
    ///
    /// # Errors
    ///
    /// Returns [`MoneyError::InvalidCurrencyCode`] unless `code` is exactly
    /// three ASCII letters.
    pub fn from_code(code: &str) -> Result<Self, MoneyError> {
        let bytes = code.trim().as_bytes();
        if bytes.len() != 3 || !bytes.iter().all(u8::is_ascii_alphabetic) {
            return Err(MoneyError::InvalidCurrencyCode(code.to_string()));
        }
        let mut normalized = [0u8; 3];
        for (slot, byte) in normalized.iter_mut().zip(bytes) {
            *slot = byte.to_ascii_uppercase();
        }
        Ok(Self { code: normalized })
    }

    /// Returns the three-letter code.
    #[must_use]
    pub fn code(&self) -> &str {
        // Constructors only admit ASCII letters.
        std::str::from_utf8(&self.code).unwrap_or("???")
    }

    /// Returns the display symbol, falling back to the code.
    #[must_use]
    pub fn symbol(&self) -> &str {
        match &self.code {
            b"USD" => "$",
            b"EUR" => "€",
            b"RUB" => "₽",
            _ => self.code(),
        }
    }

    /// Whether this currency belongs to [`Currency::SUPPORTED`].
    #[must_use]
    pub fn is_supported(&self) -> bool {
        Self::SUPPORTED.contains(self)
    }
}

impl Default for Currency {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl fmt::Debug for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Currency({})", self.code())
    }
}

impl FromStr for Currency {
    type Err = MoneyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_code(s)
    }
}

impl TryFrom<String> for Currency {
    type Error = MoneyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_code(&value)
    }
}

impl From<Currency> for String {
    fn from(currency: Currency) -> Self {
        currency.code().to_string()
    }
}

/// An immutable monetary amount in a single currency.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Money {
    amount: Decimal,
    currency: Currency,
}

impl Money {
    /// Creates a money value, rounding half away from zero to two decimals.
    #[must_use]
    pub fn new(amount: Decimal, currency: Currency) -> Self {
        let mut amount =
            amount.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero);
        amount.rescale(MONEY_SCALE);
        Self { amount, currency }
    }

    /// Creates a money value from minor units (cents, kopecks).
    #[must_use]
    pub fn from_minor_units(units: i64, currency: Currency) -> Self {
        Self::new(Decimal::new(units, MONEY_SCALE), currency)
    }

    /// Creates a money value from whole major units.
    #[must_use]
    pub fn from_major_units(units: i64, currency: Currency) -> Self {
        Self::new(Decimal::from(units), currency)
    }

    /// The additive identity for `currency`.
    #[must_use]
    pub fn zero(currency: Currency) -> Self {
        Self::new(Decimal::ZERO, currency)
    }

    /// Returns the decimal amount.
    #[must_use]
    pub const fn amount(&self) -> Decimal {
        self.amount
    }

    /// Returns the currency.
    #[must_use]
    pub const fn currency(&self) -> Currency {
        self.currency
    }

    /// Returns the amount in minor units, if it fits in an `i64`.
    #[must_use]
    pub fn minor_units(&self) -> Option<i64> {
        (self.amount * Decimal::ONE_HUNDRED).to_i64()
    }

    /// Checks if this amount is zero.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.amount.is_zero()
    }

    /// Checks if this amount is strictly greater than zero.
    #[must_use]
    pub fn is_positive(&self) -> bool {
        self.amount > Decimal::ZERO
    }

    /// Checks if this amount is strictly less than zero.
    #[must_use]
    pub fn is_negative(&self) -> bool {
        self.amount < Decimal::ZERO
    }

    /// Adds two amounts of the same currency.
    ///
    /// # Errors
    ///
    /// Returns [`MoneyError::CurrencyMismatch`] for different currencies and
    /// [`MoneyError::Overflow`] if the decimal overflows.
    pub fn checked_add(self, other: Self) -> Result<Self, MoneyError> {
        self.ensure_same_currency(other)?;
        let amount = self
            .amount
            .checked_add(other.amount)
            .ok_or(MoneyError::Overflow)?;
        Ok(Self::new(amount, self.currency))
    }

    /// Subtracts `other` from `self`. The result may be negative.
    ///
    /// # Errors
    ///
    /// Returns [`MoneyError::CurrencyMismatch`] for different currencies and
    /// [`MoneyError::Overflow`] if the decimal overflows.
    pub fn checked_sub(self, other: Self) -> Result<Self, MoneyError> {
        self.ensure_same_currency(other)?;
        let amount = self
            .amount
            .checked_sub(other.amount)
            .ok_or(MoneyError::Overflow)?;
        Ok(Self::new(amount, self.currency))
    }

    /// Subtracts `other`, flooring the result at zero.
    ///
    /// # Errors
    ///
    /// Same as [`Money::checked_sub`].
    pub fn saturating_sub(self, other: Self) -> Result<Self, MoneyError> {
        let difference = self.checked_sub(other)?;
        if difference.is_negative() {
            Ok(Self::zero(self.currency))
        } else {
            Ok(difference)
        }
    }

    /// Returns the negated amount.
    #[must_use]
    pub fn negate(self) -> Self {
        Self::new(-self.amount, self.currency)
    }

    /// Returns the absolute amount.
    #[must_use]
    pub fn abs(self) -> Self {
        Self::new(self.amount.abs(), self.currency)
    }

    /// Returns `percent` percent of this amount, rounded to two decimals.
    #[must_use]
    pub fn percent(self, percent: Decimal) -> Self {
        Self::new(self.amount * percent / Decimal::ONE_HUNDRED, self.currency)
    }

    /// Returns the smaller of two same-currency amounts.
    ///
    /// # Errors
    ///
    /// Returns [`MoneyError::CurrencyMismatch`] for different currencies.
    pub fn min(self, other: Self) -> Result<Self, MoneyError> {
        self.ensure_same_currency(other)?;
        Ok(if other.amount < self.amount { other } else { self })
    }

    fn ensure_same_currency(self, other: Self) -> Result<(), MoneyError> {
        if self.currency == other.currency {
            Ok(())
        } else {
            Err(MoneyError::CurrencyMismatch {
                left: self.currency,
                right: other.currency,
            })
        }
    }
}

impl PartialOrd for Money {
    /// Amounts in different currencies are not comparable.
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.currency == other.currency {
            Some(self.amount.cmp(&other.amount))
        } else {
            None
        }
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount, self.currency)
    }
}
