//! Policy configuration.
//!
//! Loads limits from environment variables with defaults suitable for a
//! virtual-goods shop. Monetary limits are plain decimals interpreted in the
//! currency of the balance being checked.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;

/// Limits enforced by [`BalancePolicy`](super::BalancePolicy).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Smallest accepted deposit
    pub min_deposit_amount: Decimal,
    /// Largest accepted deposit
    pub max_deposit_amount: Decimal,
    /// Smallest accepted withdrawal or purchase
    pub min_withdrawal_amount: Decimal,
    /// Largest accepted withdrawal or purchase
    pub max_withdrawal_amount: Decimal,
    /// Smallest accepted pool-to-pool transfer
    pub min_transfer_amount: Decimal,
    /// Largest accepted pool-to-pool transfer
    pub max_transfer_amount: Decimal,
    /// Cap on the sum of deposits per user per UTC day
    pub daily_deposit_limit: Decimal,
    /// Cap on the sum of withdrawals and purchases per user per UTC day
    pub daily_withdrawal_limit: Decimal,
    /// Cap on the number of transactions per user per UTC day
    pub daily_transaction_count_limit: u32,
    /// Operations allowed per user per calendar minute
    pub max_transactions_per_minute: u32,
    /// Minimum gap between two operations of the same user
    pub min_interval_between_transactions_seconds: u64,
    /// Flat fee charged on cross-currency operations, in percent
    pub max_currency_conversion_fee_percent: Decimal,
    /// Whether operations may mix currencies at all
    pub allow_cross_currency_transactions: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            min_deposit_amount: Decimal::new(100, 2),
            max_deposit_amount: Decimal::new(100_000_00, 2),
            min_withdrawal_amount: Decimal::new(100, 2),
            max_withdrawal_amount: Decimal::new(50_000_00, 2),
            min_transfer_amount: Decimal::new(100, 2),
            max_transfer_amount: Decimal::new(100_000_00, 2),
            daily_deposit_limit: Decimal::new(500_000_00, 2),
            daily_withdrawal_limit: Decimal::new(200_000_00, 2),
            daily_transaction_count_limit: 100,
            max_transactions_per_minute: 10,
            min_interval_between_transactions_seconds: 1,
            max_currency_conversion_fee_percent: Decimal::new(25, 1),
            allow_cross_currency_transactions: false,
        }
    }
}

impl PolicyConfig {
    /// Load configuration from `LEDGER_*` environment variables.
    ///
    /// Unset or unparsable variables fall back to [`PolicyConfig::default`].
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            min_deposit_amount: env_or("LEDGER_MIN_DEPOSIT_AMOUNT", defaults.min_deposit_amount),
            max_deposit_amount: env_or("LEDGER_MAX_DEPOSIT_AMOUNT", defaults.max_deposit_amount),
            min_withdrawal_amount: env_or(
                "LEDGER_MIN_WITHDRAWAL_AMOUNT",
                defaults.min_withdrawal_amount,
            ),
            max_withdrawal_amount: env_or(
                "LEDGER_MAX_WITHDRAWAL_AMOUNT",
                defaults.max_withdrawal_amount,
            ),
            min_transfer_amount: env_or("LEDGER_MIN_TRANSFER_AMOUNT", defaults.min_transfer_amount),
            max_transfer_amount: env_or("LEDGER_MAX_TRANSFER_AMOUNT", defaults.max_transfer_amount),
            daily_deposit_limit: env_or("LEDGER_DAILY_DEPOSIT_LIMIT", defaults.daily_deposit_limit),
            daily_withdrawal_limit: env_or(
                "LEDGER_DAILY_WITHDRAWAL_LIMIT",
                defaults.daily_withdrawal_limit,
            ),
            daily_transaction_count_limit: env_or(
                "LEDGER_DAILY_TRANSACTION_COUNT_LIMIT",
                defaults.daily_transaction_count_limit,
            ),
            max_transactions_per_minute: env_or(
                "LEDGER_MAX_TRANSACTIONS_PER_MINUTE",
                defaults.max_transactions_per_minute,
            ),
            min_interval_between_transactions_seconds: env_or(
                "LEDGER_MIN_INTERVAL_BETWEEN_TRANSACTIONS_SECONDS",
                defaults.min_interval_between_transactions_seconds,
            ),
            max_currency_conversion_fee_percent: env_or(
                "LEDGER_MAX_CURRENCY_CONVERSION_FEE_PERCENT",
                defaults.max_currency_conversion_fee_percent,
            ),
            allow_cross_currency_transactions: env_or(
                "LEDGER_ALLOW_CROSS_CURRENCY_TRANSACTIONS",
                defaults.allow_cross_currency_transactions,
            ),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}
