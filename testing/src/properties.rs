//! Property-based testing utilities using proptest.
//!
//! Strategies produce amounts that sit inside the default policy bounds, and
//! sequences of balance operations for invariants that must hold after any
//! interleaving.

use balance_ledger_core::money::{Currency, Money};
use balance_ledger_core::transaction::TransactionType;
use proptest::prelude::*;

/// Any USD amount between `min_cents` and `max_cents` inclusive.
pub fn usd_amount(min_cents: i64, max_cents: i64) -> impl Strategy<Value = Money> + Clone {
    (min_cents..=max_cents).prop_map(|cents| Money::from_minor_units(cents, Currency::USD))
}

/// A USD amount accepted by the default deposit and withdrawal bounds.
pub fn policy_amount() -> impl Strategy<Value = Money> {
    usd_amount(100, 50_000_00)
}

/// Any transaction type.
pub fn transaction_type() -> impl Strategy<Value = TransactionType> {
    prop_oneof![
        Just(TransactionType::Deposit),
        Just(TransactionType::Withdrawal),
        Just(TransactionType::Purchase),
        Just(TransactionType::Refund),
        Just(TransactionType::Adjustment),
    ]
}

/// One single-pool balance operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BalanceOp {
    /// Credit funds
    Deposit(Money),
    /// Debit funds
    Withdraw(Money),
    /// Place a hold
    Reserve(Money),
    /// Drop part of the holds
    Release(Money),
    /// Settle part of the holds
    Capture(Money),
    /// Return funds
    Refund(Money),
    /// Signed admin correction
    Adjust(Money),
}

/// A single balance operation with a policy-valid amount.
pub fn balance_op() -> impl Strategy<Value = BalanceOp> {
    let amount = usd_amount(100, 5_000_00);
    prop_oneof![
        amount.clone().prop_map(BalanceOp::Deposit),
        amount.clone().prop_map(BalanceOp::Withdraw),
        amount.clone().prop_map(BalanceOp::Reserve),
        amount.clone().prop_map(BalanceOp::Release),
        amount.clone().prop_map(BalanceOp::Capture),
        amount.clone().prop_map(BalanceOp::Refund),
        (amount, any::<bool>()).prop_map(|(money, negative)| {
            BalanceOp::Adjust(if negative { money.negate() } else { money })
        }),
    ]
}

/// Up to `max_len` operations in a row.
pub fn balance_ops(max_len: usize) -> impl Strategy<Value = Vec<BalanceOp>> {
    prop::collection::vec(balance_op(), 0..=max_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn policy_amounts_are_positive(amount in policy_amount()) {
            prop_assert!(amount.is_positive());
            prop_assert_eq!(amount.currency(), Currency::USD);
        }

        #[test]
        fn single_ops_carry_bounded_amounts(op in balance_op()) {
            let amount = match op {
                BalanceOp::Deposit(m)
                | BalanceOp::Withdraw(m)
                | BalanceOp::Reserve(m)
                | BalanceOp::Release(m)
                | BalanceOp::Capture(m)
                | BalanceOp::Refund(m)
                | BalanceOp::Adjust(m) => m.abs(),
            };
            prop_assert!(amount >= Money::from_minor_units(100, Currency::USD));
            prop_assert!(amount <= Money::from_minor_units(5_000_00, Currency::USD));
        }

        #[test]
        fn op_sequences_respect_length(ops in balance_ops(8)) {
            prop_assert!(ops.len() <= 8);
        }
    }
}
