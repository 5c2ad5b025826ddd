//! Integration tests for the ledger service.
//!
//! Every test drives a `LedgerService` over in-memory repositories and a
//! manual clock. The clock is stepped between operations so the per-user
//! minimum interval does not interfere unless a test is about it.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

mod common;

use balance_ledger_core::Decimal;
use balance_ledger_core::error::{LedgerError, ValidationCode};
use balance_ledger_core::event::LedgerEvent;
use balance_ledger_core::ids::{OrderId, TransactionId, UserId};
use balance_ledger_core::money::Currency;
use balance_ledger_core::policy::PolicyConfig;
use balance_ledger_core::repository::Repository;
use balance_ledger_core::transaction::{TransactionStatus, TransactionType};
use balance_ledger_core::transfer::BalanceType;
use balance_ledger_runtime::{LedgerServiceConfig, LedgerServiceError};
use common::{Harness, USER, fast_retries, usd};

fn validation_code(err: &LedgerServiceError) -> Option<ValidationCode> {
    match err {
        LedgerServiceError::Domain(e) => e.validation_code(),
        LedgerServiceError::RateLimited(e) => Some(e.code),
        _ => None,
    }
}

// ============================================================================
// Single-pool operations
// ============================================================================

#[tokio::test]
async fn open_balance_is_idempotent() {
    let h = Harness::new();
    let first = h.service.open_balance(USER, Currency::USD).await.unwrap();
    let second = h.service.open_balance(USER, Currency::USD).await.unwrap();

    assert_eq!(first.id(), second.id());
    assert_eq!(h.balances.len(), 1);
    assert!(first.current_balance().is_zero());
}

#[tokio::test]
async fn deposit_records_completed_transaction_and_publishes_in_order() {
    let h = Harness::new();
    h.service.open_balance(USER, Currency::USD).await.unwrap();
    h.tick();

    let outcome = h
        .service
        .deposit(USER, usd(100_00), "Top-up", None)
        .await
        .unwrap();

    assert_eq!(outcome.balance.current_balance(), usd(100_00));
    assert_eq!(outcome.balance.total_deposited(), usd(100_00));
    assert_eq!(outcome.transaction.status(), TransactionStatus::Completed);
    assert_eq!(outcome.transaction.transaction_type(), TransactionType::Deposit);
    assert_eq!(outcome.transaction.balance_before(), usd(0));
    assert_eq!(outcome.transaction.balance_after(), usd(100_00));
    assert_eq!(outcome.transaction.processed_by(), Some("balance-ledger"));
    assert!(outcome.transaction.transaction_id().as_str().starts_with("txn_"));

    assert_eq!(
        h.publisher.event_types(),
        vec![
            "TransactionCreated.v1",
            "BalanceChanged.v1",
            "TransactionCompleted.v1"
        ]
    );

    let stored = h
        .transactions
        .find_by_id(outcome.transaction.transaction_id().clone())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status(), TransactionStatus::Completed);
}

#[tokio::test]
async fn withdraw_reduces_balance_and_tracks_spending() {
    let h = Harness::funded(100_00).await;

    let outcome = h
        .service
        .withdraw(USER, usd(30_00), "Cash out", None)
        .await
        .unwrap();

    assert_eq!(outcome.balance.current_balance(), usd(70_00));
    assert_eq!(outcome.balance.total_spent(), usd(30_00));
    assert_eq!(outcome.transaction.transaction_type(), TransactionType::Withdrawal);
    assert_eq!(h.transactions.len(), 2);
}

#[tokio::test]
async fn insufficient_funds_changes_nothing() {
    let h = Harness::funded(10_00).await;

    let err = h
        .service
        .withdraw(USER, usd(20_00), "Too much", None)
        .await
        .unwrap_err();

    assert!(matches!(&err, LedgerServiceError::Domain(e) if e.is_insufficient_funds()));
    assert_eq!(h.service.get_balance(USER).await.unwrap().current_balance(), usd(10_00));
    assert_eq!(h.transactions.len(), 1);
    assert!(h.publisher.published().is_empty());
}

#[tokio::test]
async fn reused_transaction_id_is_rejected() {
    let h = Harness::new();
    h.service.open_balance(USER, Currency::USD).await.unwrap();
    h.tick();
    let id = TransactionId::new("txn_client_supplied");

    h.service
        .deposit(USER, usd(5_00), "First", Some(id.clone()))
        .await
        .unwrap();
    h.tick();
    let err = h
        .service
        .deposit(USER, usd(5_00), "Replay", Some(id))
        .await
        .unwrap_err();

    assert!(matches!(err, LedgerServiceError::Domain(LedgerError::InvalidTransaction { .. })));
    assert_eq!(h.service.get_balance(USER).await.unwrap().current_balance(), usd(5_00));
}

#[tokio::test]
async fn unknown_user_is_not_found() {
    let h = Harness::new();
    let err = h
        .service
        .deposit(UserId::new(7), usd(1_00), "Nobody", None)
        .await
        .unwrap_err();

    assert!(matches!(err, LedgerServiceError::NotFound { entity: "balance", .. }));
}

#[tokio::test]
async fn refund_credits_balance_against_order() {
    let h = Harness::funded(50_00).await;

    let outcome = h
        .service
        .refund(USER, usd(12_50), "Returned item", Some(OrderId::new("order-9")), None)
        .await
        .unwrap();

    assert_eq!(outcome.balance.current_balance(), usd(62_50));
    assert_eq!(outcome.transaction.transaction_type(), TransactionType::Refund);
    assert_eq!(outcome.transaction.order_id(), Some(&OrderId::new("order-9")));
}

// ============================================================================
// Reservations
// ============================================================================

#[tokio::test]
async fn reserve_then_capture_charges_the_hold() {
    let h = Harness::funded(100_00).await;

    let reserved = h
        .service
        .reserve(USER, usd(40_00), OrderId::new("order-1"), "Checkout", None)
        .await
        .unwrap();
    assert_eq!(reserved.transaction.status(), TransactionStatus::Pending);
    assert_eq!(reserved.transaction.transaction_type(), TransactionType::Purchase);
    assert_eq!(reserved.balance.current_balance(), usd(100_00));
    assert_eq!(reserved.balance.reserved_amount(), usd(40_00));
    assert_eq!(reserved.balance.available_balance(), usd(60_00));

    h.tick();
    let id = reserved.transaction.transaction_id().clone();
    let captured = h.service.capture(USER, &id, "Shipped").await.unwrap();
    assert_eq!(captured.balance.current_balance(), usd(60_00));
    assert_eq!(captured.balance.reserved_amount(), usd(0));
    assert_eq!(captured.transaction.status(), TransactionStatus::Completed);

    h.tick();
    let err = h.service.capture(USER, &id, "Again").await.unwrap_err();
    assert!(matches!(err, LedgerServiceError::Domain(LedgerError::InvalidTransaction { .. })));
}

#[tokio::test]
async fn capture_records_the_balance_at_capture_time() {
    let h = Harness::funded(100_00).await;
    let reserved = h
        .service
        .reserve(USER, usd(40_00), OrderId::new("order-7"), "Checkout", None)
        .await
        .unwrap();
    assert_eq!(reserved.transaction.balance_before(), usd(100_00));
    assert_eq!(reserved.transaction.balance_after(), usd(60_00));
    h.tick();
    h.service.deposit(USER, usd(50_00), "Top-up", None).await.unwrap();
    h.tick();

    let id = reserved.transaction.transaction_id().clone();
    let captured = h.service.capture(USER, &id, "Shipped").await.unwrap();

    assert_eq!(captured.balance.current_balance(), usd(110_00));
    assert_eq!(captured.transaction.balance_before(), usd(150_00));
    assert_eq!(captured.transaction.balance_after(), usd(110_00));
    assert_eq!(captured.transaction.status(), TransactionStatus::Completed);

    let stored = h.transactions.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(stored.balance_before(), usd(150_00));
    assert_eq!(stored.balance_after(), usd(110_00));
}

#[tokio::test]
async fn release_drops_the_hold_and_cancels_the_record() {
    let h = Harness::funded(100_00).await;
    let reserved = h
        .service
        .reserve(USER, usd(25_00), OrderId::new("order-2"), "Checkout", None)
        .await
        .unwrap();
    h.tick();

    let released = h
        .service
        .release(USER, reserved.transaction.transaction_id(), "Abandoned")
        .await
        .unwrap();

    assert_eq!(released.balance.current_balance(), usd(100_00));
    assert_eq!(released.balance.reserved_amount(), usd(0));
    assert_eq!(released.transaction.status(), TransactionStatus::Cancelled);
    assert!(h.publisher.event_types().contains(&"TransactionCancelled.v1".to_string()));
}

#[tokio::test]
async fn holds_reduce_what_can_be_withdrawn() {
    let h = Harness::funded(100_00).await;
    h.service
        .reserve(USER, usd(80_00), OrderId::new("order-3"), "Checkout", None)
        .await
        .unwrap();
    h.tick();

    let err = h
        .service
        .withdraw(USER, usd(30_00), "Cash out", None)
        .await
        .unwrap_err();
    assert!(matches!(&err, LedgerServiceError::Domain(e) if e.is_insufficient_funds()));
}

#[tokio::test]
async fn another_users_reservation_is_not_found() {
    let h = Harness::funded(100_00).await;
    let reserved = h
        .service
        .reserve(USER, usd(10_00), OrderId::new("order-4"), "Checkout", None)
        .await
        .unwrap();

    let err = h
        .service
        .capture(UserId::new(99), reserved.transaction.transaction_id(), "Hijack")
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerServiceError::NotFound { entity: "transaction", .. }));
}

// ============================================================================
// Limits
// ============================================================================

#[tokio::test]
async fn eleventh_operation_in_a_minute_is_rate_limited() {
    let h = Harness::new();
    h.service.open_balance(USER, Currency::USD).await.unwrap();

    for _ in 0..10 {
        h.tick();
        h.service.deposit(USER, usd(1_00), "Small", None).await.unwrap();
    }
    h.tick();
    let err = h
        .service
        .deposit(USER, usd(1_00), "One too many", None)
        .await
        .unwrap_err();

    assert!(matches!(err, LedgerServiceError::RateLimited(_)));
    assert_eq!(validation_code(&err), Some(ValidationCode::RateLimitExceeded));
    assert_eq!(h.service.get_balance(USER).await.unwrap().current_balance(), usd(10_00));
}

#[tokio::test]
async fn back_to_back_operations_are_too_frequent() {
    let h = Harness::funded(10_00).await;
    h.service.withdraw(USER, usd(1_00), "First", None).await.unwrap();

    let err = h
        .service
        .withdraw(USER, usd(1_00), "Immediately after", None)
        .await
        .unwrap_err();
    assert_eq!(validation_code(&err), Some(ValidationCode::TransactionTooFrequent));
}

#[tokio::test]
async fn rate_limit_can_be_disabled() {
    let config = LedgerServiceConfig {
        enforce_rate_limit: false,
        ..fast_retries()
    };
    let h = Harness::with(PolicyConfig::default(), config);
    h.service.open_balance(USER, Currency::USD).await.unwrap();

    for _ in 0..12 {
        h.service.deposit(USER, usd(1_00), "Burst", None).await.unwrap();
    }
    assert_eq!(h.service.get_balance(USER).await.unwrap().current_balance(), usd(12_00));
}

#[tokio::test]
async fn daily_count_ignores_cancelled_records() {
    let policy = PolicyConfig {
        daily_transaction_count_limit: 3,
        ..PolicyConfig::default()
    };
    let h = Harness::with(policy, fast_retries());
    h.service.open_balance(USER, Currency::USD).await.unwrap();
    h.tick();

    h.service.deposit(USER, usd(50_00), "1", None).await.unwrap();
    h.tick();
    let reserved = h
        .service
        .reserve(USER, usd(5_00), OrderId::new("order-5"), "Hold", None)
        .await
        .unwrap();
    h.tick();
    h.service
        .release(USER, reserved.transaction.transaction_id(), "Changed mind")
        .await
        .unwrap();
    h.tick();
    h.service.deposit(USER, usd(1_00), "2", None).await.unwrap();
    h.tick();
    h.service.deposit(USER, usd(1_00), "3", None).await.unwrap();
    h.tick();

    let err = h.service.deposit(USER, usd(1_00), "4", None).await.unwrap_err();
    assert_eq!(validation_code(&err), Some(ValidationCode::DailyCountLimitExceeded));
}

#[tokio::test]
async fn daily_deposit_total_is_capped() {
    let policy = PolicyConfig {
        daily_deposit_limit: Decimal::new(150_00, 2),
        ..PolicyConfig::default()
    };
    let h = Harness::with(policy, fast_retries());
    h.service.open_balance(USER, Currency::USD).await.unwrap();
    h.tick();
    h.service.deposit(USER, usd(100_00), "First", None).await.unwrap();
    h.tick();

    let err = h.service.deposit(USER, usd(60_00), "Second", None).await.unwrap_err();
    assert_eq!(validation_code(&err), Some(ValidationCode::DailyDepositLimitExceeded));

    // The cap resets at UTC midnight.
    h.clock.advance(chrono::Duration::days(1));
    h.service.deposit(USER, usd(60_00), "Next day", None).await.unwrap();
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test]
async fn version_conflicts_are_retried() {
    let h = Harness::funded(10_00).await;
    h.balances.conflict_next_saves(2);

    let outcome = h.service.deposit(USER, usd(5_00), "Contended", None).await.unwrap();

    assert_eq!(outcome.balance.current_balance(), usd(15_00));
    assert_eq!(outcome.transaction.status(), TransactionStatus::Completed);
    assert_eq!(h.transactions.len(), 2);
}

#[tokio::test]
async fn exhausted_retries_fail_the_pending_record() {
    let h = Harness::funded(10_00).await;
    h.balances.conflict_next_saves(10);

    let err = h.service.deposit(USER, usd(5_00), "Hopeless", None).await.unwrap_err();
    h.balances.conflict_next_saves(0);

    assert!(matches!(err, LedgerServiceError::RetriesExhausted { attempts: 4, .. }));
    assert_eq!(h.service.get_balance(USER).await.unwrap().current_balance(), usd(10_00));
    let failed: Vec<_> = h
        .transactions
        .all()
        .into_iter()
        .filter(|t| t.status() == TransactionStatus::Failed)
        .collect();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].failure_reason().is_some());
}

#[tokio::test]
async fn concurrent_operations_for_one_user_serialize() {
    let config = LedgerServiceConfig {
        enforce_rate_limit: false,
        ..fast_retries()
    };
    let h = Harness::with(PolicyConfig::default(), config);
    h.service.open_balance(USER, Currency::USD).await.unwrap();

    let deposits = (0..20).map(|i| h.service.deposit(USER, usd(1_00), "Parallel", Some(TransactionId::new(format!("txn_{i}")))));
    let results = futures::future::join_all(deposits).await;

    assert!(results.iter().all(Result::is_ok));
    let balance = h.service.get_balance(USER).await.unwrap();
    assert_eq!(balance.current_balance(), usd(20_00));
    assert_eq!(h.transactions.len(), 20);
}

#[tokio::test]
async fn repository_outage_is_not_retried() {
    let h = Harness::funded(10_00).await;
    h.service.cache().invalidate(USER);
    h.balances.fail_next_operations(1);

    let err = h.service.deposit(USER, usd(5_00), "Outage", None).await.unwrap_err();
    assert!(matches!(err, LedgerServiceError::Repository(_)));
}

// ============================================================================
// Admin operations and rollback
// ============================================================================

#[tokio::test]
async fn adjustment_applies_signed_amount() {
    let h = Harness::funded(20_00).await;

    let down = h
        .service
        .adjust(USER, usd(-5_00), "Chargeback fee", "ops@example.com", None)
        .await
        .unwrap();
    assert_eq!(down.balance.current_balance(), usd(15_00));
    assert_eq!(down.transaction.transaction_type(), TransactionType::Adjustment);

    h.tick();
    let err = h
        .service
        .adjust(USER, usd(-50_00), "Too far", "ops@example.com", None)
        .await
        .unwrap_err();
    assert_eq!(validation_code(&err), Some(ValidationCode::NegativeResultingBalance));

    h.tick();
    let err = h.service.adjust(USER, usd(1_00), "No admin", " ", None).await.unwrap_err();
    assert_eq!(validation_code(&err), Some(ValidationCode::BlankAdminUser));
}

#[tokio::test]
async fn deactivated_balance_rejects_mutations() {
    let h = Harness::funded(20_00).await;

    let inactive = h
        .service
        .deactivate_balance(USER, "Fraud review", "ops@example.com")
        .await
        .unwrap();
    assert!(!inactive.is_active());
    assert_eq!(h.publisher.event_types(), vec!["BalanceDeactivated.v1"]);

    // Already inactive: nothing saved, nothing published.
    h.service
        .deactivate_balance(USER, "Fraud review", "ops@example.com")
        .await
        .unwrap();
    assert_eq!(h.publisher.event_types().len(), 1);

    let err = h.service.deposit(USER, usd(1_00), "Blocked", None).await.unwrap_err();
    assert!(matches!(err, LedgerServiceError::Domain(LedgerError::InvalidTransaction { .. })));

    h.service
        .activate_balance(USER, "Cleared", "ops@example.com")
        .await
        .unwrap();
    h.tick();
    h.service.deposit(USER, usd(1_00), "Allowed", None).await.unwrap();
}

#[tokio::test]
async fn rollback_reverses_a_completed_deposit_once() {
    let h = Harness::new();
    h.service.open_balance(USER, Currency::USD).await.unwrap();
    h.tick();
    let deposit = h.service.deposit(USER, usd(30_00), "Mistake", None).await.unwrap();
    h.tick();

    let original = deposit.transaction.transaction_id().clone();
    let rollback = h
        .service
        .rollback_transaction(USER, &original, "Duplicate charge")
        .await
        .unwrap();

    assert_eq!(rollback.balance.current_balance(), usd(0));
    assert_eq!(rollback.transaction.transaction_type(), TransactionType::Withdrawal);
    assert_eq!(rollback.transaction.parent_transaction_id(), Some(&original));
    assert_eq!(rollback.transaction.status(), TransactionStatus::Completed);
    assert_eq!(rollback.transaction.balance_before(), usd(30_00));
    assert_eq!(rollback.transaction.balance_after(), usd(0));

    h.tick();
    let err = h
        .service
        .rollback_transaction(USER, &original, "Again")
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerServiceError::Domain(LedgerError::InvalidTransaction { .. })));
}

#[tokio::test]
async fn rollback_records_the_balance_it_actually_changed() {
    let h = Harness::new();
    h.service.open_balance(USER, Currency::USD).await.unwrap();
    h.tick();
    let first = h.service.deposit(USER, usd(30_00), "Mistake", None).await.unwrap();
    h.tick();
    h.service.deposit(USER, usd(20_00), "Payday", None).await.unwrap();
    h.tick();

    let original = first.transaction.transaction_id().clone();
    let rollback = h
        .service
        .rollback_transaction(USER, &original, "Duplicate charge")
        .await
        .unwrap();

    assert_eq!(rollback.balance.current_balance(), usd(20_00));
    assert_eq!(rollback.transaction.transaction_type(), TransactionType::Withdrawal);
    assert_eq!(rollback.transaction.parent_transaction_id(), Some(&original));
    assert_eq!(rollback.transaction.balance_before(), usd(50_00));
    assert_eq!(rollback.transaction.balance_after(), usd(20_00));

    let rollback_id = rollback.transaction.transaction_id().clone();
    let change = rollback
        .events
        .iter()
        .find_map(|event| match event {
            LedgerEvent::BalanceChanged {
                transaction_id,
                balance_before,
                balance_after,
                ..
            } if *transaction_id == rollback_id => Some((*balance_before, *balance_after)),
            _ => None,
        })
        .unwrap();
    assert_eq!(change, (usd(50_00), usd(20_00)));

    let stored = h.transactions.find_by_id(rollback_id).await.unwrap().unwrap();
    assert_eq!(stored.balance_before(), usd(50_00));
    assert_eq!(stored.balance_after(), usd(20_00));
}

#[tokio::test]
async fn pending_reservation_cannot_be_rolled_back() {
    let h = Harness::funded(30_00).await;
    let reserved = h
        .service
        .reserve(USER, usd(10_00), OrderId::new("order-6"), "Hold", None)
        .await
        .unwrap();
    h.tick();

    let err = h
        .service
        .rollback_transaction(USER, reserved.transaction.transaction_id(), "Nope")
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerServiceError::Domain(LedgerError::InvalidTransaction { .. })));
}

// ============================================================================
// Dual balances
// ============================================================================

#[tokio::test]
async fn bank_to_main_transfer_moves_funds_and_records_transfer() {
    let h = Harness::new();
    h.service.open_dual_balance(USER, Currency::USD).await.unwrap();
    h.tick();
    h.service.deposit_to_bank(USER, usd(100_00), "Wire").await.unwrap();
    h.tick();

    let outcome = h
        .service
        .transfer_bank_to_main(USER, usd(40_00), "Fund wallet")
        .await
        .unwrap();

    assert_eq!(outcome.dual_balance.bank_balance(), usd(60_00));
    assert_eq!(outcome.dual_balance.main_balance(), usd(40_00));
    let transfer = outcome.transfer.unwrap();
    assert_eq!(transfer.status(), TransactionStatus::Completed);
    assert_eq!(transfer.amount(), usd(40_00));
    assert_eq!(h.transfers.len(), 1);

    let types = h.publisher.event_types();
    assert!(types.contains(&"BalanceTransferInitiated.v1".to_string()));
    assert!(types.contains(&"BalanceTransferCompleted.v1".to_string()));
}

#[tokio::test]
async fn overdrawn_transfer_leaves_both_pools_untouched() {
    let h = Harness::new();
    h.service.open_dual_balance(USER, Currency::USD).await.unwrap();
    h.tick();
    h.service.deposit_to_bank(USER, usd(10_00), "Wire").await.unwrap();
    h.tick();

    let err = h
        .service
        .transfer_bank_to_main(USER, usd(40_00), "Too much")
        .await
        .unwrap_err();

    assert!(matches!(err, LedgerServiceError::Domain(LedgerError::InsufficientBankFunds { .. })));
    let dual = h.service.get_dual_balance(USER).await.unwrap();
    assert_eq!(dual.bank_balance(), usd(10_00));
    assert_eq!(dual.main_balance(), usd(0));
    assert!(h.transfers.is_empty());
}

#[tokio::test]
async fn main_pool_pays_purchases_and_takes_refunds() {
    let h = Harness::new();
    h.service.open_dual_balance(USER, Currency::USD).await.unwrap();
    h.tick();
    h.service.deposit_to_bank(USER, usd(50_00), "Wire").await.unwrap();
    h.tick();
    h.service.transfer_bank_to_main(USER, usd(50_00), "All in").await.unwrap();
    h.tick();

    let err = h
        .service
        .withdraw_from_main(USER, usd(60_00), "Big purchase", Some("p-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerServiceError::Domain(LedgerError::InsufficientMainFunds { .. })));
    h.tick();

    h.service
        .withdraw_from_main(USER, usd(20_00), "Purchase", Some("p-2"))
        .await
        .unwrap();
    h.tick();
    let refunded = h
        .service
        .refund_to_main(USER, usd(5_00), "Partial refund", Some("p-2"))
        .await
        .unwrap();

    assert_eq!(refunded.dual_balance.main_balance(), usd(35_00));
    assert_eq!(refunded.dual_balance.bank_balance(), usd(0));
    assert_eq!(h.dual_balances.len(), 1);
}

#[tokio::test]
async fn pool_mutations_are_recorded_as_transactions() {
    let h = Harness::new();
    h.service.open_dual_balance(USER, Currency::USD).await.unwrap();
    h.tick();

    let deposit = h.service.deposit_to_bank(USER, usd(80_00), "Wire").await.unwrap();
    let record = deposit.transaction.unwrap();
    assert_eq!(record.transaction_type(), TransactionType::Deposit);
    assert_eq!(record.pool(), Some(BalanceType::Bank));
    assert_eq!(record.status(), TransactionStatus::Completed);
    assert_eq!(record.balance_before(), usd(0));
    assert_eq!(record.balance_after(), usd(80_00));
    h.tick();

    let transfer = h
        .service
        .transfer_bank_to_main(USER, usd(50_00), "Fund wallet")
        .await
        .unwrap();
    assert!(transfer.transaction.is_none());
    h.tick();

    let purchase = h
        .service
        .withdraw_from_main(USER, usd(20_00), "Purchase", Some("p-3"))
        .await
        .unwrap();
    let record = purchase.transaction.unwrap();
    assert_eq!(record.transaction_type(), TransactionType::Purchase);
    assert_eq!(record.pool(), Some(BalanceType::Main));
    assert_eq!(record.order_id(), Some(&OrderId::new("p-3")));
    assert_eq!(record.balance_before(), usd(50_00));
    assert_eq!(record.balance_after(), usd(30_00));
    h.tick();

    let refund = h
        .service
        .refund_to_main(USER, usd(5_00), "Partial refund", Some("p-3"))
        .await
        .unwrap();
    let record = refund.transaction.unwrap();
    assert_eq!(record.transaction_type(), TransactionType::Refund);
    assert_eq!(record.balance_before(), usd(30_00));
    assert_eq!(record.balance_after(), usd(35_00));

    let stored = h.transactions.all();
    assert_eq!(stored.len(), 3);
    assert!(stored.iter().all(|t| t.status() == TransactionStatus::Completed));
    assert!(stored.iter().all(|t| t.pool().is_some()));

    let types = h.publisher.event_types();
    let created = types.iter().filter(|t| *t == "TransactionCreated.v1").count();
    let completed = types.iter().filter(|t| *t == "TransactionCompleted.v1").count();
    assert_eq!((created, completed), (3, 3));
}

#[tokio::test]
async fn pool_deposits_count_toward_daily_limits() {
    let policy = PolicyConfig {
        daily_deposit_limit: Decimal::new(150_00, 2),
        ..PolicyConfig::default()
    };
    let h = Harness::with(policy, fast_retries());
    h.service.open_dual_balance(USER, Currency::USD).await.unwrap();
    h.tick();
    h.service.deposit_to_bank(USER, usd(100_00), "Wire").await.unwrap();
    h.tick();

    let err = h
        .service
        .deposit_to_bank(USER, usd(60_00), "Second wire")
        .await
        .unwrap_err();
    assert_eq!(validation_code(&err), Some(ValidationCode::DailyDepositLimitExceeded));
    let dual = h.service.get_dual_balance(USER).await.unwrap();
    assert_eq!(dual.bank_balance(), usd(100_00));
    assert_eq!(h.transactions.len(), 1);
}

#[tokio::test]
async fn pool_operations_count_toward_daily_transaction_limit() {
    let policy = PolicyConfig {
        daily_transaction_count_limit: 2,
        ..PolicyConfig::default()
    };
    let h = Harness::with(policy, fast_retries());
    h.service.open_dual_balance(USER, Currency::USD).await.unwrap();
    h.tick();
    h.service.deposit_to_bank(USER, usd(50_00), "Wire").await.unwrap();
    h.tick();
    // Transfers are not counted.
    h.service.transfer_bank_to_main(USER, usd(50_00), "All in").await.unwrap();
    h.tick();
    h.service
        .withdraw_from_main(USER, usd(10_00), "Purchase", Some("p-4"))
        .await
        .unwrap();
    h.tick();

    let err = h
        .service
        .refund_to_main(USER, usd(5_00), "Refund", Some("p-4"))
        .await
        .unwrap_err();
    assert_eq!(validation_code(&err), Some(ValidationCode::DailyCountLimitExceeded));
    let dual = h.service.get_dual_balance(USER).await.unwrap();
    assert_eq!(dual.main_balance(), usd(40_00));
}

#[tokio::test]
async fn pool_records_cannot_be_rolled_back() {
    let h = Harness::new();
    h.service.open_dual_balance(USER, Currency::USD).await.unwrap();
    h.tick();
    let deposit = h.service.deposit_to_bank(USER, usd(20_00), "Wire").await.unwrap();
    h.tick();

    let record = deposit.transaction.unwrap();
    let err = h
        .service
        .rollback_transaction(USER, record.transaction_id(), "Undo")
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerServiceError::Domain(LedgerError::InvalidTransaction { .. })));
    let dual = h.service.get_dual_balance(USER).await.unwrap();
    assert_eq!(dual.bank_balance(), usd(20_00));
}
