//! Integration tests for the timeout sweeper and balance cache coherence.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

mod common;

use balance_ledger_core::environment::Clock;
use balance_ledger_core::ids::{DualBalanceId, OrderId, TransactionId};
use balance_ledger_core::repository::Repository;
use balance_ledger_core::transaction::TransactionStatus;
use balance_ledger_core::transfer::{BalanceTransferAggregate, BalanceType, TransferSnapshots};
use balance_ledger_core::version::Versioned;
use balance_ledger_runtime::{SweeperConfig, TimeoutSweeper};
use common::{Harness, USER, usd};
use std::time::Duration;

fn minutes(n: i64) -> chrono::Duration {
    chrono::Duration::minutes(n)
}

fn stuck_transfer(h: &Harness) -> BalanceTransferAggregate {
    let snapshots = TransferSnapshots {
        from_before: usd(10_00),
        from_after: usd(0),
        to_before: usd(0),
        to_after: usd(10_00),
    };
    let (transfer, _) = BalanceTransferAggregate::initiate(
        DualBalanceId::new(),
        USER,
        BalanceType::Bank,
        BalanceType::Main,
        usd(10_00),
        snapshots,
        "Stuck",
        h.clock.now(),
    )
    .unwrap();
    transfer
}

// ============================================================================
// Sweeper
// ============================================================================

#[tokio::test]
async fn expired_reservation_is_cancelled_and_its_hold_released() {
    let h = Harness::funded(100_00).await;
    let reserved = h
        .service
        .reserve(USER, usd(40_00), OrderId::new("order-1"), "Checkout", None)
        .await
        .unwrap();
    let id = reserved.transaction.transaction_id().clone();
    let sweeper = TimeoutSweeper::new(h.service.clone(), SweeperConfig::default());

    h.clock.advance(minutes(29));
    let early = sweeper.sweep_once().await.unwrap();
    assert_eq!(early.transactions, 0);

    h.clock.advance(minutes(2));
    let report = sweeper.sweep_once().await.unwrap();
    assert_eq!(report.transactions, 1);
    assert_eq!(report.cancelled(), 1);

    let record = h.transactions.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(record.status(), TransactionStatus::Cancelled);
    let balance = h.service.get_balance(USER).await.unwrap();
    assert_eq!(balance.reserved_amount(), usd(0));
    assert_eq!(balance.current_balance(), usd(100_00));

    let types = h.publisher.event_types();
    assert!(types.contains(&"ReservationReleased.v1".to_string()));
    assert!(types.contains(&"TransactionCancelled.v1".to_string()));
}

#[tokio::test]
async fn expired_reservation_on_deactivated_balance_is_still_cancelled() {
    let h = Harness::funded(100_00).await;
    let reserved = h
        .service
        .reserve(USER, usd(10_00), OrderId::new("order-9"), "Checkout", None)
        .await
        .unwrap();
    let id = reserved.transaction.transaction_id().clone();
    h.service
        .deactivate_balance(USER, "Fraud review", "ops@example.com")
        .await
        .unwrap();
    let sweeper = TimeoutSweeper::new(h.service.clone(), SweeperConfig::default());

    h.clock.advance(minutes(31));
    let report = sweeper.sweep_once().await.unwrap();
    assert_eq!(report.cancelled(), 1);

    let record = h.transactions.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(record.status(), TransactionStatus::Cancelled);
    // The hold cannot move on an inactive balance and is left for an admin.
    let balance = h.service.get_balance(USER).await.unwrap();
    assert_eq!(balance.reserved_amount(), usd(10_00));
    assert!(!balance.is_active());

    let again = sweeper.sweep_once().await.unwrap();
    assert_eq!(again.transactions, 0);
}

#[tokio::test]
async fn completed_transactions_are_left_alone() {
    let h = Harness::funded(100_00).await;
    let sweeper = TimeoutSweeper::new(h.service.clone(), SweeperConfig::default());

    h.clock.advance(minutes(120));
    let report = sweeper.sweep_once().await.unwrap();

    assert_eq!(report.cancelled(), 0);
    assert!(
        h.transactions
            .all()
            .iter()
            .all(|t| t.status() == TransactionStatus::Completed)
    );
}

#[tokio::test]
async fn stale_pending_transfer_is_cancelled_after_fifteen_minutes() {
    let h = Harness::new();
    let transfer = stuck_transfer(&h);
    let id = transfer.transfer_id();
    h.transfers.insert(transfer);
    let sweeper = TimeoutSweeper::new(h.service.clone(), SweeperConfig::default());

    h.clock.advance(minutes(10));
    assert_eq!(sweeper.sweep_once().await.unwrap().transfers, 0);

    h.clock.advance(minutes(6));
    assert_eq!(sweeper.sweep_once().await.unwrap().transfers, 1);

    let stored = h.transfers.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(stored.status(), TransactionStatus::Cancelled);
    assert!(!stored.version().is_initial());
    assert_eq!(h.publisher.event_types(), vec!["BalanceTransferCancelled.v1"]);
}

#[tokio::test]
async fn batch_limit_caps_one_sweep() {
    let h = Harness::new();
    for _ in 0..3 {
        h.transfers.insert(stuck_transfer(&h));
    }
    let config = SweeperConfig {
        batch_limit: 2,
        ..SweeperConfig::default()
    };
    let sweeper = TimeoutSweeper::new(h.service.clone(), config);

    h.clock.advance(minutes(20));
    assert_eq!(sweeper.sweep_once().await.unwrap().transfers, 2);
    assert_eq!(sweeper.sweep_once().await.unwrap().transfers, 1);
    assert_eq!(sweeper.sweep_once().await.unwrap().transfers, 0);
}

#[tokio::test]
async fn spawned_sweeper_runs_until_shutdown() {
    let h = Harness::funded(50_00).await;
    let reserved = h
        .service
        .reserve(USER, usd(10_00), OrderId::new("order-2"), "Checkout", None)
        .await
        .unwrap();
    let id = reserved.transaction.transaction_id().clone();
    h.clock.advance(minutes(45));

    let config = SweeperConfig {
        interval_seconds: 1,
        ..SweeperConfig::default()
    };
    let handle = TimeoutSweeper::new(h.service.clone(), config).spawn();

    let mut cancelled = false;
    for _ in 0..100 {
        let record = h.transactions.find_by_id(id.clone()).await.unwrap().unwrap();
        if record.status() == TransactionStatus::Cancelled {
            cancelled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(cancelled, "sweeper did not cancel the expired reservation");

    assert!(!handle.is_finished());
    handle.shutdown().await;
}

// ============================================================================
// Cache coherence
// ============================================================================

#[tokio::test]
async fn repeated_reads_are_served_from_memory() {
    let h = Harness::funded(10_00).await;
    let before = h.service.cache().metrics();

    h.service.get_balance(USER).await.unwrap();
    h.service.get_balance(USER).await.unwrap();

    let after = h.service.cache().metrics();
    assert!(after.hits >= before.hits + 1);
    assert!(after.repository_queries <= before.repository_queries + 1);
}

#[tokio::test]
async fn writes_through_the_service_are_visible_immediately() {
    let h = Harness::funded(10_00).await;
    h.service.get_balance(USER).await.unwrap();

    h.service.withdraw(USER, usd(4_00), "Spend", None).await.unwrap();

    assert_eq!(h.service.get_balance(USER).await.unwrap().current_balance(), usd(6_00));
}

#[tokio::test]
async fn out_of_band_writes_show_after_ttl() {
    let h = Harness::funded(10_00).await;
    let cached = h.service.get_balance(USER).await.unwrap();

    // Another process credits the balance behind the cache's back.
    let mut external = cached.clone();
    external
        .deposit(usd(5_00), "External", TransactionId::generate(), h.service.environment())
        .unwrap();
    h.balances.save(external, cached.version()).await.unwrap();

    assert_eq!(h.service.get_balance(USER).await.unwrap().current_balance(), usd(10_00));

    h.clock.advance(minutes(6));
    assert_eq!(h.service.get_balance(USER).await.unwrap().current_balance(), usd(15_00));
}
