//! Shared fixtures for the runtime integration tests.

#![allow(dead_code, clippy::unwrap_used)]

use balance_ledger_core::balance::BalanceEnvironment;
use balance_ledger_core::ids::UserId;
use balance_ledger_core::money::{Currency, Money};
use balance_ledger_core::policy::{BalancePolicy, PolicyConfig};
use balance_ledger_runtime::{
    BalanceCacheService, CacheConfig, LedgerRepositories, LedgerService, LedgerServiceConfig,
};
use balance_ledger_testing::{
    InMemoryBalanceRepository, InMemoryDualBalanceRepository, InMemoryTransactionRepository,
    InMemoryTransferRepository, ManualClock, RecordingPublisher,
};
use std::sync::Arc;

pub const USER: UserId = UserId::new(42);

pub fn usd(cents: i64) -> Money {
    Money::from_minor_units(cents, Currency::USD)
}

pub fn fast_retries() -> LedgerServiceConfig {
    LedgerServiceConfig {
        retry_initial_delay_ms: 1,
        retry_max_delay_ms: 2,
        ..LedgerServiceConfig::default()
    }
}

pub struct Harness {
    pub service: Arc<LedgerService>,
    pub clock: ManualClock,
    pub balances: InMemoryBalanceRepository,
    pub transactions: InMemoryTransactionRepository,
    pub dual_balances: InMemoryDualBalanceRepository,
    pub transfers: InMemoryTransferRepository,
    pub publisher: RecordingPublisher,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(PolicyConfig::default(), fast_retries())
    }

    pub fn with(policy: PolicyConfig, config: LedgerServiceConfig) -> Self {
        let clock = ManualClock::starting_at_epoch();
        let balances = InMemoryBalanceRepository::new();
        let transactions = InMemoryTransactionRepository::new();
        let dual_balances = InMemoryDualBalanceRepository::new();
        let transfers = InMemoryTransferRepository::new();
        let publisher = RecordingPublisher::new();

        let env = BalanceEnvironment::new(
            Arc::new(clock.clone()),
            Arc::new(BalancePolicy::new(policy)),
        );
        let cache = Arc::new(BalanceCacheService::new(
            Arc::new(balances.clone()),
            Arc::new(clock.clone()),
            CacheConfig::default(),
        ));
        let repositories = LedgerRepositories {
            balances: Arc::new(balances.clone()),
            transactions: Arc::new(transactions.clone()),
            dual_balances: Arc::new(dual_balances.clone()),
            transfers: Arc::new(transfers.clone()),
        };
        let service = Arc::new(LedgerService::new(
            repositories,
            cache,
            Arc::new(publisher.clone()),
            env,
            config,
        ));

        Self {
            service,
            clock,
            balances,
            transactions,
            dual_balances,
            transfers,
            publisher,
        }
    }

    /// Step past the minimum interval between operations.
    pub fn tick(&self) {
        self.clock.advance(chrono::Duration::seconds(2));
    }

    pub async fn funded(cents: i64) -> Self {
        let h = Self::new();
        h.service.open_balance(USER, Currency::USD).await.unwrap();
        h.tick();
        h.service.deposit(USER, usd(cents), "Top-up", None).await.unwrap();
        h.tick();
        h.publisher.clear();
        h
    }
}
