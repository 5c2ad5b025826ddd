//! # Balance Ledger Core
//!
//! Domain types for a per-user balance ledger with a two-pool variant.
//!
//! The crate is a functional core: aggregates validate and mutate in memory
//! and return the events they produced. Storage, locking, caching and event
//! delivery live behind traits and are driven by `balance-ledger-runtime`.
//!
//! ## Core Concepts
//!
//! - **Money**: fixed-scale decimal amount with a currency
//! - **Policy**: amount bounds, daily caps, velocity and admin checks
//! - **Aggregates**: [`balance::BalanceAggregate`],
//!   [`transaction::TransactionAggregate`],
//!   [`dual_balance::DualBalanceAggregate`] and
//!   [`transfer::BalanceTransferAggregate`]
//! - **Events**: [`event::LedgerEvent`], returned from every mutation
//! - **Repositories**: versioned persistence contracts
//!
//! ## Architecture Principles
//!
//! - Validate first, mutate last: a failed operation changes nothing
//! - Optimistic concurrency via explicit expected versions
//! - Dependencies (clock, policy) injected through an environment

pub mod balance;
pub mod dual_balance;
pub mod environment;
pub mod error;
pub mod event;
pub mod ids;
pub mod money;
pub mod policy;
pub mod publisher;
pub mod repository;
pub mod transaction;
pub mod transfer;
pub mod version;

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use error::{LedgerError, Result, ValidationCode, ValidationError};
pub use money::{Currency, Money};
pub use rust_decimal::Decimal;
pub use smallvec::{SmallVec, smallvec};
pub use version::{Version, Versioned};
