//! Domain events emitted by the ledger aggregates.
//!
//! Aggregate operations do not publish anything themselves. Each operation
//! returns the [`LedgerEvent`]s it produced (an explicit outbox); the caller
//! dispatches them through an [`EventPublisher`](crate::publisher::EventPublisher)
//! once the repository save has committed.
//!
//! Events serialize with `bincode` for storage and transport, and carry a
//! versioned type name such as `"BalanceChanged.v1"`.
//!
//! # Example
//!
//! ```
//! use balance_ledger_core::event::{Event, LedgerEvent};
//! use balance_ledger_core::ids::TransactionId;
//! use balance_ledger_core::transaction::TransactionStatus;
//! use chrono::Utc;
//!
//! let event = LedgerEvent::TransactionCompleted {
//!     transaction_id: TransactionId::new("txn_1"),
//!     status: TransactionStatus::Completed,
//!     timestamp: Utc::now(),
//! };
//! assert_eq!(event.event_type(), "TransactionCompleted.v1");
//! let bytes = event.to_bytes().unwrap();
//! assert_eq!(LedgerEvent::from_bytes(&bytes).unwrap(), event);
//! ```

use crate::ids::{BalanceId, DualBalanceId, OrderId, TransactionId, TransferId, UserId};
use crate::money::Money;
use crate::transaction::{TransactionStatus, TransactionType};
use crate::transfer::BalanceType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use smallvec::SmallVec;
use std::fmt;
use thiserror::Error;

/// Events produced by a single aggregate operation.
///
/// Most operations emit one or two events, which stay inline.
pub type Events = SmallVec<[LedgerEvent; 2]>;

/// Error types for event operations.
#[derive(Error, Debug)]
pub enum EventError {
    /// Failed to serialize event to bytes.
    #[error("Failed to serialize event: {0}")]
    SerializationError(String),

    /// Failed to deserialize event from bytes.
    #[error("Failed to deserialize event: {0}")]
    DeserializationError(String),
}

/// An event that can be stored and replayed.
///
/// `event_type()` returns a stable identifier with a version suffix so that
/// consumers can route and evolve schemas (`"BalanceChanged.v1"`).
pub trait Event: Send + Sync + 'static {
    /// Returns the event type identifier for this event.
    fn event_type(&self) -> &'static str;

    /// Serialize this event to bincode bytes.
    ///
    /// # Errors
    ///
    /// Returns `EventError::SerializationError` if the event cannot be serialized.
    fn to_bytes(&self) -> Result<Vec<u8>, EventError>
    where
        Self: Serialize,
    {
        bincode::serialize(self).map_err(|e| EventError::SerializationError(e.to_string()))
    }

    /// Deserialize an event from bincode bytes.
    ///
    /// # Errors
    ///
    /// Returns `EventError::DeserializationError` if the bytes are corrupted or
    /// belong to a different schema.
    fn from_bytes(bytes: &[u8]) -> Result<Self, EventError>
    where
        Self: DeserializeOwned + Sized,
    {
        bincode::deserialize(bytes).map_err(|e| EventError::DeserializationError(e.to_string()))
    }
}

/// Bank and main pool balances at one instant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    /// Bank (funding) pool
    pub bank: Money,
    /// Main (spendable) pool
    pub main: Money,
}

/// Kind of single-pool mutation on a dual balance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolOperation {
    /// Funds arrived in the bank pool
    BankDeposit,
    /// A purchase was paid from the main pool
    MainWithdrawal,
    /// A purchase was refunded into the main pool
    MainRefund,
}

/// Every fact the ledger records.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LedgerEvent {
    /// The spendable balance of a single-pool account changed.
    BalanceChanged {
        /// Balance aggregate
        balance_id: BalanceId,
        /// Owner
        user_id: UserId,
        /// Kind of mutation
        transaction_type: TransactionType,
        /// Amount (signed for adjustments)
        amount: Money,
        /// Balance before the mutation
        balance_before: Money,
        /// Balance after the mutation
        balance_after: Money,
        /// Transaction recording the mutation
        transaction_id: TransactionId,
        /// Free-text description
        description: String,
        /// Related order, if any
        order_id: Option<OrderId>,
        /// When the mutation happened
        occurred_at: DateTime<Utc>,
    },

    /// Funds were placed on hold for an order.
    FundsReserved {
        /// Balance aggregate
        balance_id: BalanceId,
        /// Owner
        user_id: UserId,
        /// Amount held
        amount: Money,
        /// Total held after this reservation
        reserved_after: Money,
        /// Order the hold is for
        order_id: OrderId,
        /// Pending purchase transaction
        transaction_id: TransactionId,
        /// Free-text description
        description: String,
        /// When the hold was placed
        occurred_at: DateTime<Utc>,
    },

    /// A hold was released without charging.
    ReservationReleased {
        /// Balance aggregate
        balance_id: BalanceId,
        /// Owner
        user_id: UserId,
        /// Amount released
        amount: Money,
        /// Total held after the release
        reserved_after: Money,
        /// Order the hold was for
        order_id: OrderId,
        /// Transaction that tracked the hold
        transaction_id: TransactionId,
        /// Free-text description
        description: String,
        /// When the hold was released
        occurred_at: DateTime<Utc>,
    },

    /// A balance was (re)activated.
    BalanceActivated {
        /// Balance aggregate (single or dual)
        balance_id: String,
        /// Owner
        user_id: UserId,
        /// Why
        reason: String,
        /// Who
        admin_user: String,
        /// When
        occurred_at: DateTime<Utc>,
    },

    /// A balance was deactivated.
    BalanceDeactivated {
        /// Balance aggregate (single or dual)
        balance_id: String,
        /// Owner
        user_id: UserId,
        /// Why
        reason: String,
        /// Who
        admin_user: String,
        /// When
        occurred_at: DateTime<Utc>,
    },

    /// A transaction record was created in `PENDING`.
    TransactionCreated {
        /// Transaction
        transaction_id: TransactionId,
        /// Owner
        user_id: UserId,
        /// Kind of mutation
        transaction_type: TransactionType,
        /// Amount
        amount: Money,
        /// Always `Pending`
        status: TransactionStatus,
        /// When
        timestamp: DateTime<Utc>,
    },

    /// A transaction reached `COMPLETED`.
    TransactionCompleted {
        /// Transaction
        transaction_id: TransactionId,
        /// Always `Completed`
        status: TransactionStatus,
        /// When
        timestamp: DateTime<Utc>,
    },

    /// A transaction reached `CANCELLED`.
    TransactionCancelled {
        /// Transaction
        transaction_id: TransactionId,
        /// Always `Cancelled`
        status: TransactionStatus,
        /// Why
        reason: String,
        /// When
        timestamp: DateTime<Utc>,
    },

    /// A transaction reached `FAILED`.
    TransactionFailed {
        /// Transaction
        transaction_id: TransactionId,
        /// Always `Failed`
        status: TransactionStatus,
        /// Why
        reason: String,
        /// When
        timestamp: DateTime<Utc>,
    },

    /// One pool of a dual balance changed outside a transfer.
    DualBalanceChanged {
        /// Dual balance aggregate
        dual_balance_id: DualBalanceId,
        /// Owner
        user_id: UserId,
        /// Pool that changed
        pool: BalanceType,
        /// What happened
        operation: PoolOperation,
        /// Amount
        amount: Money,
        /// Pool balance before
        before: Money,
        /// Pool balance after
        after: Money,
        /// Purchase reference, if any
        reference: Option<String>,
        /// Free-text description
        description: String,
        /// When
        occurred_at: DateTime<Utc>,
    },

    /// A pool-to-pool transfer started.
    BalanceTransferInitiated {
        /// Dual balance aggregate
        dual_balance_id: DualBalanceId,
        /// Owner
        user_id: UserId,
        /// Source pool
        from_type: BalanceType,
        /// Destination pool
        to_type: BalanceType,
        /// Amount moved
        amount: Money,
        /// Pools before the transfer
        before: PoolSnapshot,
        /// Pools after the transfer
        after: PoolSnapshot,
        /// Transfer record
        transfer_id: TransferId,
        /// When
        occurred_at: DateTime<Utc>,
    },

    /// A pool-to-pool transfer was applied.
    BalanceTransferCompleted {
        /// Dual balance aggregate
        dual_balance_id: DualBalanceId,
        /// Owner
        user_id: UserId,
        /// Source pool
        from_type: BalanceType,
        /// Destination pool
        to_type: BalanceType,
        /// Amount moved
        amount: Money,
        /// Pools before the transfer
        before: PoolSnapshot,
        /// Pools after the transfer
        after: PoolSnapshot,
        /// Transfer record
        transfer_id: TransferId,
        /// When
        occurred_at: DateTime<Utc>,
    },

    /// A transfer record was cancelled (e.g. by the timeout sweep).
    BalanceTransferCancelled {
        /// Transfer record
        transfer_id: TransferId,
        /// Why
        reason: String,
        /// When
        timestamp: DateTime<Utc>,
    },

    /// A transfer record failed.
    BalanceTransferFailed {
        /// Transfer record
        transfer_id: TransferId,
        /// Why
        reason: String,
        /// When
        timestamp: DateTime<Utc>,
    },
}

impl LedgerEvent {
    /// The user the event concerns, when the event carries one.
    #[must_use]
    pub const fn user_id(&self) -> Option<UserId> {
        match self {
            Self::BalanceChanged { user_id, .. }
            | Self::FundsReserved { user_id, .. }
            | Self::ReservationReleased { user_id, .. }
            | Self::BalanceActivated { user_id, .. }
            | Self::BalanceDeactivated { user_id, .. }
            | Self::TransactionCreated { user_id, .. }
            | Self::DualBalanceChanged { user_id, .. }
            | Self::BalanceTransferInitiated { user_id, .. }
            | Self::BalanceTransferCompleted { user_id, .. } => Some(*user_id),
            Self::TransactionCompleted { .. }
            | Self::TransactionCancelled { .. }
            | Self::TransactionFailed { .. }
            | Self::BalanceTransferCancelled { .. }
            | Self::BalanceTransferFailed { .. } => None,
        }
    }

    /// When the event happened.
    #[must_use]
    pub const fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            Self::BalanceChanged { occurred_at, .. }
            | Self::FundsReserved { occurred_at, .. }
            | Self::ReservationReleased { occurred_at, .. }
            | Self::BalanceActivated { occurred_at, .. }
            | Self::BalanceDeactivated { occurred_at, .. }
            | Self::DualBalanceChanged { occurred_at, .. }
            | Self::BalanceTransferInitiated { occurred_at, .. }
            | Self::BalanceTransferCompleted { occurred_at, .. } => *occurred_at,
            Self::TransactionCreated { timestamp, .. }
            | Self::TransactionCompleted { timestamp, .. }
            | Self::TransactionCancelled { timestamp, .. }
            | Self::TransactionFailed { timestamp, .. }
            | Self::BalanceTransferCancelled { timestamp, .. }
            | Self::BalanceTransferFailed { timestamp, .. } => *timestamp,
        }
    }
}

impl Event for LedgerEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::BalanceChanged { .. } => "BalanceChanged.v1",
            Self::FundsReserved { .. } => "FundsReserved.v1",
            Self::ReservationReleased { .. } => "ReservationReleased.v1",
            Self::BalanceActivated { .. } => "BalanceActivated.v1",
            Self::BalanceDeactivated { .. } => "BalanceDeactivated.v1",
            Self::TransactionCreated { .. } => "TransactionCreated.v1",
            Self::TransactionCompleted { .. } => "TransactionCompleted.v1",
            Self::TransactionCancelled { .. } => "TransactionCancelled.v1",
            Self::TransactionFailed { .. } => "TransactionFailed.v1",
            Self::DualBalanceChanged { .. } => "DualBalanceChanged.v1",
            Self::BalanceTransferInitiated { .. } => "BalanceTransferInitiated.v1",
            Self::BalanceTransferCompleted { .. } => "BalanceTransferCompleted.v1",
            Self::BalanceTransferCancelled { .. } => "BalanceTransferCancelled.v1",
            Self::BalanceTransferFailed { .. } => "BalanceTransferFailed.v1",
        }
    }
}

/// A serialized event ready for an outbox table or a message bus.
#[derive(Clone, Debug)]
pub struct SerializedEvent {
    /// The event type identifier (e.g. `"BalanceChanged.v1"`).
    pub event_type: String,

    /// The bincode-serialized event data.
    pub data: Vec<u8>,

    /// Optional metadata (correlation id, actor, ...).
    pub metadata: Option<serde_json::Value>,
}

impl SerializedEvent {
    /// Create a serialized event from an `Event`.
    ///
    /// # Errors
    ///
    /// Returns `EventError::SerializationError` if the event cannot be serialized.
    pub fn from_event<E: Event + Serialize>(
        event: &E,
        metadata: Option<serde_json::Value>,
    ) -> Result<Self, EventError> {
        Ok(Self {
            event_type: event.event_type().to_string(),
            data: event.to_bytes()?,
            metadata,
        })
    }
}

impl fmt::Display for SerializedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SerializedEvent {{ type: {}, size: {} bytes }}",
            self.event_type,
            self.data.len()
        )
    }
}
