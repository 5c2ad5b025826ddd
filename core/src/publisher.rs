//! Outbound dispatch of committed ledger events.
//!
//! Events are handed to an [`EventPublisher`] only after the repository save
//! that produced them succeeded. Delivery is fire-and-forget from the
//! ledger's point of view: a publish failure is logged, never turned into a
//! failed balance operation.
//!
//! # Topic Naming Convention
//!
//! - `balance-events`: single-pool balance and transaction events
//! - `dual-balance-events`: pool changes and transfers

use crate::event::{Event, LedgerEvent, SerializedEvent};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Topic for single-pool balance and transaction events.
pub const BALANCE_EVENTS_TOPIC: &str = "balance-events";

/// Topic for dual-balance and transfer events.
pub const DUAL_BALANCE_EVENTS_TOPIC: &str = "dual-balance-events";

/// Errors that can occur while publishing.
#[derive(Error, Debug, Clone)]
pub enum PublishError {
    /// Failed to publish an event to a topic
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to serialize the event
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),
}

/// Sink for serialized ledger events.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; one publisher is shared by every
/// service task.
pub trait EventPublisher: Send + Sync {
    /// Publish one event to a topic.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::PublishFailed`] if the transport rejects it.
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        event: &'a SerializedEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), PublishError>> + Send + 'a>>;
}

/// Topic an event belongs on.
#[must_use]
pub const fn topic_for(event: &LedgerEvent) -> &'static str {
    match event {
        LedgerEvent::DualBalanceChanged { .. }
        | LedgerEvent::BalanceTransferInitiated { .. }
        | LedgerEvent::BalanceTransferCompleted { .. }
        | LedgerEvent::BalanceTransferCancelled { .. }
        | LedgerEvent::BalanceTransferFailed { .. } => DUAL_BALANCE_EVENTS_TOPIC,
        _ => BALANCE_EVENTS_TOPIC,
    }
}

/// Serializes `event` and publishes it on its topic.
///
/// # Errors
///
/// [`PublishError::SerializationFailed`] or whatever the publisher returns.
pub async fn publish_event(
    publisher: &dyn EventPublisher,
    event: &LedgerEvent,
    metadata: Option<serde_json::Value>,
) -> Result<(), PublishError> {
    let serialized = SerializedEvent::from_event(event, metadata)
        .map_err(|e| PublishError::SerializationFailed(e.to_string()))?;
    publisher.publish(topic_for(event), &serialized).await
}

/// Publisher that only writes a structured log line per event.
///
/// Useful when no broker is wired in; the audit trail still lands in the logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingPublisher;

impl EventPublisher for TracingPublisher {
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        event: &'a SerializedEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), PublishError>> + Send + 'a>> {
        Box::pin(async move {
            tracing::info!(
                topic = topic,
                event_type = %event.event_type,
                size = event.data.len(),
                "Ledger event published"
            );
            Ok(())
        })
    }
}
