//! Event publisher that records instead of sending.

use balance_ledger_core::event::{Event, LedgerEvent, SerializedEvent};
use balance_ledger_core::publisher::{EventPublisher, PublishError};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Captures every published event together with its topic.
///
/// Clones share the captured list.
///
/// # Example
///
/// ```
/// use balance_ledger_testing::RecordingPublisher;
///
/// let publisher = RecordingPublisher::new();
/// assert!(publisher.published().is_empty());
/// ```
#[derive(Clone, Debug, Default)]
pub struct RecordingPublisher {
    published: Arc<Mutex<Vec<(String, SerializedEvent)>>>,
    failing: Arc<AtomicBool>,
}

impl RecordingPublisher {
    /// Create an empty recorder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent publish fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// `(topic, event)` pairs in publish order.
    #[must_use]
    pub fn published(&self) -> Vec<(String, SerializedEvent)> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Versioned type names in publish order.
    #[must_use]
    pub fn event_types(&self) -> Vec<String> {
        self.published()
            .into_iter()
            .map(|(_, event)| event.event_type)
            .collect()
    }

    /// Published events decoded back into [`LedgerEvent`]s.
    ///
    /// Entries that fail to decode are skipped.
    #[must_use]
    pub fn events(&self) -> Vec<LedgerEvent> {
        self.published()
            .iter()
            .filter_map(|(_, event)| LedgerEvent::from_bytes(&event.data).ok())
            .collect()
    }

    /// Forget everything recorded so far.
    pub fn clear(&self) {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl EventPublisher for RecordingPublisher {
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        event: &'a SerializedEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), PublishError>> + Send + 'a>> {
        Box::pin(async move {
            if self.failing.load(Ordering::SeqCst) {
                return Err(PublishError::PublishFailed {
                    topic: topic.to_string(),
                    reason: "publisher set to fail".to_string(),
                });
            }
            self.published
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((topic.to_string(), event.clone()));
            Ok(())
        })
    }
}
