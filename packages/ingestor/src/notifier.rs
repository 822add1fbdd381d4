//! Draft Event Notifier
//!
//! Pushes "a new transaction draft was created" events to at most one live
//! subscriber. Delivery is best-effort: with nobody attached the event is
//! dropped, not buffered for a later subscriber.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tracing::{debug, trace};

/// Event delivered to the subscriber
///
/// Serializes to the JSON shape the UI bridge forwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DraftEvent {
    /// Server-assigned identifier of the created draft
    pub unique_identifier: String,
}

impl DraftEvent {
    pub fn new(unique_identifier: impl Into<String>) -> Self {
        Self {
            unique_identifier: unique_identifier.into(),
        }
    }

    /// Serialize the event to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Receiving end handed to the attached subscriber
///
/// The stream ends once this subscription is replaced or detached.
#[derive(Debug)]
pub struct Subscription {
    receiver: UnboundedReceiver<DraftEvent>,
}

impl Subscription {
    /// Wait for the next event; `None` once replaced or detached
    pub async fn recv(&mut self) -> Option<DraftEvent> {
        self.receiver.recv().await
    }

    /// Take an already-delivered event without waiting
    pub fn try_recv(&mut self) -> Result<DraftEvent, TryRecvError> {
        self.receiver.try_recv()
    }
}

/// Single-slot publisher of draft events
#[derive(Debug, Default)]
pub struct EventNotifier {
    subscriber: Mutex<Option<UnboundedSender<DraftEvent>>>,
}

impl EventNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new subscriber, replacing any existing one
    pub fn attach(&self) -> Subscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        let replaced = self.slot().replace(sender).is_some();
        debug!(replaced, "subscriber attached");
        Subscription { receiver }
    }

    /// Detach the current subscriber, if any
    pub fn detach(&self) {
        if self.slot().take().is_some() {
            debug!("subscriber detached");
        }
    }

    /// Whether a live subscriber is attached
    pub fn is_attached(&self) -> bool {
        self.slot().as_ref().is_some_and(|sender| !sender.is_closed())
    }

    /// Notify the subscriber that a draft was created
    ///
    /// Never blocks. A subscriber whose receiver has been dropped is cleared.
    pub fn emit(&self, unique_identifier: &str) {
        let mut slot = self.slot();
        let Some(sender) = slot.as_ref() else {
            trace!(unique_identifier, "no subscriber, event dropped");
            return;
        };

        if sender.send(DraftEvent::new(unique_identifier)).is_err() {
            debug!(unique_identifier, "subscriber gone, event dropped");
            *slot = None;
        }
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<UnboundedSender<DraftEvent>>> {
        // the slot holds no invariant a panicking holder could break
        self.subscriber
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
