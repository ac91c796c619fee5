//! Channel bridge between the USB service thread and an async front end
//!
//! Port-mapper hooks run on the runtime's polling thread and must never
//! block on the consumer. They push into an [`EventSink`]; the front end
//! drains the matching [`EventBridge`] from Tokio.

use async_channel::{Receiver, Sender, TrySendError, bounded};
use tracing::warn;

/// Producer half, held by code running on the USB thread
#[derive(Debug)]
pub struct EventSink<T> {
    tx: Sender<T>,
}

impl<T> Clone for EventSink<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> EventSink<T> {
    /// Queue an event without blocking
    ///
    /// A full channel drops the event with a warning; the USB thread must
    /// keep servicing completions regardless of consumer speed.
    pub fn publish(&self, event: T) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Event channel full, dropping event");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Queue an event, blocking until there is room
    pub fn publish_blocking(&self, event: T) -> crate::Result<()> {
        self.tx
            .send_blocking(event)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Consumer half, held by the async front end
#[derive(Debug)]
pub struct EventBridge<T> {
    rx: Receiver<T>,
}

impl<T> EventBridge<T> {
    /// Receive the next event
    pub async fn recv(&self) -> crate::Result<T> {
        self.rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Try to receive an event without waiting
    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Number of events waiting
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Create a bounded event bridge
///
/// Returns (EventSink for the USB thread, EventBridge for Tokio)
pub fn create_event_bridge<T>(capacity: usize) -> (EventSink<T>, EventBridge<T>) {
    let (tx, rx) = bounded(capacity);
    (EventSink { tx }, EventBridge { rx })
}
