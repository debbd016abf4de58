//! # Event Relay
//!
//! Single ordered path from a session to its WebSocket connection. The session
//! pushes frames into a bounded queue; the connection actor is the only reader and
//! writes each frame completely before taking the next one, so outbound messages
//! never interleave and keep the order in which they were queued.

use crate::protocol::OutboundEvent;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

/// How a finished session wants its connection closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    /// Recognition ended normally (stop, end of stream).
    Completed,
    /// The provider reported a fault.
    Faulted,
}

/// One unit of work for the connection writer.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayFrame {
    Event(OutboundEvent),
    Close(CloseKind),
}

/// Sending half, owned by the session.
#[derive(Debug, Clone)]
pub struct EventRelay {
    session_id: Uuid,
    tx: mpsc::Sender<RelayFrame>,
}

impl EventRelay {
    pub fn channel(session_id: Uuid, capacity: usize) -> (Self, mpsc::Receiver<RelayFrame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { session_id, tx }, rx)
    }

    /// Queue an event. Waits while the queue is full, so nothing is dropped; once
    /// the connection is gone this is a no-op and returns `false`.
    pub async fn emit(&self, event: OutboundEvent) -> bool {
        let kind = event.kind();
        match self.tx.send(RelayFrame::Event(event)).await {
            Ok(()) => {
                trace!(session_id = %self.session_id, event = kind, "Event queued");
                true
            }
            Err(_) => {
                debug!(session_id = %self.session_id, event = kind, "Connection gone, event not delivered");
                false
            }
        }
    }

    pub async fn close(&self, kind: CloseKind) {
        if self.tx.send(RelayFrame::Close(kind)).await.is_err() {
            debug!(session_id = %self.session_id, "Connection already closed");
        }
    }
}
