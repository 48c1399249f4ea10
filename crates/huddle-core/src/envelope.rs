//! Routed event envelopes.
//!
//! Every event handed to the router is wrapped in an envelope that records
//! its origin and who must not see it. Envelopes are shared between
//! receivers behind an `Arc`, so fan-out never clones the payload.

use crate::ids::ConnectionHandle;
use crate::room::RoomKey;
use chrono::Utc;
use huddle_protocol::ServerEvent;
use std::sync::atomic::{AtomicU64, Ordering};

/// A unique envelope identifier.
pub type EnvelopeId = u64;

static ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generate a unique envelope ID.
#[must_use]
pub fn generate_envelope_id() -> EnvelopeId {
    ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// An event on its way to one or more connections.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Unique envelope identifier.
    pub id: EnvelopeId,
    /// Room the event was broadcast to, `None` for direct and process-wide sends.
    pub room: Option<RoomKey>,
    /// Connection that must not receive the event.
    pub exclude: Option<ConnectionHandle>,
    /// The event itself.
    pub event: ServerEvent,
    /// Creation time in milliseconds since the epoch.
    pub timestamp: i64,
}

impl Envelope {
    /// Create an envelope with no room and no exclusion.
    #[must_use]
    pub fn new(event: ServerEvent) -> Self {
        Self {
            id: generate_envelope_id(),
            room: None,
            exclude: None,
            event,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// Scope the envelope to a room.
    #[must_use]
    pub fn in_room(mut self, room: RoomKey) -> Self {
        self.room = Some(room);
        self
    }

    /// Hide the envelope from one connection.
    #[must_use]
    pub fn excluding(mut self, handle: Option<ConnectionHandle>) -> Self {
        self.exclude = handle;
        self
    }

    /// Whether `handle` should receive this envelope.
    #[must_use]
    pub fn is_visible_to(&self, handle: ConnectionHandle) -> bool {
        self.exclude != Some(handle)
    }

    /// Wire name of the wrapped event.
    #[must_use]
    pub fn event_name(&self) -> &'static str {
        self.event.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_protocol::TypingPayload;

    fn typing() -> ServerEvent {
        ServerEvent::TypingGroup(TypingPayload {
            username: "alice".into(),
        })
    }

    #[test]
    fn test_envelope_exclusion() {
        let sender = ConnectionHandle::next();
        let other = ConnectionHandle::next();
        let envelope = Envelope::new(typing())
            .in_room(RoomKey::global())
            .excluding(Some(sender));

        assert!(!envelope.is_visible_to(sender));
        assert!(envelope.is_visible_to(other));
        assert_eq!(envelope.room, Some(RoomKey::global()));
        assert_eq!(envelope.event_name(), "typing-group");
    }

    #[test]
    fn test_unique_envelope_ids() {
        let a = Envelope::new(typing());
        let b = Envelope::new(typing());
        assert_ne!(a.id, b.id);
    }
}
