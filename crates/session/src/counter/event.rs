use crate::{PeerId, SessionId};
use serde::{Deserialize, Serialize};

/// A single counter increment (or decrement) produced by one peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterEvent {
    /// Session the event belongs to
    pub session_id: SessionId,

    /// Peer that produced the event
    pub origin_peer_id: PeerId,

    /// Signed change to the session total
    pub delta: i64,

    /// Wall-clock time on the origin device (milliseconds since epoch)
    pub local_timestamp_ms: u64,

    /// Causally unique identifier used for deduplication
    pub event_id: String,
}

impl CounterEvent {
    /// Create a new event with a fresh random id stamped with the current time
    pub fn new(session_id: impl Into<SessionId>, origin_peer_id: impl Into<PeerId>, delta: i64) -> Self {
        Self {
            session_id: session_id.into(),
            origin_peer_id: origin_peer_id.into(),
            delta,
            local_timestamp_ms: crate::events::current_timestamp_ms(),
            event_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Override the event id (replays, imports from the local store)
    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = event_id.into();
        self
    }
}
