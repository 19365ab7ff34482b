//! Observer events emitted by the session layer
//!
//! These events flow from the per-session workers to the UI / local store
//! integration through the coordinator's broadcast stream. They carry enough
//! context to render "connecting / reconnecting" indicators and running
//! totals without reaching back into the coordinator.

use crate::counter::CounterEvent;
use crate::peer::{PeerState, Role};
use crate::{PeerId, SessionId};
use std::time::Duration;

/// Events emitted by the session layer to the application / UI
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A peer session changed connection state
    PeerStateChanged {
        session_id: SessionId,
        peer_id: PeerId,
        state: PeerState,
        role: Option<Role>,
    },

    /// A failed peer will be retried after `delay`
    Reconnecting {
        session_id: SessionId,
        peer_id: PeerId,
        attempt: u32,
        delay: Duration,
    },

    /// Reconnection attempts for a peer are exhausted
    PeerAbandoned {
        session_id: SessionId,
        peer_id: PeerId,
    },

    /// A counter event was recorded in the local store
    CounterApplied {
        session_id: SessionId,
        event: CounterEvent,
        total: i64,
    },

    /// A counter event could not be delivered to a peer
    Undeliverable {
        session_id: SessionId,
        peer_id: PeerId,
        event: CounterEvent,
        reason: String,
    },

    /// The signaling channel reported an error for this session
    SignalingError {
        session_id: SessionId,
        message: String,
    },

    /// The session was left and all its peers are closed
    SessionClosed { session_id: SessionId },
}

impl SessionEvent {
    /// Session this event belongs to
    pub fn session_id(&self) -> &str {
        match self {
            Self::PeerStateChanged { session_id, .. }
            | Self::Reconnecting { session_id, .. }
            | Self::PeerAbandoned { session_id, .. }
            | Self::CounterApplied { session_id, .. }
            | Self::Undeliverable { session_id, .. }
            | Self::SignalingError { session_id, .. }
            | Self::SessionClosed { session_id } => session_id,
        }
    }

    /// Get the event name for logging/debugging
    pub fn name(&self) -> &'static str {
        match self {
            Self::PeerStateChanged { .. } => "peer_state_changed",
            Self::Reconnecting { .. } => "reconnecting",
            Self::PeerAbandoned { .. } => "peer_abandoned",
            Self::CounterApplied { .. } => "counter_applied",
            Self::Undeliverable { .. } => "undeliverable",
            Self::SignalingError { .. } => "signaling_error",
            Self::SessionClosed { .. } => "session_closed",
        }
    }
}

/// Get current wall-clock timestamp in milliseconds
pub fn current_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Get current wall-clock timestamp in microseconds
pub fn current_timestamp_us() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
