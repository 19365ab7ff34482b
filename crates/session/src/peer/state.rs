use crate::Error;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Connection state of one peer session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    /// Known peer, no negotiation started
    Idle,
    /// Offer/answer exchange or ICE in progress
    Negotiating,
    /// Data channel open
    Connected,
    /// Teardown requested, waiting for the transport to close
    Closing,
    /// Closed on purpose (terminal)
    Closed,
    /// Failed; eligible for reconnection (terminal for this incarnation)
    Failed,
}

impl PeerState {
    /// Terminal states end the incarnation
    pub fn is_terminal(&self) -> bool {
        matches!(self, PeerState::Closed | PeerState::Failed)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PeerState::Idle => "idle",
            PeerState::Negotiating => "negotiating",
            PeerState::Connected => "connected",
            PeerState::Closing => "closing",
            PeerState::Closed => "closed",
            PeerState::Failed => "failed",
        }
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Negotiation role of the local peer for one incarnation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Creates the offer
    Initiator,
    /// Answers the remote offer
    Responder,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => f.write_str("initiator"),
            Role::Responder => f.write_str("responder"),
        }
    }
}

/// Whether the local peer initiates towards `remote`.
///
/// The lexicographically smaller peer id initiates; the same rule resolves
/// glare when both sides offered.
pub fn local_initiates(local: &str, remote: &str) -> bool {
    local < remote
}

/// Why an incarnation ended in FAILED
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// No answer or transport progress within the negotiation timeout
    NegotiationTimeout,
    /// Connected peer went silent
    LivenessTimeout,
    /// The transport reported a failure
    Transport(String),
    /// Signaling publish failed after retries
    Signaling(String),
    /// Remote peer started a fresh negotiation
    RemoteRestart,
}

impl FailureReason {
    pub fn to_error(&self, peer_id: &str) -> Error {
        match self {
            FailureReason::NegotiationTimeout => {
                Error::NegotiationTimeout(format!("peer {}", peer_id))
            }
            FailureReason::LivenessTimeout => {
                Error::TransportError(format!("peer {} stopped responding", peer_id))
            }
            FailureReason::Transport(e) => {
                Error::TransportError(format!("peer {}: {}", peer_id, e))
            }
            FailureReason::Signaling(e) => {
                Error::TransportError(format!("signaling to {} failed: {}", peer_id, e))
            }
            FailureReason::RemoteRestart => {
                Error::TransportError(format!("peer {} restarted negotiation", peer_id))
            }
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::NegotiationTimeout => f.write_str("negotiation timeout"),
            FailureReason::LivenessTimeout => f.write_str("liveness timeout"),
            FailureReason::Transport(e) => write!(f, "transport: {}", e),
            FailureReason::Signaling(e) => write!(f, "signaling: {}", e),
            FailureReason::RemoteRestart => f.write_str("remote restart"),
        }
    }
}

/// Why an incarnation ended in CLOSED
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The local peer left the session
    LocalLeave,
    /// The remote peer sent BYE
    RemoteBye,
    /// Presence reported the remote peer gone
    PeerLeft,
}

impl CloseReason {
    /// Whether the remote peer is gone for good
    pub fn is_permanent_leave(&self) -> bool {
        matches!(self, CloseReason::RemoteBye | CloseReason::PeerLeft)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(PeerState::Closed.is_terminal());
        assert!(PeerState::Failed.is_terminal());
        assert!(PeerState::Closing.is_active());
        assert!(PeerState::Idle.is_active());
        assert_eq!(PeerState::Negotiating.to_string(), "negotiating");
    }

    #[test]
    fn test_tie_break_is_symmetric() {
        assert!(local_initiates("a", "b"));
        assert!(!local_initiates("b", "a"));
        assert!(local_initiates("device-10", "device-9"));
    }

    #[test]
    fn test_failure_errors_are_retryable() {
        assert!(FailureReason::NegotiationTimeout.to_error("b").is_retryable());
        assert!(FailureReason::LivenessTimeout.to_error("b").is_retryable());
        assert!(FailureReason::Transport("ice".into()).to_error("b").is_retryable());
    }
}
