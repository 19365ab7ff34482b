//! Session data model

use crate::peer::{PeerState, Role};
use std::collections::BTreeSet;
use std::time::SystemTime;
use tracing::debug;

/// Session identifier
pub type SessionId = String;

/// Peer (device) identifier
pub type PeerId = String;

/// A counting session as seen by the local peer
///
/// Owned by the session worker; membership reflects what presence and
/// signaling have told us about remote peers.
#[derive(Debug, Clone)]
pub struct Session {
    session_id: SessionId,
    local_peer_id: PeerId,
    members: BTreeSet<PeerId>,
    created_at: SystemTime,
}

impl Session {
    pub fn new(session_id: impl Into<SessionId>, local_peer_id: impl Into<PeerId>) -> Self {
        Self {
            session_id: session_id.into(),
            local_peer_id: local_peer_id.into(),
            members: BTreeSet::new(),
            created_at: SystemTime::now(),
        }
    }

    /// Get the session ID
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn local_peer_id(&self) -> &str {
        &self.local_peer_id
    }

    /// Add a remote member. Returns `false` if already present or local.
    pub fn add_member(&mut self, peer_id: &str) -> bool {
        if peer_id == self.local_peer_id {
            return false;
        }
        let added = self.members.insert(peer_id.to_string());
        if added {
            debug!("Adding peer {} to session {}", peer_id, self.session_id);
        }
        added
    }

    /// Remove a remote member
    pub fn remove_member(&mut self, peer_id: &str) -> bool {
        let removed = self.members.remove(peer_id);
        if removed {
            debug!("Removing peer {} from session {}", peer_id, self.session_id);
        }
        removed
    }

    pub fn is_member(&self, peer_id: &str) -> bool {
        self.members.contains(peer_id)
    }

    /// Remote members in id order
    pub fn members(&self) -> Vec<PeerId> {
        self.members.iter().cloned().collect()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }
}

/// Snapshot of one remote peer of a joined session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStatus {
    pub peer_id: PeerId,
    pub state: PeerState,
    pub role: Option<Role>,
    /// Incarnation counter (bumps on every reconnect)
    pub generation: u64,
    /// Whether presence currently lists the peer
    pub member: bool,
    pub retry_pending: bool,
    /// Reconnection attempts in the current failure streak
    pub attempts: u32,
    /// Counter events queued for this peer
    pub pending_events: usize,
}
