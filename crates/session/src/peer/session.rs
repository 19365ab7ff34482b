//! Per-peer negotiation state machine
//!
//! [`PeerSession`] is synchronous and owns no I/O. Every input (signaling
//! message, transport event, driver report, clock tick, close request) is
//! applied in order by the owning session worker and produces a list of
//! [`PeerAction`]s for the worker to execute. One instance exists per
//! incarnation of a peer connection; a failed or closed instance is never
//! reused.

use super::driver::DriverReport;
use super::state::{local_initiates, CloseReason, FailureReason, PeerState, Role};
use super::transport::{PeerFrame, TransportCommand, TransportEvent};
use crate::config::SessionConfig;
use crate::counter::CounterEvent;
use crate::signaling::{IceCandidate, Signal, SignalingMessage};
use crate::{Error, PeerId, Result};
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Remote candidates buffered before a remote description exists
const MAX_PENDING_CANDIDATES: usize = 128;

/// Timers of one peer session
#[derive(Debug, Clone, Copy)]
pub struct PeerTiming {
    pub negotiation_timeout: Duration,
    pub liveness_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl From<&SessionConfig> for PeerTiming {
    fn from(config: &SessionConfig) -> Self {
        Self {
            negotiation_timeout: config.negotiation_timeout(),
            liveness_timeout: config.liveness_timeout(),
            heartbeat_interval: config.heartbeat_interval(),
        }
    }
}

/// Effect requested by the state machine
#[derive(Debug, Clone, PartialEq)]
pub enum PeerAction {
    /// Publish a signaling message to the remote peer
    Publish(Signal),
    /// Run a transport operation (in order)
    Transport(TransportCommand),
    /// The state changed
    StateChanged(PeerState),
    /// The incarnation failed
    Failed(FailureReason),
    /// The incarnation closed
    Closed(CloseReason),
    /// A counter event arrived on the data channel
    Received(CounterEvent),
}

/// Negotiation state for one incarnation of a connection to one remote peer
#[derive(Debug)]
pub struct PeerSession {
    local_peer_id: PeerId,
    peer_id: PeerId,
    generation: u64,
    timing: PeerTiming,

    state: PeerState,
    role: Option<Role>,
    state_since: Instant,
    last_progress: Instant,
    last_activity: Instant,
    last_heartbeat: Option<Instant>,

    /// Seq of the applied remote offer/answer; starts at the floor carried
    /// over from earlier incarnations
    remote_sdp_seq: u64,
    remote_sdp: Option<String>,
    remote_description_set: bool,

    offer_requested: bool,
    local_sdp_sent: bool,

    pending_candidates: Vec<(u64, IceCandidate)>,
    applied_candidates: HashSet<IceCandidate>,
    outgoing_candidates: Vec<IceCandidate>,

    failure: Option<FailureReason>,
    close_reason: Option<CloseReason>,
}

impl PeerSession {
    pub fn new(
        local_peer_id: impl Into<PeerId>,
        peer_id: impl Into<PeerId>,
        generation: u64,
        timing: PeerTiming,
        sdp_seq_floor: u64,
        now: Instant,
    ) -> Self {
        Self {
            local_peer_id: local_peer_id.into(),
            peer_id: peer_id.into(),
            generation,
            timing,
            state: PeerState::Idle,
            role: None,
            state_since: now,
            last_progress: now,
            last_activity: now,
            last_heartbeat: None,
            remote_sdp_seq: sdp_seq_floor,
            remote_sdp: None,
            remote_description_set: false,
            offer_requested: false,
            local_sdp_sent: false,
            pending_candidates: Vec::new(),
            applied_candidates: HashSet::new(),
            outgoing_candidates: Vec::new(),
            failure: None,
            close_reason: None,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        self.failure.as_ref()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    pub fn is_connected(&self) -> bool {
        self.state == PeerState::Connected
    }

    /// Highest remote SDP seq applied (or inherited)
    pub fn remote_sdp_seq(&self) -> u64 {
        self.remote_sdp_seq
    }

    /// How long the session has been idle, if it is
    pub fn idle_for(&self, now: Instant) -> Option<Duration> {
        (self.state == PeerState::Idle).then(|| now.saturating_duration_since(self.state_since))
    }

    /// Whether the local peer is the designated initiator for this pair
    pub fn local_initiates(&self) -> bool {
        local_initiates(&self.local_peer_id, &self.peer_id)
    }

    /// Start negotiating as INITIATOR
    pub fn initiate(&mut self, now: Instant) -> Vec<PeerAction> {
        if self.state != PeerState::Idle {
            debug!(
                "Peer {}: initiate ignored in state {}",
                self.peer_id, self.state
            );
            return Vec::new();
        }

        info!("Peer {}: initiating (generation {})", self.peer_id, self.generation);
        let mut actions = Vec::new();
        self.role = Some(Role::Initiator);
        self.offer_requested = true;
        self.last_progress = now;
        self.transition(PeerState::Negotiating, now, &mut actions);
        actions.push(PeerAction::Transport(TransportCommand::CreateOffer));
        actions
    }

    /// Apply an inbound signaling message from this peer
    pub fn handle_signal(&mut self, msg: &SignalingMessage, now: Instant) -> Result<Vec<PeerAction>> {
        if msg.from != self.peer_id {
            return Err(Error::ProtocolViolation(format!(
                "message from {} routed to peer session {}",
                msg.from, self.peer_id
            )));
        }

        if matches!(
            self.state,
            PeerState::Closing | PeerState::Closed | PeerState::Failed
        ) {
            trace!(
                "Peer {}: dropping {} in state {}",
                self.peer_id,
                msg.type_name(),
                self.state
            );
            return Ok(Vec::new());
        }

        match &msg.signal {
            Signal::Offer { sdp } => Ok(self.on_offer(sdp, msg.seq, now)),
            Signal::Answer { sdp } => self.on_answer(sdp, msg.seq, now),
            Signal::IceCandidate(candidate) => Ok(self.on_remote_candidate(candidate, msg.seq)),
            Signal::Bye { reason } => Ok(self.on_bye(reason.as_deref(), msg.seq, now)),
        }
    }

    fn on_offer(&mut self, sdp: &str, seq: u64, now: Instant) -> Vec<PeerAction> {
        if seq <= self.remote_sdp_seq {
            debug!(
                "Peer {}: ignoring stale offer (seq {} <= {})",
                self.peer_id, seq, self.remote_sdp_seq
            );
            return Vec::new();
        }

        match (self.state, self.role) {
            (PeerState::Idle, _) => {
                self.role = Some(Role::Responder);
                let mut actions = Vec::new();
                self.transition(PeerState::Negotiating, now, &mut actions);
                self.accept_remote_offer(sdp, seq, now, &mut actions);
                actions
            }

            (PeerState::Negotiating, Some(Role::Initiator)) if !self.remote_description_set => {
                if self.local_initiates() {
                    debug!(
                        "Peer {}: glare, keeping local offer (local id is smaller)",
                        self.peer_id
                    );
                    return Vec::new();
                }

                info!(
                    "Peer {}: glare, rolling back local offer and answering",
                    self.peer_id
                );
                self.role = Some(Role::Responder);
                self.offer_requested = false;
                self.local_sdp_sent = false;
                self.outgoing_candidates.clear();

                let mut actions = vec![PeerAction::Transport(TransportCommand::Rollback)];
                self.accept_remote_offer(sdp, seq, now, &mut actions);
                actions
            }

            _ if self.remote_sdp.as_deref() == Some(sdp) => {
                trace!("Peer {}: duplicate offer", self.peer_id);
                Vec::new()
            }

            _ => {
                warn!(
                    "Peer {}: new offer (seq {}) in state {}, remote restarted",
                    self.peer_id, seq, self.state
                );
                self.fail(FailureReason::RemoteRestart, now)
            }
        }
    }

    fn accept_remote_offer(
        &mut self,
        sdp: &str,
        seq: u64,
        now: Instant,
        actions: &mut Vec<PeerAction>,
    ) {
        self.remote_sdp = Some(sdp.to_string());
        self.remote_sdp_seq = seq;
        self.remote_description_set = true;
        self.last_progress = now;
        actions.push(PeerAction::Transport(TransportCommand::AcceptOffer(
            sdp.to_string(),
        )));
        self.flush_candidates(actions);
    }

    fn on_answer(&mut self, sdp: &str, seq: u64, now: Instant) -> Result<Vec<PeerAction>> {
        if seq <= self.remote_sdp_seq {
            trace!(
                "Peer {}: ignoring stale or duplicate answer (seq {})",
                self.peer_id,
                seq
            );
            return Ok(Vec::new());
        }

        let awaiting_answer = self.state == PeerState::Negotiating
            && self.role == Some(Role::Initiator)
            && self.local_sdp_sent
            && !self.remote_description_set;

        if !awaiting_answer {
            return Err(Error::ProtocolViolation(format!(
                "answer from {} in state {} (role {:?})",
                self.peer_id, self.state, self.role
            )));
        }

        let mut actions = Vec::new();
        self.remote_sdp = Some(sdp.to_string());
        self.remote_sdp_seq = seq;
        self.remote_description_set = true;
        self.last_progress = now;
        actions.push(PeerAction::Transport(TransportCommand::ApplyAnswer(
            sdp.to_string(),
        )));
        self.flush_candidates(&mut actions);
        Ok(actions)
    }

    fn on_remote_candidate(&mut self, candidate: &IceCandidate, seq: u64) -> Vec<PeerAction> {
        if !self.remote_description_set {
            if self.pending_candidates.iter().any(|(_, c)| c == candidate) {
                return Vec::new();
            }
            if self.pending_candidates.len() >= MAX_PENDING_CANDIDATES {
                warn!(
                    "Peer {}: candidate buffer full, dropping oldest",
                    self.peer_id
                );
                self.pending_candidates.remove(0);
            }
            trace!("Peer {}: buffering candidate (seq {})", self.peer_id, seq);
            self.pending_candidates.push((seq, candidate.clone()));
            return Vec::new();
        }

        let mut actions = Vec::new();
        self.apply_candidate(seq, candidate.clone(), &mut actions);
        actions
    }

    fn apply_candidate(&mut self, seq: u64, candidate: IceCandidate, actions: &mut Vec<PeerAction>) {
        if seq < self.remote_sdp_seq {
            debug!(
                "Peer {}: dropping candidate from an older negotiation (seq {} < {})",
                self.peer_id, seq, self.remote_sdp_seq
            );
            return;
        }
        if !self.applied_candidates.insert(candidate.clone()) {
            return;
        }
        actions.push(PeerAction::Transport(TransportCommand::AddCandidate(
            candidate,
        )));
    }

    fn flush_candidates(&mut self, actions: &mut Vec<PeerAction>) {
        let mut pending = std::mem::take(&mut self.pending_candidates);
        pending.sort_by_key(|(seq, _)| *seq);
        for (seq, candidate) in pending {
            self.apply_candidate(seq, candidate, actions);
        }
    }

    fn on_bye(&mut self, reason: Option<&str>, seq: u64, now: Instant) -> Vec<PeerAction> {
        if seq < self.remote_sdp_seq {
            debug!("Peer {}: ignoring stale bye", self.peer_id);
            return Vec::new();
        }

        info!(
            "Peer {}: remote said bye ({})",
            self.peer_id,
            reason.unwrap_or("no reason")
        );
        let mut actions = Vec::new();
        self.close_reason = Some(CloseReason::RemoteBye);
        self.transition(PeerState::Closing, now, &mut actions);
        actions.push(PeerAction::Transport(TransportCommand::Close));
        actions
    }

    /// Apply an event reported by the transport
    pub fn handle_transport(&mut self, event: TransportEvent, now: Instant) -> Vec<PeerAction> {
        if self.state.is_terminal() || self.state == PeerState::Closing {
            return Vec::new();
        }

        match event {
            TransportEvent::LocalCandidate(candidate) => {
                if self.local_sdp_sent {
                    vec![PeerAction::Publish(Signal::IceCandidate(candidate))]
                } else {
                    self.outgoing_candidates.push(candidate);
                    Vec::new()
                }
            }

            TransportEvent::Connected => {
                if self.state != PeerState::Negotiating {
                    return Vec::new();
                }
                let mut actions = Vec::new();
                self.last_activity = now;
                self.last_heartbeat = None;
                self.transition(PeerState::Connected, now, &mut actions);
                actions
            }

            TransportEvent::Disconnected => {
                // may recover; liveness decides
                debug!("Peer {}: transport disconnected", self.peer_id);
                Vec::new()
            }

            TransportEvent::Failed(error) => self.fail(FailureReason::Transport(error), now),

            TransportEvent::Data(data) => {
                self.last_activity = now;
                match PeerFrame::from_bytes(&data) {
                    Ok(PeerFrame::Counter { event }) => vec![PeerAction::Received(event)],
                    Ok(PeerFrame::Heartbeat { .. }) => Vec::new(),
                    Err(e) => {
                        warn!("Peer {}: {}", self.peer_id, e);
                        Vec::new()
                    }
                }
            }
        }
    }

    /// Apply a report from the transport driver
    pub fn handle_report(&mut self, report: DriverReport, now: Instant) -> Vec<PeerAction> {
        match report {
            DriverReport::Closed => {
                if self.state != PeerState::Closing {
                    return Vec::new();
                }
                let reason = self.close_reason.unwrap_or(CloseReason::RemoteBye);
                let mut actions = Vec::new();
                self.transition(PeerState::Closed, now, &mut actions);
                actions.push(PeerAction::Closed(reason));
                actions
            }
            _ if self.state.is_terminal() || self.state == PeerState::Closing => Vec::new(),

            DriverReport::OfferCreated(sdp) => {
                let wanted = self.state == PeerState::Negotiating
                    && self.role == Some(Role::Initiator)
                    && self.offer_requested
                    && !self.local_sdp_sent;
                if !wanted {
                    debug!("Peer {}: discarding local offer", self.peer_id);
                    return Vec::new();
                }
                self.offer_requested = false;
                self.last_progress = now;
                self.publish_local_sdp(Signal::Offer { sdp })
            }

            DriverReport::AnswerCreated(sdp) => {
                let wanted = self.state == PeerState::Negotiating
                    && self.role == Some(Role::Responder)
                    && !self.local_sdp_sent;
                if !wanted {
                    debug!("Peer {}: discarding local answer", self.peer_id);
                    return Vec::new();
                }
                self.last_progress = now;
                self.publish_local_sdp(Signal::Answer { sdp })
            }

            DriverReport::OperationFailed { op, error } => {
                self.fail(FailureReason::Transport(format!("{}: {}", op, error)), now)
            }

            DriverReport::PublishFailed(error) => self.fail(FailureReason::Signaling(error), now),

            DriverReport::SendFailed(_) => Vec::new(),
        }
    }

    fn publish_local_sdp(&mut self, signal: Signal) -> Vec<PeerAction> {
        self.local_sdp_sent = true;
        let mut actions = vec![PeerAction::Publish(signal)];
        actions.extend(
            self.outgoing_candidates
                .drain(..)
                .map(|c| PeerAction::Publish(Signal::IceCandidate(c))),
        );
        actions
    }

    /// Check timers
    pub fn tick(&mut self, now: Instant) -> Vec<PeerAction> {
        match self.state {
            PeerState::Negotiating => {
                if now.saturating_duration_since(self.last_progress) > self.timing.negotiation_timeout {
                    warn!("Peer {}: negotiation timed out", self.peer_id);
                    return self.fail(FailureReason::NegotiationTimeout, now);
                }
                Vec::new()
            }
            PeerState::Connected => {
                if now.saturating_duration_since(self.last_activity) > self.timing.liveness_timeout {
                    warn!("Peer {}: no data within liveness timeout", self.peer_id);
                    return self.fail(FailureReason::LivenessTimeout, now);
                }

                let due = match self.last_heartbeat {
                    Some(at) => now.saturating_duration_since(at) >= self.timing.heartbeat_interval,
                    None => true,
                };
                if due {
                    self.last_heartbeat = Some(now);
                    vec![PeerAction::Transport(TransportCommand::SendFrame(
                        PeerFrame::heartbeat(),
                    ))]
                } else {
                    Vec::new()
                }
            }
            _ => Vec::new(),
        }
    }

    /// Tear the session down
    ///
    /// A local leave publishes BYE and reaches CLOSED immediately; a peer
    /// that left presence goes through CLOSING until the transport is gone.
    pub fn close(&mut self, reason: CloseReason, now: Instant) -> Vec<PeerAction> {
        if self.state.is_terminal() {
            return Vec::new();
        }

        let mut actions = Vec::new();
        if self.state != PeerState::Closing {
            actions.push(PeerAction::Publish(Signal::Bye {
                reason: Some(match reason {
                    CloseReason::LocalLeave => "leave".to_string(),
                    CloseReason::RemoteBye | CloseReason::PeerLeft => "peer gone".to_string(),
                }),
            }));
        }
        self.close_reason = Some(reason);

        match reason {
            CloseReason::LocalLeave => {
                self.transition(PeerState::Closed, now, &mut actions);
                actions.push(PeerAction::Transport(TransportCommand::Close));
                actions.push(PeerAction::Closed(reason));
            }
            CloseReason::RemoteBye | CloseReason::PeerLeft => {
                if self.state != PeerState::Closing {
                    self.transition(PeerState::Closing, now, &mut actions);
                    actions.push(PeerAction::Transport(TransportCommand::Close));
                }
            }
        }
        actions
    }

    fn fail(&mut self, reason: FailureReason, now: Instant) -> Vec<PeerAction> {
        if self.state.is_terminal() {
            return Vec::new();
        }

        let mut actions = Vec::new();
        self.failure = Some(reason.clone());
        self.transition(PeerState::Failed, now, &mut actions);
        actions.push(PeerAction::Failed(reason));
        actions.push(PeerAction::Transport(TransportCommand::Close));
        actions
    }

    fn transition(&mut self, state: PeerState, now: Instant, actions: &mut Vec<PeerAction>) {
        if self.state == state {
            return;
        }
        debug!(
            "Peer {}: {} -> {} (generation {})",
            self.peer_id, self.state, state, self.generation
        );
        self.state = state;
        self.state_since = now;
        actions.push(PeerAction::StateChanged(state));
    }
}
