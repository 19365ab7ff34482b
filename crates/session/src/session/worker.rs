//! Per-session worker
//!
//! One task per joined session consumes a single ordered queue of
//! [`SessionInput`]s: inbound signaling, presence changes, transport events,
//! driver reports and API commands. It is the only writer of the peer map,
//! the dedup cache and membership. Slow work (publishes, SDP generation,
//! transport setup) runs on the per-incarnation [`PeerDriver`] tasks.

use super::session::{PeerStatus, Session};
use crate::config::SessionConfig;
use crate::counter::{AppendOutcome, CounterEvent, CounterStore, RecentEventCache};
use crate::events::{current_timestamp_ms, SessionEvent};
use crate::peer::driver::{DriverCommand, DriverReport, DriverSetup, PeerDriver};
use crate::peer::{
    CloseReason, FailureReason, PeerAction, PeerFrame, PeerSession, PeerState, PeerTiming,
    ReconnectionPolicy, ReconnectionSupervisor, RetryDecision, RetryDue, Role, TransportCommand,
    TransportContext, TransportEvent, TransportEventSink, TransportFactory,
};
use crate::signaling::{
    PresenceEvent, SequenceGenerator, Signal, SignalingChannel, SignalingMessage,
};
use crate::{Error, PeerId, Result, SessionId};
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn, Instrument};

/// Signaling messages kept for a peer with no live incarnation
const MAX_STASHED_SIGNALS: usize = 64;

/// Everything a session worker reacts to, in arrival order
pub(crate) enum SessionInput {
    Signal(Result<SignalingMessage>),
    Presence(Result<PresenceEvent>),
    Transport {
        peer_id: PeerId,
        generation: u64,
        event: TransportEvent,
    },
    Driver {
        peer_id: PeerId,
        generation: u64,
        report: DriverReport,
    },
    Command(SessionCommand),
}

/// API requests forwarded by the coordinator
pub(crate) enum SessionCommand {
    Broadcast {
        event: CounterEvent,
        reply: oneshot::Sender<Result<()>>,
    },
    PeerStates {
        reply: oneshot::Sender<Vec<PeerStatus>>,
    },
    Leave {
        reply: oneshot::Sender<()>,
    },
}

/// Dependencies of a session worker
pub(crate) struct WorkerSetup {
    pub session_id: SessionId,
    pub local_peer_id: PeerId,
    pub config: SessionConfig,
    pub channel: Arc<dyn SignalingChannel>,
    pub transports: Arc<dyn TransportFactory>,
    pub store: Arc<dyn CounterStore>,
    pub sequence: Arc<SequenceGenerator>,
    pub events: broadcast::Sender<SessionEvent>,
}

/// Coordinator-side handle to a running session worker
pub(crate) struct SessionHandle {
    session_id: SessionId,
    inputs: mpsc::UnboundedSender<SessionInput>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.inputs
            .send(SessionInput::Command(command(reply)))
            .map_err(|_| Error::SessionNotFound(self.session_id.clone()))?;
        rx.await
            .map_err(|_| Error::SessionNotFound(self.session_id.clone()))
    }

    /// Wait for the worker task to finish
    pub async fn join(&mut self) {
        if let Err(e) = (&mut self.task).await {
            if e.is_panic() {
                error!("Session {} worker panicked", self.session_id);
            }
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Per remote peer bookkeeping that outlives single incarnations
#[derive(Default)]
struct PeerEntry {
    session: Option<PeerSession>,
    driver: Option<PeerDriver>,
    last_state: Option<PeerState>,
    last_role: Option<Role>,
    /// Highest remote SDP seq seen by any incarnation
    sdp_seq_floor: u64,
    outbox: VecDeque<CounterEvent>,
    stash: Vec<SignalingMessage>,
    departed: bool,
    abandoned: bool,
}

impl PeerEntry {
    fn live(&self) -> Option<&PeerSession> {
        self.session.as_ref().filter(|s| !s.state().is_terminal())
    }

    fn is_live(&self) -> bool {
        self.live().is_some()
    }

    fn reachable(&self) -> bool {
        !self.departed && !self.abandoned
    }
}

pub(crate) struct SessionWorker {
    session: Session,
    config: SessionConfig,
    timing: PeerTiming,
    channel: Arc<dyn SignalingChannel>,
    transports: Arc<dyn TransportFactory>,
    store: Arc<dyn CounterStore>,
    sequence: Arc<SequenceGenerator>,
    events: broadcast::Sender<SessionEvent>,
    inputs: mpsc::UnboundedSender<SessionInput>,

    peers: HashMap<PeerId, PeerEntry>,
    supervisor: ReconnectionSupervisor,
    dedup: RecentEventCache,
    next_generation: u64,
    retired: Vec<JoinHandle<()>>,
    background: Vec<JoinHandle<()>>,
}

impl SessionWorker {
    /// Start the worker and its inbox, presence and heartbeat tasks
    pub fn spawn(setup: WorkerSetup) -> SessionHandle {
        let (inputs, input_rx) = mpsc::unbounded_channel();
        let (due_tx, due_rx) = mpsc::unbounded_channel();
        let session_id = setup.session_id.clone();
        let span = tracing::info_span!(
            "session",
            session = %setup.session_id,
            local = %setup.local_peer_id
        );

        let mut worker = SessionWorker {
            session: Session::new(setup.session_id, setup.local_peer_id),
            timing: PeerTiming::from(&setup.config),
            supervisor: ReconnectionSupervisor::new(
                ReconnectionPolicy::from(&setup.config.reconnect),
                due_tx,
            ),
            dedup: RecentEventCache::new(setup.config.dedup_capacity, setup.config.dedup_window()),
            config: setup.config,
            channel: setup.channel,
            transports: setup.transports,
            store: setup.store,
            sequence: setup.sequence,
            events: setup.events,
            inputs: inputs.clone(),
            peers: HashMap::new(),
            next_generation: 0,
            retired: Vec::new(),
            background: Vec::new(),
        };
        worker.start_background(span.clone());

        let task = tokio::spawn(worker.run(input_rx, due_rx).instrument(span));
        SessionHandle {
            session_id,
            inputs,
            task,
        }
    }

    fn start_background(&mut self, span: tracing::Span) {
        let session_id = self.session.session_id().to_string();
        let local = self.session.local_peer_id().to_string();

        let channel = self.channel.clone();
        let (sid, pid) = (session_id.clone(), local.clone());
        let signals = pump(
            "inbox",
            self.inputs.clone(),
            move || {
                let channel = channel.clone();
                let (sid, pid) = (sid.clone(), pid.clone());
                async move { channel.subscribe(&sid, &pid).await }
            },
            SessionInput::Signal,
        );

        let channel = self.channel.clone();
        let sid = session_id.clone();
        let stale_after = self.config.presence_timeout();
        let presence = pump(
            "presence",
            self.inputs.clone(),
            move || {
                let channel = channel.clone();
                let sid = sid.clone();
                async move { channel.watch_members(&sid, stale_after).await }
            },
            SessionInput::Presence,
        );

        let heartbeat = presence_heartbeat(
            self.channel.clone(),
            session_id,
            local,
            self.config.presence_interval(),
        );

        self.background = vec![
            tokio::spawn(signals.instrument(span.clone())),
            tokio::spawn(presence.instrument(span.clone())),
            tokio::spawn(heartbeat.instrument(span)),
        ];
    }

    async fn run(
        mut self,
        mut inputs: mpsc::UnboundedReceiver<SessionInput>,
        mut retries: mpsc::UnboundedReceiver<RetryDue>,
    ) {
        info!("Session {} worker started", self.session.session_id());
        let mut tick = tokio::time::interval(self.config.tick_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(input) = inputs.recv() => {
                    if let SessionInput::Command(SessionCommand::Leave { reply }) = input {
                        self.leave().await;
                        let _ = reply.send(());
                        return;
                    }
                    self.handle_input(input).await;
                }
                Some(due) = retries.recv() => self.on_retry_due(due).await,
                _ = tick.tick() => self.on_tick().await,
            }
        }
    }

    async fn handle_input(&mut self, input: SessionInput) {
        match input {
            SessionInput::Signal(Ok(message)) => self.on_signal(message).await,
            SessionInput::Signal(Err(e)) => self.on_channel_error("inbox", e),
            SessionInput::Presence(Ok(event)) => self.on_presence(event).await,
            SessionInput::Presence(Err(e)) => self.on_channel_error("presence", e),
            SessionInput::Transport {
                peer_id,
                generation,
                event,
            } => self.on_transport(&peer_id, generation, event).await,
            SessionInput::Driver {
                peer_id,
                generation,
                report,
            } => self.on_report(&peer_id, generation, report).await,
            SessionInput::Command(SessionCommand::Broadcast { event, reply }) => {
                let _ = reply.send(self.broadcast(event).await);
            }
            SessionInput::Command(SessionCommand::PeerStates { reply }) => {
                let _ = reply.send(self.peer_states());
            }
            SessionInput::Command(SessionCommand::Leave { reply }) => {
                // handled by the run loop
                let _ = reply.send(());
            }
        }
    }

    fn on_channel_error(&self, source: &str, error: Error) {
        if let Error::ProtocolViolation(reason) = &error {
            warn!(
                "Session {}: discarding malformed {} message: {}",
                self.session.session_id(),
                source,
                reason
            );
            return;
        }
        warn!(
            "Session {}: {} stream error: {}",
            self.session.session_id(),
            source,
            error
        );
        self.emit(SessionEvent::SignalingError {
            session_id: self.session.session_id().to_string(),
            message: error.to_string(),
        });
    }

    async fn on_signal(&mut self, message: SignalingMessage) {
        let now = Instant::now();
        if message.session_id != self.session.session_id()
            || message.to != self.session.local_peer_id()
        {
            warn!(
                "Session {}: misrouted {} ({} -> {} in {})",
                self.session.session_id(),
                message.type_name(),
                message.from,
                message.to,
                message.session_id
            );
            return;
        }
        if message.from == self.session.local_peer_id() {
            trace!("Session {}: ignoring own message", self.session.session_id());
            return;
        }

        let peer_id = message.from.clone();
        let is_offer = matches!(message.signal, Signal::Offer { .. });

        if !self.peers.contains_key(&peer_id) {
            if matches!(message.signal, Signal::Bye { .. }) {
                trace!("Session {}: bye from unknown peer {}", self.session.session_id(), peer_id);
                return;
            }
            if let Err(e) = self.admit(&peer_id) {
                warn!("Session {}: {}", self.session.session_id(), e);
                return;
            }
        }

        let Some(entry) = self.peers.get_mut(&peer_id) else {
            return;
        };

        if !entry.is_live() {
            match message.signal {
                Signal::Offer { .. } if message.seq > entry.sdp_seq_floor => {
                    // a fresh offer is a rejoin: drop any pending retry and answer now
                    entry.departed = false;
                    entry.abandoned = false;
                    self.supervisor.forget(&peer_id);
                    self.session.add_member(&peer_id);
                    self.spawn_incarnation(&peer_id, now, false).await;
                }
                Signal::Offer { .. } => {
                    debug!(
                        "Session {}: stale offer from {} (seq {})",
                        self.session.session_id(),
                        peer_id,
                        message.seq
                    );
                    return;
                }
                Signal::IceCandidate(_) => {
                    if entry.stash.len() >= MAX_STASHED_SIGNALS {
                        entry.stash.remove(0);
                    }
                    trace!(
                        "Session {}: stashing candidate from {} (seq {})",
                        self.session.session_id(),
                        peer_id,
                        message.seq
                    );
                    entry.stash.push(message);
                    return;
                }
                Signal::Answer { .. } => {
                    debug!(
                        "Session {}: answer from {} with no negotiation in progress",
                        self.session.session_id(),
                        peer_id
                    );
                    return;
                }
                Signal::Bye { .. } => {
                    if message.seq >= entry.sdp_seq_floor {
                        self.mark_departed(&peer_id, "peer left");
                    }
                    return;
                }
            }
        }

        let restart = self.deliver(&peer_id, &message, now).await;
        if restart && is_offer {
            info!(
                "Session {}: peer {} restarted, renegotiating",
                self.session.session_id(),
                peer_id
            );
            self.supervisor.forget(&peer_id);
            self.spawn_incarnation(&peer_id, now, false).await;
            self.deliver(&peer_id, &message, now).await;
        }
        if is_offer {
            self.drain_stash(&peer_id, now).await;
        }
    }

    /// Route a message into the live incarnation. Returns `true` when the
    /// incarnation failed because the remote restarted.
    async fn deliver(&mut self, peer_id: &str, message: &SignalingMessage, now: Instant) -> bool {
        let Some(session) = self.peers.get_mut(peer_id).and_then(|e| e.session.as_mut()) else {
            return false;
        };

        match session.handle_signal(message, now) {
            Ok(actions) => {
                let restarted = session.failure() == Some(&FailureReason::RemoteRestart);
                let seen = session.remote_sdp_seq();
                if let Some(entry) = self.peers.get_mut(peer_id) {
                    entry.sdp_seq_floor = entry.sdp_seq_floor.max(seen);
                }
                self.apply_actions(peer_id, actions, now).await;
                restarted
            }
            Err(e) => {
                warn!(
                    "Session {}: discarding {} from {}: {}",
                    self.session.session_id(),
                    message.type_name(),
                    peer_id,
                    e
                );
                false
            }
        }
    }

    async fn drain_stash(&mut self, peer_id: &str, now: Instant) {
        let Some(entry) = self.peers.get_mut(peer_id) else {
            return;
        };
        if !entry.is_live() || entry.stash.is_empty() {
            return;
        }
        let mut stash = std::mem::take(&mut entry.stash);
        stash.sort_by_key(|m| m.seq);
        for message in stash {
            self.deliver(peer_id, &message, now).await;
        }
    }

    /// Create the bookkeeping entry for a newly discovered peer
    fn admit(&mut self, peer_id: &str) -> Result<()> {
        let active = self.peers.values().filter(|e| !e.departed).count();
        if active >= self.config.max_peers as usize {
            return Err(Error::PeerLimitExceeded(format!(
                "ignoring peer {}: {} peers already in session",
                peer_id, active
            )));
        }
        self.session.add_member(peer_id);
        self.peers.insert(peer_id.to_string(), PeerEntry::default());
        Ok(())
    }

    async fn on_presence(&mut self, event: PresenceEvent) {
        let now = Instant::now();
        let peer_id = event.peer_id().to_string();
        if peer_id == self.session.local_peer_id() {
            return;
        }

        match event {
            PresenceEvent::Joined(_) => {
                let newly_added = self.session.add_member(&peer_id);
                if !self.peers.contains_key(&peer_id) {
                    if let Err(e) = self.admit(&peer_id) {
                        warn!("Session {}: {}", self.session.session_id(), e);
                        self.session.remove_member(&peer_id);
                        return;
                    }
                }
                let Some(entry) = self.peers.get_mut(&peer_id) else {
                    return;
                };
                if entry.is_live() {
                    return;
                }

                let rejoined = newly_added || !entry.reachable();
                if rejoined || entry.session.is_none() {
                    info!("Session {}: peer {} joined", self.session.session_id(), peer_id);
                    entry.departed = false;
                    entry.abandoned = false;
                    self.supervisor.forget(&peer_id);
                    let initiate = crate::peer::local_initiates(self.session.local_peer_id(), &peer_id);
                    self.spawn_incarnation(&peer_id, now, initiate).await;
                }
            }

            PresenceEvent::Left(_) => {
                self.session.remove_member(&peer_id);
                let Some(entry) = self.peers.get_mut(&peer_id) else {
                    return;
                };
                info!("Session {}: peer {} left", self.session.session_id(), peer_id);
                self.supervisor.forget(&peer_id);
                match entry.session.as_mut().filter(|s| !s.state().is_terminal()) {
                    Some(session) => {
                        let actions = session.close(CloseReason::PeerLeft, now);
                        self.apply_actions(&peer_id, actions, now).await;
                    }
                    None => self.mark_departed(&peer_id, "peer left"),
                }
            }
        }
    }

    /// The peer is gone while no incarnation is live
    fn mark_departed(&mut self, peer_id: &str, reason: &str) {
        self.supervisor.forget(peer_id);
        let Some(entry) = self.peers.get_mut(peer_id) else {
            return;
        };
        entry.departed = true;
        entry.stash.clear();
        let outbox: Vec<CounterEvent> = entry.outbox.drain(..).collect();
        let changed = entry.last_state != Some(PeerState::Closed);
        entry.last_state = Some(PeerState::Closed);
        let role = entry.last_role;

        if changed {
            self.emit(SessionEvent::PeerStateChanged {
                session_id: self.session.session_id().to_string(),
                peer_id: peer_id.to_string(),
                state: PeerState::Closed,
                role,
            });
        }
        self.report_undeliverable(peer_id, outbox, reason);
    }

    async fn on_transport(&mut self, peer_id: &str, generation: u64, event: TransportEvent) {
        let now = Instant::now();
        let Some(session) = current(&mut self.peers, peer_id, generation) else {
            trace!(
                "Session {}: stale {} from peer {} (generation {})",
                self.session.session_id(),
                event.name(),
                peer_id,
                generation
            );
            return;
        };
        let actions = session.handle_transport(event, now);
        self.apply_actions(peer_id, actions, now).await;
    }

    async fn on_report(&mut self, peer_id: &str, generation: u64, report: DriverReport) {
        let now = Instant::now();

        if let DriverReport::SendFailed(PeerFrame::Counter { event }) = &report {
            // requeue; flushed again on the next connect
            let event = event.clone();
            if let Some(entry) = self.peers.get_mut(peer_id).filter(|e| e.reachable()) {
                entry.outbox.push_back(event);
                self.trim_outbox(peer_id);
            } else {
                self.report_undeliverable(peer_id, vec![event], "peer unreachable");
            }
            return;
        }

        let Some(session) = current(&mut self.peers, peer_id, generation) else {
            trace!(
                "Session {}: stale driver report from peer {} (generation {})",
                self.session.session_id(),
                peer_id,
                generation
            );
            return;
        };
        let actions = session.handle_report(report, now);
        self.apply_actions(peer_id, actions, now).await;
    }

    async fn on_retry_due(&mut self, due: RetryDue) {
        if !self.supervisor.take_due(&due) {
            trace!("Session {}: retry for {} no longer wanted", self.session.session_id(), due.peer_id);
            return;
        }
        let Some(entry) = self.peers.get(&due.peer_id) else {
            return;
        };
        if entry.is_live() || !entry.reachable() {
            return;
        }

        info!(
            "Session {}: reconnecting to peer {} (attempt {})",
            self.session.session_id(),
            due.peer_id,
            due.attempt
        );
        let initiate = crate::peer::local_initiates(self.session.local_peer_id(), &due.peer_id);
        self.spawn_incarnation(&due.peer_id, Instant::now(), initiate)
            .await;
        self.drain_stash(&due.peer_id, Instant::now()).await;
    }

    async fn on_tick(&mut self) {
        let now = Instant::now();
        let peer_ids: Vec<PeerId> = self.peers.keys().cloned().collect();

        for peer_id in peer_ids {
            let Some(session) = self.peers.get_mut(&peer_id).and_then(|e| e.session.as_mut()) else {
                continue;
            };

            let mut actions = session.tick(now);
            // designated responders that never heard an offer initiate themselves
            if session
                .idle_for(now)
                .is_some_and(|idle| idle >= self.timing.negotiation_timeout)
            {
                debug!(
                    "Session {}: no offer from {} yet, initiating",
                    self.session.session_id(),
                    peer_id
                );
                actions.extend(session.initiate(now));
            }
            self.apply_actions(&peer_id, actions, now).await;
        }

        self.retired.retain(|handle| !handle.is_finished());
    }

    /// Start a new incarnation for `peer_id`, replacing any previous one
    async fn spawn_incarnation(&mut self, peer_id: &str, now: Instant, initiate: bool) {
        self.next_generation += 1;
        let generation = self.next_generation;

        let entry = self.peers.entry(peer_id.to_string()).or_default();
        if let Some(old) = entry.session.take() {
            entry.sdp_seq_floor = entry.sdp_seq_floor.max(old.remote_sdp_seq());
        }
        if let Some(old) = entry.driver.take() {
            old.send(DriverCommand::Transport(TransportCommand::Close));
            self.retired.push(old.into_handle());
        }

        debug!(
            "Session {}: new incarnation for peer {} (generation {}, seq floor {})",
            self.session.session_id(),
            peer_id,
            generation,
            entry.sdp_seq_floor
        );

        let inputs = self.inputs.clone();
        let (pid, session_id) = (peer_id.to_string(), self.session.session_id().to_string());
        let events = TransportEventSink::new(move |event| {
            let _ = inputs.send(SessionInput::Transport {
                peer_id: pid.clone(),
                generation,
                event,
            });
        });

        let inputs = self.inputs.clone();
        let pid = peer_id.to_string();
        let driver = PeerDriver::spawn(
            DriverSetup {
                context: TransportContext {
                    session_id: session_id.clone(),
                    local_peer_id: self.session.local_peer_id().to_string(),
                    remote_peer_id: peer_id.to_string(),
                    events,
                },
                factory: self.transports.clone(),
                channel: self.channel.clone(),
                publish_policy: ReconnectionPolicy::signaling(self.config.publish_retries),
            },
            move |report| {
                let _ = inputs.send(SessionInput::Driver {
                    peer_id: pid.clone(),
                    generation,
                    report,
                });
            },
        );

        entry.session = Some(PeerSession::new(
            self.session.local_peer_id(),
            peer_id,
            generation,
            self.timing,
            entry.sdp_seq_floor,
            now,
        ));
        entry.driver = Some(driver);
        entry.last_state = Some(PeerState::Idle);
        entry.last_role = None;

        self.emit(SessionEvent::PeerStateChanged {
            session_id,
            peer_id: peer_id.to_string(),
            state: PeerState::Idle,
            role: None,
        });

        if initiate {
            if let Some(session) = self.peers.get_mut(peer_id).and_then(|e| e.session.as_mut()) {
                let actions = session.initiate(now);
                self.apply_actions(peer_id, actions, now).await;
            }
        }
    }

    async fn apply_actions(&mut self, peer_id: &str, actions: Vec<PeerAction>, now: Instant) {
        for action in actions {
            match action {
                PeerAction::Publish(signal) => {
                    let message = SignalingMessage {
                        session_id: self.session.session_id().to_string(),
                        from: self.session.local_peer_id().to_string(),
                        to: peer_id.to_string(),
                        seq: self.sequence.next(),
                        ts: current_timestamp_ms(),
                        signal,
                    };
                    self.dispatch(peer_id, DriverCommand::Publish(message));
                }

                PeerAction::Transport(command) => {
                    self.dispatch(peer_id, DriverCommand::Transport(command));
                }

                PeerAction::StateChanged(state) => {
                    let Some(entry) = self.peers.get_mut(peer_id) else {
                        continue;
                    };
                    let role = entry.session.as_ref().and_then(|s| s.role());
                    entry.last_state = Some(state);
                    entry.last_role = role;

                    info!(
                        "Session {}: peer {} is {}",
                        self.session.session_id(),
                        peer_id,
                        state
                    );
                    self.emit(SessionEvent::PeerStateChanged {
                        session_id: self.session.session_id().to_string(),
                        peer_id: peer_id.to_string(),
                        state,
                        role,
                    });

                    if state == PeerState::Connected {
                        self.supervisor.record_success(peer_id);
                        self.flush_outbox(peer_id);
                    }
                }

                PeerAction::Failed(reason) => {
                    warn!(
                        "Session {}: peer {} failed: {}",
                        self.session.session_id(),
                        peer_id,
                        reason
                    );
                    // a restarted remote is renegotiated right away by the caller
                    if reason != FailureReason::RemoteRestart {
                        self.schedule_retry(peer_id);
                    }
                }

                PeerAction::Closed(reason) => {
                    debug!(
                        "Session {}: peer {} closed ({:?})",
                        self.session.session_id(),
                        peer_id,
                        reason
                    );
                    self.supervisor.forget(peer_id);
                    if reason.is_permanent_leave() {
                        self.mark_departed(peer_id, "peer left");
                    }
                }

                PeerAction::Received(event) => self.apply_remote_event(peer_id, event, now).await,
            }
        }
    }

    fn dispatch(&mut self, peer_id: &str, command: DriverCommand) {
        let Some(driver) = self.peers.get(peer_id).and_then(|e| e.driver.as_ref()) else {
            return;
        };
        if !driver.send(command) {
            debug!(
                "Session {}: driver for peer {} already stopped",
                self.session.session_id(),
                peer_id
            );
        }
    }

    fn schedule_retry(&mut self, peer_id: &str) {
        if !self.peers.get(peer_id).is_some_and(|e| e.reachable()) {
            return;
        }

        match self.supervisor.schedule(peer_id) {
            RetryDecision::Scheduled { attempt, delay } => {
                self.emit(SessionEvent::Reconnecting {
                    session_id: self.session.session_id().to_string(),
                    peer_id: peer_id.to_string(),
                    attempt,
                    delay,
                });
            }
            RetryDecision::AlreadyPending { .. } => {}
            RetryDecision::Exhausted { attempts } => {
                warn!(
                    "Session {}: abandoning peer {} after {} attempts",
                    self.session.session_id(),
                    peer_id,
                    attempts
                );
                let outbox = match self.peers.get_mut(peer_id) {
                    Some(entry) => {
                        entry.abandoned = true;
                        entry.outbox.drain(..).collect()
                    }
                    None => Vec::new(),
                };
                self.emit(SessionEvent::PeerAbandoned {
                    session_id: self.session.session_id().to_string(),
                    peer_id: peer_id.to_string(),
                });
                self.report_undeliverable(peer_id, outbox, "peer abandoned");
            }
        }
    }

    fn flush_outbox(&mut self, peer_id: &str) {
        let Some(entry) = self.peers.get_mut(peer_id) else {
            return;
        };
        if entry.outbox.is_empty() {
            return;
        }
        debug!(
            "Session {}: flushing {} queued events to {}",
            self.session.session_id(),
            entry.outbox.len(),
            peer_id
        );
        let queued: Vec<CounterEvent> = entry.outbox.drain(..).collect();
        for event in queued {
            self.dispatch(
                peer_id,
                DriverCommand::Transport(TransportCommand::SendFrame(PeerFrame::Counter { event })),
            );
        }
    }

    fn trim_outbox(&mut self, peer_id: &str) {
        let max = self.config.max_pending_events;
        let Some(entry) = self.peers.get_mut(peer_id) else {
            return;
        };
        let mut dropped = Vec::new();
        while entry.outbox.len() > max {
            if let Some(event) = entry.outbox.pop_front() {
                dropped.push(event);
            }
        }
        self.report_undeliverable(peer_id, dropped, "outbox full");
    }

    fn report_undeliverable(&self, peer_id: &str, events: Vec<CounterEvent>, reason: &str) {
        for event in events {
            warn!(
                "Session {}: event {} undeliverable to {}: {}",
                self.session.session_id(),
                event.event_id,
                peer_id,
                reason
            );
            self.emit(SessionEvent::Undeliverable {
                session_id: self.session.session_id().to_string(),
                peer_id: peer_id.to_string(),
                event,
                reason: reason.to_string(),
            });
        }
    }

    /// Record an event exactly once in the local store
    async fn record(&mut self, event: &CounterEvent, now: Instant) -> Result<bool> {
        if !self.dedup.insert(&event.event_id, now) {
            trace!(
                "Session {}: duplicate event {}",
                self.session.session_id(),
                event.event_id
            );
            return Ok(false);
        }

        let outcome = match self.store.append_event(event).await {
            Ok(outcome) => outcome,
            Err(e) => {
                // forget it so a redelivery gets another chance
                self.dedup.remove(&event.event_id);
                return Err(e);
            }
        };
        if outcome == AppendOutcome::DuplicateIgnored {
            return Ok(false);
        }

        let total = self.store.current_total(self.session.session_id()).await?;
        debug!(
            "Session {}: applied {:+} from {} (total {})",
            self.session.session_id(),
            event.delta,
            event.origin_peer_id,
            total
        );
        self.emit(SessionEvent::CounterApplied {
            session_id: self.session.session_id().to_string(),
            event: event.clone(),
            total,
        });
        Ok(true)
    }

    async fn apply_remote_event(&mut self, peer_id: &str, event: CounterEvent, now: Instant) {
        if event.session_id != self.session.session_id() {
            warn!(
                "Session {}: peer {} sent an event for session {}",
                self.session.session_id(),
                peer_id,
                event.session_id
            );
            return;
        }
        if let Err(e) = self.record(&event, now).await {
            error!(
                "Session {}: failed to store event {}: {}",
                self.session.session_id(),
                event.event_id,
                e
            );
            self.report_undeliverable(
                self.session.local_peer_id(),
                vec![event],
                &format!("store: {}", e),
            );
        }
    }

    async fn broadcast(&mut self, event: CounterEvent) -> Result<()> {
        if event.session_id != self.session.session_id() {
            return Err(Error::SessionNotFound(event.session_id));
        }
        let now = Instant::now();
        if !self.record(&event, now).await? {
            return Ok(());
        }

        let targets: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, e)| e.reachable())
            .map(|(id, _)| id.clone())
            .collect();

        for peer_id in targets {
            let connected = self
                .peers
                .get(&peer_id)
                .and_then(|e| e.live())
                .is_some_and(|s| s.is_connected());

            if connected {
                trace!("Session {}: sending {} to {}", self.session.session_id(), event.event_id, peer_id);
                self.dispatch(
                    &peer_id,
                    DriverCommand::Transport(TransportCommand::SendFrame(PeerFrame::Counter {
                        event: event.clone(),
                    })),
                );
            } else if let Some(entry) = self.peers.get_mut(&peer_id) {
                entry.outbox.push_back(event.clone());
                self.trim_outbox(&peer_id);
            }
        }
        Ok(())
    }

    fn peer_states(&self) -> Vec<PeerStatus> {
        let mut states: Vec<PeerStatus> = self
            .peers
            .iter()
            .map(|(peer_id, entry)| PeerStatus {
                peer_id: peer_id.clone(),
                state: entry
                    .session
                    .as_ref()
                    .map(|s| s.state())
                    .or(entry.last_state)
                    .unwrap_or(PeerState::Idle),
                role: entry.session.as_ref().and_then(|s| s.role()).or(entry.last_role),
                generation: entry.session.as_ref().map(|s| s.generation()).unwrap_or(0),
                member: self.session.is_member(peer_id),
                retry_pending: self.supervisor.is_pending(peer_id),
                attempts: self.supervisor.attempts(peer_id),
                pending_events: entry.outbox.len(),
            })
            .collect();
        states.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        states
    }

    async fn leave(&mut self) {
        let now = Instant::now();
        let session_id = self.session.session_id().to_string();
        info!("Leaving session {} ({} peers)", session_id, self.peers.len());

        self.supervisor.cancel_all();

        let peer_ids: Vec<PeerId> = self.peers.keys().cloned().collect();
        for peer_id in &peer_ids {
            let live = self
                .peers
                .get_mut(peer_id)
                .and_then(|e| e.session.as_mut())
                .filter(|s| !s.state().is_terminal());
            match live {
                Some(session) => {
                    let actions = session.close(CloseReason::LocalLeave, now);
                    self.apply_actions(peer_id, actions, now).await;
                }
                None => {
                    // failed or departed peers end CLOSED as well
                    if let Some(entry) = self.peers.get_mut(peer_id) {
                        if entry.last_state != Some(PeerState::Closed) {
                            entry.last_state = Some(PeerState::Closed);
                            let role = entry.last_role;
                            self.emit(SessionEvent::PeerStateChanged {
                                session_id: session_id.clone(),
                                peer_id: peer_id.clone(),
                                state: PeerState::Closed,
                                role,
                            });
                        }
                    }
                }
            }

            let outbox: Vec<CounterEvent> = self
                .peers
                .get_mut(peer_id)
                .map(|e| e.outbox.drain(..).collect())
                .unwrap_or_default();
            self.report_undeliverable(peer_id, outbox, "session left");
        }

        for task in self.background.drain(..) {
            task.abort();
        }

        let leave_timeout = self.config.leave_timeout();
        let channel = self.channel.clone();
        let local = self.session.local_peer_id().to_string();
        match tokio::time::timeout(leave_timeout, channel.withdraw(&session_id, &local)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Session {}: failed to withdraw presence: {}", session_id, e),
            Err(_) => warn!("Session {}: presence withdraw timed out", session_id),
        }

        // drivers publish BYE and release transports after their queued work
        let mut handles: Vec<JoinHandle<()>> = self
            .peers
            .values_mut()
            .filter_map(|e| e.driver.take())
            .map(PeerDriver::into_handle)
            .collect();
        handles.append(&mut self.retired);

        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        if tokio::time::timeout(leave_timeout, futures::future::join_all(handles))
            .await
            .is_err()
        {
            warn!(
                "Session {}: transports not released within {:?}, aborting",
                session_id, leave_timeout
            );
            for abort in aborts {
                abort.abort();
            }
        }

        info!("Left session {}", session_id);
        self.emit(SessionEvent::SessionClosed { session_id });
    }

    fn emit(&self, event: SessionEvent) {
        trace!("Session event: {}", event.name());
        // no receivers is fine
        let _ = self.events.send(event);
    }
}

impl Drop for SessionWorker {
    fn drop(&mut self) {
        for task in self.background.drain(..) {
            task.abort();
        }
        for entry in self.peers.values() {
            if let Some(driver) = &entry.driver {
                driver.abort();
            }
        }
        for handle in &self.retired {
            handle.abort();
        }
    }
}

/// Live incarnation `generation` of `peer_id`, if it is still current
fn current<'a>(
    peers: &'a mut HashMap<PeerId, PeerEntry>,
    peer_id: &str,
    generation: u64,
) -> Option<&'a mut PeerSession> {
    peers
        .get_mut(peer_id)
        .and_then(|e| e.session.as_mut())
        .filter(|s| s.generation() == generation)
}

/// Keep a relay stream open, resubscribing with backoff when it ends
async fn pump<T, F, Fut>(
    what: &'static str,
    inputs: mpsc::UnboundedSender<SessionInput>,
    mut open: F,
    wrap: fn(Result<T>) -> SessionInput,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<BoxStream<'static, Result<T>>>>,
{
    let policy = ReconnectionPolicy {
        max_retries: None,
        ..ReconnectionPolicy::signaling(0)
    };
    let mut attempt = 0;

    loop {
        match open().await {
            Ok(mut stream) => {
                attempt = 0;
                while let Some(item) = stream.next().await {
                    if inputs.send(wrap(item)).is_err() {
                        return;
                    }
                }
                debug!("{} stream ended, resubscribing", what);
            }
            Err(e) => {
                if inputs.send(wrap(Err(e))).is_err() {
                    return;
                }
            }
        }

        let delay = policy.calculate_backoff(attempt);
        attempt = attempt.saturating_add(1);
        tokio::time::sleep(delay).await;
    }
}

async fn presence_heartbeat(
    channel: Arc<dyn SignalingChannel>,
    session_id: SessionId,
    peer_id: PeerId,
    interval: std::time::Duration,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if let Err(e) = channel.heartbeat(&session_id, &peer_id).await {
            debug!("Presence heartbeat for {} failed: {}", session_id, e);
        }
    }
}
