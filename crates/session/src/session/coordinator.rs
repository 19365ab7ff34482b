//! Session coordinator
//!
//! Entry point of the crate. Owns one worker per joined session and routes
//! API calls to it; observers subscribe to the shared [`SessionEvent`]
//! stream.

use super::session::{PeerId, PeerStatus, SessionId};
use super::worker::{SessionCommand, SessionHandle, SessionWorker, WorkerSetup};
use crate::config::SessionConfig;
use crate::counter::{CounterEvent, CounterStore};
use crate::events::SessionEvent;
use crate::peer::{ReconnectionPolicy, TransportFactory};
use crate::signaling::{validate_key, SequenceGenerator, SignalingChannel};
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, instrument, warn};

/// Coordinates the sessions joined by one local device
///
/// # Example
///
/// ```no_run
/// use cloudcounter_session::{
///     LoopbackNetwork, MemoryCounterStore, MemoryRelay, SessionConfig, SessionCoordinator,
/// };
/// use std::sync::Arc;
///
/// # async fn run() -> cloudcounter_session::Result<()> {
/// let coordinator = SessionCoordinator::new(
///     "device-a",
///     SessionConfig::default(),
///     Arc::new(MemoryRelay::new()),
///     Arc::new(LoopbackNetwork::new()),
///     Arc::new(MemoryCounterStore::new()),
/// )?;
///
/// coordinator.join("S1").await?;
/// coordinator.record_local_count("S1", 1).await?;
/// coordinator.leave("S1").await?;
/// # Ok(())
/// # }
/// ```
pub struct SessionCoordinator {
    local_peer_id: PeerId,
    config: SessionConfig,
    channel: Arc<dyn SignalingChannel>,
    transports: Arc<dyn TransportFactory>,
    store: Arc<dyn CounterStore>,
    sequence: Arc<SequenceGenerator>,
    sessions: RwLock<HashMap<SessionId, SessionHandle>>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionCoordinator {
    /// Create a coordinator for the local peer
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the configuration or the peer id
    /// is invalid.
    pub fn new(
        local_peer_id: impl Into<PeerId>,
        config: SessionConfig,
        channel: Arc<dyn SignalingChannel>,
        transports: Arc<dyn TransportFactory>,
        store: Arc<dyn CounterStore>,
    ) -> Result<Self> {
        let local_peer_id = local_peer_id.into();
        config.validate()?;
        validate_key("peer id", &local_peer_id)?;

        let (events, _) = broadcast::channel(config.event_buffer);
        info!("Created session coordinator for peer {}", local_peer_id);

        Ok(Self {
            local_peer_id,
            config,
            channel,
            transports,
            store,
            sequence: Arc::new(SequenceGenerator::new()),
            sessions: RwLock::new(HashMap::new()),
            events,
        })
    }

    pub fn local_peer_id(&self) -> &str {
        &self.local_peer_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Join a session: subscribe to the inbox, watch membership and
    /// announce the local peer
    ///
    /// # Errors
    ///
    /// - [`Error::SessionAlreadyJoined`] if the session is already joined
    /// - [`Error::InvalidConfig`] if the session id is not a valid relay key
    /// - the relay error if the announcement fails after retries
    #[instrument(skip(self), fields(peer = %self.local_peer_id))]
    pub async fn join(&self, session_id: &str) -> Result<()> {
        validate_key("session id", session_id)?;

        {
            let mut sessions = self.sessions.write().await;
            if sessions.contains_key(session_id) {
                return Err(Error::SessionAlreadyJoined(session_id.to_string()));
            }

            let handle = SessionWorker::spawn(WorkerSetup {
                session_id: session_id.to_string(),
                local_peer_id: self.local_peer_id.clone(),
                config: self.config.clone(),
                channel: self.channel.clone(),
                transports: self.transports.clone(),
                store: self.store.clone(),
                sequence: self.sequence.clone(),
                events: self.events.clone(),
            });
            sessions.insert(session_id.to_string(), handle);
        }

        let policy = ReconnectionPolicy::signaling(self.config.publish_retries);
        let announced = crate::peer::lifecycle::retry_transient(&policy, "Presence announce", || {
            self.channel.announce(session_id, &self.local_peer_id)
        })
        .await;

        if let Err(e) = announced {
            warn!("Failed to announce in session {}: {}", session_id, e);
            // dropping the handle stops the worker
            self.sessions.write().await.remove(session_id);
            return Err(e);
        }

        info!("Joined session {}", session_id);
        Ok(())
    }

    /// Leave a session: cancel retries, close every peer with BYE, release
    /// transports and withdraw presence
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionNotFound`] if the session is not joined.
    #[instrument(skip(self), fields(peer = %self.local_peer_id))]
    pub async fn leave(&self, session_id: &str) -> Result<()> {
        let mut handle = self
            .sessions
            .write()
            .await
            .remove(session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;

        handle
            .request(|reply| SessionCommand::Leave { reply })
            .await?;
        handle.join().await;
        Ok(())
    }

    /// Apply a local counter event and fan it out to the session's peers
    ///
    /// Peers that are not connected get it once they are; events that can
    /// never be delivered are reported as [`SessionEvent::Undeliverable`].
    /// Replaying an already applied event is a no-op.
    pub async fn broadcast_counter_event(&self, event: CounterEvent) -> Result<()> {
        let sessions = self.sessions.read().await;
        let handle = sessions
            .get(&event.session_id)
            .ok_or_else(|| Error::SessionNotFound(event.session_id.clone()))?;
        handle
            .request(|reply| SessionCommand::Broadcast { event, reply })
            .await?
    }

    /// Build a counter event for a local count action and broadcast it
    pub async fn record_local_count(&self, session_id: &str, delta: i64) -> Result<CounterEvent> {
        let event = CounterEvent::new(session_id, self.local_peer_id.clone(), delta);
        self.broadcast_counter_event(event.clone()).await?;
        Ok(event)
    }

    /// Snapshot of the remote peers of a session, ordered by peer id
    pub async fn peer_states(&self, session_id: &str) -> Result<Vec<PeerStatus>> {
        let sessions = self.sessions.read().await;
        let handle = sessions
            .get(session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        handle
            .request(|reply| SessionCommand::PeerStates { reply })
            .await
    }

    /// Running total of a session as recorded by the local store
    pub async fn current_total(&self, session_id: &str) -> Result<i64> {
        self.store.current_total(session_id).await
    }

    /// Subscribe to session events
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Session events as a [`Stream`](futures::Stream); lagging observers
    /// see `Err` items for the events they missed
    pub fn event_stream(&self) -> BroadcastStream<SessionEvent> {
        BroadcastStream::new(self.events.subscribe())
    }

    /// Ids of the joined sessions
    pub async fn joined_sessions(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn is_joined(&self, session_id: &str) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    /// Leave every joined session
    pub async fn shutdown(&self) {
        let ids = self.joined_sessions().await;
        info!("Shutting down {} sessions", ids.len());
        for session_id in ids {
            if let Err(e) = self.leave(&session_id).await {
                warn!("Failed to leave session {}: {}", session_id, e);
            }
        }
    }
}
