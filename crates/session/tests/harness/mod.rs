//! Multi-peer session test harness
//!
//! Every peer gets its own [`SessionCoordinator`] and [`MemoryCounterStore`];
//! all of them share one [`MemoryRelay`] and one [`LoopbackNetwork`], so
//! the relay's fault injection and the network's partitions apply to the
//! whole scenario. Session events of each peer are recorded in order.
//!
//! Tests run with paused tokio time, so waits cost no wall-clock time.

#![allow(dead_code)]

use cloudcounter_session::{
    LoopbackNetwork, MemoryCounterStore, MemoryRelay, PeerState, PeerStatus, ReconnectConfig,
    SessionConfig, SessionCoordinator, SessionEvent,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::info;

pub const SESSION: &str = "S1";

/// Result type for harness operations
pub type HarnessResult<T> = Result<T, HarnessError>;

/// Error type for harness operations
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Session error: {0}")]
    Session(#[from] cloudcounter_session::Error),
}

/// Initialize test logging (safe to call from every test)
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,cloudcounter_session=debug")
        .with_test_writer()
        .try_init();
}

/// Default timings with deterministic backoff
pub fn test_config() -> SessionConfig {
    SessionConfig {
        event_buffer: 4096,
        reconnect: ReconnectConfig {
            jitter_enabled: false,
            ..ReconnectConfig::default()
        },
        ..SessionConfig::default()
    }
}

/// One device taking part in a scenario
pub struct TestPeer {
    pub id: String,
    pub coordinator: Arc<SessionCoordinator>,
    pub store: Arc<MemoryCounterStore>,
    events: Arc<Mutex<Vec<SessionEvent>>>,
}

impl TestPeer {
    /// Events observed so far, in emission order
    pub fn events(&self) -> Vec<SessionEvent> {
        self.events.lock().clone()
    }

    /// States `remote` went through, as observed by this peer
    pub fn states_of(&self, remote: &str) -> Vec<PeerState> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                SessionEvent::PeerStateChanged { peer_id, state, .. } if peer_id == remote => {
                    Some(*state)
                }
                _ => None,
            })
            .collect()
    }

    /// Number of recorded events matching `predicate`
    pub fn count_events(&self, predicate: impl Fn(&SessionEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| predicate(*e)).count()
    }

    pub async fn join(&self) -> HarnessResult<()> {
        self.coordinator.join(SESSION).await?;
        Ok(())
    }

    pub async fn leave(&self) -> HarnessResult<()> {
        self.coordinator.leave(SESSION).await?;
        Ok(())
    }

    pub async fn status_of(&self, remote: &str) -> Option<PeerStatus> {
        self.coordinator
            .peer_states(SESSION)
            .await
            .ok()?
            .into_iter()
            .find(|s| s.peer_id == remote)
    }

    pub async fn total(&self) -> i64 {
        self.coordinator.current_total(SESSION).await.unwrap_or(0)
    }
}

/// Shared relay + network with any number of peers
pub struct SessionHarness {
    pub relay: MemoryRelay,
    pub network: LoopbackNetwork,
    peers: HashMap<String, Arc<TestPeer>>,
}

impl SessionHarness {
    pub fn new() -> Self {
        init_logging();
        Self {
            relay: MemoryRelay::new(),
            network: LoopbackNetwork::new(),
            peers: HashMap::new(),
        }
    }

    /// Create a peer with the default test configuration
    pub fn add_peer(&mut self, peer_id: &str) -> Arc<TestPeer> {
        self.add_peer_with(peer_id, test_config())
    }

    pub fn add_peer_with(&mut self, peer_id: &str, config: SessionConfig) -> Arc<TestPeer> {
        info!("Creating test peer: {}", peer_id);
        let store = Arc::new(MemoryCounterStore::new());
        let coordinator = SessionCoordinator::new(
            peer_id,
            config,
            Arc::new(self.relay.clone()),
            Arc::new(self.network.clone()),
            store.clone(),
        )
        .expect("valid test configuration");

        let events = Arc::new(Mutex::new(Vec::new()));
        let mut rx = coordinator.events();
        let sink = events.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => sink.lock().push(event),
                    Err(RecvError::Lagged(n)) => tracing::warn!("event recorder lagged by {}", n),
                    Err(RecvError::Closed) => return,
                }
            }
        });

        let peer = Arc::new(TestPeer {
            id: peer_id.to_string(),
            coordinator: Arc::new(coordinator),
            store,
            events,
        });
        self.peers.insert(peer_id.to_string(), peer.clone());
        peer
    }

    /// Forget a peer without leaving, as a killed process would
    ///
    /// The coordinator stops once the caller drops its last handle too; no
    /// BYE is sent and the member record stays behind.
    pub fn crash(&mut self, peer_id: &str) {
        info!("Crashing test peer: {}", peer_id);
        self.peers.remove(peer_id);
    }

    pub fn peer(&self, peer_id: &str) -> Arc<TestPeer> {
        self.peers[peer_id].clone()
    }

    /// Wait until every pair of peers is connected in both directions
    pub async fn wait_for_mesh(&self, timeout: Duration) -> HarnessResult<()> {
        let ids: Vec<String> = self.peers.keys().cloned().collect();
        for a in &ids {
            for b in &ids {
                if a != b {
                    wait_for_state(&self.peers[a], b, PeerState::Connected, timeout).await?;
                }
            }
        }
        Ok(())
    }

    pub async fn shutdown(&self) {
        for peer in self.peers.values() {
            peer.coordinator.shutdown().await;
        }
    }
}

/// Poll `condition` every 20ms (virtual time) until it holds
pub async fn wait_until<F, Fut>(what: &str, timeout: Duration, mut condition: F) -> HarnessResult<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(HarnessError::Timeout(format!("{} within {:?}", what, timeout)));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Wait until `peer` sees `remote` in `state`
pub async fn wait_for_state(
    peer: &TestPeer,
    remote: &str,
    state: PeerState,
    timeout: Duration,
) -> HarnessResult<()> {
    let what = format!("{} sees {} {}", peer.id, remote, state);
    wait_until(&what, timeout, || async move {
        peer.status_of(remote).await.map(|s| s.state) == Some(state)
    })
    .await
}

/// Wait until the local total of `peer` reaches `total`
pub async fn wait_for_total(peer: &TestPeer, total: i64, timeout: Duration) -> HarnessResult<()> {
    let what = format!("{} reaches total {}", peer.id, total);
    wait_until(&what, timeout, || async move { peer.total().await == total }).await
}

/// Wait until `peer` recorded an event matching `predicate`
pub async fn wait_for_event(
    peer: &TestPeer,
    timeout: Duration,
    predicate: impl Fn(&SessionEvent) -> bool,
) -> HarnessResult<()> {
    let what = format!("{} observes the expected event", peer.id);
    let predicate = &predicate;
    wait_until(&what, timeout, || async move { peer.count_events(predicate) > 0 }).await
}
