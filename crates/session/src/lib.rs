//! Session signaling and peer coordination for CloudCounter
//!
//! Devices sharing a counting session exchange counter increments over
//! WebRTC data channels. Connections are negotiated through a best-effort
//! realtime database used as the signaling relay.
//!
//! # Features
//!
//! - **Per-peer state machine**: offer/answer/ICE negotiation with glare
//!   resolution (the smaller peer id initiates)
//! - **Ordering over an unordered relay**: sequence hints filter stale
//!   negotiation messages; early ICE candidates are buffered
//! - **Reconnection**: exponential backoff with jitter, one pending retry
//!   per peer, cancelled on leave or rejoin
//! - **Exactly-once counters**: events are deduplicated by id before they
//!   reach the local store
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  SessionCoordinator                                      │
//! │  └─ per session: worker task (single ordered queue)      │
//! │     ├─ PeerSession state machines (one per remote peer)  │
//! │     ├─ ReconnectionSupervisor                            │
//! │     ├─ RecentEventCache → CounterStore                   │
//! │     └─ per incarnation: driver task                      │
//! │        ├─ PeerTransport (WebRTC / loopback)              │
//! │        └─ SignalingChannel publishes                     │
//! │  SignalingChannel (Realtime Database / in-memory relay)  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use cloudcounter_session::{
//!     MemoryCounterStore, RealtimeDbChannel, RealtimeDbConfig, SessionConfig,
//!     SessionCoordinator, WebRtcTransportFactory,
//! };
//! use std::sync::Arc;
//!
//! let config = SessionConfig::mobile_network_preset();
//! let channel = RealtimeDbChannel::new(
//!     RealtimeDbConfig::new("https://counter.firebaseio.com").with_auth_token(token),
//! )?;
//!
//! let coordinator = SessionCoordinator::new(
//!     device_id,
//!     config.clone(),
//!     Arc::new(channel),
//!     Arc::new(WebRtcTransportFactory::new(&config.ice)),
//!     Arc::new(MemoryCounterStore::new()),
//! )?;
//!
//! coordinator.join("S1").await?;
//! coordinator.record_local_count("S1", 1).await?;
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod counter;
pub mod error;
pub mod events;
pub mod peer;
pub mod session;
pub mod signaling;

pub use config::{IceConfig, ReconnectConfig, SessionConfig, TurnServerConfig};
pub use counter::{AppendOutcome, CounterEvent, CounterStore, MemoryCounterStore, RecentEventCache};
pub use error::{Error, Result};
pub use events::SessionEvent;
pub use peer::{
    CloseReason, FailureReason, LoopbackNetwork, PeerState, PeerTransport, ReconnectionPolicy,
    Role, TransportFactory, WebRtcTransportFactory,
};
pub use session::{PeerId, PeerStatus, SessionCoordinator, SessionId};
pub use signaling::{
    MemoryRelay, RealtimeDbChannel, RealtimeDbConfig, SignalingChannel, SignalingMessage,
};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
