//! Peer sessions and transports
//!
//! - [`PeerSession`]: per-peer negotiation state machine (pure, no I/O)
//! - [`PeerTransport`] / [`TransportFactory`]: transport seam
//! - [`WebRtcTransport`]: webrtc-rs data channel transport
//! - [`LoopbackNetwork`]: in-process transport for tests and demos
//! - [`ReconnectionSupervisor`]: backoff scheduling for failed peers

pub(crate) mod driver;
pub mod lifecycle;
pub mod loopback;
pub mod session;
pub mod state;
pub mod transport;
pub mod webrtc;

pub use driver::DriverReport;
pub use lifecycle::{ReconnectionPolicy, ReconnectionSupervisor, RetryDecision, RetryDue};
pub use loopback::{LoopbackNetwork, LoopbackTransport};
pub use session::{PeerAction, PeerSession, PeerTiming};
pub use state::{local_initiates, CloseReason, FailureReason, PeerState, Role};
pub use transport::{
    PeerFrame, PeerTransport, TransportCommand, TransportContext, TransportEvent,
    TransportEventSink, TransportFactory,
};
pub use self::webrtc::{WebRtcTransport, WebRtcTransportFactory};
