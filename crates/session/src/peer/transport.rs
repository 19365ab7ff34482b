//! Seam between the peer session state machine and a concrete transport
//!
//! A [`PeerTransport`] owns one peer connection with one reliable data
//! channel. Asynchronous happenings (gathered candidates, channel open,
//! inbound data) are reported through a [`TransportEventSink`] so that they
//! are serialized with every other input of the owning session.

use crate::counter::CounterEvent;
use crate::signaling::IceCandidate;
use crate::{Error, PeerId, Result, SessionId};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Event reported by a transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A local ICE candidate was gathered and should be trickled
    LocalCandidate(IceCandidate),
    /// The data channel is open
    Connected,
    /// Connectivity was lost (may recover)
    Disconnected,
    /// The connection failed for good
    Failed(String),
    /// Bytes received on the data channel
    Data(Bytes),
}

impl TransportEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TransportEvent::LocalCandidate(_) => "local_candidate",
            TransportEvent::Connected => "connected",
            TransportEvent::Disconnected => "disconnected",
            TransportEvent::Failed(_) => "failed",
            TransportEvent::Data(_) => "data",
        }
    }
}

/// Callback handle given to a transport for reporting [`TransportEvent`]s
#[derive(Clone)]
pub struct TransportEventSink {
    emit: Arc<dyn Fn(TransportEvent) + Send + Sync>,
}

impl TransportEventSink {
    pub fn new<F>(emit: F) -> Self
    where
        F: Fn(TransportEvent) + Send + Sync + 'static,
    {
        Self {
            emit: Arc::new(emit),
        }
    }

    /// Sink backed by an unbounded channel
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Self::new(move |event| {
            let _ = tx.send(event);
        });
        (sink, rx)
    }

    pub fn emit(&self, event: TransportEvent) {
        (self.emit)(event)
    }
}

impl fmt::Debug for TransportEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportEventSink").finish_non_exhaustive()
    }
}

/// Everything a factory needs to open a transport towards one peer
#[derive(Debug, Clone)]
pub struct TransportContext {
    pub session_id: SessionId,
    pub local_peer_id: PeerId,
    pub remote_peer_id: PeerId,
    pub events: TransportEventSink,
}

/// One peer connection with a reliable, ordered data channel
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Create the data channel and a local offer; returns the offer SDP
    async fn create_offer(&self) -> Result<String>;

    /// Apply a remote offer and create the answer; returns the answer SDP
    async fn accept_offer(&self, offer_sdp: &str) -> Result<String>;

    /// Apply the remote answer to our offer
    async fn apply_answer(&self, answer_sdp: &str) -> Result<()>;

    /// Add a remote ICE candidate (only after a remote description is set)
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()>;

    /// Discard the pending local offer (lost glare)
    async fn rollback(&self) -> Result<()>;

    /// Send bytes on the data channel
    async fn send(&self, data: Bytes) -> Result<()>;

    /// Release all resources
    async fn close(&self) -> Result<()>;
}

/// Creates transports for new peer incarnations
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self, context: TransportContext) -> Result<Box<dyn PeerTransport>>;
}

/// Operation executed on the transport, in order, by the peer driver
#[derive(Debug, Clone, PartialEq)]
pub enum TransportCommand {
    CreateOffer,
    AcceptOffer(String),
    ApplyAnswer(String),
    AddCandidate(IceCandidate),
    Rollback,
    SendFrame(PeerFrame),
    Close,
}

impl TransportCommand {
    pub fn name(&self) -> &'static str {
        match self {
            TransportCommand::CreateOffer => "create_offer",
            TransportCommand::AcceptOffer(_) => "accept_offer",
            TransportCommand::ApplyAnswer(_) => "apply_answer",
            TransportCommand::AddCandidate(_) => "add_candidate",
            TransportCommand::Rollback => "rollback",
            TransportCommand::SendFrame(_) => "send_frame",
            TransportCommand::Close => "close",
        }
    }
}

/// Application frame carried on the data channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PeerFrame {
    /// Counter event broadcast
    Counter { event: CounterEvent },
    /// Liveness probe
    Heartbeat { ts: u64 },
}

impl PeerFrame {
    pub fn heartbeat() -> Self {
        PeerFrame::Heartbeat {
            ts: crate::events::current_timestamp_ms(),
        }
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| Error::ProtocolViolation(format!("Malformed peer frame: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_wire_shape() {
        let event = CounterEvent::new("S1", "a", 1).with_event_id("e1");
        let bytes = PeerFrame::Counter {
            event: event.clone(),
        }
        .to_bytes()
        .unwrap();

        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["kind"], "counter");
        assert_eq!(value["event"]["event_id"], "e1");

        assert_eq!(
            PeerFrame::from_bytes(&bytes).unwrap(),
            PeerFrame::Counter { event }
        );
    }

    #[test]
    fn test_malformed_frame() {
        assert!(matches!(
            PeerFrame::from_bytes(b"{\"kind\":\"launch\"}"),
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_channel_sink() {
        let (sink, mut rx) = TransportEventSink::channel();
        sink.emit(TransportEvent::Connected);
        sink.clone().emit(TransportEvent::Disconnected);

        assert_eq!(rx.recv().await, Some(TransportEvent::Connected));
        assert_eq!(rx.recv().await, Some(TransportEvent::Disconnected));
    }
}
