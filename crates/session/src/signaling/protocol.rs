//! Signaling message types and the relay wire envelope
//!
//! The relay stores loosely-typed JSON. Everything that crosses the adapter
//! boundary is validated into a [`SignalingMessage`]; anything else becomes
//! an [`Error::ProtocolViolation`].

use crate::{Error, PeerId, Result, SessionId};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Wire `type` tag for SDP offers
pub const TYPE_OFFER: &str = "offer";
/// Wire `type` tag for SDP answers
pub const TYPE_ANSWER: &str = "answer";
/// Wire `type` tag for trickled ICE candidates
pub const TYPE_ICE_CANDIDATE: &str = "ice_candidate";
/// Wire `type` tag for session teardown
pub const TYPE_BYE: &str = "bye";

/// A trickled ICE candidate
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IceCandidate {
    /// ICE candidate string
    pub candidate: String,

    /// SDP media stream identification
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,

    /// SDP media line index number
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

/// Negotiation payload of a signaling message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// SDP offer
    Offer { sdp: String },
    /// SDP answer
    Answer { sdp: String },
    /// Trickled ICE candidate
    IceCandidate(IceCandidate),
    /// Sender is tearing the peer session down
    Bye { reason: Option<String> },
}

impl Signal {
    /// Wire `type` tag
    pub fn type_name(&self) -> &'static str {
        match self {
            Signal::Offer { .. } => TYPE_OFFER,
            Signal::Answer { .. } => TYPE_ANSWER,
            Signal::IceCandidate(_) => TYPE_ICE_CANDIDATE,
            Signal::Bye { .. } => TYPE_BYE,
        }
    }

    fn to_payload(&self) -> Result<String> {
        Ok(match self {
            Signal::Offer { sdp } | Signal::Answer { sdp } => sdp.clone(),
            Signal::IceCandidate(candidate) => serde_json::to_string(candidate)?,
            Signal::Bye { reason } => reason.clone().unwrap_or_default(),
        })
    }

    fn from_payload(kind: &str, payload: String) -> Result<Self> {
        match kind {
            TYPE_OFFER | TYPE_ANSWER if payload.is_empty() => Err(Error::ProtocolViolation(
                format!("{} without SDP payload", kind),
            )),
            TYPE_OFFER => Ok(Signal::Offer { sdp: payload }),
            TYPE_ANSWER => Ok(Signal::Answer { sdp: payload }),
            TYPE_ICE_CANDIDATE => {
                let candidate: IceCandidate = serde_json::from_str(&payload).map_err(|e| {
                    Error::ProtocolViolation(format!("Invalid ICE candidate payload: {}", e))
                })?;
                if candidate.candidate.is_empty() {
                    return Err(Error::ProtocolViolation(
                        "ICE candidate payload without candidate line".to_string(),
                    ));
                }
                Ok(Signal::IceCandidate(candidate))
            }
            TYPE_BYE => Ok(Signal::Bye {
                reason: (!payload.is_empty()).then_some(payload),
            }),
            other => Err(Error::ProtocolViolation(format!(
                "Unknown signaling message type: {}",
                other
            ))),
        }
    }
}

/// Validated signaling message exchanged through the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingMessage {
    /// Session the message belongs to
    pub session_id: SessionId,
    /// Sender peer ID
    pub from: PeerId,
    /// Recipient peer ID
    pub to: PeerId,
    /// Sequence hint, monotonic per sender
    pub seq: u64,
    /// Sender wall-clock time in milliseconds
    pub ts: u64,
    /// Negotiation payload
    pub signal: Signal,
}

/// Raw message shape stored under `sessions/{sessionId}/peers/{peerId}/inbox`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireEnvelope {
    /// Message type tag
    #[serde(rename = "type")]
    pub kind: String,

    /// Session ID
    pub session: String,

    /// Sender peer ID
    pub from: String,

    /// Recipient peer ID
    pub to: String,

    /// Opaque payload (SDP, candidate JSON, bye reason)
    #[serde(default)]
    pub payload: String,

    /// Sender sequence hint
    pub seq: u64,

    /// Sender timestamp in milliseconds
    #[serde(default)]
    pub ts: u64,
}

impl SignalingMessage {
    /// Convert to the relay wire envelope
    pub fn to_wire(&self) -> Result<WireEnvelope> {
        Ok(WireEnvelope {
            kind: self.signal.type_name().to_string(),
            session: self.session_id.clone(),
            from: self.from.clone(),
            to: self.to.clone(),
            payload: self.signal.to_payload()?,
            seq: self.seq,
            ts: self.ts,
        })
    }

    /// Validate a wire envelope
    pub fn from_wire(envelope: WireEnvelope) -> Result<Self> {
        for (field, value) in [
            ("session", &envelope.session),
            ("from", &envelope.from),
            ("to", &envelope.to),
        ] {
            if value.is_empty() {
                return Err(Error::ProtocolViolation(format!(
                    "Signaling message with empty '{}'",
                    field
                )));
            }
        }

        let signal = Signal::from_payload(&envelope.kind, envelope.payload)?;

        Ok(Self {
            session_id: envelope.session,
            from: envelope.from,
            to: envelope.to,
            seq: envelope.seq,
            ts: envelope.ts,
            signal,
        })
    }

    /// Validate an arbitrary JSON value read from the relay
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let envelope: WireEnvelope = serde_json::from_value(value).map_err(|e| {
            Error::ProtocolViolation(format!("Malformed signaling envelope: {}", e))
        })?;
        Self::from_wire(envelope)
    }

    /// Convert to a JSON value for the relay
    pub fn to_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self.to_wire()?)?)
    }

    /// Convert message to JSON string
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(&self.to_wire()?).map_err(|e| {
            Error::SerializationError(format!("Failed to serialize signaling message: {}", e))
        })
    }

    /// Parse message from JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(json).map_err(|e| {
            Error::ProtocolViolation(format!("Signaling message is not JSON: {}", e))
        })?;
        Self::from_value(value)
    }

    /// Wire `type` tag of this message
    pub fn type_name(&self) -> &'static str {
        self.signal.type_name()
    }
}

/// Sequence hints for outgoing signaling messages
///
/// Seeded from wall-clock microseconds so hints keep increasing across
/// process restarts of the same device.
#[derive(Debug)]
pub struct SequenceGenerator {
    next: AtomicU64,
}

impl SequenceGenerator {
    pub fn new() -> Self {
        Self::starting_at(crate::events::current_timestamp_us())
    }

    pub fn starting_at(seed: u64) -> Self {
        Self {
            next: AtomicU64::new(seed),
        }
    }

    /// Next sequence hint (strictly increasing)
    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl Default for SequenceGenerator {
    fn default() -> Self {
        Self::new()
    }
}
