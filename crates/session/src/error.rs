//! Error types for the session signaling core

/// Result type alias using the session Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while coordinating a counting session
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Signaling adapter I/O failure (publish, subscribe, presence)
    #[error("Transport error: {0}")]
    TransportError(String),

    /// No negotiation progress within the configured bound
    #[error("Negotiation timeout: {0}")]
    NegotiationTimeout(String),

    /// Malformed or out-of-sequence signaling message
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Remote peer explicitly left the session
    #[error("Peer left permanently: {0}")]
    PermanentLeave(String),

    /// Session not joined
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Session already joined by this coordinator
    #[error("Session already joined: {0}")]
    SessionAlreadyJoined(String),

    /// Peer not found in the session
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// Too many remote peers in one session
    #[error("Peer limit exceeded: {0}")]
    PeerLimitExceeded(String),

    /// SDP negotiation error
    #[error("SDP negotiation error: {0}")]
    SdpError(String),

    /// ICE candidate error
    #[error("ICE candidate error: {0}")]
    IceCandidateError(String),

    /// Data channel error
    #[error("Data channel error: {0}")]
    DataChannelError(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    /// Local counter store failure
    #[error("Store error: {0}")]
    StoreError(String),

    /// Counter event could not be delivered to a peer
    #[error("Undeliverable: {0}")]
    Undeliverable(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is transient and worth retrying with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::TransportError(_)
                | Error::NegotiationTimeout(_)
                | Error::WebRtcError(_)
                | Error::DataChannelError(_)
                | Error::IoError(_)
        )
    }

    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_))
    }

    /// Check if this error means the remote peer is gone for good
    pub fn is_permanent(&self) -> bool {
        matches!(self, Error::PermanentLeave(_))
    }

    /// Check if this error is a negotiation/peer-related error
    pub fn is_peer_error(&self) -> bool {
        matches!(
            self,
            Error::PeerNotFound(_)
                | Error::SdpError(_)
                | Error::IceCandidateError(_)
                | Error::ProtocolViolation(_)
                | Error::NegotiationTimeout(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::SerializationError(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::TransportError(e.to_string())
    }
}

impl From<webrtc::Error> for Error {
    fn from(e: webrtc::Error) -> Self {
        Error::WebRtcError(e.to_string())
    }
}
