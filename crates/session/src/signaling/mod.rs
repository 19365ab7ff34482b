//! Signaling relay abstraction
//!
//! Peers never talk to each other before a transport exists, so offers,
//! answers, ICE candidates and BYEs travel through a shared relay: per-peer
//! inboxes plus a member list per session.
//!
//! - [`SignalingChannel`]: relay contract used by the session workers
//! - [`RealtimeDbChannel`]: Firebase Realtime Database REST + SSE adapter
//! - [`MemoryRelay`]: in-process relay with fault injection

pub mod channel;
pub mod firebase;
pub mod memory;
pub mod protocol;

pub use channel::{
    inbox_path, member_path, members_path, presence_stream, validate_key, MemberActivity,
    PresenceEvent, PresenceStream, PresenceTracker, SignalStream, SignalingChannel,
};
pub use firebase::{RealtimeDbChannel, RealtimeDbConfig};
pub use memory::MemoryRelay;
pub use protocol::{IceCandidate, SequenceGenerator, Signal, SignalingMessage, WireEnvelope};
