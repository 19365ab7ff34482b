//! Session coordination
//!
//! [`SessionCoordinator`] is the public entry point. Each joined session is
//! run by its own worker task; the coordinator only routes calls to it.

pub mod coordinator;
#[allow(clippy::module_inception)]
pub mod session;
mod worker;

pub use coordinator::SessionCoordinator;
pub use session::{PeerId, PeerStatus, Session, SessionId};
