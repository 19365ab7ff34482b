//! Counter events, deduplication and the local store boundary
//!
//! Counter events are the only application payload carried between peers.
//! Each event is applied at most once per destination: the session worker
//! filters replays through a [`RecentEventCache`] and the [`CounterStore`]
//! is itself idempotent on `event_id`.

mod dedup;
mod event;
mod store;

pub use dedup::RecentEventCache;
pub use event::CounterEvent;
pub use store::{AppendOutcome, CounterStore, MemoryCounterStore};
