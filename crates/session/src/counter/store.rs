use super::CounterEvent;
use crate::{Error, Result, SessionId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

/// Result of appending an event to the local store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Event was new and changed the total
    Appended,
    /// Event id was already recorded; nothing changed
    DuplicateIgnored,
}

/// Durable local counter store (implemented by the host application)
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Record an event. Must be idempotent on `event.event_id`.
    async fn append_event(&self, event: &CounterEvent) -> Result<AppendOutcome>;

    /// Sum of all recorded deltas for a session
    async fn current_total(&self, session_id: &str) -> Result<i64>;
}

#[derive(Debug, Default)]
struct SessionLedger {
    total: i64,
    seen: HashSet<String>,
    events: Vec<CounterEvent>,
}

/// In-memory [`CounterStore`]
///
/// ```
/// use cloudcounter_session::{AppendOutcome, CounterEvent, CounterStore, MemoryCounterStore};
///
/// # tokio_test::block_on(async {
/// let store = MemoryCounterStore::new();
/// let event = CounterEvent::new("S1", "a", 2);
///
/// assert_eq!(store.append_event(&event).await?, AppendOutcome::Appended);
/// assert_eq!(store.append_event(&event).await?, AppendOutcome::DuplicateIgnored);
/// assert_eq!(store.current_total("S1").await?, 2);
/// # Ok::<(), cloudcounter_session::Error>(())
/// # });
/// ```
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    ledgers: Mutex<HashMap<SessionId, SessionLedger>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events recorded for a session, in append order
    pub fn events(&self, session_id: &str) -> Vec<CounterEvent> {
        self.ledgers
            .lock()
            .get(session_id)
            .map(|l| l.events.clone())
            .unwrap_or_default()
    }

    /// How many times an event id was applied (0 or 1)
    pub fn applied_count(&self, session_id: &str, event_id: &str) -> usize {
        self.ledgers
            .lock()
            .get(session_id)
            .map(|l| l.events.iter().filter(|e| e.event_id == event_id).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn append_event(&self, event: &CounterEvent) -> Result<AppendOutcome> {
        let mut ledgers = self.ledgers.lock();
        let ledger = ledgers.entry(event.session_id.clone()).or_default();

        if ledger.seen.contains(&event.event_id) {
            return Ok(AppendOutcome::DuplicateIgnored);
        }

        let total = ledger.total.checked_add(event.delta).ok_or_else(|| {
            Error::StoreError(format!(
                "event {} ({:+}) overflows the total of session {}",
                event.event_id, event.delta, event.session_id
            ))
        })?;

        ledger.seen.insert(event.event_id.clone());
        ledger.total = total;
        ledger.events.push(event.clone());
        Ok(AppendOutcome::Appended)
    }

    async fn current_total(&self, session_id: &str) -> Result<i64> {
        Ok(self
            .ledgers
            .lock()
            .get(session_id)
            .map(|l| l.total)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_is_idempotent() {
        let store = MemoryCounterStore::new();
        let event = CounterEvent::new("S1", "a", 1).with_event_id("e1");

        assert_eq!(store.append_event(&event).await.unwrap(), AppendOutcome::Appended);
        assert_eq!(
            store.append_event(&event).await.unwrap(),
            AppendOutcome::DuplicateIgnored
        );
        assert_eq!(store.current_total("S1").await.unwrap(), 1);
        assert_eq!(store.applied_count("S1", "e1"), 1);
    }

    #[tokio::test]
    async fn test_overflowing_delta_is_rejected() {
        let store = MemoryCounterStore::new();
        store
            .append_event(&CounterEvent::new("S1", "a", i64::MAX - 1).with_event_id("e1"))
            .await
            .unwrap();

        let overflow = CounterEvent::new("S1", "b", 2).with_event_id("e2");
        assert!(matches!(
            store.append_event(&overflow).await,
            Err(Error::StoreError(_))
        ));
        assert_eq!(store.current_total("S1").await.unwrap(), i64::MAX - 1);
        assert_eq!(store.applied_count("S1", "e2"), 0);

        // rejected ids are not remembered as applied
        store
            .append_event(&CounterEvent::new("S1", "a", -5).with_event_id("e3"))
            .await
            .unwrap();
        assert_eq!(store.append_event(&overflow).await.unwrap(), AppendOutcome::Appended);
        assert_eq!(store.current_total("S1").await.unwrap(), i64::MAX - 4);
    }

    #[tokio::test]
    async fn test_totals_are_per_session() {
        let store = MemoryCounterStore::new();
        store.append_event(&CounterEvent::new("S1", "a", 3)).await.unwrap();
        store.append_event(&CounterEvent::new("S1", "b", -1)).await.unwrap();
        store.append_event(&CounterEvent::new("S2", "a", 10)).await.unwrap();

        assert_eq!(store.current_total("S1").await.unwrap(), 2);
        assert_eq!(store.current_total("S2").await.unwrap(), 10);
        assert_eq!(store.current_total("S3").await.unwrap(), 0);
    }
}
