use std::collections::{HashSet, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

/// Bounded memory of recently applied counter event ids
///
/// Entries are evicted oldest-first once `capacity` is exceeded, and, when a
/// window is configured, once they are older than the window.
#[derive(Debug)]
pub struct RecentEventCache {
    capacity: usize,
    window: Option<Duration>,
    order: VecDeque<(String, Instant)>,
    seen: HashSet<String>,
}

impl RecentEventCache {
    pub fn new(capacity: usize, window: Option<Duration>) -> Self {
        Self {
            capacity: capacity.max(1),
            window,
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    /// Remember `event_id`. Returns `false` when it was already remembered.
    pub fn insert(&mut self, event_id: &str, now: Instant) -> bool {
        self.evict_expired(now);

        if self.seen.contains(event_id) {
            return false;
        }

        self.seen.insert(event_id.to_string());
        self.order.push_back((event_id.to_string(), now));

        while self.order.len() > self.capacity {
            if let Some((oldest, _)) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }

        true
    }

    /// Forget `event_id` so a redelivery is applied again
    pub fn remove(&mut self, event_id: &str) -> bool {
        if !self.seen.remove(event_id) {
            return false;
        }
        self.order.retain(|(id, _)| id != event_id);
        true
    }

    pub fn contains(&self, event_id: &str) -> bool {
        self.seen.contains(event_id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn evict_expired(&mut self, now: Instant) {
        let Some(window) = self.window else {
            return;
        };

        while let Some((id, at)) = self.order.front() {
            if now.saturating_duration_since(*at) <= window {
                break;
            }
            self.seen.remove(id);
            self.order.pop_front();
        }
    }
}
