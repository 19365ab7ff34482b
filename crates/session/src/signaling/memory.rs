//! In-process signaling relay
//!
//! Behaves like the hosted relay (per-peer inboxes that persist until read,
//! member records, presence notifications) and adds fault injection for
//! tests: duplicated delivery, held-then-reordered delivery and failing
//! publishes. Messages are stored as raw JSON so subscribers go through the
//! same validation path as the hosted relay.

use super::channel::{
    inbox_path, presence_stream, MemberActivity, PresenceStream, SignalStream, SignalingChannel,
};
use super::SignalingMessage;
use crate::{Error, PeerId, Result, SessionId};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, trace};

type SignalSender = mpsc::UnboundedSender<Result<SignalingMessage>>;
type ActivitySender = mpsc::UnboundedSender<Result<MemberActivity>>;

#[derive(Default)]
struct RelayState {
    subscribers: HashMap<String, Vec<SignalSender>>,
    backlog: HashMap<String, Vec<serde_json::Value>>,
    members: HashMap<SessionId, BTreeSet<PeerId>>,
    watchers: HashMap<SessionId, Vec<ActivitySender>>,
    heartbeats: HashMap<(SessionId, PeerId), u64>,
    duplicate: bool,
    holding: bool,
    held: Vec<(String, serde_json::Value)>,
    fail_publishes: u32,
    published: Vec<SignalingMessage>,
}

impl RelayState {
    fn deliver(&mut self, path: &str, value: serde_json::Value) {
        let copies = if self.duplicate { 2 } else { 1 };

        let subscribers = self.subscribers.entry(path.to_string()).or_default();
        subscribers.retain(|tx| !tx.is_closed());

        if subscribers.is_empty() {
            let backlog = self.backlog.entry(path.to_string()).or_default();
            for _ in 0..copies {
                backlog.push(value.clone());
            }
            return;
        }

        for tx in subscribers.iter() {
            for _ in 0..copies {
                let _ = tx.send(SignalingMessage::from_value(value.clone()));
            }
        }
    }

    fn notify(&mut self, session_id: &str, activity: MemberActivity) {
        if let Some(watchers) = self.watchers.get_mut(session_id) {
            watchers.retain(|tx| tx.send(Ok(activity.clone())).is_ok());
        }
    }
}

/// In-memory [`SignalingChannel`] shared by every peer of a test
#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver every subsequent message twice
    pub fn set_duplicate_delivery(&self, enabled: bool) {
        self.state.lock().duplicate = enabled;
    }

    /// Hold subsequent messages until [`release`](Self::release) or
    /// [`release_reversed`](Self::release_reversed)
    pub fn hold(&self) {
        self.state.lock().holding = true;
    }

    /// Deliver held messages in publish order and stop holding
    pub fn release(&self) {
        let mut state = self.state.lock();
        state.holding = false;
        let held = std::mem::take(&mut state.held);
        for (path, value) in held {
            state.deliver(&path, value);
        }
    }

    /// Deliver held messages newest first and stop holding
    pub fn release_reversed(&self) {
        let mut state = self.state.lock();
        state.holding = false;
        let held = std::mem::take(&mut state.held);
        for (path, value) in held.into_iter().rev() {
            state.deliver(&path, value);
        }
    }

    /// Number of messages currently held back
    pub fn held_count(&self) -> usize {
        self.state.lock().held.len()
    }

    /// Fail the next `count` publishes with a transport error
    pub fn fail_next_publishes(&self, count: u32) {
        self.state.lock().fail_publishes = count;
    }

    /// Write raw JSON into an inbox, bypassing validation on the sending side
    pub fn inject_raw(&self, session_id: &str, peer_id: &str, value: serde_json::Value) {
        self.state.lock().deliver(&inbox_path(session_id, peer_id), value);
    }

    /// Every message accepted by [`publish`](SignalingChannel::publish), in order
    pub fn published(&self) -> Vec<SignalingMessage> {
        self.state.lock().published.clone()
    }

    /// Published messages of one wire type between two peers
    pub fn published_between(&self, from: &str, to: &str, type_name: &str) -> usize {
        self.state
            .lock()
            .published
            .iter()
            .filter(|m| m.from == from && m.to == to && m.type_name() == type_name)
            .count()
    }

    /// Current members of a session
    pub fn members(&self, session_id: &str) -> Vec<PeerId> {
        self.state
            .lock()
            .members
            .get(session_id)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Heartbeats received for a member
    pub fn heartbeat_count(&self, session_id: &str, peer_id: &str) -> u64 {
        self.state
            .lock()
            .heartbeats
            .get(&(session_id.to_string(), peer_id.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// End every inbox subscription, as a dropped relay connection would
    pub fn drop_subscriptions(&self) {
        self.state.lock().subscribers.clear();
    }
}

#[async_trait]
impl SignalingChannel for MemoryRelay {
    async fn publish(&self, session_id: &str, message: &SignalingMessage) -> Result<()> {
        let value = message.to_value()?;
        let path = inbox_path(session_id, &message.to);

        let mut state = self.state.lock();
        if state.fail_publishes > 0 {
            state.fail_publishes -= 1;
            return Err(Error::TransportError("relay unavailable".to_string()));
        }

        trace!(
            "relay: {} {} -> {} (seq {})",
            message.type_name(),
            message.from,
            message.to,
            message.seq
        );
        state.published.push(message.clone());

        if state.holding {
            state.held.push((path, value));
        } else {
            state.deliver(&path, value);
        }
        Ok(())
    }

    async fn subscribe(&self, session_id: &str, peer_id: &str) -> Result<SignalStream> {
        let path = inbox_path(session_id, peer_id);
        let (tx, rx) = mpsc::unbounded_channel();

        let mut state = self.state.lock();
        if let Some(backlog) = state.backlog.remove(&path) {
            debug!("relay: replaying {} stored messages to {}", backlog.len(), path);
            for value in backlog {
                let _ = tx.send(SignalingMessage::from_value(value));
            }
        }
        state.subscribers.entry(path).or_default().push(tx);

        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn announce(&self, session_id: &str, peer_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        state
            .members
            .entry(session_id.to_string())
            .or_default()
            .insert(peer_id.to_string());
        state.notify(session_id, MemberActivity::Seen(peer_id.to_string()));
        Ok(())
    }

    async fn heartbeat(&self, session_id: &str, peer_id: &str) -> Result<()> {
        {
            let mut state = self.state.lock();
            *state
                .heartbeats
                .entry((session_id.to_string(), peer_id.to_string()))
                .or_default() += 1;
        }
        self.announce(session_id, peer_id).await
    }

    async fn withdraw(&self, session_id: &str, peer_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        let removed = state
            .members
            .get_mut(session_id)
            .map(|m| m.remove(peer_id))
            .unwrap_or(false);
        if removed {
            state.notify(session_id, MemberActivity::Removed(peer_id.to_string()));
        }
        Ok(())
    }

    async fn watch_members(&self, session_id: &str, stale_after: Duration) -> Result<PresenceStream> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut state = self.state.lock();
        if let Some(members) = state.members.get(session_id) {
            for member in members {
                let _ = tx.send(Ok(MemberActivity::Seen(member.clone())));
            }
        }
        state
            .watchers
            .entry(session_id.to_string())
            .or_default()
            .push(tx);

        Ok(presence_stream(rx, stale_after))
    }
}
