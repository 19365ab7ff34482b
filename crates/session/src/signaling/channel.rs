use super::SignalingMessage;
use crate::{Error, PeerId, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

/// Inbound signaling messages for one local peer
pub type SignalStream = BoxStream<'static, Result<SignalingMessage>>;

/// Membership changes for one session
pub type PresenceStream = BoxStream<'static, Result<PresenceEvent>>;

/// Session membership change observed through the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    Joined(PeerId),
    Left(PeerId),
}

impl PresenceEvent {
    pub fn peer_id(&self) -> &str {
        match self {
            PresenceEvent::Joined(peer) | PresenceEvent::Left(peer) => peer,
        }
    }
}

/// Relay used to exchange signaling messages and session membership
///
/// Delivery is at-least-once and unordered. Implementations validate raw
/// relay data at this boundary: malformed messages are yielded as
/// [`Error::ProtocolViolation`] items rather than ending the stream.
/// A stream that ends (or yields a transport error and ends) is expected
/// to be resubscribed by the caller.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Append a message to the recipient's inbox
    async fn publish(&self, session_id: &str, message: &SignalingMessage) -> Result<()>;

    /// Stream messages addressed to `peer_id` within `session_id`
    async fn subscribe(&self, session_id: &str, peer_id: &str) -> Result<SignalStream>;

    /// Register `peer_id` as a session member
    async fn announce(&self, session_id: &str, peer_id: &str) -> Result<()>;

    /// Refresh the member record of `peer_id`
    async fn heartbeat(&self, session_id: &str, peer_id: &str) -> Result<()>;

    /// Remove the member record of `peer_id`
    async fn withdraw(&self, session_id: &str, peer_id: &str) -> Result<()>;

    /// Stream membership changes, starting with a `Joined` for every current member
    ///
    /// A member whose record is not refreshed within `stale_after` is
    /// reported `Left`, and `Joined` again if it heartbeats later.
    async fn watch_members(&self, session_id: &str, stale_after: Duration) -> Result<PresenceStream>;
}

/// Raw member record activity observed by a relay adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberActivity {
    /// The record was written (announce or heartbeat)
    Seen(PeerId),
    /// The record was removed
    Removed(PeerId),
    /// Every record was removed
    Cleared,
}

/// Turns member activity into [`PresenceEvent`]s and expires silent members
#[derive(Debug)]
pub struct PresenceTracker {
    stale_after: Duration,
    last_seen: HashMap<PeerId, Instant>,
}

impl PresenceTracker {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            stale_after,
            last_seen: HashMap::new(),
        }
    }

    pub fn observe(&mut self, activity: MemberActivity, now: Instant) -> Vec<PresenceEvent> {
        match activity {
            MemberActivity::Seen(peer) => match self.last_seen.insert(peer.clone(), now) {
                None => vec![PresenceEvent::Joined(peer)],
                Some(_) => Vec::new(),
            },
            MemberActivity::Removed(peer) => match self.last_seen.remove(&peer) {
                Some(_) => vec![PresenceEvent::Left(peer)],
                None => Vec::new(),
            },
            MemberActivity::Cleared => {
                let mut gone: Vec<PeerId> = self.last_seen.drain().map(|(peer, _)| peer).collect();
                gone.sort();
                gone.into_iter().map(PresenceEvent::Left).collect()
            }
        }
    }

    /// Forget members silent for longer than `stale_after`, in id order
    pub fn expire(&mut self, now: Instant) -> Vec<PresenceEvent> {
        let mut stale: Vec<PeerId> = self
            .last_seen
            .iter()
            .filter(|(_, seen)| now.saturating_duration_since(**seen) > self.stale_after)
            .map(|(peer, _)| peer.clone())
            .collect();
        stale.sort();
        for peer in &stale {
            self.last_seen.remove(peer);
        }
        stale.into_iter().map(PresenceEvent::Left).collect()
    }

    pub fn sweep_interval(&self) -> Duration {
        (self.stale_after / 4).max(Duration::from_millis(100))
    }

    pub fn is_member(&self, peer_id: &str) -> bool {
        self.last_seen.contains_key(peer_id)
    }

    pub fn len(&self) -> usize {
        self.last_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_seen.is_empty()
    }
}

/// Presence stream over raw member activity, expiring members silent for `stale_after`
///
/// The stream ends when `activity` ends.
pub fn presence_stream(
    mut activity: mpsc::UnboundedReceiver<Result<MemberActivity>>,
    stale_after: Duration,
) -> PresenceStream {
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut tracker = PresenceTracker::new(stale_after);
        let mut sweep = tokio::time::interval(tracker.sweep_interval());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let events: Vec<Result<PresenceEvent>> = tokio::select! {
                _ = tx.closed() => return,
                item = activity.recv() => match item {
                    Some(Ok(activity)) => tracker
                        .observe(activity, Instant::now())
                        .into_iter()
                        .map(Ok)
                        .collect(),
                    Some(Err(e)) => vec![Err(e)],
                    None => return,
                },
                _ = sweep.tick() => {
                    let expired = tracker.expire(Instant::now());
                    for event in &expired {
                        debug!("Member {} stopped heartbeating", event.peer_id());
                    }
                    expired.into_iter().map(Ok).collect()
                }
            };

            if !events.into_iter().all(|event| tx.send(event).is_ok()) {
                return;
            }
        }
    });

    UnboundedReceiverStream::new(rx).boxed()
}

/// Relay path of a peer's inbox
pub fn inbox_path(session_id: &str, peer_id: &str) -> String {
    format!("sessions/{}/peers/{}/inbox", session_id, peer_id)
}

/// Relay path of a session's member records
pub fn members_path(session_id: &str) -> String {
    format!("sessions/{}/members", session_id)
}

/// Relay path of one member record
pub fn member_path(session_id: &str, peer_id: &str) -> String {
    format!("{}/{}", members_path(session_id), peer_id)
}

/// Check that an id can be used as a relay path segment
pub fn validate_key(kind: &str, key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidConfig(format!("{} must not be empty", kind)));
    }
    if key.len() > 768 {
        return Err(Error::InvalidConfig(format!(
            "{} exceeds 768 bytes",
            kind
        )));
    }
    if let Some(c) = key
        .chars()
        .find(|c| matches!(c, '.' | '$' | '#' | '[' | ']' | '/') || c.is_control())
    {
        return Err(Error::InvalidConfig(format!(
            "{} '{}' contains forbidden character {:?}",
            kind, key, c
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        assert_eq!(inbox_path("S1", "a"), "sessions/S1/peers/a/inbox");
        assert_eq!(members_path("S1"), "sessions/S1/members");
        assert_eq!(member_path("S1", "b"), "sessions/S1/members/b");
    }

    #[test]
    fn test_validate_key() {
        assert!(validate_key("peer id", "device-42").is_ok());
        assert!(validate_key("peer id", "").is_err());
        assert!(validate_key("session id", "a/b").is_err());
        assert!(validate_key("session id", "a.b").is_err());
        assert!(validate_key("session id", "a#b").is_err());
    }

    #[test]
    fn test_tracker_joins_once_and_expires_silent_members() {
        let mut tracker = PresenceTracker::new(Duration::from_secs(30));
        let start = Instant::now();

        assert_eq!(
            tracker.observe(MemberActivity::Seen("b".into()), start),
            vec![PresenceEvent::Joined("b".into())]
        );
        assert_eq!(
            tracker.observe(MemberActivity::Seen("c".into()), start),
            vec![PresenceEvent::Joined("c".into())]
        );

        // heartbeat refreshes b only
        let later = start + Duration::from_secs(20);
        assert!(tracker.observe(MemberActivity::Seen("b".into()), later).is_empty());

        assert!(tracker.expire(start + Duration::from_secs(30)).is_empty());
        assert_eq!(
            tracker.expire(start + Duration::from_secs(31)),
            vec![PresenceEvent::Left("c".into())]
        );
        assert!(tracker.is_member("b"));
        assert!(!tracker.is_member("c"));

        // a late heartbeat brings c back
        assert_eq!(
            tracker.observe(MemberActivity::Seen("c".into()), start + Duration::from_secs(40)),
            vec![PresenceEvent::Joined("c".into())]
        );
    }

    #[test]
    fn test_tracker_removals() {
        let mut tracker = PresenceTracker::new(Duration::from_secs(30));
        let now = Instant::now();
        for peer in ["c", "a", "b"] {
            tracker.observe(MemberActivity::Seen(peer.into()), now);
        }

        assert_eq!(
            tracker.observe(MemberActivity::Removed("a".into()), now),
            vec![PresenceEvent::Left("a".into())]
        );
        assert!(tracker.observe(MemberActivity::Removed("a".into()), now).is_empty());
        assert_eq!(
            tracker.observe(MemberActivity::Cleared, now),
            vec![
                PresenceEvent::Left("b".into()),
                PresenceEvent::Left("c".into())
            ]
        );
        assert!(tracker.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_presence_stream_reports_silence() {
        let (activity, rx) = mpsc::unbounded_channel();
        let mut presence = presence_stream(rx, Duration::from_secs(30));

        activity.send(Ok(MemberActivity::Seen("b".into()))).unwrap();
        assert_eq!(
            presence.next().await.unwrap().unwrap(),
            PresenceEvent::Joined("b".into())
        );

        // no heartbeat: the sweep reports b gone after the timeout
        let started = Instant::now();
        assert_eq!(
            presence.next().await.unwrap().unwrap(),
            PresenceEvent::Left("b".into())
        );
        assert!(started.elapsed() >= Duration::from_secs(30));

        drop(activity);
        assert!(presence.next().await.is_none());
    }

    #[test]
    fn test_presence_peer_id() {
        assert_eq!(PresenceEvent::Joined("a".into()).peer_id(), "a");
        assert_eq!(PresenceEvent::Left("b".into()).peer_id(), "b");
    }
}
