//! Reconnection with exponential backoff
//!
//! [`ReconnectionPolicy`] computes delays; [`ReconnectionSupervisor`] owns the
//! per-peer retry bookkeeping of one session and schedules exactly one
//! pending retry per failed peer. Due retries are delivered as [`RetryDue`]
//! messages on the session's own queue so they are serialized with every
//! other session input.

use crate::config::ReconnectConfig;
use crate::PeerId;
use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Reconnection policy configuration
///
/// Controls how reconnection attempts are made when a peer connection fails.
#[derive(Debug, Clone)]
pub struct ReconnectionPolicy {
    /// Maximum number of reconnection attempts (`None` = unlimited)
    pub max_retries: Option<u32>,
    /// Initial backoff delay in milliseconds (default: 1000ms)
    pub backoff_initial_ms: u64,
    /// Maximum backoff delay in milliseconds (default: 30000ms)
    pub backoff_max_ms: u64,
    /// Backoff multiplier (default: 2.0)
    pub backoff_multiplier: f64,
    /// Whether to add jitter to backoff (default: true)
    pub jitter_enabled: bool,
}

impl Default for ReconnectionPolicy {
    fn default() -> Self {
        Self::from(&ReconnectConfig::default())
    }
}

impl From<&ReconnectConfig> for ReconnectionPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff_initial_ms: config.backoff_initial_ms,
            backoff_max_ms: config.backoff_max_ms,
            backoff_multiplier: config.backoff_multiplier,
            jitter_enabled: config.jitter_enabled,
        }
    }
}

impl ReconnectionPolicy {
    /// Short, bounded retries for individual signaling publishes
    pub fn signaling(max_retries: u32) -> Self {
        Self {
            max_retries: Some(max_retries),
            backoff_initial_ms: 200,
            backoff_max_ms: 2000,
            backoff_multiplier: 2.0,
            jitter_enabled: true,
        }
    }

    /// Calculate backoff duration for a given attempt number
    ///
    /// Exponential growth plus up to 25% jitter, capped at `backoff_max_ms`.
    ///
    /// # Arguments
    /// * `attempt` - Current attempt number (0-indexed)
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let backoff_ms =
            (self.backoff_initial_ms as f64) * self.backoff_multiplier.powi(exponent);

        let with_jitter = if self.jitter_enabled && backoff_ms.is_finite() && backoff_ms > 0.0 {
            backoff_ms + rand::thread_rng().gen_range(0.0..=backoff_ms * 0.25)
        } else {
            backoff_ms
        };

        // Clamp after jitter so the cap holds
        let final_ms = with_jitter.min(self.backoff_max_ms as f64);

        Duration::from_millis(final_ms as u64)
    }

    /// Check if more retries are allowed
    pub fn should_retry(&self, attempt: u32) -> bool {
        match self.max_retries {
            Some(max) => attempt < max,
            None => true,
        }
    }
}

/// A scheduled retry became due
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryDue {
    pub peer_id: PeerId,
    /// 1-based attempt number
    pub attempt: u32,
}

/// Outcome of [`ReconnectionSupervisor::schedule`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// A retry will become due after `delay`
    Scheduled { attempt: u32, delay: Duration },
    /// A retry was already pending; nothing new was scheduled
    AlreadyPending { attempt: u32 },
    /// The retry budget is used up
    Exhausted { attempts: u32 },
}

#[derive(Debug, Default)]
struct RetryState {
    attempts: u32,
    last_delay: Duration,
    pending: Option<(u32, JoinHandle<()>)>,
}

/// Per-session reconnection bookkeeping
pub struct ReconnectionSupervisor {
    policy: ReconnectionPolicy,
    peers: HashMap<PeerId, RetryState>,
    due_tx: mpsc::UnboundedSender<RetryDue>,
}

impl ReconnectionSupervisor {
    pub fn new(policy: ReconnectionPolicy, due_tx: mpsc::UnboundedSender<RetryDue>) -> Self {
        Self {
            policy,
            peers: HashMap::new(),
            due_tx,
        }
    }

    /// Schedule the next retry for a failed peer.
    ///
    /// Delays never decrease within one failure streak.
    pub fn schedule(&mut self, peer_id: &str) -> RetryDecision {
        let state = self.peers.entry(peer_id.to_string()).or_default();

        if let Some((attempt, _)) = &state.pending {
            debug!("Retry for peer {} already pending (attempt {})", peer_id, attempt);
            return RetryDecision::AlreadyPending { attempt: *attempt };
        }

        if !self.policy.should_retry(state.attempts) {
            warn!(
                "Reconnection to peer {} exhausted after {} attempts",
                peer_id, state.attempts
            );
            return RetryDecision::Exhausted {
                attempts: state.attempts,
            };
        }

        let delay = self
            .policy
            .calculate_backoff(state.attempts)
            .max(state.last_delay);
        state.attempts += 1;
        state.last_delay = delay;
        let attempt = state.attempts;

        info!(
            "Scheduling reconnection to peer {} (attempt {}, backoff {:?})",
            peer_id, attempt, delay
        );

        let due_tx = self.due_tx.clone();
        let due = RetryDue {
            peer_id: peer_id.to_string(),
            attempt,
        };
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = due_tx.send(due);
        });
        state.pending = Some((attempt, handle));

        RetryDecision::Scheduled { attempt, delay }
    }

    /// Accept a due retry. Returns `false` for retries that were cancelled
    /// or superseded in the meantime.
    pub fn take_due(&mut self, due: &RetryDue) -> bool {
        let Some(state) = self.peers.get_mut(&due.peer_id) else {
            return false;
        };
        match &state.pending {
            Some((attempt, _)) if *attempt == due.attempt => {
                state.pending = None;
                true
            }
            _ => false,
        }
    }

    /// Cancel a pending retry, keeping the attempt count
    pub fn cancel(&mut self, peer_id: &str) -> bool {
        match self.peers.get_mut(peer_id).and_then(|s| s.pending.take()) {
            Some((attempt, handle)) => {
                debug!("Cancelled retry {} for peer {}", attempt, peer_id);
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// The peer connected: reset its backoff
    pub fn record_success(&mut self, peer_id: &str) {
        self.forget(peer_id);
    }

    /// Drop all state for a peer
    pub fn forget(&mut self, peer_id: &str) {
        if let Some(state) = self.peers.remove(peer_id) {
            if let Some((_, handle)) = state.pending {
                handle.abort();
            }
        }
    }

    /// Cancel every pending retry
    pub fn cancel_all(&mut self) {
        for (_, state) in self.peers.drain() {
            if let Some((_, handle)) = state.pending {
                handle.abort();
            }
        }
    }

    pub fn is_pending(&self, peer_id: &str) -> bool {
        self.peers
            .get(peer_id)
            .map(|s| s.pending.is_some())
            .unwrap_or(false)
    }

    /// Attempts made in the current failure streak
    pub fn attempts(&self, peer_id: &str) -> u32 {
        self.peers.get(peer_id).map(|s| s.attempts).unwrap_or(0)
    }
}

impl Drop for ReconnectionSupervisor {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

/// Run `op` until it succeeds, retrying transient errors per `policy`
pub(crate) async fn retry_transient<T, F, Fut>(
    policy: &ReconnectionPolicy,
    what: &str,
    mut op: F,
) -> crate::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = crate::Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && policy.should_retry(attempt) => {
                let delay = policy.calculate_backoff(attempt);
                debug!("{} failed ({}), retrying in {:?}", what, e, delay);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_policy() -> ReconnectionPolicy {
        ReconnectionPolicy {
            jitter_enabled: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_reconnection_policy_default() {
        let policy = ReconnectionPolicy::default();
        assert_eq!(policy.max_retries, None);
        assert_eq!(policy.backoff_initial_ms, 1000);
        assert_eq!(policy.backoff_max_ms, 30000);
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = fixed_policy();

        assert_eq!(policy.calculate_backoff(0), Duration::from_millis(1000));
        assert_eq!(policy.calculate_backoff(1), Duration::from_millis(2000));
        assert_eq!(policy.calculate_backoff(2), Duration::from_millis(4000));
    }

    #[test]
    fn test_backoff_cap_holds_with_jitter() {
        let policy = ReconnectionPolicy {
            backoff_max_ms: 5000,
            ..Default::default()
        };

        for attempt in 0..40 {
            assert!(policy.calculate_backoff(attempt) <= Duration::from_millis(5000));
        }
        assert_eq!(policy.calculate_backoff(10), Duration::from_millis(5000));
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = ReconnectionPolicy::default();
        for _ in 0..50 {
            let delay = policy.calculate_backoff(1);
            assert!(delay >= Duration::from_millis(2000));
            assert!(delay <= Duration::from_millis(2500));
        }
    }

    #[test]
    fn test_should_retry() {
        let policy = ReconnectionPolicy {
            max_retries: Some(3),
            ..Default::default()
        };

        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(ReconnectionPolicy::default().should_retry(10_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervisor_delivers_due_retry() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut supervisor = ReconnectionSupervisor::new(fixed_policy(), tx);

        let decision = supervisor.schedule("b");
        assert_eq!(
            decision,
            RetryDecision::Scheduled {
                attempt: 1,
                delay: Duration::from_millis(1000)
            }
        );
        assert!(supervisor.is_pending("b"));

        let due = rx.recv().await.unwrap();
        assert_eq!(due, RetryDue { peer_id: "b".into(), attempt: 1 });
        assert!(supervisor.take_due(&due));
        assert!(!supervisor.is_pending("b"));
        assert!(!supervisor.take_due(&due));
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_pending_retry_per_peer() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut supervisor = ReconnectionSupervisor::new(fixed_policy(), tx);

        supervisor.schedule("b");
        assert_eq!(
            supervisor.schedule("b"),
            RetryDecision::AlreadyPending { attempt: 1 }
        );
        assert_eq!(supervisor.attempts("b"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delays_never_decrease() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut supervisor = ReconnectionSupervisor::new(ReconnectionPolicy::default(), tx);

        let mut last = Duration::ZERO;
        for _ in 0..8 {
            let RetryDecision::Scheduled { delay, .. } = supervisor.schedule("b") else {
                panic!("expected a scheduled retry");
            };
            assert!(delay >= last);
            last = delay;

            let due = rx.recv().await.unwrap();
            assert!(supervisor.take_due(&due));
        }
        assert_eq!(last, Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let policy = ReconnectionPolicy {
            max_retries: Some(2),
            ..fixed_policy()
        };
        let mut supervisor = ReconnectionSupervisor::new(policy, tx);

        for _ in 0..2 {
            supervisor.schedule("b");
            let due = rx.recv().await.unwrap();
            supervisor.take_due(&due);
        }
        assert_eq!(
            supervisor.schedule("b"),
            RetryDecision::Exhausted { attempts: 2 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_and_success_reset() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut supervisor = ReconnectionSupervisor::new(fixed_policy(), tx);

        supervisor.schedule("b");
        assert!(supervisor.cancel("b"));
        assert!(!supervisor.is_pending("b"));
        assert_eq!(supervisor.attempts("b"), 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());

        supervisor.record_success("b");
        assert_eq!(supervisor.attempts("b"), 0);
        assert_eq!(
            supervisor.schedule("b"),
            RetryDecision::Scheduled {
                attempt: 1,
                delay: Duration::from_millis(1000)
            }
        );
    }
}
