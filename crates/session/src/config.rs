//! Configuration types for the session coordinator

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration for SessionCoordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// CONNECTED peers with no liveness signal for this long fail (default: 15000ms)
    pub liveness_timeout_ms: u64,

    /// NEGOTIATING peers with no progress for this long fail (default: 20000ms)
    pub negotiation_timeout_ms: u64,

    /// Interval between liveness heartbeats on connected transports (default: 5000ms)
    pub heartbeat_interval_ms: u64,

    /// Session worker tick driving timeouts and heartbeats (default: 1000ms)
    pub tick_interval_ms: u64,

    /// Interval between presence heartbeats on the signaling channel (default: 10000ms)
    pub presence_interval_ms: u64,

    /// Members with no presence heartbeat for this long are treated as gone (default: 30000ms)
    pub presence_timeout_ms: u64,

    /// Number of recent counter event ids remembered for deduplication (default: 4096)
    pub dedup_capacity: usize,

    /// Age after which a remembered event id may be forgotten (default: 600s, None = capacity only)
    pub dedup_window_secs: Option<u64>,

    /// Per-peer queue of counter events awaiting a connection (default: 1024)
    pub max_pending_events: usize,

    /// Maximum remote peers per session (default: 16)
    pub max_peers: u32,

    /// Attempts per signaling publish before the peer session fails (default: 3)
    pub publish_retries: u32,

    /// Upper bound on BYE publish + transport teardown when leaving (default: 2000ms)
    pub leave_timeout_ms: u64,

    /// Capacity of the observer event stream (default: 256)
    pub event_buffer: usize,

    /// Reconnection backoff policy
    pub reconnect: ReconnectConfig,

    /// ICE servers for the WebRTC transport
    pub ice: IceConfig,
}

/// Reconnection backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Maximum reconnection attempts per peer (None = unlimited, interval stays capped)
    pub max_retries: Option<u32>,

    /// Initial backoff delay in milliseconds (default: 1000)
    pub backoff_initial_ms: u64,

    /// Maximum backoff delay in milliseconds (default: 30000)
    pub backoff_max_ms: u64,

    /// Backoff multiplier (default: 2.0)
    pub backoff_multiplier: f64,

    /// Add up to 25% random jitter to each delay (default: true)
    pub jitter_enabled: bool,
}

/// ICE server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    /// STUN server URLs
    pub stun_servers: Vec<String>,

    /// TURN server configurations (optional)
    pub turn_servers: Vec<TurnServerConfig>,
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (turn: or turns:)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            liveness_timeout_ms: 15_000,
            negotiation_timeout_ms: 20_000,
            heartbeat_interval_ms: 5_000,
            tick_interval_ms: 1_000,
            presence_interval_ms: 10_000,
            presence_timeout_ms: 30_000,
            dedup_capacity: 4096,
            dedup_window_secs: Some(600),
            max_pending_events: 1024,
            max_peers: 16,
            publish_retries: 3,
            leave_timeout_ms: 2_000,
            event_buffer: 256,
            reconnect: ReconnectConfig::default(),
            ice: IceConfig::default(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_retries: None,
            backoff_initial_ms: 1000,
            backoff_max_ms: 30000,
            backoff_multiplier: 2.0,
            jitter_enabled: true,
        }
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: Vec::new(),
        }
    }
}

impl SessionConfig {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - any timeout or interval is zero
    /// - `heartbeat_interval_ms` is not shorter than `liveness_timeout_ms`
    /// - `tick_interval_ms` is longer than `heartbeat_interval_ms`
    /// - `presence_timeout_ms` is less than twice `presence_interval_ms`
    /// - `dedup_capacity`, `max_pending_events` or `event_buffer` is zero
    /// - `max_peers` is not in range 1-64
    /// - the reconnect backoff range is empty or the multiplier is below 1.0
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        for (name, value) in [
            ("liveness_timeout_ms", self.liveness_timeout_ms),
            ("negotiation_timeout_ms", self.negotiation_timeout_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("tick_interval_ms", self.tick_interval_ms),
            ("presence_interval_ms", self.presence_interval_ms),
            ("presence_timeout_ms", self.presence_timeout_ms),
            ("leave_timeout_ms", self.leave_timeout_ms),
        ] {
            if value == 0 {
                return Err(Error::InvalidConfig(format!("{} must be non-zero", name)));
            }
        }

        if self.heartbeat_interval_ms >= self.liveness_timeout_ms {
            return Err(Error::InvalidConfig(format!(
                "heartbeat_interval_ms ({}) must be shorter than liveness_timeout_ms ({})",
                self.heartbeat_interval_ms, self.liveness_timeout_ms
            )));
        }

        if self.tick_interval_ms > self.heartbeat_interval_ms {
            return Err(Error::InvalidConfig(format!(
                "tick_interval_ms ({}) must not exceed heartbeat_interval_ms ({})",
                self.tick_interval_ms, self.heartbeat_interval_ms
            )));
        }

        // one lost heartbeat must not expire a member
        if self.presence_timeout_ms < self.presence_interval_ms.saturating_mul(2) {
            return Err(Error::InvalidConfig(format!(
                "presence_timeout_ms ({}) must be at least twice presence_interval_ms ({})",
                self.presence_timeout_ms, self.presence_interval_ms
            )));
        }

        if self.dedup_capacity == 0 || self.max_pending_events == 0 || self.event_buffer == 0 {
            return Err(Error::InvalidConfig(
                "dedup_capacity, max_pending_events and event_buffer must be non-zero".to_string(),
            ));
        }

        if self.max_peers == 0 || self.max_peers > 64 {
            return Err(Error::InvalidConfig(format!(
                "max_peers must be in range 1-64, got {}",
                self.max_peers
            )));
        }

        self.reconnect.validate()?;

        Ok(())
    }

    /// Create a configuration preset for flaky cellular networks
    ///
    /// Longer liveness and negotiation bounds tolerate handoffs, and the
    /// backoff grows slowly up to one minute.
    ///
    /// # Example
    ///
    /// ```
    /// use cloudcounter_session::config::SessionConfig;
    ///
    /// let config = SessionConfig::mobile_network_preset();
    /// assert!(config.validate().is_ok());
    /// assert_eq!(config.liveness_timeout_ms, 30_000);
    /// ```
    pub fn mobile_network_preset() -> Self {
        Self {
            liveness_timeout_ms: 30_000,
            negotiation_timeout_ms: 45_000,
            heartbeat_interval_ms: 7_500,
            presence_interval_ms: 15_000,
            presence_timeout_ms: 45_000,
            reconnect: ReconnectConfig {
                max_retries: None,
                backoff_initial_ms: 2000,
                backoff_max_ms: 60000,
                backoff_multiplier: 1.5,
                jitter_enabled: true,
            },
            ice: IceConfig {
                stun_servers: vec![
                    "stun:stun.l.google.com:19302".to_string(),
                    "stun:stun1.l.google.com:19302".to_string(), // Backup STUN
                ],
                turn_servers: Vec::new(),
            },
            ..Default::default()
        }
    }

    /// Create a configuration preset for devices on the same fast network
    ///
    /// # Example
    ///
    /// ```
    /// use cloudcounter_session::config::SessionConfig;
    ///
    /// let config = SessionConfig::low_latency_preset();
    /// assert!(config.validate().is_ok());
    /// assert_eq!(config.reconnect.backoff_initial_ms, 250);
    /// ```
    pub fn low_latency_preset() -> Self {
        Self {
            liveness_timeout_ms: 6_000,
            negotiation_timeout_ms: 10_000,
            heartbeat_interval_ms: 2_000,
            tick_interval_ms: 500,
            reconnect: ReconnectConfig {
                max_retries: Some(20),
                backoff_initial_ms: 250,
                backoff_max_ms: 5000,
                backoff_multiplier: 1.5,
                jitter_enabled: true,
            },
            ..Default::default()
        }
    }

    /// Add TURN servers to this configuration
    pub fn with_turn_servers(mut self, turn_servers: Vec<TurnServerConfig>) -> Self {
        self.ice.turn_servers = turn_servers;
        self
    }

    /// Set the liveness timeout
    pub fn with_liveness_timeout(mut self, timeout: Duration) -> Self {
        self.liveness_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the negotiation timeout
    pub fn with_negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the reconnection policy
    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Set the maximum number of remote peers
    pub fn with_max_peers(mut self, max_peers: u32) -> Self {
        self.max_peers = max_peers;
        self
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn presence_interval(&self) -> Duration {
        Duration::from_millis(self.presence_interval_ms)
    }

    pub fn presence_timeout(&self) -> Duration {
        Duration::from_millis(self.presence_timeout_ms)
    }

    pub fn leave_timeout(&self) -> Duration {
        Duration::from_millis(self.leave_timeout_ms)
    }

    pub fn dedup_window(&self) -> Option<Duration> {
        self.dedup_window_secs.map(Duration::from_secs)
    }
}

impl ReconnectConfig {
    /// Validate backoff parameters
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if self.backoff_initial_ms == 0 {
            return Err(Error::InvalidConfig(
                "backoff_initial_ms must be non-zero".to_string(),
            ));
        }

        if self.backoff_max_ms < self.backoff_initial_ms {
            return Err(Error::InvalidConfig(format!(
                "backoff_max_ms ({}) must be >= backoff_initial_ms ({})",
                self.backoff_max_ms, self.backoff_initial_ms
            )));
        }

        if self.backoff_multiplier.is_nan() || self.backoff_multiplier < 1.0 {
            return Err(Error::InvalidConfig(format!(
                "backoff_multiplier must be >= 1.0, got {}",
                self.backoff_multiplier
            )));
        }

        Ok(())
    }
}
