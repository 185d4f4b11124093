//! Timeout configuration for the synchronization engine.
//!
//! Every timer the engine arms (connect, handshake, subscription acks,
//! heartbeat, credential polling) reads its duration from here.

use std::time::Duration;

/// Timeout configuration for triage-link.
///
/// # Examples
///
/// ```rust
/// use triage_link::TriageLinkTimeouts;
/// use std::time::Duration;
///
/// // Use defaults (recommended for most cases)
/// let timeouts = TriageLinkTimeouts::default();
///
/// // Custom timeouts for high-latency environments
/// let timeouts = TriageLinkTimeouts::builder()
///     .connection_timeout(Duration::from_secs(60))
///     .subscribe_timeout(Duration::from_secs(15))
///     .build();
///
/// // Aggressive timeouts for local development
/// let timeouts = TriageLinkTimeouts::fast();
/// ```
#[derive(Debug, Clone)]
pub struct TriageLinkTimeouts {
    /// Timeout for opening the socket (TCP + TLS + upgrade).
    /// Default: 10 seconds
    pub connection_timeout: Duration,

    /// Timeout for the server's `connect` event after the socket opens.
    /// Default: 5 seconds
    pub handshake_timeout: Duration,

    /// Timeout for a subscribe acknowledgement.
    /// Default: 5 seconds
    pub subscribe_timeout: Duration,

    /// Timeout for an unsubscribe acknowledgement. Expiry force-releases
    /// the entry locally.
    /// Default: 5 seconds
    pub unsubscribe_timeout: Duration,

    /// Interval between heartbeat pings while connected.
    /// Set to 0 to disable heartbeats.
    /// Default: 25 seconds
    pub heartbeat_interval: Duration,

    /// Maximum wait for the matching pong after a ping.
    /// Must be shorter than `heartbeat_interval`; 0 disables the check.
    /// Default: 10 seconds
    pub pong_timeout: Duration,

    /// How often the credential store is polled by the token monitor.
    /// Default: 1 second
    pub token_poll_interval: Duration,

    /// Delay between seeing a fresh credential and connecting, so bursty
    /// credential writes settle first.
    /// Default: 250 milliseconds
    pub token_settle_delay: Duration,
}

impl Default for TriageLinkTimeouts {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
            subscribe_timeout: Duration::from_secs(5),
            unsubscribe_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(25),
            pong_timeout: Duration::from_secs(10),
            token_poll_interval: Duration::from_secs(1),
            token_settle_delay: Duration::from_millis(250),
        }
    }
}

impl TriageLinkTimeouts {
    /// Create a new builder for custom timeout configuration.
    pub fn builder() -> TriageLinkTimeoutsBuilder {
        TriageLinkTimeoutsBuilder::new()
    }

    /// Shorter timeouts suitable for localhost servers.
    pub fn fast() -> Self {
        Self {
            connection_timeout: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(2),
            subscribe_timeout: Duration::from_secs(2),
            unsubscribe_timeout: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(10),
            pong_timeout: Duration::from_secs(4),
            token_poll_interval: Duration::from_millis(500),
            token_settle_delay: Duration::from_millis(100),
        }
    }

    /// Longer timeouts for high-latency or unreliable networks.
    pub fn relaxed() -> Self {
        Self {
            connection_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(15),
            subscribe_timeout: Duration::from_secs(15),
            unsubscribe_timeout: Duration::from_secs(15),
            heartbeat_interval: Duration::from_secs(45),
            pong_timeout: Duration::from_secs(20),
            token_poll_interval: Duration::from_secs(2),
            token_settle_delay: Duration::from_millis(500),
        }
    }

    /// Deterministic values for tests running on paused tokio time.
    pub fn for_testing() -> Self {
        Self {
            connection_timeout: Duration::from_secs(1),
            handshake_timeout: Duration::from_secs(1),
            subscribe_timeout: Duration::from_secs(3),
            unsubscribe_timeout: Duration::from_secs(3),
            heartbeat_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            token_poll_interval: Duration::from_secs(1),
            token_settle_delay: Duration::from_millis(200),
        }
    }

    /// Check if a duration represents "no timeout" (zero or very large).
    pub fn is_no_timeout(duration: Duration) -> bool {
        duration.is_zero() || duration > Duration::from_secs(86400 * 365)
    }
}

/// Builder for creating custom [`TriageLinkTimeouts`] configurations.
#[derive(Debug, Clone)]
pub struct TriageLinkTimeoutsBuilder {
    timeouts: TriageLinkTimeouts,
}

impl TriageLinkTimeoutsBuilder {
    fn new() -> Self {
        Self {
            timeouts: TriageLinkTimeouts::default(),
        }
    }

    /// Set the socket open timeout.
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.connection_timeout = timeout;
        self
    }

    /// Set the socket open timeout in seconds.
    pub fn connection_timeout_secs(self, secs: u64) -> Self {
        self.connection_timeout(Duration::from_secs(secs))
    }

    /// Set the handshake (`connect` event) timeout.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.handshake_timeout = timeout;
        self
    }

    /// Set the subscribe acknowledgement timeout.
    pub fn subscribe_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.subscribe_timeout = timeout;
        self
    }

    /// Set the subscribe acknowledgement timeout in seconds.
    pub fn subscribe_timeout_secs(self, secs: u64) -> Self {
        self.subscribe_timeout(Duration::from_secs(secs))
    }

    /// Set the unsubscribe acknowledgement timeout.
    pub fn unsubscribe_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.unsubscribe_timeout = timeout;
        self
    }

    /// Set the heartbeat ping interval. 0 disables heartbeats.
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.timeouts.heartbeat_interval = interval;
        self
    }

    /// Set the heartbeat ping interval in seconds.
    pub fn heartbeat_interval_secs(self, secs: u64) -> Self {
        self.heartbeat_interval(Duration::from_secs(secs))
    }

    /// Set the pong timeout. 0 disables the stale-connection check.
    pub fn pong_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.pong_timeout = timeout;
        self
    }

    /// Set the pong timeout in seconds.
    pub fn pong_timeout_secs(self, secs: u64) -> Self {
        self.pong_timeout(Duration::from_secs(secs))
    }

    /// Set the credential store poll interval.
    pub fn token_poll_interval(mut self, interval: Duration) -> Self {
        self.timeouts.token_poll_interval = interval;
        self
    }

    /// Set the settle delay applied before connecting on a fresh credential.
    pub fn token_settle_delay(mut self, delay: Duration) -> Self {
        self.timeouts.token_settle_delay = delay;
        self
    }

    /// Build the timeout configuration.
    pub fn build(self) -> TriageLinkTimeouts {
        self.timeouts
    }
}
