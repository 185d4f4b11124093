//! Application-level liveness probe.
//!
//! The monitor owns no timers itself; the connection task asks it for the
//! next deadline, sleeps until then, and calls [`HeartbeatMonitor::poll`].
//! That keeps every timer inside the task's `select!`, where leaving the
//! `Connected` state drops it.
//!
//! A missing pong declares the connection stale even when the transport
//! still reports itself open (half-open TCP, proxies that swallow closes).

use serde_json::{json, Value as JsonValue};
use std::time::Duration;
use tokio::time::Instant;

/// What the connection task must do after [`HeartbeatMonitor::poll`].
#[derive(Debug, Clone, PartialEq)]
pub enum HeartbeatAction {
    Idle,
    /// Send a `ping` event carrying this payload
    SendPing(JsonValue),
    /// No matching pong arrived in time
    Expired,
}

#[derive(Debug, Clone, Copy)]
struct Outstanding {
    seq: u64,
    deadline: Instant,
}

#[derive(Debug)]
pub struct HeartbeatMonitor {
    interval: Duration,
    pong_timeout: Duration,
    running: bool,
    next_ping_at: Option<Instant>,
    outstanding: Option<Outstanding>,
    seq: u64,
    last_sent_at: Option<Instant>,
    last_ack_at: Option<Instant>,
}

impl HeartbeatMonitor {
    pub fn new(interval: Duration, pong_timeout: Duration) -> Self {
        Self {
            interval,
            pong_timeout,
            running: false,
            next_ping_at: None,
            outstanding: None,
            seq: 0,
            last_sent_at: None,
            last_ack_at: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.interval.is_zero()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Begin the ping cycle; the first ping goes out one interval from `now`.
    pub fn start(&mut self, now: Instant) {
        if !self.is_enabled() {
            return;
        }
        self.running = true;
        self.outstanding = None;
        self.next_ping_at = Some(now + self.interval);
    }

    /// Stop pinging and forget any outstanding ping.
    pub fn stop(&mut self) {
        self.running = false;
        self.next_ping_at = None;
        self.outstanding = None;
    }

    /// Earliest instant at which [`poll`](Self::poll) has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        if !self.running {
            return None;
        }
        match (self.next_ping_at, self.outstanding) {
            (Some(ping), Some(out)) => Some(ping.min(out.deadline)),
            (Some(ping), None) => Some(ping),
            (None, Some(out)) => Some(out.deadline),
            (None, None) => None,
        }
    }

    pub fn poll(&mut self, now: Instant) -> HeartbeatAction {
        if !self.running {
            return HeartbeatAction::Idle;
        }

        if let Some(out) = self.outstanding {
            if now >= out.deadline {
                log::warn!(
                    "[triage-link] Pong timeout ({:?}) for ping #{}: server unresponsive",
                    self.pong_timeout,
                    out.seq
                );
                self.stop();
                return HeartbeatAction::Expired;
            }
        }

        match self.next_ping_at {
            Some(at) if now >= at && self.outstanding.is_none() => {
                self.seq += 1;
                self.last_sent_at = Some(now);
                self.next_ping_at = Some(now + self.interval);
                if !self.pong_timeout.is_zero() {
                    self.outstanding = Some(Outstanding {
                        seq: self.seq,
                        deadline: now + self.pong_timeout,
                    });
                }
                HeartbeatAction::SendPing(json!({ "seq": self.seq }))
            },
            Some(at) if now >= at => {
                // Previous ping still unanswered; its deadline governs.
                self.next_ping_at = Some(now + self.interval);
                HeartbeatAction::Idle
            },
            _ => HeartbeatAction::Idle,
        }
    }

    /// Record a pong. Returns `true` when it answers the outstanding ping.
    ///
    /// A pong without a `seq` is accepted as answering the outstanding ping;
    /// a pong for an older ping is ignored.
    pub fn on_pong(&mut self, payload: &JsonValue, now: Instant) -> bool {
        let Some(out) = self.outstanding else {
            return false;
        };
        let matches = match payload.get("seq").and_then(JsonValue::as_u64) {
            Some(seq) => seq == out.seq,
            None => true,
        };
        if matches {
            self.outstanding = None;
            self.last_ack_at = Some(now);
        }
        matches
    }

    pub fn last_sent_at(&self) -> Option<Instant> {
        self.last_sent_at
    }

    pub fn last_ack_at(&self) -> Option<Instant> {
        self.last_ack_at
    }
}
