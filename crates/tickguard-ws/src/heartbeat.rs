//! Probe and idle tracking for a single stream transport.
//!
//! The worker sends a ping every `probe_interval_ms` while connected. Any
//! inbound frame counts as liveness; if nothing arrives for
//! `idle_timeout_ms` the transport is treated as dead.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::debug;

/// Heartbeat bookkeeping owned by a stream worker.
#[derive(Debug)]
pub struct Heartbeat {
    probe_interval_ms: u64,
    /// 0 disables idle detection.
    idle_timeout_ms: u64,
    last_probe: Option<DateTime<Utc>>,
    last_message: DateTime<Utc>,
}

impl Heartbeat {
    pub fn new(probe_interval_ms: u64, idle_timeout_ms: u64) -> Self {
        Self {
            probe_interval_ms,
            idle_timeout_ms,
            last_probe: None,
            last_message: Utc::now(),
        }
    }

    /// Reset on a fresh transport.
    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.last_probe = None;
        self.last_message = now;
    }

    pub fn record_probe(&mut self, now: DateTime<Utc>) {
        self.last_probe = Some(now);
        debug!(time = %now, "Probe sent");
    }

    pub fn record_message(&mut self, now: DateTime<Utc>) {
        self.last_message = now;
    }

    pub fn time_since_last_message_ms(&self, now: DateTime<Utc>) -> i64 {
        (now - self.last_message).num_milliseconds()
    }

    /// Whether the transport has been silent past the idle timeout.
    pub fn is_idle(&self, now: DateTime<Utc>) -> bool {
        self.idle_timeout_ms > 0
            && self.time_since_last_message_ms(now) > i64::try_from(self.idle_timeout_ms).unwrap_or(i64::MAX)
    }

    /// Period of the worker's probe ticker.
    pub fn probe_period(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms.max(1))
    }

    pub fn stats(&self, now: DateTime<Utc>) -> HeartbeatStats {
        HeartbeatStats {
            last_probe: self.last_probe,
            last_message: self.last_message,
            time_since_last_message_ms: self.time_since_last_message_ms(now),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HeartbeatStats {
    pub last_probe: Option<DateTime<Utc>>,
    pub last_message: DateTime<Utc>,
    pub time_since_last_message_ms: i64,
}
