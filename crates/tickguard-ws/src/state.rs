//! Connection lifecycle state machine.
//!
//! The machine is pure: `apply` consumes an event, mutates the state and
//! returns the side effects the worker must perform. Timers, sockets and
//! clocks all live outside this module, which keeps every transition
//! testable without a runtime.
//!
//! Two tokens keep stale asynchronous results from corrupting the state:
//! - `generation` is bumped on every connect attempt and on close; transport
//!   results carrying an older generation are ignored.
//! - at most one reconnect timer is pending; a fired timer whose id does not
//!   match the pending one is ignored.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

// ============================================================================
// Phase
// ============================================================================

/// Lifecycle phase of a single stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl ConnectionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        }
    }

    /// Whether a live transport is (or is about to be) attached.
    fn has_transport(&self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Events and effects
// ============================================================================

/// Identifier of a scheduled reconnect timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub u64);

/// Reconnect limits fixed at `Open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectRules {
    pub enabled: bool,
    /// 0 means unlimited.
    pub max_attempts: u32,
}

impl Default for ReconnectRules {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Caller asked to open (or re-open) the stream.
    Open { rules: ReconnectRules },
    /// Caller asked to close the stream.
    Close,
    /// The transport for `generation` finished its handshake.
    TransportOpened { generation: u64, at: DateTime<Utc> },
    /// The transport for `generation` failed to connect, errored or closed.
    TransportClosed { generation: u64, reason: String },
    /// A reconnect timer elapsed.
    ReconnectTimerFired { timer: TimerId },
    /// A latency probe was written to the transport.
    ProbeSent { at: DateTime<Utc> },
    /// Any inbound frame arrived on the transport for `generation`.
    MessageReceived { generation: u64, at: DateTime<Utc> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Start a transport attempt tagged with `generation`.
    Connect { generation: u64 },
    /// Tear down whatever transport is attached.
    CloseTransport,
    /// Arm a reconnect timer; the delay is derived from `attempt`.
    ScheduleReconnect { timer: TimerId, attempt: u32 },
    /// Disarm a previously scheduled timer.
    CancelReconnect { timer: TimerId },
    /// The phase changed; observers should be told.
    PhaseChanged {
        from: ConnectionPhase,
        to: ConnectionPhase,
        attempts: u32,
    },
    /// A probe round trip completed.
    LatencyMeasured { latency_ms: i64 },
}

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionState {
    pub stream_id: String,
    pub phase: ConnectionPhase,
    pub reconnect_attempts: u32,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub latency_ms: Option<i64>,
    #[serde(skip)]
    pub pending_reconnect: Option<TimerId>,
    #[serde(skip)]
    generation: u64,
    #[serde(skip)]
    next_timer: u64,
    #[serde(skip)]
    probe_sent_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    rules: ReconnectRules,
}

impl ConnectionState {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            phase: ConnectionPhase::Disconnected,
            reconnect_attempts: 0,
            last_connected_at: None,
            latency_ms: None,
            pending_reconnect: None,
            generation: 0,
            next_timer: 0,
            probe_sent_at: None,
            rules: ReconnectRules::default(),
        }
    }

    /// Current transport generation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether `generation` belongs to the attached transport.
    pub fn is_current(&self, generation: u64) -> bool {
        generation == self.generation && self.phase.has_transport()
    }

    pub fn is_connected(&self) -> bool {
        self.phase == ConnectionPhase::Connected
    }

    /// Pure transition: returns the next state and its effects.
    #[must_use]
    pub fn transition(&self, event: ConnectionEvent) -> (Self, Vec<Effect>) {
        let mut next = self.clone();
        let effects = next.apply(event);
        (next, effects)
    }

    /// Apply `event` in place and return the effects to perform.
    pub fn apply(&mut self, event: ConnectionEvent) -> Vec<Effect> {
        match event {
            ConnectionEvent::Open { rules } => self.on_open(rules),
            ConnectionEvent::Close => self.on_close(),
            ConnectionEvent::TransportOpened { generation, at } => {
                self.on_transport_opened(generation, at)
            }
            ConnectionEvent::TransportClosed { generation, .. } => {
                self.on_transport_closed(generation)
            }
            ConnectionEvent::ReconnectTimerFired { timer } => self.on_timer_fired(timer),
            ConnectionEvent::ProbeSent { at } => {
                if self.is_connected() {
                    self.probe_sent_at = Some(at);
                }
                Vec::new()
            }
            ConnectionEvent::MessageReceived { generation, at } => {
                self.on_message(generation, at)
            }
        }
    }

    fn on_open(&mut self, rules: ReconnectRules) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.cancel_pending(&mut effects);
        if self.phase.has_transport() {
            effects.push(Effect::CloseTransport);
        }
        self.rules = rules;
        self.reconnect_attempts = 0;
        self.probe_sent_at = None;
        self.generation += 1;
        self.set_phase(ConnectionPhase::Connecting, &mut effects);
        effects.push(Effect::Connect {
            generation: self.generation,
        });
        effects
    }

    fn on_close(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.cancel_pending(&mut effects);
        if self.phase.has_transport() {
            effects.push(Effect::CloseTransport);
        }
        // Invalidate any in-flight connect.
        self.generation += 1;
        self.probe_sent_at = None;
        self.set_phase(ConnectionPhase::Disconnected, &mut effects);
        effects
    }

    fn on_transport_opened(&mut self, generation: u64, at: DateTime<Utc>) -> Vec<Effect> {
        if generation != self.generation || self.phase != ConnectionPhase::Connecting {
            return Vec::new();
        }
        let mut effects = Vec::new();
        self.last_connected_at = Some(at);
        self.reconnect_attempts = 0;
        self.set_phase(ConnectionPhase::Connected, &mut effects);
        effects
    }

    fn on_transport_closed(&mut self, generation: u64) -> Vec<Effect> {
        // Duplicate failure signals land here while Reconnecting/Failed/
        // Disconnected and must not schedule a second timer.
        if !self.is_current(generation) {
            return Vec::new();
        }
        let mut effects = Vec::new();
        self.probe_sent_at = None;
        self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);

        let exhausted =
            self.rules.max_attempts > 0 && self.reconnect_attempts >= self.rules.max_attempts;
        if !self.rules.enabled || exhausted {
            self.set_phase(ConnectionPhase::Failed, &mut effects);
            return effects;
        }

        self.set_phase(ConnectionPhase::Reconnecting, &mut effects);
        if self.pending_reconnect.is_none() {
            let timer = TimerId(self.next_timer);
            self.next_timer += 1;
            self.pending_reconnect = Some(timer);
            effects.push(Effect::ScheduleReconnect {
                timer,
                attempt: self.reconnect_attempts,
            });
        }
        effects
    }

    fn on_timer_fired(&mut self, timer: TimerId) -> Vec<Effect> {
        if self.pending_reconnect != Some(timer) {
            return Vec::new();
        }
        self.pending_reconnect = None;
        if self.phase != ConnectionPhase::Reconnecting {
            return Vec::new();
        }
        let mut effects = Vec::new();
        self.generation += 1;
        self.set_phase(ConnectionPhase::Connecting, &mut effects);
        effects.push(Effect::Connect {
            generation: self.generation,
        });
        effects
    }

    fn on_message(&mut self, generation: u64, at: DateTime<Utc>) -> Vec<Effect> {
        if !self.is_current(generation) || !self.is_connected() {
            return Vec::new();
        }
        // Inbound traffic never resets reconnect_attempts.
        match self.probe_sent_at.take() {
            Some(sent) => {
                let latency_ms = (at - sent).num_milliseconds().max(0);
                self.latency_ms = Some(latency_ms);
                vec![Effect::LatencyMeasured { latency_ms }]
            }
            None => Vec::new(),
        }
    }

    fn cancel_pending(&mut self, effects: &mut Vec<Effect>) {
        if let Some(timer) = self.pending_reconnect.take() {
            effects.push(Effect::CancelReconnect { timer });
        }
    }

    fn set_phase(&mut self, to: ConnectionPhase, effects: &mut Vec<Effect>) {
        if self.phase == to {
            return;
        }
        let from = self.phase;
        self.phase = to;
        effects.push(Effect::PhaseChanged {
            from,
            to,
            attempts: self.reconnect_attempts,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn open(rules: ReconnectRules) -> ConnectionEvent {
        ConnectionEvent::Open { rules }
    }

    fn closed(generation: u64) -> ConnectionEvent {
        ConnectionEvent::TransportClosed {
            generation,
            reason: "reset".to_string(),
        }
    }

    fn scheduled(effects: &[Effect]) -> Option<TimerId> {
        effects.iter().find_map(|e| match e {
            Effect::ScheduleReconnect { timer, .. } => Some(*timer),
            _ => None,
        })
    }

    fn connected_state(rules: ReconnectRules) -> ConnectionState {
        let mut state = ConnectionState::new("btcusdt@ticker");
        state.apply(open(rules));
        let generation = state.generation();
        state.apply(ConnectionEvent::TransportOpened {
            generation,
            at: Utc::now(),
        });
        state
    }

    /// Drive one full fail -> timer -> reconnect-attempt cycle.
    fn fail_cycle(state: &mut ConnectionState) -> Vec<Effect> {
        let effects = state.apply(closed(state.generation()));
        if let Some(timer) = scheduled(&effects) {
            state.apply(ConnectionEvent::ReconnectTimerFired { timer });
        }
        effects
    }

    #[test]
    fn test_open_connects() {
        let mut state = ConnectionState::new("s");
        let effects = state.apply(open(ReconnectRules::default()));
        assert_eq!(state.phase, ConnectionPhase::Connecting);
        assert!(effects.contains(&Effect::Connect { generation: 1 }));
    }

    #[test]
    fn test_transport_opened_connects() {
        let state = connected_state(ReconnectRules::default());
        assert_eq!(state.phase, ConnectionPhase::Connected);
        assert!(state.last_connected_at.is_some());
    }

    #[test]
    fn test_failure_schedules_single_timer() {
        let mut state = connected_state(ReconnectRules::default());
        let generation = state.generation();

        let first = state.apply(closed(generation));
        assert_eq!(state.phase, ConnectionPhase::Reconnecting);
        assert!(scheduled(&first).is_some());

        // Error + close for the same transport: second signal is a no-op.
        let second = state.apply(closed(generation));
        assert!(second.is_empty());
        assert_eq!(state.reconnect_attempts, 1);
    }

    #[test]
    fn test_attempts_accumulate_across_cycles() {
        let rules = ReconnectRules {
            enabled: true,
            max_attempts: 10,
        };
        let mut state = ConnectionState::new("s");
        state.apply(open(rules));
        for _ in 0..5 {
            let effects = fail_cycle(&mut state);
            assert_eq!(
                effects
                    .iter()
                    .filter(|e| matches!(e, Effect::ScheduleReconnect { .. }))
                    .count(),
                1
            );
        }
        assert_eq!(state.reconnect_attempts, 5);
        assert_eq!(state.phase, ConnectionPhase::Connecting);
    }

    #[test]
    fn test_fails_after_max_attempts() {
        let rules = ReconnectRules {
            enabled: true,
            max_attempts: 3,
        };
        let mut state = ConnectionState::new("s");
        state.apply(open(rules));
        fail_cycle(&mut state);
        fail_cycle(&mut state);
        let effects = fail_cycle(&mut state);
        assert_eq!(state.phase, ConnectionPhase::Failed);
        assert!(scheduled(&effects).is_none());
        assert_eq!(state.pending_reconnect, None);
    }

    #[test]
    fn test_zero_max_attempts_is_unlimited() {
        let mut state = ConnectionState::new("s");
        state.apply(open(ReconnectRules::default()));
        for _ in 0..50 {
            fail_cycle(&mut state);
        }
        assert_eq!(state.reconnect_attempts, 50);
        assert_ne!(state.phase, ConnectionPhase::Failed);
    }

    #[test]
    fn test_reconnect_disabled_goes_to_failed() {
        let rules = ReconnectRules {
            enabled: false,
            max_attempts: 0,
        };
        let mut state = connected_state(rules);
        let effects = state.apply(closed(state.generation()));
        assert_eq!(state.phase, ConnectionPhase::Failed);
        assert!(scheduled(&effects).is_none());
    }

    #[test]
    fn test_close_cancels_pending_timer() {
        let mut state = connected_state(ReconnectRules::default());
        let effects = state.apply(closed(state.generation()));
        let timer = scheduled(&effects).unwrap();

        let effects = state.apply(ConnectionEvent::Close);
        assert!(effects.contains(&Effect::CancelReconnect { timer }));
        assert_eq!(state.phase, ConnectionPhase::Disconnected);

        // A timer that slipped through cancellation does nothing.
        let effects = state.apply(ConnectionEvent::ReconnectTimerFired { timer });
        assert!(effects.is_empty());
        assert_eq!(state.phase, ConnectionPhase::Disconnected);
    }

    #[test]
    fn test_close_while_connected_closes_transport() {
        let mut state = connected_state(ReconnectRules::default());
        let effects = state.apply(ConnectionEvent::Close);
        assert!(effects.contains(&Effect::CloseTransport));
        assert_eq!(state.phase, ConnectionPhase::Disconnected);
    }

    #[test]
    fn test_close_ignores_late_transport_events() {
        let mut state = ConnectionState::new("s");
        state.apply(open(ReconnectRules::default()));
        let stale = state.generation();
        state.apply(ConnectionEvent::Close);

        let effects = state.apply(ConnectionEvent::TransportOpened {
            generation: stale,
            at: Utc::now(),
        });
        assert!(effects.is_empty());
        assert!(state.apply(closed(stale)).is_empty());
        assert_eq!(state.phase, ConnectionPhase::Disconnected);
        assert_eq!(state.reconnect_attempts, 0);
    }

    #[test]
    fn test_open_during_reconnect_cancels_timer_and_resets() {
        let mut state = connected_state(ReconnectRules::default());
        let effects = state.apply(closed(state.generation()));
        let timer = scheduled(&effects).unwrap();

        let effects = state.apply(open(ReconnectRules::default()));
        assert!(effects.contains(&Effect::CancelReconnect { timer }));
        assert_eq!(state.reconnect_attempts, 0);
        assert_eq!(state.phase, ConnectionPhase::Connecting);
        assert!(state.apply(ConnectionEvent::ReconnectTimerFired { timer }).is_empty());
    }

    #[test]
    fn test_open_from_failed_resets_attempts() {
        let rules = ReconnectRules {
            enabled: true,
            max_attempts: 1,
        };
        let mut state = connected_state(rules);
        state.apply(closed(state.generation()));
        assert_eq!(state.phase, ConnectionPhase::Failed);

        state.apply(open(rules));
        assert_eq!(state.phase, ConnectionPhase::Connecting);
        assert_eq!(state.reconnect_attempts, 0);
    }

    #[test]
    fn test_messages_do_not_reset_attempts() {
        let mut state = connected_state(ReconnectRules::default());
        let generation = state.generation();
        state.apply(closed(generation));
        assert_eq!(state.reconnect_attempts, 1);

        // Frames still buffered from the dead transport.
        state.apply(ConnectionEvent::MessageReceived {
            generation,
            at: Utc::now(),
        });
        assert_eq!(state.reconnect_attempts, 1);
        assert_eq!(state.phase, ConnectionPhase::Reconnecting);
    }

    #[test]
    fn test_successful_connect_resets_attempts() {
        let mut state = ConnectionState::new("s");
        state.apply(open(ReconnectRules::default()));
        fail_cycle(&mut state);
        fail_cycle(&mut state);
        assert_eq!(state.reconnect_attempts, 2);

        let effects = state.apply(ConnectionEvent::TransportOpened {
            generation: state.generation(),
            at: Utc::now(),
        });
        assert_eq!(state.reconnect_attempts, 0);
        assert!(effects.contains(&Effect::PhaseChanged {
            from: ConnectionPhase::Connecting,
            to: ConnectionPhase::Connected,
            attempts: 0,
        }));
    }

    #[test]
    fn test_probe_latency_measured_once() {
        let mut state = connected_state(ReconnectRules::default());
        let generation = state.generation();
        let sent = Utc::now();
        state.apply(ConnectionEvent::ProbeSent { at: sent });

        let effects = state.apply(ConnectionEvent::MessageReceived {
            generation,
            at: sent + Duration::milliseconds(42),
        });
        assert_eq!(effects, vec![Effect::LatencyMeasured { latency_ms: 42 }]);
        assert_eq!(state.latency_ms, Some(42));

        let effects = state.apply(ConnectionEvent::MessageReceived {
            generation,
            at: sent + Duration::milliseconds(90),
        });
        assert!(effects.is_empty());
        assert_eq!(state.latency_ms, Some(42));
    }

    #[test]
    fn test_transition_is_pure() {
        let state = ConnectionState::new("s");
        let (next, effects) = state.transition(open(ReconnectRules::default()));
        assert_eq!(state.phase, ConnectionPhase::Disconnected);
        assert_eq!(next.phase, ConnectionPhase::Connecting);
        assert!(!effects.is_empty());
    }
}
