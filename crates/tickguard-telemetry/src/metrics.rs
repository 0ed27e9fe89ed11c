//! Prometheus metrics for tickguard.
//!
//! Covers:
//! - Stream connection phases, reconnects and probe latency
//! - Tick intake by source and dropped messages
//! - Order book rejections
//! - Fallback activation
//! - Protection sessions, triggers and close submissions
//!
//! # Panics
//!
//! Metric registration uses `unwrap()` intentionally. If registration fails,
//! it indicates a fatal configuration error (e.g., duplicate metric names)
//! that should cause an immediate crash at startup rather than silent failure.
//! These panics only occur during static initialization, never at runtime.

use crate::error::{TelemetryError, TelemetryResult};
use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, register_int_gauge,
    CounterVec, Encoder, GaugeVec, HistogramVec, IntGauge, TextEncoder,
};

const PHASES: &[&str] = &[
    "disconnected",
    "connecting",
    "connected",
    "reconnecting",
    "failed",
];

/// Stream phase (1 = active phase, 0 otherwise).
/// Labels: stream, phase
pub static STREAM_PHASE: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "tickguard_stream_phase",
        "Stream connection phase (1=active, 0=inactive)",
        &["stream", "phase"]
    )
    .unwrap()
});

/// Failed connection cycles per stream.
pub static STREAM_RECONNECT_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "tickguard_stream_reconnect_total",
        "Total failed connection cycles",
        &["stream"]
    )
    .unwrap()
});

/// Probe round-trip latency.
pub static STREAM_LATENCY_MS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "tickguard_stream_latency_ms",
        "Probe round-trip latency in milliseconds",
        &["stream"],
        vec![1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 200.0, 500.0, 1000.0, 5000.0]
    )
    .unwrap()
});

/// Ticks offered to market state.
/// Labels: source (stream/fallback), disposition (accepted/duplicate/stale)
pub static TICKS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "tickguard_ticks_total",
        "Ticks offered to market state",
        &["source", "disposition"]
    )
    .unwrap()
});

/// Messages dropped before normalization completed.
pub static DROPPED_MESSAGES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "tickguard_dropped_messages_total",
        "Inbound messages dropped",
        &["reason"]
    )
    .unwrap()
});

/// Depth messages that did not produce a snapshot.
pub static BOOK_REJECTED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "tickguard_book_rejected_total",
        "Depth messages rejected by the aggregator",
        &["reason"]
    )
    .unwrap()
});

/// Fallback path state (1 = polling).
pub static FALLBACK_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("tickguard_fallback_active", "REST fallback path active").unwrap()
});

/// Fallback poll outcomes.
pub static FALLBACK_POLLS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "tickguard_fallback_polls_total",
        "REST fallback polls",
        &["outcome"]
    )
    .unwrap()
});

/// Active protection sessions.
pub static PROTECTION_SESSIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "tickguard_protection_sessions",
        "Active protection sessions"
    )
    .unwrap()
});

/// Open positions rejected at session creation.
pub static UNPROTECTED_POSITIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "tickguard_unprotected_positions",
        "Open positions without a protection session"
    )
    .unwrap()
});

/// Confirmed protection triggers.
/// Labels: reason (stop_loss/take_profit/time_stop/manual), kind (full/partial)
pub static PROTECTION_TRIGGERS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "tickguard_protection_triggers_total",
        "Protection triggers confirmed by the command sink",
        &["reason", "kind"]
    )
    .unwrap()
});

/// Close submissions the sink rejected.
pub static CLOSE_SUBMIT_FAILED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "tickguard_close_submit_failed_total",
        "Close commands the command sink failed to accept",
        &["reason"]
    )
    .unwrap()
});

/// Metrics facade for easy access.
pub struct Metrics;

impl Metrics {
    /// Set the active phase for a stream; all other phases go to 0.
    pub fn stream_phase_set(stream: &str, phase: &str) {
        for p in PHASES {
            STREAM_PHASE.with_label_values(&[stream, p]).set(0.0);
        }
        STREAM_PHASE.with_label_values(&[stream, phase]).set(1.0);
    }

    pub fn stream_reconnect(stream: &str) {
        STREAM_RECONNECT_TOTAL.with_label_values(&[stream]).inc();
    }

    pub fn stream_latency(stream: &str, latency_ms: f64) {
        STREAM_LATENCY_MS
            .with_label_values(&[stream])
            .observe(latency_ms);
    }

    pub fn tick(source: &str, disposition: &str) {
        TICKS_TOTAL.with_label_values(&[source, disposition]).inc();
    }

    pub fn message_dropped(reason: &str) {
        DROPPED_MESSAGES_TOTAL.with_label_values(&[reason]).inc();
    }

    pub fn book_rejected(reason: &str) {
        BOOK_REJECTED_TOTAL.with_label_values(&[reason]).inc();
    }

    pub fn fallback_active(active: bool) {
        FALLBACK_ACTIVE.set(i64::from(active));
    }

    pub fn fallback_poll(outcome: &str) {
        FALLBACK_POLLS_TOTAL.with_label_values(&[outcome]).inc();
    }

    pub fn protection_sessions_set(count: usize) {
        PROTECTION_SESSIONS.set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    pub fn unprotected_positions_set(count: usize) {
        UNPROTECTED_POSITIONS.set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    pub fn protection_triggered(reason: &str, partial: bool) {
        let kind = if partial { "partial" } else { "full" };
        PROTECTION_TRIGGERS_TOTAL
            .with_label_values(&[reason, kind])
            .inc();
    }

    pub fn close_submit_failed(reason: &str) {
        CLOSE_SUBMIT_FAILED_TOTAL.with_label_values(&[reason]).inc();
    }

    /// Render every registered metric in the Prometheus text format.
    pub fn render() -> TelemetryResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&prometheus::gather(), &mut buffer)
            .map_err(|e| TelemetryError::Metrics(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| TelemetryError::Metrics(e.to_string()))
    }
}
