//! WebSocket stream management for market-data feeds.
//!
//! Provides resilient per-stream connectivity with:
//! - A pure connection state machine with generation-guarded transitions
//! - Exponential backoff with jitter and a single pending reconnect timer
//! - Ping probes for latency measurement and idle detection
//! - Channel-based event publication

pub mod backoff;
pub mod connection;
pub mod error;
pub mod heartbeat;
pub mod message;
pub mod state;

pub use backoff::BackoffPolicy;
pub use connection::{ConnectionConfig, ConnectionManager};
pub use error::{WsError, WsResult};
pub use heartbeat::{Heartbeat, HeartbeatStats};
pub use message::{StreamEndpoint, StreamEvent};
pub use state::{
    ConnectionEvent, ConnectionPhase, ConnectionState, Effect, ReconnectRules, TimerId,
};

use std::sync::Once;

static INIT_CRYPTO: Once = Once::new();

/// Initialize the TLS crypto provider.
/// Must be called before any WebSocket connections are made.
pub fn init_crypto() {
    INIT_CRYPTO.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}
