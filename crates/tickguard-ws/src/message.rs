//! Types exchanged between the connection manager and its callers.

use crate::state::ConnectionPhase;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a stream connects and what it sends once connected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEndpoint {
    pub url: String,
    /// Text frames written after every successful handshake, in order
    /// (subscription requests and the like).
    #[serde(default)]
    pub on_connect: Vec<String>,
}

impl StreamEndpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            on_connect: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_on_connect(mut self, payload: impl Into<String>) -> Self {
        self.on_connect.push(payload.into());
        self
    }
}

/// Notifications published by stream workers.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Lifecycle phase changed.
    Phase {
        stream_id: String,
        from: ConnectionPhase,
        to: ConnectionPhase,
        attempts: u32,
    },
    /// Inbound text frame from a connected transport.
    Message {
        stream_id: String,
        text: String,
        received_at: DateTime<Utc>,
    },
    /// A latency probe completed.
    Latency { stream_id: String, latency_ms: i64 },
}

impl StreamEvent {
    pub fn stream_id(&self) -> &str {
        match self {
            Self::Phase { stream_id, .. }
            | Self::Message { stream_id, .. }
            | Self::Latency { stream_id, .. } => stream_id,
        }
    }
}
