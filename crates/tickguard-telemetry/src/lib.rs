//! Prometheus metrics and structured logging for tickguard.
//!
//! - Prometheus metrics for streams, ticks, fallback and protection
//! - Structured logging with tracing (JSON in production)

pub mod error;
pub mod logging;
pub mod metrics;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::{init_logging, init_logging_with, LogFormat};
pub use metrics::Metrics;
