//! Market-data watcher with automated position protection.
//!
//! Wires the pieces together:
//! - Per-stream WebSocket connections with reconnect and backoff
//! - Tick normalization and order book aggregation
//! - REST fallback polling while streams are degraded
//! - Stop-loss, take-profit, trailing and time-stop protection

pub mod app;
pub mod config;
pub mod dispatch;
pub mod error;

pub use app::{Application, StreamPlan};
pub use config::{AppConfig, DEFAULT_CONFIG_PATH};
pub use dispatch::Dispatcher;
pub use error::{AppError, AppResult};
