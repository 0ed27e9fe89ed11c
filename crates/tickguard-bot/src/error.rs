//! Application error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tickguard_ws::WsError),

    #[error("Feed error: {0}")]
    Feed(#[from] tickguard_feed::FeedError),

    #[error("Position error: {0}")]
    Position(#[from] tickguard_position::PositionError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] tickguard_telemetry::TelemetryError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] tickguard_persistence::PersistenceError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type AppResult<T> = Result<T, AppError>;
