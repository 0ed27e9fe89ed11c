//! Position protection error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PositionError {
    #[error("Position not found: {0}")]
    NotFound(String),

    #[error("Invalid protection config: {0}")]
    InvalidConfig(String),

    #[error("Invalid position state: {0}")]
    InvalidState(String),

    #[error("Position store error: {0}")]
    Store(String),

    #[error("Command sink error: {0}")]
    Sink(String),
}

pub type PositionResult<T> = Result<T, PositionError>;
