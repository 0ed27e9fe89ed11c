//! Persistence error types.

use thiserror::Error;
use tickguard_position::PositionError;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;

impl From<PersistenceError> for PositionError {
    fn from(err: PersistenceError) -> Self {
        PositionError::Store(err.to_string())
    }
}

impl PersistenceError {
    pub(crate) fn into_sink(self) -> PositionError {
        PositionError::Sink(self.to_string())
    }
}
