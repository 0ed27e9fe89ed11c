//! Error types for tickguard-core.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    /// Side text that is neither long/buy nor short/sell.
    #[error("Invalid side: {0}")]
    InvalidSide(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
