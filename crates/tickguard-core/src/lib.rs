//! Core domain types for tickguard.
//!
//! This crate provides fundamental types used throughout the system:
//! - `Price`, `Size`: Precision-safe numeric types
//! - `Side`: Long/short position side
//! - `PriceTick`: Canonical normalized ticker update
//! - `OrderBookSnapshot`: Depth-limited ladder with spread metrics

pub mod book;
pub mod decimal;
pub mod error;
pub mod types;

pub use book::{BookLevel, OrderBookSnapshot};
pub use decimal::{Price, Size};
pub use error::{CoreError, Result};
pub use types::{PriceTick, Side, TickSource};
