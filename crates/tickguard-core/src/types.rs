//! Canonical market data and position types.
//!
//! Everything downstream of the normalizer works with these shapes only;
//! wire-format variants never leak past the feed crate.

use crate::{CoreError, Price, Size};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Position side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// Returns 1 for long, -1 for short.
    pub fn sign(&self) -> Decimal {
        match self {
            Self::Long => Decimal::ONE,
            Self::Short => Decimal::NEGATIVE_ONE,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
        }
    }
}

impl FromStr for Side {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "long" | "buy" => Ok(Self::Long),
            "short" | "sell" => Ok(Self::Short),
            other => Err(CoreError::InvalidSide(other.to_string())),
        }
    }
}

/// Which data path produced a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TickSource {
    /// Streaming ticker channel.
    Stream,
    /// REST fallback poller.
    Fallback,
}

impl fmt::Display for TickSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stream => write!(f, "stream"),
            Self::Fallback => write!(f, "fallback"),
        }
    }
}

/// A single normalized price update for one symbol.
///
/// Immutable once produced. `symbol` is always the canonical internal form
/// (e.g. `BTC/USDT`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceTick {
    pub symbol: String,
    /// Last traded price.
    pub price: Price,
    pub bid: Option<Price>,
    pub ask: Option<Price>,
    /// 24h price change in percent.
    pub change_24h_pct: Decimal,
    /// 24h base-asset volume.
    pub volume_24h: Size,
    pub high_24h: Price,
    pub low_24h: Price,
    /// Exchange event time (Unix ms). Stamped with receive time when the
    /// wire message carries none.
    pub source_ts_ms: i64,
    pub source: TickSource,
}

impl PriceTick {
    /// 24h high/low range as a percentage of the last price.
    pub fn range_24h_pct(&self) -> Option<Decimal> {
        if !self.price.is_positive() || self.high_24h < self.low_24h {
            return None;
        }
        Some((self.high_24h.inner() - self.low_24h.inner()) / self.price.inner() * Decimal::ONE_HUNDRED)
    }

    /// Same market content, ignoring which path delivered it.
    pub fn same_content(&self, other: &PriceTick) -> bool {
        self.symbol == other.symbol
            && self.source_ts_ms == other.source_ts_ms
            && self.price == other.price
            && self.bid == other.bid
            && self.ask == other.ask
    }
}
