//! Depth-limited order book snapshot.

use crate::{Price, Size};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One ladder level with the running total from the top of book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: Price,
    pub size: Size,
    pub cumulative_size: Size,
}

/// Bid/ask ladder rebuilt wholesale from one depth message.
///
/// Bids are ordered descending, asks ascending. `spread` and `spread_pct`
/// are `None` when either side is empty; a missing side is never reported
/// as a zero spread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub symbol: String,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub best_bid: Option<Price>,
    pub best_ask: Option<Price>,
    pub spread: Option<Price>,
    /// Spread relative to mid, in percent.
    pub spread_pct: Option<Decimal>,
    pub last_update_id: u64,
    pub captured_at: DateTime<Utc>,
}

impl OrderBookSnapshot {
    /// Mid price when both sides are present.
    pub fn mid_price(&self) -> Option<Price> {
        match (self.best_bid, self.best_ask) {
            (Some(bid), Some(ask)) => Some(Price::new((bid.inner() + ask.inner()) / Decimal::TWO)),
            _ => None,
        }
    }

    /// Total size on the bid side within the retained depth.
    pub fn bid_depth(&self) -> Size {
        self.bids.last().map(|l| l.cumulative_size).unwrap_or(Size::ZERO)
    }

    /// Total size on the ask side within the retained depth.
    pub fn ask_depth(&self) -> Size {
        self.asks.last().map(|l| l.cumulative_size).unwrap_or(Size::ZERO)
    }
}
