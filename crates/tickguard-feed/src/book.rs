//! Order book aggregation.
//!
//! Every depth message rebuilds the ladder wholesale; there is no diff
//! patching. Levels are sorted, zero sizes dropped, the ladder truncated to
//! the configured depth and cumulative sizes computed in one forward scan.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::cmp::Reverse;
use tickguard_core::{BookLevel, OrderBookSnapshot, Price, Size};
use tracing::debug;

/// Depth levels as parsed from one wire message, unsorted.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderBookDelta {
    pub symbol: String,
    pub last_update_id: u64,
    pub bids: Vec<(Price, Size)>,
    pub asks: Vec<(Price, Size)>,
    /// Exchange event time when the message carries one.
    pub event_ts_ms: Option<i64>,
}

/// Why a depth message did not produce a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookRejection {
    /// `last_update_id` went backwards.
    StaleUpdate { previous: u64, received: u64 },
    /// Best bid at or above best ask.
    Crossed { best_bid: Price, best_ask: Price },
}

impl BookRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StaleUpdate { .. } => "stale_update",
            Self::Crossed { .. } => "crossed",
        }
    }
}

/// Per-symbol depth aggregator.
pub struct BookAggregator {
    depth_limit: usize,
    last_update_ids: DashMap<String, u64>,
}

impl BookAggregator {
    pub fn new(depth_limit: usize) -> Self {
        Self {
            depth_limit: depth_limit.max(1),
            last_update_ids: DashMap::new(),
        }
    }

    pub fn depth_limit(&self) -> usize {
        self.depth_limit
    }

    /// Build a snapshot from `delta`.
    ///
    /// Equal update ids are accepted; a lower id than the last accepted one
    /// for the symbol is rejected, as is a crossed book. Rejected messages
    /// leave the recorded update id untouched.
    pub fn apply(
        &self,
        delta: OrderBookDelta,
        captured_at: DateTime<Utc>,
    ) -> Result<OrderBookSnapshot, BookRejection> {
        if let Some(previous) = self.last_update_ids.get(&delta.symbol).map(|v| *v) {
            if delta.last_update_id < previous {
                debug!(
                    symbol = %delta.symbol,
                    previous,
                    received = delta.last_update_id,
                    "Discarding out-of-order depth message"
                );
                return Err(BookRejection::StaleUpdate {
                    previous,
                    received: delta.last_update_id,
                });
            }
        }

        let mut bids = delta.bids;
        bids.sort_by_key(|(price, _)| Reverse(*price));
        let bids = build_ladder(bids, self.depth_limit);

        let mut asks = delta.asks;
        asks.sort_by_key(|(price, _)| *price);
        let asks = build_ladder(asks, self.depth_limit);

        let best_bid = bids.first().map(|l| l.price);
        let best_ask = asks.first().map(|l| l.price);

        let (spread, spread_pct) = match (best_bid, best_ask) {
            (Some(bid), Some(ask)) => {
                if bid >= ask {
                    debug!(symbol = %delta.symbol, %bid, %ask, "Discarding crossed book");
                    return Err(BookRejection::Crossed {
                        best_bid: bid,
                        best_ask: ask,
                    });
                }
                let spread = ask - bid;
                let mid = (bid.inner() + ask.inner()) / Decimal::TWO;
                (Some(spread), Some(spread.inner() / mid * Decimal::ONE_HUNDRED))
            }
            _ => (None, None),
        };

        self.last_update_ids
            .insert(delta.symbol.clone(), delta.last_update_id);

        Ok(OrderBookSnapshot {
            symbol: delta.symbol,
            bids,
            asks,
            best_bid,
            best_ask,
            spread,
            spread_pct,
            last_update_id: delta.last_update_id,
            captured_at,
        })
    }

    /// Forget a symbol's update id (e.g. after its stream reconnects with a
    /// fresh sequence).
    pub fn reset(&self, symbol: &str) {
        self.last_update_ids.remove(symbol);
    }
}

fn build_ladder(levels: Vec<(Price, Size)>, depth: usize) -> Vec<BookLevel> {
    let mut running = Size::ZERO;
    levels
        .into_iter()
        .filter(|(_, size)| size.is_positive())
        .take(depth)
        .map(|(price, size)| {
            running = running + size;
            BookLevel {
                price,
                size,
                cumulative_size: running,
            }
        })
        .collect()
}
