//! Per-symbol market state.
//!
//! Holds the latest accepted tick and book per symbol and fans them out on
//! broadcast channels. Streaming and fallback ticks land here alike; the
//! newest source timestamp wins regardless of which path delivered it.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tickguard_core::{OrderBookSnapshot, PriceTick};
use tokio::sync::broadcast;
use tracing::trace;

/// What happened to a tick offered to [`MarketState::apply_tick`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickDisposition {
    Accepted,
    /// Same timestamp and content as the current tick.
    Duplicate,
    /// Older than the current tick.
    Stale,
}

impl TickDisposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Duplicate => "duplicate",
            Self::Stale => "stale",
        }
    }
}

/// Aggregated market state manager.
pub struct MarketState {
    ticks: DashMap<String, PriceTick>,
    books: DashMap<String, OrderBookSnapshot>,
    tick_tx: broadcast::Sender<PriceTick>,
    book_tx: broadcast::Sender<OrderBookSnapshot>,
}

impl MarketState {
    /// `capacity` bounds each broadcast channel; slow subscribers lag rather
    /// than block publishers.
    pub fn new(capacity: usize) -> Self {
        let (tick_tx, _) = broadcast::channel(capacity.max(1));
        let (book_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            ticks: DashMap::new(),
            books: DashMap::new(),
            tick_tx,
            book_tx,
        }
    }

    pub fn subscribe_ticks(&self) -> broadcast::Receiver<PriceTick> {
        self.tick_tx.subscribe()
    }

    pub fn subscribe_books(&self) -> broadcast::Receiver<OrderBookSnapshot> {
        self.book_tx.subscribe()
    }

    /// Offer a tick; accepted ticks are stored and published.
    pub fn apply_tick(&self, tick: PriceTick) -> TickDisposition {
        let disposition = match self.ticks.entry(tick.symbol.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(tick.clone());
                TickDisposition::Accepted
            }
            Entry::Occupied(mut slot) => {
                let current = slot.get();
                if tick.source_ts_ms > current.source_ts_ms
                    || (tick.source_ts_ms == current.source_ts_ms && !tick.same_content(current))
                {
                    slot.insert(tick.clone());
                    TickDisposition::Accepted
                } else if tick.same_content(current) {
                    TickDisposition::Duplicate
                } else {
                    TickDisposition::Stale
                }
            }
        };

        if disposition == TickDisposition::Accepted {
            // No subscribers is fine.
            let _ = self.tick_tx.send(tick);
        } else {
            trace!(symbol = %tick.symbol, ts = tick.source_ts_ms, disposition = disposition.as_str(), "Tick not applied");
        }
        disposition
    }

    /// Store and publish a book snapshot.
    pub fn apply_book(&self, book: OrderBookSnapshot) {
        self.books.insert(book.symbol.clone(), book.clone());
        let _ = self.book_tx.send(book);
    }

    pub fn latest_tick(&self, symbol: &str) -> Option<PriceTick> {
        self.ticks.get(symbol).map(|t| t.clone())
    }

    pub fn latest_book(&self, symbol: &str) -> Option<OrderBookSnapshot> {
        self.books.get(symbol).map(|b| b.clone())
    }

    pub fn symbols(&self) -> Vec<String> {
        self.ticks.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use tickguard_core::{Price, Size, TickSource};

    fn tick(ts: i64, price: Decimal, source: TickSource) -> PriceTick {
        PriceTick {
            symbol: "BTC/USDT".to_string(),
            price: Price::new(price),
            bid: None,
            ask: None,
            change_24h_pct: Decimal::ZERO,
            volume_24h: Size::ZERO,
            high_24h: Price::new(price),
            low_24h: Price::new(price),
            source_ts_ms: ts,
            source,
        }
    }

    #[test]
    fn test_latest_timestamp_wins_across_sources() {
        let state = MarketState::new(16);
        assert_eq!(
            state.apply_tick(tick(100, dec!(50000), TickSource::Stream)),
            TickDisposition::Accepted
        );
        assert_eq!(
            state.apply_tick(tick(90, dec!(49000), TickSource::Fallback)),
            TickDisposition::Stale
        );
        assert_eq!(
            state.apply_tick(tick(110, dec!(50100), TickSource::Fallback)),
            TickDisposition::Accepted
        );
        let latest = state.latest_tick("BTC/USDT").unwrap();
        assert_eq!(latest.source, TickSource::Fallback);
        assert_eq!(latest.price, Price::new(dec!(50100)));
    }

    #[test]
    fn test_duplicate_dropped_but_same_ts_new_content_accepted() {
        let state = MarketState::new(16);
        state.apply_tick(tick(100, dec!(50000), TickSource::Stream));
        assert_eq!(
            state.apply_tick(tick(100, dec!(50000), TickSource::Fallback)),
            TickDisposition::Duplicate
        );
        assert_eq!(
            state.apply_tick(tick(100, dec!(50001), TickSource::Stream)),
            TickDisposition::Accepted
        );
    }

    #[tokio::test]
    async fn test_accepted_ticks_are_published() {
        let state = MarketState::new(16);
        let mut rx = state.subscribe_ticks();
        state.apply_tick(tick(100, dec!(50000), TickSource::Stream));
        state.apply_tick(tick(50, dec!(1), TickSource::Stream));
        state.apply_tick(tick(200, dec!(50010), TickSource::Stream));

        assert_eq!(rx.recv().await.unwrap().source_ts_ms, 100);
        assert_eq!(rx.recv().await.unwrap().source_ts_ms, 200);
        assert!(rx.try_recv().is_err());
    }
}
