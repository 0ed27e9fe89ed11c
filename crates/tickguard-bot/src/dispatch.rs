//! Stream event dispatch.
//!
//! Routes worker events to the normalizer, book aggregator, market state and
//! fallback controller. Holds no transport; everything here is driven by
//! [`StreamEvent`] values.

use std::sync::Arc;
use tickguard_core::PriceTick;
use tickguard_feed::{
    BookAggregator, FallbackController, FallbackTransition, FeedEvent, MarketState, Normalizer,
    TickDisposition,
};
use tickguard_telemetry::Metrics;
use tickguard_ws::{ConnectionPhase, StreamEvent};
use tracing::{debug, error, info, warn};

pub struct Dispatcher {
    normalizer: Normalizer,
    market_state: Arc<MarketState>,
    books: BookAggregator,
    fallback: Arc<FallbackController>,
}

impl Dispatcher {
    pub fn new(
        normalizer: Normalizer,
        market_state: Arc<MarketState>,
        books: BookAggregator,
        fallback: Arc<FallbackController>,
    ) -> Self {
        Self {
            normalizer,
            market_state,
            books,
            fallback,
        }
    }

    pub fn handle(&self, event: StreamEvent) {
        match event {
            StreamEvent::Phase {
                stream_id,
                from,
                to,
                attempts,
            } => self.on_phase(&stream_id, from, to, attempts),
            StreamEvent::Message {
                stream_id,
                text,
                received_at,
            } => self.on_message(&stream_id, &text, received_at),
            StreamEvent::Latency {
                stream_id,
                latency_ms,
            } => {
                Metrics::stream_latency(&stream_id, latency_ms as f64);
            }
        }
    }

    /// Offer a tick from either path to the market state.
    pub fn apply_tick(&self, tick: PriceTick) -> TickDisposition {
        let source = tick.source.to_string();
        let disposition = self.market_state.apply_tick(tick);
        Metrics::tick(&source, disposition.as_str());
        disposition
    }

    fn on_phase(&self, stream_id: &str, from: ConnectionPhase, to: ConnectionPhase, attempts: u32) {
        Metrics::stream_phase_set(stream_id, to.as_str());
        let transition = match to {
            ConnectionPhase::Connected => {
                info!(stream_id, %from, "Stream connected");
                // A reconnected depth stream starts a fresh update sequence.
                let symbol = self.normalizer.symbols().symbol_for_stream(stream_id);
                self.books.reset(&symbol);
                self.fallback.on_connected(stream_id)
            }
            ConnectionPhase::Reconnecting => {
                warn!(stream_id, attempts, "Stream reconnecting");
                Metrics::stream_reconnect(stream_id);
                self.fallback.on_failure(stream_id)
            }
            ConnectionPhase::Failed => {
                error!(stream_id, attempts, "Stream failed, retries exhausted");
                self.fallback.on_failure(stream_id)
            }
            ConnectionPhase::Connecting | ConnectionPhase::Disconnected => {
                debug!(stream_id, %from, %to, "Stream phase changed");
                FallbackTransition::Unchanged
            }
        };

        match transition {
            FallbackTransition::Activated => Metrics::fallback_active(true),
            FallbackTransition::Deactivated => Metrics::fallback_active(false),
            FallbackTransition::Unchanged => {}
        }
    }

    fn on_message(&self, stream_id: &str, text: &str, received_at: chrono::DateTime<chrono::Utc>) {
        let event = match self.normalizer.parse(Some(stream_id), text, received_at) {
            Ok(Some(event)) => event,
            Ok(None) => return,
            Err(e) => {
                warn!(stream_id, error = %e, "Dropping malformed market data message");
                Metrics::message_dropped("malformed");
                return;
            }
        };

        match event {
            FeedEvent::Tick(tick) => {
                self.apply_tick(tick);
            }
            FeedEvent::Depth(delta) => match self.books.apply(delta, received_at) {
                Ok(book) => self.market_state.apply_book(book),
                Err(rejection) => Metrics::book_rejected(rejection.as_str()),
            },
        }
    }
}
