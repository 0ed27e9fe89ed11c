//! Market data normalization and aggregation.
//!
//! Turns raw exchange messages into canonical ticks and depth-limited order
//! books, merges streaming and fallback ticks per symbol, and decides when
//! the REST fallback path is needed.

pub mod book;
pub mod error;
pub mod fallback;
pub mod market_state;
pub mod parser;
pub mod symbol;

pub use book::{BookAggregator, BookRejection, OrderBookDelta};
pub use error::{FeedError, FeedResult};
pub use fallback::{FallbackConfig, FallbackController, FallbackPoller, FallbackTransition};
pub use market_state::{MarketState, TickDisposition};
pub use parser::{FeedEvent, Normalizer};
pub use symbol::{subscribe_payload, SymbolMap};
