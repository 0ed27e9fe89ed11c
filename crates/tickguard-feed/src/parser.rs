//! Message normalization for market data.
//!
//! Single adapter boundary between exchange wire formats and the canonical
//! [`PriceTick`] / [`OrderBookDelta`] types. Supported variants:
//! 1. Combined-stream envelope: `{"stream": "btcusdt@ticker", "data": {...}}`
//! 2. Streaming 24h ticker: `{"e": "24hrTicker", "s": "BTCUSDT", "c": ...}`
//! 3. REST 24h ticker: `{"symbol": "BTCUSDT", "lastPrice": ...}`
//! 4. Partial depth: `{"lastUpdateId": 1, "bids": [...], "asks": [...]}`
//!    (carries no symbol; needs the stream name)
//! 5. Diff depth: `{"e": "depthUpdate", "s": ..., "u": ..., "b": [...], "a": [...]}`
//!
//! Subscription acknowledgements and unrecognised events normalize to `None`.
//! Malformed payloads are logged and dropped.

use crate::book::OrderBookDelta;
use crate::error::{FeedError, FeedResult};
use crate::symbol::SymbolMap;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use std::str::FromStr;
use tickguard_core::{Price, PriceTick, Size, TickSource};
use tracing::{debug, warn};

/// Streaming 24h rolling-window ticker.
#[derive(Debug, Deserialize)]
pub struct RawStreamTicker {
    #[serde(rename = "E")]
    pub event_time: Option<i64>,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "c")]
    pub last_price: String,
    #[serde(rename = "b", default)]
    pub bid_price: Option<String>,
    #[serde(rename = "a", default)]
    pub ask_price: Option<String>,
    #[serde(rename = "P", default)]
    pub change_pct: Option<String>,
    #[serde(rename = "v", default)]
    pub volume: Option<String>,
    #[serde(rename = "h", default)]
    pub high_price: Option<String>,
    #[serde(rename = "l", default)]
    pub low_price: Option<String>,
}

/// REST 24h ticker. Older payloads use `price` instead of `lastPrice`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRestTicker {
    pub symbol: String,
    #[serde(alias = "price")]
    pub last_price: String,
    #[serde(default)]
    pub bid_price: Option<String>,
    #[serde(default)]
    pub ask_price: Option<String>,
    #[serde(default)]
    pub price_change_percent: Option<String>,
    #[serde(default)]
    pub volume: Option<String>,
    #[serde(default)]
    pub high_price: Option<String>,
    #[serde(default)]
    pub low_price: Option<String>,
    #[serde(default)]
    pub close_time: Option<i64>,
}

/// Partial book depth snapshot.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPartialDepth {
    last_update_id: u64,
    bids: Vec<(String, String)>,
    asks: Vec<(String, String)>,
}

/// Diff depth event.
#[derive(Debug, Deserialize)]
struct RawDepthUpdate {
    #[serde(rename = "E")]
    event_time: Option<i64>,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "u")]
    final_update_id: u64,
    #[serde(rename = "b")]
    bids: Vec<(String, String)>,
    #[serde(rename = "a")]
    asks: Vec<(String, String)>,
}

/// Normalized feed event.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Tick(PriceTick),
    Depth(OrderBookDelta),
}

impl FeedEvent {
    pub fn symbol(&self) -> &str {
        match self {
            Self::Tick(t) => &t.symbol,
            Self::Depth(d) => &d.symbol,
        }
    }
}

/// Wire-to-canonical message normalizer.
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    symbols: SymbolMap,
}

impl Normalizer {
    pub fn new(symbols: SymbolMap) -> Self {
        Self { symbols }
    }

    pub fn symbols(&self) -> &SymbolMap {
        &self.symbols
    }

    /// Normalize a message that identifies its own symbol.
    pub fn normalize(&self, raw: &str, received_at: DateTime<Utc>) -> Option<FeedEvent> {
        self.normalize_with_stream(None, raw, received_at)
    }

    /// Normalize a message received on `stream`. The stream name supplies the
    /// symbol for payloads that omit it.
    pub fn normalize_with_stream(
        &self,
        stream: Option<&str>,
        raw: &str,
        received_at: DateTime<Utc>,
    ) -> Option<FeedEvent> {
        match self.parse(stream, raw, received_at) {
            Ok(event) => event,
            Err(e) => {
                warn!(?stream, error = %e, "Dropping malformed market data message");
                None
            }
        }
    }

    /// Parse without swallowing errors.
    pub fn parse(
        &self,
        stream: Option<&str>,
        raw: &str,
        received_at: DateTime<Utc>,
    ) -> FeedResult<Option<FeedEvent>> {
        let value: Value = serde_json::from_str(raw)?;
        self.parse_value(stream, value, received_at)
    }

    fn parse_value(
        &self,
        stream: Option<&str>,
        mut value: Value,
        received_at: DateTime<Utc>,
    ) -> FeedResult<Option<FeedEvent>> {
        let Some(obj) = value.as_object_mut() else {
            debug!("Ignoring non-object message");
            return Ok(None);
        };

        // Combined-stream envelope: unwrap and recurse with the inner stream.
        if let Some(inner_stream) = obj.get("stream").and_then(Value::as_str).map(str::to_string) {
            if let Some(data) = obj.remove("data") {
                return self.parse_value(Some(&inner_stream), data, received_at);
            }
        }

        if obj.contains_key("result") && obj.contains_key("id") {
            debug!(id = ?obj.get("id"), "Subscription acknowledged");
            return Ok(None);
        }

        let event_type = obj.get("e").and_then(Value::as_str).map(str::to_string);
        match event_type.as_deref() {
            Some("24hrTicker") => {
                let raw: RawStreamTicker = serde_json::from_value(value)?;
                return self.stream_ticker(raw, received_at).map(|t| Some(FeedEvent::Tick(t)));
            }
            Some("depthUpdate") => {
                let raw: RawDepthUpdate = serde_json::from_value(value)?;
                let delta = OrderBookDelta {
                    symbol: self.symbols.to_canonical(&raw.symbol),
                    last_update_id: raw.final_update_id,
                    bids: parse_levels(&raw.bids)?,
                    asks: parse_levels(&raw.asks)?,
                    event_ts_ms: raw.event_time,
                };
                return Ok(Some(FeedEvent::Depth(delta)));
            }
            Some(other) => {
                debug!(event = other, "Ignoring unsupported event type");
                return Ok(None);
            }
            None => {}
        }

        if obj.contains_key("lastUpdateId") {
            let Some(stream) = stream else {
                debug!("Partial depth without stream name");
                return Ok(None);
            };
            let raw: RawPartialDepth = serde_json::from_value(value)?;
            let delta = OrderBookDelta {
                symbol: self.symbols.symbol_for_stream(stream),
                last_update_id: raw.last_update_id,
                bids: parse_levels(&raw.bids)?,
                asks: parse_levels(&raw.asks)?,
                event_ts_ms: None,
            };
            return Ok(Some(FeedEvent::Depth(delta)));
        }

        if obj.contains_key("symbol") && (obj.contains_key("lastPrice") || obj.contains_key("price")) {
            let raw: RawRestTicker = serde_json::from_value(value)?;
            return self
                .rest_ticker(raw, received_at, TickSource::Stream)
                .map(|t| Some(FeedEvent::Tick(t)));
        }

        debug!("Ignoring unrecognised message");
        Ok(None)
    }

    /// Convert a streaming ticker into a tick.
    pub fn stream_ticker(
        &self,
        raw: RawStreamTicker,
        received_at: DateTime<Utc>,
    ) -> FeedResult<PriceTick> {
        let price = parse_price(&raw.last_price)?;
        Ok(PriceTick {
            symbol: self.symbols.to_canonical(&raw.symbol),
            price,
            bid: parse_opt_price(raw.bid_price.as_deref())?,
            ask: parse_opt_price(raw.ask_price.as_deref())?,
            change_24h_pct: parse_opt_decimal(raw.change_pct.as_deref())?,
            volume_24h: Size::new(parse_opt_decimal(raw.volume.as_deref())?),
            high_24h: parse_opt_price(raw.high_price.as_deref())?.unwrap_or(price),
            low_24h: parse_opt_price(raw.low_price.as_deref())?.unwrap_or(price),
            source_ts_ms: raw.event_time.unwrap_or_else(|| received_at.timestamp_millis()),
            source: TickSource::Stream,
        })
    }

    /// Convert a REST ticker into a tick tagged with `source`.
    pub fn rest_ticker(
        &self,
        raw: RawRestTicker,
        received_at: DateTime<Utc>,
        source: TickSource,
    ) -> FeedResult<PriceTick> {
        let price = parse_price(&raw.last_price)?;
        Ok(PriceTick {
            symbol: self.symbols.to_canonical(&raw.symbol),
            price,
            bid: parse_opt_price(raw.bid_price.as_deref())?,
            ask: parse_opt_price(raw.ask_price.as_deref())?,
            change_24h_pct: parse_opt_decimal(raw.price_change_percent.as_deref())?,
            volume_24h: Size::new(parse_opt_decimal(raw.volume.as_deref())?),
            high_24h: parse_opt_price(raw.high_price.as_deref())?.unwrap_or(price),
            low_24h: parse_opt_price(raw.low_price.as_deref())?.unwrap_or(price),
            source_ts_ms: raw.close_time.unwrap_or_else(|| received_at.timestamp_millis()),
            source,
        })
    }
}

fn parse_decimal(s: &str) -> FeedResult<Decimal> {
    Decimal::from_str(s).map_err(|e| FeedError::ParseError(format!("Invalid number {s:?}: {e}")))
}

fn parse_opt_decimal(s: Option<&str>) -> FeedResult<Decimal> {
    s.map_or(Ok(Decimal::ZERO), parse_decimal)
}

/// Last price must be strictly positive.
fn parse_price(s: &str) -> FeedResult<Price> {
    let value = parse_decimal(s)?;
    if value <= Decimal::ZERO {
        return Err(FeedError::InvalidData(format!("Non-positive price: {s}")));
    }
    Ok(Price::new(value))
}

/// Optional quote; zero means "no quote" on this exchange.
fn parse_opt_price(s: Option<&str>) -> FeedResult<Option<Price>> {
    match s {
        Some(s) => {
            let value = parse_decimal(s)?;
            Ok((value > Decimal::ZERO).then(|| Price::new(value)))
        }
        None => Ok(None),
    }
}

fn parse_levels(levels: &[(String, String)]) -> FeedResult<Vec<(Price, Size)>> {
    levels
        .iter()
        .map(|(px, sz)| {
            let size = parse_decimal(sz)?;
            if size < Decimal::ZERO {
                return Err(FeedError::InvalidData(format!("Negative size: {sz}")));
            }
            Ok((Price::new(parse_decimal(px)?), Size::new(size)))
        })
        .collect()
}
