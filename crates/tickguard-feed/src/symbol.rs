//! Symbol mapping between wire and canonical form.
//!
//! The exchange concatenates base and quote (`BTCUSDT`); internally symbols
//! are `BASE/QUOTE` (`BTC/USDT`). Mapping uses a fixed table of quote
//! suffixes, longest first.

use serde::Serialize;

/// Quote assets recognised as suffixes, longest first so `FDUSD` wins over
/// shorter overlaps.
const KNOWN_QUOTES: &[&str] = &[
    "FDUSD", "USDT", "USDC", "BUSD", "TUSD", "BTC", "ETH", "BNB", "EUR", "TRY",
];

/// Separators accepted in externally supplied symbols.
const SEPARATORS: &[char] = &['/', '-', '_'];

/// Bidirectional symbol mapper.
#[derive(Debug, Clone)]
pub struct SymbolMap {
    default_quote: String,
}

impl Default for SymbolMap {
    fn default() -> Self {
        Self::new("USDT")
    }
}

impl SymbolMap {
    pub fn new(default_quote: impl Into<String>) -> Self {
        Self {
            default_quote: default_quote.into().to_ascii_uppercase(),
        }
    }

    pub fn default_quote(&self) -> &str {
        &self.default_quote
    }

    /// Wire (`BTCUSDT`, `btcusdt`) to canonical (`BTC/USDT`).
    ///
    /// Symbols with a separator are normalised to `/`; symbols without a
    /// known quote suffix pass through unchanged.
    pub fn to_canonical(&self, wire: &str) -> String {
        if wire.contains(SEPARATORS) {
            return wire.to_ascii_uppercase().replace(SEPARATORS, "/");
        }
        let upper = wire.to_ascii_uppercase();
        match split_quote(&upper) {
            Some((base, quote)) => format!("{base}/{quote}"),
            None => wire.to_string(),
        }
    }

    /// Canonical (`BTC/USDT`) or bare base (`BTC`) to wire (`BTCUSDT`).
    pub fn to_wire(&self, canonical: &str) -> String {
        let upper = canonical.to_ascii_uppercase();
        if upper.contains(SEPARATORS) {
            return upper.replace(SEPARATORS, "");
        }
        if split_quote(&upper).is_some() {
            upper
        } else {
            format!("{upper}{}", self.default_quote)
        }
    }

    /// Canonical form of a configured symbol, inserting the default quote
    /// for a bare base.
    pub fn canonicalize(&self, configured: &str) -> String {
        self.to_canonical(&self.to_wire(configured))
    }

    /// Ticker stream name (`btcusdt@ticker`).
    pub fn ticker_stream(&self, canonical: &str) -> String {
        format!("{}@ticker", self.to_wire(canonical).to_ascii_lowercase())
    }

    /// Partial-depth stream name (`btcusdt@depth20@100ms`).
    pub fn depth_stream(&self, canonical: &str, depth: usize, cadence_ms: u64) -> String {
        format!(
            "{}@depth{depth}@{cadence_ms}ms",
            self.to_wire(canonical).to_ascii_lowercase()
        )
    }

    /// Canonical symbol for a stream name (`btcusdt@ticker` -> `BTC/USDT`).
    pub fn symbol_for_stream(&self, stream: &str) -> String {
        let wire = stream.split('@').next().unwrap_or(stream);
        self.to_canonical(wire)
    }
}

fn split_quote(upper: &str) -> Option<(&str, &str)> {
    KNOWN_QUOTES.iter().find_map(|quote| {
        upper
            .strip_suffix(quote)
            .filter(|base| !base.is_empty())
            .map(|base| (base, *quote))
    })
}

#[derive(Serialize)]
struct SubscribeRequest<'a> {
    method: &'static str,
    params: &'a [String],
    id: u64,
}

/// `SUBSCRIBE` request for a set of stream names.
pub fn subscribe_payload(streams: &[String], id: u64) -> String {
    let request = SubscribeRequest {
        method: "SUBSCRIBE",
        params: streams,
        id,
    };
    // Serialising a struct of strings and integers cannot fail.
    serde_json::to_string(&request).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_to_canonical() {
        let map = SymbolMap::default();
        assert_eq!(map.to_canonical("BTCUSDT"), "BTC/USDT");
        assert_eq!(map.to_canonical("ethbtc"), "ETH/BTC");
        assert_eq!(map.to_canonical("SOLFDUSD"), "SOL/FDUSD");
        assert_eq!(map.to_canonical("eth-usdc"), "ETH/USDC");
    }

    #[test]
    fn test_unmapped_passes_through() {
        let map = SymbolMap::default();
        assert_eq!(map.to_canonical("XAUUSD"), "XAUUSD");
        assert_eq!(map.to_canonical("BTC"), "BTC");
    }

    #[test]
    fn test_canonical_to_wire() {
        let map = SymbolMap::default();
        assert_eq!(map.to_wire("BTC/USDT"), "BTCUSDT");
        assert_eq!(map.to_wire("btc"), "BTCUSDT");
        assert_eq!(map.to_wire("ETHBTC"), "ETHBTC");
        assert_eq!(SymbolMap::new("usdc").to_wire("SOL"), "SOLUSDC");
    }

    #[test]
    fn test_canonicalize_configured_symbols() {
        let map = SymbolMap::default();
        assert_eq!(map.canonicalize("BTC"), "BTC/USDT");
        assert_eq!(map.canonicalize("eth/usdt"), "ETH/USDT");
    }

    #[test]
    fn test_stream_names() {
        let map = SymbolMap::default();
        assert_eq!(map.ticker_stream("BTC/USDT"), "btcusdt@ticker");
        assert_eq!(map.depth_stream("ETH/USDT", 20, 100), "ethusdt@depth20@100ms");
        assert_eq!(map.symbol_for_stream("ethusdt@depth20@100ms"), "ETH/USDT");
    }

    #[test]
    fn test_subscribe_payload() {
        let payload = subscribe_payload(&["btcusdt@ticker".to_string()], 7);
        assert_eq!(
            payload,
            r#"{"method":"SUBSCRIBE","params":["btcusdt@ticker"],"id":7}"#
        );
    }
}
