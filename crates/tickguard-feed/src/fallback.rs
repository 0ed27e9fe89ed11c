//! REST fallback path.
//!
//! [`FallbackController`] decides when the streaming path is degraded;
//! [`FallbackPoller`] fetches batch tickers for the degraded symbols. Ticks
//! from both paths merge in [`crate::MarketState`] by source timestamp.

use crate::error::{FeedError, FeedResult};
use crate::parser::{Normalizer, RawRestTicker};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use reqwest::Client;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tickguard_core::{PriceTick, TickSource};
use tracing::{debug, info, warn};

const TICKER_PATH: &str = "/api/v3/ticker/24hr";

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    pub enabled: bool,
    /// REST base URL (e.g. `https://api.binance.com`).
    pub rest_url: String,
    pub poll_interval_ms: u64,
    /// Consecutive connection failures before a stream counts as degraded.
    pub activation_threshold: u32,
    pub request_timeout_ms: u64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rest_url: "https://api.binance.com".to_string(),
            poll_interval_ms: 5_000,
            activation_threshold: 3,
            request_timeout_ms: 5_000,
        }
    }
}

impl FallbackConfig {
    pub fn validate(&self) -> FeedResult<()> {
        if self.poll_interval_ms == 0 {
            return Err(FeedError::InvalidConfig(
                "fallback poll_interval_ms must be > 0".to_string(),
            ));
        }
        if self.activation_threshold == 0 {
            return Err(FeedError::InvalidConfig(
                "fallback activation_threshold must be >= 1".to_string(),
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(FeedError::InvalidConfig(
                "fallback request_timeout_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Activation policy
// ============================================================================

/// Change in overall fallback activation caused by one stream signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackTransition {
    Activated,
    Deactivated,
    Unchanged,
}

#[derive(Debug)]
struct StreamHealth {
    symbol: String,
    consecutive_failures: u32,
    degraded: bool,
}

/// Tracks consecutive failures per stream.
///
/// A stream becomes degraded after `threshold` consecutive failures and
/// recovers on its next successful connection. Fallback is active while any
/// stream is degraded.
#[derive(Debug)]
pub struct FallbackController {
    threshold: u32,
    streams: RwLock<HashMap<String, StreamHealth>>,
}

impl FallbackController {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            streams: RwLock::new(HashMap::new()),
        }
    }

    /// Associate a stream with the symbol it carries.
    pub fn register(&self, stream_id: impl Into<String>, symbol: impl Into<String>) {
        self.streams.write().insert(
            stream_id.into(),
            StreamHealth {
                symbol: symbol.into(),
                consecutive_failures: 0,
                degraded: false,
            },
        );
    }

    /// A connection attempt or live transport failed.
    pub fn on_failure(&self, stream_id: &str) -> FallbackTransition {
        let mut streams = self.streams.write();
        let was_active = streams.values().any(|s| s.degraded);
        let Some(health) = streams.get_mut(stream_id) else {
            return FallbackTransition::Unchanged;
        };
        health.consecutive_failures = health.consecutive_failures.saturating_add(1);
        if !health.degraded && health.consecutive_failures >= self.threshold {
            health.degraded = true;
            warn!(
                stream_id,
                symbol = %health.symbol,
                failures = health.consecutive_failures,
                "Stream degraded, fallback polling engaged"
            );
        }
        if !was_active && streams.values().any(|s| s.degraded) {
            info!("Fallback path activated");
            FallbackTransition::Activated
        } else {
            FallbackTransition::Unchanged
        }
    }

    /// The stream reached `Connected`.
    pub fn on_connected(&self, stream_id: &str) -> FallbackTransition {
        let mut streams = self.streams.write();
        let was_active = streams.values().any(|s| s.degraded);
        let Some(health) = streams.get_mut(stream_id) else {
            return FallbackTransition::Unchanged;
        };
        health.consecutive_failures = 0;
        if health.degraded {
            health.degraded = false;
            info!(stream_id, symbol = %health.symbol, "Stream recovered");
        }
        if was_active && !streams.values().any(|s| s.degraded) {
            info!("Fallback path deactivated");
            FallbackTransition::Deactivated
        } else {
            FallbackTransition::Unchanged
        }
    }

    pub fn is_active(&self) -> bool {
        self.streams.read().values().any(|s| s.degraded)
    }

    pub fn consecutive_failures(&self, stream_id: &str) -> Option<u32> {
        self.streams
            .read()
            .get(stream_id)
            .map(|s| s.consecutive_failures)
    }

    /// Symbols with at least one degraded stream, sorted.
    pub fn degraded_symbols(&self) -> Vec<String> {
        self.streams
            .read()
            .values()
            .filter(|s| s.degraded)
            .map(|s| s.symbol.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

// ============================================================================
// Poller
// ============================================================================

/// Batch REST ticker client.
pub struct FallbackPoller {
    client: Client,
    ticker_url: String,
    normalizer: Normalizer,
}

impl FallbackPoller {
    pub fn new(
        rest_url: &str,
        normalizer: Normalizer,
        request_timeout: Duration,
    ) -> FeedResult<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| FeedError::HttpClient(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            ticker_url: format!("{}{TICKER_PATH}", rest_url.trim_end_matches('/')),
            normalizer,
        })
    }

    /// Fetch ticks for canonical `symbols`, keyed by canonical symbol.
    pub async fn poll(&self, symbols: &[String]) -> FeedResult<HashMap<String, PriceTick>> {
        if symbols.is_empty() {
            return Ok(HashMap::new());
        }
        let wire: Vec<String> = symbols
            .iter()
            .map(|s| self.normalizer.symbols().to_wire(s))
            .collect();
        let param = serde_json::to_string(&wire)?;
        debug!(url = %self.ticker_url, symbols = %param, "Polling fallback tickers");

        let response = self
            .client
            .get(&self.ticker_url)
            .query(&[("symbols", param.as_str())])
            .send()
            .await
            .map_err(|e| FeedError::HttpClient(format!("HTTP request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FeedError::HttpClient(format!("HTTP {status}: {body}")));
        }

        let body = response
            .text()
            .await
            .map_err(|e| FeedError::HttpClient(format!("Failed to read response: {e}")))?;
        self.parse_ticker_batch(&body, Utc::now())
    }

    /// Parse a batch ticker response. Individual bad entries are skipped.
    pub fn parse_ticker_batch(
        &self,
        body: &str,
        received_at: DateTime<Utc>,
    ) -> FeedResult<HashMap<String, PriceTick>> {
        let raw: Vec<RawRestTicker> = serde_json::from_str(body)?;
        let mut ticks = HashMap::with_capacity(raw.len());
        for entry in raw {
            let symbol = entry.symbol.clone();
            match self
                .normalizer
                .rest_ticker(entry, received_at, TickSource::Fallback)
            {
                Ok(tick) => {
                    ticks.insert(tick.symbol.clone(), tick);
                }
                Err(e) => warn!(%symbol, error = %e, "Skipping invalid fallback ticker"),
            }
        }
        Ok(ticks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use tickguard_core::Price;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_activation_after_threshold_and_recovery() {
        let controller = FallbackController::new(3);
        controller.register("btcusdt@ticker", "BTC/USDT");

        let transitions: Vec<_> = (0..5)
            .map(|_| controller.on_failure("btcusdt@ticker"))
            .collect();
        assert_eq!(
            transitions,
            vec![
                FallbackTransition::Unchanged,
                FallbackTransition::Unchanged,
                FallbackTransition::Activated,
                FallbackTransition::Unchanged,
                FallbackTransition::Unchanged,
            ]
        );
        assert!(controller.is_active());
        assert_eq!(controller.degraded_symbols(), vec!["BTC/USDT".to_string()]);

        assert_eq!(
            controller.on_connected("btcusdt@ticker"),
            FallbackTransition::Deactivated
        );
        assert!(!controller.is_active());
        assert_eq!(controller.consecutive_failures("btcusdt@ticker"), Some(0));
    }

    #[test]
    fn test_success_resets_consecutive_count() {
        let controller = FallbackController::new(3);
        controller.register("s", "BTC/USDT");
        controller.on_failure("s");
        controller.on_failure("s");
        controller.on_connected("s");
        controller.on_failure("s");
        assert!(!controller.is_active());
    }

    #[test]
    fn test_stays_active_until_all_streams_recover() {
        let controller = FallbackController::new(1);
        controller.register("btc", "BTC/USDT");
        controller.register("eth", "ETH/USDT");
        assert_eq!(controller.on_failure("btc"), FallbackTransition::Activated);
        assert_eq!(controller.on_failure("eth"), FallbackTransition::Unchanged);
        assert_eq!(controller.on_connected("btc"), FallbackTransition::Unchanged);
        assert_eq!(controller.degraded_symbols(), vec!["ETH/USDT".to_string()]);
        assert_eq!(controller.on_connected("eth"), FallbackTransition::Deactivated);
    }

    #[test]
    fn test_unknown_stream_ignored() {
        let controller = FallbackController::new(1);
        assert_eq!(controller.on_failure("nope"), FallbackTransition::Unchanged);
        assert!(!controller.is_active());
    }

    #[test]
    fn test_parse_ticker_batch() {
        let poller = FallbackPoller::new(
            "https://api.example.com/",
            Normalizer::default(),
            Duration::from_secs(1),
        )
        .unwrap();
        let body = r#"[
            {"symbol":"BTCUSDT","lastPrice":"50000.1","highPrice":"51000","lowPrice":"49000","closeTime":1700000000000},
            {"symbol":"ETHUSDT","lastPrice":"-1"}
        ]"#;
        let ticks = poller.parse_ticker_batch(body, Utc::now()).unwrap();
        assert_eq!(ticks.len(), 1);
        let tick = &ticks["BTC/USDT"];
        assert_eq!(tick.price, Price::new(dec!(50000.1)));
        assert_eq!(tick.source, TickSource::Fallback);
        assert_eq!(poller.ticker_url, "https://api.example.com/api/v3/ticker/24hr");
    }

    fn poller(server: &MockServer) -> FallbackPoller {
        FallbackPoller::new(&server.uri(), Normalizer::default(), Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn test_batch_request_uses_wire_symbols() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(TICKER_PATH))
            .and(query_param("symbols", r#"["BTCUSDT","ETHUSDT"]"#))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"[{"symbol":"BTCUSDT","lastPrice":"50000","closeTime":1700000000000},
                    {"symbol":"ETHUSDT","lastPrice":"3000","closeTime":1700000000000}]"#,
            ))
            .expect(1)
            .mount(&server)
            .await;

        let symbols = vec!["BTC/USDT".to_string(), "ETH/USDT".to_string()];
        let ticks = poller(&server).poll(&symbols).await.unwrap();
        assert_eq!(ticks.len(), 2);
        assert_eq!(ticks["ETH/USDT"].price, Price::new(dec!(3000)));
        assert_eq!(ticks["BTC/USDT"].source_ts_ms, 1_700_000_000_000);
    }

    #[tokio::test]
    async fn test_non_success_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(TICKER_PATH))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .mount(&server)
            .await;

        let err = poller(&server)
            .poll(&["BTC/USDT".to_string()])
            .await
            .unwrap_err();
        match err {
            FeedError::HttpClient(msg) => {
                assert!(msg.contains("429"));
                assert!(msg.contains("rate limited"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_no_symbols_no_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
            .expect(0)
            .mount(&server)
            .await;

        let ticks = poller(&server).poll(&[]).await.unwrap();
        assert!(ticks.is_empty());
    }

    #[test]
    fn test_config_validation() {
        tokio_test::assert_ok!(FallbackConfig::default().validate());
        let config = FallbackConfig {
            activation_threshold: 0,
            ..Default::default()
        };
        tokio_test::assert_err!(config.validate());
    }
}
