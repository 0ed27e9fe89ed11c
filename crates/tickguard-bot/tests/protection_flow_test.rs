//! Protection flow integration tests.
//!
//! Drives ticks through market state into the protection engine and checks
//! the close commands that reach the journal and the store.

mod integration;
use integration::common::mock_ws::MockWsServer;

use chrono::Utc;
use rust_decimal_macros::dec;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tickguard_bot::{AppConfig, Application};
use tickguard_core::{Price, PriceTick, Side, Size, TickSource};
use tickguard_feed::{MarketState, TickDisposition};
use tickguard_persistence::{read_journal, CommandJournal, MemoryPositionStore};
use tickguard_position::{
    CloseCommand, CloseReason, EngineConfig, LadderStep, PositionRecord, ProtectionConfig,
    ProtectionEngine, StaticConfigSource, StopLossRule, TakeProfitRule,
};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

fn position(id: &str, symbol: &str, side: Side, entry: rust_decimal::Decimal) -> PositionRecord {
    PositionRecord {
        id: id.to_string(),
        symbol: symbol.to_string(),
        side,
        entry_price: Price::new(entry),
        size: Size::new(dec!(1)),
        opened_at: Utc::now(),
        atr: None,
    }
}

fn tick(symbol: &str, price: rust_decimal::Decimal, ts: i64) -> PriceTick {
    PriceTick {
        symbol: symbol.to_string(),
        price: Price::new(price),
        bid: None,
        ask: None,
        change_24h_pct: dec!(0),
        volume_24h: Size::new(dec!(100)),
        high_24h: Price::new(price),
        low_24h: Price::new(price),
        source_ts_ms: ts,
        source: TickSource::Stream,
    }
}

/// Every command journaled under `dir`, in file then line order.
fn journaled(dir: &Path) -> Vec<CloseCommand> {
    let mut paths: Vec<_> = std::fs::read_dir(dir)
        .map(|entries| entries.filter_map(|e| e.ok().map(|e| e.path())).collect())
        .unwrap_or_default();
    paths.sort();
    paths
        .into_iter()
        .flat_map(|p| read_journal(p).unwrap_or_default())
        .collect()
}

async fn wait_for_commands(dir: &Path, count: usize) -> Vec<CloseCommand> {
    timeout(Duration::from_secs(5), async {
        loop {
            let commands = journaled(dir);
            if commands.len() >= count {
                return commands;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("close commands not journaled in time")
}

#[tokio::test]
async fn test_stream_ticks_trigger_stop_and_target() {
    let server = MockWsServer::start().await;
    let journal_dir = TempDir::new().unwrap();

    let config = AppConfig::from_toml(&format!(
        r#"
        [stream]
        base_url = "{}"
        symbols = ["BTC", "ETH"]
        depth_enabled = false
        initial_backoff_ms = 50
        max_backoff_ms = 200

        [fallback]
        enabled = false

        [protection]
        stop_loss = {{ kind = "fixed", pct = 2 }}
        take_profit = {{ kind = "fixed", pct = 5 }}

        [engine]
        sync_interval_ms = 200
        sweep_interval_ms = 100
        "#,
        server.base_url()
    ))
    .unwrap();

    let store = Arc::new(MemoryPositionStore::new());
    store.upsert(position("btc-1", "BTC/USDT", Side::Long, dec!(50000)));
    store.upsert(position("eth-1", "ETH/USDT", Side::Short, dec!(3000)));
    let journal = Arc::new(CommandJournal::open(journal_dir.path()).unwrap());

    let app = Application::with_collaborators(config, store.clone(), journal);
    let engine = app.engine();
    let shutdown = CancellationToken::new();
    let run = tokio::spawn(app.run_until(shutdown.clone()));

    timeout(Duration::from_secs(5), async {
        while server.subscriptions().await.len() < 2 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("streams did not subscribe");
    assert_eq!(engine.session_count(), 2);

    // Within bounds: nothing fires.
    server.push(r#"{"e":"24hrTicker","E":1000,"s":"BTCUSDT","c":"50400","h":"50500","l":"49500"}"#);
    // Stop at 49000 for the long.
    server.push(r#"{"e":"24hrTicker","E":2000,"s":"BTCUSDT","c":"48900","h":"50500","l":"48900"}"#);
    // Target at 2850 for the short.
    server.push(r#"{"e":"24hrTicker","E":2000,"s":"ETHUSDT","c":"2840","h":"3010","l":"2840"}"#);

    let commands = wait_for_commands(journal_dir.path(), 2).await;
    let btc = commands.iter().find(|c| c.position_id == "btc-1").unwrap();
    assert_eq!(btc.reason, CloseReason::StopLoss);
    assert_eq!(btc.side, Side::Long);
    assert_eq!(btc.fraction, None);
    assert_eq!(btc.trigger_price, Some(Price::new(dec!(48900))));
    let eth = commands.iter().find(|c| c.position_id == "eth-1").unwrap();
    assert_eq!(eth.reason, CloseReason::TakeProfit);

    assert!(store.is_empty());

    shutdown.cancel();
    timeout(Duration::from_secs(5), run)
        .await
        .expect("application did not stop")
        .unwrap()
        .unwrap();

    // Nothing fires twice.
    assert_eq!(journaled(journal_dir.path()).len(), 2);
    server.shutdown().await;
}

#[tokio::test]
async fn test_scaled_exit_ignores_stale_ticks() {
    let journal_dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryPositionStore::new());
    store.upsert(position("eth-1", "ETH/USDT", Side::Short, dec!(3000)));
    let journal = Arc::new(CommandJournal::open(journal_dir.path()).unwrap());

    let protection = ProtectionConfig {
        stop_loss: Some(StopLossRule::Fixed { pct: dec!(2) }),
        take_profit: Some(TakeProfitRule::Scaled {
            ladder: vec![
                LadderStep {
                    threshold_pct: dec!(3),
                    close_fraction: dec!(0.5),
                },
                LadderStep {
                    threshold_pct: dec!(5),
                    close_fraction: dec!(0.5),
                },
            ],
        }),
        ..Default::default()
    };
    let engine = Arc::new(ProtectionEngine::new(
        store.clone(),
        journal,
        Arc::new(StaticConfigSource::new(protection)),
    ));
    engine.sync_from_store().unwrap();

    let market_state = Arc::new(MarketState::new(64));
    let shutdown = CancellationToken::new();
    let run = tokio::spawn(engine.clone().run(
        market_state.subscribe_ticks(),
        EngineConfig {
            sync_interval_ms: 60_000,
            sweep_interval_ms: 60_000,
        },
        shutdown.clone(),
    ));

    // 3% in profit for the short: first rung.
    assert_eq!(
        market_state.apply_tick(tick("ETH/USDT", dec!(2910), 1000)),
        TickDisposition::Accepted
    );
    let commands = wait_for_commands(journal_dir.path(), 1).await;
    assert_eq!(commands[0].reason, CloseReason::TakeProfit);
    assert_eq!(commands[0].fraction, Some(dec!(0.5)));
    assert!(store.get("eth-1").is_some());

    // An older tick deep in profit never reaches the engine.
    assert_eq!(
        market_state.apply_tick(tick("ETH/USDT", dec!(2700), 500)),
        TickDisposition::Stale
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(journaled(journal_dir.path()).len(), 1);

    // Final rung closes what remains.
    market_state.apply_tick(tick("ETH/USDT", dec!(2850), 2000));
    let commands = wait_for_commands(journal_dir.path(), 2).await;
    assert_eq!(commands[1].fraction, None);
    assert_eq!(commands[1].trigger_price, Some(Price::new(dec!(2850))));
    assert!(store.get("eth-1").is_none());

    shutdown.cancel();
    run.await.unwrap();
}
