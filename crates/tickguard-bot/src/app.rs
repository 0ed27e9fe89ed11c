//! Main application orchestration.
//!
//! Coordinates all components:
//! - One WebSocket stream per symbol and topic (ticker, partial depth)
//! - Event dispatch into market state and the fallback controller
//! - REST fallback polling while any stream is degraded
//! - The protection engine, fed from the tick fan-out

use crate::config::AppConfig;
use crate::dispatch::Dispatcher;
use crate::error::AppResult;
use std::sync::Arc;
use std::time::Duration;
use tickguard_feed::{
    subscribe_payload, BookAggregator, FallbackController, FallbackPoller, MarketState, Normalizer,
};
use tickguard_persistence::{CommandJournal, MemoryPositionStore};
use tickguard_position::{CommandSink, PositionStore, ProtectionEngine};
use tickguard_telemetry::Metrics;
use tickguard_ws::{ConnectionManager, StreamEndpoint, StreamEvent};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 4096;

/// Stream id and the canonical symbol it carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamPlan {
    pub stream_id: String,
    pub symbol: String,
}

/// Main application.
pub struct Application {
    config: AppConfig,
    normalizer: Normalizer,
    market_state: Arc<MarketState>,
    fallback: Arc<FallbackController>,
    engine: Arc<ProtectionEngine>,
}

impl Application {
    /// Build with the bundled in-memory store and journal sink.
    pub fn new(config: AppConfig) -> AppResult<Self> {
        config.validate()?;
        let store = match &config.persistence.positions_file {
            Some(path) => MemoryPositionStore::from_file(path)?,
            None => {
                warn!("No positions file configured, starting with an empty store");
                MemoryPositionStore::new()
            }
        };
        let journal = CommandJournal::open(&config.persistence.journal_dir)?;
        Ok(Self::with_collaborators(
            config,
            Arc::new(store),
            Arc::new(journal),
        ))
    }

    /// Build around an externally supplied store and sink.
    pub fn with_collaborators(
        config: AppConfig,
        store: Arc<dyn PositionStore>,
        sink: Arc<dyn CommandSink>,
    ) -> Self {
        let normalizer = Normalizer::new(config.stream.symbol_map());
        let market_state = Arc::new(MarketState::new(config.stream.broadcast_capacity));
        let fallback = Arc::new(FallbackController::new(
            config.fallback.activation_threshold,
        ));
        let engine = Arc::new(ProtectionEngine::new(
            store,
            sink,
            Arc::new(config.protection.config_source()),
        ));
        Self {
            config,
            normalizer,
            market_state,
            fallback,
            engine,
        }
    }

    pub fn market_state(&self) -> Arc<MarketState> {
        self.market_state.clone()
    }

    pub fn engine(&self) -> Arc<ProtectionEngine> {
        self.engine.clone()
    }

    /// Streams to open, ticker first then depth, per symbol.
    pub fn stream_plan(&self) -> Vec<StreamPlan> {
        let map = self.normalizer.symbols();
        let mut plan = Vec::new();
        for symbol in self.config.stream.canonical_symbols() {
            plan.push(StreamPlan {
                stream_id: map.ticker_stream(&symbol),
                symbol: symbol.clone(),
            });
            if self.config.stream.depth_enabled {
                plan.push(StreamPlan {
                    stream_id: map.depth_stream(
                        &symbol,
                        self.config.stream.depth_limit,
                        self.config.stream.depth_cadence_ms,
                    ),
                    symbol,
                });
            }
        }
        plan
    }

    /// Run until Ctrl-C.
    pub async fn run(self) -> AppResult<()> {
        let shutdown = CancellationToken::new();
        let signal_token = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Shutdown signal received"),
                Err(e) => error!(?e, "Failed to listen for shutdown signal"),
            }
            signal_token.cancel();
        });
        self.run_until(shutdown).await
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run_until(self, shutdown: CancellationToken) -> AppResult<()> {
        let (events_tx, mut events_rx) = mpsc::channel::<StreamEvent>(EVENT_CHANNEL_CAPACITY);
        let manager = ConnectionManager::new(events_tx);

        let plan = self.stream_plan();
        let url = self.config.stream.ws_url();
        info!(
            url = %url,
            streams = ?plan.iter().map(|p| &p.stream_id).collect::<Vec<_>>(),
            "Opening market data streams"
        );
        for (index, stream) in plan.iter().enumerate() {
            self.fallback
                .register(stream.stream_id.clone(), stream.symbol.clone());
            let endpoint = StreamEndpoint::new(url.clone()).with_on_connect(subscribe_payload(
                std::slice::from_ref(&stream.stream_id),
                index as u64 + 1,
            ));
            manager
                .open(
                    &stream.stream_id,
                    endpoint,
                    self.config.stream.connection.clone(),
                )
                .await?;
        }

        match self.engine.sync_from_store() {
            Ok(report) => info!(
                added = report.added.len(),
                unprotected = report.unprotected.len(),
                "Initial position sync complete"
            ),
            Err(e) => warn!(error = %e, "Initial position sync failed"),
        }

        let engine_handle = tokio::spawn(self.engine.clone().run(
            self.market_state.subscribe_ticks(),
            self.config.engine.clone(),
            shutdown.child_token(),
        ));

        let dispatcher = Arc::new(Dispatcher::new(
            self.normalizer.clone(),
            self.market_state.clone(),
            BookAggregator::new(self.config.stream.depth_limit),
            self.fallback.clone(),
        ));

        let fallback_handle = if self.config.fallback.enabled {
            Some(self.spawn_fallback_loop(dispatcher.clone(), shutdown.child_token())?)
        } else {
            info!("REST fallback disabled");
            None
        };

        info!("Entering main event loop");
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                event = events_rx.recv() => match event {
                    Some(event) => dispatcher.handle(event),
                    None => {
                        warn!("Stream event channel closed");
                        break;
                    }
                },
            }
        }

        info!("Shutting down");
        shutdown.cancel();
        // Workers publish a final phase change on close; with nobody
        // draining, a full channel would block them forever.
        drop(events_rx);
        manager.shutdown().await;
        await_task("protection engine", engine_handle).await;
        if let Some(handle) = fallback_handle {
            await_task("fallback poller", handle).await;
        }
        info!(
            sessions = self.engine.session_count(),
            "Shutdown complete"
        );
        Ok(())
    }

    fn spawn_fallback_loop(
        &self,
        dispatcher: Arc<Dispatcher>,
        shutdown: CancellationToken,
    ) -> AppResult<JoinHandle<()>> {
        let config = self.config.fallback.clone();
        let poller = FallbackPoller::new(
            &config.rest_url,
            self.normalizer.clone(),
            Duration::from_millis(config.request_timeout_ms),
        )?;
        let controller = self.fallback.clone();

        Ok(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(config.poll_interval_ms));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }
                if !controller.is_active() {
                    continue;
                }
                let symbols = controller.degraded_symbols();
                match poller.poll(&symbols).await {
                    Ok(ticks) => {
                        debug!(symbols = ?symbols, received = ticks.len(), "Fallback poll complete");
                        Metrics::fallback_poll("ok");
                        for tick in ticks.into_values() {
                            dispatcher.apply_tick(tick);
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Fallback poll failed");
                        Metrics::fallback_poll("error");
                    }
                }
            }
            debug!("Fallback poller stopped");
        }))
    }
}

async fn await_task(name: &str, handle: JoinHandle<()>) {
    if let Err(e) = handle.await {
        error!(task = name, ?e, "Background task panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use tickguard_position::{CloseCommand, PositionResult};

    struct NullSink;

    impl CommandSink for NullSink {
        fn submit_close(&self, _command: &CloseCommand) -> PositionResult<()> {
            Ok(())
        }
    }

    fn app(toml: &str) -> Application {
        let config = AppConfig::from_toml(toml).unwrap();
        Application::with_collaborators(
            config,
            Arc::new(MemoryPositionStore::new()),
            Arc::new(NullSink),
        )
    }

    #[test]
    fn test_stream_plan_per_symbol() {
        let app = app("[stream]\nsymbols = [\"BTC\", \"ETH/USDT\"]\n");
        let ids: Vec<String> = app.stream_plan().into_iter().map(|p| p.stream_id).collect();
        assert_eq!(
            ids,
            vec![
                "btcusdt@ticker",
                "btcusdt@depth20@100ms",
                "ethusdt@ticker",
                "ethusdt@depth20@100ms",
            ]
        );
    }

    #[test]
    fn test_stream_plan_without_depth() {
        let app = app("[stream]\nsymbols = [\"SOL\"]\ndepth_enabled = false\n");
        let plan = app.stream_plan();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].symbol, "SOL/USDT");
    }
}
