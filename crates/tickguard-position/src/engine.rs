//! Position protection engine.
//!
//! Holds one [`ProtectedPosition`] per open position, folds ticks into
//! them and turns triggers into [`CloseCommand`]s for the sink. A trigger
//! is only marked as taken once the sink accepts the command; a rejected
//! command is re-evaluated on the next tick or sweep.

use crate::error::{PositionError, PositionResult};
use crate::evaluate::{evaluate, Trigger, TriggerKind};
use crate::session::ProtectedPosition;
use crate::store::{CloseCommand, CloseReason, CommandSink, ConfigSource, PositionRecord, PositionStore};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tickguard_core::PriceTick;
use tickguard_telemetry::Metrics;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

type SessionHandle = Arc<Mutex<ProtectedPosition>>;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How often the store is re-read for opened and closed positions.
    pub sync_interval_ms: u64,
    /// How often every session is re-evaluated without a tick.
    pub sweep_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sync_interval_ms: 5_000,
            sweep_interval_ms: 1_000,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> PositionResult<()> {
        if self.sync_interval_ms == 0 || self.sweep_interval_ms == 0 {
            return Err(PositionError::InvalidConfig(
                "engine sync_interval_ms and sweep_interval_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Result of reconciling sessions with the open position list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// Positions that could not be protected, with the cause.
    pub unprotected: Vec<(String, String)>,
}

// ============================================================================
// ProtectionEngine
// ============================================================================

pub struct ProtectionEngine {
    sessions: RwLock<HashMap<String, SessionHandle>>,
    store: Arc<dyn PositionStore>,
    sink: Arc<dyn CommandSink>,
    config_source: Arc<dyn ConfigSource>,
    /// Position id -> reason it has no session.
    unprotected: DashMap<String, String>,
}

impl ProtectionEngine {
    pub fn new(
        store: Arc<dyn PositionStore>,
        sink: Arc<dyn CommandSink>,
        config_source: Arc<dyn ConfigSource>,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            store,
            sink,
            config_source,
            unprotected: DashMap::new(),
        }
    }

    /// Fold a tick into every session on its symbol and submit any
    /// resulting closes. Returns the commands the sink accepted.
    pub fn on_price_tick(&self, tick: &PriceTick, now: DateTime<Utc>) -> Vec<CloseCommand> {
        let handles: Vec<SessionHandle> = self
            .sessions
            .read()
            .values()
            .filter(|s| s.lock().symbol == tick.symbol)
            .cloned()
            .collect();

        let mut accepted = Vec::new();
        for handle in handles {
            let mut session = handle.lock();
            if session.retired || !session.observe(tick) {
                continue;
            }
            if let Some(trigger) = evaluate(&session, now) {
                if let Some(command) = self.fire(&mut session, trigger, now) {
                    accepted.push(command);
                }
            }
        }
        accepted
    }

    /// Reconcile sessions with the current open positions.
    ///
    /// New positions get a session with their config resolved once; closed
    /// positions lose theirs. A retired session is dropped, and replaced by a
    /// fresh one if the store still lists its position as open.
    pub fn on_positions_changed(&self, positions: Vec<PositionRecord>) -> SyncReport {
        let mut report = SyncReport::default();
        let open: HashSet<String> = positions.iter().map(|p| p.id.clone()).collect();

        {
            let mut sessions = self.sessions.write();
            sessions.retain(|id, session| {
                let keep = open.contains(id) && !session.lock().retired;
                if !keep {
                    report.removed.push(id.clone());
                }
                keep
            });

            for record in positions {
                if sessions.contains_key(&record.id) {
                    continue;
                }
                match self.create_session(&record) {
                    Ok(session) => {
                        info!(
                            position_id = %record.id,
                            symbol = %record.symbol,
                            side = %record.side,
                            entry_price = %record.entry_price,
                            stop_loss = ?session.stop_loss_price,
                            take_profit = ?session.take_profit_price,
                            "Protection session created"
                        );
                        self.unprotected.remove(&record.id);
                        report.added.push(record.id.clone());
                        sessions.insert(record.id, Arc::new(Mutex::new(session)));
                    }
                    Err(e) => {
                        warn!(
                            position_id = %record.id,
                            symbol = %record.symbol,
                            error = %e,
                            "Position left unprotected"
                        );
                        report.unprotected.push((record.id.clone(), e.to_string()));
                        self.unprotected.insert(record.id, e.to_string());
                    }
                }
            }
            Metrics::protection_sessions_set(sessions.len());
        }

        self.unprotected.retain(|id, _| open.contains(id));
        Metrics::unprotected_positions_set(self.unprotected.len());

        for id in &report.removed {
            debug!(position_id = %id, "Protection session removed");
        }
        report.added.sort();
        report.removed.sort();
        report
    }

    /// Re-read open positions from the store and reconcile.
    pub fn sync_from_store(&self) -> PositionResult<SyncReport> {
        let positions = self.store.list_open_positions()?;
        Ok(self.on_positions_changed(positions))
    }

    /// Evaluate every session without a new price. Fires time stops and
    /// retries triggers whose command the sink rejected.
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<CloseCommand> {
        let handles: Vec<SessionHandle> = self.sessions.read().values().cloned().collect();
        let mut accepted = Vec::new();
        for handle in handles {
            let mut session = handle.lock();
            if let Some(trigger) = evaluate(&session, now) {
                if let Some(command) = self.fire(&mut session, trigger, now) {
                    accepted.push(command);
                }
            }
        }
        accepted
    }

    /// Close a protected position on request.
    pub fn close_manual(&self, position_id: &str, now: DateTime<Utc>) -> PositionResult<CloseCommand> {
        let handle = self
            .sessions
            .read()
            .get(position_id)
            .cloned()
            .ok_or_else(|| PositionError::NotFound(position_id.to_string()))?;

        let mut session = handle.lock();
        if session.retired {
            return Err(PositionError::InvalidState(format!(
                "{position_id}: close already submitted"
            )));
        }
        let trigger = Trigger {
            kind: TriggerKind::Manual,
            reason: CloseReason::Manual,
            fraction: None,
            trigger_price: session.last_price,
        };
        let command = build_command(&session, &trigger, now);
        self.sink.submit_close(&command)?;
        self.confirm(&mut session, &trigger, &command);
        Ok(command)
    }

    /// Copies of all sessions, ordered by position id.
    pub fn snapshot(&self) -> Vec<ProtectedPosition> {
        let mut sessions: Vec<ProtectedPosition> = self
            .sessions
            .read()
            .values()
            .map(|s| s.lock().clone())
            .collect();
        sessions.sort_by(|a, b| a.position_id.cmp(&b.position_id));
        sessions
    }

    pub fn session(&self, position_id: &str) -> Option<ProtectedPosition> {
        self.sessions
            .read()
            .get(position_id)
            .map(|s| s.lock().clone())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Positions without a session, ordered by position id.
    pub fn unprotected_positions(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = self
            .unprotected
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        out.sort();
        out
    }

    /// Drive the engine from a tick feed until `shutdown` fires.
    pub async fn run(
        self: Arc<Self>,
        mut ticks: broadcast::Receiver<PriceTick>,
        config: EngineConfig,
        shutdown: CancellationToken,
    ) {
        info!(
            sync_interval_ms = config.sync_interval_ms,
            sweep_interval_ms = config.sweep_interval_ms,
            "ProtectionEngine started"
        );

        let mut sync = tokio::time::interval(Duration::from_millis(config.sync_interval_ms));
        let mut sweep = tokio::time::interval(Duration::from_millis(config.sweep_interval_ms));
        sync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                _ = sync.tick() => {
                    if let Err(e) = self.sync_from_store() {
                        warn!(error = %e, "Position sync failed, keeping current sessions");
                    }
                }

                result = ticks.recv() => match result {
                    Ok(tick) => {
                        self.on_price_tick(&tick, Utc::now());
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Protection engine lagged behind tick feed");
                        Metrics::message_dropped("engine_lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        error!("Tick feed closed, stopping protection engine");
                        break;
                    }
                },

                _ = sweep.tick() => {
                    self.sweep(Utc::now());
                }
            }
        }

        info!("ProtectionEngine stopped");
    }

    fn create_session(&self, record: &PositionRecord) -> PositionResult<ProtectedPosition> {
        let config = self.config_source.protection_config(record)?;
        ProtectedPosition::new(record, config)
    }

    /// Submit the close for `trigger`; marks the session only on success.
    fn fire(
        &self,
        session: &mut ProtectedPosition,
        trigger: Trigger,
        now: DateTime<Utc>,
    ) -> Option<CloseCommand> {
        let command = build_command(session, &trigger, now);
        match self.sink.submit_close(&command) {
            Ok(()) => {
                self.confirm(session, &trigger, &command);
                Some(command)
            }
            Err(e) => {
                warn!(
                    position_id = %session.position_id,
                    trigger = %trigger.kind,
                    error = %e,
                    "Close command rejected, will retry"
                );
                Metrics::close_submit_failed(trigger.reason.as_str());
                None
            }
        }
    }

    fn confirm(&self, session: &mut ProtectedPosition, trigger: &Trigger, command: &CloseCommand) {
        if let TriggerKind::ScaledExit { rung } = trigger.kind {
            session.mark_rung(rung);
        }
        Metrics::protection_triggered(trigger.reason.as_str(), command.is_partial());
        info!(
            position_id = %session.position_id,
            symbol = %session.symbol,
            trigger = %trigger.kind,
            reason = %trigger.reason,
            fraction = ?command.fraction,
            price = ?command.trigger_price,
            command_id = %command.command_id,
            "Protection triggered"
        );

        if trigger.is_full_close() {
            session.retire();
            if let Err(e) = self.store.mark_closed(&session.position_id, trigger.reason) {
                warn!(
                    position_id = %session.position_id,
                    error = %e,
                    "Failed to mark position closed"
                );
            }
        }
    }
}

fn build_command(session: &ProtectedPosition, trigger: &Trigger, now: DateTime<Utc>) -> CloseCommand {
    CloseCommand {
        command_id: Uuid::new_v4(),
        position_id: session.position_id.clone(),
        symbol: session.symbol.clone(),
        side: session.side,
        reason: trigger.reason,
        fraction: trigger.fraction,
        trigger_price: trigger.trigger_price,
        issued_at: now,
    }
}
