//! Position protection for tickguard.
//!
//! Watches open positions against live prices and issues close commands
//! when a stop-loss, take-profit, scaled exit or time stop fires.
//!
//! # Key Components
//!
//! - [`ProtectionConfig`]: Stop-loss and take-profit rules per position
//! - [`ProtectedPosition`]: Per-position session state (water marks, stops, ladder)
//! - [`evaluate`]: Pure trigger check with fixed precedence
//! - [`ProtectionEngine`]: Session registry driven by ticks, syncs and sweeps
//! - [`PositionStore`], [`CommandSink`], [`ConfigSource`]: Collaborator seams

pub mod config;
pub mod engine;
pub mod error;
pub mod evaluate;
pub mod session;
pub mod store;

pub use config::{
    LadderStep, ProtectionConfig, StaticConfigSource, StopLossRule, TakeProfitRule,
    DEFAULT_BREAK_EVEN_BUFFER_PCT, MAX_HOLDING_MINUTES,
};
pub use engine::{EngineConfig, ProtectionEngine, SyncReport};
pub use error::{PositionError, PositionResult};
pub use evaluate::{evaluate, Trigger, TriggerKind};
pub use session::{LadderRung, ProtectedPosition};
pub use store::{CloseCommand, CloseReason, CommandSink, ConfigSource, PositionRecord, PositionStore};
