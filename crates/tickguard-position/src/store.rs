//! Collaborator contracts: position store, command sink, config source.
//!
//! The engine only ever talks to these traits; concrete stores and sinks
//! live elsewhere.

use crate::config::ProtectionConfig;
use crate::error::PositionResult;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use tickguard_core::{Price, Side, Size};
use uuid::Uuid;

/// Open position as reported by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionRecord {
    pub id: String,
    /// Canonical symbol (e.g. `BTC/USDT`).
    pub symbol: String,
    pub side: Side,
    pub entry_price: Price,
    pub size: Size,
    pub opened_at: DateTime<Utc>,
    /// Average true range in price units; required by ATR stops.
    #[serde(default)]
    pub atr: Option<Decimal>,
}

/// Why a close was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    StopLoss,
    TakeProfit,
    TimeStop,
    Manual,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StopLoss => "stop_loss",
            Self::TakeProfit => "take_profit",
            Self::TimeStop => "time_stop",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Close instruction handed to the command sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseCommand {
    pub command_id: Uuid,
    pub position_id: String,
    pub symbol: String,
    pub side: Side,
    pub reason: CloseReason,
    /// Fraction of the original size to close; `None` closes the whole
    /// remaining position.
    pub fraction: Option<Decimal>,
    /// Price that caused the trigger, if price-driven.
    pub trigger_price: Option<Price>,
    pub issued_at: DateTime<Utc>,
}

impl CloseCommand {
    pub fn is_partial(&self) -> bool {
        self.fraction.is_some()
    }
}

/// Source of truth for open positions.
#[cfg_attr(test, mockall::automock)]
pub trait PositionStore: Send + Sync {
    fn list_open_positions(&self) -> PositionResult<Vec<PositionRecord>>;

    fn mark_closed(&self, position_id: &str, reason: CloseReason) -> PositionResult<()>;
}

/// Accepts close instructions. `Ok` means the command is durably accepted.
#[cfg_attr(test, mockall::automock)]
pub trait CommandSink: Send + Sync {
    fn submit_close(&self, command: &CloseCommand) -> PositionResult<()>;
}

/// Supplies protection parameters; consulted once per session creation.
#[cfg_attr(test, mockall::automock)]
pub trait ConfigSource: Send + Sync {
    fn protection_config(&self, position: &PositionRecord) -> PositionResult<ProtectionConfig>;
}
