//! Protection configuration.
//!
//! All `*_pct` values are percents: `2` means 2%.

use crate::error::{PositionError, PositionResult};
use crate::store::{ConfigSource, PositionRecord};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Longest holding limit a `chrono::Duration` can represent.
pub const MAX_HOLDING_MINUTES: u64 = (i64::MAX / 60_000) as u64;

/// Default fee buffer applied to break-even stops.
pub const DEFAULT_BREAK_EVEN_BUFFER_PCT: Decimal = dec!(0.1);

/// Volatility scale bounds for the trailing distance.
const VOLATILITY_SCALE_MIN: Decimal = dec!(0.5);
const VOLATILITY_SCALE_MAX: Decimal = dec!(2.0);

// ============================================================================
// Rules
// ============================================================================

/// Stop-loss kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StopLossRule {
    /// Static stop `pct` away from entry.
    Fixed { pct: Decimal },
    /// Trailing stop `pct` behind the water mark once trailing activates.
    Trailing { pct: Decimal },
    /// Static stop `atr * multiplier` away from entry.
    Atr { multiplier: Decimal },
}

/// One scaled-exit threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LadderStep {
    /// Unrealized PnL percent that triggers this step.
    pub threshold_pct: Decimal,
    /// Fraction of the original size to close, in `(0, 1]`.
    pub close_fraction: Decimal,
}

/// Take-profit kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TakeProfitRule {
    /// Static target `pct` beyond entry.
    Fixed { pct: Decimal },
    /// Profit-locking trailing stop `pct` behind the water mark.
    Trailing { pct: Decimal },
    /// Partial exits at increasing PnL thresholds.
    Scaled { ladder: Vec<LadderStep> },
}

// ============================================================================
// ProtectionConfig
// ============================================================================

/// Protection parameters attached to a session at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtectionConfig {
    pub stop_loss: Option<StopLossRule>,
    pub take_profit: Option<TakeProfitRule>,
    /// Favorable move from entry, in percent, before trailing engages.
    pub trailing_activation_pct: Decimal,
    /// Time stop; `None` disables it.
    pub max_holding_minutes: Option<u64>,
    /// PnL percent at which the stop moves to break-even; `None` disables it.
    pub break_even_activation_pct: Option<Decimal>,
    /// Fee buffer beyond entry for the break-even stop.
    pub break_even_buffer_pct: Decimal,
    /// Scale the trailing distance by the 24h range.
    pub volatility_adjustment: bool,
    /// 24h range percent that maps to an unscaled trailing distance.
    pub volatility_reference_pct: Decimal,
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            stop_loss: Some(StopLossRule::Fixed { pct: dec!(2) }),
            take_profit: Some(TakeProfitRule::Fixed { pct: dec!(5) }),
            trailing_activation_pct: dec!(1),
            max_holding_minutes: None,
            break_even_activation_pct: None,
            break_even_buffer_pct: DEFAULT_BREAK_EVEN_BUFFER_PCT,
            volatility_adjustment: false,
            volatility_reference_pct: dec!(5),
        }
    }
}

impl ProtectionConfig {
    /// Reject thresholds that cannot produce a sane stop or target.
    pub fn validate(&self) -> PositionResult<()> {
        match &self.stop_loss {
            Some(StopLossRule::Fixed { pct }) => check_open_pct("stop_loss.pct", *pct)?,
            Some(StopLossRule::Trailing { pct }) => check_open_pct("stop_loss.pct", *pct)?,
            Some(StopLossRule::Atr { multiplier }) => {
                if *multiplier <= Decimal::ZERO {
                    return Err(invalid(format!(
                        "stop_loss.multiplier must be > 0, got {multiplier}"
                    )));
                }
            }
            None => {}
        }

        match &self.take_profit {
            Some(TakeProfitRule::Fixed { pct }) => {
                if *pct <= Decimal::ZERO {
                    return Err(invalid(format!("take_profit.pct must be > 0, got {pct}")));
                }
            }
            Some(TakeProfitRule::Trailing { pct }) => check_open_pct("take_profit.pct", *pct)?,
            Some(TakeProfitRule::Scaled { ladder }) => validate_ladder(ladder)?,
            None => {}
        }

        if self.trailing_activation_pct < Decimal::ZERO {
            return Err(invalid(format!(
                "trailing_activation_pct must be >= 0, got {}",
                self.trailing_activation_pct
            )));
        }
        if let Some(minutes) = self.max_holding_minutes {
            if minutes == 0 || minutes > MAX_HOLDING_MINUTES {
                return Err(invalid(format!(
                    "max_holding_minutes must be in 1..={MAX_HOLDING_MINUTES}, got {minutes}"
                )));
            }
        }
        if self.break_even_buffer_pct < Decimal::ZERO {
            return Err(invalid(format!(
                "break_even_buffer_pct must be >= 0, got {}",
                self.break_even_buffer_pct
            )));
        }
        if let Some(activation) = self.break_even_activation_pct {
            // A buffer at or past the activation level would trip immediately.
            if activation <= self.break_even_buffer_pct {
                return Err(invalid(format!(
                    "break_even_activation_pct {activation} must exceed buffer {}",
                    self.break_even_buffer_pct
                )));
            }
        }
        if self.volatility_adjustment && self.volatility_reference_pct <= Decimal::ZERO {
            return Err(invalid(format!(
                "volatility_reference_pct must be > 0, got {}",
                self.volatility_reference_pct
            )));
        }
        Ok(())
    }

    /// Trailing distance in percent, if any rule trails.
    ///
    /// A trailing stop-loss takes priority over a trailing take-profit.
    pub fn trailing_distance_pct(&self) -> Option<Decimal> {
        match (&self.stop_loss, &self.take_profit) {
            (Some(StopLossRule::Trailing { pct }), _) => Some(*pct),
            (_, Some(TakeProfitRule::Trailing { pct })) => Some(*pct),
            _ => None,
        }
    }

    pub fn has_trailing_stop_loss(&self) -> bool {
        matches!(self.stop_loss, Some(StopLossRule::Trailing { .. }))
    }

    /// Trailing distance scaled by volatility when enabled.
    ///
    /// `range_24h_pct` is the 24h high-low range relative to price.
    pub fn effective_trailing_distance(&self, range_24h_pct: Option<Decimal>) -> Option<Decimal> {
        let base = self.trailing_distance_pct()?;
        if !self.volatility_adjustment {
            return Some(base);
        }
        let scale = range_24h_pct
            .filter(|r| *r > Decimal::ZERO)
            .map(|r| (r / self.volatility_reference_pct).clamp(VOLATILITY_SCALE_MIN, VOLATILITY_SCALE_MAX))
            .unwrap_or(Decimal::ONE);
        // Never let the distance reach 100% of the water mark.
        Some((base * scale).min(dec!(99)))
    }
}

fn invalid(msg: String) -> PositionError {
    PositionError::InvalidConfig(msg)
}

/// Percent strictly inside `(0, 100)`.
fn check_open_pct(field: &str, pct: Decimal) -> PositionResult<()> {
    if pct <= Decimal::ZERO || pct >= Decimal::ONE_HUNDRED {
        return Err(invalid(format!("{field} must be in (0, 100), got {pct}")));
    }
    Ok(())
}

fn validate_ladder(ladder: &[LadderStep]) -> PositionResult<()> {
    if ladder.is_empty() {
        return Err(invalid("scaled take-profit ladder is empty".to_string()));
    }
    let mut previous = Decimal::ZERO;
    for (i, step) in ladder.iter().enumerate() {
        if step.threshold_pct <= previous {
            return Err(invalid(format!(
                "ladder[{i}].threshold_pct must be > 0 and strictly increasing, got {}",
                step.threshold_pct
            )));
        }
        if step.close_fraction <= Decimal::ZERO || step.close_fraction > Decimal::ONE {
            return Err(invalid(format!(
                "ladder[{i}].close_fraction must be in (0, 1], got {}",
                step.close_fraction
            )));
        }
        previous = step.threshold_pct;
    }
    Ok(())
}

// ============================================================================
// StaticConfigSource
// ============================================================================

/// Defaults plus overrides keyed by position id or symbol.
///
/// Lookup order: position id, then symbol, then defaults.
#[derive(Debug, Clone, Default)]
pub struct StaticConfigSource {
    defaults: ProtectionConfig,
    overrides: HashMap<String, ProtectionConfig>,
}

impl StaticConfigSource {
    pub fn new(defaults: ProtectionConfig) -> Self {
        Self {
            defaults,
            overrides: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_overrides(mut self, overrides: HashMap<String, ProtectionConfig>) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn insert_override(&mut self, key: impl Into<String>, config: ProtectionConfig) {
        self.overrides.insert(key.into(), config);
    }
}

impl ConfigSource for StaticConfigSource {
    fn protection_config(&self, position: &PositionRecord) -> PositionResult<ProtectionConfig> {
        let config = self
            .overrides
            .get(&position.id)
            .or_else(|| self.overrides.get(&position.symbol))
            .unwrap_or(&self.defaults)
            .clone();
        Ok(config)
    }
}
