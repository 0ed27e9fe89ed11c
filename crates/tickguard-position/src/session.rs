//! Per-position protection session.
//!
//! A session is created when a position is first seen open and mutated by
//! every relevant tick: water marks, trailing stop, break-even stop and
//! ladder flags. Configuration is fixed for the life of the session.

use crate::config::{ProtectionConfig, StopLossRule, TakeProfitRule};
use crate::error::{PositionError, PositionResult};
use crate::store::PositionRecord;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tickguard_core::{Price, PriceTick, Side, Size};
use tracing::{debug, info};

/// One scaled-exit rung with its trigger flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LadderRung {
    pub threshold_pct: Decimal,
    pub close_fraction: Decimal,
    pub triggered: bool,
}

/// Protection state for one open position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProtectedPosition {
    pub position_id: String,
    pub symbol: String,
    pub side: Side,
    pub entry_price: Price,
    pub size: Size,
    /// Highest price seen since entry. Never decreases.
    pub high_water_mark: Price,
    /// Lowest price seen since entry. Never increases.
    pub low_water_mark: Price,
    /// Static or break-even stop.
    pub stop_loss_price: Option<Price>,
    pub take_profit_price: Option<Price>,
    /// Only tightens once set.
    pub trailing_stop_price: Option<Price>,
    pub trailing_activated: bool,
    pub break_even_activated: bool,
    pub scaled_exit_ladder: Vec<LadderRung>,
    pub entry_time: DateTime<Utc>,
    pub last_price: Option<Price>,
    pub last_tick_ts_ms: Option<i64>,
    /// Set once a full close is confirmed. The session is dropped when the
    /// store stops listing the position.
    pub retired: bool,
    #[serde(skip)]
    config: ProtectionConfig,
}

impl ProtectedPosition {
    /// Build a session, validating `config` against the position.
    pub fn new(record: &PositionRecord, config: ProtectionConfig) -> PositionResult<Self> {
        config.validate()?;
        if !record.entry_price.is_positive() {
            return Err(PositionError::InvalidState(format!(
                "{}: entry price must be positive, got {}",
                record.id, record.entry_price
            )));
        }
        if !record.size.is_positive() {
            return Err(PositionError::InvalidState(format!(
                "{}: size must be positive, got {}",
                record.id, record.size
            )));
        }

        let entry = record.entry_price;
        let sign = record.side.sign();

        let stop_loss_price = match &config.stop_loss {
            Some(StopLossRule::Fixed { pct }) => Some(entry.offset_pct(-sign * *pct)),
            Some(StopLossRule::Atr { multiplier }) => {
                let atr = record.atr.filter(|a| *a > Decimal::ZERO).ok_or_else(|| {
                    PositionError::InvalidConfig(format!(
                        "{}: ATR stop requires a positive atr on the position",
                        record.id
                    ))
                })?;
                let stop = Price::new(entry.inner() - sign * atr * *multiplier);
                if !stop.is_positive() {
                    return Err(PositionError::InvalidConfig(format!(
                        "{}: ATR stop {stop} is not a positive price",
                        record.id
                    )));
                }
                Some(stop)
            }
            Some(StopLossRule::Trailing { .. }) | None => None,
        };

        let take_profit_price = match &config.take_profit {
            Some(TakeProfitRule::Fixed { pct }) => Some(entry.offset_pct(sign * *pct)),
            _ => None,
        };

        let scaled_exit_ladder = match &config.take_profit {
            Some(TakeProfitRule::Scaled { ladder }) => ladder
                .iter()
                .map(|step| LadderRung {
                    threshold_pct: step.threshold_pct,
                    close_fraction: step.close_fraction,
                    triggered: false,
                })
                .collect(),
            _ => Vec::new(),
        };

        Ok(Self {
            position_id: record.id.clone(),
            symbol: record.symbol.clone(),
            side: record.side,
            entry_price: entry,
            size: record.size,
            high_water_mark: entry,
            low_water_mark: entry,
            stop_loss_price,
            take_profit_price,
            trailing_stop_price: None,
            trailing_activated: false,
            break_even_activated: false,
            scaled_exit_ladder,
            entry_time: record.opened_at,
            last_price: None,
            last_tick_ts_ms: None,
            retired: false,
            config,
        })
    }

    pub fn config(&self) -> &ProtectionConfig {
        &self.config
    }

    /// Unrealized PnL in percent of entry at `price`.
    pub fn unrealized_pnl_pct(&self, price: Price) -> Decimal {
        // Entry is validated positive at construction.
        price.pct_from(self.entry_price).unwrap_or_default() * self.side.sign()
    }

    pub fn holding_duration(&self, now: DateTime<Utc>) -> Duration {
        now - self.entry_time
    }

    /// Fold a tick into the session. Returns `false` for ticks older than
    /// the last one applied.
    pub fn observe(&mut self, tick: &PriceTick) -> bool {
        if let Some(last) = self.last_tick_ts_ms {
            if tick.source_ts_ms < last {
                debug!(
                    position_id = %self.position_id,
                    last,
                    received = tick.source_ts_ms,
                    "Ignoring out-of-order tick"
                );
                return false;
            }
        }
        self.observe_price(tick.price, tick.range_24h_pct());
        self.last_tick_ts_ms = Some(tick.source_ts_ms);
        true
    }

    /// Update water marks and derived stops for `price`.
    pub fn observe_price(&mut self, price: Price, range_24h_pct: Option<Decimal>) {
        self.high_water_mark = self.high_water_mark.max(price);
        self.low_water_mark = self.low_water_mark.min(price);
        self.last_price = Some(price);

        self.update_trailing(range_24h_pct);
        self.update_break_even(price);
    }

    fn update_trailing(&mut self, range_24h_pct: Option<Decimal>) {
        let Some(distance) = self.config.effective_trailing_distance(range_24h_pct) else {
            return;
        };

        if !self.trailing_activated {
            let activation = self.config.trailing_activation_pct;
            let moved = match self.side {
                Side::Long => self.high_water_mark >= self.entry_price.offset_pct(activation),
                Side::Short => self.low_water_mark <= self.entry_price.offset_pct(-activation),
            };
            if !moved {
                return;
            }
            self.trailing_activated = true;
            info!(
                position_id = %self.position_id,
                high_water_mark = %self.high_water_mark,
                low_water_mark = %self.low_water_mark,
                "Trailing stop activated"
            );
        }

        let candidate = match self.side {
            Side::Long => self.high_water_mark.offset_pct(-distance),
            Side::Short => self.low_water_mark.offset_pct(distance),
        };
        self.trailing_stop_price = Some(self.tighter(self.trailing_stop_price, candidate));
    }

    fn update_break_even(&mut self, price: Price) {
        let Some(activation) = self.config.break_even_activation_pct else {
            return;
        };
        if self.break_even_activated || self.unrealized_pnl_pct(price) < activation {
            return;
        }
        let buffer = self.config.break_even_buffer_pct;
        let break_even = self.entry_price.offset_pct(self.side.sign() * buffer);
        self.stop_loss_price = Some(self.tighter(self.stop_loss_price, break_even));
        self.break_even_activated = true;
        info!(
            position_id = %self.position_id,
            stop = %break_even,
            "Break-even stop set"
        );
    }

    /// Of an existing stop and a candidate, the one closer to the market in
    /// the position's favor. Stops never loosen.
    fn tighter(&self, current: Option<Price>, candidate: Price) -> Price {
        match (current, self.side) {
            (None, _) => candidate,
            (Some(current), Side::Long) => current.max(candidate),
            (Some(current), Side::Short) => current.min(candidate),
        }
    }

    /// Whether `stop` is on the profitable side of entry.
    pub fn stop_in_profit(&self, stop: Price) -> bool {
        match self.side {
            Side::Long => stop > self.entry_price,
            Side::Short => stop < self.entry_price,
        }
    }

    /// Fraction of the original size already closed by ladder rungs.
    pub fn closed_fraction(&self) -> Decimal {
        self.scaled_exit_ladder
            .iter()
            .filter(|r| r.triggered)
            .map(|r| r.close_fraction)
            .sum()
    }

    pub(crate) fn mark_rung(&mut self, index: usize) {
        if let Some(rung) = self.scaled_exit_ladder.get_mut(index) {
            rung.triggered = true;
        }
    }

    pub(crate) fn retire(&mut self) {
        self.retired = true;
    }
}
