//! Pure trigger evaluation.
//!
//! Precedence per call: stop-loss (static or break-even), trailing stop,
//! take-profit, scaled-exit ladder, time stop. Only the first matching
//! condition is returned.

use crate::session::ProtectedPosition;
use crate::store::CloseReason;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;
use tickguard_core::{Price, Side};

/// Which condition fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    StopLoss,
    BreakEven,
    TrailingStop,
    TakeProfit,
    ScaledExit { rung: usize },
    TimeStop,
    Manual,
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StopLoss => write!(f, "stop_loss"),
            Self::BreakEven => write!(f, "break_even"),
            Self::TrailingStop => write!(f, "trailing_stop"),
            Self::TakeProfit => write!(f, "take_profit"),
            Self::ScaledExit { rung } => write!(f, "scaled_exit[{rung}]"),
            Self::TimeStop => write!(f, "time_stop"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// Decision to close all or part of a position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Trigger {
    pub kind: TriggerKind,
    pub reason: CloseReason,
    /// `None` closes the whole remaining position.
    pub fraction: Option<Decimal>,
    pub trigger_price: Option<Price>,
}

impl Trigger {
    /// Whether confirming this trigger ends the session.
    pub fn is_full_close(&self) -> bool {
        self.fraction.is_none()
    }
}

/// Evaluate a session against its last observed price and `now`.
#[must_use]
pub fn evaluate(session: &ProtectedPosition, now: DateTime<Utc>) -> Option<Trigger> {
    if session.retired {
        return None;
    }

    if let Some(price) = session.last_price {
        if let Some(trigger) = price_trigger(session, price) {
            return Some(trigger);
        }
    }

    time_trigger(session, now)
}

fn price_trigger(session: &ProtectedPosition, price: Price) -> Option<Trigger> {
    let side = session.side;

    if let Some(stop) = session.stop_loss_price {
        if crossed_adverse(side, price, stop) {
            let kind = if session.break_even_activated {
                TriggerKind::BreakEven
            } else {
                TriggerKind::StopLoss
            };
            return Some(full(kind, CloseReason::StopLoss, price));
        }
    }

    if let Some(stop) = session.trailing_stop_price {
        if crossed_adverse(side, price, stop) {
            // A profit-locking trail from the take-profit rule reports as
            // take-profit while its stop sits in profit.
            let reason =
                if !session.config().has_trailing_stop_loss() && session.stop_in_profit(stop) {
                    CloseReason::TakeProfit
                } else {
                    CloseReason::StopLoss
                };
            return Some(full(TriggerKind::TrailingStop, reason, price));
        }
    }

    if let Some(target) = session.take_profit_price {
        if crossed_favorable(side, price, target) {
            return Some(full(TriggerKind::TakeProfit, CloseReason::TakeProfit, price));
        }
    }

    ladder_trigger(session, price)
}

fn ladder_trigger(session: &ProtectedPosition, price: Price) -> Option<Trigger> {
    let pnl_pct = session.unrealized_pnl_pct(price);
    let (index, rung) = session
        .scaled_exit_ladder
        .iter()
        .enumerate()
        .find(|(_, r)| !r.triggered && pnl_pct >= r.threshold_pct)?;

    let remaining_after = session
        .scaled_exit_ladder
        .iter()
        .enumerate()
        .filter(|(i, r)| *i != index && !r.triggered)
        .count();
    let cumulative = session.closed_fraction() + rung.close_fraction;
    let fraction = if remaining_after == 0 || cumulative >= Decimal::ONE {
        None
    } else {
        Some(rung.close_fraction)
    };

    Some(Trigger {
        kind: TriggerKind::ScaledExit { rung: index },
        reason: CloseReason::TakeProfit,
        fraction,
        trigger_price: Some(price),
    })
}

fn time_trigger(session: &ProtectedPosition, now: DateTime<Utc>) -> Option<Trigger> {
    let minutes = session.config().max_holding_minutes?;
    let limit = Duration::try_minutes(i64::try_from(minutes).ok()?)?;
    if session.holding_duration(now) >= limit {
        return Some(Trigger {
            kind: TriggerKind::TimeStop,
            reason: CloseReason::TimeStop,
            fraction: None,
            trigger_price: session.last_price,
        });
    }
    None
}

fn full(kind: TriggerKind, reason: CloseReason, price: Price) -> Trigger {
    Trigger {
        kind,
        reason,
        fraction: None,
        trigger_price: Some(price),
    }
}

/// Price at or through `level` against the position.
fn crossed_adverse(side: Side, price: Price, level: Price) -> bool {
    match side {
        Side::Long => price <= level,
        Side::Short => price >= level,
    }
}

/// Price at or through `level` in the position's favor.
fn crossed_favorable(side: Side, price: Price, level: Price) -> bool {
    match side {
        Side::Long => price >= level,
        Side::Short => price <= level,
    }
}
