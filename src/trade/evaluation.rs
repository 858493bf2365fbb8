//! Per-tick evaluation of an active pair trade.
//!
//! Pure functions: no I/O, no clock reads. The caller supplies prices and
//! the evaluation time, then decides what to do with the returned decision.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use super::model::{CloseReason, DownsideExit, PairTrade, RiskSettings};

/// Evaluation switches that are not part of the trade record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvaluationOptions {
    /// Close with `max_loss` when total PnL reaches -1R and no other downside exit fired
    pub max_loss_guard: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub ratio_change_percent: Decimal,
    pub close_reason: Option<CloseReason>,
}

impl Evaluation {
    pub fn should_close(&self) -> bool {
        self.close_reason.is_some()
    }
}

/// `(ratio / entry_ratio - 1) * 100`
pub fn ratio_change_percent(ratio: Decimal, entry_ratio: Decimal) -> Decimal {
    if entry_ratio.is_zero() {
        return Decimal::ZERO;
    }
    (ratio / entry_ratio - Decimal::ONE) * Decimal::ONE_HUNDRED
}

/// Decide whether the trade should close.
///
/// The downside branch is selected by the current [`DownsideExit`] mode.
/// A trailing floor that has not armed yet closes at the stop-loss distance,
/// so a trailing trade is never without a downside exit. Take-profit is checked unconditionally and wins over any downside reason.
pub fn decide_close(
    risk: &RiskSettings,
    change_percent: Decimal,
    mfe: Decimal,
    total_pnl: Decimal,
    options: EvaluationOptions,
) -> Option<CloseReason> {
    let mut reason = match risk.downside {
        DownsideExit::TrailingStop { level_percent } => {
            // Until the floor arms, the stop-loss distance is the floor
            let floor = if mfe >= level_percent {
                level_percent
            } else {
                -risk.stop_loss_percent
            };
            (change_percent <= floor).then_some(CloseReason::TrailingStop)
        }
        DownsideExit::StopLoss => {
            (change_percent <= -risk.stop_loss_percent).then_some(CloseReason::StopLoss)
        }
    };

    if reason.is_none() && options.max_loss_guard && total_pnl <= -risk.max_loss {
        reason = Some(CloseReason::MaxLoss);
    }

    if change_percent >= risk.take_profit_percent {
        reason = Some(CloseReason::TakeProfit);
    }

    reason
}

/// Re-mark `trade` at the given prices and decide on closure.
///
/// Running fields (ratios, extremes, leg PnL) are updated whether or not a
/// close is signalled.
pub fn evaluate(
    trade: &mut PairTrade,
    long_price: Decimal,
    short_price: Decimal,
    options: EvaluationOptions,
    now: DateTime<Utc>,
) -> Evaluation {
    let current_ratio = long_price / short_price;
    let entry_ratio = trade.entry_ratio;

    trade.current_ratio = current_ratio;
    trade.max_ratio = trade.max_ratio.max(current_ratio);
    trade.min_ratio = trade.min_ratio.min(current_ratio);

    trade.mae = if trade.min_ratio < entry_ratio {
        ratio_change_percent(trade.min_ratio, entry_ratio).abs()
    } else {
        Decimal::ZERO
    };
    trade.mfe = if trade.max_ratio > entry_ratio {
        ratio_change_percent(trade.max_ratio, entry_ratio).abs()
    } else {
        Decimal::ZERO
    };

    let change = ratio_change_percent(current_ratio, entry_ratio);
    trade.ratio_change_percent = change;

    // A leg closed by a partial close keeps its realized PnL
    if !trade.long.is_closed() {
        trade.long.mark(long_price);
    }
    if !trade.short.is_closed() {
        trade.short.mark(short_price);
    }
    trade.recompute_totals();
    trade.updated_at = now;

    let close_reason = decide_close(&trade.risk, change, trade.mfe, trade.total_pnl, options);

    Evaluation {
        ratio_change_percent: change,
        close_reason,
    }
}
