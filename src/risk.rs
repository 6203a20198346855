// ===============================
// src/risk.rs
// ===============================
//
// Pure pre-trade validation. Checks run in a fixed order and the first
// failure decides the verdict:
//   0) circuit breaker already tripped -> reject everything
//   1) leverage <= per-asset-class cap                 -> else Rejected
//   2) size <= max % of equity                         -> else Clamped
//   3) stop-loss + take-profit, reward:risk >= 1:2     -> else Rejected
//   4) margin + trader's ledger usage <= 90% of equity -> else Rejected
//   5) daily loss / drawdown below limits              -> else Rejected (+ pause)
//
// Close and Hold are risk reducing and only go through 0) and 5).
//
use crate::config::{RiskLimits, TraderConfig};
use crate::domain::{AccountState, Action, Decision, RejectReason, RiskVerdict, Side};
use crate::ledger::LedgerView;
use crate::pnl::PnlView;

const EPS: f64 = 1e-9;

pub fn validate(
    decision: &Decision,
    config: &TraderConfig,
    ledger: &LedgerView,
    account: &AccountState,
    pnl: &PnlView,
) -> RiskVerdict {
    match check(decision, &config.limits, ledger, account, pnl) {
        Ok(None) => RiskVerdict::Approved,
        Ok(Some(adjusted)) => RiskVerdict::Clamped {
            original_size_usd: decision.size_usd,
            adjusted,
        },
        Err(reason) => RiskVerdict::Rejected { reason },
    }
}

fn check(
    d: &Decision,
    lim: &RiskLimits,
    ledger: &LedgerView,
    account: &AccountState,
    pnl: &PnlView,
) -> Result<Option<Decision>, RejectReason> {
    // 0) breaker
    if let Some(until) = pnl.breaker_until {
        return Err(RejectReason::CircuitBreakerActive { until });
    }

    match d.action {
        Action::Hold => {
            check_loss_limits(lim, pnl)?;
            Ok(None)
        }
        Action::Close => {
            let side = side_of(d)?;
            if account.position(&d.asset, side).is_none() {
                return Err(RejectReason::NoPosition { asset: d.asset.clone(), side });
            }
            check_loss_limits(lim, pnl)?;
            Ok(None)
        }
        Action::Adjust => {
            let side = side_of(d)?;
            let pos = account
                .position(&d.asset, side)
                .ok_or_else(|| RejectReason::NoPosition { asset: d.asset.clone(), side })?;
            let mark = if d.reference_price > 0.0 { d.reference_price } else { pos.mark_price };
            let sl = d.stop_loss.or(pos.stop_loss);
            let tp = d.take_profit.or(pos.take_profit);
            check_adjusted_protection(side, pos.entry_price, mark, sl, tp, lim.reward_risk())?;
            check_loss_limits(lim, pnl)?;
            Ok(None)
        }
        Action::Open => {
            let side = side_of(d)?;

            // 1) leverage
            let cap = lim.leverage_cap(&d.asset);
            if d.leverage == 0 {
                return Err(RejectReason::Malformed { detail: "leverage must be at least 1".into() });
            }
            if d.leverage > cap {
                return Err(RejectReason::LeverageExceedsCap { requested: d.leverage, cap });
            }

            // 2) size, clamped down to the allowed share of equity
            if !(d.size_usd > 0.0) || !d.size_usd.is_finite() {
                return Err(RejectReason::InvalidSize {
                    detail: format!("size {} must be positive", d.size_usd),
                });
            }
            let max_size = lim.max_position_pct(&d.asset) * account.equity;
            let adjusted = if d.size_usd > max_size + EPS {
                Some(Decision { size_usd: max_size, ..d.clone() })
            } else {
                None
            };
            let effective = adjusted.as_ref().unwrap_or(d);
            if effective.size_usd + EPS < lim.min_position_usd {
                return Err(RejectReason::InvalidSize {
                    detail: format!(
                        "size {:.2} below venue minimum {:.2}",
                        effective.size_usd, lim.min_position_usd
                    ),
                });
            }

            // 3) protection
            check_protection(side, d.reference_price, d.stop_loss, d.take_profit, lim.reward_risk())?;

            // 4) margin
            let required = effective.margin_required();
            let allowed = (lim.margin_usage() * account.equity - ledger.trader_used())
                .min(ledger.trader_remaining())
                .min(account.available_margin)
                .max(0.0);
            if required > allowed + EPS {
                return Err(RejectReason::MarginCeiling { required, allowed });
            }

            // 5) loss limits
            check_loss_limits(lim, pnl)?;

            Ok(adjusted)
        }
    }
}

fn side_of(d: &Decision) -> Result<Side, RejectReason> {
    d.side.ok_or_else(|| RejectReason::Malformed {
        detail: format!("{} on {} without a side", d.action.as_str(), d.asset),
    })
}

/// Take-profit distance must be at least `min_rr` times the stop distance,
/// both measured from `entry` and on the correct sides of it.
pub fn check_protection(
    side: Side,
    entry: f64,
    stop_loss: Option<f64>,
    take_profit: Option<f64>,
    min_rr: f64,
) -> Result<(), RejectReason> {
    let (Some(sl), Some(tp)) = (stop_loss, take_profit) else {
        return Err(RejectReason::MissingProtection);
    };
    if !(entry > 0.0) {
        return Err(RejectReason::Malformed { detail: "no reference price for entry".into() });
    }
    let risk = (entry - sl) * side.sign();
    let reward = (tp - entry) * side.sign();
    if risk <= 0.0 || reward <= 0.0 {
        return Err(RejectReason::ProtectionWrongSide { entry });
    }
    let ratio = reward / risk;
    if ratio + EPS < min_rr {
        return Err(RejectReason::RewardRiskTooLow { ratio, min: min_rr });
    }
    Ok(())
}

/// Adjusting an open position: levels must sit on the right sides of the
/// current mark. A stop that still risks capital (loss side of entry) keeps
/// the reward:risk requirement; a stop that locks in profit has no risk left.
fn check_adjusted_protection(
    side: Side,
    entry: f64,
    mark: f64,
    stop_loss: Option<f64>,
    take_profit: Option<f64>,
    min_rr: f64,
) -> Result<(), RejectReason> {
    let (Some(sl), Some(tp)) = (stop_loss, take_profit) else {
        return Err(RejectReason::MissingProtection);
    };
    if (mark - sl) * side.sign() <= 0.0 || (tp - mark) * side.sign() <= 0.0 {
        return Err(RejectReason::ProtectionWrongSide { entry: mark });
    }
    if (entry - sl) * side.sign() > 0.0 {
        check_protection(side, entry, Some(sl), Some(tp), min_rr)?;
    }
    Ok(())
}

fn check_loss_limits(lim: &RiskLimits, pnl: &PnlView) -> Result<(), RejectReason> {
    let limit = lim.daily_loss_limit_pct * pnl.day_start_balance;
    let loss = pnl.daily_loss();
    if limit > 0.0 && loss + EPS >= limit {
        return Err(RejectReason::DailyLossLimit { loss, limit });
    }
    let dd = pnl.drawdown();
    if dd + EPS >= lim.max_drawdown_pct {
        return Err(RejectReason::MaxDrawdown {
            drawdown_pct: dd * 100.0,
            limit_pct: lim.max_drawdown_pct * 100.0,
        });
    }
    Ok(())
}
