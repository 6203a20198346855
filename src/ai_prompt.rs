// ===============================
// src/ai_prompt.rs
// ===============================
//
// Renders the system prompt (rules derived from the trader's limits) and
// the per-cycle user prompt (account, positions, market, history).
// Placeholders use `{name}`; unknown ones are left untouched.
//
use std::fmt::Write as _;

use crate::ai::DecisionContext;
use crate::config::TraderConfig;
use crate::domain::{CycleOutcome, DecisionRecord};

pub const DEFAULT_SYSTEM_TEMPLATE: &str = r#"You are {trader_name}, an autonomous crypto perpetual-futures trader.
Tradeable assets: {assets}. Major assets: {major_assets}; everything else is an altcoin.

Hard rules (orders breaking them are rejected or reduced):
- Leverage at most {max_leverage_major}x on majors and {max_leverage_altcoin}x on altcoins.
- Position notional at most {max_position_pct_major}% of equity on majors, {max_position_pct_altcoin}% on altcoins, and at least {min_position_usd} USD.
- Every new position needs a stop_loss and a take_profit; reward:risk must be at least 1:{min_reward_risk}.
- Total margin in use stays below {max_margin_usage_pct}% of equity.
- Trading halts for the day after a {daily_loss_limit_pct}% daily loss or a {max_drawdown_pct}% drawdown.

Think briefly, then answer with exactly one JSON object:
{"action": "open_long|open_short|close_long|close_short|adjust_long|adjust_short|hold",
 "symbol": "BTC", "position_size_usd": 500, "leverage": 3,
 "stop_loss": 0, "take_profit": 0, "confidence": 0-100, "reasoning": "short explanation"}
Use "hold" when nothing is worth doing."#;

/// Substitutes `{key}` for each pair.
pub fn render(template: &str, vars: &[(&str, String)]) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}

fn pct(v: f64) -> String {
    format!("{:.0}", v * 100.0)
}

pub fn system_prompt(cfg: &TraderConfig) -> String {
    let l = &cfg.limits;
    let template = cfg.prompt_template.as_deref().unwrap_or(DEFAULT_SYSTEM_TEMPLATE);
    render(
        template,
        &[
            ("trader_name", cfg.name.clone()),
            ("assets", cfg.normalized_assets().join(", ")),
            ("major_assets", l.major_assets.join(", ")),
            ("max_leverage_major", l.max_leverage_major.to_string()),
            ("max_leverage_altcoin", l.max_leverage_altcoin.to_string()),
            ("max_position_pct_major", pct(l.max_position_pct_major)),
            ("max_position_pct_altcoin", pct(l.max_position_pct_altcoin)),
            ("min_position_usd", format!("{:.0}", l.min_position_usd)),
            ("min_reward_risk", format!("{:.1}", l.reward_risk())),
            ("max_margin_usage_pct", pct(l.margin_usage())),
            ("daily_loss_limit_pct", pct(l.daily_loss_limit_pct)),
            ("max_drawdown_pct", pct(l.max_drawdown_pct)),
        ],
    )
}

/// Counts and equity drift over the history window.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Performance {
    pub executed: usize,
    pub rejected: usize,
    pub skipped: usize,
    pub equity_change: Option<f64>,
}

pub fn performance(history: &[DecisionRecord]) -> Performance {
    let mut p = Performance::default();
    for r in history {
        match r.outcome {
            CycleOutcome::Executed { .. } | CycleOutcome::Resubmitted { .. } => p.executed += 1,
            CycleOutcome::Rejected { .. } | CycleOutcome::VenueRejected { .. } | CycleOutcome::OrderFailed { .. } => {
                p.rejected += 1
            }
            CycleOutcome::Skipped { .. } => p.skipped += 1,
            CycleOutcome::NoAction | CycleOutcome::PartialFailure { .. } => {}
        }
    }
    let mut equities = history.iter().filter_map(|r| r.equity);
    if let Some(first) = equities.next() {
        let last = equities.last().unwrap_or(first);
        p.equity_change = Some(last - first);
    }
    p
}

pub fn user_prompt(ctx: &DecisionContext) -> String {
    let mut s = String::new();
    let acct = &ctx.account;
    let _ = writeln!(s, "Time: {}", ctx.now.format("%Y-%m-%d %H:%M:%S UTC"));
    let _ = writeln!(
        s,
        "Account: equity={:.2} available={:.2} margin_used={:.2} unrealized_pnl={:.2}",
        acct.equity,
        acct.available_margin,
        acct.used_margin(),
        acct.unrealized_pnl()
    );

    s.push_str("\nPositions:\n");
    if acct.positions.is_empty() {
        s.push_str("- none\n");
    }
    for p in &acct.positions {
        let lvl = |v: Option<f64>| v.map(|x| format!("{x:.4}")).unwrap_or_else(|| "-".into());
        let _ = writeln!(
            s,
            "- {} {} size={} entry={:.4} mark={:.4} pnl={:.2} lev={}x sl={} tp={}",
            p.asset,
            p.side,
            p.size,
            p.entry_price,
            p.mark_price,
            p.unrealized_pnl,
            p.leverage,
            lvl(p.stop_loss),
            lvl(p.take_profit)
        );
    }

    s.push_str("\nMarket:\n");
    for snap in &ctx.snapshots {
        let _ = writeln!(
            s,
            "- {} mid={:.4} bid={:.4} ask={:.4} last={:.4} age={}s",
            snap.asset,
            snap.mid(),
            snap.best_bid,
            snap.best_ask,
            snap.last_price,
            snap.age(ctx.now).as_secs()
        );
    }

    if !ctx.history.is_empty() {
        s.push_str("\nRecent cycles (oldest first):\n");
        for r in &ctx.history {
            let sm = r.summary();
            let _ = writeln!(
                s,
                "- #{} {} {} {} -> {}",
                sm.cycle,
                sm.timestamp.format("%H:%M"),
                sm.action.map(|a| a.as_str()).unwrap_or("none"),
                sm.asset.as_deref().unwrap_or(""),
                sm.outcome
            );
        }
        let perf = performance(&ctx.history);
        let _ = write!(
            s,
            "Performance: executed={} rejected={} skipped={}",
            perf.executed, perf.rejected, perf.skipped
        );
        if let Some(d) = perf.equity_change {
            let _ = write!(s, " equity_change={d:+.2}");
        }
        s.push('\n');
    }
    s
}
