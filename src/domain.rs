// ===============================
// src/domain.rs
// ===============================
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::pnl::PnlState;

pub type TraderId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeKind {
    Binance,
    Hyperliquid,
    Aster,
    Paper,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Binance => "binance",
            ExchangeKind::Hyperliquid => "hyperliquid",
            ExchangeKind::Aster => "aster",
            ExchangeKind::Paper => "paper",
        }
    }

    /// Venue symbol for a base asset ("BTC" -> "BTCUSDT" on Binance-style venues).
    pub fn symbol_for(&self, asset: &str) -> String {
        let asset = asset.trim().to_ascii_uppercase();
        match self {
            ExchangeKind::Hyperliquid => asset,
            _ => format!("{asset}USDT"),
        }
    }

    /// Inverse of `symbol_for`.
    pub fn asset_of(&self, symbol: &str) -> String {
        let symbol = symbol.trim().to_ascii_uppercase();
        match self {
            ExchangeKind::Hyperliquid => symbol,
            _ => symbol.trim_end_matches("USDT").to_string(),
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn sign(&self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "long",
            Side::Short => "short",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-of-book view of one (exchange, asset) pair. Never mutated once
/// published; a newer snapshot with a higher `seq` supersedes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub exchange: ExchangeKind,
    pub asset: String,
    pub last_price: f64,
    pub best_bid: f64,
    pub best_ask: f64,
    pub ts: DateTime<Utc>,
    pub seq: u64,
    pub stale: bool,
}

impl MarketSnapshot {
    pub fn mid(&self) -> f64 {
        (self.best_bid + self.best_ask) / 2.0
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.ts).to_std().unwrap_or_default()
    }

    /// Copy of this snapshot with the staleness flag evaluated at `now`.
    pub fn observed_at(&self, now: DateTime<Utc>, stale_after: Duration) -> MarketSnapshot {
        MarketSnapshot {
            stale: self.age(now) > stale_after,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub asset: String,
    pub side: Side,
    /// Base-asset quantity, always positive.
    pub size: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub unrealized_pnl: f64,
    pub leverage: u32,
    pub margin: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
}

impl Position {
    pub fn notional(&self) -> f64 {
        self.size * self.mark_price
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountState {
    pub exchange: ExchangeKind,
    pub equity: f64,
    pub available_margin: f64,
    pub positions: Vec<Position>,
    pub ts: DateTime<Utc>,
}

impl AccountState {
    pub fn used_margin(&self) -> f64 {
        self.positions.iter().map(|p| p.margin).sum()
    }

    pub fn unrealized_pnl(&self) -> f64 {
        self.positions.iter().map(|p| p.unrealized_pnl).sum()
    }

    /// Equity without open-position PnL; moves only on realized PnL, fees and transfers.
    pub fn wallet_balance(&self) -> f64 {
        self.equity - self.unrealized_pnl()
    }

    pub fn position(&self, asset: &str, side: Side) -> Option<&Position> {
        self.positions
            .iter()
            .find(|p| p.side == side && p.asset.eq_ignore_ascii_case(asset))
    }

    pub fn position_size(&self, asset: &str, side: Side) -> f64 {
        self.position(asset, side).map(|p| p.size).unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Open,
    Close,
    Adjust,
    Hold,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Open => "open",
            Action::Close => "close",
            Action::Adjust => "adjust",
            Action::Hold => "hold",
        }
    }
}

/// One proposal from the AI decision source. Consumed exactly once by the
/// risk validator; clamping produces a new value instead of editing this one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub action: Action,
    pub asset: String,
    pub side: Option<Side>,
    /// Position notional in USD.
    pub size_usd: f64,
    pub leverage: u32,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    /// Price of `asset` in the snapshot the decision was made from.
    pub reference_price: f64,
    pub confidence: Option<u8>,
    pub reasoning: String,
}

impl Decision {
    pub fn hold(reasoning: impl Into<String>) -> Self {
        Decision {
            action: Action::Hold,
            asset: String::new(),
            side: None,
            size_usd: 0.0,
            leverage: 0,
            stop_loss: None,
            take_profit: None,
            reference_price: 0.0,
            confidence: None,
            reasoning: reasoning.into(),
        }
    }

    pub fn is_opening(&self) -> bool {
        self.action == Action::Open
    }

    pub fn margin_required(&self) -> f64 {
        if self.leverage == 0 {
            self.size_usd
        } else {
            self.size_usd / self.leverage as f64
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum RejectReason {
    #[error("leverage exceeds cap ({requested}x > {cap}x)")]
    LeverageExceedsCap { requested: u32, cap: u32 },

    #[error("invalid size: {detail}")]
    InvalidSize { detail: String },

    #[error("malformed decision: {detail}")]
    Malformed { detail: String },

    #[error("stop-loss and take-profit are required when opening")]
    MissingProtection,

    #[error("stop-loss/take-profit on the wrong side of entry {entry}")]
    ProtectionWrongSide { entry: f64 },

    #[error("reward:risk {ratio:.2} below minimum {min:.2}")]
    RewardRiskTooLow { ratio: f64, min: f64 },

    #[error("margin {required:.2} exceeds allowance {allowed:.2}")]
    MarginCeiling { required: f64, allowed: f64 },

    #[error("daily loss {loss:.2} reached limit {limit:.2}")]
    DailyLossLimit { loss: f64, limit: f64 },

    #[error("drawdown {drawdown_pct:.2}% reached limit {limit_pct:.2}%")]
    MaxDrawdown { drawdown_pct: f64, limit_pct: f64 },

    #[error("circuit breaker active until {until}")]
    CircuitBreakerActive { until: DateTime<Utc> },

    #[error("no open {side} position in {asset}")]
    NoPosition { asset: String, side: Side },

    #[error("margin ledger refused: {detail}")]
    LedgerRefused { detail: String },
}

impl RejectReason {
    /// Loss/drawdown breaches pause the trader until the next trading day.
    pub fn trips_breaker(&self) -> bool {
        matches!(
            self,
            RejectReason::DailyLossLimit { .. } | RejectReason::MaxDrawdown { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RiskVerdict {
    Approved,
    Clamped {
        adjusted: Decision,
        original_size_usd: f64,
    },
    Rejected {
        reason: RejectReason,
    },
}

impl RiskVerdict {
    pub fn label(&self) -> &'static str {
        match self {
            RiskVerdict::Approved => "approved",
            RiskVerdict::Clamped { .. } => "clamped",
            RiskVerdict::Rejected { .. } => "rejected",
        }
    }

    /// The decision to send to the exchange, if any.
    pub fn executable<'a>(&'a self, original: &'a Decision) -> Option<&'a Decision> {
        match self {
            RiskVerdict::Approved => Some(original),
            RiskVerdict::Clamped { adjusted, .. } => Some(adjusted),
            RiskVerdict::Rejected { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TraderState {
    Idle,
    Running,
    Paused { until: DateTime<Utc> },
    Stopped,
    Error { reason: String },
}

impl TraderState {
    pub fn label(&self) -> &'static str {
        match self {
            TraderState::Idle => "idle",
            TraderState::Running => "running",
            TraderState::Paused { .. } => "paused",
            TraderState::Stopped => "stopped",
            TraderState::Error { .. } => "error",
        }
    }

    /// Running or paused: the agent task is alive and owns a ledger budget.
    pub fn is_active(&self) -> bool {
        matches!(self, TraderState::Running | TraderState::Paused { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TraderState::Stopped | TraderState::Error { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    StaleMarketData { asset: String },
    MarketDataUnavailable { asset: String },
    AccountUnavailable { message: String },
    NoDecision { message: String },
    InvalidDecision { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CycleOutcome {
    Executed {
        order_id: String,
        filled_qty: f64,
        avg_price: f64,
    },
    NoAction,
    Rejected {
        reason: RejectReason,
    },
    VenueRejected {
        message: String,
    },
    /// Order failed for a non-business reason (credentials, bad request).
    OrderFailed {
        message: String,
    },
    PartialFailure {
        message: String,
    },
    Resubmitted {
        attempt: u32,
        order_id: String,
    },
    Skipped {
        reason: SkipReason,
    },
}

impl CycleOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            CycleOutcome::Executed { .. } => "executed",
            CycleOutcome::NoAction => "no_action",
            CycleOutcome::Rejected { .. } => "rejected",
            CycleOutcome::VenueRejected { .. } => "venue_rejected",
            CycleOutcome::OrderFailed { .. } => "order_failed",
            CycleOutcome::PartialFailure { .. } => "partial_failure",
            CycleOutcome::Resubmitted { .. } => "resubmitted",
            CycleOutcome::Skipped { .. } => "skipped",
        }
    }
}

/// Append-only audit entry; exactly one per cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub trader_id: TraderId,
    pub cycle: u64,
    pub idempotency_key: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub decision: Option<Decision>,
    pub verdict: Option<RiskVerdict>,
    pub outcome: CycleOutcome,
    pub proposed_size_usd: Option<f64>,
    pub executed_size_usd: Option<f64>,
    pub reconciliation: Option<String>,
    /// Account equity observed during the cycle.
    pub equity: Option<f64>,
    /// Daily PnL / breaker state after the cycle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pnl: Option<PnlState>,
}

impl DecisionRecord {
    pub fn new(trader_id: &str, cycle: u64, timestamp: DateTime<Utc>, outcome: CycleOutcome) -> Self {
        DecisionRecord {
            trader_id: trader_id.to_string(),
            cycle,
            idempotency_key: None,
            timestamp,
            decision: None,
            verdict: None,
            outcome,
            proposed_size_usd: None,
            executed_size_usd: None,
            reconciliation: None,
            equity: None,
            pnl: None,
        }
    }

    pub fn skipped(trader_id: &str, cycle: u64, timestamp: DateTime<Utc>, reason: SkipReason) -> Self {
        Self::new(trader_id, cycle, timestamp, CycleOutcome::Skipped { reason })
    }

    pub fn summary(&self) -> RecordSummary {
        RecordSummary {
            cycle: self.cycle,
            timestamp: self.timestamp,
            action: self.decision.as_ref().map(|d| d.action),
            asset: self
                .decision
                .as_ref()
                .filter(|d| !d.asset.is_empty())
                .map(|d| d.asset.clone()),
            verdict: self.verdict.as_ref().map(|v| v.label().to_string()),
            outcome: self.outcome.label().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordSummary {
    pub cycle: u64,
    pub timestamp: DateTime<Utc>,
    pub action: Option<Action>,
    pub asset: Option<String>,
    pub verdict: Option<String>,
    pub outcome: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbols_follow_venue_convention() {
        assert_eq!(ExchangeKind::Binance.symbol_for("btc"), "BTCUSDT");
        assert_eq!(ExchangeKind::Aster.asset_of("ETHUSDT"), "ETH");
        assert_eq!(ExchangeKind::Hyperliquid.symbol_for("sol"), "SOL");
    }

    #[test]
    fn staleness_is_evaluated_at_read_time() {
        let now = Utc::now();
        let snap = MarketSnapshot {
            exchange: ExchangeKind::Paper,
            asset: "BTC".into(),
            last_price: 100.0,
            best_bid: 99.5,
            best_ask: 100.5,
            ts: now - chrono::Duration::seconds(30),
            seq: 1,
            stale: false,
        };
        assert!(snap.observed_at(now, Duration::from_secs(10)).stale);
        assert!(!snap.observed_at(now, Duration::from_secs(60)).stale);
        assert!(!snap.stale);
    }

    #[test]
    fn reject_reason_serializes_with_code_tag() {
        let v = RiskVerdict::Rejected {
            reason: RejectReason::LeverageExceedsCap { requested: 15, cap: 10 },
        };
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(json["outcome"], "rejected");
        assert_eq!(json["reason"]["code"], "leverage_exceeds_cap");
        assert!(RejectReason::LeverageExceedsCap { requested: 15, cap: 10 }
            .to_string()
            .starts_with("leverage exceeds cap"));
    }
}
