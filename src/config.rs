// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : ai_trader_rust — concurrent AI trading agents in Rust
Module  : config.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Runs one autonomous agent per (AI model, exchange account) pair,
          streams market data (mock/Binance/Aster/Hyperliquid), validates
          every AI decision against per-trader limits and a shared margin
          ledger, records JSONL decision logs and exposes Prometheus metrics.
=============================================================================
*/
use clap::{ArgAction, Parser, ValueEnum};
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::domain::{ExchangeKind, TraderId};

/// Hard ceiling on the share of equity that may be committed as margin.
pub const MAX_MARGIN_USAGE: f64 = 0.90;
/// Minimum take-profit distance as a multiple of stop-loss distance.
pub const MIN_REWARD_RISK: f64 = 2.0;

/// Sumber market data / venue trading
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum MarketMode {
    /// Random-walk quotes, paper venue, mock AI unless a provider key is set.
    Mock,
    Testnet,
    Mainnet,
}

impl MarketMode {
    // Endpoint default per mode
    pub fn default_ws_url(&self, exchange: ExchangeKind) -> &'static str {
        match (self, exchange) {
            (MarketMode::Mock, _) | (_, ExchangeKind::Paper) => "",
            (MarketMode::Testnet, ExchangeKind::Binance) => "wss://stream.binancefuture.com/ws",
            (MarketMode::Mainnet, ExchangeKind::Binance) => "wss://fstream.binance.com/ws",
            // Aster has no public testnet; both modes point at production.
            (_, ExchangeKind::Aster) => "wss://fstream.asterdex.com/ws",
            (MarketMode::Testnet, ExchangeKind::Hyperliquid) => "wss://api.hyperliquid-testnet.xyz/ws",
            (MarketMode::Mainnet, ExchangeKind::Hyperliquid) => "wss://api.hyperliquid.xyz/ws",
        }
    }

    pub fn default_rest_url(&self, exchange: ExchangeKind) -> &'static str {
        match (self, exchange) {
            (MarketMode::Mock, _) | (_, ExchangeKind::Paper) => "",
            (MarketMode::Testnet, ExchangeKind::Binance) => "https://testnet.binancefuture.com",
            (MarketMode::Mainnet, ExchangeKind::Binance) => "https://fapi.binance.com",
            (_, ExchangeKind::Aster) => "https://fapi.asterdex.com",
            (MarketMode::Testnet, ExchangeKind::Hyperliquid) => "https://api.hyperliquid-testnet.xyz",
            (MarketMode::Mainnet, ExchangeKind::Hyperliquid) => "https://api.hyperliquid.xyz",
        }
    }

    pub fn is_mainnet(&self) -> bool {
        matches!(self, MarketMode::Mainnet)
    }
}

#[derive(Parser, Clone, Debug)]
#[command(name = "ai_trader_rust", version, about = "Concurrent AI trading agents under a shared margin budget")]
pub struct Args {
    /// JSON array of trader configs
    #[arg(long, env = "TRADERS_FILE", default_value = "traders.json")]
    pub traders_file: PathBuf,

    /// Append-only JSONL decision log
    #[arg(long, env = "RECORD_FILE", default_value = "data/decisions.jsonl")]
    pub record_file: PathBuf,

    #[arg(long, env = "METRICS_PORT", default_value_t = 9898)]
    pub metrics_port: u16,

    #[arg(long, env = "MARKET_MODE", value_enum, default_value_t = MarketMode::Mock)]
    pub market_mode: MarketMode,

    /// Total equity backing the margin ledger; defaults to the sum of trader initial balances
    #[arg(long, env = "TOTAL_EQUITY")]
    pub total_equity: Option<f64>,

    /// Global ledger ceiling as a fraction of total equity (clamped to 0.90)
    #[arg(long, env = "MAX_MARGIN_USAGE", default_value_t = MAX_MARGIN_USAGE)]
    pub max_margin_usage: f64,

    #[arg(long, env = "FEED_STALE_MS", default_value_t = 15_000)]
    pub feed_stale_ms: u64,

    /// Per-subscriber snapshot buffer; oldest dropped on overflow
    #[arg(long, env = "FEED_BUFFER", default_value_t = 64)]
    pub feed_buffer: usize,

    #[arg(long, env = "AI_TIMEOUT_SECS", default_value_t = 90)]
    pub ai_timeout_secs: u64,

    #[arg(long, env = "AI_MAX_RETRIES", default_value_t = 3)]
    pub ai_max_retries: u32,

    /// Concurrent in-flight calls per AI provider
    #[arg(long, env = "AI_CONCURRENCY", default_value_t = 4)]
    pub ai_concurrency: usize,

    #[arg(long, env = "EXCHANGE_TIMEOUT_SECS", default_value_t = 10)]
    pub exchange_timeout_secs: u64,

    #[arg(long, env = "STOP_TIMEOUT_SECS", default_value_t = 30)]
    pub stop_timeout_secs: u64,

    /// Start every configured trader right after loading
    #[arg(long, env = "AUTO_START", action = ArgAction::Set, default_value_t = true)]
    pub auto_start: bool,
}

impl Args {
    pub fn feed_stale_after(&self) -> Duration {
        Duration::from_millis(self.feed_stale_ms)
    }

    pub fn ai_timeout(&self) -> Duration {
        Duration::from_secs(self.ai_timeout_secs)
    }

    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_secs(self.exchange_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

pub fn load() -> Args {
    // Pastikan .env dibaca sebelum clap membaca ENV
    let _ = dotenv();
    Args::parse()
}

/// String that never shows up in logs.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(s: impl Into<String>) -> Self {
        Secret(s.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("\"\"")
        } else {
            f.write_str("\"***\"")
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AiProvider {
    DeepSeek,
    Qwen,
    Mock,
}

impl AiProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            AiProvider::DeepSeek => "deepseek",
            AiProvider::Qwen => "qwen",
            AiProvider::Mock => "mock",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AiConfig {
    pub provider: AiProvider,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub api_key: Secret,
    #[serde(default)]
    pub base_url: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeCredentials {
    /// Binance / Aster
    pub api_key: Secret,
    pub api_secret: Secret,
    /// Hyperliquid signing key (hex) and the account it trades for
    pub private_key: Secret,
    pub wallet_address: Option<String>,
    /// Overrides the mode's default REST endpoint.
    pub rest_url: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ScheduleTrigger {
    Interval { secs: u64 },
    /// New snapshot on the first configured asset, at most once per `min_gap_secs`.
    Snapshot { min_gap_secs: u64 },
}

impl Default for ScheduleTrigger {
    fn default() -> Self {
        ScheduleTrigger::Interval { secs: 180 }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssetClass {
    Major,
    Altcoin,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskLimits {
    pub major_assets: Vec<String>,
    pub max_leverage_major: u32,
    pub max_leverage_altcoin: u32,
    /// Max position notional as a fraction of equity.
    pub max_position_pct_major: f64,
    pub max_position_pct_altcoin: f64,
    pub max_margin_usage: f64,
    pub min_reward_risk: f64,
    /// Fraction of day-start balance.
    pub daily_loss_limit_pct: f64,
    /// Fraction of peak equity.
    pub max_drawdown_pct: f64,
    pub min_position_usd: f64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            major_assets: vec!["BTC".into(), "ETH".into()],
            max_leverage_major: 10,
            max_leverage_altcoin: 5,
            max_position_pct_major: 0.30,
            max_position_pct_altcoin: 0.20,
            max_margin_usage: MAX_MARGIN_USAGE,
            min_reward_risk: MIN_REWARD_RISK,
            daily_loss_limit_pct: 0.05,
            max_drawdown_pct: 0.20,
            min_position_usd: 12.0,
        }
    }
}

impl RiskLimits {
    pub fn asset_class(&self, asset: &str) -> AssetClass {
        if self.major_assets.iter().any(|a| a.eq_ignore_ascii_case(asset)) {
            AssetClass::Major
        } else {
            AssetClass::Altcoin
        }
    }

    pub fn leverage_cap(&self, asset: &str) -> u32 {
        match self.asset_class(asset) {
            AssetClass::Major => self.max_leverage_major,
            AssetClass::Altcoin => self.max_leverage_altcoin,
        }
    }

    pub fn max_position_pct(&self, asset: &str) -> f64 {
        match self.asset_class(asset) {
            AssetClass::Major => self.max_position_pct_major,
            AssetClass::Altcoin => self.max_position_pct_altcoin,
        }
    }

    /// Margin usage with the 90 % hard ceiling applied.
    pub fn margin_usage(&self) -> f64 {
        self.max_margin_usage.min(MAX_MARGIN_USAGE)
    }

    /// Reward:risk with the 1:2 floor applied.
    pub fn reward_risk(&self) -> f64 {
        self.min_reward_risk.max(MIN_REWARD_RISK)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_leverage_major == 0 || self.max_leverage_altcoin == 0 {
            return Err("leverage caps must be at least 1".into());
        }
        for (name, v) in [
            ("max_position_pct_major", self.max_position_pct_major),
            ("max_position_pct_altcoin", self.max_position_pct_altcoin),
            ("daily_loss_limit_pct", self.daily_loss_limit_pct),
            ("max_drawdown_pct", self.max_drawdown_pct),
        ] {
            if !(v > 0.0 && v <= 1.0) {
                return Err(format!("{name} must be in (0, 1], got {v}"));
            }
        }
        if !(self.max_margin_usage > 0.0 && self.max_margin_usage <= MAX_MARGIN_USAGE) {
            return Err(format!(
                "max_margin_usage must be in (0, {MAX_MARGIN_USAGE}], got {}",
                self.max_margin_usage
            ));
        }
        if self.min_reward_risk < MIN_REWARD_RISK {
            return Err(format!(
                "min_reward_risk must be at least {MIN_REWARD_RISK}, got {}",
                self.min_reward_risk
            ));
        }
        if self.min_position_usd < 0.0 {
            return Err("min_position_usd must not be negative".into());
        }
        Ok(())
    }
}

fn default_history_len() -> usize {
    5
}

/// Static limits and wiring for one trader. Immutable while the trader runs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TraderConfig {
    #[serde(default)]
    pub id: Option<TraderId>,
    pub name: String,
    pub exchange: ExchangeKind,
    pub ai: AiConfig,
    pub assets: Vec<String>,
    /// Account equity the trader is sized against; also the basis of its ledger footprint.
    pub initial_balance: f64,
    #[serde(default)]
    pub trigger: ScheduleTrigger,
    #[serde(default)]
    pub limits: RiskLimits,
    #[serde(default)]
    pub credentials: ExchangeCredentials,
    #[serde(default = "default_history_len")]
    pub history_len: usize,
    /// Overrides the built-in system prompt template.
    #[serde(default)]
    pub prompt_template: Option<String>,
}

impl TraderConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("name must not be empty".into());
        }
        if self.assets.is_empty() {
            return Err("at least one asset is required".into());
        }
        if !(self.initial_balance > 0.0) {
            return Err(format!("initial_balance must be positive, got {}", self.initial_balance));
        }
        if let ScheduleTrigger::Interval { secs: 0 } = self.trigger {
            return Err("interval must be at least 1s".into());
        }
        self.limits.validate()
    }

    /// Margin reserved on the shared ledger while the trader is active.
    pub fn margin_footprint(&self) -> f64 {
        self.initial_balance * self.limits.margin_usage()
    }

    pub fn normalized_assets(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .assets
            .iter()
            .map(|a| a.trim().to_ascii_uppercase())
            .filter(|a| !a.is_empty())
            .collect();
        out.dedup();
        out
    }
}
