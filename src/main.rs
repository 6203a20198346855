// ===============================
// src/main.rs
// ===============================
/*
 # jalankan dengan mock market + paper venue + mock AI
 MARKET_MODE=mock TRADERS_FILE=traders.json cargo run --release

 # status trader & verdict risk
curl -s localhost:9898/metrics | grep '^trader_state'
curl -s localhost:9898/metrics | grep '^risk_verdicts_total'
*/
/*
=============================================================================
Project : ai_trader_rust — concurrent AI trading agents in Rust
Module  : main.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Runs one autonomous agent per (AI model, exchange account) pair,
          streams market data (mock/Binance/Aster/Hyperliquid), validates
          every AI decision against per-trader limits and a shared margin
          ledger, records JSONL decision logs and exposes Prometheus metrics.
=============================================================================
*/
use anyhow::Context;
use std::sync::Arc;
use tokio::{select, time::Duration};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ai_trader_rust::{
    ai::AiLimiters,
    config::{self, MarketMode},
    domain::ExchangeKind,
    feed::{FeedSettings, MarketFeed, MockSource},
    feed_binance::BookTickerSource,
    feed_hyperliquid::L2BookSource,
    ledger::MarginLedger,
    manager::{LiveFactory, ManagerSettings, TraderManager},
    metrics,
    recorder::JsonlRecorder,
    retry::Backoff,
    store::{ConfigStore, JsonFileStore},
};

fn build_feed(args: &config::Args) -> MarketFeed {
    let settings = FeedSettings {
        stale_after: args.feed_stale_after(),
        buffer: args.feed_buffer,
        ..FeedSettings::default()
    };
    let mode = args.market_mode;
    let feed = MarketFeed::new(settings);
    match mode {
        MarketMode::Mock => {
            let mock = Arc::new(MockSource::default());
            [ExchangeKind::Binance, ExchangeKind::Aster, ExchangeKind::Hyperliquid, ExchangeKind::Paper]
                .into_iter()
                .fold(feed, |f, kind| f.with_source(kind, mock.clone()))
        }
        MarketMode::Testnet | MarketMode::Mainnet => {
            let binance = Arc::new(BookTickerSource::new(
                ExchangeKind::Binance,
                mode.default_ws_url(ExchangeKind::Binance),
            ));
            feed.with_source(ExchangeKind::Binance, binance.clone())
                // paper venue pakai harga Binance
                .with_source(ExchangeKind::Paper, binance)
                .with_source(
                    ExchangeKind::Aster,
                    Arc::new(BookTickerSource::new(ExchangeKind::Aster, mode.default_ws_url(ExchangeKind::Aster))),
                )
                .with_source(
                    ExchangeKind::Hyperliquid,
                    Arc::new(L2BookSource::new(mode.default_ws_url(ExchangeKind::Hyperliquid))),
                )
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ---- Load config ----
    let args = config::load();

    // ---- Metrics ----
    metrics::init();
    tokio::spawn(metrics::serve_metrics(args.metrics_port));

    // ---- Traders ----
    let store = JsonFileStore::new(&args.traders_file);
    let traders = store
        .list()
        .await
        .with_context(|| format!("loading traders from {}", args.traders_file.display()))?;

    let total_equity = args
        .total_equity
        .unwrap_or_else(|| traders.iter().map(|t| t.initial_balance).sum());
    info!(
        market_mode = ?args.market_mode,
        traders = traders.len(),
        total_equity,
        max_margin_usage = args.max_margin_usage,
        record_file = %args.record_file.display(),
        "startup config"
    );

    // ---- Shared services ----
    let feed = Arc::new(build_feed(&args));
    let ledger = Arc::new(MarginLedger::new(total_equity, args.max_margin_usage));
    let (recorder, recorder_task) = JsonlRecorder::spawn(&args.record_file);
    let limiters = Arc::new(AiLimiters::new(args.ai_concurrency));
    let factory = Arc::new(LiveFactory::new(
        args.market_mode,
        feed.clone(),
        args.exchange_timeout(),
        args.ai_timeout(),
    ));
    let settings = ManagerSettings {
        ai_timeout: args.ai_timeout(),
        ai_backoff: Backoff::ai(args.ai_max_retries),
        exchange_timeout: args.exchange_timeout(),
        stop_timeout: args.stop_timeout(),
        ..ManagerSettings::default()
    };
    let manager = TraderManager::new(ledger.clone(), feed.clone(), Arc::new(recorder), factory, limiters, settings);

    for cfg in traders {
        let name = cfg.name.clone();
        match manager.create(cfg) {
            Ok(id) => {
                if args.auto_start {
                    if let Err(e) = manager.start(&id).await {
                        warn!(trader = %id, error = %e, "trader not started");
                    }
                }
            }
            Err(e) => warn!(trader = %name, error = %e, "trader config rejected"),
        }
    }

    // ---- Heartbeat sampai Ctrl-C ----
    let mut heartbeat = tokio::time::interval(Duration::from_secs(30));
    loop {
        select! {
            _ = heartbeat.tick() => {
                let all = manager.list();
                let active = all.iter().filter(|s| s.state.is_active()).count();
                info!(
                    traders = all.len(),
                    active,
                    allocated = ledger.total_allocated(),
                    ceiling = ledger.ceiling(),
                    streams = feed.active_streams(),
                    "heartbeat"
                );
            }
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    warn!(?e, "ctrl_c handler failed, shutting down");
                }
                break;
            }
        }
    }

    info!("shutting down traders");
    manager.shutdown().await;
    // Tutup channel recorder supaya writer flush lalu selesai
    drop(manager);
    if let Err(e) = recorder_task.await {
        warn!(?e, "recorder task ended abnormally");
    }
    info!("bye");
    Ok(())
}
