// ===============================
// tests/agent_cycle.rs
// ===============================
//
// Single-agent cycles against the paper venue, a hand-fed quote source and a
// scripted AI. Most tests drive `step()` directly; the scheduling ones run
// the full loop.
//
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use ai_trader_rust::agent::{AgentDeps, AgentReport, Control, TraderAgent};
use ai_trader_rust::ai::{AiLimiters, DecisionClient};
use ai_trader_rust::ai_backends::ScriptedBackend;
use ai_trader_rust::config::{AiConfig, AiProvider, RiskLimits, ScheduleTrigger, Secret, TraderConfig};
use ai_trader_rust::domain::{CycleOutcome, ExchangeKind, RejectReason, RiskVerdict, Side, SkipReason, TraderState};
use ai_trader_rust::error::AiError;
use ai_trader_rust::exchange::{ExchangeAdapter, GuardedExchange};
use ai_trader_rust::feed::{FeedSettings, ManualSource, MarketFeed, Quote};
use ai_trader_rust::gateway::{Fault, PaperExchange};
use ai_trader_rust::ledger::MarginLedger;
use ai_trader_rust::recorder::MemorySink;
use ai_trader_rust::retry::Backoff;

const ID: &str = "alpha";

fn fast() -> Backoff {
    Backoff::new(Duration::from_millis(1), Duration::from_millis(2), Duration::ZERO, 1)
}

fn trader(assets: &[&str]) -> TraderConfig {
    TraderConfig {
        id: Some(ID.into()),
        name: "alpha".into(),
        exchange: ExchangeKind::Paper,
        ai: AiConfig { provider: AiProvider::Mock, model: None, api_key: Secret::default(), base_url: None },
        assets: assets.iter().map(|a| a.to_string()).collect(),
        initial_balance: 1_000.0,
        trigger: ScheduleTrigger::Interval { secs: 60 },
        limits: RiskLimits::default(),
        credentials: Default::default(),
        history_len: 5,
        prompt_template: None,
    }
}

struct Rig {
    agent: TraderAgent,
    cfg: TraderConfig,
    paper: Arc<PaperExchange>,
    source: Arc<ManualSource>,
    feed: Arc<MarketFeed>,
    ai: Arc<ScriptedBackend>,
    sink: Arc<MemorySink>,
    ledger: Arc<MarginLedger>,
}

impl Rig {
    fn new(cfg: TraderConfig) -> Self {
        let source = Arc::new(ManualSource::new());
        let settings = FeedSettings { stale_after: Duration::from_secs(5), ..FeedSettings::default() };
        let feed = Arc::new(MarketFeed::new(settings).with_source(ExchangeKind::Paper, source.clone()));
        let paper = Arc::new(PaperExchange::new(cfg.initial_balance));
        let ai = Arc::new(ScriptedBackend::new([]));
        let ledger = Arc::new(MarginLedger::new(cfg.initial_balance, 0.9));
        ledger.admit(ID, cfg.margin_footprint()).unwrap();
        let sink = Arc::new(MemorySink::new());
        let (agent, _report) = build_agent(&cfg, &paper, &feed, &ai, &ledger, &sink);
        Rig { agent, cfg, paper, source, feed, ai, sink, ledger }
    }

    /// A second agent for the same trader over the same venue, feed, ledger
    /// and decision log, as after a stop/start.
    fn fresh_agent(&self) -> (TraderAgent, watch::Receiver<AgentReport>) {
        if self.ledger.allocation(ID).is_none() {
            self.ledger.admit(ID, self.cfg.margin_footprint()).unwrap();
        }
        build_agent(&self.cfg, &self.paper, &self.feed, &self.ai, &self.ledger, &self.sink)
    }

    /// Pushes a price and waits until the feed serves it.
    async fn quote(&self, asset: &str, px: f64) {
        self.source.push_price(asset, px);
        self.paper.set_mark(asset, px);
        let _ = self.feed.subscribe(ExchangeKind::Paper, asset);
        let feed = self.feed.clone();
        let asset = asset.to_string();
        tokio::time::timeout(Duration::from_secs(2), async move {
            loop {
                if let Ok(s) = feed.latest(ExchangeKind::Paper, &asset) {
                    if (s.mid() - px).abs() < 1e-6 {
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("quote never reached the feed");
    }

    fn reply(&self, json: &str) {
        self.ai.push(Ok(json.to_string()));
    }
}

fn build_agent(
    cfg: &TraderConfig,
    paper: &Arc<PaperExchange>,
    feed: &Arc<MarketFeed>,
    ai: &Arc<ScriptedBackend>,
    ledger: &Arc<MarginLedger>,
    sink: &Arc<MemorySink>,
) -> (TraderAgent, watch::Receiver<AgentReport>) {
    let exchange: Arc<dyn ExchangeAdapter> = Arc::new(GuardedExchange::new(paper.clone(), Duration::from_secs(5)));
    let limiters = AiLimiters::new(2);
    let client = DecisionClient::new(ai.clone(), &limiters, cfg, Duration::from_secs(5), 0).with_backoff(Backoff {
        max_retries: 0,
        ..fast()
    });
    let deps = AgentDeps {
        exchange,
        ai: client,
        feed: feed.clone(),
        ledger: ledger.clone(),
        sink: sink.clone(),
    };
    let (agent, report) = TraderAgent::new(ID.into(), Arc::new(cfg.clone()), deps);
    (agent.with_exec_backoff(fast()), report)
}

async fn wait_report(report: &mut watch::Receiver<AgentReport>, pred: impl Fn(&AgentReport) -> bool) {
    report.wait_for(|r| pred(r)).await.expect("agent report channel closed");
}

async fn within<F: std::future::Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(3), fut).await.expect("timed out")
}

/// Opens 300 USD of BTC at 3x at 100 and closes it at 81: 57 realized loss.
async fn realize_loss(rig: &mut Rig) {
    rig.quote("BTC", 100.0).await;
    // wide stop so the drop below does not trigger it
    rig.reply(r#"{"action":"open_long","symbol":"BTC","position_size_usd":300,"leverage":3,"stop_loss":80,"take_profit":150}"#);
    assert!(matches!(rig.agent.step().await.record.outcome, CycleOutcome::Executed { .. }));

    rig.quote("BTC", 81.0).await;
    rig.reply(r#"{"action":"close_long","symbol":"BTC"}"#);
    assert!(matches!(rig.agent.step().await.record.outcome, CycleOutcome::Executed { .. }));
    assert!((rig.paper.wallet_balance() - 943.0).abs() < 1e-6);
}

const OPEN_BTC: &str =
    r#"{"action":"open_long","symbol":"BTC","position_size_usd":200,"leverage":4,"stop_loss":98,"take_profit":105}"#;

#[tokio::test]
async fn leverage_over_cap_is_rejected_without_an_order() {
    let mut rig = Rig::new(trader(&["BTC"]));
    rig.quote("BTC", 100.0).await;
    rig.reply(r#"{"action":"open_long","symbol":"BTC","position_size_usd":200,"leverage":15,"stop_loss":98,"take_profit":105}"#);

    let step = rig.agent.step().await;
    assert_eq!(step.control, Control::Continue);
    assert!(matches!(
        step.record.outcome,
        CycleOutcome::Rejected { reason: RejectReason::LeverageExceedsCap { requested: 15, cap: 10 } }
    ));
    assert!(step.record.idempotency_key.is_none());
    assert_eq!(rig.paper.fill_count(), 0);
    assert_eq!(rig.sink.len(), 1);
}

#[tokio::test]
async fn oversized_altcoin_order_is_clamped_and_both_sizes_recorded() {
    let mut rig = Rig::new(trader(&["SOL"]));
    rig.quote("SOL", 100.0).await;
    rig.reply(r#"{"action":"open_long","symbol":"SOL","position_size_usd":300,"leverage":3,"stop_loss":98,"take_profit":105}"#);

    let rec = rig.agent.step().await.record;
    assert!(matches!(rec.verdict, Some(RiskVerdict::Clamped { .. })), "{:?}", rec.verdict);
    assert!(matches!(rec.outcome, CycleOutcome::Executed { .. }), "{:?}", rec.outcome);
    assert_eq!(rec.proposed_size_usd, Some(300.0));
    let executed = rec.executed_size_usd.unwrap();
    assert!((executed - 200.0).abs() < 1e-6);

    let acct = rig.paper.account_state().await.unwrap();
    assert!((acct.position_size("SOL", Side::Long) - 2.0).abs() < 1e-6);
    // margin for 200 USD at 3x is tracked against the trader's budget
    let used = rig.ledger.allocation(ID).unwrap().used;
    assert!((used - 200.0 / 3.0).abs() < 1e-6);
}

#[tokio::test]
async fn stale_market_data_skips_without_asking_the_ai() {
    let mut rig = Rig::new(trader(&["BTC"]));
    rig.source.push("BTC", Quote::from_book(99.9, 100.1, Utc::now() - chrono::Duration::seconds(60)));
    let _ = rig.feed.subscribe(ExchangeKind::Paper, "BTC");
    tokio::time::timeout(Duration::from_secs(2), async {
        while rig.feed.latest(ExchangeKind::Paper, "BTC").is_err() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .unwrap();
    rig.reply(OPEN_BTC);

    let rec = rig.agent.step().await.record;
    assert_eq!(
        rec.outcome,
        CycleOutcome::Skipped { reason: SkipReason::StaleMarketData { asset: "BTC".into() } }
    );
    assert_eq!(rig.ai.calls(), 0);
    assert_eq!(rig.paper.fill_count(), 0);
}

#[tokio::test]
async fn missing_market_data_skips_and_opens_the_stream() {
    let mut rig = Rig::new(trader(&["ETH"]));
    let rec = rig.agent.step().await.record;
    assert_eq!(
        rec.outcome,
        CycleOutcome::Skipped { reason: SkipReason::MarketDataUnavailable { asset: "ETH".into() } }
    );
    assert_eq!(rig.feed.active_streams(), 1);
}

#[tokio::test]
async fn lost_order_is_resubmitted_under_a_new_key_without_the_ai() {
    let mut rig = Rig::new(trader(&["BTC"]));
    rig.quote("BTC", 100.0).await;
    rig.paper.inject(Fault::TimeoutBeforeFill);
    rig.reply(OPEN_BTC);

    let first = rig.agent.step().await.record;
    assert!(matches!(first.outcome, CycleOutcome::PartialFailure { .. }), "{:?}", first.outcome);
    assert!(rig.agent.has_pending_order());
    assert_eq!(rig.paper.fill_count(), 0);

    let second = rig.agent.step().await.record;
    assert!(matches!(second.outcome, CycleOutcome::Resubmitted { attempt: 1, .. }), "{:?}", second.outcome);
    let first_key = first.idempotency_key.unwrap();
    let second_key = second.idempotency_key.unwrap();
    assert_eq!(second_key, format!("{first_key}-r1"));
    assert!(second.reconciliation.is_some());
    assert_eq!(rig.ai.calls(), 1);
    assert_eq!(rig.paper.fill_count(), 1);
    assert!(!rig.agent.has_pending_order());
}

#[tokio::test]
async fn filled_but_unacknowledged_order_is_reconciled_not_repeated() {
    let mut rig = Rig::new(trader(&["BTC"]));
    rig.quote("BTC", 100.0).await;
    rig.paper.inject(Fault::TimeoutAfterFill);
    rig.reply(OPEN_BTC);

    let first = rig.agent.step().await.record;
    assert!(matches!(first.outcome, CycleOutcome::PartialFailure { .. }));
    assert_eq!(rig.paper.fill_count(), 1);

    rig.reply(r#"{"action":"hold","reasoning":"already in"}"#);
    let second = rig.agent.step().await.record;
    assert_eq!(second.outcome, CycleOutcome::NoAction);
    let note = second.reconciliation.unwrap();
    assert!(note.contains("without resubmission"), "{note}");
    assert_eq!(rig.paper.fill_count(), 1);
    assert_eq!(rig.ai.calls(), 2);
}

#[tokio::test]
async fn every_cycle_gets_its_own_order_key() {
    let mut rig = Rig::new(trader(&["BTC"]));
    rig.quote("BTC", 100.0).await;
    rig.reply(OPEN_BTC);
    rig.reply(r#"{"action":"close_long","symbol":"BTC"}"#);

    let open = rig.agent.step().await.record;
    let close = rig.agent.step().await.record;
    assert!(matches!(open.outcome, CycleOutcome::Executed { .. }));
    assert!(matches!(close.outcome, CycleOutcome::Executed { .. }), "{:?}", close.outcome);
    assert_ne!(open.idempotency_key, close.idempotency_key);
    assert_eq!(rig.paper.fill_count(), 2);
    assert!(rig.paper.account_state().await.unwrap().positions.is_empty());
}

#[tokio::test]
async fn daily_loss_trips_the_circuit_breaker() {
    let mut rig = Rig::new(trader(&["BTC"]));
    realize_loss(&mut rig).await;

    // 57 realized today > 5% of 1000
    rig.reply(r#"{"action":"hold"}"#);
    let step = rig.agent.step().await;
    assert!(matches!(
        step.record.outcome,
        CycleOutcome::Rejected { reason: RejectReason::DailyLossLimit { .. } }
    ));
    let Control::Pause(until) = step.control else {
        panic!("expected pause, got {:?}", step.control);
    };
    assert!(until > Utc::now());

    rig.reply(OPEN_BTC);
    let after = rig.agent.step().await.record;
    assert!(matches!(
        after.outcome,
        CycleOutcome::Rejected { reason: RejectReason::CircuitBreakerActive { .. } }
    ));
    assert_eq!(rig.paper.fill_count(), 2);
}

#[tokio::test]
async fn venue_rejection_returns_the_margin() {
    let mut rig = Rig::new(trader(&["BTC"]));
    rig.quote("BTC", 100.0).await;
    rig.paper.inject(Fault::Reject("margin is insufficient".into()));
    rig.reply(OPEN_BTC);

    let rec = rig.agent.step().await.record;
    assert!(matches!(rec.outcome, CycleOutcome::VenueRejected { .. }));
    assert_eq!(rig.ledger.allocation(ID).unwrap().used, 0.0);
    assert!(!rig.agent.has_pending_order());
}

#[tokio::test]
async fn repeated_auth_failures_end_in_fatal() {
    let mut rig = Rig::new(trader(&["BTC"]));
    rig.quote("BTC", 100.0).await;
    for _ in 0..3 {
        rig.paper.inject_account_fault(Fault::Unauthorized);
    }
    assert_eq!(rig.agent.step().await.control, Control::Continue);
    assert_eq!(rig.agent.step().await.control, Control::Continue);
    let third = rig.agent.step().await;
    assert!(matches!(third.control, Control::Fatal(_)));
    assert!(matches!(
        third.record.outcome,
        CycleOutcome::Skipped { reason: SkipReason::AccountUnavailable { .. } }
    ));
    assert_eq!(rig.sink.len(), 3);
}

#[tokio::test]
async fn successful_account_fetch_resets_fatal_streak() {
    let mut rig = Rig::new(trader(&["BTC"]));
    rig.quote("BTC", 100.0).await;
    rig.paper.inject_account_fault(Fault::Unauthorized);
    rig.paper.inject_account_fault(Fault::Unauthorized);
    rig.agent.step().await;
    rig.agent.step().await;
    // a successful fetch clears the streak
    rig.agent.step().await;
    rig.paper.inject_account_fault(Fault::Unauthorized);
    assert_eq!(rig.agent.step().await.control, Control::Continue);
}

#[tokio::test]
async fn malformed_ai_reply_is_recorded_as_invalid_decision() {
    let mut rig = Rig::new(trader(&["BTC"]));
    rig.quote("BTC", 100.0).await;
    rig.reply(r#"{"action":"open_long","symbol":"BTC","leverage":3}"#);

    let step = rig.agent.step().await;
    assert_eq!(step.control, Control::Continue);
    assert!(matches!(
        step.record.outcome,
        CycleOutcome::Skipped { reason: SkipReason::InvalidDecision { .. } }
    ));
    assert_eq!(rig.paper.fill_count(), 0);
}

#[tokio::test]
async fn fatal_ai_error_stops_the_agent() {
    let mut rig = Rig::new(trader(&["BTC"]));
    rig.quote("BTC", 100.0).await;
    rig.ai.push(Err(AiError::Fatal("HTTP 401: invalid key".into())));

    let step = rig.agent.step().await;
    assert!(matches!(step.control, Control::Fatal(_)));
    assert!(matches!(step.record.outcome, CycleOutcome::Skipped { reason: SkipReason::NoDecision { .. } }));
}

#[tokio::test]
async fn history_restore_continues_cycle_numbers() {
    let mut rig = Rig::new(trader(&["BTC"]));
    rig.quote("BTC", 100.0).await;
    for _ in 0..3 {
        rig.agent.step().await;
    }
    assert_eq!(rig.sink.len(), 3);

    // a fresh agent over the same sink picks up at cycle 4
    let (mut again, _report) = rig.fresh_agent();
    again.restore_history().await;
    assert_eq!(again.step().await.record.cycle, 4);
}

#[tokio::test]
async fn circuit_breaker_survives_an_agent_restart() {
    let mut rig = Rig::new(trader(&["BTC"]));
    realize_loss(&mut rig).await;
    rig.reply(r#"{"action":"hold"}"#);
    let Control::Pause(until) = rig.agent.step().await.control else {
        panic!("breaker did not trip");
    };

    let (mut again, _report) = rig.fresh_agent();
    again.restore_history().await;
    assert_eq!(again.breaker_until(), Some(until));

    rig.reply(OPEN_BTC);
    let rec = again.step().await.record;
    assert!(matches!(
        rec.outcome,
        CycleOutcome::Rejected { reason: RejectReason::CircuitBreakerActive { .. } }
    ), "{:?}", rec.outcome);
    assert_eq!(rig.paper.fill_count(), 2);
}

#[tokio::test]
async fn daily_loss_baseline_survives_an_agent_restart() {
    let mut rig = Rig::new(trader(&["BTC"]));
    realize_loss(&mut rig).await;

    // the loss is counted from the day's first balance, not the restart's
    let (mut again, _report) = rig.fresh_agent();
    again.restore_history().await;
    assert!(again.breaker_until().is_none());
    rig.reply(OPEN_BTC);
    let step = again.step().await;
    assert!(matches!(
        step.record.outcome,
        CycleOutcome::Rejected { reason: RejectReason::DailyLossLimit { .. } }
    ), "{:?}", step.record.outcome);
    assert!(matches!(step.control, Control::Pause(_)));
    assert_eq!(rig.paper.fill_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn run_pauses_on_the_breaker_and_resumes_at_the_day_boundary() {
    let mut rig = Rig::new(trader(&["BTC"]));
    realize_loss(&mut rig).await;
    rig.reply(r#"{"action":"hold"}"#);

    let (agent, mut report) = rig.fresh_agent();
    let (stop_tx, stop_rx) = watch::channel(false);
    let task = tokio::spawn(agent.run(stop_rx));

    // no timeouts here: the paused clock jumps straight to the next timer
    wait_report(&mut report, |r| matches!(r.state, TraderState::Paused { .. })).await;
    let TraderState::Paused { until } = report.borrow().state.clone() else {
        unreachable!()
    };
    assert!(until > Utc::now());
    assert_eq!(until.timestamp() % 86_400, 0);
    assert_eq!(rig.paper.fill_count(), 2);

    wait_report(&mut report, |r| r.state == TraderState::Running).await;

    stop_tx.send(true).unwrap();
    assert_eq!(task.await.unwrap(), TraderState::Stopped);
    assert!(rig.ledger.allocation(ID).is_none());
    assert!(rig.sink.records().iter().any(|r| matches!(
        r.outcome,
        CycleOutcome::Rejected { reason: RejectReason::DailyLossLimit { .. } }
    )));
}

#[tokio::test]
async fn snapshot_trigger_runs_one_cycle_per_new_quote() {
    let mut cfg = trader(&["BTC"]);
    cfg.trigger = ScheduleTrigger::Snapshot { min_gap_secs: 0 };
    let rig = Rig::new(cfg);
    rig.quote("BTC", 100.0).await;

    let (agent, mut report) = rig.fresh_agent();
    let (stop_tx, stop_rx) = watch::channel(false);
    let task = tokio::spawn(agent.run(stop_rx));

    within(wait_report(&mut report, |r| r.cycles >= 1)).await;
    // nothing new on the feed, nothing to do
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(report.borrow().cycles, 1);

    rig.source.push_price("BTC", 100.5);
    within(wait_report(&mut report, |r| r.cycles >= 2)).await;
    rig.source.push_price("BTC", 101.0);
    within(wait_report(&mut report, |r| r.cycles >= 3)).await;

    stop_tx.send(true).unwrap();
    assert_eq!(within(task).await.unwrap(), TraderState::Stopped);
    assert_eq!(rig.sink.len(), 3);
}

#[tokio::test]
async fn unsettled_order_keeps_one_margin_reservation() {
    let mut rig = Rig::new(trader(&["BTC"]));
    rig.quote("BTC", 100.0).await;
    rig.paper.inject(Fault::TimeoutBeforeFill);
    rig.paper.inject(Fault::TimeoutBeforeFill);
    rig.reply(OPEN_BTC);
    let used = || rig.ledger.allocation(ID).unwrap().used;

    // 200 USD at 4x
    let first = rig.agent.step().await.record;
    assert!(matches!(first.outcome, CycleOutcome::PartialFailure { .. }));
    assert!((used() - 50.0).abs() < 1e-9);

    // venue still flat: the resubmission takes over the reservation
    let second = rig.agent.step().await.record;
    assert!(matches!(second.outcome, CycleOutcome::PartialFailure { .. }), "{:?}", second.outcome);
    assert!((used() - 50.0).abs() < 1e-9, "used {}", used());

    let third = rig.agent.step().await.record;
    assert!(matches!(third.outcome, CycleOutcome::Resubmitted { attempt: 2, .. }), "{:?}", third.outcome);
    assert!((used() - 50.0).abs() < 1e-9, "used {}", used());
    assert_eq!(rig.paper.fill_count(), 1);
    assert_eq!(rig.ai.calls(), 1);
}

#[tokio::test]
async fn fatal_order_failure_is_logged_apart_from_venue_rejections() {
    let mut rig = Rig::new(trader(&["BTC"]));
    rig.quote("BTC", 100.0).await;
    rig.paper.inject(Fault::Unauthorized);
    rig.reply(OPEN_BTC);

    let step = rig.agent.step().await;
    assert_eq!(step.control, Control::Continue);
    assert!(matches!(step.record.outcome, CycleOutcome::OrderFailed { .. }), "{:?}", step.record.outcome);
    assert_eq!(rig.ledger.allocation(ID).unwrap().used, 0.0);
}
