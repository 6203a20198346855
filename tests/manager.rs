// ===============================
// tests/manager.rs
// ===============================
//
// Lifecycle, admission control and crash isolation through TraderManager,
// with paper venues and scripted/mock AI wired by a test factory.
//
use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ai_trader_rust::ai::AiLimiters;
use ai_trader_rust::ai_backends::{AiBackend, MockBackend, ScriptedBackend};
use ai_trader_rust::config::{AiConfig, AiProvider, RiskLimits, ScheduleTrigger, Secret, TraderConfig};
use ai_trader_rust::domain::{ExchangeKind, TraderState};
use ai_trader_rust::error::{AiError, ManagerError};
use ai_trader_rust::feed::{FeedSettings, ManualSource, MarketFeed};
use ai_trader_rust::gateway::{Fault, PaperExchange};
use ai_trader_rust::ledger::MarginLedger;
use ai_trader_rust::manager::{AdapterFactory, ManagerSettings, TraderManager, VenueHandle};
use ai_trader_rust::recorder::MemorySink;
use ai_trader_rust::retry::Backoff;

struct Panicky;

#[async_trait]
impl AiBackend for Panicky {
    fn provider(&self) -> AiProvider {
        AiProvider::Mock
    }

    async fn complete(&self, _system: &str, _user: &str) -> Result<String, AiError> {
        panic!("model client blew up");
    }
}

/// One paper venue per trader, kept across restarts like a real account.
/// Traders named "panic-*" get an AI that panics, "badkey-*" a venue that
/// refuses every account query, and scripted traders replay their replies.
#[derive(Default)]
struct TestFactory {
    venues: Mutex<HashMap<String, Arc<PaperExchange>>>,
    scripts: Mutex<HashMap<String, Arc<ScriptedBackend>>>,
}

impl TestFactory {
    fn venue(&self, id: &str) -> Arc<PaperExchange> {
        self.venues.lock().unwrap().get(id).cloned().unwrap()
    }

    fn script(&self, name: &str, replies: &[&str]) -> Arc<ScriptedBackend> {
        let ai = Arc::new(ScriptedBackend::new(replies.iter().map(|r| Ok(r.to_string()))));
        self.scripts.lock().unwrap().insert(name.to_string(), ai.clone());
        ai
    }
}

impl AdapterFactory for TestFactory {
    fn exchange(&self, trader_id: &str, cfg: &TraderConfig) -> Result<VenueHandle, ManagerError> {
        if let Some(paper) = self.venues.lock().unwrap().get(trader_id) {
            return Ok(VenueHandle::new(paper.clone()));
        }
        let paper = Arc::new(PaperExchange::new(cfg.initial_balance));
        if cfg.name.starts_with("badkey") {
            for _ in 0..10 {
                paper.inject_account_fault(Fault::Unauthorized);
            }
        }
        self.venues.lock().unwrap().insert(trader_id.to_string(), paper.clone());
        Ok(VenueHandle::new(paper))
    }

    fn ai_backend(&self, cfg: &TraderConfig) -> Result<Arc<dyn AiBackend>, ManagerError> {
        if let Some(ai) = self.scripts.lock().unwrap().get(&cfg.name) {
            return Ok(ai.clone());
        }
        if cfg.name.starts_with("panic") {
            Ok(Arc::new(Panicky))
        } else {
            Ok(Arc::new(MockBackend::default()))
        }
    }
}

fn trader(name: &str, balance: f64) -> TraderConfig {
    TraderConfig {
        id: Some(name.into()),
        name: name.into(),
        exchange: ExchangeKind::Paper,
        ai: AiConfig { provider: AiProvider::Mock, model: None, api_key: Secret::default(), base_url: None },
        assets: vec!["BTC".into()],
        initial_balance: balance,
        trigger: ScheduleTrigger::Interval { secs: 3600 },
        limits: RiskLimits::default(),
        credentials: Default::default(),
        history_len: 5,
        prompt_template: None,
    }
}

struct Rig {
    manager: Arc<TraderManager>,
    factory: Arc<TestFactory>,
    source: Arc<ManualSource>,
    feed: Arc<MarketFeed>,
    sink: Arc<MemorySink>,
    ledger: Arc<MarginLedger>,
}

fn rig(total_equity: f64) -> Rig {
    let source = Arc::new(ManualSource::new());
    source.push_price("BTC", 100.0);
    let feed = Arc::new(MarketFeed::new(FeedSettings::default()).with_source(ExchangeKind::Paper, source.clone()));
    let ledger = Arc::new(MarginLedger::new(total_equity, 0.9));
    let sink = Arc::new(MemorySink::new());
    let factory = Arc::new(TestFactory::default());
    let fast = Backoff::new(Duration::from_millis(1), Duration::from_millis(2), Duration::ZERO, 0);
    let settings = ManagerSettings {
        ai_timeout: Duration::from_secs(2),
        ai_backoff: fast.clone(),
        exchange_timeout: Duration::from_secs(2),
        exec_backoff: fast,
        stop_timeout: Duration::from_secs(2),
    };
    let manager = Arc::new(TraderManager::new(
        ledger.clone(),
        feed.clone(),
        sink.clone(),
        factory.clone(),
        Arc::new(AiLimiters::new(4)),
        settings,
    ));
    Rig { manager, factory, source, feed, sink, ledger }
}

impl Rig {
    /// Opens the BTC stream and waits for the pushed quote.
    async fn prime(&self) {
        let mut sub = self.feed.subscribe(ExchangeKind::Paper, "BTC").unwrap();
        tokio::time::timeout(Duration::from_secs(2), sub.next()).await.unwrap();
    }

    async fn wait_for(&self, id: &str, pred: impl Fn(&TraderState) -> bool) -> TraderState {
        let manager = self.manager.clone();
        tokio::time::timeout(Duration::from_secs(6), async move {
            loop {
                let state = manager.status(id).unwrap().state;
                if pred(&state) {
                    return state;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("state never reached")
    }

    async fn wait_cycles(&self, id: &str, n: u64) {
        let manager = self.manager.clone();
        tokio::time::timeout(Duration::from_secs(3), async move {
            while manager.status(id).unwrap().cycles < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("cycles never recorded");
    }
}

#[tokio::test]
async fn create_start_stop_lifecycle_releases_margin() {
    let rig = rig(10_000.0);
    rig.prime().await;
    let id = rig.manager.create(trader("alpha", 1_000.0)).unwrap();
    assert_eq!(rig.manager.status(&id).unwrap().state, TraderState::Idle);

    rig.manager.start(&id).await.unwrap();
    assert_eq!(rig.manager.status(&id).unwrap().state, TraderState::Running);
    let alloc = rig.manager.status(&id).unwrap().allocation.unwrap();
    assert!((alloc.budget - 900.0).abs() < 1e-9);

    // first cycle runs right away
    rig.wait_cycles(&id, 1).await;
    assert_eq!(rig.sink.for_trader(&id).len() as u64, rig.manager.status(&id).unwrap().cycles);

    let state = rig.manager.stop(&id).await.unwrap();
    assert_eq!(state, TraderState::Stopped);
    let status = rig.manager.status(&id).unwrap();
    assert_eq!(status.state, TraderState::Stopped);
    assert!(status.allocation.is_none());
    assert!(status.last.is_some());
    assert_eq!(rig.ledger.total_allocated(), 0.0);

    // a stopped trader can start again
    rig.manager.start(&id).await.unwrap();
    assert!(rig.manager.status(&id).unwrap().state.is_active());
    rig.manager.shutdown().await;
}

#[tokio::test]
async fn capacity_breach_leaves_trader_idle() {
    let rig = rig(1_000.0);
    let a = rig.manager.create(trader("a", 600.0)).unwrap();
    let b = rig.manager.create(trader("b", 600.0)).unwrap();
    rig.manager.start(&a).await.unwrap();

    let err = rig.manager.start(&b).await.unwrap_err();
    assert!(matches!(err, ManagerError::Capacity(_)), "{err}");
    assert_eq!(rig.manager.status(&b).unwrap().state, TraderState::Idle);
    assert!(rig.manager.status(&b).unwrap().allocation.is_none());
    assert!(rig.ledger.total_allocated() <= rig.ledger.ceiling() + 1e-9);
    rig.manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_starts_never_overcommit_the_ledger() {
    // ceiling 900, footprint 270 each: only three fit
    let rig = rig(1_000.0);
    let ids: Vec<String> = (0..6)
        .map(|i| rig.manager.create(trader(&format!("t{i}"), 300.0)).unwrap())
        .collect();

    let starts = ids.iter().cloned().map(|id| {
        let manager = rig.manager.clone();
        tokio::spawn(async move { manager.start(&id).await })
    });
    let results = futures_util::future::join_all(starts).await;
    let started = results.iter().filter(|r| matches!(r, Ok(Ok(())))).count();
    let refused = results
        .iter()
        .filter(|r| matches!(r, Ok(Err(ManagerError::Capacity(_)))))
        .count();
    assert_eq!(started, 3);
    assert_eq!(refused, 3);
    assert!(rig.ledger.total_allocated() <= rig.ledger.ceiling() + 1e-9);
    rig.manager.shutdown().await;
}

#[tokio::test]
async fn agent_panic_is_isolated_to_its_trader() {
    let rig = rig(10_000.0);
    rig.prime().await;
    let good = rig.manager.create(trader("good", 1_000.0)).unwrap();
    let bad = rig.manager.create(trader("panic-bot", 1_000.0)).unwrap();
    rig.manager.start(&good).await.unwrap();
    rig.manager.start(&bad).await.unwrap();

    let state = rig.wait_for(&bad, |s| matches!(s, TraderState::Error { .. })).await;
    let TraderState::Error { reason } = state else { unreachable!() };
    assert!(reason.contains("panicked"), "{reason}");
    assert!(rig.ledger.allocation(&bad).is_none());

    assert_eq!(rig.manager.status(&good).unwrap().state, TraderState::Running);
    assert!(rig.ledger.allocation(&good).is_some());
    // stopping a crashed trader is refused, removing it is fine
    assert!(matches!(rig.manager.stop(&bad).await, Err(ManagerError::InvalidState { .. })));
    rig.manager.remove(&bad).unwrap();
    rig.manager.shutdown().await;
}

#[tokio::test]
async fn bad_credentials_end_in_error_state() {
    let rig = rig(10_000.0);
    rig.prime().await;
    let mut cfg = trader("badkey", 1_000.0);
    cfg.trigger = ScheduleTrigger::Interval { secs: 1 };
    let id = rig.manager.create(cfg).unwrap();
    rig.manager.start(&id).await.unwrap();

    let state = rig.wait_for(&id, |s| matches!(s, TraderState::Error { .. })).await;
    let TraderState::Error { reason } = state else { unreachable!() };
    assert!(reason.contains("401"), "{reason}");
    assert_eq!(rig.factory.venue(&id).fill_count(), 0);
    assert!(rig.ledger.allocation(&id).is_none());
    assert_eq!(rig.sink.for_trader(&id).len(), 3);
}

#[tokio::test]
async fn running_trader_cannot_be_reconfigured_or_removed() {
    let rig = rig(10_000.0);
    let id = rig.manager.create(trader("alpha", 1_000.0)).unwrap();
    rig.manager.start(&id).await.unwrap();

    assert!(matches!(
        rig.manager.start(&id).await,
        Err(ManagerError::InvalidState { op: "start", .. })
    ));
    assert!(matches!(
        rig.manager.reconfigure(&id, trader("alpha", 2_000.0)),
        Err(ManagerError::InvalidState { op: "reconfigure", .. })
    ));
    assert!(matches!(rig.manager.remove(&id), Err(ManagerError::InvalidState { op: "remove", .. })));

    rig.manager.stop(&id).await.unwrap();
    rig.manager.reconfigure(&id, trader("alpha", 2_000.0)).unwrap();
    assert_eq!(rig.manager.config(&id).unwrap().initial_balance, 2_000.0);
    rig.manager.remove(&id).unwrap();
    assert!(matches!(rig.manager.status(&id), Err(ManagerError::NotFound(_))));
}

#[tokio::test]
async fn create_validates_and_rejects_duplicates() {
    let rig = rig(10_000.0);
    let mut bad = trader("x", 1_000.0);
    bad.assets.clear();
    assert!(matches!(rig.manager.create(bad), Err(ManagerError::InvalidConfig(_))));

    rig.manager.create(trader("alpha", 1_000.0)).unwrap();
    assert!(matches!(rig.manager.create(trader("alpha", 1_000.0)), Err(ManagerError::Duplicate(_))));

    let mut anon = trader("anon", 1_000.0);
    anon.id = None;
    let id = rig.manager.create(anon).unwrap();
    assert_eq!(id.len(), 36);
    assert_eq!(rig.manager.list().len(), 2);
}

#[tokio::test]
async fn shutdown_stops_everything_and_clears_the_ledger() {
    let rig = rig(10_000.0);
    rig.prime().await;
    let a = rig.manager.create(trader("a", 1_000.0)).unwrap();
    let b = rig.manager.create(trader("b", 1_000.0)).unwrap();
    rig.manager.start(&a).await.unwrap();
    rig.manager.start(&b).await.unwrap();

    rig.manager.shutdown().await;
    for id in [&a, &b] {
        assert_eq!(rig.manager.status(id).unwrap().state, TraderState::Stopped);
    }
    assert_eq!(rig.ledger.total_allocated(), 0.0);
    assert_eq!(rig.feed.active_streams(), 0);
}

#[tokio::test]
async fn circuit_breaker_holds_across_stop_and_start() {
    let rig = rig(10_000.0);
    rig.prime().await;
    let mut cfg = trader("breaker", 1_000.0);
    cfg.trigger = ScheduleTrigger::Snapshot { min_gap_secs: 0 };
    let ai = rig.factory.script(
        "breaker",
        &[
            r#"{"action":"open_long","symbol":"BTC","position_size_usd":300,"leverage":3,"stop_loss":80,"take_profit":150}"#,
            r#"{"action":"close_long","symbol":"BTC"}"#,
            r#"{"action":"hold"}"#,
        ],
    );
    let id = rig.manager.create(cfg).unwrap();
    rig.manager.start(&id).await.unwrap();
    rig.wait_cycles(&id, 1).await;
    let venue = rig.factory.venue(&id);
    assert_eq!(venue.fill_count(), 1);

    // each new quote drives one cycle: close at a loss, then the breaker
    venue.set_mark("BTC", 81.0);
    rig.source.push_price("BTC", 81.0);
    rig.wait_cycles(&id, 2).await;
    assert!((venue.wallet_balance() - 943.0).abs() < 1e-6);
    rig.source.push_price("BTC", 81.5);
    let paused = rig.wait_for(&id, |s| matches!(s, TraderState::Paused { .. })).await;

    assert_eq!(rig.manager.stop(&id).await.unwrap(), TraderState::Stopped);
    rig.manager.start(&id).await.unwrap();
    let again = rig.wait_for(&id, |s| matches!(s, TraderState::Paused { .. })).await;
    assert_eq!(again, paused);

    rig.source.push_price("BTC", 82.0);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(matches!(rig.manager.status(&id).unwrap().state, TraderState::Paused { .. }));
    assert_eq!(venue.fill_count(), 2);
    assert_eq!(ai.calls(), 3);
    rig.manager.shutdown().await;
}
