// ===============================
// src/manager.rs (trader manager)
// ===============================
//
// Supervises the set of traders:
// - create / start / stop / status / remove (+ list, reconfigure, shutdown)
// - admission control: start reserves the trader's margin footprint on the
//   shared ledger first; a breach leaves the trader Idle
// - crash isolation: each agent runs in its own supervised task; a panic
//   becomes Error for that trader only. No auto-restart.
//
use ahash::AHashMap as HashMap;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::agent::{AgentDeps, AgentReport, TraderAgent};
use crate::ai::{build_backend, AiLimiters, DecisionClient};
use crate::ai_backends::{AiBackend, MockBackend};
use crate::config::{MarketMode, TraderConfig};
use crate::domain::{ExchangeKind, RecordSummary, TraderId, TraderState};
use crate::error::{LedgerError, ManagerError};
use crate::exchange::{ExchangeAdapter, GuardedExchange};
use crate::feed::MarketFeed;
use crate::gateway::PaperExchange;
use crate::gateway_binance::FuturesGateway;
use crate::gateway_hyperliquid::HyperliquidGateway;
use crate::ledger::{Allocation, MarginLedger};
use crate::metrics::set_trader_state;
use crate::recorder::DecisionSink;
use crate::retry::Backoff;

/// Venue adapter plus any helper tasks that live as long as the trader runs.
pub struct VenueHandle {
    pub adapter: Arc<dyn ExchangeAdapter>,
    pub background: Vec<JoinHandle<()>>,
}

impl VenueHandle {
    pub fn new(adapter: Arc<dyn ExchangeAdapter>) -> Self {
        Self { adapter, background: Vec::new() }
    }
}

/// Builds the per-trader collaborators from its config.
pub trait AdapterFactory: Send + Sync {
    /// Called inside the runtime; may spawn background tasks.
    fn exchange(&self, trader_id: &str, cfg: &TraderConfig) -> Result<VenueHandle, ManagerError>;

    fn ai_backend(&self, cfg: &TraderConfig) -> Result<Arc<dyn AiBackend>, ManagerError>;
}

/// Real venues in testnet/mainnet mode; paper venue and mock AI (unless a
/// key is configured) in mock mode.
pub struct LiveFactory {
    mode: MarketMode,
    feed: Arc<MarketFeed>,
    exchange_timeout: Duration,
    ai_timeout: Duration,
}

impl LiveFactory {
    pub fn new(mode: MarketMode, feed: Arc<MarketFeed>, exchange_timeout: Duration, ai_timeout: Duration) -> Self {
        Self { mode, feed, exchange_timeout, ai_timeout }
    }

    fn paper(&self, cfg: &TraderConfig) -> VenueHandle {
        let paper = Arc::new(PaperExchange::new(cfg.initial_balance));
        let mut background = Vec::new();
        for asset in cfg.normalized_assets() {
            match self.feed.subscribe(cfg.exchange, &asset) {
                Ok(sub) => background.push(tokio::spawn(paper.clone().follow(sub))),
                Err(e) => warn!(trader = %cfg.name, %asset, error = %e, "paper venue has no mark feed"),
            }
        }
        VenueHandle { adapter: paper, background }
    }
}

impl AdapterFactory for LiveFactory {
    fn exchange(&self, trader_id: &str, cfg: &TraderConfig) -> Result<VenueHandle, ManagerError> {
        if self.mode == MarketMode::Mock || cfg.exchange == ExchangeKind::Paper {
            info!(trader = %trader_id, exchange = %cfg.exchange, "using paper venue");
            return Ok(self.paper(cfg));
        }
        let rest = cfg
            .credentials
            .rest_url
            .as_deref()
            .unwrap_or_else(|| self.mode.default_rest_url(cfg.exchange));
        let build = |e: crate::error::ExchangeError| ManagerError::Build(e.to_string());
        let adapter: Arc<dyn ExchangeAdapter> = match cfg.exchange {
            ExchangeKind::Binance => Arc::new(FuturesGateway::binance(&cfg.credentials, rest, self.exchange_timeout).map_err(build)?),
            ExchangeKind::Aster => Arc::new(FuturesGateway::aster(&cfg.credentials, rest, self.exchange_timeout).map_err(build)?),
            ExchangeKind::Hyperliquid => Arc::new(
                HyperliquidGateway::new(&cfg.credentials, rest, self.mode.is_mainnet(), self.exchange_timeout)
                    .map_err(build)?,
            ),
            ExchangeKind::Paper => return Ok(self.paper(cfg)),
        };
        Ok(VenueHandle::new(adapter))
    }

    fn ai_backend(&self, cfg: &TraderConfig) -> Result<Arc<dyn AiBackend>, ManagerError> {
        if self.mode == MarketMode::Mock && cfg.ai.api_key.is_empty() {
            return Ok(Arc::new(MockBackend::default()));
        }
        build_backend(&cfg.ai, self.ai_timeout).map_err(|e| ManagerError::Build(e.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub ai_timeout: Duration,
    pub ai_backoff: Backoff,
    pub exchange_timeout: Duration,
    pub exec_backoff: Backoff,
    pub stop_timeout: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            ai_timeout: Duration::from_secs(90),
            ai_backoff: Backoff::ai(3),
            exchange_timeout: Duration::from_secs(10),
            exec_backoff: Backoff::exchange(),
            stop_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TraderStatus {
    pub id: TraderId,
    pub name: String,
    pub exchange: ExchangeKind,
    pub state: TraderState,
    pub cycles: u64,
    pub last: Option<RecordSummary>,
    pub equity: Option<f64>,
    pub allocation: Option<Allocation>,
}

struct RunHandle {
    stop: watch::Sender<bool>,
    exit: watch::Receiver<Option<TraderState>>,
    report: watch::Receiver<AgentReport>,
    task: JoinHandle<()>,
}

impl RunHandle {
    fn state(&self) -> TraderState {
        match self.exit.borrow().clone() {
            Some(s) => s,
            None => self.report.borrow().state.clone(),
        }
    }

    fn finished(&self) -> bool {
        self.exit.borrow().is_some()
    }
}

struct Slot {
    cfg: Arc<TraderConfig>,
    run: Option<RunHandle>,
    /// Report of the last run, kept for status after it ended.
    last_report: AgentReport,
}

impl Slot {
    fn state(&self) -> TraderState {
        match &self.run {
            Some(r) => r.state(),
            None => self.last_report.state.clone(),
        }
    }

    fn report(&self) -> AgentReport {
        match &self.run {
            Some(r) => {
                let mut rep = r.report.borrow().clone();
                rep.state = r.state();
                rep
            }
            None => self.last_report.clone(),
        }
    }
}

pub struct TraderManager {
    ledger: Arc<MarginLedger>,
    feed: Arc<MarketFeed>,
    sink: Arc<dyn DecisionSink>,
    factory: Arc<dyn AdapterFactory>,
    limiters: Arc<AiLimiters>,
    settings: ManagerSettings,
    slots: Mutex<HashMap<TraderId, Slot>>,
}

impl TraderManager {
    pub fn new(
        ledger: Arc<MarginLedger>,
        feed: Arc<MarketFeed>,
        sink: Arc<dyn DecisionSink>,
        factory: Arc<dyn AdapterFactory>,
        limiters: Arc<AiLimiters>,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            ledger,
            feed,
            sink,
            factory,
            limiters,
            settings,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TraderId, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ledger(&self) -> &Arc<MarginLedger> {
        &self.ledger
    }

    /// Registers a trader in Idle. Uses the config's id or a fresh UUID.
    pub fn create(&self, mut cfg: TraderConfig) -> Result<TraderId, ManagerError> {
        cfg.validate().map_err(ManagerError::InvalidConfig)?;
        let id = cfg
            .id
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        cfg.id = Some(id.clone());
        let mut slots = self.lock();
        if slots.contains_key(&id) {
            return Err(ManagerError::Duplicate(id));
        }
        info!(trader = %id, name = %cfg.name, exchange = %cfg.exchange, provider = cfg.ai.provider.as_str(), "trader created");
        set_trader_state(&id, TraderState::Idle.label());
        slots.insert(
            id.clone(),
            Slot { cfg: Arc::new(cfg), run: None, last_report: AgentReport::default() },
        );
        Ok(id)
    }

    /// Admission control, then Running. A capacity breach leaves the trader as it was.
    pub async fn start(&self, id: &str) -> Result<(), ManagerError> {
        let cfg = {
            let slots = self.lock();
            let slot = slots.get(id).ok_or_else(|| ManagerError::NotFound(id.to_string()))?;
            let state = slot.state();
            if state.is_active() || slot.run.as_ref().is_some_and(|r| !r.finished()) {
                return Err(ManagerError::InvalidState { id: id.to_string(), op: "start", state: state.label() });
            }
            slot.cfg.clone()
        };

        let footprint = cfg.margin_footprint();
        match self.ledger.admit(id, footprint) {
            Ok(()) => {}
            Err(LedgerError::AlreadyAdmitted(_)) => {
                return Err(ManagerError::InvalidState { id: id.to_string(), op: "start", state: "starting" })
            }
            Err(e) => {
                warn!(trader = %id, footprint, headroom = self.ledger.headroom(), "admission refused");
                return Err(ManagerError::Capacity(e));
            }
        }
        info!(trader = %id, footprint, allocated = self.ledger.total_allocated(), ceiling = self.ledger.ceiling(), "admitted");

        let built = self.build(id, &cfg);
        let (mut agent, report, background) = match built {
            Ok(x) => x,
            Err(e) => {
                self.ledger.release(id);
                error!(trader = %id, error = %e, "trader build failed");
                return Err(e);
            }
        };
        agent.activate();

        let (stop_tx, stop_rx) = watch::channel(false);
        let (exit_tx, exit_rx) = watch::channel(None);
        let task = tokio::spawn(supervise(id.to_string(), agent, stop_rx, exit_tx, self.ledger.clone(), background));

        let mut slots = self.lock();
        match slots.get_mut(id) {
            Some(slot) => {
                slot.run = Some(RunHandle { stop: stop_tx, exit: exit_rx, report, task });
                Ok(())
            }
            None => {
                // removed while starting
                let _ = stop_tx.send(true);
                Err(ManagerError::NotFound(id.to_string()))
            }
        }
    }

    fn build(
        &self,
        id: &str,
        cfg: &Arc<TraderConfig>,
    ) -> Result<(TraderAgent, watch::Receiver<AgentReport>, Vec<JoinHandle<()>>), ManagerError> {
        let venue = self.factory.exchange(id, cfg)?;
        let backend = match self.factory.ai_backend(cfg) {
            Ok(b) => b,
            Err(e) => {
                venue.background.iter().for_each(JoinHandle::abort);
                return Err(e);
            }
        };
        let exchange: Arc<dyn ExchangeAdapter> =
            Arc::new(GuardedExchange::new(venue.adapter, self.settings.exchange_timeout));
        let ai = DecisionClient::new(backend, &self.limiters, cfg, self.settings.ai_timeout, self.settings.ai_backoff.max_retries)
            .with_backoff(self.settings.ai_backoff.clone());
        let deps = AgentDeps {
            exchange,
            ai,
            feed: self.feed.clone(),
            ledger: self.ledger.clone(),
            sink: self.sink.clone(),
        };
        let (agent, report) = TraderAgent::new(id.to_string(), cfg.clone(), deps);
        Ok((agent.with_exec_backoff(self.settings.exec_backoff.clone()), report, venue.background))
    }

    /// Cooperative stop: observed between cycles. Waits up to the stop
    /// timeout and never aborts an order in flight.
    pub async fn stop(&self, id: &str) -> Result<TraderState, ManagerError> {
        let mut exit = {
            let slots = self.lock();
            let slot = slots.get(id).ok_or_else(|| ManagerError::NotFound(id.to_string()))?;
            let run = match &slot.run {
                Some(r) if !r.finished() => r,
                _ => {
                    return Err(ManagerError::InvalidState { id: id.to_string(), op: "stop", state: slot.state().label() })
                }
            };
            let _ = run.stop.send(true);
            run.exit.clone()
        };
        info!(trader = %id, "stop requested");

        let waited = tokio::time::timeout(self.settings.stop_timeout, async {
            loop {
                if let Some(s) = exit.borrow_and_update().clone() {
                    return s;
                }
                if exit.changed().await.is_err() {
                    return TraderState::Stopped;
                }
            }
        })
        .await;
        match waited {
            Ok(state) => {
                self.settle(id);
                Ok(state)
            }
            Err(_) => {
                warn!(trader = %id, timeout = ?self.settings.stop_timeout, "trader still finishing its cycle");
                self.status(id).map(|s| s.state)
            }
        }
    }

    /// Moves a finished run's report into the slot.
    fn settle(&self, id: &str) {
        let mut slots = self.lock();
        if let Some(slot) = slots.get_mut(id) {
            if slot.run.as_ref().is_some_and(RunHandle::finished) {
                slot.last_report = slot.report();
                slot.run = None;
            }
        }
    }

    pub fn status(&self, id: &str) -> Result<TraderStatus, ManagerError> {
        let slots = self.lock();
        let slot = slots.get(id).ok_or_else(|| ManagerError::NotFound(id.to_string()))?;
        Ok(self.status_of(id, slot))
    }

    fn status_of(&self, id: &str, slot: &Slot) -> TraderStatus {
        let report = slot.report();
        TraderStatus {
            id: id.to_string(),
            name: slot.cfg.name.clone(),
            exchange: slot.cfg.exchange,
            state: report.state,
            cycles: report.cycles,
            last: report.last,
            equity: report.equity,
            allocation: self.ledger.allocation(id),
        }
    }

    pub fn list(&self) -> Vec<TraderStatus> {
        let slots = self.lock();
        let mut out: Vec<TraderStatus> = slots.iter().map(|(id, s)| self.status_of(id, s)).collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn config(&self, id: &str) -> Result<Arc<TraderConfig>, ManagerError> {
        self.lock()
            .get(id)
            .map(|s| s.cfg.clone())
            .ok_or_else(|| ManagerError::NotFound(id.to_string()))
    }

    /// Replaces the config of a trader that is not running. Takes effect on next start.
    pub fn reconfigure(&self, id: &str, mut cfg: TraderConfig) -> Result<(), ManagerError> {
        cfg.validate().map_err(ManagerError::InvalidConfig)?;
        cfg.id = Some(id.to_string());
        let mut slots = self.lock();
        let slot = slots.get_mut(id).ok_or_else(|| ManagerError::NotFound(id.to_string()))?;
        let state = slot.state();
        if state.is_active() {
            return Err(ManagerError::InvalidState { id: id.to_string(), op: "reconfigure", state: state.label() });
        }
        slot.cfg = Arc::new(cfg);
        info!(trader = %id, "trader reconfigured");
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Result<Arc<TraderConfig>, ManagerError> {
        let mut slots = self.lock();
        let slot = slots.get(id).ok_or_else(|| ManagerError::NotFound(id.to_string()))?;
        let state = slot.state();
        if state.is_active() || slot.run.as_ref().is_some_and(|r| !r.finished()) {
            return Err(ManagerError::InvalidState { id: id.to_string(), op: "remove", state: state.label() });
        }
        let slot = slots.remove(id).ok_or_else(|| ManagerError::NotFound(id.to_string()))?;
        crate::metrics::TRADER_STATE
            .with_label_values(&[id, state.label()])
            .set(0);
        info!(trader = %id, "trader removed");
        Ok(slot.cfg)
    }

    /// Stops every trader, closes the feed and tears down the ledger.
    pub async fn shutdown(&self) {
        let ids: Vec<TraderId> = {
            let slots = self.lock();
            slots
                .iter()
                .filter(|(_, s)| s.run.as_ref().is_some_and(|r| !r.finished()))
                .map(|(id, _)| id.clone())
                .collect()
        };
        info!(traders = ids.len(), "manager shutting down");
        let stops = ids.iter().map(|id| self.stop(id));
        for (id, res) in ids.iter().zip(futures_util::future::join_all(stops).await) {
            match res {
                Ok(state) if state.is_terminal() => {}
                Ok(state) => warn!(trader = %id, state = state.label(), "trader did not stop in time, aborting"),
                Err(e) => warn!(trader = %id, error = %e, "stop failed during shutdown"),
            }
        }
        {
            let mut slots = self.lock();
            for (id, slot) in slots.iter_mut() {
                if let Some(run) = slot.run.take() {
                    let state = if run.finished() {
                        run.state()
                    } else {
                        run.task.abort();
                        self.ledger.release(id);
                        set_trader_state(id, TraderState::Stopped.label());
                        TraderState::Stopped
                    };
                    slot.last_report = AgentReport { state, ..run.report.borrow().clone() };
                }
            }
        }
        self.feed.shutdown();
        self.ledger.clear();
        self.sink.flush().await;
        info!("manager stopped");
    }
}

/// Runs one agent; a panic turns into Error for this trader only. The
/// ledger budget is released however the agent ends.
async fn supervise(
    id: TraderId,
    agent: TraderAgent,
    stop: watch::Receiver<bool>,
    exit: watch::Sender<Option<TraderState>>,
    ledger: Arc<MarginLedger>,
    background: Vec<JoinHandle<()>>,
) {
    let state = match AssertUnwindSafe(agent.run(stop)).catch_unwind().await {
        Ok(s) => s,
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".into());
            error!(trader = %id, %msg, "agent panicked");
            TraderState::Error { reason: format!("agent panicked: {msg}") }
        }
    };
    for h in &background {
        h.abort();
    }
    ledger.release(&id);
    set_trader_state(&id, state.label());
    info!(trader = %id, state = state.label(), "agent exited");
    let _ = exit.send(Some(state));
}
