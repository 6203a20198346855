// ===============================
// src/agent.rs (trader agent)
// ===============================
//
// One state machine + control loop per (AI model, exchange account):
//
//   Idle -> Running <-> Paused -> Stopped
//              \-> Error (fatal exchange/AI failure)
//
// Per cycle: snapshots -> account (+ reconcile pending order) -> AI ->
// risk -> order -> exactly one DecisionRecord. A stop request is only
// observed between cycles, never mid-order.
//
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval_at, sleep, Duration, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::ai::{DecisionClient, DecisionContext};
use crate::config::{ScheduleTrigger, TraderConfig};
use crate::domain::{
    AccountState, Action, CycleOutcome, Decision, DecisionRecord, MarketSnapshot, RecordSummary,
    RejectReason, RiskVerdict, SkipReason, TraderId, TraderState,
};
use crate::error::{AiError, ExchangeError, FailureClass};
use crate::exchange::{ExchangeAdapter, IdempotencyKey, OrderAck, OrderKind, OrderRequest};
use crate::feed::{MarketFeed, Subscription};
use crate::ledger::MarginLedger;
use crate::metrics::{set_trader_state, CYCLES, TRADER_EQUITY, VERDICTS};
use crate::pnl::PnlTracker;
use crate::recorder::DecisionSink;
use crate::retry::Backoff;
use crate::risk;

/// Consecutive fatal exchange failures before the agent gives up.
pub const FATAL_STREAK_LIMIT: u32 = 3;
/// Resubmissions of one logical order after confirmed non-execution.
pub const MAX_RESUBMITS: u32 = 2;

/// What the manager sees of a running agent.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentReport {
    pub state: TraderState,
    pub cycles: u64,
    pub last: Option<RecordSummary>,
    pub equity: Option<f64>,
    pub pending_order: bool,
}

impl Default for AgentReport {
    fn default() -> Self {
        Self {
            state: TraderState::Idle,
            cycles: 0,
            last: None,
            equity: None,
            pending_order: false,
        }
    }
}

/// Collaborators of one agent. The exchange is expected to be wrapped in
/// `GuardedExchange` already.
pub struct AgentDeps {
    pub exchange: Arc<dyn ExchangeAdapter>,
    pub ai: DecisionClient,
    pub feed: Arc<MarketFeed>,
    pub ledger: Arc<MarginLedger>,
    pub sink: Arc<dyn DecisionSink>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Control {
    Continue,
    /// Circuit breaker tripped.
    Pause(DateTime<Utc>),
    Fatal(String),
}

#[derive(Debug, Clone)]
pub struct Step {
    pub record: DecisionRecord,
    pub control: Control,
}

/// Order whose outcome is unknown; settled against the venue next cycle.
#[derive(Debug, Clone)]
struct PendingOrder {
    key: IdempotencyKey,
    decision: Decision,
    size_before: f64,
    resubmits: u32,
    /// Still committed on the ledger while the outcome is unknown.
    margin: f64,
}

enum Reconcile {
    Landed(String),
    Resubmit(PendingOrder),
    Abandoned(String),
}

enum Exec {
    Filled(OrderAck, Option<f64>),
    Refused(RejectReason),
    VenueRejected(String),
    Unknown { message: String, margin: f64 },
    Fatal(String),
}

pub struct TraderAgent {
    id: TraderId,
    cfg: Arc<TraderConfig>,
    assets: Vec<String>,
    deps: AgentDeps,
    state: TraderState,
    report: watch::Sender<AgentReport>,
    cycle: u64,
    history: VecDeque<DecisionRecord>,
    pnl: PnlTracker,
    pending: Option<PendingOrder>,
    fatal_streak: u32,
    exec_backoff: Backoff,
}

impl TraderAgent {
    pub fn new(id: TraderId, cfg: Arc<TraderConfig>, deps: AgentDeps) -> (Self, watch::Receiver<AgentReport>) {
        let (report, rx) = watch::channel(AgentReport::default());
        let assets = cfg.normalized_assets();
        let agent = Self {
            id,
            cfg,
            assets,
            deps,
            state: TraderState::Idle,
            report,
            cycle: 0,
            history: VecDeque::new(),
            pnl: PnlTracker::new(),
            pending: None,
            fatal_streak: 0,
            exec_backoff: Backoff::exchange(),
        };
        (agent, rx)
    }

    pub fn with_exec_backoff(mut self, backoff: Backoff) -> Self {
        self.exec_backoff = backoff;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> &TraderState {
        &self.state
    }

    pub fn has_pending_order(&self) -> bool {
        self.pending.is_some()
    }

    /// Marks the agent Running before its task is spawned.
    pub fn activate(&mut self) {
        self.set_state(TraderState::Running);
    }

    fn set_state(&mut self, state: TraderState) {
        if self.state != state {
            info!(trader = %self.id, from = self.state.label(), to = state.label(), "trader state");
        }
        set_trader_state(&self.id, state.label());
        self.state = state.clone();
        self.report.send_modify(|r| r.state = state);
    }

    /// Loads recent records so cycle numbers (and order keys) continue
    /// after a restart, together with the day's PnL baseline and breaker.
    pub async fn restore_history(&mut self) {
        let recent = self.deps.sink.recent(&self.id, self.cfg.history_len.max(1)).await;
        if let Some(last) = recent.last() {
            self.cycle = self.cycle.max(last.cycle);
            debug!(trader = %self.id, records = recent.len(), cycle = self.cycle, "history restored");
        }
        if let Some(st) = self.pnl.restore(&recent) {
            info!(
                trader = %self.id,
                day = %st.day,
                day_start_balance = st.day_start_balance,
                breaker_until = ?st.breaker_until,
                "pnl state restored"
            );
        }
        let keep = recent.len().saturating_sub(self.cfg.history_len);
        self.history = recent.into_iter().skip(keep).collect();
    }

    /// Breaker still in force from an earlier run.
    pub fn breaker_until(&self) -> Option<DateTime<Utc>> {
        self.pnl.breaker_until().filter(|until| Utc::now() < *until)
    }

    /// Runs until stopped or a fatal fault. Returns the final state.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) -> TraderState {
        self.restore_history().await;
        match self.breaker_until() {
            Some(until) => {
                warn!(trader = %self.id, %until, "circuit breaker still active from earlier run");
                self.set_state(TraderState::Paused { until });
            }
            None => self.set_state(TraderState::Running),
        }
        let mut trigger = Trigger::new(&self.cfg.trigger, &self.deps.feed, &self.cfg, &self.assets);

        let final_state = loop {
            // sender dropped counts as stop
            if *stop.borrow() || stop.has_changed().is_err() {
                break TraderState::Stopped;
            }
            if let TraderState::Paused { until } = self.state {
                let wait = (until - Utc::now()).to_std().unwrap_or_default();
                tokio::select! {
                    _ = sleep(wait) => {
                        info!(trader = %self.id, "circuit breaker cleared, resuming");
                        self.set_state(TraderState::Running);
                    }
                    _ = stop.changed() => {}
                }
                continue;
            }

            let step = self.step().await;
            match step.control {
                Control::Continue => {}
                Control::Pause(until) => {
                    warn!(trader = %self.id, %until, "circuit breaker tripped, pausing");
                    self.set_state(TraderState::Paused { until });
                    continue;
                }
                Control::Fatal(reason) => {
                    error!(trader = %self.id, %reason, "fatal fault, trader stopped");
                    break TraderState::Error { reason };
                }
            }

            tokio::select! {
                _ = trigger.wait() => {}
                _ = stop.changed() => {}
            }
        };

        self.deps.ledger.release(&self.id);
        self.set_state(final_state.clone());
        final_state
    }

    /// One full cycle. Always yields exactly one record.
    pub async fn step(&mut self) -> Step {
        self.cycle += 1;
        let now = Utc::now();
        let cycle = self.cycle;

        // (a) market snapshots
        let snapshots = match self.snapshots() {
            Ok(s) => s,
            Err(reason) => {
                let rec = DecisionRecord::skipped(&self.id, cycle, now, reason);
                return self.finish(rec, Control::Continue).await;
            }
        };

        // (b) account state
        let fetched = self
            .exec_backoff
            .run("account_state", |_| self.deps.exchange.account_state())
            .await;
        let account = match fetched {
            Ok(a) => {
                self.fatal_streak = 0;
                a
            }
            Err(e) => {
                let control = self.exchange_failure(&e);
                let rec = DecisionRecord::skipped(
                    &self.id,
                    cycle,
                    now,
                    SkipReason::AccountUnavailable { message: e.to_string() },
                );
                return self.finish(rec, control).await;
            }
        };
        self.pnl.observe(now, &account);
        TRADER_EQUITY.with_label_values(&[self.id.as_str()]).set(account.equity);

        // pending order from an earlier cycle; its margin stays on the
        // ledger until the venue shows it or it is resubmitted
        let mut note = None;
        let mut resubmit = None;
        if let Some(pending) = self.pending.take() {
            match self.reconcile(pending, &account) {
                Reconcile::Landed(msg) | Reconcile::Abandoned(msg) => note = Some(msg),
                Reconcile::Resubmit(p) => resubmit = Some(p),
            }
        }
        let in_flight = resubmit.as_ref().map(|p| p.margin).unwrap_or(0.0);
        self.deps.ledger.sync_used(&self.id, account.used_margin() + in_flight);
        if let Some(p) = resubmit {
            return self.resubmit(p, &snapshots, &account, now).await;
        }

        // (c) AI decision
        let ctx = DecisionContext {
            trader_id: self.id.clone(),
            snapshots,
            account,
            history: self.history.iter().cloned().collect(),
            now,
        };
        let decision = match self.deps.ai.decide(&ctx).await {
            Ok(d) => d,
            Err(e) => {
                let (reason, control) = match &e {
                    AiError::Validation(m) => (SkipReason::InvalidDecision { message: m.clone() }, Control::Continue),
                    AiError::Transient(m) => (SkipReason::NoDecision { message: m.clone() }, Control::Continue),
                    AiError::Fatal(m) => (SkipReason::NoDecision { message: m.clone() }, Control::Fatal(e.to_string())),
                };
                let mut rec = DecisionRecord::skipped(&self.id, cycle, now, reason);
                rec.reconciliation = note;
                rec.equity = Some(ctx.account.equity);
                return self.finish(rec, control).await;
            }
        };
        let account = ctx.account;

        // (d) risk
        let ledger_view = self.deps.ledger.view(&self.id);
        let pnl_view = self.pnl.view(now);
        let verdict = risk::validate(&decision, &self.cfg, &ledger_view, &account, &pnl_view);
        VERDICTS.with_label_values(&[verdict.label()]).inc();

        let mut rec = DecisionRecord::new(&self.id, cycle, now, CycleOutcome::NoAction);
        rec.reconciliation = note;
        rec.equity = Some(account.equity);
        if decision.is_opening() {
            rec.proposed_size_usd = Some(decision.size_usd);
        }

        let mut control = Control::Continue;
        let executable = verdict.executable(&decision).cloned();
        match (&verdict, executable) {
            (RiskVerdict::Rejected { reason }, _) => {
                info!(trader = %self.id, cycle, asset = %decision.asset, %reason, "decision rejected");
                if reason.trips_breaker() {
                    control = Control::Pause(self.pnl.trip(now));
                }
                rec.outcome = CycleOutcome::Rejected { reason: reason.clone() };
            }
            (_, Some(d)) if d.action == Action::Hold => {
                debug!(trader = %self.id, cycle, "hold");
            }
            (_, Some(d)) => {
                // (e) execution under a cycle-scoped key
                let key = IdempotencyKey::for_cycle(&self.id, cycle);
                rec.idempotency_key = Some(key.to_string());
                let exec = self.execute(&d, &account, &key, 0.0).await;
                let (outcome, executed, c) = self.settle(exec, &d, &account, key, 0);
                rec.outcome = outcome;
                rec.executed_size_usd = executed;
                control = c;
            }
            (_, None) => {}
        }
        rec.decision = Some(decision);
        rec.verdict = Some(verdict);
        self.finish(rec, control).await
    }

    fn snapshots(&self) -> Result<Vec<MarketSnapshot>, SkipReason> {
        let mut out = Vec::with_capacity(self.assets.len());
        for asset in &self.assets {
            match self.deps.feed.latest(self.cfg.exchange, asset) {
                Ok(s) if s.stale => {
                    warn!(trader = %self.id, %asset, age_ms = s.age(Utc::now()).as_millis() as u64, "stale market data, skipping cycle");
                    return Err(SkipReason::StaleMarketData { asset: asset.clone() });
                }
                Ok(s) => out.push(s),
                Err(e) => {
                    warn!(trader = %self.id, %asset, error = %e, "no market data, skipping cycle");
                    // make sure a stream exists for the next cycle
                    if let Err(e) = self.deps.feed.subscribe(self.cfg.exchange, asset) {
                        debug!(trader = %self.id, %asset, error = %e, "subscribe failed");
                    }
                    return Err(SkipReason::MarketDataUnavailable { asset: asset.clone() });
                }
            }
        }
        Ok(out)
    }

    fn exchange_failure(&mut self, e: &ExchangeError) -> Control {
        if e.class() != FailureClass::Fatal {
            warn!(trader = %self.id, error = %e, "exchange call failed");
            return Control::Continue;
        }
        self.fatal_streak += 1;
        error!(trader = %self.id, error = %e, streak = self.fatal_streak, "fatal exchange error");
        if self.fatal_streak >= FATAL_STREAK_LIMIT {
            Control::Fatal(format!("{} consecutive fatal exchange errors: {e}", self.fatal_streak))
        } else {
            Control::Continue
        }
    }

    fn build_request(&self, d: &Decision, account: &AccountState) -> Option<OrderRequest> {
        let side = d.side?;
        let position = account.position(&d.asset, side);
        let (kind, quantity, size_usd) = match d.action {
            Action::Open if d.reference_price > 0.0 => (OrderKind::Open, d.size_usd / d.reference_price, d.size_usd),
            Action::Close => {
                let p = position?;
                (OrderKind::Close, p.size, p.notional())
            }
            Action::Adjust => (OrderKind::Adjust, position.map(|p| p.size).unwrap_or(0.0), 0.0),
            Action::Open | Action::Hold => return None,
        };
        let reference_price = if d.reference_price > 0.0 {
            d.reference_price
        } else {
            position.map(|p| p.mark_price).unwrap_or(0.0)
        };
        Some(OrderRequest {
            asset: d.asset.clone(),
            side,
            kind,
            size_usd,
            quantity,
            leverage: match kind {
                OrderKind::Open => d.leverage,
                _ => position.map(|p| p.leverage).unwrap_or(1),
            },
            stop_loss: d.stop_loss,
            take_profit: d.take_profit,
            reference_price,
        })
    }

    /// Commits margin, then places the order with a few quick retries.
    /// `reserved` is margin already held for this order by an earlier,
    /// unsettled submission.
    async fn execute(&mut self, d: &Decision, account: &AccountState, key: &IdempotencyKey, reserved: f64) -> Exec {
        let Some(req) = self.build_request(d, account) else {
            self.deps.ledger.uncommit(&self.id, reserved);
            return Exec::Refused(RejectReason::Malformed {
                detail: format!("cannot build {} order for {}", d.action.as_str(), d.asset),
            });
        };
        let margin = if req.kind == OrderKind::Open { d.margin_required() } else { 0.0 };
        let delta = margin - reserved;
        if delta > 0.0 {
            let cap = self.cfg.limits.margin_usage() * account.equity;
            if let Err(e) = self.deps.ledger.commit(&self.id, delta, cap) {
                self.deps.ledger.uncommit(&self.id, reserved);
                return Exec::Refused(RejectReason::LedgerRefused { detail: e.to_string() });
            }
        } else if delta < 0.0 {
            self.deps.ledger.uncommit(&self.id, -delta);
        }

        let exchange = self.deps.exchange.clone();
        let result = self
            .exec_backoff
            .run("place_order", |_| exchange.place_order(&req, key))
            .await;
        match result {
            Ok(ack) => {
                self.fatal_streak = 0;
                let executed = match req.kind {
                    OrderKind::Open => Some(req.size_usd),
                    OrderKind::Close => Some(req.size_usd),
                    OrderKind::Adjust => None,
                };
                Exec::Filled(ack, executed)
            }
            Err(e) => match e.class() {
                FailureClass::RejectedByVenue => {
                    self.deps.ledger.uncommit(&self.id, margin);
                    Exec::VenueRejected(e.to_string())
                }
                // timed out / ambiguous / retries spent: settle next cycle
                FailureClass::PartialFailure | FailureClass::Transient => Exec::Unknown { message: e.to_string(), margin },
                FailureClass::Fatal | FailureClass::Validation => {
                    self.deps.ledger.uncommit(&self.id, margin);
                    Exec::Fatal(e.to_string())
                }
            },
        }
    }

    /// Maps an execution result onto the cycle outcome, remembering the
    /// order when its outcome is unknown.
    fn settle(
        &mut self,
        exec: Exec,
        d: &Decision,
        account: &AccountState,
        key: IdempotencyKey,
        resubmits: u32,
    ) -> (CycleOutcome, Option<f64>, Control) {
        let side = d.side;
        match exec {
            Exec::Filled(ack, executed) => {
                info!(trader = %self.id, %key, order_id = %ack.order_id, asset = %d.asset, action = d.action.as_str(), qty = ack.filled_qty, px = ack.avg_price, "order executed");
                let outcome = if resubmits > 0 {
                    CycleOutcome::Resubmitted { attempt: resubmits, order_id: ack.order_id }
                } else {
                    CycleOutcome::Executed {
                        order_id: ack.order_id,
                        filled_qty: ack.filled_qty,
                        avg_price: ack.avg_price,
                    }
                };
                (outcome, executed, Control::Continue)
            }
            Exec::Refused(reason) => {
                info!(trader = %self.id, %key, %reason, "order refused before submission");
                (CycleOutcome::Rejected { reason }, None, Control::Continue)
            }
            Exec::VenueRejected(message) => {
                info!(trader = %self.id, %key, %message, "order rejected by venue");
                (CycleOutcome::VenueRejected { message }, None, Control::Continue)
            }
            Exec::Unknown { message, margin } => {
                warn!(trader = %self.id, %key, %message, margin, "order outcome unknown, reconciling next cycle");
                let size_before = side.map(|s| account.position_size(&d.asset, s)).unwrap_or(0.0);
                self.pending = Some(PendingOrder { key, decision: d.clone(), size_before, resubmits, margin });
                (CycleOutcome::PartialFailure { message }, None, Control::Continue)
            }
            Exec::Fatal(message) => {
                self.fatal_streak += 1;
                error!(trader = %self.id, %key, %message, streak = self.fatal_streak, "order failed fatally");
                let control = if self.fatal_streak >= FATAL_STREAK_LIMIT {
                    Control::Fatal(format!("{} consecutive fatal exchange errors: {message}", self.fatal_streak))
                } else {
                    Control::Continue
                };
                (CycleOutcome::OrderFailed { message }, None, control)
            }
        }
    }

    /// Compares the venue against what the pending order should have done.
    fn reconcile(&self, p: PendingOrder, account: &AccountState) -> Reconcile {
        let Some(side) = p.decision.side else {
            return Reconcile::Abandoned(format!("{}: pending order without side dropped", p.key));
        };
        let pos = account.position(&p.decision.asset, side);
        let size_now = pos.map(|x| x.size).unwrap_or(0.0);
        let landed = match p.decision.action {
            Action::Open => (size_now - p.size_before).abs() > 1e-12,
            Action::Close => size_now + 1e-12 < p.size_before,
            Action::Adjust => match pos {
                None => true,
                Some(x) => {
                    let same = |want: Option<f64>, have: Option<f64>| match (want, have) {
                        (None, _) => true,
                        (Some(w), Some(h)) => (w - h).abs() <= w.abs() * 1e-9,
                        (Some(_), None) => false,
                    };
                    same(p.decision.stop_loss, x.stop_loss) && same(p.decision.take_profit, x.take_profit)
                }
            },
            Action::Hold => true,
        };
        if landed {
            let msg = format!(
                "{}: venue shows {} {} {} -> {}, reconciled without resubmission",
                p.key, p.decision.asset, side, p.size_before, size_now
            );
            info!(trader = %self.id, %msg, "pending order reconciled");
            return Reconcile::Landed(msg);
        }
        if p.resubmits >= MAX_RESUBMITS {
            let msg = format!("{}: not on venue after {} resubmissions, abandoned", p.key, p.resubmits);
            warn!(trader = %self.id, %msg, "pending order abandoned");
            return Reconcile::Abandoned(msg);
        }
        Reconcile::Resubmit(p)
    }

    /// Re-validates and resubmits an order the venue never executed. The AI
    /// is not consulted in this cycle.
    async fn resubmit(
        &mut self,
        p: PendingOrder,
        snapshots: &[MarketSnapshot],
        account: &AccountState,
        now: DateTime<Utc>,
    ) -> Step {
        let attempt = p.resubmits + 1;
        let key = p.key.resubmission(attempt);
        let mut decision = p.decision.clone();
        if let Some(s) = snapshots.iter().find(|s| s.asset.eq_ignore_ascii_case(&decision.asset)) {
            decision.reference_price = s.mid();
        }

        let mut rec = DecisionRecord::new(&self.id, self.cycle, now, CycleOutcome::NoAction);
        rec.equity = Some(account.equity);
        rec.idempotency_key = Some(key.to_string());
        rec.reconciliation = Some(format!("{} not executed on venue, resubmitting as {key}", p.key));
        if decision.is_opening() {
            rec.proposed_size_usd = Some(decision.size_usd);
        }

        // the reservation of the unsettled attempt is handed over, not added
        let mut ledger_view = self.deps.ledger.view(&self.id);
        if let Some(a) = ledger_view.trader.as_mut() {
            a.used = (a.used - p.margin).max(0.0);
        }
        let verdict = risk::validate(&decision, &self.cfg, &ledger_view, account, &self.pnl.view(now));
        VERDICTS.with_label_values(&[verdict.label()]).inc();
        let mut control = Control::Continue;
        match verdict.executable(&decision).cloned() {
            None => {
                self.deps.ledger.uncommit(&self.id, p.margin);
                if let RiskVerdict::Rejected { reason } = &verdict {
                    warn!(trader = %self.id, %key, %reason, "resubmission no longer passes risk, abandoned");
                    if reason.trips_breaker() {
                        control = Control::Pause(self.pnl.trip(now));
                    }
                    rec.outcome = CycleOutcome::Rejected { reason: reason.clone() };
                }
            }
            Some(d) => {
                info!(trader = %self.id, %key, attempt, "resubmitting order");
                let exec = self.execute(&d, account, &key, p.margin).await;
                let (outcome, executed, c) = self.settle(exec, &d, account, key.clone(), attempt);
                rec.outcome = outcome;
                rec.executed_size_usd = executed;
                control = c;
            }
        }
        rec.decision = Some(decision);
        rec.verdict = Some(verdict);
        self.finish(rec, control).await
    }

    async fn finish(&mut self, mut record: DecisionRecord, control: Control) -> Step {
        record.pnl = self.pnl.state();
        CYCLES
            .with_label_values(&[self.id.as_str(), record.outcome.label()])
            .inc();
        debug!(trader = %self.id, cycle = record.cycle, outcome = record.outcome.label(), "cycle recorded");
        self.deps.sink.save(record.clone()).await;

        self.history.push_back(record.clone());
        while self.history.len() > self.cfg.history_len {
            self.history.pop_front();
        }
        let summary = record.summary();
        let pending = self.pending.is_some();
        let cycles = self.cycle;
        self.report.send_modify(|r| {
            r.cycles = cycles;
            r.last = Some(summary);
            r.pending_order = pending;
            if let Some(eq) = record.equity {
                r.equity = Some(eq);
            }
        });
        Step { record, control }
    }
}

/// Waits for the next cycle according to the trader's schedule.
enum Trigger {
    Interval(Interval),
    Snapshot {
        sub: Option<Subscription>,
        min_gap: Duration,
        last: Instant,
    },
}

impl Trigger {
    fn new(cfg: &ScheduleTrigger, feed: &MarketFeed, trader: &TraderConfig, assets: &[String]) -> Self {
        match cfg {
            ScheduleTrigger::Interval { secs } => {
                let period = Duration::from_secs((*secs).max(1));
                let mut iv = interval_at(Instant::now() + period, period);
                iv.set_missed_tick_behavior(MissedTickBehavior::Delay);
                Trigger::Interval(iv)
            }
            ScheduleTrigger::Snapshot { min_gap_secs } => {
                let sub = assets.first().and_then(|a| match feed.subscribe(trader.exchange, a) {
                    Ok(s) => Some(s),
                    Err(e) => {
                        warn!(trader = %trader.name, asset = %a, error = %e, "snapshot trigger unavailable, falling back to min gap");
                        None
                    }
                });
                Trigger::Snapshot {
                    sub,
                    min_gap: Duration::from_secs(*min_gap_secs),
                    last: Instant::now(),
                }
            }
        }
    }

    async fn wait(&mut self) {
        match self {
            Trigger::Interval(iv) => {
                iv.tick().await;
            }
            Trigger::Snapshot { sub, min_gap, last } => {
                loop {
                    match sub.as_mut() {
                        Some(s) => {
                            if s.next().await.is_none() {
                                *sub = None;
                            }
                        }
                        None => sleep((*min_gap).max(Duration::from_secs(1))).await,
                    }
                    if last.elapsed() >= *min_gap {
                        break;
                    }
                }
                *last = Instant::now();
            }
        }
    }
}
