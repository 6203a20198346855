// ===============================
// src/gateway.rs (paper venue)
// ===============================
//
// In-memory exchange: fills at the request's reference price after a small
// delay, keeps cross-margin positions, realizes PnL on close and triggers
// stop-loss / take-profit on mark updates. Client ids are de-duplicated
// server-side like a real venue. Faults can be queued to simulate timeouts,
// 5xx and business rejections.
//
use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::time::{sleep, Duration};
use tracing::{debug, info};

use crate::domain::{AccountState, ExchangeKind, Position, Side};
use crate::error::ExchangeError;
use crate::exchange::{ExchangeAdapter, IdempotencyKey, OrderAck, OrderKind, OrderRequest, OrderStatus};
use crate::feed::Subscription;

#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    /// Request times out and never reaches the book.
    TimeoutBeforeFill,
    /// Order fills but the response is lost.
    TimeoutAfterFill,
    /// 5xx / connection reset before the order is accepted.
    Transient,
    Reject(String),
    /// Account queries fail with bad credentials.
    Unauthorized,
}

#[derive(Debug, Clone)]
struct PaperPosition {
    size: f64,
    entry: f64,
    leverage: u32,
    stop_loss: Option<f64>,
    take_profit: Option<f64>,
}

#[derive(Debug, Default)]
struct Book {
    wallet: f64,
    positions: HashMap<(String, Side), PaperPosition>,
    marks: HashMap<String, f64>,
    seen: HashMap<String, OrderAck>,
    faults: VecDeque<Fault>,
    account_faults: VecDeque<Fault>,
    fills: u64,
    next_id: u64,
}

impl Book {
    fn mark(&self, asset: &str, fallback: f64) -> f64 {
        self.marks.get(asset).copied().unwrap_or(fallback)
    }

    fn used_margin(&self) -> f64 {
        self.positions
            .iter()
            .map(|((asset, _), p)| p.size * self.mark(asset, p.entry) / p.leverage.max(1) as f64)
            .sum()
    }

    fn unrealized(&self) -> f64 {
        self.positions
            .iter()
            .map(|((asset, side), p)| (self.mark(asset, p.entry) - p.entry) * p.size * side.sign())
            .sum()
    }

    fn equity(&self) -> f64 {
        self.wallet + self.unrealized()
    }

    fn realize(&mut self, asset: &str, side: Side, px: f64) -> Option<f64> {
        let p = self.positions.remove(&(asset.to_string(), side))?;
        let pnl = (px - p.entry) * p.size * side.sign();
        self.wallet += pnl;
        Some(pnl)
    }

    fn fill(&mut self, req: &OrderRequest, key: &IdempotencyKey) -> Result<OrderAck, ExchangeError> {
        let asset = req.asset.to_ascii_uppercase();
        let px = if req.reference_price > 0.0 { req.reference_price } else { self.mark(&asset, 0.0) };
        if !(px > 0.0) {
            return Err(ExchangeError::Rejected(format!("no price for {asset}")));
        }
        self.next_id += 1;
        let order_id = format!("paper-{}", self.next_id);
        let pos_key = (asset.clone(), req.side);

        let (filled_qty, status) = match req.kind {
            OrderKind::Open => {
                if !(req.quantity > 0.0) {
                    return Err(ExchangeError::Rejected("quantity must be positive".into()));
                }
                let margin = req.quantity * px / req.leverage.max(1) as f64;
                let available = self.equity() - self.used_margin();
                if margin > available + 1e-9 {
                    return Err(ExchangeError::Rejected(format!(
                        "margin is insufficient: need {margin:.2}, available {available:.2}"
                    )));
                }
                let p = self.positions.entry(pos_key).or_insert(PaperPosition {
                    size: 0.0,
                    entry: px,
                    leverage: req.leverage.max(1),
                    stop_loss: None,
                    take_profit: None,
                });
                p.entry = (p.entry * p.size + px * req.quantity) / (p.size + req.quantity);
                p.size += req.quantity;
                p.leverage = req.leverage.max(1);
                p.stop_loss = req.stop_loss;
                p.take_profit = req.take_profit;
                self.fills += 1;
                (req.quantity, OrderStatus::Filled)
            }
            OrderKind::Close => {
                let size = self
                    .positions
                    .get(&pos_key)
                    .map(|p| p.size)
                    .ok_or_else(|| ExchangeError::Rejected(format!("reduce-only rejected: no {} {asset} position", req.side)))?;
                let pnl = self.realize(&asset, req.side, px).unwrap_or(0.0);
                debug!(%asset, side = %req.side, pnl, "paper close");
                self.fills += 1;
                (size, OrderStatus::Filled)
            }
            OrderKind::Adjust => {
                let p = self
                    .positions
                    .get_mut(&pos_key)
                    .ok_or_else(|| ExchangeError::Rejected(format!("no {} {asset} position to adjust", req.side)))?;
                if req.stop_loss.is_some() {
                    p.stop_loss = req.stop_loss;
                }
                if req.take_profit.is_some() {
                    p.take_profit = req.take_profit;
                }
                (0.0, OrderStatus::Accepted)
            }
        };
        self.marks.entry(asset).or_insert(px);
        let ack = OrderAck {
            order_id,
            client_id: key.to_string(),
            filled_qty,
            avg_price: if filled_qty > 0.0 { px } else { 0.0 },
            status,
        };
        self.seen.insert(key.to_string(), ack.clone());
        Ok(ack)
    }
}

pub struct PaperExchange {
    book: Mutex<Book>,
    fill_latency: Duration,
}

impl PaperExchange {
    pub fn new(initial_balance: f64) -> Self {
        Self {
            book: Mutex::new(Book { wallet: initial_balance, ..Default::default() }),
            fill_latency: Duration::from_millis(0),
        }
    }

    pub fn with_fill_latency(mut self, latency: Duration) -> Self {
        self.fill_latency = latency;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Book> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues a fault for the next order submission.
    pub fn inject(&self, fault: Fault) {
        self.lock().faults.push_back(fault);
    }

    /// Queues a fault for the next account query.
    pub fn inject_account_fault(&self, fault: Fault) {
        self.lock().account_faults.push_back(fault);
    }

    /// Orders that actually changed a position.
    pub fn fill_count(&self) -> u64 {
        self.lock().fills
    }

    pub fn wallet_balance(&self) -> f64 {
        self.lock().wallet
    }

    /// Updates the mark and fires any protective order it crosses.
    pub fn set_mark(&self, asset: &str, price: f64) {
        let asset = asset.to_ascii_uppercase();
        let mut book = self.lock();
        book.marks.insert(asset.clone(), price);
        let triggered: Vec<(Side, f64, &'static str)> = book
            .positions
            .iter()
            .filter(|((a, _), _)| *a == asset)
            .filter_map(|((_, side), p)| {
                let s = side.sign();
                if let Some(sl) = p.stop_loss {
                    if (price - sl) * s <= 0.0 {
                        return Some((*side, sl, "stop_loss"));
                    }
                }
                if let Some(tp) = p.take_profit {
                    if (price - tp) * s >= 0.0 {
                        return Some((*side, tp, "take_profit"));
                    }
                }
                None
            })
            .collect();
        for (side, px, why) in triggered {
            if let Some(pnl) = book.realize(&asset, side, px) {
                book.fills += 1;
                info!(%asset, %side, px, pnl, trigger = why, "paper protective order filled");
            }
        }
    }

    /// Keeps marks in step with a feed subscription until it ends.
    pub async fn follow(self: Arc<Self>, mut sub: Subscription) {
        while let Some(s) = sub.next().await {
            self.set_mark(&s.asset, s.last_price);
        }
    }
}

#[async_trait]
impl ExchangeAdapter for PaperExchange {
    fn kind(&self) -> ExchangeKind {
        ExchangeKind::Paper
    }

    async fn account_state(&self) -> Result<AccountState, ExchangeError> {
        let book = {
            let mut b = self.lock();
            match b.account_faults.pop_front() {
                Some(Fault::Unauthorized) => return Err(ExchangeError::Fatal("HTTP 401: invalid API key".into())),
                Some(Fault::Transient) | Some(Fault::TimeoutBeforeFill) | Some(Fault::TimeoutAfterFill) => {
                    return Err(ExchangeError::Transient("HTTP 503: service unavailable".into()))
                }
                Some(Fault::Reject(m)) => return Err(ExchangeError::Fatal(m)),
                None => {}
            }
            b
        };
        let positions = book
            .positions
            .iter()
            .map(|((asset, side), p)| {
                let mark = book.mark(asset, p.entry);
                Position {
                    asset: asset.clone(),
                    side: *side,
                    size: p.size,
                    entry_price: p.entry,
                    mark_price: mark,
                    unrealized_pnl: (mark - p.entry) * p.size * side.sign(),
                    leverage: p.leverage,
                    margin: p.size * mark / p.leverage.max(1) as f64,
                    stop_loss: p.stop_loss,
                    take_profit: p.take_profit,
                }
            })
            .collect();
        let equity = book.equity();
        Ok(AccountState {
            exchange: ExchangeKind::Paper,
            equity,
            available_margin: (equity - book.used_margin()).max(0.0),
            positions,
            ts: Utc::now(),
        })
    }

    async fn place_order(&self, req: &OrderRequest, key: &IdempotencyKey) -> Result<OrderAck, ExchangeError> {
        if !self.fill_latency.is_zero() {
            sleep(self.fill_latency).await;
        }
        let mut book = self.lock();
        if let Some(ack) = book.seen.get(key.as_str()) {
            // same client id: the venue returns the original order
            return Ok(ack.clone());
        }
        match book.faults.pop_front() {
            Some(Fault::TimeoutBeforeFill) => Err(ExchangeError::Ambiguous(format!("order {key} timed out"))),
            Some(Fault::TimeoutAfterFill) => {
                book.fill(req, key)?;
                Err(ExchangeError::Ambiguous(format!("order {key} timed out")))
            }
            Some(Fault::Transient) => Err(ExchangeError::Transient("HTTP 503: service unavailable".into())),
            Some(Fault::Reject(m)) => Err(ExchangeError::Rejected(m)),
            Some(Fault::Unauthorized) => Err(ExchangeError::Fatal("HTTP 401: invalid API key".into())),
            None => book.fill(req, key),
        }
    }

    async fn cancel_order(&self, _asset: &str, order_id: &str) -> Result<(), ExchangeError> {
        debug!(%order_id, "paper cancel (no resting orders)");
        Ok(())
    }
}
