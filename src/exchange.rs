// ===============================
// src/exchange.rs
// ===============================
//
// Exchange Adapter capability set + the local idempotency guard.
//
// Venue implementations:
// - gateway_binance     : Binance / Aster USDT-M futures (REST, HMAC)
// - gateway_hyperliquid : Hyperliquid (info + signed exchange actions)
// - gateway             : in-memory paper venue
//
use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::domain::{AccountState, ExchangeKind, Position, Side};
use crate::error::ExchangeError;
use crate::metrics::ORDERS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    /// Market entry, then stop-loss / take-profit protective orders.
    Open,
    /// Reduce-only market exit of the whole position.
    Close,
    /// Replace the protective orders of an open position.
    Adjust,
}

impl OrderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderKind::Open => "open",
            OrderKind::Close => "close",
            OrderKind::Adjust => "adjust",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub asset: String,
    /// Side of the position being opened, closed or adjusted.
    pub side: Side,
    pub kind: OrderKind,
    pub size_usd: f64,
    /// Base-asset quantity before venue rounding.
    pub quantity: f64,
    pub leverage: u32,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub reference_price: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Filled,
    PartiallyFilled,
    /// Accepted but not (yet) filled; protective-order updates end here.
    Accepted,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Filled => "filled",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Accepted => "accepted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub client_id: String,
    pub filled_qty: f64,
    pub avg_price: f64,
    pub status: OrderStatus,
}

/// Cycle-scoped order key: `t<8 hex of trader hash>-c<cycle>[-r<n>]`.
/// Short enough for Binance `newClientOrderId` (36 chars max).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn for_cycle(trader_id: &str, cycle: u64) -> Self {
        let digest = Sha256::digest(trader_id.as_bytes());
        IdempotencyKey(format!("t{}-c{}", hex::encode(&digest[..4]), cycle))
    }

    /// Key for the n-th resubmission of the same logical order.
    pub fn resubmission(&self, attempt: u32) -> Self {
        let base = self.0.split("-r").next().unwrap_or(&self.0);
        IdempotencyKey(format!("{base}-r{attempt}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn kind(&self) -> ExchangeKind;

    async fn account_state(&self) -> Result<AccountState, ExchangeError>;

    async fn positions(&self) -> Result<Vec<Position>, ExchangeError> {
        Ok(self.account_state().await?.positions)
    }

    /// Must not produce two fills for the same key.
    async fn place_order(&self, req: &OrderRequest, key: &IdempotencyKey) -> Result<OrderAck, ExchangeError>;

    async fn cancel_order(&self, asset: &str, order_id: &str) -> Result<(), ExchangeError>;

    async fn available_margin(&self) -> Result<f64, ExchangeError> {
        Ok(self.account_state().await?.available_margin)
    }
}

// ---------------- Local idempotency cache ----------------

#[derive(Debug, Clone)]
enum KeyState {
    InFlight,
    Done(OrderAck),
    Ambiguous,
}

/// Short-lived memory of submitted keys. A key is blocked while in flight
/// or after an ambiguous outcome; a completed key replays its ack.
pub struct IdempotencyCache {
    ttl: Duration,
    keys: Mutex<HashMap<String, (KeyState, Instant)>>,
}

impl IdempotencyCache {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, keys: Mutex::new(HashMap::new()) }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, (KeyState, Instant)>> {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `Ok(Some(ack))` for an already completed key, `Ok(None)` when the
    /// caller may submit (the key is now in flight).
    pub fn begin(&self, key: &IdempotencyKey) -> Result<Option<OrderAck>, ExchangeError> {
        let now = Instant::now();
        let mut keys = self.lock();
        let ttl = self.ttl;
        keys.retain(|_, (_, at)| now.duration_since(*at) < ttl);
        match keys.get(key.as_str()) {
            Some((KeyState::Done(ack), _)) => Ok(Some(ack.clone())),
            Some((KeyState::InFlight, _)) | Some((KeyState::Ambiguous, _)) => {
                Err(ExchangeError::Duplicate(key.to_string()))
            }
            None => {
                keys.insert(key.to_string(), (KeyState::InFlight, now));
                Ok(None)
            }
        }
    }

    /// Records the outcome. Definite failures free the key so a retry can
    /// use it again; ambiguous outcomes keep it blocked.
    pub fn finish(&self, key: &IdempotencyKey, result: &Result<OrderAck, ExchangeError>) {
        let mut keys = self.lock();
        match result {
            Ok(ack) => {
                keys.insert(key.to_string(), (KeyState::Done(ack.clone()), Instant::now()));
            }
            Err(ExchangeError::Ambiguous(_)) => {
                keys.insert(key.to_string(), (KeyState::Ambiguous, Instant::now()));
            }
            Err(ExchangeError::Duplicate(_)) => {}
            Err(_) => {
                keys.remove(key.as_str());
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Wraps a venue adapter with call timeouts, the local idempotency cache and
/// order metrics. Every adapter handed to an agent goes through this.
pub struct GuardedExchange {
    inner: Arc<dyn ExchangeAdapter>,
    cache: IdempotencyCache,
    call_timeout: Duration,
}

impl GuardedExchange {
    pub fn new(inner: Arc<dyn ExchangeAdapter>, call_timeout: Duration) -> Self {
        Self {
            inner,
            cache: IdempotencyCache::new(Duration::from_secs(15 * 60)),
            call_timeout,
        }
    }

    async fn read<T, F>(&self, what: &str, fut: F) -> Result<T, ExchangeError>
    where
        F: std::future::Future<Output = Result<T, ExchangeError>>,
    {
        match timeout(self.call_timeout, fut).await {
            Ok(r) => r,
            Err(_) => Err(ExchangeError::Transient(format!(
                "{what} timed out after {:?}",
                self.call_timeout
            ))),
        }
    }
}

#[async_trait]
impl ExchangeAdapter for GuardedExchange {
    fn kind(&self) -> ExchangeKind {
        self.inner.kind()
    }

    async fn account_state(&self) -> Result<AccountState, ExchangeError> {
        self.read("account_state", self.inner.account_state()).await
    }

    async fn positions(&self) -> Result<Vec<Position>, ExchangeError> {
        self.read("positions", self.inner.positions()).await
    }

    async fn place_order(&self, req: &OrderRequest, key: &IdempotencyKey) -> Result<OrderAck, ExchangeError> {
        let venue = self.inner.kind().as_str();
        if let Some(ack) = self.cache.begin(key)? {
            info!(%key, order_id = %ack.order_id, "order key already filled, replaying ack");
            ORDERS.with_label_values(&[venue, "replayed"]).inc();
            return Ok(ack);
        }
        debug!(%key, asset = %req.asset, side = %req.side, kind = req.kind.as_str(), size_usd = req.size_usd, "placing order");
        let result = match timeout(self.call_timeout, self.inner.place_order(req, key)).await {
            Ok(r) => r,
            // the request may already be on the venue
            Err(_) => Err(ExchangeError::Ambiguous(format!(
                "order {key} timed out after {:?}",
                self.call_timeout
            ))),
        };
        self.cache.finish(key, &result);
        let label = match &result {
            Ok(ack) => ack.status.as_str(),
            Err(ExchangeError::Rejected(_)) => "rejected",
            Err(ExchangeError::Ambiguous(_)) => "ambiguous",
            Err(e) if e.is_transient() => "transient",
            Err(_) => "failed",
        };
        ORDERS.with_label_values(&[venue, label]).inc();
        if let Err(e) = &result {
            warn!(%key, error = %e, "order failed");
        }
        result
    }

    async fn cancel_order(&self, asset: &str, order_id: &str) -> Result<(), ExchangeError> {
        self.read("cancel_order", self.inner.cancel_order(asset, order_id)).await
    }

    async fn available_margin(&self) -> Result<f64, ExchangeError> {
        self.read("available_margin", self.inner.available_margin()).await
    }
}
