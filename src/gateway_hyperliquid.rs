// ===============================
// src/gateway_hyperliquid.rs
// ===============================
//
// Hyperliquid perps gateway.
// - /info     : meta, clearinghouseState, frontendOpenOrders, allMids
// - /exchange : order / cancel / updateLeverage, signed as an EIP-712 "Agent"
//               over keccak(msgpack(action) ++ nonce ++ vault flag)
// - market orders are aggressive IOC limits at mid +/- slippage
// - cloid = first 16 bytes of sha256(idempotency key); the venue refuses a
//   second order with the same cloid
//
use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use chrono::Utc;
use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use serde::Serialize;
use serde_json::json;
use sha3::{Digest, Keccak256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::binance::num_field;
use crate::config::{ExchangeCredentials, Secret};
use crate::domain::{AccountState, ExchangeKind, Position, Side};
use crate::error::ExchangeError;
use crate::exchange::{ExchangeAdapter, IdempotencyKey, OrderAck, OrderKind, OrderRequest, OrderStatus};

const DEFAULT_SLIPPAGE: f64 = 0.05;

fn keccak(data: &[u8]) -> [u8; 32] {
    Keccak256::digest(data).into()
}

// ---------------- Signing ----------------

pub struct Signer {
    key: SigningKey,
    address: String,
}

impl Signer {
    pub fn from_hex(private_key: &Secret) -> Result<Self, ExchangeError> {
        let raw = private_key.expose().trim().trim_start_matches("0x");
        let bytes = hex::decode(raw).map_err(|_| ExchangeError::Fatal("hyperliquid: private key is not hex".into()))?;
        let key = SigningKey::from_slice(&bytes)
            .map_err(|_| ExchangeError::Fatal("hyperliquid: invalid private key".into()))?;
        let address = address_of(key.verifying_key());
        Ok(Self { key, address })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Signs the phantom agent for an action hash. Returns (r, s, v).
    pub fn sign_action(&self, connection_id: [u8; 32], mainnet: bool) -> Result<(String, String, u8), ExchangeError> {
        let digest = agent_digest(connection_id, mainnet);
        let (sig, recid): (Signature, RecoveryId) = self
            .key
            .sign_prehash_recoverable(&digest)
            .map_err(|e| ExchangeError::Fatal(format!("hyperliquid sign: {e}")))?;
        let bytes = sig.to_bytes();
        Ok((
            format!("0x{}", hex::encode(&bytes[..32])),
            format!("0x{}", hex::encode(&bytes[32..])),
            27 + recid.to_byte(),
        ))
    }
}

pub fn address_of(vk: &VerifyingKey) -> String {
    let point = vk.as_affine().to_encoded_point(false);
    let hash = keccak(&point.as_bytes()[1..]);
    format!("0x{}", hex::encode(&hash[12..]))
}

/// keccak(msgpack(action) ++ nonce_be ++ 0x00) for orders without a vault.
pub fn action_hash<T: Serialize>(action: &T, nonce: u64) -> Result<[u8; 32], ExchangeError> {
    let mut data = rmp_serde::to_vec_named(action).map_err(|e| ExchangeError::Fatal(format!("msgpack: {e}")))?;
    data.extend_from_slice(&nonce.to_be_bytes());
    data.push(0x00);
    Ok(keccak(&data))
}

/// EIP-712 digest of Agent{source, connectionId} in the "Exchange" domain.
pub fn agent_digest(connection_id: [u8; 32], mainnet: bool) -> [u8; 32] {
    let domain_type = keccak(b"EIP712Domain(string name,string version,uint256 chainId,address verifyingContract)");
    let mut chain_id = [0u8; 32];
    chain_id[24..].copy_from_slice(&1337u64.to_be_bytes());
    let mut domain = Vec::with_capacity(32 * 5);
    domain.extend_from_slice(&domain_type);
    domain.extend_from_slice(&keccak(b"Exchange"));
    domain.extend_from_slice(&keccak(b"1"));
    domain.extend_from_slice(&chain_id);
    domain.extend_from_slice(&[0u8; 32]); // verifyingContract = 0x0
    let domain_separator = keccak(&domain);

    let agent_type = keccak(b"Agent(string source,bytes32 connectionId)");
    let source: &[u8] = if mainnet { b"a" } else { b"b" };
    let mut st = Vec::with_capacity(32 * 3);
    st.extend_from_slice(&agent_type);
    st.extend_from_slice(&keccak(source));
    st.extend_from_slice(&connection_id);
    let struct_hash = keccak(&st);

    let mut msg = Vec::with_capacity(66);
    msg.extend_from_slice(&[0x19, 0x01]);
    msg.extend_from_slice(&domain_separator);
    msg.extend_from_slice(&struct_hash);
    keccak(&msg)
}

pub fn cloid_for(key: &IdempotencyKey) -> String {
    let digest = sha2::Sha256::digest(key.as_str().as_bytes());
    format!("0x{}", hex::encode(&digest[..16]))
}

// ---------------- Wire types (field order is part of the hash) ----------------

#[derive(Debug, Clone, Serialize)]
pub struct LimitWire {
    pub tif: &'static str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerWire {
    pub is_market: bool,
    pub trigger_px: String,
    pub tpsl: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderTypeWire {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<LimitWire>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger: Option<TriggerWire>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderWire {
    pub a: u32,
    pub b: bool,
    pub p: String,
    pub s: String,
    pub r: bool,
    pub t: OrderTypeWire,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub c: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderAction {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub orders: Vec<OrderWire>,
    pub grouping: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelWire {
    pub a: u32,
    pub o: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelAction {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub cancels: Vec<CancelWire>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeverageAction {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub asset: u32,
    pub is_cross: bool,
    pub leverage: u32,
}

// ---------------- Rounding ----------------

/// Decimal string without trailing zeros ("60000", "0.0123").
pub fn float_to_wire(x: f64) -> String {
    let s = format!("{x:.8}");
    let s = s.trim_end_matches('0').trim_end_matches('.');
    if s == "-0" || s.is_empty() {
        "0".to_string()
    } else {
        s.to_string()
    }
}

fn round_dp(x: f64, dp: i32) -> f64 {
    let m = 10f64.powi(dp);
    (x * m).round() / m
}

/// At most 5 significant figures and (6 - szDecimals) decimals; integers always pass.
pub fn round_price(px: f64, sz_decimals: u32) -> f64 {
    if px >= 100_000.0 {
        return px.round();
    }
    let sig5: f64 = format!("{px:.4e}").parse().unwrap_or(px);
    round_dp(sig5, 6 - sz_decimals.min(6) as i32)
}

pub fn round_size(sz: f64, sz_decimals: u32) -> f64 {
    let m = 10f64.powi(sz_decimals as i32);
    (sz * m + 1e-9).floor() / m
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AssetMeta {
    pub index: u32,
    pub sz_decimals: u32,
    pub max_leverage: u32,
}

pub fn parse_meta(v: &serde_json::Value) -> HashMap<String, AssetMeta> {
    let mut out = HashMap::new();
    for (i, a) in v.get("universe").and_then(|x| x.as_array()).into_iter().flatten().enumerate() {
        if let Some(name) = a.get("name").and_then(|x| x.as_str()) {
            out.insert(
                name.to_ascii_uppercase(),
                AssetMeta {
                    index: i as u32,
                    sz_decimals: a.get("szDecimals").and_then(|x| x.as_u64()).unwrap_or(0) as u32,
                    max_leverage: a.get("maxLeverage").and_then(|x| x.as_u64()).unwrap_or(1) as u32,
                },
            );
        }
    }
    out
}

/// clearinghouseState + frontendOpenOrders -> account state.
pub fn parse_clearinghouse(state: &serde_json::Value, open_orders: &serde_json::Value) -> AccountState {
    let summary = state.get("marginSummary").cloned().unwrap_or_default();
    let mut positions = Vec::new();
    for ap in state.get("assetPositions").and_then(|x| x.as_array()).into_iter().flatten() {
        let Some(p) = ap.get("position") else { continue };
        let szi = num_field(p, "szi");
        if szi == 0.0 {
            continue;
        }
        let coin = p.get("coin").and_then(|x| x.as_str()).unwrap_or_default().to_string();
        let value = num_field(p, "positionValue");
        let trigger = |tpsl_kind: &str| -> Option<f64> {
            open_orders
                .as_array()?
                .iter()
                .filter(|o| o.get("coin").and_then(|x| x.as_str()) == Some(coin.as_str()))
                .filter(|o| o.get("isTrigger").and_then(|x| x.as_bool()).unwrap_or(false))
                .find(|o| {
                    o.get("orderType")
                        .and_then(|x| x.as_str())
                        .map(|t| t.starts_with(tpsl_kind))
                        .unwrap_or(false)
                })
                .map(|o| num_field(o, "triggerPx"))
        };
        positions.push(Position {
            asset: coin.clone(),
            side: if szi > 0.0 { Side::Long } else { Side::Short },
            size: szi.abs(),
            entry_price: num_field(p, "entryPx"),
            mark_price: if szi != 0.0 { value / szi.abs() } else { 0.0 },
            unrealized_pnl: num_field(p, "unrealizedPnl"),
            leverage: p
                .get("leverage")
                .and_then(|l| l.get("value"))
                .and_then(|x| x.as_u64())
                .unwrap_or(1) as u32,
            margin: num_field(p, "marginUsed"),
            stop_loss: trigger("Stop"),
            take_profit: trigger("Take Profit"),
        });
    }
    AccountState {
        exchange: ExchangeKind::Hyperliquid,
        equity: num_field(&summary, "accountValue"),
        available_margin: num_field(state, "withdrawable"),
        positions,
        ts: Utc::now(),
    }
}

/// First status of an /exchange order response.
pub fn parse_order_response(v: &serde_json::Value, client_id: &str) -> Result<OrderAck, ExchangeError> {
    if v.get("status").and_then(|x| x.as_str()) != Some("ok") {
        let msg = v.get("response").map(|r| r.to_string()).unwrap_or_else(|| v.to_string());
        return Err(classify_message(&msg));
    }
    let status = v
        .pointer("/response/data/statuses/0")
        .ok_or_else(|| ExchangeError::Ambiguous(format!("no order status in {v}")))?;
    if let Some(f) = status.get("filled") {
        return Ok(OrderAck {
            order_id: f.get("oid").map(|x| x.to_string()).unwrap_or_default(),
            client_id: client_id.to_string(),
            filled_qty: num_field(f, "totalSz"),
            avg_price: num_field(f, "avgPx"),
            status: OrderStatus::Filled,
        });
    }
    if let Some(r) = status.get("resting") {
        return Ok(OrderAck {
            order_id: r.get("oid").map(|x| x.to_string()).unwrap_or_default(),
            client_id: client_id.to_string(),
            filled_qty: 0.0,
            avg_price: 0.0,
            status: OrderStatus::Accepted,
        });
    }
    if let Some(e) = status.get("error").and_then(|x| x.as_str()) {
        return Err(classify_message(e));
    }
    Ok(OrderAck {
        order_id: String::new(),
        client_id: client_id.to_string(),
        filled_qty: 0.0,
        avg_price: 0.0,
        status: OrderStatus::Accepted,
    })
}

fn classify_message(msg: &str) -> ExchangeError {
    let lower = msg.to_ascii_lowercase();
    if lower.contains("does not exist") || lower.contains("signature") || lower.contains("not authorized") {
        ExchangeError::Fatal(msg.to_string())
    } else if lower.contains("rate limit") {
        ExchangeError::RateLimited { retry_after: None }
    } else {
        ExchangeError::Rejected(msg.to_string())
    }
}

// ---------------- Gateway ----------------

pub struct HyperliquidGateway {
    base: String,
    http: reqwest::Client,
    signer: Signer,
    /// Account traded for; defaults to the signer.
    user: String,
    mainnet: bool,
    slippage: f64,
    meta: Mutex<Option<HashMap<String, AssetMeta>>>,
    last_nonce: AtomicU64,
}

impl HyperliquidGateway {
    pub fn new(
        creds: &ExchangeCredentials,
        rest_base: &str,
        mainnet: bool,
        timeout: Duration,
    ) -> Result<Self, ExchangeError> {
        let base = creds.rest_url.as_deref().unwrap_or(rest_base);
        if base.is_empty() {
            return Err(ExchangeError::Fatal("hyperliquid: no API endpoint configured".into()));
        }
        if creds.private_key.is_empty() {
            return Err(ExchangeError::Fatal("hyperliquid: private key missing".into()));
        }
        let signer = Signer::from_hex(&creds.private_key)?;
        let user = creds
            .wallet_address
            .clone()
            .filter(|a| !a.trim().is_empty())
            .unwrap_or_else(|| signer.address().to_string())
            .to_ascii_lowercase();
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ExchangeError::Fatal(e.to_string()))?;
        info!(%user, agent = %signer.address(), mainnet, "hyperliquid gateway ready");
        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            http,
            signer,
            user,
            mainnet,
            slippage: DEFAULT_SLIPPAGE,
            meta: Mutex::new(None),
            last_nonce: AtomicU64::new(0),
        })
    }

    fn next_nonce(&self) -> u64 {
        let now = Utc::now().timestamp_millis().max(0) as u64;
        let mut prev = self.last_nonce.load(Ordering::SeqCst);
        loop {
            let next = now.max(prev + 1);
            match self.last_nonce.compare_exchange(prev, next, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }

    async fn post(&self, path: &str, body: &serde_json::Value, is_order: bool) -> Result<serde_json::Value, ExchangeError> {
        let rsp = self
            .http
            .post(format!("{}{}", self.base, path))
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if is_order {
                    ExchangeError::from_order_transport(&e)
                } else {
                    ExchangeError::from_transport(&e)
                }
            })?;
        // past this point the action has reached the venue
        let unknown = |msg: String| {
            if is_order {
                ExchangeError::Ambiguous(msg)
            } else {
                ExchangeError::Transient(msg)
            }
        };
        let status = rsp.status().as_u16();
        let text = rsp.text().await.map_err(|e| unknown(format!("body read failed: {e}")))?;
        if status != 200 {
            return Err(match status {
                500..=599 if is_order => ExchangeError::Ambiguous(format!("HTTP {status}: {text}")),
                400 | 422 => classify_message(&text),
                _ => ExchangeError::from_status(status, &text, None),
            });
        }
        serde_json::from_str(&text).map_err(|e| unknown(format!("bad json: {e}: {text}")))
    }

    async fn info(&self, body: serde_json::Value) -> Result<serde_json::Value, ExchangeError> {
        self.post("/info", &body, false).await
    }

    async fn exchange<T: Serialize + Sync>(&self, action: &T, is_order: bool) -> Result<serde_json::Value, ExchangeError> {
        let nonce = self.next_nonce();
        let (r, s, v) = self.signer.sign_action(action_hash(action, nonce)?, self.mainnet)?;
        let body = json!({
            "action": action,
            "nonce": nonce,
            "signature": { "r": r, "s": s, "v": v },
            "vaultAddress": null,
        });
        self.post("/exchange", &body, is_order).await
    }

    async fn asset(&self, coin: &str) -> Result<AssetMeta, ExchangeError> {
        let coin = coin.to_ascii_uppercase();
        if let Some(m) = self.meta.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            if let Some(a) = m.get(&coin) {
                return Ok(*a);
            }
        }
        let parsed = parse_meta(&self.info(json!({"type": "meta"})).await?);
        let found = parsed.get(&coin).copied();
        *self.meta.lock().unwrap_or_else(PoisonError::into_inner) = Some(parsed);
        found.ok_or_else(|| ExchangeError::Fatal(format!("hyperliquid: unknown coin {coin}")))
    }

    async fn mid(&self, coin: &str, fallback: f64) -> f64 {
        match self.info(json!({"type": "allMids"})).await {
            Ok(v) => {
                let m = num_field(&v, coin);
                if m > 0.0 {
                    m
                } else {
                    fallback
                }
            }
            Err(e) => {
                warn!(%coin, error = %e, "allMids failed, using reference price");
                fallback
            }
        }
    }

    async fn open_orders(&self) -> Result<serde_json::Value, ExchangeError> {
        self.info(json!({"type": "frontendOpenOrders", "user": self.user})).await
    }

    async fn cancel_triggers(&self, coin: &str, meta: AssetMeta) -> Result<(), ExchangeError> {
        let orders = self.open_orders().await?;
        let cancels: Vec<CancelWire> = orders
            .as_array()
            .into_iter()
            .flatten()
            .filter(|o| o.get("coin").and_then(|x| x.as_str()) == Some(coin))
            .filter(|o| o.get("isTrigger").and_then(|x| x.as_bool()).unwrap_or(false))
            .filter_map(|o| o.get("oid").and_then(|x| x.as_u64()))
            .map(|o| CancelWire { a: meta.index, o })
            .collect();
        if cancels.is_empty() {
            return Ok(());
        }
        debug!(%coin, n = cancels.len(), "cancelling trigger orders");
        self.exchange(&CancelAction { kind: "cancel", cancels }, false).await.map(|_| ())
    }

    fn ioc(&self, meta: AssetMeta, is_buy: bool, px: f64, sz: f64, reduce_only: bool, cloid: Option<String>) -> OrderWire {
        let aggressive = if is_buy { px * (1.0 + self.slippage) } else { px * (1.0 - self.slippage) };
        OrderWire {
            a: meta.index,
            b: is_buy,
            p: float_to_wire(round_price(aggressive, meta.sz_decimals)),
            s: float_to_wire(round_size(sz, meta.sz_decimals)),
            r: reduce_only,
            t: OrderTypeWire { limit: Some(LimitWire { tif: "Ioc" }), trigger: None },
            c: cloid,
        }
    }

    fn triggers(&self, meta: AssetMeta, side: Side, sz: f64, sl: Option<f64>, tp: Option<f64>) -> Vec<OrderWire> {
        let exit_buy = side == Side::Short;
        [(sl, "sl"), (tp, "tp")]
            .into_iter()
            .filter_map(|(px, tpsl)| {
                let px = round_price(px?, meta.sz_decimals);
                Some(OrderWire {
                    a: meta.index,
                    b: exit_buy,
                    p: float_to_wire(px),
                    s: float_to_wire(round_size(sz, meta.sz_decimals)),
                    r: true,
                    t: OrderTypeWire {
                        limit: None,
                        trigger: Some(TriggerWire { is_market: true, trigger_px: float_to_wire(px), tpsl }),
                    },
                    c: None,
                })
            })
            .collect()
    }

    async fn place_triggers(&self, orders: Vec<OrderWire>) -> Result<Option<String>, ExchangeError> {
        if orders.is_empty() {
            return Ok(None);
        }
        let v = self
            .exchange(&OrderAction { kind: "order", orders, grouping: "positionTpsl" }, false)
            .await?;
        parse_order_response(&v, "").map(|a| Some(a.order_id))
    }

    async fn open(&self, req: &OrderRequest, key: &IdempotencyKey) -> Result<OrderAck, ExchangeError> {
        let meta = self.asset(&req.asset).await?;
        let lev = req.leverage.clamp(1, meta.max_leverage.max(1));
        self.exchange(
            &LeverageAction { kind: "updateLeverage", asset: meta.index, is_cross: true, leverage: lev },
            false,
        )
        .await?;

        let mid = self.mid(&req.asset, req.reference_price).await;
        let is_buy = req.side == Side::Long;
        let cloid = cloid_for(key);
        let order = self.ioc(meta, is_buy, mid, req.quantity, false, Some(cloid.clone()));
        let v = self
            .exchange(&OrderAction { kind: "order", orders: vec![order], grouping: "na" }, true)
            .await?;
        let ack = parse_order_response(&v, &cloid)?;
        if ack.filled_qty <= 0.0 {
            return Err(ExchangeError::Rejected(format!("IOC entry for {} did not fill", req.asset)));
        }
        info!(coin = %req.asset, %key, oid = %ack.order_id, filled = ack.filled_qty, "hyperliquid entry filled");

        let triggers = self.triggers(meta, req.side, ack.filled_qty, req.stop_loss, req.take_profit);
        if let Err(e) = self.place_triggers(triggers).await {
            error!(coin = %req.asset, error = %e, "protective orders failed, flattening");
            let flat = self.ioc(meta, !is_buy, mid, ack.filled_qty, true, None);
            let flattened = self
                .exchange(&OrderAction { kind: "order", orders: vec![flat], grouping: "na" }, true)
                .await
                .and_then(|v| parse_order_response(&v, ""));
            return Err(match flattened {
                Ok(_) => ExchangeError::Rejected(format!("protective orders rejected, position flattened: {e}")),
                Err(e2) => ExchangeError::Ambiguous(format!("entry filled but protection and flatten failed: {e}; {e2}")),
            });
        }
        Ok(ack)
    }

    async fn close(&self, req: &OrderRequest, key: &IdempotencyKey) -> Result<OrderAck, ExchangeError> {
        let meta = self.asset(&req.asset).await?;
        if let Err(e) = self.cancel_triggers(&req.asset, meta).await {
            warn!(coin = %req.asset, error = %e, "cancel triggers before close failed");
        }
        let mid = self.mid(&req.asset, req.reference_price).await;
        let cloid = cloid_for(key);
        let order = self.ioc(meta, req.side == Side::Short, mid, req.quantity, true, Some(cloid.clone()));
        let v = self
            .exchange(&OrderAction { kind: "order", orders: vec![order], grouping: "na" }, true)
            .await?;
        parse_order_response(&v, &cloid)
    }

    async fn adjust(&self, req: &OrderRequest, key: &IdempotencyKey) -> Result<OrderAck, ExchangeError> {
        let meta = self.asset(&req.asset).await?;
        self.cancel_triggers(&req.asset, meta).await?;
        let triggers = self.triggers(meta, req.side, req.quantity, req.stop_loss, req.take_profit);
        let id = self.place_triggers(triggers).await?;
        Ok(OrderAck {
            order_id: id.unwrap_or_default(),
            client_id: key.to_string(),
            filled_qty: 0.0,
            avg_price: 0.0,
            status: OrderStatus::Accepted,
        })
    }
}

#[async_trait]
impl ExchangeAdapter for HyperliquidGateway {
    fn kind(&self) -> ExchangeKind {
        ExchangeKind::Hyperliquid
    }

    async fn account_state(&self) -> Result<AccountState, ExchangeError> {
        let state = self.info(json!({"type": "clearinghouseState", "user": self.user})).await?;
        let orders = self.open_orders().await?;
        Ok(parse_clearinghouse(&state, &orders))
    }

    async fn place_order(&self, req: &OrderRequest, key: &IdempotencyKey) -> Result<OrderAck, ExchangeError> {
        match req.kind {
            OrderKind::Open => self.open(req, key).await,
            OrderKind::Close => self.close(req, key).await,
            OrderKind::Adjust => self.adjust(req, key).await,
        }
    }

    async fn cancel_order(&self, asset: &str, order_id: &str) -> Result<(), ExchangeError> {
        let meta = self.asset(asset).await?;
        let oid = order_id
            .trim_matches('"')
            .parse::<u64>()
            .map_err(|_| ExchangeError::Fatal(format!("hyperliquid: bad order id {order_id}")))?;
        let v = self
            .exchange(&CancelAction { kind: "cancel", cancels: vec![CancelWire { a: meta.index, o: oid }] }, false)
            .await?;
        match v.pointer("/response/data/statuses/0") {
            Some(s) if s.get("error").is_some() => Err(classify_message(&s.to_string())),
            _ => Ok(()),
        }
    }
}
