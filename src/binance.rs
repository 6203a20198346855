// ===============================
// src/binance.rs
// ===============================
//
// Binance-compatible USDT-M futures REST dialect (Binance, Aster):
// - HMAC-SHA256 signed query + X-MBX-APIKEY header
// - error code -> shared failure taxonomy
// - exchangeInfo LOT_SIZE / PRICE_FILTER rounding
//
use ahash::AHashMap as HashMap;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use sha2::Sha256;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::Secret;
use crate::domain::ExchangeKind;
use crate::error::ExchangeError;

pub fn timestamp_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

pub fn sign_query(secret: &str, query: &str) -> Result<String, ExchangeError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| ExchangeError::Fatal(format!("hmac key: {e}")))?;
    mac.update(query.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

pub fn encode_params(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: i64,
    #[serde(default)]
    msg: String,
}

/// Maps a non-2xx futures response into the shared taxonomy.
/// `is_order` marks order submissions, whose 5xx outcome is unknown.
pub fn map_error(status: u16, body: &str, retry_after: Option<Duration>, is_order: bool) -> ExchangeError {
    if status == 429 || status == 418 {
        return ExchangeError::RateLimited { retry_after };
    }
    if (500..=599).contains(&status) {
        let msg = format!("HTTP {status}: {body}");
        return if is_order { ExchangeError::Ambiguous(msg) } else { ExchangeError::Transient(msg) };
    }
    let Ok(api) = serde_json::from_str::<ApiError>(body) else {
        return ExchangeError::from_status(status, body, retry_after);
    };
    let msg = format!("{} {}", api.code, api.msg);
    match api.code {
        -1003 => ExchangeError::RateLimited { retry_after },
        // disconnected / timestamp outside recvWindow / unknown
        -1000 | -1001 | -1021 => ExchangeError::Transient(msg),
        // backend timeout, execution status unknown
        -1007 if is_order => ExchangeError::Ambiguous(msg),
        -1007 => ExchangeError::Transient(msg),
        // credentials, permissions, signature
        -1002 | -1022 | -2008 | -2014 | -2015 => ExchangeError::Fatal(msg),
        // malformed request
        -1199..=-1100 => ExchangeError::Fatal(msg),
        // business rules (margin insufficient, reduce-only rejected, ...)
        -2099..=-2010 | -4999..=-4000 | -5999..=-5000 => ExchangeError::Rejected(msg),
        _ if status == 401 || status == 403 => ExchangeError::Fatal(msg),
        _ => ExchangeError::Rejected(msg),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SymbolFilters {
    pub step_size: f64,
    pub min_qty: f64,
    pub tick_size: f64,
    pub min_notional: f64,
}

impl Default for SymbolFilters {
    fn default() -> Self {
        Self { step_size: 0.001, min_qty: 0.001, tick_size: 0.01, min_notional: 5.0 }
    }
}

fn decimals_of(step: f64) -> usize {
    if step <= 0.0 || step >= 1.0 {
        return 0;
    }
    let s = format!("{step:.10}");
    s.trim_end_matches('0').split('.').nth(1).map(|d| d.len()).unwrap_or(0)
}

impl SymbolFilters {
    /// Quantity floored to the lot step.
    pub fn quantity(&self, qty: f64) -> String {
        let steps = (qty / self.step_size + 1e-9).floor();
        format!("{:.*}", decimals_of(self.step_size), steps * self.step_size)
    }

    /// Price rounded to the nearest tick.
    pub fn price(&self, px: f64) -> String {
        let ticks = (px / self.tick_size).round();
        format!("{:.*}", decimals_of(self.tick_size), ticks * self.tick_size)
    }

    fn from_exchange_info(symbol: &serde_json::Value) -> SymbolFilters {
        let mut f = SymbolFilters::default();
        let num = |v: &serde_json::Value, k: &str| -> Option<f64> { v.get(k)?.as_str()?.parse().ok() };
        for flt in symbol.get("filters").and_then(|x| x.as_array()).into_iter().flatten() {
            match flt.get("filterType").and_then(|x| x.as_str()) {
                Some("LOT_SIZE") => {
                    f.step_size = num(flt, "stepSize").unwrap_or(f.step_size);
                    f.min_qty = num(flt, "minQty").unwrap_or(f.min_qty);
                }
                Some("PRICE_FILTER") => f.tick_size = num(flt, "tickSize").unwrap_or(f.tick_size),
                Some("MIN_NOTIONAL") => f.min_notional = num(flt, "notional").unwrap_or(f.min_notional),
                _ => {}
            }
        }
        f
    }
}

/// Thin signed REST client shared by the Binance and Aster gateways.
pub struct FuturesRest {
    pub exchange: ExchangeKind,
    base: String,
    api_key: Secret,
    api_secret: Secret,
    recv_window: u64,
    http: reqwest::Client,
    filters: Mutex<HashMap<String, SymbolFilters>>,
}

impl FuturesRest {
    pub fn new(
        exchange: ExchangeKind,
        base: impl Into<String>,
        api_key: Secret,
        api_secret: Secret,
        timeout: Duration,
    ) -> Result<Self, ExchangeError> {
        if api_key.is_empty() || api_secret.is_empty() {
            return Err(ExchangeError::Fatal(format!("{exchange}: api key/secret missing")));
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ExchangeError::Fatal(e.to_string()))?;
        Ok(Self {
            exchange,
            base: base.into().trim_end_matches('/').to_string(),
            api_key,
            api_secret,
            recv_window: 5_000,
            http,
            filters: Mutex::new(HashMap::new()),
        })
    }

    pub async fn public(&self, path: &str, params: &[(&str, String)]) -> Result<serde_json::Value, ExchangeError> {
        let mut url = format!("{}{}", self.base, path);
        if !params.is_empty() {
            url = format!("{url}?{}", encode_params(params));
        }
        let rsp = self.http.get(url).send().await.map_err(|e| ExchangeError::from_transport(&e))?;
        Self::decode(rsp, false).await
    }

    /// Signed call; `is_order` switches transport/5xx failures and unreadable
    /// bodies to Ambiguous.
    pub async fn signed(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
        is_order: bool,
    ) -> Result<serde_json::Value, ExchangeError> {
        let mut all: Vec<(&str, String)> = params.to_vec();
        all.push(("recvWindow", self.recv_window.to_string()));
        all.push(("timestamp", timestamp_ms().to_string()));
        let query = encode_params(&all);
        let sig = sign_query(self.api_secret.expose(), &query)?;
        let url = format!("{}{}?{}&signature={}", self.base, path, query, sig);
        debug!(exchange = %self.exchange, %method, %path, "signed request");

        let rsp = self
            .http
            .request(method, url)
            .header("X-MBX-APIKEY", self.api_key.expose())
            .send()
            .await
            .map_err(|e| {
                if is_order {
                    ExchangeError::from_order_transport(&e)
                } else {
                    ExchangeError::from_transport(&e)
                }
            })?;
        Self::decode(rsp, is_order).await
    }

    async fn decode(rsp: reqwest::Response, is_order: bool) -> Result<serde_json::Value, ExchangeError> {
        let status = rsp.status();
        let retry_after = rsp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = rsp.text().await.map_err(|e| {
            if is_order {
                ExchangeError::Ambiguous(e.to_string())
            } else {
                ExchangeError::Transient(e.to_string())
            }
        })?;
        if status == StatusCode::OK {
            // a 200 on an order means the venue accepted it, whatever the body says
            serde_json::from_str(&body).map_err(|e| {
                let msg = format!("unreadable 200 response: {e}");
                if is_order {
                    ExchangeError::Ambiguous(msg)
                } else {
                    ExchangeError::Transient(msg)
                }
            })
        } else {
            let err = map_error(status.as_u16(), &body, retry_after, is_order);
            warn!(%status, error = %err, "futures api error");
            Err(err)
        }
    }

    /// Lot/tick filters for a symbol, loading exchangeInfo on first use.
    pub async fn filters(&self, symbol: &str) -> Result<SymbolFilters, ExchangeError> {
        if let Some(f) = self.filters.lock().unwrap_or_else(PoisonError::into_inner).get(symbol) {
            return Ok(*f);
        }
        let info = self.public("/fapi/v1/exchangeInfo", &[]).await?;
        let mut loaded = HashMap::new();
        for s in info.get("symbols").and_then(|x| x.as_array()).into_iter().flatten() {
            if let Some(name) = s.get("symbol").and_then(|x| x.as_str()) {
                loaded.insert(name.to_string(), SymbolFilters::from_exchange_info(s));
            }
        }
        let mut cache = self.filters.lock().unwrap_or_else(PoisonError::into_inner);
        cache.extend(loaded);
        cache
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::Fatal(format!("{}: unknown symbol {symbol}", self.exchange)))
    }
}

/// Numeric fields arrive as strings ("0.00100").
pub fn num_field(v: &serde_json::Value, key: &str) -> f64 {
    match v.get(key) {
        Some(serde_json::Value::String(s)) => s.parse().unwrap_or(0.0),
        Some(serde_json::Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_matches_published_vector() {
        let secret = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        assert_eq!(
            sign_query(secret, query).unwrap(),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn error_codes_map_to_taxonomy() {
        use crate::error::FailureClass::*;
        let class = |status, body: &str, order| map_error(status, body, None, order).class();
        assert_eq!(class(400, r#"{"code":-2019,"msg":"Margin is insufficient."}"#, true), RejectedByVenue);
        assert_eq!(class(401, r#"{"code":-2015,"msg":"Invalid API-key"}"#, false), Fatal);
        assert_eq!(class(400, r#"{"code":-1102,"msg":"Mandatory parameter"}"#, true), Fatal);
        assert_eq!(class(400, r#"{"code":-1021,"msg":"Timestamp outside recvWindow"}"#, false), Transient);
        assert_eq!(class(429, "", false), Transient);
        assert_eq!(class(503, "", false), Transient);
        assert_eq!(class(503, "", true), PartialFailure);
        assert_eq!(class(408, r#"{"code":-1007,"msg":"Timeout waiting for response"}"#, true), PartialFailure);
        let rl = map_error(429, "", Some(Duration::from_secs(7)), false);
        assert_eq!(rl.retry_after(), Some(Duration::from_secs(7)));
    }

    #[test]
    fn filters_round_quantity_down_and_price_to_tick() {
        let f = SymbolFilters { step_size: 0.001, min_qty: 0.001, tick_size: 0.1, min_notional: 5.0 };
        assert_eq!(f.quantity(0.012_99), "0.012");
        assert_eq!(f.price(36_123.456), "36123.5");
        let whole = SymbolFilters { step_size: 1.0, ..f };
        assert_eq!(whole.quantity(12.7), "12");
    }

    #[test]
    fn exchange_info_filters_are_parsed() {
        let s = serde_json::json!({
            "symbol": "BTCUSDT",
            "filters": [
                {"filterType": "PRICE_FILTER", "tickSize": "0.10"},
                {"filterType": "LOT_SIZE", "stepSize": "0.001", "minQty": "0.001"},
                {"filterType": "MIN_NOTIONAL", "notional": "100"}
            ]
        });
        let f = SymbolFilters::from_exchange_info(&s);
        assert_eq!(f.tick_size, 0.1);
        assert_eq!(f.min_notional, 100.0);
    }
}
