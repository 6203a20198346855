// ===============================
// src/gateway_binance.rs
// ===============================
//
// Binance / Aster USDT-M futures gateway (one-way position mode, cross margin).
//
// Open   : set leverage -> MARKET (newClientOrderId = idempotency key)
//          -> STOP_MARKET + TAKE_PROFIT_MARKET (closePosition, MARK_PRICE)
// Close  : cancel protective orders -> reduce-only MARKET
// Adjust : cancel protective orders -> new STOP_MARKET / TAKE_PROFIT_MARKET
//
// newClientOrderId is only unique among open orders: a MARKET entry that
// already filled does not block a second one with the same id. Anything
// that fails after the request left is therefore Ambiguous, never retried.
//
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Method;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::binance::{num_field, FuturesRest, SymbolFilters};
use crate::config::ExchangeCredentials;
use crate::domain::{AccountState, ExchangeKind, Position, Side};
use crate::error::ExchangeError;
use crate::exchange::{ExchangeAdapter, IdempotencyKey, OrderAck, OrderKind, OrderRequest, OrderStatus};

pub struct FuturesGateway {
    rest: FuturesRest,
}

impl FuturesGateway {
    pub fn binance(creds: &ExchangeCredentials, rest_base: &str, timeout: Duration) -> Result<Self, ExchangeError> {
        Self::new(ExchangeKind::Binance, creds, rest_base, timeout)
    }

    pub fn aster(creds: &ExchangeCredentials, rest_base: &str, timeout: Duration) -> Result<Self, ExchangeError> {
        Self::new(ExchangeKind::Aster, creds, rest_base, timeout)
    }

    fn new(
        exchange: ExchangeKind,
        creds: &ExchangeCredentials,
        rest_base: &str,
        timeout: Duration,
    ) -> Result<Self, ExchangeError> {
        let base = creds.rest_url.as_deref().unwrap_or(rest_base);
        if base.is_empty() {
            return Err(ExchangeError::Fatal(format!("{exchange}: no REST endpoint configured")));
        }
        let rest = FuturesRest::new(exchange, base, creds.api_key.clone(), creds.api_secret.clone(), timeout)?;
        Ok(Self { rest })
    }

    fn symbol(&self, asset: &str) -> String {
        self.rest.exchange.symbol_for(asset)
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        self.rest
            .signed(
                Method::POST,
                "/fapi/v1/leverage",
                &[("symbol", symbol.to_string()), ("leverage", leverage.max(1).to_string())],
                false,
            )
            .await
            .map(|_| ())
    }

    async fn cancel_all(&self, symbol: &str) -> Result<(), ExchangeError> {
        self.rest
            .signed(Method::DELETE, "/fapi/v1/allOpenOrders", &[("symbol", symbol.to_string())], false)
            .await
            .map(|_| ())
    }

    async fn market(
        &self,
        symbol: &str,
        side: &str,
        qty: &str,
        reduce_only: bool,
        key: &IdempotencyKey,
    ) -> Result<OrderAck, ExchangeError> {
        let mut params = vec![
            ("symbol", symbol.to_string()),
            ("side", side.to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", qty.to_string()),
            ("newClientOrderId", key.to_string()),
            ("newOrderRespType", "RESULT".to_string()),
        ];
        if reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }
        let v = self.rest.signed(Method::POST, "/fapi/v1/order", &params, true).await?;
        Ok(parse_order_ack(&v, key))
    }

    /// Stop-loss and take-profit as close-position trigger orders.
    async fn protect(
        &self,
        symbol: &str,
        filters: &SymbolFilters,
        side: Side,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
        key: &IdempotencyKey,
    ) -> Result<Option<String>, ExchangeError> {
        let exit_side = order_side(side.opposite());
        let mut first_id = None;
        for (kind, px, suffix) in [
            ("STOP_MARKET", stop_loss, "sl"),
            ("TAKE_PROFIT_MARKET", take_profit, "tp"),
        ] {
            let Some(px) = px else { continue };
            let params = [
                ("symbol", symbol.to_string()),
                ("side", exit_side.to_string()),
                ("type", kind.to_string()),
                ("stopPrice", filters.price(px)),
                ("closePosition", "true".to_string()),
                ("workingType", "MARK_PRICE".to_string()),
                ("newClientOrderId", format!("{key}-{suffix}")),
            ];
            let v = self.rest.signed(Method::POST, "/fapi/v1/order", &params, false).await?;
            if first_id.is_none() {
                first_id = v.get("orderId").map(|x| x.to_string());
            }
        }
        Ok(first_id)
    }

    async fn open(&self, req: &OrderRequest, key: &IdempotencyKey) -> Result<OrderAck, ExchangeError> {
        let symbol = self.symbol(&req.asset);
        let filters = self.rest.filters(&symbol).await?;
        let qty = filters.quantity(req.quantity);
        let qty_f: f64 = qty.parse().unwrap_or(0.0);
        if qty_f < filters.min_qty || qty_f * req.reference_price < filters.min_notional {
            return Err(ExchangeError::Rejected(format!(
                "{symbol}: quantity {qty} below venue minimum"
            )));
        }
        self.set_leverage(&symbol, req.leverage).await?;
        let ack = self.market(&symbol, order_side(req.side), &qty, false, key).await?;
        info!(exchange = %self.rest.exchange, %symbol, %key, order_id = %ack.order_id, filled = ack.filled_qty, "entry filled");

        if let Err(e) = self
            .protect(&symbol, &filters, req.side, req.stop_loss, req.take_profit, key)
            .await
        {
            // never leave a position without its stop
            error!(%symbol, error = %e, "protective orders failed, flattening");
            let flat_key = key.resubmission(9);
            let flat_qty = filters.quantity(ack.filled_qty);
            if let Err(e2) = self
                .market(&symbol, order_side(req.side.opposite()), &flat_qty, true, &flat_key)
                .await
            {
                error!(%symbol, error = %e2, "flatten after protection failure failed");
                return Err(ExchangeError::Ambiguous(format!(
                    "entry filled but protection and flatten failed: {e}; {e2}"
                )));
            }
            return Err(ExchangeError::Rejected(format!("protective orders rejected, position flattened: {e}")));
        }
        Ok(ack)
    }

    async fn close(&self, req: &OrderRequest, key: &IdempotencyKey) -> Result<OrderAck, ExchangeError> {
        let symbol = self.symbol(&req.asset);
        let filters = self.rest.filters(&symbol).await?;
        if let Err(e) = self.cancel_all(&symbol).await {
            warn!(%symbol, error = %e, "cancel protective orders before close failed");
        }
        let qty = filters.quantity(req.quantity);
        self.market(&symbol, order_side(req.side.opposite()), &qty, true, key).await
    }

    async fn adjust(&self, req: &OrderRequest, key: &IdempotencyKey) -> Result<OrderAck, ExchangeError> {
        let symbol = self.symbol(&req.asset);
        let filters = self.rest.filters(&symbol).await?;
        self.cancel_all(&symbol).await?;
        let id = self
            .protect(&symbol, &filters, req.side, req.stop_loss, req.take_profit, key)
            .await?;
        Ok(OrderAck {
            order_id: id.unwrap_or_default(),
            client_id: key.to_string(),
            filled_qty: 0.0,
            avg_price: 0.0,
            status: OrderStatus::Accepted,
        })
    }
}

fn order_side(position_side: Side) -> &'static str {
    match position_side {
        Side::Long => "BUY",
        Side::Short => "SELL",
    }
}

fn parse_order_ack(v: &serde_json::Value, key: &IdempotencyKey) -> OrderAck {
    let status = match v.get("status").and_then(|x| x.as_str()) {
        Some("FILLED") => OrderStatus::Filled,
        Some("PARTIALLY_FILLED") => OrderStatus::PartiallyFilled,
        _ => OrderStatus::Accepted,
    };
    OrderAck {
        order_id: v.get("orderId").map(|x| x.to_string()).unwrap_or_default(),
        client_id: v
            .get("clientOrderId")
            .and_then(|x| x.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| key.to_string()),
        filled_qty: num_field(v, "executedQty"),
        avg_price: num_field(v, "avgPrice"),
        status,
    }
}

/// positionRisk rows (one-way mode) + open trigger orders -> positions.
pub fn parse_positions(
    exchange: ExchangeKind,
    risk: &serde_json::Value,
    open_orders: &serde_json::Value,
) -> Vec<Position> {
    let mut out = Vec::new();
    for row in risk.as_array().into_iter().flatten() {
        let amt = num_field(row, "positionAmt");
        if amt == 0.0 {
            continue;
        }
        let symbol = row.get("symbol").and_then(|x| x.as_str()).unwrap_or_default();
        let leverage = num_field(row, "leverage").max(1.0) as u32;
        let mark = num_field(row, "markPrice");
        let side = if amt > 0.0 { Side::Long } else { Side::Short };
        let trigger = |kind: &str| -> Option<f64> {
            open_orders
                .as_array()?
                .iter()
                .filter(|o| o.get("symbol").and_then(|x| x.as_str()) == Some(symbol))
                .find(|o| o.get("type").and_then(|x| x.as_str()) == Some(kind))
                .map(|o| num_field(o, "stopPrice"))
        };
        let isolated = num_field(row, "isolatedMargin");
        out.push(Position {
            asset: exchange.asset_of(symbol),
            side,
            size: amt.abs(),
            entry_price: num_field(row, "entryPrice"),
            mark_price: mark,
            unrealized_pnl: num_field(row, "unRealizedProfit"),
            leverage,
            margin: if isolated > 0.0 { isolated } else { amt.abs() * mark / leverage as f64 },
            stop_loss: trigger("STOP_MARKET"),
            take_profit: trigger("TAKE_PROFIT_MARKET"),
        });
    }
    out
}

#[async_trait]
impl ExchangeAdapter for FuturesGateway {
    fn kind(&self) -> ExchangeKind {
        self.rest.exchange
    }

    async fn account_state(&self) -> Result<AccountState, ExchangeError> {
        let account = self.rest.signed(Method::GET, "/fapi/v2/account", &[], false).await?;
        let positions = self.positions().await?;
        Ok(AccountState {
            exchange: self.rest.exchange,
            equity: num_field(&account, "totalMarginBalance"),
            available_margin: num_field(&account, "availableBalance"),
            positions,
            ts: Utc::now(),
        })
    }

    async fn positions(&self) -> Result<Vec<Position>, ExchangeError> {
        let risk = self.rest.signed(Method::GET, "/fapi/v2/positionRisk", &[], false).await?;
        let orders = self.rest.signed(Method::GET, "/fapi/v1/openOrders", &[], false).await?;
        Ok(parse_positions(self.rest.exchange, &risk, &orders))
    }

    async fn place_order(&self, req: &OrderRequest, key: &IdempotencyKey) -> Result<OrderAck, ExchangeError> {
        match req.kind {
            OrderKind::Open => self.open(req, key).await,
            OrderKind::Close => self.close(req, key).await,
            OrderKind::Adjust => self.adjust(req, key).await,
        }
    }

    async fn cancel_order(&self, asset: &str, order_id: &str) -> Result<(), ExchangeError> {
        let params = [("symbol", self.symbol(asset)), ("orderId", order_id.to_string())];
        self.rest
            .signed(Method::DELETE, "/fapi/v1/order", &params, false)
            .await
            .map(|_| ())
    }

    async fn available_margin(&self) -> Result<f64, ExchangeError> {
        let account = self.rest.signed(Method::GET, "/fapi/v2/account", &[], false).await?;
        Ok(num_field(&account, "availableBalance"))
    }
}
