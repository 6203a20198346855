// ===============================
// src/feed_binance.rs
// ===============================
//
// USDT-M futures `bookTicker` stream (read-only), shared by Binance and Aster:
//   Binance testnet : wss://stream.binancefuture.com/ws
//   Binance mainnet : wss://fstream.binance.com/ws
//   Aster           : wss://fstream.asterdex.com/ws
//
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures_util::StreamExt; // for .next()
use tokio_tungstenite::connect_async;
use tracing::{info, warn};
use url::Url;

use crate::domain::ExchangeKind;
use crate::error::FeedError;
use crate::feed::{Quote, QuoteSink, QuoteSource};

pub struct BookTickerSource {
    exchange: ExchangeKind,
    ws_base: String,
}

impl BookTickerSource {
    pub fn new(exchange: ExchangeKind, ws_base: impl Into<String>) -> Self {
        Self { exchange, ws_base: ws_base.into() }
    }

    fn stream_url(&self, asset: &str) -> String {
        let topic = format!("{}@bookTicker", self.exchange.symbol_for(asset).to_lowercase());
        format!("{}/{}", self.ws_base.trim_end_matches('/'), topic)
    }
}

/// Parses one bookTicker frame.
/// {"e":"bookTicker","u":400900217,"E":1568014460893,"T":1568014460891,
///  "s":"BNBUSDT","b":"25.35190000","B":"31.21000000","a":"25.36520000","A":"40.66000000"}
pub fn parse_book_ticker(txt: &str) -> Option<Quote> {
    let v: serde_json::Value = serde_json::from_str(txt).ok()?;
    let bid = v.get("b")?.as_str()?.parse::<f64>().ok()?;
    let ask = v.get("a")?.as_str()?.parse::<f64>().ok()?;
    if !(bid > 0.0 && ask > 0.0) {
        return None;
    }
    let ts = v
        .get("E")
        .or_else(|| v.get("T"))
        .and_then(|x| x.as_i64())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now);
    Some(Quote::from_book(bid, ask, ts))
}

#[async_trait]
impl QuoteSource for BookTickerSource {
    fn name(&self) -> &'static str {
        match self.exchange {
            ExchangeKind::Aster => "aster_book_ticker",
            _ => "binance_book_ticker",
        }
    }

    async fn run(&self, asset: &str, sink: &QuoteSink) -> Result<(), FeedError> {
        let ws_url = self.stream_url(asset);
        let url = Url::parse(&ws_url).map_err(|e| FeedError::Connect(format!("bad ws url {ws_url}: {e}")))?;

        info!(%ws_url, "connecting bookTicker");
        let (mut ws, _resp) = connect_async(url)
            .await
            .map_err(|e| FeedError::Connect(e.to_string()))?;
        info!(exchange = %self.exchange, %asset, "connected to bookTicker");

        while let Some(frame) = ws.next().await {
            match frame {
                Ok(m) if m.is_text() => {
                    let txt = match m.into_text() {
                        Ok(t) => t,
                        Err(e) => {
                            warn!(?e, "failed to read text frame");
                            continue;
                        }
                    };
                    if let Some(q) = parse_book_ticker(&txt) {
                        sink.publish(q);
                    }
                }
                Ok(m) if m.is_close() => break,
                Ok(_) => {
                    // ping/pong and binary frames are not quotes
                }
                Err(e) => return Err(FeedError::Protocol(e.to_string())),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_futures_book_ticker() {
        let q = parse_book_ticker(
            r#"{"e":"bookTicker","u":1,"E":1700000000000,"T":1700000000000,"s":"BTCUSDT","b":"36000.10","B":"1.2","a":"36000.30","A":"0.5"}"#,
        )
        .unwrap();
        assert!((q.best_bid - 36_000.10).abs() < 1e-9);
        assert!((q.last_price - 36_000.20).abs() < 1e-6);
        assert_eq!(q.ts.timestamp_millis(), 1_700_000_000_000);
        assert!(parse_book_ticker(r#"{"result":null,"id":1}"#).is_none());
    }

    #[test]
    fn stream_url_uses_lowercase_venue_symbol() {
        let s = BookTickerSource::new(ExchangeKind::Aster, "wss://fstream.asterdex.com/ws/");
        assert_eq!(s.stream_url("eth"), "wss://fstream.asterdex.com/ws/ethusdt@bookTicker");
    }
}
