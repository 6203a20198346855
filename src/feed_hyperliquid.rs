// ===============================
// src/feed_hyperliquid.rs
// ===============================
//
// Hyperliquid `l2Book` subscription. The server drops connections that stay
// silent for 60s, so we send an application-level ping every 30s.
//
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::FeedError;
use crate::feed::{Quote, QuoteSink, QuoteSource};

const PING_EVERY: Duration = Duration::from_secs(30);

pub struct L2BookSource {
    ws_url: String,
}

impl L2BookSource {
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self { ws_url: ws_url.into() }
    }
}

pub fn subscribe_message(coin: &str) -> String {
    serde_json::json!({
        "method": "subscribe",
        "subscription": { "type": "l2Book", "coin": coin }
    })
    .to_string()
}

/// Top of book from an `l2Book` push:
/// {"channel":"l2Book","data":{"coin":"BTC","time":..,"levels":[[bids..],[asks..]]}}
pub fn parse_l2_book(txt: &str, coin: &str) -> Option<Quote> {
    let v: serde_json::Value = serde_json::from_str(txt).ok()?;
    if v.get("channel")?.as_str()? != "l2Book" {
        return None;
    }
    let data = v.get("data")?;
    if !data.get("coin")?.as_str()?.eq_ignore_ascii_case(coin) {
        return None;
    }
    let levels = data.get("levels")?.as_array()?;
    let top = |side: usize| -> Option<f64> {
        levels.get(side)?.as_array()?.first()?.get("px")?.as_str()?.parse::<f64>().ok()
    };
    let bid = top(0)?;
    let ask = top(1)?;
    let ts = data
        .get("time")
        .and_then(|t| t.as_i64())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now);
    Some(Quote::from_book(bid, ask, ts))
}

#[async_trait]
impl QuoteSource for L2BookSource {
    fn name(&self) -> &'static str {
        "hyperliquid_l2book"
    }

    async fn run(&self, asset: &str, sink: &QuoteSink) -> Result<(), FeedError> {
        let url = Url::parse(&self.ws_url)
            .map_err(|e| FeedError::Connect(format!("bad ws url {}: {e}", self.ws_url)))?;
        info!(ws_url = %self.ws_url, %asset, "connecting hyperliquid l2Book");
        let (mut ws, _resp) = connect_async(url)
            .await
            .map_err(|e| FeedError::Connect(e.to_string()))?;
        ws.send(Message::Text(subscribe_message(asset)))
            .await
            .map_err(|e| FeedError::Protocol(e.to_string()))?;

        let mut ping = interval(PING_EVERY);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ping.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                frame = ws.next() => {
                    match frame {
                        Some(Ok(Message::Text(txt))) => {
                            if let Some(q) = parse_l2_book(&txt, asset) {
                                sink.publish(q);
                            } else if txt.contains("\"error\"") {
                                warn!(%asset, %txt, "hyperliquid ws error message");
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => return Ok(()),
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(FeedError::Protocol(e.to_string())),
                    }
                }
                _ = ping.tick() => {
                    debug!(%asset, "hyperliquid ping");
                    ws.send(Message::Text(r#"{"method":"ping"}"#.to_string()))
                        .await
                        .map_err(|e| FeedError::Protocol(e.to_string()))?;
                }
            }
        }
    }
}
