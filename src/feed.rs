// ===============================
// src/feed.rs
// ===============================
//
// Market Feed Aggregator:
// - satu koneksi streaming per (exchange, asset) yang benar-benar di-subscribe
// - fan-out lewat broadcast (bounded); subscriber lambat kehilangan yang paling lama
// - latest() selalu otoritatif, staleness dihitung saat dibaca
// - reconnect: exponential backoff 0.5s..32s + jitter, reset setelah data masuk
//
// Sources:
// - MockSource   : random-walk generator
// - ManualSource : quotes pushed by hand (tests, replay)
// - feed_binance / feed_hyperliquid : live WebSocket sources
//
use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::Stream;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::domain::{ExchangeKind, MarketSnapshot};
use crate::error::FeedError;
use crate::metrics::{FEED_CONNECTED, FEED_DROPPED, FEED_RECONNECTS, FEED_STALE_READS, FEED_UPDATES};
use crate::retry::Backoff;

/// Raw top-of-book update as delivered by a source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quote {
    pub last_price: f64,
    pub best_bid: f64,
    pub best_ask: f64,
    /// Venue event time when the source provides one.
    pub ts: DateTime<Utc>,
}

impl Quote {
    /// Quote from bid/ask only; last price is the mid.
    pub fn from_book(best_bid: f64, best_ask: f64, ts: DateTime<Utc>) -> Self {
        Quote {
            last_price: (best_bid + best_ask) / 2.0,
            best_bid,
            best_ask,
            ts,
        }
    }

    fn is_valid(&self) -> bool {
        self.best_bid > 0.0 && self.best_ask > 0.0 && self.last_price > 0.0
    }
}

/// One streaming connection type per exchange.
#[async_trait]
pub trait QuoteSource: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Runs a single connection for `asset` and pushes every update into
    /// `sink`. Returns when the connection drops; the aggregator reconnects.
    async fn run(&self, asset: &str, sink: &QuoteSink) -> Result<(), FeedError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FeedKey {
    exchange: ExchangeKind,
    asset: String,
}

struct Channel {
    key: FeedKey,
    tx: broadcast::Sender<MarketSnapshot>,
    latest: RwLock<Option<MarketSnapshot>>,
    seq: AtomicU64,
}

impl Channel {
    fn publish(&self, q: Quote) {
        let mut latest = self.latest.write().unwrap_or_else(PoisonError::into_inner);
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let snap = MarketSnapshot {
            exchange: self.key.exchange,
            asset: self.key.asset.clone(),
            last_price: q.last_price,
            best_bid: q.best_bid,
            best_ask: q.best_ask,
            ts: q.ts,
            seq,
            stale: false,
        };
        *latest = Some(snap.clone());
        drop(latest);
        // no receivers is fine: latest() still sees it
        let _ = self.tx.send(snap);
        FEED_UPDATES
            .with_label_values(&[self.key.exchange.as_str(), &self.key.asset])
            .inc();
    }
}

/// Handle a source pushes quotes into during one connection.
pub struct QuoteSink {
    channel: Arc<Channel>,
    delivered: AtomicBool,
}

impl QuoteSink {
    fn new(channel: Arc<Channel>) -> Self {
        Self { channel, delivered: AtomicBool::new(false) }
    }

    pub fn publish(&self, q: Quote) {
        if !q.is_valid() {
            debug!(asset = %self.channel.key.asset, ?q, "dropping invalid quote");
            return;
        }
        if !self.delivered.swap(true, Ordering::Relaxed) {
            FEED_CONNECTED
                .with_label_values(&[self.channel.key.exchange.as_str(), &self.channel.key.asset])
                .set(1);
        }
        self.channel.publish(q);
    }

    pub fn delivered(&self) -> bool {
        self.delivered.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub struct FeedSettings {
    pub stale_after: Duration,
    /// Per-subscriber buffer length.
    pub buffer: usize,
    pub backoff: Backoff,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(15),
            buffer: 64,
            backoff: Backoff::feed(),
        }
    }
}

struct Entry {
    channel: Arc<Channel>,
    task: JoinHandle<()>,
}

pub struct MarketFeed {
    sources: HashMap<ExchangeKind, Arc<dyn QuoteSource>>,
    settings: FeedSettings,
    entries: Mutex<HashMap<FeedKey, Entry>>,
}

impl MarketFeed {
    pub fn new(settings: FeedSettings) -> Self {
        Self {
            sources: HashMap::new(),
            settings,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_source(mut self, exchange: ExchangeKind, source: Arc<dyn QuoteSource>) -> Self {
        self.sources.insert(exchange, source);
        self
    }

    pub fn stale_after(&self) -> Duration {
        self.settings.stale_after
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<FeedKey, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the channel for a key, opening its connection on first use.
    /// Must be called inside a tokio runtime.
    fn ensure(&self, exchange: ExchangeKind, asset: &str) -> Result<Arc<Channel>, FeedError> {
        let key = FeedKey { exchange, asset: asset.trim().to_ascii_uppercase() };
        let mut entries = self.lock();
        if let Some(e) = entries.get(&key) {
            return Ok(e.channel.clone());
        }
        let source = self
            .sources
            .get(&exchange)
            .cloned()
            .ok_or(FeedError::NoSource(exchange))?;
        let (tx, _) = broadcast::channel(self.settings.buffer.max(1));
        let channel = Arc::new(Channel {
            key: key.clone(),
            tx,
            latest: RwLock::new(None),
            seq: AtomicU64::new(0),
        });
        let task = tokio::spawn(run_connection(source, channel.clone(), self.settings.backoff.clone()));
        info!(exchange = %exchange, asset = %key.asset, "feed: opened stream");
        entries.insert(key, Entry { channel: channel.clone(), task });
        Ok(channel)
    }

    /// Lazy, restartable sequence of snapshots for one pair. Survives
    /// reconnects; a slow consumer skips what it missed.
    pub fn subscribe(&self, exchange: ExchangeKind, asset: &str) -> Result<Subscription, FeedError> {
        let channel = self.ensure(exchange, asset)?;
        Ok(Subscription {
            rx: channel.tx.subscribe(),
            exchange,
            asset: channel.key.asset.clone(),
            stale_after: self.settings.stale_after,
            missed: 0,
        })
    }

    /// Most recent snapshot with its staleness evaluated now.
    pub fn latest(&self, exchange: ExchangeKind, asset: &str) -> Result<MarketSnapshot, FeedError> {
        let asset = asset.trim().to_ascii_uppercase();
        let channel = {
            let entries = self.lock();
            entries
                .get(&FeedKey { exchange, asset: asset.clone() })
                .map(|e| e.channel.clone())
        };
        let snap = channel
            .and_then(|c| c.latest.read().unwrap_or_else(PoisonError::into_inner).clone())
            .ok_or_else(|| FeedError::NotAvailable { exchange, asset: asset.clone() })?;
        let snap = snap.observed_at(Utc::now(), self.settings.stale_after);
        if snap.stale {
            FEED_STALE_READS.with_label_values(&[exchange.as_str(), &asset]).inc();
        }
        Ok(snap)
    }

    pub fn active_streams(&self) -> usize {
        self.lock().len()
    }

    /// Aborts every connection task. Existing subscriptions end.
    pub fn shutdown(&self) {
        let mut entries = self.lock();
        for (key, e) in entries.drain() {
            e.task.abort();
            FEED_CONNECTED
                .with_label_values(&[key.exchange.as_str(), &key.asset])
                .set(0);
        }
        info!("feed: all streams closed");
    }
}

async fn run_connection(source: Arc<dyn QuoteSource>, channel: Arc<Channel>, backoff: Backoff) {
    let exchange = channel.key.exchange;
    let asset = channel.key.asset.clone();
    let labels = [exchange.as_str(), asset.as_str()];
    let mut attempt: u32 = 0;
    loop {
        let sink = QuoteSink::new(channel.clone());
        match source.run(&asset, &sink).await {
            Ok(()) => info!(source = source.name(), %asset, "feed: stream ended, will reconnect"),
            Err(e) => warn!(source = source.name(), %asset, error = %e, "feed: stream failed"),
        }
        FEED_CONNECTED.with_label_values(&labels).set(0);
        if sink.delivered() {
            attempt = 0; // reset backoff
        }
        let wait = backoff.delay(attempt);
        attempt = attempt.saturating_add(1);
        FEED_RECONNECTS.with_label_values(&labels).inc();
        debug!(%asset, attempt, wait_ms = wait.as_millis() as u64, "feed: reconnect backoff");
        sleep(wait).await;
    }
}

pub struct Subscription {
    rx: broadcast::Receiver<MarketSnapshot>,
    exchange: ExchangeKind,
    asset: String,
    stale_after: Duration,
    missed: u64,
}

impl Subscription {
    /// Next snapshot, skipping any the buffer overwrote. `None` once the feed shut down.
    pub async fn next(&mut self) -> Option<MarketSnapshot> {
        loop {
            match self.rx.recv().await {
                Ok(s) => return Some(s.observed_at(Utc::now(), self.stale_after)),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.missed += n;
                    FEED_DROPPED
                        .with_label_values(&[self.exchange.as_str(), &self.asset])
                        .inc_by(n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Snapshots dropped because this subscriber fell behind.
    pub fn missed(&self) -> u64 {
        self.missed
    }

    pub fn into_stream(self) -> impl Stream<Item = MarketSnapshot> {
        futures_util::stream::unfold(self, |mut sub| async move {
            let item = sub.next().await?;
            Some((item, sub))
        })
    }
}

// ---------------- Mock source ----------------

/// Random-walk quotes around a per-asset starting price.
pub struct MockSource {
    pub tick: Duration,
}

impl Default for MockSource {
    fn default() -> Self {
        Self { tick: Duration::from_millis(500) }
    }
}

fn mock_start_price(asset: &str) -> f64 {
    match asset {
        "BTC" => 60_000.0,
        "ETH" => 3_000.0,
        "SOL" => 150.0,
        "BNB" => 550.0,
        _ => 100.0,
    }
}

#[async_trait]
impl QuoteSource for MockSource {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn run(&self, asset: &str, sink: &QuoteSink) -> Result<(), FeedError> {
        let mut px = mock_start_price(asset);
        loop {
            // jangan simpan ThreadRng melewati .await
            let step: i32 = rand::thread_rng().gen_range(-3..=3);
            px = (px * (1.0 + step as f64 * 0.0002)).max(0.01);
            let half_spread = px * 0.00005;
            sink.publish(Quote {
                last_price: px,
                best_bid: px - half_spread,
                best_ask: px + half_spread,
                ts: Utc::now(),
            });
            sleep(self.tick).await;
        }
    }
}

// ---------------- Manual source ----------------

/// Quotes pushed by the caller, one watch slot per asset. The latest pushed
/// value is replayed when a connection (re)starts.
#[derive(Default)]
pub struct ManualSource {
    slots: Mutex<HashMap<String, watch::Sender<Option<Quote>>>>,
}

impl ManualSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, asset: &str) -> watch::Receiver<Option<Quote>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots
            .entry(asset.trim().to_ascii_uppercase())
            .or_insert_with(|| watch::channel(None).0)
            .subscribe()
    }

    pub fn push(&self, asset: &str, quote: Quote) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = slots
            .entry(asset.trim().to_ascii_uppercase())
            .or_insert_with(|| watch::channel(None).0);
        tx.send_replace(Some(quote));
    }

    /// Convenience: bid/ask around `price`, timestamped now.
    pub fn push_price(&self, asset: &str, price: f64) {
        self.push(asset, Quote::from_book(price * 0.9999, price * 1.0001, Utc::now()));
    }
}

#[async_trait]
impl QuoteSource for ManualSource {
    fn name(&self) -> &'static str {
        "manual"
    }

    async fn run(&self, asset: &str, sink: &QuoteSink) -> Result<(), FeedError> {
        let mut rx = self.slot(asset);
        if let Some(q) = *rx.borrow_and_update() {
            sink.publish(q);
        }
        while rx.changed().await.is_ok() {
            let q = *rx.borrow_and_update();
            if let Some(q) = q {
                sink.publish(q);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use tokio::time::timeout;

    fn feed_with(source: Arc<ManualSource>, buffer: usize) -> MarketFeed {
        MarketFeed::new(FeedSettings {
            stale_after: Duration::from_secs(5),
            buffer,
            backoff: Backoff::feed(),
        })
        .with_source(ExchangeKind::Paper, source)
    }

    #[tokio::test]
    async fn subscribers_share_one_stream_and_see_increasing_seq() {
        let src = Arc::new(ManualSource::new());
        let feed = feed_with(src.clone(), 16);
        let mut a = feed.subscribe(ExchangeKind::Paper, "btc").unwrap();
        let mut b = feed.subscribe(ExchangeKind::Paper, "BTC").unwrap();
        assert_eq!(feed.active_streams(), 1);

        src.push_price("BTC", 100.0);
        let s1 = timeout(Duration::from_secs(1), a.next()).await.unwrap().unwrap();
        let s1b = timeout(Duration::from_secs(1), b.next()).await.unwrap().unwrap();
        assert_eq!(s1.seq, s1b.seq);

        src.push_price("BTC", 101.0);
        let s2 = timeout(Duration::from_secs(1), a.next()).await.unwrap().unwrap();
        assert!(s2.seq > s1.seq);
        assert!((feed.latest(ExchangeKind::Paper, "BTC").unwrap().mid() - 101.0).abs() < 1e-6);
        feed.shutdown();
    }

    #[tokio::test]
    async fn latest_flags_stale_snapshots() {
        let src = Arc::new(ManualSource::new());
        let feed = feed_with(src.clone(), 16);
        assert!(matches!(
            feed.latest(ExchangeKind::Paper, "ETH"),
            Err(FeedError::NotAvailable { .. })
        ));
        let mut sub = feed.subscribe(ExchangeKind::Paper, "ETH").unwrap();
        let old = Utc::now() - chrono::Duration::seconds(60);
        src.push("ETH", Quote::from_book(99.0, 101.0, old));
        let s = timeout(Duration::from_secs(1), sub.next()).await.unwrap().unwrap();
        assert!(s.stale);
        assert!(feed.latest(ExchangeKind::Paper, "ETH").unwrap().stale);
        feed.shutdown();
    }

    #[tokio::test]
    async fn slow_subscriber_drops_oldest_without_blocking_others() {
        let src = Arc::new(ManualSource::new());
        let feed = feed_with(src.clone(), 2);
        let mut slow = feed.subscribe(ExchangeKind::Paper, "SOL").unwrap();
        let mut fast = feed.subscribe(ExchangeKind::Paper, "SOL").unwrap();

        for i in 0..6 {
            src.push_price("SOL", 100.0 + i as f64);
            timeout(Duration::from_secs(1), fast.next()).await.unwrap().unwrap();
        }
        let s = timeout(Duration::from_secs(1), slow.next()).await.unwrap().unwrap();
        assert!(slow.missed() > 0);
        assert!(s.seq > 1);
        feed.shutdown();
    }

    #[tokio::test]
    async fn unknown_exchange_has_no_source() {
        let feed = MarketFeed::new(FeedSettings::default());
        assert!(matches!(
            feed.subscribe(ExchangeKind::Binance, "BTC"),
            Err(FeedError::NoSource(ExchangeKind::Binance))
        ));
    }

    #[tokio::test]
    async fn mock_source_streams_prices() {
        let feed = MarketFeed::new(FeedSettings::default())
            .with_source(ExchangeKind::Paper, Arc::new(MockSource { tick: Duration::from_millis(5) }));
        let stream = feed.subscribe(ExchangeKind::Paper, "BTC").unwrap().into_stream();
        let got: Vec<_> = timeout(Duration::from_secs(2), stream.take(3).collect::<Vec<_>>())
            .await
            .unwrap();
        assert_eq!(got.len(), 3);
        assert!(got.iter().all(|s| s.best_bid < s.best_ask));
        feed.shutdown();
    }
}
