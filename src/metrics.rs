// ===============================
// src/metrics.rs
// ===============================
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::convert::Infallible;
use std::net::SocketAddr;
use tracing::{error, info};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Market feed --------
pub static FEED_UPDATES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("feed_updates_total", "market snapshots published"),
        &["exchange", "asset"],
    )
    .unwrap()
});

pub static FEED_RECONNECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("feed_reconnects_total", "market stream reconnect attempts"),
        &["exchange", "asset"],
    )
    .unwrap()
});

pub static FEED_CONNECTED: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("feed_connected", "1 if the market stream is connected, 0 otherwise"),
        &["exchange", "asset"],
    )
    .unwrap()
});

pub static FEED_STALE_READS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("feed_stale_reads_total", "latest() reads that returned a stale snapshot"),
        &["exchange", "asset"],
    )
    .unwrap()
});

pub static FEED_DROPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("feed_dropped_total", "snapshots dropped for slow subscribers"),
        &["exchange", "asset"],
    )
    .unwrap()
});

// -------- AI --------
pub static AI_CALLS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("ai_calls_total", "AI backend calls (labels: provider, outcome)"),
        &["provider", "outcome"],
    )
    .unwrap()
});

// Latency of one AI call attempt (seconds)
pub static AI_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(
        HistogramOpts::new("ai_call_seconds", "Latency of one AI call attempt (s)")
            .buckets(vec![0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 40.0, 80.0]),
    )
    .unwrap()
});

// -------- Agent cycles / risk / orders --------
pub static CYCLES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("trader_cycles_total", "agent cycles by outcome"),
        &["trader", "outcome"],
    )
    .unwrap()
});

pub static VERDICTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("risk_verdicts_total", "risk validator verdicts"),
        &["verdict"],
    )
    .unwrap()
});

pub static ORDERS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("orders_total", "order submissions (labels: exchange, status)"),
        &["exchange", "status"],
    )
    .unwrap()
});

pub static TRADER_STATE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("trader_state", "1 for the current lifecycle state of each trader"),
        &["trader", "state"],
    )
    .unwrap()
});

pub static TRADER_EQUITY: Lazy<prometheus::GaugeVec> = Lazy::new(|| {
    prometheus::GaugeVec::new(
        Opts::new("trader_equity_usd", "last observed account equity"),
        &["trader"],
    )
    .unwrap()
});

// -------- Margin ledger --------
pub static LEDGER_ALLOCATED: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("ledger_allocated_usd", "sum of admitted trader budgets").unwrap());

pub static LEDGER_CEILING: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("ledger_ceiling_usd", "global margin ceiling").unwrap());

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(FEED_UPDATES.clone())),
        REGISTRY.register(Box::new(FEED_RECONNECTS.clone())),
        REGISTRY.register(Box::new(FEED_CONNECTED.clone())),
        REGISTRY.register(Box::new(FEED_STALE_READS.clone())),
        REGISTRY.register(Box::new(FEED_DROPPED.clone())),
        REGISTRY.register(Box::new(AI_CALLS.clone())),
        REGISTRY.register(Box::new(AI_LATENCY.clone())),
        REGISTRY.register(Box::new(CYCLES.clone())),
        REGISTRY.register(Box::new(VERDICTS.clone())),
        REGISTRY.register(Box::new(ORDERS.clone())),
        REGISTRY.register(Box::new(TRADER_STATE.clone())),
        REGISTRY.register(Box::new(TRADER_EQUITY.clone())),
        REGISTRY.register(Box::new(LEDGER_ALLOCATED.clone())),
        REGISTRY.register(Box::new(LEDGER_CEILING.clone())),
    ] {
        let _ = m;
    }
}

/// Sets the one-hot state gauge for a trader.
pub fn set_trader_state(trader: &str, state: &str) {
    for s in ["idle", "running", "paused", "stopped", "error"] {
        TRADER_STATE
            .with_label_values(&[trader, s])
            .set(i64::from(s == state));
    }
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

async fn handle(req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let rsp = match (req.method(), req.uri().path()) {
        (&Method::GET, "/") | (&Method::GET, "/metrics") => Response::builder()
            .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
            .body(Body::from(encode_metrics())),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::from("not found\n")),
    };
    Ok(rsp.unwrap_or_else(|_| Response::new(Body::empty())))
}

/// Serves GET / and /metrics until the process exits.
pub async fn serve_metrics(port: u16) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let make_svc = make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(handle)) });
    match Server::try_bind(&addr) {
        Ok(builder) => {
            info!(%addr, "metrics listening (/metrics)");
            if let Err(e) = builder.serve(make_svc).await {
                error!(?e, "metrics server stopped");
            }
        }
        Err(e) => error!(?e, %addr, "metrics bind failed"),
    }
}
