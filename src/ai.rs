// ===============================
// src/ai.rs (AI decision client)
// ===============================
//
// decide(context) -> Decision
//   render prompt -> [permit + timeout + backend call + parse] x retries
// Permits come from one semaphore per provider shared by every trader, and
// are held for exactly one attempt (never across the backoff sleep).
//
use ahash::AHashMap;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::ai_backends::{AiBackend, DeepSeekBackend, MockBackend, QwenBackend};
use crate::ai_parse::parse_decision;
use crate::ai_prompt::{system_prompt, user_prompt};
use crate::config::{AiConfig, AiProvider, TraderConfig};
use crate::domain::{AccountState, Decision, DecisionRecord, MarketSnapshot, TraderId};
use crate::error::AiError;
use crate::metrics::{AI_CALLS, AI_LATENCY};
use crate::retry::Backoff;

/// Everything the AI sees for one cycle.
#[derive(Debug, Clone)]
pub struct DecisionContext {
    pub trader_id: TraderId,
    pub snapshots: Vec<MarketSnapshot>,
    pub account: AccountState,
    /// Oldest first.
    pub history: Vec<DecisionRecord>,
    pub now: DateTime<Utc>,
}

impl DecisionContext {
    pub fn snapshot(&self, asset: &str) -> Option<&MarketSnapshot> {
        self.snapshots.iter().find(|s| s.asset.eq_ignore_ascii_case(asset))
    }
}

/// Process-wide limiter registry, one semaphore per provider.
pub struct AiLimiters {
    per_provider: usize,
    inner: Mutex<AHashMap<AiProvider, Arc<Semaphore>>>,
}

impl AiLimiters {
    pub fn new(per_provider: usize) -> Self {
        Self {
            per_provider: per_provider.max(1),
            inner: Mutex::new(AHashMap::new()),
        }
    }

    pub fn for_provider(&self, provider: AiProvider) -> Arc<Semaphore> {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        map.entry(provider)
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_provider)))
            .clone()
    }

    pub fn available(&self, provider: AiProvider) -> usize {
        self.for_provider(provider).available_permits()
    }
}

/// Builds the backend a trader's AI config asks for.
pub fn build_backend(cfg: &AiConfig, timeout: Duration) -> Result<Arc<dyn AiBackend>, AiError> {
    Ok(match cfg.provider {
        AiProvider::DeepSeek => Arc::new(DeepSeekBackend::new(cfg, timeout)?),
        AiProvider::Qwen => Arc::new(QwenBackend::new(cfg, timeout)?),
        AiProvider::Mock => Arc::new(MockBackend::default()),
    })
}

pub struct DecisionClient {
    backend: Arc<dyn AiBackend>,
    limiter: Arc<Semaphore>,
    system: String,
    timeout: Duration,
    backoff: Backoff,
}

impl DecisionClient {
    pub fn new(
        backend: Arc<dyn AiBackend>,
        limiters: &AiLimiters,
        cfg: &TraderConfig,
        timeout: Duration,
        max_retries: u32,
    ) -> Self {
        let limiter = limiters.for_provider(backend.provider());
        Self {
            backend,
            limiter,
            system: system_prompt(cfg),
            timeout,
            backoff: Backoff::ai(max_retries),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn provider(&self) -> AiProvider {
        self.backend.provider()
    }

    /// One decision for this cycle. Transient failures (including replies
    /// without JSON) are retried; anything else is returned as is.
    pub async fn decide(&self, ctx: &DecisionContext) -> Result<Decision, AiError> {
        let user = user_prompt(ctx);
        self.backoff
            .run("ai decide", |attempt| {
                let user = user.as_str();
                async move { self.attempt(user, ctx, attempt).await }
            })
            .await
    }

    async fn attempt(&self, user: &str, ctx: &DecisionContext, attempt: u32) -> Result<Decision, AiError> {
        let provider = self.backend.provider().as_str();
        let reply = {
            let _permit = self
                .limiter
                .acquire()
                .await
                .map_err(|_| AiError::Fatal("AI limiter closed".into()))?;
            let started = Instant::now();
            let res = tokio::time::timeout(self.timeout, self.backend.complete(&self.system, user)).await;
            AI_LATENCY.observe(started.elapsed().as_secs_f64());
            match res {
                Ok(r) => r,
                Err(_) => Err(AiError::Transient(format!("no reply within {:?}", self.timeout))),
            }
        };

        let result = reply.and_then(|text| parse_decision(&text, ctx));
        let outcome = match &result {
            Ok(_) => "ok",
            Err(AiError::Transient(_)) => "transient",
            Err(AiError::Validation(_)) => "invalid",
            Err(AiError::Fatal(_)) => "fatal",
        };
        AI_CALLS.with_label_values(&[provider, outcome]).inc();
        match &result {
            Ok(d) => debug!(trader = %ctx.trader_id, attempt, action = d.action.as_str(), asset = %d.asset, "ai decision"),
            Err(e) => warn!(trader = %ctx.trader_id, attempt, provider, error = %e, "ai attempt failed"),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai_backends::ScriptedBackend;
    use crate::config::{RiskLimits, ScheduleTrigger, Secret};
    use crate::domain::{Action, ExchangeKind};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cfg() -> TraderConfig {
        TraderConfig {
            id: Some("t1".into()),
            name: "alpha".into(),
            exchange: ExchangeKind::Paper,
            ai: AiConfig { provider: AiProvider::Mock, model: None, api_key: Secret::default(), base_url: None },
            assets: vec!["BTC".into()],
            initial_balance: 10_000.0,
            trigger: ScheduleTrigger::default(),
            limits: RiskLimits::default(),
            credentials: Default::default(),
            history_len: 5,
            prompt_template: None,
        }
    }

    fn ctx() -> DecisionContext {
        let now = Utc::now();
        DecisionContext {
            trader_id: "t1".into(),
            snapshots: vec![MarketSnapshot {
                exchange: ExchangeKind::Paper,
                asset: "BTC".into(),
                last_price: 100.0,
                best_bid: 99.0,
                best_ask: 101.0,
                ts: now,
                seq: 1,
                stale: false,
            }],
            account: AccountState {
                exchange: ExchangeKind::Paper,
                equity: 10_000.0,
                available_margin: 10_000.0,
                positions: vec![],
                ts: now,
            },
            history: vec![],
            now,
        }
    }

    fn fast() -> Backoff {
        Backoff::new(Duration::from_millis(1), Duration::from_millis(2), Duration::ZERO, 2)
    }

    #[tokio::test]
    async fn retries_transient_then_parses() {
        let backend = Arc::new(ScriptedBackend::new([
            Err(AiError::Transient("503".into())),
            Ok("thinking only, no json".into()),
            Ok(r#"{"action":"hold","reasoning":"flat market"}"#.into()),
        ]));
        let limiters = AiLimiters::new(1);
        let client = DecisionClient::new(backend.clone(), &limiters, &cfg(), Duration::from_secs(1), 2)
            .with_backoff(fast());
        let d = client.decide(&ctx()).await.unwrap();
        assert_eq!(d.action, Action::Hold);
        assert_eq!(backend.calls(), 3);
        assert_eq!(limiters.available(AiProvider::Mock), 1);
    }

    #[tokio::test]
    async fn validation_is_not_retried() {
        let backend = Arc::new(ScriptedBackend::new([Ok(r#"{"action":"open_long","symbol":"BTC"}"#.into())]));
        let client = DecisionClient::new(backend.clone(), &AiLimiters::new(1), &cfg(), Duration::from_secs(1), 3)
            .with_backoff(fast());
        assert!(matches!(client.decide(&ctx()).await, Err(AiError::Validation(_))));
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_yield_error() {
        let backend = Arc::new(ScriptedBackend::new((0..5).map(|_| Err(AiError::Transient("429".into())))));
        let client = DecisionClient::new(backend.clone(), &AiLimiters::new(1), &cfg(), Duration::from_secs(1), 2)
            .with_backoff(fast());
        assert!(client.decide(&ctx()).await.is_err());
        assert_eq!(backend.calls(), 3);
    }

    struct Slow;

    #[async_trait]
    impl AiBackend for Slow {
        fn provider(&self) -> AiProvider {
            AiProvider::Qwen
        }

        async fn complete(&self, _s: &str, _u: &str) -> Result<String, AiError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok("{}".into())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_counts_as_transient() {
        let client = DecisionClient::new(Arc::new(Slow), &AiLimiters::new(1), &cfg(), Duration::from_millis(50), 0);
        assert!(matches!(client.decide(&ctx()).await, Err(AiError::Transient(_))));
    }

    struct Gauge {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl AiBackend for Gauge {
        fn provider(&self) -> AiProvider {
            AiProvider::DeepSeek
        }

        async fn complete(&self, _s: &str, _u: &str) -> Result<String, AiError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(r#"{"action":"hold"}"#.into())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn provider_limiter_caps_concurrency_across_traders() {
        let backend = Arc::new(Gauge { current: AtomicUsize::new(0), peak: AtomicUsize::new(0) });
        let limiters = AiLimiters::new(2);
        let mut tasks = Vec::new();
        for _ in 0..6 {
            let client = DecisionClient::new(backend.clone(), &limiters, &cfg(), Duration::from_secs(5), 0);
            tasks.push(tokio::spawn(async move { client.decide(&ctx()).await }));
        }
        for t in tasks {
            assert!(t.await.unwrap().is_ok());
        }
        assert!(backend.peak.load(Ordering::SeqCst) <= 2);
    }
}
