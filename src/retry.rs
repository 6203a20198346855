// ===============================
// src/retry.rs
// ===============================
//
// Exponential backoff + jitter, tuned per failure class:
// - feed reconnects : 0.5s .. 32s, retries forever
// - AI calls        : 1s .. 8s, bounded by config
// - exchange calls  : 0.2s .. 2s, small bound inside one cycle
//
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

use crate::error::{AiError, ExchangeError};

/// Errors that know whether another attempt can help.
pub trait Retryable {
    fn is_transient(&self) -> bool;

    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl Retryable for ExchangeError {
    fn is_transient(&self) -> bool {
        ExchangeError::is_transient(self)
    }

    fn retry_after(&self) -> Option<Duration> {
        ExchangeError::retry_after(self)
    }
}

impl Retryable for AiError {
    fn is_transient(&self) -> bool {
        AiError::is_transient(self)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
    pub jitter: Duration,
    pub max_retries: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, jitter: Duration, max_retries: u32) -> Self {
        Self { base, cap, jitter, max_retries }
    }

    pub fn feed() -> Self {
        Self::new(
            Duration::from_millis(500),
            Duration::from_secs(32),
            Duration::from_millis(250),
            u32::MAX,
        )
    }

    pub fn ai(max_retries: u32) -> Self {
        Self::new(
            Duration::from_secs(1),
            Duration::from_secs(8),
            Duration::from_millis(250),
            max_retries,
        )
    }

    pub fn exchange() -> Self {
        Self::new(
            Duration::from_millis(200),
            Duration::from_secs(2),
            Duration::from_millis(100),
            2,
        )
    }

    /// Delay before retry number `attempt` (0-based): base * 2^attempt, capped, plus jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.min(16);
        let base_ms = self.base.as_millis() as u64;
        let cap_ms = self.cap.as_millis() as u64;
        let ms = base_ms.saturating_mul(factor).min(cap_ms);
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        Duration::from_millis(ms + jitter)
    }

    /// Runs `op` until it succeeds, fails with a non-transient error, or the
    /// retry budget is spent. `op` receives the 0-based attempt number.
    pub async fn run<T, E, F, Fut>(&self, what: &str, mut op: F) -> Result<T, E>
    where
        E: Retryable + std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op(attempt).await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    let wait = e
                        .retry_after()
                        .map(|hint| hint.min(self.cap.saturating_mul(4)))
                        .unwrap_or_else(|| self.delay(attempt));
                    warn!(%what, attempt, error = %e, wait_ms = wait.as_millis() as u64, "transient failure, retrying");
                    sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
