// ===============================
// src/ai_backends.rs
// ===============================
//
// AI providers behind one trait. DeepSeek and Qwen both speak the
// OpenAI-compatible chat-completions dialect:
//   DeepSeek : https://api.deepseek.com/v1/chat/completions
//   Qwen     : https://dashscope.aliyuncs.com/compatible-mode/v1/chat/completions
//
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

use crate::config::{AiConfig, AiProvider, Secret};
use crate::error::AiError;

#[async_trait]
pub trait AiBackend: Send + Sync {
    fn provider(&self) -> AiProvider;

    /// One request/response exchange. No retries here.
    async fn complete(&self, system: &str, user: &str) -> Result<String, AiError>;
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Maps an HTTP status from a chat endpoint into the AI failure classes.
pub fn classify_status(status: u16, body: &str) -> AiError {
    let msg = format!("HTTP {status}: {}", body.chars().take(300).collect::<String>());
    match status {
        400 | 401 | 402 | 403 | 404 => AiError::Fatal(msg),
        408 | 429 | 500..=599 => AiError::Transient(msg),
        _ => AiError::Transient(msg),
    }
}

/// Shared OpenAI-compatible transport.
struct ChatTransport {
    url: String,
    model: String,
    api_key: Secret,
    http: reqwest::Client,
}

impl ChatTransport {
    fn new(cfg: &AiConfig, default_url: &str, default_model: &str, timeout: Duration) -> Result<Self, AiError> {
        if cfg.api_key.is_empty() {
            return Err(AiError::Fatal(format!("{}: api key missing", cfg.provider.as_str())));
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AiError::Fatal(e.to_string()))?;
        Ok(Self {
            url: cfg.base_url.clone().unwrap_or_else(|| default_url.to_string()),
            model: cfg.model.clone().unwrap_or_else(|| default_model.to_string()),
            api_key: cfg.api_key.clone(),
            http,
        })
    }

    async fn chat(&self, system: &str, user: &str) -> Result<String, AiError> {
        let body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
            "temperature": 0.5,
            "max_tokens": 2000,
        });
        let rsp = self
            .http
            .post(&self.url)
            .bearer_auth(self.api_key.expose())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_builder() {
                    AiError::Fatal(e.to_string())
                } else {
                    AiError::Transient(e.to_string())
                }
            })?;
        let status = rsp.status().as_u16();
        let text = rsp.text().await.map_err(|e| AiError::Transient(e.to_string()))?;
        if status != 200 {
            return Err(classify_status(status, &text));
        }
        let parsed: ChatResponse =
            serde_json::from_str(&text).map_err(|e| AiError::Transient(format!("bad chat response: {e}")))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        if content.trim().is_empty() {
            return Err(AiError::Transient("empty completion".into()));
        }
        debug!(model = %self.model, chars = content.len(), "chat completion received");
        Ok(content)
    }
}

pub struct DeepSeekBackend(ChatTransport);

impl DeepSeekBackend {
    pub fn new(cfg: &AiConfig, timeout: Duration) -> Result<Self, AiError> {
        ChatTransport::new(cfg, "https://api.deepseek.com/v1/chat/completions", "deepseek-chat", timeout).map(Self)
    }
}

#[async_trait]
impl AiBackend for DeepSeekBackend {
    fn provider(&self) -> AiProvider {
        AiProvider::DeepSeek
    }

    async fn complete(&self, system: &str, user: &str) -> Result<String, AiError> {
        self.0.chat(system, user).await
    }
}

pub struct QwenBackend(ChatTransport);

impl QwenBackend {
    pub fn new(cfg: &AiConfig, timeout: Duration) -> Result<Self, AiError> {
        ChatTransport::new(
            cfg,
            "https://dashscope.aliyuncs.com/compatible-mode/v1/chat/completions",
            "qwen-plus",
            timeout,
        )
        .map(Self)
    }
}

#[async_trait]
impl AiBackend for QwenBackend {
    fn provider(&self) -> AiProvider {
        AiProvider::Qwen
    }

    async fn complete(&self, system: &str, user: &str) -> Result<String, AiError> {
        self.0.chat(system, user).await
    }
}

/// Deterministic stand-in for mock mode: opens a small protected long on the
/// first quoted asset every sixth call, closes it three calls later and holds
/// otherwise.
#[derive(Default)]
pub struct MockBackend {
    calls: AtomicU64,
}

fn first_quote(user: &str) -> Option<(String, f64)> {
    user.lines().find_map(|line| {
        let line = line.trim().trim_start_matches("- ");
        let (asset, rest) = line.split_once(' ')?;
        let mid = rest.split_whitespace().find_map(|kv| kv.strip_prefix("mid="))?;
        Some((asset.to_string(), mid.parse().ok()?))
    })
}

#[async_trait]
impl AiBackend for MockBackend {
    fn provider(&self) -> AiProvider {
        AiProvider::Mock
    }

    async fn complete(&self, _system: &str, user: &str) -> Result<String, AiError> {
        let n = self.calls.fetch_add(1, Ordering::Relaxed);
        let Some((asset, mid)) = first_quote(user) else {
            return Ok(r#"{"action":"hold","reasoning":"no market data"}"#.to_string());
        };
        let reply = match n % 6 {
            0 => json!({
                "action": "open_long",
                "symbol": asset,
                "position_size_usd": 500.0,
                "leverage": 3,
                "stop_loss": mid * 0.99,
                "take_profit": mid * 1.025,
                "confidence": 60,
                "reasoning": "mock: momentum entry",
            }),
            3 => json!({ "action": "close_long", "symbol": asset, "reasoning": "mock: take the move" }),
            _ => json!({ "action": "hold", "reasoning": "mock: waiting" }),
        };
        Ok(format!("Mock analysis of {asset} at {mid:.2}.\n```json\n{reply}\n```"))
    }
}

/// Replies from a queue; `hold` once the script runs out. For tests and replays.
pub struct ScriptedBackend {
    provider: AiProvider,
    script: Mutex<VecDeque<Result<String, AiError>>>,
    calls: AtomicU64,
}

impl ScriptedBackend {
    pub fn new(replies: impl IntoIterator<Item = Result<String, AiError>>) -> Self {
        Self {
            provider: AiProvider::Mock,
            script: Mutex::new(replies.into_iter().collect()),
            calls: AtomicU64::new(0),
        }
    }

    pub fn push(&self, reply: Result<String, AiError>) {
        self.script.lock().unwrap_or_else(PoisonError::into_inner).push_back(reply);
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AiBackend for ScriptedBackend {
    fn provider(&self) -> AiProvider {
        self.provider
    }

    async fn complete(&self, _system: &str, _user: &str) -> Result<String, AiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| Ok(r#"{"action":"hold","reasoning":"script exhausted"}"#.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classes() {
        assert!(matches!(classify_status(401, "bad key"), AiError::Fatal(_)));
        assert!(matches!(classify_status(400, "bad model"), AiError::Fatal(_)));
        assert!(matches!(classify_status(429, ""), AiError::Transient(_)));
        assert!(matches!(classify_status(503, ""), AiError::Transient(_)));
    }

    #[test]
    fn missing_key_is_fatal() {
        let cfg = AiConfig { provider: AiProvider::DeepSeek, model: None, api_key: Secret::default(), base_url: None };
        assert!(matches!(DeepSeekBackend::new(&cfg, Duration::from_secs(5)), Err(AiError::Fatal(_))));
    }

    #[tokio::test]
    async fn mock_backend_cycles_through_open_hold_close() {
        let m = MockBackend::default();
        let user = "Market:\n- BTC mid=60000.00 bid=59999.00 ask=60001.00 age=1s\n";
        let first = m.complete("", user).await.unwrap();
        assert!(first.contains("open_long"));
        assert!(m.complete("", user).await.unwrap().contains("hold"));
        m.complete("", user).await.unwrap();
        assert!(m.complete("", user).await.unwrap().contains("close_long"));
        assert!(m.complete("", "nothing here").await.unwrap().contains("hold"));
    }

    #[tokio::test]
    async fn scripted_backend_replays_then_holds() {
        let s = ScriptedBackend::new([Err(AiError::Transient("t/o".into())), Ok("{}".into())]);
        assert!(s.complete("", "").await.is_err());
        assert_eq!(s.complete("", "").await.unwrap(), "{}");
        assert!(s.complete("", "").await.unwrap().contains("hold"));
        assert_eq!(s.calls(), 3);
    }
}
