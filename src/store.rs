// ===============================
// src/store.rs (trader config store)
// ===============================
//
// The core only needs `load_config(id)` and `list()`; storage is a JSON
// document holding an array of TraderConfig. Traders without an `id` get
// a stable one derived from their name.
//
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::TraderConfig;
use crate::error::StoreError;

#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn load_config(&self, id: &str) -> Result<TraderConfig, StoreError>;
    async fn list(&self) -> Result<Vec<TraderConfig>, StoreError>;
}

/// "Alpha Bot #1" -> "alpha-bot-1"
pub fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
        } else if !out.ends_with('-') && !out.is_empty() {
            out.push('-');
        }
    }
    out.trim_end_matches('-').to_string()
}

pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ConfigStore for JsonFileStore {
    async fn load_config(&self, id: &str) -> Result<TraderConfig, StoreError> {
        self.list()
            .await?
            .into_iter()
            .find(|c| c.id.as_deref() == Some(id))
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn list(&self) -> Result<Vec<TraderConfig>, StoreError> {
        let text = tokio::fs::read_to_string(&self.path).await?;
        let mut traders: Vec<TraderConfig> = serde_json::from_str(&text)?;
        for t in traders.iter_mut() {
            if t.id.as_deref().map_or(true, |s| s.trim().is_empty()) {
                t.id = Some(slug(&t.name));
            }
        }
        info!(path = %self.path.display(), traders = traders.len(), "trader configs loaded");
        Ok(traders)
    }
}
