// ===============================
// src/error.rs
// ===============================
//
// Failure taxonomy shared by the feed, exchange, AI and manager layers.
// Upstream logic only looks at `FailureClass`, never at venue-specific shapes.
//
use std::time::Duration;
use thiserror::Error;

use crate::domain::{ExchangeKind, TraderId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Timeouts, 5xx, rate limiting. Retried locally with backoff.
    Transient,
    /// Risk rejection or malformed AI reply. Logged, cycle skipped.
    Validation,
    /// Venue declined the order on business grounds.
    RejectedByVenue,
    /// Order outcome unknown; reconcile against the venue next cycle.
    PartialFailure,
    /// Bad credentials or unrecoverable request/config error.
    Fatal,
}

#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    #[error("transient exchange failure: {0}")]
    Transient(String),

    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("fatal exchange failure: {0}")]
    Fatal(String),

    #[error("order rejected by venue: {0}")]
    Rejected(String),

    #[error("order outcome unknown: {0}")]
    Ambiguous(String),

    #[error("order key {0} already submitted")]
    Duplicate(String),
}

impl ExchangeError {
    pub fn class(&self) -> FailureClass {
        match self {
            ExchangeError::Transient(_) | ExchangeError::RateLimited { .. } => FailureClass::Transient,
            ExchangeError::Fatal(_) => FailureClass::Fatal,
            ExchangeError::Rejected(_) => FailureClass::RejectedByVenue,
            ExchangeError::Ambiguous(_) | ExchangeError::Duplicate(_) => FailureClass::PartialFailure,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == FailureClass::Transient
    }

    /// Server-provided wait hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ExchangeError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Maps a transport error for a read-only call.
    pub fn from_transport(e: &reqwest::Error) -> ExchangeError {
        if e.is_builder() {
            ExchangeError::Fatal(e.to_string())
        } else {
            ExchangeError::Transient(e.to_string())
        }
    }

    /// Maps a transport error for an order submission: once the request may
    /// have left the process, the outcome is unknown rather than failed.
    pub fn from_order_transport(e: &reqwest::Error) -> ExchangeError {
        if e.is_connect() || e.is_builder() {
            Self::from_transport(e)
        } else {
            ExchangeError::Ambiguous(e.to_string())
        }
    }

    /// Generic HTTP status mapping; venue adapters refine the 4xx range.
    pub fn from_status(status: u16, body: &str, retry_after: Option<Duration>) -> ExchangeError {
        match status {
            429 | 418 => ExchangeError::RateLimited { retry_after },
            401 | 403 => ExchangeError::Fatal(format!("HTTP {status}: {body}")),
            500..=599 => ExchangeError::Transient(format!("HTTP {status}: {body}")),
            _ => ExchangeError::Fatal(format!("HTTP {status}: {body}")),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum AiError {
    #[error("transient AI failure: {0}")]
    Transient(String),

    #[error("invalid AI decision: {0}")]
    Validation(String),

    #[error("fatal AI failure: {0}")]
    Fatal(String),
}

impl AiError {
    pub fn class(&self) -> FailureClass {
        match self {
            AiError::Transient(_) => FailureClass::Transient,
            AiError::Validation(_) => FailureClass::Validation,
            AiError::Fatal(_) => FailureClass::Fatal,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, AiError::Transient(_))
    }
}

#[derive(Debug, Clone, Error)]
pub enum FeedError {
    #[error("no market data for {exchange}/{asset}")]
    NotAvailable { exchange: ExchangeKind, asset: String },

    #[error("no quote source registered for {0}")]
    NoSource(ExchangeKind),

    #[error("feed connection failed: {0}")]
    Connect(String),

    #[error("feed protocol error: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LedgerError {
    #[error("global margin ceiling reached: requested {requested:.2}, headroom {headroom:.2}")]
    Capacity { requested: f64, headroom: f64 },

    #[error("trader {trader} budget exhausted: requested {requested:.2}, remaining {remaining:.2}")]
    TraderBudget {
        trader: TraderId,
        requested: f64,
        remaining: f64,
    },

    #[error("trader {0} holds no ledger allocation")]
    UnknownTrader(TraderId),

    #[error("trader {0} already admitted")]
    AlreadyAdmitted(TraderId),
}

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("trader {0} not found")]
    NotFound(TraderId),

    #[error("insufficient margin capacity: {0}")]
    Capacity(LedgerError),

    #[error("trader {id} cannot {op} while {state}")]
    InvalidState {
        id: TraderId,
        op: &'static str,
        state: &'static str,
    },

    #[error("invalid trader config: {0}")]
    InvalidConfig(String),

    #[error("failed to build trader dependencies: {0}")]
    Build(String),

    #[error("trader {0} already exists")]
    Duplicate(TraderId),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("config store io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config store parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("trader config {0} not found")]
    NotFound(String),
}
