// ===============================
// src/lib.rs
// ===============================
pub mod domain;
pub mod error;
pub mod retry;
pub mod config;
pub mod metrics;

pub mod ledger;
pub mod pnl;
pub mod risk;

pub mod feed;
pub mod feed_binance;      // Binance / Aster bookTicker stream
pub mod feed_hyperliquid;  // Hyperliquid l2Book stream

pub mod exchange;
pub mod binance;           // signer/types Binance-style futures API
pub mod gateway_binance;   // Binance + Aster USDT-M futures
pub mod gateway_hyperliquid;
pub mod gateway;           // paper venue

pub mod ai;
pub mod ai_backends;
pub mod ai_parse;
pub mod ai_prompt;

pub mod agent;
pub mod manager;
pub mod recorder;
pub mod store;
