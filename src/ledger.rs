// ===============================
// src/ledger.rs
// ===============================
//
// Process-wide margin ledger. Every read-then-reserve happens under one lock,
// so concurrent starts or order approvals can never jointly overshoot the
// ceiling.
//
// Invariant: sum(budget) <= ceiling_pct * total_equity, used <= budget per trader.
//
use ahash::AHashMap as HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

use crate::config::MAX_MARGIN_USAGE;
use crate::domain::TraderId;
use crate::error::LedgerError;
use crate::metrics::{LEDGER_ALLOCATED, LEDGER_CEILING};

const EPS: f64 = 1e-9;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Allocation {
    /// Reserved at admission; the trader's maximum footprint.
    pub budget: f64,
    /// Margin currently committed by orders and open positions.
    pub used: f64,
}

impl Allocation {
    pub fn remaining(&self) -> f64 {
        (self.budget - self.used).max(0.0)
    }
}

/// Read-only copy handed to the risk validator.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LedgerView {
    pub total_equity: f64,
    pub ceiling: f64,
    pub allocated: f64,
    pub trader: Option<Allocation>,
}

impl LedgerView {
    pub fn trader_used(&self) -> f64 {
        self.trader.map(|a| a.used).unwrap_or(0.0)
    }

    pub fn trader_remaining(&self) -> f64 {
        self.trader.map(|a| a.remaining()).unwrap_or(0.0)
    }
}

#[derive(Debug)]
struct Inner {
    total_equity: f64,
    ceiling_pct: f64,
    entries: HashMap<TraderId, Allocation>,
}

impl Inner {
    fn ceiling(&self) -> f64 {
        self.total_equity * self.ceiling_pct
    }

    fn allocated(&self) -> f64 {
        self.entries.values().map(|a| a.budget).sum()
    }

    fn publish(&self) {
        LEDGER_ALLOCATED.set(self.allocated());
        LEDGER_CEILING.set(self.ceiling());
    }
}

#[derive(Debug)]
pub struct MarginLedger {
    inner: Mutex<Inner>,
}

impl MarginLedger {
    /// `ceiling_pct` above 0.90 is clamped to 0.90.
    pub fn new(total_equity: f64, ceiling_pct: f64) -> Self {
        let inner = Inner {
            total_equity: total_equity.max(0.0),
            ceiling_pct: ceiling_pct.clamp(0.0, MAX_MARGIN_USAGE),
            entries: HashMap::new(),
        };
        inner.publish();
        info!(total_equity = inner.total_equity, ceiling = inner.ceiling(), "margin ledger initialised");
        Self { inner: Mutex::new(inner) }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock cannot leave a half-applied update:
        // every mutation below is a single assignment after its checks.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admission control: reserve a trader's footprint against the global ceiling.
    pub fn admit(&self, trader: &str, budget: f64) -> Result<(), LedgerError> {
        let mut g = self.lock();
        if g.entries.contains_key(trader) {
            return Err(LedgerError::AlreadyAdmitted(trader.to_string()));
        }
        let headroom = (g.ceiling() - g.allocated()).max(0.0);
        if budget > headroom + EPS {
            return Err(LedgerError::Capacity { requested: budget, headroom });
        }
        g.entries.insert(
            trader.to_string(),
            Allocation { budget: budget.max(0.0), used: 0.0 },
        );
        g.publish();
        debug!(%trader, budget, headroom, "ledger admit");
        Ok(())
    }

    /// Order-time re-check: `used + margin` must fit the trader's budget and
    /// `cap` (the 90 % of account equity bound computed by the caller).
    pub fn commit(&self, trader: &str, margin: f64, cap: f64) -> Result<(), LedgerError> {
        let mut g = self.lock();
        let entry = g
            .entries
            .get_mut(trader)
            .ok_or_else(|| LedgerError::UnknownTrader(trader.to_string()))?;
        let limit = entry.budget.min(cap);
        if entry.used + margin > limit + EPS {
            return Err(LedgerError::TraderBudget {
                trader: trader.to_string(),
                requested: margin,
                remaining: (limit - entry.used).max(0.0),
            });
        }
        entry.used += margin;
        debug!(%trader, margin, used = entry.used, "ledger commit");
        Ok(())
    }

    /// Returns margin from an order that did not execute.
    pub fn uncommit(&self, trader: &str, margin: f64) {
        let mut g = self.lock();
        if let Some(entry) = g.entries.get_mut(trader) {
            entry.used = (entry.used - margin).max(0.0);
        }
    }

    /// Aligns `used` with margin observed on the venue (plus anything still
    /// in flight). Closed positions release their margin here.
    pub fn sync_used(&self, trader: &str, used: f64) {
        let mut g = self.lock();
        if let Some(entry) = g.entries.get_mut(trader) {
            entry.used = used.clamp(0.0, entry.budget);
        }
    }

    pub fn release(&self, trader: &str) -> Option<Allocation> {
        let mut g = self.lock();
        let out = g.entries.remove(trader);
        g.publish();
        if let Some(a) = out {
            info!(%trader, budget = a.budget, "ledger release");
        }
        out
    }

    pub fn view(&self, trader: &str) -> LedgerView {
        let g = self.lock();
        LedgerView {
            total_equity: g.total_equity,
            ceiling: g.ceiling(),
            allocated: g.allocated(),
            trader: g.entries.get(trader).copied(),
        }
    }

    pub fn allocation(&self, trader: &str) -> Option<Allocation> {
        self.lock().entries.get(trader).copied()
    }

    pub fn total_allocated(&self) -> f64 {
        self.lock().allocated()
    }

    pub fn ceiling(&self) -> f64 {
        self.lock().ceiling()
    }

    pub fn headroom(&self) -> f64 {
        let g = self.lock();
        (g.ceiling() - g.allocated()).max(0.0)
    }

    /// New equity basis for future admissions; existing budgets stay as admitted.
    pub fn set_total_equity(&self, total_equity: f64) {
        let mut g = self.lock();
        g.total_equity = total_equity.max(0.0);
        g.publish();
    }

    /// Teardown at manager shutdown.
    pub fn clear(&self) {
        let mut g = self.lock();
        g.entries.clear();
        g.publish();
        info!("margin ledger cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn admit_respects_global_ceiling() {
        let ledger = MarginLedger::new(10_000.0, 0.90);
        ledger.admit("a", 5_000.0).unwrap();
        let err = ledger.admit("b", 4_500.0).unwrap_err();
        assert!(matches!(err, LedgerError::Capacity { .. }));
        ledger.admit("b", 4_000.0).unwrap();
        assert!((ledger.total_allocated() - 9_000.0).abs() < 1e-9);
        assert_eq!(ledger.headroom(), 0.0);
    }

    #[test]
    fn ceiling_is_clamped_to_ninety_percent() {
        let ledger = MarginLedger::new(1_000.0, 1.5);
        assert!((ledger.ceiling() - 900.0).abs() < 1e-9);
    }

    #[test]
    fn commit_rechecks_budget_and_equity_cap() {
        let ledger = MarginLedger::new(10_000.0, 0.90);
        ledger.admit("a", 1_000.0).unwrap();
        ledger.commit("a", 600.0, 10_000.0).unwrap();
        assert!(ledger.commit("a", 500.0, 10_000.0).is_err());
        // equity cap tighter than the budget
        assert!(ledger.commit("a", 100.0, 650.0).is_err());
        ledger.uncommit("a", 600.0);
        assert_eq!(ledger.allocation("a").unwrap().used, 0.0);
        assert!(matches!(
            ledger.commit("zz", 1.0, 1.0),
            Err(LedgerError::UnknownTrader(_))
        ));
    }

    #[test]
    fn release_frees_headroom() {
        let ledger = MarginLedger::new(1_000.0, 0.9);
        ledger.admit("a", 900.0).unwrap();
        assert!(ledger.admit("b", 1.0).is_err());
        ledger.release("a");
        ledger.admit("b", 900.0).unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_admissions_never_overshoot() {
        let ledger = Arc::new(MarginLedger::new(10_000.0, 0.90));
        let mut handles = Vec::new();
        for i in 0..64 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger.admit(&format!("t{i}"), 700.0).is_ok()
            }));
        }
        let mut admitted = 0;
        for h in handles {
            if h.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 12);
        assert!(ledger.total_allocated() <= 9_000.0 + 1e-9);
    }
}
