// ===============================
// src/pnl.rs (daily PnL & drawdown tracker)
// ===============================
//
// Feeds risk check 5. Realized PnL for the day is the change in wallet
// balance (equity minus open-position PnL) since the first observation of
// the UTC trading day.
//
// The tracker state rides along on every DecisionRecord so that a restarted
// agent picks up the same day-start balance, peak and breaker.
//
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{AccountState, DecisionRecord};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PnlView {
    pub day_start_balance: f64,
    pub realized_today: f64,
    pub peak_equity: f64,
    pub equity: f64,
    /// Set only while the breaker is still in force at the time of the view.
    pub breaker_until: Option<DateTime<Utc>>,
}

impl PnlView {
    /// Positive amount lost today, 0 when flat or up.
    pub fn daily_loss(&self) -> f64 {
        (-self.realized_today).max(0.0)
    }

    /// Running drawdown from peak equity as a fraction.
    pub fn drawdown(&self) -> f64 {
        if self.peak_equity <= 0.0 {
            0.0
        } else {
            ((self.peak_equity - self.equity) / self.peak_equity).max(0.0)
        }
    }

    pub fn breaker_active(&self) -> bool {
        self.breaker_until.is_some()
    }
}

/// Persisted part of the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PnlState {
    pub day: NaiveDate,
    pub day_start_balance: f64,
    pub peak_equity: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub breaker_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct PnlTracker {
    day: Option<NaiveDate>,
    day_start_balance: f64,
    wallet_balance: f64,
    peak_equity: f64,
    equity: f64,
    breaker_until: Option<DateTime<Utc>>,
}

/// First instant of the next UTC day.
pub fn next_day_boundary(now: DateTime<Utc>) -> DateTime<Utc> {
    let next = now.date_naive() + Duration::days(1);
    next.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
        .unwrap_or(now + Duration::days(1))
}

impl PnlTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, now: DateTime<Utc>, account: &AccountState) {
        let today = now.date_naive();
        let balance = account.wallet_balance();
        if self.day != Some(today) {
            self.day = Some(today);
            self.day_start_balance = balance;
        }
        self.wallet_balance = balance;
        self.equity = account.equity;
        if account.equity > self.peak_equity {
            self.peak_equity = account.equity;
        }
        if let Some(until) = self.breaker_until {
            if now >= until {
                self.breaker_until = None;
            }
        }
    }

    /// Snapshot for the decision log; None before the first observation.
    pub fn state(&self) -> Option<PnlState> {
        self.day.map(|day| PnlState {
            day,
            day_start_balance: self.day_start_balance,
            peak_equity: self.peak_equity,
            breaker_until: self.breaker_until,
        })
    }

    /// Seeds the tracker from the newest record that carries a snapshot.
    /// A snapshot from an earlier day still restores the peak; the day-start
    /// balance is re-taken on the next observation.
    pub fn restore(&mut self, records: &[DecisionRecord]) -> Option<PnlState> {
        let st = records.iter().rev().find_map(|r| r.pnl)?;
        self.day = Some(st.day);
        self.day_start_balance = st.day_start_balance;
        self.wallet_balance = st.day_start_balance;
        self.peak_equity = self.peak_equity.max(st.peak_equity);
        self.breaker_until = match (self.breaker_until, st.breaker_until) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        Some(st)
    }

    /// Pauses trading until the next trading-day boundary.
    pub fn trip(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        let until = next_day_boundary(now);
        self.breaker_until = Some(until);
        until
    }

    pub fn breaker_until(&self) -> Option<DateTime<Utc>> {
        self.breaker_until
    }

    pub fn view(&self, now: DateTime<Utc>) -> PnlView {
        PnlView {
            day_start_balance: self.day_start_balance,
            realized_today: self.wallet_balance - self.day_start_balance,
            peak_equity: self.peak_equity,
            equity: self.equity,
            breaker_until: self.breaker_until.filter(|until| now < *until),
        }
    }
}
