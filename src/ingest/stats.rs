// src/ingest/stats.rs
//! Process-held crawl statistics.
//!
//! A single [`StatsRegistry`] owns the per-source map and the cycle counters
//! behind one mutex. Callers only get snapshots or go through the update
//! methods, so every read-modify-write happens under the lock.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

/// Weight kept from history when folding in a new outcome.
pub const SUCCESS_RATE_DECAY: f64 = 0.9;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SourceStats {
    pub listings_found: usize,
    pub runs: u64,
    /// EWMA over outcomes in {0, 1}; 0.0..=1.0.
    pub success_rate: f64,
    pub last_run: Option<DateTime<Utc>>,
    pub last_run_duration_ms: u64,
    pub last_error: Option<String>,
}

impl SourceStats {
    /// Fold one crawl outcome into the rolling rate. The first outcome sets
    /// the rate outright.
    pub fn record_outcome(&mut self, success: bool) {
        let outcome = if success { 1.0 } else { 0.0 };
        self.success_rate = if self.runs == 0 {
            outcome
        } else {
            self.success_rate * SUCCESS_RATE_DECAY + outcome * (1.0 - SUCCESS_RATE_DECAY)
        };
        self.runs += 1;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleStats {
    /// Listings observed over the life of the process.
    pub total_found: usize,
    /// Reset at the start of every cycle.
    pub new_count: usize,
    /// Reset at the start of every cycle.
    pub notified_count: usize,
    pub run_count: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub last_run_duration_ms: u64,
    pub last_error: Option<String>,
    pub sources: BTreeMap<String, SourceStats>,
}

#[derive(Debug, Default)]
pub struct StatsRegistry {
    inner: Mutex<CycleStats>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> CycleStats {
        self.inner.lock().clone()
    }

    pub fn source(&self, name: &str) -> Option<SourceStats> {
        self.inner.lock().sources.get(name).cloned()
    }

    pub fn begin_cycle(&self, now: DateTime<Utc>) {
        let mut s = self.inner.lock();
        s.run_count += 1;
        s.last_run = Some(now);
        s.new_count = 0;
        s.notified_count = 0;
    }

    pub fn record_source_success(&self, name: &str, found: usize, elapsed: Duration, now: DateTime<Utc>) {
        let mut s = self.inner.lock();
        s.total_found += found;
        let entry = s.sources.entry(name.to_string()).or_default();
        entry.record_outcome(true);
        entry.listings_found = found;
        entry.last_run = Some(now);
        entry.last_run_duration_ms = elapsed.as_millis() as u64;
        entry.last_error = None;
    }

    pub fn record_source_failure(&self, name: &str, error: &str, elapsed: Duration, now: DateTime<Utc>) {
        let mut s = self.inner.lock();
        let entry = s.sources.entry(name.to_string()).or_default();
        entry.record_outcome(false);
        entry.last_run = Some(now);
        entry.last_run_duration_ms = elapsed.as_millis() as u64;
        entry.last_error = Some(error.to_string());
    }

    pub fn record_new_listing(&self) {
        self.inner.lock().new_count += 1;
    }

    pub fn finish_cycle(&self, notified: usize, elapsed: Duration, error: Option<String>) {
        let mut s = self.inner.lock();
        s.notified_count = notified;
        s.last_run_duration_ms = elapsed.as_millis() as u64;
        if error.is_some() {
            s.last_error = error;
        }
    }
}
