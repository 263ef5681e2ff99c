// src/ingest/scheduler.rs
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::ingest::Crawler;

#[derive(Clone, Copy, Debug)]
pub struct SchedulerCfg {
    pub interval: Duration,
}

impl Default for SchedulerCfg {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30 * 60),
        }
    }
}

/// Run one cycle now, then one per `interval`, until `cancel` fires.
///
/// A failed cycle is logged and the schedule carries on. Cancellation is
/// observed between ticks and by the running cycle at its own await points;
/// this returns once that cycle has unwound. Returns the number of cycles run.
pub async fn run_scheduler(crawler: Arc<Crawler>, cfg: SchedulerCfg, cancel: CancellationToken) -> u64 {
    let mut ticker = tokio::time::interval(cfg.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut runs = 0u64;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        runs += 1;
        match crawler.run_cycle(&cancel).await {
            Ok(r) => {
                tracing::debug!(cycle = runs, new = r.new_count, notified = r.notified_count, "scheduled cycle done");
            }
            Err(e) if e.is_cancelled() => break,
            Err(e) => {
                counter!("deals_cycle_failures_total").increment(1);
                tracing::warn!(cycle = runs, error = %e, "scheduled cycle failed; continuing");
            }
        }
    }

    tracing::info!(cycles = runs, "scheduler stopped");
    runs
}

/// Spawn [`run_scheduler`] onto the runtime.
pub fn spawn_scheduler(crawler: Arc<Crawler>, cfg: SchedulerCfg, cancel: CancellationToken) -> JoinHandle<u64> {
    tokio::spawn(run_scheduler(crawler, cfg, cancel))
}
