// src/notify/dispatch.rs
//! Per-listing notification dispatch.
//!
//! Each listing moves through
//! `Pending → {AlreadyNotified | NoMatch | Matched → Delivering → {Delivered | PartiallyDelivered | FailedAll}}`.
//!
//! Invariants:
//! - one rendered notification per listing, delivered at most once per
//!   distinct destination channel;
//! - every outbound call goes through the shared [`RateLimiter`];
//! - a [`NotifiedRecord`] is written only after at least one delivery
//!   succeeded. A listing whose deliveries all failed stays retryable.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::{render_notification, NotificationChannel, RateLimiter};
use crate::alerts::AlertMatcher;
use crate::error::PipelineError;
use crate::ingest::types::Listing;
use crate::store::{ListingStore, NotifiedRecord};

#[derive(Debug, Clone)]
pub struct DispatcherCfg {
    /// Listings processed in parallel.
    pub workers: usize,
    /// Minimum spacing between outbound deliveries.
    pub delivery_interval: Duration,
}

impl Default for DispatcherCfg {
    fn default() -> Self {
        Self {
            workers: 5,
            delivery_interval: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingOutcome {
    AlreadyNotified,
    NoMatch,
    Delivered { channels: usize },
    PartiallyDelivered { delivered: usize, failed: usize },
    FailedAll { failed: usize },
    /// Work stopped on cancellation (or an upstream error) before finishing.
    Aborted,
}

impl ListingOutcome {
    pub fn is_notified(&self) -> bool {
        matches!(self, Self::Delivered { .. } | Self::PartiallyDelivered { .. })
    }
}

#[derive(Debug, Clone, Default)]
pub struct DispatchResult {
    /// `(url, outcome)` per listing, in completion order.
    pub outcomes: Vec<(String, ListingOutcome)>,
    /// Listings for which a NotifiedRecord is now in place.
    pub notified: usize,
    pub attempted_deliveries: usize,
    pub successful_deliveries: usize,
    pub errors: Vec<PipelineError>,
}

impl DispatchResult {
    /// Every attempted delivery across the batch failed.
    pub fn is_hard_failure(&self) -> bool {
        self.attempted_deliveries > 0 && self.successful_deliveries == 0
    }

    pub fn outcome_for(&self, url: &str) -> Option<ListingOutcome> {
        self.outcomes.iter().find(|(u, _)| u == url).map(|(_, o)| *o)
    }
}

/// What one worker hands back. Each worker owns its report; the dispatcher
/// merges them after joining.
#[derive(Debug)]
struct ListingReport {
    url: String,
    outcome: ListingOutcome,
    attempted: usize,
    delivered: usize,
    errors: Vec<PipelineError>,
    cancelled: bool,
}

impl ListingReport {
    fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            outcome: ListingOutcome::Aborted,
            attempted: 0,
            delivered: 0,
            errors: Vec::new(),
            cancelled: false,
        }
    }
}

struct Inner {
    store: Arc<dyn ListingStore>,
    matcher: AlertMatcher,
    channel: Arc<dyn NotificationChannel>,
    limiter: RateLimiter,
    workers: usize,
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn ListingStore>,
        matcher: AlertMatcher,
        channel: Arc<dyn NotificationChannel>,
        cfg: DispatcherCfg,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                matcher,
                channel,
                limiter: RateLimiter::new(cfg.delivery_interval),
                workers: cfg.workers.max(1),
            }),
        }
    }

    /// Match and deliver a batch of listings.
    ///
    /// Returns `Err(Cancelled)` when `cancel` fired during the batch. Channel
    /// failures never abort the batch; they are collected in the result.
    pub async fn dispatch(
        &self,
        listings: Vec<Listing>,
        cancel: &CancellationToken,
    ) -> Result<DispatchResult, PipelineError> {
        let mut result = DispatchResult::default();
        if listings.is_empty() {
            tracing::debug!("no listings to dispatch");
            return Ok(result);
        }
        tracing::info!(count = listings.len(), "dispatching listings");

        let permits = Arc::new(Semaphore::new(self.inner.workers));
        let mut set = JoinSet::new();
        let mut cancelled = false;

        for listing in listings {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                p = permits.clone().acquire_owned() => match p {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };
            let inner = self.inner.clone();
            let cancel = cancel.clone();
            set.spawn(async move {
                let report = inner.process(listing, &cancel).await;
                drop(permit);
                report
            });
        }

        while let Some(joined) = set.join_next().await {
            let report = match joined {
                Ok(r) => r,
                Err(e) => {
                    tracing::error!(error = %e, "dispatch worker panicked");
                    continue;
                }
            };
            cancelled |= report.cancelled;
            result.attempted_deliveries += report.attempted;
            result.successful_deliveries += report.delivered;
            if report.outcome.is_notified() {
                result.notified += 1;
            }
            result.errors.extend(report.errors);
            result.outcomes.push((report.url, report.outcome));
        }

        if cancelled || cancel.is_cancelled() {
            tracing::info!(notified = result.notified, "dispatch cancelled");
            return Err(PipelineError::Cancelled);
        }

        if result.is_hard_failure() {
            tracing::error!(
                attempted = result.attempted_deliveries,
                "every delivery attempt failed"
            );
        } else if !result.errors.is_empty() {
            tracing::warn!(
                errors = result.errors.len(),
                delivered = result.successful_deliveries,
                "some notifications failed"
            );
        }
        Ok(result)
    }
}

impl Inner {
    async fn process(&self, mut listing: Listing, cancel: &CancellationToken) -> ListingReport {
        let mut report = ListingReport::new(&listing.url);
        if cancel.is_cancelled() {
            report.cancelled = true;
            return report;
        }

        match self.store.is_notified(&listing.url).await {
            Ok(true) => {
                tracing::debug!(url = %listing.url, "already notified");
                report.outcome = ListingOutcome::AlreadyNotified;
                return report;
            }
            Ok(false) => {}
            Err(e) => {
                tracing::error!(error = %e, url = %listing.url, "notified check failed");
                report.errors.push(e.into());
                return report;
            }
        }

        let matches = match self.matcher.match_listing(&mut listing).await {
            Ok(m) => m,
            Err(e) => {
                tracing::error!(error = %e, url = %listing.url, "alert matching failed");
                report.errors.push(e);
                return report;
            }
        };
        if matches.is_empty() {
            report.outcome = ListingOutcome::NoMatch;
            return report;
        }

        let notification = render_notification(&listing, &matches);
        let mut channels: Vec<&str> = Vec::new();
        for m in &matches {
            if !channels.contains(&m.channel_id.as_str()) {
                channels.push(m.channel_id.as_str());
            }
        }

        let mut failed = 0usize;
        for channel_id in channels {
            if self.limiter.acquire(cancel).await.is_err() {
                report.cancelled = true;
                break;
            }

            report.attempted += 1;
            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                r = self.channel.deliver(channel_id, &notification) => Some(r),
            };
            match sent {
                None => {
                    report.attempted -= 1;
                    report.cancelled = true;
                    break;
                }
                Some(Ok(())) => {
                    report.delivered += 1;
                    counter!("deals_notifications_sent_total").increment(1);
                    tracing::info!(channel_id, title = %listing.title, "sent notification");
                }
                Some(Err(e)) => {
                    failed += 1;
                    counter!("deals_delivery_failures_total").increment(1);
                    tracing::error!(channel_id, error = %e, "delivery failed");
                    report.errors.push(PipelineError::delivery(channel_id, &e));
                }
            }
        }

        if report.delivered > 0 {
            self.mark_notified(&listing, &mut report).await;
            report.outcome = if failed == 0 && !report.cancelled {
                ListingOutcome::Delivered {
                    channels: report.delivered,
                }
            } else {
                ListingOutcome::PartiallyDelivered {
                    delivered: report.delivered,
                    failed,
                }
            };
        } else if failed > 0 {
            report.outcome = ListingOutcome::FailedAll { failed };
        }
        report
    }

    async fn mark_notified(&self, listing: &Listing, report: &mut ListingReport) {
        let record = NotifiedRecord::for_listing(listing, Utc::now());
        match self.store.insert_notified(&record).await {
            Ok(()) => {}
            Err(e) if e.is_conflict() => {
                tracing::debug!(url = %listing.url, "notified record already present");
            }
            Err(e) => {
                tracing::error!(error = %e, url = %listing.url, "failed to mark listing notified");
                report.errors.push(e.into());
                return;
            }
        }

        if let Some(id) = listing.id {
            if let Err(e) = self.store.mark_listing_notified(id).await {
                tracing::warn!(error = %e, listing = id.0, "failed to set listing notified flag");
            }
        }
    }
}
