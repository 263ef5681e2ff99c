// src/ingest/mod.rs
pub mod config;
pub mod fetch;
pub mod providers;
pub mod scheduler;
pub mod stats;
pub mod types;

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use once_cell::sync::OnceCell;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::{ErrorKind, PipelineError, StoreError};
use crate::ingest::stats::{CycleStats, StatsRegistry};
use crate::ingest::types::{Listing, Source};
use crate::notify::Dispatcher;
use crate::store::ListingStore;

pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// One-time metrics registration (so series show up on /metrics).
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(describe_metrics);
}

fn describe_metrics() {
    describe_counter!("deals_listings_found_total", "Listings returned by sources.");
    describe_counter!("deals_listings_new_total", "Listings inserted for the first time.");
    describe_counter!("deals_source_errors_total", "Source crawl failures.");
    describe_counter!("deals_fetch_retries_total", "HTTP fetch attempts that were retried.");
    describe_counter!("deals_alert_matches_total", "Subscription matches.");
    describe_counter!("deals_notifications_sent_total", "Successful channel deliveries.");
    describe_counter!("deals_delivery_failures_total", "Failed channel deliveries.");
    describe_counter!("deals_cycles_total", "Crawl cycles started.");
    describe_counter!("deals_cycle_failures_total", "Scheduled cycles that failed.");
    describe_histogram!("deals_cycle_duration_ms", "Crawl cycle wall time in milliseconds.");
    describe_counter!("deals_feed_items_total", "Items parsed out of source feeds.");
    describe_histogram!("deals_feed_parse_ms", "Feed parse time in milliseconds.");
    describe_gauge!("deals_last_cycle_ts", "Unix ts when the last cycle finished.");
}

/// Normalize scraped text: entity decode, tag strip, quote folding,
/// whitespace collapse.
pub fn normalize_text(s: &str) -> String {
    let mut out = html_escape::decode_html_entities(s).to_string();

    static RE_TAGS: OnceCell<regex::Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| regex::Regex::new(r"(?is)</?[^>]+>").unwrap());
    out = re_tags.replace_all(&out, " ").to_string();

    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    static RE_WS: OnceCell<regex::Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| regex::Regex::new(r"\s+").unwrap());
    re_ws.replace_all(&out, " ").trim().to_string()
}

/// Resolve `raw` against `base` and drop the fragment. Only http(s) links
/// qualify as deduplication keys.
pub fn canonical_url(raw: &str, base: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let mut url = match url::Url::parse(raw) {
        Ok(u) => u,
        Err(url::ParseError::RelativeUrlWithoutBase) => url::Url::parse(base).ok()?.join(raw).ok()?,
        Err(_) => return None,
    };
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.set_fragment(None);
    Some(url.to_string())
}

/// Aggregate of one completed cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleResult {
    pub total_found: usize,
    pub new_count: usize,
    pub notified_count: usize,
    /// Per-source and per-delivery failures; none of them failed the cycle.
    pub errors: Vec<PipelineError>,
}

#[derive(Debug, Clone)]
pub struct CrawlerCfg {
    pub queue_capacity: usize,
}

impl Default for CrawlerCfg {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Runs every source concurrently, persists what is new and hands the new
/// listings to the dispatcher.
pub struct Crawler {
    sources: Vec<Arc<dyn Source>>,
    store: Arc<dyn ListingStore>,
    dispatcher: Dispatcher,
    stats: Arc<StatsRegistry>,
    cfg: CrawlerCfg,
}

struct SourceOutcome {
    found: usize,
    error: Option<PipelineError>,
}

#[derive(Default)]
struct DrainOutcome {
    new_listings: Vec<Listing>,
    errors: Vec<PipelineError>,
    fatal: Option<PipelineError>,
}

impl Crawler {
    pub fn new(
        sources: Vec<Arc<dyn Source>>,
        store: Arc<dyn ListingStore>,
        dispatcher: Dispatcher,
        cfg: CrawlerCfg,
    ) -> Self {
        Self {
            sources,
            store,
            dispatcher,
            stats: Arc::new(StatsRegistry::new()),
            cfg,
        }
    }

    pub fn stats(&self) -> CycleStats {
        self.stats.snapshot()
    }

    pub fn stats_registry(&self) -> Arc<StatsRegistry> {
        self.stats.clone()
    }

    pub fn source_names(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.name().to_string()).collect()
    }

    /// Crawl → dedup → match → dispatch, once.
    ///
    /// Source and single-delivery failures land in [`CycleResult::errors`].
    /// The cycle itself fails on cancellation, on loss of the store, or when
    /// every attempted delivery failed.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleResult, PipelineError> {
        ensure_metrics_described();
        counter!("deals_cycles_total").increment(1);
        let started = Instant::now();
        self.stats.begin_cycle(Utc::now());
        tracing::info!(sources = self.sources.len(), "crawl cycle started");

        let outcome = self.crawl_and_dispatch(cancel).await;

        let elapsed = started.elapsed();
        histogram!("deals_cycle_duration_ms").record(elapsed.as_secs_f64() * 1_000.0);
        gauge!("deals_last_cycle_ts").set(Utc::now().timestamp() as f64);
        match &outcome {
            Ok(r) => {
                self.stats.finish_cycle(r.notified_count, elapsed, None);
                tracing::info!(
                    found = r.total_found,
                    new = r.new_count,
                    notified = r.notified_count,
                    errors = r.errors.len(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "crawl cycle finished"
                );
            }
            Err(e) if e.is_cancelled() => {
                self.stats.finish_cycle(0, elapsed, None);
                tracing::info!("crawl cycle cancelled");
            }
            Err(e) => {
                self.stats.finish_cycle(0, elapsed, Some(e.to_string()));
                tracing::error!(error = %e, "crawl cycle failed");
            }
        }
        outcome
    }

    async fn crawl_and_dispatch(&self, cancel: &CancellationToken) -> Result<CycleResult, PipelineError> {
        let (tx, rx) = mpsc::channel::<Listing>(self.cfg.queue_capacity.max(1));
        let drain = tokio::spawn(drain_queue(
            self.store.clone(),
            self.stats.clone(),
            rx,
            cancel.clone(),
        ));

        let mut set = JoinSet::new();
        for source in &self.sources {
            set.spawn(crawl_source(
                source.clone(),
                tx.clone(),
                cancel.clone(),
                self.stats.clone(),
            ));
        }
        drop(tx);

        let mut result = CycleResult::default();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(o) => {
                    result.total_found += o.found;
                    result.errors.extend(o.error);
                }
                Err(e) => tracing::error!(error = %e, "source task panicked"),
            }
        }

        let drained = match drain.await {
            Ok(d) => d,
            Err(e) => DrainOutcome {
                fatal: Some(StoreError::Unavailable(format!("drain task failed: {e}")).into()),
                ..DrainOutcome::default()
            },
        };
        result.errors.extend(drained.errors);

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        if let Some(fatal) = drained.fatal {
            return Err(fatal);
        }

        result.new_count = drained.new_listings.len();
        let dispatched = self.dispatcher.dispatch(drained.new_listings, cancel).await?;
        result.notified_count = dispatched.notified;
        if dispatched.is_hard_failure() {
            return Err(PipelineError::DispatchExhausted {
                attempted: dispatched.attempted_deliveries,
                causes: dispatched.errors.iter().map(ToString::to_string).collect(),
            });
        }
        result.errors.extend(dispatched.errors);
        Ok(result)
    }
}

async fn crawl_source(
    source: Arc<dyn Source>,
    tx: mpsc::Sender<Listing>,
    cancel: CancellationToken,
    stats: Arc<StatsRegistry>,
) -> SourceOutcome {
    let name = source.name().to_string();
    let t0 = Instant::now();
    let crawled = source.crawl(&cancel).await;
    let elapsed = t0.elapsed();

    let listings = match crawled {
        Ok(v) => v,
        Err(_) if cancel.is_cancelled() => {
            return SourceOutcome {
                found: 0,
                error: None,
            };
        }
        Err(e) => {
            let msg = format!("{e:#}");
            stats.record_source_failure(&name, &msg, elapsed, Utc::now());
            counter!("deals_source_errors_total", "source" => name.clone()).increment(1);
            tracing::warn!(source = %name, error = %msg, "source crawl failed");
            let err = PipelineError::source_failure(&name, &e);
            return SourceOutcome {
                found: 0,
                error: Some(err),
            };
        }
    };

    let found = listings.len();
    stats.record_source_success(&name, found, elapsed, Utc::now());
    counter!("deals_listings_found_total", "source" => name.clone()).increment(found as u64);
    tracing::info!(source = %name, found, elapsed_ms = elapsed.as_millis() as u64, "source crawled");

    let now = Utc::now();
    for mut listing in listings {
        listing.tag_provenance(&name, now);
        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            r = tx.send(listing) => r,
        };
        if sent.is_err() {
            tracing::debug!(source = %name, "listing queue closed");
            break;
        }
    }

    SourceOutcome { found, error: None }
}

async fn drain_queue(
    store: Arc<dyn ListingStore>,
    stats: Arc<StatsRegistry>,
    mut rx: mpsc::Receiver<Listing>,
    cancel: CancellationToken,
) -> DrainOutcome {
    let mut out = DrainOutcome::default();
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            l = rx.recv() => l,
        };
        let Some(mut listing) = next else { break };

        let exists = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            r = store.listing_exists(&listing.url) => r,
        };
        match exists {
            Ok(true) => continue,
            Ok(false) => {}
            Err(e) => {
                if handle_store_error(e, &listing.url, &mut out) {
                    rx.close();
                    break;
                }
                continue;
            }
        }

        let inserted = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            r = store.insert_listing(&listing) => r,
        };
        match inserted {
            Ok(id) => {
                listing.id = Some(id);
                stats.record_new_listing();
                counter!("deals_listings_new_total").increment(1);
                tracing::debug!(url = %listing.url, "new listing");
                out.new_listings.push(listing);
            }
            Err(e) if e.is_conflict() => {
                tracing::debug!(url = %listing.url, "listing inserted concurrently");
            }
            Err(e) => {
                if handle_store_error(e, &listing.url, &mut out) {
                    rx.close();
                    break;
                }
            }
        }
    }
    out
}

/// Returns true when the error means the store is gone.
fn handle_store_error(e: StoreError, url: &str, out: &mut DrainOutcome) -> bool {
    if e.kind() == ErrorKind::StoreUnavailable {
        tracing::error!(error = %e, url, "store unavailable; aborting drain");
        out.fatal = Some(e.into());
        true
    } else {
        tracing::warn!(error = %e, url, "skipping listing");
        out.errors.push(e.into());
        false
    }
}
