// tests/pipeline_e2e.rs
//
// Full crawl → dedup → match → dispatch cycles against the in-memory store,
// with in-process sources and a recording notification channel.
//
// Covered:
// - two sources, one matching listing, one delivery
// - re-running a cycle is idempotent
// - one delivery per distinct channel
// - partial delivery still marks the listing notified
// - all deliveries failing leaves the listing retryable
// - a failing source does not fail the cycle
// - cancellation before any delivery completes writes no NotifiedRecord
// - an insert that loses the uniqueness race counts as already present
// - losing the store fails the cycle
// - a full queue parks producers, and cancellation releases them

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use deal_alerts::alerts::{AlertMatcher, NewSubscription};
use deal_alerts::ingest::types::{Listing, ListingId, Source};
use deal_alerts::ingest::{Crawler, CrawlerCfg};
use deal_alerts::notify::{Dispatcher, DispatcherCfg, ListingOutcome, Notification, NotificationChannel};
use deal_alerts::store::{ListingQuery, ListingStore, MemoryStore, NotifiedRecord, StoreResult, SubscriptionStore};
use deal_alerts::{ErrorKind, StoreError};

struct StaticSource {
    name: &'static str,
    listings: Vec<Listing>,
    fail: bool,
}

impl StaticSource {
    fn new(name: &'static str, listings: Vec<Listing>) -> Arc<dyn Source> {
        Arc::new(Self {
            name,
            listings,
            fail: false,
        })
    }

    fn failing(name: &'static str) -> Arc<dyn Source> {
        Arc::new(Self {
            name,
            listings: Vec::new(),
            fail: true,
        })
    }
}

#[async_trait::async_trait]
impl Source for StaticSource {
    fn name(&self) -> &str {
        self.name
    }

    async fn crawl(&self, _cancel: &CancellationToken) -> Result<Vec<Listing>> {
        if self.fail {
            return Err(anyhow!("status code 503"));
        }
        Ok(self.listings.clone())
    }
}

#[derive(Default)]
struct RecordingChannel {
    calls: Mutex<Vec<(String, Notification)>>,
    failing: Mutex<HashSet<String>>,
}

impl RecordingChannel {
    fn fail_channel(&self, id: &str) {
        self.failing.lock().insert(id.to_string());
    }

    fn heal(&self) {
        self.failing.lock().clear();
    }

    fn targets(&self) -> Vec<(String, String)> {
        self.calls
            .lock()
            .iter()
            .map(|(c, n)| (c.clone(), n.url.clone()))
            .collect()
    }
}

#[async_trait::async_trait]
impl NotificationChannel for RecordingChannel {
    async fn deliver(&self, channel_id: &str, notification: &Notification) -> Result<()> {
        self.calls
            .lock()
            .push((channel_id.to_string(), notification.clone()));
        if self.failing.lock().contains(channel_id) {
            return Err(anyhow!("Discord HTTP 500"));
        }
        Ok(())
    }
}

/// Signals when a delivery starts, then never finishes.
#[derive(Default)]
struct HangingChannel {
    started: Notify,
}

#[async_trait::async_trait]
impl NotificationChannel for HangingChannel {
    async fn deliver(&self, _channel_id: &str, _notification: &Notification) -> Result<()> {
        self.started.notify_one();
        std::future::pending::<()>().await;
        Ok(())
    }
}

/// Delegates to a [`MemoryStore`], except that inserts can be made to fail
/// and lookups can be parked forever.
struct FaultyStore {
    inner: Arc<MemoryStore>,
    insert_error: Option<StoreError>,
    park_lookups: Option<Arc<Notify>>,
    lookups: AtomicUsize,
}

impl FaultyStore {
    fn failing_inserts(inner: Arc<MemoryStore>, err: StoreError) -> Arc<Self> {
        Arc::new(Self {
            inner,
            insert_error: Some(err),
            park_lookups: None,
            lookups: AtomicUsize::new(0),
        })
    }

    fn parking_lookups(inner: Arc<MemoryStore>, parked: Arc<Notify>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            insert_error: None,
            park_lookups: Some(parked),
            lookups: AtomicUsize::new(0),
        })
    }

    fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ListingStore for FaultyStore {
    async fn ensure_indexes(&self) -> StoreResult<()> {
        self.inner.ensure_indexes().await
    }

    async fn listing_exists(&self, url: &str) -> StoreResult<bool> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if let Some(parked) = &self.park_lookups {
            parked.notify_one();
            std::future::pending::<()>().await;
        }
        self.inner.listing_exists(url).await
    }

    async fn insert_listing(&self, listing: &Listing) -> StoreResult<ListingId> {
        if let Some(err) = &self.insert_error {
            return Err(err.clone());
        }
        self.inner.insert_listing(listing).await
    }

    async fn set_matched_keywords(&self, id: ListingId, keywords: &[String]) -> StoreResult<()> {
        self.inner.set_matched_keywords(id, keywords).await
    }

    async fn mark_listing_notified(&self, id: ListingId) -> StoreResult<()> {
        self.inner.mark_listing_notified(id).await
    }

    async fn count_listings(&self) -> StoreResult<usize> {
        self.inner.count_listings().await
    }

    async fn find_listings(&self, query: &ListingQuery) -> StoreResult<Vec<Listing>> {
        self.inner.find_listings(query).await
    }

    async fn is_notified(&self, url: &str) -> StoreResult<bool> {
        self.inner.is_notified(url).await
    }

    async fn insert_notified(&self, record: &NotifiedRecord) -> StoreResult<()> {
        self.inner.insert_notified(record).await
    }

    async fn count_notified(&self) -> StoreResult<usize> {
        self.inner.count_notified().await
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    dispatcher: Dispatcher,
    crawler: Arc<Crawler>,
}

fn harness(sources: Vec<Arc<dyn Source>>, channel: Arc<dyn NotificationChannel>) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let listings: Arc<dyn ListingStore> = store.clone();
    let subs: Arc<dyn SubscriptionStore> = store.clone();
    let dispatcher = Dispatcher::new(
        listings.clone(),
        AlertMatcher::new(subs, listings.clone()),
        channel,
        DispatcherCfg {
            workers: 5,
            delivery_interval: Duration::from_millis(1),
        },
    );
    let crawler = Arc::new(Crawler::new(
        sources,
        listings,
        dispatcher.clone(),
        CrawlerCfg { queue_capacity: 2 },
    ));
    Harness {
        store,
        dispatcher,
        crawler,
    }
}

/// A crawler that dedups and inserts through `store`, dispatching through
/// the harness dispatcher.
fn crawler_over(
    h: &Harness,
    sources: Vec<Arc<dyn Source>>,
    store: Arc<dyn ListingStore>,
    queue_capacity: usize,
) -> Arc<Crawler> {
    Arc::new(Crawler::new(
        sources,
        store,
        h.dispatcher.clone(),
        CrawlerCfg { queue_capacity },
    ))
}

async fn subscribe(store: &MemoryStore, keyword: &str, subscriber: &str, channel: &str) {
    store
        .add_subscription(NewSubscription {
            keyword: keyword.into(),
            subscriber_id: subscriber.into(),
            channel_id: channel.into(),
            ..NewSubscription::default()
        })
        .await
        .expect("add subscription");
}

fn two_sources() -> Vec<Arc<dyn Source>> {
    vec![
        StaticSource::new("A", vec![Listing::new("https://a.com/1", "Phone sale")]),
        StaticSource::new("B", vec![Listing::new("https://b.com/2", "Laptop clearance")]),
    ]
}

#[tokio::test]
async fn two_sources_one_match_one_delivery() {
    let channel = Arc::new(RecordingChannel::default());
    let h = harness(two_sources(), channel.clone());
    subscribe(&h.store, "phone", "u1", "c1").await;

    let r = h.crawler.run_cycle(&CancellationToken::new()).await.expect("cycle ok");
    assert_eq!(r.total_found, 2);
    assert_eq!(r.new_count, 2);
    assert_eq!(r.notified_count, 1);
    assert!(r.errors.is_empty());

    assert_eq!(channel.targets(), vec![("c1".to_string(), "https://a.com/1".to_string())]);
    assert!(h.store.is_notified("https://a.com/1").await.unwrap());
    assert!(!h.store.is_notified("https://b.com/2").await.unwrap());
    assert_eq!(h.store.count_listings().await.unwrap(), 2);
    assert_eq!(h.store.count_notified().await.unwrap(), 1);

    let a = h.store.listing_by_url("https://a.com/1").unwrap();
    assert!(a.notified);
    assert_eq!(a.keywords, vec!["phone"]);
    assert_eq!(a.source, "A");
    assert!(a.crawled_at.is_some());

    let stats = h.crawler.stats();
    assert_eq!(stats.run_count, 1);
    assert_eq!(stats.new_count, 2);
    assert_eq!(stats.notified_count, 1);
    assert_eq!(stats.sources["A"].success_rate, 1.0);
}

#[tokio::test]
async fn rerunning_a_cycle_is_idempotent() {
    let channel = Arc::new(RecordingChannel::default());
    let h = harness(two_sources(), channel.clone());
    subscribe(&h.store, "phone", "u1", "c1").await;
    let cancel = CancellationToken::new();

    h.crawler.run_cycle(&cancel).await.expect("first cycle");
    let second = h.crawler.run_cycle(&cancel).await.expect("second cycle");

    assert_eq!(second.total_found, 2);
    assert_eq!(second.new_count, 0);
    assert_eq!(second.notified_count, 0);
    assert_eq!(channel.targets().len(), 1);
    assert_eq!(h.store.count_listings().await.unwrap(), 2);
    assert_eq!(h.store.count_notified().await.unwrap(), 1);
}

#[tokio::test]
async fn subscribers_sharing_a_channel_get_one_delivery() {
    let channel = Arc::new(RecordingChannel::default());
    let h = harness(two_sources(), channel.clone());
    subscribe(&h.store, "phone", "u1", "c1").await;
    subscribe(&h.store, "Sale", "u2", "c1").await;
    subscribe(&h.store, "phone", "u3", "c2").await;

    h.crawler.run_cycle(&CancellationToken::new()).await.expect("cycle ok");

    let mut targets = channel.targets();
    targets.sort();
    assert_eq!(
        targets,
        vec![
            ("c1".to_string(), "https://a.com/1".to_string()),
            ("c2".to_string(), "https://a.com/1".to_string()),
        ]
    );

    let calls = channel.calls.lock();
    let n = &calls[0].1;
    assert_eq!(n.mentions, vec!["<@u1>", "<@u2>", "<@u3>"]);
    assert_eq!(n.keywords, vec!["phone", "Sale"]);
}

#[tokio::test]
async fn partial_delivery_marks_listing_notified() {
    let channel = Arc::new(RecordingChannel::default());
    channel.fail_channel("c2");
    let h = harness(two_sources(), channel.clone());
    subscribe(&h.store, "phone", "u1", "c1").await;
    subscribe(&h.store, "phone", "u2", "c2").await;

    let r = h.crawler.run_cycle(&CancellationToken::new()).await.expect("cycle ok");
    assert_eq!(r.notified_count, 1);
    assert_eq!(r.errors.len(), 1);
    assert_eq!(r.errors[0].kind(), ErrorKind::DeliveryFailure);
    assert!(h.store.is_notified("https://a.com/1").await.unwrap());
}

#[tokio::test]
async fn all_failed_deliveries_leave_listing_retryable() {
    let channel = Arc::new(RecordingChannel::default());
    channel.fail_channel("c1");
    let sources = vec![StaticSource::new(
        "A",
        vec![Listing::new("https://a.com/1", "Phone sale")],
    )];
    let h = harness(sources, channel.clone());
    subscribe(&h.store, "phone", "u1", "c1").await;
    let cancel = CancellationToken::new();

    let err = h.crawler.run_cycle(&cancel).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DispatchExhausted);
    assert!(err.to_string().contains("channel c1 failed: Discord HTTP 500"), "{err}");
    assert_eq!(h.store.count_notified().await.unwrap(), 0);
    assert_eq!(h.store.count_listings().await.unwrap(), 1);
    let last_error = h.crawler.stats().last_error.expect("cycle error recorded");
    assert!(last_error.contains("Discord HTTP 500"), "{last_error}");

    // Not re-inserted on the next crawl.
    channel.heal();
    let again = h.crawler.run_cycle(&cancel).await.expect("second cycle");
    assert_eq!(again.new_count, 0);
    assert_eq!(h.store.count_listings().await.unwrap(), 1);

    // Still eligible for a later dispatch pass.
    let pending = h.store.listing_by_url("https://a.com/1").unwrap();
    let d = h.dispatcher.dispatch(vec![pending], &cancel).await.expect("dispatch");
    assert_eq!(
        d.outcome_for("https://a.com/1"),
        Some(ListingOutcome::Delivered { channels: 1 })
    );
    assert!(h.store.is_notified("https://a.com/1").await.unwrap());
}

#[tokio::test]
async fn failing_source_is_isolated() {
    let channel = Arc::new(RecordingChannel::default());
    let sources = vec![
        StaticSource::failing("Broken"),
        StaticSource::new("A", vec![Listing::new("https://a.com/1", "Phone sale")]),
    ];
    let h = harness(sources, channel.clone());
    subscribe(&h.store, "phone", "u1", "c1").await;

    let r = h.crawler.run_cycle(&CancellationToken::new()).await.expect("cycle ok");
    assert_eq!(r.new_count, 1);
    assert_eq!(r.notified_count, 1);
    assert_eq!(r.errors.len(), 1);
    assert_eq!(r.errors[0].kind(), ErrorKind::SourceFailure);

    let stats = h.crawler.stats();
    assert_eq!(stats.sources["Broken"].success_rate, 0.0);
    assert_eq!(
        stats.sources["Broken"].last_error.as_deref(),
        Some("status code 503")
    );
    assert_eq!(stats.sources["A"].success_rate, 1.0);
}

#[tokio::test]
async fn cancellation_before_delivery_writes_nothing() {
    let channel = Arc::new(HangingChannel::default());
    let sources = vec![StaticSource::new(
        "A",
        vec![Listing::new("https://a.com/1", "Phone sale")],
    )];
    let h = harness(sources, channel.clone());
    subscribe(&h.store, "phone", "u1", "c1").await;

    let cancel = CancellationToken::new();
    let crawler = h.crawler.clone();
    let c = cancel.clone();
    let cycle = tokio::spawn(async move { crawler.run_cycle(&c).await });

    channel.started.notified().await;
    cancel.cancel();

    let res = tokio::time::timeout(Duration::from_secs(5), cycle)
        .await
        .expect("cycle unwinds promptly")
        .expect("join");
    assert!(res.unwrap_err().is_cancelled());
    assert_eq!(h.store.count_notified().await.unwrap(), 0);
    assert_eq!(h.store.count_listings().await.unwrap(), 1);
    assert!(!h.store.listing_by_url("https://a.com/1").unwrap().notified);
}

#[tokio::test]
async fn insert_race_loss_counts_as_already_present() {
    let channel = Arc::new(RecordingChannel::default());
    let h = harness(Vec::new(), channel.clone());
    subscribe(&h.store, "phone", "u1", "c1").await;
    let store = FaultyStore::failing_inserts(h.store.clone(), StoreError::conflict("https://a.com/1"));
    let crawler = crawler_over(&h, two_sources(), store.clone(), 2);

    let r = crawler.run_cycle(&CancellationToken::new()).await.expect("cycle ok");
    assert_eq!(r.total_found, 2);
    assert_eq!(r.new_count, 0);
    assert_eq!(r.notified_count, 0);
    assert!(r.errors.is_empty(), "{:?}", r.errors);
    assert_eq!(store.lookups(), 2);
    assert!(channel.targets().is_empty());
    assert!(crawler.stats().last_error.is_none());
}

#[tokio::test]
async fn store_loss_during_drain_fails_the_cycle() {
    let channel = Arc::new(RecordingChannel::default());
    let h = harness(Vec::new(), channel.clone());
    subscribe(&h.store, "phone", "u1", "c1").await;
    let store = FaultyStore::failing_inserts(h.store.clone(), StoreError::Io("disk full".into()));
    let crawler = crawler_over(&h, two_sources(), store, 2);

    let err = crawler.run_cycle(&CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StoreUnavailable);
    assert!(channel.targets().is_empty());
    assert_eq!(h.store.count_notified().await.unwrap(), 0);
    let last_error = crawler.stats().last_error.expect("cycle error recorded");
    assert!(last_error.contains("disk full"), "{last_error}");
}

#[tokio::test]
async fn full_queue_parks_producers_until_cancelled() {
    let channel = Arc::new(RecordingChannel::default());
    let h = harness(Vec::new(), channel.clone());
    let many: Vec<Listing> = (0..50)
        .map(|i| Listing::new(format!("https://a.com/{i}"), format!("deal {i}")))
        .collect();
    let parked = Arc::new(Notify::new());
    let store = FaultyStore::parking_lookups(h.store.clone(), parked.clone());
    let crawler = crawler_over(&h, vec![StaticSource::new("A", many)], store.clone(), 1);

    let cancel = CancellationToken::new();
    let c = cancel.clone();
    let running = crawler.clone();
    let cycle = tokio::spawn(async move { running.run_cycle(&c).await });

    // The drain is stuck on its first lookup and the queue holds one
    // listing, so the producer cannot get through its batch.
    parked.notified().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!cycle.is_finished());
    assert_eq!(store.lookups(), 1);

    cancel.cancel();
    let res = tokio::time::timeout(Duration::from_secs(5), cycle)
        .await
        .expect("blocked producer released promptly")
        .expect("join");
    assert!(res.unwrap_err().is_cancelled());
    assert_eq!(h.store.count_listings().await.unwrap(), 0);
    assert!(channel.targets().is_empty());
}
