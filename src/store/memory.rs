// src/store/memory.rs
//! Process-local store. Also the state engine behind [`super::FileStore`].

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{ListingQuery, ListingStore, NotifiedRecord, StoreResult, SubscriptionStore};
use crate::alerts::{normalize_keyword, NewSubscription, Subscription, SubscriptionId};
use crate::error::StoreError;
use crate::ingest::types::{Listing, ListingId};

const DEFAULT_POPULAR_LIMIT: usize = 10;

/// Serializable store contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreState {
    #[serde(default)]
    next_listing_id: u64,
    #[serde(default)]
    next_subscription_id: u64,
    #[serde(default)]
    listings: BTreeMap<u64, Listing>,
    #[serde(default)]
    notified: BTreeMap<String, NotifiedRecord>,
    #[serde(default)]
    subscriptions: BTreeMap<u64, Subscription>,
    /// Unique index url → listing id.
    #[serde(skip)]
    url_index: HashMap<String, u64>,
}

impl StoreState {
    fn rebuild_index(&mut self) {
        self.url_index = self
            .listings
            .iter()
            .map(|(id, l)| (l.url.clone(), *id))
            .collect();
    }

    pub(super) fn insert_listing(&mut self, listing: &Listing) -> StoreResult<ListingId> {
        if self.url_index.contains_key(&listing.url) {
            return Err(StoreError::conflict(&listing.url));
        }
        self.next_listing_id += 1;
        let id = self.next_listing_id;
        let mut row = listing.clone();
        row.id = Some(ListingId(id));
        self.url_index.insert(row.url.clone(), id);
        self.listings.insert(id, row);
        Ok(ListingId(id))
    }

    fn listing_mut(&mut self, id: ListingId) -> StoreResult<&mut Listing> {
        self.listings
            .get_mut(&id.0)
            .ok_or_else(|| StoreError::not_found(format!("listing {}", id.0)))
    }

    pub(super) fn set_matched_keywords(&mut self, id: ListingId, keywords: &[String]) -> StoreResult<()> {
        self.listing_mut(id)?.keywords = keywords.to_vec();
        Ok(())
    }

    pub(super) fn mark_listing_notified(&mut self, id: ListingId) -> StoreResult<()> {
        self.listing_mut(id)?.notified = true;
        Ok(())
    }

    fn find_listings(&self, q: &ListingQuery) -> Vec<Listing> {
        let mut rows: Vec<&Listing> = self
            .listings
            .values()
            .filter(|l| q.source.as_deref().map_or(true, |s| l.source == s))
            .filter(|l| q.notified.map_or(true, |n| l.notified == n))
            .collect();
        rows.sort_by(|a, b| b.crawled_at.cmp(&a.crawled_at).then(b.id.cmp(&a.id)));
        rows.into_iter()
            .skip(q.skip)
            .take(q.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    pub(super) fn insert_notified(&mut self, record: &NotifiedRecord) -> StoreResult<()> {
        if self.notified.contains_key(&record.url) {
            return Err(StoreError::conflict(&record.url));
        }
        self.notified.insert(record.url.clone(), record.clone());
        Ok(())
    }

    pub(super) fn record_match(&mut self, id: SubscriptionId, at: DateTime<Utc>) -> StoreResult<()> {
        let sub = self
            .subscriptions
            .get_mut(&id.0)
            .ok_or_else(|| StoreError::not_found(format!("subscription {}", id.0)))?;
        sub.last_matched_at = Some(at);
        sub.match_count += 1;
        Ok(())
    }

    pub(super) fn add_subscription(&mut self, new: NewSubscription, now: DateTime<Utc>) -> StoreResult<Subscription> {
        let normalized = normalize_keyword(&new.keyword);
        if normalized.is_empty() {
            return Err(StoreError::Invalid("keyword must not be empty".into()));
        }

        let existing = self
            .subscriptions
            .values_mut()
            .find(|s| s.subscriber_id == new.subscriber_id && s.normalized_keyword() == normalized);

        if let Some(sub) = existing {
            if sub.active {
                return Err(StoreError::conflict(format!("{}:{}", new.subscriber_id, normalized)));
            }
            sub.active = true;
            sub.keyword = new.keyword.trim().to_string();
            sub.display_name = new.display_name;
            sub.channel_id = new.channel_id;
            sub.guild_id = new.guild_id;
            return Ok(sub.clone());
        }

        self.next_subscription_id += 1;
        let sub = Subscription {
            id: SubscriptionId(self.next_subscription_id),
            keyword: new.keyword.trim().to_string(),
            subscriber_id: new.subscriber_id,
            display_name: new.display_name,
            channel_id: new.channel_id,
            guild_id: new.guild_id,
            active: true,
            created_at: now,
            last_matched_at: None,
            match_count: 0,
        };
        self.subscriptions.insert(sub.id.0, sub.clone());
        Ok(sub)
    }

    pub(super) fn deactivate_subscription(&mut self, subscriber_id: &str, keyword: &str) -> StoreResult<()> {
        let normalized = normalize_keyword(keyword);
        let sub = self
            .subscriptions
            .values_mut()
            .find(|s| s.active && s.subscriber_id == subscriber_id && s.normalized_keyword() == normalized)
            .ok_or_else(|| StoreError::not_found(format!("active alert '{keyword}' for {subscriber_id}")))?;
        sub.active = false;
        Ok(())
    }

    fn active(&self) -> impl Iterator<Item = &Subscription> {
        self.subscriptions.values().filter(|s| s.active)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_state(mut state: StoreState) -> Self {
        state.rebuild_index();
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn snapshot_state(&self) -> StoreState {
        self.state.lock().clone()
    }

    /// Swap in a state that was already persisted elsewhere.
    pub(super) fn replace_state(&self, state: StoreState) {
        *self.state.lock() = state;
    }

    pub(super) fn update<T>(&self, apply: impl FnOnce(&mut StoreState) -> T) -> T {
        apply(&mut self.state.lock())
    }

    pub fn listing_by_url(&self, url: &str) -> Option<Listing> {
        let s = self.state.lock();
        s.url_index.get(url).and_then(|id| s.listings.get(id)).cloned()
    }
}

#[async_trait::async_trait]
impl ListingStore for MemoryStore {
    async fn ensure_indexes(&self) -> StoreResult<()> {
        self.state.lock().rebuild_index();
        Ok(())
    }

    async fn listing_exists(&self, url: &str) -> StoreResult<bool> {
        Ok(self.state.lock().url_index.contains_key(url))
    }

    async fn insert_listing(&self, listing: &Listing) -> StoreResult<ListingId> {
        self.state.lock().insert_listing(listing)
    }

    async fn set_matched_keywords(&self, id: ListingId, keywords: &[String]) -> StoreResult<()> {
        self.state.lock().set_matched_keywords(id, keywords)
    }

    async fn mark_listing_notified(&self, id: ListingId) -> StoreResult<()> {
        self.state.lock().mark_listing_notified(id)
    }

    async fn count_listings(&self) -> StoreResult<usize> {
        Ok(self.state.lock().listings.len())
    }

    async fn find_listings(&self, query: &ListingQuery) -> StoreResult<Vec<Listing>> {
        Ok(self.state.lock().find_listings(query))
    }

    async fn is_notified(&self, url: &str) -> StoreResult<bool> {
        Ok(self.state.lock().notified.contains_key(url))
    }

    async fn insert_notified(&self, record: &NotifiedRecord) -> StoreResult<()> {
        self.state.lock().insert_notified(record)
    }

    async fn count_notified(&self) -> StoreResult<usize> {
        Ok(self.state.lock().notified.len())
    }
}

#[async_trait::async_trait]
impl SubscriptionStore for MemoryStore {
    async fn active_subscriptions(&self) -> StoreResult<Vec<Subscription>> {
        Ok(self.state.lock().active().cloned().collect())
    }

    async fn record_match(&self, id: SubscriptionId, at: DateTime<Utc>) -> StoreResult<()> {
        self.state.lock().record_match(id, at)
    }

    async fn add_subscription(&self, new: NewSubscription) -> StoreResult<Subscription> {
        self.state.lock().add_subscription(new, Utc::now())
    }

    async fn deactivate_subscription(&self, subscriber_id: &str, keyword: &str) -> StoreResult<()> {
        self.state.lock().deactivate_subscription(subscriber_id, keyword)
    }

    async fn subscriptions_for(&self, subscriber_id: &str) -> StoreResult<Vec<Subscription>> {
        Ok(self
            .state
            .lock()
            .active()
            .filter(|s| s.subscriber_id == subscriber_id)
            .cloned()
            .collect())
    }

    async fn popular_subscriptions(&self, limit: usize) -> StoreResult<Vec<Subscription>> {
        let limit = if limit == 0 { DEFAULT_POPULAR_LIMIT } else { limit };
        let mut subs: Vec<Subscription> = self
            .state
            .lock()
            .active()
            .filter(|s| s.match_count > 0)
            .cloned()
            .collect();
        subs.sort_by(|a, b| b.match_count.cmp(&a.match_count).then(a.id.cmp(&b.id)));
        subs.truncate(limit);
        Ok(subs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn sub(keyword: &str, subscriber: &str) -> NewSubscription {
        NewSubscription {
            keyword: keyword.into(),
            subscriber_id: subscriber.into(),
            channel_id: "chan".into(),
            ..NewSubscription::default()
        }
    }

    #[tokio::test]
    async fn duplicate_url_insert_conflicts() {
        let store = MemoryStore::new();
        let l = Listing::new("https://a.example/1", "Phone sale");
        let id = store.insert_listing(&l).await.unwrap();
        assert_eq!(id, ListingId(1));
        let err = store.insert_listing(&l).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PersistenceConflict);
        assert_eq!(store.count_listings().await.unwrap(), 1);
        assert!(store.listing_exists("https://a.example/1").await.unwrap());
    }

    #[tokio::test]
    async fn notified_insert_is_once_per_url() {
        let store = MemoryStore::new();
        let l = Listing::new("https://a.example/1", "Phone sale");
        let rec = NotifiedRecord::for_listing(&l, Utc::now());
        store.insert_notified(&rec).await.unwrap();
        assert!(store.insert_notified(&rec).await.unwrap_err().is_conflict());
        assert!(store.is_notified(&l.url).await.unwrap());
        assert_eq!(store.count_notified().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn keyword_unique_per_subscriber_among_active() {
        let store = MemoryStore::new();
        store.add_subscription(sub("Phone", "u1")).await.unwrap();
        let err = store.add_subscription(sub("  phone ", "u1")).await.unwrap_err();
        assert!(err.is_conflict());
        // a different subscriber may use the same keyword
        store.add_subscription(sub("phone", "u2")).await.unwrap();
        assert_eq!(store.active_subscriptions().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn deactivated_subscription_is_retained_and_revived() {
        let store = MemoryStore::new();
        let first = store.add_subscription(sub("tv", "u1")).await.unwrap();
        store.deactivate_subscription("u1", "TV").await.unwrap();
        assert!(store.active_subscriptions().await.unwrap().is_empty());
        assert_eq!(store.snapshot_state().subscriptions.len(), 1);

        let again = store.add_subscription(sub("TV", "u1")).await.unwrap();
        assert_eq!(again.id, first.id);
        assert!(again.active);
        assert_eq!(again.keyword, "TV");

        let err = store.deactivate_subscription("u1", "radio").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn empty_keyword_is_rejected() {
        let store = MemoryStore::new();
        let err = store.add_subscription(sub("   ", "u1")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn popular_sorts_by_match_count() {
        let store = MemoryStore::new();
        let a = store.add_subscription(sub("a", "u1")).await.unwrap();
        let b = store.add_subscription(sub("b", "u1")).await.unwrap();
        store.add_subscription(sub("c", "u1")).await.unwrap();
        store.record_match(a.id, Utc::now()).await.unwrap();
        store.record_match(b.id, Utc::now()).await.unwrap();
        store.record_match(b.id, Utc::now()).await.unwrap();

        let top = store.popular_subscriptions(0).await.unwrap();
        let kws: Vec<_> = top.iter().map(|s| s.keyword.as_str()).collect();
        assert_eq!(kws, vec!["b", "a"]);
        assert_eq!(store.popular_subscriptions(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn find_listings_filters_sorts_and_pages() {
        let store = MemoryStore::new();
        let base = Utc::now();
        for i in 0..5 {
            let mut l = Listing::new(format!("https://a.example/{i}"), format!("item {i}"));
            l.source = if i % 2 == 0 { "A".into() } else { "B".into() };
            l.crawled_at = Some(base + chrono::Duration::seconds(i));
            store.insert_listing(&l).await.unwrap();
        }
        store.mark_listing_notified(ListingId(5)).await.unwrap();

        let q = ListingQuery {
            source: Some("A".into()),
            ..ListingQuery::default()
        };
        let titles: Vec<_> = store
            .find_listings(&q)
            .await
            .unwrap()
            .into_iter()
            .map(|l| l.title)
            .collect();
        assert_eq!(titles, vec!["item 4", "item 2", "item 0"]);

        let q = ListingQuery {
            notified: Some(false),
            limit: Some(2),
            skip: 1,
            ..ListingQuery::default()
        };
        let titles: Vec<_> = store
            .find_listings(&q)
            .await
            .unwrap()
            .into_iter()
            .map(|l| l.title)
            .collect();
        assert_eq!(titles, vec!["item 2", "item 1"]);
    }
}
