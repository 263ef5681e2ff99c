// src/store/mod.rs
//! Persistence seams for listings, notified tombstones and subscriptions.
//!
//! The unique keys (listing URL, notified URL, subscriber + normalized
//! keyword) are enforced here and are the source of truth for races between
//! overlapping cycles. A losing insert surfaces as [`StoreError::Conflict`].

pub mod file;
pub mod memory;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::alerts::{NewSubscription, Subscription, SubscriptionId};
use crate::error::StoreError;
use crate::ingest::types::{Listing, ListingId};

pub use file::FileStore;
pub use memory::MemoryStore;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Tombstone written once a listing reached at least one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifiedRecord {
    pub url: String,
    pub title: String,
    pub notified_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listing_id: Option<ListingId>,
}

impl NotifiedRecord {
    pub fn for_listing(listing: &Listing, at: DateTime<Utc>) -> Self {
        Self {
            url: listing.url.clone(),
            title: listing.title.clone(),
            notified_at: at,
            listing_id: listing.id,
        }
    }
}

/// Filter + paging for [`ListingStore::find_listings`]. Results are sorted
/// newest crawl first.
#[derive(Debug, Clone, Default)]
pub struct ListingQuery {
    pub source: Option<String>,
    pub notified: Option<bool>,
    pub limit: Option<usize>,
    pub skip: usize,
}

#[async_trait::async_trait]
pub trait ListingStore: Send + Sync {
    /// Create unique/text indexes. Best effort; callers log failures.
    async fn ensure_indexes(&self) -> StoreResult<()>;

    async fn listing_exists(&self, url: &str) -> StoreResult<bool>;
    /// Insert if absent. Duplicate URL yields `Conflict`.
    async fn insert_listing(&self, listing: &Listing) -> StoreResult<ListingId>;
    async fn set_matched_keywords(&self, id: ListingId, keywords: &[String]) -> StoreResult<()>;
    async fn mark_listing_notified(&self, id: ListingId) -> StoreResult<()>;
    async fn count_listings(&self) -> StoreResult<usize>;
    async fn find_listings(&self, query: &ListingQuery) -> StoreResult<Vec<Listing>>;

    async fn is_notified(&self, url: &str) -> StoreResult<bool>;
    /// Insert if absent. Duplicate URL yields `Conflict`.
    async fn insert_notified(&self, record: &NotifiedRecord) -> StoreResult<()>;
    async fn count_notified(&self) -> StoreResult<usize>;
}

#[async_trait::async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn active_subscriptions(&self) -> StoreResult<Vec<Subscription>>;
    /// Bump `match_count` and set `last_matched_at`.
    async fn record_match(&self, id: SubscriptionId, at: DateTime<Utc>) -> StoreResult<()>;

    async fn add_subscription(&self, new: NewSubscription) -> StoreResult<Subscription>;
    async fn deactivate_subscription(&self, subscriber_id: &str, keyword: &str) -> StoreResult<()>;
    async fn subscriptions_for(&self, subscriber_id: &str) -> StoreResult<Vec<Subscription>>;
    /// Most-matched active subscriptions. `limit == 0` means 10.
    async fn popular_subscriptions(&self, limit: usize) -> StoreResult<Vec<Subscription>>;
}
