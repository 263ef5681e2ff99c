// src/store/file.rs
//! JSON snapshot persistence on top of [`MemoryStore`].
//!
//! State is loaded once at open. A durable write (listing, notified record,
//! subscription change) is applied to a copy of the state, written out via
//! temp file + rename, and only then swapped into memory. A failed write
//! therefore leaves memory and disk as they were and surfaces as
//! `StoreError::Io`, which the pipeline classifies as the store being
//! unavailable.
//!
//! Match annotations (a listing's matched keywords, subscription match
//! counters) are advisory. They change memory only and reach disk with the
//! next durable write or [`FileStore::flush`].
//!
//! Every durable write rewrites the whole snapshot, so write cost grows with
//! the number of stored listings. Tens of thousands of listings stay in the
//! low-millisecond range; beyond that a database-backed store is the better fit.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::sync::Mutex;

use super::memory::StoreState;
use super::{ListingQuery, ListingStore, MemoryStore, NotifiedRecord, StoreResult, SubscriptionStore};
use crate::alerts::{NewSubscription, Subscription, SubscriptionId};
use crate::ingest::types::{Listing, ListingId};

pub struct FileStore {
    mem: MemoryStore,
    path: PathBuf,
    /// Serializes every mutation. Holds true while annotations are in
    /// memory only.
    write_lock: Mutex<bool>,
}

impl FileStore {
    /// Open `path`, starting empty when the file does not exist yet.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let state = match fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => StoreState::default(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreState::default(),
            Err(e) => return Err(e.into()),
        };
        tracing::info!(path = %path.display(), "opened file store");
        Ok(Self {
            mem: MemoryStore::from_state(state),
            path,
            write_lock: Mutex::new(false),
        })
    }

    /// Write annotations that so far only live in memory.
    pub async fn flush(&self) -> StoreResult<()> {
        let mut pending = self.write_lock.lock().await;
        if !*pending {
            return Ok(());
        }
        self.write_snapshot(&self.mem.snapshot_state()).await?;
        *pending = false;
        Ok(())
    }

    /// Apply `apply` to a copy of the state, persist the copy, then make it
    /// the live state.
    async fn commit<T, F>(&self, apply: F) -> StoreResult<T>
    where
        T: Send,
        F: FnOnce(&mut StoreState) -> StoreResult<T> + Send,
    {
        let mut pending = self.write_lock.lock().await;
        let mut next = self.mem.snapshot_state();
        let out = apply(&mut next)?;
        self.write_snapshot(&next).await?;
        self.mem.replace_state(next);
        *pending = false;
        Ok(out)
    }

    /// Apply an advisory change in memory; it is written out later.
    async fn annotate<F>(&self, apply: F) -> StoreResult<()>
    where
        F: FnOnce(&mut StoreState) -> StoreResult<()> + Send,
    {
        let mut pending = self.write_lock.lock().await;
        self.mem.update(apply)?;
        *pending = true;
        Ok(())
    }

    async fn write_snapshot(&self, state: &StoreState) -> StoreResult<()> {
        let bytes = serde_json::to_vec(state)?;

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ListingStore for FileStore {
    async fn ensure_indexes(&self) -> StoreResult<()> {
        self.mem.ensure_indexes().await
    }

    async fn listing_exists(&self, url: &str) -> StoreResult<bool> {
        self.mem.listing_exists(url).await
    }

    async fn insert_listing(&self, listing: &Listing) -> StoreResult<ListingId> {
        self.commit(|s| s.insert_listing(listing)).await
    }

    async fn set_matched_keywords(&self, id: ListingId, keywords: &[String]) -> StoreResult<()> {
        self.annotate(|s| s.set_matched_keywords(id, keywords)).await
    }

    async fn mark_listing_notified(&self, id: ListingId) -> StoreResult<()> {
        self.commit(|s| s.mark_listing_notified(id)).await
    }

    async fn count_listings(&self) -> StoreResult<usize> {
        self.mem.count_listings().await
    }

    async fn find_listings(&self, query: &ListingQuery) -> StoreResult<Vec<Listing>> {
        self.mem.find_listings(query).await
    }

    async fn is_notified(&self, url: &str) -> StoreResult<bool> {
        self.mem.is_notified(url).await
    }

    async fn insert_notified(&self, record: &NotifiedRecord) -> StoreResult<()> {
        self.commit(|s| s.insert_notified(record)).await
    }

    async fn count_notified(&self) -> StoreResult<usize> {
        self.mem.count_notified().await
    }
}

#[async_trait::async_trait]
impl SubscriptionStore for FileStore {
    async fn active_subscriptions(&self) -> StoreResult<Vec<Subscription>> {
        self.mem.active_subscriptions().await
    }

    async fn record_match(&self, id: SubscriptionId, at: DateTime<Utc>) -> StoreResult<()> {
        self.annotate(|s| s.record_match(id, at)).await
    }

    async fn add_subscription(&self, new: NewSubscription) -> StoreResult<Subscription> {
        let now = Utc::now();
        self.commit(move |s| s.add_subscription(new, now)).await
    }

    async fn deactivate_subscription(&self, subscriber_id: &str, keyword: &str) -> StoreResult<()> {
        self.commit(|s| s.deactivate_subscription(subscriber_id, keyword)).await
    }

    async fn subscriptions_for(&self, subscriber_id: &str) -> StoreResult<Vec<Subscription>> {
        self.mem.subscriptions_for(subscriber_id).await
    }

    async fn popular_subscriptions(&self, limit: usize) -> StoreResult<Vec<Subscription>> {
        self.mem.popular_subscriptions(limit).await
    }
}
