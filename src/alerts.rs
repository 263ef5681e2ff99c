// src/alerts.rs
//! Keyword subscriptions and the matcher that pairs them with listings.
//!
//! Matching is plain case-insensitive substring containment against
//! [`Listing::search_text`]. "Mon" matches "Monitor deal"; unrelated
//! substrings producing false positives is accepted behaviour.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::ingest::types::Listing;
use crate::store::{ListingStore, SubscriptionStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

/// A subscriber's standing interest in a keyword.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    /// As the subscriber typed it; shown back in notifications.
    pub keyword: String,
    pub subscriber_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub channel_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guild_id: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_matched_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub match_count: u64,
}

impl Subscription {
    pub fn normalized_keyword(&self) -> String {
        normalize_keyword(&self.keyword)
    }

    /// Mention text: `@name` when a display name is known, `<@id>` otherwise.
    pub fn mention(&self) -> String {
        match self.display_name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => format!("@{name}"),
            _ => format!("<@{}>", self.subscriber_id),
        }
    }
}

/// Input for [`SubscriptionStore::add_subscription`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct NewSubscription {
    pub keyword: String,
    pub subscriber_id: String,
    pub display_name: Option<String>,
    pub channel_id: String,
    pub guild_id: Option<String>,
}

pub fn normalize_keyword(keyword: &str) -> String {
    keyword.trim().to_lowercase()
}

pub struct AlertMatcher {
    subscriptions: Arc<dyn SubscriptionStore>,
    listings: Arc<dyn ListingStore>,
}

impl AlertMatcher {
    pub fn new(subscriptions: Arc<dyn SubscriptionStore>, listings: Arc<dyn ListingStore>) -> Self {
        Self {
            subscriptions,
            listings,
        }
    }

    /// Return every active subscription whose keyword occurs in the listing.
    ///
    /// Annotates `listing.keywords` with the raw keywords and updates the
    /// subscriptions' match statistics. Those writes are advisory: failures
    /// are logged and matching carries on.
    pub async fn match_listing(&self, listing: &mut Listing) -> Result<Vec<Subscription>, PipelineError> {
        let active = self.subscriptions.active_subscriptions().await?;
        let corpus = listing.search_text();
        let now = Utc::now();

        let mut matched = Vec::new();
        for sub in active {
            let keyword = sub.normalized_keyword();
            if keyword.is_empty() || !corpus.contains(&keyword) {
                continue;
            }

            if let Err(e) = self.subscriptions.record_match(sub.id, now).await {
                tracing::warn!(error = %e, subscription = sub.id.0, "failed to update match stats");
            }
            if !listing.keywords.iter().any(|k| k == &sub.keyword) {
                listing.keywords.push(sub.keyword.clone());
            }
            matched.push(sub);
        }

        if !matched.is_empty() {
            counter!("deals_alert_matches_total").increment(matched.len() as u64);
            if let Some(id) = listing.id {
                if let Err(e) = self.listings.set_matched_keywords(id, &listing.keywords).await {
                    tracing::warn!(error = %e, listing = id.0, "failed to store matched keywords");
                }
            }
            tracing::info!(
                title = %listing.title,
                matches = matched.len(),
                keywords = ?listing.keywords,
                "listing matched subscriptions"
            );
        }

        Ok(matched)
    }
}
