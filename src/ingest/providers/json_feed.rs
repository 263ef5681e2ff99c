// src/ingest/providers/json_feed.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use metrics::{counter, histogram};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::ingest::fetch::Fetcher;
use crate::ingest::types::{Listing, Source};
use crate::ingest::{canonical_url, normalize_text};

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Feed {
    Items(Vec<Item>),
    Wrapped { items: Vec<Item> },
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Item {
    title: Option<String>,
    #[serde(alias = "link")]
    url: Option<String>,
    product: Option<String>,
    category: Option<String>,
    price: Option<i64>,
    currency: Option<String>,
    price_text: Option<String>,
    discount_rate: Option<u8>,
    original_price: Option<i64>,
    comments: Option<u32>,
    views: Option<u32>,
    #[serde(alias = "hot")]
    is_hot: bool,
    #[serde(alias = "image")]
    image_url: Option<String>,
}

/// Deal feed published as JSON: either a bare array of items or
/// `{ "items": [...] }`.
pub struct JsonFeedSource {
    name: String,
    feed_url: String,
    fetcher: Fetcher,
}

impl JsonFeedSource {
    pub fn new(name: impl Into<String>, feed_url: impl Into<String>, fetcher: Fetcher) -> Self {
        Self {
            name: name.into(),
            feed_url: feed_url.into(),
            fetcher,
        }
    }

    /// Map a feed body into listings. Items without a usable link or title
    /// are skipped.
    pub fn parse_feed(&self, body: &[u8]) -> Result<Vec<Listing>> {
        let t0 = std::time::Instant::now();
        let feed: Feed = serde_json::from_slice(body)
            .with_context(|| format!("parsing {} feed", self.name))?;
        let items = match feed {
            Feed::Items(v) | Feed::Wrapped { items: v } => v,
        };

        let mut out = Vec::with_capacity(items.len());
        for it in items {
            let Some(url) = it.url.as_deref().and_then(|u| canonical_url(u, &self.feed_url)) else {
                continue;
            };
            let title = normalize_text(it.title.as_deref().unwrap_or_default());
            if title.is_empty() {
                continue;
            }
            let clean = |s: Option<String>| s.map(|v| normalize_text(&v)).filter(|v| !v.is_empty());
            out.push(Listing {
                url,
                title,
                product: clean(it.product),
                category: clean(it.category),
                source: self.name.clone(),
                price: it.price,
                currency: it.currency,
                price_text: clean(it.price_text),
                discount_rate: it.discount_rate,
                original_price: it.original_price,
                comments: it.comments,
                views: it.views,
                is_hot: it.is_hot,
                image_url: it.image_url.and_then(|u| canonical_url(&u, &self.feed_url)),
                ..Listing::default()
            });
        }

        let ms = t0.elapsed().as_secs_f64() * 1_000.0;
        histogram!("deals_feed_parse_ms").record(ms);
        Ok(out)
    }
}

#[async_trait]
impl Source for JsonFeedSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn crawl(&self, cancel: &CancellationToken) -> Result<Vec<Listing>> {
        let body = self
            .fetcher
            .fetch(&self.feed_url, cancel)
            .await
            .with_context(|| format!("fetching {} feed", self.name))?;
        let listings = self.parse_feed(&body)?;
        counter!("deals_feed_items_total").increment(listings.len() as u64);
        tracing::debug!(source = %self.name, count = listings.len(), "parsed feed");
        Ok(listings)
    }
}
