// src/ingest/types.rs
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Store-assigned identity of a persisted listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ListingId(pub u64);

/// A deal discovered on one of the aggregation sites.
///
/// `url` is the canonical URL and the deduplication key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ListingId>,
    pub url: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default)]
    pub source: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    /// Price label exactly as the source printed it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discount_rate: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_price: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comments: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub views: Option<u32>,
    #[serde(default)]
    pub is_hot: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crawled_at: Option<DateTime<Utc>>,
    /// Raw keywords of the subscriptions this listing matched.
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub notified: bool,
}

impl Listing {
    pub fn new(url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            ..Self::default()
        }
    }

    /// Case-folded search corpus: title, plus product and category when they
    /// say something the title does not already say.
    pub fn search_text(&self) -> String {
        let mut text = self.title.to_lowercase();
        for extra in [self.product.as_deref(), self.category.as_deref()]
            .into_iter()
            .flatten()
        {
            let extra = extra.trim().to_lowercase();
            if !extra.is_empty() && !text.contains(&extra) {
                text.push(' ');
                text.push_str(&extra);
            }
        }
        text
    }

    /// Human-readable price, if anything is known about it.
    pub fn price_label(&self) -> Option<String> {
        if let Some(label) = self.price_text.as_deref().map(str::trim) {
            if !label.is_empty() {
                return Some(label.to_string());
            }
        }
        let amount = self.price.filter(|p| *p > 0)?;
        let currency = self.currency.as_deref().unwrap_or("KRW");
        Some(format!("{} {}", group_thousands(amount), currency))
    }

    /// Fill in provenance a source adapter may have left blank.
    pub fn tag_provenance(&mut self, source_name: &str, now: DateTime<Utc>) {
        if self.source.is_empty() {
            self.source = source_name.to_string();
        }
        if self.crawled_at.is_none() {
            self.crawled_at = Some(now);
        }
    }
}

fn group_thousands(n: i64) -> String {
    let digits = n.unsigned_abs().to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    if n < 0 {
        out.push('-');
    }
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// One deal site. Implementations must be safe to crawl concurrently with
/// other sources and should observe `cancel` at their own await points.
#[async_trait::async_trait]
pub trait Source: Send + Sync {
    fn name(&self) -> &str;
    async fn crawl(&self, cancel: &CancellationToken) -> Result<Vec<Listing>>;
}
