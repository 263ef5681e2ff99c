// src/notify/render.rs
use std::collections::HashSet;

use super::{Notification, NotificationField};
use crate::alerts::Subscription;
use crate::ingest::types::Listing;

pub const COLOR_DEFAULT: u32 = 0x00ff00;
pub const COLOR_HOT: u32 = 0xff0000;
pub const COLOR_BIG_DISCOUNT: u32 = 0xff6600;

/// Build the single notification for `listing` from its matching subscriptions.
pub fn render_notification(listing: &Listing, matches: &[Subscription]) -> Notification {
    let mut keywords: Vec<String> = Vec::new();
    for s in matches {
        if !keywords.contains(&s.keyword) {
            keywords.push(s.keyword.clone());
        }
    }

    let mut seen = HashSet::new();
    let mentions: Vec<String> = matches
        .iter()
        .filter(|s| seen.insert(s.subscriber_id.as_str()))
        .map(Subscription::mention)
        .collect();

    let mut fields = vec![field("Source", &listing.source, true)];
    if let Some(price) = listing.price_label() {
        fields.push(field("Price", &price, true));
    }
    if let Some(rate) = listing.discount_rate.filter(|r| *r > 0) {
        fields.push(field("Discount", &format!("{rate}%"), true));
    }
    if listing.comments.is_some() || listing.views.is_some() {
        fields.push(field(
            "Stats",
            &format!(
                "Comments: {} | Views: {}",
                listing.comments.unwrap_or(0),
                listing.views.unwrap_or(0)
            ),
            true,
        ));
    }
    fields.push(field("Matched Keywords", &keywords.join(", "), false));

    let description = if mentions.is_empty() {
        "Found a deal matching your alert!".to_string()
    } else {
        format!("Found a deal matching your alert! {}", mentions.join(" "))
    };

    Notification {
        title: listing.title.clone(),
        url: listing.url.clone(),
        description,
        color: color_for(listing),
        fields,
        footer: listing
            .crawled_at
            .map(|t| format!("Crawled at {}", t.format("%Y-%m-%d %H:%M:%S"))),
        image_url: listing.image_url.clone().filter(|u| !u.is_empty()),
        keywords,
        mentions,
    }
}

fn color_for(listing: &Listing) -> u32 {
    if listing.is_hot {
        COLOR_HOT
    } else if listing.discount_rate.unwrap_or(0) >= 50 {
        COLOR_BIG_DISCOUNT
    } else {
        COLOR_DEFAULT
    }
}

fn field(name: &str, value: &str, inline: bool) -> NotificationField {
    NotificationField {
        name: name.to_string(),
        value: value.to_string(),
        inline,
    }
}
