// src/notify/mod.rs
pub mod discord;
pub mod dispatch;
pub mod log;
pub mod ratelimit;
pub mod render;

use anyhow::Result;
use serde::Serialize;

pub use dispatch::{DispatchResult, Dispatcher, DispatcherCfg, ListingOutcome};
pub use ratelimit::RateLimiter;
pub use render::render_notification;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

/// Rendered once per listing and delivered unchanged to every channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub title: String,
    pub url: String,
    pub description: String,
    pub color: u32,
    pub fields: Vec<NotificationField>,
    pub footer: Option<String>,
    pub image_url: Option<String>,
    /// Union of matched raw keywords, first-seen order.
    pub keywords: Vec<String>,
    /// One mention per distinct subscriber.
    pub mentions: Vec<String>,
}

/// Delivery target (a Discord channel in production).
#[async_trait::async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn deliver(&self, channel_id: &str, notification: &Notification) -> Result<()>;
}
