// src/notify/log.rs
use anyhow::Result;

use super::{Notification, NotificationChannel};

/// Dry-run channel: logs what would have been sent.
#[derive(Debug, Clone, Default)]
pub struct LogChannel;

#[async_trait::async_trait]
impl NotificationChannel for LogChannel {
    async fn deliver(&self, channel_id: &str, notification: &Notification) -> Result<()> {
        tracing::info!(
            channel_id,
            title = %notification.title,
            url = %notification.url,
            keywords = %notification.keywords.join(", "),
            mentions = %notification.mentions.join(" "),
            "dry-run notification"
        );
        Ok(())
    }
}
