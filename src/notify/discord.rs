// src/notify/discord.rs
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::Client;
use serde::Serialize;

use super::{Notification, NotificationChannel};

pub const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";

/// Posts notifications as bot messages into Discord channels.
///
/// One request per delivery. Retrying is left to the next cycle, since an
/// undelivered listing stays un-notified.
#[derive(Clone)]
pub struct DiscordChannel {
    api_base: String,
    token: String,
    client: Client,
    timeout: Duration,
}

impl DiscordChannel {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            token: token.into(),
            client: Client::new(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into().trim_end_matches('/').to_string();
        self
    }

    /// Per-request timeout. Defaults to 10 seconds.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn messages_url(&self, channel_id: &str) -> String {
        format!("{}/channels/{}/messages", self.api_base, channel_id)
    }
}

#[async_trait::async_trait]
impl NotificationChannel for DiscordChannel {
    async fn deliver(&self, channel_id: &str, notification: &Notification) -> Result<()> {
        let payload = DiscordMessage::from_notification(notification);
        let rsp = self
            .client
            .post(self.messages_url(channel_id))
            .header("Authorization", format!("Bot {}", self.token))
            .timeout(self.timeout)
            .json(&payload)
            .send()
            .await
            .context("Discord request failed")?;

        let status = rsp.status();
        if !status.is_success() {
            let body = rsp.text().await.unwrap_or_default();
            return Err(anyhow!(
                "Discord HTTP {}: {}",
                status.as_u16(),
                body.chars().take(200).collect::<String>()
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct EmbedField {
    name: String,
    value: String,
    inline: bool,
}

#[derive(Debug, Serialize)]
struct EmbedFooter {
    text: String,
}

#[derive(Debug, Serialize)]
struct EmbedImage {
    url: String,
}

#[derive(Debug, Serialize)]
struct DiscordEmbed {
    title: String,
    url: String,
    description: String,
    color: u32,
    fields: Vec<EmbedField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    footer: Option<EmbedFooter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<EmbedImage>,
}

#[derive(Debug, Serialize)]
struct DiscordMessage {
    embeds: Vec<DiscordEmbed>,
}

impl DiscordMessage {
    fn from_notification(n: &Notification) -> Self {
        // Embed titles are capped at 256 characters.
        let title: String = n.title.chars().take(256).collect();
        Self {
            embeds: vec![DiscordEmbed {
                title,
                url: n.url.clone(),
                description: n.description.clone(),
                color: n.color,
                fields: n
                    .fields
                    .iter()
                    .map(|f| EmbedField {
                        name: f.name.clone(),
                        value: f.value.clone(),
                        inline: f.inline,
                    })
                    .collect(),
                footer: n.footer.clone().map(|text| EmbedFooter { text }),
                image: n.image_url.clone().map(|url| EmbedImage { url }),
            }],
        }
    }
}
