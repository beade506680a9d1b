//! Alert delivery

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::{NotifierConfig, WebhookFormat};
use crate::error::{Error, Result};
use crate::models::{AlertEvent, AlertKind};

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Where emitted alerts go.
///
/// A failed delivery is reported to the caller but never rolls back the
/// state change that produced the alert.
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Deliver one alert
    async fn deliver(&self, event: &AlertEvent) -> Result<()>;
}

/// Build the sink described by `config`: a webhook when a URL is set,
/// otherwise a sink that only logs
pub fn sink_from_config(config: &NotifierConfig) -> Result<Box<dyn AlertSink>> {
    match config.webhook_url.as_deref().filter(|u| !u.trim().is_empty()) {
        Some(url) => Ok(Box::new(WebhookSink::new(url, config.format)?)),
        None => {
            info!("No webhook configured, alerts will only be logged");
            Ok(Box::new(LogSink))
        }
    }
}

/// Posts alerts to a webhook as Discord embeds or plain JSON
pub struct WebhookSink {
    client: Client,
    url: String,
    format: WebhookFormat,
}

impl WebhookSink {
    /// Create a webhook sink
    pub fn new(url: impl Into<String>, format: WebhookFormat) -> Result<Self> {
        let url = url.into();
        url::Url::parse(&url).map_err(|e| Error::config(format!("invalid webhook URL: {e}")))?;

        let client = Client::builder()
            .timeout(DELIVERY_TIMEOUT)
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, url, format })
    }

    fn body(&self, event: &AlertEvent) -> serde_json::Result<serde_json::Value> {
        match self.format {
            WebhookFormat::Discord => serde_json::to_value(DiscordPayload::from(event)),
            WebhookFormat::Generic => serde_json::to_value(event),
        }
    }
}

#[async_trait]
impl AlertSink for WebhookSink {
    async fn deliver(&self, event: &AlertEvent) -> Result<()> {
        let body = self.body(event)?;

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::delivery(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(Error::delivery(format!("webhook returned {status}: {text}")));
        }

        debug!(target_id = %event.target_id, dedup_key = %event.dedup_key, "Webhook notification sent");
        Ok(())
    }
}

/// Hands alerts to an in-process receiver
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<AlertEvent>,
}

impl ChannelSink {
    /// Create a sink and the receiver its alerts arrive on
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AlertEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl AlertSink for ChannelSink {
    async fn deliver(&self, event: &AlertEvent) -> Result<()> {
        self.tx
            .send(event.clone())
            .map_err(|_| Error::delivery("alert receiver dropped"))
    }
}

/// Writes alerts to the log and nowhere else
pub struct LogSink;

#[async_trait]
impl AlertSink for LogSink {
    async fn deliver(&self, event: &AlertEvent) -> Result<()> {
        info!(
            target_id = %event.target_id,
            chain = %event.chain,
            title = %event.payload.title,
            "{}",
            event.payload.message
        );
        Ok(())
    }
}

// Discord payload types
#[derive(Debug, Serialize)]
struct DiscordPayload {
    embeds: Vec<DiscordEmbed>,
}

#[derive(Debug, Serialize)]
struct DiscordEmbed {
    title: String,
    description: String,
    color: u32,
    fields: Vec<DiscordField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thumbnail: Option<DiscordImage>,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct DiscordField {
    name: String,
    value: String,
    inline: bool,
}

#[derive(Debug, Serialize)]
struct DiscordImage {
    url: String,
}

impl From<&AlertEvent> for DiscordPayload {
    fn from(event: &AlertEvent) -> Self {
        let color = match event.kind {
            AlertKind::SupplyThreshold { .. } => 0x00ff_0000,
            AlertKind::NewHolding { .. } => 0x0000_ff00,
        };

        Self {
            embeds: vec![DiscordEmbed {
                title: event.payload.title.clone(),
                description: event.payload.message.clone(),
                color,
                fields: event
                    .payload
                    .fields
                    .iter()
                    .map(|f| DiscordField {
                        name: f.name.clone(),
                        value: f.value.clone(),
                        inline: f.inline,
                    })
                    .collect(),
                url: event.payload.url.clone(),
                thumbnail: event
                    .payload
                    .image_url
                    .clone()
                    .map(|url| DiscordImage { url }),
                timestamp: event.created_at,
            }],
        }
    }
}
