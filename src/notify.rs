use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;

use crate::{health::HealthState, util};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Info,
    Warning,
    Failure,
    Recovered,
}

impl NotificationKind {
    /// Discord embed colour.
    pub fn color(&self) -> u32 {
        match self {
            NotificationKind::Info => 0x5865F2,
            NotificationKind::Warning => 0xFFAA00,
            NotificationKind::Failure => 0xFF0000,
            NotificationKind::Recovered => 0x00FF00,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
}

impl Notification {
    pub fn new(kind: NotificationKind, title: &str, message: String) -> Self {
        Self {
            kind,
            title: title.to_string(),
            message,
        }
    }

    pub fn transition(
        kind: NotificationKind,
        title: &str,
        from: HealthState,
        to: HealthState,
        reason: String,
    ) -> Self {
        Self::new(kind, title, format!("**{} → {}**\n{}", from, to, reason))
    }

    pub fn with_line(mut self, line: &str) -> Self {
        self.message.push('\n');
        self.message.push_str(line);
        self
    }
}

#[derive(thiserror::Error, Debug)]
pub enum NotifyError {
    #[error("webhook request failed: {0}")]
    Http(#[from] util::HttpError),
}

/// Outbound notification channel. Implementations report failures to the
/// caller, which logs and drops them.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Used when no notification target is configured.
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        debug!("Notification not sent (no target): {}", notification.title);
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    embeds: [Embed<'a>; 1],
}

#[derive(Debug, Serialize)]
struct Embed<'a> {
    title: &'a str,
    description: &'a str,
    color: u32,
    timestamp: String,
}

/// Posts Discord embeds to a webhook URL.
pub struct DiscordNotifier {
    http: util::HttpClient,
    webhook_url: String,
}

impl DiscordNotifier {
    pub fn new(webhook_url: &str, timeout: Duration) -> reqwest::Result<Self> {
        Ok(Self {
            http: util::HttpClient::without_retries(timeout)?,
            webhook_url: webhook_url.to_string(),
        })
    }
}

#[async_trait]
impl Notifier for DiscordNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        let payload = WebhookPayload {
            embeds: [Embed {
                title: &notification.title,
                description: &notification.message,
                color: notification.kind.color(),
                timestamp: Utc::now().to_rfc3339(),
            }],
        };

        let resp = self
            .http
            .client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await
            .map_err(util::HttpError::from)?;
        util::check_status(resp).await?;

        Ok(())
    }
}
