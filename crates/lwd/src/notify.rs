//! Notification dispatch.
//!
//! The pipelines call [`Notifier::notify`] once per detected online
//! transition. Delivery failures are reported back but never retried: the
//! liveness state is written regardless, so a failed send is not repeated on
//! the next tick.

use async_trait::async_trait;
use lw_core::{ChannelRecord, LiveStream};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

/// Public link prefix for a channel handle.
pub const CHANNEL_URL_BASE: &str = "https://twitch.tv/";

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("notification rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Delivers "went live" notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// `stream` carries metadata when it could be fetched; `None` otherwise.
    async fn notify(&self, record: &ChannelRecord, stream: Option<&LiveStream>) -> Result<(), NotifyError>;
}

/// Renders the go-live message.
///
/// ```text
/// 🔴 Display is now live!
///
/// 📺 Title
/// 🎮 Category
/// 👥 42 viewers
///
/// 🔗 https://twitch.tv/handle
/// ```
///
/// The metadata block is omitted when `stream` is `None`.
pub fn format_message(record: &ChannelRecord, stream: Option<&LiveStream>) -> String {
    let mut message = format!("🔴 {} is now live!\n\n", record.display_name);

    if let Some(stream) = stream {
        message.push_str(&format!(
            "📺 {}\n🎮 {}\n👥 {} viewers\n\n",
            stream.title, stream.category, stream.viewer_count
        ));
    }

    message.push_str("🔗 ");
    message.push_str(CHANNEL_URL_BASE);
    message.push_str(record.handle.as_str());
    message
}

// ============================================================================
// Log Notifier
// ============================================================================

/// Writes notifications to the log. Used when no delivery target is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, record: &ChannelRecord, stream: Option<&LiveStream>) -> Result<(), NotifyError> {
        info!(
            handle = %record.handle,
            channel_id = %record.channel_id,
            title = stream.map(|s| s.title.as_str()).unwrap_or(""),
            "Channel went live"
        );
        Ok(())
    }
}

// ============================================================================
// Telegram Notifier
// ============================================================================

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: i64,
    text: &'a str,
}

/// Posts notifications to one Telegram chat through the Bot API.
pub struct TelegramNotifier {
    http: reqwest::Client,
    bot_token: String,
    chat_id: i64,
    base_url: String,
}

impl TelegramNotifier {
    pub fn new(http: reqwest::Client, bot_token: impl Into<String>, chat_id: i64) -> Self {
        Self::with_base_url(http, bot_token, chat_id, TELEGRAM_API_BASE)
    }

    /// Create a notifier against a specific base URL (useful for testing).
    pub fn with_base_url(
        http: reqwest::Client,
        bot_token: impl Into<String>,
        chat_id: i64,
        base_url: &str,
    ) -> Self {
        Self {
            http,
            bot_token: bot_token.into(),
            chat_id,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

impl std::fmt::Debug for TelegramNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramNotifier")
            .field("chat_id", &self.chat_id)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, record: &ChannelRecord, stream: Option<&LiveStream>) -> Result<(), NotifyError> {
        let text = format_message(record, stream);
        let url = format!("{}/bot{}/sendMessage", self.base_url, self.bot_token);

        let response = self
            .http
            .post(&url)
            .json(&SendMessage {
                chat_id: self.chat_id,
                text: &text,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        debug!(handle = %record.handle, chat_id = self.chat_id, "Notification sent");
        Ok(())
    }
}
