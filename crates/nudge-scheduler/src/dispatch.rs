//! Notification dispatch — actually sends reminders to the user's channel.
//! Supports: Telegram Bot API, HTTP Webhook, local command.

use async_trait::async_trait;
use nudge_core::config::NudgeConfig;
use nudge_core::error::{NudgeError, Result};
use nudge_core::traits::{Notifier, SendReport};
use nudge_core::types::{ChannelSelector, SendingNotification};
use uuid::Uuid;

/// Routes every notification to the channel its params select.
pub struct ChannelNotifier {
    client: reqwest::Client,
    telegram_token: Option<String>,
    webhook_headers: Vec<(String, String)>,
}

impl ChannelNotifier {
    pub fn new(telegram_token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            telegram_token,
            webhook_headers: Vec::new(),
        }
    }

    /// Build from config. Telegram stays unavailable without a bot token.
    pub fn from_config(config: &NudgeConfig) -> Self {
        let mut notifier = Self::new(config.telegram_token().map(String::from));
        notifier.webhook_headers = config.webhook.headers.clone();
        notifier
    }

    /// Dispatch one notification to its channel.
    pub async fn dispatch(&self, notification: &SendingNotification) -> Result<()> {
        match &notification.params.channel {
            ChannelSelector::Telegram { chat_id } => {
                self.send_telegram(*chat_id, notification).await
            }
            ChannelSelector::Webhook { url } => self.send_webhook(url, notification).await,
            ChannelSelector::Command { program, args } => {
                run_command(program, args, notification).await
            }
        }
    }

    /// Send notification via Telegram Bot API.
    async fn send_telegram(&self, chat_id: i64, notification: &SendingNotification) -> Result<()> {
        let token = self.telegram_token.as_deref().ok_or_else(|| {
            NudgeError::Channel("Telegram channel selected but no bot token configured".into())
        })?;
        let url = format!("https://api.telegram.org/bot{token}/sendMessage");

        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "chat_id": chat_id,
                "text": telegram_text(notification),
                "parse_mode": "Markdown"
            }))
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| NudgeError::Channel(format!("Telegram send failed: {e}")))?;

        if resp.status().is_success() {
            tracing::info!("✅ Telegram reminder sent: {}", notification.message);
            Ok(())
        } else {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            Err(NudgeError::Channel(format!("Telegram API error {status}: {body}")))
        }
    }

    /// Send notification via generic HTTP webhook.
    async fn send_webhook(&self, url: &str, notification: &SendingNotification) -> Result<()> {
        let mut req = self
            .client
            .post(url)
            .json(&webhook_body(notification))
            .timeout(std::time::Duration::from_secs(10));

        for (key, value) in &self.webhook_headers {
            req = req.header(key.as_str(), value.as_str());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| NudgeError::Channel(format!("Webhook send failed: {e}")))?;

        if resp.status().is_success() {
            tracing::info!("✅ Webhook reminder sent to {url}: {}", notification.message);
            Ok(())
        } else {
            let status = resp.status();
            Err(NudgeError::Channel(format!("Webhook error {status}")))
        }
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn send(&self, batch: &[SendingNotification]) -> Result<SendReport> {
        let mut report = SendReport::default();
        for notification in batch {
            if let Err(e) = self.dispatch(notification).await {
                tracing::warn!(
                    "⚠️ Reminder {} for user {} not delivered: {e}",
                    notification.source_id,
                    notification.user_id
                );
                report.reject(notification.source_id, e.to_string());
            }
        }
        Ok(report)
    }

    async fn cancel(&self, source_id: Uuid) -> Result<()> {
        // Nothing is queued on our side and delivered messages cannot be recalled.
        tracing::debug!("🚫 Cancel requested for {source_id}: nothing to retract");
        Ok(())
    }
}

/// Run a local command with the message as its last argument.
async fn run_command(
    program: &str,
    args: &[String],
    notification: &SendingNotification,
) -> Result<()> {
    let output = tokio::process::Command::new(program)
        .args(args)
        .arg(&notification.message)
        .env("NUDGE_SOURCE_ID", notification.source_id.to_string())
        .env("NUDGE_USER_ID", notification.user_id.to_string())
        .env("NUDGE_DESCRIPTION", &notification.description)
        .env("NUDGE_SEND_TIME", notification.send_time.to_rfc3339())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| NudgeError::Channel(format!("Command '{program}' failed to start: {e}")))?;

    if output.status.success() {
        tracing::info!("✅ Command '{program}' delivered: {}", notification.message);
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(NudgeError::Channel(format!(
            "Command '{program}' exited with {}: {}",
            output.status,
            stderr.trim()
        )))
    }
}

fn telegram_text(notification: &SendingNotification) -> String {
    let mut text = format!("⏰ *{}*", escape_markdown(&notification.message));
    if !notification.description.is_empty() {
        text.push_str("\n\n");
        text.push_str(&escape_markdown(&notification.description));
    }
    text.push_str(&format!(
        "\n\n_{}_",
        notification.send_time.format("%Y-%m-%d %H:%M UTC")
    ));
    text
}

fn webhook_body(notification: &SendingNotification) -> serde_json::Value {
    serde_json::json!({
        "source_id": notification.source_id,
        "user_id": notification.user_id,
        "message": notification.message,
        "description": notification.description,
        "send_time": notification.send_time.to_rfc3339(),
        "period_secs": notification.params.period.as_secs(),
    })
}

/// Escape Telegram MarkdownV1 special characters.
fn escape_markdown(s: &str) -> String {
    s.replace('_', "\\_")
        .replace('*', "\\*")
        .replace('[', "\\[")
        .replace('`', "\\`")
}
