//! Write-only alert sinks
//!
//! Called on every trade and every supervisor transition. A failing sink is
//! logged by the caller and otherwise ignored.

use crate::config::NotifyConfig;
use crate::models::TradeDecision;
use crate::{Result, TraderError};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const TELEGRAM_API: &str = "https://api.telegram.org";

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &str) -> Result<()>;
}

/// Deliver `message`, logging instead of failing
pub async fn deliver(notifier: &dyn Notifier, message: &str) {
    if let Err(e) = notifier.send(message).await {
        tracing::warn!("Notification failed: {}", e);
    }
}

pub fn trade_message(decision: &TradeDecision) -> String {
    format!(
        "{} {} {} lots @ {}\nTP: {} ({} pts)\nTicket: #{}",
        decision.direction,
        decision.symbol,
        decision.volume,
        decision.entry_price,
        decision.take_profit_price,
        decision.target_points(),
        decision.ticket
    )
}

pub fn transition_message(from: &str, to: &str, reason: &str) -> String {
    format!("Supervisor: {} -> {} ({})", from, to, reason)
}

/// Writes alerts to the log only
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, message: &str) -> Result<()> {
        tracing::info!(target: "reversalbot::notify", "{}", message.replace('\n', " | "));
        Ok(())
    }
}

/// Telegram Bot API `sendMessage`
pub struct TelegramNotifier {
    client: Client,
    base_url: String,
    bot_token: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(bot_token: String, chat_id: String) -> Result<Self> {
        Self::with_base_url(TELEGRAM_API, bot_token, chat_id)
    }

    pub fn with_base_url(
        base_url: impl Into<String>,
        bot_token: String,
        chat_id: String,
    ) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            bot_token,
            chat_id,
        })
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, message: &str) -> Result<()> {
        let url = format!("{}/bot{}/sendMessage", self.base_url, self.bot_token);

        let payload = json!({
            "chat_id": self.chat_id,
            "text": message,
        });

        let response = self.client.post(&url).json(&payload).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(TraderError::Notify(format!(
                "Telegram API error {}: {}",
                status, body
            )));
        }

        Ok(())
    }
}

/// Telegram when both token and chat id are configured, the log otherwise
pub fn from_config(config: &NotifyConfig) -> Result<Arc<dyn Notifier>> {
    match (&config.telegram_token, &config.telegram_chat_id) {
        (Some(token), Some(chat_id)) if !token.is_empty() && !chat_id.is_empty() => {
            tracing::info!("Telegram notifications enabled");
            Ok(Arc::new(TelegramNotifier::new(token.clone(), chat_id.clone())?))
        }
        _ => Ok(Arc::new(LogNotifier)),
    }
}
