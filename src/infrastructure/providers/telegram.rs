//! Telegram Bot API notification provider.
//!
//! Delivery goes through a per-process rate gate (the Bot API caps outbound
//! messages per second) and a bounded retry loop for transport failures.
//! API-level rejections (bad chat id, blocked bot) are not retried.

use crate::domain::notifications::NotificationResult;
use crate::domain::ports::NotificationProvider;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct TelegramSettings {
    pub bot_token: String,
    pub retry_attempts: u32,
    pub retry_backoff_seconds: f64,
    /// Per-process cap on messages per second across all recipients.
    pub rate_limit_per_second: u32,
}

impl TelegramSettings {
    pub fn new(bot_token: &str) -> Self {
        Self {
            bot_token: bot_token.to_string(),
            retry_attempts: 3,
            retry_backoff_seconds: 2.0,
            rate_limit_per_second: 30,
        }
    }
}

struct RateWindow {
    window_start: Instant,
    sent: u32,
}

pub struct TelegramProvider {
    base_url: String,
    client: Client,
    retry_attempts: u32,
    retry_backoff_seconds: f64,
    rate_limit_per_second: u32,
    rate: Mutex<RateWindow>,
}

impl TelegramProvider {
    pub fn new(settings: TelegramSettings) -> Self {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            base_url: format!("https://api.telegram.org/bot{}", settings.bot_token),
            client,
            retry_attempts: settings.retry_attempts.max(1),
            retry_backoff_seconds: settings.retry_backoff_seconds.max(0.1),
            rate_limit_per_second: settings.rate_limit_per_second.max(1),
            rate: Mutex::new(RateWindow { window_start: Instant::now(), sent: 0 }),
        }
    }

    fn priority_emoji(priority: &str) -> &'static str {
        match priority {
            "critical" => "🚨",
            "high" => "⚠️",
            "medium" => "ℹ️",
            _ => "📢",
        }
    }

    /// Inline acknowledge / snooze / pause keyboard for urgent alerts.
    fn build_reply_markup(metadata: &Value) -> Value {
        let event_id = metadata.get("event_id").and_then(Value::as_str).unwrap_or_default();
        let alert_id = metadata.get("alert_id").and_then(Value::as_str).unwrap_or_default();
        json!({
            "inline_keyboard": [
                [
                    {"text": "✅ Acknowledge", "callback_data": format!("ack:{event_id}")},
                    {"text": "💤 Snooze 1h", "callback_data": format!("snooze:{event_id}:3600")},
                ],
                [
                    {"text": "🔕 Pause Alert", "callback_data": format!("pause:{alert_id}")},
                ],
            ]
        })
    }

    /// Hold the caller until the current one-second window has room.
    async fn acquire_send_slot(&self) {
        loop {
            let wait = {
                let mut rate = self.rate.lock().await;
                let elapsed = rate.window_start.elapsed();
                if elapsed >= Duration::from_secs(1) {
                    rate.window_start = Instant::now();
                    rate.sent = 0;
                }
                if rate.sent < self.rate_limit_per_second {
                    rate.sent += 1;
                    None
                } else {
                    Some(Duration::from_secs(1).saturating_sub(elapsed))
                }
            };
            match wait {
                None => return,
                Some(wait) => {
                    debug!("Telegram rate limit reached, waiting {wait:?}");
                    tokio::time::sleep(wait.max(Duration::from_millis(10))).await;
                }
            }
        }
    }

    async fn post_message(&self, payload: &Value) -> Result<Value, String> {
        let url = format!("{}/sendMessage", self.base_url);
        let response =
            self.client.post(&url).json(payload).send().await.map_err(|e| format!("{e}"))?;
        let status = response.status();
        response.json::<Value>().await.map_err(|e| format!("HTTP {status}: {e}"))
    }
}

#[async_trait]
impl NotificationProvider for TelegramProvider {
    async fn send(
        &self,
        recipient: &str,
        message: &str,
        priority: &str,
        metadata: &Value,
    ) -> NotificationResult {
        let formatted = format!("{} {message}", Self::priority_emoji(priority));
        let mut payload = json!({
            "chat_id": recipient,
            "text": formatted,
            "parse_mode": "Markdown",
            "disable_web_page_preview": true,
        });
        if matches!(priority, "critical" | "high") {
            payload["reply_markup"] = Self::build_reply_markup(metadata);
        }

        let mut last_error = String::new();
        for attempt in 1..=self.retry_attempts {
            self.acquire_send_slot().await;

            match self.post_message(&payload).await {
                Ok(body) => {
                    if body.get("ok").and_then(Value::as_bool).unwrap_or(false) {
                        let message_id = body
                            .pointer("/result/message_id")
                            .map(|id| id.to_string())
                            .unwrap_or_default();
                        info!("Telegram message sent to {recipient}: {message_id}");
                        return NotificationResult::sent(message_id, Some(body));
                    }
                    // API-level rejections are terminal; only transport
                    // failures retry.
                    let description = body
                        .get("description")
                        .and_then(Value::as_str)
                        .unwrap_or("Unknown error")
                        .to_string();
                    error!("Telegram API error: {description}");
                    return NotificationResult {
                        success: false,
                        message_id: None,
                        error: Some(description),
                        provider_response: Some(body),
                    };
                }
                Err(e) => {
                    warn!("Telegram send attempt {attempt}/{} failed: {e}", self.retry_attempts);
                    last_error = e;
                    if attempt < self.retry_attempts {
                        let backoff = self.retry_backoff_seconds * attempt as f64;
                        tokio::time::sleep(Duration::from_secs_f64(backoff)).await;
                    }
                }
            }
        }
        NotificationResult::failed(last_error)
    }

    /// Telegram chat ids are numeric (negative for groups).
    fn validate_recipient(&self, recipient: &str) -> bool {
        recipient.parse::<i64>().is_ok()
    }

    /// Telegram has no delivery-status API; sent is all we ever know without
    /// a webhook.
    async fn get_status(&self, _message_id: &str) -> Option<String> {
        Some("sent".to_string())
    }
}
