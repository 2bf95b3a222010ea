//! Notification preferences, delivery results and message formatting.

use crate::domain::alerts::AlertPriority;
use chrono::{DateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageFormat {
    Rich,
    Compact,
    Minimal,
}

impl Default for MessageFormat {
    fn default() -> Self {
        MessageFormat::Rich
    }
}

impl MessageFormat {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "rich" => Some(MessageFormat::Rich),
            "compact" => Some(MessageFormat::Compact),
            "minimal" => Some(MessageFormat::Minimal),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageFormat::Rich => "rich",
            MessageFormat::Compact => "compact",
            MessageFormat::Minimal => "minimal",
        }
    }
}

/// Per-user notification preferences. Missing rows fall back to
/// [`NotificationPreferences::default_for`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPreferences {
    pub user_id: String,

    pub telegram_enabled: bool,
    pub telegram_chat_id: Option<String>,
    pub webhook_enabled: bool,
    pub webhook_url: Option<String>,
    pub email_enabled: bool,
    pub email_addresses: Vec<String>,

    pub quiet_hours_start: Option<NaiveTime>,
    pub quiet_hours_end: Option<NaiveTime>,
    pub quiet_hours_timezone: String,

    pub max_notifications_per_hour: i64,
    pub priority_threshold: AlertPriority,
    pub notification_format: MessageFormat,
}

impl NotificationPreferences {
    pub fn default_for(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            telegram_enabled: false,
            telegram_chat_id: None,
            webhook_enabled: false,
            webhook_url: None,
            email_enabled: false,
            email_addresses: Vec::new(),
            quiet_hours_start: None,
            quiet_hours_end: None,
            quiet_hours_timezone: "Asia/Kolkata".to_string(),
            max_notifications_per_hour: 50,
            priority_threshold: AlertPriority::Low,
            notification_format: MessageFormat::Rich,
        }
    }

    /// Channels that are both enabled and have a recipient configured.
    pub fn enabled_channels(&self) -> Vec<String> {
        let mut channels = Vec::new();
        if self.telegram_enabled && self.telegram_chat_id.is_some() {
            channels.push("telegram".to_string());
        }
        if self.webhook_enabled && self.webhook_url.is_some() {
            channels.push("webhook".to_string());
        }
        if self.email_enabled && !self.email_addresses.is_empty() {
            channels.push("email".to_string());
        }
        channels
    }

    pub fn recipient_for(&self, channel: &str) -> Option<String> {
        match channel {
            "telegram" => self.telegram_chat_id.clone(),
            "webhook" => self.webhook_url.clone(),
            "email" => self.email_addresses.first().cloned(),
            _ => None,
        }
    }

    /// Recipient the hourly rate limit is counted against: one cap per
    /// primary recipient, Telegram first.
    pub fn primary_recipient(&self) -> Option<String> {
        if self.telegram_enabled {
            return self.telegram_chat_id.clone();
        }
        self.enabled_channels().first().and_then(|c| self.recipient_for(c))
    }

    pub fn timezone(&self) -> Option<Tz> {
        self.quiet_hours_timezone.parse().ok()
    }
}

/// Delivery status reported by a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationResult {
    pub success: bool,
    pub message_id: Option<String>,
    pub error: Option<String>,
    pub provider_response: Option<Value>,
}

impl NotificationResult {
    pub fn sent(message_id: impl Into<String>, provider_response: Option<Value>) -> Self {
        Self {
            success: true,
            message_id: Some(message_id.into()),
            error: None,
            provider_response,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self { success: false, message_id: None, error: Some(error.into()), provider_response: None }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "success": self.success,
            "message_id": self.message_id,
            "error": self.error,
            "provider_response": self.provider_response,
        })
    }
}

/// Append-only delivery log row.
#[derive(Debug, Clone)]
pub struct NotificationLogEntry {
    pub event_id: Option<Uuid>,
    pub channel: String,
    pub recipient: String,
    pub status: String,
    pub message_id: Option<String>,
    pub message_content: String,
    pub sent_at: DateTime<Utc>,
}

/// Trigger context handed to the formatter: current value, threshold and
/// condition extras (operator, indicator name).
#[derive(Debug, Clone, Default)]
pub struct TriggerValue {
    pub current_value: Option<f64>,
    pub threshold: Option<f64>,
    pub operator: Option<String>,
    pub indicator: Option<String>,
}

impl TriggerValue {
    pub fn to_json(&self) -> Value {
        json!({
            "current_value": self.current_value,
            "threshold": self.threshold,
            "operator": self.operator,
            "indicator": self.indicator,
        })
    }
}

/// Build the outbound message body. The priority emoji prefix is added by the
/// provider, not here.
pub fn format_alert_message(
    alert_name: &str,
    alert_type: &str,
    trigger: &TriggerValue,
    symbol: Option<&str>,
    format: MessageFormat,
    timezone: Tz,
) -> String {
    match format {
        MessageFormat::Minimal => format!("🔔 {alert_name}"),
        MessageFormat::Compact => {
            let mut parts = vec![format!("🔔 *{alert_name}*")];
            if let Some(symbol) = symbol {
                parts.push(format!("Symbol: {symbol}"));
            }
            if let Some(value) = trigger.current_value {
                parts.push(format!("Value: {value}"));
            }
            parts.join("\n")
        }
        MessageFormat::Rich => {
            let mut lines = vec![
                format!("🔔 *Alert: {alert_name}*"),
                String::new(),
                format!("*Type:* {}", title_case(alert_type)),
            ];
            if let Some(symbol) = symbol {
                lines.push(format!("*Symbol:* {symbol}"));
            }
            if let Some(indicator) = &trigger.indicator {
                lines.push(format!("*Indicator:* {}", indicator.to_uppercase()));
            }
            if let (Some(current), Some(threshold)) = (trigger.current_value, trigger.threshold) {
                lines.push(String::new());
                lines.push(format!("*Current:* {current:.2}"));
                match &trigger.operator {
                    Some(op) => lines.push(format!("*Threshold:* {op} {threshold:.2}")),
                    None => lines.push(format!("*Threshold:* {threshold:.2}")),
                }
            }
            let local = Utc::now().with_timezone(&timezone);
            lines.push(String::new());
            lines.push(format!("*Time:* {}", local.format("%Y-%m-%d %H:%M:%S %Z")));
            lines.join("\n")
        }
    }
}

fn title_case(raw: &str) -> String {
    let mut chars = raw.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_and_compact_formats() {
        let trigger = TriggerValue { current_value: Some(24_050.0), ..Default::default() };
        let minimal = format_alert_message(
            "NIFTY breakout",
            "price",
            &trigger,
            Some("NIFTY"),
            MessageFormat::Minimal,
            chrono_tz::Asia::Kolkata,
        );
        assert_eq!(minimal, "🔔 NIFTY breakout");

        let compact = format_alert_message(
            "NIFTY breakout",
            "price",
            &trigger,
            Some("NIFTY"),
            MessageFormat::Compact,
            chrono_tz::Asia::Kolkata,
        );
        assert!(compact.contains("*NIFTY breakout*"));
        assert!(compact.contains("Symbol: NIFTY"));
        assert!(compact.contains("Value: 24050"));
    }

    #[test]
    fn test_rich_format_has_threshold_and_type() {
        let trigger = TriggerValue {
            current_value: Some(24_051.337),
            threshold: Some(24_000.0),
            operator: Some("gte".to_string()),
            indicator: None,
        };
        let rich = format_alert_message(
            "NIFTY breakout",
            "price",
            &trigger,
            Some("NIFTY"),
            MessageFormat::Rich,
            chrono_tz::Asia::Kolkata,
        );
        assert!(rich.contains("*Type:* Price"));
        assert!(rich.contains("*Current:* 24051.34"));
        assert!(rich.contains("*Threshold:* gte 24000.00"));
        assert!(rich.contains("*Time:*"));
    }

    #[test]
    fn test_enabled_channels_require_recipient() {
        let mut prefs = NotificationPreferences::default_for("u1");
        prefs.telegram_enabled = true;
        assert!(prefs.enabled_channels().is_empty());
        prefs.telegram_chat_id = Some("12345".to_string());
        assert_eq!(prefs.enabled_channels(), vec!["telegram"]);
    }

    #[test]
    fn test_primary_recipient_prefers_telegram() {
        let mut prefs = NotificationPreferences::default_for("u1");
        prefs.webhook_enabled = true;
        prefs.webhook_url = Some("https://hooks.example/x".to_string());
        assert_eq!(prefs.primary_recipient().unwrap(), "https://hooks.example/x");
        prefs.telegram_enabled = true;
        prefs.telegram_chat_id = Some("777".to_string());
        assert_eq!(prefs.primary_recipient().unwrap(), "777");
    }
}
