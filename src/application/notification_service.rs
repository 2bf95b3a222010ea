//! Notification dispatch: quiet hours, per-recipient rate limiting, channel
//! fan-out and the append-only delivery log.

use crate::domain::alerts::AlertPriority;
use crate::domain::notifications::{
    NotificationLogEntry, NotificationPreferences, NotificationResult, TriggerValue,
    format_alert_message,
};
use crate::domain::ports::NotificationProvider;
use crate::domain::repositories::NotificationRepository;
use chrono::{Duration, NaiveTime, Utc};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

const MESSAGE_LOG_LIMIT: usize = 500;

#[derive(Debug, Clone)]
pub struct NotificationRequest {
    pub user_id: String,
    pub alert_id: Uuid,
    pub event_id: Uuid,
    pub alert_name: String,
    pub alert_type: String,
    pub priority: AlertPriority,
    pub trigger: TriggerValue,
    pub symbol: Option<String>,
    pub channels: Option<Vec<String>>,
}

/// Outcome of a dispatch attempt. Policy gates report `Skipped` with a
/// reason; partial delivery failure is still `Sent` with per-channel results.
#[derive(Debug)]
pub enum SendOutcome {
    Sent { results: HashMap<String, NotificationResult> },
    Skipped { reason: &'static str },
}

impl SendOutcome {
    pub fn to_json(&self) -> Value {
        match self {
            SendOutcome::Sent { results } => {
                let results: serde_json::Map<String, Value> = results
                    .iter()
                    .map(|(channel, result)| (channel.clone(), result.to_json()))
                    .collect();
                json!({"sent": true, "results": results})
            }
            SendOutcome::Skipped { reason } => json!({"skipped": true, "reason": reason}),
        }
    }

    pub fn was_sent(&self) -> bool {
        matches!(self, SendOutcome::Sent { .. })
    }
}

pub struct NotificationService {
    repository: Arc<dyn NotificationRepository>,
    providers: HashMap<String, Arc<dyn NotificationProvider>>,
}

impl NotificationService {
    pub fn new(repository: Arc<dyn NotificationRepository>) -> Self {
        Self { repository, providers: HashMap::new() }
    }

    pub fn register_provider(&mut self, channel: &str, provider: Arc<dyn NotificationProvider>) {
        info!("Notification provider registered for channel {channel}");
        self.providers.insert(channel.to_string(), provider);
    }

    pub async fn close(&self) {
        for provider in self.providers.values() {
            provider.close().await;
        }
    }

    pub async fn send(&self, request: NotificationRequest) -> SendOutcome {
        let prefs = match self.repository.preferences(&request.user_id).await {
            Ok(Some(prefs)) => prefs,
            Ok(None) => NotificationPreferences::default_for(&request.user_id),
            Err(e) => {
                error!("Failed to load preferences for {}: {e:#}", request.user_id);
                NotificationPreferences::default_for(&request.user_id)
            }
        };

        if !quiet_hours_allow(&prefs, request.priority) {
            info!("Skipping notification for {} (quiet hours)", request.user_id);
            return SendOutcome::Skipped { reason: "quiet_hours" };
        }

        if self.rate_limited(&prefs).await {
            info!("Skipping notification for {} (rate limit)", request.user_id);
            return SendOutcome::Skipped { reason: "rate_limit" };
        }

        let channels = request
            .channels
            .clone()
            .filter(|channels| !channels.is_empty())
            .unwrap_or_else(|| prefs.enabled_channels());
        if channels.is_empty() {
            warn!("No notification channels enabled for {}", request.user_id);
            return SendOutcome::Skipped { reason: "no_channels" };
        }

        let timezone = prefs.timezone().unwrap_or(chrono_tz::Asia::Kolkata);
        let message = format_alert_message(
            &request.alert_name,
            &request.alert_type,
            &request.trigger,
            request.symbol.as_deref(),
            prefs.notification_format,
            timezone,
        );
        let metadata = json!({
            "alert_id": request.alert_id,
            "event_id": request.event_id,
            "user_id": request.user_id,
        });

        let mut results = HashMap::new();
        for channel in channels {
            let result = self
                .send_to_channel(&channel, &prefs, &message, request.priority, &metadata)
                .await;
            results.insert(channel, result);
        }
        SendOutcome::Sent { results }
    }

    async fn send_to_channel(
        &self,
        channel: &str,
        prefs: &NotificationPreferences,
        message: &str,
        priority: AlertPriority,
        metadata: &Value,
    ) -> NotificationResult {
        let Some(provider) = self.providers.get(channel) else {
            warn!("No provider for channel {channel}");
            return NotificationResult::failed("No provider for channel");
        };
        let Some(recipient) = prefs.recipient_for(channel) else {
            warn!("No recipient configured for channel {channel} (user {})", prefs.user_id);
            return NotificationResult::failed("No recipient configured");
        };

        let result = provider.send(&recipient, message, priority.as_str(), metadata).await;

        let event_id = metadata.get("event_id").and_then(Value::as_str).and_then(|s| s.parse().ok());
        let entry = NotificationLogEntry {
            event_id,
            channel: channel.to_string(),
            recipient,
            status: if result.success { "sent" } else { "failed" }.to_string(),
            message_id: result.message_id.clone(),
            message_content: truncate(message, MESSAGE_LOG_LIMIT),
            sent_at: Utc::now(),
        };
        if let Err(e) = self.repository.append_log(&entry).await {
            error!("Failed to log notification on {channel}: {e:#}");
        }
        result
    }

    /// One cap per primary recipient over the trailing hour. Errors allow
    /// the send.
    async fn rate_limited(&self, prefs: &NotificationPreferences) -> bool {
        let Some(recipient) = prefs.primary_recipient() else {
            return false;
        };
        let since = Utc::now() - Duration::hours(1);
        match self.repository.sent_count_since(&recipient, since).await {
            Ok(count) => count >= prefs.max_notifications_per_hour,
            Err(e) => {
                error!("Rate-limit lookup failed for {recipient}: {e:#}");
                false
            }
        }
    }
}

/// Inclusive window check; `start > end` wraps past midnight.
pub fn in_quiet_window(t: NaiveTime, start: NaiveTime, end: NaiveTime) -> bool {
    if start <= end { start <= t && t <= end } else { t >= start || t <= end }
}

fn quiet_hours_allow(prefs: &NotificationPreferences, priority: AlertPriority) -> bool {
    let (Some(start), Some(end)) = (prefs.quiet_hours_start, prefs.quiet_hours_end) else {
        return true;
    };
    let Some(tz) = prefs.timezone() else {
        // Unknown zone: deliver rather than silently suppress.
        return true;
    };
    let now = Utc::now().with_timezone(&tz).time();
    if !in_quiet_window(now, start, end) {
        return true;
    }
    priority.rank() >= prefs.priority_threshold.rank()
}

fn truncate(message: &str, limit: usize) -> String {
    if message.len() <= limit {
        message.to_string()
    } else {
        let mut end = limit;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        message[..end].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::DateTime;
    use std::sync::Mutex;

    struct StubRepository {
        prefs: Option<NotificationPreferences>,
        sent_count: i64,
        log: Mutex<Vec<NotificationLogEntry>>,
    }

    impl StubRepository {
        fn new(prefs: Option<NotificationPreferences>, sent_count: i64) -> Self {
            Self { prefs, sent_count, log: Mutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl NotificationRepository for StubRepository {
        async fn preferences(&self, _user_id: &str) -> Result<Option<NotificationPreferences>> {
            Ok(self.prefs.clone())
        }
        async fn append_log(&self, entry: &NotificationLogEntry) -> Result<()> {
            self.log.lock().unwrap().push(entry.clone());
            Ok(())
        }
        async fn sent_count_since(&self, _recipient: &str, _since: DateTime<Utc>) -> Result<i64> {
            Ok(self.sent_count)
        }
    }

    struct StubProvider {
        succeed: bool,
        calls: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl NotificationProvider for StubProvider {
        async fn send(
            &self,
            recipient: &str,
            message: &str,
            _priority: &str,
            _metadata: &Value,
        ) -> NotificationResult {
            self.calls.lock().unwrap().push((recipient.to_string(), message.to_string()));
            if self.succeed {
                NotificationResult::sent("msg-1", None)
            } else {
                NotificationResult::failed("provider down")
            }
        }
        fn validate_recipient(&self, _recipient: &str) -> bool {
            true
        }
        async fn get_status(&self, _message_id: &str) -> Option<String> {
            Some("sent".to_string())
        }
    }

    fn telegram_prefs() -> NotificationPreferences {
        let mut prefs = NotificationPreferences::default_for("u1");
        prefs.telegram_enabled = true;
        prefs.telegram_chat_id = Some("12345".to_string());
        prefs
    }

    fn request() -> NotificationRequest {
        NotificationRequest {
            user_id: "u1".to_string(),
            alert_id: Uuid::new_v4(),
            event_id: Uuid::new_v4(),
            alert_name: "NIFTY breakout".to_string(),
            alert_type: "price".to_string(),
            priority: AlertPriority::High,
            trigger: TriggerValue {
                current_value: Some(24_050.0),
                threshold: Some(24_000.0),
                operator: Some("gte".to_string()),
                indicator: None,
            },
            symbol: Some("NIFTY".to_string()),
            channels: None,
        }
    }

    fn service_with(
        repo: Arc<StubRepository>,
        provider: Arc<StubProvider>,
    ) -> NotificationService {
        let mut service = NotificationService::new(repo);
        service.register_provider("telegram", provider);
        service
    }

    #[test]
    fn test_quiet_window_same_day_and_overnight() {
        let t = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap();
        assert!(in_quiet_window(t(12, 0), t(9, 0), t(17, 0)));
        assert!(in_quiet_window(t(9, 0), t(9, 0), t(17, 0)));
        assert!(in_quiet_window(t(17, 0), t(9, 0), t(17, 0)));
        assert!(!in_quiet_window(t(8, 59), t(9, 0), t(17, 0)));
        // Overnight wrap 22:00 -> 08:00
        assert!(in_quiet_window(t(23, 30), t(22, 0), t(8, 0)));
        assert!(in_quiet_window(t(6, 0), t(22, 0), t(8, 0)));
        assert!(!in_quiet_window(t(12, 0), t(22, 0), t(8, 0)));
    }

    #[tokio::test]
    async fn test_no_channels_skips() {
        let repo = Arc::new(StubRepository::new(None, 0));
        let provider = Arc::new(StubProvider { succeed: true, calls: Mutex::new(Vec::new()) });
        let service = service_with(repo, provider.clone());

        let outcome = service.send(request()).await;
        match outcome {
            SendOutcome::Skipped { reason } => assert_eq!(reason, "no_channels"),
            other => panic!("expected skip, got {other:?}"),
        }
        assert!(provider.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rate_limit_skips() {
        let repo = Arc::new(StubRepository::new(Some(telegram_prefs()), 50));
        let provider = Arc::new(StubProvider { succeed: true, calls: Mutex::new(Vec::new()) });
        let service = service_with(repo, provider.clone());

        let outcome = service.send(request()).await;
        match outcome {
            SendOutcome::Skipped { reason } => assert_eq!(reason, "rate_limit"),
            other => panic!("expected skip, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_quiet_hours_respect_priority_threshold() {
        let mut prefs = telegram_prefs();
        prefs.quiet_hours_start = NaiveTime::from_hms_opt(0, 0, 0);
        prefs.quiet_hours_end = NaiveTime::from_hms_opt(23, 59, 59);
        prefs.priority_threshold = AlertPriority::Critical;
        let repo = Arc::new(StubRepository::new(Some(prefs), 0));
        let provider = Arc::new(StubProvider { succeed: true, calls: Mutex::new(Vec::new()) });
        let service = service_with(repo, provider.clone());

        let mut low = request();
        low.priority = AlertPriority::High;
        match service.send(low).await {
            SendOutcome::Skipped { reason } => assert_eq!(reason, "quiet_hours"),
            other => panic!("expected skip, got {other:?}"),
        }

        let mut critical = request();
        critical.priority = AlertPriority::Critical;
        assert!(service.send(critical).await.was_sent());
    }

    #[tokio::test]
    async fn test_successful_send_logs_delivery() {
        let repo = Arc::new(StubRepository::new(Some(telegram_prefs()), 0));
        let provider = Arc::new(StubProvider { succeed: true, calls: Mutex::new(Vec::new()) });
        let service = service_with(repo.clone(), provider.clone());

        let outcome = service.send(request()).await;
        let SendOutcome::Sent { results } = outcome else {
            panic!("expected sent outcome");
        };
        assert!(results["telegram"].success);

        let calls = provider.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "12345");

        let log = repo.log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].status, "sent");
        assert_eq!(log[0].channel, "telegram");
    }

    #[tokio::test]
    async fn test_provider_failure_is_partial_result_and_logged_failed() {
        let repo = Arc::new(StubRepository::new(Some(telegram_prefs()), 0));
        let provider = Arc::new(StubProvider { succeed: false, calls: Mutex::new(Vec::new()) });
        let service = service_with(repo.clone(), provider);

        let SendOutcome::Sent { results } = service.send(request()).await else {
            panic!("expected sent outcome");
        };
        assert!(!results["telegram"].success);
        assert_eq!(repo.log.lock().unwrap()[0].status, "failed");
    }

    #[tokio::test]
    async fn test_caller_channels_without_provider_report_failure() {
        let repo = Arc::new(StubRepository::new(Some(telegram_prefs()), 0));
        let provider = Arc::new(StubProvider { succeed: true, calls: Mutex::new(Vec::new()) });
        let service = service_with(repo, provider);

        let mut req = request();
        req.channels = Some(vec!["pager".to_string()]);
        let SendOutcome::Sent { results } = service.send(req).await else {
            panic!("expected sent outcome");
        };
        assert!(!results["pager"].success);
        assert!(results["pager"].error.as_deref().unwrap().contains("No provider"));
    }
}
