//! Alert evaluation worker: selects due alerts by priority, evaluates them
//! with bounded concurrency, enforces cooldown and daily-cap policy, and
//! dispatches notifications on trigger.

use crate::application::notification_service::{NotificationRequest, NotificationService};
use crate::domain::alerts::{Alert, AlertEvent, AlertPriority, EvaluationResult, PRIORITY_ORDER};
use crate::domain::notifications::TriggerValue;
use crate::domain::ports::ConditionEvaluator;
use crate::domain::repositories::AlertRepository;
use chrono::{Duration, Utc};
use futures::StreamExt;
use futures::stream;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct EvaluationWorkerSettings {
    pub batch_size: i64,
    pub concurrency: usize,
    pub min_interval_seconds: u64,
}

impl Default for EvaluationWorkerSettings {
    fn default() -> Self {
        Self { batch_size: 100, concurrency: 10, min_interval_seconds: 10 }
    }
}

pub struct EvaluationWorker {
    alerts: Arc<dyn AlertRepository>,
    evaluator: Arc<dyn ConditionEvaluator>,
    notifications: Arc<NotificationService>,
    settings: EvaluationWorkerSettings,
}

impl EvaluationWorker {
    pub fn new(
        alerts: Arc<dyn AlertRepository>,
        evaluator: Arc<dyn ConditionEvaluator>,
        notifications: Arc<NotificationService>,
        settings: EvaluationWorkerSettings,
    ) -> Self {
        Self { alerts, evaluator, notifications, settings }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Evaluation worker started");
        let min_interval = self.settings.min_interval_seconds.max(10);

        while !*shutdown.borrow() {
            let cycle_start = Instant::now();
            let (evaluated, cycle_failed) = self.run_cycle(&mut shutdown).await;
            let cycle_secs = cycle_start.elapsed().as_secs_f64();

            if evaluated > 0 {
                info!("Evaluation cycle complete: {evaluated} alerts in {cycle_secs:.2}s");
            }

            let sleep_secs = if cycle_failed {
                (min_interval * 2).min(60)
            } else {
                ((min_interval as f64 - cycle_secs).max(1.0)) as u64
            };
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(std::time::Duration::from_secs(sleep_secs.max(1))) => {}
            }
        }
        self.evaluator.close().await;
        info!("Evaluation worker stopped");
    }

    /// One pass over all priorities. Returns the number of alerts evaluated
    /// and whether any priority batch failed outright.
    async fn run_cycle(&self, shutdown: &mut watch::Receiver<bool>) -> (usize, bool) {
        let mut evaluated = 0;
        let mut failed = false;
        for priority in PRIORITY_ORDER {
            if *shutdown.borrow() {
                break;
            }
            match self.evaluate_priority_batch(priority).await {
                Ok(count) => evaluated += count,
                Err(e) => {
                    error!("Error evaluating {priority} priority batch: {e:#}");
                    failed = true;
                }
            }
        }
        (evaluated, failed)
    }

    /// Evaluate one cycle immediately, ignoring the shutdown signal. Used by
    /// tests and administrative tooling.
    pub async fn run_cycle_once(&self) -> usize {
        let (_, mut shutdown) = watch::channel(false);
        self.run_cycle(&mut shutdown).await.0
    }

    async fn evaluate_priority_batch(&self, priority: AlertPriority) -> anyhow::Result<usize> {
        let alerts = self
            .alerts
            .due_alerts(priority, Utc::now(), self.settings.batch_size)
            .await?;
        if alerts.is_empty() {
            return Ok(0);
        }
        debug!("Evaluating {} {priority} priority alerts", alerts.len());

        let count = alerts.len();
        stream::iter(alerts)
            .map(|alert| self.evaluate_alert(alert))
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect::<Vec<()>>()
            .await;
        Ok(count)
    }

    /// Evaluate one alert. Always writes `last_evaluated_at`; triggers only
    /// when the condition matches and no policy gate blocks it.
    async fn evaluate_alert(&self, alert: Alert) {
        let result = self.evaluator.evaluate(&alert.condition_config).await;
        let now = Utc::now();

        if let Err(e) = self.alerts.mark_evaluated(alert.alert_id, now).await {
            error!("Error updating last_evaluated_at for {}: {e:#}", alert.alert_id);
        }

        if !result.matched {
            debug!("Alert {} condition not met", alert.alert_id);
            return;
        }
        info!("Alert {} condition matched", alert.alert_id);

        if alert.cooldown_seconds > 0
            && let Some(last_triggered) = alert.last_triggered_at
        {
            let cooldown_until = last_triggered + Duration::seconds(alert.cooldown_seconds);
            if now < cooldown_until {
                let remaining = (cooldown_until - now).num_seconds();
                info!("Alert {} trigger skipped: cooldown active ({remaining}s remaining)", alert.alert_id);
                return;
            }
        }

        if let Some(cap) = alert.max_triggers_per_day
            && cap > 0
        {
            let since = now - Duration::hours(24);
            match self.alerts.trigger_count_since(alert.alert_id, since).await {
                Ok(count) if count >= cap => {
                    info!("Alert {} trigger skipped: daily limit reached ({count}/{cap})", alert.alert_id);
                    return;
                }
                Err(e) => {
                    error!("Error counting triggers for {}: {e:#}", alert.alert_id);
                }
                _ => {}
            }
        }

        self.trigger_alert(alert, result, now).await;
    }

    async fn trigger_alert(
        &self,
        alert: Alert,
        result: EvaluationResult,
        now: chrono::DateTime<Utc>,
    ) {
        let event_id = Uuid::new_v4();
        let trigger = TriggerValue {
            current_value: result.current_value,
            threshold: result.threshold,
            operator: result
                .details
                .get("operator")
                .and_then(Value::as_str)
                .map(|s| s.to_string()),
            indicator: result
                .details
                .get("indicator")
                .and_then(Value::as_str)
                .map(|s| s.to_string()),
        };

        let channels = if alert.notification_channels.is_empty() {
            None
        } else {
            Some(alert.notification_channels.clone())
        };
        let outcome = self
            .notifications
            .send(NotificationRequest {
                user_id: alert.user_id.clone(),
                alert_id: alert.alert_id,
                event_id,
                alert_name: alert.name.clone(),
                alert_type: alert.alert_type.clone(),
                priority: alert.priority,
                trigger,
                symbol: alert.condition_symbol(),
                channels,
            })
            .await;

        let event = AlertEvent {
            event_id,
            alert_id: alert.alert_id,
            triggered_at: now,
            evaluation_result: result.to_json(),
            notification_results: outcome.to_json(),
        };
        if let Err(e) = self.alerts.insert_event(&event).await {
            error!("Error recording alert event for {}: {e:#}", alert.alert_id);
        }
        if let Err(e) = self.alerts.record_trigger(alert.alert_id, now).await {
            error!("Error updating trigger stats for {}: {e:#}", alert.alert_id);
        }
        info!("Alert {} triggered (event {event_id})", alert.alert_id);
    }

    /// Evaluate a single alert's stored condition without touching any state.
    pub async fn evaluate_once(&self, alert_id: Uuid) -> Option<EvaluationResult> {
        match self.alerts.get(alert_id).await {
            Ok(Some(alert)) => Some(self.evaluator.evaluate(&alert.condition_config).await),
            Ok(None) => None,
            Err(e) => {
                error!("Error loading alert {alert_id}: {e:#}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::alerts::AlertStatus;
    use crate::domain::notifications::{
        NotificationLogEntry, NotificationPreferences, NotificationResult,
    };
    use crate::domain::ports::NotificationProvider;
    use crate::domain::repositories::NotificationRepository;
    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::DateTime;
    use serde_json::json;
    use std::sync::Mutex;

    struct StubEvaluator {
        matched: bool,
    }

    #[async_trait]
    impl ConditionEvaluator for StubEvaluator {
        async fn evaluate(&self, _config: &Value) -> EvaluationResult {
            EvaluationResult::matched(self.matched, 24_050.0, 24_000.0, serde_json::Map::new())
        }
    }

    #[derive(Default)]
    struct StubAlertRepository {
        alerts: Mutex<Vec<Alert>>,
        evaluated: Mutex<Vec<Uuid>>,
        events: Mutex<Vec<AlertEvent>>,
        triggered: Mutex<Vec<Uuid>>,
        prior_trigger_count: i64,
    }

    #[async_trait]
    impl AlertRepository for StubAlertRepository {
        async fn due_alerts(
            &self,
            priority: AlertPriority,
            _now: DateTime<Utc>,
            _limit: i64,
        ) -> Result<Vec<Alert>> {
            Ok(self
                .alerts
                .lock()
                .unwrap()
                .iter()
                .filter(|a| a.priority == priority && a.status == AlertStatus::Active)
                .cloned()
                .collect())
        }
        async fn get(&self, alert_id: Uuid) -> Result<Option<Alert>> {
            Ok(self.alerts.lock().unwrap().iter().find(|a| a.alert_id == alert_id).cloned())
        }
        async fn mark_evaluated(&self, alert_id: Uuid, _at: DateTime<Utc>) -> Result<()> {
            self.evaluated.lock().unwrap().push(alert_id);
            Ok(())
        }
        async fn record_trigger(&self, alert_id: Uuid, _at: DateTime<Utc>) -> Result<()> {
            self.triggered.lock().unwrap().push(alert_id);
            Ok(())
        }
        async fn insert_event(&self, event: &AlertEvent) -> Result<()> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
        async fn trigger_count_since(&self, _alert_id: Uuid, _since: DateTime<Utc>) -> Result<i64> {
            Ok(self.prior_trigger_count + self.events.lock().unwrap().len() as i64)
        }
    }

    struct StubNotificationRepo;

    #[async_trait]
    impl NotificationRepository for StubNotificationRepo {
        async fn preferences(&self, user_id: &str) -> Result<Option<NotificationPreferences>> {
            let mut prefs = NotificationPreferences::default_for(user_id);
            prefs.telegram_enabled = true;
            prefs.telegram_chat_id = Some("42".to_string());
            Ok(Some(prefs))
        }
        async fn append_log(&self, _entry: &NotificationLogEntry) -> Result<()> {
            Ok(())
        }
        async fn sent_count_since(&self, _recipient: &str, _since: DateTime<Utc>) -> Result<i64> {
            Ok(0)
        }
    }

    struct CountingProvider {
        sends: Mutex<usize>,
    }

    #[async_trait]
    impl NotificationProvider for CountingProvider {
        async fn send(
            &self,
            _recipient: &str,
            _message: &str,
            _priority: &str,
            _metadata: &Value,
        ) -> NotificationResult {
            *self.sends.lock().unwrap() += 1;
            NotificationResult::sent("1", None)
        }
        fn validate_recipient(&self, _recipient: &str) -> bool {
            true
        }
        async fn get_status(&self, _message_id: &str) -> Option<String> {
            None
        }
    }

    fn alert(cooldown_seconds: i64, last_triggered_secs_ago: Option<i64>) -> Alert {
        Alert {
            alert_id: Uuid::new_v4(),
            user_id: "u1".to_string(),
            name: "test alert".to_string(),
            alert_type: "price".to_string(),
            priority: AlertPriority::High,
            status: AlertStatus::Active,
            condition_config: json!({"type": "price", "symbol": "NIFTY",
                                     "operator": "gte", "threshold": 24000.0}),
            notification_channels: vec!["telegram".to_string()],
            evaluation_interval_seconds: 60,
            cooldown_seconds,
            max_triggers_per_day: None,
            trigger_count: 0,
            last_triggered_at: last_triggered_secs_ago.map(|s| Utc::now() - Duration::seconds(s)),
            last_evaluated_at: None,
            created_at: Utc::now(),
        }
    }

    fn worker(
        repo: Arc<StubAlertRepository>,
        matched: bool,
        provider: Arc<CountingProvider>,
    ) -> EvaluationWorker {
        let mut notifications = NotificationService::new(Arc::new(StubNotificationRepo));
        notifications.register_provider("telegram", provider);
        EvaluationWorker::new(
            repo,
            Arc::new(StubEvaluator { matched }),
            Arc::new(notifications),
            EvaluationWorkerSettings::default(),
        )
    }

    #[tokio::test]
    async fn test_unmatched_alert_still_marks_evaluated() {
        let repo = Arc::new(StubAlertRepository::default());
        repo.alerts.lock().unwrap().push(alert(0, None));
        let provider = Arc::new(CountingProvider { sends: Mutex::new(0) });
        let w = worker(repo.clone(), false, provider.clone());

        assert_eq!(w.run_cycle_once().await, 1);
        assert_eq!(repo.evaluated.lock().unwrap().len(), 1);
        assert!(repo.events.lock().unwrap().is_empty());
        assert_eq!(*provider.sends.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cooldown_blocks_trigger() {
        // cooldown 300s, last triggered 100s ago, condition matches
        let repo = Arc::new(StubAlertRepository::default());
        repo.alerts.lock().unwrap().push(alert(300, Some(100)));
        let provider = Arc::new(CountingProvider { sends: Mutex::new(0) });
        let w = worker(repo.clone(), true, provider.clone());

        w.run_cycle_once().await;

        assert_eq!(repo.evaluated.lock().unwrap().len(), 1);
        assert!(repo.events.lock().unwrap().is_empty());
        assert!(repo.triggered.lock().unwrap().is_empty());
        assert_eq!(*provider.sends.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_expired_cooldown_allows_trigger() {
        let repo = Arc::new(StubAlertRepository::default());
        repo.alerts.lock().unwrap().push(alert(300, Some(400)));
        let provider = Arc::new(CountingProvider { sends: Mutex::new(0) });
        let w = worker(repo.clone(), true, provider.clone());

        w.run_cycle_once().await;

        assert_eq!(repo.events.lock().unwrap().len(), 1);
        assert_eq!(repo.triggered.lock().unwrap().len(), 1);
        assert_eq!(*provider.sends.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_daily_cap_blocks_trigger_and_notification() {
        let repo = Arc::new(StubAlertRepository {
            prior_trigger_count: 2,
            ..Default::default()
        });
        let mut capped = alert(0, None);
        capped.max_triggers_per_day = Some(2);
        repo.alerts.lock().unwrap().push(capped);
        let provider = Arc::new(CountingProvider { sends: Mutex::new(0) });
        let w = worker(repo.clone(), true, provider.clone());

        w.run_cycle_once().await;

        assert_eq!(repo.evaluated.lock().unwrap().len(), 1);
        assert!(repo.events.lock().unwrap().is_empty());
        assert_eq!(*provider.sends.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_trigger_records_event_and_stats() {
        let repo = Arc::new(StubAlertRepository::default());
        repo.alerts.lock().unwrap().push(alert(0, None));
        let provider = Arc::new(CountingProvider { sends: Mutex::new(0) });
        let w = worker(repo.clone(), true, provider.clone());

        w.run_cycle_once().await;

        let events = repo.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].evaluation_result["matched"], true);
        assert_eq!(events[0].notification_results["sent"], true);
        assert_eq!(repo.triggered.lock().unwrap().len(), 1);
        assert_eq!(*provider.sends.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_evaluate_once_reads_without_state_writes() {
        let repo = Arc::new(StubAlertRepository::default());
        let a = alert(0, None);
        let id = a.alert_id;
        repo.alerts.lock().unwrap().push(a);
        let provider = Arc::new(CountingProvider { sends: Mutex::new(0) });
        let w = worker(repo.clone(), true, provider);

        let result = w.evaluate_once(id).await.unwrap();
        assert!(result.matched);
        assert!(repo.evaluated.lock().unwrap().is_empty());
        assert!(repo.events.lock().unwrap().is_empty());
    }
}
