use crate::domain::alerts::{Alert, AlertEvent, AlertPriority, AlertStatus};
use crate::domain::repositories::AlertRepository;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

pub struct SqliteAlertRepository {
    pool: SqlitePool,
}

impl SqliteAlertRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a full alert row. The CRUD surface lives elsewhere; this exists
    /// for wiring and tests.
    pub async fn insert_alert(&self, alert: &Alert) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO alerts
            (alert_id, user_id, name, alert_type, priority, status,
             condition_config, notification_channels, evaluation_interval_seconds,
             cooldown_seconds, max_triggers_per_day, trigger_count,
             last_triggered_at, last_evaluated_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(alert.alert_id.to_string())
        .bind(&alert.user_id)
        .bind(&alert.name)
        .bind(&alert.alert_type)
        .bind(alert.priority.as_str())
        .bind(alert.status.as_str())
        .bind(alert.condition_config.to_string())
        .bind(serde_json::to_string(&alert.notification_channels)?)
        .bind(alert.evaluation_interval_seconds)
        .bind(alert.cooldown_seconds)
        .bind(alert.max_triggers_per_day)
        .bind(alert.trigger_count)
        .bind(alert.last_triggered_at.map(|t| t.timestamp()))
        .bind(alert.last_evaluated_at.map(|t| t.timestamp()))
        .bind(alert.created_at.timestamp())
        .execute(&self.pool)
        .await
        .context("Failed to insert alert")?;
        Ok(())
    }
}

fn epoch_to_utc(epoch: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(epoch, 0).single().unwrap_or_else(Utc::now)
}

fn map_alert(row: &SqliteRow) -> Result<Alert> {
    let alert_id: String = row.try_get("alert_id")?;
    let priority: String = row.try_get("priority")?;
    let status: String = row.try_get("status")?;
    let condition_config: String = row.try_get("condition_config")?;
    let channels: String = row.try_get("notification_channels")?;
    let last_triggered_at: Option<i64> = row.try_get("last_triggered_at")?;
    let last_evaluated_at: Option<i64> = row.try_get("last_evaluated_at")?;
    let created_at: i64 = row.try_get("created_at")?;

    Ok(Alert {
        alert_id: Uuid::parse_str(&alert_id)
            .with_context(|| format!("Invalid alert id in storage: {alert_id}"))?,
        user_id: row.try_get("user_id")?,
        name: row.try_get("name")?,
        alert_type: row.try_get("alert_type")?,
        priority: AlertPriority::parse(&priority).unwrap_or(AlertPriority::Medium),
        status: AlertStatus::parse(&status).unwrap_or(AlertStatus::Paused),
        condition_config: serde_json::from_str(&condition_config)
            .context("Invalid condition_config in storage")?,
        notification_channels: serde_json::from_str(&channels).unwrap_or_default(),
        evaluation_interval_seconds: row.try_get("evaluation_interval_seconds")?,
        cooldown_seconds: row.try_get("cooldown_seconds")?,
        max_triggers_per_day: row.try_get("max_triggers_per_day")?,
        trigger_count: row.try_get("trigger_count")?,
        last_triggered_at: last_triggered_at.map(epoch_to_utc),
        last_evaluated_at: last_evaluated_at.map(epoch_to_utc),
        created_at: epoch_to_utc(created_at),
    })
}

#[async_trait]
impl AlertRepository for SqliteAlertRepository {
    async fn due_alerts(
        &self,
        priority: AlertPriority,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Alert>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM alerts
            WHERE status = 'active'
              AND priority = ?
              AND (
                  last_evaluated_at IS NULL
                  OR last_evaluated_at + evaluation_interval_seconds < ?
              )
            ORDER BY COALESCE(last_evaluated_at, 0) ASC, created_at ASC
            LIMIT ?
            "#,
        )
        .bind(priority.as_str())
        .bind(now.timestamp())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch due alerts")?;

        rows.iter().map(map_alert).collect()
    }

    async fn get(&self, alert_id: Uuid) -> Result<Option<Alert>> {
        let row = sqlx::query("SELECT * FROM alerts WHERE alert_id = ?")
            .bind(alert_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_alert).transpose()
    }

    async fn mark_evaluated(&self, alert_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE alerts SET last_evaluated_at = ? WHERE alert_id = ?")
            .bind(at.timestamp())
            .bind(alert_id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to update last_evaluated_at")?;
        Ok(())
    }

    async fn record_trigger(&self, alert_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE alerts SET trigger_count = trigger_count + 1, last_triggered_at = ? \
             WHERE alert_id = ?",
        )
        .bind(at.timestamp())
        .bind(alert_id.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to update trigger stats")?;
        Ok(())
    }

    async fn insert_event(&self, event: &AlertEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO alert_events
            (event_id, alert_id, triggered_at, evaluation_result, notification_results)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(event.event_id.to_string())
        .bind(event.alert_id.to_string())
        .bind(event.triggered_at.timestamp())
        .bind(event.evaluation_result.to_string())
        .bind(event.notification_results.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to insert alert event")?;
        Ok(())
    }

    async fn trigger_count_since(&self, alert_id: Uuid, since: DateTime<Utc>) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM alert_events WHERE alert_id = ? AND triggered_at >= ?",
        )
        .bind(alert_id.to_string())
        .bind(since.timestamp())
        .fetch_one(&self.pool)
        .await
        .context("Failed to count alert events")?;
        Ok(count)
    }
}
