use crate::domain::alerts::AlertPriority;
use crate::domain::notifications::{
    MessageFormat, NotificationLogEntry, NotificationPreferences,
};
use crate::domain::repositories::NotificationRepository;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};
use sqlx::{Row, SqlitePool};

const CLOCK_FORMAT: &str = "%H:%M:%S";

pub struct SqliteNotificationRepository {
    pool: SqlitePool,
}

impl SqliteNotificationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Upsert the full preferences row (used by wiring and tests; the CRUD
    /// surface lives elsewhere).
    pub async fn upsert_preferences(&self, prefs: &NotificationPreferences) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO notification_preferences
            (user_id, telegram_enabled, telegram_chat_id, webhook_enabled, webhook_url,
             email_enabled, email_addresses, quiet_hours_start, quiet_hours_end,
             quiet_hours_timezone, max_notifications_per_hour, priority_threshold,
             notification_format)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (user_id) DO UPDATE SET
                telegram_enabled = excluded.telegram_enabled,
                telegram_chat_id = excluded.telegram_chat_id,
                webhook_enabled = excluded.webhook_enabled,
                webhook_url = excluded.webhook_url,
                email_enabled = excluded.email_enabled,
                email_addresses = excluded.email_addresses,
                quiet_hours_start = excluded.quiet_hours_start,
                quiet_hours_end = excluded.quiet_hours_end,
                quiet_hours_timezone = excluded.quiet_hours_timezone,
                max_notifications_per_hour = excluded.max_notifications_per_hour,
                priority_threshold = excluded.priority_threshold,
                notification_format = excluded.notification_format
            "#,
        )
        .bind(&prefs.user_id)
        .bind(prefs.telegram_enabled)
        .bind(&prefs.telegram_chat_id)
        .bind(prefs.webhook_enabled)
        .bind(&prefs.webhook_url)
        .bind(prefs.email_enabled)
        .bind(serde_json::to_string(&prefs.email_addresses)?)
        .bind(prefs.quiet_hours_start.map(|t| t.format(CLOCK_FORMAT).to_string()))
        .bind(prefs.quiet_hours_end.map(|t| t.format(CLOCK_FORMAT).to_string()))
        .bind(&prefs.quiet_hours_timezone)
        .bind(prefs.max_notifications_per_hour)
        .bind(prefs.priority_threshold.as_str())
        .bind(prefs.notification_format.as_str())
        .execute(&self.pool)
        .await
        .context("Failed to upsert notification preferences")?;
        Ok(())
    }
}

fn parse_clock(raw: Option<String>) -> Option<NaiveTime> {
    raw.and_then(|s| {
        NaiveTime::parse_from_str(&s, CLOCK_FORMAT)
            .or_else(|_| NaiveTime::parse_from_str(&s, "%H:%M"))
            .ok()
    })
}

#[async_trait]
impl NotificationRepository for SqliteNotificationRepository {
    async fn preferences(&self, user_id: &str) -> Result<Option<NotificationPreferences>> {
        let row = sqlx::query("SELECT * FROM notification_preferences WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load notification preferences")?;
        let Some(row) = row else {
            return Ok(None);
        };

        let email_addresses: String = row.try_get("email_addresses")?;
        let priority_threshold: String = row.try_get("priority_threshold")?;
        let notification_format: String = row.try_get("notification_format")?;
        Ok(Some(NotificationPreferences {
            user_id: row.try_get("user_id")?,
            telegram_enabled: row.try_get("telegram_enabled")?,
            telegram_chat_id: row.try_get("telegram_chat_id")?,
            webhook_enabled: row.try_get("webhook_enabled")?,
            webhook_url: row.try_get("webhook_url")?,
            email_enabled: row.try_get("email_enabled")?,
            email_addresses: serde_json::from_str(&email_addresses).unwrap_or_default(),
            quiet_hours_start: parse_clock(row.try_get("quiet_hours_start")?),
            quiet_hours_end: parse_clock(row.try_get("quiet_hours_end")?),
            quiet_hours_timezone: row.try_get("quiet_hours_timezone")?,
            max_notifications_per_hour: row.try_get("max_notifications_per_hour")?,
            priority_threshold: AlertPriority::parse(&priority_threshold)
                .unwrap_or(AlertPriority::Low),
            notification_format: MessageFormat::parse(&notification_format)
                .unwrap_or(MessageFormat::Rich),
        }))
    }

    async fn append_log(&self, entry: &NotificationLogEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO notification_log
            (event_id, channel, recipient, status, message_id, message_content, sent_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.event_id.map(|id| id.to_string()))
        .bind(&entry.channel)
        .bind(&entry.recipient)
        .bind(&entry.status)
        .bind(&entry.message_id)
        .bind(&entry.message_content)
        .bind(entry.sent_at.timestamp())
        .execute(&self.pool)
        .await
        .context("Failed to append notification log")?;
        Ok(())
    }

    async fn sent_count_since(&self, recipient: &str, since: DateTime<Utc>) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM notification_log \
             WHERE recipient = ? AND sent_at >= ? AND status != 'failed'",
        )
        .bind(recipient)
        .bind(since.timestamp())
        .fetch_one(&self.pool)
        .await
        .context("Failed to count notifications")?;
        Ok(count)
    }
}
