//! Repository traits for persistence, separating the workers from sqlx.
//!
//! Sqlite implementations live under `infrastructure::persistence`; tests use
//! in-memory mocks.

use crate::domain::alerts::{Alert, AlertEvent, AlertPriority};
use crate::domain::market::{ExpiryMetricsRow, StrikeRow, UnderlyingBarRow};
use crate::domain::notifications::{
    NotificationLogEntry, NotificationPreferences,
};
use crate::domain::positions::{CleanupLogEntry, OrderRecord, StrategySettings};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

/// Rolled-up market data: strike rows, expiry metrics, underlying bars.
#[async_trait]
pub trait MarketDataRepository: Send + Sync {
    async fn upsert_strike_rows(&self, rows: &[StrikeRow]) -> Result<()>;

    async fn upsert_expiry_metrics(&self, rows: &[ExpiryMetricsRow]) -> Result<()>;

    async fn upsert_underlying_bars(&self, rows: &[UnderlyingBarRow]) -> Result<()>;

    async fn fetch_strike_rows(
        &self,
        symbol: &str,
        timeframe: &str,
        expiries: &[NaiveDate],
        time_range: Option<(i64, i64)>,
    ) -> Result<Vec<StrikeRow>>;

    async fn list_expiries(&self, symbol: &str) -> Result<Vec<NaiveDate>>;

    /// Upcoming expiries (today or later), soonest first.
    async fn next_expiries(&self, symbol: &str, limit: i64) -> Result<Vec<NaiveDate>>;
}

/// Alert store plus the append-only event log.
#[async_trait]
pub trait AlertRepository: Send + Sync {
    /// Active alerts of the given priority due for evaluation, oldest
    /// evaluation first, never-evaluated ahead of everything.
    async fn due_alerts(
        &self,
        priority: AlertPriority,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Alert>>;

    async fn get(&self, alert_id: Uuid) -> Result<Option<Alert>>;

    async fn mark_evaluated(&self, alert_id: Uuid, at: DateTime<Utc>) -> Result<()>;

    /// Increment trigger_count and set last_triggered_at.
    async fn record_trigger(&self, alert_id: Uuid, at: DateTime<Utc>) -> Result<()>;

    async fn insert_event(&self, event: &AlertEvent) -> Result<()>;

    async fn trigger_count_since(&self, alert_id: Uuid, since: DateTime<Utc>) -> Result<i64>;
}

/// Notification preferences plus the append-only delivery log.
#[async_trait]
pub trait NotificationRepository: Send + Sync {
    async fn preferences(&self, user_id: &str) -> Result<Option<NotificationPreferences>>;

    async fn append_log(&self, entry: &NotificationLogEntry) -> Result<()>;

    /// Non-failed deliveries to a recipient since the given instant.
    async fn sent_count_since(&self, recipient: &str, since: DateTime<Utc>) -> Result<i64>;
}

/// Local order store, strategy policy and the cleanup audit log.
#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// Orders in an active status for one position identity.
    async fn active_orders_for_position(
        &self,
        account_id: &str,
        tradingsymbol: &str,
        exchange: &str,
        product: &str,
    ) -> Result<Vec<OrderRecord>>;

    async fn strategy_settings(&self, strategy_id: i64) -> Result<Option<StrategySettings>>;

    async fn append_cleanup_log(&self, entry: &CleanupLogEntry) -> Result<()>;
}
