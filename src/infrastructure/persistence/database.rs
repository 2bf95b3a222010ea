use anyhow::{Context, Result};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tokio::fs;
use tracing::info;

/// Shared database handle
#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn new(db_url: &str) -> Result<Self> {
        // Ensure the directory exists if it's a file path
        if let Some(path_part) = db_url.strip_prefix("sqlite://") {
            let path = Path::new(path_part);
            if let Some(parent) = path.parent()
                && !parent.exists()
            {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create database directory")?;
            }
        }

        let options = SqliteConnectOptions::from_str(db_url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal); // Better for concurrency

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        info!("Connected to database: {}", db_url);

        let db = Self { pool };
        db.init().await?;

        Ok(db)
    }

    /// Single-connection in-memory database for tests.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("Failed to open in-memory SQLite database")?;
        let db = Self { pool };
        db.init().await?;
        Ok(db)
    }

    /// Initialize database schema
    async fn init(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;

        // 1. Strike-bucket rollups
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS fo_strike_buckets (
                timeframe TEXT NOT NULL,
                symbol TEXT NOT NULL,
                expiry TEXT NOT NULL,
                strike REAL NOT NULL,
                bucket_time INTEGER NOT NULL,
                underlying_close REAL,
                call_stats TEXT NOT NULL,
                put_stats TEXT NOT NULL,
                liquidity TEXT,
                PRIMARY KEY (timeframe, symbol, expiry, strike, bucket_time)
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create fo_strike_buckets table")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_strike_buckets_symbol_time
            ON fo_strike_buckets (symbol, timeframe, bucket_time);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create strike bucket index")?;

        // 2. Expiry-level metrics
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS fo_expiry_metrics (
                timeframe TEXT NOT NULL,
                symbol TEXT NOT NULL,
                expiry TEXT NOT NULL,
                bucket_time INTEGER NOT NULL,
                underlying_close REAL,
                total_call_volume REAL NOT NULL,
                total_put_volume REAL NOT NULL,
                total_call_oi REAL NOT NULL,
                total_put_oi REAL NOT NULL,
                pcr REAL,
                max_pain_strike REAL,
                PRIMARY KEY (timeframe, symbol, expiry, bucket_time)
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create fo_expiry_metrics table")?;

        // 3. Underlying OHLCV bars
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS underlying_bars (
                symbol TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                time INTEGER NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume INTEGER NOT NULL,
                source TEXT,
                PRIMARY KEY (symbol, timeframe, time)
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create underlying_bars table")?;

        // 4. Alerts
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS alerts (
                alert_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                name TEXT NOT NULL,
                alert_type TEXT NOT NULL,
                priority TEXT NOT NULL DEFAULT 'medium',
                status TEXT NOT NULL DEFAULT 'active',
                condition_config TEXT NOT NULL,
                notification_channels TEXT NOT NULL DEFAULT '[]',
                evaluation_interval_seconds INTEGER NOT NULL DEFAULT 60,
                cooldown_seconds INTEGER NOT NULL DEFAULT 0,
                max_triggers_per_day INTEGER,
                trigger_count INTEGER NOT NULL DEFAULT 0,
                last_triggered_at INTEGER,
                last_evaluated_at INTEGER,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_alerts_due
            ON alerts (status, priority, last_evaluated_at);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create alerts table")?;

        // 5. Alert events (append-only)
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS alert_events (
                event_id TEXT PRIMARY KEY,
                alert_id TEXT NOT NULL,
                triggered_at INTEGER NOT NULL,
                evaluation_result TEXT NOT NULL,
                notification_results TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_alert_events_alert_time
            ON alert_events (alert_id, triggered_at);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create alert_events table")?;

        // 6. Notification preferences
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS notification_preferences (
                user_id TEXT PRIMARY KEY,
                telegram_enabled INTEGER NOT NULL DEFAULT 0,
                telegram_chat_id TEXT,
                webhook_enabled INTEGER NOT NULL DEFAULT 0,
                webhook_url TEXT,
                email_enabled INTEGER NOT NULL DEFAULT 0,
                email_addresses TEXT NOT NULL DEFAULT '[]',
                quiet_hours_start TEXT,
                quiet_hours_end TEXT,
                quiet_hours_timezone TEXT NOT NULL DEFAULT 'Asia/Kolkata',
                max_notifications_per_hour INTEGER NOT NULL DEFAULT 50,
                priority_threshold TEXT NOT NULL DEFAULT 'low',
                notification_format TEXT NOT NULL DEFAULT 'rich'
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create notification_preferences table")?;

        // 7. Notification log (append-only)
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS notification_log (
                log_id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_id TEXT,
                channel TEXT NOT NULL,
                recipient TEXT NOT NULL,
                status TEXT NOT NULL,
                message_id TEXT,
                message_content TEXT,
                sent_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_notification_log_recipient_time
            ON notification_log (recipient, sent_at);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create notification_log table")?;

        // 8. Local order mirror
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS account_orders (
                order_id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                strategy_id INTEGER,
                tradingsymbol TEXT NOT NULL,
                exchange TEXT NOT NULL,
                product TEXT NOT NULL,
                order_type TEXT NOT NULL,
                quantity INTEGER NOT NULL,
                status TEXT NOT NULL,
                trigger_price REAL,
                placed_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_account_orders_position
            ON account_orders (account_id, tradingsymbol, exchange, product, status);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create account_orders table")?;

        // 9. Strategy cleanup policy
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS strategy_settings (
                strategy_id INTEGER PRIMARY KEY,
                auto_cleanup_enabled INTEGER NOT NULL DEFAULT 1,
                cleanup_sl_on_exit INTEGER NOT NULL DEFAULT 1,
                cleanup_target_on_exit INTEGER NOT NULL DEFAULT 1,
                allow_orphaned_orders INTEGER NOT NULL DEFAULT 0,
                notify_on_orphan_detection INTEGER NOT NULL DEFAULT 1
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create strategy_settings table")?;

        // 10. Cleanup audit log (append-only)
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS order_cleanup_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                order_id TEXT NOT NULL,
                account_id TEXT NOT NULL,
                strategy_id INTEGER,
                tradingsymbol TEXT NOT NULL,
                exchange TEXT NOT NULL,
                order_type TEXT NOT NULL,
                cleanup_reason TEXT NOT NULL,
                cleanup_action TEXT NOT NULL,
                was_auto INTEGER NOT NULL,
                position_quantity_before INTEGER NOT NULL,
                position_quantity_after INTEGER NOT NULL,
                metadata TEXT,
                cleaned_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create order_cleanup_log table")?;

        info!("Database schema initialized.");
        Ok(())
    }
}
