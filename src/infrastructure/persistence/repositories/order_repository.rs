use crate::domain::positions::{CleanupLogEntry, OrderRecord, StrategySettings};
use crate::domain::repositories::OrderRepository;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use sqlx::{Row, SqlitePool};

pub struct SqliteOrderRepository {
    pool: SqlitePool,
}

impl SqliteOrderRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Mirror an order row from the broker stream (wiring and tests).
    pub async fn upsert_order(&self, order: &OrderRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO account_orders
            (order_id, account_id, strategy_id, tradingsymbol, exchange, product,
             order_type, quantity, status, trigger_price, placed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (order_id) DO UPDATE SET
                status = excluded.status,
                quantity = excluded.quantity,
                trigger_price = excluded.trigger_price
            "#,
        )
        .bind(&order.order_id)
        .bind(&order.account_id)
        .bind(order.strategy_id)
        .bind(&order.tradingsymbol)
        .bind(&order.exchange)
        .bind(&order.product)
        .bind(&order.order_type)
        .bind(order.quantity)
        .bind(&order.status)
        .bind(order.trigger_price)
        .bind(order.placed_at.timestamp())
        .execute(&self.pool)
        .await
        .context("Failed to upsert order")?;
        Ok(())
    }

    pub async fn upsert_strategy_settings(&self, settings: &StrategySettings) -> Result<()> {
        let Some(strategy_id) = settings.strategy_id else {
            anyhow::bail!("strategy settings require a strategy id");
        };
        sqlx::query(
            r#"
            INSERT INTO strategy_settings
            (strategy_id, auto_cleanup_enabled, cleanup_sl_on_exit,
             cleanup_target_on_exit, allow_orphaned_orders, notify_on_orphan_detection)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (strategy_id) DO UPDATE SET
                auto_cleanup_enabled = excluded.auto_cleanup_enabled,
                cleanup_sl_on_exit = excluded.cleanup_sl_on_exit,
                cleanup_target_on_exit = excluded.cleanup_target_on_exit,
                allow_orphaned_orders = excluded.allow_orphaned_orders,
                notify_on_orphan_detection = excluded.notify_on_orphan_detection
            "#,
        )
        .bind(strategy_id)
        .bind(settings.auto_cleanup_enabled)
        .bind(settings.cleanup_sl_on_exit)
        .bind(settings.cleanup_target_on_exit)
        .bind(settings.allow_orphaned_orders)
        .bind(settings.notify_on_orphan_detection)
        .execute(&self.pool)
        .await
        .context("Failed to upsert strategy settings")?;
        Ok(())
    }
}

#[async_trait]
impl OrderRepository for SqliteOrderRepository {
    async fn active_orders_for_position(
        &self,
        account_id: &str,
        tradingsymbol: &str,
        exchange: &str,
        product: &str,
    ) -> Result<Vec<OrderRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT order_id, account_id, strategy_id, tradingsymbol, exchange,
                   product, order_type, quantity, status, trigger_price, placed_at
            FROM account_orders
            WHERE account_id = ?
              AND tradingsymbol = ?
              AND exchange = ?
              AND product = ?
              AND status IN ('PENDING', 'OPEN', 'TRIGGER PENDING')
            ORDER BY placed_at DESC
            "#,
        )
        .bind(account_id)
        .bind(tradingsymbol)
        .bind(exchange)
        .bind(product)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch orders for position")?;

        rows.into_iter()
            .map(|row| {
                let placed_at: i64 = row.try_get("placed_at")?;
                Ok(OrderRecord {
                    order_id: row.try_get("order_id")?,
                    account_id: row.try_get("account_id")?,
                    strategy_id: row.try_get("strategy_id")?,
                    tradingsymbol: row.try_get("tradingsymbol")?,
                    exchange: row.try_get("exchange")?,
                    product: row.try_get("product")?,
                    order_type: row.try_get("order_type")?,
                    quantity: row.try_get("quantity")?,
                    status: row.try_get("status")?,
                    trigger_price: row.try_get("trigger_price")?,
                    placed_at: Utc.timestamp_opt(placed_at, 0).single().unwrap_or_else(Utc::now),
                })
            })
            .collect()
    }

    async fn strategy_settings(&self, strategy_id: i64) -> Result<Option<StrategySettings>> {
        let row = sqlx::query("SELECT * FROM strategy_settings WHERE strategy_id = ?")
            .bind(strategy_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch strategy settings")?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(StrategySettings {
            strategy_id: Some(row.try_get("strategy_id")?),
            auto_cleanup_enabled: row.try_get("auto_cleanup_enabled")?,
            cleanup_sl_on_exit: row.try_get("cleanup_sl_on_exit")?,
            cleanup_target_on_exit: row.try_get("cleanup_target_on_exit")?,
            allow_orphaned_orders: row.try_get("allow_orphaned_orders")?,
            notify_on_orphan_detection: row.try_get("notify_on_orphan_detection")?,
        }))
    }

    async fn append_cleanup_log(&self, entry: &CleanupLogEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO order_cleanup_log
            (order_id, account_id, strategy_id, tradingsymbol, exchange, order_type,
             cleanup_reason, cleanup_action, was_auto,
             position_quantity_before, position_quantity_after, metadata, cleaned_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.order_id)
        .bind(&entry.account_id)
        .bind(entry.strategy_id)
        .bind(&entry.tradingsymbol)
        .bind(&entry.exchange)
        .bind(&entry.order_type)
        .bind(&entry.cleanup_reason)
        .bind(&entry.cleanup_action)
        .bind(entry.was_auto)
        .bind(entry.position_quantity_before)
        .bind(entry.position_quantity_after)
        .bind(entry.metadata.to_string())
        .bind(entry.cleaned_at.timestamp())
        .execute(&self.pool)
        .await
        .context("Failed to append cleanup log")?;
        Ok(())
    }
}
