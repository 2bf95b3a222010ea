//! Order-cleanup worker: cancels orphaned SL / SL-M orders when the position
//! they protect shrinks or closes.
//!
//! Registered on the position tracker with a CLOSED/REDUCED filter. Every
//! decision except the reduced-and-still-covered case is written to the
//! cleanup audit log.

use crate::application::position_tracker::PositionListener;
use crate::domain::ports::BrokerService;
use crate::domain::positions::{
    CleanupLogEntry, OrderRecord, PositionEvent, PositionEventType, StrategySettings,
};
use crate::domain::repositories::OrderRepository;
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const CANCEL_VARIETY: &str = "regular";

pub struct OrderCleanupWorker {
    orders: Arc<dyn OrderRepository>,
    broker: Arc<dyn BrokerService>,
}

impl OrderCleanupWorker {
    pub fn new(orders: Arc<dyn OrderRepository>, broker: Arc<dyn BrokerService>) -> Self {
        Self { orders, broker }
    }

    /// Filter for listener registration: only position exits matter here.
    pub fn event_filter() -> Box<dyn Fn(&PositionEvent) -> bool + Send + Sync> {
        Box::new(|event| {
            matches!(event.event_type, PositionEventType::Closed | PositionEventType::Reduced)
        })
    }

    async fn process_event(&self, event: &PositionEvent) -> Result<()> {
        info!(
            "Processing cleanup for {}: {} {} {} (qty: {} -> {})",
            event.event_type,
            event.tradingsymbol,
            event.exchange,
            event.product,
            event.quantity_before,
            event.quantity_after
        );

        let orders = self
            .orders
            .active_orders_for_position(
                &event.account_id,
                &event.tradingsymbol,
                &event.exchange,
                &event.product,
            )
            .await?;

        let protective: Vec<&OrderRecord> = orders.iter().filter(|o| o.is_protective()).collect();
        if protective.is_empty() {
            debug!("No active SL orders for {}", event.tradingsymbol);
            return Ok(());
        }
        info!("Found {} SL orders to process for {}", protective.len(), event.tradingsymbol);

        for order in protective {
            self.process_order(order, event).await;
        }
        Ok(())
    }

    async fn process_order(&self, order: &OrderRecord, event: &PositionEvent) {
        let settings = self.strategy_settings(order.strategy_id).await;

        if !settings.auto_cleanup_enabled {
            info!("Cleanup disabled for order {} (strategy {:?})", order.order_id, order.strategy_id);
            self.log_action(order, event, "skipped", "auto_cleanup_disabled", false).await;
            return;
        }

        if order.order_type == "SL" && !settings.cleanup_sl_on_exit {
            info!("SL cleanup disabled for strategy {:?}", order.strategy_id);
            self.log_action(order, event, "skipped", "cleanup_sl_on_exit_disabled", false).await;
            return;
        }

        // A reduced position that still covers the order quantity keeps its
        // stop; nothing to log.
        if event.event_type == PositionEventType::Reduced {
            if order.quantity <= event.quantity_after {
                debug!(
                    "Order {} quantity ({}) <= remaining position ({}), skipping cleanup",
                    order.order_id, order.quantity, event.quantity_after
                );
                return;
            }
            info!(
                "Order {} quantity ({}) > remaining position ({}), will cancel",
                order.order_id, order.quantity, event.quantity_after
            );
        }

        let (action, reason) = match self
            .broker
            .cancel_order(&order.account_id, &order.order_id, CANCEL_VARIETY)
            .await
        {
            Ok(()) => {
                info!("Cancelled order {}", order.order_id);
                let reason = match event.event_type {
                    PositionEventType::Closed => "position_closed",
                    _ => "position_reduced",
                };
                ("cancelled", reason)
            }
            Err(e) => {
                warn!("Failed to cancel order {}: {e:#}", order.order_id);
                ("failed", "ticker_service_error")
            }
        };
        self.log_action(order, event, action, reason, true).await;
    }

    async fn strategy_settings(&self, strategy_id: Option<i64>) -> StrategySettings {
        let Some(strategy_id) = strategy_id else {
            return StrategySettings::manual_defaults();
        };
        match self.orders.strategy_settings(strategy_id).await {
            Ok(Some(settings)) => settings,
            Ok(None) => {
                warn!("No settings found for strategy {strategy_id}, using defaults");
                StrategySettings::strategy_defaults(strategy_id)
            }
            Err(e) => {
                error!("Error fetching settings for strategy {strategy_id}: {e:#}");
                StrategySettings::strategy_defaults(strategy_id)
            }
        }
    }

    async fn log_action(
        &self,
        order: &OrderRecord,
        event: &PositionEvent,
        action: &str,
        reason: &str,
        was_auto: bool,
    ) {
        let entry = CleanupLogEntry {
            order_id: order.order_id.clone(),
            account_id: order.account_id.clone(),
            strategy_id: order.strategy_id,
            tradingsymbol: order.tradingsymbol.clone(),
            exchange: order.exchange.clone(),
            order_type: order.order_type.clone(),
            cleanup_reason: reason.to_string(),
            cleanup_action: action.to_string(),
            was_auto,
            position_quantity_before: event.quantity_before,
            position_quantity_after: event.quantity_after,
            metadata: json!({
                "event_type": event.event_type,
                "product": event.product,
                "order_status": order.status,
                "order_quantity": order.quantity,
            }),
            cleaned_at: Utc::now(),
        };
        if let Err(e) = self.orders.append_cleanup_log(&entry).await {
            error!("Error logging cleanup action for order {}: {e:#}", order.order_id);
        }
    }
}

#[async_trait]
impl PositionListener for OrderCleanupWorker {
    async fn on_event(&self, event: &PositionEvent) -> Result<()> {
        self.process_event(event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Mutex;

    #[derive(Default)]
    struct StubOrderRepository {
        orders: Vec<OrderRecord>,
        settings: Vec<StrategySettings>,
        log: Mutex<Vec<CleanupLogEntry>>,
    }

    #[async_trait]
    impl OrderRepository for StubOrderRepository {
        async fn active_orders_for_position(
            &self,
            _account_id: &str,
            tradingsymbol: &str,
            _exchange: &str,
            _product: &str,
        ) -> Result<Vec<OrderRecord>> {
            Ok(self
                .orders
                .iter()
                .filter(|o| o.tradingsymbol == tradingsymbol)
                .cloned()
                .collect())
        }
        async fn strategy_settings(&self, strategy_id: i64) -> Result<Option<StrategySettings>> {
            Ok(self.settings.iter().find(|s| s.strategy_id == Some(strategy_id)).cloned())
        }
        async fn append_cleanup_log(&self, entry: &CleanupLogEntry) -> Result<()> {
            self.log.lock().unwrap().push(entry.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct StubBroker {
        fail_cancel: bool,
        cancelled: Mutex<Vec<(String, String, String)>>,
    }

    #[async_trait]
    impl BrokerService for StubBroker {
        async fn fetch_positions(
            &self,
            _account_id: &str,
        ) -> Result<Vec<crate::domain::positions::Position>> {
            Ok(vec![])
        }
        async fn fetch_orders(&self, _account_id: &str) -> Result<Vec<OrderRecord>> {
            Ok(vec![])
        }
        async fn cancel_order(
            &self,
            account_id: &str,
            order_id: &str,
            variety: &str,
        ) -> Result<()> {
            if self.fail_cancel {
                anyhow::bail!("broker unreachable");
            }
            self.cancelled.lock().unwrap().push((
                account_id.to_string(),
                order_id.to_string(),
                variety.to_string(),
            ));
            Ok(())
        }
    }

    fn order(order_id: &str, order_type: &str, quantity: i64, strategy_id: Option<i64>) -> OrderRecord {
        OrderRecord {
            order_id: order_id.to_string(),
            account_id: "A".to_string(),
            strategy_id,
            tradingsymbol: "NIFTY24NOV24000CE".to_string(),
            exchange: "NFO".to_string(),
            product: "NRML".to_string(),
            order_type: order_type.to_string(),
            quantity,
            status: "TRIGGER PENDING".to_string(),
            trigger_price: Some(150.0),
            placed_at: Utc::now(),
        }
    }

    fn event(event_type: PositionEventType, before: i64, after: i64) -> PositionEvent {
        PositionEvent {
            event_type,
            account_id: "A".to_string(),
            tradingsymbol: "NIFTY24NOV24000CE".to_string(),
            exchange: "NFO".to_string(),
            product: "NRML".to_string(),
            quantity_before: before,
            quantity_after: after,
            quantity_delta: after - before,
            current_position: None,
            previous_position: None,
            timestamp: Utc::now(),
            metadata: json!({}),
        }
    }

    fn enabled_settings(strategy_id: i64) -> StrategySettings {
        StrategySettings {
            strategy_id: Some(strategy_id),
            auto_cleanup_enabled: true,
            cleanup_sl_on_exit: true,
            cleanup_target_on_exit: true,
            allow_orphaned_orders: false,
            notify_on_orphan_detection: true,
        }
    }

    #[tokio::test]
    async fn test_closed_position_cancels_orphaned_stop() {
        let repo = Arc::new(StubOrderRepository {
            orders: vec![order("ord-1", "SL", 50, Some(7))],
            settings: vec![enabled_settings(7)],
            log: Mutex::new(Vec::new()),
        });
        let broker = Arc::new(StubBroker::default());
        let worker = OrderCleanupWorker::new(repo.clone(), broker.clone());

        worker.on_event(&event(PositionEventType::Closed, 50, 0)).await.unwrap();

        let cancelled = broker.cancelled.lock().unwrap();
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0], ("A".to_string(), "ord-1".to_string(), "regular".to_string()));

        let log = repo.log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].cleanup_action, "cancelled");
        assert_eq!(log[0].cleanup_reason, "position_closed");
        assert!(log[0].was_auto);
    }

    #[tokio::test]
    async fn test_reduced_within_remaining_is_silent() {
        // Position reduced 100 -> 30 with an SL of 20: still covered.
        let repo = Arc::new(StubOrderRepository {
            orders: vec![order("ord-1", "SL", 20, Some(7))],
            settings: vec![enabled_settings(7)],
            log: Mutex::new(Vec::new()),
        });
        let broker = Arc::new(StubBroker::default());
        let worker = OrderCleanupWorker::new(repo.clone(), broker.clone());

        worker.on_event(&event(PositionEventType::Reduced, 100, 30)).await.unwrap();

        assert!(broker.cancelled.lock().unwrap().is_empty());
        assert!(repo.log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reduced_beyond_remaining_cancels() {
        let repo = Arc::new(StubOrderRepository {
            orders: vec![order("ord-1", "SL-M", 80, Some(7))],
            settings: vec![enabled_settings(7)],
            log: Mutex::new(Vec::new()),
        });
        let broker = Arc::new(StubBroker::default());
        let worker = OrderCleanupWorker::new(repo.clone(), broker.clone());

        worker.on_event(&event(PositionEventType::Reduced, 100, 30)).await.unwrap();

        assert_eq!(broker.cancelled.lock().unwrap().len(), 1);
        let log = repo.log.lock().unwrap();
        assert_eq!(log[0].cleanup_reason, "position_reduced");
    }

    #[tokio::test]
    async fn test_manual_order_never_auto_cleaned() {
        let repo = Arc::new(StubOrderRepository {
            orders: vec![order("ord-1", "SL", 50, None)],
            settings: vec![],
            log: Mutex::new(Vec::new()),
        });
        let broker = Arc::new(StubBroker::default());
        let worker = OrderCleanupWorker::new(repo.clone(), broker.clone());

        worker.on_event(&event(PositionEventType::Closed, 50, 0)).await.unwrap();

        assert!(broker.cancelled.lock().unwrap().is_empty());
        let log = repo.log.lock().unwrap();
        assert_eq!(log[0].cleanup_action, "skipped");
        assert_eq!(log[0].cleanup_reason, "auto_cleanup_disabled");
        assert!(!log[0].was_auto);
    }

    #[tokio::test]
    async fn test_sl_gate_skips_when_disabled() {
        let mut settings = enabled_settings(7);
        settings.cleanup_sl_on_exit = false;
        let repo = Arc::new(StubOrderRepository {
            orders: vec![order("ord-1", "SL", 50, Some(7))],
            settings: vec![settings],
            log: Mutex::new(Vec::new()),
        });
        let broker = Arc::new(StubBroker::default());
        let worker = OrderCleanupWorker::new(repo.clone(), broker.clone());

        worker.on_event(&event(PositionEventType::Closed, 50, 0)).await.unwrap();

        assert!(broker.cancelled.lock().unwrap().is_empty());
        assert_eq!(repo.log.lock().unwrap()[0].cleanup_reason, "cleanup_sl_on_exit_disabled");
    }

    #[tokio::test]
    async fn test_missing_settings_row_defaults_to_cleanup() {
        let repo = Arc::new(StubOrderRepository {
            orders: vec![order("ord-1", "SL", 50, Some(99))],
            settings: vec![],
            log: Mutex::new(Vec::new()),
        });
        let broker = Arc::new(StubBroker::default());
        let worker = OrderCleanupWorker::new(repo.clone(), broker.clone());

        worker.on_event(&event(PositionEventType::Closed, 50, 0)).await.unwrap();

        assert_eq!(broker.cancelled.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_broker_failure_logged_as_failed() {
        let repo = Arc::new(StubOrderRepository {
            orders: vec![order("ord-1", "SL", 50, Some(7))],
            settings: vec![enabled_settings(7)],
            log: Mutex::new(Vec::new()),
        });
        let broker = Arc::new(StubBroker { fail_cancel: true, ..Default::default() });
        let worker = OrderCleanupWorker::new(repo.clone(), broker);

        worker.on_event(&event(PositionEventType::Closed, 50, 0)).await.unwrap();

        let log = repo.log.lock().unwrap();
        assert_eq!(log[0].cleanup_action, "failed");
        assert_eq!(log[0].cleanup_reason, "ticker_service_error");
    }

    #[tokio::test]
    async fn test_non_protective_orders_ignored() {
        let repo = Arc::new(StubOrderRepository {
            orders: vec![order("ord-1", "LIMIT", 50, Some(7))],
            settings: vec![enabled_settings(7)],
            log: Mutex::new(Vec::new()),
        });
        let broker = Arc::new(StubBroker::default());
        let worker = OrderCleanupWorker::new(repo.clone(), broker.clone());

        worker.on_event(&event(PositionEventType::Closed, 50, 0)).await.unwrap();

        assert!(broker.cancelled.lock().unwrap().is_empty());
        assert!(repo.log.lock().unwrap().is_empty());
    }
}
