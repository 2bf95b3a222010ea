//! Application wiring: builds repositories, services and workers from the
//! configuration and supervises the long-running loops.

use crate::application::aggregator::{AggregatorSettings, FoAggregator};
use crate::application::evaluation_worker::{EvaluationWorker, EvaluationWorkerSettings};
use crate::application::evaluator::{EvaluatorSettings, HttpConditionEvaluator};
use crate::application::ingest::TickIngestLoop;
use crate::application::notification_service::NotificationService;
use crate::application::order_cleanup::OrderCleanupWorker;
use crate::application::position_sync::PositionSyncLoop;
use crate::application::position_tracker::PositionTracker;
use crate::config::Config;
use crate::infrastructure::broker::HttpBrokerProxy;
use crate::infrastructure::hub::FanoutHub;
use crate::infrastructure::persistence::database::Database;
use crate::infrastructure::persistence::repositories::alert_repository::SqliteAlertRepository;
use crate::infrastructure::persistence::repositories::market_data_repository::SqliteMarketDataRepository;
use crate::infrastructure::persistence::repositories::notification_repository::SqliteNotificationRepository;
use crate::infrastructure::persistence::repositories::order_repository::SqliteOrderRepository;
use crate::infrastructure::providers::telegram::{TelegramProvider, TelegramSettings};
use crate::infrastructure::providers::webhook::WebhookProvider;
use crate::infrastructure::ws_feed::WebSocketTickStream;
use crate::infrastructure::ws_server::StreamListener;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct Application {
    config: Config,
    database: Database,
    hub: Arc<FanoutHub>,
    aggregator: Arc<FoAggregator>,
    tracker: Arc<PositionTracker>,
    broker: Arc<HttpBrokerProxy>,
    notifications: Arc<NotificationService>,
    alerts: Arc<SqliteAlertRepository>,
}

pub struct SystemHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl SystemHandle {
    /// Signal shutdown and wait for every loop to drain within the grace
    /// window.
    pub async fn shutdown(self) {
        info!("Initiating graceful shutdown...");
        let _ = self.shutdown.send(true);
        for (name, task) in self.tasks {
            match tokio::time::timeout(Duration::from_secs(15), task).await {
                Ok(Ok(())) => info!("{name} stopped"),
                Ok(Err(e)) => warn!("{name} ended with panic: {e}"),
                Err(_) => warn!("{name} did not stop within the grace window"),
            }
        }
        info!("Shutdown complete.");
    }
}

impl Application {
    pub async fn build(config: Config) -> Result<Self> {
        let database = Database::new(&config.database_url).await?;

        let hub = Arc::new(FanoutHub::new(config.hub_queue_capacity));
        let market_data = Arc::new(SqliteMarketDataRepository::new(database.pool.clone()));
        let aggregator = Arc::new(FoAggregator::new(
            market_data,
            Some(hub.clone()),
            &AggregatorSettings {
                timeframes: config.timeframes.clone(),
                persist_timeframes: config.persist_timeframes.clone(),
                flush_lag_seconds: config.flush_lag_seconds,
                persist_concurrency: config.persist_concurrency,
            },
        ));
        info!("Aggregator configured for timeframes {:?}", aggregator.timeframe_labels());

        let broker = Arc::new(HttpBrokerProxy::new(
            &config.broker_base_url,
            Duration::from_secs(config.broker_cancel_timeout_seconds),
        ));
        let tracker = Arc::new(PositionTracker::new());

        let notification_repo = Arc::new(SqliteNotificationRepository::new(database.pool.clone()));
        let mut notifications = NotificationService::new(notification_repo);
        if config.telegram_bot_token.is_empty() {
            warn!("TELEGRAM_BOT_TOKEN not set; telegram notifications disabled");
        } else {
            notifications.register_provider(
                "telegram",
                Arc::new(TelegramProvider::new(TelegramSettings {
                    bot_token: config.telegram_bot_token.clone(),
                    retry_attempts: config.notification_retry_attempts,
                    retry_backoff_seconds: config.notification_retry_backoff_seconds,
                    rate_limit_per_second: config.global_telegram_rate_limit,
                })),
            );
        }
        notifications.register_provider("webhook", Arc::new(WebhookProvider::new()));
        let notifications = Arc::new(notifications);

        let alerts = Arc::new(SqliteAlertRepository::new(database.pool.clone()));

        Ok(Self { config, database, hub, aggregator, tracker, broker, notifications, alerts })
    }

    pub async fn start(self) -> Result<SystemHandle> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        // C3: the cleanup worker must listen before the first position sync.
        let orders = Arc::new(SqliteOrderRepository::new(self.database.pool.clone()));
        let cleanup = Arc::new(OrderCleanupWorker::new(orders, self.broker.clone()));
        self.tracker.register_listener(cleanup, Some(OrderCleanupWorker::event_filter())).await;

        // C1: ingest feeding the aggregator, fan-out listener for clients.
        let stream = Arc::new(WebSocketTickStream::new(
            self.config.feed_ws_url.clone(),
            self.config.options_channel.clone(),
            self.config.underlying_channel.clone(),
        ));
        let ingest = TickIngestLoop::new(stream, self.aggregator.clone(), shutdown_rx.clone());
        tasks.push(("tick ingest", tokio::spawn(ingest.run())));

        let listener =
            StreamListener::new(self.hub.clone(), self.config.stream_listen_addr.clone());
        tasks.push(("stream listener", tokio::spawn(listener.run(shutdown_rx.clone()))));

        // C2: evaluation worker.
        if self.config.evaluation_worker_enabled {
            let evaluator = Arc::new(HttpConditionEvaluator::new(&EvaluatorSettings {
                ticker_service_url: self.config.ticker_service_url.clone(),
                backend_url: self.config.backend_url.clone(),
                timeout_seconds: self.config.evaluation_timeout_seconds,
            }));
            let worker = EvaluationWorker::new(
                self.alerts.clone(),
                evaluator,
                self.notifications.clone(),
                EvaluationWorkerSettings {
                    batch_size: self.config.evaluation_batch_size,
                    concurrency: self.config.evaluation_concurrency,
                    min_interval_seconds: self.config.min_evaluation_interval,
                },
            );
            tasks.push(("evaluation worker", tokio::spawn(worker.run(shutdown_rx.clone()))));
        } else {
            info!("Evaluation worker disabled by configuration");
        }

        // C3: position sync driving the tracker.
        let sync = PositionSyncLoop::new(
            self.broker.clone(),
            self.tracker.clone(),
            self.config.broker_accounts.clone(),
            Duration::from_secs(self.config.position_sync_interval_seconds.max(1)),
        );
        tasks.push(("position sync", tokio::spawn(sync.run(shutdown_rx))));

        info!("All workers started");
        Ok(SystemHandle { shutdown: shutdown_tx, tasks })
    }
}
