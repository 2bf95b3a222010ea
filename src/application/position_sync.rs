//! Position sync loop: polls the broker proxy for each configured account
//! and feeds the snapshots to the position tracker.

use crate::application::position_tracker::PositionTracker;
use crate::domain::ports::BrokerService;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

pub struct PositionSyncLoop {
    broker: Arc<dyn BrokerService>,
    tracker: Arc<PositionTracker>,
    accounts: Vec<String>,
    interval: Duration,
}

impl PositionSyncLoop {
    pub fn new(
        broker: Arc<dyn BrokerService>,
        tracker: Arc<PositionTracker>,
        accounts: Vec<String>,
        interval: Duration,
    ) -> Self {
        Self { broker, tracker, accounts, interval }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Position sync loop started for {} account(s)", self.accounts.len());
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.sync_all().await;
                }
            }
        }
        info!("Position sync loop stopped");
    }

    async fn sync_all(&self) {
        for account_id in &self.accounts {
            match self.broker.fetch_positions(account_id).await {
                Ok(positions) => {
                    self.tracker.on_position_update(account_id, positions).await;
                }
                Err(e) => {
                    warn!("Failed to fetch positions for {account_id}: {e:#}");
                }
            }
        }
    }
}
