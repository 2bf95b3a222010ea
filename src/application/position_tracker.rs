//! Position tracker: diffs per-account snapshots and emits semantic change
//! events to registered listeners.
//!
//! Listeners run sequentially in registration order; a failing listener is
//! logged and never blocks the rest. Snapshot state is only touched under
//! the tracker mutex and never across a listener await.

use crate::domain::positions::{Position, PositionEvent, PositionEventType, PositionKey};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

const UPDATED_PRICE_CHANGE_PCT: f64 = 0.1;

#[async_trait]
pub trait PositionListener: Send + Sync {
    async fn on_event(&self, event: &PositionEvent) -> Result<()>;
}

type EventFilter = Box<dyn Fn(&PositionEvent) -> bool + Send + Sync>;

pub struct PositionTracker {
    // account_id -> position key -> last seen position
    positions: Mutex<HashMap<String, BTreeMap<PositionKey, Position>>>,
    listeners: RwLock<Vec<(Arc<dyn PositionListener>, Option<EventFilter>)>>,
}

impl PositionTracker {
    pub fn new() -> Self {
        Self { positions: Mutex::new(HashMap::new()), listeners: RwLock::new(Vec::new()) }
    }

    pub async fn register_listener(
        &self,
        listener: Arc<dyn PositionListener>,
        filter: Option<EventFilter>,
    ) {
        self.listeners.write().await.push((listener, filter));
        info!("Registered position event listener");
    }

    /// Diff the incoming snapshot against the stored one, emit events, then
    /// replace the stored snapshot. Updates for one account are expected to
    /// arrive serialized (one sync loop per account).
    pub async fn on_position_update(&self, account_id: &str, positions: Vec<Position>) {
        debug!("Processing position update for {account_id}: {} positions", positions.len());

        let mut new_snapshot: BTreeMap<PositionKey, Position> = BTreeMap::new();
        for position in positions {
            new_snapshot.insert(PositionKey::of(&position), position);
        }

        let events = {
            let state = self.positions.lock().expect("tracker lock poisoned");
            let old_snapshot = state.get(account_id).cloned().unwrap_or_default();
            detect_changes(account_id, &old_snapshot, &new_snapshot)
        };

        for event in &events {
            self.emit(event).await;
        }

        self.positions
            .lock()
            .expect("tracker lock poisoned")
            .insert(account_id.to_string(), new_snapshot);

        debug!("Position update complete for {account_id}: {} events emitted", events.len());
    }

    async fn emit(&self, event: &PositionEvent) {
        let listeners = self.listeners.read().await;
        for (listener, filter) in listeners.iter() {
            if let Some(filter) = filter
                && !filter(event)
            {
                continue;
            }
            if let Err(e) = listener.on_event(event).await {
                error!(
                    "Error in position event listener for {} {}: {e:#}",
                    event.event_type, event.tradingsymbol
                );
            }
        }
    }

    /// Copy of the stored snapshot for an account.
    pub fn current_positions(&self, account_id: &str) -> BTreeMap<PositionKey, Position> {
        self.positions
            .lock()
            .expect("tracker lock poisoned")
            .get(account_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn clear(&self, account_id: Option<&str>) {
        let mut state = self.positions.lock().expect("tracker lock poisoned");
        match account_id {
            Some(account_id) => {
                state.remove(account_id);
                info!("Cleared position snapshot for account {account_id}");
            }
            None => {
                state.clear();
                info!("Cleared all position snapshots");
            }
        }
    }
}

impl Default for PositionTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn detect_changes(
    account_id: &str,
    old_snapshot: &BTreeMap<PositionKey, Position>,
    new_snapshot: &BTreeMap<PositionKey, Position>,
) -> Vec<PositionEvent> {
    let mut events = Vec::new();
    let now = Utc::now();

    // Old keys missing from the update: CLOSED.
    for (key, old_pos) in old_snapshot {
        if new_snapshot.contains_key(key) {
            continue;
        }
        info!(
            "Position CLOSED: {} {} {} (qty: {} -> 0)",
            old_pos.tradingsymbol, old_pos.exchange, old_pos.product, old_pos.quantity
        );
        events.push(PositionEvent {
            event_type: PositionEventType::Closed,
            account_id: account_id.to_string(),
            tradingsymbol: old_pos.tradingsymbol.clone(),
            exchange: old_pos.exchange.clone(),
            product: old_pos.product.clone(),
            quantity_before: old_pos.quantity,
            quantity_after: 0,
            quantity_delta: -old_pos.quantity,
            current_position: None,
            previous_position: Some(old_pos.clone()),
            timestamp: now,
            metadata: json!({"reason": "position_not_in_update"}),
        });
    }

    // New keys absent before: OPENED.
    for (key, new_pos) in new_snapshot {
        if old_snapshot.contains_key(key) {
            continue;
        }
        info!(
            "Position OPENED: {} {} {} (qty: 0 -> {})",
            new_pos.tradingsymbol, new_pos.exchange, new_pos.product, new_pos.quantity
        );
        events.push(PositionEvent {
            event_type: PositionEventType::Opened,
            account_id: account_id.to_string(),
            tradingsymbol: new_pos.tradingsymbol.clone(),
            exchange: new_pos.exchange.clone(),
            product: new_pos.product.clone(),
            quantity_before: 0,
            quantity_after: new_pos.quantity,
            quantity_delta: new_pos.quantity,
            current_position: Some(new_pos.clone()),
            previous_position: None,
            timestamp: now,
            metadata: json!({"reason": "new_position_in_update"}),
        });
    }

    // Keys in both: quantity change, else material price/pnl movement.
    for (key, new_pos) in new_snapshot {
        let Some(old_pos) = old_snapshot.get(key) else {
            continue;
        };
        let delta = new_pos.quantity - old_pos.quantity;
        let (event_type, reason) = if delta > 0 {
            (PositionEventType::Increased, "quantity_increased")
        } else if delta < 0 {
            (PositionEventType::Reduced, "quantity_reduced")
        } else {
            let price_change_pct = if old_pos.last_price != 0.0 {
                ((new_pos.last_price - old_pos.last_price) / old_pos.last_price * 100.0).abs()
            } else {
                0.0
            };
            if price_change_pct > UPDATED_PRICE_CHANGE_PCT || new_pos.pnl != old_pos.pnl {
                (PositionEventType::Updated, "price_pnl_update")
            } else {
                continue;
            }
        };

        if event_type != PositionEventType::Updated {
            info!(
                "Position {}: {} {} {} (qty: {} -> {})",
                event_type,
                new_pos.tradingsymbol,
                new_pos.exchange,
                new_pos.product,
                old_pos.quantity,
                new_pos.quantity
            );
        }
        events.push(PositionEvent {
            event_type,
            account_id: account_id.to_string(),
            tradingsymbol: new_pos.tradingsymbol.clone(),
            exchange: new_pos.exchange.clone(),
            product: new_pos.product.clone(),
            quantity_before: old_pos.quantity,
            quantity_after: new_pos.quantity,
            quantity_delta: delta,
            current_position: Some(new_pos.clone()),
            previous_position: Some(old_pos.clone()),
            timestamp: now,
            metadata: json!({"reason": reason}),
        });
    }

    events
}
