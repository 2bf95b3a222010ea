//! Position snapshots, semantic change events, and the order records the
//! cleanup worker acts on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// One broker position as reported by the broker proxy (net + day combined).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub account_id: String,
    pub tradingsymbol: String,
    pub exchange: String,
    pub product: String,
    pub quantity: i64,
    #[serde(default)]
    pub average_price: f64,
    #[serde(default)]
    pub last_price: f64,
    #[serde(default)]
    pub pnl: f64,
    #[serde(default)]
    pub day_pnl: f64,
}

/// Identity of a position within an account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PositionKey {
    pub tradingsymbol: String,
    pub exchange: String,
    pub product: String,
}

impl PositionKey {
    pub fn of(position: &Position) -> Self {
        Self {
            tradingsymbol: position.tradingsymbol.clone(),
            exchange: position.exchange.clone(),
            product: position.product.clone(),
        }
    }
}

impl fmt::Display for PositionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.tradingsymbol, self.exchange, self.product)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionEventType {
    Opened,
    Increased,
    Reduced,
    Closed,
    Updated,
}

impl fmt::Display for PositionEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PositionEventType::Opened => "OPENED",
            PositionEventType::Increased => "INCREASED",
            PositionEventType::Reduced => "REDUCED",
            PositionEventType::Closed => "CLOSED",
            PositionEventType::Updated => "UPDATED",
        };
        f.write_str(label)
    }
}

/// Semantic change between two consecutive snapshots of one position.
#[derive(Debug, Clone, Serialize)]
pub struct PositionEvent {
    pub event_type: PositionEventType,
    pub account_id: String,
    pub tradingsymbol: String,
    pub exchange: String,
    pub product: String,
    pub quantity_before: i64,
    pub quantity_after: i64,
    pub quantity_delta: i64,
    pub current_position: Option<Position>,
    pub previous_position: Option<Position>,
    pub timestamp: DateTime<Utc>,
    pub metadata: Value,
}

/// Pending order row from the local order store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_id: String,
    pub account_id: String,
    pub strategy_id: Option<i64>,
    pub tradingsymbol: String,
    pub exchange: String,
    pub product: String,
    pub order_type: String,
    pub quantity: i64,
    pub status: String,
    pub trigger_price: Option<f64>,
    pub placed_at: DateTime<Utc>,
}

impl OrderRecord {
    /// Stop-loss order types subject to cleanup.
    pub fn is_protective(&self) -> bool {
        matches!(self.order_type.as_str(), "SL" | "SL-M")
    }
}

/// Order statuses that still hold margin and can be orphaned.
pub const ACTIVE_ORDER_STATUSES: [&str; 3] = ["PENDING", "OPEN", "TRIGGER PENDING"];

/// Per-strategy cleanup policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategySettings {
    pub strategy_id: Option<i64>,
    pub auto_cleanup_enabled: bool,
    pub cleanup_sl_on_exit: bool,
    pub cleanup_target_on_exit: bool,
    pub allow_orphaned_orders: bool,
    pub notify_on_orphan_detection: bool,
}

impl StrategySettings {
    /// Orders placed without a strategy are never auto-cleaned.
    pub fn manual_defaults() -> Self {
        Self {
            strategy_id: None,
            auto_cleanup_enabled: false,
            cleanup_sl_on_exit: false,
            cleanup_target_on_exit: false,
            allow_orphaned_orders: true,
            notify_on_orphan_detection: false,
        }
    }

    /// A strategy that exists but has no settings row gets cleanup enabled.
    pub fn strategy_defaults(strategy_id: i64) -> Self {
        Self {
            strategy_id: Some(strategy_id),
            auto_cleanup_enabled: true,
            cleanup_sl_on_exit: true,
            cleanup_target_on_exit: true,
            allow_orphaned_orders: false,
            notify_on_orphan_detection: true,
        }
    }
}

/// Append-only record of one cleanup decision.
#[derive(Debug, Clone, Serialize)]
pub struct CleanupLogEntry {
    pub order_id: String,
    pub account_id: String,
    pub strategy_id: Option<i64>,
    pub tradingsymbol: String,
    pub exchange: String,
    pub order_type: String,
    pub cleanup_reason: String,
    pub cleanup_action: String,
    pub was_auto: bool,
    pub position_quantity_before: i64,
    pub position_quantity_after: i64,
    pub metadata: Value,
    pub cleaned_at: DateTime<Utc>,
}
