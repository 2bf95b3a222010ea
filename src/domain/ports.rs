use crate::domain::alerts::EvaluationResult;
use crate::domain::notifications::NotificationResult;
use crate::domain::positions::{OrderRecord, Position};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc::Receiver;

/// Feed channel a message arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickChannel {
    Options,
    Underlying,
}

/// One raw message from the tick feed, tagged with its channel.
#[derive(Debug, Clone)]
pub struct ChannelMessage {
    pub channel: TickChannel,
    pub payload: String,
}

// Need async_trait for async functions in traits
#[async_trait]
pub trait TickStream: Send + Sync {
    /// Open a subscription to the options and underlying channels. The
    /// returned receiver ends when the connection drops; callers resubscribe.
    async fn subscribe(&self) -> Result<Receiver<ChannelMessage>>;
}

#[async_trait]
pub trait ConditionEvaluator: Send + Sync {
    /// Evaluate one condition config. Policy failures and remote errors come
    /// back as negative-matched results, never as panics or `Err`.
    async fn evaluate(&self, config: &Value) -> EvaluationResult;

    /// Release pooled resources.
    async fn close(&self) {}
}

#[async_trait]
pub trait BrokerService: Send + Sync {
    async fn fetch_positions(&self, account_id: &str) -> Result<Vec<Position>>;
    async fn fetch_orders(&self, account_id: &str) -> Result<Vec<OrderRecord>>;
    /// Cancel an order. A broker-side 404 counts as success (already gone).
    async fn cancel_order(&self, account_id: &str, order_id: &str, variety: &str) -> Result<()>;
}

#[async_trait]
pub trait NotificationProvider: Send + Sync {
    /// Deliver a message. Delivery failures are reported in the result, not
    /// as errors.
    async fn send(
        &self,
        recipient: &str,
        message: &str,
        priority: &str,
        metadata: &Value,
    ) -> NotificationResult;

    fn validate_recipient(&self, recipient: &str) -> bool;

    async fn get_status(&self, message_id: &str) -> Option<String>;

    async fn close(&self) {}
}
