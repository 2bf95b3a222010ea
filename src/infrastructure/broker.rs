//! HTTP client for the broker proxy (the ticker service owns the actual
//! broker session and credentials).

use crate::domain::errors::BrokerError;
use crate::domain::ports::BrokerService;
use crate::domain::positions::{OrderRecord, Position};
use crate::infrastructure::core::HttpClientFactory;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use reqwest_middleware::ClientWithMiddleware;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};

pub struct HttpBrokerProxy {
    http: ClientWithMiddleware,
    base_url: String,
}

impl HttpBrokerProxy {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        Self {
            http: HttpClientFactory::create_client(timeout),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

/// Position payload as the proxy reports it; the account id comes from the
/// request path, not the body.
#[derive(Debug, Deserialize)]
struct ProxyPosition {
    tradingsymbol: String,
    exchange: String,
    product: String,
    quantity: i64,
    #[serde(default)]
    average_price: f64,
    #[serde(default)]
    last_price: f64,
    #[serde(default)]
    pnl: f64,
    #[serde(default)]
    day_pnl: f64,
}

#[derive(Debug, Deserialize)]
struct PositionsResponse {
    #[serde(default)]
    positions: Vec<ProxyPosition>,
}

#[derive(Debug, Deserialize)]
struct ProxyOrder {
    order_id: String,
    #[serde(default)]
    strategy_id: Option<i64>,
    tradingsymbol: String,
    exchange: String,
    product: String,
    order_type: String,
    quantity: i64,
    status: String,
    #[serde(default)]
    trigger_price: Option<f64>,
    #[serde(default)]
    placed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct OrdersResponse {
    #[serde(default)]
    orders: Vec<ProxyOrder>,
}

#[async_trait]
impl BrokerService for HttpBrokerProxy {
    async fn fetch_positions(&self, account_id: &str) -> Result<Vec<Position>> {
        let url = format!("{}/accounts/{account_id}/positions", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to reach broker proxy at {url}"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BrokerError::RequestFailed { status: status.as_u16(), body }.into());
        }
        let payload: PositionsResponse =
            response.json().await.context("Malformed positions response")?;
        Ok(payload
            .positions
            .into_iter()
            .map(|p| Position {
                account_id: account_id.to_string(),
                tradingsymbol: p.tradingsymbol,
                exchange: p.exchange,
                product: p.product,
                quantity: p.quantity,
                average_price: p.average_price,
                last_price: p.last_price,
                pnl: p.pnl,
                day_pnl: p.day_pnl,
            })
            .collect())
    }

    async fn fetch_orders(&self, account_id: &str) -> Result<Vec<OrderRecord>> {
        let url = format!("{}/accounts/{account_id}/orders", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to reach broker proxy at {url}"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BrokerError::RequestFailed { status: status.as_u16(), body }.into());
        }
        let payload: OrdersResponse = response.json().await.context("Malformed orders response")?;
        Ok(payload
            .orders
            .into_iter()
            .map(|o| OrderRecord {
                order_id: o.order_id,
                account_id: account_id.to_string(),
                strategy_id: o.strategy_id,
                tradingsymbol: o.tradingsymbol,
                exchange: o.exchange,
                product: o.product,
                order_type: o.order_type,
                quantity: o.quantity,
                status: o.status,
                trigger_price: o.trigger_price,
                placed_at: o.placed_at.unwrap_or_else(Utc::now),
            })
            .collect())
    }

    async fn cancel_order(&self, account_id: &str, order_id: &str, variety: &str) -> Result<()> {
        let url = format!("{}/orders/cancel", self.base_url);
        let payload = json!({
            "account_id": account_id,
            "order_id": order_id,
            "variety": variety,
        });
        let response = self
            .http
            .post(&url)
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("Failed to reach broker proxy at {url}"))?;

        match response.status() {
            // 404 means the order is already gone; cancellation is idempotent.
            StatusCode::OK | StatusCode::ACCEPTED => {
                info!("Cancelled order {order_id} via broker proxy");
                Ok(())
            }
            StatusCode::NOT_FOUND => {
                info!("Order {order_id} already gone at broker (404), treating as cancelled");
                Ok(())
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                warn!("Cancel of {order_id} failed: status={status} body={body}");
                Err(BrokerError::RequestFailed { status: status.as_u16(), body }.into())
            }
        }
    }
}
