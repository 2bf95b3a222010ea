//! Generic webhook notification provider: POSTs the alert payload to the
//! recipient URL.

use crate::domain::notifications::NotificationResult;
use crate::domain::ports::NotificationProvider;
use crate::infrastructure::core::HttpClientFactory;
use async_trait::async_trait;
use reqwest_middleware::ClientWithMiddleware;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::error;
use url::Url;
use uuid::Uuid;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct WebhookProvider {
    http: ClientWithMiddleware,
}

impl WebhookProvider {
    pub fn new() -> Self {
        Self { http: HttpClientFactory::create_client(DEFAULT_TIMEOUT) }
    }
}

impl Default for WebhookProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationProvider for WebhookProvider {
    async fn send(
        &self,
        recipient: &str,
        message: &str,
        priority: &str,
        metadata: &Value,
    ) -> NotificationResult {
        let payload = json!({
            "message": message,
            "priority": priority,
            "metadata": metadata,
        });
        let response = match self.http.post(recipient).json(&payload).send().await {
            Ok(response) => response,
            Err(e) => {
                error!("Webhook delivery to {recipient} failed: {e}");
                return NotificationResult::failed(format!("{e}"));
            }
        };
        let status = response.status();
        if status.is_success() {
            // Webhook endpoints have no message ids; mint one for the log.
            NotificationResult::sent(Uuid::new_v4().to_string(), None)
        } else {
            let body = response.text().await.unwrap_or_default();
            NotificationResult::failed(format!("HTTP {}: {body}", status.as_u16()))
        }
    }

    fn validate_recipient(&self, recipient: &str) -> bool {
        Url::parse(recipient)
            .map(|url| matches!(url.scheme(), "http" | "https"))
            .unwrap_or(false)
    }

    async fn get_status(&self, _message_id: &str) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_recipient_requires_http_url() {
        let provider = WebhookProvider::new();
        assert!(provider.validate_recipient("https://hooks.example.com/alerts"));
        assert!(provider.validate_recipient("http://localhost:9999/x"));
        assert!(!provider.validate_recipient("ftp://example.com"));
        assert!(!provider.validate_recipient("not a url"));
    }
}
