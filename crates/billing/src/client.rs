//! Payment processor API client
//!
//! Outbound half of the processor integration: the consistency auditor
//! re-fetches authoritative subscription state through this client. The
//! webhook path never calls out — it works from the delivered payload.

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{BillingError, BillingResult};
use crate::events::{self, SubscriptionState};

/// Processor credentials and endpoints.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Secret API key, sent as a bearer token.
    pub secret_key: String,
    /// Shared secret for webhook signature verification.
    pub webhook_secret: String,
    /// REST API base, e.g. `https://api.processor.example`.
    pub api_base: String,
}

impl ProcessorConfig {
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("PROCESSOR_SECRET_KEY")
            .map_err(|_| BillingError::Internal("PROCESSOR_SECRET_KEY not set".to_string()))?;
        let webhook_secret = std::env::var("PROCESSOR_WEBHOOK_SECRET")
            .map_err(|_| BillingError::Internal("PROCESSOR_WEBHOOK_SECRET not set".to_string()))?;
        let api_base = std::env::var("PROCESSOR_API_BASE")
            .unwrap_or_else(|_| "https://api.processor.example".to_string());

        Ok(Self {
            secret_key,
            webhook_secret,
            api_base,
        })
    }
}

/// Authoritative-state source for audit and repair.
#[async_trait]
pub trait ProcessorClient: Send + Sync {
    /// Fetch the processor's current view of a subscription.
    async fn fetch_subscription(&self, subscription_ref: &str)
        -> BillingResult<SubscriptionState>;
}

/// reqwest-backed client against the processor REST API.
pub struct HttpProcessorClient {
    http: reqwest::Client,
    config: ProcessorConfig,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    error: ApiErrorDetail,
}

#[derive(Debug, Default, Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    message: String,
}

impl HttpProcessorClient {
    pub fn new(config: ProcessorConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }
}

#[async_trait]
impl ProcessorClient for HttpProcessorClient {
    async fn fetch_subscription(
        &self,
        subscription_ref: &str,
    ) -> BillingResult<SubscriptionState> {
        let url = format!(
            "{}/v1/subscriptions/{}",
            self.config.api_base, subscription_ref
        );

        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.config.secret_key)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(BillingError::SubscriptionNotFound(
                subscription_ref.to_string(),
            ));
        }
        if !status.is_success() {
            let message = response
                .json::<ApiErrorBody>()
                .await
                .map(|b| b.error.message)
                .unwrap_or_default();
            return Err(BillingError::Processor(format!(
                "GET {} returned {}: {}",
                url, status, message
            )));
        }

        let body: serde_json::Value = response.json().await?;
        events::parse_subscription_object(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::SubscriptionStatus;

    fn config(api_base: String) -> ProcessorConfig {
        ProcessorConfig {
            secret_key: "sk_test_123".to_string(),
            webhook_secret: "whsec_test".to_string(),
            api_base,
        }
    }

    #[tokio::test]
    async fn fetches_and_parses_subscription() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/subscriptions/sub_42")
            .match_header("authorization", "Bearer sk_test_123")
            .with_status(200)
            .with_body(
                r#"{
                    "id": "sub_42",
                    "customer": "cus_42",
                    "status": "past_due",
                    "cancel_at_period_end": false,
                    "current_period_start": 1700000000,
                    "current_period_end": 1702592000
                }"#,
            )
            .create_async()
            .await;

        let client = HttpProcessorClient::new(config(server.url()));
        let state = client.fetch_subscription("sub_42").await.unwrap();

        mock.assert_async().await;
        assert_eq!(state.subscription_ref, "sub_42");
        assert_eq!(state.status, SubscriptionStatus::PastDue);
        assert_eq!(state.customer_ref.as_deref(), Some("cus_42"));
    }

    #[tokio::test]
    async fn missing_subscription_maps_to_not_found() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/subscriptions/sub_gone")
            .with_status(404)
            .with_body(r#"{"error": {"message": "No such subscription"}}"#)
            .create_async()
            .await;

        let client = HttpProcessorClient::new(config(server.url()));
        let err = client.fetch_subscription("sub_gone").await.unwrap_err();
        assert!(matches!(err, BillingError::SubscriptionNotFound(_)));
    }

    #[tokio::test]
    async fn server_error_maps_to_processor_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/subscriptions/sub_42")
            .with_status(503)
            .with_body(r#"{"error": {"message": "try again"}}"#)
            .create_async()
            .await;

        let client = HttpProcessorClient::new(config(server.url()));
        let err = client.fetch_subscription("sub_42").await.unwrap_err();
        match err {
            BillingError::Processor(msg) => assert!(msg.contains("503")),
            other => panic!("wrong error: {:?}", other),
        }
    }
}
