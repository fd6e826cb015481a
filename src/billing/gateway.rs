use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

use crate::config;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("payment declined: {0}")]
    Declined(String),
    #[error("payment gateway timed out")]
    Timeout,
    #[error("payment gateway unavailable (status {status}): {message}")]
    Unavailable { status: u16, message: String },
    #[error("payment gateway transport error: {0}")]
    Transport(String),
}

/// One charge against a card on file. The idempotency key makes a retried
/// request safe on the gateway side.
#[derive(Debug, Clone, Serialize)]
pub struct ChargeRequest {
    pub user_id: i64,
    pub amount_cents: i64,
    pub payer_token: String,
    pub memo: String,
    pub idempotency_key: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeReceipt {
    pub transaction_ref: String,
    #[serde(default)]
    pub message: Option<String>,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeReceipt, GatewayError>;
}

/// Gateway client talking to the external payment processor over HTTP.
pub struct HttpPaymentGateway {
    client: reqwest::Client,
    base_url: Url,
    auth_token: Option<String>,
}

impl HttpPaymentGateway {
    pub fn new(
        base_url: &str,
        auth_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let base_url =
            Url::parse(base_url).map_err(|err| GatewayError::Transport(err.to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| GatewayError::Transport(err.to_string()))?;
        Ok(Self {
            client,
            base_url,
            auth_token,
        })
    }

    pub fn from_env() -> Result<Self, GatewayError> {
        Self::new(
            config::PAYMENT_GATEWAY_ENDPOINT.as_str(),
            config::PAYMENT_GATEWAY_TOKEN.clone(),
            Duration::from_secs(*config::PAYMENT_GATEWAY_TIMEOUT_SECS),
        )
    }

    fn endpoint(&self, path: &str) -> Result<Url, GatewayError> {
        self.base_url
            .join(path)
            .map_err(|err| GatewayError::Transport(err.to_string()))
    }

    fn auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeReceipt, GatewayError> {
        let url = self.endpoint("charges")?;
        let response = self
            .auth(self.client.post(url))
            .header("Idempotency-Key", request.idempotency_key.to_string())
            .json(request)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    GatewayError::Timeout
                } else {
                    GatewayError::Transport(err.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<ChargeReceipt>()
                .await
                .map_err(|err| GatewayError::Transport(err.to_string()));
        }

        let body = response.text().await.unwrap_or_default();
        if status.is_client_error() {
            return Err(GatewayError::Declined(decline_reason(&body)));
        }
        Err(GatewayError::Unavailable {
            status: status.as_u16(),
            message: body.chars().take(200).collect(),
        })
    }
}

/// Pulls the human readable reason out of a decline body shaped like
/// `{"message": "..."}`, falling back to the raw body.
fn decline_reason(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(message) = value.get("message").and_then(|message| message.as_str()) {
            return message.to_string();
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        "payment was declined".to_string()
    } else {
        trimmed.chars().take(200).collect()
    }
}
