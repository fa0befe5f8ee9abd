//! Agent transfer via the provider's call-bridge API.
//!
//! One signed request asks the provider to bridge the live leg to the
//! configured agent number. The idempotency key is derived from the
//! call id, so retrying a transfer for the same call yields the same
//! outcome instead of a second bridge attempt.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use crate::config::TransferConfig;
use crate::error::{EngineError, Result};

/// Result of a bridge request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Provider accepted the bridge.
    Success {
        /// Provider's reference for the bridged leg, when it returns one.
        provider_ref: Option<String>,
    },
    /// Provider refused or the request timed out.
    Failure { reason: String },
}

impl TransferOutcome {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Call-bridge capability.
#[async_trait]
pub trait CallBridge: Send + Sync {
    async fn transfer(&self, call_id: &str, agent_number: &str) -> Result<TransferOutcome>;
}

#[derive(Debug, Deserialize)]
struct BridgeResponse {
    #[serde(default)]
    reference: Option<String>,
}

/// HTTP client for the provider's bridge endpoint.
pub struct HttpCallBridge {
    client: reqwest::Client,
    config: TransferConfig,
}

impl HttpCallBridge {
    pub fn new(config: TransferConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| EngineError::TransferFailure(format!("http client: {e}")))?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl CallBridge for HttpCallBridge {
    async fn transfer(&self, call_id: &str, agent_number: &str) -> Result<TransferOutcome> {
        let body = serde_json::json!({
            "call_id": call_id,
            "to": agent_number,
        });
        let mut request = self
            .client
            .post(&self.config.endpoint)
            .header("Idempotency-Key", format!("transfer-{call_id}"))
            .json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                // Timeouts and connection failures are a bounded,
                // reportable failure, not a call-fatal error.
                warn!(call_id, error = %e, "bridge request failed");
                return Ok(TransferOutcome::Failure {
                    reason: e.to_string(),
                });
            }
        };

        if !response.status().is_success() {
            return Ok(TransferOutcome::Failure {
                reason: format!("provider returned {}", response.status()),
            });
        }

        let provider_ref = response
            .json::<BridgeResponse>()
            .await
            .map(|r| r.reference)
            .unwrap_or_default();
        Ok(TransferOutcome::Success { provider_ref })
    }
}
