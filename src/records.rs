//! Call record emission.
//!
//! The engine appends stage transitions and one final status row to an
//! external persistence service. It never reads them back; failures are
//! logged and swallowed so persistence hiccups can't take a live call
//! down.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::language::Language;

/// Terminal status of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    /// Flow ran to a natural end without transfer or decline.
    Completed,
    /// Bridged to a human agent.
    Transferred,
    /// Caller declined to continue.
    Declined,
    /// Transport or protocol failure ended the call.
    Failed,
    /// Hard duration cap reached.
    Timeout,
    /// No customer snapshot within the resolve grace period.
    MissingContext,
}

impl std::fmt::Display for CallOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Completed => "completed",
            Self::Transferred => "transferred",
            Self::Declined => "declined",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::MissingContext => "missing_context",
        };
        f.write_str(s)
    }
}

/// One append-only row sent to the persistence service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordUpdate {
    /// The call entered a new stage.
    Stage {
        call_id: String,
        stage: String,
        current_language: Language,
        at: DateTime<Utc>,
    },
    /// Final status with the conversation summary.
    Final {
        call_id: String,
        stage: String,
        initial_language: Language,
        current_language: Language,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        outcome: CallOutcome,
        summary: String,
    },
}

/// Append-only record sink capability.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn append(&self, update: RecordUpdate) -> Result<()>;
}

/// Sink used when no record endpoint is configured; drops rows silently.
#[derive(Debug, Default)]
pub struct NullRecordSink;

#[async_trait]
impl RecordSink for NullRecordSink {
    async fn append(&self, _update: RecordUpdate) -> Result<()> {
        Ok(())
    }
}

/// HTTP sink posting one JSON row per update.
pub struct HttpRecordSink {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpRecordSink {
    pub fn new(endpoint: impl Into<String>, timeout: std::time::Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::Store(format!("http client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl RecordSink for HttpRecordSink {
    async fn append(&self, update: RecordUpdate) -> Result<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&update)
            .send()
            .await
            .map_err(|e| EngineError::Store(format!("record append: {e}")))?;
        if !response.status().is_success() {
            return Err(EngineError::Store(format!(
                "record append returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}
