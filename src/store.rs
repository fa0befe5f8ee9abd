//! Customer context hand-off between the dial-out path and the engine.
//!
//! The call-trigger path writes a customer snapshot keyed by the
//! provider's call id just before dialing; the engine reads it back when
//! the `start` envelope arrives. The store is eventually consistent, so
//! the resolve stage tolerates misses for a grace period, then falls
//! back to a phone-number lookup against the relational directory.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::language::Language;

/// Read-only customer snapshot placed in the store by the dial-out path.
/// The engine never mutates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerSnapshot {
    pub name: String,
    pub phone: String,
    pub state: String,
    pub loan_id: String,
    pub outstanding_amount: f64,
    pub due_date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_language: Option<Language>,
}

/// Key-value session store capability.
#[async_trait]
pub trait ContextStore: Send + Sync {
    async fn put(&self, call_id: &str, snapshot: &CustomerSnapshot, ttl: Duration) -> Result<()>;
    async fn get(&self, call_id: &str) -> Result<Option<CustomerSnapshot>>;
    async fn delete(&self, call_id: &str) -> Result<()>;
}

/// Relational fallback lookup by normalized phone number.
#[async_trait]
pub trait CustomerDirectory: Send + Sync {
    async fn find_by_phone(&self, phone: &str) -> Result<Option<CustomerSnapshot>>;
}

/// Process-local store for single-node deployments and tests.
#[derive(Default)]
pub struct MemoryContextStore {
    entries: std::sync::Mutex<HashMap<String, (CustomerSnapshot, Instant)>>,
}

impl MemoryContextStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContextStore for MemoryContextStore {
    async fn put(&self, call_id: &str, snapshot: &CustomerSnapshot, ttl: Duration) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| EngineError::Store("context store poisoned".to_owned()))?;
        entries.insert(call_id.to_owned(), (snapshot.clone(), Instant::now() + ttl));
        Ok(())
    }

    async fn get(&self, call_id: &str) -> Result<Option<CustomerSnapshot>> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| EngineError::Store("context store poisoned".to_owned()))?;
        match entries.get(call_id) {
            Some((_, expires)) if *expires <= Instant::now() => {
                entries.remove(call_id);
                Ok(None)
            }
            Some((snapshot, _)) => Ok(Some(snapshot.clone())),
            None => Ok(None),
        }
    }

    async fn delete(&self, call_id: &str) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| EngineError::Store("context store poisoned".to_owned()))?;
        entries.remove(call_id);
        Ok(())
    }
}

/// Client for the shared key-value session store service.
///
/// Snapshots live at `{base}/sessions/{call_id}` as opaque JSON with the
/// TTL passed as a query parameter on write.
pub struct HttpContextStore {
    client: reqwest::Client,
    base: String,
}

impl HttpContextStore {
    pub fn new(base: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::Store(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base: base.into(),
        })
    }

    fn url(&self, call_id: &str) -> String {
        format!("{}/sessions/{call_id}", self.base.trim_end_matches('/'))
    }
}

#[async_trait]
impl ContextStore for HttpContextStore {
    async fn put(&self, call_id: &str, snapshot: &CustomerSnapshot, ttl: Duration) -> Result<()> {
        let response = self
            .client
            .put(self.url(call_id))
            .query(&[("ttl_s", ttl.as_secs())])
            .json(snapshot)
            .send()
            .await
            .map_err(|e| EngineError::Store(format!("kv put: {e}")))?;
        if !response.status().is_success() {
            return Err(EngineError::Store(format!(
                "kv put returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn get(&self, call_id: &str) -> Result<Option<CustomerSnapshot>> {
        let response = self
            .client
            .get(self.url(call_id))
            .send()
            .await
            .map_err(|e| EngineError::Store(format!("kv get: {e}")))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(EngineError::Store(format!(
                "kv get returned {}",
                response.status()
            )));
        }
        let snapshot = response
            .json::<CustomerSnapshot>()
            .await
            .map_err(|e| EngineError::Store(format!("kv get body: {e}")))?;
        Ok(Some(snapshot))
    }

    async fn delete(&self, call_id: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.url(call_id))
            .send()
            .await
            .map_err(|e| EngineError::Store(format!("kv delete: {e}")))?;
        if !response.status().is_success() && response.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(EngineError::Store(format!(
                "kv delete returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Client for the relational customer directory.
pub struct HttpCustomerDirectory {
    client: reqwest::Client,
    base: String,
}

impl HttpCustomerDirectory {
    pub fn new(base: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::Store(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base: base.into(),
        })
    }
}

#[async_trait]
impl CustomerDirectory for HttpCustomerDirectory {
    async fn find_by_phone(&self, phone: &str) -> Result<Option<CustomerSnapshot>> {
        let url = format!("{}/customers/by_phone", self.base.trim_end_matches('/'));
        let response = self
            .client
            .get(url)
            .query(&[("phone", normalize_phone(phone))])
            .send()
            .await
            .map_err(|e| EngineError::Store(format!("directory lookup: {e}")))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(EngineError::Store(format!(
                "directory lookup returned {}",
                response.status()
            )));
        }
        let snapshot = response
            .json::<CustomerSnapshot>()
            .await
            .map_err(|e| EngineError::Store(format!("directory body: {e}")))?;
        Ok(Some(snapshot))
    }
}

/// Normalize a phone number for directory lookups: digits only, keeping
/// the last ten so `+91 99001-12233` and `09900112233` match.
#[must_use]
pub fn normalize_phone(raw: &str) -> String {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if digits.len() > 10 {
        digits[digits.len() - 10..].to_owned()
    } else {
        digits
    }
}

/// Parse a customer snapshot out of the `start` envelope's
/// custom parameters.
///
/// The dial-out path may attach a `customer` parameter holding a
/// pipe-separated `key=value` string as a fallback vehicle for when the
/// store has not caught up yet. Unknown keys are ignored; without name,
/// phone and loan id the fallback is unusable and `None` is returned.
#[must_use]
pub fn snapshot_from_custom_parameters(
    params: &HashMap<String, String>,
) -> Option<CustomerSnapshot> {
    let raw = params.get("customer")?;
    let mut fields: HashMap<&str, &str> = HashMap::new();
    for pair in raw.split('|') {
        if let Some((key, value)) = pair.split_once('=') {
            fields.insert(key.trim(), value.trim());
        }
    }
    let name = fields.get("name")?;
    let phone = fields.get("phone")?;
    let loan_id = fields.get("loan_id")?;
    if name.is_empty() || phone.is_empty() || loan_id.is_empty() {
        return None;
    }
    Some(CustomerSnapshot {
        name: (*name).to_owned(),
        phone: (*phone).to_owned(),
        state: fields.get("state").copied().unwrap_or("").to_owned(),
        loan_id: (*loan_id).to_owned(),
        outstanding_amount: fields
            .get("amount")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0),
        due_date: fields.get("due_date").copied().unwrap_or("").to_owned(),
        preferred_language: fields.get("lang").and_then(|v| Language::from_tag(v)),
    })
}
