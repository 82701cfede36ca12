//! Coordination store capability
//!
//! The handover protocol needs exactly four primitives from whatever backs
//! it: get, set-with-TTL, delete and an epoch-keyed compare-and-swap. Logical
//! conflicts are reported through `Ok(false)`; `Err` always means the store
//! could not be reached.

use crate::domain::InstanceId;
use crate::error::{ControlError, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Read a value; `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Unconditionally write a value that expires after `ttl`.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Write `new_value` (without expiry) iff the `epoch` field of the current
    /// JSON value equals `expected_epoch`. An absent key has epoch 0.
    async fn compare_and_swap(&self, key: &str, expected_epoch: u64, new_value: &str)
        -> Result<bool>;

    /// Remove a key; absent keys are not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Short backend name for logs.
    fn backend(&self) -> &'static str;
}

/// Key layout shared by both instances
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreKeys {
    prefix: String,
}

impl StoreKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn designation(&self) -> String {
        format!("{}:active", self.prefix)
    }

    pub fn heartbeat(&self, instance: &InstanceId) -> String {
        format!("{}:heartbeat:{}", self.prefix, instance)
    }

    /// Mailbox holding the latest signal addressed to `recipient`
    pub fn signal(&self, recipient: &InstanceId) -> String {
        format!("{}:signal:{}", self.prefix, recipient)
    }
}

impl Default for StoreKeys {
    fn default() -> Self {
        Self::new("hotstandby")
    }
}

/// Epoch carried by a stored JSON value, used by CAS implementations.
pub fn epoch_of(key: &str, raw: &str) -> Result<u64> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| ControlError::CorruptRecord {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
    Ok(value.get("epoch").and_then(|e| e.as_u64()).unwrap_or(0))
}

/// Read and decode a JSON record.
pub async fn load_json<T: DeserializeOwned>(
    store: &dyn CoordinationStore,
    key: &str,
) -> Result<Option<T>> {
    match store.get(key).await? {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| ControlError::CorruptRecord {
                key: key.to_string(),
                reason: e.to_string(),
            }),
        None => Ok(None),
    }
}

/// Encode and write a JSON record with expiry.
pub async fn save_json<T: Serialize + Sync>(
    store: &dyn CoordinationStore,
    key: &str,
    value: &T,
    ttl: Duration,
) -> Result<()> {
    let raw = serde_json::to_string(value)?;
    store.set_with_ttl(key, &raw, ttl).await
}
