//! In-memory coordination store
//!
//! Shared between two `HandoverProtocol`s inside one process it behaves like
//! a single Redis instance, which is what the scenario tests rely on. Expiry
//! follows `tokio::time`, so paused-clock tests see TTLs elapse.

use super::store::{epoch_of, CoordinationStore};
use crate::error::{ControlError, Result};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map(|at| now < at).unwrap_or(true)
    }
}

/// DashMap-backed store with an availability switch for outage tests
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: DashMap<String, StoredValue>,
    unavailable: AtomicBool,
    calls: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every call fails with `StoreUnavailable`.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Number of calls made against the store, failed ones included.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Remaining lifetime of a key, if it has an expiry.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.entries
            .get(key)
            .and_then(|v| v.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    fn check(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            Err(ControlError::StoreUnavailable(
                "in-memory store switched off".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CoordinationStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check()?;
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(entry) => {
                if entry.get().is_live(now) {
                    Ok(Some(entry.get().value.clone()))
                } else {
                    entry.remove();
                    Ok(None)
                }
            }
            Entry::Vacant(_) => Ok(None),
        }
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.check()?;
        self.entries.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_epoch: u64,
        new_value: &str,
    ) -> Result<bool> {
        self.check()?;
        let now = Instant::now();
        let replacement = StoredValue {
            value: new_value.to_string(),
            expires_at: None,
        };

        // The entry guard holds the shard lock for the whole compare-and-set.
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let current = if entry.get().is_live(now) {
                    epoch_of(key, &entry.get().value)?
                } else {
                    0
                };
                if current != expected_epoch {
                    return Ok(false);
                }
                entry.insert(replacement);
                Ok(true)
            }
            Entry::Vacant(entry) => {
                if expected_epoch != 0 {
                    return Ok(false);
                }
                entry.insert(replacement);
                Ok(true)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check()?;
        self.entries.remove(key);
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let store = InMemoryStore::new();
        store
            .set_with_ttl("hb", "x", Duration::from_secs(3))
            .await
            .unwrap();
        assert_eq!(store.get("hb").await.unwrap().as_deref(), Some("x"));

        tokio::time::advance(Duration::from_millis(2_999)).await;
        assert!(store.get("hb").await.unwrap().is_some());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(store.get("hb").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cas_on_absent_key_requires_epoch_zero() {
        let store = InMemoryStore::new();
        let v1 = r#"{"active_instance":"a","epoch":1}"#;

        assert!(!store.compare_and_swap("d", 3, v1).await.unwrap());
        assert!(store.compare_and_swap("d", 0, v1).await.unwrap());
        assert_eq!(store.get("d").await.unwrap().as_deref(), Some(v1));
    }

    #[tokio::test]
    async fn test_cas_rejects_stale_epoch() {
        let store = InMemoryStore::new();
        let v1 = r#"{"active_instance":"a","epoch":1}"#;
        let v2 = r#"{"active_instance":"b","epoch":2}"#;
        let zombie = r#"{"active_instance":"a","epoch":2}"#;

        assert!(store.compare_and_swap("d", 0, v1).await.unwrap());
        assert!(store.compare_and_swap("d", 1, v2).await.unwrap());
        // A delayed writer still holding epoch 1 must not win.
        assert!(!store.compare_and_swap("d", 1, zombie).await.unwrap());
        assert_eq!(store.get("d").await.unwrap().as_deref(), Some(v2));
    }

    #[tokio::test]
    async fn test_cas_values_do_not_expire() {
        let store = InMemoryStore::new();
        store
            .compare_and_swap("d", 0, r#"{"epoch":1}"#)
            .await
            .unwrap();
        assert_eq!(store.ttl("d"), None);
    }

    #[tokio::test]
    async fn test_outage_switch() {
        let store = InMemoryStore::new();
        store.set_available(false);

        let err = store.get("k").await.unwrap_err();
        assert!(err.is_store_unavailable());
        assert!(store.delete("k").await.is_err());

        store.set_available(true);
        assert!(store.get("k").await.unwrap().is_none());
        assert_eq!(store.call_count(), 3);
    }
}
