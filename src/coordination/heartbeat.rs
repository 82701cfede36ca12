//! Heartbeat Publisher
//!
//! Periodically writes this instance's liveness record with the configured
//! TTL (three intervals). Failures are logged and retried on the next tick; they never
//! stop the loop.

use super::clock::Clock;
use crate::adapters::{save_json, CoordinationStore, StoreKeys};
use crate::domain::{HeartbeatRecord, InstanceId};
use crate::error::Result;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct HeartbeatPublisher {
    store: Arc<dyn CoordinationStore>,
    clock: Arc<dyn Clock>,
    instance_id: InstanceId,
    key: String,
    interval: Duration,
    ttl: Duration,
    last_success: RwLock<Option<DateTime<Utc>>>,
    consecutive_failures: AtomicU32,
    total_failures: AtomicU64,
}

impl HeartbeatPublisher {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        clock: Arc<dyn Clock>,
        keys: &StoreKeys,
        instance_id: InstanceId,
        interval: Duration,
        ttl: Duration,
    ) -> Self {
        Self {
            key: keys.heartbeat(&instance_id),
            store,
            clock,
            instance_id,
            interval,
            ttl,
            last_success: RwLock::new(None),
            consecutive_failures: AtomicU32::new(0),
            total_failures: AtomicU64::new(0),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Time of the last successful write
    pub async fn last_success(&self) -> Option<DateTime<Utc>> {
        *self.last_success.read().await
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    pub fn total_failures(&self) -> u64 {
        self.total_failures.load(Ordering::SeqCst)
    }

    /// Write the heartbeat record once.
    pub async fn publish_once(&self) -> Result<DateTime<Utc>> {
        let now = self.clock.now();
        let record = HeartbeatRecord::new(self.instance_id.clone(), now);
        save_json(self.store.as_ref(), &self.key, &record, self.ttl).await?;
        *self.last_success.write().await = Some(now);
        Ok(now)
    }

    /// One tick: publish and absorb any failure.
    pub async fn tick(&self) -> bool {
        match self.publish_once().await {
            Ok(at) => {
                let missed = self.consecutive_failures.swap(0, Ordering::SeqCst);
                if missed > 0 {
                    info!(
                        instance = %self.instance_id,
                        missed,
                        "Heartbeat recovered"
                    );
                }
                debug!(instance = %self.instance_id, at = %at, "Heartbeat published");
                true
            }
            Err(e) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                self.total_failures.fetch_add(1, Ordering::SeqCst);
                warn!(
                    instance = %self.instance_id,
                    failures,
                    error = %e,
                    "Heartbeat write failed, retrying next tick"
                );
                false
            }
        }
    }

    /// Run until cancelled, then remove the record so the peer sees us gone.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            instance = %self.instance_id,
            interval_ms = self.interval.as_millis() as u64,
            backend = self.store.backend(),
            "Heartbeat publisher started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }

        if let Err(e) = self.store.delete(&self.key).await {
            warn!(instance = %self.instance_id, error = %e, "Failed to clear heartbeat on stop");
        }
        info!(instance = %self.instance_id, "Heartbeat publisher stopped");
    }
}
