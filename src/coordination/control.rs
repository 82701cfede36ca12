//! Instance Control
//!
//! Public entry point used by the trading loop and the operator CLI. Wraps
//! the handover protocol, or a standalone stand-in when no coordination store
//! is configured or reachable. Standalone instances are always active. When
//! the store was configured but unreachable the instance is degraded: still
//! active, but control requests fail with `StoreUnavailable`.

use super::clock::{Clock, SystemClock};
use super::handover::HandoverProtocol;
use crate::adapters::{CoordinationStore, RedisStore};
use crate::config::{AppConfig, CoordinationConfig};
use crate::domain::{
    ControlState, InstanceId, InstancePair, InstanceStatus, ReleaseOutcome, TakeControlOutcome,
};
use crate::error::{ControlError, Result};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Upper bound on waiting for background tasks during shutdown
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct InstanceControl {
    mode: Mode,
}

enum Mode {
    Standalone(Standalone),
    Coordinated(Coordinated),
}

struct Standalone {
    instance_id: InstanceId,
    role_tx: watch::Sender<ControlState>,
    /// Connect error when the configured store could not be reached
    unreachable: Option<String>,
}

impl Standalone {
    fn ensure_reachable(&self) -> Result<()> {
        match &self.unreachable {
            Some(reason) => Err(ControlError::StoreUnavailable(reason.clone())),
            None => Ok(()),
        }
    }
}

struct Coordinated {
    protocol: Arc<HandoverProtocol>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    release_on_shutdown: bool,
}

impl InstanceControl {
    /// Build from configuration. An unreachable store yields a degraded
    /// standalone instance; only invalid configuration is an error.
    pub async fn connect(config: &AppConfig) -> Result<Self> {
        config.ensure_valid()?;
        let pair = config.instance_pair()?;

        if !config.coordination.enabled {
            info!(instance = %pair.local, "Coordination disabled, running standalone");
            return Ok(Self::standalone(pair.local));
        }

        let url = config.coordination.redis_url.as_deref().ok_or_else(|| {
            ControlError::Validation("coordination.redis_url is required".to_string())
        })?;

        match RedisStore::connect(url, config.coordination.store_op_timeout()).await {
            Ok(store) => Ok(Self::with_store(
                pair,
                config.coordination.clone(),
                Arc::new(store),
                Arc::new(SystemClock),
            )),
            Err(e) => {
                warn!(
                    instance = %pair.local,
                    error = %e,
                    "Coordination store unreachable, running degraded"
                );
                Ok(Self::degraded(pair.local, e.to_string()))
            }
        }
    }

    pub fn standalone(instance_id: InstanceId) -> Self {
        Self::standalone_with(instance_id, None)
    }

    /// Standalone instance whose configured store was unreachable.
    pub fn degraded(instance_id: InstanceId, reason: impl Into<String>) -> Self {
        Self::standalone_with(instance_id, Some(reason.into()))
    }

    fn standalone_with(instance_id: InstanceId, unreachable: Option<String>) -> Self {
        let (role_tx, _) = watch::channel(ControlState::Active);
        Self {
            mode: Mode::Standalone(Standalone {
                instance_id,
                role_tx,
                unreachable,
            }),
        }
    }

    pub fn with_store(
        pair: InstancePair,
        config: CoordinationConfig,
        store: Arc<dyn CoordinationStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let release_on_shutdown = config.release_on_shutdown;
        Self {
            mode: Mode::Coordinated(Coordinated {
                protocol: Arc::new(HandoverProtocol::new(pair, config, store, clock)),
                cancel: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
                release_on_shutdown,
            }),
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        match &self.mode {
            Mode::Standalone(s) => &s.instance_id,
            Mode::Coordinated(c) => c.protocol.instance_id(),
        }
    }

    pub fn is_standalone(&self) -> bool {
        matches!(self.mode, Mode::Standalone(_))
    }

    /// Coordination was configured but the store could not be reached.
    pub fn is_degraded(&self) -> bool {
        matches!(&self.mode, Mode::Standalone(s) if s.unreachable.is_some())
    }

    /// Publish the first heartbeat, resolve the initial role and spawn the
    /// heartbeat and supervision loops.
    ///
    /// A store error during role resolution is logged and the instance starts
    /// as standby; the supervisor reconciles once the store is back.
    pub async fn start(&self) -> Result<ControlState> {
        let c = match &self.mode {
            Mode::Standalone(s) => {
                if let Some(reason) = &s.unreachable {
                    warn!(instance = %s.instance_id, error = %reason, "Degraded instance, active without coordination");
                    return Ok(ControlState::Active);
                }
                info!(instance = %s.instance_id, "Standalone instance, active");
                return Ok(ControlState::Active);
            }
            Mode::Coordinated(c) => c,
        };

        if c.started.swap(true, Ordering::SeqCst) {
            warn!("Instance control already started");
            return Ok(c.protocol.state());
        }

        let heartbeat = c.protocol.heartbeat().clone();
        heartbeat.tick().await;

        let state = match c.protocol.resolve_initial_role().await {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "Could not resolve initial role, starting as standby");
                c.protocol.state()
            }
        };

        let mut tasks = c.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.push(tokio::spawn(heartbeat.run(c.cancel.child_token())));
        tasks.push(tokio::spawn(
            c.protocol.clone().run_supervisor(c.cancel.child_token()),
        ));

        info!(
            instance = %c.protocol.instance_id(),
            peer = %c.protocol.pair().peer,
            state = %state,
            epoch = c.protocol.epoch(),
            "Instance control started"
        );
        Ok(state)
    }

    /// Status snapshot. Never fails; see `InstanceStatus::stale`.
    pub async fn get_status(&self) -> InstanceStatus {
        match &self.mode {
            Mode::Standalone(s) if s.unreachable.is_some() => {
                InstanceStatus::degraded(s.instance_id.clone(), Utc::now())
            }
            Mode::Standalone(s) => InstanceStatus::standalone(s.instance_id.clone(), Utc::now()),
            Mode::Coordinated(c) => c.protocol.status().await,
        }
    }

    /// Hot-path role check from the local cache.
    pub fn is_active(&self) -> bool {
        match &self.mode {
            Mode::Standalone(_) => true,
            Mode::Coordinated(c) => c.protocol.is_active(),
        }
    }

    pub async fn is_other_instance_alive(&self) -> bool {
        match &self.mode {
            Mode::Standalone(_) => false,
            Mode::Coordinated(c) => c.protocol.is_other_instance_alive().await,
        }
    }

    pub async fn take_control(&self, force: bool) -> Result<TakeControlOutcome> {
        self.take_control_with_cancel(force, &CancellationToken::new())
            .await
    }

    /// Like `take_control`, but a graceful wait ends early (as pending) when
    /// `cancel` fires.
    pub async fn take_control_with_cancel(
        &self,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<TakeControlOutcome> {
        match &self.mode {
            Mode::Standalone(s) => {
                s.ensure_reachable()?;
                Ok(TakeControlOutcome::AlreadyActive { epoch: 0 })
            }
            Mode::Coordinated(c) => c.protocol.take_control(force, cancel).await,
        }
    }

    pub async fn release_control(&self) -> Result<ReleaseOutcome> {
        match &self.mode {
            Mode::Standalone(s) => {
                s.ensure_reachable()?;
                Err(ControlError::Standalone)
            }
            Mode::Coordinated(c) => c.protocol.release_control().await,
        }
    }

    /// Last observed fencing epoch (0 when standalone)
    pub fn epoch(&self) -> u64 {
        match &self.mode {
            Mode::Standalone(_) => 0,
            Mode::Coordinated(c) => c.protocol.epoch(),
        }
    }

    pub fn state(&self) -> ControlState {
        match &self.mode {
            Mode::Standalone(_) => ControlState::Active,
            Mode::Coordinated(c) => c.protocol.state(),
        }
    }

    /// Receiver that changes on every local role transition
    pub fn role_changes(&self) -> watch::Receiver<ControlState> {
        match &self.mode {
            Mode::Standalone(s) => s.role_tx.subscribe(),
            Mode::Coordinated(c) => c.protocol.subscribe(),
        }
    }

    /// Stop background tasks, handing the role to the peer first if
    /// configured and possible.
    pub async fn shutdown(&self) {
        let c = match &self.mode {
            Mode::Standalone(_) => return,
            Mode::Coordinated(c) => c,
        };

        if c.release_on_shutdown && c.protocol.is_active() {
            match c.protocol.release_control().await {
                Ok(outcome) => info!(outcome = %outcome.message(), "Released control on shutdown"),
                Err(e) => warn!(error = %e, "Could not release control on shutdown"),
            }
        }

        c.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = c
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();

        let join_all = async {
            for task in tasks {
                if let Err(e) = task.await {
                    error!(error = %e, "Background task panicked");
                }
            }
        };
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, join_all).await.is_err() {
            warn!(
                timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
                "Background tasks did not stop in time"
            );
        }
        info!(instance = %c.protocol.instance_id(), "Instance control stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryStore;
    use crate::coordination::clock::ManualClock;

    fn pair(local: &str, peer: &str, default: bool) -> InstancePair {
        InstancePair::new(
            InstanceId::new(local).unwrap(),
            InstanceId::new(peer).unwrap(),
            default,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_standalone_is_always_active() {
        let control = InstanceControl::standalone(InstanceId::new("solo").unwrap());

        assert!(control.is_standalone());
        assert!(control.is_active());
        assert!(!control.is_other_instance_alive().await);
        assert_eq!(control.start().await.unwrap(), ControlState::Active);

        let status = control.get_status().await;
        assert!(status.standalone);
        assert!(status.is_active);

        assert!(control.take_control(false).await.unwrap().accepted());
        assert!(matches!(
            control.release_control().await,
            Err(ControlError::Standalone)
        ));
        assert_eq!(*control.role_changes().borrow(), ControlState::Active);
    }

    #[tokio::test]
    async fn test_disabled_coordination_connects_standalone() {
        let config = AppConfig::default_config("prod", "backup", true);
        let control = InstanceControl::connect(&config).await.unwrap();
        assert!(control.is_standalone());
        assert_eq!(control.instance_id().as_str(), "prod");
    }

    #[tokio::test]
    async fn test_invalid_pair_is_rejected() {
        let config = AppConfig::default_config("prod", "prod", true);
        assert!(InstanceControl::connect(&config).await.is_err());
    }

    #[tokio::test]
    async fn test_unreachable_store_degrades_to_standalone() {
        let mut config = AppConfig::default_config("prod", "backup", true);
        config.coordination.enabled = true;
        config.coordination.redis_url = Some("redis://127.0.0.1:1/".to_string());
        config.coordination.store_op_timeout_ms = 100;

        let control = InstanceControl::connect(&config).await.unwrap();
        assert!(control.is_standalone());
        assert!(control.is_degraded());
        assert!(control.is_active());
        assert_eq!(control.start().await.unwrap(), ControlState::Active);

        let taken = control.take_control(false).await;
        assert!(matches!(&taken, Err(e) if e.is_store_unavailable()), "{taken:?}");
        let forced = control.take_control(true).await;
        assert!(matches!(&forced, Err(e) if e.is_store_unavailable()), "{forced:?}");
        let released = control.release_control().await;
        assert!(matches!(&released, Err(e) if e.is_store_unavailable()), "{released:?}");
        assert!(control.is_active());

        let status = control.get_status().await;
        assert!(status.is_active);
        assert!(status.stale);
        assert!(status.degraded);
    }

    #[tokio::test]
    async fn test_disabled_coordination_is_not_degraded() {
        let control = InstanceControl::standalone(InstanceId::new("solo").unwrap());
        assert!(!control.is_degraded());
        assert!(!control.get_status().await.stale);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_shutdown_clears_heartbeat() {
        let store = Arc::new(InMemoryStore::new());
        let config = CoordinationConfig {
            key_prefix: "t".to_string(),
            release_on_shutdown: true,
            redis_url: Some("redis://unused".to_string()),
            ..CoordinationConfig::default()
        };
        let control = InstanceControl::with_store(
            pair("prod", "backup", true),
            config,
            store.clone(),
            Arc::new(ManualClock::default()),
        );

        assert_eq!(control.start().await.unwrap(), ControlState::Active);
        assert!(control.is_active());
        assert_eq!(control.epoch(), 1);
        assert!(store.get("t:heartbeat:prod").await.unwrap().is_some());

        // No live peer, so release on shutdown is refused and the role is kept.
        control.shutdown().await;
        assert!(control.is_active());
        assert!(store.get("t:heartbeat:prod").await.unwrap().is_none());
    }
}
