//! Handover Protocol
//!
//! Claims, relinquishes and verifies the single active designation. The
//! designation record is only ever written through an epoch-keyed CAS, so a
//! delayed or zombie writer holding an old epoch can never overwrite a newer
//! claim. The local mutexes only serialize this process's view of the role;
//! they provide no cross-process safety.
//!
//! Graceful takeover handshake (B takes over from A):
//! 1. B writes DEACTIVATE into A's mailbox and enters ACTIVATING.
//! 2. A's supervision tick sees it, stops trading, CAS-transfers the
//!    designation to B and answers READY.
//! 3. B's poll sees the designation naming B (or READY, then CASes itself).

use super::clock::Clock;
use super::heartbeat::HeartbeatPublisher;
use crate::adapters::{load_json, save_json, CoordinationStore, StoreKeys};
use crate::config::{CoordinationConfig, ReleaseTarget};
use crate::domain::{
    ActiveDesignation, ControlSignal, ControlState, HeartbeatRecord, InstanceId, InstancePair,
    InstanceStatus, ReleaseOutcome, SignalKind, TakeControlOutcome, TakeoverMode,
};
use crate::error::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Local view of the role, tagged with the epoch it was derived from
#[derive(Debug, Clone, Copy)]
struct RoleView {
    state: ControlState,
    epoch: u64,
}

/// State owned by whoever holds the operation lock
#[derive(Debug, Default)]
struct OpState {
    handled_signal: Option<Uuid>,
}

pub struct HandoverProtocol {
    pair: InstancePair,
    config: CoordinationConfig,
    store: Arc<dyn CoordinationStore>,
    clock: Arc<dyn Clock>,
    keys: StoreKeys,
    heartbeat: Arc<HeartbeatPublisher>,
    view: Mutex<RoleView>,
    is_active: AtomicBool,
    role_tx: watch::Sender<ControlState>,
    op_lock: tokio::sync::Mutex<OpState>,
    cached_status: RwLock<Option<InstanceStatus>>,
}

/// Reverts the local state if a transition is abandoned (error or drop).
struct TransitionGuard<'a> {
    protocol: &'a HandoverProtocol,
    revert_to: ControlState,
    armed: bool,
}

impl TransitionGuard<'_> {
    fn settle(mut self, state: ControlState, epoch: u64) {
        self.armed = false;
        self.protocol.settle(state, epoch);
    }
}

impl Drop for TransitionGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.protocol.force_state(self.revert_to);
        }
    }
}

impl HandoverProtocol {
    pub fn new(
        pair: InstancePair,
        config: CoordinationConfig,
        store: Arc<dyn CoordinationStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let keys = StoreKeys::new(config.key_prefix.clone());
        let heartbeat = Arc::new(HeartbeatPublisher::new(
            store.clone(),
            clock.clone(),
            &keys,
            pair.local.clone(),
            config.heartbeat_interval(),
            config.heartbeat_ttl(),
        ));
        let (role_tx, _) = watch::channel(ControlState::Standby);

        Self {
            pair,
            config,
            store,
            clock,
            keys,
            heartbeat,
            view: Mutex::new(RoleView {
                state: ControlState::Standby,
                epoch: 0,
            }),
            is_active: AtomicBool::new(false),
            role_tx,
            op_lock: tokio::sync::Mutex::new(OpState::default()),
            cached_status: RwLock::new(None),
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.pair.local
    }

    pub fn pair(&self) -> &InstancePair {
        &self.pair
    }

    pub fn heartbeat(&self) -> &Arc<HeartbeatPublisher> {
        &self.heartbeat
    }

    /// Cached role flag; no store access.
    pub fn is_active(&self) -> bool {
        self.is_active.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ControlState {
        self.lock_view().state
    }

    /// Last observed fencing epoch
    pub fn epoch(&self) -> u64 {
        self.lock_view().epoch
    }

    pub fn subscribe(&self) -> watch::Receiver<ControlState> {
        self.role_tx.subscribe()
    }

    // ==================== Local role view ====================

    fn lock_view(&self) -> std::sync::MutexGuard<'_, RoleView> {
        self.view.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn apply_state(&self, view: &mut RoleView, next: ControlState) {
        if view.state == next {
            return;
        }
        if !view.state.can_transition_to(next) {
            debug!(from = %view.state, to = %next, "Role jumped over intermediate state");
        }
        info!(
            instance = %self.pair.local,
            from = %view.state,
            to = %next,
            epoch = view.epoch,
            "Role transition"
        );
        view.state = next;
        self.is_active.store(next.is_active(), Ordering::SeqCst);
        self.role_tx.send_replace(next);
    }

    fn force_state(&self, next: ControlState) {
        let mut view = self.lock_view();
        self.apply_state(&mut view, next);
    }

    fn settle(&self, next: ControlState, epoch: u64) {
        let mut view = self.lock_view();
        view.epoch = view.epoch.max(epoch);
        self.apply_state(&mut view, next);
    }

    fn begin(&self, transition: ControlState) -> TransitionGuard<'_> {
        let mut view = self.lock_view();
        let revert_to = view.state;
        self.apply_state(&mut view, transition);
        TransitionGuard {
            protocol: self,
            revert_to,
            armed: true,
        }
    }

    /// Holder and epoch named by a designation; a cold store names the default instance.
    fn holder_of(&self, designation: Option<&ActiveDesignation>) -> (InstanceId, u64) {
        match designation {
            Some(d) => (d.active_instance.clone(), d.epoch),
            None => (self.pair.default_instance().clone(), 0),
        }
    }

    /// Reconcile the local role with a designation read from the store.
    ///
    /// Reads older than the last applied epoch are ignored, and in-flight
    /// transitions are left alone; they settle themselves.
    fn observe(&self, designation: Option<&ActiveDesignation>) -> ControlState {
        let (holder, epoch) = self.holder_of(designation);
        let mut view = self.lock_view();
        if epoch < view.epoch || view.state.in_transition() {
            return view.state;
        }
        view.epoch = epoch;
        let next = if self.pair.is_local(&holder) {
            ControlState::Active
        } else {
            ControlState::Standby
        };
        self.apply_state(&mut view, next);
        next
    }

    // ==================== Store access ====================

    async fn read_designation(&self) -> Result<Option<ActiveDesignation>> {
        load_json(self.store.as_ref(), &self.keys.designation()).await
    }

    async fn read_heartbeat(&self, id: &InstanceId) -> Result<Option<HeartbeatRecord>> {
        load_json(self.store.as_ref(), &self.keys.heartbeat(id)).await
    }

    async fn read_mailbox(&self) -> Result<Option<ControlSignal>> {
        load_json(self.store.as_ref(), &self.keys.signal(&self.pair.local)).await
    }

    async fn send_signal(&self, signal: &ControlSignal) -> Result<()> {
        save_json(
            self.store.as_ref(),
            &self.keys.signal(&signal.to),
            signal,
            self.config.signal_ttl(),
        )
        .await?;
        debug!(kind = %signal.kind, to = %signal.to, id = %signal.id, "Signal sent");
        Ok(())
    }

    /// CAS the designation to `to`, fenced on the epoch of `current`.
    async fn try_claim(
        &self,
        current: Option<&ActiveDesignation>,
        to: &InstanceId,
    ) -> Result<Option<ActiveDesignation>> {
        let next = ActiveDesignation::successor(current, to.clone());
        let expected = current.map(|d| d.epoch).unwrap_or(0);
        let raw = serde_json::to_string(&next)?;
        let swapped = self
            .store
            .compare_and_swap(&self.keys.designation(), expected, &raw)
            .await?;
        Ok(swapped.then_some(next))
    }

    async fn peer_alive(&self) -> Result<bool> {
        let record = self.read_heartbeat(&self.pair.peer).await?;
        Ok(record
            .map(|hb| hb.is_alive_at(self.clock.now(), self.config.alive_timeout()))
            .unwrap_or(false))
    }

    // ==================== Status ====================

    async fn build_status(
        &self,
        designation: Option<&ActiveDesignation>,
        other_alive: bool,
    ) -> InstanceStatus {
        let state = self.observe(designation);
        let (holder, _) = self.holder_of(designation);
        InstanceStatus {
            instance_id: self.pair.local.clone(),
            is_active: state.is_active(),
            active_instance: Some(holder),
            other_alive,
            active_by_default: self.pair.active_by_default,
            can_take_control: !state.is_active(),
            state,
            epoch: self.epoch(),
            last_heartbeat: self.heartbeat.last_success().await,
            observed_at: self.clock.now(),
            stale: false,
            standalone: false,
            degraded: false,
        }
    }

    async fn compute_status(&self) -> Result<InstanceStatus> {
        let designation = self.read_designation().await?;
        let other_alive = self.peer_alive().await?;
        let status = self.build_status(designation.as_ref(), other_alive).await;
        *self.cached_status.write().await = Some(status.clone());
        Ok(status)
    }

    /// Read-only status; falls back to the cached one (marked stale) on store errors.
    pub async fn status(&self) -> InstanceStatus {
        match self.compute_status().await {
            Ok(status) => status,
            Err(e) => {
                warn!(instance = %self.pair.local, error = %e, "Status read failed, serving cached status");
                match self.cached_status.read().await.clone() {
                    Some(cached) => cached.mark_stale(),
                    None => self.local_status().await.mark_stale(),
                }
            }
        }
    }

    /// Status from local knowledge only, used before any successful read.
    async fn local_status(&self) -> InstanceStatus {
        let view = *self.lock_view();
        InstanceStatus {
            instance_id: self.pair.local.clone(),
            is_active: view.state.is_active(),
            active_instance: view
                .state
                .is_active()
                .then(|| self.pair.local.clone()),
            other_alive: false,
            active_by_default: self.pair.active_by_default,
            can_take_control: !view.state.is_active(),
            state: view.state,
            epoch: view.epoch,
            last_heartbeat: self.heartbeat.last_success().await,
            observed_at: self.clock.now(),
            stale: false,
            standalone: false,
            degraded: false,
        }
    }

    /// Liveness of the peer by heartbeat age; `false` if the store can't be read.
    pub async fn is_other_instance_alive(&self) -> bool {
        match self.peer_alive().await {
            Ok(alive) => alive,
            Err(e) => {
                warn!(peer = %self.pair.peer, error = %e, "Error checking peer heartbeat");
                false
            }
        }
    }

    // ==================== Startup ====================

    /// Resolve the role on process start.
    ///
    /// Only the active-by-default instance claims without a handshake, either
    /// on a cold store or when the recorded holder is dead.
    pub async fn resolve_initial_role(&self) -> Result<ControlState> {
        let _op = self.op_lock.lock().await;
        let current = self.read_designation().await?;

        match &current {
            None if self.pair.active_by_default => {
                info!(instance = %self.pair.local, "No designation yet, claiming as default instance");
                self.claim(None, TakeoverMode::ColdStart).await?;
            }
            None => {
                self.observe(None);
                info!(
                    instance = %self.pair.local,
                    default = %self.pair.default_instance(),
                    "No designation yet, waiting for the default instance"
                );
            }
            Some(d) if d.names(&self.pair.local) => {
                self.observe(current.as_ref());
                info!(instance = %self.pair.local, epoch = d.epoch, "Resuming as active instance");
            }
            Some(d) => {
                let peer_alive = self.peer_alive().await?;
                if !peer_alive && self.pair.active_by_default {
                    warn!(
                        holder = %d.active_instance,
                        epoch = d.epoch,
                        "Recorded active instance appears dead, taking over"
                    );
                    self.claim(current.as_ref(), TakeoverMode::PeerDead).await?;
                } else {
                    self.observe(current.as_ref());
                    info!(holder = %d.active_instance, peer_alive, "Starting as standby");
                }
            }
        }

        Ok(self.state())
    }

    // ==================== Take control ====================

    /// Become the active instance. See the module docs for the handshake.
    pub async fn take_control(
        &self,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<TakeControlOutcome> {
        let _op = self.op_lock.lock().await;

        let current = self.read_designation().await?;
        self.observe(current.as_ref());
        let (holder, epoch) = self.holder_of(current.as_ref());

        // On a cold store the default instance is already the holder.
        if self.pair.is_local(&holder) {
            info!(instance = %self.pair.local, epoch, "Already active, nothing to do");
            return Ok(TakeControlOutcome::AlreadyActive { epoch });
        }

        let peer_alive = self.peer_alive().await?;
        if peer_alive && !force {
            return self.graceful_takeover(current, cancel).await;
        }

        let mode = if peer_alive {
            TakeoverMode::Forced
        } else {
            TakeoverMode::PeerDead
        };
        info!(
            instance = %self.pair.local,
            holder = %holder,
            mode = %mode,
            "Taking control without handshake"
        );
        self.claim(current.as_ref(), mode).await
    }

    /// Single CAS attempt; a lost race is reported, never retried.
    async fn claim(
        &self,
        current: Option<&ActiveDesignation>,
        mode: TakeoverMode,
    ) -> Result<TakeControlOutcome> {
        if let Some(claimed) = self.try_claim(current, &self.pair.local).await? {
            self.settle(ControlState::Active, claimed.epoch);
            info!(instance = %self.pair.local, epoch = claimed.epoch, mode = %mode, "Now ACTIVE");
            return Ok(TakeControlOutcome::Acquired {
                epoch: claimed.epoch,
                mode,
            });
        }

        let latest = self.read_designation().await?;
        self.observe(latest.as_ref());
        let (holder, epoch) = self.holder_of(latest.as_ref());
        if self.pair.is_local(&holder) {
            return Ok(TakeControlOutcome::AlreadyActive { epoch });
        }
        warn!(
            instance = %self.pair.local,
            holder = %holder,
            epoch,
            "Lost the race for the designation"
        );
        Ok(TakeControlOutcome::Conflict { holder, epoch })
    }

    async fn graceful_takeover(
        &self,
        current: Option<ActiveDesignation>,
        cancel: &CancellationToken,
    ) -> Result<TakeControlOutcome> {
        let guard = self.begin(ControlState::Activating);

        let request = ControlSignal::deactivate(
            self.pair.local.clone(),
            self.pair.peer.clone(),
            self.clock.now(),
        );
        self.send_signal(&request).await?;

        let started = Instant::now();
        let deadline = started + self.config.handover_timeout();
        let signal_expires = started + self.config.signal_ttl();
        info!(
            peer = %self.pair.peer,
            epoch = current.as_ref().map(|d| d.epoch).unwrap_or(0),
            timeout_ms = self.config.handover_timeout().as_millis() as u64,
            "Sent DEACTIVATE, waiting for READY"
        );

        loop {
            let nap = self
                .config
                .handover_poll_interval()
                .min(deadline.saturating_duration_since(Instant::now()));
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(peer = %self.pair.peer, "Takeover wait cancelled by caller");
                    return Ok(pending(signal_expires));
                }
                _ = tokio::time::sleep(nap) => {}
            }

            let latest = self.read_designation().await?;
            if let Some(d) = latest.as_ref().filter(|d| d.names(&self.pair.local)) {
                let epoch = d.epoch;
                guard.settle(ControlState::Active, epoch);
                info!(instance = %self.pair.local, epoch, "Peer handed over, now ACTIVE");
                return Ok(TakeControlOutcome::Acquired {
                    epoch,
                    mode: TakeoverMode::Graceful,
                });
            }

            let ready = self
                .read_mailbox()
                .await?
                .filter(|s| s.from == self.pair.peer && s.answers(request.id));
            if ready.is_some() {
                debug!(peer = %self.pair.peer, "Received READY");
                if let Some(claimed) = self.try_claim(latest.as_ref(), &self.pair.local).await? {
                    guard.settle(ControlState::Active, claimed.epoch);
                    info!(instance = %self.pair.local, epoch = claimed.epoch, "Claimed after READY, now ACTIVE");
                    return Ok(TakeControlOutcome::Acquired {
                        epoch: claimed.epoch,
                        mode: TakeoverMode::Graceful,
                    });
                }
            }

            if Instant::now() >= deadline {
                break;
            }
        }

        warn!(
            peer = %self.pair.peer,
            "Timeout waiting for READY, handover still pending"
        );
        drop(guard);
        Ok(pending(signal_expires))
    }

    // ==================== Release control ====================

    /// Voluntarily hand the role away. Refused when the peer is not alive, or
    /// when releases target the active-by-default instance and that is us.
    pub async fn release_control(&self) -> Result<ReleaseOutcome> {
        let _op = self.op_lock.lock().await;

        let current = self.read_designation().await?;
        let state = self.observe(current.as_ref());
        if !state.is_active() {
            info!(instance = %self.pair.local, "Not active, nothing to release");
            return Ok(ReleaseOutcome::NothingToRelease);
        }

        let Some(target) = self.release_target() else {
            info!(
                instance = %self.pair.local,
                "Active-by-default instance keeps control on release"
            );
            return Ok(ReleaseOutcome::KeptAsDefault);
        };

        if !self.peer_alive().await? {
            warn!(
                instance = %self.pair.local,
                peer = %self.pair.peer,
                "Peer is not alive, refusing to release control"
            );
            return Ok(ReleaseOutcome::PeerUnreachable);
        }

        info!(instance = %self.pair.local, to = %target, "Voluntarily releasing control");
        self.hand_over(current.as_ref(), &target, None).await
    }

    /// Instance a voluntary release hands over to; `None` keeps the role.
    fn release_target(&self) -> Option<InstanceId> {
        match self.config.release_target {
            ReleaseTarget::Peer => Some(self.pair.peer.clone()),
            ReleaseTarget::ActiveByDefault => {
                let default = self.pair.default_instance();
                (!self.pair.is_local(default)).then(|| default.clone())
            }
        }
    }

    /// Stop trading, CAS the designation to `to`, then tell `to` we're READY.
    async fn hand_over(
        &self,
        current: Option<&ActiveDesignation>,
        to: &InstanceId,
        in_reply_to: Option<Uuid>,
    ) -> Result<ReleaseOutcome> {
        let guard = self.begin(ControlState::Deactivating);

        match self.try_claim(current, to).await? {
            Some(transferred) => {
                guard.settle(ControlState::Standby, transferred.epoch);
                info!(
                    instance = %self.pair.local,
                    to = %to,
                    epoch = transferred.epoch,
                    "Designation transferred, now STANDBY"
                );

                let ready = ControlSignal::ready(
                    self.pair.local.clone(),
                    to.clone(),
                    self.clock.now(),
                    in_reply_to,
                );
                if let Err(e) = self.send_signal(&ready).await {
                    warn!(to = %to, error = %e, "READY not delivered, designation already transferred");
                }

                Ok(ReleaseOutcome::Released {
                    to: to.clone(),
                    epoch: transferred.epoch,
                })
            }
            None => {
                drop(guard);
                let latest = self.read_designation().await?;
                self.observe(latest.as_ref());
                let (holder, epoch) = self.holder_of(latest.as_ref());
                warn!(holder = %holder, epoch, "Designation changed during release");
                Ok(ReleaseOutcome::Conflict { holder, epoch })
            }
        }
    }

    // ==================== Supervision ====================

    /// Answer a DEACTIVATE from the peer. Returns once the reply is sent.
    async fn answer_deactivate(&self, signal: &ControlSignal) -> Result<()> {
        info!(from = %signal.from, "Received DEACTIVATE");

        let current = self.read_designation().await?;
        let state = self.observe(current.as_ref());
        if state.is_active() {
            info!(from = %signal.from, "Deactivating per request");
            if let ReleaseOutcome::Released { .. } = self
                .hand_over(current.as_ref(), &signal.from, Some(signal.id))
                .await?
            {
                return Ok(());
            }
        } else {
            debug!("Received DEACTIVATE but already standby");
        }

        let ready = ControlSignal::ready(
            self.pair.local.clone(),
            signal.from.clone(),
            self.clock.now(),
            Some(signal.id),
        );
        self.send_signal(&ready).await
    }

    /// Act on a mailbox signal; `false` means retry it next tick.
    async fn handle_signal(&self, signal: &ControlSignal) -> bool {
        if signal.from != self.pair.peer || signal.to != self.pair.local {
            debug!(from = %signal.from, to = %signal.to, "Ignoring signal from unknown instance");
            return true;
        }

        match signal.kind {
            SignalKind::Deactivate => match self.answer_deactivate(signal).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(from = %signal.from, error = %e, "Failed to answer DEACTIVATE, will retry");
                    false
                }
            },
            SignalKind::Ready => {
                debug!(from = %signal.from, "READY received but no takeover is waiting");
                true
            }
        }
    }

    /// One supervision tick: answer signals, reconcile the role, refresh the
    /// status cache and, if enabled, fail over from a dead peer.
    pub async fn supervise_once(&self) {
        let Ok(mut op) = self.op_lock.try_lock() else {
            debug!("Operation in flight, skipping supervision tick");
            return;
        };

        match self.read_mailbox().await {
            Ok(Some(signal)) if op.handled_signal != Some(signal.id) => {
                if self.handle_signal(&signal).await {
                    op.handled_signal = Some(signal.id);
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to read signal mailbox"),
        }

        let designation = match self.read_designation().await {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "Failed to read designation");
                return;
            }
        };
        let other_alive = match self.peer_alive().await {
            Ok(alive) => alive,
            Err(e) => {
                warn!(error = %e, "Failed to read peer heartbeat");
                return;
            }
        };
        let status = self.build_status(designation.as_ref(), other_alive).await;
        *self.cached_status.write().await = Some(status.clone());

        if self.config.auto_failover && !status.is_active && !other_alive {
            if let Some(d) = designation.as_ref().filter(|d| d.names(&self.pair.peer)) {
                warn!(
                    holder = %d.active_instance,
                    epoch = d.epoch,
                    "Active peer is dead, failing over"
                );
                if let Err(e) = self.claim(Some(d), TakeoverMode::PeerDead).await {
                    warn!(error = %e, "Automatic failover failed");
                }
            }
        }
    }

    /// Run supervision ticks until cancelled.
    pub async fn run_supervisor(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.signal_poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            instance = %self.pair.local,
            interval_ms = self.config.signal_poll_interval().as_millis() as u64,
            auto_failover = self.config.auto_failover,
            "Supervisor started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.supervise_once().await,
            }
        }
        info!(instance = %self.pair.local, "Supervisor stopped");
    }
}

fn pending(signal_expires: Instant) -> TakeControlOutcome {
    let remaining = signal_expires.saturating_duration_since(Instant::now());
    TakeControlOutcome::Pending {
        wait_seconds: ceil_secs(remaining).max(1),
    }
}

fn ceil_secs(d: Duration) -> u64 {
    let secs = d.as_secs();
    if d.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryStore;
    use crate::coordination::clock::ManualClock;

    struct Fixture {
        store: Arc<InMemoryStore>,
        clock: Arc<ManualClock>,
        keys: StoreKeys,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: Arc::new(InMemoryStore::new()),
                clock: Arc::new(ManualClock::default()),
                keys: StoreKeys::new("t"),
            }
        }

        fn config(&self) -> CoordinationConfig {
            CoordinationConfig {
                key_prefix: "t".to_string(),
                heartbeat_interval_ms: 1_000,
                alive_timeout_ms: 2_000,
                handover_timeout_ms: 1_000,
                handover_poll_interval_ms: 50,
                signal_poll_interval_ms: 100,
                redis_url: Some("redis://unused".to_string()),
                ..CoordinationConfig::default()
            }
        }

        fn protocol(&self, local: &str, peer: &str, default: bool) -> HandoverProtocol {
            let pair = InstancePair::new(
                InstanceId::new(local).unwrap(),
                InstanceId::new(peer).unwrap(),
                default,
            )
            .unwrap();
            HandoverProtocol::new(pair, self.config(), self.store.clone(), self.clock.clone())
        }

        async fn designation(&self) -> Option<ActiveDesignation> {
            load_json(self.store.as_ref(), &self.keys.designation())
                .await
                .unwrap()
        }

        async fn seed(&self, holder: &str, epoch: u64) {
            let d = ActiveDesignation {
                active_instance: InstanceId::new(holder).unwrap(),
                epoch,
            };
            let expected = self.designation().await.map(|d| d.epoch).unwrap_or(0);
            assert!(self
                .store
                .compare_and_swap(&self.keys.designation(), expected, &serde_json::to_string(&d).unwrap())
                .await
                .unwrap());
        }
    }

    #[tokio::test]
    async fn test_heartbeat_ttl_follows_configuration() {
        let fx = Fixture::new();
        let mut config = fx.config();
        config.heartbeat_interval_ms = 400;
        let pair = InstancePair::new(
            InstanceId::new("a").unwrap(),
            InstanceId::new("b").unwrap(),
            true,
        )
        .unwrap();
        let a = HandoverProtocol::new(pair, config.clone(), fx.store.clone(), fx.clock.clone());

        assert_eq!(a.heartbeat().ttl(), config.heartbeat_ttl());
        assert_eq!(a.heartbeat().ttl(), Duration::from_millis(1_200));

        a.heartbeat().tick().await;
        let ttl = fx.store.ttl("t:heartbeat:a").unwrap();
        assert!(ttl <= Duration::from_millis(1_200));
    }

    #[test]
    fn test_ceil_secs() {
        assert_eq!(ceil_secs(Duration::from_millis(1_001)), 2);
        assert_eq!(ceil_secs(Duration::from_secs(2)), 2);
        assert_eq!(ceil_secs(Duration::ZERO), 0);
    }

    #[tokio::test]
    async fn test_observe_ignores_older_epochs() {
        let fx = Fixture::new();
        let a = fx.protocol("a", "b", true);

        let newer = ActiveDesignation {
            active_instance: InstanceId::new("b").unwrap(),
            epoch: 5,
        };
        let older = ActiveDesignation {
            active_instance: InstanceId::new("a").unwrap(),
            epoch: 4,
        };

        assert_eq!(a.observe(Some(&newer)), ControlState::Standby);
        assert_eq!(a.observe(Some(&older)), ControlState::Standby);
        assert!(!a.is_active());
        assert_eq!(a.epoch(), 5);
    }

    #[tokio::test]
    async fn test_observe_leaves_transitions_alone() {
        let fx = Fixture::new();
        let a = fx.protocol("a", "b", true);
        let mine = ActiveDesignation {
            active_instance: InstanceId::new("a").unwrap(),
            epoch: 1,
        };

        let guard = a.begin(ControlState::Deactivating);
        assert_eq!(a.observe(Some(&mine)), ControlState::Deactivating);
        assert!(!a.is_active());
        drop(guard);
        assert_eq!(a.state(), ControlState::Standby);
    }

    #[tokio::test]
    async fn test_cold_start_default_claims_epoch_one() {
        let fx = Fixture::new();
        let a = fx.protocol("a", "b", true);

        assert_eq!(a.resolve_initial_role().await.unwrap(), ControlState::Active);
        let d = fx.designation().await.unwrap();
        assert_eq!(d.epoch, 1);
        assert_eq!(d.active_instance.as_str(), "a");
    }

    #[tokio::test]
    async fn test_cold_start_non_default_stays_standby_without_writing() {
        let fx = Fixture::new();
        let b = fx.protocol("b", "a", false);

        assert_eq!(b.resolve_initial_role().await.unwrap(), ControlState::Standby);
        assert!(fx.designation().await.is_none());
    }

    #[tokio::test]
    async fn test_default_instance_takes_over_from_dead_holder_on_start() {
        let fx = Fixture::new();
        fx.seed("b", 3).await;
        let a = fx.protocol("a", "b", true);

        assert_eq!(a.resolve_initial_role().await.unwrap(), ControlState::Active);
        assert_eq!(fx.designation().await.unwrap().epoch, 4);
    }

    #[tokio::test]
    async fn test_non_default_does_not_take_over_on_start() {
        let fx = Fixture::new();
        fx.seed("a", 3).await;
        let b = fx.protocol("b", "a", false);

        assert_eq!(b.resolve_initial_role().await.unwrap(), ControlState::Standby);
        assert_eq!(fx.designation().await.unwrap().epoch, 3);
    }

    #[tokio::test]
    async fn test_take_control_when_peer_dead_claims_immediately() {
        let fx = Fixture::new();
        fx.seed("a", 1).await;
        let b = fx.protocol("b", "a", false);

        let outcome = b
            .take_control(false, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            TakeControlOutcome::Acquired {
                epoch: 2,
                mode: TakeoverMode::PeerDead
            }
        );
        assert!(b.is_active());
    }

    #[tokio::test]
    async fn test_release_refused_without_live_peer() {
        let fx = Fixture::new();
        let a = fx.protocol("a", "b", true);
        a.resolve_initial_role().await.unwrap();

        assert_eq!(
            a.release_control().await.unwrap(),
            ReleaseOutcome::PeerUnreachable
        );
        assert!(a.is_active());
        assert_eq!(fx.designation().await.unwrap().epoch, 1);
    }

    #[tokio::test]
    async fn test_release_target_setting_decides_default_instance_release() {
        async fn release_from_default(target: ReleaseTarget) -> (ReleaseOutcome, bool, u64) {
            let fx = Fixture::new();
            let mut config = fx.config();
            config.release_target = target;
            let pair = InstancePair::new(
                InstanceId::new("a").unwrap(),
                InstanceId::new("b").unwrap(),
                true,
            )
            .unwrap();
            let a = HandoverProtocol::new(pair, config, fx.store.clone(), fx.clock.clone());
            let b = fx.protocol("b", "a", false);
            fx.seed("a", 1).await;
            a.resolve_initial_role().await.unwrap();
            b.heartbeat().tick().await;

            let outcome = a.release_control().await.unwrap();
            let epoch = fx.designation().await.unwrap().epoch;
            (outcome, a.is_active(), epoch)
        }

        let (outcome, active, epoch) = release_from_default(ReleaseTarget::Peer).await;
        assert_eq!(
            outcome,
            ReleaseOutcome::Released {
                to: InstanceId::new("b").unwrap(),
                epoch: 2
            }
        );
        assert!(!active);
        assert_eq!(epoch, 2);

        let (outcome, active, epoch) = release_from_default(ReleaseTarget::ActiveByDefault).await;
        assert_eq!(outcome, ReleaseOutcome::KeptAsDefault);
        assert!(active);
        assert_eq!(epoch, 1);
    }

    #[tokio::test]
    async fn test_release_targets_default_instance_from_non_default() {
        let fx = Fixture::new();
        let mut config = fx.config();
        config.release_target = ReleaseTarget::ActiveByDefault;
        let pair = InstancePair::new(
            InstanceId::new("b").unwrap(),
            InstanceId::new("a").unwrap(),
            false,
        )
        .unwrap();
        let b = HandoverProtocol::new(pair, config, fx.store.clone(), fx.clock.clone());

        assert_eq!(b.release_target().unwrap().as_str(), "a");
    }

    #[tokio::test]
    async fn test_answer_deactivate_transfers_to_requester() {
        let fx = Fixture::new();
        let a = fx.protocol("a", "b", true);
        a.resolve_initial_role().await.unwrap();

        let request = ControlSignal::deactivate(
            InstanceId::new("b").unwrap(),
            InstanceId::new("a").unwrap(),
            fx.clock.now(),
        );
        assert!(a.handle_signal(&request).await);

        assert!(!a.is_active());
        let d = fx.designation().await.unwrap();
        assert_eq!(d.active_instance.as_str(), "b");
        assert_eq!(d.epoch, 2);

        let reply: ControlSignal = load_json(fx.store.as_ref(), "t:signal:b")
            .await
            .unwrap()
            .unwrap();
        assert!(reply.answers(request.id));
    }

    #[tokio::test]
    async fn test_signals_from_strangers_are_ignored() {
        let fx = Fixture::new();
        let a = fx.protocol("a", "b", true);
        a.resolve_initial_role().await.unwrap();

        let request = ControlSignal::deactivate(
            InstanceId::new("intruder").unwrap(),
            InstanceId::new("a").unwrap(),
            fx.clock.now(),
        );
        assert!(a.handle_signal(&request).await);
        assert!(a.is_active());
    }

    #[tokio::test]
    async fn test_role_changes_are_broadcast() {
        let fx = Fixture::new();
        let a = fx.protocol("a", "b", true);
        let mut rx = a.subscribe();
        assert_eq!(*rx.borrow(), ControlState::Standby);

        a.resolve_initial_role().await.unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), ControlState::Active);
    }
}
