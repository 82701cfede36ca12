use super::{ControlState, InstanceId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Derived status of the local instance, recomputed on every status read
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub instance_id: InstanceId,
    pub is_active: bool,
    /// Holder named by the designation (or the default instance on a cold store)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_instance: Option<InstanceId>,
    pub other_alive: bool,
    pub active_by_default: bool,
    pub can_take_control: bool,
    pub state: ControlState,
    /// Last observed fencing epoch (0 = no designation written yet)
    pub epoch: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub observed_at: DateTime<Utc>,
    /// Served from cache because the store could not be read
    pub stale: bool,
    pub standalone: bool,
    /// Coordination was configured but the store could not be reached
    #[serde(default)]
    pub degraded: bool,
}

impl InstanceStatus {
    /// Status reported when no coordination store is in use.
    pub fn standalone(instance_id: InstanceId, now: DateTime<Utc>) -> Self {
        Self {
            active_instance: Some(instance_id.clone()),
            instance_id,
            is_active: true,
            other_alive: false,
            active_by_default: true,
            can_take_control: false,
            state: ControlState::Active,
            epoch: 0,
            last_heartbeat: None,
            observed_at: now,
            stale: false,
            standalone: true,
            degraded: false,
        }
    }

    /// Standalone status for an instance whose coordination store was
    /// unreachable at connect time. Always stale.
    pub fn degraded(instance_id: InstanceId, now: DateTime<Utc>) -> Self {
        Self {
            degraded: true,
            ..Self::standalone(instance_id, now).mark_stale()
        }
    }

    pub fn mark_stale(mut self) -> Self {
        self.stale = true;
        self
    }
}

/// How the active role was acquired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TakeoverMode {
    /// Peer answered DEACTIVATE and handed over
    Graceful,
    /// Peer heartbeat was stale, claimed immediately
    PeerDead,
    /// Operator bypassed the handshake
    Forced,
    /// No designation existed and this is the default instance
    ColdStart,
}

impl fmt::Display for TakeoverMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TakeoverMode::Graceful => write!(f, "graceful"),
            TakeoverMode::PeerDead => write!(f, "peer_dead"),
            TakeoverMode::Forced => write!(f, "forced"),
            TakeoverMode::ColdStart => write!(f, "cold_start"),
        }
    }
}

/// Result of a take-control request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TakeControlOutcome {
    /// Already the active instance; nothing was written
    AlreadyActive { epoch: u64 },
    /// Designation now names this instance
    Acquired { epoch: u64, mode: TakeoverMode },
    /// Peer did not hand over in time; it may still do so
    Pending { wait_seconds: u64 },
    /// Lost the CAS race; re-query status before trying again
    Conflict { holder: InstanceId, epoch: u64 },
}

impl TakeControlOutcome {
    pub fn accepted(&self) -> bool {
        matches!(
            self,
            TakeControlOutcome::AlreadyActive { .. } | TakeControlOutcome::Acquired { .. }
        )
    }

    pub fn pending(&self) -> bool {
        matches!(self, TakeControlOutcome::Pending { .. })
    }

    pub fn wait_seconds(&self) -> u64 {
        match self {
            TakeControlOutcome::Pending { wait_seconds } => *wait_seconds,
            _ => 0,
        }
    }

    pub fn message(&self) -> String {
        match self {
            TakeControlOutcome::AlreadyActive { .. } => "This instance is already active".to_string(),
            TakeControlOutcome::Acquired { mode: TakeoverMode::Graceful, .. } => {
                "Successfully took control".to_string()
            }
            TakeControlOutcome::Acquired { mode, .. } => {
                format!("Successfully took control ({mode} takeover)")
            }
            TakeControlOutcome::Pending { wait_seconds } => format!(
                "Takeover initiated but not yet complete - waiting for other instance (~{wait_seconds}s)"
            ),
            TakeControlOutcome::Conflict { holder, epoch } => format!(
                "Lost the race for control: {holder} holds epoch {epoch}, re-check status"
            ),
        }
    }
}

/// Result of a release-control request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReleaseOutcome {
    /// This instance was not active
    NothingToRelease,
    /// Designation handed to `to`
    Released { to: InstanceId, epoch: u64 },
    /// Peer is not alive; the role is kept so trading stays supervised
    PeerUnreachable,
    /// Releases go to the active-by-default instance, which is this one
    KeptAsDefault,
    /// Designation changed underneath the release
    Conflict { holder: InstanceId, epoch: u64 },
}

impl ReleaseOutcome {
    pub fn ok(&self) -> bool {
        matches!(
            self,
            ReleaseOutcome::NothingToRelease | ReleaseOutcome::Released { .. }
        )
    }

    pub fn message(&self) -> String {
        match self {
            ReleaseOutcome::NothingToRelease => {
                "This instance is not currently active - nothing to release".to_string()
            }
            ReleaseOutcome::Released { to, .. } => {
                format!("Successfully released control - {to} is now active")
            }
            ReleaseOutcome::PeerUnreachable => {
                "Other instance is not alive - keeping control".to_string()
            }
            ReleaseOutcome::KeptAsDefault => {
                "This instance is active by default - keeping control".to_string()
            }
            ReleaseOutcome::Conflict { holder, epoch } => {
                format!("Designation changed during release: {holder} holds epoch {epoch}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_control_tuple_view() {
        let pending = TakeControlOutcome::Pending { wait_seconds: 4 };
        assert!(!pending.accepted());
        assert!(pending.pending());
        assert_eq!(pending.wait_seconds(), 4);

        let acquired = TakeControlOutcome::Acquired {
            epoch: 3,
            mode: TakeoverMode::Forced,
        };
        assert!(acquired.accepted());
        assert_eq!(acquired.wait_seconds(), 0);

        let conflict = TakeControlOutcome::Conflict {
            holder: InstanceId::new("a").unwrap(),
            epoch: 2,
        };
        assert!(!conflict.accepted());
        assert!(!conflict.pending());
    }

    #[test]
    fn test_release_ok_semantics() {
        assert!(ReleaseOutcome::NothingToRelease.ok());
        assert!(!ReleaseOutcome::PeerUnreachable.ok());
        assert!(!ReleaseOutcome::KeptAsDefault.ok());
        assert!(ReleaseOutcome::Released {
            to: InstanceId::new("b").unwrap(),
            epoch: 2
        }
        .ok());
    }

    #[test]
    fn test_standalone_status() {
        let status = InstanceStatus::standalone(InstanceId::new("standalone").unwrap(), Utc::now());
        assert!(status.is_active);
        assert!(status.standalone);
        assert!(!status.can_take_control);
        assert_eq!(status.active_instance, Some(status.instance_id.clone()));
        assert!(!status.stale);
        assert!(!status.degraded);
    }

    #[test]
    fn test_degraded_status_is_stale_but_active() {
        let status = InstanceStatus::degraded(InstanceId::new("prod").unwrap(), Utc::now());
        assert!(status.is_active);
        assert!(status.standalone);
        assert!(status.stale);
        assert!(status.degraded);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["degraded"], true);
    }

    #[test]
    fn test_outcome_serialization_is_tagged() {
        let json = serde_json::to_value(TakeControlOutcome::Pending { wait_seconds: 5 }).unwrap();
        assert_eq!(json["outcome"], "pending");
        assert_eq!(json["wait_seconds"], 5);
    }
}
