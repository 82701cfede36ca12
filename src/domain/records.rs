//! Records persisted in the coordination store
//!
//! All records are stored as JSON. The designation is the only record shared
//! for writing; heartbeats belong to their writer and signals are hints.

use super::InstanceId;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Liveness record written by its owning instance with a TTL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub instance_id: InstanceId,
    pub last_seen_at: DateTime<Utc>,
}

impl HeartbeatRecord {
    pub fn new(instance_id: InstanceId, last_seen_at: DateTime<Utc>) -> Self {
        Self {
            instance_id,
            last_seen_at,
        }
    }

    /// `now - last_seen_at < alive_timeout`
    pub fn is_alive_at(&self, now: DateTime<Utc>, alive_timeout: Duration) -> bool {
        let timeout = match ChronoDuration::from_std(alive_timeout) {
            Ok(t) => t,
            Err(_) => return true,
        };
        now.signed_duration_since(self.last_seen_at) < timeout
    }
}

/// The single authoritative record naming the active instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveDesignation {
    pub active_instance: InstanceId,
    /// Fencing counter, incremented on every successful transfer
    pub epoch: u64,
}

impl ActiveDesignation {
    /// Designation that would replace `current` when handing the role to `to`.
    /// An absent designation counts as epoch 0.
    pub fn successor(current: Option<&ActiveDesignation>, to: InstanceId) -> Self {
        Self {
            active_instance: to,
            epoch: current.map(|d| d.epoch).unwrap_or(0) + 1,
        }
    }

    pub fn names(&self, id: &InstanceId) -> bool {
        &self.active_instance == id
    }
}

/// Control signal types exchanged during a graceful handover
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalKind {
    /// Ask the recipient to stop trading and hand over the designation
    Deactivate,
    /// The sender has stopped trading and is safe to replace
    Ready,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalKind::Deactivate => write!(f, "DEACTIVATE"),
            SignalKind::Ready => write!(f, "READY"),
        }
    }
}

/// Handshake message; never authoritative on its own
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlSignal {
    pub id: Uuid,
    pub kind: SignalKind,
    pub from: InstanceId,
    pub to: InstanceId,
    pub issued_at: DateTime<Utc>,
    /// Set on a READY that answers a DEACTIVATE
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<Uuid>,
}

impl ControlSignal {
    pub fn deactivate(from: InstanceId, to: InstanceId, issued_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: SignalKind::Deactivate,
            from,
            to,
            issued_at,
            in_reply_to: None,
        }
    }

    pub fn ready(
        from: InstanceId,
        to: InstanceId,
        issued_at: DateTime<Utc>,
        in_reply_to: Option<Uuid>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: SignalKind::Ready,
            from,
            to,
            issued_at,
            in_reply_to,
        }
    }

    /// True if this is the READY answering the DEACTIVATE with `request_id`.
    pub fn answers(&self, request_id: Uuid) -> bool {
        self.kind == SignalKind::Ready && self.in_reply_to == Some(request_id)
    }
}
