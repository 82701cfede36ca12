use crate::error::{ControlError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one of the two cooperating instances ("primary", "prod", ...)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let trimmed = id.trim();
        if trimmed.is_empty() {
            return Err(ControlError::InvalidInstanceId(
                "instance id must not be empty".to_string(),
            ));
        }
        if trimmed.contains(char::is_whitespace) || trimmed.contains(':') {
            return Err(ControlError::InvalidInstanceId(format!(
                "instance id {trimmed:?} must not contain whitespace or ':'"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for InstanceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The two known instances as seen from the local process.
///
/// Fixed at process start. `active_by_default` belongs to the local instance;
/// the peer is assumed to carry the opposite flag, which is how a standby
/// instance resolves the cold-start holder without reading the peer's config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstancePair {
    pub local: InstanceId,
    pub peer: InstanceId,
    pub active_by_default: bool,
}

impl InstancePair {
    pub fn new(local: InstanceId, peer: InstanceId, active_by_default: bool) -> Result<Self> {
        if local == peer {
            return Err(ControlError::InvalidInstanceId(format!(
                "local and peer instance ids are both {local:?}"
            )));
        }
        Ok(Self {
            local,
            peer,
            active_by_default,
        })
    }

    /// The instance that holds the role when no designation was ever written.
    pub fn default_instance(&self) -> &InstanceId {
        if self.active_by_default {
            &self.local
        } else {
            &self.peer
        }
    }

    pub fn is_local(&self, id: &InstanceId) -> bool {
        &self.local == id
    }
}
