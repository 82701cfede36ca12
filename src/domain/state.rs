use serde::{Deserialize, Serialize};
use std::fmt;

/// Local role state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlState {
    /// Dormant, not allowed to trade
    Standby,
    /// Holds the designation, allowed to trade
    Active,
    /// Claim in flight, waiting on the peer
    Activating,
    /// Relinquish in flight, waiting on the peer
    Deactivating,
}

impl ControlState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlState::Standby => "STANDBY",
            ControlState::Active => "ACTIVE",
            ControlState::Activating => "ACTIVATING",
            ControlState::Deactivating => "DEACTIVATING",
        }
    }

    /// Only this state authorizes trading actions.
    pub fn is_active(&self) -> bool {
        matches!(self, ControlState::Active)
    }

    /// A handover is in flight; observations must not overwrite it.
    pub fn in_transition(&self) -> bool {
        matches!(self, ControlState::Activating | ControlState::Deactivating)
    }

    /// Check if this state can transition to another state
    pub fn can_transition_to(&self, target: ControlState) -> bool {
        use ControlState::*;

        match (self, target) {
            // From Standby
            (Standby, Activating) => true, // Graceful claim started
            (Standby, Active) => true,     // Direct CAS claim or observed transfer

            // From Activating
            (Activating, Active) => true,  // Peer handed over
            (Activating, Standby) => true, // Timeout, cancel or lost race

            // From Active
            (Active, Deactivating) => true, // Release or DEACTIVATE request
            (Active, Standby) => true,      // Fenced out by a newer epoch

            // From Deactivating
            (Deactivating, Standby) => true, // Designation transferred
            (Deactivating, Active) => true,  // Transfer failed, still holder

            // All other transitions are invalid
            _ => false,
        }
    }

    /// Get valid next states from current state
    pub fn valid_transitions(&self) -> Vec<ControlState> {
        use ControlState::*;

        match self {
            Standby => vec![Activating, Active],
            Activating => vec![Active, Standby],
            Active => vec![Deactivating, Standby],
            Deactivating => vec![Standby, Active],
        }
    }
}

impl fmt::Display for ControlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Default for ControlState {
    fn default() -> Self {
        ControlState::Standby
    }
}
