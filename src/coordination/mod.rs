//! Active/standby coordination between the two instances
//!
//! - Heartbeat publishing for liveness
//! - Epoch-fenced handover of the active designation
//! - The `InstanceControl` facade, with a standalone fallback

pub mod clock;
pub mod control;
pub mod handover;
pub mod heartbeat;

pub use clock::{Clock, ManualClock, SystemClock};
pub use control::InstanceControl;
pub use handover::HandoverProtocol;
pub use heartbeat::HeartbeatPublisher;
