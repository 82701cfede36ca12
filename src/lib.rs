pub mod adapters;
pub mod cli;
pub mod config;
pub mod coordination;
pub mod domain;
pub mod error;

pub use adapters::{CoordinationStore, InMemoryStore, RedisStore, StoreKeys};
pub use config::AppConfig;
pub use coordination::{Clock, InstanceControl, ManualClock, SystemClock};
pub use domain::{
    ControlState, InstanceId, InstancePair, InstanceStatus, ReleaseOutcome, TakeControlOutcome,
    TakeoverMode,
};
pub use error::{ControlError, Result};
