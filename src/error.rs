use std::time::Duration;
use thiserror::Error;

/// Main error type for instance control
#[derive(Error, Debug)]
pub enum ControlError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invalid instance id: {0}")]
    InvalidInstanceId(String),

    // Coordination store errors
    #[error("Coordination unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Coordination store call timed out after {}ms", .0.as_millis())]
    StoreTimeout(Duration),

    #[error("Corrupt record at {key}: {reason}")]
    CorruptRecord { key: String, reason: String },

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Mode errors
    #[error("Instance control not available - running in standalone mode")]
    Standalone,
}

impl ControlError {
    /// True for transport/availability failures of the coordination store.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(
            self,
            ControlError::StoreUnavailable(_) | ControlError::StoreTimeout(_)
        )
    }
}

impl From<redis::RedisError> for ControlError {
    fn from(err: redis::RedisError) -> Self {
        ControlError::StoreUnavailable(err.to_string())
    }
}

/// Result type alias for ControlError
pub type Result<T> = std::result::Result<T, ControlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_unavailable_classification() {
        assert!(ControlError::StoreUnavailable("refused".into()).is_store_unavailable());
        assert!(ControlError::StoreTimeout(Duration::from_millis(5)).is_store_unavailable());
        assert!(!ControlError::Standalone.is_store_unavailable());
        assert!(!ControlError::CorruptRecord {
            key: "k".into(),
            reason: "bad".into()
        }
        .is_store_unavailable());
    }

    #[test]
    fn test_operator_facing_messages() {
        let err = ControlError::StoreUnavailable("connection refused".into());
        assert_eq!(err.to_string(), "Coordination unavailable: connection refused");

        let err = ControlError::StoreTimeout(Duration::from_millis(1500));
        assert_eq!(
            err.to_string(),
            "Coordination store call timed out after 1500ms"
        );
    }
}
