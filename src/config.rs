use crate::domain::{InstanceId, InstancePair};
use crate::error::{ControlError, Result};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub instance: InstanceConfig,
    #[serde(default)]
    pub coordination: CoordinationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstanceConfig {
    /// This instance's identifier (e.g. "prod")
    pub id: String,
    /// The other instance's identifier (e.g. "dev")
    pub peer_id: String,
    /// Whether this instance holds the role on a cold store
    #[serde(default)]
    pub active_by_default: bool,
}

/// Who receives the role on a voluntary release
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseTarget {
    /// Always the peer
    Peer,
    /// The active-by-default instance; that instance itself keeps the role
    ActiveByDefault,
}

impl Default for ReleaseTarget {
    fn default() -> Self {
        ReleaseTarget::Peer
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoordinationConfig {
    /// Disable to run standalone (always active)
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Redis connection URL
    #[serde(default)]
    pub redis_url: Option<String>,
    /// Prefix for every key written to the store
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Heartbeat period; the record TTL is three times this
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
    /// Heartbeat age after which an instance counts as dead
    #[serde(default = "default_alive_timeout")]
    pub alive_timeout_ms: u64,
    /// Maximum wait for the peer's READY during a graceful takeover
    #[serde(default = "default_handover_timeout")]
    pub handover_timeout_ms: u64,
    /// Poll period while waiting for READY
    #[serde(default = "default_handover_poll_interval")]
    pub handover_poll_interval_ms: u64,
    /// Period of the supervision tick (signals + designation)
    #[serde(default = "default_signal_poll_interval")]
    pub signal_poll_interval_ms: u64,
    /// Per-call network timeout against the store
    #[serde(default = "default_store_op_timeout")]
    pub store_op_timeout_ms: u64,
    #[serde(default)]
    pub release_target: ReleaseTarget,
    /// Standby claims the role on its own once the active peer is dead
    #[serde(default)]
    pub auto_failover: bool,
    /// Hand the role to a live peer when shutting down
    #[serde(default = "default_release_on_shutdown")]
    pub release_on_shutdown: bool,
}

fn default_enabled() -> bool {
    true
}

fn default_key_prefix() -> String {
    "hotstandby".to_string()
}

fn default_heartbeat_interval() -> u64 {
    5_000
}

fn default_alive_timeout() -> u64 {
    10_000
}

fn default_handover_timeout() -> u64 {
    5_000
}

fn default_handover_poll_interval() -> u64 {
    250
}

fn default_signal_poll_interval() -> u64 {
    500
}

fn default_store_op_timeout() -> u64 {
    1_000
}

fn default_release_on_shutdown() -> bool {
    true
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            redis_url: None,
            key_prefix: default_key_prefix(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            alive_timeout_ms: default_alive_timeout(),
            handover_timeout_ms: default_handover_timeout(),
            handover_poll_interval_ms: default_handover_poll_interval(),
            signal_poll_interval_ms: default_signal_poll_interval(),
            store_op_timeout_ms: default_store_op_timeout(),
            release_target: ReleaseTarget::default(),
            auto_failover: false,
            release_on_shutdown: default_release_on_shutdown(),
        }
    }
}

impl CoordinationConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// TTL of heartbeat records: three missed ticks
    pub fn heartbeat_ttl(&self) -> Duration {
        self.heartbeat_interval() * 3
    }

    pub fn alive_timeout(&self) -> Duration {
        Duration::from_millis(self.alive_timeout_ms)
    }

    pub fn handover_timeout(&self) -> Duration {
        Duration::from_millis(self.handover_timeout_ms)
    }

    pub fn handover_poll_interval(&self) -> Duration {
        Duration::from_millis(self.handover_poll_interval_ms)
    }

    pub fn signal_poll_interval(&self) -> Duration {
        Duration::from_millis(self.signal_poll_interval_ms)
    }

    /// Signals outlive the handover window so a slow peer can still answer
    pub fn signal_ttl(&self) -> Duration {
        (self.handover_timeout() * 2).max(Duration::from_secs(1))
    }

    pub fn store_op_timeout(&self) -> Duration {
        Duration::from_millis(self.store_op_timeout_ms)
    }

    /// Collect every problem with the timing settings
    fn validate_into(&self, errors: &mut Vec<String>) {
        for (name, value) in [
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("alive_timeout_ms", self.alive_timeout_ms),
            ("handover_timeout_ms", self.handover_timeout_ms),
            ("handover_poll_interval_ms", self.handover_poll_interval_ms),
            ("signal_poll_interval_ms", self.signal_poll_interval_ms),
            ("store_op_timeout_ms", self.store_op_timeout_ms),
        ] {
            if value == 0 {
                errors.push(format!("coordination.{name} must be positive"));
            }
        }

        if self.alive_timeout_ms < self.heartbeat_interval_ms.saturating_mul(2) {
            errors.push(format!(
                "alive_timeout_ms ({}) must be at least twice heartbeat_interval_ms ({})",
                self.alive_timeout_ms, self.heartbeat_interval_ms
            ));
        }

        if self.alive_timeout_ms > self.heartbeat_interval_ms.saturating_mul(3) {
            errors.push(format!(
                "alive_timeout_ms ({}) must not exceed the heartbeat TTL ({}ms)",
                self.alive_timeout_ms,
                self.heartbeat_interval_ms.saturating_mul(3)
            ));
        }

        if self.handover_poll_interval_ms >= self.handover_timeout_ms {
            errors.push("handover_poll_interval_ms should be less than handover_timeout_ms".to_string());
        }

        if self.signal_poll_interval_ms >= self.handover_timeout_ms {
            errors.push("signal_poll_interval_ms should be less than handover_timeout_ms".to_string());
        }

        if self.key_prefix.trim().is_empty() {
            errors.push("coordination.key_prefix must not be empty".to_string());
        }

        if self.enabled
            && self
                .redis_url
                .as_deref()
                .map(|u| u.trim().is_empty())
                .unwrap_or(true)
        {
            errors.push("coordination.redis_url is required when coordination is enabled".to_string());
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> std::result::Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> std::result::Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Start with default values
            .set_default("instance.active_by_default", false)?
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("coordination.enabled", true)?
            .set_default("coordination.key_prefix", default_key_prefix())?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("HOTSTANDBY_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (HOTSTANDBY__INSTANCE__ID, etc.)
            .add_source(
                Environment::with_prefix("HOTSTANDBY")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Create a standalone configuration for local runs
    pub fn default_config(instance_id: &str, peer_id: &str, active_by_default: bool) -> Self {
        Self {
            instance: InstanceConfig {
                id: instance_id.to_string(),
                peer_id: peer_id.to_string(),
                active_by_default,
            },
            coordination: CoordinationConfig {
                enabled: false,
                ..CoordinationConfig::default()
            },
            logging: LoggingConfig::default(),
        }
    }

    /// Validated view of the two instance identifiers
    pub fn instance_pair(&self) -> Result<InstancePair> {
        InstancePair::new(
            InstanceId::new(&self.instance.id)?,
            InstanceId::new(&self.instance.peer_id)?,
            self.instance.active_by_default,
        )
    }

    /// Validate configuration values
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if let Err(e) = self.instance_pair() {
            errors.push(e.to_string());
        }

        self.coordination.validate_into(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// `validate` folded into a single error
    pub fn ensure_valid(&self) -> Result<()> {
        self.validate()
            .map_err(|errors| ControlError::Validation(errors.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn coordinated() -> AppConfig {
        let mut config = AppConfig::default_config("prod", "dev", true);
        config.coordination.enabled = true;
        config.coordination.redis_url = Some("redis://127.0.0.1:6379".to_string());
        config
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(coordinated().validate().is_ok());
        assert!(AppConfig::default_config("prod", "dev", true).validate().is_ok());
    }

    #[test]
    fn test_heartbeat_ttl_is_three_intervals() {
        let c = CoordinationConfig::default();
        assert_eq!(c.heartbeat_ttl(), Duration::from_secs(15));
        assert!(c.alive_timeout() >= c.heartbeat_interval() * 2);
        assert!(c.alive_timeout() <= c.heartbeat_ttl());
    }

    #[test]
    fn test_alive_timeout_must_tolerate_one_missed_tick() {
        let mut config = coordinated();
        config.coordination.alive_timeout_ms = 6_000;
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("at least twice")));
    }

    #[test]
    fn test_identical_ids_rejected() {
        let mut config = coordinated();
        config.instance.peer_id = "prod".to_string();
        assert!(config.validate().is_err());
        assert!(matches!(
            config.ensure_valid(),
            Err(ControlError::Validation(_))
        ));
    }

    #[test]
    fn test_redis_url_required_when_enabled() {
        let mut config = coordinated();
        config.coordination.redis_url = None;
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("redis_url")));
    }

    #[test]
    fn test_collects_all_errors() {
        let mut config = coordinated();
        config.coordination.handover_poll_interval_ms = 10_000;
        config.coordination.key_prefix = " ".to_string();
        config.instance.id = String::new();
        assert_eq!(config.validate().unwrap_err().len(), 3);
    }

    #[test]
    fn test_load_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("default.toml")).unwrap();
        writeln!(
            file,
            r#"
[instance]
id = "secondary"
peer_id = "primary"

[coordination]
redis_url = "redis://cache:6379"
handover_timeout_ms = 3000
release_target = "active_by_default"
"#
        )
        .unwrap();

        let config = AppConfig::load_from(dir.path()).unwrap();
        assert_eq!(config.instance.id, "secondary");
        assert!(!config.instance.active_by_default);
        assert!(config.coordination.enabled);
        assert_eq!(config.coordination.handover_timeout(), Duration::from_secs(3));
        assert_eq!(config.coordination.heartbeat_interval_ms, 5_000);
        assert_eq!(
            config.coordination.release_target,
            ReleaseTarget::ActiveByDefault
        );
        assert_eq!(config.logging.level, "info");
    }
}
