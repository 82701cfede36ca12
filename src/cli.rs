use clap::{Parser, Subcommand};
use serde::Serialize;

use crate::coordination::InstanceControl;
use crate::domain::{InstanceStatus, ReleaseOutcome, TakeControlOutcome};
use crate::error::Result;

#[derive(Parser)]
#[command(name = "hotstandby")]
#[command(version = "0.1.0")]
#[command(about = "Active/standby control for a pair of trading instances", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Config directory (default.toml plus the HOTSTANDBY_ENV file)
    #[arg(short, long, default_value = "config", env = "HOTSTANDBY_CONFIG_DIR")]
    pub config: String,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Run as a daemon: heartbeat, supervise and gate trading until stopped
    Run,
    /// Print this instance's status as JSON
    Status,
    /// Become the active instance
    TakeControl {
        /// Skip the handshake with a live peer
        #[arg(long)]
        force: bool,
    },
    /// Hand the active role to the peer
    ReleaseControl,
}

/// JSON envelope printed by the one-shot commands
#[derive(Debug, Serialize)]
pub struct CommandReport<T: Serialize> {
    pub success: bool,
    pub message: String,
    #[serde(flatten)]
    pub detail: T,
}

impl CommandReport<InstanceStatus> {
    pub fn status(status: InstanceStatus) -> Self {
        let message = if status.stale {
            "Coordination unavailable, showing last known status".to_string()
        } else if status.is_active {
            format!("{} is active", status.instance_id)
        } else {
            format!("{} is standby", status.instance_id)
        };
        Self {
            success: !status.stale,
            message,
            detail: status,
        }
    }
}

impl CommandReport<TakeControlOutcome> {
    pub fn take_control(outcome: TakeControlOutcome) -> Self {
        Self {
            success: outcome.accepted(),
            message: outcome.message(),
            detail: outcome,
        }
    }
}

impl CommandReport<ReleaseOutcome> {
    pub fn release(outcome: ReleaseOutcome) -> Self {
        Self {
            success: outcome.ok(),
            message: outcome.message(),
            detail: outcome,
        }
    }
}

pub async fn show_status(control: &InstanceControl) -> Result<String> {
    let report = CommandReport::status(control.get_status().await);
    Ok(serde_json::to_string_pretty(&report)?)
}

pub async fn take_control(control: &InstanceControl, force: bool) -> Result<String> {
    let report = CommandReport::take_control(control.take_control(force).await?);
    Ok(serde_json::to_string_pretty(&report)?)
}

pub async fn release_control(control: &InstanceControl) -> Result<String> {
    let report = CommandReport::release(control.release_control().await?);
    Ok(serde_json::to_string_pretty(&report)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{InstanceId, TakeoverMode};

    #[test]
    fn test_parse_subcommands() {
        let cli = Cli::try_parse_from(["hotstandby", "take-control", "--force"]).unwrap();
        assert_eq!(cli.command, Some(Commands::TakeControl { force: true }));

        let cli = Cli::try_parse_from(["hotstandby", "--config", "/etc/hs", "status"]).unwrap();
        assert_eq!(cli.config, "/etc/hs");
        assert_eq!(cli.command, Some(Commands::Status));

        let cli = Cli::try_parse_from(["hotstandby", "release-control"]).unwrap();
        assert_eq!(cli.command, Some(Commands::ReleaseControl));
    }

    #[test]
    fn test_take_control_report_flattens_outcome() {
        let report = CommandReport::take_control(TakeControlOutcome::Acquired {
            epoch: 3,
            mode: TakeoverMode::Forced,
        });
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["outcome"], "acquired");
        assert_eq!(json["epoch"], 3);
        assert_eq!(json["mode"], "forced");
    }

    #[tokio::test]
    async fn test_standalone_release_is_an_error() {
        let control = InstanceControl::standalone(InstanceId::new("solo").unwrap());
        assert!(release_control(&control).await.is_err());

        let status = show_status(&control).await.unwrap();
        assert!(status.contains("\"standalone\": true"));
    }
}
