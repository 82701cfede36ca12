use anyhow::{Context, Result};
use clap::Parser;
use hotstandby::cli::{self, Cli, Commands};
use hotstandby::config::AppConfig;
use hotstandby::coordination::InstanceControl;
use hotstandby::domain::ControlState;
use std::future::Future;
use tracing::{info, warn};

mod main_runtime;

use main_runtime::{init_logging, init_logging_simple, shutdown_signal};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config))?;

    match cli.command.clone().unwrap_or(Commands::Run) {
        Commands::Run => {
            init_logging(&config.logging);
            run_daemon(&config).await?;
        }
        Commands::Status => {
            init_logging_simple();
            let control = connect(&config).await?;
            println!("{}", cli::show_status(&control).await?);
        }
        Commands::TakeControl { force } => {
            init_logging_simple();
            let control = connect(&config).await?;
            println!("{}", cli::take_control(&control, force).await?);
        }
        Commands::ReleaseControl => {
            init_logging_simple();
            let control = connect(&config).await?;
            println!("{}", cli::release_control(&control).await?);
        }
    }

    Ok(())
}

async fn connect(config: &AppConfig) -> Result<InstanceControl> {
    InstanceControl::connect(config)
        .await
        .context("invalid instance configuration")
}

/// Heartbeat and supervise until Ctrl-C/SIGTERM, logging every role change.
async fn run_daemon(config: &AppConfig) -> Result<()> {
    let control = connect(config).await?;
    let initial = control.start().await.context("failed to start instance control")?;

    info!(
        instance = %control.instance_id(),
        state = %initial,
        standalone = control.is_standalone(),
        degraded = control.is_degraded(),
        "Trading gate {}",
        if control.is_active() { "open" } else { "closed" }
    );

    watch_roles(&control, shutdown_signal()).await;

    control.shutdown().await;
    Ok(())
}

/// Log role changes until `shutdown` resolves or the role channel closes.
async fn watch_roles(control: &InstanceControl, shutdown: impl Future<Output = ()>) {
    tokio::pin!(shutdown);
    let mut roles = control.role_changes();
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }
            changed = roles.changed() => {
                if changed.is_err() {
                    warn!("Role channel closed");
                    break;
                }
                let state = *roles.borrow_and_update();
                match state {
                    ControlState::Active => info!(epoch = control.epoch(), "Trading gate open"),
                    ControlState::Standby => info!(epoch = control.epoch(), "Trading gate closed"),
                    other => info!(state = %other, "Role in transition, trading gate closed"),
                }
            }
        }
    }
}
