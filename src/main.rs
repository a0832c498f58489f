use std::process::ExitCode;

use anyhow::Context;
use modlaunch::signals::ShutdownSignal;
use modlaunch::{LaunchSupervisor, LauncherConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match LauncherConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::from(1);
        }
    };

    match run(config).await {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(e) => {
            tracing::error!("Launcher failed: {:#}", e);
            ExitCode::from(1)
        }
    }
}

async fn run(config: LauncherConfig) -> anyhow::Result<i32> {
    tracing::info!(
        "modlaunch starting ({} module(s), mode {:?}, base port {})",
        config.modules.len(),
        config.mode,
        config.base_port
    );

    // installed before launching so a signal during launch is not lost
    let mut signal = ShutdownSignal::install().context("failed to install signal handlers")?;

    let mut supervisor = LaunchSupervisor::from_config(&config)?;
    supervisor.launch(&config.modules).await?;

    let shutdown = supervisor.run_until_shutdown(signal.recv()).await?;
    if !shutdown.is_clean() {
        tracing::warn!("Residual instances after shutdown: {}", shutdown.residual.join(", "));
    }
    tracing::info!("Launch report: {}", serde_json::to_string(&supervisor.report())?);

    Ok(supervisor.exit_code())
}
