use std::path::PathBuf;

use llama_sidecar::config::{self, Settings, SupervisorConfig};
use llama_sidecar::Supervisor;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    tracing::info!("llama-sidecar starting");

    let config_path = std::env::var("LLAMA_SIDECAR_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(config::DEFAULT_CONFIG_PATH));
    let settings = Settings::load(&config_path)?.with_env_overrides()?;
    let config = SupervisorConfig::resolve(settings)?;
    tracing::info!(
        binary = %config.binary.display(),
        model = %config.model.display(),
        threads = config.threads,
        "Configuration resolved"
    );

    let supervisor = Supervisor::new(config)?;
    supervisor.start().await?;
    tracing::info!(address = %supervisor.address(), "Service is up");

    let mut running = supervisor.watch_running();
    let crashed = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received, stopping service");
            false
        }
        _ = running.wait_for(|running| !*running) => true,
    };

    supervisor.stop().await?;
    if crashed {
        anyhow::bail!("service at {} exited unexpectedly", supervisor.address());
    }
    tracing::info!("llama-sidecar shutting down");
    Ok(())
}
