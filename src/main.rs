use std::path::PathBuf;

use cncd::{init_logging, Engine, ServiceConfig, SettingsManager, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging()?;

    tracing::info!("cncd {VERSION} starting");

    let config_path = match std::env::args().nth(1) {
        Some(path) => PathBuf::from(path),
        None => ServiceConfig::default_path()?,
    };
    let config = ServiceConfig::load(&config_path)?;
    tracing::info!(path = %config_path.display(), "configuration loaded");

    let settings = SettingsManager::new(config);
    let engine = Engine::new(settings);

    // The engine runs until the process is asked to stop; client
    // transports (WebSocket, etc.) attach sessions through `Engine`
    tokio::signal::ctrl_c().await?;
    tracing::info!(
        controllers = engine.controller_count(),
        "shutdown requested"
    );

    Ok(())
}
