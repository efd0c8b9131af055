//! Hoster daemon entry point.

use clap::Parser;
use log::info;

mod config;
mod error;
mod extract;
mod hosts;
mod registry;
mod runtime;
mod sync;
mod types;

use config::{Cli, Config};
use runtime::DockerRuntime;
use sync::{shutdown_signal, Synchronizer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Load configuration
    let cli = Cli::parse();
    let cfg = Config::load(&cli)?;
    info!("Starting hoster with config: {:?}", cfg);

    // Graceful Shutdown, installed before anything can block
    let shutdown = shutdown_signal()?;

    let runtime = DockerRuntime::connect(&cfg.socket)?;
    let mut synchronizer = Synchronizer::new(
        runtime,
        cfg.hosts_file.clone(),
        cfg.proxy_rules(),
        cfg.reconnect_delay(),
    );

    synchronizer.run(shutdown).await?;

    info!("Shutdown complete.");
    Ok(())
}
