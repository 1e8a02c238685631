//! Daemon entry point: load the configuration, wire the two actors
//! together and run their event loops until the process is told to stop.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use outpost_core::Config;
use outpostd::controller::Controller;
use outpostd::downloader::Downloader;
use outpostd::runtime;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Arc::new(Config::load_or_default(Path::new("outpost.toml")));
    info!(
        "outpostd {} starting (node {}, polling every {}s)",
        config.info.package_version, config.node.id, config.update.interval_secs
    );

    let (controller_tx, controller_rx) = runtime::mailbox();
    let (downloader_tx, downloader_rx) = runtime::mailbox();

    let controller = Controller::new(
        config.clone(),
        controller_tx.clone(),
        downloader_tx.clone(),
    );
    let downloader = Downloader::new(config, downloader_tx, controller_tx)?;

    let controller_loop = tokio::spawn(runtime::run(controller, controller_rx));
    let downloader_loop = tokio::spawn(runtime::run(downloader, downloader_rx));

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    controller_loop.abort();
    downloader_loop.abort();
    Ok(())
}
