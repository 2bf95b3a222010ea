//! Strikeflow server - headless F&O analytics and trade-automation backend.
//!
//! Runs three supervised subsystems: the tick aggregation pipeline, the
//! alert evaluation worker, and the position-change / order-cleanup chain.
//! Configuration comes from the environment (see `config.rs`); logs go to
//! stdout as structured tracing output.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use strikeflow::application::system::Application;
use strikeflow::config::Config;
use tracing::{Level, info};
use tracing_subscriber::prelude::*;

#[derive(Parser, Debug)]
#[command(name = "strikeflow", about = "F&O analytics and trade-automation backend")]
struct Cli {
    /// Load environment variables from this file instead of ./.env
    #[arg(long)]
    env_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load environment variables
    match &cli.env_file {
        Some(path) => {
            dotenvy::from_path(path).ok();
        }
        None => {
            dotenvy::dotenv().ok();
        }
    }

    // Setup logging (stdout only)
    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false);

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(stdout_layer)
        .init();

    info!("Strikeflow {} starting...", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    info!(
        "Configuration loaded: timeframes={:?}, persist={:?}, accounts={:?}",
        config.timeframes, config.persist_timeframes, config.broker_accounts
    );

    let app = Application::build(config).await?;
    let handle = app.start().await?;
    info!("Strikeflow running. Press Ctrl-C to stop.");

    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C received");
    handle.shutdown().await;

    Ok(())
}
