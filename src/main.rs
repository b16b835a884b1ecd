//! Ferrite conductor binary

use clap::{Parser, Subcommand};
use color_eyre::eyre::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, registry, EnvFilter};

use ferrite_common::ConductorConfig;
use ferrite_driver::build_enabled;
use ferrite_engine::{Conductor, MemoryStore};

#[derive(Parser, Debug)]
#[command(author, version, about = "Ferrite bare metal lifecycle orchestrator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the conductor service
    Serve(ServeArgs),
}

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Conductor identity recorded as the lease holder
    #[arg(long)]
    host: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve(args) => serve(args).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let config = match &args.config {
        Some(path) => ConductorConfig::load(path)?,
        None => ConductorConfig::default(),
    };
    let host = args
        .host
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "ferrite".to_string());

    let driver_registry = build_enabled(&config.enabled_drivers)?;
    info!(
        host = %host,
        drivers = %driver_registry.names().join(", "),
        workers = config.workers,
        "starting conductor"
    );

    let store = Arc::new(MemoryStore::new());
    let conductor = Conductor::new(host, config, driver_registry, store);
    let background = conductor.spawn_background_tasks();

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    for handle in background {
        handle.abort();
    }
    Ok(())
}
