//! Market-data collector process entrypoint.
//!
//! Wires `Orchestrator` from environment configuration and runs it until
//! a shutdown signal arrives. Venue clients are not built in here —
//! this crate ships the scheduling, storage, and control-loop machinery
//! and expects an embedding application to construct `VenueSetup` values
//! with real `VenueClient`/`Normalizer` implementations and pass them in
//! through the library API.

use anyhow::Result;
use clap::Parser;
use collector_core::collector::{Config, Orchestrator, VenueSetup};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "collector", about = "Multi-venue market-data collector")]
struct Cli {
    /// Override the output directory (otherwise read from COLLECTOR_OUTPUT_DIR).
    #[arg(long, env = "COLLECTOR_OUTPUT_DIR")]
    output_dir: Option<String>,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "collector=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = Config::from_env()?;
    if let Some(dir) = cli.output_dir {
        config.output_dir = dir.into();
    }

    info!(output_dir = %config.output_dir.display(), "starting collector");

    // No venues are wired here: VenueClient implementations are supplied
    // by the embedding application. Running with an empty venue list
    // still exercises the orchestrator's lifecycle end to end.
    let venues: Vec<VenueSetup> = Vec::new();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let orchestrator = Orchestrator::new(config, venues);

    let run = tokio::spawn(orchestrator.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    run.await??;
    Ok(())
}
