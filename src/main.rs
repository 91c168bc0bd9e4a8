//! Fairstake API Server Binary
//!
//! Loads configuration, opens the database, starts the fair-play and recovery
//! sweeps and serves the HTTP API.

use clap::Parser;
use fairstake::{api::ApiServer, common::clock::Clock, Casino, ConfigLoader};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "fairstake")]
#[command(about = "Provably fair wager settlement server", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(long)]
    config: Option<String>,

    /// Database directory (overrides the config file)
    #[arg(long)]
    data_dir: Option<String>,

    /// API server host (overrides the config file)
    #[arg(long)]
    host: Option<String>,

    /// API server port (overrides the config file)
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fairstake=info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();

    let mut loader = ConfigLoader::new();
    if let Some(path) = &args.config {
        loader = loader.with_path(path);
    }
    let mut config = loader.load()?;
    if let Some(dir) = args.data_dir {
        config.storage.data_directory = dir;
    }
    if let Some(host) = args.host {
        config.api.host = host;
    }
    if let Some(port) = args.port {
        config.api.port = port;
    }
    config.validate()?;

    let casino = Arc::new(Casino::open(config.clone())?);

    let period = casino.registry.ensure_active_period(casino.clock.now()).await?;
    tracing::info!(
        period = period.number,
        server_hash = %period.server_hash,
        ends_at = %period.end_time,
        "Active fair-play period"
    );

    let workers = casino.start_workers();
    let result = ApiServer::new(config.api.clone(), casino).run().await;
    workers.stop();
    result
}
