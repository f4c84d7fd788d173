//! Bonder Node
//!
//! Off-chain coordinator for a multi-network bonding bridge: watches the
//! bridge contracts, bonds and settles transfers, samples gas prices and
//! evaluates arbitrage.

mod config;
mod node;
mod shutdown;

use bonder_core::store::PgStore;
use bonder_sdk::objects::ChainId;
use clap::{Parser, Subcommand};
use config::ConfigLoader;
use config::file::{LogFormat, LoggingConfig};
use node::{Node, Role};
use shutdown::spawn_shutdown_watch;
use sqlx::postgres::PgPoolOptions;
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Bonder - bridge bonding and settlement daemons
#[derive(Parser, Debug)]
#[command(name = "bonder-node")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "BONDER_CONFIG", default_value = "./bonder-config.toml")]
    config: PathBuf,

    /// Env file with DATABASE_URL and snapshot secrets
    #[arg(long, env = "BONDER_ENV_FILE")]
    env_file: Option<PathBuf>,

    /// Run database migrations on startup
    #[arg(long, default_value = "false")]
    migrate: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Follow one chain's bridge contracts and record their events
    Watch {
        /// Chain id of a configured network
        #[arg(long)]
        chain: u64,
    },
    /// Bond sent transfers and settle committed ones
    Bond,
    /// Sample gas prices and publish liquidity snapshots
    GasSampler,
    /// Evaluate and execute arbitrage between price venues
    Arb,
    /// Run every daemon in this process
    RunAll,
}

impl From<Command> for Role {
    fn from(command: Command) -> Self {
        match command {
            Command::Watch { chain } => Role::Watch(ChainId(chain)),
            Command::Bond => Role::Bond,
            Command::GasSampler => Role::GasSampler,
            Command::Arb => Role::Arbitrage,
            Command::RunAll => Role::All,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration before tracing; the log format is part of it.
    let loaded_config = ConfigLoader::new(&args.config, args.env_file.clone()).load()?;
    init_tracing(&loaded_config.logging);

    tracing::info!("Starting bonder-node v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        networks = loaded_config.bridge.networks.len(),
        tokens = loaded_config.bridge.tokens.len(),
        "Configuration loaded from {:?}",
        args.config
    );

    let database_url = loaded_config.database_url().map_err(|e| {
        tracing::error!("DATABASE_URL environment variable not set");
        e
    })?;

    tracing::info!("Connecting to database...");
    let db_pool = PgPoolOptions::new()
        .max_connections(loaded_config.store.max_connections)
        .connect(&database_url)
        .await
        .map_err(|e| {
            tracing::error!("Failed to connect to database: {}", e);
            e
        })?;
    tracing::info!("Database connection established");

    if args.migrate {
        tracing::info!("Running database migrations...");
        sqlx::migrate!("../migrations")
            .run(&db_pool)
            .await
            .map_err(|e| {
                tracing::error!("Failed to run migrations: {}", e);
                e
            })?;
        tracing::info!("Migrations completed successfully");
    }

    let shutdown_rx = spawn_shutdown_watch()?;
    let node = Node::new(
        loaded_config.bridge,
        PgStore::new(db_pool.clone()),
        shutdown_rx,
    );
    let result = node.run(args.command.into()).await;
    if let Err(e) = &result {
        tracing::error!("Failed to start daemons: {:#}", e);
    }

    tracing::info!("Closing database connections...");
    db_pool.close().await;
    tracing::info!("Bonder shutdown complete");

    result
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing(logging: &LoggingConfig) {
    let default_filter = logging.filter.as_deref().unwrap_or("info,sqlx=warn");
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let registry = tracing_subscriber::registry().with(filter);
    match logging.format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}
