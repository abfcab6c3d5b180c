//! dropbus command line
//!
//! Usage:
//!   dropbus simulate --nodes 6 --ticks 40      # Deterministic run on a loopback bus
//!   dropbus simulate --seed 7 --json           # Same, printing registries as JSON
//!   dropbus run --nodes 3 --duration-secs 10   # Real-time nodes on the tokio runtime
//!   dropbus config                             # Print the effective configuration

mod sim;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use dropbus_core::config::{Config, ConfigBuilder, LoggingConfig, SharedConfig};
use dropbus_core::logging;

/// Environment prefix for configuration overrides, e.g. `DROPBUS__BUS__GRACE_TICKS`
const ENV_PREFIX: &str = "DROPBUS";

/// Decentralised addressing and discovery for multi-drop device buses
#[derive(Parser)]
#[command(name = "dropbus", version)]
#[command(about = "Decentralised addressing and discovery for multi-drop device buses")]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log filter, overrides the configured level
    #[arg(long, global = true)]
    log: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Simulate several nodes sharing one bus, tick by tick
    Simulate {
        /// Number of nodes on the bus
        #[arg(short, long, default_value_t = 4)]
        nodes: usize,

        /// Ticks to run
        #[arg(short, long, default_value_t = 20)]
        ticks: u32,

        /// Seed for serial numbers, address draws and readings
        #[arg(long, default_value_t = 1)]
        seed: u64,

        /// Print every node's registry as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run nodes in real time until the duration elapses or ctrl-c
    Run {
        /// Number of nodes on the bus
        #[arg(short, long, default_value_t = 3)]
        nodes: usize,

        /// How long to run
        #[arg(long, default_value_t = 5)]
        duration_secs: u64,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = SharedConfig::new(load_config(cli.config.as_ref())?);

    let logging_config = LoggingConfig {
        level: cli.log.unwrap_or_else(|| config.get().logging.level.clone()),
        ..config.get().logging.clone()
    };
    logging::init_from_config(&logging_config).context("Failed to initialize logging")?;

    match cli.command {
        Commands::Simulate { nodes, ticks, seed, json } => {
            sim::simulate(&config, nodes, ticks, seed, json)?;
        }
        Commands::Run { nodes, duration_secs } => {
            sim::run(&config, nodes, duration_secs).await?;
        }
        Commands::Config => {
            let rendered = toml::to_string_pretty(config.get()).context("Failed to render configuration")?;
            print!("{}", rendered);
        }
    }

    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let mut builder = ConfigBuilder::new().with_environment_prefix(ENV_PREFIX);
    if let Some(path) = path {
        builder = builder.with_config_file(path);
    }
    builder.build().context("Failed to load configuration")
}
