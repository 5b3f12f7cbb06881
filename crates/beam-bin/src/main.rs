//! beamctl: command line front end for beamline devices
//!
//! Loads a setup file and either runs the background poller or performs a
//! single move/read on a device.
//!
//! # Usage
//!
//! ```bash
//! # master mode: one child poller process per group
//! beamctl poller --setup setups/demo.toml
//!
//! # one group in this process
//! beamctl poller --setup setups/demo.toml motion
//!
//! beamctl move --setup setups/demo.toml sth 12.5
//! beamctl move --setup setups/demo.toml s1 4 2
//! beamctl read --setup setups/demo.toml t_sample
//! ```

#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

mod commands;

use anyhow::{Context, Result};
use beam_core::SetupConfig;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "beamctl")]
#[command(about = "Beamline motion control and device polling", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Poll devices into the cache
    Poller {
        /// Setup file (TOML)
        #[arg(long)]
        setup: PathBuf,

        /// Poller group to run in this process.
        /// Without a group, one child process per group is supervised.
        group: Option<String>,
    },

    /// Move an axis (one target) or a slit (one target per coordinate)
    Move {
        /// Setup file (TOML)
        #[arg(long)]
        setup: PathBuf,

        /// Device name
        device: String,

        /// Target value(s)
        #[arg(required = true, allow_negative_numbers = true)]
        targets: Vec<f64>,
    },

    /// Read value and status of a device
    Read {
        /// Setup file (TOML)
        #[arg(long)]
        setup: PathBuf,

        /// Device name
        device: String,
    },
}

impl Commands {
    fn setup_path(&self) -> &PathBuf {
        match self {
            Commands::Poller { setup, .. }
            | Commands::Move { setup, .. }
            | Commands::Read { setup, .. } => setup,
        }
    }
}

/// `RUST_LOG` wins; otherwise the setup's `log_level`.
fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let path = cli.command.setup_path().clone();
    let setup = SetupConfig::load(&path)
        .with_context(|| format!("cannot load setup {}", path.display()))?;
    init_tracing(&setup.log_level);

    match cli.command {
        Commands::Poller { group: Some(group), .. } => {
            commands::run_poller_group(setup, &group).await
        }
        Commands::Poller { group: None, .. } => commands::run_poller_master(setup, &path).await,
        Commands::Move {
            device, targets, ..
        } => {
            let registry = commands::build_registry(setup)?;
            commands::move_device(&registry, &device, &targets).await?;
            let reading = commands::read_device(&registry, &device).await?;
            println!("{}", reading);
            Ok(())
        }
        Commands::Read { device, .. } => {
            let registry = commands::build_registry(setup)?;
            let reading = commands::read_device(&registry, &device).await?;
            println!("{}", reading);
            Ok(())
        }
    }
}
