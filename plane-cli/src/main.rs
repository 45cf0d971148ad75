//! # shareplane
//!
//! CLI for running a shareplane device from a terminal.
//!
//! ## Commands
//!
//! - `init`: Write a default configuration file
//! - `serve`: Become Master and accept devices over TCP
//! - `join`: Join a Master as Slave
//! - `auto`: Negotiate the role from the configured candidates
//! - `project`: Show where a plane rectangle lands on this screen
//!
//! ## Example
//!
//! ```bash
//! # First device
//! shareplane serve --bind 0.0.0.0:7117
//!
//! # Second device
//! shareplane join 192.168.1.20:7117
//!
//! # Inside a session
//! > add card 900 100 200 120
//! > drag card 40 0
//! > show
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use plane_link::Config;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{auto, init, join, project, serve};

/// CLI for running a shareplane device.
#[derive(Parser, Debug)]
#[command(name = "shareplane")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file (default: shareplane.toml in the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Override the configured device id
    #[arg(long, global = true)]
    device_id: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Become Master and accept devices over TCP
    Serve {
        /// Listen address (overrides link.bind_address)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Join the Master at ADDRESS as Slave
    Join {
        /// Master address, e.g. 192.168.1.20:7117
        address: String,
    },

    /// Probe candidates and become Slave or Master automatically
    Auto {
        /// Extra candidate address (repeatable)
        #[arg(long = "candidate")]
        candidates: Vec<String>,

        /// Listen address if this device ends up Master
        #[arg(long)]
        bind: Option<String>,
    },

    /// Project a plane rectangle onto this device's screen
    #[command(allow_negative_numbers = true)]
    Project {
        /// Left edge of this device's viewport in VU
        #[arg(long, default_value = "0")]
        offset_x: f64,

        /// Viewport orientation
        #[arg(long, default_value = "normal")]
        orientation: String,

        /// Rectangle left edge in VU
        x: f64,
        /// Rectangle top edge in VU
        y: f64,
        /// Rectangle width in VU
        width: f64,
        /// Rectangle height in VU
        height: f64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let explicit = cli.config.is_some();
    let config_path = match cli.config {
        Some(path) => path,
        None => default_config_path()?,
    };
    let device_id = cli.device_id;
    let config = || load_config(&config_path, explicit, device_id.clone());

    match cli.command {
        Commands::Init { force } => init::run(&config_path, force)?,
        Commands::Serve { bind } => serve::run(&config()?, bind.as_deref()).await?,
        Commands::Join { address } => join::run(&config()?, &address).await?,
        Commands::Auto { candidates, bind } => {
            auto::run(&config()?, candidates, bind.as_deref()).await?
        }
        Commands::Project {
            offset_x,
            orientation,
            x,
            y,
            width,
            height,
        } => project::run(&config()?, offset_x, &orientation, [x, y, width, height])?,
    }

    Ok(())
}

/// Load the config file and apply overrides. A missing file at the default
/// location means defaults; a missing explicit file is an error.
fn load_config(path: &Path, explicit: bool, device_id: Option<String>) -> Result<Config> {
    let mut config = if !explicit && !path.exists() {
        tracing::debug!(path = %path.display(), "no config file, using defaults");
        Config::default()
    } else {
        Config::from_file(path).with_context(|| format!("loading {}", path.display()))?
    };
    if device_id.is_some() {
        config.node.device_id = device_id;
    }
    Ok(config)
}

/// Get the default config file path for shareplane.
fn default_config_path() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("io", "shareplane", "shareplane")
        .context("Could not determine home directory")?;
    Ok(dirs.config_dir().join("shareplane.toml"))
}
