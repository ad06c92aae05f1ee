//! CLI entry point for stowage.
//!
//! The `stowage` binary opens the container described by a TOML config
//! file and reads or edits the objects stored in it.

mod commands;
mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use stowage_store::{ColumnPredicate, HookedContainer, Predicate, StorageContainer};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::CliConfig;

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// stowage: inspect and edit objects in a storage container.
#[derive(Parser)]
#[command(
    name = "stowage",
    version,
    about = "Inspect and edit objects in a stowage container",
    long_about = "Opens the flat-file or relational container named in the config file \
                  and reads, writes, or lists the objects stored in it. Output is JSON."
)]
struct Cli {
    /// Config file with a `[container]` table and optional `[settings]`.
    #[arg(short, long, global = true, default_value = "stowage.toml")]
    config: PathBuf,

    /// Default log level; `RUST_LOG` takes precedence.
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Log line format on stderr.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Compact)]
    log_format: LogFormat,

    /// Refuse every store and delete.
    #[arg(long, global = true)]
    read_only: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    /// One human-readable line per event
    Compact,
    /// One JSON object per event
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the object stored under KEY.
    Get { key: String },

    /// Store a JSON object under KEY, replacing what was there.
    Put { key: String, json: String },

    /// Delete the object under KEY.
    Delete { key: String },

    /// List every stored key.
    Keys,

    /// Print every stored object, optionally filtered.
    Dump {
        /// Filter such as `age>=18` or `address.city=Oslo`. Repeatable; all must hold.
        #[arg(long = "where", value_name = "PATH=VALUE", value_parser = commands::parse_filter)]
        filters: Vec<ColumnPredicate>,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_format);

    let config = CliConfig::load(&cli.config)?;
    let mut container = config
        .container
        .open(&config.settings)
        .await
        .context("failed to open container")?;
    if cli.read_only {
        container = Arc::new(HookedContainer::new(
            container,
            Arc::new(commands::read_only_hooks()),
        ));
    }
    info!(config = %cli.config.display(), backend = container.backend(), "container ready");

    run(cli.command, container.as_ref()).await
}

async fn run(command: Commands, container: &dyn StorageContainer) -> Result<()> {
    match command {
        Commands::Get { key } => print_json(&commands::get(container, &key).await?),
        Commands::Put { key, json } => commands::put(container, &key, &json).await,
        Commands::Delete { key } => commands::delete(container, &key).await,
        Commands::Keys => {
            for key in commands::keys(container).await? {
                println!("{key}");
            }
            Ok(())
        }
        Commands::Dump { filters } => {
            let predicate = filters.into_iter().fold(Predicate::all(), Predicate::and);
            print_json(&commands::dump(container, &predicate).await?)
        }
    }
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Initialize the tracing subscriber with an env-filter.
fn init_tracing(default_level: &str, format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Json => builder.json().init(),
    }
}

// ── tests ────────────────────────────────────────────────────────────
