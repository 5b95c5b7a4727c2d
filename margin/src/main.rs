//! margin: line-anchored annotations for plain-text files.
//!
//! Entry point for the `margin` binary. Wires the XDG config file (`config`),
//! logging, and the shared WAL-mode SQLite database (`margin-core`) to the
//! command handlers in `commands`.
//!
//! # Startup sequence
//!
//! 1. Parse arguments and install the `tracing` subscriber, so config
//!    problems are logged.
//! 2. Load `config.toml`; errors are soft and fall back to defaults.
//! 3. `create_dir_all` the database directory, then open the database.
//! 4. Run the requested command against an [`Engine`].

mod commands;
mod config;

use std::path::PathBuf;

use anyhow::Context;
use clap::{ArgAction, Parser};
use margin_core::{AnnotationStore, Engine};
use tracing_subscriber::EnvFilter;

use crate::commands::Command;

#[derive(Parser, Debug)]
#[command(
    name = "margin",
    version,
    about = "Line-anchored annotations that follow your edits",
    arg_required_else_help = true
)]
struct Cli {
    /// Annotation database (default: from config, else .margin/annotations.db).
    #[arg(long, global = true, value_name = "PATH")]
    database: Option<PathBuf>,

    /// Author for new annotations and replies (default: config, else $USER).
    #[arg(long, global = true)]
    author: Option<String>,

    /// Debug output (repeat for more).
    #[arg(short = 'v', long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "margin=info,margin_core=info",
        1 => "margin=debug,margin_core=debug",
        _ => "margin=trace,margin_core=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = config::load(&config::config_path());
    if cli.author.is_some() {
        config.author = cli.author;
    }

    let db_path = cli.database.unwrap_or_else(|| config.database());
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let db_str = db_path
        .to_str()
        .context("database path is not valid UTF-8")?;
    let store = AnnotationStore::open(db_str)
        .await
        .with_context(|| format!("opening {db_str}"))?;

    let engine = Engine::new(store, config.engine_config());
    commands::run(&engine, &config, cli.command).await
}
