//! Todos - replay todo-list scripts and print derived list events.
//!
//! # Commands
//!
//! - `todos replay <SCRIPT>`: Run a JSON script file
//! - `todos demo`: Run the built-in walkthrough
//!
//! Each list event is written to stdout as one JSON line. Logs go to stderr.
//!
//! # Environment Variables
//!
//! See the engine's `config` module for available configuration options.

use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use todos_cli::{replay, Script};
use todos_engine::Config;

/// Replays scripts of list and task operations against an in-memory store
/// and prints every list add, update and delete as a JSON line.
#[derive(Parser, Debug)]
#[command(name = "todos")]
#[command(author, version, about, long_about = None)]
#[command(after_help = "\
ENVIRONMENT VARIABLES:
    TODOS_REGISTRY_COLLECTION  Registry collection name (default: userdata)
    TODOS_TXN_MAX_ATTEMPTS     Commit attempts per list write, 1-10 (default: 3)
    TODOS_TXN_RETRY_DELAY_MS   Initial retry delay in ms (default: 300)
    TODOS_EVENT_CAPACITY       Event broadcast capacity (default: 1000)
    RUST_LOG                   Log filter (default: info)

EXAMPLES:
    # Run the built-in walkthrough
    todos demo

    # Replay a script with JSON logs on stderr
    todos --json-logs replay scripts/demo.json
")]
struct Cli {
    /// Emit logs as JSON.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

/// CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Replay a JSON script file.
    Replay {
        /// Path to the script.
        script: PathBuf,
    },

    /// Replay the built-in demo script.
    Demo,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.json_logs);

    let script = match &cli.command {
        Command::Replay { script } => Script::load(script)?,
        Command::Demo => Script::demo()?,
    };
    let config = Config::from_env().context("Failed to load configuration")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    let stdout = io::stdout().lock();
    let summary = runtime.block_on(replay(&script, config, stdout))?;
    io::stdout().flush().context("Failed to flush stdout")?;

    info!(
        steps = summary.steps,
        events = summary.events,
        "Done"
    );
    Ok(())
}

/// Initializes the tracing subscriber on stderr.
fn init_logging(json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_layer = json.then(|| {
        fmt::layer()
            .json()
            .with_target(true)
            .with_level(true)
            .with_writer(io::stderr)
    });
    let plain_layer = (!json).then(|| {
        fmt::layer()
            .with_target(true)
            .with_level(true)
            .with_writer(io::stderr)
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(plain_layer)
        .init();
}
