#![warn(missing_docs)]
//! Stand-alone host for the sync driver: prints every metadata command as a
//! JSON line on stdout until interrupted.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::Value;
use sgfs_sync::{driver_init, Command, Role};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "sgfs-sync", about = "Filesystem gateway sync driver")]
struct Args {
    /// Driver configuration (JSON mapping)
    #[arg(long, env = "SGFS_CONFIG")]
    config: PathBuf,

    /// Secrets merged into the backend plugin configuration (JSON mapping)
    #[arg(long, env = "SGFS_SECRETS")]
    secrets: Option<PathBuf>,

    /// Process role: discover or read-only
    #[arg(long, default_value = "discover")]
    role: String,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,
}

fn load_json(path: &Path) -> Result<Value> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn print_command(command: &Command) -> std::io::Result<()> {
    let line = serde_json::to_string(command)?;
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", line)?;
    stdout.flush()
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(args.json.then(|| fmt::layer().json().with_writer(std::io::stderr)))
        .with((!args.json).then(|| fmt::layer().with_writer(std::io::stderr)))
        .with(EnvFilter::from_default_env())
        .init();

    tracing::info!("sgfs-sync starting...");

    let role: Role = args.role.parse()?;
    let config = load_json(&args.config)?;
    let secrets = args.secrets.as_deref().map(load_json).transpose()?;

    let Some(driver) = driver_init(config, secrets, role) else {
        eprintln!("cannot init driver");
        std::process::exit(1);
    };
    let driver = Arc::new(driver);

    let pump_driver = driver.clone();
    let pump = tokio::task::spawn_blocking(move || {
        let mut forwarded = 0u64;
        while pump_driver.next_command(print_command) {
            forwarded += 1;
        }
        forwarded
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Interrupted, shutting down");
    driver.shutdown();

    let handled = pump.await?;
    tracing::info!("Pump stopped after {} commands", handled);
    Ok(())
}
