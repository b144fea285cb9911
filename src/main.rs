// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/fleetsim

//! fleetsim - Industrial Device Fleet Simulator
//!
//! `fleetsim run` ticks every running device until Ctrl+C.
//! `fleetsim backfill <device>` writes a block of historical samples and exits.

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use fleetsim::config::RegistryKind;
use fleetsim::{Config, Engine, VERSION};

/// fleetsim - Industrial Device Fleet Simulator
#[derive(Parser, Debug)]
#[command(name = "fleetsim")]
#[command(version = VERSION)]
#[command(about = "Simulates industrial device fleets and streams their data to time-series, MQTT, Modbus and node-graph sinks")]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Enable trace-level logging
    #[arg(long)]
    trace: bool,

    /// Device registry file (JSON fleet file, or SQLite with --sqlite)
    #[arg(long)]
    registry: Option<PathBuf>,

    /// Treat --registry as a SQLite device database
    #[arg(long)]
    sqlite: bool,

    /// Seed for reproducible runs
    #[arg(long)]
    seed: Option<u64>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Tick the fleet until interrupted (default)
    Run {
        /// Tick interval in milliseconds
        #[arg(long)]
        interval_ms: Option<u64>,
    },
    /// Synthesize historical samples for one device
    Backfill {
        /// Device id
        device_id: String,

        /// Number of samples
        #[arg(short = 'n', long, default_value = "3600")]
        count: usize,

        /// Seconds between samples
        #[arg(long, default_value = "1")]
        step_secs: i64,

        /// First timestamp (RFC 3339); defaults to `count` steps before now
        #[arg(long)]
        start: Option<DateTime<Utc>>,
    },
}

fn init_logging(args: &Args, config: &Config) -> Result<()> {
    let level = if args.trace {
        "trace"
    } else if args.debug {
        "debug"
    } else {
        config.log_level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .with_file(args.debug)
        .with_line_number(args.debug)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Load or create configuration
    let config_path = args.config.clone().unwrap_or_else(Config::default_path);
    let mut config = Config::load_or_create(&config_path)?;

    // Override with command line args
    if let Some(path) = &args.registry {
        config.registry.path = path.clone();
        config.registry.kind = if args.sqlite { RegistryKind::Sqlite } else { RegistryKind::File };
    }
    if args.seed.is_some() {
        config.simulation.seed = args.seed;
    }
    if let Some(Command::Run { interval_ms: Some(interval) }) = &args.command {
        config.scheduler.interval_ms = *interval;
    }
    config.validate()?;

    init_logging(&args, &config)?;
    info!("fleetsim v{}", VERSION);
    info!("Configuration loaded from {:?}", config_path);

    match args.command {
        Some(Command::Backfill { device_id, count, step_secs, start }) => backfill(&config, &device_id, count, step_secs, start),
        Some(Command::Run { .. }) | None => run(&config),
    }
}

fn run(config: &Config) -> Result<()> {
    let (mut engine, _settings) = Engine::from_config(config)?;
    engine.start()?;
    info!("   Press Ctrl+C to shutdown");

    // Wait for shutdown signal
    let rt = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    rt.block_on(tokio::signal::ctrl_c())?;

    info!("Shutdown signal received, cleaning up...");
    engine.shutdown();
    info!("Final status: {}", serde_json::to_string(&engine.status())?);
    info!("fleetsim shutdown complete");
    Ok(())
}

fn backfill(config: &Config, device_id: &str, count: usize, step_secs: i64, start: Option<DateTime<Utc>>) -> Result<()> {
    anyhow::ensure!(step_secs > 0, "--step-secs must be positive");
    let step = Duration::try_seconds(step_secs).ok_or_else(|| anyhow!("--step-secs {} is too large", step_secs))?;
    let start = match start {
        Some(start) => start,
        None => i32::try_from(count)
            .ok()
            .and_then(|n| step.checked_mul(n))
            .and_then(|span| Utc::now().checked_sub_signed(span))
            .ok_or_else(|| anyhow!("{} sample(s) {} second(s) apart reach before the supported time range", count, step_secs))?,
    };

    let (mut engine, _settings) = Engine::from_config(config)?;
    let report = engine.backfill(device_id, start, step, count)?;
    engine.shutdown();

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
