use anyhow::{Context, Result};
use beaconpos::clock::{Clock, ManualClock, SystemClock};
use beaconpos::config::Config;
use beaconpos::distance::{estimate, format_distance, Proximity};
use beaconpos::engine::PositioningEngine;
use beaconpos::replay::ReplayScanner;
use beaconpos::scanner::StaticPermissions;
use clap::{Parser, Subcommand};
use log::{error, info, LevelFilter};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "beaconpos")]
#[command(author = "spikehead")]
#[command(version = "0.1.0")]
#[command(about = "Indoor positioning from proximity beacon signal strength")]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init,

    /// Estimate distance for a signal strength reading
    Estimate {
        /// Received signal strength (dBm)
        #[arg(long, allow_hyphen_values = true)]
        rssi: f64,

        /// Calibrated strength at 1 meter (overrides config)
        #[arg(long, allow_hyphen_values = true)]
        reference_power: Option<f64>,
    },

    /// Feed a JSON-lines capture through the positioning engine
    Replay {
        /// Capture file, one beacon event per line
        input: PathBuf,

        /// Honour the time gaps between events
        #[arg(long)]
        realtime: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp_millis()
        .init();

    // Handle init command before loading config
    if matches!(cli.command, Commands::Init) {
        return handle_init(&cli.config);
    }

    let config = if cli.config.exists() {
        Config::load(&cli.config).context("Failed to load config")?
    } else {
        info!("Config file not found, using defaults");
        Config::default()
    };

    match cli.command {
        Commands::Init => unreachable!(),
        Commands::Estimate {
            rssi,
            reference_power,
        } => handle_estimate(&config, rssi, reference_power),
        Commands::Replay { input, realtime } => handle_replay(config, input, realtime).await,
    }
}

fn handle_init(path: &Path) -> Result<()> {
    if path.exists() {
        anyhow::bail!("{:?} already exists, not overwriting", path);
    }
    Config::default().save(path)?;
    info!("Created {:?}", path);
    Ok(())
}

fn handle_estimate(config: &Config, rssi: f64, reference_power: Option<f64>) -> Result<()> {
    let reference = reference_power.unwrap_or(config.estimator.reference_power_dbm);
    let distance = estimate(rssi, reference);

    println!("RSSI:      {} dBm", rssi);
    println!("Reference: {} dBm @ 1m", reference);
    println!("Distance:  {}", format_distance(distance));
    println!("Proximity: {}", Proximity::from_distance(distance).label());
    Ok(())
}

async fn handle_replay(config: Config, input: PathBuf, realtime: bool) -> Result<()> {
    let scanner = Arc::new(ReplayScanner::new(&input, realtime));
    let clock = ManualClock::new(SystemClock.now_ms());

    let engine = PositioningEngine::with_clock(
        config,
        scanner.clone(),
        Arc::new(StaticPermissions::granted()),
        Arc::new(clock.clone()),
    );

    engine.subscribe(|update| {
        match update.anchor.anchor_record() {
            Some(record) => println!(
                "[{}] anchor {} ~{} ({} beacons in range)",
                update.published_at,
                record.identity,
                format_distance(record.latest_distance),
                update.beacons.len()
            ),
            None => println!("[{}] no beacon in range", update.published_at),
        }
        Ok(())
    });

    // Set up Ctrl+C handler
    let handler_engine = engine.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nReceived Ctrl+C, stopping replay...");
        if let Err(e) = handler_engine.stop() {
            eprintln!("Failed to stop engine: {}", e);
        }
    })?;

    engine.start().context("Failed to start positioning engine")?;

    let summary = match scanner.run(&engine, Some(&clock)).await {
        Ok(summary) => summary,
        Err(e) => {
            error!("Replay failed: {:#}", e);
            engine.destroy();
            return Err(e);
        }
    };

    println!();
    println!("Events:    {}", summary.events);
    println!("Applied:   {}", summary.applied);
    println!("Rejected:  {}", summary.rejected);
    println!("Published: {}", summary.published);
    match engine.current_anchor() {
        Some(record) => println!(
            "Final anchor: {} ~{}",
            record.identity,
            format_distance(record.latest_distance)
        ),
        None => println!("Final anchor: none"),
    }

    engine.destroy();
    Ok(())
}
