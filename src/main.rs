#![deny(dead_code)]
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{debug, info, warn, LevelFilter};
use serde::Deserialize;
use serde_json::Value;
use std::fs;
use std::path::PathBuf;

mod utils;

use tripsync::channel::ServerEvent;
use tripsync::{RideSession, SyncConfig, SyncState, SyncUpdate};

/// Command line arguments for tripsync
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "tripsync: ride, location and chat state synchronizer.",
    long_about = "Replays recorded channel traffic through the same stores the client uses and \
    prints the state they converge to."
)]
struct Args {
    /// Config file; defaults to $TRIPSYNC_CONFIG or the user config directory
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Write logs to this file instead of stderr
    #[arg(long, value_name = "PATH", global = true)]
    log_file: Option<PathBuf>,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply a JSON-lines file of recorded server events and print the resulting state
    Replay {
        /// One `{"event": ..., "payload": ...}` object per line
        events: PathBuf,

        /// JSON array of rides to start from, as returned by the ride endpoints
        #[arg(long, value_name = "PATH")]
        rides: Option<PathBuf>,

        /// User id the state is viewed as
        #[arg(long)]
        viewer: Option<String>,
    },
}

#[derive(Deserialize)]
struct RecordedEvent {
    event: String,
    #[serde(default)]
    payload: Value,
}

fn replay(events: PathBuf, rides: Option<PathBuf>, viewer: Option<String>) -> Result<Value> {
    let mut state = SyncState::new(viewer);

    if let Some(path) = rides {
        let contents = fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))?;
        let snapshot: Vec<RideSession> =
            serde_json::from_str(&contents).with_context(|| format!("Invalid ride snapshot {}", path.display()))?;
        for ride in state.rides.merge_snapshot(snapshot) {
            state.locations.watch(&ride.id);
        }
    }

    let contents = fs::read_to_string(&events).with_context(|| format!("Failed to read {}", events.display()))?;
    let mut applied = 0usize;
    for (number, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let recorded: RecordedEvent =
            serde_json::from_str(line).with_context(|| format!("Line {} is not a recorded event", number + 1))?;
        let event = match ServerEvent::parse(&recorded.event, recorded.payload) {
            Ok(event) => event,
            Err(e) => {
                warn!("Skipping line {}: {}", number + 1, e);
                continue;
            }
        };
        for update in state.apply_server_event(event) {
            if let SyncUpdate::RideChanged(ride) = &update {
                state.locations.watch(&ride.id);
            }
            debug!("{:?}", update);
        }
        applied += 1;
    }
    info!("Replayed {} event(s) from {}", applied, events.display());

    Ok(state.snapshot())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { LevelFilter::Debug } else { LevelFilter::Info };
    let log_file = args.log_file.as_ref().and_then(|p| p.to_str());
    utils::setup_logging(log_file, level)?;

    let config = SyncConfig::load(args.config.as_deref())?;
    debug!("Using config {:?}", config);

    match args.command {
        Command::Replay { events, rides, viewer } => {
            let snapshot = replay(events, rides, viewer)?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
    }
    Ok(())
}
