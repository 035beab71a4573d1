//! CLI tool for the SMC100 alignment stage.
//!
//! Subcommands:
//! - `move`: Relative or absolute move on one channel
//! - `query`: Position and state of every channel
//! - `home`: Home search on one or all channels
//! - `stop`: Stop motion on all channels

use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use hardware::newport::Smc100;
use hardware::StageChannel;
use tracing::info;

#[cfg(windows)]
const DEFAULT_PORT: &str = "COM3";
#[cfg(not(windows))]
const DEFAULT_PORT: &str = "/dev/ttyUSB0";

/// Newport SMC100 Stage Control Tool
#[derive(Parser, Debug)]
#[command(name = "stage_tool")]
#[command(about = "Control tool for the tip/tilt/power alignment stage")]
#[command(version)]
struct Args {
    /// Serial port of the SMC100 bus
    #[arg(long, global = true, default_value = DEFAULT_PORT)]
    port: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Move one channel
    Move {
        /// Channel address (1 = tilt, 2 = tip, 3 = power)
        #[arg(short, long)]
        channel: u8,

        /// Relative distance to move
        #[arg(short, long, conflicts_with = "position")]
        relative: Option<f64>,

        /// Absolute position to move to
        #[arg(short, long)]
        position: Option<f64>,

        /// Timeout in seconds for motion to complete
        #[arg(short, long, default_value = "10")]
        timeout: u64,

        /// Don't wait for motion to complete
        #[arg(long)]
        no_wait: bool,
    },

    /// Query position and state of all channels
    Query,

    /// Run the home search
    Home {
        /// Channel address; all channels if omitted
        #[arg(short, long)]
        channel: Option<u8>,
    },

    /// Stop motion on all channels
    Stop,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    info!("Opening SMC100 bus on {}...", args.port);
    let mut stage = Smc100::open(&args.port)?;

    match args.command {
        Command::Move {
            channel,
            relative,
            position,
            timeout,
            no_wait,
        } => cmd_move(&mut stage, channel, relative, position, timeout, no_wait),
        Command::Query => cmd_query(&mut stage),
        Command::Home { channel } => cmd_home(&mut stage, channel),
        Command::Stop => cmd_stop(&mut stage),
    }
}

fn parse_channel(address: u8) -> Result<StageChannel> {
    match StageChannel::from_address(address) {
        Some(channel) => Ok(channel),
        None => bail!("Unknown channel {address}; expected 1 (tilt), 2 (tip) or 3 (power)"),
    }
}

fn cmd_move<T: std::io::Read + std::io::Write>(
    stage: &mut Smc100<T>,
    channel: u8,
    relative: Option<f64>,
    position: Option<f64>,
    timeout: u64,
    no_wait: bool,
) -> Result<()> {
    let channel = parse_channel(channel)?;
    let address = channel.address();

    match (relative, position) {
        (Some(delta), None) => {
            info!("Moving {} by {:+.6}", channel, delta);
            stage.move_relative(address, delta)?;
        }
        (None, Some(target)) => {
            info!("Moving {} to {:.6}", channel, target);
            stage.move_absolute(address, target)?;
        }
        _ => bail!("Specify exactly one of --relative or --position"),
    }

    if !no_wait {
        stage.wait_ready(address, Duration::from_secs(timeout))?;
    }
    info!("{} at {:.6}", channel, stage.position(address)?);
    Ok(())
}

fn cmd_query<T: std::io::Read + std::io::Write>(stage: &mut Smc100<T>) -> Result<()> {
    for channel in StageChannel::ALL {
        let address = channel.address();
        let position = stage.position(address)?;
        let state = stage.state(address)?;
        info!("{}: position={:.6}, state={:?}", channel, position, state);
    }
    Ok(())
}

fn cmd_home<T: std::io::Read + std::io::Write>(
    stage: &mut Smc100<T>,
    channel: Option<u8>,
) -> Result<()> {
    let channels = match channel {
        Some(address) => vec![parse_channel(address)?],
        None => StageChannel::ALL.to_vec(),
    };

    for channel in channels {
        info!("Homing {}", channel);
        stage.home(channel.address())?;
        stage.wait_ready(channel.address(), Duration::from_secs(60))?;
    }
    Ok(())
}

fn cmd_stop<T: std::io::Read + std::io::Write>(stage: &mut Smc100<T>) -> Result<()> {
    for channel in StageChannel::ALL {
        stage.stop(channel.address())?;
    }
    info!("Stopped all channels");
    Ok(())
}
