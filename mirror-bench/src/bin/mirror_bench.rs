//! Mirror bench CLI: measure, align and process telescope mirror figure.
//!
//! Subcommands:
//! - `measure`: Align, then save averaged measurements into a session folder
//! - `align`: Run a fixed number of alignment steps
//! - `hold`: Keep the mirror aligned for a while
//! - `process`: Register a session and report it under each removal preset
//! - `history`: Compare the latest sessions across dates
//! - `config`: Show or initialise the mirror catalog

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use hardware::interferometer::{
    MeasurementClient, WebService4D, DEFAULT_BASE_URL, DEFAULT_OUTPUT_DIR, DEFAULT_TIMEOUT,
};
use hardware::newport::SerialSmc100;
use mirror_bench::processing::{
    history_deltas, list_dates, load_history, process_session, ProcessingOptions,
};
use mirror_bench::session::{
    resolve_session_path, MeasurementPlan, SessionOrchestrator, SessionSelection,
};
use shared::mirror_config::{ConfigStorage, MirrorCatalog, MirrorConfig};
use shared::modal::AnnulusBounds;
use shared::surface_file::{save_surface_map, SURFACE_EXTENSION};
use shared::zernike::UNCORRECTED;
use tracing::info;

#[cfg(windows)]
const DEFAULT_STAGE_PORT: &str = "COM3";
#[cfg(not(windows))]
const DEFAULT_STAGE_PORT: &str = "/dev/ttyUSB0";

/// Folder inside a session where processed surfaces are written.
const PROCESSED_DIR: &str = "processed";

/// Interferometric mirror measurement bench
#[derive(Parser, Debug)]
#[command(name = "mirror_bench")]
#[command(about = "Measure, align and process telescope mirror figure")]
#[command(version)]
struct Args {
    /// Config directory holding mirrors.json (default: ~/.mirror_config)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

/// Connection to the interferometer service and the stage.
#[derive(ClapArgs, Debug)]
struct BenchArgs {
    /// Base URL of the 4D WebService
    #[arg(long, default_value = DEFAULT_BASE_URL)]
    service_url: String,

    /// Timeout of one service call in seconds; 0 waits indefinitely
    #[arg(long, default_value_t = DEFAULT_TIMEOUT.as_secs())]
    service_timeout: u64,

    /// Folder where the service writes coefficient files
    #[arg(long, default_value = DEFAULT_OUTPUT_DIR)]
    output_dir: PathBuf,

    /// Serial port of the SMC100 stage bus
    #[arg(long, default_value = DEFAULT_STAGE_PORT)]
    stage_port: String,

    /// Frames averaged per measurement or alignment step
    #[arg(long, default_value = "20")]
    num_avg: u32,

    /// Alignment loop gain
    #[arg(long, default_value = "1.0")]
    gain: f64,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Align, then save averaged measurements into a new session folder
    Measure {
        /// Mirror id
        #[arg(short, long)]
        mirror: String,

        /// Session folder name (default: next integer under today's date)
        #[arg(long)]
        folder: Option<String>,

        /// Number of averaged measurements to save
        #[arg(short = 'n', long, default_value = "5")]
        measurements: usize,

        /// Alignment steps before measuring (0 skips alignment)
        #[arg(short, long, default_value = "3")]
        iterations: usize,

        /// Process the session after measuring
        #[arg(long)]
        process: bool,

        #[command(flatten)]
        bench: BenchArgs,
    },

    /// Run a fixed number of alignment steps
    Align {
        #[arg(short, long, default_value = "3")]
        iterations: usize,

        #[command(flatten)]
        bench: BenchArgs,
    },

    /// Keep the mirror aligned for a duration
    Hold {
        /// Duration in seconds
        #[arg(short, long)]
        seconds: u64,

        #[command(flatten)]
        bench: BenchArgs,
    },

    /// Register a session and report it under each removal preset
    Process {
        /// Mirror id
        #[arg(short, long)]
        mirror: String,

        /// Date folder index (negative counts from the latest)
        #[arg(long, default_value = "-1", allow_hyphen_values = true)]
        date_index: isize,

        /// Instance folder index (negative counts from the latest)
        #[arg(long, default_value = "-1", allow_hyphen_values = true)]
        instance_index: isize,

        /// Crop reported surfaces to the 3 in .. 15 in annulus
        #[arg(long)]
        crop: bool,
    },

    /// Difference the surfaces of the most recent dates
    History {
        /// Mirror id
        #[arg(short, long)]
        mirror: String,

        /// Number of most recent dates to compare
        #[arg(short, long, default_value = "2")]
        dates: usize,

        /// Instance folder index within each date
        #[arg(long, default_value = "0", allow_hyphen_values = true)]
        instance_index: isize,

        /// Folder for the delta surfaces (default: <mirror>/history)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show the mirror catalog, or write the defaults if none exists
    Config {
        /// Write the default catalog to the config directory
        #[arg(long)]
        init: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let storage = match &args.config_dir {
        Some(dir) => ConfigStorage::with_path(dir.clone()),
        None => ConfigStorage::new()?,
    };
    let catalog = storage.catalog().context("Failed to load mirror catalog")?;

    match args.command {
        Command::Measure {
            mirror,
            folder,
            measurements,
            iterations,
            process,
            bench,
        } => cmd_measure(&catalog, &mirror, folder, measurements, iterations, process, &bench),
        Command::Align { iterations, bench } => cmd_align(iterations, &bench),
        Command::Hold { seconds, bench } => cmd_hold(seconds, &bench),
        Command::Process {
            mirror,
            date_index,
            instance_index,
            crop,
        } => {
            let config = catalog.mirror(&mirror);
            let selection = SessionSelection::Existing {
                date_index,
                instance_index,
            };
            let session = resolve_session_path(&config.storage_path, &selection)?;
            cmd_process(&config, &session, crop)
        }
        Command::History {
            mirror,
            dates,
            instance_index,
            output,
        } => cmd_history(&catalog, &mirror, dates, instance_index, output),
        Command::Config { init } => cmd_config(&storage, &catalog, init),
    }
}

fn open_bench(bench: &BenchArgs) -> Result<SessionOrchestrator<WebService4D, SerialSmc100>> {
    info!("Connecting to measurement service at {}", bench.service_url);
    let timeout = (bench.service_timeout > 0).then(|| Duration::from_secs(bench.service_timeout));
    let transport = WebService4D::with_timeout(&bench.service_url, timeout);
    let client = MeasurementClient::new(transport).with_output_dir(&bench.output_dir);

    info!("Opening SMC100 bus on {}", bench.stage_port);
    let stage = SerialSmc100::open(&bench.stage_port)?;

    Ok(SessionOrchestrator::new(client, stage))
}

fn cmd_measure(
    catalog: &MirrorCatalog,
    mirror: &str,
    folder: Option<String>,
    measurements: usize,
    iterations: usize,
    process: bool,
    bench: &BenchArgs,
) -> Result<()> {
    let config = catalog.mirror(mirror);
    let session = resolve_session_path(&config.storage_path, &SessionSelection::New { folder })?;

    let plan = MeasurementPlan {
        number_measurements: measurements,
        num_avg: bench.num_avg,
        alignment_iterations: iterations,
        gain: bench.gain,
    };

    let mut orchestrator = open_bench(bench)?;
    let report = orchestrator.run(&session, &plan)?;

    info!(
        "Saved {} of {} measurements in {}",
        report.saved.len(),
        measurements,
        report.session_path.display()
    );
    for failure in &report.failures {
        info!("Measurement {} failed: {}", failure.index, failure.message);
    }

    if process {
        cmd_process(&config, &session, false)?;
    }
    Ok(())
}

fn cmd_align(iterations: usize, bench: &BenchArgs) -> Result<()> {
    let mut orchestrator = open_bench(bench)?;
    let report = orchestrator.align(iterations, bench.num_avg, bench.gain)?;
    info!(
        "Alignment done: {} steps, {} corrections, {} missed",
        report.steps,
        report.corrections.len(),
        report.missed
    );
    Ok(())
}

fn cmd_hold(seconds: u64, bench: &BenchArgs) -> Result<()> {
    let mut orchestrator = open_bench(bench)?;
    let report = orchestrator.hold(Duration::from_secs(seconds), bench.num_avg, bench.gain)?;
    info!(
        "Held alignment for {} s: {} steps, {} missed",
        seconds, report.steps, report.missed
    );
    Ok(())
}

fn surface_file_name(name: &str) -> String {
    format!("{}.{}", name.replace(' ', "_"), SURFACE_EXTENSION)
}

fn cmd_process(config: &MirrorConfig, session: &Path, crop: bool) -> Result<()> {
    let options = ProcessingOptions {
        crop: crop.then(AnnulusBounds::default),
        ..ProcessingOptions::default()
    };
    let analysis = process_session(session, config, &options)
        .with_context(|| format!("Failed to process {}", session.display()))?;

    let out_dir = session.join(PROCESSED_DIR);
    std::fs::create_dir_all(&out_dir)?;

    let registered = analysis.registered.surface().heights();
    save_surface_map(registered, out_dir.join(surface_file_name("registered")))?;
    for preset in &analysis.presets {
        let path = out_dir.join(surface_file_name(preset.preset.name));
        save_surface_map(preset.surface.heights(), path)?;
        match &preset.stats {
            Some(stats) => info!(
                "M{} ({}): rms {:.4}, p-v {:.4}",
                config.mirror_id, preset.preset.name, stats.rms, stats.peak_to_valley
            ),
            None => info!("M{} ({}): no valid pixels", config.mirror_id, preset.preset.name),
        }
    }

    let summary_path = out_dir.join("summary.json");
    std::fs::write(&summary_path, serde_json::to_string_pretty(&analysis.summary())?)?;
    info!("Wrote results to {}", out_dir.display());
    Ok(())
}

fn cmd_history(
    catalog: &MirrorCatalog,
    mirror: &str,
    count: usize,
    instance_index: isize,
    output: Option<PathBuf>,
) -> Result<()> {
    let config = catalog.mirror(mirror);
    let dates = list_dates(&config.storage_path)?;
    if dates.len() < 2 || count < 2 {
        bail!("Need at least two dates to compare, found {}", dates.len());
    }
    let recent = &dates[dates.len().saturating_sub(count)..];
    info!("Comparing M{} over {:?}", mirror, recent);

    let entries = load_history(
        &config.storage_path,
        recent,
        instance_index,
        &config,
        UNCORRECTED.modes,
        &ProcessingOptions::default(),
    )?;
    let deltas = history_deltas(&entries)?;

    let out_dir = output.unwrap_or_else(|| config.storage_path.join("history"));
    std::fs::create_dir_all(&out_dir)?;
    for delta in &deltas {
        let name = delta.label.trim_matches(|c| c == '(' || c == ')').replace(" - ", "_minus_");
        save_surface_map(delta.surface.heights(), out_dir.join(surface_file_name(&name)))?;
        match delta.surface.stats() {
            Some(stats) => info!(
                "{}: rms {:.4}, p-v {:.4}",
                delta.label, stats.rms, stats.peak_to_valley
            ),
            None => info!("{}: no overlapping pixels", delta.label),
        }
    }
    Ok(())
}

fn cmd_config(storage: &ConfigStorage, catalog: &MirrorCatalog, init: bool) -> Result<()> {
    if init {
        let path = storage.save_catalog(catalog)?;
        info!("Wrote mirror catalog to {}", path.display());
    }
    println!("{}", serde_json::to_string_pretty(catalog)?);
    Ok(())
}
