//! CLI Entry Point for daq-stream
//!
//! Provides command-line access to:
//! - Timed captures written to CSV (`collect`)
//! - Maximum sustainable scan rate search (`probe`)
//! - Handle information and declared capabilities (`info`)
//!
//! Settings come from library defaults, an optional TOML file (`--config`),
//! and `DAQ_STREAM_*` environment variables, in that order; command-line
//! flags override all three.
//!
//! # Usage
//!
//! ```bash
//! daq-stream collect --channels A0,A1 --rate 100 --seconds 2 -o capture.csv
//! daq-stream probe --channels AIN0,AIN1 --trial-reads 4
//! daq-stream info
//! ```

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use daq_core::limits::{DEFAULT_SUBSCRIBER_CAPACITY, SHUTDOWN_TIMEOUT};
use daq_core::{DeviceModel, VendorDriver};
use daq_driver_mock::{MockMode, SimulatedDriver};
use daq_stream::{
    export_csv, probe_max_scan_rate, AcquisitionSettings, Device, ProbeOptions, RowSelection,
    SessionState, StopCondition, StreamCoordinator,
};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "daq-stream")]
#[command(about = "Stream analog inputs from a data-acquisition device", long_about = None)]
struct Cli {
    /// Settings file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Pacing of the simulated device (instant, realistic, chaos)
    #[arg(long, global = true, default_value = "realistic")]
    mode: MockMode,

    /// Aggregate samples/s the simulated link sustains before backlog builds
    #[arg(long, global = true)]
    sustainable_rate: Option<f64>,

    #[command(subcommand)]
    command: Commands,
}

/// Stream parameters shared by `collect` and `probe`.
#[derive(clap::Args)]
struct StreamArgs {
    /// Channel names, comma separated
    #[arg(long, value_delimiter = ',')]
    channels: Vec<String>,

    /// ±volts for every channel
    #[arg(long)]
    range: Option<f64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream for a fixed time and write the capture as CSV
    Collect {
        #[command(flatten)]
        stream: StreamArgs,

        /// Scans per second
        #[arg(long)]
        rate: Option<f64>,

        /// Capture length; runs until Ctrl-C when neither this nor the
        /// settings file bounds the stream
        #[arg(long)]
        seconds: Option<f64>,

        /// Output file
        #[arg(short, long, default_value = "capture.csv")]
        output: PathBuf,

        /// Keep only the newest N rows
        #[arg(long)]
        last: Option<usize>,
    },

    /// Search for the highest scan rate the device sustains
    Probe {
        #[command(flatten)]
        stream: StreamArgs,

        /// Seconds each trial streams
        #[arg(long, default_value = "2.0")]
        trial_seconds: f64,

        /// End each trial after N reads instead of after --trial-seconds
        #[arg(long)]
        trial_reads: Option<u32>,

        /// Backlog in scans tolerated per trial
        #[arg(long, default_value = "0")]
        max_backlog: u32,
    },

    /// Print handle information and declared capabilities
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings =
        AcquisitionSettings::load(cli.config.as_deref()).context("Failed to load settings")?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_level.as_str()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let driver = simulated_driver(&cli, &settings);

    match cli.command {
        Commands::Collect {
            stream,
            rate,
            seconds,
            output,
            last,
        } => {
            stream.apply(&mut settings);
            if let Some(rate) = rate {
                settings.stream.scan_rate = rate;
            }
            if let Some(seconds) = seconds {
                if !(seconds.is_finite() && seconds > 0.0) {
                    bail!("--seconds must be a positive number, got {}", seconds);
                }
                settings.stream.duration_ms = Some((seconds * 1000.0).ceil() as u64);
                settings.stream.scans = None;
            }
            settings.validate()?;
            collect(driver, &settings, output, last).await
        }
        Commands::Probe {
            stream,
            trial_seconds,
            trial_reads,
            max_backlog,
        } => {
            stream.apply(&mut settings);
            settings.validate()?;
            if !(trial_seconds.is_finite() && trial_seconds > 0.0) {
                bail!("--trial-seconds must be a positive number, got {}", trial_seconds);
            }
            let options = ProbeOptions {
                trial_duration: Duration::from_secs_f64(trial_seconds),
                trial_reads,
                max_backlog,
                read_timeout: settings.coordinator_options().read_timeout,
                ..ProbeOptions::default()
            };
            probe(driver, &settings, options)
        }
        Commands::Info => info_command(driver, &settings),
    }
}

impl StreamArgs {
    fn apply(self, settings: &mut AcquisitionSettings) {
        if !self.channels.is_empty() {
            settings.stream.channels = self.channels;
            settings.stream.ranges = None;
        }
        if let Some(range) = self.range {
            settings.stream.range = range;
            settings.stream.ranges = None;
        }
    }
}

fn simulated_driver(cli: &Cli, settings: &AcquisitionSettings) -> Arc<dyn VendorDriver> {
    let mut builder = SimulatedDriver::builder().mode(cli.mode);
    if settings.device.model != DeviceModel::Any {
        builder = builder.model(settings.device.model);
    }
    if let Some(rate) = cli.sustainable_rate {
        builder = builder.sustainable_rate(rate);
    }
    Arc::new(builder.build())
}

fn open_device(driver: Arc<dyn VendorDriver>, settings: &AcquisitionSettings) -> Result<Device> {
    let device = settings.device.clone();
    Device::open(driver, device.model, device.connection, &device.identifier).with_context(|| {
        format!(
            "Failed to open {} device over {} ({})",
            device.model, device.connection, device.identifier
        )
    })
}

async fn collect(
    driver: Arc<dyn VendorDriver>,
    settings: &AcquisitionSettings,
    output: PathBuf,
    last: Option<usize>,
) -> Result<()> {
    let device = open_device(driver, settings)?;
    let coordinator = Arc::new(StreamCoordinator::new(
        device,
        settings.coordinator_options(),
    )?);

    let config = settings.to_stream_config()?;
    if config.stop_condition() == StopCondition::Continuous {
        println!("Streaming until Ctrl-C");
    }
    coordinator.configure(config)?;

    let mut progress = coordinator.subscribe("progress", DEFAULT_SUBSCRIBER_CAPACITY)?;
    let reporter = tokio::spawn(async move {
        let mut blocks = 0u64;
        while let Some(block) = progress.recv().await {
            blocks += 1;
            if blocks % 1000 == 0 {
                info!(blocks, sequence = block.sequence(), "Collecting");
            }
        }
        blocks
    });

    coordinator.start()?;

    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let state = loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                warn!("Interrupted, stopping stream");
                let stopping = Arc::clone(&coordinator);
                let state = tokio::task::spawn_blocking(move || {
                    stopping.stop()?;
                    Ok::<_, daq_stream::StreamError>(stopping.wait(SHUTDOWN_TIMEOUT))
                })
                .await??;
                break state;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {
                let state = coordinator.state();
                if state.is_terminal() {
                    break state;
                }
            }
        }
    };

    let delivered = reporter.await?;
    let status = coordinator.status();
    if state == SessionState::Faulted {
        bail!(
            "Stream faulted after {} blocks: {}",
            status.blocks_produced,
            status.last_error.unwrap_or_default()
        );
    }

    let table = match last {
        Some(n) => coordinator.view(RowSelection::Last(n))?,
        None => coordinator.to_labeled_table(),
    };
    export_csv(&table, &output)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    println!(
        "Captured {} scans of {} channels at {:.1} Hz ({} dropped, {} skipped samples, {} streamed to progress)",
        status.blocks_produced,
        coordinator.config().map_or(0, |c| c.channels().len()),
        status.actual_scan_rate.unwrap_or_default(),
        status.dropped_blocks,
        status.skipped_samples,
        delivered,
    );
    println!("Wrote {} rows to {}", table.n_rows(), output.display());

    coordinator.close()?;
    Ok(())
}

fn probe(
    driver: Arc<dyn VendorDriver>,
    settings: &AcquisitionSettings,
    mut options: ProbeOptions,
) -> Result<()> {
    let device = open_device(driver, settings)?;
    let config = settings.to_stream_config()?;
    options.settings = *config.settings();

    let result = probe_max_scan_rate(&device, config.channels(), &options)
        .context("Probe did not find a sustainable rate")?;

    println!(
        "{:<6} {:>14} {:>10} {:>16} {:>15} {:>6}",
        "Result", "Scan Rate (Hz)", "Scans/Read", "Device Backlog", "Driver Backlog", "Skips"
    );
    for trial in &result.trials {
        println!(
            "{:<6} {:>14.0} {:>10} {:>16} {:>15} {:>6}",
            if trial.passed { "PASS" } else { "FAIL" },
            trial.scan_rate,
            trial.scans_per_read,
            trial.peak_device_backlog,
            trial.peak_driver_backlog,
            trial.skipped_samples,
        );
    }
    println!(
        "Maximum sustainable rate: {:.0} Hz at {} scans per read",
        result.scan_rate, result.scans_per_read
    );
    Ok(())
}

fn info_command(driver: Arc<dyn VendorDriver>, settings: &AcquisitionSettings) -> Result<()> {
    let device = open_device(driver, settings)?;
    let capabilities = device.capabilities();

    println!("Driver:      {}", device.driver_name());
    println!("Device:      {}", device.info());
    println!("Channels:    {}", capabilities.channels.join(", "));
    println!("Ranges (±V): {:?}", capabilities.ranges);
    println!(
        "Max rate:    {} samples/s aggregate",
        capabilities.max_scan_rate
    );
    for resolution in &capabilities.resolutions {
        println!(
            "Resolution {:>2}: {:>4.1} bits, {:>6.2} uV noise, {:>6.2} ms/sample",
            resolution.index,
            resolution.effective_bits,
            resolution.noise_microvolts,
            resolution.sample_time_ms
        );
    }
    Ok(())
}
