//! Maximum sustainable scan rate search.
//!
//! Runs short trial streams at increasing rates. A trial passes when neither
//! the device nor the driver accumulates backlog beyond the tolerance and no
//! sample carries the skipped marker.
//!
//! ```text
//! exponential phase    pass: min = rate, max = 2 * rate, rate *= 1.5
//! bisection phase      pass: min = rate, rate = (rate + max) / 2
//!                      fail: max = rate, rate = (min + rate) / 2
//! either phase         fail with scans_per_read < rate: double
//!                      scans_per_read and retry the same rate
//! ```
//!
//! The search ends when the integer rate meets either bound. The result is
//! the last passing rate rounded down to a multiple of 100 Hz.

use std::time::{Duration, Instant};

use daq_core::limits::{is_skipped_sample, DEFAULT_READ_TIMEOUT};
use daq_core::{ChannelConfig, StreamRequest, StreamSettings};
use tracing::{debug, info, warn};

use crate::device::Device;
use crate::error::{ErrorContext, Result, StreamError};
use crate::session::StreamConfig;

/// Search parameters for [`probe_max_scan_rate`].
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOptions {
    /// First rate tried, in Hz
    pub start_rate: f64,
    /// How long each trial streams
    pub trial_duration: Duration,
    /// End each trial after this many reads instead of after `trial_duration`
    pub trial_reads: Option<u32>,
    /// Backlog (in scans) tolerated on either side
    pub max_backlog: u32,
    /// Upper bound on trial streams
    pub max_trials: usize,
    /// Resolution and settling applied to every trial
    pub settings: StreamSettings,
    /// Timeout for each read
    pub read_timeout: Duration,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            start_rate: 100.0,
            trial_duration: Duration::from_secs(2),
            trial_reads: None,
            max_backlog: 0,
            max_trials: 256,
            settings: StreamSettings::default(),
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

/// Outcome of one trial stream.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeTrial {
    /// Rate requested, in Hz
    pub scan_rate: f64,
    /// Scans per read requested
    pub scans_per_read: usize,
    /// Rate the driver actually ran, if the stream started
    pub actual_scan_rate: Option<f64>,
    /// No failure, skips, or backlog beyond the limit
    pub passed: bool,
    /// Scans read before the trial ended
    pub scans_read: u64,
    /// Values carrying the skipped-sample marker
    pub skipped_samples: u64,
    /// Highest device-side backlog, in scans
    pub peak_device_backlog: u32,
    /// Highest driver-side backlog, in scans
    pub peak_driver_backlog: u32,
    /// Why the trial stopped early, if it did
    pub failure: Option<String>,
    rejected: bool,
}

impl ProbeTrial {
    fn new(scan_rate: f64, scans_per_read: usize) -> Self {
        Self {
            scan_rate,
            scans_per_read,
            actual_scan_rate: None,
            passed: false,
            scans_read: 0,
            skipped_samples: 0,
            peak_device_backlog: 0,
            peak_driver_backlog: 0,
            failure: None,
            rejected: false,
        }
    }

    fn overloaded(&self, max_backlog: u32) -> bool {
        self.peak_device_backlog > max_backlog
            || self.peak_driver_backlog > max_backlog
            || self.skipped_samples > 0
    }
}

/// Outcome of a rate search.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    /// Highest passing rate, rounded down to a multiple of 100 Hz
    pub scan_rate: f64,
    /// Scans per read used at that rate
    pub scans_per_read: usize,
    /// Every trial, in order
    pub trials: Vec<ProbeTrial>,
}

/// Search for the highest scan rate `device` sustains on `channels`.
///
/// The device must not be owned by a stream coordinator; it is claimed for
/// the duration of the search.
pub fn probe_max_scan_rate(
    device: &Device,
    channels: &[ChannelConfig],
    options: &ProbeOptions,
) -> Result<ProbeResult> {
    let config = channels
        .iter()
        .fold(StreamConfig::builder(), |builder, channel| {
            builder.channel(channel.clone())
        })
        .scan_rate(options.start_rate)
        .settling_us(options.settings.settling_us)
        .resolution_index(options.settings.resolution_index)
        .build()?;
    config.validate_against(device.capabilities())?;
    if options.max_trials == 0 {
        return Err(StreamError::validation(
            ErrorContext::new("probe"),
            "max_trials must be greater than 0",
        ));
    }

    let _claim = device.claim()?;
    device.with_driver("configure", |driver, handle| {
        driver.configure(handle, config.channels(), config.settings())
    })?;

    let names = config.channel_names();
    let mut min_rate = 0.0_f64;
    let mut med_rate = options.start_rate;
    let mut max_rate = 0.0_f64;
    let mut exponential = true;
    let mut scans_per_read = 1usize;
    let mut last_good: Option<(f64, usize)> = None;
    let mut trials = Vec::new();

    info!(
        channels = ?names,
        start_rate = options.start_rate,
        "Probing maximum scan rate"
    );

    while trials.len() < options.max_trials {
        let trial = run_trial(device, &names, med_rate, scans_per_read, options)?;
        let passed = trial.passed;
        let rejected = trial.rejected;
        info!(
            passed,
            scan_rate = med_rate,
            scans_per_read,
            device_backlog = trial.peak_device_backlog,
            driver_backlog = trial.peak_driver_backlog,
            skipped = trial.skipped_samples,
            min_rate,
            max_rate,
            "Probe trial finished"
        );
        trials.push(trial);

        if passed {
            last_good = Some((med_rate, scans_per_read));
            min_rate = med_rate;
            if exponential {
                max_rate = 2.0 * med_rate;
                med_rate *= 1.5;
            } else {
                med_rate = (max_rate + med_rate) / 2.0;
            }
        } else {
            // Retry the same rate with larger reads while they can still grow
            let doubled = (2 * scans_per_read).min(med_rate.floor() as usize).max(1);
            if doubled > scans_per_read {
                scans_per_read = doubled;
                continue;
            }
            exponential = false;
            scans_per_read = if rejected {
                last_good.map_or(1, |(_, spr)| spr)
            } else {
                1
            };
            max_rate = med_rate;
            med_rate = (min_rate + med_rate) / 2.0;
        }

        if med_rate as u64 == min_rate as u64 || med_rate as u64 == max_rate as u64 {
            break;
        }
    }

    if trials.len() >= options.max_trials {
        warn!(trials = trials.len(), "Probe stopped at the trial limit");
    }

    let Some((rate, spr)) = last_good else {
        return Err(StreamError::validation(
            ErrorContext::new("probe").handle(device.handle()),
            format!("no trial passed, starting at {} Hz", options.start_rate),
        ));
    };

    let result = ProbeResult {
        scan_rate: rate - rate % 100.0,
        scans_per_read: spr,
        trials,
    };
    info!(
        scan_rate = result.scan_rate,
        scans_per_read = result.scans_per_read,
        trials = result.trials.len(),
        "Probe complete"
    );
    Ok(result)
}

fn run_trial(
    device: &Device,
    channels: &[String],
    scan_rate: f64,
    scans_per_read: usize,
    options: &ProbeOptions,
) -> Result<ProbeTrial> {
    let mut trial = ProbeTrial::new(scan_rate, scans_per_read);
    let request = StreamRequest {
        channels: channels.to_vec(),
        scan_rate,
        scans_per_read,
    };

    let started = match device.with_driver("start", |driver, handle| {
        driver.start_stream(handle, &request)
    }) {
        Ok(started) => started,
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => {
            debug!(scan_rate, scans_per_read, error = %e, "Trial stream refused");
            trial.failure = Some(e.to_string());
            trial.rejected = true;
            return Ok(trial);
        }
    };
    trial.actual_scan_rate = Some(started.actual_scan_rate);

    let deadline = Instant::now() + options.trial_duration;
    let mut reads = 0u32;
    let outcome = loop {
        let done = match options.trial_reads {
            Some(limit) => reads >= limit,
            None => Instant::now() >= deadline,
        };
        if done {
            break Ok(());
        }

        match device.with_driver("read", |driver, _| {
            driver.read_block(started.token, options.read_timeout)
        }) {
            Ok(raw) => {
                reads += 1;
                trial.scans_read += (raw.samples.len() / channels.len().max(1)) as u64;
                trial.skipped_samples += raw
                    .samples
                    .iter()
                    .filter(|v| is_skipped_sample(**v))
                    .count() as u64;
                trial.peak_device_backlog = trial.peak_device_backlog.max(raw.device_backlog);
                trial.peak_driver_backlog = trial.peak_driver_backlog.max(raw.driver_backlog);
                if trial.overloaded(options.max_backlog) {
                    break Ok(());
                }
            }
            Err(e) if e.is_fatal() => break Err(e),
            Err(e) => {
                trial.failure = Some(e.to_string());
                break Ok(());
            }
        }
    };

    if let Err(e) = device.with_driver("stop", |driver, _| driver.stop_stream(started.token)) {
        warn!(token = %started.token, error = %e, "Failed to stop trial stream");
        if e.is_fatal() && outcome.is_ok() {
            return Err(e);
        }
    }
    outcome?;

    trial.passed = trial.failure.is_none() && !trial.overloaded(options.max_backlog);
    Ok(trial)
}
