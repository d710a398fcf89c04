//! Stream session configuration and lifecycle states.
//!
//! A [`StreamConfig`] is built and checked locally (names, ranges, rate)
//! by [`StreamConfigBuilder::build`], then checked again against the
//! device's declared [`DeviceCapabilities`] before any hardware call.
//!
//! # Example
//!
//! ```rust,ignore
//! use daq_stream::{StopCondition, StreamConfig};
//! use std::time::Duration;
//!
//! let config = StreamConfig::builder()
//!     .channels(&["AIN0", "AIN1"])
//!     .range(10.0)
//!     .scan_rate(1000.0)
//!     .stop(StopCondition::Duration(Duration::from_secs(5)))
//!     .build()?;
//! ```

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use daq_core::limits::MAX_CHANNEL_NAME_LEN;
use daq_core::{ChannelConfig, DeviceCapabilities, StreamRequest, StreamSettings};

use crate::error::{ErrorContext, Result, StreamError};

/// Lifecycle of a stream session.
///
/// ```text
/// Idle -> Configuring -> Streaming -> Stopping -> Stopped
///              |             |
///              +-------------+--> Faulted (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No session configured
    Idle,
    /// Configured, or being configured, and not yet started
    Configuring,
    /// The acquisition thread is reading
    Streaming,
    /// Stop requested, last read draining
    Stopping,
    /// Stream finished and released
    Stopped,
    /// Unrecoverable error; re-open the device
    Faulted,
}

impl SessionState {
    /// No further transitions happen without a caller action.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Faulted)
    }

    /// `configure()` is accepted from these states.
    pub fn can_configure(self) -> bool {
        matches!(self, SessionState::Idle | SessionState::Stopped)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionState::Idle => "Idle",
            SessionState::Configuring => "Configuring",
            SessionState::Streaming => "Streaming",
            SessionState::Stopping => "Stopping",
            SessionState::Stopped => "Stopped",
            SessionState::Faulted => "Faulted",
        };
        write!(f, "{}", label)
    }
}

/// When a stream ends on its own.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum StopCondition {
    /// Run until `stop()` is called
    #[default]
    Continuous,
    /// Stop after a fixed number of scans
    Scans(u64),
    /// Stop after this much stream time
    Duration(Duration),
}

impl StopCondition {
    /// Total scans for a stream running at `scan_rate`, if bounded.
    pub fn total_scans(&self, scan_rate: f64) -> Option<u64> {
        match *self {
            StopCondition::Continuous => None,
            StopCondition::Scans(n) => Some(n),
            StopCondition::Duration(d) => {
                let scans = d.as_nanos() as f64 * scan_rate / 1e9;
                let nearest = scans.round();
                // Absorb float noise so 1.1 s at 100 Hz is 110 scans, not 111
                if (scans - nearest).abs() <= SCAN_COUNT_TOLERANCE * nearest.max(1.0) {
                    Some(nearest as u64)
                } else {
                    Some(scans.ceil() as u64)
                }
            }
        }
    }
}

const SCAN_COUNT_TOLERANCE: f64 = 1e-9;

/// Validated parameters for one stream session.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    channels: Vec<ChannelConfig>,
    scan_rate: f64,
    scans_per_read: usize,
    settings: StreamSettings,
    stop: StopCondition,
}

impl StreamConfig {
    /// Start building a config.
    pub fn builder() -> StreamConfigBuilder {
        StreamConfigBuilder::default()
    }

    /// Channels with their ranges.
    pub fn channels(&self) -> &[ChannelConfig] {
        &self.channels
    }

    /// Channel names in scan order.
    pub fn channel_names(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.name.clone()).collect()
    }

    /// Requested scans per second.
    pub fn scan_rate(&self) -> f64 {
        self.scan_rate
    }

    /// Scans returned per driver read.
    pub fn scans_per_read(&self) -> usize {
        self.scans_per_read
    }

    /// Resolution and settling.
    pub fn settings(&self) -> &StreamSettings {
        &self.settings
    }

    /// When the stream ends on its own.
    pub fn stop_condition(&self) -> StopCondition {
        self.stop
    }

    /// Driver request for starting this stream.
    pub fn request(&self) -> StreamRequest {
        StreamRequest {
            channels: self.channel_names(),
            scan_rate: self.scan_rate,
            scans_per_read: self.scans_per_read,
        }
    }

    /// Checks that need no device: well-formed names, no duplicates,
    /// positive finite ranges and rate.
    pub fn validate(&self) -> Result<()> {
        let ctx = || ErrorContext::new("configure");

        if self.channels.is_empty() {
            return Err(StreamError::validation(ctx(), "at least one channel is required"));
        }

        let mut seen = HashSet::new();
        for channel in &self.channels {
            let name = channel.name.as_str();
            let well_formed = !name.is_empty()
                && name.len() <= MAX_CHANNEL_NAME_LEN
                && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '#');
            if !well_formed {
                return Err(StreamError::validation(
                    ctx().channel(name),
                    format!("malformed channel name '{}'", name),
                ));
            }
            if !seen.insert(name) {
                return Err(StreamError::validation(
                    ctx().channel(name),
                    "channel listed more than once",
                ));
            }
            if !(channel.range.is_finite() && channel.range > 0.0) {
                return Err(StreamError::validation(
                    ctx().channel(name),
                    format!("invalid voltage range ±{}", channel.range),
                ));
            }
        }

        if !(self.scan_rate.is_finite() && self.scan_rate > 0.0) {
            return Err(StreamError::validation(
                ctx(),
                format!("invalid scan rate {}", self.scan_rate),
            ));
        }
        if self.scans_per_read == 0 {
            return Err(StreamError::validation(ctx(), "scans_per_read must be greater than 0"));
        }
        if !(self.settings.settling_us.is_finite() && self.settings.settling_us >= 0.0) {
            return Err(StreamError::validation(
                ctx(),
                format!("invalid settling time {} us", self.settings.settling_us),
            ));
        }
        if let StopCondition::Scans(0) = self.stop {
            return Err(StreamError::validation(ctx(), "scan count must be greater than 0"));
        }
        if let StopCondition::Duration(d) = self.stop {
            if d.is_zero() {
                return Err(StreamError::validation(ctx(), "duration must be greater than 0"));
            }
        }

        Ok(())
    }

    /// Checks against what the device declared at open.
    pub fn validate_against(&self, capabilities: &DeviceCapabilities) -> Result<()> {
        let ctx = || ErrorContext::new("configure");

        for channel in &self.channels {
            if !capabilities.has_channel(&channel.name) {
                return Err(StreamError::validation(
                    ctx().channel(&channel.name),
                    format!("{} does not declare channel '{}'", capabilities.model, channel.name),
                ));
            }
            if !capabilities.supports_range(channel.range) {
                return Err(StreamError::validation(
                    ctx().channel(&channel.name),
                    format!(
                        "range ±{} V not supported (allowed: {:?})",
                        channel.range, capabilities.ranges
                    ),
                ));
            }
        }

        let max_rate = capabilities.max_rate_for(self.channels.len());
        if self.scan_rate > max_rate {
            return Err(StreamError::validation(
                ctx(),
                format!(
                    "scan rate {} Hz exceeds {} Hz for {} channels",
                    self.scan_rate,
                    max_rate,
                    self.channels.len()
                ),
            ));
        }

        if capabilities.resolution(self.settings.resolution_index).is_none() {
            return Err(StreamError::validation(
                ctx(),
                format!(
                    "resolution index {} not supported",
                    self.settings.resolution_index
                ),
            ));
        }

        Ok(())
    }
}

/// Builder for StreamConfig.
#[derive(Debug, Default)]
pub struct StreamConfigBuilder {
    names: Vec<String>,
    ranges: Vec<f64>,
    uniform_range: Option<f64>,
    scan_rate: f64,
    scans_per_read: Option<usize>,
    settings: StreamSettings,
    stop: StopCondition,
}

impl StreamConfigBuilder {
    /// Channel names in scan order.
    pub fn channels<S: AsRef<str>>(mut self, channels: &[S]) -> Self {
        self.names = channels.iter().map(|c| c.as_ref().to_string()).collect();
        self
    }

    /// Add a single channel with its own range.
    pub fn channel(mut self, config: ChannelConfig) -> Self {
        self.names.push(config.name);
        self.ranges.push(config.range);
        self
    }

    /// Same ±range for every channel.
    pub fn range(mut self, range: f64) -> Self {
        self.uniform_range = Some(range);
        self
    }

    /// One ±range per channel, element-wise.
    pub fn ranges(mut self, ranges: &[f64]) -> Self {
        self.ranges = ranges.to_vec();
        self
    }

    /// Scans per second.
    pub fn scan_rate(mut self, rate: f64) -> Self {
        self.scan_rate = rate;
        self
    }

    /// Scans returned per driver read (default: a tenth of a second).
    pub fn scans_per_read(mut self, scans: usize) -> Self {
        self.scans_per_read = Some(scans);
        self
    }

    /// Resolution index (0 = device default).
    pub fn resolution_index(mut self, index: u8) -> Self {
        self.settings.resolution_index = index;
        self
    }

    /// Settling time in microseconds (0 = device default).
    pub fn settling_us(mut self, micros: f64) -> Self {
        self.settings.settling_us = micros;
        self
    }

    /// When the stream ends on its own.
    pub fn stop(mut self, stop: StopCondition) -> Self {
        self.stop = stop;
        self
    }

    /// Build and validate the configuration.
    pub fn build(self) -> Result<StreamConfig> {
        let ranges = match self.uniform_range {
            Some(range) if self.ranges.is_empty() => vec![range; self.names.len()],
            Some(_) => {
                return Err(StreamError::validation(
                    ErrorContext::new("configure"),
                    "set either a uniform range or per-channel ranges, not both",
                ))
            }
            None => self.ranges,
        };
        if ranges.len() != self.names.len() {
            return Err(StreamError::validation(
                ErrorContext::new("configure"),
                format!(
                    "{} ranges given for {} channels",
                    ranges.len(),
                    self.names.len()
                ),
            ));
        }

        let scans_per_read = self
            .scans_per_read
            .unwrap_or_else(|| default_scans_per_read(self.scan_rate));

        let config = StreamConfig {
            channels: self
                .names
                .into_iter()
                .zip(ranges)
                .map(|(name, range)| ChannelConfig::new(name, range))
                .collect(),
            scan_rate: self.scan_rate,
            scans_per_read,
            settings: self.settings,
            stop: self.stop,
        };
        config.validate()?;
        Ok(config)
    }
}

/// About ten reads per second.
fn default_scans_per_read(scan_rate: f64) -> usize {
    if scan_rate.is_finite() && scan_rate > 0.0 {
        ((scan_rate / 10.0).ceil() as usize).max(1)
    } else {
        1
    }
}
