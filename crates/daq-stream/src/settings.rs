//! Layered acquisition settings.
//!
//! Settings are resolved in three layers, each overriding the previous one:
//!
//! 1. Library defaults (`AcquisitionSettings::default()`)
//! 2. An optional TOML file
//! 3. Environment variables prefixed with `DAQ_STREAM_`
//!
//! Nested fields use double underscores:
//!
//! - `DAQ_STREAM_LOG_LEVEL=debug` sets `log_level`
//! - `DAQ_STREAM_STREAM__SCAN_RATE=2000` sets `stream.scan_rate`
//! - `DAQ_STREAM_BUFFER__POLICY=block` sets `buffer.policy`
//!
//! ```toml
//! log_level = "info"
//!
//! [device]
//! model = "T7"
//! connection = "USB"
//! identifier = "ANY"
//!
//! [stream]
//! channels = ["AIN0", "AIN1"]
//! range = 10.0
//! scan_rate = 1000.0
//! duration_ms = 2000
//!
//! [buffer]
//! capacity = 65536
//! policy = "drop_oldest"
//! ```

use std::path::Path;
use std::time::Duration;

use daq_core::limits::{
    DEFAULT_MAX_READ_RETRIES, DEFAULT_PUSH_TIMEOUT, DEFAULT_READ_TIMEOUT, DEFAULT_RING_CAPACITY,
};
use daq_core::{ConnectionType, DeviceModel};
use figment::providers::{Env, Format, Serialized, Toml};
use figment::{Figment, Provider};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::coordinator::CoordinatorOptions;
use crate::error::{Result, StreamError};
use crate::ring_buffer::OverflowPolicy;
use crate::session::{StopCondition, StreamConfig};

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "DAQ_STREAM_";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const MAX_READ_RETRIES_LIMIT: u32 = 100;

/// Everything needed to open a device and run one acquisition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionSettings {
    /// Default tracing filter ("trace" .. "error"); `RUST_LOG` wins
    pub log_level: String,
    /// Device selection
    pub device: DeviceConfig,
    /// Channels, rate, and stop condition
    pub stream: StreamParameters,
    /// Ring buffer sizing and policy
    pub buffer: BufferConfig,
    /// Read timeout and retries
    pub driver: ReadConfig,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            device: DeviceConfig::default(),
            stream: StreamParameters::default(),
            buffer: BufferConfig::default(),
            driver: ReadConfig::default(),
        }
    }
}

impl Provider for AcquisitionSettings {
    fn metadata(&self) -> figment::Metadata {
        figment::Metadata::named("Library Defaults")
    }

    fn data(
        &self,
    ) -> std::result::Result<figment::value::Map<figment::Profile, figment::value::Dict>, figment::Error>
    {
        Serialized::defaults(self).data()
    }
}

/// Which device to open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Hardware model, or `Any`
    pub model: DeviceModel,
    /// Transport, or `Any`
    pub connection: ConnectionType,
    /// Serial number, IP address, device name, or "ANY"
    pub identifier: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            model: DeviceModel::Any,
            connection: ConnectionType::Any,
            identifier: "ANY".to_string(),
        }
    }
}

/// Stream parameters, turned into a [`StreamConfig`] by
/// [`AcquisitionSettings::to_stream_config`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamParameters {
    /// Channel names in scan order
    pub channels: Vec<String>,
    /// ±volts applied to every channel unless `ranges` is set
    pub range: f64,
    /// Per-channel ±volts, same order as `channels`
    pub ranges: Option<Vec<f64>>,
    /// Scans per second
    pub scan_rate: f64,
    /// Scans per driver read (default: about ten reads per second)
    pub scans_per_read: Option<usize>,
    /// Resolution index (0 = device default)
    pub resolution_index: u8,
    /// Settling time in microseconds (0 = device default)
    pub settling_us: f64,
    /// Stop after this much stream time
    pub duration_ms: Option<u64>,
    /// Stop after this many scans
    pub scans: Option<u64>,
}

impl Default for StreamParameters {
    fn default() -> Self {
        Self {
            channels: vec!["AIN0".to_string(), "AIN1".to_string()],
            range: 10.0,
            ranges: None,
            scan_rate: 1000.0,
            scans_per_read: None,
            resolution_index: 0,
            settling_us: 0.0,
            duration_ms: None,
            scans: None,
        }
    }
}

/// Overflow behavior as written in settings files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    /// Lossy: evict the oldest block
    #[default]
    DropOldest,
    /// Lossless: wait for consumers up to `push_timeout_ms`
    Block,
}

/// Ring buffer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Ring capacity in blocks
    pub capacity: usize,
    /// What happens when the ring is full
    pub policy: PolicyKind,
    /// Lossless push timeout in milliseconds
    pub push_timeout_ms: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_RING_CAPACITY,
            policy: PolicyKind::DropOldest,
            push_timeout_ms: DEFAULT_PUSH_TIMEOUT.as_millis() as u64,
        }
    }
}

impl BufferConfig {
    /// The policy with its timeout applied.
    pub fn overflow_policy(&self) -> OverflowPolicy {
        match self.policy {
            PolicyKind::DropOldest => OverflowPolicy::DropOldest,
            PolicyKind::Block => OverflowPolicy::Block {
                timeout: Duration::from_millis(self.push_timeout_ms),
            },
        }
    }
}

/// Driver read behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadConfig {
    /// Per-read timeout in milliseconds
    pub read_timeout_ms: u64,
    /// Consecutive read timeouts tolerated before faulting
    pub max_read_retries: u32,
}

impl Default for ReadConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: DEFAULT_READ_TIMEOUT.as_millis() as u64,
            max_read_retries: DEFAULT_MAX_READ_RETRIES,
        }
    }
}

impl AcquisitionSettings {
    /// The layered figment: defaults, then `path` if given, then
    /// `DAQ_STREAM_*` environment variables.
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(AcquisitionSettings::default());
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load and validate settings.
    ///
    /// A `path` that does not exist is an error, not a silent fallback to
    /// defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            if !path.is_file() {
                return Err(settings_error(format!(
                    "settings file {} not found",
                    path.display()
                )));
            }
        }
        let settings: AcquisitionSettings = Self::figment(path).extract()?;
        settings.validate()?;
        debug!(?settings, "Loaded acquisition settings");
        Ok(settings)
    }

    /// Checks that do not depend on the device.
    pub fn validate(&self) -> Result<()> {
        if !LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(settings_error(format!(
                "invalid log_level '{}', must be one of: {}",
                self.log_level,
                LOG_LEVELS.join(", ")
            )));
        }
        if self.stream.channels.is_empty() {
            return Err(settings_error("stream.channels must not be empty"));
        }
        if self.buffer.capacity == 0 {
            return Err(settings_error("buffer.capacity must be greater than 0"));
        }
        if self.buffer.policy == PolicyKind::Block && self.buffer.push_timeout_ms == 0 {
            return Err(settings_error(
                "buffer.push_timeout_ms must be greater than 0 for the block policy",
            ));
        }
        if self.driver.read_timeout_ms == 0 {
            return Err(settings_error("driver.read_timeout_ms must be greater than 0"));
        }
        if self.driver.max_read_retries > MAX_READ_RETRIES_LIMIT {
            return Err(settings_error(format!(
                "driver.max_read_retries {} exceeds {}",
                self.driver.max_read_retries, MAX_READ_RETRIES_LIMIT
            )));
        }
        if self.stream.duration_ms.is_some() && self.stream.scans.is_some() {
            return Err(settings_error(
                "set at most one of stream.duration_ms and stream.scans",
            ));
        }
        Ok(())
    }

    /// Stop condition from `duration_ms` or `scans`.
    pub fn stop_condition(&self) -> StopCondition {
        match (self.stream.duration_ms, self.stream.scans) {
            (Some(ms), _) => StopCondition::Duration(Duration::from_millis(ms)),
            (None, Some(scans)) => StopCondition::Scans(scans),
            (None, None) => StopCondition::Continuous,
        }
    }

    /// Build the stream configuration these settings describe.
    pub fn to_stream_config(&self) -> Result<StreamConfig> {
        let stream = &self.stream;
        let mut builder = StreamConfig::builder()
            .channels(stream.channels.as_slice())
            .scan_rate(stream.scan_rate)
            .resolution_index(stream.resolution_index)
            .settling_us(stream.settling_us)
            .stop(self.stop_condition());

        builder = match &stream.ranges {
            Some(ranges) => builder.ranges(ranges),
            None => builder.range(stream.range),
        };
        if let Some(scans_per_read) = stream.scans_per_read {
            builder = builder.scans_per_read(scans_per_read);
        }

        builder.build()
    }

    /// Coordinator options from the buffer and driver sections.
    pub fn coordinator_options(&self) -> CoordinatorOptions {
        CoordinatorOptions {
            capacity: self.buffer.capacity,
            policy: self.buffer.overflow_policy(),
            read_timeout: Duration::from_millis(self.driver.read_timeout_ms),
            max_read_retries: self.driver.max_read_retries,
        }
    }
}

fn settings_error(message: impl Into<String>) -> StreamError {
    StreamError::Settings {
        message: message.into(),
    }
}
