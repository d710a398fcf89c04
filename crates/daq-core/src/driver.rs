//! Vendor driver contract.
//!
//! The streaming facade never talks to hardware directly. Everything it needs
//! from a vendor library goes through the [`VendorDriver`] trait, which mirrors
//! the request/response shape of LabJack-style native drivers:
//!
//! ```text
//! open(model, connection, identifier) -> handle
//! configure(handle, channels, settings) -> ok
//! start_stream(handle, request) -> token
//! read_block(token, timeout) -> raw samples
//! stop_stream(token)
//! close(handle)
//! ```
//!
//! Implementations are expected to be callable from any thread. Callers
//! serialize access per handle, so a backend does not need its own locking
//! around a single device.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::DriverResult;

// =============================================================================
// Handles
// =============================================================================

/// Opaque device handle issued by a driver on `open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceHandle(pub i32);

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handle#{}", self.0)
    }
}

/// Opaque stream token issued by a driver on `start_stream`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamToken(pub u64);

impl fmt::Display for StreamToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

// =============================================================================
// Device Identification
// =============================================================================

/// Hardware model requested on open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeviceModel {
    /// Let the driver pick the first device it finds.
    #[default]
    Any,
    /// LabJack T7 / T7-Pro.
    T7,
    /// LabJack T4.
    T4,
    /// LabJack Digit.
    Digit,
}

impl fmt::Display for DeviceModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DeviceModel::Any => "ANY",
            DeviceModel::T7 => "T7",
            DeviceModel::T4 => "T4",
            DeviceModel::Digit => "DIGIT",
        };
        write!(f, "{}", label)
    }
}

impl FromStr for DeviceModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ANY" => Ok(Self::Any),
            "T7" => Ok(Self::T7),
            "T4" => Ok(Self::T4),
            "DIGIT" => Ok(Self::Digit),
            other => Err(format!("unknown device model '{}'", other)),
        }
    }
}

/// Transport used to reach the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConnectionType {
    /// Fastest available transport.
    #[default]
    Any,
    /// USB.
    Usb,
    /// Wired Ethernet.
    Ethernet,
    /// WiFi.
    Wifi,
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionType::Any => "ANY",
            ConnectionType::Usb => "USB",
            ConnectionType::Ethernet => "ETHERNET",
            ConnectionType::Wifi => "WIFI",
        };
        write!(f, "{}", label)
    }
}

impl FromStr for ConnectionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ANY" => Ok(Self::Any),
            "USB" => Ok(Self::Usb),
            "ETHERNET" | "ETH" => Ok(Self::Ethernet),
            "WIFI" => Ok(Self::Wifi),
            other => Err(format!("unknown connection type '{}'", other)),
        }
    }
}

/// Self-reported metadata of an open handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandleInfo {
    /// Hardware model behind the handle.
    pub model: DeviceModel,
    /// Transport the handle was opened over.
    pub connection: ConnectionType,
    /// Device serial number.
    pub serial_number: u32,
    /// IP address (unspecified over USB).
    pub ip_address: Ipv4Addr,
    /// Port (0 over USB).
    pub port: u16,
    /// Largest packet the transport will carry, in bytes.
    pub max_packet_bytes: u32,
}

impl fmt::Display for HandleInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} over {} (serial {}, ip {}, port {}, max packet {} bytes)",
            self.model,
            self.connection,
            self.serial_number,
            self.ip_address,
            self.port,
            self.max_packet_bytes
        )
    }
}

// =============================================================================
// Capabilities
// =============================================================================

/// Noise/speed trade-off for one resolution index.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResolutionInfo {
    /// Resolution index as passed to `configure`.
    pub index: u8,
    /// Effective resolution in bits.
    pub effective_bits: f64,
    /// Noise floor in microvolts.
    pub noise_microvolts: f64,
    /// Time per sample in milliseconds.
    pub sample_time_ms: f64,
}

const fn resolution(
    index: u8,
    effective_bits: f64,
    noise_microvolts: f64,
    sample_time_ms: f64,
) -> ResolutionInfo {
    ResolutionInfo {
        index,
        effective_bits,
        noise_microvolts,
        sample_time_ms,
    }
}

/// T7 command-response resolution table (index 0 selects the device default).
pub const T7_RESOLUTIONS: [ResolutionInfo; 12] = [
    resolution(1, 16.0, 316.0, 0.04),
    resolution(2, 16.5, 223.0, 0.04),
    resolution(3, 17.0, 158.0, 0.1),
    resolution(4, 17.5, 112.0, 0.1),
    resolution(5, 17.9, 84.6, 0.2),
    resolution(6, 18.3, 64.1, 0.3),
    resolution(7, 18.8, 45.3, 0.6),
    resolution(8, 19.1, 36.8, 1.1),
    resolution(9, 19.6, 26.0, 3.5),
    resolution(10, 20.5, 14.0, 13.4),
    resolution(11, 21.3, 8.02, 66.2),
    resolution(12, 21.4, 7.48, 159.0),
];

/// What a device declares it can do, fetched once per handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    /// Hardware model.
    pub model: DeviceModel,
    /// Channel names accepted by `configure`, in device order.
    pub channels: Vec<String>,
    /// Accepted bipolar ranges (±volts).
    pub ranges: Vec<f64>,
    /// Highest aggregate rate in samples per second (scan rate x channels).
    pub max_scan_rate: f64,
    /// Supported resolution indices beyond the default 0.
    pub resolutions: Vec<ResolutionInfo>,
}

impl DeviceCapabilities {
    /// Default declaration for a model, matching the vendor datasheet.
    pub fn for_model(model: DeviceModel) -> Self {
        match model {
            DeviceModel::T7 | DeviceModel::Any => Self {
                model: DeviceModel::T7,
                channels: (0..14).map(|i| format!("AIN{}", i)).collect(),
                ranges: vec![10.0, 1.0, 0.1, 0.01],
                max_scan_rate: 100_000.0,
                resolutions: T7_RESOLUTIONS.to_vec(),
            },
            DeviceModel::T4 => Self {
                model: DeviceModel::T4,
                channels: (0..12).map(|i| format!("AIN{}", i)).collect(),
                ranges: vec![10.0],
                max_scan_rate: 40_000.0,
                resolutions: T7_RESOLUTIONS[..5].to_vec(),
            },
            DeviceModel::Digit => Self {
                model: DeviceModel::Digit,
                channels: Vec::new(),
                ranges: Vec::new(),
                max_scan_rate: 0.0,
                resolutions: Vec::new(),
            },
        }
    }

    /// True if `name` is a declared channel.
    pub fn has_channel(&self, name: &str) -> bool {
        self.channels.iter().any(|c| c == name)
    }

    /// True if `range` is one of the accepted ranges.
    pub fn supports_range(&self, range: f64) -> bool {
        self.ranges.iter().any(|r| (r - range).abs() < 1e-9)
    }

    /// Highest scan rate for a stream over `n_channels` channels.
    pub fn max_rate_for(&self, n_channels: usize) -> f64 {
        self.max_scan_rate / n_channels.max(1) as f64
    }

    /// Look up a resolution index. Index 0 is always accepted.
    pub fn resolution(&self, index: u8) -> Option<ResolutionInfo> {
        if index == 0 {
            return Some(resolution(0, 0.0, 0.0, 0.0));
        }
        self.resolutions.iter().find(|r| r.index == index).copied()
    }
}

// =============================================================================
// Stream Requests
// =============================================================================

/// One channel with its requested range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Channel name as declared by the device.
    pub name: String,
    /// Bipolar range in volts (±range).
    pub range: f64,
}

impl ChannelConfig {
    /// A channel read over ±`range` volts.
    pub fn new(name: impl Into<String>, range: f64) -> Self {
        Self {
            name: name.into(),
            range,
        }
    }
}

/// Stream-wide analog settings written alongside the channel ranges.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StreamSettings {
    /// Settling time in microseconds (0 = device default).
    pub settling_us: f64,
    /// Resolution index (0 = device default).
    pub resolution_index: u8,
}

/// Parameters for `start_stream`.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    /// Channel names in scan order.
    pub channels: Vec<String>,
    /// Requested scans per second.
    pub scan_rate: f64,
    /// Scans returned by each `read_block`.
    pub scans_per_read: usize,
}

/// Driver acknowledgment of a started stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamStart {
    /// Handle for reads and `stop_stream`.
    pub token: StreamToken,
    /// Scan rate the device actually runs at.
    pub actual_scan_rate: f64,
}

/// One read worth of interleaved samples.
///
/// `samples` is ordered `[scan0_ch0, scan0_ch1, ..., scan1_ch0, ...]`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawBlock {
    /// Interleaved values, one per channel per scan.
    pub samples: Vec<f64>,
    /// Scans left in the device buffer when the read returned.
    pub device_backlog: u32,
    /// Scans left in the driver buffer after this read.
    pub driver_backlog: u32,
}

// =============================================================================
// Driver Trait
// =============================================================================

/// A vendor data-acquisition library.
pub trait VendorDriver: Send + Sync {
    /// Short backend name used in errors and logs.
    fn name(&self) -> &str;

    /// Open a device and return its handle.
    fn open(
        &self,
        model: DeviceModel,
        connection: ConnectionType,
        identifier: &str,
    ) -> DriverResult<DeviceHandle>;

    /// Model, transport, and addressing for an open handle.
    fn handle_info(&self, handle: DeviceHandle) -> DriverResult<HandleInfo>;

    /// Declared channels, ranges, and rates for an open handle.
    fn capabilities(&self, handle: DeviceHandle) -> DriverResult<DeviceCapabilities>;

    /// Write channel ranges and stream settings to the device.
    fn configure(
        &self,
        handle: DeviceHandle,
        channels: &[ChannelConfig],
        settings: &StreamSettings,
    ) -> DriverResult<()>;

    /// Start streaming the requested channels.
    fn start_stream(&self, handle: DeviceHandle, request: &StreamRequest)
        -> DriverResult<StreamStart>;

    /// Block for at most `timeout` waiting for the next `scans_per_read` scans.
    fn read_block(&self, token: StreamToken, timeout: Duration) -> DriverResult<RawBlock>;

    /// Stop a stream and release its token.
    fn stop_stream(&self, token: StreamToken) -> DriverResult<()>;

    /// Close a handle. Any stream on it is stopped.
    fn close(&self, handle: DeviceHandle) -> DriverResult<()>;
}
