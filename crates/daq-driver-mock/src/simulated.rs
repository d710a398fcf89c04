//! Simulated LabJack-style streaming driver.
//!
//! [`SimulatedDriver`] implements [`VendorDriver`] entirely in memory. It
//! mirrors the behavior the streaming facade relies on from a real native
//! library:
//!
//! - handles and stream tokens are issued per `open` / `start_stream`
//! - `configure` and `start_stream` reject undeclared channels and ranges
//! - the scan rate is quantized to the device core clock
//! - in paced modes `read_block` sleeps until the scan clock has produced a
//!   full block, and times out when that would take longer than `timeout`
//! - a stream faster than the sustainable rate builds device backlog and,
//!   once the device buffer overflows, reports skipped samples
//!
//! # Example
//!
//! ```rust,ignore
//! use daq_driver_mock::{MockMode, SimulatedDriver};
//! use daq_core::DeviceModel;
//!
//! let driver = SimulatedDriver::builder()
//!     .model(DeviceModel::T7)
//!     .channels(["A0", "A1"])
//!     .mode(MockMode::Realistic)
//!     .seed(42)
//!     .build();
//! ```

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::thread;
use std::time::{Duration, Instant};

use daq_core::limits::SKIPPED_SAMPLE;
use daq_core::{
    ChannelConfig, ConnectionType, DeviceCapabilities, DeviceHandle, DeviceModel, DriverError,
    DriverErrorKind, DriverResult, HandleInfo, RawBlock, StreamRequest, StreamSettings,
    StreamStart, StreamToken, VendorDriver,
};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::common::{ErrorConfig, MockMode, MockRng, TimingConfig};
use crate::signal::SignalConfig;

/// Stream clock the scan rate is derived from (80 MHz core clock).
const CORE_CLOCK_HZ: f64 = 80_000_000.0;

/// Device-side stream buffer, in samples.
const DEVICE_BUFFER_SAMPLES: u64 = 16_384;

/// Per-packet overhead, in scans, used to model the sustainable rate.
const PACKET_OVERHEAD_SCANS: f64 = 8.0;

/// Probability of a transient read timeout in chaos mode.
const CHAOS_TIMEOUT_RATE: f64 = 0.05;

/// Default serial number reported by handle info.
const DEFAULT_SERIAL: u32 = 470_010_000;

// =============================================================================
// Internal State
// =============================================================================

#[derive(Debug)]
struct SimDevice {
    connection: ConnectionType,
    ranges: HashMap<String, f64>,
    settings: StreamSettings,
    stream: Option<StreamToken>,
}

#[derive(Debug)]
struct SimStream {
    handle: DeviceHandle,
    channels: Vec<String>,
    ranges: Vec<f64>,
    channel_indices: Vec<usize>,
    scan_rate: f64,
    scans_per_read: usize,
    scan_index: u64,
    reads: u64,
    device_backlog: u64,
    started: Instant,
}

#[derive(Debug, Default)]
struct DriverState {
    next_handle: i32,
    next_token: u64,
    devices: HashMap<DeviceHandle, SimDevice>,
    streams: HashMap<StreamToken, SimStream>,
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`SimulatedDriver`].
#[derive(Debug, Clone)]
pub struct SimulatedDriverBuilder {
    name: String,
    model: DeviceModel,
    channels: Option<Vec<String>>,
    serial_number: u32,
    mode: MockMode,
    timing: Option<TimingConfig>,
    errors: ErrorConfig,
    seed: Option<u64>,
    signal: SignalConfig,
    skipped_every: Option<u64>,
    sustainable_rate: Option<f64>,
}

impl Default for SimulatedDriverBuilder {
    fn default() -> Self {
        Self {
            name: "sim".to_string(),
            model: DeviceModel::T7,
            channels: None,
            serial_number: DEFAULT_SERIAL,
            mode: MockMode::Instant,
            timing: None,
            errors: ErrorConfig::none(),
            seed: None,
            signal: SignalConfig::default(),
            skipped_every: None,
            sustainable_rate: None,
        }
    }
}

impl SimulatedDriverBuilder {
    /// Driver name reported in errors and logs.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Model to emulate. `Any` emulates a T7.
    pub fn model(mut self, model: DeviceModel) -> Self {
        self.model = match model {
            DeviceModel::Any => DeviceModel::T7,
            other => other,
        };
        self
    }

    /// Replace the declared channel names.
    pub fn channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.channels = Some(channels.into_iter().map(Into::into).collect());
        self
    }

    /// Serial number reported by `handle_info`.
    pub fn serial_number(mut self, serial: u32) -> Self {
        self.serial_number = serial;
        self
    }

    /// Pacing mode.
    pub fn mode(mut self, mode: MockMode) -> Self {
        self.mode = mode;
        self
    }

    /// Override command latencies (default derives them from the connection).
    pub fn timing(mut self, timing: TimingConfig) -> Self {
        self.timing = Some(timing);
        self
    }

    /// Error injection.
    pub fn errors(mut self, errors: ErrorConfig) -> Self {
        self.errors = errors;
        self
    }

    /// Seed for noise and chaos decisions.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Generated waveform.
    pub fn signal(mut self, signal: SignalConfig) -> Self {
        self.signal = signal;
        self
    }

    /// Mark the first scan of every `n`th read as skipped.
    pub fn skipped_samples_every(mut self, n: u64) -> Self {
        self.skipped_every = (n > 0).then_some(n);
        self
    }

    /// Aggregate sample rate the simulated link sustains without backlog.
    pub fn sustainable_rate(mut self, samples_per_second: f64) -> Self {
        self.sustainable_rate = Some(samples_per_second);
        self
    }

    /// Build the driver.
    pub fn build(self) -> SimulatedDriver {
        let mut capabilities = DeviceCapabilities::for_model(self.model);
        capabilities.channels = match self.channels {
            Some(channels) => channels,
            None => {
                let aliases: Vec<String> = capabilities
                    .channels
                    .iter()
                    .filter_map(|c| c.strip_prefix("AIN").map(|n| format!("A{}", n)))
                    .collect();
                capabilities.channels.into_iter().chain(aliases).collect()
            }
        };

        SimulatedDriver {
            name: self.name,
            model: self.model,
            capabilities,
            serial_number: self.serial_number,
            mode: self.mode,
            timing: self.timing,
            errors: self.errors,
            rng: MockRng::new(self.seed),
            signal: self.signal,
            skipped_every: self.skipped_every,
            sustainable_rate: self.sustainable_rate,
            state: Mutex::new(DriverState {
                next_handle: 1,
                next_token: 1,
                ..DriverState::default()
            }),
        }
    }
}

// =============================================================================
// SimulatedDriver
// =============================================================================

/// In-memory vendor driver for tests, demos, and the CLI.
#[derive(Debug)]
pub struct SimulatedDriver {
    name: String,
    model: DeviceModel,
    capabilities: DeviceCapabilities,
    serial_number: u32,
    mode: MockMode,
    timing: Option<TimingConfig>,
    errors: ErrorConfig,
    rng: MockRng,
    signal: SignalConfig,
    skipped_every: Option<u64>,
    sustainable_rate: Option<f64>,
    state: Mutex<DriverState>,
}

impl Default for SimulatedDriver {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl SimulatedDriver {
    /// Instant-mode T7 with default channels.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder with default settings.
    pub fn builder() -> SimulatedDriverBuilder {
        SimulatedDriverBuilder::default()
    }

    /// Pacing mode.
    pub fn mode(&self) -> MockMode {
        self.mode
    }

    /// Number of calls made to a driver operation, failed ones included.
    pub fn call_count(&self, operation: &str) -> u32 {
        self.errors.call_count(operation)
    }

    /// Handles opened and not yet closed.
    pub fn open_handles(&self) -> usize {
        self.state.lock().devices.len()
    }

    /// Streams started and not yet stopped.
    pub fn active_streams(&self) -> usize {
        self.state.lock().streams.len()
    }

    fn error(&self, kind: DriverErrorKind, message: impl Into<String>) -> DriverError {
        DriverError::new(&self.name, kind, message)
    }

    fn command_delay(&self, connection: ConnectionType) {
        if self.mode.is_paced() {
            let timing = self
                .timing
                .unwrap_or_else(|| TimingConfig::for_connection(connection));
            thread::sleep(timing.command_delay());
        }
    }

    fn resolve_connection(&self, requested: ConnectionType) -> DriverResult<ConnectionType> {
        let supported: &[ConnectionType] = match self.model {
            DeviceModel::T7 | DeviceModel::Any => &[
                ConnectionType::Usb,
                ConnectionType::Ethernet,
                ConnectionType::Wifi,
            ],
            DeviceModel::T4 => &[ConnectionType::Usb, ConnectionType::Ethernet],
            DeviceModel::Digit => &[ConnectionType::Usb],
        };
        match requested {
            ConnectionType::Any => Ok(ConnectionType::Usb),
            other if supported.contains(&other) => Ok(other),
            other => Err(self.error(
                DriverErrorKind::Unsupported,
                format!("{} does not support {} connections", self.model, other),
            )),
        }
    }

    fn matches_identifier(&self, identifier: &str) -> bool {
        let id = identifier.trim();
        id.is_empty()
            || id.eq_ignore_ascii_case("ANY")
            || id.eq_ignore_ascii_case(&self.name)
            || id == self.serial_number.to_string()
    }

    /// Samples per second the link sustains for a given packet size.
    fn effective_capacity(&self, scans_per_read: usize) -> Option<f64> {
        self.sustainable_rate.map(|rate| {
            let spr = scans_per_read as f64;
            rate * spr / (spr + PACKET_OVERHEAD_SCANS)
        })
    }
}

impl VendorDriver for SimulatedDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(
        &self,
        model: DeviceModel,
        connection: ConnectionType,
        identifier: &str,
    ) -> DriverResult<DeviceHandle> {
        self.errors.check_operation(&self.name, "open")?;

        if model != DeviceModel::Any && model != self.model {
            return Err(self.error(
                DriverErrorKind::NotFound,
                format!("no {} device found (simulating {})", model, self.model),
            ));
        }
        if !self.matches_identifier(identifier) {
            return Err(self.error(
                DriverErrorKind::NotFound,
                format!("no device with identifier '{}'", identifier),
            ));
        }
        let connection = self.resolve_connection(connection)?;

        if self.mode.is_paced() {
            let timing = self
                .timing
                .unwrap_or_else(|| TimingConfig::for_connection(connection));
            thread::sleep(timing.open_delay());
        }

        let mut state = self.state.lock();
        let handle = DeviceHandle(state.next_handle);
        state.next_handle += 1;
        state.devices.insert(
            handle,
            SimDevice {
                connection,
                ranges: HashMap::new(),
                settings: StreamSettings::default(),
                stream: None,
            },
        );
        debug!(%handle, model = %self.model, %connection, "Opened simulated device");
        Ok(handle)
    }

    fn handle_info(&self, handle: DeviceHandle) -> DriverResult<HandleInfo> {
        self.errors.check_operation(&self.name, "handle_info")?;
        let state = self.state.lock();
        let device = state
            .devices
            .get(&handle)
            .ok_or_else(|| self.error(DriverErrorKind::NotFound, format!("unknown {}", handle)))?;

        let (ip_address, port, max_packet_bytes) = match device.connection {
            ConnectionType::Ethernet => (Ipv4Addr::new(192, 168, 1, 207), 502, 1040),
            ConnectionType::Wifi => (Ipv4Addr::new(192, 168, 1, 208), 502, 500),
            ConnectionType::Usb | ConnectionType::Any => (Ipv4Addr::UNSPECIFIED, 0, 64),
        };

        Ok(HandleInfo {
            model: self.model,
            connection: device.connection,
            serial_number: self.serial_number,
            ip_address,
            port,
            max_packet_bytes,
        })
    }

    fn capabilities(&self, handle: DeviceHandle) -> DriverResult<DeviceCapabilities> {
        self.errors.check_operation(&self.name, "capabilities")?;
        if !self.state.lock().devices.contains_key(&handle) {
            return Err(self.error(DriverErrorKind::NotFound, format!("unknown {}", handle)));
        }
        Ok(self.capabilities.clone())
    }

    fn configure(
        &self,
        handle: DeviceHandle,
        channels: &[ChannelConfig],
        settings: &StreamSettings,
    ) -> DriverResult<()> {
        self.errors.check_operation(&self.name, "configure")?;

        for channel in channels {
            if !self.capabilities.has_channel(&channel.name) {
                return Err(self.error(
                    DriverErrorKind::InvalidChannel,
                    format!("{} is not a channel of this {}", channel.name, self.model),
                ));
            }
            if !self.capabilities.supports_range(channel.range) {
                return Err(self.error(
                    DriverErrorKind::InvalidRange,
                    format!("range ±{} V not accepted on {}", channel.range, channel.name),
                ));
            }
        }
        if self.capabilities.resolution(settings.resolution_index).is_none() {
            return Err(self.error(
                DriverErrorKind::DeviceRejected,
                format!("resolution index {} not supported", settings.resolution_index),
            ));
        }
        if !(0.0..=50_000.0).contains(&settings.settling_us) {
            return Err(self.error(
                DriverErrorKind::DeviceRejected,
                format!("settling time {} us out of bounds", settings.settling_us),
            ));
        }

        let connection = {
            let mut state = self.state.lock();
            let device = state.devices.get_mut(&handle).ok_or_else(|| {
                self.error(DriverErrorKind::NotFound, format!("unknown {}", handle))
            })?;
            if device.stream.is_some() {
                return Err(self.error(
                    DriverErrorKind::AlreadyStreaming,
                    "cannot reconfigure while streaming",
                ));
            }
            for channel in channels {
                device.ranges.insert(channel.name.clone(), channel.range);
            }
            device.settings = *settings;
            device.connection
        };

        self.command_delay(connection);
        debug!(%handle, channels = channels.len(), "Configured simulated device");
        Ok(())
    }

    fn start_stream(
        &self,
        handle: DeviceHandle,
        request: &StreamRequest,
    ) -> DriverResult<StreamStart> {
        self.errors.check_operation(&self.name, "start_stream")?;

        if request.channels.is_empty() {
            return Err(self.error(DriverErrorKind::DeviceRejected, "empty scan list"));
        }
        let mut channel_indices = Vec::with_capacity(request.channels.len());
        for name in &request.channels {
            let position = self
                .capabilities
                .channels
                .iter()
                .position(|c| c == name)
                .ok_or_else(|| {
                    self.error(
                        DriverErrorKind::InvalidChannel,
                        format!("{} is not a channel of this {}", name, self.model),
                    )
                })?;
            // AIN3 and its alias A3 carry the same signal
            let index = name
                .trim_start_matches(|c: char| c.is_ascii_alphabetic())
                .parse::<usize>()
                .unwrap_or(position);
            channel_indices.push(index);
        }
        if !(request.scan_rate.is_finite() && request.scan_rate > 0.0) {
            return Err(self.error(
                DriverErrorKind::DeviceRejected,
                format!("invalid scan rate {}", request.scan_rate),
            ));
        }
        if request.scan_rate > self.capabilities.max_rate_for(request.channels.len()) {
            return Err(self.error(
                DriverErrorKind::DeviceRejected,
                format!(
                    "scan rate {} Hz over {} channels exceeds {} samples/s",
                    request.scan_rate,
                    request.channels.len(),
                    self.capabilities.max_scan_rate
                ),
            ));
        }
        if request.scans_per_read == 0 {
            return Err(self.error(DriverErrorKind::DeviceRejected, "scans_per_read is zero"));
        }

        let divisor = (CORE_CLOCK_HZ / request.scan_rate).round().max(1.0);
        let actual_scan_rate = CORE_CLOCK_HZ / divisor;

        let (token, connection, resolution_index) = {
            let mut state = self.state.lock();
            let token = StreamToken(state.next_token);
            let device = state.devices.get_mut(&handle).ok_or_else(|| {
                self.error(DriverErrorKind::NotFound, format!("unknown {}", handle))
            })?;
            if device.stream.is_some() {
                return Err(self.error(
                    DriverErrorKind::AlreadyStreaming,
                    format!("{} already has a running stream", handle),
                ));
            }
            let ranges = request
                .channels
                .iter()
                .map(|c| device.ranges.get(c).copied().unwrap_or(10.0))
                .collect();
            device.stream = Some(token);
            let connection = device.connection;
            let resolution_index = device.settings.resolution_index;

            state.next_token += 1;
            state.streams.insert(
                token,
                SimStream {
                    handle,
                    channels: request.channels.clone(),
                    ranges,
                    channel_indices,
                    scan_rate: actual_scan_rate,
                    scans_per_read: request.scans_per_read,
                    scan_index: 0,
                    reads: 0,
                    device_backlog: 0,
                    started: Instant::now(),
                },
            );
            (token, connection, resolution_index)
        };

        self.command_delay(connection);
        debug!(
            %handle,
            %token,
            requested = request.scan_rate,
            actual = actual_scan_rate,
            scans_per_read = request.scans_per_read,
            resolution_index,
            "Started simulated stream"
        );
        Ok(StreamStart {
            token,
            actual_scan_rate,
        })
    }

    fn read_block(&self, token: StreamToken, timeout: Duration) -> DriverResult<RawBlock> {
        self.errors.check_operation(&self.name, "read_block")?;
        if self.mode == MockMode::Chaos && self.rng.should_fail(CHAOS_TIMEOUT_RATE) {
            thread::sleep(timeout);
            return Err(self.error(DriverErrorKind::Timeout, "chaos: read timed out"));
        }

        let not_running = || self.error(DriverErrorKind::NotFound, format!("{} is not running", token));

        if self.mode.is_paced() {
            let due = {
                let state = self.state.lock();
                let stream = state.streams.get(&token).ok_or_else(not_running)?;
                let next_scan = stream.scan_index + stream.scans_per_read as u64;
                stream.started + Duration::from_secs_f64(next_scan as f64 / stream.scan_rate)
            };
            let wait = due.saturating_duration_since(Instant::now());
            if wait > timeout {
                thread::sleep(timeout);
                return Err(self.error(
                    DriverErrorKind::Timeout,
                    format!("no block within {:?}", timeout),
                ));
            }
            thread::sleep(wait);
        }

        let mut state = self.state.lock();
        let stream = state.streams.get_mut(&token).ok_or_else(not_running)?;
        let n_channels = stream.channels.len();
        let spr = stream.scans_per_read;

        let mut samples = Vec::with_capacity(spr * n_channels);
        for scan in 0..spr {
            let t = (stream.scan_index + scan as u64) as f64 / stream.scan_rate;
            for (slot, &index) in stream.channel_indices.iter().enumerate() {
                samples.push(self.signal.sample(index, t, stream.ranges[slot], &self.rng));
            }
        }
        stream.reads += 1;

        let mut overflowed = false;
        if let Some(capacity) = self.effective_capacity(spr) {
            let demand = stream.scan_rate * n_channels as f64;
            if demand > capacity {
                let deficit = 1.0 - capacity / demand;
                stream.device_backlog += (spr as f64 * deficit).ceil() as u64;
                let limit = DEVICE_BUFFER_SAMPLES / n_channels.max(1) as u64;
                if stream.device_backlog > limit {
                    stream.device_backlog = limit;
                    overflowed = true;
                }
            }
        }
        let marked = self
            .skipped_every
            .is_some_and(|n| stream.reads % n == 0);
        if overflowed || marked {
            for value in samples.iter_mut().take(n_channels) {
                *value = SKIPPED_SAMPLE;
            }
        }

        stream.scan_index += spr as u64;
        let driver_backlog = if self.mode.is_paced() {
            let produced = (stream.started.elapsed().as_secs_f64() * stream.scan_rate) as u64;
            produced.saturating_sub(stream.scan_index)
        } else {
            0
        };

        trace!(
            %token,
            handle = %stream.handle,
            scans = spr,
            device_backlog = stream.device_backlog,
            driver_backlog,
            "Read simulated block"
        );

        Ok(RawBlock {
            samples,
            device_backlog: stream.device_backlog.min(u32::MAX as u64) as u32,
            driver_backlog: driver_backlog.min(u32::MAX as u64) as u32,
        })
    }

    fn stop_stream(&self, token: StreamToken) -> DriverResult<()> {
        self.errors.check_operation(&self.name, "stop_stream")?;
        let mut state = self.state.lock();
        let stream = state.streams.remove(&token).ok_or_else(|| {
            self.error(DriverErrorKind::NotFound, format!("{} is not running", token))
        })?;
        if let Some(device) = state.devices.get_mut(&stream.handle) {
            device.stream = None;
        }
        debug!(%token, scans = stream.scan_index, "Stopped simulated stream");
        Ok(())
    }

    fn close(&self, handle: DeviceHandle) -> DriverResult<()> {
        self.errors.check_operation(&self.name, "close")?;
        let mut state = self.state.lock();
        let device = state
            .devices
            .remove(&handle)
            .ok_or_else(|| self.error(DriverErrorKind::NotFound, format!("unknown {}", handle)))?;
        if let Some(token) = device.stream {
            state.streams.remove(&token);
        }
        debug!(%handle, "Closed simulated device");
        Ok(())
    }
}
