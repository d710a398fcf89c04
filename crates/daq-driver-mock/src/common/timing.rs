//! Command latencies for paced modes.
//!
//! Streaming reads are paced by the scan clock itself; these delays cover the
//! command-response calls around a stream.

use std::time::Duration;

use daq_core::ConnectionType;

/// Command latency configuration for paced modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimingConfig {
    /// Time to enumerate and claim a device, in milliseconds
    pub open_delay_ms: u64,
    /// Round trip for a register write (configure, start, stop), in milliseconds
    pub command_delay_ms: u64,
}

impl TimingConfig {
    /// USB: fast enumeration, sub-millisecond register writes
    pub fn usb() -> Self {
        Self {
            open_delay_ms: 20,
            command_delay_ms: 1,
        }
    }

    /// Ethernet: TCP connect plus Modbus round trips
    pub fn ethernet() -> Self {
        Self {
            open_delay_ms: 50,
            command_delay_ms: 2,
        }
    }

    /// WiFi: slow association and noisy round trips
    pub fn wifi() -> Self {
        Self {
            open_delay_ms: 150,
            command_delay_ms: 8,
        }
    }

    /// Latencies for a transport.
    pub fn for_connection(connection: ConnectionType) -> Self {
        match connection {
            ConnectionType::Usb | ConnectionType::Any => Self::usb(),
            ConnectionType::Ethernet => Self::ethernet(),
            ConnectionType::Wifi => Self::wifi(),
        }
    }

    /// Delay for `open`.
    pub fn open_delay(&self) -> Duration {
        Duration::from_millis(self.open_delay_ms)
    }

    /// Delay for every other driver call.
    pub fn command_delay(&self) -> Duration {
        Duration::from_millis(self.command_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timing() {
        let config = TimingConfig::default();
        assert_eq!(config.open_delay(), Duration::ZERO);
        assert_eq!(config.command_delay(), Duration::ZERO);
    }

    #[test]
    fn test_connection_timing() {
        assert_eq!(TimingConfig::for_connection(ConnectionType::Any), TimingConfig::usb());
        assert!(TimingConfig::wifi().open_delay_ms > TimingConfig::ethernet().open_delay_ms);
        assert_eq!(TimingConfig::ethernet().command_delay(), Duration::from_millis(2));
    }
}
