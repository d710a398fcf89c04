//! Simulated vendor driver for daq-stream
//!
//! This crate provides an in-memory implementation of
//! [`daq_core::VendorDriver`] so streaming sessions can be exercised without
//! hardware. Reads are synchronous; paced modes use `std::thread::sleep`
//! because the driver contract is a blocking one.
//!
//! # Features
//!
//! - T7 / T4 / Digit capability tables with `A<n>` aliases for `AIN<n>`
//! - Core-clock scan rate quantization
//! - Sine-per-channel signal with seeded noise
//! - Instant / Realistic / Chaos pacing ([`MockMode`])
//! - Error injection per operation ([`ErrorConfig`], [`ErrorScenario`])
//! - Device backlog and skipped-sample simulation above a sustainable rate
//!
//! # Example
//!
//! ```rust,ignore
//! use daq_driver_mock::{ErrorConfig, ErrorScenario, SimulatedDriver};
//!
//! let driver = SimulatedDriver::builder()
//!     .errors(ErrorConfig::scenario(ErrorScenario::FailAfterN {
//!         operation: "read_block",
//!         count: 10,
//!     }))
//!     .build();
//! ```

pub mod common;
mod signal;
mod simulated;

pub use common::{ErrorConfig, ErrorScenario, MockMode, MockRng, TimingConfig};
pub use signal::SignalConfig;
pub use simulated::{SimulatedDriver, SimulatedDriverBuilder};
