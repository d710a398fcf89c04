//! `daq-stream`
//!
//! A streaming acquisition facade over a blocking vendor driver.
//!
//! One [`StreamCoordinator`] owns one open [`Device`]. It validates a
//! [`StreamConfig`], drives the driver from a dedicated producer thread, and
//! publishes every scan as an immutable [`SampleBlock`] into a bounded
//! [`RingBuffer`]. Any number of consumers read concurrently through
//! independent [`Cursor`]s, point-in-time [`Snapshot`]s, or bounded
//! subscriptions.
//!
//! ## Key Types
//!
//! - [`Device`]: an open handle with its cached capabilities
//! - [`StreamCoordinator`]: session state machine and acquisition loop
//! - [`RingBuffer`] / [`Cursor`]: lossy or lossless block buffering
//! - [`LabeledTable`]: channel columns plus `Time` and `System Time`
//! - [`AcquisitionSettings`]: figment-layered configuration
//! - [`probe_max_scan_rate`]: search for the highest sustainable rate
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use daq_core::{ConnectionType, DeviceModel};
//! use daq_driver_mock::SimulatedDriver;
//! use daq_stream::{CoordinatorOptions, Device, StopCondition, StreamConfig, StreamCoordinator};
//!
//! let device = Device::open(Arc::new(SimulatedDriver::new()), DeviceModel::Any, ConnectionType::Any, "ANY")?;
//! let coordinator = StreamCoordinator::new(device, CoordinatorOptions::default())?;
//! coordinator.configure(
//!     StreamConfig::builder()
//!         .channels(&["A0", "A1"])
//!         .range(10.0)
//!         .scan_rate(100.0)
//!         .stop(StopCondition::Duration(Duration::from_secs(2)))
//!         .build()?,
//! )?;
//! coordinator.start()?;
//! coordinator.wait(Duration::from_secs(5));
//! let table = coordinator.to_labeled_table();
//! ```

pub mod block;
pub mod coordinator;
pub mod device;
pub mod error;
pub mod export;
pub mod probe;
pub mod ring_buffer;
pub mod session;
pub mod settings;
pub mod views;

pub use block::SampleBlock;
pub use coordinator::{
    BlockHook, BlockReceiver, CoordinatorOptions, StreamCoordinator, StreamStatus,
};
pub use device::Device;
pub use error::{ErrorContext, Result, StreamError};
pub use export::{export_csv, write_csv};
pub use probe::{probe_max_scan_rate, ProbeOptions, ProbeResult, ProbeTrial};
pub use ring_buffer::{Cursor, CursorRead, OverflowPolicy, RingBuffer, Snapshot};
pub use session::{SessionState, StopCondition, StreamConfig, StreamConfigBuilder};
pub use settings::AcquisitionSettings;
pub use views::{LabeledTable, RowSelection, SYSTEM_TIME_COLUMN, TIME_COLUMN};
