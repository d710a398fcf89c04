//! `daq-core`
//!
//! Driver contract shared by the streaming facade and its vendor backends.
//!
//! This crate is deliberately small: it defines the [`VendorDriver`] trait
//! that a native data-acquisition library is wrapped behind, the handle and
//! request types that cross that boundary, the [`DriverError`] taxonomy, and
//! the limits every session is bounded by.
//!
//! ## Key Types
//!
//! - [`VendorDriver`]: open / configure / start / read / stop / close
//! - [`DeviceCapabilities`]: declared channels, ranges, and rates for a handle
//! - [`DriverError`] / [`DriverErrorKind`]: categorized driver failures
//! - [`limits`]: timeouts, retry bounds, capacities, vendor sentinels

pub mod driver;
pub mod error;
pub mod limits;

pub use driver::{
    ChannelConfig, ConnectionType, DeviceCapabilities, DeviceHandle, DeviceModel, HandleInfo,
    RawBlock, ResolutionInfo, StreamRequest, StreamSettings, StreamStart, StreamToken,
    VendorDriver, T7_RESOLUTIONS,
};
pub use error::{DriverError, DriverErrorKind, DriverResult};
