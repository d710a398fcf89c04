//! Immutable sample blocks.

use std::sync::Arc;
use std::time::{Duration, Instant};

use daq_core::limits::is_skipped_sample;

use crate::error::{ErrorContext, Result, StreamError};

/// One scan: a reading per configured channel, stamped on two clocks.
///
/// Blocks are shared as `Arc<SampleBlock>` between the ring buffer, cursors,
/// and subscribers; they are never mutated after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBlock {
    sequence: u64,
    timestamp: Instant,
    elapsed: Duration,
    device_time: f64,
    channels: Arc<[String]>,
    values: Vec<f64>,
}

impl SampleBlock {
    /// Build a block; `values` must hold exactly one value per channel.
    pub fn new(
        sequence: u64,
        timestamp: Instant,
        elapsed: Duration,
        device_time: f64,
        channels: Arc<[String]>,
        values: Vec<f64>,
    ) -> Result<Self> {
        if values.len() != channels.len() {
            return Err(StreamError::validation(
                ErrorContext::new("build block"),
                format!(
                    "{} values for {} channels",
                    values.len(),
                    channels.len()
                ),
            ));
        }
        Ok(Self {
            sequence,
            timestamp,
            elapsed,
            device_time,
            channels,
            values,
        })
    }

    /// Scan index within the stream, starting at 0.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Host monotonic time the block was produced.
    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }

    /// Host time since stream start.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Seconds on the device scan clock.
    pub fn device_time(&self) -> f64 {
        self.device_time
    }

    /// Channel names, parallel to [`values`](Self::values).
    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    pub(crate) fn channel_set(&self) -> &Arc<[String]> {
        &self.channels
    }

    /// One value per channel.
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Number of channels in the scan.
    pub fn n_channels(&self) -> usize {
        self.channels.len()
    }

    /// `(channel, value)` pairs in channel order.
    pub fn channel_values(&self) -> impl Iterator<Item = (&str, f64)> + '_ {
        self.channels
            .iter()
            .map(String::as_str)
            .zip(self.values.iter().copied())
    }

    /// Value for `channel`, if it was scanned.
    pub fn value(&self, channel: &str) -> Option<f64> {
        self.channels
            .iter()
            .position(|c| c == channel)
            .map(|i| self.values[i])
    }

    /// Number of values carrying the vendor's skipped-sample marker.
    pub fn skipped_count(&self) -> usize {
        self.values.iter().filter(|v| is_skipped_sample(**v)).count()
    }
}
