//! Analog test signal for simulated channels.
//!
//! Each channel carries a sine wave with a per-channel phase offset and a
//! DC offset equal to its channel index in tenths of a volt, plus optional
//! seeded noise. Values are clipped to the channel range the way a real ADC
//! saturates.

use std::f64::consts::TAU;

use crate::common::MockRng;

/// Shape of the generated signal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalConfig {
    /// Peak amplitude in volts
    pub amplitude: f64,
    /// Sine frequency in Hz
    pub frequency: f64,
    /// Peak noise amplitude in volts (0 disables noise)
    pub noise: f64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            amplitude: 1.0,
            frequency: 1.0,
            noise: 0.0,
        }
    }
}

impl SignalConfig {
    /// Sample for `channel` at stream time `t` (seconds), clipped to ±`range`.
    pub fn sample(&self, channel: usize, t: f64, range: f64, rng: &MockRng) -> f64 {
        let phase = channel as f64 * TAU / 8.0;
        let offset = channel as f64 * 0.1;
        let value =
            offset + self.amplitude * (TAU * self.frequency * t + phase).sin() + rng.noise(self.noise);
        value.clamp(-range, range)
    }
}
