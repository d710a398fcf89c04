//! Shared hard limits and defaults for streaming sessions.
//!
//! Centralizing these keeps every blocking operation bounded by a known
//! timeout and keeps the CLI, settings loader, and tests in agreement.

use std::time::Duration;

// =============================================================================
// Timeout Constants
// =============================================================================

/// Per-read timeout handed to the driver (500 ms).
///
/// Also bounds how long `stop()` waits for an in-flight read to return.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// How long a lossless push waits for the slowest consumer (1 second).
pub const DEFAULT_PUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Upper bound when waiting for a session to reach a terminal state (2 seconds).
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

// =============================================================================
// Retry Policy
// =============================================================================

/// Consecutive read timeouts tolerated before a stream is declared faulted.
pub const DEFAULT_MAX_READ_RETRIES: u32 = 3;

// =============================================================================
// Size Limits
// =============================================================================

/// Default ring buffer capacity in sample blocks (one block per scan).
pub const DEFAULT_RING_CAPACITY: usize = 65_536;

/// Default subscriber channel depth in blocks.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 1024;

/// Longest accepted channel name.
pub const MAX_CHANNEL_NAME_LEN: usize = 32;

// =============================================================================
// Vendor Conventions
// =============================================================================

/// Value the vendor substitutes for samples lost to a device buffer overflow.
pub const SKIPPED_SAMPLE: f64 = -9999.0;

/// Returns true if `value` is the skipped-sample marker.
pub fn is_skipped_sample(value: f64) -> bool {
    value == SKIPPED_SAMPLE
}
