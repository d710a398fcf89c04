//! Operational modes for the simulated driver.
//!
//! - **Instant**: reads return immediately, deterministic for unit tests
//! - **Realistic**: reads are paced by the scan clock like real hardware
//! - **Chaos**: realistic pacing plus random transient read timeouts

use std::fmt;
use std::str::FromStr;

/// Operational modes for the simulated driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MockMode {
    /// Zero delays, deterministic - for unit tests
    #[default]
    Instant,
    /// Scan-clock pacing - for integration tests and demos
    Realistic,
    /// Scan-clock pacing with injected timeouts - for resilience testing
    Chaos,
}

impl MockMode {
    /// Whether reads sleep until the scan clock catches up.
    pub fn is_paced(self) -> bool {
        !matches!(self, MockMode::Instant)
    }
}

impl fmt::Display for MockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            MockMode::Instant => "instant",
            MockMode::Realistic => "realistic",
            MockMode::Chaos => "chaos",
        };
        write!(f, "{}", label)
    }
}

impl FromStr for MockMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "instant" => Ok(MockMode::Instant),
            "realistic" => Ok(MockMode::Realistic),
            "chaos" => Ok(MockMode::Chaos),
            other => Err(format!("unknown mock mode '{}'", other)),
        }
    }
}
