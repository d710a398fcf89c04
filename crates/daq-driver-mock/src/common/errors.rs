//! Error injection framework for the simulated driver.
//!
//! Enables configurable failures per driver operation for resilience
//! testing. Operations are named after the [`VendorDriver`] methods
//! (`"open"`, `"configure"`, `"start_stream"`, `"read_block"`, ...).
//!
//! [`VendorDriver`]: daq_core::VendorDriver

use super::rng::MockRng;
use daq_core::error::{DriverError, DriverErrorKind};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Error injection configuration
#[derive(Clone, Debug)]
pub struct ErrorConfig {
    /// Per-operation probability of a transient timeout (0.0 to 1.0)
    timeout_rates: Arc<HashMap<&'static str, f64>>,
    /// Specific failure scenarios
    scenarios: Arc<Vec<ErrorScenario>>,
    /// RNG for failure decisions
    rng: Arc<MockRng>,
    /// State tracking for scenarios
    state: Arc<Mutex<ErrorState>>,
}

/// A deterministic failure pattern
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorScenario {
    /// Disconnect after N successful calls of an operation
    FailAfterN {
        /// Driver operation name
        operation: &'static str,
        /// Successful calls before the link drops
        count: u32,
    },
    /// Every call of an operation times out
    Timeout {
        /// Driver operation name
        operation: &'static str,
    },
    /// After `after` successful calls, the next `count` calls time out
    TimeoutBurst {
        /// Driver operation name
        operation: &'static str,
        /// Successful calls before the burst
        after: u32,
        /// Calls that time out
        count: u32,
    },
    /// Every call of an operation is refused with the given kind
    Reject {
        /// Driver operation name
        operation: &'static str,
        /// Kind returned for every call
        kind: DriverErrorKind,
    },
    /// The device drops off the bus on the first call of any operation
    CommunicationLoss,
}

#[derive(Default, Debug)]
struct ErrorState {
    /// Per-operation call counters
    operation_counts: HashMap<&'static str, u32>,
    /// Whether the link is gone
    communication_lost: bool,
}

impl ErrorConfig {
    /// Create error config with no errors (default)
    pub fn none() -> Self {
        Self::build(HashMap::new(), Vec::new(), None)
    }

    /// Random transient timeouts on every operation, seeded
    pub fn random_timeouts_seeded(rate: f64, seed: Option<u64>) -> Self {
        let mut rates = HashMap::new();
        rates.insert("*", rate);
        Self::build(rates, Vec::new(), seed)
    }

    /// Random transient timeouts on specific operations
    pub fn with_timeout_rates(rates: HashMap<&'static str, f64>, seed: Option<u64>) -> Self {
        Self::build(rates, Vec::new(), seed)
    }

    /// Create error config with a single scenario
    pub fn scenario(scenario: ErrorScenario) -> Self {
        Self::scenarios(vec![scenario])
    }

    /// Create error config with multiple scenarios
    pub fn scenarios(scenarios: Vec<ErrorScenario>) -> Self {
        Self::build(HashMap::new(), scenarios, None)
    }

    fn build(
        rates: HashMap<&'static str, f64>,
        scenarios: Vec<ErrorScenario>,
        seed: Option<u64>,
    ) -> Self {
        Self {
            timeout_rates: Arc::new(rates),
            scenarios: Arc::new(scenarios),
            rng: Arc::new(MockRng::new(seed)),
            state: Arc::new(Mutex::new(ErrorState::default())),
        }
    }

    /// True if no failure can ever be injected.
    pub fn is_none(&self) -> bool {
        self.scenarios.is_empty() && self.timeout_rates.values().all(|r| *r <= 0.0)
    }

    /// Check if an operation should fail and return the injected error.
    pub fn check_operation(
        &self,
        driver: &str,
        operation: &'static str,
    ) -> Result<(), DriverError> {
        let mut state = self.state.lock();

        if state.communication_lost {
            return Err(DriverError::new(
                driver,
                DriverErrorKind::Disconnected,
                "Device is no longer reachable",
            ));
        }

        let call = {
            let counter = state.operation_counts.entry(operation).or_insert(0);
            *counter += 1;
            *counter
        };

        for scenario in self.scenarios.iter() {
            match scenario {
                ErrorScenario::FailAfterN { operation: op, count } if *op == operation => {
                    if call > *count {
                        state.communication_lost = true;
                        return Err(DriverError::new(
                            driver,
                            DriverErrorKind::Disconnected,
                            format!("Injected disconnect after {} '{}' calls", count, operation),
                        ));
                    }
                }
                ErrorScenario::Timeout { operation: op } if *op == operation => {
                    return Err(DriverError::new(
                        driver,
                        DriverErrorKind::Timeout,
                        format!("Operation '{}' timed out", operation),
                    ));
                }
                ErrorScenario::TimeoutBurst {
                    operation: op,
                    after,
                    count,
                } if *op == operation => {
                    if call > *after && call <= after + count {
                        return Err(DriverError::new(
                            driver,
                            DriverErrorKind::Timeout,
                            format!("Operation '{}' timed out (call {})", operation, call),
                        ));
                    }
                }
                ErrorScenario::Reject { operation: op, kind } if *op == operation => {
                    return Err(DriverError::new(
                        driver,
                        *kind,
                        format!("Operation '{}' refused by device", operation),
                    ));
                }
                ErrorScenario::CommunicationLoss => {
                    state.communication_lost = true;
                    return Err(DriverError::new(
                        driver,
                        DriverErrorKind::Disconnected,
                        "Communication lost",
                    ));
                }
                _ => {}
            }
        }

        let rate = self
            .timeout_rates
            .get(operation)
            .or_else(|| self.timeout_rates.get("*"))
            .copied()
            .unwrap_or(0.0);

        if self.rng.should_fail(rate) {
            return Err(DriverError::new(
                driver,
                DriverErrorKind::Timeout,
                format!("Random timeout on operation '{}'", operation),
            ));
        }

        Ok(())
    }

    /// Number of times `operation` has been checked.
    pub fn call_count(&self, operation: &str) -> u32 {
        self.state
            .lock()
            .operation_counts
            .get(operation)
            .copied()
            .unwrap_or(0)
    }

    /// Reset error state (clear counters and a lost link)
    pub fn reset(&self) {
        *self.state.lock() = ErrorState::default();
    }
}

impl Default for ErrorConfig {
    fn default() -> Self {
        Self::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_errors() {
        let config = ErrorConfig::none();
        assert!(config.is_none());
        for _ in 0..100 {
            assert!(config.check_operation("sim", "read_block").is_ok());
        }
        assert_eq!(config.call_count("read_block"), 100);
    }

    #[test]
    fn test_random_timeouts() {
        let config = ErrorConfig::random_timeouts_seeded(0.5, Some(42));
        let mut failures = 0;
        for _ in 0..1000 {
            if let Err(err) = config.check_operation("sim", "read_block") {
                assert_eq!(err.kind, DriverErrorKind::Timeout);
                failures += 1;
            }
        }
        assert!(failures > 400 && failures < 600, "Got {} failures", failures);
    }

    #[test]
    fn test_fail_after_n_is_sticky() {
        let config = ErrorConfig::scenario(ErrorScenario::FailAfterN {
            operation: "read_block",
            count: 5,
        });

        for i in 0..5 {
            assert!(
                config.check_operation("sim", "read_block").is_ok(),
                "call {} should succeed",
                i + 1
            );
        }
        let err = config.check_operation("sim", "read_block").unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Disconnected);

        // Link stays down for every operation
        let err = config.check_operation("sim", "stop_stream").unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Disconnected);
    }

    #[test]
    fn test_timeout_burst_recovers() {
        let config = ErrorConfig::scenario(ErrorScenario::TimeoutBurst {
            operation: "read_block",
            after: 2,
            count: 3,
        });

        let results: Vec<bool> = (0..8)
            .map(|_| config.check_operation("sim", "read_block").is_ok())
            .collect();
        assert_eq!(results, vec![true, true, false, false, false, true, true, true]);
    }

    #[test]
    fn test_reject_scenario() {
        let config = ErrorConfig::scenario(ErrorScenario::Reject {
            operation: "configure",
            kind: DriverErrorKind::DeviceRejected,
        });

        assert!(config.check_operation("sim", "open").is_ok());
        let err = config.check_operation("sim", "configure").unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::DeviceRejected);
        assert!(err.message.contains("configure"));
    }

    #[test]
    fn test_communication_loss() {
        let config = ErrorConfig::scenario(ErrorScenario::CommunicationLoss);
        let err = config.check_operation("sim", "read_block").unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Disconnected);
        assert!(config.check_operation("sim", "close").is_err());
    }

    #[test]
    fn test_reset() {
        let config = ErrorConfig::scenario(ErrorScenario::FailAfterN {
            operation: "read_block",
            count: 2,
        });

        assert!(config.check_operation("sim", "read_block").is_ok());
        assert!(config.check_operation("sim", "read_block").is_ok());
        assert!(config.check_operation("sim", "read_block").is_err());

        config.reset();

        assert!(config.check_operation("sim", "read_block").is_ok());
        assert!(config.check_operation("sim", "read_block").is_ok());
        assert!(config.check_operation("sim", "read_block").is_err());
    }

    #[test]
    fn test_per_operation_rates() {
        let mut rates = HashMap::new();
        rates.insert("read_block", 1.0);
        rates.insert("configure", 0.0);
        let config = ErrorConfig::with_timeout_rates(rates, Some(3));

        for _ in 0..10 {
            assert!(config.check_operation("sim", "read_block").is_err());
            assert!(config.check_operation("sim", "configure").is_ok());
        }
    }
}
