//! Error injection framework for mock devices.
//!
//! Injected faults are `beam_core` [`DriverError`]s, so the axis retry logic
//! and the poller backoff see exactly what a real driver would report.

use super::rng::MockRng;
use beam_core::error::{DriverError, DriverErrorKind};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Error injection configuration for mock devices
#[derive(Clone, Debug)]
pub struct ErrorConfig {
    /// Per-operation failure rate (0.0 to 1.0); `"*"` matches every operation
    failure_rates: Arc<HashMap<&'static str, f64>>,
    /// Specific failure scenarios
    scenarios: Arc<Vec<ErrorScenario>>,
    /// RNG for failure decisions
    rng: Arc<MockRng>,
    /// Per-operation call counters
    counts: Arc<Mutex<HashMap<&'static str, u32>>>,
}

/// Deterministic fault patterns.
#[derive(Debug, Clone)]
pub enum ErrorScenario {
    /// Fail the first N calls with a hardware fault, then succeed
    FailFirstN {
        /// Operation name, e.g. `start`
        operation: &'static str,
        /// Number of failing calls
        count: u32,
    },
    /// Every call of the operation times out
    Timeout {
        /// Operation name
        operation: &'static str,
    },
}

impl ErrorConfig {
    /// Create error config with no errors (default)
    pub fn none() -> Self {
        Self::build(HashMap::new(), Vec::new(), None)
    }

    /// Uniform random failures of every operation; `seed` makes them
    /// reproducible.
    pub fn random_failures_seeded(rate: f64, seed: Option<u64>) -> Self {
        let mut rates = HashMap::new();
        rates.insert("*", rate);
        Self::build(rates, Vec::new(), seed)
    }

    /// Create error config with a single scenario
    pub fn scenario(scenario: ErrorScenario) -> Self {
        Self::build(HashMap::new(), vec![scenario], None)
    }

    /// Operation that always fails with a hardware fault.
    pub fn always(operation: &'static str) -> Self {
        let mut rates = HashMap::new();
        rates.insert(operation, 1.0);
        Self::build(rates, Vec::new(), None)
    }

    fn build(
        rates: HashMap<&'static str, f64>,
        scenarios: Vec<ErrorScenario>,
        seed: Option<u64>,
    ) -> Self {
        Self {
            failure_rates: Arc::new(rates),
            scenarios: Arc::new(scenarios),
            rng: Arc::new(MockRng::new(seed)),
            counts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Check if an operation should fail and return appropriate error
    pub fn check_operation(
        &self,
        driver_type: &str,
        operation: &'static str,
    ) -> Result<(), DriverError> {
        for scenario in self.scenarios.iter() {
            match scenario {
                ErrorScenario::FailFirstN {
                    operation: op,
                    count,
                } if *op == operation => {
                    let mut counts = self.counts.lock();
                    let current = counts.entry(operation).or_insert(0);
                    *current += 1;
                    if *current <= *count {
                        return Err(DriverError::new(
                            driver_type,
                            DriverErrorKind::Hardware,
                            format!("Injected failure {} of {}", current, count),
                        ));
                    }
                }
                ErrorScenario::Timeout { operation: op } if *op == operation => {
                    return Err(DriverError::new(
                        driver_type,
                        DriverErrorKind::Timeout,
                        format!("Operation '{}' timed out", operation),
                    ));
                }
                _ => {}
            }
        }

        let rate = self
            .failure_rates
            .get(operation)
            .or_else(|| self.failure_rates.get("*"))
            .copied()
            .unwrap_or(0.0);

        if self.rng.should_fail(rate) {
            return Err(DriverError::new(
                driver_type,
                DriverErrorKind::Hardware,
                format!("Random failure on operation '{}'", operation),
            ));
        }

        Ok(())
    }

    /// Reset the call counters, re-arming `FailFirstN`
    pub fn reset(&self) {
        self.counts.lock().clear();
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
        for _ in 0..100 {
            assert!(config.check_operation("mock_motor", "read").is_ok());
        }
    }

    #[test]
    fn test_random_failures() {
        let config = ErrorConfig::random_failures_seeded(0.5, Some(42));
        let failures = (0..1000)
            .filter(|_| config.check_operation("mock_motor", "read").is_err())
            .count();
        assert!(failures > 400 && failures < 600, "Got {} failures", failures);
    }

    #[test]
    fn test_fail_first_n_and_reset() {
        let config = ErrorConfig::scenario(ErrorScenario::FailFirstN {
            operation: "start",
            count: 2,
        });
        assert!(config.check_operation("mock_motor", "start").is_err());
        assert!(config.check_operation("mock_motor", "start").is_err());
        assert!(config.check_operation("mock_motor", "start").is_ok());
        // other operations are unaffected
        assert!(config.check_operation("mock_motor", "read").is_ok());

        config.reset();
        assert!(config.check_operation("mock_motor", "start").is_err());
    }

    #[test]
    fn test_timeout_scenario() {
        let config = ErrorConfig::scenario(ErrorScenario::Timeout { operation: "start" });
        for _ in 0..3 {
            let err = config.check_operation("mock_motor", "start").unwrap_err();
            assert_eq!(err.kind, DriverErrorKind::Timeout);
            assert!(err.message.contains("timed out"));
        }
        assert!(config.check_operation("mock_motor", "stop").is_ok());
    }

    #[test]
    fn test_always() {
        let config = ErrorConfig::always("start");
        for _ in 0..10 {
            let err = config.check_operation("mock_motor", "start").unwrap_err();
            assert!(err.kind.is_transient());
        }
        assert!(config.check_operation("mock_motor", "read").is_ok());
    }
}
