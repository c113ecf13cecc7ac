//! Error injection for mock devices.
//!
//! Each mock device calls [`ErrorConfig::check_operation`] at the top of every
//! trait method with a fixed operation name (`"configure_trigger"`, `"fetch"`,
//! `"write"`, ...). Scenarios match on that name.

use super::rng::MockRng;
use oct_core::error::{DriverError, DriverErrorKind};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Error injection configuration for mock devices
#[derive(Clone, Debug)]
pub struct ErrorConfig {
    /// Per-operation failure rate (0.0 to 1.0), `"*"` matches everything
    failure_rates: Arc<HashMap<&'static str, f64>>,
    /// Specific failure scenarios
    scenarios: Arc<Vec<ErrorScenario>>,
    /// RNG for failure decisions
    rng: Arc<MockRng>,
    /// Operation counters for `FailAfterN`
    counts: Arc<Mutex<HashMap<&'static str, u32>>>,
}

/// A deterministic failure.
#[derive(Debug, Clone)]
pub enum ErrorScenario {
    /// The device rejects every call of `operation` as a configuration error
    Reject {
        /// Operation name
        operation: &'static str,
    },
    /// Fail after N successful calls of `operation`
    FailAfterN {
        /// Operation name
        operation: &'static str,
        /// Calls that succeed first
        count: u32,
    },
    /// Every call of `operation` reports a driver timeout
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

    /// Create error config with uniform random failures and specific seed
    pub fn random_failures_seeded(rate: f64, seed: Option<u64>) -> Self {
        let mut rates = HashMap::new();
        rates.insert("*", rate);
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
            failure_rates: Arc::new(rates),
            scenarios: Arc::new(scenarios),
            rng: Arc::new(MockRng::new(seed)),
            counts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Check if an operation should fail and return the matching error
    pub fn check_operation(
        &self,
        driver_type: &str,
        operation: &'static str,
    ) -> Result<(), DriverError> {
        for scenario in self.scenarios.iter() {
            match scenario {
                ErrorScenario::Reject { operation: op } if *op == operation => {
                    return Err(DriverError::new(
                        driver_type,
                        DriverErrorKind::Configuration,
                        format!("Injected rejection of '{}'", operation),
                    ));
                }
                ErrorScenario::FailAfterN {
                    operation: op,
                    count,
                } if *op == operation => {
                    let mut counts = self.counts.lock();
                    let current = counts.entry(operation).or_insert(0);
                    *current += 1;
                    if *current > *count {
                        return Err(DriverError::new(
                            driver_type,
                            DriverErrorKind::Hardware,
                            format!("Injected failure after {} operations", count),
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

    /// Reset scenario counters
    pub fn reset(&self) {
        self.counts.lock().clear();
    }
}

impl Default for ErrorConfig {
    fn default() -> Self {
        Self::none()
    }
}
