//! Operational modes for mock devices.
//!
//! Mock devices can operate in different modes optimized for specific testing scenarios:
//!
//! - **Instant**: Moves complete immediately, deterministic behavior for unit tests
//! - **Realistic**: Motion takes distance / speed, for wait-loop and ordering tests
//! - **Chaos**: Realistic timing plus random faults, for resilience testing

use serde::Deserialize;

/// Operational modes for mock devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MockMode {
    /// Zero motion time, deterministic - for unit tests
    #[default]
    Instant,
    /// Hardware-like timing - for integration tests
    Realistic,
    /// Hardware-like timing plus random faults - for resilience testing
    Chaos,
}

impl MockMode {
    /// Whether motion takes time in this mode.
    pub fn is_timed(&self) -> bool {
        !matches!(self, MockMode::Instant)
    }

    /// Failure rate applied when the configuration does not set one.
    pub fn default_failure_rate(&self) -> f64 {
        match self {
            MockMode::Chaos => 0.05,
            _ => 0.0,
        }
    }
}
