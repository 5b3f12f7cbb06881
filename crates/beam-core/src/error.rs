//! Error types for beamline devices.
//!
//! `BeamError` is the single error type flowing through the capability traits,
//! the motion layer and the poller. The variants follow the propagation policy
//! of the control system:
//!
//! - **Validation errors** (`Limit`, `Usage`, `Configuration`) fail fast and are
//!   never retried.
//! - **Transport and hardware faults** (`Driver`, `Move`) are transient; the
//!   axis layer retries them up to its configured `maxtries`.
//! - **Terminal motion failures** (`Position`, `Timeout`) are what a caller sees
//!   once retries are exhausted or the wait loop ran out of time.
//!
//! Use [`BeamError::is_retryable`] rather than matching variants by hand when
//! deciding whether another attempt makes sense.

use thiserror::Error;

// =============================================================================
// Driver Errors
// =============================================================================

/// Category of a fault reported by a hardware driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// Device could not be brought up.
    Initialization,
    /// Driver configuration is unusable.
    Configuration,
    /// Link to the controller failed (serial, network, bus).
    Communication,
    /// Controller reported a hardware fault.
    Hardware,
    /// Controller did not answer in time.
    Timeout,
    /// Controller rejected a parameter value.
    InvalidParameter,
    /// Anything else.
    Unknown,
}

impl DriverErrorKind {
    /// Whether a fault of this kind may disappear on a second attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DriverErrorKind::Communication
                | DriverErrorKind::Hardware
                | DriverErrorKind::Timeout
                | DriverErrorKind::Unknown
        )
    }
}

impl std::fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DriverErrorKind::Initialization => "initialization",
            DriverErrorKind::Configuration => "configuration",
            DriverErrorKind::Communication => "communication",
            DriverErrorKind::Hardware => "hardware",
            DriverErrorKind::Timeout => "timeout",
            DriverErrorKind::InvalidParameter => "invalid_parameter",
            DriverErrorKind::Unknown => "unknown",
        };
        write!(f, "{}", label)
    }
}

/// Structured fault raised by a hardware driver.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Driver '{driver_type}' {kind} error: {message}")]
pub struct DriverError {
    /// Driver identifier, e.g. `mock_motor`.
    pub driver_type: String,
    /// Fault category.
    pub kind: DriverErrorKind,
    /// Human-readable detail.
    pub message: String,
}

impl DriverError {
    /// Create a new driver error.
    pub fn new(
        driver_type: impl Into<String>,
        kind: DriverErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            driver_type: driver_type.into(),
            kind,
            message: message.into(),
        }
    }
}

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, BeamError>;

/// Primary error type for beamline devices.
#[derive(Error, Debug)]
pub enum BeamError {
    /// Target outside the configured limits, or refused by an `is_allowed` check.
    ///
    /// **Error Type**: Permanent for this target. Never retried.
    #[error("{device}: limit error: {message}")]
    Limit {
        /// Device that refused the target.
        device: String,
        /// Why it was refused.
        message: String,
    },

    /// Malformed call, e.g. wrong number of slit coordinates for the opmode.
    ///
    /// **Error Type**: Programming or operator error. Never retried.
    #[error("{device}: usage error: {message}")]
    Usage {
        /// Device the call was made on.
        device: String,
        /// What was wrong with the call.
        message: String,
    },

    /// A single positioning attempt failed because the motor reported a fault.
    ///
    /// **Error Type**: Transient. The axis retries up to `maxtries` and
    /// surfaces this variant once the attempts are exhausted.
    #[error("{device}: move error: {message}")]
    Move {
        /// Device that failed to move.
        device: String,
        /// Fault description.
        message: String,
    },

    /// The target was not reached, or motor and feedback disagree (drag error).
    #[error("{device}: position error: {message}")]
    Position {
        /// Device that failed to position.
        device: String,
        /// Failure description.
        message: String,
    },

    /// The wait loop exceeded its allotted time.
    ///
    /// The axis is left in ERROR status for operator inspection.
    #[error("{device}: timeout after {seconds:.1} s waiting for motion to finish")]
    Timeout {
        /// Device that timed out.
        device: String,
        /// Elapsed time.
        seconds: f64,
    },

    /// Structured driver error with category.
    #[error("{0}")]
    Driver(#[from] DriverError),

    /// Configuration values parse but are semantically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Configuration file could not be read or deserialized.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Standard I/O failure (process spawning, files).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No device with this name exists in the loaded setup.
    #[error("Device '{0}' not found in the loaded setup")]
    DeviceNotFound(String),

    /// Device exists but lacks the requested capability.
    #[error("Device '{device}' is not {capability}")]
    CapabilityMissing {
        /// Device name.
        device: String,
        /// Requested capability, e.g. `moveable`.
        capability: &'static str,
    },
}

impl BeamError {
    /// Build a [`BeamError::Limit`].
    pub fn limit(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Limit {
            device: device.into(),
            message: message.into(),
        }
    }

    /// Build a [`BeamError::Usage`].
    pub fn usage(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Usage {
            device: device.into(),
            message: message.into(),
        }
    }

    /// Build a [`BeamError::Move`].
    pub fn move_error(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Move {
            device: device.into(),
            message: message.into(),
        }
    }

    /// Build a [`BeamError::Position`].
    pub fn position(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Position {
            device: device.into(),
            message: message.into(),
        }
    }

    /// Whether another attempt at the same operation may succeed.
    ///
    /// Limit, usage and configuration problems are deterministic and are
    /// never retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            BeamError::Move { .. } | BeamError::Position { .. } => true,
            BeamError::Driver(err) => err.kind.is_transient(),
            BeamError::Io(_) => true,
            _ => false,
        }
    }
}

impl From<figment::Error> for BeamError {
    fn from(err: figment::Error) -> Self {
        BeamError::Config(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BeamError::limit("sth", "target 400 outside [-180, 180]");
        assert_eq!(
            err.to_string(),
            "sth: limit error: target 400 outside [-180, 180]"
        );
    }

    #[test]
    fn test_driver_error_display() {
        let err = BeamError::Driver(DriverError::new(
            "mock_motor",
            DriverErrorKind::Communication,
            "no answer from controller",
        ));
        assert!(err
            .to_string()
            .contains("Driver 'mock_motor' communication error"));
    }

    #[test]
    fn test_validation_errors_are_not_retried() {
        assert!(!BeamError::limit("a", "b").is_retryable());
        assert!(!BeamError::usage("a", "b").is_retryable());
        assert!(!BeamError::Configuration("bad".into()).is_retryable());
        assert!(!BeamError::Timeout {
            device: "a".into(),
            seconds: 1.0
        }
        .is_retryable());
    }

    #[test]
    fn test_transient_faults_are_retried() {
        assert!(BeamError::move_error("a", "fault").is_retryable());
        assert!(BeamError::Driver(DriverError::new(
            "mock_motor",
            DriverErrorKind::Hardware,
            "stall"
        ))
        .is_retryable());
        assert!(!BeamError::Driver(DriverError::new(
            "mock_motor",
            DriverErrorKind::InvalidParameter,
            "speed"
        ))
        .is_retryable());
    }
}
