//! Device status model.
//!
//! Every device reports a [`StatusCode`] paired with a human-readable message.
//! Codes are ordered by severity so that composite devices can aggregate their
//! parts with a plain `max()`.

use serde::{Deserialize, Serialize};

/// Status code of a device, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusCode {
    /// Idle and healthy.
    Ok = 0,
    /// Moving or otherwise busy.
    Busy = 1,
    /// Idle, but the last target was not reached.
    NotReached = 2,
    /// Fault; operator attention required.
    Error = 3,
    /// Status cannot be determined.
    Unknown = 4,
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusCode::Ok => write!(f, "OK"),
            StatusCode::Busy => write!(f, "BUSY"),
            StatusCode::NotReached => write!(f, "NOTREACHED"),
            StatusCode::Error => write!(f, "ERROR"),
            StatusCode::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Status code plus message, as returned by `Readable::status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    /// Severity.
    pub code: StatusCode,
    /// Free-form detail, may be empty.
    pub message: String,
}

impl DeviceStatus {
    /// Create a status with a message.
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// `OK` with the conventional "idle" message.
    pub fn ok() -> Self {
        Self::new(StatusCode::Ok, "idle")
    }

    /// `BUSY` with a message.
    pub fn busy(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Busy, message)
    }

    /// `ERROR` with a message.
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Error, message)
    }

    /// True while the device is moving.
    pub fn is_busy(&self) -> bool {
        self.code == StatusCode::Busy
    }
}

impl Default for DeviceStatus {
    fn default() -> Self {
        Self::new(StatusCode::Unknown, "not yet read")
    }
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}
