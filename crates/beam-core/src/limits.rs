//! Position limits and shared timing constants.
//!
//! This module centralizes:
//! - The [`Limits`] interval type used for absolute and user limits
//! - Timing constants of the motion layer and the poller
//!
//! Using centralized constants ensures the slit, axis and poller agree on
//! their timing and makes tuning easier.

use crate::error::{AppResult, BeamError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// =============================================================================
// Timing Constants
// =============================================================================

/// Delay between starting the first and the second blade of a slit pair.
pub const SLIT_SETTLE_DELAY: Duration = Duration::from_millis(250);

/// Poll interval used while a device is known to be moving.
pub const MOVING_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Fixed backoff before retrying to create a device that failed to build.
pub const DEVICE_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Default poll interval when neither device nor setup configures one.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Consecutive poll failures that are logged before the worker goes quiet.
pub const POLL_ERROR_LOG_LIMIT: u32 = 5;

/// Factor applied to the poll interval once the log limit is exceeded.
pub const POLL_ERROR_BACKOFF_FACTOR: u32 = 5;

/// Default delay between two polls of an axis wait loop.
pub const DEFAULT_LOOP_DELAY: Duration = Duration::from_millis(300);

// =============================================================================
// Limits
// =============================================================================

/// Closed interval `[min, max]` of allowed positions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Limits {
    /// Lowest allowed position.
    pub min: f64,
    /// Highest allowed position.
    pub max: f64,
}

impl Limits {
    /// Create limits, rejecting `min > max` and non-finite bounds.
    pub fn new(min: f64, max: f64) -> AppResult<Self> {
        if !min.is_finite() || !max.is_finite() {
            return Err(BeamError::Configuration(format!(
                "limits must be finite, got [{}, {}]",
                min, max
            )));
        }
        if min > max {
            return Err(BeamError::Configuration(format!(
                "lower limit {} above upper limit {}",
                min, max
            )));
        }
        Ok(Self { min, max })
    }

    /// Limits that accept every finite position.
    pub fn unbounded() -> Self {
        Self {
            min: f64::MIN,
            max: f64::MAX,
        }
    }

    /// True if `value` lies inside the interval.
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    /// True if `other` is a subset of `self`.
    pub fn encloses(&self, other: &Limits) -> bool {
        other.min >= self.min && other.max <= self.max
    }

    /// Fail with [`BeamError::Limit`] if `value` is outside the interval.
    pub fn check(&self, device: &str, value: f64) -> AppResult<()> {
        if value.is_nan() {
            return Err(BeamError::limit(device, "target is not a number"));
        }
        if value < self.min {
            return Err(BeamError::limit(
                device,
                format!("target {} below lower limit {}", value, self.min),
            ));
        }
        if value > self.max {
            return Err(BeamError::limit(
                device,
                format!("target {} above upper limit {}", value, self.max),
            ));
        }
        Ok(())
    }

    /// Shift the interval by `delta` (used to express limits in another frame).
    pub fn shifted(&self, delta: f64) -> Self {
        Self {
            min: self.min + delta,
            max: self.max + delta,
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self::unbounded()
    }
}

/// Absolute limits plus the user limits nested inside them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimitPair {
    absolute: Limits,
    user: Limits,
}

impl LimitPair {
    /// Create a pair; user limits default to the absolute limits.
    pub fn new(absolute: Limits, user: Option<Limits>) -> AppResult<Self> {
        let user = user.unwrap_or(absolute);
        if !absolute.encloses(&user) {
            return Err(BeamError::Configuration(format!(
                "user limits [{}, {}] exceed absolute limits [{}, {}]",
                user.min, user.max, absolute.min, absolute.max
            )));
        }
        Ok(Self { absolute, user })
    }

    /// Absolute (hardware) limits.
    pub fn absolute(&self) -> Limits {
        self.absolute
    }

    /// Currently active user limits.
    pub fn user(&self) -> Limits {
        self.user
    }

    /// Replace the user limits, keeping them inside the absolute limits.
    pub fn set_user(&mut self, device: &str, user: Limits) -> AppResult<()> {
        if !self.absolute.encloses(&user) {
            return Err(BeamError::limit(
                device,
                format!(
                    "user limits [{}, {}] exceed absolute limits [{}, {}]",
                    user.min, user.max, self.absolute.min, self.absolute.max
                ),
            ));
        }
        self.user = user;
        Ok(())
    }
}
