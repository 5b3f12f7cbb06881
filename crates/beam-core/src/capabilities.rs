//! Device Capabilities
//!
//! This module defines the capability traits that devices implement. The
//! motion layer and the poller only ever talk to these traits; which transport
//! sits underneath (serial controller, network server, simulation) is the
//! driver's business.
//!
//! - A motor implements: `Moveable` (and therefore `Readable`)
//! - A coder or a temperature sensor implements: `Readable`
//! - A slit implements: `MultiMoveable` (its position is a tuple)
//! - Anything the poller watches is reachable as a `Pollable`
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Returns [`AppResult`] so callers can classify faults
//!
//! # Example
//!
//! ```rust,ignore
//! async fn park<M: Moveable + ?Sized>(motor: &M) -> AppResult<()> {
//!     motor.move_to(0.0).await?;
//!     let status = motor.status(None).await?;
//!     tracing::info!(device = motor.name(), %status, "parked");
//!     Ok(())
//! }
//! ```

use crate::error::AppResult;
use crate::limits::Limits;
use crate::status::DeviceStatus;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Capability Traits
// =============================================================================

/// Capability: Value Readout
///
/// Devices that report a scalar value and a status (coders, sensors, motors).
///
/// # Contract
/// - `max_age` bounds how stale the answer may be. `None` accepts any value
///   the device already knows; `Some(Duration::ZERO)` asks for a fresh
///   hardware readout. Drivers without a local cache may ignore it.
/// - Values are in the device's [`unit`](Readable::unit).
#[async_trait]
pub trait Readable: Send + Sync {
    /// Device name as configured in the setup.
    fn name(&self) -> &str;

    /// Physical unit of the value.
    fn unit(&self) -> &str {
        ""
    }

    /// Current value.
    async fn read(&self, max_age: Option<Duration>) -> AppResult<f64>;

    /// Current status.
    async fn status(&self, max_age: Option<Duration>) -> AppResult<DeviceStatus>;

    /// Preferred poll interval of this device, if it has one.
    fn poll_interval(&self) -> Option<Duration> {
        None
    }
}

/// Capability: Motion Control
///
/// Devices that can be driven to a target (motors, axes, slit projections).
///
/// # Contract
/// - `start` initiates motion and returns before completion
/// - `wait` blocks until the motion finished and reports its outcome
/// - `stop` halts motion in progress; it is idempotent
/// - `is_allowed` answers whether `start(target)` would be accepted, with the
///   refusal reason on `Err`
#[async_trait]
pub trait Moveable: Readable {
    /// Begin moving to `target`.
    async fn start(&self, target: f64) -> AppResult<()>;

    /// Stop motion in progress.
    async fn stop(&self) -> AppResult<()>;

    /// Wait for the current motion to finish.
    async fn wait(&self) -> AppResult<()>;

    /// Check a target without moving.
    ///
    /// # Default Implementation
    /// Accepts every target inside [`user_limits`](Moveable::user_limits).
    async fn is_allowed(&self, target: f64) -> Result<(), String> {
        let limits = self.user_limits();
        if limits.contains(target) {
            Ok(())
        } else {
            Err(format!(
                "{} outside limits [{}, {}]",
                target, limits.min, limits.max
            ))
        }
    }

    /// Limits currently enforced on `start`.
    fn user_limits(&self) -> Limits {
        Limits::unbounded()
    }

    /// Last requested target, if any.
    fn target(&self) -> Option<f64> {
        None
    }

    /// Clear an error state.
    async fn reset(&self) -> AppResult<()> {
        Ok(())
    }

    /// Start and wait in one call.
    async fn move_to(&self, target: f64) -> AppResult<()> {
        self.start(target).await?;
        self.wait().await
    }
}

/// Capability: Multi-Valued Motion
///
/// Composite devices whose position is a tuple rather than a scalar, such as
/// a four-blade slit. The tuple length depends on the device's current mode.
#[async_trait]
pub trait MultiMoveable: Send + Sync {
    /// Device name as configured in the setup.
    fn name(&self) -> &str;

    /// Number of values `start_values` currently expects.
    fn arity(&self) -> usize;

    /// Current position tuple.
    async fn read_values(&self, max_age: Option<Duration>) -> AppResult<Vec<f64>>;

    /// Current status.
    async fn status(&self, max_age: Option<Duration>) -> AppResult<DeviceStatus>;

    /// Begin moving to `target`.
    async fn start_values(&self, target: &[f64]) -> AppResult<()>;

    /// Check a target tuple without moving.
    async fn is_allowed_values(&self, target: &[f64]) -> Result<(), String>;

    /// Stop motion in progress.
    async fn stop(&self) -> AppResult<()>;

    /// Wait for the current motion to finish.
    async fn wait(&self) -> AppResult<()>;

    /// Clear an error state.
    async fn reset(&self) -> AppResult<()> {
        Ok(())
    }
}

/// Result of one poll cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct PollReading {
    /// Status at poll time.
    pub status: DeviceStatus,
    /// Value at poll time; scalar for plain readables, an array for slits.
    pub value: serde_json::Value,
}

/// Capability: Background Polling
///
/// Anything the poller can sample. Plain [`Readable`]s are adapted through
/// [`PolledReadable`]; composite devices with non-scalar values implement it
/// directly.
#[async_trait]
pub trait Pollable: Send + Sync {
    /// Device name, also used as cache namespace.
    fn name(&self) -> &str;

    /// Preferred poll interval of this device, if it has one.
    fn poll_interval(&self) -> Option<Duration> {
        None
    }

    /// Sample status and value; `cycle` counts up from 1.
    async fn poll(&self, cycle: u64) -> AppResult<PollReading>;
}

/// Adapter exposing a [`Readable`] as a [`Pollable`].
#[derive(Clone)]
pub struct PolledReadable {
    inner: Arc<dyn Readable>,
}

impl PolledReadable {
    /// Wrap a readable.
    pub fn new(inner: Arc<dyn Readable>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Pollable for PolledReadable {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn poll_interval(&self) -> Option<Duration> {
        self.inner.poll_interval()
    }

    async fn poll(&self, _cycle: u64) -> AppResult<PollReading> {
        // status first: a device finishing its move between the two calls
        // then reports its final value together with BUSY, never the reverse
        let status = self.inner.status(Some(Duration::ZERO)).await?;
        let value = self.inner.read(Some(Duration::ZERO)).await?;
        Ok(PollReading {
            status,
            value: serde_json::Value::from(value),
        })
    }
}
