//! Motor/coder axis with backlash compensation, drag-error detection and
//! bounded retries.
//!
//! An [`Axis`] drives one motor and reads its position either from the motor
//! itself or from a separate coder. Optional observers are watched during the
//! move; if any of them (or the coder) drifts away from the motor by more
//! than `dragerror`, the motor is stopped and the attempt counts as failed.
//!
//! # Positioning
//!
//! ```text
//! start(target)
//!   │  user limits, motor is_allowed      ──► LimitError (nothing changes)
//!   ▼
//! attempt 1..=maxtries
//!   │  [overshoot to target+backlash]     (only when approaching from the
//!   │  final approach to target            "wrong" side)
//!   │      every loopdelay:
//!   │        stop requested               ──► done, status OK "stopped"
//!   │        timeout elapsed              ──► TimeoutError, not retried
//!   │        motor ERROR                  ──► attempt failed (MoveError)
//!   │        coder/observer drag          ──► stop motor, attempt failed
//!   │        moving away from target      ──► stop motor, attempt failed
//!   │        idle, within precision       ──► SETTLED
//!   │        idle, not within precision   ──► attempt failed (PositionError)
//!   ▼
//! all attempts failed                     ──► MoveError / PositionError
//! ```
//!
//! Offsets live in exactly one place: every value handed to the motor is
//! `target + offset`, every value returned by `read` is `feedback - offset`.

use async_trait::async_trait;
use beam_core::cache::{Cache, KEY_TARGET};
use beam_core::capabilities::{Moveable, Readable};
use beam_core::config::parse_settings;
use beam_core::driver::{attachment_names, DeviceComponents, DriverFactory};
use beam_core::error::{AppResult, BeamError};
use beam_core::limits::{LimitPair, Limits, DEFAULT_LOOP_DELAY};
use beam_core::registry::BuildContext;
use beam_core::status::{DeviceStatus, StatusCode};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

const DRIVER_TYPE: &str = "axis";

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for an [`Axis`].
#[derive(Debug, Clone, Deserialize)]
pub struct AxisConfig {
    /// Motor device name
    pub motor: String,

    /// Coder device name; position feedback comes from the motor when unset
    #[serde(default)]
    pub coder: Option<String>,

    /// Observer device names checked for drag errors
    #[serde(default)]
    pub obs: Vec<String>,

    /// Tolerance for "at target"
    pub precision: f64,

    /// Overshoot distance for backlash compensation; 0 disables it
    #[serde(default)]
    pub backlash: f64,

    /// Subtracted on read, added on write
    #[serde(default)]
    pub offset: f64,

    /// Positioning attempts before giving up (default: 3)
    #[serde(default = "default_maxtries")]
    pub maxtries: u32,

    /// Delay between two checks of the wait loop (default: 300ms)
    #[serde(default = "default_loopdelay", with = "humantime_serde")]
    pub loopdelay: Duration,

    /// Largest tolerated coder/observer discrepancy (default: 1.0)
    #[serde(default = "default_dragerror")]
    pub dragerror: f64,

    /// Per-attempt wait limit; unlimited when unset
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,

    /// Absolute limits in axis coordinates; derived from the motor when unset
    #[serde(default)]
    pub abslimits: Option<(f64, f64)>,

    /// User limits, must lie within the absolute limits
    #[serde(default)]
    pub userlimits: Option<(f64, f64)>,

    /// Unit; taken from the motor when unset
    #[serde(default)]
    pub unit: Option<String>,

    /// Poll interval for the poller
    #[serde(default, with = "humantime_serde")]
    pub pollinterval: Option<Duration>,
}

fn default_maxtries() -> u32 {
    3
}

fn default_loopdelay() -> Duration {
    DEFAULT_LOOP_DELAY
}

fn default_dragerror() -> f64 {
    1.0
}

impl AxisConfig {
    /// Configuration with defaults for everything but motor and precision.
    pub fn new(motor: impl Into<String>, precision: f64) -> Self {
        Self {
            motor: motor.into(),
            coder: None,
            obs: Vec::new(),
            precision,
            backlash: 0.0,
            offset: 0.0,
            maxtries: default_maxtries(),
            loopdelay: default_loopdelay(),
            dragerror: default_dragerror(),
            timeout: None,
            abslimits: None,
            userlimits: None,
            unit: None,
            pollinterval: None,
        }
    }

    /// Check value ranges.
    pub fn validate(&self) -> AppResult<()> {
        let fail = |msg: String| Err(BeamError::Configuration(msg));
        if !self.precision.is_finite() || self.precision < 0.0 {
            return fail(format!("precision must be >= 0, got {}", self.precision));
        }
        if !self.backlash.is_finite() || !self.offset.is_finite() {
            return fail("backlash and offset must be finite".to_string());
        }
        if self.maxtries < 1 {
            return fail("maxtries must be at least 1".to_string());
        }
        if self.loopdelay.is_zero() {
            return fail("loopdelay must be positive".to_string());
        }
        if self.dragerror.is_nan() || self.dragerror <= 0.0 {
            return fail(format!("dragerror must be positive, got {}", self.dragerror));
        }
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return fail("timeout must be positive".to_string());
        }
        if let Some((min, max)) = self.abslimits {
            let abs = Limits::new(min, max)?;
            if let Some((umin, umax)) = self.userlimits {
                LimitPair::new(abs, Some(Limits::new(umin, umax)?))?;
            }
        } else if let Some((umin, umax)) = self.userlimits {
            Limits::new(umin, umax)?;
        }
        Ok(())
    }
}

// =============================================================================
// AxisFactory - DriverFactory implementation
// =============================================================================

/// Factory for creating [`Axis`] instances.
pub struct AxisFactory;

impl DriverFactory for AxisFactory {
    fn driver_type(&self) -> &'static str {
        DRIVER_TYPE
    }

    fn name(&self) -> &'static str {
        "Motor/coder axis"
    }

    fn validate(&self, config: &toml::Value) -> AppResult<()> {
        let cfg: AxisConfig = parse_settings(DRIVER_TYPE, config.clone())?;
        cfg.validate()
    }

    fn attachments(&self, config: &toml::Value) -> Vec<String> {
        attachment_names(config, &["motor", "coder", "obs"])
    }

    fn build(
        &self,
        ctx: BuildContext,
        config: toml::Value,
    ) -> BoxFuture<'static, AppResult<DeviceComponents>> {
        Box::pin(async move {
            let cfg: AxisConfig = parse_settings(ctx.name(), config)?;
            let motor = ctx.moveable(&cfg.motor).await?;
            let coder = match &cfg.coder {
                Some(name) if *name != cfg.motor => Some(ctx.readable(name).await?),
                _ => None,
            };
            let mut observers = Vec::with_capacity(cfg.obs.len());
            for name in &cfg.obs {
                observers.push(ctx.readable(name).await?);
            }
            let axis = Axis::new(ctx.name(), cfg, motor, coder, observers)?.with_cache(ctx.cache());
            Ok(DeviceComponents::new().with_moveable(Arc::new(axis)))
        })
    }
}

// =============================================================================
// Axis
// =============================================================================

/// How a single drive leg ended.
enum Leg {
    Settled,
    Stopped,
}

struct AxisInner {
    name: String,
    unit: String,
    config: AxisConfig,
    motor: Arc<dyn Moveable>,
    coder: Option<Arc<dyn Readable>>,
    observers: Vec<Arc<dyn Readable>>,
    cache: Option<Arc<dyn Cache>>,
    limits: Mutex<LimitPair>,
    status: Mutex<DeviceStatus>,
    target: Mutex<Option<f64>>,
    stop_requested: AtomicBool,
}

/// Composite positioning device: motor, optional coder, observers.
///
/// # Example
///
/// ```rust,ignore
/// let mut cfg = AxisConfig::new("m_sth", 0.01);
/// cfg.backlash = -0.5;
/// let axis = Axis::new("sth", cfg, motor, Some(coder), vec![])?;
///
/// axis.move_to(12.5).await?;
/// assert!((axis.read(None).await? - 12.5).abs() <= 0.01);
/// ```
pub struct Axis {
    inner: Arc<AxisInner>,
    task: Mutex<Option<JoinHandle<AppResult<()>>>>,
}

impl Axis {
    /// Create an axis from resolved attachments.
    ///
    /// A coder that is the motor itself is ignored.
    pub fn new(
        name: impl Into<String>,
        config: AxisConfig,
        motor: Arc<dyn Moveable>,
        coder: Option<Arc<dyn Readable>>,
        observers: Vec<Arc<dyn Readable>>,
    ) -> AppResult<Self> {
        let name = name.into();
        config.validate().map_err(|e| match e {
            BeamError::Configuration(msg) => {
                BeamError::Configuration(format!("device '{}': {}", name, msg))
            }
            other => other,
        })?;

        let coder = coder.filter(|c| !same_device(c, &motor));
        let absolute = match config.abslimits {
            Some((min, max)) => Limits::new(min, max)?,
            None => motor.user_limits().shifted(-config.offset),
        };
        let user = config
            .userlimits
            .map(|(min, max)| Limits::new(min, max))
            .transpose()?;
        let limits = LimitPair::new(absolute, user)?;
        let unit = config
            .unit
            .clone()
            .unwrap_or_else(|| motor.unit().to_string());

        Ok(Self {
            inner: Arc::new(AxisInner {
                name,
                unit,
                config,
                motor,
                coder,
                observers,
                cache: None,
                limits: Mutex::new(limits),
                status: Mutex::new(DeviceStatus::ok()),
                target: Mutex::new(None),
                stop_requested: AtomicBool::new(false),
            }),
            task: Mutex::new(None),
        })
    }

    /// Publish targets into `cache` when a move starts.
    pub fn with_cache(mut self, cache: Arc<dyn Cache>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.cache = Some(cache);
        }
        self
    }

    /// Absolute limits in axis coordinates.
    pub fn abslimits(&self) -> Limits {
        self.inner.limits.lock().absolute()
    }

    /// Replace the user limits; they must lie within the absolute limits.
    pub fn set_userlimits(&self, min: f64, max: f64) -> AppResult<()> {
        let user = Limits::new(min, max)
            .map_err(|e| BeamError::limit(&self.inner.name, e.to_string()))?;
        self.inner.limits.lock().set_user(&self.inner.name, user)?;
        info!(device = %self.inner.name, min, max, "user limits changed");
        Ok(())
    }

    /// Tolerance for "at target".
    pub fn precision(&self) -> f64 {
        self.inner.config.precision
    }

    /// Offset between axis and motor coordinates.
    pub fn offset(&self) -> f64 {
        self.inner.config.offset
    }

    /// Whether a positioning task is in flight.
    pub fn is_moving(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

/// True if both handles point at the same device object.
fn same_device(coder: &Arc<dyn Readable>, motor: &Arc<dyn Moveable>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(coder) as *const (),
        Arc::as_ptr(motor) as *const (),
    )
}

impl AxisInner {
    fn stopped(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Feedback position in motor coordinates.
    async fn feedback(&self, max_age: Option<Duration>) -> AppResult<f64> {
        match &self.coder {
            Some(coder) => coder.read(max_age).await,
            None => self.motor.read(max_age).await,
        }
    }

    /// Run attempts until one settles, then record the final status.
    async fn position(self: Arc<Self>, target: f64) -> AppResult<()> {
        let result = self.run_attempts(target).await;
        let status = match &result {
            Ok(()) if self.stopped() => DeviceStatus::new(StatusCode::Ok, "stopped"),
            Ok(()) => {
                info!(device = %self.name, target, "target reached");
                DeviceStatus::ok()
            }
            Err(e) => {
                error!(device = %self.name, target, error = %e, "positioning failed");
                DeviceStatus::error(e.to_string())
            }
        };
        *self.status.lock() = status;
        result
    }

    async fn run_attempts(&self, target: f64) -> AppResult<()> {
        let maxtries = self.config.maxtries;
        let mut last_failure = None;
        for attempt in 1..=maxtries {
            if self.stopped() {
                return Ok(());
            }
            match self.attempt(target).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_retryable() => {
                    warn!(
                        device = %self.name,
                        attempt,
                        maxtries,
                        error = %e,
                        "positioning attempt failed"
                    );
                    last_failure = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(match last_failure {
            Some(BeamError::Position { message, .. }) => BeamError::position(
                &self.name,
                format!("{} (gave up after {} attempts)", message, maxtries),
            ),
            Some(other) => BeamError::move_error(
                &self.name,
                format!("{} (gave up after {} attempts)", other, maxtries),
            ),
            None => BeamError::move_error(&self.name, "no positioning attempt made"),
        })
    }

    /// One positioning attempt: optional overshoot, then the final approach.
    async fn attempt(&self, target: f64) -> AppResult<Leg> {
        let motor_target = target + self.config.offset;
        let backlash = self.config.backlash;

        let mut legs = Vec::with_capacity(2);
        if backlash != 0.0 {
            let current = self.feedback(Some(Duration::ZERO)).await?;
            if (backlash > 0.0 && current < motor_target) || (backlash < 0.0 && current > motor_target)
            {
                let overshoot = motor_target + backlash;
                match self.motor.is_allowed(overshoot).await {
                    Ok(()) => legs.push((overshoot, false)),
                    Err(reason) => debug!(
                        device = %self.name,
                        overshoot,
                        reason = %reason,
                        "backlash overshoot not allowed, approaching directly"
                    ),
                }
            }
        }
        legs.push((motor_target, true));

        for (leg_target, precise) in legs {
            if let Leg::Stopped = self.drive(leg_target, precise).await? {
                return Ok(Leg::Stopped);
            }
        }
        Ok(Leg::Settled)
    }

    /// Start the motor towards `leg_target` (motor coordinates) and watch it.
    async fn drive(&self, leg_target: f64, precise: bool) -> AppResult<Leg> {
        if self.stopped() {
            return Ok(Leg::Stopped);
        }
        debug!(device = %self.name, leg_target, precise, "starting motor");
        self.motor.start(leg_target).await?;

        let started = Instant::now();
        let mut best = f64::INFINITY;
        loop {
            sleep(self.config.loopdelay).await;

            if self.stopped() {
                // covers a start that raced with stop()
                self.motor.stop().await?;
                return Ok(Leg::Stopped);
            }
            if let Some(timeout) = self.config.timeout {
                let elapsed = started.elapsed();
                if elapsed > timeout {
                    self.motor.stop().await?;
                    return Err(BeamError::Timeout {
                        device: self.name.clone(),
                        seconds: elapsed.as_secs_f64(),
                    });
                }
            }

            let status = self.motor.status(Some(Duration::ZERO)).await?;
            if status.code == StatusCode::Error {
                return Err(BeamError::move_error(
                    &self.name,
                    format!("motor {} reports {}", self.motor.name(), status),
                ));
            }

            let motor_pos = self.motor.read(Some(Duration::ZERO)).await?;
            let position = match &self.coder {
                Some(coder) => {
                    let coder_pos = coder.read(Some(Duration::ZERO)).await?;
                    self.check_drag(coder.name(), coder_pos, motor_pos).await?;
                    coder_pos
                }
                None => motor_pos,
            };
            for observer in &self.observers {
                let value = observer.read(Some(Duration::ZERO)).await?;
                self.check_drag(observer.name(), value, motor_pos).await?;
            }

            let distance = (position - leg_target).abs();
            debug!(device = %self.name, position, distance, status = %status.code, "wait loop");

            if status.code != StatusCode::Busy {
                if !precise || distance <= self.config.precision {
                    return Ok(Leg::Settled);
                }
                return Err(BeamError::position(
                    &self.name,
                    format!(
                        "target {} not reached, motor stopped at {}",
                        leg_target - self.config.offset,
                        position - self.config.offset
                    ),
                ));
            }

            if distance > best + self.config.dragerror {
                self.motor.stop().await?;
                return Err(BeamError::position(
                    &self.name,
                    format!(
                        "moving away from target {} (distance {} after {})",
                        leg_target - self.config.offset,
                        distance,
                        best
                    ),
                ));
            }
            best = best.min(distance);
        }
    }

    async fn check_drag(&self, source: &str, value: f64, motor_pos: f64) -> AppResult<()> {
        let diff = (value - motor_pos).abs();
        if diff > self.config.dragerror {
            self.motor.stop().await?;
            return Err(BeamError::position(
                &self.name,
                format!(
                    "drag error: {} reads {}, motor {} reads {} (allowed {})",
                    source,
                    value,
                    self.motor.name(),
                    motor_pos,
                    self.config.dragerror
                ),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Readable for Axis {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn unit(&self) -> &str {
        &self.inner.unit
    }

    async fn read(&self, max_age: Option<Duration>) -> AppResult<f64> {
        Ok(self.inner.feedback(max_age).await? - self.inner.config.offset)
    }

    async fn status(&self, max_age: Option<Duration>) -> AppResult<DeviceStatus> {
        let own = self.inner.status.lock().clone();
        if matches!(own.code, StatusCode::Busy | StatusCode::Error) {
            return Ok(own);
        }
        let motor = self.inner.motor.status(max_age).await?;
        Ok(if motor.code > own.code { motor } else { own })
    }

    fn poll_interval(&self) -> Option<Duration> {
        self.inner.config.pollinterval
    }
}

#[async_trait]
impl Moveable for Axis {
    async fn start(&self, target: f64) -> AppResult<()> {
        let name = &self.inner.name;
        if self.is_moving() {
            return Err(BeamError::usage(name, "axis is already moving"));
        }
        self.inner.limits.lock().user().check(name, target)?;
        if let Err(reason) = self
            .inner
            .motor
            .is_allowed(target + self.inner.config.offset)
            .await
        {
            return Err(BeamError::limit(
                name,
                format!("motor {}: {}", self.inner.motor.name(), reason),
            ));
        }

        info!(device = %name, target, "starting move");
        *self.inner.target.lock() = Some(target);
        if let Some(cache) = &self.inner.cache {
            cache.put(name, KEY_TARGET, serde_json::Value::from(target));
        }
        self.inner.stop_requested.store(false, Ordering::SeqCst);
        *self.inner.status.lock() = DeviceStatus::busy(format!("moving to {}", target));

        let inner = self.inner.clone();
        *self.task.lock() = Some(tokio::spawn(inner.position(target)));
        Ok(())
    }

    async fn stop(&self) -> AppResult<()> {
        self.inner.stop_requested.store(true, Ordering::SeqCst);
        self.inner.motor.stop().await?;
        *self.inner.status.lock() = DeviceStatus::new(StatusCode::Ok, "stopped");
        debug!(device = %self.inner.name, "stop requested");
        Ok(())
    }

    async fn wait(&self) -> AppResult<()> {
        let handle = self.task.lock().take();
        match handle {
            Some(handle) => handle.await.map_err(|e| {
                BeamError::move_error(&self.inner.name, format!("positioning task failed: {}", e))
            })?,
            None => Ok(()),
        }
    }

    async fn is_allowed(&self, target: f64) -> Result<(), String> {
        self.inner
            .limits
            .lock()
            .user()
            .check(&self.inner.name, target)
            .map_err(|e| e.to_string())?;
        self.inner
            .motor
            .is_allowed(target + self.inner.config.offset)
            .await
            .map_err(|reason| format!("motor {}: {}", self.inner.motor.name(), reason))
    }

    fn user_limits(&self) -> Limits {
        self.inner.limits.lock().user()
    }

    fn target(&self) -> Option<f64> {
        *self.inner.target.lock()
    }

    async fn reset(&self) -> AppResult<()> {
        if self.is_moving() {
            return Err(BeamError::usage(&self.inner.name, "cannot reset while moving"));
        }
        self.inner.motor.reset().await?;
        let mut status = self.inner.status.lock();
        if status.code == StatusCode::Error {
            info!(device = %self.inner.name, previous = %status.message, "error state cleared");
        }
        *status = DeviceStatus::ok();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beam_core::cache::InMemoryCache;
    use beam_driver_mock::{ErrorConfig, ErrorScenario, MockCoder, MockMode, MockMotor, MockSensor};

    fn instant_axis(motor: Arc<MockMotor>, cfg: AxisConfig) -> Axis {
        Axis::new("ax", cfg, motor, None, vec![]).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_offset_applied_once() {
        let motor = Arc::new(MockMotor::new("m"));
        let mut cfg = AxisConfig::new("m", 0.01);
        cfg.offset = 2.5;
        let axis = instant_axis(motor.clone(), cfg);

        axis.move_to(10.0).await.unwrap();
        assert_eq!(axis.read(None).await.unwrap(), 10.0);
        assert_eq!(motor.read(None).await.unwrap(), 12.5);
        assert_eq!(axis.target(), Some(10.0));
        assert_eq!(axis.status(None).await.unwrap().code, StatusCode::Ok);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backlash_overshoot_only_from_wrong_side() {
        let journal = beam_driver_mock::MotionJournal::new();
        let motor = Arc::new(MockMotor::builder("m").journal(journal.clone()).build());
        let mut cfg = AxisConfig::new("m", 0.01);
        cfg.backlash = 1.0;
        let axis = instant_axis(motor.clone(), cfg);

        // from below: overshoot above, then come down
        axis.move_to(5.0).await.unwrap();
        let targets: Vec<f64> = journal.entries().iter().map(|e| e.target).collect();
        assert_eq!(targets, vec![6.0, 5.0]);

        // from above: direct
        journal.clear();
        axis.move_to(3.0).await.unwrap();
        let targets: Vec<f64> = journal.entries().iter().map(|e| e.target).collect();
        assert_eq!(targets, vec![3.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backlash_near_limit_approaches_directly() {
        let journal = beam_driver_mock::MotionJournal::new();
        let motor = Arc::new(
            MockMotor::builder("m")
                .limits(Limits::new(0.0, 10.0).unwrap())
                .journal(journal.clone())
                .build(),
        );
        let mut cfg = AxisConfig::new("m", 0.01);
        cfg.backlash = 1.0;
        let axis = instant_axis(motor.clone(), cfg);

        assert!(axis.is_allowed(9.5).await.is_ok());
        axis.move_to(9.5).await.unwrap();
        assert_eq!(axis.read(None).await.unwrap(), 9.5);
        assert_eq!(axis.status(None).await.unwrap().code, StatusCode::Ok);
        let targets: Vec<f64> = journal.entries().iter().map(|e| e.target).collect();
        assert_eq!(targets, vec![9.5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_success() {
        let motor = Arc::new(
            MockMotor::builder("m")
                .error_config(ErrorConfig::scenario(ErrorScenario::FailFirstN {
                    operation: "start",
                    count: 2,
                }))
                .build(),
        );
        let axis = instant_axis(motor.clone(), AxisConfig::new("m", 0.01));

        axis.move_to(4.0).await.unwrap();
        assert_eq!(motor.start_count(), 3);
        assert_eq!(axis.read(None).await.unwrap(), 4.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_timeout_is_retried() {
        let motor = Arc::new(
            MockMotor::builder("m")
                .error_config(ErrorConfig::scenario(ErrorScenario::Timeout {
                    operation: "start",
                }))
                .build(),
        );
        let axis = instant_axis(motor.clone(), AxisConfig::new("m", 0.01));

        let err = axis.move_to(4.0).await.unwrap_err();
        assert!(matches!(err, BeamError::Move { .. }), "{}", err);
        assert!(err.to_string().contains("timed out"), "{}", err);
        assert!(err.to_string().contains("after 3 attempts"), "{}", err);
        assert_eq!(motor.start_count(), 3);
        assert_eq!(axis.read(None).await.unwrap(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_motor_gives_position_error() {
        let motor = Arc::new(MockMotor::builder("m").stall_at(2.0).build());
        let mut cfg = AxisConfig::new("m", 0.01);
        cfg.maxtries = 4;
        let axis = instant_axis(motor.clone(), cfg);

        let err = axis.move_to(5.0).await.unwrap_err();
        assert!(matches!(err, BeamError::Position { .. }), "{}", err);
        assert_eq!(motor.start_count(), 4);
        assert_eq!(axis.status(None).await.unwrap().code, StatusCode::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_coder_drag_error_stops_motor() {
        let motor = Arc::new(MockMotor::new("m"));
        let coder: Arc<dyn Readable> =
            Arc::new(MockCoder::following("c", motor.clone()).with_offset(2.0));
        let mut cfg = AxisConfig::new("m", 0.01);
        cfg.dragerror = 0.5;
        cfg.maxtries = 2;
        let axis = Axis::new("ax", cfg, motor.clone(), Some(coder), vec![]).unwrap();

        let err = axis.move_to(1.0).await.unwrap_err();
        assert!(err.to_string().contains("drag error"), "{}", err);
        assert_eq!(motor.start_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_observer_drag_error() {
        let motor = Arc::new(MockMotor::new("m"));
        let observer: Arc<dyn Readable> = Arc::new(MockSensor::new("obs", 50.0));
        let mut cfg = AxisConfig::new("m", 0.01);
        cfg.dragerror = 0.5;
        cfg.maxtries = 1;
        let axis = Axis::new("ax", cfg, motor, None, vec![observer]).unwrap();

        let err = axis.move_to(1.0).await.unwrap_err();
        assert!(err.to_string().contains("obs reads 50"), "{}", err);
    }

    #[tokio::test(start_paused = true)]
    async fn test_coder_that_is_the_motor_is_ignored() {
        let motor = Arc::new(MockMotor::new("m"));
        let as_readable: Arc<dyn Readable> = motor.clone();
        let axis = Axis::new("ax", AxisConfig::new("m", 0.01), motor, Some(as_readable), vec![])
            .unwrap();
        assert!(axis.inner.coder.is_none());
        axis.move_to(2.0).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_not_retried() {
        let motor = Arc::new(
            MockMotor::builder("m")
                .mode(MockMode::Realistic)
                .speed(1.0)
                .build(),
        );
        let mut cfg = AxisConfig::new("m", 0.01);
        cfg.timeout = Some(Duration::from_secs(2));
        let axis = instant_axis(motor.clone(), cfg);

        let err = axis.move_to(100.0).await.unwrap_err();
        assert!(matches!(err, BeamError::Timeout { .. }), "{}", err);
        assert_eq!(motor.start_count(), 1);
        assert!(!motor.is_moving());
        assert_eq!(axis.status(None).await.unwrap().code, StatusCode::Error);

        axis.reset().await.unwrap();
        assert_eq!(axis.status(None).await.unwrap().code, StatusCode::Ok);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_move_cleanly() {
        let motor = Arc::new(
            MockMotor::builder("m")
                .mode(MockMode::Realistic)
                .speed(1.0)
                .build(),
        );
        let axis = instant_axis(motor.clone(), AxisConfig::new("m", 0.01));

        axis.start(50.0).await.unwrap();
        assert!(axis.status(None).await.unwrap().is_busy());
        assert!(matches!(
            axis.start(10.0).await,
            Err(BeamError::Usage { .. })
        ));

        sleep(Duration::from_secs(3)).await;
        axis.stop().await.unwrap();
        axis.wait().await.unwrap();

        let status = axis.status(None).await.unwrap();
        assert_eq!(status.code, StatusCode::Ok);
        assert_eq!(status.message, "stopped");
        assert!(!motor.is_moving());
        let position = axis.read(None).await.unwrap();
        assert!(position > 2.0 && position < 4.0, "{}", position);

        // idempotent
        axis.stop().await.unwrap();
        axis.wait().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_target_published_to_cache() {
        let cache = Arc::new(InMemoryCache::new());
        let motor = Arc::new(MockMotor::new("m"));
        let axis = instant_axis(motor, AxisConfig::new("m", 0.01)).with_cache(cache.clone());

        axis.move_to(7.0).await.unwrap();
        let entry = cache.get("ax", KEY_TARGET).unwrap();
        assert_eq!(entry.value, serde_json::json!(7.0));
    }

    #[tokio::test]
    async fn test_limits_from_motor_and_userlimits() {
        let motor = Arc::new(
            MockMotor::builder("m")
                .limits(Limits::new(0.0, 100.0).unwrap())
                .build(),
        );
        let mut cfg = AxisConfig::new("m", 0.01);
        cfg.offset = 10.0;
        let axis = instant_axis(motor, cfg);

        // motor [0, 100] seen through offset 10
        assert_eq!(axis.abslimits(), Limits::new(-10.0, 90.0).unwrap());
        axis.set_userlimits(0.0, 50.0).unwrap();
        assert_eq!(axis.user_limits().max, 50.0);
        assert!(axis.set_userlimits(-20.0, 50.0).is_err());
        assert!(axis.is_allowed(60.0).await.is_err());
        assert!(axis.is_allowed(40.0).await.is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut cfg = AxisConfig::new("m", -1.0);
        assert!(cfg.validate().is_err());
        cfg.precision = 0.1;
        cfg.maxtries = 0;
        assert!(cfg.validate().is_err());
        cfg.maxtries = 1;
        cfg.abslimits = Some((0.0, 10.0));
        cfg.userlimits = Some((-1.0, 5.0));
        assert!(cfg.validate().is_err());
        cfg.userlimits = Some((1.0, 5.0));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_config_from_toml() {
        let value: toml::Value = toml::from_str(
            r#"
            motor = "m_sth"
            coder = "c_sth"
            obs = ["o1"]
            precision = 0.01
            backlash = -0.5
            loopdelay = "100ms"
            timeout = "1m"
            "#,
        )
        .unwrap();
        let cfg: AxisConfig = parse_settings("sth", value.clone()).unwrap();
        assert_eq!(cfg.loopdelay, Duration::from_millis(100));
        assert_eq!(cfg.timeout, Some(Duration::from_secs(60)));
        assert_eq!(cfg.maxtries, 3);
        assert_eq!(
            AxisFactory.attachments(&value),
            vec!["m_sth", "c_sth", "o1"]
        );
    }
}
