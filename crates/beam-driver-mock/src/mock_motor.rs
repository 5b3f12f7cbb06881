//! Mock motor implementation.

use async_trait::async_trait;
use beam_core::capabilities::{Moveable, Readable};
use beam_core::config::parse_settings;
use beam_core::driver::{DeviceComponents, DriverFactory};
use beam_core::error::{AppResult, BeamError};
use beam_core::limits::Limits;
use beam_core::registry::BuildContext;
use beam_core::status::DeviceStatus;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::common::{ErrorConfig, MockMode, MotionJournal};

const DRIVER_TYPE: &str = "mock_motor";

// =============================================================================
// MockMotorFactory - DriverFactory implementation
// =============================================================================

/// Configuration for MockMotor driver
#[derive(Debug, Clone, Deserialize)]
pub struct MockMotorConfig {
    /// Initial position (default: 0.0)
    #[serde(default)]
    pub initial_position: f64,

    /// Motion speed in units/sec (default: 10.0)
    #[serde(default = "default_speed")]
    pub speed: f64,

    /// Travel range; unbounded when unset
    #[serde(default)]
    pub abslimits: Option<(f64, f64)>,

    /// Operational mode (default: instant)
    #[serde(default)]
    pub mode: MockMode,

    /// Mechanical slack between motor and load (default: 0.0)
    #[serde(default)]
    pub lash: f64,

    /// Unit of the position (default: "mm")
    #[serde(default = "default_unit")]
    pub unit: String,

    /// Random failure probability per operation; defaults from the mode
    #[serde(default)]
    pub failure_rate: Option<f64>,

    /// RNG seed for reproducible failures
    #[serde(default)]
    pub seed: Option<u64>,

    /// Poll interval for the poller
    #[serde(default, with = "humantime_serde")]
    pub pollinterval: Option<Duration>,
}

fn default_speed() -> f64 {
    10.0
}

fn default_unit() -> String {
    "mm".to_string()
}

impl Default for MockMotorConfig {
    fn default() -> Self {
        Self {
            initial_position: 0.0,
            speed: default_speed(),
            abslimits: None,
            mode: MockMode::Instant,
            lash: 0.0,
            unit: default_unit(),
            failure_rate: None,
            seed: None,
            pollinterval: None,
        }
    }
}

impl MockMotorConfig {
    /// Check value ranges.
    pub fn validate(&self) -> AppResult<()> {
        if self.speed.is_nan() || self.speed <= 0.0 {
            return Err(BeamError::Configuration(format!(
                "speed must be positive, got {}",
                self.speed
            )));
        }
        if self.lash < 0.0 {
            return Err(BeamError::Configuration(format!(
                "lash must not be negative, got {}",
                self.lash
            )));
        }
        if let Some(rate) = self.failure_rate {
            if !(0.0..=1.0).contains(&rate) {
                return Err(BeamError::Configuration(format!(
                    "failure_rate must be within [0, 1], got {}",
                    rate
                )));
            }
        }
        let limits = self.limits()?;
        if !limits.contains(self.initial_position) {
            return Err(BeamError::Configuration(format!(
                "initial_position {} outside abslimits [{}, {}]",
                self.initial_position, limits.min, limits.max
            )));
        }
        Ok(())
    }

    fn limits(&self) -> AppResult<Limits> {
        match self.abslimits {
            Some((min, max)) => Limits::new(min, max),
            None => Ok(Limits::unbounded()),
        }
    }
}

/// Factory for creating MockMotor instances.
pub struct MockMotorFactory;

impl DriverFactory for MockMotorFactory {
    fn driver_type(&self) -> &'static str {
        DRIVER_TYPE
    }

    fn name(&self) -> &'static str {
        "Mock Motor"
    }

    fn validate(&self, config: &toml::Value) -> AppResult<()> {
        let cfg: MockMotorConfig = parse_settings(DRIVER_TYPE, config.clone())?;
        cfg.validate()
    }

    fn build(
        &self,
        ctx: BuildContext,
        config: toml::Value,
    ) -> BoxFuture<'static, AppResult<DeviceComponents>> {
        Box::pin(async move {
            let cfg: MockMotorConfig = parse_settings(ctx.name(), config)?;
            let motor = Arc::new(MockMotor::with_config(ctx.name(), cfg)?);
            Ok(DeviceComponents::new().with_moveable(motor))
        })
    }
}

// =============================================================================
// Internal State
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct Motion {
    from: f64,
    to: f64,
    started: Instant,
    duration: Duration,
}

impl Motion {
    fn position_at(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.started);
        if elapsed >= self.duration || self.duration.is_zero() {
            return self.to;
        }
        let fraction = elapsed.as_secs_f64() / self.duration.as_secs_f64();
        self.from + (self.to - self.from) * fraction
    }

    fn finished_at(&self) -> Instant {
        self.started + self.duration
    }
}

#[derive(Debug)]
struct MotorState {
    /// Position when at rest, or at the start of the current motion
    position: f64,
    /// Motion in progress
    motion: Option<Motion>,
    /// Last requested target
    target: Option<f64>,
    /// Sign of the last motion, 0.0 before the first move
    last_direction: f64,
}

impl MotorState {
    /// Fold a finished motion into `position` and return the current position.
    fn settle(&mut self, now: Instant) -> f64 {
        if let Some(motion) = self.motion {
            let position = motion.position_at(now);
            if now >= motion.finished_at() {
                self.position = motion.to;
                self.motion = None;
            }
            position
        } else {
            self.position
        }
    }
}

// =============================================================================
// MockMotor - Simulated Motor
// =============================================================================

/// Mock motor with time-based motion.
///
/// Simulates a stepper/servo axis with:
/// - Linear motion at a configurable speed (Realistic/Chaos modes)
/// - Immediate arrival in Instant mode
/// - Absolute limits enforced on `start`
/// - Mechanical lash between motor and load, visible through
///   [`MockMotor::load_position`]
/// - A blocking obstacle ([`MockMotorBuilder::stall_at`])
/// - Error injection for testing
/// - An optional shared [`MotionJournal`] recording every start
///
/// # Example
///
/// ```rust,ignore
/// let motor = MockMotor::builder("m_sth")
///     .mode(MockMode::Realistic)
///     .speed(2.0)
///     .limits(Limits::new(-180.0, 180.0)?)
///     .build();
///
/// motor.move_to(10.0).await?;
/// assert_eq!(motor.read(None).await?, 10.0);
/// ```
pub struct MockMotor {
    name: String,
    unit: String,
    limits: Limits,
    speed: f64,
    lash: f64,
    mode: MockMode,
    stall_at: Option<f64>,
    poll_interval: Option<Duration>,
    error_config: ErrorConfig,
    journal: Option<MotionJournal>,
    state: Mutex<MotorState>,
    stopped: Notify,
    starts: AtomicU32,
}

impl MockMotor {
    /// Create an instant-mode motor at 0.0.
    pub fn new(name: impl Into<String>) -> Self {
        Self::builder(name).build()
    }

    /// Create a motor from its setup configuration.
    pub fn with_config(name: impl Into<String>, config: MockMotorConfig) -> AppResult<Self> {
        config.validate()?;
        let rate = config
            .failure_rate
            .unwrap_or_else(|| config.mode.default_failure_rate());
        let error_config = if rate > 0.0 {
            ErrorConfig::random_failures_seeded(rate, config.seed)
        } else {
            ErrorConfig::none()
        };
        let mut builder = Self::builder(name)
            .initial_position(config.initial_position)
            .speed(config.speed)
            .limits(config.limits()?)
            .mode(config.mode)
            .lash(config.lash)
            .unit(config.unit)
            .error_config(error_config);
        if let Some(interval) = config.pollinterval {
            builder = builder.poll_interval(interval);
        }
        Ok(builder.build())
    }

    /// Create a builder for configuring MockMotor
    pub fn builder(name: impl Into<String>) -> MockMotorBuilder {
        MockMotorBuilder::new(name)
    }

    /// Current motor position without error injection.
    pub fn position(&self) -> f64 {
        self.state.lock().settle(Instant::now())
    }

    /// Position of the driven load.
    ///
    /// The load trails the motor by half the lash in the direction of the
    /// last motion, so the same motor position gives different load
    /// positions depending on the approach direction.
    pub fn load_position(&self) -> f64 {
        let mut state = self.state.lock();
        let position = state.settle(Instant::now());
        position - state.last_direction * self.lash / 2.0
    }

    /// Whether a motion is in progress.
    pub fn is_moving(&self) -> bool {
        let mut state = self.state.lock();
        state.settle(Instant::now());
        state.motion.is_some()
    }

    /// Number of `start` calls that passed the limit check.
    pub fn start_count(&self) -> u32 {
        self.starts.load(Ordering::SeqCst)
    }

    /// Teleport to `position` (no motion, no journal entry).
    pub fn set_position(&self, position: f64) {
        let mut state = self.state.lock();
        state.motion = None;
        state.position = position;
    }

    fn motion_duration(&self, distance: f64) -> Duration {
        if self.mode.is_timed() {
            Duration::from_secs_f64(distance.abs() / self.speed)
        } else {
            Duration::ZERO
        }
    }

    /// Final position of a motion from `from` towards `target`, honoring an
    /// obstacle in the way. A motor resting on the obstacle stays blocked
    /// upwards and may leave downwards.
    fn reachable(&self, from: f64, target: f64) -> f64 {
        match self.stall_at {
            Some(obstacle)
                if (from <= obstacle && obstacle < target)
                    || (target < obstacle && obstacle < from) =>
            {
                obstacle
            }
            _ => target,
        }
    }
}

#[async_trait]
impl Readable for MockMotor {
    fn name(&self) -> &str {
        &self.name
    }

    fn unit(&self) -> &str {
        &self.unit
    }

    async fn read(&self, _max_age: Option<Duration>) -> AppResult<f64> {
        self.error_config.check_operation(DRIVER_TYPE, "read")?;
        Ok(self.position())
    }

    async fn status(&self, _max_age: Option<Duration>) -> AppResult<DeviceStatus> {
        self.error_config.check_operation(DRIVER_TYPE, "status")?;
        let mut state = self.state.lock();
        state.settle(Instant::now());
        Ok(match state.motion {
            Some(motion) => DeviceStatus::busy(format!("moving to {}", motion.to)),
            None => DeviceStatus::ok(),
        })
    }

    fn poll_interval(&self) -> Option<Duration> {
        self.poll_interval
    }
}

#[async_trait]
impl Moveable for MockMotor {
    async fn start(&self, target: f64) -> AppResult<()> {
        self.limits.check(&self.name, target)?;
        self.starts.fetch_add(1, Ordering::SeqCst);
        if let Some(journal) = &self.journal {
            journal.record(&self.name, target);
        }
        self.error_config.check_operation(DRIVER_TYPE, "start")?;

        let now = Instant::now();
        let mut state = self.state.lock();
        let from = state.settle(now);
        let to = self.reachable(from, target);
        state.position = from;
        state.target = Some(target);
        if to != from {
            state.last_direction = (to - from).signum();
        }
        let duration = self.motion_duration(to - from);
        if duration.is_zero() {
            state.position = to;
            state.motion = None;
        } else {
            state.motion = Some(Motion {
                from,
                to,
                started: now,
                duration,
            });
        }
        tracing::debug!(
            device = %self.name,
            "MockMotor: moving from {:.3} to {:.3} ({:?})",
            from,
            to,
            duration
        );
        Ok(())
    }

    async fn stop(&self) -> AppResult<()> {
        {
            let mut state = self.state.lock();
            let position = state.settle(Instant::now());
            state.position = position;
            state.motion = None;
        }
        self.stopped.notify_waiters();
        tracing::debug!(device = %self.name, "MockMotor: stopped");
        Ok(())
    }

    async fn wait(&self) -> AppResult<()> {
        loop {
            let deadline = {
                let mut state = self.state.lock();
                state.settle(Instant::now());
                match state.motion {
                    Some(motion) => motion.finished_at(),
                    None => break,
                }
            };
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                _ = self.stopped.notified() => {}
            }
        }
        Ok(())
    }

    async fn is_allowed(&self, target: f64) -> Result<(), String> {
        self.limits
            .check(&self.name, target)
            .map_err(|e| e.to_string())
    }

    fn user_limits(&self) -> Limits {
        self.limits
    }

    fn target(&self) -> Option<f64> {
        self.state.lock().target
    }

    async fn reset(&self) -> AppResult<()> {
        self.error_config.reset();
        Ok(())
    }
}

// =============================================================================
// Builder Pattern
// =============================================================================

/// Builder for MockMotor with fluent API
pub struct MockMotorBuilder {
    name: String,
    unit: String,
    initial_position: f64,
    limits: Limits,
    speed: f64,
    lash: f64,
    mode: MockMode,
    stall_at: Option<f64>,
    poll_interval: Option<Duration>,
    error_config: ErrorConfig,
    journal: Option<MotionJournal>,
}

impl MockMotorBuilder {
    /// Create a new builder with defaults
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            unit: default_unit(),
            initial_position: 0.0,
            limits: Limits::unbounded(),
            speed: default_speed(),
            lash: 0.0,
            mode: MockMode::Instant,
            stall_at: None,
            poll_interval: None,
            error_config: ErrorConfig::none(),
            journal: None,
        }
    }

    /// Set initial position
    pub fn initial_position(mut self, position: f64) -> Self {
        self.initial_position = position;
        self
    }

    /// Set speed in units/sec
    pub fn speed(mut self, speed: f64) -> Self {
        self.speed = speed;
        self
    }

    /// Set absolute limits
    pub fn limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Set mechanical lash
    pub fn lash(mut self, lash: f64) -> Self {
        self.lash = lash;
        self
    }

    /// Set unit
    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    /// Set operational mode
    pub fn mode(mut self, mode: MockMode) -> Self {
        self.mode = mode;
        self
    }

    /// Block every motion crossing `position`; the motor halts there idle.
    pub fn stall_at(mut self, position: f64) -> Self {
        self.stall_at = Some(position);
        self
    }

    /// Set poll interval
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    /// Set error configuration
    pub fn error_config(mut self, config: ErrorConfig) -> Self {
        self.error_config = config;
        self
    }

    /// Record starts into a shared journal
    pub fn journal(mut self, journal: MotionJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Build the MockMotor
    pub fn build(self) -> MockMotor {
        MockMotor {
            name: self.name,
            unit: self.unit,
            limits: self.limits,
            speed: self.speed,
            lash: self.lash,
            mode: self.mode,
            stall_at: self.stall_at,
            poll_interval: self.poll_interval,
            error_config: self.error_config,
            journal: self.journal,
            state: Mutex::new(MotorState {
                position: self.initial_position,
                motion: None,
                target: None,
                last_direction: 0.0,
            }),
            stopped: Notify::new(),
            starts: AtomicU32::new(0),
        }
    }
}
