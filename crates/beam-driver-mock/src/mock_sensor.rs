//! Mock scalar sensor (thermometer, pressure gauge, monitor counter).

use async_trait::async_trait;
use beam_core::capabilities::Readable;
use beam_core::config::parse_settings;
use beam_core::driver::{DeviceComponents, DriverFactory};
use beam_core::error::{AppResult, BeamError};
use beam_core::registry::BuildContext;
use beam_core::status::DeviceStatus;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::common::{ErrorConfig, MockRng};

const DRIVER_TYPE: &str = "mock_sensor";

/// Configuration for MockSensor driver
#[derive(Debug, Clone, Deserialize)]
pub struct MockSensorConfig {
    /// Base reading (default: 0.0)
    #[serde(default)]
    pub value: f64,

    /// Peak amplitude of uniform noise added to each read (default: 0.0)
    #[serde(default)]
    pub noise: f64,

    /// Unit (default: empty)
    #[serde(default)]
    pub unit: String,

    /// Random read failure probability (default: 0.0)
    #[serde(default)]
    pub failure_rate: f64,

    /// RNG seed for reproducible noise and failures
    #[serde(default)]
    pub seed: Option<u64>,

    /// Poll interval for the poller
    #[serde(default, with = "humantime_serde")]
    pub pollinterval: Option<Duration>,
}

/// Factory for creating MockSensor instances.
pub struct MockSensorFactory;

impl DriverFactory for MockSensorFactory {
    fn driver_type(&self) -> &'static str {
        DRIVER_TYPE
    }

    fn name(&self) -> &'static str {
        "Mock Sensor"
    }

    fn validate(&self, config: &toml::Value) -> AppResult<()> {
        let cfg: MockSensorConfig = parse_settings(DRIVER_TYPE, config.clone())?;
        if cfg.noise < 0.0 {
            return Err(BeamError::Configuration(format!(
                "noise must not be negative, got {}",
                cfg.noise
            )));
        }
        if !(0.0..=1.0).contains(&cfg.failure_rate) {
            return Err(BeamError::Configuration(format!(
                "failure_rate must be within [0, 1], got {}",
                cfg.failure_rate
            )));
        }
        Ok(())
    }

    fn build(
        &self,
        ctx: BuildContext,
        config: toml::Value,
    ) -> BoxFuture<'static, AppResult<DeviceComponents>> {
        Box::pin(async move {
            let cfg: MockSensorConfig = parse_settings(ctx.name(), config)?;
            let sensor = MockSensor::new(ctx.name(), cfg.value)
                .with_unit(cfg.unit)
                .with_noise(cfg.noise, cfg.seed)
                .with_error_config(ErrorConfig::random_failures_seeded(
                    cfg.failure_rate,
                    cfg.seed,
                ));
            let sensor = match cfg.pollinterval {
                Some(interval) => sensor.with_poll_interval(interval),
                None => sensor,
            };
            Ok(DeviceComponents::new().with_readable(Arc::new(sensor)))
        })
    }
}

/// Mock sensor with settable value and status.
pub struct MockSensor {
    name: String,
    unit: String,
    value: Mutex<f64>,
    status: Mutex<DeviceStatus>,
    noise: f64,
    rng: MockRng,
    poll_interval: Option<Duration>,
    error_config: ErrorConfig,
}

impl MockSensor {
    /// Sensor reading `value`, status OK.
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            unit: String::new(),
            value: Mutex::new(value),
            status: Mutex::new(DeviceStatus::ok()),
            noise: 0.0,
            rng: MockRng::default(),
            poll_interval: None,
            error_config: ErrorConfig::none(),
        }
    }

    /// Set the unit.
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    /// Add uniform noise of the given amplitude.
    pub fn with_noise(mut self, amplitude: f64, seed: Option<u64>) -> Self {
        self.noise = amplitude;
        self.rng = MockRng::new(seed);
        self
    }

    /// Set the preferred poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    /// Set error injection.
    pub fn with_error_config(mut self, config: ErrorConfig) -> Self {
        self.error_config = config;
        self
    }

    /// Change the base reading.
    pub fn set_value(&self, value: f64) {
        *self.value.lock() = value;
    }

    /// Change the reported status.
    pub fn set_status(&self, status: DeviceStatus) {
        *self.status.lock() = status;
    }
}

#[async_trait]
impl Readable for MockSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn unit(&self) -> &str {
        &self.unit
    }

    async fn read(&self, _max_age: Option<Duration>) -> AppResult<f64> {
        self.error_config.check_operation(DRIVER_TYPE, "read")?;
        Ok(*self.value.lock() + self.rng.noise(self.noise))
    }

    async fn status(&self, _max_age: Option<Duration>) -> AppResult<DeviceStatus> {
        self.error_config.check_operation(DRIVER_TYPE, "status")?;
        Ok(self.status.lock().clone())
    }

    fn poll_interval(&self) -> Option<Duration> {
        self.poll_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beam_core::status::StatusCode;

    #[tokio::test]
    async fn test_value_and_status() {
        let sensor = MockSensor::new("t_sample", 4.2).with_unit("K");
        assert_eq!(sensor.read(None).await.unwrap(), 4.2);
        assert_eq!(sensor.unit(), "K");

        sensor.set_value(5.0);
        sensor.set_status(DeviceStatus::busy("ramping"));
        assert_eq!(sensor.read(None).await.unwrap(), 5.0);
        assert_eq!(sensor.status(None).await.unwrap().code, StatusCode::Busy);
    }

    #[tokio::test]
    async fn test_noise_stays_in_band() {
        let sensor = MockSensor::new("p", 100.0).with_noise(0.5, Some(3));
        for _ in 0..50 {
            let v = sensor.read(None).await.unwrap();
            assert!((99.5..100.5).contains(&v), "got {}", v);
        }
    }

    #[test]
    fn test_factory_validate() {
        let good: toml::Value = toml::from_str("value = 1.0\npollinterval = \"1s\"").unwrap();
        assert!(MockSensorFactory.validate(&good).is_ok());
        let bad: toml::Value = toml::from_str("failure_rate = 2.0").unwrap();
        assert!(MockSensorFactory.validate(&bad).is_err());
    }
}
