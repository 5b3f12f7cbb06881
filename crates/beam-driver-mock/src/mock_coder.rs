//! Mock position encoder.
//!
//! A coder reports the position of another device, optionally through a
//! fixed offset (a mis-mounted encoder) and a scale error. When built from a
//! [`MockMotor`] directly it can read the load side of the motor's lash.

use async_trait::async_trait;
use beam_core::capabilities::Readable;
use beam_core::config::parse_settings;
use beam_core::driver::{attachment_names, DeviceComponents, DriverFactory};
use beam_core::error::{AppResult, BeamError};
use beam_core::registry::BuildContext;
use beam_core::status::DeviceStatus;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::common::ErrorConfig;
use crate::mock_motor::MockMotor;

const DRIVER_TYPE: &str = "mock_coder";

/// Configuration for MockCoder driver
#[derive(Debug, Clone, Deserialize)]
pub struct MockCoderConfig {
    /// Device whose position is encoded
    pub motor: String,

    /// Constant added to the encoded position (default: 0.0)
    #[serde(default)]
    pub offset: f64,

    /// Factor applied to the encoded position (default: 1.0)
    #[serde(default = "default_scale")]
    pub scale: f64,

    /// Poll interval for the poller
    #[serde(default, with = "humantime_serde")]
    pub pollinterval: Option<Duration>,
}

fn default_scale() -> f64 {
    1.0
}

/// Factory for creating MockCoder instances.
pub struct MockCoderFactory;

impl DriverFactory for MockCoderFactory {
    fn driver_type(&self) -> &'static str {
        DRIVER_TYPE
    }

    fn name(&self) -> &'static str {
        "Mock Coder"
    }

    fn validate(&self, config: &toml::Value) -> AppResult<()> {
        let cfg: MockCoderConfig = parse_settings(DRIVER_TYPE, config.clone())?;
        if cfg.scale == 0.0 || !cfg.scale.is_finite() {
            return Err(BeamError::Configuration(format!(
                "scale must be finite and non-zero, got {}",
                cfg.scale
            )));
        }
        Ok(())
    }

    fn attachments(&self, config: &toml::Value) -> Vec<String> {
        attachment_names(config, &["motor"])
    }

    fn build(
        &self,
        ctx: BuildContext,
        config: toml::Value,
    ) -> BoxFuture<'static, AppResult<DeviceComponents>> {
        Box::pin(async move {
            let cfg: MockCoderConfig = parse_settings(ctx.name(), config)?;
            let source = ctx.readable(&cfg.motor).await?;
            let mut coder = MockCoder::following(ctx.name(), source)
                .with_offset(cfg.offset)
                .with_scale(cfg.scale);
            coder.poll_interval = cfg.pollinterval;
            Ok(DeviceComponents::new().with_readable(Arc::new(coder)))
        })
    }
}

enum Source {
    Device(Arc<dyn Readable>),
    Load(Arc<MockMotor>),
}

/// Mock encoder following another device.
pub struct MockCoder {
    name: String,
    source: Source,
    offset: Mutex<f64>,
    scale: f64,
    poll_interval: Option<Duration>,
    error_config: ErrorConfig,
}

impl MockCoder {
    /// Encoder reporting whatever `source` reads.
    pub fn following(name: impl Into<String>, source: Arc<dyn Readable>) -> Self {
        Self::with_source(name, Source::Device(source))
    }

    /// Encoder mounted on the load side of `motor`, so it sees the lash.
    pub fn on_load(name: impl Into<String>, motor: Arc<MockMotor>) -> Self {
        Self::with_source(name, Source::Load(motor))
    }

    fn with_source(name: impl Into<String>, source: Source) -> Self {
        Self {
            name: name.into(),
            source,
            offset: Mutex::new(0.0),
            scale: 1.0,
            poll_interval: None,
            error_config: ErrorConfig::none(),
        }
    }

    /// Set the encoder offset.
    pub fn with_offset(self, offset: f64) -> Self {
        *self.offset.lock() = offset;
        self
    }

    /// Set the encoder scale.
    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    /// Set error injection.
    pub fn with_error_config(mut self, config: ErrorConfig) -> Self {
        self.error_config = config;
        self
    }

    /// Change the offset at runtime, e.g. to simulate a slipping encoder.
    pub fn set_offset(&self, offset: f64) {
        *self.offset.lock() = offset;
    }
}

#[async_trait]
impl Readable for MockCoder {
    fn name(&self) -> &str {
        &self.name
    }

    fn unit(&self) -> &str {
        match &self.source {
            Source::Device(device) => device.unit(),
            Source::Load(motor) => motor.unit(),
        }
    }

    async fn read(&self, max_age: Option<Duration>) -> AppResult<f64> {
        self.error_config.check_operation(DRIVER_TYPE, "read")?;
        let raw = match &self.source {
            Source::Device(device) => device.read(max_age).await?,
            Source::Load(motor) => motor.load_position(),
        };
        Ok(raw * self.scale + *self.offset.lock())
    }

    async fn status(&self, _max_age: Option<Duration>) -> AppResult<DeviceStatus> {
        self.error_config.check_operation(DRIVER_TYPE, "status")?;
        Ok(DeviceStatus::ok())
    }

    fn poll_interval(&self) -> Option<Duration> {
        self.poll_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beam_core::capabilities::Moveable;

    #[tokio::test]
    async fn test_coder_follows_motor() {
        let motor = Arc::new(MockMotor::new("m1"));
        let coder = MockCoder::following("c1", motor.clone()).with_offset(0.5);

        motor.move_to(4.0).await.unwrap();
        assert_eq!(coder.read(None).await.unwrap(), 4.5);

        coder.set_offset(-1.0);
        assert_eq!(coder.read(None).await.unwrap(), 3.0);
    }

    #[tokio::test]
    async fn test_load_coder_sees_lash() {
        let motor = Arc::new(MockMotor::builder("m1").lash(1.0).build());
        let coder = MockCoder::on_load("c1", motor.clone());

        motor.move_to(2.0).await.unwrap();
        assert_eq!(coder.read(None).await.unwrap(), 1.5);
        assert_eq!(motor.read(None).await.unwrap(), 2.0);
    }

    #[tokio::test]
    async fn test_read_errors_are_injected() {
        let motor = Arc::new(MockMotor::new("m1"));
        let coder = MockCoder::following("c1", motor).with_error_config(ErrorConfig::always("read"));
        assert!(coder.read(None).await.is_err());
        assert!(coder.status(None).await.is_ok());
    }

    #[test]
    fn test_factory_attachments() {
        let config: toml::Value = toml::from_str("motor = \"m1\"\noffset = 0.1").unwrap();
        assert_eq!(MockCoderFactory.attachments(&config), vec!["m1"]);
        assert!(MockCoderFactory.validate(&config).is_ok());

        let bad: toml::Value = toml::from_str("motor = \"m1\"\nscale = 0.0").unwrap();
        assert!(MockCoderFactory.validate(&bad).is_err());
    }
}
