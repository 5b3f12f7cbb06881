//! Setup configuration.
//!
//! A setup is a TOML file describing every device of an instrument plus the
//! poller's process groups. It is loaded with `figment`, so any value can be
//! overridden from the environment with the `BEAM_` prefix (nested keys are
//! separated by `__`, e.g. `BEAM_POLLER__DEFAULT_INTERVAL=10s`).
//!
//! ## Schema
//!
//! ```toml
//! description = "sample table"
//! log_level = "info"
//!
//! [devices.m_sth]
//! driver = "mock_motor"
//! abslimits = [-180.0, 180.0]
//!
//! [devices.sth]
//! driver = "axis"
//! motor = "m_sth"
//! precision = 0.01
//!
//! [poller]
//! default_interval = "5s"
//!
//! [poller.processes]
//! motors = ["sth"]
//! ```
//!
//! Each device table carries a mandatory `driver` field naming the factory
//! that builds it; all other fields are handed to that factory, which
//! deserializes them into its own typed configuration struct.

use crate::error::{AppResult, BeamError};
use crate::limits::DEFAULT_POLL_INTERVAL;
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Top-level setup file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupConfig {
    /// Free-form description.
    #[serde(default)]
    pub description: String,

    /// Logging verbosity used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Device name → device table.
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceConfig>,

    /// Poller process groups and defaults.
    #[serde(default)]
    pub poller: PollerSettings,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// One device table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Factory key, e.g. `axis`, `slit`, `mock_motor`.
    pub driver: String,

    /// Remaining driver-specific fields.
    #[serde(flatten)]
    pub settings: toml::Table,
}

impl DeviceConfig {
    /// Create a device table from a driver key and settings.
    pub fn new(driver: impl Into<String>, settings: toml::Table) -> Self {
        Self {
            driver: driver.into(),
            settings,
        }
    }

    /// Settings as a TOML value, the form factories receive.
    pub fn settings_value(&self) -> toml::Value {
        toml::Value::Table(self.settings.clone())
    }

    /// Deserialize the settings into a typed configuration struct.
    pub fn parse<T: DeserializeOwned>(&self, device: &str) -> AppResult<T> {
        parse_settings(device, self.settings_value())
    }
}

/// Deserialize factory settings into a typed configuration struct.
pub fn parse_settings<T: DeserializeOwned>(device: &str, settings: toml::Value) -> AppResult<T> {
    settings
        .try_into()
        .map_err(|e| BeamError::Configuration(format!("device '{}': {}", device, e)))
}

/// Poller section of a setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerSettings {
    /// Interval for devices that do not configure one.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub default_interval: Duration,

    /// Process group name → device names polled by that group.
    #[serde(default)]
    pub processes: BTreeMap<String, Vec<String>>,

    /// Executable started for each group in master mode.
    ///
    /// Defaults to the running executable.
    #[serde(default)]
    pub program: Option<PathBuf>,
}

fn default_poll_interval() -> Duration {
    DEFAULT_POLL_INTERVAL
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            default_interval: DEFAULT_POLL_INTERVAL,
            processes: BTreeMap::new(),
            program: None,
        }
    }
}

impl SetupConfig {
    /// Load a setup file, applying `BEAM_` environment overrides.
    pub fn load(path: &Path) -> AppResult<Self> {
        if !path.exists() {
            return Err(BeamError::Configuration(format!(
                "setup file not found: {}",
                path.display()
            )));
        }
        debug!("Loading setup from: {}", path.display());

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("BEAM_").split("__"));
        let setup: SetupConfig = figment.extract()?;
        setup.validate()?;

        info!(
            "Loaded setup '{}' with {} devices",
            path.display(),
            setup.devices.len()
        );
        Ok(setup)
    }

    /// Load `<dir>/<name>.toml`.
    pub fn load_named(dir: &Path, name: &str) -> AppResult<Self> {
        Self::load(&dir.join(format!("{}.toml", name)))
    }

    /// Parse a setup from a TOML string (no environment overrides).
    pub fn from_toml_str(content: &str) -> AppResult<Self> {
        let setup: SetupConfig = Figment::new().merge(Toml::string(content)).extract()?;
        setup.validate()?;
        Ok(setup)
    }

    /// Cross-field validation.
    ///
    /// Checks that every device named by a poller group exists and that no
    /// group is empty. Attachment checks are done by the factories when the
    /// registry loads the setup.
    pub fn validate(&self) -> AppResult<()> {
        for (group, devices) in &self.poller.processes {
            if devices.is_empty() {
                return Err(BeamError::Configuration(format!(
                    "poller group '{}' has no devices",
                    group
                )));
            }
            for device in devices {
                if !self.devices.contains_key(device) {
                    return Err(BeamError::Configuration(format!(
                        "poller group '{}' references unknown device '{}'",
                        group, device
                    )));
                }
            }
        }
        if self.poller.default_interval.is_zero() {
            return Err(BeamError::Configuration(
                "poller default_interval must be positive".into(),
            ));
        }
        Ok(())
    }
}
