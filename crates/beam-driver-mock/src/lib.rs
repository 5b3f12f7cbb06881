//! Mock Hardware Drivers for beamline control
//!
//! This crate provides simulated hardware devices for testing without physical hardware.
//! All mock devices use async-safe operations (tokio::time, not std::thread::sleep),
//! so tests can run them under paused time.
//!
//! # Available Mock Drivers
//!
//! - [`MockMotor`] - Simulated motor with speed, limits, lash and obstacles
//! - [`MockCoder`] - Simulated encoder following a motor or its load
//! - [`MockSensor`] - Simulated scalar sensor with noise
//!
//! # Driver Factory Pattern
//!
//! Each mock driver provides a `DriverFactory` implementation for use with
//! the beam-core registry:
//!
//! ```rust,ignore
//! use beam_driver_mock::register_all;
//!
//! let registry = DeviceRegistry::new(cache);
//! register_all(&registry);
//! ```

pub mod common;
mod mock_coder;
mod mock_motor;
mod mock_sensor;

// Re-export common types
pub use common::{ErrorConfig, ErrorScenario, JournalEntry, MockMode, MockRng, MotionJournal};

// Re-export driver types
pub use mock_coder::{MockCoder, MockCoderConfig, MockCoderFactory};
pub use mock_motor::{MockMotor, MockMotorBuilder, MockMotorConfig, MockMotorFactory};
pub use mock_sensor::{MockSensor, MockSensorConfig, MockSensorFactory};

use beam_core::registry::DeviceRegistry;

/// Register all mock driver factories with a device registry.
pub fn register_all(registry: &DeviceRegistry) {
    registry.register_factory(MockMotorFactory);
    registry.register_factory(MockCoderFactory);
    registry.register_factory(MockSensorFactory);
}
