//! Integration tests for mock driver system
//!
//! These tests verify that the mock devices build through the registry from a
//! setup file and cooperate with each other.

use beam_core::{DeviceRegistry, InMemoryCache, Moveable, Readable, SetupConfig, StatusCode};
use beam_driver_mock::*;
use std::sync::Arc;
use std::time::Duration;

const SETUP: &str = r#"
    [devices.m_x]
    driver = "mock_motor"
    abslimits = [-50.0, 50.0]
    mode = "realistic"
    speed = 5.0

    [devices.c_x]
    driver = "mock_coder"
    motor = "m_x"
    offset = 0.25

    [devices.t_sample]
    driver = "mock_sensor"
    value = 295.0
    unit = "K"
    pollinterval = "2s"
"#;

fn registry() -> Arc<DeviceRegistry> {
    let registry = DeviceRegistry::new(Arc::new(InMemoryCache::new()));
    register_all(&registry);
    registry
        .load(SetupConfig::from_toml_str(SETUP).unwrap())
        .unwrap();
    registry
}

/// All three factories are registered
#[test]
fn test_register_all() {
    let registry = DeviceRegistry::new(Arc::new(InMemoryCache::new()));
    register_all(&registry);
    assert_eq!(
        registry.driver_types(),
        vec!["mock_coder", "mock_motor", "mock_sensor"]
    );
}

/// Coder built from the setup follows its motor
#[tokio::test(start_paused = true)]
async fn test_coder_follows_motor_from_setup() {
    let registry = registry();
    let motor = registry.get_moveable("m_x").await.unwrap();
    let coder = registry.get_readable("c_x").await.unwrap();

    motor.start(10.0).await.unwrap();
    assert_eq!(motor.status(None).await.unwrap().code, StatusCode::Busy);
    motor.wait().await.unwrap();

    assert_eq!(motor.read(None).await.unwrap(), 10.0);
    assert_eq!(coder.read(None).await.unwrap(), 10.25);
}

/// Limits from the setup are enforced
#[tokio::test]
async fn test_motor_limits_from_setup() {
    let registry = registry();
    let motor = registry.get_moveable("m_x").await.unwrap();
    assert!(motor.start(60.0).await.is_err());
    assert_eq!(motor.user_limits().max, 50.0);
}

/// Sensor configuration reaches the device
#[tokio::test]
async fn test_sensor_from_setup() {
    let registry = registry();
    let sensor = registry.get_readable("t_sample").await.unwrap();
    assert_eq!(sensor.read(None).await.unwrap(), 295.0);
    assert_eq!(sensor.unit(), "K");
    assert_eq!(sensor.poll_interval(), Some(Duration::from_secs(2)));
}

/// A coder attached to a missing motor is refused at load time
#[test]
fn test_dangling_coder_rejected() {
    let registry = DeviceRegistry::new(Arc::new(InMemoryCache::new()));
    register_all(&registry);
    let setup = SetupConfig::from_toml_str(
        r#"
        [devices.c_x]
        driver = "mock_coder"
        motor = "m_missing"
        "#,
    )
    .unwrap();
    assert!(registry.load(setup).is_err());
}
