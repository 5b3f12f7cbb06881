//! Integration tests for the poller service
//!
//! Devices come from small test factories so the tests can keep a handle
//! on the very objects the workers poll.

use beam_core::{
    AppResult, BeamError, BuildContext, Cache, DeviceComponents, DeviceRegistry, DeviceStatus,
    DriverFactory, InMemoryCache, Readable, SetupConfig,
};
use beam_driver_mock::{ErrorConfig, ErrorScenario, MockSensor};
use beam_poller::Poller;
use futures::future::BoxFuture;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// Hands out a prepared sensor.
struct SharedFactory(Arc<MockSensor>);

impl DriverFactory for SharedFactory {
    fn driver_type(&self) -> &'static str {
        "shared"
    }

    fn name(&self) -> &'static str {
        "Shared test sensor"
    }

    fn validate(&self, _config: &toml::Value) -> AppResult<()> {
        Ok(())
    }

    fn build(
        &self,
        _ctx: BuildContext,
        _config: toml::Value,
    ) -> BoxFuture<'static, AppResult<DeviceComponents>> {
        let sensor = self.0.clone();
        Box::pin(async move { Ok(DeviceComponents::new().with_readable(sensor)) })
    }
}

/// Fails the first `failures` builds (all of them for `usize::MAX`).
struct FlakyFactory {
    builds: Arc<AtomicUsize>,
    failures: usize,
}

impl DriverFactory for FlakyFactory {
    fn driver_type(&self) -> &'static str {
        "flaky"
    }

    fn name(&self) -> &'static str {
        "Flaky test sensor"
    }

    fn validate(&self, _config: &toml::Value) -> AppResult<()> {
        Ok(())
    }

    fn build(
        &self,
        ctx: BuildContext,
        _config: toml::Value,
    ) -> BoxFuture<'static, AppResult<DeviceComponents>> {
        let attempt = self.builds.fetch_add(1, Ordering::SeqCst) + 1;
        let failures = self.failures;
        Box::pin(async move {
            if attempt <= failures {
                return Err(BeamError::Configuration(format!(
                    "{}: controller not answering",
                    ctx.name()
                )));
            }
            let sensor: Arc<dyn Readable> = Arc::new(MockSensor::new(ctx.name(), 42.0));
            Ok(DeviceComponents::new().with_readable(sensor))
        })
    }
}

const SETUP: &str = r#"
    [devices.t_sample]
    driver = "shared"

    [devices.flaky]
    driver = "flaky"

    [poller]
    default_interval = "10s"

    [poller.processes]
    sample = ["t_sample"]
    broken = ["flaky"]
"#;

fn registry(sensor: Arc<MockSensor>, failures: usize) -> (Arc<DeviceRegistry>, Arc<AtomicUsize>) {
    let builds = Arc::new(AtomicUsize::new(0));
    let registry = DeviceRegistry::new(Arc::new(InMemoryCache::new()));
    registry.register_factory(SharedFactory(sensor));
    registry.register_factory(FlakyFactory {
        builds: builds.clone(),
        failures,
    });
    registry
        .load(SetupConfig::from_toml_str(SETUP).unwrap())
        .unwrap();
    (registry, builds)
}

fn cached_value(registry: &DeviceRegistry, device: &str) -> Option<serde_json::Value> {
    registry.cache().get(device, "value").map(|entry| entry.value)
}

/// Each poll publishes value and status
#[tokio::test(start_paused = true)]
async fn test_poll_publishes_value_and_status() {
    let sensor = Arc::new(MockSensor::new("t_sample", 295.0));
    let (registry, _) = registry(sensor.clone(), 0);
    let poller = Poller::new(registry.clone());
    assert_eq!(poller.start_group("sample").unwrap(), 1);

    sleep(Duration::from_millis(10)).await;
    assert_eq!(cached_value(&registry, "t_sample"), Some(json!(295.0)));
    let status = registry.cache().get("t_sample", "status").unwrap();
    assert_eq!(status.value, json!({"code": "ok", "message": "idle"}));

    // next poll only after the default interval
    sensor.set_value(300.0);
    sleep(Duration::from_secs(5)).await;
    assert_eq!(cached_value(&registry, "t_sample"), Some(json!(295.0)));
    sleep(Duration::from_secs(6)).await;
    assert_eq!(cached_value(&registry, "t_sample"), Some(json!(300.0)));

    poller.quit().await;
}

/// A new target switches to fast polling until the device is idle again
#[tokio::test(start_paused = true)]
async fn test_target_triggers_fast_polling() {
    let sensor = Arc::new(MockSensor::new("t_sample", 1.0));
    let (registry, _) = registry(sensor.clone(), 0);
    let poller = Poller::new(registry.clone());
    poller.start_group("sample").unwrap();
    sleep(Duration::from_millis(10)).await;

    sensor.set_status(DeviceStatus::busy("moving"));
    registry.cache().put("t_sample", "target", json!(2.0));
    sleep(Duration::from_millis(10)).await;

    sensor.set_value(2.0);
    sleep(Duration::from_millis(600)).await;
    assert_eq!(cached_value(&registry, "t_sample"), Some(json!(2.0)));

    // idle again: back to the 10 s interval after one more fast poll
    sensor.set_status(DeviceStatus::ok());
    sleep(Duration::from_millis(600)).await;
    sensor.set_value(3.0);
    sleep(Duration::from_secs(1)).await;
    assert_eq!(cached_value(&registry, "t_sample"), Some(json!(2.0)));

    poller.quit().await;
}

/// A new poll interval published in the cache is adopted
#[tokio::test(start_paused = true)]
async fn test_pollinterval_change_is_adopted() {
    let sensor = Arc::new(MockSensor::new("t_sample", 1.0));
    let (registry, _) = registry(sensor.clone(), 0);
    let poller = Poller::new(registry.clone());
    poller.start_group("sample").unwrap();
    sleep(Duration::from_millis(10)).await;

    // wakes the worker, which polls once and then uses 1 s
    registry.cache().put("t_sample", "pollinterval", json!(1.0));
    sleep(Duration::from_millis(10)).await;

    sensor.set_value(5.0);
    sleep(Duration::from_millis(1100)).await;
    assert_eq!(cached_value(&registry, "t_sample"), Some(json!(5.0)));

    poller.quit().await;
}

/// A device that keeps failing is polled less often, and back at the
/// normal rate once it answers again
#[tokio::test(start_paused = true)]
async fn test_failing_device_backs_off() {
    let faults = ErrorConfig::scenario(ErrorScenario::FailFirstN {
        operation: "read",
        count: 6,
    });
    let sensor = Arc::new(MockSensor::new("t_sample", 7.0).with_error_config(faults));
    let (registry, _) = registry(sensor, 0);
    let poller = Poller::new(registry.clone());
    poller.start_group("sample").unwrap();

    // failures at 0, 10, 20, 30, 40 and 50 s; the sixth stretches to 50 s
    sleep(Duration::from_secs(55)).await;
    assert_eq!(cached_value(&registry, "t_sample"), None);

    sleep(Duration::from_secs(44)).await;
    assert_eq!(cached_value(&registry, "t_sample"), None);
    sleep(Duration::from_secs(2)).await;
    assert_eq!(cached_value(&registry, "t_sample"), Some(json!(7.0)));

    poller.quit().await;
}

/// Device creation is retried every 30 s until it succeeds
#[tokio::test(start_paused = true)]
async fn test_failed_creation_retried_every_30s() {
    let (registry, builds) = registry(Arc::new(MockSensor::new("t_sample", 0.0)), 2);
    let poller = Poller::new(registry.clone());
    poller.start_group("broken").unwrap();

    sleep(Duration::from_secs(1)).await;
    assert_eq!(builds.load(Ordering::SeqCst), 1);
    sleep(Duration::from_secs(30)).await;
    assert_eq!(builds.load(Ordering::SeqCst), 2);
    assert_eq!(cached_value(&registry, "flaky"), None);

    sleep(Duration::from_secs(30)).await;
    assert_eq!(builds.load(Ordering::SeqCst), 3);
    assert_eq!(cached_value(&registry, "flaky"), Some(json!(42.0)));

    poller.quit().await;
}

/// A device that never comes up is retried forever, and quitting does not
/// wait out the retry delay
#[tokio::test(start_paused = true)]
async fn test_creation_retry_never_gives_up() {
    let (registry, builds) = registry(Arc::new(MockSensor::new("t_sample", 0.0)), usize::MAX);
    let poller = Poller::new(registry);
    poller.start_group("broken").unwrap();

    sleep(Duration::from_secs(301)).await;
    assert_eq!(builds.load(Ordering::SeqCst), 11);

    let started = tokio::time::Instant::now();
    poller.quit().await;
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(builds.load(Ordering::SeqCst), 11);
}

/// Unknown groups are refused
#[tokio::test]
async fn test_unknown_group() {
    let (registry, _) = registry(Arc::new(MockSensor::new("t_sample", 0.0)), 0);
    let poller = Poller::new(registry);
    assert!(poller.start_group("nope").is_err());
    assert_eq!(poller.worker_count(), 0);
}
