//! Device registry.
//!
//! The registry owns the loaded setup, the driver factories and every device
//! instance built so far. It is passed explicitly to whoever needs devices
//! (the axis and slit factories, the poller, the CLI); there is no global
//! session.
//!
//! Devices are created lazily: `load` only validates the setup, the first
//! `get_*` call for a name runs its factory. Composite devices resolve their
//! attachments through the [`BuildContext`] handed to the factory, which
//! recursively builds what they depend on and refuses dependency cycles.
//!
//! Each device is built at most once: concurrent `get_*` calls for the same
//! name wait on a per-device build lock and then share the stored instance.
//!
//! # Example
//!
//! ```rust,ignore
//! let registry = DeviceRegistry::new(Arc::new(InMemoryCache::new()));
//! registry.register_factory(MockMotorFactory);
//! registry.register_factory(AxisFactory);
//! registry.load(SetupConfig::load(Path::new("setups/demo.toml"))?)?;
//!
//! let sth = registry.get_moveable("sth").await?;
//! sth.move_to(12.5).await?;
//! ```

use crate::cache::Cache;
use crate::capabilities::{MultiMoveable, Moveable, Pollable, Readable};
use crate::config::SetupConfig;
use crate::driver::{DeviceComponents, DriverFactory};
use crate::error::{AppResult, BeamError};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Registry of factories, the loaded setup and created devices.
pub struct DeviceRegistry {
    factories: RwLock<HashMap<&'static str, Arc<dyn DriverFactory>>>,
    setup: RwLock<Option<SetupConfig>>,
    devices: RwLock<HashMap<String, DeviceComponents>>,
    building: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    cache: Arc<dyn Cache>,
}

impl DeviceRegistry {
    /// Create an empty registry publishing to `cache`.
    pub fn new(cache: Arc<dyn Cache>) -> Arc<Self> {
        Arc::new(Self {
            factories: RwLock::new(HashMap::new()),
            setup: RwLock::new(None),
            devices: RwLock::new(HashMap::new()),
            building: Mutex::new(HashMap::new()),
            cache,
        })
    }

    /// Register a driver factory; a factory with the same key is replaced.
    pub fn register_factory<F: DriverFactory + 'static>(&self, factory: F) {
        let driver_type = factory.driver_type();
        debug!(driver_type, name = factory.name(), "registering driver factory");
        self.factories.write().insert(driver_type, Arc::new(factory));
    }

    /// Registered driver keys, sorted.
    pub fn driver_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.factories.read().keys().copied().collect();
        types.sort_unstable();
        types
    }

    /// Shared cache handle.
    pub fn cache(&self) -> Arc<dyn Cache> {
        self.cache.clone()
    }

    /// Load a setup, replacing the current one.
    ///
    /// Every device table is validated by its factory, every attachment
    /// must name a device of the same setup and attachments may not form a
    /// cycle. Nothing is built yet.
    pub fn load(&self, setup: SetupConfig) -> AppResult<()> {
        setup.validate()?;
        let mut graph: HashMap<&str, Vec<String>> = HashMap::new();
        for (name, device) in &setup.devices {
            let factory = self.factory(&device.driver).ok_or_else(|| {
                BeamError::Configuration(format!(
                    "device '{}': unknown driver '{}' (available: {})",
                    name,
                    device.driver,
                    self.driver_types().join(", ")
                ))
            })?;
            let settings = device.settings_value();
            factory.validate(&settings).map_err(|e| match e {
                BeamError::Configuration(msg) if !msg.contains(name.as_str()) => {
                    BeamError::Configuration(format!("device '{}': {}", name, msg))
                }
                other => other,
            })?;
            let attached = factory.attachments(&settings);
            for other in &attached {
                if !setup.devices.contains_key(other) {
                    return Err(BeamError::Configuration(format!(
                        "device '{}' attaches unknown device '{}'",
                        name, other
                    )));
                }
            }
            graph.insert(name.as_str(), attached);
        }
        check_acyclic(&graph)?;

        self.unload();
        info!(devices = setup.devices.len(), "setup loaded");
        *self.setup.write() = Some(setup);
        Ok(())
    }

    /// Drop the setup and every created device.
    pub fn unload(&self) {
        let dropped = {
            let mut devices = self.devices.write();
            let count = devices.len();
            devices.clear();
            count
        };
        self.building.lock().clear();
        if self.setup.write().take().is_some() {
            info!(dropped, "setup unloaded");
        }
    }

    /// Copy of the loaded setup.
    pub fn setup(&self) -> Option<SetupConfig> {
        self.setup.read().clone()
    }

    /// Device names of the loaded setup.
    pub fn device_names(&self) -> Vec<String> {
        self.setup
            .read()
            .as_ref()
            .map(|s| s.devices.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// True if `name` has already been built.
    pub fn is_created(&self, name: &str) -> bool {
        self.devices.read().contains_key(name)
    }

    /// Get (building on first use) the components of a device.
    pub async fn get(self: &Arc<Self>, name: &str) -> AppResult<DeviceComponents> {
        self.get_chained(name, Vec::new()).await
    }

    /// Get a device as [`Readable`].
    pub async fn get_readable(self: &Arc<Self>, name: &str) -> AppResult<Arc<dyn Readable>> {
        self.get(name)
            .await?
            .readable
            .ok_or_else(|| BeamError::CapabilityMissing {
                device: name.to_string(),
                capability: "readable",
            })
    }

    /// Get a device as [`Moveable`].
    pub async fn get_moveable(self: &Arc<Self>, name: &str) -> AppResult<Arc<dyn Moveable>> {
        self.get(name)
            .await?
            .moveable
            .ok_or_else(|| BeamError::CapabilityMissing {
                device: name.to_string(),
                capability: "moveable",
            })
    }

    /// Get a device as [`MultiMoveable`].
    pub async fn get_multi_moveable(
        self: &Arc<Self>,
        name: &str,
    ) -> AppResult<Arc<dyn MultiMoveable>> {
        self.get(name)
            .await?
            .multi_moveable
            .ok_or_else(|| BeamError::CapabilityMissing {
                device: name.to_string(),
                capability: "multi-valued moveable",
            })
    }

    /// Get a device as [`Pollable`].
    pub async fn get_pollable(self: &Arc<Self>, name: &str) -> AppResult<Arc<dyn Pollable>> {
        self.get(name)
            .await?
            .pollable()
            .ok_or_else(|| BeamError::CapabilityMissing {
                device: name.to_string(),
                capability: "pollable",
            })
    }

    fn factory(&self, driver_type: &str) -> Option<Arc<dyn DriverFactory>> {
        self.factories.read().get(driver_type).cloned()
    }

    async fn get_chained(
        self: &Arc<Self>,
        name: &str,
        chain: Vec<String>,
    ) -> AppResult<DeviceComponents> {
        if let Some(existing) = self.devices.read().get(name) {
            return Ok(existing.clone());
        }
        if chain.iter().any(|n| n == name) {
            return Err(BeamError::Configuration(format!(
                "attachment cycle: {} -> {}",
                chain.join(" -> "),
                name
            )));
        }

        let device = self
            .setup
            .read()
            .as_ref()
            .and_then(|s| s.devices.get(name).cloned())
            .ok_or_else(|| BeamError::DeviceNotFound(name.to_string()))?;
        let factory = self.factory(&device.driver).ok_or_else(|| {
            BeamError::Configuration(format!(
                "device '{}': unknown driver '{}'",
                name, device.driver
            ))
        })?;

        // One builder per device; later callers find it in `devices`.
        let guard = self
            .building
            .lock()
            .entry(name.to_string())
            .or_default()
            .clone();
        let _building = guard.lock().await;
        if let Some(existing) = self.devices.read().get(name) {
            return Ok(existing.clone());
        }

        let mut chain = chain;
        chain.push(name.to_string());
        let ctx = BuildContext {
            name: name.to_string(),
            registry: self.clone(),
            chain,
        };
        debug!(device = name, driver = %device.driver, "creating device");
        let components = match factory.build(ctx, device.settings_value()).await {
            Ok(c) => c,
            Err(e) => {
                warn!(device = name, error = %e, "device creation failed");
                return Err(e);
            }
        };

        self.devices
            .write()
            .insert(name.to_string(), components.clone());
        info!(device = name, driver = %device.driver, "device created");
        Ok(components)
    }
}

/// Refuse attachment cycles, naming the first one found.
fn check_acyclic(graph: &HashMap<&str, Vec<String>>) -> AppResult<()> {
    fn visit<'a>(
        name: &'a str,
        graph: &'a HashMap<&str, Vec<String>>,
        path: &mut Vec<&'a str>,
        done: &mut HashSet<&'a str>,
    ) -> AppResult<()> {
        if done.contains(name) {
            return Ok(());
        }
        if let Some(start) = path.iter().position(|n| *n == name) {
            let mut cycle = path[start..].to_vec();
            cycle.push(name);
            return Err(BeamError::Configuration(format!(
                "attachment cycle: {}",
                cycle.join(" -> ")
            )));
        }
        path.push(name);
        for attached in graph.get(name).into_iter().flatten() {
            visit(attached, graph, path, done)?;
        }
        path.pop();
        done.insert(name);
        Ok(())
    }

    let mut done = HashSet::new();
    let mut names: Vec<&str> = graph.keys().copied().collect();
    names.sort_unstable();
    for name in names {
        visit(name, graph, &mut Vec::new(), &mut done)?;
    }
    Ok(())
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("factories", &self.driver_types())
            .field("devices", &self.devices.read().len())
            .finish()
    }
}

/// Context handed to [`DriverFactory::build`].
///
/// Gives access to the device's own name, the cache, and the other devices
/// of the setup.
#[derive(Clone)]
pub struct BuildContext {
    name: String,
    registry: Arc<DeviceRegistry>,
    chain: Vec<String>,
}

impl BuildContext {
    /// Name of the device being built.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shared cache.
    pub fn cache(&self) -> Arc<dyn Cache> {
        self.registry.cache()
    }

    /// Resolve an attached device as [`Readable`].
    pub async fn readable(&self, name: &str) -> AppResult<Arc<dyn Readable>> {
        self.attached(name)
            .await?
            .readable
            .ok_or_else(|| BeamError::CapabilityMissing {
                device: name.to_string(),
                capability: "readable",
            })
    }

    /// Resolve an attached device as [`Moveable`].
    pub async fn moveable(&self, name: &str) -> AppResult<Arc<dyn Moveable>> {
        self.attached(name)
            .await?
            .moveable
            .ok_or_else(|| BeamError::CapabilityMissing {
                device: name.to_string(),
                capability: "moveable",
            })
    }

    /// Resolve an attached device as [`MultiMoveable`].
    pub async fn multi_moveable(&self, name: &str) -> AppResult<Arc<dyn MultiMoveable>> {
        self.attached(name)
            .await?
            .multi_moveable
            .ok_or_else(|| BeamError::CapabilityMissing {
                device: name.to_string(),
                capability: "multi-valued moveable",
            })
    }

    /// Resolve an attached device as its concrete driver type `T`.
    ///
    /// Only works for drivers that published themselves with
    /// [`DeviceComponents::with_handle`].
    pub async fn handle<T: std::any::Any + Send + Sync>(&self, name: &str) -> AppResult<Arc<T>> {
        self.attached(name)
            .await?
            .handle
            .and_then(|handle| handle.downcast::<T>().ok())
            .ok_or_else(|| BeamError::CapabilityMissing {
                device: name.to_string(),
                capability: std::any::type_name::<T>(),
            })
    }

    async fn attached(&self, name: &str) -> AppResult<DeviceComponents> {
        self.registry.get_chained(name, self.chain.clone()).await
    }
}

impl std::fmt::Debug for BuildContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildContext")
            .field("name", &self.name)
            .field("chain", &self.chain)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::config::parse_settings;
    use crate::driver::attachment_names;
    use crate::status::DeviceStatus;
    use async_trait::async_trait;
    use futures::future::BoxFuture;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Constant {
        name: String,
        value: f64,
    }

    #[async_trait]
    impl Readable for Constant {
        fn name(&self) -> &str {
            &self.name
        }

        async fn read(&self, _max_age: Option<Duration>) -> AppResult<f64> {
            Ok(self.value)
        }

        async fn status(&self, _max_age: Option<Duration>) -> AppResult<DeviceStatus> {
            Ok(DeviceStatus::ok())
        }
    }

    #[derive(Deserialize)]
    struct ConstantConfig {
        value: f64,
        #[serde(default)]
        delay_ms: u64,
    }

    struct ConstantFactory {
        builds: Arc<AtomicUsize>,
    }

    impl DriverFactory for ConstantFactory {
        fn driver_type(&self) -> &'static str {
            "constant"
        }

        fn name(&self) -> &'static str {
            "Constant value"
        }

        fn validate(&self, config: &toml::Value) -> AppResult<()> {
            parse_settings::<ConstantConfig>("constant", config.clone()).map(|_| ())
        }

        fn build(
            &self,
            ctx: BuildContext,
            config: toml::Value,
        ) -> BoxFuture<'static, AppResult<DeviceComponents>> {
            let builds = self.builds.clone();
            Box::pin(async move {
                builds.fetch_add(1, Ordering::SeqCst);
                let cfg: ConstantConfig = parse_settings(ctx.name(), config)?;
                tokio::time::sleep(Duration::from_millis(cfg.delay_ms)).await;
                Ok(DeviceComponents::new().with_readable(Arc::new(Constant {
                    name: ctx.name().to_string(),
                    value: cfg.value,
                })))
            })
        }
    }

    /// Reads the sum of its attached devices.
    struct SumFactory;

    impl DriverFactory for SumFactory {
        fn driver_type(&self) -> &'static str {
            "sum"
        }

        fn name(&self) -> &'static str {
            "Sum of readables"
        }

        fn validate(&self, _config: &toml::Value) -> AppResult<()> {
            Ok(())
        }

        fn attachments(&self, config: &toml::Value) -> Vec<String> {
            attachment_names(config, &["parts"])
        }

        fn build(
            &self,
            ctx: BuildContext,
            config: toml::Value,
        ) -> BoxFuture<'static, AppResult<DeviceComponents>> {
            Box::pin(async move {
                let mut value = 0.0;
                for part in attachment_names(&config, &["parts"]) {
                    value += ctx.readable(&part).await?.read(None).await?;
                }
                Ok(DeviceComponents::new().with_readable(Arc::new(Constant {
                    name: ctx.name().to_string(),
                    value,
                })))
            })
        }
    }

    fn registry(builds: Arc<AtomicUsize>) -> Arc<DeviceRegistry> {
        let registry = DeviceRegistry::new(Arc::new(InMemoryCache::new()));
        registry.register_factory(ConstantFactory { builds });
        registry.register_factory(SumFactory);
        registry
    }

    #[tokio::test]
    async fn test_lazy_creation_and_reuse() {
        let builds = Arc::new(AtomicUsize::new(0));
        let registry = registry(builds.clone());
        registry
            .load(
                SetupConfig::from_toml_str(
                    r#"
                    [devices.a]
                    driver = "constant"
                    value = 1.5
                    "#,
                )
                .unwrap(),
            )
            .unwrap();

        assert_eq!(builds.load(Ordering::SeqCst), 0);
        assert!(!registry.is_created("a"));

        let a = registry.get_readable("a").await.unwrap();
        assert_eq!(a.read(None).await.unwrap(), 1.5);
        registry.get_readable("a").await.unwrap();
        assert_eq!(builds.load(Ordering::SeqCst), 1);

        assert!(matches!(
            registry.get_moveable("a").await,
            Err(BeamError::CapabilityMissing { .. })
        ));
        assert!(registry.get_pollable("a").await.is_ok());
        assert!(matches!(
            registry.get_readable("nope").await,
            Err(BeamError::DeviceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_attachments_are_built_recursively() {
        let builds = Arc::new(AtomicUsize::new(0));
        let registry = registry(builds.clone());
        registry
            .load(
                SetupConfig::from_toml_str(
                    r#"
                    [devices.a]
                    driver = "constant"
                    value = 1.0
                    [devices.b]
                    driver = "constant"
                    value = 2.0
                    [devices.total]
                    driver = "sum"
                    parts = ["a", "b"]
                    "#,
                )
                .unwrap(),
            )
            .unwrap();

        let total = registry.get_readable("total").await.unwrap();
        assert_eq!(total.read(None).await.unwrap(), 3.0);
        assert!(registry.is_created("a"));
        assert!(registry.is_created("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_gets_build_once() {
        let builds = Arc::new(AtomicUsize::new(0));
        let registry = registry(builds.clone());
        registry
            .load(
                SetupConfig::from_toml_str(
                    r#"
                    [devices.a]
                    driver = "constant"
                    value = 1.0
                    delay_ms = 100
                    [devices.total]
                    driver = "sum"
                    parts = ["a"]
                    "#,
                )
                .unwrap(),
            )
            .unwrap();

        // the second build of `a` would start while the first one sleeps
        let (a, total) = tokio::join!(registry.get_readable("a"), registry.get_readable("total"));
        assert_eq!(a.unwrap().read(None).await.unwrap(), 1.0);
        assert_eq!(total.unwrap().read(None).await.unwrap(), 1.0);
        assert_eq!(builds.load(Ordering::SeqCst), 1);

        let again = registry.get("a").await.unwrap();
        let first = registry.get("a").await.unwrap();
        assert!(Arc::ptr_eq(
            again.readable.as_ref().unwrap(),
            first.readable.as_ref().unwrap()
        ));
    }

    #[test]
    fn test_attachment_cycle_is_refused() {
        let registry = registry(Arc::new(AtomicUsize::new(0)));
        let err = registry
            .load(
                SetupConfig::from_toml_str(
                    r#"
                    [devices.x]
                    driver = "sum"
                    parts = ["y"]
                    [devices.y]
                    driver = "sum"
                    parts = ["x"]
                    "#,
                )
                .unwrap(),
            )
            .unwrap_err();
        assert!(
            err.to_string().contains("attachment cycle: x -> y -> x"),
            "{}",
            err
        );
        assert!(registry.setup().is_none());
    }

    #[test]
    fn test_load_rejects_unknown_driver_and_dangling_attachment() {
        let registry = registry(Arc::new(AtomicUsize::new(0)));
        let err = registry
            .load(
                SetupConfig::from_toml_str(
                    r#"
                    [devices.a]
                    driver = "warp_drive"
                    "#,
                )
                .unwrap(),
            )
            .unwrap_err();
        assert!(err.to_string().contains("unknown driver 'warp_drive'"));

        let err = registry
            .load(
                SetupConfig::from_toml_str(
                    r#"
                    [devices.total]
                    driver = "sum"
                    parts = ["ghost"]
                    "#,
                )
                .unwrap(),
            )
            .unwrap_err();
        assert!(err.to_string().contains("unknown device 'ghost'"));

        let err = registry
            .load(
                SetupConfig::from_toml_str(
                    r#"
                    [devices.a]
                    driver = "constant"
                    "#,
                )
                .unwrap(),
            )
            .unwrap_err();
        assert!(matches!(err, BeamError::Configuration(_)));
        assert!(registry.setup().is_none());
    }

    #[tokio::test]
    async fn test_unload_drops_devices() {
        let builds = Arc::new(AtomicUsize::new(0));
        let registry = registry(builds.clone());
        let setup = SetupConfig::from_toml_str(
            r#"
            [devices.a]
            driver = "constant"
            value = 1.0
            "#,
        )
        .unwrap();
        registry.load(setup.clone()).unwrap();
        registry.get_readable("a").await.unwrap();
        registry.unload();
        assert!(registry.device_names().is_empty());
        assert!(registry.get_readable("a").await.is_err());

        registry.load(setup).unwrap();
        registry.get_readable("a").await.unwrap();
        assert_eq!(builds.load(Ordering::SeqCst), 2);
    }
}
