//! Driver Factory and Component Types
//!
//! Drivers implement [`DriverFactory`] and are registered with the
//! [`DeviceRegistry`](crate::registry::DeviceRegistry) at startup via explicit
//! `registry.register_factory(factory)` calls.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Composition Root (beamctl)                   │
//! │  registry.register_factory(MockMotorFactory);                   │
//! │  registry.register_factory(AxisFactory);                        │
//! │  registry.register_factory(SlitFactory);                        │
//! └─────────────────────────────────────────────────────────────────┘
//!                                   │
//!                                   ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        DeviceRegistry                           │
//! │  factories: HashMap<driver_type, Arc<dyn DriverFactory>>        │
//! │  devices:   HashMap<device_name, DeviceComponents> (lazy)       │
//! └─────────────────────────────────────────────────────────────────┘
//!                                   │
//!                                   ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │               DriverFactory::build(ctx, config)                 │
//! │  Parses TOML settings, resolves attachments through ctx,        │
//! │  returns the device's capabilities                              │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example: Implementing a Driver Factory
//!
//! ```rust,ignore
//! pub struct AxisFactory;
//!
//! impl DriverFactory for AxisFactory {
//!     fn driver_type(&self) -> &'static str { "axis" }
//!     fn name(&self) -> &'static str { "Motor/coder axis" }
//!
//!     fn attachments(&self, config: &toml::Value) -> Vec<String> {
//!         config.get("motor").and_then(|v| v.as_str()).map(String::from).into_iter().collect()
//!     }
//!
//!     fn build(&self, ctx: BuildContext, config: toml::Value)
//!         -> BoxFuture<'static, AppResult<DeviceComponents>>
//!     {
//!         Box::pin(async move {
//!             let cfg: AxisConfig = parse_settings(ctx.name(), config)?;
//!             let motor = ctx.moveable(&cfg.motor).await?;
//!             let axis = Arc::new(Axis::new(ctx.name(), cfg, motor, None, vec![])?);
//!             Ok(DeviceComponents::new().with_moveable(axis))
//!         })
//!     }
//! }
//! ```

use crate::capabilities::{MultiMoveable, Moveable, Pollable, PolledReadable, Readable};
use crate::error::AppResult;
use crate::registry::BuildContext;
use futures::future::BoxFuture;
use std::any::Any;
use std::sync::Arc;

// =============================================================================
// Device Components (Capability Bag)
// =============================================================================

/// Container for capability trait objects returned by drivers.
///
/// When a driver is instantiated, it returns a `DeviceComponents` struct
/// containing all the capabilities it implements. The registry then hands
/// out the right trait object for capability-based lookups.
///
/// # Builder Pattern
///
/// ```rust,ignore
/// let motor = Arc::new(MockMotor::with_config("m1", cfg)?);
///
/// let components = DeviceComponents::new().with_moveable(motor);
/// ```
///
/// By storing each capability separately we avoid runtime downcasting and
/// let drivers implement only what they support.
#[derive(Clone, Default)]
pub struct DeviceComponents {
    /// Value/status readout.
    pub readable: Option<Arc<dyn Readable>>,
    /// Motion control.
    pub moveable: Option<Arc<dyn Moveable>>,
    /// Tuple-valued motion.
    pub multi_moveable: Option<Arc<dyn MultiMoveable>>,
    /// Background polling; falls back to the readable when unset.
    pub pollable: Option<Arc<dyn Pollable>>,
    /// The concrete driver object, for drivers layered on a specific type.
    pub handle: Option<Arc<dyn Any + Send + Sync>>,
}

impl DeviceComponents {
    /// Empty bag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add readout capability.
    pub fn with_readable(mut self, readable: Arc<dyn Readable>) -> Self {
        self.readable = Some(readable);
        self
    }

    /// Add motion capability.
    ///
    /// A moveable is also readable, so `readable` is filled in when still
    /// empty.
    pub fn with_moveable<M>(mut self, moveable: Arc<M>) -> Self
    where
        M: Moveable + 'static,
    {
        if self.readable.is_none() {
            self.readable = Some(moveable.clone());
        }
        self.moveable = Some(moveable);
        self
    }

    /// Add tuple-valued motion capability.
    pub fn with_multi_moveable(mut self, multi: Arc<dyn MultiMoveable>) -> Self {
        self.multi_moveable = Some(multi);
        self
    }

    /// Add an explicit polling capability.
    pub fn with_pollable(mut self, pollable: Arc<dyn Pollable>) -> Self {
        self.pollable = Some(pollable);
        self
    }

    /// Expose the concrete driver object; see [`BuildContext::handle`].
    pub fn with_handle<T: Any + Send + Sync>(mut self, handle: Arc<T>) -> Self {
        self.handle = Some(handle);
        self
    }

    /// Polling capability, adapting the readable when no explicit one exists.
    pub fn pollable(&self) -> Option<Arc<dyn Pollable>> {
        self.pollable.clone().or_else(|| {
            self.readable
                .clone()
                .map(|r| Arc::new(PolledReadable::new(r)) as Arc<dyn Pollable>)
        })
    }
}

impl std::fmt::Debug for DeviceComponents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceComponents")
            .field("readable", &self.readable.is_some())
            .field("moveable", &self.moveable.is_some())
            .field("multi_moveable", &self.multi_moveable.is_some())
            .field("pollable", &self.pollable.is_some())
            .field("handle", &self.handle.is_some())
            .finish()
    }
}

// =============================================================================
// Driver Factory
// =============================================================================

/// Factory turning a device table of a setup into a live device.
pub trait DriverFactory: Send + Sync {
    /// Key matched against the `driver` field of a device table.
    fn driver_type(&self) -> &'static str;

    /// Human-readable driver name.
    fn name(&self) -> &'static str;

    /// Check the settings without building anything.
    fn validate(&self, config: &toml::Value) -> AppResult<()>;

    /// Names of other devices this device needs (motor, coder, blades…).
    ///
    /// Used by the registry to reject setups with dangling references at
    /// load time.
    fn attachments(&self, _config: &toml::Value) -> Vec<String> {
        Vec::new()
    }

    /// Build the device.
    fn build(
        &self,
        ctx: BuildContext,
        config: toml::Value,
    ) -> BoxFuture<'static, AppResult<DeviceComponents>>;
}

/// Collect string-valued attachment fields from a settings table.
///
/// Scalar fields (`motor = "m1"`) and arrays (`obs = ["a", "b"]`) are both
/// accepted; missing fields are skipped.
pub fn attachment_names(config: &toml::Value, fields: &[&str]) -> Vec<String> {
    let mut names = Vec::new();
    for field in fields {
        match config.get(*field) {
            Some(toml::Value::String(name)) => names.push(name.clone()),
            Some(toml::Value::Array(items)) => names.extend(
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(String::from)),
            ),
            _ => {}
        }
    }
    names
}
