//! # beam-core
//!
//! Foundation crate for beamline device control.
//!
//! This crate contains:
//! - Capability traits ([`Readable`], [`Moveable`], [`MultiMoveable`], [`Pollable`])
//! - The status model ([`StatusCode`], [`DeviceStatus`])
//! - Error types ([`BeamError`], [`DriverError`])
//! - Limits and shared timing constants
//! - The shared [`Cache`] with change subscriptions
//! - Setup loading ([`SetupConfig`]) and the lazy [`DeviceRegistry`]
//!
//! Drivers (`beam-driver-mock`), composite devices (`beam-motion`) and the
//! poller (`beam-poller`) all build on these types.

pub mod cache;
pub mod capabilities;
pub mod config;
pub mod driver;
pub mod error;
pub mod limits;
pub mod registry;
pub mod status;

pub use cache::{Cache, CacheCallback, CacheEntry, CacheUpdate, InMemoryCache, SubscriptionId};
pub use capabilities::{
    Moveable, MultiMoveable, PollReading, Pollable, PolledReadable, Readable,
};
pub use config::{parse_settings, DeviceConfig, PollerSettings, SetupConfig};
pub use driver::{attachment_names, DeviceComponents, DriverFactory};
pub use error::{AppResult, BeamError, DriverError, DriverErrorKind};
pub use limits::{LimitPair, Limits};
pub use registry::{BuildContext, DeviceRegistry};
pub use status::{DeviceStatus, StatusCode};
