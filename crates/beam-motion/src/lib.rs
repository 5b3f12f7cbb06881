//! Composite motion devices.
//!
//! - [`Axis`] - motor with optional coder and observers, backlash
//!   compensation, drag-error detection and bounded retries
//! - [`Slit`] - four blades moved in a collision-free order, addressed in
//!   one of three opmodes
//! - [`SlitAxis`] - a single slit coordinate (blade, center, width or
//!   height) as a scalar moveable
//!
//! All of them are built from setup files through the factories registered by
//! [`register_all`], next to whatever hardware drivers provide the motors.

mod axis;
mod slit;

pub use axis::{Axis, AxisConfig, AxisFactory};
pub use slit::{
    Coordinates, Opmode, Slit, SlitAxis, SlitAxisConfig, SlitAxisFactory, SlitAxisKind,
    SlitConfig, SlitFactory,
};

use beam_core::registry::DeviceRegistry;

/// Register the axis, slit and slit-axis factories with a device registry.
pub fn register_all(registry: &DeviceRegistry) {
    registry.register_factory(AxisFactory);
    registry.register_factory(SlitFactory);
    registry.register_factory(SlitAxisFactory);
}
