//! Four-blade slit with collision-free blade ordering.
//!
//! A [`Slit`] drives four blade moveables (left, right, bottom, top). Targets
//! are accepted in one of three shapes, selected by the opmode:
//!
//! | opmode        | target tuple                     |
//! |---------------|----------------------------------|
//! | `4blades`     | `(left, right, bottom, top)`     |
//! | `centered`    | `(width, height)`                |
//! | `offcentered` | `(centerx, centery, width, height)` |
//!
//! Blades of one pair are started so that they never cross: when both move
//! towards smaller values the upper blade leaves first, when both move
//! towards larger values the lower blade leaves first, and the second blade
//! follows after [`SLIT_SETTLE_DELAY`]. The horizontal pair is handled
//! before the vertical pair.
//!
//! Blade positions are expressed in a shared frame (left < right for an
//! open slit). With `coordinates = "opening"` the left and bottom blade
//! motors count positive towards the outside, and their values are negated
//! on the way in and out.
//!
//! [`SlitAxis`] exposes one derived coordinate (a blade, a center or a
//! width/height) of a slit as an ordinary [`Moveable`].

use async_trait::async_trait;
use beam_core::cache::{Cache, KEY_TARGET};
use beam_core::capabilities::{Moveable, MultiMoveable, PollReading, Pollable, Readable};
use beam_core::config::parse_settings;
use beam_core::driver::{attachment_names, DeviceComponents, DriverFactory};
use beam_core::error::{AppResult, BeamError};
use beam_core::limits::SLIT_SETTLE_DELAY;
use beam_core::registry::BuildContext;
use beam_core::status::{DeviceStatus, StatusCode};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

const DRIVER_TYPE: &str = "slit";
const AXIS_DRIVER_TYPE: &str = "slit_axis";

const LEFT: usize = 0;
const RIGHT: usize = 1;
const BOTTOM: usize = 2;
const TOP: usize = 3;

const BLADE_LABELS: [&str; 4] = ["left", "right", "bottom", "top"];

// =============================================================================
// Configuration
// =============================================================================

/// Shape of the target tuple a slit accepts and reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Opmode {
    /// `(left, right, bottom, top)`
    #[default]
    #[serde(rename = "4blades", alias = "four_blades")]
    FourBlades,
    /// `(width, height)` around the origin
    Centered,
    /// `(centerx, centery, width, height)`
    Offcentered,
}

impl Opmode {
    /// Length of the target tuple.
    pub fn arity(&self) -> usize {
        match self {
            Opmode::FourBlades | Opmode::Offcentered => 4,
            Opmode::Centered => 2,
        }
    }

    /// Names of the tuple elements.
    pub fn labels(&self) -> &'static [&'static str] {
        match self {
            Opmode::FourBlades => &BLADE_LABELS,
            Opmode::Centered => &["width", "height"],
            Opmode::Offcentered => &["centerx", "centery", "width", "height"],
        }
    }

    /// Convert a target tuple into the four blade positions.
    fn to_blades(self, values: &[f64]) -> Option<[f64; 4]> {
        match (self, values) {
            (Opmode::FourBlades, &[l, r, b, t]) => Some([l, r, b, t]),
            (Opmode::Centered, &[w, h]) => Some([-w / 2.0, w / 2.0, -h / 2.0, h / 2.0]),
            (Opmode::Offcentered, &[cx, cy, w, h]) => {
                Some([cx - w / 2.0, cx + w / 2.0, cy - h / 2.0, cy + h / 2.0])
            }
            _ => None,
        }
    }

    /// Convert four blade positions into this opmode's tuple.
    fn from_blades(self, [l, r, b, t]: [f64; 4]) -> Vec<f64> {
        match self {
            Opmode::FourBlades => vec![l, r, b, t],
            Opmode::Centered => vec![r - l, t - b],
            Opmode::Offcentered => vec![(l + r) / 2.0, (b + t) / 2.0, r - l, t - b],
        }
    }
}

impl fmt::Display for Opmode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Opmode::FourBlades => "4blades",
            Opmode::Centered => "centered",
            Opmode::Offcentered => "offcentered",
        };
        write!(f, "{}", label)
    }
}

/// How blade motor positions relate to the shared slit frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Coordinates {
    /// All four motors count in the shared frame.
    #[default]
    Shared,
    /// Left and bottom motors count positive towards the outside.
    Opening,
}

/// Configuration for a [`Slit`].
#[derive(Debug, Clone, Deserialize)]
pub struct SlitConfig {
    /// Left blade device
    pub left: String,
    /// Right blade device
    pub right: String,
    /// Bottom blade device
    pub bottom: String,
    /// Top blade device
    pub top: String,

    /// Initial opmode (default: 4blades)
    #[serde(default)]
    pub opmode: Opmode,

    /// Blade motor convention (default: shared)
    #[serde(default)]
    pub coordinates: Coordinates,

    /// Tolerated offset of a centered slit before a warning is logged
    #[serde(default = "default_precision")]
    pub precision: f64,

    /// Unit; taken from the left blade when unset
    #[serde(default)]
    pub unit: Option<String>,

    /// Poll interval for the poller
    #[serde(default, with = "humantime_serde")]
    pub pollinterval: Option<Duration>,
}

fn default_precision() -> f64 {
    0.01
}

impl SlitConfig {
    /// Configuration with defaults for the given blades.
    pub fn new(
        left: impl Into<String>,
        right: impl Into<String>,
        bottom: impl Into<String>,
        top: impl Into<String>,
    ) -> Self {
        Self {
            left: left.into(),
            right: right.into(),
            bottom: bottom.into(),
            top: top.into(),
            opmode: Opmode::default(),
            coordinates: Coordinates::default(),
            precision: default_precision(),
            unit: None,
            pollinterval: None,
        }
    }

    /// Check value ranges.
    pub fn validate(&self) -> AppResult<()> {
        if !self.precision.is_finite() || self.precision < 0.0 {
            return Err(BeamError::Configuration(format!(
                "precision must be >= 0, got {}",
                self.precision
            )));
        }
        let names = [&self.left, &self.right, &self.bottom, &self.top];
        for (i, name) in names.iter().enumerate() {
            if names[..i].contains(name) {
                return Err(BeamError::Configuration(format!(
                    "blade device '{}' used twice",
                    name
                )));
            }
        }
        Ok(())
    }
}

// =============================================================================
// SlitFactory - DriverFactory implementation
// =============================================================================

/// Factory for creating [`Slit`] instances.
pub struct SlitFactory;

impl DriverFactory for SlitFactory {
    fn driver_type(&self) -> &'static str {
        DRIVER_TYPE
    }

    fn name(&self) -> &'static str {
        "Four-blade slit"
    }

    fn validate(&self, config: &toml::Value) -> AppResult<()> {
        let cfg: SlitConfig = parse_settings(DRIVER_TYPE, config.clone())?;
        cfg.validate()
    }

    fn attachments(&self, config: &toml::Value) -> Vec<String> {
        attachment_names(config, &BLADE_LABELS)
    }

    fn build(
        &self,
        ctx: BuildContext,
        config: toml::Value,
    ) -> BoxFuture<'static, AppResult<DeviceComponents>> {
        Box::pin(async move {
            let cfg: SlitConfig = parse_settings(ctx.name(), config)?;
            let blades = [
                ctx.moveable(&cfg.left).await?,
                ctx.moveable(&cfg.right).await?,
                ctx.moveable(&cfg.bottom).await?,
                ctx.moveable(&cfg.top).await?,
            ];
            let slit = Arc::new(Slit::new(ctx.name(), cfg, blades)?.with_cache(ctx.cache()));
            Ok(DeviceComponents::new()
                .with_multi_moveable(slit.clone())
                .with_pollable(slit.clone())
                .with_handle(slit))
        })
    }
}

// =============================================================================
// Slit
// =============================================================================

/// Four-blade slit.
pub struct Slit {
    name: String,
    unit: String,
    precision: f64,
    coordinates: Coordinates,
    poll_interval: Option<Duration>,
    blades: [Arc<dyn Moveable>; 4],
    opmode: Mutex<Opmode>,
    target: Mutex<Option<[f64; 4]>>,
    cache: Option<Arc<dyn Cache>>,
}

impl Slit {
    /// Create a slit over `blades` in (left, right, bottom, top) order.
    pub fn new(
        name: impl Into<String>,
        config: SlitConfig,
        blades: [Arc<dyn Moveable>; 4],
    ) -> AppResult<Self> {
        config.validate()?;
        let unit = config
            .unit
            .clone()
            .unwrap_or_else(|| blades[LEFT].unit().to_string());
        Ok(Self {
            name: name.into(),
            unit,
            precision: config.precision,
            coordinates: config.coordinates,
            poll_interval: config.pollinterval,
            blades,
            opmode: Mutex::new(config.opmode),
            target: Mutex::new(None),
            cache: None,
        })
    }

    /// Publish targets into `cache` when a move starts.
    pub fn with_cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Device name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unit of the blade positions.
    pub fn unit(&self) -> &str {
        &self.unit
    }

    /// Current opmode.
    pub fn opmode(&self) -> Opmode {
        *self.opmode.lock()
    }

    /// Switch the tuple shape used by `start_values`/`read_values`.
    pub fn set_opmode(&self, opmode: Opmode) {
        let previous = std::mem::replace(&mut *self.opmode.lock(), opmode);
        if previous != opmode {
            info!(device = %self.name, from = %previous, to = %opmode, "opmode changed");
        }
    }

    /// Last requested target, in the current opmode's shape.
    pub fn target_values(&self) -> Option<Vec<f64>> {
        let target = *self.target.lock();
        target.map(|blades| self.opmode().from_blades(blades))
    }

    /// Derived single-coordinate axis named `<slit>.<kind>`.
    pub fn sub_axis(self: &Arc<Self>, kind: SlitAxisKind) -> SlitAxis {
        SlitAxis::new(format!("{}.{}", self.name, kind), self.clone(), kind)
    }

    fn sign(&self, blade: usize) -> f64 {
        match (self.coordinates, blade) {
            (Coordinates::Opening, LEFT | BOTTOM) => -1.0,
            _ => 1.0,
        }
    }

    /// Blade positions in the shared frame.
    pub async fn read_blades(&self, max_age: Option<Duration>) -> AppResult<[f64; 4]> {
        let mut positions = [0.0; 4];
        for (i, blade) in self.blades.iter().enumerate() {
            positions[i] = self.sign(i) * blade.read(max_age).await?;
        }
        Ok(positions)
    }

    /// Check four blade targets without moving.
    pub async fn check_blades(&self, target: [f64; 4]) -> AppResult<()> {
        if target[RIGHT] < target[LEFT] {
            return Err(BeamError::limit(
                &self.name,
                format!(
                    "horizontal slit opening is negative ({} < {})",
                    target[RIGHT], target[LEFT]
                ),
            ));
        }
        if target[TOP] < target[BOTTOM] {
            return Err(BeamError::limit(
                &self.name,
                format!(
                    "vertical slit opening is negative ({} < {})",
                    target[TOP], target[BOTTOM]
                ),
            ));
        }
        for (i, blade) in self.blades.iter().enumerate() {
            if let Err(reason) = blade.is_allowed(self.sign(i) * target[i]).await {
                return Err(BeamError::limit(
                    &self.name,
                    format!("{} blade: {}", BLADE_LABELS[i], reason),
                ));
            }
        }
        Ok(())
    }

    /// Move the blades to four shared-frame positions.
    pub async fn start_blades(&self, target: [f64; 4]) -> AppResult<()> {
        self.check_blades(target).await?;
        let current = self.read_blades(None).await?;

        *self.target.lock() = Some(target);
        if let Some(cache) = &self.cache {
            let values = self.opmode().from_blades(target);
            cache.put(&self.name, KEY_TARGET, serde_json::Value::from(values));
        }
        info!(device = %self.name, ?target, "moving blades");

        let result = async {
            self.start_pair(LEFT, RIGHT, &current, &target).await?;
            self.start_pair(BOTTOM, TOP, &current, &target).await
        }
        .await;

        if let Err(e) = result {
            warn!(device = %self.name, error = %e, "blade start failed, stopping all blades");
            if let Err(stop_err) = self.stop_blades().await {
                warn!(device = %self.name, error = %stop_err, "cannot stop blades");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Start one blade pair so the blades never cross.
    async fn start_pair(
        &self,
        lo: usize,
        hi: usize,
        current: &[f64; 4],
        target: &[f64; 4],
    ) -> AppResult<()> {
        let closing_down = target[lo] < current[lo] && target[hi] < current[hi];
        let opening_up = target[lo] > current[lo] && target[hi] > current[hi];
        let (first, second) = if closing_down { (hi, lo) } else { (lo, hi) };

        self.start_blade(first, target[first]).await?;
        if closing_down || opening_up {
            sleep(SLIT_SETTLE_DELAY).await;
        }
        self.start_blade(second, target[second]).await
    }

    async fn start_blade(&self, blade: usize, position: f64) -> AppResult<()> {
        debug!(device = %self.name, blade = BLADE_LABELS[blade], position, "starting blade");
        self.blades[blade].start(self.sign(blade) * position).await
    }

    async fn stop_blades(&self) -> AppResult<()> {
        let mut first_error = None;
        for blade in &self.blades {
            if let Err(e) = blade.stop().await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn wait_blades(&self) -> AppResult<()> {
        let mut first_error = None;
        for blade in &self.blades {
            if let Err(e) = blade.wait().await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn blade_status(&self, max_age: Option<Duration>) -> AppResult<DeviceStatus> {
        let mut worst = StatusCode::Ok;
        let mut parts = Vec::with_capacity(4);
        for (label, blade) in BLADE_LABELS.iter().zip(&self.blades) {
            let status = blade.status(max_age).await?;
            worst = worst.max(status.code);
            let text = if status.message.is_empty() {
                status.code.to_string()
            } else {
                status.message
            };
            parts.push(format!("{}={}", label, text));
        }
        Ok(DeviceStatus::new(worst, parts.join(", ")))
    }

    async fn values(&self, max_age: Option<Duration>) -> AppResult<Vec<f64>> {
        let blades = self.read_blades(max_age).await?;
        let opmode = self.opmode();
        if opmode == Opmode::Centered {
            let xoff = (blades[LEFT] + blades[RIGHT]) / 2.0;
            let yoff = (blades[BOTTOM] + blades[TOP]) / 2.0;
            if xoff.abs() > self.precision || yoff.abs() > self.precision {
                warn!(
                    device = %self.name,
                    xoff,
                    yoff,
                    "slit is not centered, offcentered opmode would show the real position"
                );
            }
        }
        Ok(opmode.from_blades(blades))
    }

    fn blades_for(&self, target: &[f64]) -> AppResult<[f64; 4]> {
        let opmode = self.opmode();
        opmode.to_blades(target).ok_or_else(|| {
            BeamError::usage(
                &self.name,
                format!(
                    "opmode {} expects {} values ({}), got {}",
                    opmode,
                    opmode.arity(),
                    opmode.labels().join(", "),
                    target.len()
                ),
            )
        })
    }
}

#[async_trait]
impl MultiMoveable for Slit {
    fn name(&self) -> &str {
        &self.name
    }

    fn arity(&self) -> usize {
        self.opmode().arity()
    }

    async fn read_values(&self, max_age: Option<Duration>) -> AppResult<Vec<f64>> {
        self.values(max_age).await
    }

    async fn status(&self, max_age: Option<Duration>) -> AppResult<DeviceStatus> {
        self.blade_status(max_age).await
    }

    async fn start_values(&self, target: &[f64]) -> AppResult<()> {
        let blades = self.blades_for(target)?;
        self.start_blades(blades).await
    }

    async fn is_allowed_values(&self, target: &[f64]) -> Result<(), String> {
        let blades = self.blades_for(target).map_err(|e| e.to_string())?;
        self.check_blades(blades).await.map_err(|e| e.to_string())
    }

    async fn stop(&self) -> AppResult<()> {
        self.stop_blades().await
    }

    async fn wait(&self) -> AppResult<()> {
        self.wait_blades().await
    }

    async fn reset(&self) -> AppResult<()> {
        for blade in &self.blades {
            blade.reset().await?;
        }
        self.wait_blades().await
    }
}

#[async_trait]
impl Pollable for Slit {
    fn name(&self) -> &str {
        &self.name
    }

    fn poll_interval(&self) -> Option<Duration> {
        self.poll_interval
    }

    async fn poll(&self, _cycle: u64) -> AppResult<PollReading> {
        let status = self.blade_status(Some(Duration::ZERO)).await?;
        let values = self.values(Some(Duration::ZERO)).await?;
        Ok(PollReading {
            status,
            value: serde_json::Value::from(values),
        })
    }
}

// =============================================================================
// SlitAxis
// =============================================================================

/// Coordinate of a slit exposed by a [`SlitAxis`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlitAxisKind {
    /// Left blade
    Left,
    /// Right blade
    Right,
    /// Bottom blade
    Bottom,
    /// Top blade
    Top,
    /// Horizontal center, width kept
    CenterX,
    /// Vertical center, height kept
    CenterY,
    /// Horizontal opening, center kept
    Width,
    /// Vertical opening, center kept
    Height,
}

impl SlitAxisKind {
    fn value(self, [l, r, b, t]: [f64; 4]) -> f64 {
        match self {
            SlitAxisKind::Left => l,
            SlitAxisKind::Right => r,
            SlitAxisKind::Bottom => b,
            SlitAxisKind::Top => t,
            SlitAxisKind::CenterX => (l + r) / 2.0,
            SlitAxisKind::CenterY => (b + t) / 2.0,
            SlitAxisKind::Width => r - l,
            SlitAxisKind::Height => t - b,
        }
    }

    /// Blade targets reaching `target` from the current blade positions.
    fn blades(self, target: f64, [l, r, b, t]: [f64; 4]) -> [f64; 4] {
        match self {
            SlitAxisKind::Left => [target, r, b, t],
            SlitAxisKind::Right => [l, target, b, t],
            SlitAxisKind::Bottom => [l, r, target, t],
            SlitAxisKind::Top => [l, r, b, target],
            SlitAxisKind::CenterX => {
                let half = (r - l) / 2.0;
                [target - half, target + half, b, t]
            }
            SlitAxisKind::CenterY => {
                let half = (t - b) / 2.0;
                [l, r, target - half, target + half]
            }
            SlitAxisKind::Width => {
                let center = (l + r) / 2.0;
                [center - target / 2.0, center + target / 2.0, b, t]
            }
            SlitAxisKind::Height => {
                let center = (b + t) / 2.0;
                [l, r, center - target / 2.0, center + target / 2.0]
            }
        }
    }
}

impl fmt::Display for SlitAxisKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SlitAxisKind::Left => "left",
            SlitAxisKind::Right => "right",
            SlitAxisKind::Bottom => "bottom",
            SlitAxisKind::Top => "top",
            SlitAxisKind::CenterX => "centerx",
            SlitAxisKind::CenterY => "centery",
            SlitAxisKind::Width => "width",
            SlitAxisKind::Height => "height",
        };
        write!(f, "{}", label)
    }
}

/// One coordinate of a [`Slit`] as a scalar moveable.
///
/// Moving a derived axis moves the blades it depends on and leaves the
/// complementary coordinate untouched: a new width keeps the center, a new
/// center keeps the width.
pub struct SlitAxis {
    name: String,
    slit: Arc<Slit>,
    kind: SlitAxisKind,
    target: Mutex<Option<f64>>,
}

impl SlitAxis {
    /// Create a derived axis of `slit`.
    pub fn new(name: impl Into<String>, slit: Arc<Slit>, kind: SlitAxisKind) -> Self {
        Self {
            name: name.into(),
            slit,
            kind,
            target: Mutex::new(None),
        }
    }

    /// Which coordinate this axis drives.
    pub fn kind(&self) -> SlitAxisKind {
        self.kind
    }

    async fn blade_targets(&self, target: f64) -> AppResult<[f64; 4]> {
        let current = self.slit.read_blades(None).await?;
        Ok(self.kind.blades(target, current))
    }
}

#[async_trait]
impl Readable for SlitAxis {
    fn name(&self) -> &str {
        &self.name
    }

    fn unit(&self) -> &str {
        self.slit.unit()
    }

    async fn read(&self, max_age: Option<Duration>) -> AppResult<f64> {
        Ok(self.kind.value(self.slit.read_blades(max_age).await?))
    }

    async fn status(&self, max_age: Option<Duration>) -> AppResult<DeviceStatus> {
        self.slit.blade_status(max_age).await
    }

    fn poll_interval(&self) -> Option<Duration> {
        self.slit.poll_interval
    }
}

#[async_trait]
impl Moveable for SlitAxis {
    async fn start(&self, target: f64) -> AppResult<()> {
        let blades = self.blade_targets(target).await?;
        self.slit.start_blades(blades).await?;
        *self.target.lock() = Some(target);
        Ok(())
    }

    async fn stop(&self) -> AppResult<()> {
        self.slit.stop_blades().await
    }

    async fn wait(&self) -> AppResult<()> {
        self.slit.wait_blades().await
    }

    async fn is_allowed(&self, target: f64) -> Result<(), String> {
        let blades = self.blade_targets(target).await.map_err(|e| e.to_string())?;
        self.slit
            .check_blades(blades)
            .await
            .map_err(|e| e.to_string())
    }

    fn target(&self) -> Option<f64> {
        *self.target.lock()
    }

    async fn reset(&self) -> AppResult<()> {
        MultiMoveable::reset(self.slit.as_ref()).await
    }
}

/// Configuration for a [`SlitAxis`].
#[derive(Debug, Clone, Deserialize)]
pub struct SlitAxisConfig {
    /// Slit device name
    pub slit: String,
    /// Coordinate to expose
    pub kind: SlitAxisKind,
}

/// Factory for creating [`SlitAxis`] instances.
pub struct SlitAxisFactory;

impl DriverFactory for SlitAxisFactory {
    fn driver_type(&self) -> &'static str {
        AXIS_DRIVER_TYPE
    }

    fn name(&self) -> &'static str {
        "Slit coordinate axis"
    }

    fn validate(&self, config: &toml::Value) -> AppResult<()> {
        parse_settings::<SlitAxisConfig>(AXIS_DRIVER_TYPE, config.clone()).map(|_| ())
    }

    fn attachments(&self, config: &toml::Value) -> Vec<String> {
        attachment_names(config, &["slit"])
    }

    fn build(
        &self,
        ctx: BuildContext,
        config: toml::Value,
    ) -> BoxFuture<'static, AppResult<DeviceComponents>> {
        Box::pin(async move {
            let cfg: SlitAxisConfig = parse_settings(ctx.name(), config)?;
            let slit = ctx.handle::<Slit>(&cfg.slit).await?;
            let axis = Arc::new(SlitAxis::new(ctx.name(), slit, cfg.kind));
            Ok(DeviceComponents::new().with_moveable(axis))
        })
    }
}
