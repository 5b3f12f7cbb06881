//! Subcommand implementations.

use anyhow::{bail, Result};
use beam_core::{AppResult, BeamError, DeviceRegistry, DeviceStatus, InMemoryCache, SetupConfig};
use beam_poller::{Poller, Supervisor, TokioProcessManager};
use serde_json::json;
use std::ffi::OsString;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

/// Registry with every known driver factory and `setup` loaded.
pub fn build_registry(setup: SetupConfig) -> AppResult<Arc<DeviceRegistry>> {
    let registry = DeviceRegistry::new(Arc::new(InMemoryCache::new()));
    beam_driver_mock::register_all(&registry);
    beam_motion::register_all(&registry);
    registry.load(setup)?;
    Ok(registry)
}

/// Value and status of one device, as printed by `move` and `read`.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub device: String,
    pub value: serde_json::Value,
    pub status: DeviceStatus,
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {} ({})", self.device, self.value, self.status)
    }
}

/// Read a scalar device, or all coordinates of a multi-valued one.
pub async fn read_device(registry: &Arc<DeviceRegistry>, device: &str) -> AppResult<Reading> {
    let (value, status) = match registry.get_readable(device).await {
        Ok(readable) => (
            json!(readable.read(None).await?),
            readable.status(None).await?,
        ),
        Err(BeamError::CapabilityMissing { .. }) => {
            let multi = registry.get_multi_moveable(device).await?;
            (
                json!(multi.read_values(None).await?),
                multi.status(None).await?,
            )
        }
        Err(e) => return Err(e),
    };
    Ok(Reading {
        device: device.to_string(),
        value,
        status,
    })
}

/// Move `device` and wait for it.
///
/// A single target goes to a scalar moveable when the device has one; all
/// other cases are handed to the multi-valued moveable, which checks the
/// number of coordinates.
pub async fn move_device(
    registry: &Arc<DeviceRegistry>,
    device: &str,
    targets: &[f64],
) -> AppResult<()> {
    if targets.is_empty() {
        return Err(BeamError::usage(device, "no target given"));
    }
    if let [target] = targets {
        match registry.get_moveable(device).await {
            Ok(moveable) => return moveable.move_to(*target).await,
            Err(BeamError::CapabilityMissing { .. }) => {}
            Err(e) => return Err(e),
        }
    }
    let multi = registry.get_multi_moveable(device).await?;
    multi.start_values(targets).await?;
    multi.wait().await
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() -> std::io::Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res,
        _ = terminate.recv() => Ok(()),
    }
}

/// Run the workers of one poller group until asked to stop.
pub async fn run_poller_group(setup: SetupConfig, group: &str) -> Result<()> {
    let registry = build_registry(setup)?;
    let poller = Poller::new(registry);
    let workers = poller.start_group(group)?;
    info!(group, workers, "poller running");

    shutdown_signal().await?;
    info!(group, "stopping poller");
    poller.quit().await;
    Ok(())
}

/// Supervise one child poller per group until asked to stop.
///
/// Children run `<program> poller --setup <path> <group>`, where the
/// program is `poller.program` from the setup or this executable.
pub async fn run_poller_master(setup: SetupConfig, path: &Path) -> Result<()> {
    let groups: Vec<String> = setup.poller.processes.keys().cloned().collect();
    if groups.is_empty() {
        bail!("setup {} defines no poller groups", path.display());
    }
    let program = match setup.poller.program.clone() {
        Some(program) => program,
        None => std::env::current_exe()?,
    };
    let args = [
        OsString::from("poller"),
        OsString::from("--setup"),
        path.as_os_str().to_owned(),
    ];
    let supervisor = Arc::new(Supervisor::new(
        Arc::new(TokioProcessManager::new(program, args)),
        groups,
    ));

    if let Err(e) = supervisor.start().await {
        if let Err(quit_err) = supervisor.quit() {
            warn!(error = %quit_err, "cannot terminate started pollers");
        }
        return Err(e.into());
    }
    let runner = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.run().await })
    };

    shutdown_signal().await?;
    info!("stopping all pollers");
    supervisor.quit()?;
    runner.await?;
    Ok(())
}
