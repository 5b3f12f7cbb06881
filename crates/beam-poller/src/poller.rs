//! Poller service: one [`PollWorker`] task per device of a group.

use crate::worker::PollWorker;
use beam_core::error::{AppResult, BeamError};
use beam_core::limits::DEFAULT_POLL_INTERVAL;
use beam_core::registry::DeviceRegistry;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

struct WorkerHandle {
    device: String,
    wake: Arc<Notify>,
    task: JoinHandle<()>,
}

/// Polls devices in the background and publishes their value and status
/// into the registry's cache.
///
/// Devices are created lazily by their worker; a device that cannot be
/// created is retried every 30 s until [`Poller::quit`].
///
/// # Example
///
/// ```rust,ignore
/// let poller = Poller::new(registry.clone());
/// poller.start_group("motors")?;
/// tokio::signal::ctrl_c().await?;
/// poller.quit().await;
/// ```
pub struct Poller {
    registry: Arc<DeviceRegistry>,
    default_interval: Duration,
    stop: Arc<AtomicBool>,
    workers: Mutex<Vec<WorkerHandle>>,
}

impl Poller {
    /// Poller over the devices of `registry`'s loaded setup.
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        let default_interval = registry
            .setup()
            .map(|setup| setup.poller.default_interval)
            .unwrap_or(DEFAULT_POLL_INTERVAL);
        Self {
            registry,
            default_interval,
            stop: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Start a worker for every device of the poller group `group`.
    ///
    /// Returns the number of workers started.
    pub fn start_group(&self, group: &str) -> AppResult<usize> {
        let devices = self
            .registry
            .setup()
            .and_then(|setup| setup.poller.processes.get(group).cloned())
            .ok_or_else(|| {
                BeamError::Configuration(format!("unknown poller group '{}'", group))
            })?;
        info!(group, devices = devices.len(), "poller starting");
        for device in &devices {
            self.start_device(device);
        }
        Ok(devices.len())
    }

    /// Start a worker for one device.
    pub fn start_device(&self, device: &str) {
        if self.is_stopping() {
            warn!(device, "poller is quitting, not starting worker");
            return;
        }
        let wake = Arc::new(Notify::new());
        let worker = PollWorker::new(
            device,
            self.registry.clone(),
            self.default_interval,
            self.stop.clone(),
            wake.clone(),
        );
        info!(device, "starting worker");
        let task = tokio::spawn(worker.run());
        self.workers.lock().push(WorkerHandle {
            device: device.to_string(),
            wake,
            task,
        });
    }

    /// Number of started workers.
    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    /// Whether [`Poller::quit`] was called.
    pub fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Stop all workers and wait for them to finish.
    pub async fn quit(&self) {
        if self.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("poller quitting...");
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in &workers {
            worker.wake.notify_one();
        }
        for worker in workers {
            if let Err(e) = worker.task.await {
                warn!(device = %worker.device, error = %e, "worker ended abnormally");
            }
        }
        info!("poller finished");
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        for worker in self.workers.get_mut().iter() {
            worker.wake.notify_one();
        }
    }
}
