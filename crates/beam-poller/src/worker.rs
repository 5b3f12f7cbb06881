//! Per-device poll worker.
//!
//! # Schedule
//!
//! ```text
//!            target changed                 status no longer BUSY
//!   Normal ─────────────────► Moving ───────────────────────────► Normal
//!     │                       (poll every 0.5 s)
//!     │ pollinterval changed
//!     ▼
//!   NewInterval ── next successful poll ──► Normal
//! ```
//!
//! Failed polls are absorbed: the first five are logged, the sixth in a row
//! stretches the interval five-fold, and the next successful poll restores
//! the configured interval.

use beam_core::cache::{Cache, CacheUpdate, KEY_POLLINTERVAL, KEY_STATUS, KEY_TARGET, KEY_VALUE};
use beam_core::capabilities::{PollReading, Pollable};
use beam_core::limits::{
    DEVICE_RETRY_DELAY, MOVING_POLL_INTERVAL, POLL_ERROR_BACKOFF_FACTOR, POLL_ERROR_LOG_LIMIT,
};
use beam_core::registry::DeviceRegistry;
use beam_core::status::DeviceStatus;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Where a worker is in its schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Polling at the configured interval.
    Normal,
    /// A move was started; poll fast until the device is idle.
    Moving,
    /// The configured interval changed; adopt it after the next poll.
    NewInterval,
}

/// Interval bookkeeping of one poll worker.
#[derive(Debug, Clone)]
pub struct PollSchedule {
    configured: Duration,
    interval: Duration,
    state: WorkerState,
    errcount: u32,
}

impl PollSchedule {
    /// Start in `Normal` state at `configured`.
    pub fn new(configured: Duration) -> Self {
        Self {
            configured,
            interval: configured,
            state: WorkerState::Normal,
            errcount: 0,
        }
    }

    /// Current state.
    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Sleep before the next poll.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Interval used in `Normal` state.
    pub fn configured(&self) -> Duration {
        self.configured
    }

    /// Consecutive failed polls.
    pub fn error_count(&self) -> u32 {
        self.errcount
    }

    /// The device got a new target.
    pub fn on_target(&mut self) {
        self.state = WorkerState::Moving;
    }

    /// The device's poll interval changed; `None` keeps the current one.
    pub fn on_new_interval(&mut self, interval: Option<Duration>) {
        if let Some(interval) = interval {
            self.configured = interval;
        }
        self.state = WorkerState::NewInterval;
    }

    /// Record a failed poll; returns whether it should be logged.
    pub fn on_failure(&mut self) -> bool {
        let log = self.errcount < POLL_ERROR_LOG_LIMIT;
        if self.errcount == POLL_ERROR_LOG_LIMIT {
            self.interval *= POLL_ERROR_BACKOFF_FACTOR;
        }
        self.errcount = self.errcount.saturating_add(1);
        log
    }

    /// Record a successful poll that returned `status`.
    pub fn on_success(&mut self, status: &DeviceStatus) {
        if self.errcount > 0 {
            self.interval = self.configured;
            self.errcount = 0;
        }
        match self.state {
            WorkerState::Moving => {
                self.interval = MOVING_POLL_INTERVAL;
                if !status.is_busy() {
                    self.state = WorkerState::Normal;
                    self.interval = self.configured;
                }
            }
            WorkerState::NewInterval => {
                self.interval = self.configured;
                self.state = WorkerState::Normal;
            }
            WorkerState::Normal => {}
        }
    }
}

/// Cache `pollinterval` payload (seconds) as a duration.
fn interval_from_cache(update: &CacheUpdate) -> Option<Duration> {
    update
        .value
        .as_f64()
        .filter(|secs| *secs > 0.0)
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
}

/// Background task polling one device into the cache.
pub(crate) struct PollWorker {
    device: String,
    registry: Arc<DeviceRegistry>,
    default_interval: Duration,
    stop: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl PollWorker {
    pub(crate) fn new(
        device: impl Into<String>,
        registry: Arc<DeviceRegistry>,
        default_interval: Duration,
        stop: Arc<AtomicBool>,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            device: device.into(),
            registry,
            default_interval,
            stop,
            wake,
        }
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Sleep for `duration`, returning early on a wake-up.
    async fn pause(&self, duration: Duration) {
        tokio::select! {
            _ = sleep(duration) => {}
            _ = self.wake.notified() => {}
        }
    }

    /// Create the device, retrying until it works or the poller stops.
    async fn connect(&self) -> Option<Arc<dyn Pollable>> {
        loop {
            if self.stopped() {
                return None;
            }
            match self.registry.get_pollable(&self.device).await {
                Ok(device) => return Some(device),
                Err(e) => {
                    warn!(
                        device = %self.device,
                        error = %e,
                        "error creating device, trying again in {} s",
                        DEVICE_RETRY_DELAY.as_secs()
                    );
                    self.pause(DEVICE_RETRY_DELAY).await;
                }
            }
        }
    }

    pub(crate) async fn run(self) {
        let Some(device) = self.connect().await else {
            return;
        };
        let cache = self.registry.cache();
        let configured = device.poll_interval().unwrap_or(self.default_interval);
        let schedule = Arc::new(Mutex::new(PollSchedule::new(configured)));

        let on_target = {
            let schedule = schedule.clone();
            let wake = self.wake.clone();
            Arc::new(move |_: &CacheUpdate| {
                schedule.lock().on_target();
                wake.notify_one();
            })
        };
        let on_interval = {
            let schedule = schedule.clone();
            let wake = self.wake.clone();
            Arc::new(move |update: &CacheUpdate| {
                schedule.lock().on_new_interval(interval_from_cache(update));
                wake.notify_one();
            })
        };
        let subscriptions = [
            cache.subscribe(&self.device, KEY_TARGET, on_target),
            cache.subscribe(&self.device, KEY_POLLINTERVAL, on_interval),
        ];
        info!(device = %self.device, interval = ?configured, "polling started");

        let mut cycle = 0u64;
        while !self.stopped() {
            cycle += 1;
            match device.poll(cycle).await {
                Ok(reading) => {
                    debug!(
                        device = %self.device,
                        status = %reading.status,
                        value = %reading.value,
                        "polled"
                    );
                    publish(cache.as_ref(), &self.device, &reading);
                    schedule.lock().on_success(&reading.status);
                }
                Err(e) => {
                    let log = schedule.lock().on_failure();
                    if log {
                        warn!(device = %self.device, error = %e, "error reading device");
                    }
                }
            }
            let interval = schedule.lock().interval();
            self.pause(interval).await;
        }

        for id in subscriptions {
            cache.unsubscribe(id);
        }
        debug!(device = %self.device, cycles = cycle, "polling stopped");
    }
}

fn publish(cache: &dyn Cache, device: &str, reading: &PollReading) {
    cache.put(device, KEY_VALUE, reading.value.clone());
    match serde_json::to_value(&reading.status) {
        Ok(status) => cache.put(device, KEY_STATUS, status),
        Err(e) => warn!(device, error = %e, "cannot encode status"),
    }
}
