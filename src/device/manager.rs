use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::{DeviceDriver, DeviceResource, DeviceState, DeviceStatus, DeviceType, StreamSettings};
use crate::buffer::BoundedBuffer;
use crate::errors::{RelayError, RelayResult};
use crate::media::MediaFrame;

#[derive(Debug, Clone)]
pub struct DeviceManagerConfig {
    /// Capacity of each device's media buffer.
    pub buffer_capacity: usize,
    /// Upper bound on waiting for a worker thread during stop.
    pub join_timeout: Duration,
    pub settings: StreamSettings,
}

impl Default for DeviceManagerConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 10,
            join_timeout: Duration::from_secs(2),
            settings: StreamSettings::default(),
        }
    }
}

/// Point-in-time view of one device, for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    pub device: DeviceType,
    pub status: DeviceStatus,
    pub state: DeviceState,
    pub buffered: usize,
    pub dropped: u64,
    pub started_at: Option<DateTime<Utc>>,
}

struct ActiveDevice {
    resource: Arc<dyn DeviceResource>,
    buffer: Arc<BoundedBuffer<MediaFrame>>,
    running: Arc<AtomicBool>,
    fault: Arc<Mutex<Option<String>>>,
    worker: Option<JoinHandle<()>>,
    started_at: DateTime<Utc>,
}

impl ActiveDevice {
    fn fault(&self) -> Option<String> {
        self.fault.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[derive(Default)]
struct DeviceSlot {
    record: Mutex<Option<ActiveDevice>>,
    /// Cleared by the worker on a fault, so `status` stops reporting it.
    active: Arc<AtomicBool>,
}

impl DeviceSlot {
    fn lock(&self) -> MutexGuard<'_, Option<ActiveDevice>> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Start/stop state machine for every local device type.
///
/// Each device type has an independent lock, so a slow webcam never blocks
/// the microphone. Start and stop are idempotent.
pub struct DeviceManager {
    driver: Arc<dyn DeviceDriver>,
    config: DeviceManagerConfig,
    slots: [DeviceSlot; 3],
}

impl DeviceManager {
    pub fn new(driver: Arc<dyn DeviceDriver>, config: DeviceManagerConfig) -> Self {
        log::info!("Device manager using {} driver", driver.name());
        Self {
            driver,
            config,
            slots: Default::default(),
        }
    }

    fn slot(&self, device: DeviceType) -> &DeviceSlot {
        &self.slots[device.index()]
    }

    /// Acquire the device and spawn its worker.
    ///
    /// Already active: returns `Active` without touching the hardware.
    /// A device sitting in `Error` is torn down and reopened.
    pub fn start(&self, device: DeviceType) -> RelayResult<DeviceState> {
        let slot = self.slot(device);
        let mut record = slot.lock();

        if let Some(active) = record.as_ref() {
            match active.fault() {
                None => {
                    log::info!("{} is already running", device);
                    return Ok(DeviceState::Active);
                }
                Some(message) => {
                    log::warn!("Restarting {} after error: {}", device, message);
                    if let Some(stale) = record.take() {
                        slot.active.store(false, Ordering::Release);
                        self.teardown(device, stale);
                    }
                }
            }
        }

        let resource: Arc<dyn DeviceResource> = self
            .driver
            .open(device, &self.config.settings)
            .map_err(|e| {
                log::error!("Error starting {}: {}", device, e);
                match e {
                    RelayError::DeviceStart(_) => e,
                    other => RelayError::DeviceStart(format!("{}: {}", device, other)),
                }
            })?
            .into();

        let buffer = Arc::new(BoundedBuffer::new(self.config.buffer_capacity));
        let running = Arc::new(AtomicBool::new(true));
        let fault = Arc::new(Mutex::new(None));

        let worker = {
            let resource = resource.clone();
            let buffer = buffer.clone();
            let running = running.clone();
            let fault = fault.clone();
            let slot_active = slot.active.clone();
            std::thread::Builder::new()
                .name(format!("nodeflow-{}", device))
                .spawn(move || worker_loop(device, resource, buffer, running, fault, slot_active))
        };

        let worker = match worker {
            Ok(handle) => handle,
            Err(e) => {
                if let Err(release_err) = resource.release() {
                    log::warn!("Failed to release {} after spawn error: {}", device, release_err);
                }
                return Err(RelayError::DeviceStart(format!(
                    "{}: worker spawn failed: {}",
                    device, e
                )));
            }
        };

        *record = Some(ActiveDevice {
            resource,
            buffer,
            running,
            fault,
            worker: Some(worker),
            started_at: Utc::now(),
        });
        slot.active.store(true, Ordering::Release);
        log::info!("{} started successfully", device);
        Ok(DeviceState::Active)
    }

    /// Stop the worker and release the device.
    ///
    /// Never-started devices return `Ok`. Teardown failures are logged and
    /// the record is removed regardless: a stale active record is worse than
    /// a leaked handle.
    pub fn stop(&self, device: DeviceType) -> RelayResult<()> {
        let slot = self.slot(device);
        let mut record = slot.lock();
        let Some(active) = record.take() else {
            log::info!("{} is already stopped", device);
            return Ok(());
        };
        slot.active.store(false, Ordering::Release);
        self.teardown(device, active);
        log::info!("{} stopped successfully", device);
        Ok(())
    }

    fn teardown(&self, device: DeviceType, mut active: ActiveDevice) {
        {
            // Under the fault lock so a faulting worker cannot clear the
            // slot flag of whatever starts next.
            let _fault = active.fault.lock().unwrap_or_else(PoisonError::into_inner);
            active.running.store(false, Ordering::Release);
        }
        active.buffer.close();

        if let Some(handle) = active.worker.take() {
            if !join_with_timeout(handle, self.config.join_timeout) {
                let err = RelayError::DeviceStop(format!(
                    "{} worker did not exit within {:?}; releasing anyway",
                    device, self.config.join_timeout
                ));
                log::warn!("{}", err);
            }
        }

        if let Err(e) = active.resource.release() {
            log::warn!("{}", RelayError::DeviceStop(format!("{}: {}", device, e)));
        }
    }

    /// Snapshot read; does not take the device lock. A device whose worker
    /// has faulted reads as stopped.
    pub fn status(&self, device: DeviceType) -> DeviceStatus {
        if self.slot(device).active.load(Ordering::Acquire) {
            DeviceStatus::Running
        } else {
            DeviceStatus::Stopped
        }
    }

    pub fn state(&self, device: DeviceType) -> DeviceState {
        match self.slot(device).lock().as_ref() {
            None => DeviceState::Inactive,
            Some(active) => match active.fault() {
                Some(message) => DeviceState::Error(message),
                None => DeviceState::Active,
            },
        }
    }

    pub fn snapshot(&self) -> Vec<DeviceSnapshot> {
        DeviceType::ALL
            .iter()
            .map(|&device| {
                let record = self.slot(device).lock();
                let (state, buffered, dropped, started_at) = match record.as_ref() {
                    None => (DeviceState::Inactive, 0, 0, None),
                    Some(active) => (
                        active
                            .fault()
                            .map(DeviceState::Error)
                            .unwrap_or(DeviceState::Active),
                        active.buffer.len(),
                        active.buffer.dropped(),
                        Some(active.started_at),
                    ),
                };
                DeviceSnapshot {
                    device,
                    status: self.status(device),
                    state,
                    buffered,
                    dropped,
                    started_at,
                }
            })
            .collect()
    }

    fn buffer(&self, device: DeviceType) -> Option<Arc<BoundedBuffer<MediaFrame>>> {
        self.slot(device).lock().as_ref().map(|a| a.buffer.clone())
    }

    /// Next captured frame from a running capture device.
    ///
    /// The device lock is only held long enough to find the buffer.
    pub fn next_frame(&self, device: DeviceType, timeout: Duration) -> Option<MediaFrame> {
        self.buffer(device)?.pop(timeout)
    }

    /// Queue a frame for a running playback device. Returns false when the
    /// device is not running.
    pub fn feed(&self, device: DeviceType, frame: MediaFrame) -> bool {
        match self.buffer(device) {
            Some(buffer) => {
                buffer.push(frame);
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        for device in DeviceType::ALL {
            if let Err(e) = self.stop(device) {
                log::warn!("Error stopping {} during shutdown: {}", device, e);
            }
        }
    }

    pub fn driver_name(&self) -> &str {
        self.driver.name()
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        self.stop_all();
    }
}

fn worker_loop(
    device: DeviceType,
    resource: Arc<dyn DeviceResource>,
    buffer: Arc<BoundedBuffer<MediaFrame>>,
    running: Arc<AtomicBool>,
    fault: Arc<Mutex<Option<String>>>,
    slot_active: Arc<AtomicBool>,
) {
    log::debug!("{} worker started", device);
    while running.load(Ordering::Acquire) {
        if let Err(e) = resource.pump(&buffer) {
            log::error!("Error in {} worker: {}", device, e);
            let mut fault = fault.lock().unwrap_or_else(PoisonError::into_inner);
            if running.load(Ordering::Acquire) {
                slot_active.store(false, Ordering::Release);
            }
            *fault = Some(e.user_message());
            break;
        }
    }
    log::debug!("{} worker exited", device);
}

/// Join a worker, giving up after `timeout`. Returns whether it was joined.
fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration) -> bool {
    let start = Instant::now();
    loop {
        if handle.is_finished() {
            if handle.join().is_err() {
                log::warn!("Device worker panicked");
            }
            return true;
        }
        if start.elapsed() >= timeout {
            // Detached; the thread exits on its own once its I/O returns.
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}
