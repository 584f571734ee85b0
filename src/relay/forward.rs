//! Media movement between local devices and the hub
//!
//! Capture forwarders turn frames from a running webcam or microphone into
//! wire messages for every peer. The speaker feed taps relayed audio and
//! queues it for the local speaker while that device is running.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::protocol::{encode_media, MediaMessage};
use super::registry::{MediaTap, Registry};
use crate::device::{DeviceManager, DeviceStatus, DeviceType};
use crate::errors::RelayResult;
use crate::media::MediaFrame;

const POLL: Duration = Duration::from_millis(200);
const IDLE: Duration = Duration::from_millis(100);

pub struct Forwarders {
    running: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
    speaker_tap: Option<MediaTap>,
}

impl Forwarders {
    pub fn start(registry: Arc<Registry>, devices: Arc<DeviceManager>, tap_capacity: usize) -> RelayResult<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let mut handles = Vec::new();

        for device in [DeviceType::Webcam, DeviceType::Microphone] {
            let registry = registry.clone();
            let devices = devices.clone();
            let running = running.clone();
            handles.push(
                std::thread::Builder::new()
                    .name(format!("nodeflow-forward-{}", device))
                    .spawn(move || forward_capture(device, &registry, &devices, &running))?,
            );
        }

        let speaker_tap = registry.tap(tap_capacity);
        {
            let tap = speaker_tap.clone();
            let running = running.clone();
            handles.push(
                std::thread::Builder::new()
                    .name("nodeflow-speaker-feed".into())
                    .spawn(move || feed_speaker(&tap, &devices, &running))?,
            );
        }

        Ok(Self {
            running,
            handles,
            speaker_tap: Some(speaker_tap),
        })
    }

    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(tap) = self.speaker_tap.take() {
            tap.close();
        }
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                log::warn!("Media forwarder panicked");
            }
        }
    }
}

impl Drop for Forwarders {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn forward_capture(device: DeviceType, registry: &Registry, devices: &DeviceManager, running: &AtomicBool) {
    while running.load(Ordering::Acquire) {
        let Some(frame) = devices.next_frame(device, POLL) else {
            if devices.status(device) == DeviceStatus::Stopped {
                std::thread::sleep(IDLE);
            }
            continue;
        };
        match encode_media(&frame) {
            Ok(message) => {
                registry.broadcast(message, None);
            }
            Err(e) => log::warn!("Failed to encode {} frame: {}", device, e),
        }
    }
}

fn feed_speaker(tap: &MediaTap, devices: &DeviceManager, running: &AtomicBool) {
    while running.load(Ordering::Acquire) {
        let Some(text) = tap.pop(POLL) else {
            if tap.is_closed() {
                return;
            }
            continue;
        };
        if devices.status(DeviceType::Speaker) != DeviceStatus::Running {
            continue;
        }
        match decode_audio(&text) {
            Ok(Some(frame)) => {
                devices.feed(DeviceType::Speaker, frame);
            }
            Ok(None) => {}
            Err(e) => log::debug!("Speaker feed skipped message: {}", e),
        }
    }
}

fn decode_audio(text: &str) -> RelayResult<Option<MediaFrame>> {
    match MediaMessage::parse(text)? {
        MediaMessage::Audio {
            data,
            sample_rate,
            channels,
        } => Ok(Some(MediaFrame::Audio {
            samples: data.into_samples()?,
            sample_rate,
            channels,
        })),
        MediaMessage::Video { .. } => Ok(None),
    }
}
