use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use super::video::{normalize_frame_as, ChannelOrder};
use super::{BridgeStatusHandle, VirtualBridge};
use crate::errors::RelayResult;
use crate::media::{decode_base64, decode_image};
use crate::relay::protocol::MediaMessage;
use crate::relay::{MediaTap, Registry};

/// Thread that feeds relayed media into a [`VirtualBridge`].
pub struct BridgeTap {
    tap: MediaTap,
    handle: Option<JoinHandle<()>>,
}

impl BridgeTap {
    pub fn spawn(registry: &Registry, bridge: Arc<Mutex<VirtualBridge>>, capacity: usize) -> RelayResult<Self> {
        let target = {
            let guard = bridge.lock().unwrap_or_else(PoisonError::into_inner);
            Target {
                size: guard.frame_size(),
                status: guard.status_handle(),
            }
        };
        let tap = registry.tap(capacity);
        let consumer = tap.clone();
        let handle = std::thread::Builder::new()
            .name("nodeflow-bridge".into())
            .spawn(move || run(&consumer, &bridge, &target))?;
        Ok(Self {
            tap,
            handle: Some(handle),
        })
    }

    /// Messages waiting to be decoded.
    pub fn backlog(&self) -> usize {
        self.tap.len()
    }

    pub fn stop(&mut self) {
        self.tap.close();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::warn!("Bridge thread panicked");
            }
        }
    }
}

impl Drop for BridgeTap {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Target {
    size: (u32, u32),
    status: BridgeStatusHandle,
}

fn run(tap: &MediaTap, bridge: &Mutex<VirtualBridge>, target: &Target) {
    log::debug!("Bridge tap started");
    loop {
        let Some(text) = tap.pop(Duration::from_millis(200)) else {
            if tap.is_closed() {
                break;
            }
            continue;
        };
        if let Err(e) = handle(&text, bridge, target) {
            log::debug!("Bridge skipped message: {}", e);
        }
    }
    log::debug!("Bridge tap exited");
}

fn handle(text: &str, bridge: &Mutex<VirtualBridge>, target: &Target) -> RelayResult<()> {
    match MediaMessage::parse(text)? {
        MediaMessage::Video { .. } if !target.status.snapshot().camera_available => {}
        MediaMessage::Video { data } => {
            // Only the sink write happens under the lock.
            let frame = decode_image(&decode_base64(&data)?)?;
            let (width, height) = target.size;
            let bgr = normalize_frame_as(frame, ChannelOrder::Rgb, width, height)?;
            bridge
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .send_bgr_frame(&bgr);
        }
        MediaMessage::Audio {
            data, sample_rate, ..
        } => {
            let samples = data.into_samples()?;
            if !samples.is_empty() {
                bridge
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .send_audio(&samples, sample_rate);
            }
        }
    }
    Ok(())
}
