//! Virtual device bridge
//!
//! Turns relayed phone media into a local virtual camera and virtual
//! microphone so other desktop applications can select the phone like any
//! local device. Both halves are optional: a missing sink turns the
//! corresponding send into a no-op that reports `false`.
//!
//! Submodules:
//! - `video`: BGR conversion and resizing
//! - `audio`: jitter ring and sample-rate renegotiation
//! - `sink`: virtual camera sinks and virtual cable discovery
//! - `tap`: thread feeding the bridge from the relay

mod audio;
mod sink;
mod tap;
mod video;

#[cfg(feature = "audio")]
pub use audio::CpalOutputFactory;
pub use audio::{discover_output, AudioBridge, AudioOutput, AudioOutputFactory, JitterBuffer};
pub use sink::{find_virtual_cable, LoopbackSink, VirtualCameraSink, VIRTUAL_CABLE_NAMES};
pub use tap::BridgeTap;
pub use video::{normalize_frame, normalize_frame_as, ChannelOrder};

use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};

use crate::config::BridgeConfig;
use crate::media::RawFrame;

#[derive(Debug, Clone, Default, Serialize)]
pub struct BridgeStatus {
    pub camera_available: bool,
    pub camera_device: Option<String>,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub audio_available: bool,
    pub audio_device: Option<String>,
    pub audio_active: bool,
    pub sample_rate: Option<u32>,
    pub buffered_audio_secs: f64,
    pub frames_sent: u64,
    pub frames_failed: u64,
    pub audio_reopens: u64,
}

/// Copy of the bridge status, refreshed after every send. Readers never
/// wait on the bridge itself.
#[derive(Clone)]
pub struct BridgeStatusHandle(Arc<Mutex<BridgeStatus>>);

impl BridgeStatusHandle {
    pub fn snapshot(&self) -> BridgeStatus {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn store(&self, status: BridgeStatus) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }
}

pub struct VirtualBridge {
    camera: Option<Box<dyn VirtualCameraSink>>,
    width: u32,
    height: u32,
    fps: u32,
    audio: AudioBridge,
    frames_sent: u64,
    frames_failed: u64,
    published: BridgeStatusHandle,
}

impl VirtualBridge {
    pub fn new(
        config: &BridgeConfig,
        camera: Option<Box<dyn VirtualCameraSink>>,
        audio_output: Option<Arc<dyn AudioOutputFactory>>,
    ) -> Self {
        let bridge = Self {
            camera,
            width: config.camera_width,
            height: config.camera_height,
            fps: config.camera_fps,
            audio: AudioBridge::new(audio_output, config.audio_channels, config.jitter_seconds),
            frames_sent: 0,
            frames_failed: 0,
            published: BridgeStatusHandle(Arc::new(Mutex::new(BridgeStatus::default()))),
        };
        bridge.publish();
        bridge
    }

    /// Open whatever sinks the host offers for `config`.
    pub fn from_config(config: &BridgeConfig) -> Self {
        let camera: Option<Box<dyn VirtualCameraSink>> = match &config.loopback_device {
            Some(path) => match LoopbackSink::open(path) {
                Ok(sink) => Some(Box::new(sink)),
                Err(e) => {
                    log::warn!("Virtual camera unavailable: {}", e);
                    None
                }
            },
            None => {
                log::info!("No loopback device configured; virtual camera disabled");
                None
            }
        };
        let audio = discover_output(config.audio_device.as_deref());
        let bridge = Self::new(config, camera, audio);
        log::info!(
            "Virtual camera: {}, virtual audio: {}",
            if bridge.camera.is_some() { "available" } else { "not available" },
            if bridge.audio.is_available() { "available" } else { "not available" }
        );
        bridge
    }

    /// Normalize and forward one frame of unknown channel order. Returns
    /// false when there is no camera sink or the frame could not be
    /// delivered.
    pub fn send_video_frame(&mut self, frame: RawFrame) -> bool {
        if self.camera.is_none() {
            return false;
        }
        match normalize_frame(frame, self.width, self.height) {
            Ok(bgr) => self.send_bgr_frame(&bgr),
            Err(e) => {
                log::debug!("Virtual camera frame rejected: {}", e);
                self.frames_failed += 1;
                self.publish();
                false
            }
        }
    }

    /// Forward a frame already normalized to [`Self::frame_size`].
    pub fn send_bgr_frame(&mut self, bgr: &RawFrame) -> bool {
        let Some(camera) = self.camera.as_mut() else {
            return false;
        };
        let sent = match camera.send(bgr) {
            Ok(()) => {
                self.frames_sent += 1;
                true
            }
            Err(e) => {
                log::debug!("Virtual camera send error: {}", e);
                self.frames_failed += 1;
                false
            }
        };
        self.publish();
        sent
    }

    /// Size the camera sink expects.
    pub fn frame_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn send_audio(&mut self, samples: &[f32], sample_rate: u32) -> bool {
        let sent = self.audio.send_audio(samples, sample_rate);
        self.publish();
        sent
    }

    /// Status readable while the bridge is busy.
    pub fn status_handle(&self) -> BridgeStatusHandle {
        self.published.clone()
    }

    fn publish(&self) {
        self.published.store(self.status());
    }

    pub fn status(&self) -> BridgeStatus {
        BridgeStatus {
            camera_available: self.camera.is_some(),
            camera_device: self.camera.as_ref().map(|c| c.name().to_string()),
            width: self.width,
            height: self.height,
            fps: self.fps,
            audio_available: self.audio.is_available(),
            audio_device: self.audio.device_name().map(str::to_string),
            audio_active: self.audio.is_active(),
            sample_rate: self.audio.current_rate(),
            buffered_audio_secs: self.audio.jitter().buffered_secs(),
            frames_sent: self.frames_sent,
            frames_failed: self.frames_failed,
            audio_reopens: self.audio.reopens(),
        }
    }

    pub fn close(&mut self) {
        if let Some(mut camera) = self.camera.take() {
            if let Err(e) = camera.close() {
                log::debug!("Error stopping virtual camera: {}", e);
            }
            log::info!("Virtual camera stopped");
        }
        self.audio.close();
        self.publish();
    }
}

impl Drop for VirtualBridge {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{RelayError, RelayResult};
    use std::sync::Mutex;

    struct RecordingSink {
        frames: Arc<Mutex<Vec<RawFrame>>>,
        fail: bool,
    }

    impl VirtualCameraSink for RecordingSink {
        fn name(&self) -> &str {
            "recording"
        }

        fn send(&mut self, frame: &RawFrame) -> RelayResult<()> {
            if self.fail {
                return Err(RelayError::SinkUnavailable("driver gone".into()));
            }
            self.frames.lock().unwrap().push(frame.clone());
            Ok(())
        }

        fn close(&mut self) -> RelayResult<()> {
            Ok(())
        }
    }

    fn config() -> BridgeConfig {
        BridgeConfig {
            camera_width: 4,
            camera_height: 2,
            ..BridgeConfig::default()
        }
    }

    #[test]
    fn test_no_sinks_is_soft() {
        let mut bridge = VirtualBridge::new(&config(), None, None);
        let frame = RawFrame::new(1, 1, 3, vec![0, 0, 0]).unwrap();
        assert!(!bridge.send_video_frame(frame));
        assert!(!bridge.send_audio(&[0.0], 16_000));
        let status = bridge.status();
        assert!(!status.camera_available);
        assert!(!status.audio_available);
    }

    #[test]
    fn test_frames_are_normalized_before_sink() {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let sink = RecordingSink {
            frames: frames.clone(),
            fail: false,
        };
        let mut bridge = VirtualBridge::new(&config(), Some(Box::new(sink)), None);
        let gray = RawFrame::new(2, 1, 1, vec![7, 7]).unwrap();
        assert!(bridge.send_video_frame(gray));

        let sent = frames.lock().unwrap();
        assert_eq!((sent[0].width, sent[0].height, sent[0].channels), (4, 2, 3));
        assert_eq!(bridge.status().frames_sent, 1);
    }

    #[test]
    fn test_sink_failure_returns_false() {
        let sink = RecordingSink {
            frames: Arc::new(Mutex::new(Vec::new())),
            fail: true,
        };
        let mut bridge = VirtualBridge::new(&config(), Some(Box::new(sink)), None);
        let frame = RawFrame::new(4, 2, 3, vec![0; 24]).unwrap();
        assert!(!bridge.send_video_frame(frame));
        assert_eq!(bridge.status().frames_failed, 1);
    }

    #[test]
    fn test_status_handle_does_not_wait_on_bridge() {
        let sink = RecordingSink {
            frames: Arc::new(Mutex::new(Vec::new())),
            fail: false,
        };
        let bridge = Arc::new(Mutex::new(VirtualBridge::new(&config(), Some(Box::new(sink)), None)));
        let handle = bridge.lock().unwrap().status_handle();

        let mut guard = bridge.lock().unwrap();
        let frame = RawFrame::new(4, 2, 3, vec![0; 24]).unwrap();
        assert!(guard.send_bgr_frame(&frame));

        // Read from another thread while the bridge stays locked.
        let reader = std::thread::spawn(move || handle.snapshot());
        let status = reader.join().unwrap();
        assert!(status.camera_available);
        assert_eq!(status.frames_sent, 1);
        drop(guard);
    }

    #[test]
    fn test_status_handle_tracks_close() {
        let sink = RecordingSink {
            frames: Arc::new(Mutex::new(Vec::new())),
            fail: false,
        };
        let mut bridge = VirtualBridge::new(&config(), Some(Box::new(sink)), None);
        let handle = bridge.status_handle();
        assert!(handle.snapshot().camera_available);
        bridge.close();
        assert!(!handle.snapshot().camera_available);
    }
}
