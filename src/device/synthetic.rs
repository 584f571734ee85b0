//! Hardware-free device driver
//!
//! Produces a moving gradient for the webcam and a 440 Hz tone for the
//! microphone, and swallows speaker output. Used by `serve --synthetic`,
//! by tests, and on hosts without capture devices. Open, pump and release
//! failures can be injected per device.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{DeviceDriver, DeviceResource, DeviceType, StreamSettings};
use crate::buffer::BoundedBuffer;
use crate::errors::{RelayError, RelayResult};
use crate::media::{encode_jpeg, MediaFrame, RawFrame};

/// Gradient RGB frame that shifts with every frame number.
pub fn synthetic_video_frame(frame_number: u64, width: u32, height: u32) -> RawFrame {
    let mut data = vec![0u8; width as usize * height as usize * 3];
    let base = (frame_number % 256) as u8;
    for y in 0..height {
        for x in 0..width {
            let idx = (y as usize * width as usize + x as usize) * 3;
            data[idx] = base.wrapping_add((x % 256) as u8);
            data[idx + 1] = base.wrapping_add((y % 256) as u8);
            data[idx + 2] = base.wrapping_add(((x + y) % 256) as u8);
        }
    }
    RawFrame {
        width,
        height,
        channels: 3,
        data,
    }
}

/// 440 Hz sine at 0.3 amplitude, phase-continuous across frame numbers.
pub fn synthetic_audio_frame(
    frame_number: u64,
    samples_per_frame: usize,
    sample_rate: u32,
    channels: u16,
) -> MediaFrame {
    let frequency = 440.0;
    let rate = sample_rate.max(1) as f64;
    let ch = channels.max(1) as usize;
    let mut samples = vec![0.0f32; samples_per_frame * ch];

    for i in 0..samples_per_frame {
        let t = (frame_number as f64 * samples_per_frame as f64 + i as f64) / rate;
        let value = (2.0 * std::f64::consts::PI * frequency * t).sin() as f32 * 0.3;
        for c in 0..ch {
            samples[i * ch + c] = value;
        }
    }

    MediaFrame::Audio {
        samples,
        sample_rate,
        channels: ch as u16,
    }
}

#[derive(Default)]
struct Counters {
    opened: [AtomicUsize; 3],
    released: [AtomicUsize; 3],
    played_samples: AtomicU64,
}

#[derive(Default)]
pub struct SyntheticDriver {
    fail_open: HashSet<DeviceType>,
    fail_pump: HashSet<DeviceType>,
    fail_release: HashSet<DeviceType>,
    stuck: HashSet<DeviceType>,
    counters: Arc<Counters>,
}

impl SyntheticDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_open(mut self, device: DeviceType) -> Self {
        self.fail_open.insert(device);
        self
    }

    pub fn failing_pump(mut self, device: DeviceType) -> Self {
        self.fail_pump.insert(device);
        self
    }

    pub fn failing_release(mut self, device: DeviceType) -> Self {
        self.fail_release.insert(device);
        self
    }

    /// The device's pump blocks for seconds and ignores stop requests.
    pub fn stuck(mut self, device: DeviceType) -> Self {
        self.stuck.insert(device);
        self
    }

    pub fn open_count(&self, device: DeviceType) -> usize {
        self.counters.opened[device.index()].load(Ordering::SeqCst)
    }

    pub fn release_count(&self, device: DeviceType) -> usize {
        self.counters.released[device.index()].load(Ordering::SeqCst)
    }

    /// Samples consumed by synthetic speakers since the driver was built.
    pub fn played_samples(&self) -> u64 {
        self.counters.played_samples.load(Ordering::SeqCst)
    }
}

impl DeviceDriver for SyntheticDriver {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn open(&self, device: DeviceType, settings: &StreamSettings) -> RelayResult<Box<dyn DeviceResource>> {
        if self.fail_open.contains(&device) {
            return Err(RelayError::DeviceStart(format!(
                "Failed to access {}: device unavailable",
                device
            )));
        }
        self.counters.opened[device.index()].fetch_add(1, Ordering::SeqCst);
        log::debug!("Opened synthetic {}", device);

        Ok(Box::new(SyntheticResource {
            device,
            settings: settings.clone(),
            frame_number: AtomicU64::new(0),
            released: AtomicBool::new(false),
            fail_pump: self.fail_pump.contains(&device),
            fail_release: self.fail_release.contains(&device),
            stuck: self.stuck.contains(&device),
            counters: self.counters.clone(),
        }))
    }
}

struct SyntheticResource {
    device: DeviceType,
    settings: StreamSettings,
    frame_number: AtomicU64,
    released: AtomicBool,
    fail_pump: bool,
    fail_release: bool,
    stuck: bool,
    counters: Arc<Counters>,
}

impl SyntheticResource {
    fn frame_interval(&self) -> Duration {
        match self.device {
            DeviceType::Webcam => Duration::from_secs_f64(1.0 / self.settings.video_fps.max(1) as f64),
            _ => Duration::from_secs_f64(
                self.settings.chunk_size as f64 / self.settings.sample_rate.max(1) as f64,
            ),
        }
    }
}

impl DeviceResource for SyntheticResource {
    fn pump(&self, buffer: &BoundedBuffer<MediaFrame>) -> RelayResult<()> {
        if self.released.load(Ordering::Acquire) {
            return Err(RelayError::DeviceStop(format!("{} already released", self.device)));
        }
        if self.stuck {
            std::thread::sleep(Duration::from_secs(3));
            return Ok(());
        }
        if self.fail_pump {
            return Err(RelayError::DeviceStart(format!("{} disconnected", self.device)));
        }

        match self.device {
            DeviceType::Webcam => {
                std::thread::sleep(self.frame_interval());
                let n = self.frame_number.fetch_add(1, Ordering::Relaxed);
                let raw = synthetic_video_frame(n, self.settings.video_width, self.settings.video_height);
                buffer.push(MediaFrame::Video {
                    data: encode_jpeg(&raw)?,
                    width: raw.width,
                    height: raw.height,
                });
            }
            DeviceType::Microphone => {
                std::thread::sleep(self.frame_interval());
                let n = self.frame_number.fetch_add(1, Ordering::Relaxed);
                buffer.push(synthetic_audio_frame(
                    n,
                    self.settings.chunk_size,
                    self.settings.sample_rate,
                    self.settings.channels,
                ));
            }
            DeviceType::Speaker => {
                if let Some(MediaFrame::Audio { samples, .. }) = buffer.pop(Duration::from_millis(100)) {
                    self.counters
                        .played_samples
                        .fetch_add(samples.len() as u64, Ordering::SeqCst);
                } else if buffer.is_closed() {
                    std::thread::sleep(Duration::from_millis(5));
                }
            }
        }
        Ok(())
    }

    fn release(&self) -> RelayResult<()> {
        self.released.store(true, Ordering::Release);
        self.counters.released[self.device.index()].fetch_add(1, Ordering::SeqCst);
        if self.fail_release {
            return Err(RelayError::DeviceStop(format!("{} refused to close", self.device)));
        }
        log::debug!("Released synthetic {}", self.device);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_video_frame_correct_size() {
        let frame = synthetic_video_frame(0, 64, 48);
        assert_eq!((frame.width, frame.height, frame.channels), (64, 48, 3));
        assert_eq!(frame.data.len(), 64 * 48 * 3);
    }

    #[test]
    fn test_synthetic_video_frames_differ() {
        let frame0 = synthetic_video_frame(0, 32, 24);
        let frame1 = synthetic_video_frame(1, 32, 24);
        assert_ne!(frame0.data[0], frame1.data[0]);
    }

    #[test]
    fn test_synthetic_audio_has_signal() {
        let frame = synthetic_audio_frame(0, 960, 48_000, 2);
        let MediaFrame::Audio { samples, channels, .. } = frame else {
            panic!("expected audio");
        };
        assert_eq!(channels, 2);
        assert_eq!(samples.len(), 960 * 2);
        let max_level = samples.iter().map(|s| s.abs()).fold(0.0, f32::max);
        assert!(max_level > 0.1, "Audio should have signal, got {}", max_level);
        assert!(max_level < 0.5, "Audio shouldn't clip, got {}", max_level);
    }

    #[test]
    fn test_webcam_pump_emits_jpeg() {
        let driver = SyntheticDriver::new();
        let settings = StreamSettings {
            video_width: 8,
            video_height: 8,
            video_fps: 500,
            ..StreamSettings::default()
        };
        let resource = driver.open(DeviceType::Webcam, &settings).unwrap();
        let buffer = BoundedBuffer::new(2);
        resource.pump(&buffer).unwrap();
        match buffer.try_pop() {
            Some(MediaFrame::Video { data, .. }) => {
                assert_eq!(&data[..2], &[0xFF, 0xD8]);
            }
            other => panic!("expected video frame, got {:?}", other),
        }
    }

    #[test]
    fn test_speaker_counts_played_samples() {
        let driver = SyntheticDriver::new();
        let resource = driver
            .open(DeviceType::Speaker, &StreamSettings::default())
            .unwrap();
        let buffer = BoundedBuffer::new(2);
        buffer.push(synthetic_audio_frame(0, 100, 16_000, 1));
        resource.pump(&buffer).unwrap();
        assert_eq!(driver.played_samples(), 100);
    }

    #[test]
    fn test_injected_open_failure() {
        let driver = SyntheticDriver::new().failing_open(DeviceType::Microphone);
        assert!(driver
            .open(DeviceType::Microphone, &StreamSettings::default())
            .is_err());
        assert_eq!(driver.open_count(DeviceType::Microphone), 0);
    }
}
