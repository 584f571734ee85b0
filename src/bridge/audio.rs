//! Audio routing to a virtual cable
//!
//! Relayed audio is appended to a jitter ring that the output callback
//! drains at playback cadence. The output stream runs at the sender's
//! sample rate; when that rate changes the stream is rebuilt and the ring
//! cleared before the new samples go in.

use std::sync::Arc;

use crate::buffer::BoundedBuffer;
use crate::errors::RelayResult;

/// Sample ring sized to a maximum buffered duration.
pub struct JitterBuffer {
    ring: Arc<BoundedBuffer<f32>>,
    sample_rate: u32,
    channels: u16,
}

impl JitterBuffer {
    pub fn new(sample_rate: u32, channels: u16, max_seconds: f64) -> Self {
        let per_second = sample_rate as f64 * channels.max(1) as f64;
        let capacity = (per_second * max_seconds.max(0.0)).round() as usize;
        Self {
            ring: Arc::new(BoundedBuffer::new(capacity)),
            sample_rate,
            channels: channels.max(1),
        }
    }

    /// Oldest samples are discarded once the ring holds `max_seconds`.
    pub fn push(&self, samples: &[f32]) {
        self.ring.push_many(samples.iter().copied());
    }

    /// Fill `out` from the ring, padding with silence. Returns how many
    /// real samples were written.
    pub fn fill(&self, out: &mut [f32]) -> usize {
        let mut scratch = Vec::with_capacity(out.len());
        let n = self.ring.pop_into(&mut scratch, out.len());
        out[..n].copy_from_slice(&scratch);
        out[n..].fill(0.0);
        n
    }

    pub fn clear(&self) {
        self.ring.clear();
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Buffered audio, in seconds.
    pub fn buffered_secs(&self) -> f64 {
        self.len() as f64 / (self.sample_rate.max(1) as f64 * self.channels as f64)
    }

    /// Handle for an output callback.
    pub fn ring(&self) -> Arc<BoundedBuffer<f32>> {
        self.ring.clone()
    }
}

/// A running output stream draining a jitter ring.
pub trait AudioOutput: Send {
    fn sample_rate(&self) -> u32;

    fn close(&mut self) -> RelayResult<()>;
}

/// Opens output streams on one device.
pub trait AudioOutputFactory: Send + Sync {
    fn device_name(&self) -> &str;

    fn open(
        &self,
        sample_rate: u32,
        channels: u16,
        source: Arc<BoundedBuffer<f32>>,
    ) -> RelayResult<Box<dyn AudioOutput>>;
}

/// Renegotiating front end to an [`AudioOutputFactory`].
pub struct AudioBridge {
    factory: Option<Arc<dyn AudioOutputFactory>>,
    output: Option<Box<dyn AudioOutput>>,
    jitter: JitterBuffer,
    channels: u16,
    max_seconds: f64,
    failed_rate: Option<u32>,
    reopens: u64,
}

impl AudioBridge {
    pub fn new(factory: Option<Arc<dyn AudioOutputFactory>>, channels: u16, max_seconds: f64) -> Self {
        Self {
            factory,
            output: None,
            jitter: JitterBuffer::new(crate::media::DEFAULT_WIRE_SAMPLE_RATE, channels, max_seconds),
            channels: channels.max(1),
            max_seconds,
            failed_rate: None,
            reopens: 0,
        }
    }

    pub fn is_available(&self) -> bool {
        self.factory.is_some()
    }

    pub fn is_active(&self) -> bool {
        self.output.is_some()
    }

    pub fn device_name(&self) -> Option<&str> {
        self.factory.as_ref().map(|f| f.device_name())
    }

    /// Rate of the open stream, if any.
    pub fn current_rate(&self) -> Option<u32> {
        self.output.as_ref().map(|o| o.sample_rate())
    }

    /// Streams opened so far, including the first.
    pub fn reopens(&self) -> u64 {
        self.reopens
    }

    pub fn jitter(&self) -> &JitterBuffer {
        &self.jitter
    }

    /// Queue samples recorded at `sample_rate`. Returns false, without
    /// error, when there is no sink or the stream cannot be opened.
    pub fn send_audio(&mut self, samples: &[f32], sample_rate: u32) -> bool {
        let Some(factory) = self.factory.clone() else {
            return false;
        };
        if sample_rate == 0 {
            return false;
        }

        if self.current_rate() != Some(sample_rate) {
            if self.failed_rate == Some(sample_rate) {
                return false;
            }
            if let Some(previous) = self.current_rate() {
                log::info!("Sample rate change: {}Hz -> {}Hz", previous, sample_rate);
            }
            self.close_output();

            let jitter = JitterBuffer::new(sample_rate, self.channels, self.max_seconds);
            match factory.open(sample_rate, self.channels, jitter.ring()) {
                Ok(output) => {
                    self.output = Some(output);
                    self.jitter = jitter;
                    self.failed_rate = None;
                    self.reopens += 1;
                }
                Err(e) => {
                    log::warn!(
                        "Failed to open audio output on '{}' at {}Hz: {}",
                        factory.device_name(),
                        sample_rate,
                        e
                    );
                    self.failed_rate = Some(sample_rate);
                    return false;
                }
            }
        }

        self.jitter.push(samples);
        true
    }

    fn close_output(&mut self) {
        if let Some(mut output) = self.output.take() {
            if let Err(e) = output.close() {
                log::warn!("Error closing audio output: {}", e);
            }
        }
        self.jitter.clear();
    }

    pub fn close(&mut self) {
        self.close_output();
    }
}

impl Drop for AudioBridge {
    fn drop(&mut self) {
        self.close_output();
    }
}

#[cfg(feature = "audio")]
mod system {
    use super::{AudioOutput, AudioOutputFactory};
    use crate::audio::SpeakerOutput;
    use crate::buffer::BoundedBuffer;
    use crate::errors::RelayResult;
    use std::sync::Arc;

    impl AudioOutput for SpeakerOutput {
        fn sample_rate(&self) -> u32 {
            SpeakerOutput::sample_rate(self)
        }

        fn close(&mut self) -> RelayResult<()> {
            SpeakerOutput::close(self)
        }
    }

    /// cpal output device selected by exact name.
    pub struct CpalOutputFactory {
        device_name: String,
    }

    impl CpalOutputFactory {
        pub fn new(device_name: impl Into<String>) -> Self {
            Self {
                device_name: device_name.into(),
            }
        }
    }

    impl AudioOutputFactory for CpalOutputFactory {
        fn device_name(&self) -> &str {
            &self.device_name
        }

        fn open(
            &self,
            sample_rate: u32,
            channels: u16,
            source: Arc<BoundedBuffer<f32>>,
        ) -> RelayResult<Box<dyn AudioOutput>> {
            let output = SpeakerOutput::open(Some(&self.device_name), sample_rate, channels, source)?;
            Ok(Box::new(output))
        }
    }
}

#[cfg(feature = "audio")]
pub use system::CpalOutputFactory;

/// Output factory for the configured device, or for the first virtual
/// cable found among the host's outputs.
#[cfg(feature = "audio")]
pub fn discover_output(device_override: Option<&str>) -> Option<Arc<dyn AudioOutputFactory>> {
    use crate::audio::{list_audio_devices, AudioDirection};

    if let Some(name) = device_override {
        log::info!("Routing audio to configured device: {}", name);
        return Some(Arc::new(CpalOutputFactory::new(name)));
    }

    let devices = match list_audio_devices(AudioDirection::Output) {
        Ok(devices) => devices,
        Err(e) => {
            log::warn!("Cannot enumerate audio outputs: {}", e);
            return None;
        }
    };
    match super::sink::find_virtual_cable(devices.iter().map(|d| d.name.as_str())) {
        Some(name) => {
            log::info!("Virtual audio device detected: {}", name);
            Some(Arc::new(CpalOutputFactory::new(name)))
        }
        None => {
            log::warn!("No virtual audio device detected; audio will not be routed");
            None
        }
    }
}

#[cfg(not(feature = "audio"))]
pub fn discover_output(_device_override: Option<&str>) -> Option<Arc<dyn AudioOutputFactory>> {
    log::warn!("Built without audio support; audio will not be routed");
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::RelayError;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockFactory {
        opened: Mutex<Vec<u32>>,
        fail_rate: Option<u32>,
    }

    struct MockOutput {
        rate: u32,
    }

    impl AudioOutput for MockOutput {
        fn sample_rate(&self) -> u32 {
            self.rate
        }

        fn close(&mut self) -> RelayResult<()> {
            Ok(())
        }
    }

    impl AudioOutputFactory for MockFactory {
        fn device_name(&self) -> &str {
            "mock cable"
        }

        fn open(
            &self,
            sample_rate: u32,
            _channels: u16,
            _source: Arc<BoundedBuffer<f32>>,
        ) -> RelayResult<Box<dyn AudioOutput>> {
            if self.fail_rate == Some(sample_rate) {
                return Err(RelayError::SinkUnavailable("unsupported rate".into()));
            }
            self.opened.lock().unwrap().push(sample_rate);
            Ok(Box::new(MockOutput { rate: sample_rate }))
        }
    }

    #[test]
    fn test_jitter_fill_pads_silence() {
        let jitter = JitterBuffer::new(10, 1, 1.0);
        jitter.push(&[0.5, 0.25]);
        let mut out = [1.0f32; 4];
        assert_eq!(jitter.fill(&mut out), 2);
        assert_eq!(out, [0.5, 0.25, 0.0, 0.0]);
    }

    #[test]
    fn test_jitter_bounded_to_duration() {
        let jitter = JitterBuffer::new(100, 2, 0.5);
        assert_eq!(jitter.capacity(), 100);
        jitter.push(&vec![0.1; 250]);
        assert_eq!(jitter.len(), 100);
        assert!((jitter.buffered_secs() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_no_factory_is_soft_failure() {
        let mut bridge = AudioBridge::new(None, 1, 10.0);
        assert!(!bridge.send_audio(&[0.0; 4], 16_000));
        assert!(!bridge.is_available());
    }

    #[test]
    fn test_rate_change_reopens_and_clears() {
        let factory = Arc::new(MockFactory::default());
        let mut bridge = AudioBridge::new(Some(factory.clone()), 1, 10.0);

        assert!(bridge.send_audio(&[0.1; 160], 16_000));
        assert!(bridge.send_audio(&[0.1; 160], 16_000));
        assert_eq!(bridge.jitter().len(), 320);

        assert!(bridge.send_audio(&[0.2; 480], 48_000));
        assert_eq!(*factory.opened.lock().unwrap(), vec![16_000, 48_000]);
        assert_eq!(bridge.current_rate(), Some(48_000));
        // Only the post-switch samples remain.
        assert_eq!(bridge.jitter().len(), 480);
        assert_eq!(bridge.jitter().sample_rate(), 48_000);
        assert_eq!(bridge.reopens(), 2);
    }

    #[test]
    fn test_open_failure_not_retried_at_same_rate() {
        let factory = Arc::new(MockFactory {
            fail_rate: Some(22_050),
            ..MockFactory::default()
        });
        let mut bridge = AudioBridge::new(Some(factory.clone()), 1, 10.0);
        assert!(!bridge.send_audio(&[0.0; 10], 22_050));
        assert!(!bridge.send_audio(&[0.0; 10], 22_050));
        assert!(!bridge.is_active());
        assert!(bridge.send_audio(&[0.0; 10], 16_000));
        assert!(bridge.is_active());
    }
}
