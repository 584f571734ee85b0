//! Real hardware driver
//!
//! Webcam capture goes through nokhwa (`webcam` feature); microphone and
//! speaker go through cpal (`audio` feature). A build without a feature
//! still links, and opening the missing device type fails with a
//! start error.

use super::{DeviceDriver, DeviceResource, DeviceType, StreamSettings};
use crate::errors::{RelayError, RelayResult};

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDriver;

impl SystemDriver {
    pub fn new() -> Self {
        Self
    }
}

impl DeviceDriver for SystemDriver {
    fn name(&self) -> &str {
        "system"
    }

    fn open(&self, device: DeviceType, settings: &StreamSettings) -> RelayResult<Box<dyn DeviceResource>> {
        match device {
            DeviceType::Webcam => open_webcam(settings),
            DeviceType::Microphone => open_microphone(settings),
            DeviceType::Speaker => open_speaker(settings),
        }
    }
}

#[cfg(feature = "webcam")]
fn open_webcam(settings: &StreamSettings) -> RelayResult<Box<dyn DeviceResource>> {
    Ok(Box::new(webcam::WebcamResource::open(settings)?))
}

#[cfg(not(feature = "webcam"))]
fn open_webcam(_settings: &StreamSettings) -> RelayResult<Box<dyn DeviceResource>> {
    Err(RelayError::DeviceStart(
        "webcam: built without webcam support".into(),
    ))
}

#[cfg(feature = "audio")]
fn open_microphone(settings: &StreamSettings) -> RelayResult<Box<dyn DeviceResource>> {
    Ok(Box::new(audio::MicrophoneResource::open(settings)?))
}

#[cfg(not(feature = "audio"))]
fn open_microphone(_settings: &StreamSettings) -> RelayResult<Box<dyn DeviceResource>> {
    Err(RelayError::DeviceStart(
        "microphone: built without audio support".into(),
    ))
}

#[cfg(feature = "audio")]
fn open_speaker(settings: &StreamSettings) -> RelayResult<Box<dyn DeviceResource>> {
    Ok(Box::new(audio::SpeakerResource::open(settings)?))
}

#[cfg(not(feature = "audio"))]
fn open_speaker(_settings: &StreamSettings) -> RelayResult<Box<dyn DeviceResource>> {
    Err(RelayError::DeviceStart(
        "speaker: built without audio support".into(),
    ))
}

#[cfg(feature = "audio")]
mod audio {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::audio::{MicCapture, SpeakerOutput};
    use crate::buffer::BoundedBuffer;
    use crate::device::{DeviceResource, StreamSettings};
    use crate::errors::{RelayError, RelayResult};
    use crate::media::{resample_linear, MediaFrame};

    const READ_TIMEOUT: Duration = Duration::from_millis(200);

    pub(super) struct MicrophoneResource {
        capture: MicCapture,
    }

    impl MicrophoneResource {
        pub(super) fn open(settings: &StreamSettings) -> RelayResult<Self> {
            Ok(Self {
                capture: MicCapture::open(settings.sample_rate, settings.channels)?,
            })
        }
    }

    impl DeviceResource for MicrophoneResource {
        fn pump(&self, buffer: &BoundedBuffer<MediaFrame>) -> RelayResult<()> {
            if let Some(samples) = self.capture.read(READ_TIMEOUT) {
                buffer.push(MediaFrame::Audio {
                    samples,
                    sample_rate: self.capture.sample_rate(),
                    channels: self.capture.channels(),
                });
            }
            Ok(())
        }

        fn release(&self) -> RelayResult<()> {
            self.capture.close()
        }
    }

    pub(super) struct SpeakerResource {
        output: SpeakerOutput,
        samples: Arc<BoundedBuffer<f32>>,
    }

    impl SpeakerResource {
        pub(super) fn open(settings: &StreamSettings) -> RelayResult<Self> {
            // Two seconds of headroom between the worker and the callback.
            let capacity = settings.sample_rate as usize * settings.channels.max(1) as usize * 2;
            let samples = Arc::new(BoundedBuffer::new(capacity));
            let output = SpeakerOutput::open(None, settings.sample_rate, settings.channels, samples.clone())
                .map_err(|e| RelayError::DeviceStart(format!("speaker: {}", e)))?;
            Ok(Self { output, samples })
        }
    }

    impl DeviceResource for SpeakerResource {
        fn pump(&self, buffer: &BoundedBuffer<MediaFrame>) -> RelayResult<()> {
            if let Some(MediaFrame::Audio {
                samples,
                sample_rate,
                channels,
            }) = buffer.pop(READ_TIMEOUT)
            {
                if channels != self.output.channels() {
                    log::debug!(
                        "Dropping {}-channel chunk for {}-channel speaker",
                        channels,
                        self.output.channels()
                    );
                    return Ok(());
                }
                self.samples.push_many(resample_linear(
                    &samples,
                    sample_rate,
                    self.output.sample_rate(),
                    channels,
                ));
            }
            Ok(())
        }

        fn release(&self) -> RelayResult<()> {
            self.samples.close();
            self.output.close()
        }
    }
}

#[cfg(feature = "webcam")]
mod webcam {
    use std::sync::{Mutex, PoisonError};
    use std::thread::JoinHandle;
    use std::time::{Duration, Instant};

    use bytes::Bytes;
    use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
    use nokhwa::pixel_format::RgbFormat;
    use nokhwa::utils::{
        CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType, Resolution,
    };
    use nokhwa::Camera;

    use crate::buffer::BoundedBuffer;
    use crate::device::{DeviceResource, StreamSettings};
    use crate::errors::{RelayError, RelayResult};
    use crate::media::{encode_jpeg, MediaFrame, RawFrame};

    const FRAME_CHANNEL_DEPTH: usize = 4;
    const HOST_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

    /// Camera owned by a host thread; frames arrive already JPEG-encoded.
    pub(super) struct WebcamResource {
        frames: Receiver<MediaFrame>,
        stop: Sender<()>,
        host: Mutex<Option<JoinHandle<()>>>,
    }

    impl WebcamResource {
        pub(super) fn open(settings: &StreamSettings) -> RelayResult<Self> {
            let (ready_tx, ready_rx) = crossbeam_channel::bounded::<RelayResult<()>>(1);
            let (frame_tx, frame_rx) = crossbeam_channel::bounded(FRAME_CHANNEL_DEPTH);
            let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
            let settings = settings.clone();

            let host = std::thread::Builder::new()
                .name("nodeflow-webcam-host".into())
                .spawn(move || {
                    let mut camera = match open_camera(&settings) {
                        Ok(camera) => camera,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    let _ = ready_tx.send(Ok(()));
                    capture_loop(&mut camera, &frame_tx, &stop_rx);
                    if let Err(e) = camera.stop_stream() {
                        log::warn!("Failed to stop webcam stream: {}", e);
                    }
                })
                .map_err(|e| RelayError::DeviceStart(format!("Failed to spawn webcam host: {}", e)))?;

            ready_rx
                .recv_timeout(Duration::from_secs(10))
                .map_err(|_| RelayError::DeviceStart("webcam did not open in time".into()))??;

            Ok(Self {
                frames: frame_rx,
                stop: stop_tx,
                host: Mutex::new(Some(host)),
            })
        }
    }

    fn open_camera(settings: &StreamSettings) -> RelayResult<Camera> {
        let format = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(CameraFormat::new(
            Resolution::new(settings.video_width, settings.video_height),
            FrameFormat::MJPEG,
            settings.video_fps,
        )));
        let mut camera = Camera::new(CameraIndex::Index(settings.webcam_index), format)
            .map_err(|e| RelayError::DeviceStart(format!("Failed to access webcam: {}", e)))?;
        camera
            .open_stream()
            .map_err(|e| RelayError::DeviceStart(format!("Failed to start webcam stream: {}", e)))?;
        log::info!(
            "Webcam {} opened at {}x{}",
            settings.webcam_index,
            camera.resolution().width_x,
            camera.resolution().height_y
        );
        Ok(camera)
    }

    fn capture_loop(camera: &mut Camera, frames: &Sender<MediaFrame>, stop: &Receiver<()>) {
        loop {
            match stop.try_recv() {
                Err(TryRecvError::Empty) => {}
                _ => return,
            }
            let buffer = match camera.frame() {
                Ok(buffer) => buffer,
                Err(e) => {
                    log::warn!("Webcam frame error: {}", e);
                    std::thread::sleep(Duration::from_millis(50));
                    continue;
                }
            };
            let raw = buffer.buffer_bytes().to_vec();
            let width = buffer.resolution().width_x;
            let height = buffer.resolution().height_y;

            match to_media_frame(raw, width, height) {
                // A full channel means the worker is behind; the frame is stale anyway.
                Ok(frame) => {
                    let _ = frames.try_send(frame);
                }
                Err(e) => log::debug!("Skipping webcam frame: {}", e),
            }
        }
    }

    /// MJPEG passes through untouched; raw RGB is encoded.
    fn to_media_frame(raw: Vec<u8>, width: u32, height: u32) -> RelayResult<MediaFrame> {
        let is_jpeg = raw.len() >= 3 && raw[0] == 0xFF && raw[1] == 0xD8 && raw[2] == 0xFF;
        let data = if is_jpeg {
            Bytes::from(raw)
        } else {
            encode_jpeg(&RawFrame::new(width, height, 3, raw)?)?
        };
        Ok(MediaFrame::Video {
            data,
            width,
            height,
        })
    }

    impl DeviceResource for WebcamResource {
        fn pump(&self, buffer: &BoundedBuffer<MediaFrame>) -> RelayResult<()> {
            match self.frames.recv_timeout(Duration::from_millis(200)) {
                Ok(frame) => {
                    buffer.push(frame);
                    Ok(())
                }
                Err(RecvTimeoutError::Timeout) => Ok(()),
                Err(RecvTimeoutError::Disconnected) => {
                    Err(RelayError::DeviceStart("webcam host thread exited".into()))
                }
            }
        }

        fn release(&self) -> RelayResult<()> {
            let _ = self.stop.try_send(());
            let handle = self
                .host
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            let Some(handle) = handle else {
                return Ok(());
            };
            let start = Instant::now();
            while !handle.is_finished() {
                if start.elapsed() >= HOST_JOIN_TIMEOUT {
                    return Err(RelayError::DeviceStop(
                        "webcam host thread did not exit in time".into(),
                    ));
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            handle
                .join()
                .map_err(|_| RelayError::DeviceStop("webcam host thread panicked".into()))
        }
    }
}
