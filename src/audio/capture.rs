//! Microphone capture

use std::sync::{Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use crossbeam_channel::{Receiver, Sender};

use super::STREAM_READY_TIMEOUT;
use crate::errors::{RelayError, RelayResult};

/// Callback chunks held before the oldest are dropped.
const MAX_BUFFER_CHUNKS: usize = 256;

/// Default input device, captured as interleaved f32 chunks.
pub struct MicCapture {
    receiver: Receiver<Vec<f32>>,
    stop: Sender<()>,
    host: Mutex<Option<JoinHandle<()>>>,
    sample_rate: u32,
    channels: u16,
}

impl MicCapture {
    /// Build and start the input stream.
    ///
    /// The requested rate is used when it is 44.1 or 48 kHz; anything else
    /// falls back to the device default.
    pub fn open(sample_rate: u32, channels: u16) -> RelayResult<Self> {
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<RelayResult<(u32, u16)>>(1);
        let (data_tx, data_rx) = crossbeam_channel::bounded(MAX_BUFFER_CHUNKS);
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);

        let host = std::thread::Builder::new()
            .name("nodeflow-mic-host".into())
            .spawn(move || {
                let (stream, actual) = match build_input_stream(sample_rate, channels, data_tx) {
                    Ok(built) => built,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(RelayError::DeviceStart(format!(
                        "Failed to start microphone stream: {}",
                        e
                    ))));
                    return;
                }
                let _ = ready_tx.send(Ok(actual));
                // Blocks until close() or the owner is dropped.
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| RelayError::DeviceStart(format!("Failed to spawn audio host: {}", e)))?;

        let (actual_rate, actual_channels) = ready_rx
            .recv_timeout(STREAM_READY_TIMEOUT)
            .map_err(|_| RelayError::DeviceStart("Microphone did not start in time".into()))??;

        log::info!(
            "Microphone capturing at {} Hz, {} channel(s)",
            actual_rate,
            actual_channels
        );

        Ok(Self {
            receiver: data_rx,
            stop: stop_tx,
            host: Mutex::new(Some(host)),
            sample_rate: actual_rate,
            channels: actual_channels,
        })
    }

    /// Next captured chunk, waiting at most `timeout`.
    pub fn read(&self, timeout: Duration) -> Option<Vec<f32>> {
        self.receiver.recv_timeout(timeout).ok()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Stop the stream and join the host thread. Idempotent.
    pub fn close(&self) -> RelayResult<()> {
        let _ = self.stop.try_send(());
        let handle = self
            .host
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| RelayError::DeviceStop("microphone host thread panicked".into()))?;
        }
        Ok(())
    }
}

impl Drop for MicCapture {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn build_input_stream(
    sample_rate: u32,
    channels: u16,
    sender: Sender<Vec<f32>>,
) -> RelayResult<(cpal::Stream, (u32, u16))> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| RelayError::DeviceStart("No default audio input device".into()))?;

    let supported = device
        .default_input_config()
        .map_err(|e| RelayError::DeviceStart(format!("No supported input config: {}", e)))?;

    let actual_rate = if sample_rate == 48_000 || sample_rate == 44_100 {
        sample_rate
    } else {
        supported.sample_rate().0
    };
    let actual_channels = if channels == 1 || channels == 2 {
        channels
    } else {
        supported.channels()
    };

    let config = StreamConfig {
        channels: actual_channels,
        sample_rate: cpal::SampleRate(actual_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                // Never block the audio callback; a full channel drops the chunk.
                let _ = sender.try_send(data.to_vec());
            },
            move |err| {
                log::error!("Microphone stream error: {}", err);
            },
            None,
        )
        .map_err(|e| RelayError::DeviceStart(format!("Failed to build input stream: {}", e)))?;

    Ok((stream, (actual_rate, actual_channels)))
}
