//! Output stream playback

use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::StreamConfig;
use crossbeam_channel::Sender;

use super::device::find_output_device;
use super::STREAM_READY_TIMEOUT;
use crate::buffer::BoundedBuffer;
use crate::errors::{RelayError, RelayResult};

/// An output stream that plays whatever lands in its sample buffer.
///
/// The callback pulls interleaved samples from `source` and pads with
/// silence when it runs dry, so underruns are heard as gaps, never as
/// stalls.
pub struct SpeakerOutput {
    device_name: String,
    stop: Sender<()>,
    host: Mutex<Option<JoinHandle<()>>>,
    sample_rate: u32,
    channels: u16,
}

impl SpeakerOutput {
    /// Open `device` (default output when `None`) at a fixed format.
    pub fn open(
        device: Option<&str>,
        sample_rate: u32,
        channels: u16,
        source: Arc<BoundedBuffer<f32>>,
    ) -> RelayResult<Self> {
        let wanted = device.map(str::to_owned);
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<RelayResult<String>>(1);
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);

        let host = std::thread::Builder::new()
            .name("nodeflow-playback-host".into())
            .spawn(move || {
                let built = find_output_device(wanted.as_deref()).and_then(|device| {
                    let name = device.name().unwrap_or_else(|_| "unknown".into());
                    build_output_stream(&device, sample_rate, channels, source).map(|s| (s, name))
                });
                let (stream, name) = match built {
                    Ok(built) => built,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(RelayError::SinkUnavailable(format!(
                        "Failed to start output stream: {}",
                        e
                    ))));
                    return;
                }
                let _ = ready_tx.send(Ok(name));
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| RelayError::SinkUnavailable(format!("Failed to spawn audio host: {}", e)))?;

        let device_name = ready_rx
            .recv_timeout(STREAM_READY_TIMEOUT)
            .map_err(|_| RelayError::SinkUnavailable("Audio output did not start in time".into()))??;

        log::info!(
            "Playing to '{}' at {} Hz, {} channel(s)",
            device_name,
            sample_rate,
            channels
        );

        Ok(Self {
            device_name,
            stop: stop_tx,
            host: Mutex::new(Some(host)),
            sample_rate,
            channels,
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Stop the stream and join its host thread. Idempotent.
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
                .map_err(|_| RelayError::DeviceStop("playback host thread panicked".into()))?;
        }
        Ok(())
    }
}

impl Drop for SpeakerOutput {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn build_output_stream(
    device: &cpal::Device,
    sample_rate: u32,
    channels: u16,
    source: Arc<BoundedBuffer<f32>>,
) -> RelayResult<cpal::Stream> {
    let config = StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let mut scratch: Vec<f32> = Vec::new();
    device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                scratch.clear();
                let n = source.pop_into(&mut scratch, data.len());
                data[..n].copy_from_slice(&scratch[..n]);
                data[n..].fill(0.0);
            },
            move |err| {
                log::error!("Audio output stream error: {}", err);
            },
            None,
        )
        .map_err(|e| RelayError::SinkUnavailable(format!("Failed to build output stream: {}", e)))
}
