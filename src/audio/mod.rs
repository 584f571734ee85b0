//! Host audio through cpal
//!
//! Submodules:
//! - `device`: input/output device enumeration
//! - `capture`: microphone capture on a dedicated host thread
//! - `playback`: output stream fed from a shared sample buffer
//!
//! cpal streams are not `Send` on every platform, so each stream lives on
//! the thread that built it and talks to the rest of the crate through
//! crossbeam channels or a [`BoundedBuffer`](crate::buffer::BoundedBuffer).

mod capture;
mod device;
mod playback;

pub use capture::MicCapture;
pub use device::{list_audio_devices, AudioDevice, AudioDirection};
pub use playback::SpeakerOutput;

/// How long to wait for a host thread to report that its stream is built.
pub(crate) const STREAM_READY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);
