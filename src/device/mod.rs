//! Local device lifecycle
//!
//! Each device type (webcam, microphone, speaker) has its own lock, its own
//! worker thread while active, and its own bounded media buffer. Hardware is
//! reached through a [`DeviceDriver`], so the lifecycle logic is identical
//! for real devices and the synthetic driver.

mod manager;
mod synthetic;
mod system;

pub use manager::{DeviceManager, DeviceManagerConfig, DeviceSnapshot};
pub use synthetic::{synthetic_audio_frame, synthetic_video_frame, SyntheticDriver};
pub use system::SystemDriver;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::buffer::BoundedBuffer;
use crate::errors::{RelayError, RelayResult};
use crate::media::MediaFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Webcam,
    Microphone,
    Speaker,
}

impl DeviceType {
    pub const ALL: [DeviceType; 3] = [DeviceType::Webcam, DeviceType::Microphone, DeviceType::Speaker];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Webcam => "webcam",
            DeviceType::Microphone => "microphone",
            DeviceType::Speaker => "speaker",
        }
    }

    /// Capture devices fill their buffer; playback devices drain it.
    pub fn is_capture(&self) -> bool {
        !matches!(self, DeviceType::Speaker)
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            DeviceType::Webcam => 0,
            DeviceType::Microphone => 1,
            DeviceType::Speaker => 2,
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "webcam" => Ok(DeviceType::Webcam),
            "microphone" => Ok(DeviceType::Microphone),
            "speaker" => Ok(DeviceType::Speaker),
            other => Err(RelayError::MalformedMessage(format!(
                "unknown device type: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceCommand {
    Start,
    Stop,
}

impl DeviceCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceCommand::Start => "start",
            DeviceCommand::Stop => "stop",
        }
    }
}

impl FromStr for DeviceCommand {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(DeviceCommand::Start),
            "stop" => Ok(DeviceCommand::Stop),
            other => Err(RelayError::MalformedMessage(format!(
                "unknown device command: {}",
                other
            ))),
        }
    }
}

/// Lifecycle state of one device type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "message", rename_all = "lowercase")]
pub enum DeviceState {
    Inactive,
    Active,
    Error(String),
}

/// Coarse status reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Running,
    Stopped,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceStatus::Running => write!(f, "running"),
            DeviceStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// Stream parameters handed to a driver when a device is opened.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSettings {
    pub video_width: u32,
    pub video_height: u32,
    pub video_fps: u32,
    pub sample_rate: u32,
    pub channels: u16,
    pub chunk_size: usize,
    pub webcam_index: u32,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            video_width: 640,
            video_height: 480,
            video_fps: 20,
            sample_rate: 44_100,
            channels: 1,
            chunk_size: 1024,
            webcam_index: 0,
        }
    }
}

/// An acquired hardware resource, driven by its device's worker thread.
pub trait DeviceResource: Send + Sync {
    /// One unit of work: capture into `buffer`, or play out of it.
    ///
    /// Must return within the timeout of the underlying I/O primitive so the
    /// worker notices a stop request promptly.
    fn pump(&self, buffer: &BoundedBuffer<MediaFrame>) -> RelayResult<()>;

    /// Release the hardware. Called once, even if the worker is still stuck.
    fn release(&self) -> RelayResult<()>;
}

/// Opens device resources.
pub trait DeviceDriver: Send + Sync {
    fn name(&self) -> &str;

    fn open(&self, device: DeviceType, settings: &StreamSettings) -> RelayResult<Box<dyn DeviceResource>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_type_round_trip_str() {
        for device in DeviceType::ALL {
            assert_eq!(device.as_str().parse::<DeviceType>().unwrap(), device);
        }
        assert!("toaster".parse::<DeviceType>().is_err());
    }

    #[test]
    fn test_device_command_parse() {
        assert_eq!("start".parse::<DeviceCommand>().unwrap(), DeviceCommand::Start);
        assert_eq!("stop".parse::<DeviceCommand>().unwrap(), DeviceCommand::Stop);
        assert!("dance".parse::<DeviceCommand>().is_err());
    }

    #[test]
    fn test_device_state_serialization() {
        let json = serde_json::to_value(DeviceState::Error("unplugged".into())).unwrap();
        assert_eq!(json["state"], "error");
        assert_eq!(json["message"], "unplugged");
        assert_eq!(serde_json::to_value(DeviceStatus::Running).unwrap(), "running");
    }

    #[test]
    fn test_capture_classification() {
        assert!(DeviceType::Webcam.is_capture());
        assert!(DeviceType::Microphone.is_capture());
        assert!(!DeviceType::Speaker.is_capture());
    }
}
