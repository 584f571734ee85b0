//! Audio device enumeration

use cpal::traits::{DeviceTrait, HostTrait};
use serde::{Deserialize, Serialize};

use crate::errors::{RelayError, RelayResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioDirection {
    Input,
    Output,
}

/// Audio device information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioDevice {
    /// Stable-ish identifier: index plus a hash of the name
    pub id: String,
    pub name: String,
    pub direction: AudioDirection,
    /// Default sample rate in Hz
    pub sample_rate: u32,
    pub channels: u16,
    pub is_default: bool,
}

fn device_id(index: usize, name: &str) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    format!("audio_{}_{:08x}", index, hasher.finish() & 0xFFFF_FFFF)
}

/// List input or output devices, default first, then alphabetically.
pub fn list_audio_devices(direction: AudioDirection) -> RelayResult<Vec<AudioDevice>> {
    let host = cpal::default_host();
    let (default_name, devices) = match direction {
        AudioDirection::Input => (
            host.default_input_device().and_then(|d| d.name().ok()),
            host.input_devices(),
        ),
        AudioDirection::Output => (
            host.default_output_device().and_then(|d| d.name().ok()),
            host.output_devices(),
        ),
    };
    let devices = devices
        .map_err(|e| RelayError::SinkUnavailable(format!("Failed to enumerate audio devices: {}", e)))?;

    let mut list: Vec<AudioDevice> = devices
        .enumerate()
        .filter_map(|(index, device)| {
            let name = device.name().ok()?;
            let config = match direction {
                AudioDirection::Input => device.default_input_config().ok()?,
                AudioDirection::Output => device.default_output_config().ok()?,
            };
            Some(AudioDevice {
                id: device_id(index, &name),
                is_default: default_name.as_ref() == Some(&name),
                name,
                direction,
                sample_rate: config.sample_rate().0,
                channels: config.channels(),
            })
        })
        .collect();

    list.sort_by(|a, b| match (a.is_default, b.is_default) {
        (true, false) => std::cmp::Ordering::Less,
        (false, true) => std::cmp::Ordering::Greater,
        _ => a.name.cmp(&b.name),
    });

    Ok(list)
}

/// Output device with exactly this name, or the default output for `None`.
pub(crate) fn find_output_device(name: Option<&str>) -> RelayResult<cpal::Device> {
    let host = cpal::default_host();
    match name {
        None => host
            .default_output_device()
            .ok_or_else(|| RelayError::SinkUnavailable("No default audio output device".into())),
        Some(wanted) => host
            .output_devices()
            .map_err(|e| RelayError::SinkUnavailable(format!("Failed to enumerate devices: {}", e)))?
            .find(|d| d.name().ok().as_deref() == Some(wanted))
            .ok_or_else(|| RelayError::SinkUnavailable(format!("Audio output not found: {}", wanted))),
    }
}
