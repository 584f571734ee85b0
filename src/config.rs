//! Configuration management for NodeFlow
//!
//! TOML file with one section per subsystem. A missing file means defaults;
//! a malformed one is an error.

use crate::device::{DeviceManagerConfig, StreamSettings};
use crate::errors::{RelayError, RelayResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub network: NetworkConfig,
    pub stream: StreamConfig,
    pub devices: DevicesConfig,
    pub permissions: PermissionsConfig,
    pub bridge: BridgeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub host: String,
    pub port: u16,
    /// Further handshakes are refused once reached
    pub max_connections: usize,
    /// Per-peer outbound queue depth, in messages
    pub outbound_queue: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_connections: 64,
            outbound_queue: 64,
        }
    }
}

/// Capture parameters for local devices
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub video_width: u32,
    pub video_height: u32,
    pub video_fps: u32,
    pub sample_rate: u32,
    pub channels: u16,
    /// Audio frames per captured chunk
    pub chunk_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        let s = StreamSettings::default();
        Self {
            video_width: s.video_width,
            video_height: s.video_height,
            video_fps: s.video_fps,
            sample_rate: s.sample_rate,
            channels: s.channels,
            chunk_size: s.chunk_size,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DevicesConfig {
    /// Frames held per device before the oldest is dropped
    pub buffer_capacity: usize,
    pub join_timeout_ms: u64,
    pub webcam_index: u32,
    /// Use the synthetic driver instead of real hardware
    pub synthetic: bool,
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 10,
            join_timeout_ms: 2000,
            webcam_index: 0,
            synthetic: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionsConfig {
    /// Overrides `~/.nodeflow/permissions.json`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    pub default_grant_hours: f64,
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        Self {
            file: None,
            default_grant_hours: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub enabled: bool,
    pub camera_width: u32,
    pub camera_height: u32,
    pub camera_fps: u32,
    /// v4l2loopback device node; no virtual camera when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loopback_device: Option<PathBuf>,
    /// Exact output device name; skips virtual cable discovery
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_device: Option<String>,
    pub audio_channels: u16,
    pub jitter_seconds: f64,
    /// Wire messages queued for the bridge before the oldest are dropped
    pub tap_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            camera_width: 640,
            camera_height: 480,
            camera_fps: 30,
            loopback_device: None,
            audio_device: None,
            audio_channels: 1,
            jitter_seconds: 10.0,
            tap_capacity: 32,
        }
    }
}

impl RelayConfig {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> RelayResult<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .map_err(|e| RelayError::Config(format!("Failed to read config file: {}", e)))?;

        let config: RelayConfig = toml::from_str(&contents)
            .map_err(|e| RelayError::Config(format!("Failed to parse config file: {}", e)))?;

        log::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> RelayResult<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                RelayError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let toml_string = toml::to_string_pretty(self)
            .map_err(|e| RelayError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| RelayError::Config(format!("Failed to write config file: {}", e)))?;

        log::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        PathBuf::from("nodeflow.toml")
    }

    /// Load from default location or fall back to defaults
    pub fn load_or_default() -> Self {
        Self::load_from_file(Self::default_path()).unwrap_or_else(|e| {
            log::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Validate configuration values
    pub fn validate(&self) -> RelayResult<()> {
        let invalid = |msg: &str| Err(RelayError::Config(msg.to_string()));

        if self.network.host.trim().is_empty() {
            return invalid("Host must not be empty");
        }
        if self.network.max_connections == 0 {
            return invalid("max_connections must be at least 1");
        }
        if self.network.outbound_queue == 0 {
            return invalid("outbound_queue must be at least 1");
        }

        if self.stream.video_width == 0 || self.stream.video_height == 0 {
            return invalid("Invalid video resolution");
        }
        if self.stream.video_fps == 0 || self.stream.video_fps > 240 {
            return invalid("Invalid video FPS (must be 1-240)");
        }
        if !(8_000..=192_000).contains(&self.stream.sample_rate) {
            return invalid("Sample rate must be between 8000 and 192000");
        }
        if !(1..=2).contains(&self.stream.channels) {
            return invalid("Channels must be 1 or 2");
        }
        if self.stream.chunk_size == 0 {
            return invalid("chunk_size must be at least 1");
        }

        if self.devices.buffer_capacity == 0 {
            return invalid("buffer_capacity must be at least 1");
        }

        if !(self.permissions.default_grant_hours > 0.0) {
            return invalid("default_grant_hours must be positive");
        }

        if self.bridge.camera_width == 0 || self.bridge.camera_height == 0 {
            return invalid("Invalid bridge camera resolution");
        }
        if !(1..=2).contains(&self.bridge.audio_channels) {
            return invalid("Bridge audio channels must be 1 or 2");
        }
        if !(self.bridge.jitter_seconds > 0.0 && self.bridge.jitter_seconds <= 60.0) {
            return invalid("jitter_seconds must be in (0, 60]");
        }

        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.network.host, self.network.port)
    }

    pub fn stream_settings(&self) -> StreamSettings {
        StreamSettings {
            video_width: self.stream.video_width,
            video_height: self.stream.video_height,
            video_fps: self.stream.video_fps,
            sample_rate: self.stream.sample_rate,
            channels: self.stream.channels,
            chunk_size: self.stream.chunk_size,
            webcam_index: self.devices.webcam_index,
        }
    }

    pub fn device_manager_config(&self) -> DeviceManagerConfig {
        DeviceManagerConfig {
            buffer_capacity: self.devices.buffer_capacity,
            join_timeout: Duration::from_millis(self.devices.join_timeout_ms),
            settings: self.stream_settings(),
        }
    }
}
