//! WebSocket wire format
//!
//! Every frame is a JSON text message with a `type` discriminator, decoded
//! once at the boundary into [`InboundMessage`]. Media messages are never
//! re-encoded on the relay path: the original text is forwarded as is.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::errors::{RelayError, RelayResult};
use crate::media::{encode_base64, pcm_f32_to_le_bytes, AudioPayload, MediaFrame, DEFAULT_WIRE_SAMPLE_RATE};

pub const CONNECTED_ACK: &str =
    r#"{"type":"connection","status":"connected","message":"Connected to NodeFlow"}"#;
pub const READY_REPLY: &str = r#"{"type":"connection","status":"ready"}"#;
pub const TEST_REPLY: &str = r#"{"type":"test_response","message":"Test successful!"}"#;

/// Reply text for any command the gate rejects.
pub const UNAUTHORIZED_MESSAGE: &str = "Invalid command or unauthorized access";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    Hello {
        #[serde(default)]
        client: Option<String>,
    },
    Test,
    /// Payload is left in the raw text and relayed verbatim.
    Video,
    Audio,
    Device {
        #[serde(default)]
        command: String,
        #[serde(default)]
        device: String,
    },
}

impl InboundMessage {
    pub fn parse(text: &str) -> RelayResult<Self> {
        serde_json::from_str(text).map_err(|e| RelayError::MalformedMessage(e.to_string()))
    }

    pub fn media_kind(&self) -> Option<MediaKind> {
        match self {
            InboundMessage::Video => Some(MediaKind::Video),
            InboundMessage::Audio => Some(MediaKind::Audio),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
}

/// Full decode of a media message, for consumers that need the payload
/// (the bridge and the speaker feed).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MediaMessage {
    Video {
        data: String,
    },
    Audio {
        data: AudioPayload,
        #[serde(rename = "sampleRate", default = "default_sample_rate")]
        sample_rate: u32,
        #[serde(default = "default_channels")]
        channels: u16,
    },
}

fn default_sample_rate() -> u32 {
    DEFAULT_WIRE_SAMPLE_RATE
}

fn default_channels() -> u16 {
    1
}

impl MediaMessage {
    pub fn parse(text: &str) -> RelayResult<Self> {
        serde_json::from_str(text).map_err(|e| RelayError::MalformedMessage(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Success,
    Error,
}

/// Answer to a device command. Carries no `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceReply {
    pub status: ReplyStatus,
    pub message: String,
}

impl DeviceReply {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: ReplyStatus::Success,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ReplyStatus::Error,
            message: crate::errors::truncate_message(&message.into()),
        }
    }

    /// Rejections from the gate share one message; device failures carry
    /// their own.
    pub fn from_error(err: &RelayError) -> Self {
        match err {
            RelayError::MalformedMessage(_) | RelayError::PermissionDenied(_) => {
                Self::error(UNAUTHORIZED_MESSAGE)
            }
            other => Self::error(other.user_message()),
        }
    }

    pub fn to_wire(&self) -> RelayResult<Arc<str>> {
        Ok(serde_json::to_string(self)?.into())
    }
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Outbound<'a> {
    Video {
        data: &'a str,
        width: u32,
        height: u32,
    },
    Audio {
        data: &'a str,
        #[serde(rename = "sampleRate")]
        sample_rate: u32,
        channels: u16,
    },
}

/// Wire message for a locally captured frame.
pub fn encode_media(frame: &MediaFrame) -> RelayResult<Arc<str>> {
    let text = match frame {
        MediaFrame::Video {
            data,
            width,
            height,
        } => serde_json::to_string(&Outbound::Video {
            data: &encode_base64(data),
            width: *width,
            height: *height,
        })?,
        MediaFrame::Audio {
            samples,
            sample_rate,
            channels,
        } => serde_json::to_string(&Outbound::Audio {
            data: &encode_base64(&pcm_f32_to_le_bytes(samples)),
            sample_rate: *sample_rate,
            channels: *channels,
        })?,
    };
    Ok(text.into())
}
