//! Media payloads carried through buffers and over the wire

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::errors::{RelayError, RelayResult};

/// Sample rate assumed for audio messages that omit `sampleRate`.
pub const DEFAULT_WIRE_SAMPLE_RATE: u32 = 16_000;

/// A captured or relayed unit of media. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaFrame {
    /// Opaque encoded image (usually JPEG).
    Video { data: Bytes, width: u32, height: u32 },
    /// Interleaved f32 PCM.
    Audio {
        samples: Vec<f32>,
        sample_rate: u32,
        channels: u16,
    },
}

impl MediaFrame {
    pub fn is_video(&self) -> bool {
        matches!(self, MediaFrame::Video { .. })
    }

    pub fn is_audio(&self) -> bool {
        matches!(self, MediaFrame::Audio { .. })
    }

    /// Playback length of an audio frame; zero for video.
    pub fn duration_secs(&self) -> f64 {
        match self {
            MediaFrame::Audio {
                samples,
                sample_rate,
                channels,
            } if *sample_rate > 0 && *channels > 0 => {
                samples.len() as f64 / (*sample_rate as f64 * *channels as f64)
            }
            _ => 0.0,
        }
    }
}

/// Decoded pixel buffer, row-major, `channels` bytes per pixel.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    pub data: Vec<u8>,
}

impl RawFrame {
    pub fn new(width: u32, height: u32, channels: u8, data: Vec<u8>) -> RelayResult<Self> {
        let expected = width as usize * height as usize * channels as usize;
        if !matches!(channels, 1 | 3 | 4) {
            return Err(RelayError::MalformedMessage(format!(
                "unsupported channel count {}",
                channels
            )));
        }
        if data.len() != expected {
            return Err(RelayError::MalformedMessage(format!(
                "frame buffer is {} bytes, expected {} for {}x{}x{}",
                data.len(),
                expected,
                width,
                height,
                channels
            )));
        }
        Ok(Self {
            width,
            height,
            channels,
            data,
        })
    }

    /// Mean intensity of one channel across all pixels.
    pub fn channel_mean(&self, channel: u8) -> f64 {
        let stride = self.channels as usize;
        let c = channel as usize;
        if c >= stride || self.data.is_empty() {
            return 0.0;
        }
        let (sum, count) = self
            .data
            .iter()
            .skip(c)
            .step_by(stride)
            .fold((0u64, 0u64), |(s, n), &v| (s + v as u64, n + 1));
        if count == 0 {
            0.0
        } else {
            sum as f64 / count as f64
        }
    }
}

/// Decode a JPEG (or any format `image` recognizes) into a raw frame,
/// preserving grayscale and alpha layouts.
pub fn decode_image(encoded: &[u8]) -> RelayResult<RawFrame> {
    let img = image::load_from_memory(encoded)
        .map_err(|e| RelayError::MalformedMessage(format!("image decode failed: {}", e)))?;
    let (width, height) = (img.width(), img.height());
    match img {
        image::DynamicImage::ImageLuma8(buf) => RawFrame::new(width, height, 1, buf.into_raw()),
        image::DynamicImage::ImageRgba8(buf) => RawFrame::new(width, height, 4, buf.into_raw()),
        other => RawFrame::new(width, height, 3, other.to_rgb8().into_raw()),
    }
}

/// JPEG-encode a raw frame at the encoder's default quality.
pub fn encode_jpeg(frame: &RawFrame) -> RelayResult<Bytes> {
    let size_error = || RelayError::MalformedMessage("frame buffer does not match its size".into());
    let img = match frame.channels {
        1 => image::DynamicImage::ImageLuma8(
            image::GrayImage::from_raw(frame.width, frame.height, frame.data.clone()).ok_or_else(size_error)?,
        ),
        // JPEG has no alpha channel.
        4 => image::DynamicImage::ImageRgb8(
            image::DynamicImage::ImageRgba8(
                image::RgbaImage::from_raw(frame.width, frame.height, frame.data.clone())
                    .ok_or_else(size_error)?,
            )
            .to_rgb8(),
        ),
        _ => image::DynamicImage::ImageRgb8(
            image::RgbImage::from_raw(frame.width, frame.height, frame.data.clone()).ok_or_else(size_error)?,
        ),
    };
    let mut encoded = Vec::new();
    img.write_to(&mut std::io::Cursor::new(&mut encoded), image::ImageFormat::Jpeg)
        .map_err(|e| RelayError::MalformedMessage(format!("jpeg encode failed: {}", e)))?;
    Ok(Bytes::from(encoded))
}

/// Linear-interpolation resample of interleaved samples.
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32, channels: u16) -> Vec<f32> {
    let ch = channels.max(1) as usize;
    if from_rate == to_rate || from_rate == 0 || to_rate == 0 || samples.len() < ch {
        return samples.to_vec();
    }
    let in_frames = samples.len() / ch;
    let out_frames = ((in_frames as u64 * to_rate as u64) / from_rate as u64).max(1) as usize;
    let step = from_rate as f64 / to_rate as f64;
    let mut out = Vec::with_capacity(out_frames * ch);
    for i in 0..out_frames {
        let pos = i as f64 * step;
        let idx = (pos as usize).min(in_frames - 1);
        let next = (idx + 1).min(in_frames - 1);
        let frac = (pos - idx as f64) as f32;
        for c in 0..ch {
            let a = samples[idx * ch + c];
            let b = samples[next * ch + c];
            out.push(a + (b - a) * frac);
        }
    }
    out
}

/// The `data` field of an audio message: base64 f32 LE bytes or a JSON array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AudioPayload {
    Encoded(String),
    Samples(Vec<f32>),
}

impl AudioPayload {
    pub fn into_samples(self) -> RelayResult<Vec<f32>> {
        match self {
            AudioPayload::Samples(samples) => Ok(samples),
            AudioPayload::Encoded(text) => {
                let bytes = decode_base64(&text)?;
                Ok(pcm_f32_from_le_bytes(&bytes))
            }
        }
    }
}

pub fn decode_base64(text: &str) -> RelayResult<Vec<u8>> {
    // Browsers send data URLs from canvas.toDataURL().
    let payload = match text.find(";base64,") {
        Some(idx) => &text[idx + ";base64,".len()..],
        None => text,
    };
    BASE64
        .decode(payload.trim())
        .map_err(|e| RelayError::MalformedMessage(format!("invalid base64: {}", e)))
}

pub fn encode_base64(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Trailing bytes that do not make a whole sample are ignored.
pub fn pcm_f32_from_le_bytes(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

pub fn pcm_f32_to_le_bytes(samples: &[f32]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}
