//! Frame normalization for the virtual camera
//!
//! Virtual camera drivers take packed 3-channel BGR at a fixed size. Frames
//! arrive as grayscale, RGBA or 3-channel data whose order is either
//! known from the decoder or guessed.

use image::imageops::{self, FilterType};

use crate::errors::RelayResult;
use crate::media::RawFrame;

/// Channel order of a 3-channel frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrder {
    Rgb,
    Bgr,
    /// Guessed from channel means.
    Unknown,
}

/// Convert a frame of unknown order to 3-channel BGR and resize to
/// `width`x`height`.
///
/// RGBA is treated as RGB with alpha and swapped. A 3-channel frame whose
/// first channel is brighter on average than its third is assumed to be
/// RGB and swapped; otherwise it is passed through as BGR.
pub fn normalize_frame(frame: RawFrame, width: u32, height: u32) -> RelayResult<RawFrame> {
    normalize_frame_as(frame, ChannelOrder::Unknown, width, height)
}

/// Like [`normalize_frame`], for frames whose 3-channel order is known.
/// Decoded JPEGs are always [`ChannelOrder::Rgb`].
pub fn normalize_frame_as(frame: RawFrame, order: ChannelOrder, width: u32, height: u32) -> RelayResult<RawFrame> {
    let bgr = to_bgr(frame, order)?;
    if bgr.width == width && bgr.height == height {
        return Ok(bgr);
    }
    resize(bgr, width, height)
}

fn to_bgr(frame: RawFrame, order: ChannelOrder) -> RelayResult<RawFrame> {
    match frame.channels {
        1 => {
            let data = frame.data.iter().flat_map(|&v| [v, v, v]).collect();
            RawFrame::new(frame.width, frame.height, 3, data)
        }
        4 => {
            let data = frame
                .data
                .chunks_exact(4)
                .flat_map(|px| [px[2], px[1], px[0]])
                .collect();
            RawFrame::new(frame.width, frame.height, 3, data)
        }
        _ => match order {
            ChannelOrder::Rgb => Ok(swap_red_blue(frame)),
            ChannelOrder::Bgr => Ok(frame),
            ChannelOrder::Unknown if frame.channel_mean(0) > frame.channel_mean(2) => Ok(swap_red_blue(frame)),
            ChannelOrder::Unknown => Ok(frame),
        },
    }
}

fn swap_red_blue(mut frame: RawFrame) -> RawFrame {
    for px in frame.data.chunks_exact_mut(3) {
        px.swap(0, 2);
    }
    frame
}

fn resize(frame: RawFrame, width: u32, height: u32) -> RelayResult<RawFrame> {
    let (w, h) = (frame.width, frame.height);
    // Channel order does not matter to the filter.
    let Some(img) = image::RgbImage::from_raw(w, h, frame.data) else {
        return Err(crate::errors::RelayError::MalformedMessage(format!(
            "frame buffer does not match {}x{}",
            w, h
        )));
    };
    let resized = imageops::resize(&img, width, height, FilterType::Triangle);
    RawFrame::new(width, height, 3, resized.into_raw())
}
