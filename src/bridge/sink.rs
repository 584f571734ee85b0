//! Virtual device endpoints
//!
//! A virtual camera is anything that accepts packed BGR frames. Audio goes
//! to an ordinary output device whose name marks it as a virtual cable.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::errors::{RelayError, RelayResult};
use crate::media::RawFrame;

/// Name fragments of known virtual audio cables, matched case-insensitively.
pub const VIRTUAL_CABLE_NAMES: &[&str] = &[
    "CABLE Input",
    "VB-Audio Virtual Cable",
    "Virtual Audio Cable",
    "Stereo Mix",
    "Wave Out Mix",
    "What U Hear",
    "Listening to this device",
    // pactl load-module module-null-sink sink_name=nodeflow
    "nodeflow",
];

/// First device name that contains a known virtual cable name.
pub fn find_virtual_cable<'a, I>(device_names: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    device_names.into_iter().find(|name| {
        let lower = name.to_lowercase();
        VIRTUAL_CABLE_NAMES
            .iter()
            .any(|known| lower.contains(&known.to_lowercase()))
    })
}

pub trait VirtualCameraSink: Send {
    fn name(&self) -> &str;

    /// Deliver one BGR frame at the sink's configured size.
    fn send(&mut self, frame: &RawFrame) -> RelayResult<()>;

    fn close(&mut self) -> RelayResult<()>;
}

/// Writes raw frames to a v4l2loopback device node.
///
/// The node's caps must already be set to BGR3 at the bridge resolution,
/// e.g. with `v4l2loopback-ctl set-caps`.
pub struct LoopbackSink {
    path: PathBuf,
    name: String,
    file: Option<File>,
}

impl LoopbackSink {
    pub fn open<P: AsRef<Path>>(path: P) -> RelayResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().write(true).open(&path).map_err(|e| {
            RelayError::SinkUnavailable(format!("cannot open {}: {}", path.display(), e))
        })?;
        log::info!("Virtual camera writing to {}", path.display());
        Ok(Self {
            name: path.display().to_string(),
            path,
            file: Some(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl VirtualCameraSink for LoopbackSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn send(&mut self, frame: &RawFrame) -> RelayResult<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| RelayError::SinkUnavailable(format!("{} is closed", self.name)))?;
        file.write_all(&frame.data)?;
        Ok(())
    }

    fn close(&mut self) -> RelayResult<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finds_vb_cable_case_insensitive() {
        let names = ["Speakers (Realtek)", "cable input (VB-Audio Virtual Cable)"];
        assert_eq!(
            find_virtual_cable(names.iter().copied()),
            Some("cable input (VB-Audio Virtual Cable)")
        );
    }

    #[test]
    fn test_finds_null_sink() {
        let names = ["Built-in Audio", "nodeflow Audio/Sink sink"];
        assert!(find_virtual_cable(names.iter().copied()).is_some());
    }

    #[test]
    fn test_no_match() {
        let names = ["Speakers", "HDMI Output"];
        assert_eq!(find_virtual_cable(names.iter().copied()), None);
    }

    #[test]
    fn test_loopback_sink_writes_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("video10");
        std::fs::write(&path, b"").unwrap();

        let mut sink = LoopbackSink::open(&path).unwrap();
        let frame = RawFrame::new(2, 1, 3, vec![1, 2, 3, 4, 5, 6]).unwrap();
        sink.send(&frame).unwrap();
        sink.send(&frame).unwrap();
        sink.close().unwrap();
        assert_eq!(std::fs::read(&path).unwrap().len(), 12);
        assert!(sink.send(&frame).is_err());
    }

    #[test]
    fn test_loopback_missing_node() {
        let dir = tempfile::tempdir().unwrap();
        let err = LoopbackSink::open(dir.path().join("nope")).err().unwrap();
        assert!(matches!(err, RelayError::SinkUnavailable(_)));
    }
}
