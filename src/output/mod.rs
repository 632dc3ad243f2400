//! Sinks for published Program frames.

use crate::error::{Error, Result};
use crate::frame::VideoFrame;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Receives every published Program frame, on the tick thread.
pub trait FrameSink: Send {
    /// Write a frame to the output.
    fn write_frame(&mut self, frame: &VideoFrame) -> Result<()>;
}

/// Writes frames as `frame_000000.png`, `frame_000001.png`, ...
pub struct PngSequenceOutput {
    dir: PathBuf,
    next_index: u64,
    limit: Option<u64>,
}

impl PngSequenceOutput {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        info!("Writing PNG frames to {:?}", dir);
        Ok(Self {
            dir,
            next_index: 0,
            limit: None,
        })
    }

    /// Stops writing after `limit` frames.
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn frames_written(&self) -> u64 {
        self.next_index
    }

    fn path_for(&self, index: u64) -> PathBuf {
        self.dir.join(format!("frame_{index:06}.png"))
    }
}

impl FrameSink for PngSequenceOutput {
    fn write_frame(&mut self, frame: &VideoFrame) -> Result<()> {
        if self.limit.is_some_and(|limit| self.next_index >= limit) {
            return Ok(());
        }
        let rgba = frame.to_rgba()?;
        let image = image::RgbaImage::from_raw(rgba.width, rgba.height, rgba.data)
            .ok_or_else(|| Error::invalid_frame("buffer does not match frame size"))?;
        let path = self.path_for(self.next_index);
        image.save(&path)?;
        debug!("Wrote {:?}", path);
        self.next_index += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Rgb;

    #[test]
    fn test_writes_numbered_pngs_up_to_limit() {
        let dir = std::env::temp_dir().join(format!("keymix-png-{}", uuid::Uuid::new_v4()));
        let mut sink = PngSequenceOutput::new(&dir).unwrap().with_limit(2);
        let frame = VideoFrame::solid(4, 3, Rgb::new(10, 20, 30));
        for _ in 0..3 {
            sink.write_frame(&frame).unwrap();
        }
        assert_eq!(sink.frames_written(), 2);
        let back = image::open(dir.join("frame_000001.png")).unwrap().to_rgba8();
        assert_eq!(back.get_pixel(2, 1).0, [10, 20, 30, 255]);
        assert!(!dir.join("frame_000002.png").exists());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
