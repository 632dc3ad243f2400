//! Synthetic sources.

use super::{ConnectionStatus, FrameSource};
use crate::audio::AudioLevels;
use crate::frame::{PixelFormat, Rgb, VideoFrame};
use std::sync::atomic::{AtomicU64, Ordering};

/// SMPTE-style bar colors, left to right.
const BARS: [Rgb; 7] = [
    Rgb::new(192, 192, 192),
    Rgb::new(192, 192, 0),
    Rgb::new(0, 192, 192),
    Rgb::new(0, 192, 0),
    Rgb::new(192, 0, 192),
    Rgb::new(192, 0, 0),
    Rgb::new(0, 0, 192),
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Pattern {
    Solid(Rgb),
    Bars,
}

/// A source that produces a fresh copy of a fixed image on every pull.
pub struct TestPattern {
    frame: VideoFrame,
    sequence: AtomicU64,
    levels: Option<AudioLevels>,
}

impl TestPattern {
    pub fn new(pattern: Pattern, width: u32, height: u32) -> Self {
        let frame = match pattern {
            Pattern::Solid(color) => VideoFrame::solid(width, height, color),
            Pattern::Bars => render_bars(width, height),
        };
        Self::from_frame(frame)
    }

    pub fn solid(width: u32, height: u32, color: Rgb) -> Self {
        Self::new(Pattern::Solid(color), width, height)
    }

    pub fn bars(width: u32, height: u32) -> Self {
        Self::new(Pattern::Bars, width, height)
    }

    /// Serves an arbitrary frame, e.g. a rendered title card.
    pub fn from_frame(frame: VideoFrame) -> Self {
        Self {
            frame,
            sequence: AtomicU64::new(0),
            levels: None,
        }
    }

    /// Reports constant meter levels, standing in for a tone generator.
    pub fn with_levels(mut self, levels: AudioLevels) -> Self {
        self.levels = Some(levels);
        self
    }
}

fn render_bars(width: u32, height: u32) -> VideoFrame {
    let mut frame = VideoFrame::new(width, height, PixelFormat::Rgba);
    for (i, px) in frame.data.chunks_exact_mut(4).enumerate() {
        let x = (i % width as usize) as u32;
        let bar = ((x as u64 * BARS.len() as u64) / width.max(1) as u64) as usize;
        let c = BARS[bar.min(BARS.len() - 1)];
        px.copy_from_slice(&[c.r, c.g, c.b, 255]);
    }
    frame
}

impl FrameSource for TestPattern {
    fn pull(&self) -> Option<VideoFrame> {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        Some(self.frame.clone().with_timestamp(seq))
    }

    fn status(&self) -> ConnectionStatus {
        ConnectionStatus::Connected
    }

    fn audio_levels(&self) -> Option<AudioLevels> {
        self.levels
    }
}
