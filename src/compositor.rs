//! Layer compositor.
//!
//! Paints the bus base frame and the enabled overlay layers, in ascending
//! z-order, onto a premultiplied `tiny_skia::Pixmap` canvas. Keyed layers
//! go through a per-layer `ChromaKeyProcessor` first; layers without a
//! picture get a placeholder card in the same footprint.

use crate::frame::{PixelFormat, Rgb, VideoFrame};
use crate::keying::{
    ChromaKeyProcessor, KeyerFactory, KeyingCounters, KeyingStats, DEFAULT_KEY_TIMEOUT,
};
use crate::layer::{Layer, LayerId};
use crate::placeholder::PlaceholderRenderer;
use crate::source::{ConnectionStatus, SourceKey};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tiny_skia::{BlendMode, Color, FilterQuality, IntSize, Pixmap, PixmapPaint, Transform};
use tracing::{debug, warn};

/// The frame a source contributes to this tick.
#[derive(Debug, Clone)]
pub struct SourceFrame {
    pub frame: Option<Arc<VideoFrame>>,
    pub status: ConnectionStatus,
}

impl SourceFrame {
    pub fn ready(frame: Arc<VideoFrame>) -> Self {
        Self {
            frame: Some(frame),
            status: ConnectionStatus::Connected,
        }
    }

    pub fn missing(status: ConnectionStatus) -> Self {
        Self {
            frame: None,
            status,
        }
    }
}

/// Frames for every source referenced this tick, pulled once per source.
pub type FrameLookup = HashMap<SourceKey, SourceFrame>;

pub struct LayerCompositor {
    width: u32,
    height: u32,
    keyer_factory: Option<KeyerFactory>,
    key_timeout: Duration,
    processors: HashMap<LayerId, ChromaKeyProcessor>,
    keying_stats: Arc<KeyingStats>,
    placeholders: PlaceholderRenderer,
    placeholders_painted: u64,
}

/// Maps a `src_w` x `src_h` image onto a footprint centered at (`cx`, `cy`)
/// of size `dst_w` x `dst_h`, rotated clockwise by `rotation_degrees`.
fn footprint_transform(
    src_w: f32,
    src_h: f32,
    cx: f32,
    cy: f32,
    dst_w: f32,
    dst_h: f32,
    rotation_degrees: f32,
) -> Transform {
    let scale_x = dst_w / src_w.max(1.0);
    let scale_y = dst_h / src_h.max(1.0);
    let radians = rotation_degrees.to_radians();
    let (sin_theta, cos_theta) = radians.sin_cos();

    let a = cos_theta * scale_x;
    let b = sin_theta * scale_x;
    let c = -sin_theta * scale_y;
    let d = cos_theta * scale_y;

    let half_w = src_w * 0.5;
    let half_h = src_h * 0.5;
    let tx = cx - (a * half_w + c * half_h);
    let ty = cy - (b * half_w + d * half_h);

    Transform::from_row(a, b, c, d, tx, ty)
}

/// Wraps a frame as a premultiplied pixmap.
fn frame_pixmap(frame: &VideoFrame) -> Option<Pixmap> {
    let rgba = match frame.to_premultiplied_rgba() {
        Ok(rgba) => rgba,
        Err(e) => {
            debug!("Dropping unusable frame: {}", e);
            return None;
        }
    };
    let size = IntSize::from_wh(rgba.width, rgba.height)?;
    let expected = rgba.width as usize * rgba.height as usize * 4;
    let mut data = rgba.data;
    data.truncate(expected);
    Pixmap::from_vec(data, size)
}

fn draw(canvas: &mut Pixmap, source: &Pixmap, opacity: f32, transform: Transform, quality: FilterQuality) {
    let paint = PixmapPaint {
        opacity: opacity.clamp(0.0, 1.0),
        blend_mode: BlendMode::SourceOver,
        quality,
    };
    canvas.draw_pixmap(0, 0, source.as_ref(), &paint, transform, None);
}

fn is_opaque(frame: &VideoFrame) -> bool {
    frame.data.chunks_exact(4).all(|px| px[3] == 255)
}

impl LayerCompositor {
    /// `keyer_factory` builds one keying backend per keyed layer; without
    /// one, keyed layers are painted unkeyed.
    pub fn new(width: u32, height: u32, keyer_factory: Option<KeyerFactory>, placeholder_fill: Rgb) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
            keyer_factory,
            key_timeout: DEFAULT_KEY_TIMEOUT,
            processors: HashMap::new(),
            keying_stats: Arc::new(KeyingStats::default()),
            placeholders: PlaceholderRenderer::new(placeholder_fill),
            placeholders_painted: 0,
        }
    }

    pub fn with_placeholders(mut self, placeholders: PlaceholderRenderer) -> Self {
        self.placeholders = placeholders;
        self
    }

    pub fn canvas_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn set_key_timeout(&mut self, timeout: Duration) {
        self.key_timeout = timeout;
        for processor in self.processors.values_mut() {
            processor.set_timeout(timeout);
        }
    }

    pub fn keying_stats(&self) -> KeyingCounters {
        self.keying_stats.snapshot()
    }

    pub fn placeholders_painted(&self) -> u64 {
        self.placeholders_painted
    }

    /// Number of live per-layer keying processors.
    pub fn processor_count(&self) -> usize {
        self.processors.len()
    }

    fn black_canvas(&self) -> Option<Pixmap> {
        let mut canvas = Pixmap::new(self.width, self.height)?;
        canvas.fill(Color::BLACK);
        Some(canvas)
    }

    /// Draws `frame` scaled to fit the canvas, preserving aspect ratio.
    fn draw_fitted(&self, canvas: &mut Pixmap, frame: &VideoFrame, opacity: f32) {
        let same_size = frame.width == self.width && frame.height == self.height;
        if same_size && opacity >= 1.0 && frame.format == PixelFormat::Rgba && is_opaque(frame) {
            let len = canvas.data().len();
            if let Some(src) = frame.data.get(..len) {
                canvas.data_mut().copy_from_slice(src);
                return;
            }
        }
        let Some(source) = frame_pixmap(frame) else {
            return;
        };
        if same_size {
            draw(canvas, &source, opacity, Transform::identity(), FilterQuality::Nearest);
            return;
        }
        let fit = (self.width as f32 / frame.width as f32).min(self.height as f32 / frame.height as f32);
        let transform = footprint_transform(
            frame.width as f32,
            frame.height as f32,
            self.width as f32 / 2.0,
            self.height as f32 / 2.0,
            frame.width as f32 * fit,
            frame.height as f32 * fit,
            0.0,
        );
        draw(canvas, &source, opacity, transform, FilterQuality::Bilinear);
    }

    /// Canvas-sized copy of a bus frame without overlays. Leaves the
    /// per-layer keying state alone.
    pub fn render_bus(&self, base: Option<&VideoFrame>) -> VideoFrame {
        let Some(mut canvas) = self.black_canvas() else {
            warn!("Failed to allocate {}x{} canvas", self.width, self.height);
            return VideoFrame::solid(self.width, self.height, Rgb::BLACK);
        };
        if let Some(frame) = base {
            self.draw_fitted(&mut canvas, frame, 1.0);
        }
        self.finish(canvas)
    }

    fn finish(&self, canvas: Pixmap) -> VideoFrame {
        // Every canvas pixel is opaque, so premultiplied bytes equal straight ones.
        VideoFrame::from_data(
            self.width,
            self.height,
            PixelFormat::Rgba,
            canvas.take(),
        )
    }

    /// Composites `layers` over `base`. With no base the canvas is black.
    pub fn composite(&mut self, base: Option<&VideoFrame>, layers: &[Layer], frames: &FrameLookup) -> VideoFrame {
        self.composite_transition(base, None, 0.0, layers, frames)
    }

    /// Crossfade: `outgoing` at full opacity, `incoming` on top at
    /// `progress`, then the layers.
    pub fn composite_transition(
        &mut self,
        outgoing: Option<&VideoFrame>,
        incoming: Option<&VideoFrame>,
        progress: f32,
        layers: &[Layer],
        frames: &FrameLookup,
    ) -> VideoFrame {
        let start = Instant::now();
        let Some(mut canvas) = self.black_canvas() else {
            warn!("Failed to allocate {}x{} canvas", self.width, self.height);
            return VideoFrame::solid(self.width, self.height, Rgb::BLACK);
        };

        if let Some(frame) = outgoing {
            self.draw_fitted(&mut canvas, frame, 1.0);
        }
        if let Some(frame) = incoming {
            let p = if progress.is_finite() { progress.clamp(0.0, 1.0) } else { 0.0 };
            if p > 0.0 {
                self.draw_fitted(&mut canvas, frame, p);
            }
        }

        self.paint_layers(&mut canvas, layers, frames);
        debug!("  [Perf] Composite: {:?}", start.elapsed());
        self.finish(canvas)
    }

    fn paint_layers(&mut self, canvas: &mut Pixmap, layers: &[Layer], frames: &FrameLookup) {
        let mut visible: Vec<&Layer> = layers.iter().filter(|l| l.enabled).collect();
        // stable: equal z keeps insertion order
        visible.sort_by_key(|l| l.z_index);

        for layer in visible {
            let layer = layer.normalized();
            let (w, h) = (self.width as f32, self.height as f32);
            let cx = layer.center_norm[0] * w;
            let cy = layer.center_norm[1] * h;
            let fw = layer.size_norm[0] * w;
            let fh = layer.size_norm[1] * h;

            let entry = layer.source.key().and_then(|key| frames.get(&key));
            let frame = entry
                .and_then(|e| e.frame.as_deref())
                .filter(|f| f.is_valid());

            let pixmap = match frame {
                Some(frame) => {
                    let keyed;
                    let frame = if layer.chroma_key.enabled {
                        keyed = self.processor(layer.id).process(frame, layer.chroma_key);
                        &keyed
                    } else {
                        frame
                    };
                    frame_pixmap(frame)
                }
                None => None,
            };

            let pixmap = match pixmap {
                Some(pixmap) => pixmap,
                None => {
                    let status = entry.map_or(ConnectionStatus::Disconnected, |e| e.status);
                    let label = if layer.source.is_none() {
                        layer.source.to_string()
                    } else {
                        format!("{} - {}", layer.source, status)
                    };
                    let card = self.placeholders.card(
                        fw.round().max(1.0) as u32,
                        fh.round().max(1.0) as u32,
                        &label,
                    );
                    self.placeholders_painted += 1;
                    match frame_pixmap(&card) {
                        Some(pixmap) => pixmap,
                        None => continue,
                    }
                }
            };

            let transform = footprint_transform(
                pixmap.width() as f32,
                pixmap.height() as f32,
                cx,
                cy,
                fw,
                fh,
                layer.rotation_degrees,
            );
            draw(canvas, &pixmap, layer.opacity, transform, FilterQuality::Bilinear);
        }

        self.processors.retain(|id, _| layers.iter().any(|l| l.id == *id));
    }

    fn processor(&mut self, id: LayerId) -> &mut ChromaKeyProcessor {
        let factory = self.keyer_factory.clone();
        let timeout = self.key_timeout;
        let stats = self.keying_stats.clone();
        self.processors.entry(id).or_insert_with(|| {
            let processor = match factory {
                Some(factory) => ChromaKeyProcessor::new(factory(), timeout),
                None => ChromaKeyProcessor::passthrough(),
            };
            processor.with_stats(stats)
        })
    }
}
