//! Overlay layers and the stack the control surface edits.

use crate::keying::ChromaKeySettings;
use crate::source::{FeedId, Source, VirtualCameraId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::RwLock;
use uuid::Uuid;

/// Smallest allowed layer size, as a fraction of the canvas.
pub const MIN_LAYER_SIZE: f32 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LayerId(pub Uuid);

impl LayerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LayerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Per-layer audio controls.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerAudio {
    /// Linear gain
    pub gain: f32,
    /// -1 (left) to 1 (right)
    pub pan: f32,
    pub muted: bool,
    pub solo: bool,
}

impl Default for LayerAudio {
    fn default() -> Self {
        Self {
            gain: 1.0,
            pan: 0.0,
            muted: false,
            solo: false,
        }
    }
}

/// One picture-in-picture entry.
///
/// Geometry is canvas-normalized: `center_norm` is the footprint center and
/// `size_norm` its width and height, both as fractions of the canvas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    pub id: LayerId,
    pub name: String,
    pub enabled: bool,
    /// Ascending paint order; higher is on top
    pub z_index: i32,
    pub center_norm: [f32; 2],
    pub size_norm: [f32; 2],
    pub rotation_degrees: f32,
    pub opacity: f32,
    pub source: Source,
    pub chroma_key: ChromaKeySettings,
    pub audio: Option<LayerAudio>,
}

fn finite_or(v: f32, fallback: f32) -> f32 {
    if v.is_finite() {
        v
    } else {
        fallback
    }
}

impl Layer {
    pub fn new(name: impl Into<String>, source: Source) -> Self {
        Self {
            id: LayerId::new(),
            name: name.into(),
            enabled: true,
            z_index: 0,
            center_norm: [0.5, 0.5],
            size_norm: [0.3, 0.3],
            rotation_degrees: 0.0,
            opacity: 1.0,
            source,
            chroma_key: ChromaKeySettings::default(),
            audio: None,
        }
    }

    pub fn camera(name: impl Into<String>, feed: impl Into<FeedId>) -> Self {
        Self::new(name, Source::Camera(feed.into()))
    }

    pub fn media(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        let mut layer = Self::new(name, Source::media(path));
        layer.audio = Some(LayerAudio::default());
        layer
    }

    /// Title or graphic supplied by a virtual camera.
    pub fn title(name: impl Into<String>, camera: impl Into<VirtualCameraId>) -> Self {
        let mut layer = Self::new(name, Source::Virtual(camera.into()));
        layer.center_norm = [0.5, 0.85];
        layer.size_norm = [0.6, 0.12];
        layer
    }

    pub fn with_z(mut self, z_index: i32) -> Self {
        self.z_index = z_index;
        self
    }

    pub fn with_geometry(mut self, center: [f32; 2], size: [f32; 2]) -> Self {
        self.center_norm = center;
        self.size_norm = size;
        self
    }

    pub fn with_chroma_key(mut self, settings: ChromaKeySettings) -> Self {
        self.chroma_key = settings;
        self
    }

    pub fn with_opacity(mut self, opacity: f32) -> Self {
        self.opacity = opacity;
        self
    }

    /// Copy with every field forced into range: size floored at
    /// `MIN_LAYER_SIZE`, center and opacity clamped to [0, 1], rotation
    /// wrapped to [0, 360).
    pub fn normalized(&self) -> Self {
        let mut layer = self.clone();
        for v in &mut layer.size_norm {
            *v = finite_or(*v, MIN_LAYER_SIZE).clamp(MIN_LAYER_SIZE, 1.0);
        }
        for v in &mut layer.center_norm {
            *v = finite_or(*v, 0.5).clamp(0.0, 1.0);
        }
        layer.opacity = finite_or(layer.opacity, 1.0).clamp(0.0, 1.0);
        layer.rotation_degrees = finite_or(layer.rotation_degrees, 0.0).rem_euclid(360.0);
        layer.chroma_key = layer.chroma_key.sanitized();
        if let Some(audio) = layer.audio.as_mut() {
            audio.gain = finite_or(audio.gain, 1.0).max(0.0);
            audio.pan = finite_or(audio.pan, 0.0).clamp(-1.0, 1.0);
        }
        layer
    }
}

/// Ordered layer list shared between the control surface and the tick.
///
/// Vector order is insertion order, which breaks z-index ties.
#[derive(Default)]
pub struct LayerStack {
    layers: RwLock<Vec<Layer>>,
}

impl LayerStack {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Layer>> {
        self.layers.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Layer>> {
        self.layers.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Adds a layer, or replaces the one with the same id in place.
    pub fn add(&self, layer: Layer) -> LayerId {
        let layer = layer.normalized();
        let id = layer.id;
        let mut layers = self.write();
        match layers.iter_mut().find(|l| l.id == id) {
            Some(existing) => *existing = layer,
            None => layers.push(layer),
        }
        id
    }

    /// Replaces the layer with the same id. Returns false if there is none.
    pub fn update(&self, layer: Layer) -> bool {
        let mut layers = self.write();
        match layers.iter_mut().find(|l| l.id == layer.id) {
            Some(existing) => {
                *existing = layer.normalized();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, id: LayerId) -> bool {
        let mut layers = self.write();
        let before = layers.len();
        layers.retain(|l| l.id != id);
        layers.len() != before
    }

    /// Moves the layer at `from` to `to` and renumbers every z-index to its
    /// new position, 0..n.
    pub fn reorder(&self, from: usize, to: usize) -> bool {
        let mut layers = self.write();
        if from >= layers.len() || to >= layers.len() {
            return false;
        }
        let layer = layers.remove(from);
        layers.insert(to, layer);
        for (z, layer) in layers.iter_mut().enumerate() {
            layer.z_index = z as i32;
        }
        true
    }

    pub fn get(&self, id: LayerId) -> Option<Layer> {
        self.read().iter().find(|l| l.id == id).cloned()
    }

    pub fn snapshot(&self) -> Vec<Layer> {
        self.read().clone()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn normalized_size_never_below_floor(w in proptest::num::f32::ANY, h in proptest::num::f32::ANY) {
            let layer = Layer::camera("cam", "cam-1").with_geometry([0.5, 0.5], [w, h]).normalized();
            for v in layer.size_norm {
                prop_assert!((MIN_LAYER_SIZE..=1.0).contains(&v));
            }
        }
    }

    #[test]
    fn test_normalized_wraps_and_clamps() {
        let mut layer = Layer::media("clip", "clip.mp4").with_opacity(1.7);
        layer.rotation_degrees = -90.0;
        layer.center_norm = [f32::NAN, 2.0];
        let n = layer.normalized();
        assert_eq!(n.opacity, 1.0);
        assert_eq!(n.rotation_degrees, 270.0);
        assert_eq!(n.center_norm, [0.5, 1.0]);
    }

    #[test]
    fn test_reorder_renumbers_densely_and_keeps_ids() {
        let stack = LayerStack::new();
        let ids: Vec<_> = [7, -3, 40]
            .into_iter()
            .map(|z| stack.add(Layer::camera("cam", "cam-1").with_z(z)))
            .collect();

        assert!(stack.reorder(0, 2));
        let layers = stack.snapshot();
        assert_eq!(layers.iter().map(|l| l.id).collect::<Vec<_>>(), vec![ids[1], ids[2], ids[0]]);
        assert_eq!(layers.iter().map(|l| l.z_index).collect::<Vec<_>>(), vec![0, 1, 2]);

        assert!(!stack.reorder(0, 3));
    }

    #[test]
    fn test_update_and_remove_by_id() {
        let stack = LayerStack::new();
        let id = stack.add(Layer::title("lower third", "title-1"));
        let mut layer = stack.get(id).unwrap();
        layer.name = "renamed".into();
        layer.size_norm = [0.01, 0.5];
        assert!(stack.update(layer));
        let stored = stack.get(id).unwrap();
        assert_eq!(stored.name, "renamed");
        assert_eq!(stored.size_norm[0], MIN_LAYER_SIZE);

        assert!(stack.remove(id));
        assert!(!stack.remove(id));
        assert!(!stack.update(Layer::camera("ghost", "cam-9")));
        assert!(stack.is_empty());
    }

    #[test]
    fn test_layer_serializes() {
        let layer = Layer::camera("cam", "cam-1").with_chroma_key(ChromaKeySettings::green());
        let yaml = serde_yaml::to_string(&layer).unwrap();
        let back: Layer = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, layer);
    }
}
