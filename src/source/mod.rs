//! Frame sources: cameras, media files, synthetic patterns.
//!
//! Every source is polled with a non-blocking `pull()`. Producers run on
//! their own threads and leave at most one pending frame behind.

pub mod camera;
pub mod media;
pub mod pattern;

pub use camera::{CameraFeed, CameraInfo, CaptureBackend, CaptureConfig};
#[cfg(feature = "camera")]
pub use camera::NokhwaCapture;
pub use media::{FfmpegDecoder, MediaPlayer, PlaybackClock};
pub use pattern::{Pattern, TestPattern};

use crate::audio::AudioLevels;
use crate::error::Result;
use crate::frame::VideoFrame;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, warn};

pub type FeedId = String;
pub type VirtualCameraId = String;

/// Reference to a media file on disk.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaRef {
    pub path: PathBuf,
}

impl MediaRef {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

/// Transport settings a media source starts with.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackState {
    pub playing: bool,
    pub start_secs: f64,
    pub rate: f32,
    pub volume: f32,
    pub muted: bool,
    pub loop_enabled: bool,
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self {
            playing: true,
            start_secs: 0.0,
            rate: 1.0,
            volume: 1.0,
            muted: false,
            loop_enabled: true,
        }
    }
}

/// Observable transport state of a media source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BusPlayback {
    pub is_playing: bool,
    pub current_time: f64,
    pub duration: f64,
    pub rate: f32,
    pub volume: f32,
    pub muted: bool,
    pub loop_enabled: bool,
}

impl BusPlayback {
    pub fn from_state(state: &PlaybackState) -> Self {
        Self {
            is_playing: state.playing,
            current_time: state.start_secs.max(0.0),
            duration: 0.0,
            rate: state.rate,
            volume: state.volume,
            muted: state.muted,
            loop_enabled: state.loop_enabled,
        }
    }
}

/// What a bus or layer shows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Camera(FeedId),
    Media { file: MediaRef, playback: PlaybackState },
    Virtual(VirtualCameraId),
    #[default]
    None,
}

/// Identity of a live source, shared by every owner that references it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SourceKey {
    Camera(FeedId),
    Media(MediaRef),
    Virtual(VirtualCameraId),
}

impl Source {
    pub fn camera(id: impl Into<FeedId>) -> Self {
        Source::Camera(id.into())
    }

    pub fn media(path: impl Into<PathBuf>) -> Self {
        Source::Media {
            file: MediaRef::new(path),
            playback: PlaybackState::default(),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Source::None)
    }

    pub fn key(&self) -> Option<SourceKey> {
        match self {
            Source::Camera(id) => Some(SourceKey::Camera(id.clone())),
            Source::Media { file, .. } => Some(SourceKey::Media(file.clone())),
            Source::Virtual(id) => Some(SourceKey::Virtual(id.clone())),
            Source::None => None,
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Camera(id) => write!(f, "CAMERA {id}"),
            Source::Media { file, .. } => {
                let name = file
                    .path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| file.path.display().to_string());
                write!(f, "MEDIA {name}")
            }
            Source::Virtual(id) => write!(f, "VIRTUAL {id}"),
            Source::None => write!(f, "NO SOURCE"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Connecting => "CONNECTING",
            ConnectionStatus::Connected => "CONNECTED",
            ConnectionStatus::Disconnected => "DISCONNECTED",
            ConnectionStatus::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// A live producer of frames.
pub trait FrameSource: Send + Sync {
    /// Returns the newest frame produced since the last pull, if any.
    /// Never blocks on the producer.
    fn pull(&self) -> Option<VideoFrame>;

    fn status(&self) -> ConnectionStatus;

    fn audio_levels(&self) -> Option<AudioLevels> {
        None
    }

    fn as_media(&self) -> Option<&dyn MediaTransport> {
        None
    }
}

/// Transport controls of a media source. Effects show on the next pull.
pub trait MediaTransport: Send + Sync {
    fn play(&self);
    fn pause(&self);
    fn seek(&self, secs: f64);
    fn set_rate(&self, rate: f32);
    fn set_loop(&self, enabled: bool);
    fn set_volume(&self, volume: f32);
    fn set_muted(&self, muted: bool);
    fn playback(&self) -> BusPlayback;
}

/// Single-slot mailbox between a producer thread and `pull()`.
///
/// Keeps only the newest frame. Frames stamped older than one already
/// published or delivered are dropped.
#[derive(Default)]
pub struct LatestFrame {
    slot: Mutex<Slot>,
}

#[derive(Default)]
struct Slot {
    pending: Option<VideoFrame>,
    newest: Option<u64>,
}

impl LatestFrame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `frame`, replacing any undelivered one. Returns false if the
    /// frame was older than what the slot has already seen.
    pub fn publish(&self, frame: VideoFrame) -> bool {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        if let (Some(ts), Some(newest)) = (frame.timestamp_us, slot.newest) {
            if ts < newest {
                return false;
            }
        }
        if frame.timestamp_us.is_some() {
            slot.newest = frame.timestamp_us;
        }
        slot.pending = Some(frame);
        true
    }

    pub fn take(&self) -> Option<VideoFrame> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).pending.take()
    }
}

/// Supplies camera feeds by id.
pub trait CameraFeedManager: Send + Sync {
    fn feed(&self, id: &FeedId) -> Option<Arc<dyn FrameSource>>;
}

/// Opens media files.
pub trait MediaDecoder: Send + Sync {
    fn open(&self, file: &MediaRef, playback: &PlaybackState) -> Result<Arc<dyn FrameSource>>;
}

/// Supplies virtual cameras (titles, graphics) by id.
pub trait VirtualCameraProvider: Send + Sync {
    fn camera(&self, id: &VirtualCameraId) -> Option<Arc<dyn FrameSource>>;
}

/// In-memory id -> source map. Serves as both a camera feed manager and a
/// virtual camera provider.
#[derive(Default)]
pub struct SourceDirectory {
    sources: RwLock<HashMap<String, Arc<dyn FrameSource>>>,
}

impl SourceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: impl Into<String>, source: Arc<dyn FrameSource>) {
        self.sources
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.into(), source);
    }

    pub fn remove(&self, id: &str) -> Option<Arc<dyn FrameSource>> {
        self.sources
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sources
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(id)
    }

    fn get(&self, id: &str) -> Option<Arc<dyn FrameSource>> {
        self.sources
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }
}

impl CameraFeedManager for SourceDirectory {
    fn feed(&self, id: &FeedId) -> Option<Arc<dyn FrameSource>> {
        self.get(id)
    }
}

impl VirtualCameraProvider for SourceDirectory {
    fn camera(&self, id: &VirtualCameraId) -> Option<Arc<dyn FrameSource>> {
        self.get(id)
    }
}

/// Resolves `Source` values into live sources through the injected
/// collaborators. Media is opened once per file and shared by every owner.
#[derive(Default)]
pub struct SourceRegistry {
    cameras: Option<Arc<dyn CameraFeedManager>>,
    media: Option<Arc<dyn MediaDecoder>>,
    virtual_cameras: Option<Arc<dyn VirtualCameraProvider>>,
    /// `None` entries remember failed opens so they are not retried per tick.
    media_cache: Mutex<HashMap<MediaRef, Option<Arc<dyn FrameSource>>>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cameras(mut self, cameras: Arc<dyn CameraFeedManager>) -> Self {
        self.cameras = Some(cameras);
        self
    }

    pub fn with_media(mut self, media: Arc<dyn MediaDecoder>) -> Self {
        self.media = Some(media);
        self
    }

    pub fn with_virtual_cameras(mut self, provider: Arc<dyn VirtualCameraProvider>) -> Self {
        self.virtual_cameras = Some(provider);
        self
    }

    pub fn resolve(&self, source: &Source) -> Option<Arc<dyn FrameSource>> {
        match source {
            Source::Camera(id) => self.cameras.as_ref()?.feed(id),
            Source::Media { file, playback } => self.resolve_media(file, playback),
            Source::Virtual(id) => self.virtual_cameras.as_ref()?.camera(id),
            Source::None => None,
        }
    }

    fn resolve_media(&self, file: &MediaRef, playback: &PlaybackState) -> Option<Arc<dyn FrameSource>> {
        let mut cache = self.media_cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = cache.get(file) {
            return entry.clone();
        }
        let decoder = self.media.as_ref()?;
        let opened = match decoder.open(file, playback) {
            Ok(source) => {
                debug!("Opened media {:?}", file.path);
                Some(source)
            }
            Err(e) => {
                warn!("Failed to open media {:?}: {}", file.path, e);
                None
            }
        };
        cache.insert(file.clone(), opened.clone());
        opened
    }

    /// Drops cached media no longer referenced by anything in `keep`.
    pub fn retain_media(&self, keep: &[SourceKey]) {
        let mut cache = self.media_cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.retain(|file, _| keep.iter().any(|k| matches!(k, SourceKey::Media(m) if m == file)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::frame::Rgb;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn frame_at(ts: u64) -> VideoFrame {
        VideoFrame::solid(2, 2, Rgb::BLUE).with_timestamp(ts)
    }

    #[test]
    fn test_latest_frame_keeps_newest() {
        let slot = LatestFrame::new();
        assert!(slot.publish(frame_at(10)));
        assert!(slot.publish(frame_at(20)));
        assert_eq!(slot.take().unwrap().timestamp_us, Some(20));
        assert!(slot.take().is_none());
    }

    #[test]
    fn test_latest_frame_drops_out_of_order() {
        let slot = LatestFrame::new();
        slot.publish(frame_at(30));
        assert!(slot.take().is_some());
        assert!(!slot.publish(frame_at(25)));
        assert!(slot.take().is_none());
    }

    #[test]
    fn test_source_keys_are_shared_by_value() {
        let a = Source::camera("cam-1");
        let b = Source::camera("cam-1");
        assert_eq!(a.key(), b.key());
        assert_eq!(Source::None.key(), None);
        assert_eq!(Source::media("/tmp/clip.mp4").to_string(), "MEDIA clip.mp4");
    }

    #[test]
    fn test_source_serializes() {
        let yaml = serde_yaml::to_string(&Source::camera("cam-1")).unwrap();
        let back: Source = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, Source::camera("cam-1"));
    }

    struct CountingDecoder {
        opens: AtomicUsize,
        fail: bool,
    }

    impl MediaDecoder for CountingDecoder {
        fn open(&self, _: &MediaRef, _: &PlaybackState) -> Result<Arc<dyn FrameSource>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::source("unreadable"));
            }
            Ok(Arc::new(TestPattern::solid(2, 2, Rgb::GREEN)))
        }
    }

    #[test]
    fn test_media_is_opened_once() {
        let decoder = Arc::new(CountingDecoder {
            opens: AtomicUsize::new(0),
            fail: false,
        });
        let registry = SourceRegistry::new().with_media(decoder.clone());
        let source = Source::media("clip.mp4");
        assert!(registry.resolve(&source).is_some());
        assert!(registry.resolve(&source).is_some());
        assert_eq!(decoder.opens.load(Ordering::SeqCst), 1);

        registry.retain_media(&[]);
        assert!(registry.resolve(&source).is_some());
        assert_eq!(decoder.opens.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failed_media_open_is_not_retried() {
        let decoder = Arc::new(CountingDecoder {
            opens: AtomicUsize::new(0),
            fail: true,
        });
        let registry = SourceRegistry::new().with_media(decoder.clone());
        let source = Source::media("broken.mp4");
        assert!(registry.resolve(&source).is_none());
        assert!(registry.resolve(&source).is_none());
        assert_eq!(decoder.opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_missing_collaborator_resolves_to_none() {
        let registry = SourceRegistry::new();
        assert!(registry.resolve(&Source::camera("cam-1")).is_none());
        assert!(registry.resolve(&Source::Virtual("title".into())).is_none());
    }

    #[test]
    fn test_directory_serves_feeds() {
        let directory = Arc::new(SourceDirectory::new());
        directory.insert("cam-1", Arc::new(TestPattern::bars(4, 4)));
        let registry = SourceRegistry::new().with_cameras(directory.clone());
        assert!(registry.resolve(&Source::camera("cam-1")).is_some());
        directory.remove("cam-1");
        assert!(registry.resolve(&Source::camera("cam-1")).is_none());
    }
}
