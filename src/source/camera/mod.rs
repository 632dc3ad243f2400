//! Live camera feeds.
//!
//! A `CameraFeed` owns a capture thread that opens a `CaptureBackend`,
//! pulls frames at the configured rate and leaves the newest one in a
//! `LatestFrame` slot.

#[cfg(feature = "camera")]
mod nokhwa_backend;

#[cfg(feature = "camera")]
pub use nokhwa_backend::NokhwaCapture;

use super::{ConnectionStatus, FeedId, FrameSource, LatestFrame};
use crate::audio::{AudioLevels, LevelMeter};
use crate::frame::VideoFrame;
use anyhow::Result;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Consecutive capture failures before a feed reports `Disconnected`.
pub const MAX_CAPTURE_FAILURES: u32 = 3;

/// Trait for camera capture backends.
pub trait CaptureBackend {
    /// Returns a list of available camera devices.
    fn list_devices() -> Result<Vec<CameraInfo>>
    where
        Self: Sized;

    /// Opens the camera with the specified configuration.
    fn open(config: CaptureConfig) -> Result<Self>
    where
        Self: Sized;

    /// Captures a single frame from the camera. May block until the device
    /// delivers one.
    fn capture_frame(&mut self) -> Result<VideoFrame>;

    /// Returns the current frame dimensions.
    fn frame_size(&self) -> (u32, u32);
}

/// Information about a camera device.
#[derive(Debug, Clone)]
pub struct CameraInfo {
    /// Device index
    pub index: u32,
    /// Human-readable name
    pub name: String,
}

/// Configuration for camera capture.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub device_index: u32,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            width: 1280,
            height: 720,
            fps: 30,
        }
    }
}

fn encode_status(status: ConnectionStatus) -> u8 {
    match status {
        ConnectionStatus::Connecting => 0,
        ConnectionStatus::Connected => 1,
        ConnectionStatus::Disconnected => 2,
        ConnectionStatus::Error => 3,
    }
}

fn decode_status(v: u8) -> ConnectionStatus {
    match v {
        0 => ConnectionStatus::Connecting,
        1 => ConnectionStatus::Connected,
        2 => ConnectionStatus::Disconnected,
        _ => ConnectionStatus::Error,
    }
}

struct FeedShared {
    latest: LatestFrame,
    status: AtomicU8,
    running: AtomicBool,
}

impl FeedShared {
    fn set_status(&self, status: ConnectionStatus) {
        self.status.store(encode_status(status), Ordering::Release);
    }
}

/// A camera feed driven by its own capture thread.
pub struct CameraFeed {
    id: FeedId,
    shared: Arc<FeedShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
    audio: Arc<LevelMeter>,
}

impl CameraFeed {
    /// Opens backend `B` on the capture thread.
    pub fn open<B: CaptureBackend + 'static>(id: impl Into<FeedId>, config: CaptureConfig) -> Self {
        let fps = config.fps;
        Self::spawn_with(id, fps, move || B::open(config))
    }

    /// Runs `opener` on the capture thread, so the backend itself never has
    /// to cross threads.
    pub fn spawn_with<B, F>(id: impl Into<FeedId>, fps: u32, opener: F) -> Self
    where
        B: CaptureBackend + 'static,
        F: FnOnce() -> Result<B> + Send + 'static,
    {
        let id = id.into();
        let shared = Arc::new(FeedShared {
            latest: LatestFrame::new(),
            status: AtomicU8::new(encode_status(ConnectionStatus::Connecting)),
            running: AtomicBool::new(true),
        });
        let interval = Duration::from_secs_f64(1.0 / fps.max(1) as f64);

        let thread_shared = shared.clone();
        let thread_id = id.clone();
        let handle = thread::Builder::new()
            .name(format!("keymix-camera-{id}"))
            .spawn(move || capture_loop(thread_id, opener, interval, thread_shared));

        let handle = match handle {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Failed to start capture thread for {}: {}", id, e);
                shared.set_status(ConnectionStatus::Error);
                None
            }
        };

        Self {
            id,
            shared,
            handle: Mutex::new(handle),
            audio: Arc::new(LevelMeter::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Meter fed by the device's audio capture, if one is attached.
    pub fn audio_meter(&self) -> Arc<LevelMeter> {
        self.audio.clone()
    }

    /// Stops the capture thread and waits for it.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        let handle = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

fn capture_loop<B, F>(id: FeedId, opener: F, interval: Duration, shared: Arc<FeedShared>)
where
    B: CaptureBackend,
    F: FnOnce() -> Result<B>,
{
    let mut backend = match opener() {
        Ok(backend) => backend,
        Err(e) => {
            warn!("Camera {} failed to open: {}", id, e);
            shared.set_status(ConnectionStatus::Error);
            return;
        }
    };
    let (w, h) = backend.frame_size();
    info!("Camera {} opened at {}x{}", id, w, h);

    let epoch = Instant::now();
    let mut failures = 0u32;
    while shared.running.load(Ordering::Acquire) {
        let started = Instant::now();
        match backend.capture_frame() {
            Ok(mut frame) => {
                failures = 0;
                if frame.timestamp_us.is_none() {
                    frame.timestamp_us = Some(epoch.elapsed().as_micros() as u64);
                }
                shared.latest.publish(frame);
                shared.set_status(ConnectionStatus::Connected);
            }
            Err(e) => {
                failures += 1;
                debug!("Camera {} capture failed ({}): {}", id, failures, e);
                if failures == MAX_CAPTURE_FAILURES {
                    warn!("Camera {} disconnected after {} failures", id, failures);
                    shared.set_status(ConnectionStatus::Disconnected);
                }
            }
        }
        if let Some(rest) = interval.checked_sub(started.elapsed()) {
            thread::sleep(rest);
        }
    }
    debug!("Camera {} capture thread exiting", id);
}

impl FrameSource for CameraFeed {
    fn pull(&self) -> Option<VideoFrame> {
        self.shared.latest.take()
    }

    fn status(&self) -> ConnectionStatus {
        decode_status(self.shared.status.load(Ordering::Acquire))
    }

    fn audio_levels(&self) -> Option<AudioLevels> {
        self.audio.read()
    }
}

impl Drop for CameraFeed {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Rgb;
    use anyhow::anyhow;

    /// Backend producing `good` frames and then failing forever.
    struct ScriptedCapture {
        good: u32,
    }

    impl CaptureBackend for ScriptedCapture {
        fn list_devices() -> Result<Vec<CameraInfo>> {
            Ok(vec![CameraInfo {
                index: 0,
                name: "scripted".into(),
            }])
        }

        fn open(_: CaptureConfig) -> Result<Self> {
            Ok(Self { good: 2 })
        }

        fn capture_frame(&mut self) -> Result<VideoFrame> {
            if self.good == 0 {
                return Err(anyhow!("device unplugged"));
            }
            self.good -= 1;
            Ok(VideoFrame::solid(4, 4, Rgb::BLUE))
        }

        fn frame_size(&self) -> (u32, u32) {
            (4, 4)
        }
    }

    fn wait_for(feed: &CameraFeed, status: ConnectionStatus) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if feed.status() == status {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_feed_delivers_then_disconnects() {
        let feed = CameraFeed::open::<ScriptedCapture>("cam-1", CaptureConfig {
            fps: 200,
            ..Default::default()
        });
        assert!(wait_for(&feed, ConnectionStatus::Disconnected));
        let frame = feed.pull().expect("captured frame");
        assert!(frame.timestamp_us.is_some());
        // only one pending frame survives
        assert!(feed.pull().is_none());
        feed.stop();
    }

    #[test]
    fn test_feed_reports_tapped_audio() {
        let feed = CameraFeed::open::<ScriptedCapture>("cam-3", CaptureConfig::default());
        assert_eq!(feed.audio_levels(), None);
        feed.audio_meter().report_samples(&[0.25, -0.25]);
        let levels = feed.audio_levels().unwrap();
        assert!((levels.rms - 0.25).abs() < 1e-6);
        assert_eq!(levels.peak, 0.25);
        feed.stop();
    }

    #[test]
    fn test_open_failure_reports_error() {
        let feed = CameraFeed::spawn_with::<ScriptedCapture, _>("cam-2", 30, || Err(anyhow!("busy")));
        assert!(wait_for(&feed, ConnectionStatus::Error));
        assert!(feed.pull().is_none());
    }
}
