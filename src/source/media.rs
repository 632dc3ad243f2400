//! Media file playback.
//!
//! Still images are decoded once with `image`. Video files are decoded by a
//! background `ffmpeg` process piping raw RGBA; the player schedules those
//! frames against a `PlaybackClock` that follows the transport controls.

use super::{
    BusPlayback, ConnectionStatus, FrameSource, MediaDecoder, MediaRef, MediaTransport,
    PlaybackState,
};
use crate::audio::{AudioLevels, LevelMeter};
use crate::error::{Error, Result};
use crate::frame::{PixelFormat, VideoFrame};
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, info, warn};

const STILL_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "gif", "webp", "tif", "tiff"];
/// Decoded frames buffered ahead of playback.
const DECODE_QUEUE: usize = 5;
const MAX_RATE: f32 = 16.0;

/// Media time as a function of wall time.
///
/// `elapsed` is unwrapped: with looping on it keeps growing past the
/// duration, matching the timestamps the decoder assigns across loops.
#[derive(Debug, Clone, Copy)]
pub struct PlaybackClock {
    anchor_secs: f64,
    anchor_at: Instant,
    loop_base: f64,
    rate: f32,
    playing: bool,
    duration: f64,
    loop_enabled: bool,
}

fn sane_rate(rate: f32) -> f32 {
    if rate.is_finite() {
        rate.clamp(0.0, MAX_RATE)
    } else {
        1.0
    }
}

impl PlaybackClock {
    pub fn new(state: &PlaybackState, duration: f64, now: Instant) -> Self {
        let mut clock = Self {
            anchor_secs: 0.0,
            anchor_at: now,
            loop_base: 0.0,
            rate: sane_rate(state.rate),
            playing: state.playing,
            duration: duration.max(0.0),
            loop_enabled: state.loop_enabled,
        };
        clock.seek(state.start_secs, now);
        clock
    }

    pub fn elapsed(&self, now: Instant) -> f64 {
        if !self.playing {
            return self.anchor_secs;
        }
        let wall = now.saturating_duration_since(self.anchor_at).as_secs_f64();
        self.anchor_secs + wall * self.rate as f64
    }

    /// Position inside the file, in seconds.
    pub fn position(&self, now: Instant) -> f64 {
        let t = self.elapsed(now);
        if self.duration <= 0.0 {
            return t.max(0.0);
        }
        if self.loop_enabled {
            t.rem_euclid(self.duration)
        } else {
            (t - self.loop_base).clamp(0.0, self.duration)
        }
    }

    pub fn at_end(&self, now: Instant) -> bool {
        !self.loop_enabled
            && self.duration > 0.0
            && self.elapsed(now) - self.loop_base >= self.duration
    }

    pub fn is_playing(&self, now: Instant) -> bool {
        self.playing && !self.at_end(now)
    }

    pub fn rate(&self) -> f32 {
        self.rate
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn loop_enabled(&self) -> bool {
        self.loop_enabled
    }

    fn rebase(&mut self, now: Instant) {
        self.anchor_secs = self.elapsed(now);
        self.anchor_at = now;
    }

    pub fn play(&mut self, now: Instant) {
        self.rebase(now);
        self.playing = true;
    }

    pub fn pause(&mut self, now: Instant) {
        self.rebase(now);
        self.playing = false;
    }

    pub fn seek(&mut self, secs: f64, now: Instant) {
        let secs = if secs.is_finite() { secs.max(0.0) } else { 0.0 };
        self.anchor_secs = if self.duration > 0.0 {
            secs.min(self.duration)
        } else {
            secs
        };
        self.anchor_at = now;
        self.loop_base = 0.0;
    }

    pub fn set_rate(&mut self, rate: f32, now: Instant) {
        self.rebase(now);
        self.rate = sane_rate(rate);
    }

    pub fn set_loop(&mut self, enabled: bool, now: Instant) {
        self.rebase(now);
        if self.loop_enabled && !enabled && self.duration > 0.0 {
            // finish the current pass, then stop
            self.loop_base = (self.anchor_secs / self.duration).floor() * self.duration;
        }
        self.loop_enabled = enabled;
    }
}

/// A decoded RGBA frame tagged with the seek generation it belongs to.
struct DecodedFrame {
    generation: u64,
    timestamp: f64,
    data: Vec<u8>,
}

/// Picks the newest frame that is due, holding back the first one that is
/// still in the future.
#[derive(Default)]
struct FrameScheduler {
    next: Option<DecodedFrame>,
}

impl FrameScheduler {
    fn advance(
        &mut self,
        position: f64,
        mut recv: impl FnMut() -> Option<DecodedFrame>,
    ) -> Option<DecodedFrame> {
        let mut due = None;
        if let Some(next) = self.next.take() {
            if next.timestamp > position {
                self.next = Some(next);
                return None;
            }
            due = Some(next);
        }
        while let Some(frame) = recv() {
            if frame.timestamp <= position {
                // lagging: skip ahead to the newest ready frame
                due = Some(frame);
            } else {
                self.next = Some(frame);
                break;
            }
        }
        due
    }

    fn reset(&mut self) {
        self.next = None;
    }
}

enum DecoderCommand {
    Seek { secs: f64, generation: u64 },
    SetLoop(bool),
}

/// Stream metadata from `ffprobe`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct VideoInfo {
    width: u32,
    height: u32,
    duration: f64,
    fps: f64,
}

fn parse_fps(s: &str) -> Option<f64> {
    match s.split_once('/') {
        Some((num, den)) => {
            let n: f64 = num.trim().parse().ok()?;
            let d: f64 = den.trim().parse().ok()?;
            (d != 0.0).then(|| n / d)
        }
        None => s.trim().parse().ok(),
    }
}

/// Parses `key=value` lines as printed by
/// `ffprobe -of default=noprint_wrappers=1`.
fn parse_probe(output: &str) -> Result<VideoInfo> {
    let fields: HashMap<&str, &str> = output
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim(), v.trim()))
        .collect();

    let dimension = |key: &str| -> Result<u32> {
        fields
            .get(key)
            .and_then(|v| v.parse().ok())
            .filter(|v| *v > 0)
            .ok_or_else(|| Error::source(format!("ffprobe reported no {key}: {output}")))
    };
    let width = dimension("width")?;
    let height = dimension("height")?;
    // duration is N/A for live streams
    let duration = fields
        .get("duration")
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d > 0.0)
        .unwrap_or(0.0);
    let fps = fields
        .get("r_frame_rate")
        .and_then(|v| parse_fps(v))
        .filter(|f| *f > 0.0)
        .unwrap_or(30.0);

    Ok(VideoInfo {
        width,
        height,
        duration,
        fps,
    })
}

fn probe(path: &Path) -> Result<VideoInfo> {
    let output = Command::new("ffprobe")
        .args(["-v", "error", "-select_streams", "v:0"])
        .args(["-show_entries", "stream=width,height,r_frame_rate:format=duration"])
        .args(["-of", "default=noprint_wrappers=1"])
        .arg(path)
        .output()
        .map_err(|e| Error::source(format!("Failed to run ffprobe: {e}")))?;

    if !output.status.success() {
        return Err(Error::source(format!(
            "ffprobe failed: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    parse_probe(&String::from_utf8_lossy(&output.stdout))
}

fn spawn_ffmpeg(path: &Path, start: f64) -> std::io::Result<Child> {
    let mut command = Command::new("ffmpeg");
    command.args(["-v", "error"]);
    if start > 0.0 {
        command.args(["-ss", &format!("{start:.3}")]);
    }
    command
        .arg("-i")
        .arg(path)
        .args(["-f", "image2pipe", "-pix_fmt", "rgba", "-vcodec", "rawvideo", "-"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
}

fn log_stderr(child: &mut Child) {
    let Some(mut stderr) = child.stderr.take() else {
        return;
    };
    thread::spawn(move || {
        let mut buf = [0u8; 1024];
        loop {
            match stderr.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    for line in String::from_utf8_lossy(&buf[..n]).lines() {
                        error!("ffmpeg: {}", line);
                    }
                }
            }
        }
    });
}

struct DecodeJob {
    path: PathBuf,
    info: VideoInfo,
    start: f64,
    loop_enabled: bool,
    failed: Arc<AtomicBool>,
}

fn stop_child(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

/// Background decode loop. Exits when the player drops either channel end.
fn decode_loop(job: DecodeJob, frames: SyncSender<DecodedFrame>, commands: Receiver<DecoderCommand>) {
    let frame_size = (job.info.width * job.info.height * 4) as usize;
    let frame_duration = 1.0 / job.info.fps;
    let mut start = job.start;
    let mut offset = job.start;
    let mut generation = 0u64;
    let mut loop_enabled = job.loop_enabled;

    loop {
        debug!("Starting ffmpeg at {:.3}s", start);
        let mut child = match spawn_ffmpeg(&job.path, start) {
            Ok(child) => child,
            Err(e) => {
                error!("Failed to spawn ffmpeg: {}", e);
                job.failed.store(true, Ordering::Release);
                return;
            }
        };
        log_stderr(&mut child);
        let Some(mut stdout) = child.stdout.take() else {
            stop_child(&mut child);
            job.failed.store(true, Ordering::Release);
            return;
        };

        let mut buffer = vec![0u8; frame_size];
        let mut count = 0u64;
        let seek_to = 'read: loop {
            loop {
                match commands.try_recv() {
                    Ok(DecoderCommand::Seek { secs, generation: g }) => {
                        generation = g;
                        break 'read Some(secs);
                    }
                    Ok(DecoderCommand::SetLoop(enabled)) => loop_enabled = enabled,
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        stop_child(&mut child);
                        return;
                    }
                }
            }

            if let Err(e) = stdout.read_exact(&mut buffer) {
                if e.kind() != std::io::ErrorKind::UnexpectedEof {
                    warn!("Error reading from ffmpeg: {}", e);
                }
                break None;
            }

            let decoded = DecodedFrame {
                generation,
                timestamp: offset + count as f64 * frame_duration,
                data: buffer.clone(),
            };
            count += 1;
            // Blocks while the queue is full; a paused player stalls decode here.
            if frames.send(decoded).is_err() {
                stop_child(&mut child);
                return;
            }
        };
        stop_child(&mut child);

        if let Some(secs) = seek_to {
            start = secs;
            offset = secs;
            continue;
        }
        if loop_enabled && count > 0 {
            info!("Video loop restarting");
            offset += count as f64 * frame_duration;
            start = 0.0;
            continue;
        }

        // End of file without looping: idle until told to seek or loop.
        loop {
            match commands.recv() {
                Ok(DecoderCommand::Seek { secs, generation: g }) => {
                    generation = g;
                    start = secs;
                    offset = secs;
                    break;
                }
                Ok(DecoderCommand::SetLoop(enabled)) => loop_enabled = enabled,
                Err(_) => return,
            }
        }
    }
}

struct VideoStream {
    info: VideoInfo,
    frames: Receiver<DecodedFrame>,
    commands: Sender<DecoderCommand>,
    failed: Arc<AtomicBool>,
    _decoder: JoinHandle<()>,
}

enum MediaKind {
    Still(VideoFrame),
    Video(VideoStream),
}

struct PlayerState {
    kind: MediaKind,
    clock: PlaybackClock,
    volume: f32,
    muted: bool,
    generation: u64,
    scheduler: FrameScheduler,
    still_pending: bool,
}

/// A media file exposed as a frame source with transport controls.
pub struct MediaPlayer {
    path: PathBuf,
    state: Mutex<PlayerState>,
    audio: Arc<LevelMeter>,
}

fn is_still(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| STILL_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

impl MediaPlayer {
    pub fn open(path: impl AsRef<Path>, playback: &PlaybackState) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(Error::FileNotFound { path });
        }
        let now = Instant::now();

        let (kind, duration) = if is_still(&path) {
            let image = image::open(&path)?.to_rgba8();
            let (w, h) = image.dimensions();
            info!("Image: {:?} {}x{}", path, w, h);
            let frame = VideoFrame::from_data(w, h, PixelFormat::Rgba, image.into_raw());
            (MediaKind::Still(frame), 0.0)
        } else {
            info!("Opening video via ffmpeg CLI: {:?}", path);
            let info = probe(&path)?;
            info!(
                "Video: {}x{}, {:.1}s, {:.1} fps",
                info.width, info.height, info.duration, info.fps
            );
            (MediaKind::Video(Self::start_decoder(&path, info, playback)?), info.duration)
        };

        Ok(Self {
            path,
            state: Mutex::new(PlayerState {
                kind,
                clock: PlaybackClock::new(playback, duration, now),
                volume: playback.volume.clamp(0.0, 1.0),
                muted: playback.muted,
                generation: 0,
                scheduler: FrameScheduler::default(),
                still_pending: true,
            }),
            audio: Arc::new(LevelMeter::new()),
        })
    }

    fn start_decoder(path: &Path, info: VideoInfo, playback: &PlaybackState) -> Result<VideoStream> {
        let (frame_tx, frame_rx) = mpsc::sync_channel(DECODE_QUEUE);
        let (command_tx, command_rx) = mpsc::channel();
        let failed = Arc::new(AtomicBool::new(false));
        let job = DecodeJob {
            path: path.to_path_buf(),
            info,
            start: playback.start_secs.max(0.0),
            loop_enabled: playback.loop_enabled,
            failed: failed.clone(),
        };
        let decoder = thread::Builder::new()
            .name("keymix-media-decode".into())
            .spawn(move || decode_loop(job, frame_tx, command_rx))?;
        Ok(VideoStream {
            info,
            frames: frame_rx,
            commands: command_tx,
            failed,
            _decoder: decoder,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Meter fed by the file's audio decoder, if one is attached. Readings
    /// are reported before the player's volume and mute.
    pub fn audio_meter(&self) -> Arc<LevelMeter> {
        self.audio.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PlayerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl PlayerState {
    fn seek(&mut self, secs: f64, now: Instant) {
        self.clock.seek(secs, now);
        self.still_pending = true;
        self.generation += 1;
        self.scheduler.reset();
        if let MediaKind::Video(stream) = &self.kind {
            let _ = stream.commands.send(DecoderCommand::Seek {
                secs: self.clock.position(now),
                generation: self.generation,
            });
            // Unblock a decoder waiting on a full queue; stale frames are
            // filtered by generation anyway.
            while stream.frames.try_recv().is_ok() {}
        }
    }
}

impl FrameSource for MediaPlayer {
    fn pull(&self) -> Option<VideoFrame> {
        let now = Instant::now();
        let mut guard = self.lock();
        let state = &mut *guard;
        match &state.kind {
            MediaKind::Still(frame) => {
                if !state.still_pending {
                    return None;
                }
                state.still_pending = false;
                Some(frame.clone())
            }
            MediaKind::Video(stream) => {
                let position = state.clock.elapsed(now);
                let generation = state.generation;
                let frames = &stream.frames;
                let decoded = state.scheduler.advance(position, || loop {
                    match frames.try_recv() {
                        Ok(frame) if frame.generation == generation => return Some(frame),
                        Ok(_) => continue,
                        Err(_) => return None,
                    }
                })?;
                let VideoInfo { width, height, .. } = stream.info;
                Some(
                    VideoFrame::from_data(width, height, PixelFormat::Rgba, decoded.data)
                        .with_timestamp((decoded.timestamp * 1_000_000.0) as u64),
                )
            }
        }
    }

    fn status(&self) -> ConnectionStatus {
        match &self.lock().kind {
            MediaKind::Video(stream) if stream.failed.load(Ordering::Acquire) => ConnectionStatus::Error,
            _ => ConnectionStatus::Connected,
        }
    }

    fn audio_levels(&self) -> Option<AudioLevels> {
        let raw = self.audio.read()?;
        let state = self.lock();
        Some(if state.muted {
            AudioLevels::SILENT
        } else {
            raw.scaled(state.volume)
        })
    }

    fn as_media(&self) -> Option<&dyn MediaTransport> {
        Some(self)
    }
}

impl MediaTransport for MediaPlayer {
    fn play(&self) {
        let now = Instant::now();
        let mut state = self.lock();
        if state.clock.at_end(now) {
            state.seek(0.0, now);
        }
        state.clock.play(now);
    }

    fn pause(&self) {
        self.lock().clock.pause(Instant::now());
    }

    fn seek(&self, secs: f64) {
        self.lock().seek(secs, Instant::now());
    }

    fn set_rate(&self, rate: f32) {
        self.lock().clock.set_rate(rate, Instant::now());
    }

    fn set_loop(&self, enabled: bool) {
        let mut state = self.lock();
        state.clock.set_loop(enabled, Instant::now());
        if let MediaKind::Video(stream) = &state.kind {
            let _ = stream.commands.send(DecoderCommand::SetLoop(enabled));
        }
    }

    fn set_volume(&self, volume: f32) {
        if volume.is_finite() {
            self.lock().volume = volume.clamp(0.0, 1.0);
        }
    }

    fn set_muted(&self, muted: bool) {
        self.lock().muted = muted;
    }

    fn playback(&self) -> BusPlayback {
        let now = Instant::now();
        let state = self.lock();
        BusPlayback {
            is_playing: state.clock.is_playing(now),
            current_time: state.clock.position(now),
            duration: state.clock.duration(),
            rate: state.clock.rate(),
            volume: state.volume,
            muted: state.muted,
            loop_enabled: state.clock.loop_enabled(),
        }
    }
}

/// `MediaDecoder` backed by `MediaPlayer`.
#[derive(Debug, Default, Clone, Copy)]
pub struct FfmpegDecoder;

impl MediaDecoder for FfmpegDecoder {
    fn open(&self, file: &MediaRef, playback: &PlaybackState) -> Result<Arc<dyn FrameSource>> {
        Ok(Arc::new(MediaPlayer::open(&file.path, playback)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn frame_at(timestamp: f64) -> DecodedFrame {
        DecodedFrame {
            generation: 0,
            timestamp,
            data: Vec::new(),
        }
    }

    #[test]
    fn test_clock_follows_rate_and_pause() {
        let t0 = Instant::now();
        let mut clock = PlaybackClock::new(&PlaybackState::default(), 10.0, t0);
        let t1 = t0 + Duration::from_secs(2);
        assert!((clock.position(t1) - 2.0).abs() < 1e-9);

        clock.set_rate(2.0, t1);
        let t2 = t1 + Duration::from_secs(1);
        assert!((clock.position(t2) - 4.0).abs() < 1e-9);

        clock.pause(t2);
        assert!((clock.position(t2 + Duration::from_secs(5)) - 4.0).abs() < 1e-9);
        assert!(!clock.is_playing(t2));
    }

    #[test]
    fn test_clock_loops_and_stops() {
        let t0 = Instant::now();
        let mut clock = PlaybackClock::new(&PlaybackState::default(), 4.0, t0);
        let t1 = t0 + Duration::from_secs(5);
        assert!((clock.position(t1) - 1.0).abs() < 1e-9);
        assert!((clock.elapsed(t1) - 5.0).abs() < 1e-9);

        // finishes the second pass, then holds at the end
        clock.set_loop(false, t1);
        let t2 = t1 + Duration::from_secs(10);
        assert_eq!(clock.position(t2), 4.0);
        assert!(clock.at_end(t2));
        assert!(!clock.is_playing(t2));
    }

    #[test]
    fn test_clock_seek_clamps() {
        let t0 = Instant::now();
        let state = PlaybackState {
            playing: false,
            loop_enabled: false,
            ..Default::default()
        };
        let mut clock = PlaybackClock::new(&state, 3.0, t0);
        clock.seek(7.5, t0);
        assert_eq!(clock.position(t0), 3.0);
        clock.seek(f64::NAN, t0);
        assert_eq!(clock.position(t0), 0.0);
        clock.set_rate(-1.0, t0);
        assert_eq!(clock.rate(), 0.0);
    }

    #[test]
    fn test_scheduler_holds_future_frames() {
        let mut queue: Vec<_> = [0.0, 0.1, 0.2, 0.3].into_iter().map(frame_at).collect();
        queue.reverse();
        let mut scheduler = FrameScheduler::default();

        let due = scheduler.advance(0.15, || queue.pop()).unwrap();
        assert_eq!(due.timestamp, 0.1);
        assert!(scheduler.advance(0.15, || queue.pop()).is_none());

        let due = scheduler.advance(0.5, || queue.pop()).unwrap();
        assert_eq!(due.timestamp, 0.3);
    }

    #[test]
    fn test_parse_probe() {
        let out = "width=1280\nheight=720\nr_frame_rate=30000/1001\nduration=12.5\n";
        let info = parse_probe(out).unwrap();
        assert_eq!((info.width, info.height), (1280, 720));
        assert!((info.fps - 29.97).abs() < 0.01);
        assert_eq!(info.duration, 12.5);

        let live = parse_probe("width=640\nheight=480\nr_frame_rate=0/0\nduration=N/A\n").unwrap();
        assert_eq!(live.fps, 30.0);
        assert_eq!(live.duration, 0.0);

        assert!(parse_probe("r_frame_rate=25/1").is_err());
    }

    #[test]
    fn test_still_image_is_delivered_once_and_after_seek() {
        let path = std::env::temp_dir().join(format!("keymix-still-{}.png", uuid::Uuid::new_v4()));
        image::RgbaImage::from_pixel(3, 2, image::Rgba([10, 20, 30, 255]))
            .save(&path)
            .unwrap();

        let player = MediaPlayer::open(&path, &PlaybackState::default()).unwrap();
        let frame = player.pull().unwrap();
        assert_eq!((frame.width, frame.height), (3, 2));
        assert_eq!(frame.pixel(2, 1), Some([10, 20, 30, 255]));
        assert!(player.pull().is_none());

        player.seek(0.0);
        assert!(player.pull().is_some());
        assert_eq!(player.status(), ConnectionStatus::Connected);
        assert_eq!(player.playback().duration, 0.0);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_audio_levels_follow_volume_and_mute() {
        let path = std::env::temp_dir().join(format!("keymix-meter-{}.png", uuid::Uuid::new_v4()));
        image::RgbaImage::from_pixel(2, 2, image::Rgba([0, 0, 0, 255]))
            .save(&path)
            .unwrap();
        let player = MediaPlayer::open(&path, &PlaybackState::default()).unwrap();
        assert_eq!(player.audio_levels(), None);

        player.audio_meter().report(AudioLevels::new(0.4, 0.8));
        player.set_volume(0.5);
        assert_eq!(player.audio_levels(), Some(AudioLevels::new(0.2, 0.4)));
        player.set_muted(true);
        assert_eq!(player.audio_levels(), Some(AudioLevels::SILENT));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_missing_file() {
        let err = MediaPlayer::open("/definitely/not/here.mp4", &PlaybackState::default())
            .err()
            .unwrap();
        assert!(matches!(err, Error::FileNotFound { .. }));
    }
}
