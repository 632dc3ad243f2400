//! Chroma-key processing stage.
//!
//! A `ChromaKeyProcessor` owns one `KeyBackend` (GPU or CPU) and turns the
//! backend's asynchronous completion into a bounded, synchronous call: the
//! caller gets a keyed frame, the previous good frame, or the input back,
//! and never waits longer than the configured timeout. At most one job per
//! processor is in flight; a job that outlives its wait is polled on later
//! calls instead of being stacked behind new ones.

mod cpu;
mod gpu;
pub mod kernel;

pub use cpu::CpuKeyer;
pub use gpu::{validate_kernel, GpuKeyer, KEY_KERNEL_WGSL};

use crate::error::Result;
use crate::frame::{Rgb, VideoFrame};
use crate::gpu::GpuContext;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default bound on how long a frame may wait for the keyer.
pub const DEFAULT_KEY_TIMEOUT: Duration = Duration::from_millis(100);

/// Key parameters for one layer. Copied into every processing call, so the
/// control thread replaces the whole value instead of editing it in place.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChromaKeySettings {
    pub enabled: bool,
    pub key_color: Rgb,
    /// Similarity threshold in [0, 1]
    pub strength: f32,
    /// Width of the alpha ramp in [0, 1]
    pub softness: f32,
    /// Weight of RGB distance against chroma distance in [0, 1]
    pub balance: f32,
    /// Offset added to the threshold; negative grows the foreground
    pub matte_shift: f32,
    pub edge_softness: f32,
    pub black_clip: f32,
    pub white_clip: f32,
    pub spill_strength: f32,
    pub spill_desaturation: f32,
    pub despill_bias: f32,
    pub light_wrap: f32,
    pub view_matte_only: bool,
}

impl Default for ChromaKeySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            key_color: Rgb::GREEN,
            strength: 0.4,
            softness: 0.1,
            balance: 0.2,
            matte_shift: 0.0,
            edge_softness: 0.0,
            black_clip: 0.0,
            white_clip: 1.0,
            spill_strength: 0.5,
            spill_desaturation: 0.3,
            despill_bias: 0.0,
            light_wrap: 0.0,
            view_matte_only: false,
        }
    }
}

impl ChromaKeySettings {
    /// Green-screen key with default parameters, enabled.
    pub fn green() -> Self {
        Self {
            enabled: true,
            ..Default::default()
        }
    }

    /// Copy with every numeric field forced into its documented range.
    /// Non-finite values fall back to the default.
    pub fn sanitized(&self) -> Self {
        let d = Self::default();
        let fix = |v: f32, fallback: f32, lo: f32, hi: f32| {
            if v.is_finite() {
                v.clamp(lo, hi)
            } else {
                fallback
            }
        };
        Self {
            enabled: self.enabled,
            key_color: self.key_color,
            strength: fix(self.strength, d.strength, 0.0, 1.0),
            softness: fix(self.softness, d.softness, 0.0, 1.0),
            balance: fix(self.balance, d.balance, 0.0, 1.0),
            matte_shift: fix(self.matte_shift, d.matte_shift, -1.0, 1.0),
            edge_softness: fix(self.edge_softness, d.edge_softness, 0.0, 1.0),
            black_clip: fix(self.black_clip, d.black_clip, 0.0, 1.0),
            white_clip: fix(self.white_clip, d.white_clip, 0.0, 1.0),
            spill_strength: fix(self.spill_strength, d.spill_strength, 0.0, 1.0),
            spill_desaturation: fix(self.spill_desaturation, d.spill_desaturation, 0.0, 1.0),
            despill_bias: fix(self.despill_bias, d.despill_bias, -1.0, 1.0),
            light_wrap: fix(self.light_wrap, d.light_wrap, 0.0, 1.0),
            view_matte_only: self.view_matte_only,
        }
    }
}

/// A dispatched keying job.
pub trait Completion: Send {
    /// Blocks for at most `timeout`. `None` means the job has not finished
    /// yet and may be waited on again. Not called again after a result.
    fn wait(&mut self, timeout: Duration) -> Option<Result<VideoFrame>>;
}

/// Something that can run the key kernel asynchronously.
pub trait KeyBackend: Send {
    fn name(&self) -> &'static str;

    /// Submits `frame` for keying and returns without waiting for it.
    fn dispatch(
        &mut self,
        frame: &VideoFrame,
        settings: &ChromaKeySettings,
    ) -> Result<Box<dyn Completion>>;
}

/// Builds a fresh backend for each processor.
pub type KeyerFactory = Arc<dyn Fn() -> Result<Box<dyn KeyBackend>> + Send + Sync>;

/// Factory for compute-shader keyers sharing one device.
pub fn gpu_keyer_factory(ctx: GpuContext) -> KeyerFactory {
    Arc::new(move || Ok(Box::new(GpuKeyer::new(ctx.clone())?) as Box<dyn KeyBackend>))
}

/// Factory for CPU keyers, one worker thread each.
pub fn cpu_keyer_factory() -> KeyerFactory {
    Arc::new(|| Ok(Box::new(CpuKeyer::new()) as Box<dyn KeyBackend>))
}

/// Completion fed through a channel by a worker thread.
pub struct ChannelCompletion {
    rx: Receiver<Result<VideoFrame>>,
}

impl ChannelCompletion {
    pub fn pair() -> (Sender<Result<VideoFrame>>, Self) {
        let (tx, rx) = mpsc::channel();
        (tx, Self { rx })
    }
}

impl Completion for ChannelCompletion {
    fn wait(&mut self, timeout: Duration) -> Option<Result<VideoFrame>> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(crate::error::Error::gpu(
                "keying worker dropped the job",
            ))),
        }
    }
}

/// Counters shared between processors and the engine's stats.
#[derive(Debug, Default)]
pub struct KeyingStats {
    processed: AtomicU64,
    timeouts: AtomicU64,
    failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyingCounters {
    pub processed: u64,
    pub timeouts: u64,
    pub failures: u64,
}

impl KeyingStats {
    pub fn snapshot(&self) -> KeyingCounters {
        KeyingCounters {
            processed: self.processed.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Per-layer keyer with a bounded wait and stale-frame fallback.
pub struct ChromaKeyProcessor {
    backend: Option<Box<dyn KeyBackend>>,
    timeout: Duration,
    last_good: Option<VideoFrame>,
    /// Job that outlived its wait
    pending: Option<Box<dyn Completion>>,
    stats: Arc<KeyingStats>,
}

impl ChromaKeyProcessor {
    /// Takes the result of building a backend. A failed build leaves the
    /// processor in passthrough for its whole lifetime.
    pub fn new(backend: Result<Box<dyn KeyBackend>>, timeout: Duration) -> Self {
        let backend = match backend {
            Ok(backend) => {
                debug!("Chroma key processor using {} backend", backend.name());
                Some(backend)
            }
            Err(e) => {
                warn!("Chroma keying unavailable, falling back to passthrough: {}", e);
                None
            }
        };
        Self {
            backend,
            timeout,
            last_good: None,
            pending: None,
            stats: Arc::new(KeyingStats::default()),
        }
    }

    pub fn passthrough() -> Self {
        Self {
            backend: None,
            timeout: DEFAULT_KEY_TIMEOUT,
            last_good: None,
            pending: None,
            stats: Arc::new(KeyingStats::default()),
        }
    }

    pub fn with_stats(mut self, stats: Arc<KeyingStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn stats(&self) -> KeyingCounters {
        self.stats.snapshot()
    }

    pub fn is_keying_available(&self) -> bool {
        self.backend.is_some()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Keys `frame` with a snapshot of `settings`.
    ///
    /// Disabled settings, an unavailable backend, or a malformed frame return
    /// the input unchanged. A timeout, a failed dispatch, or a previous job
    /// still running returns the last successfully keyed frame, or the input
    /// if there is none yet.
    pub fn process(&mut self, frame: &VideoFrame, settings: ChromaKeySettings) -> VideoFrame {
        if !settings.enabled {
            return frame.clone();
        }
        if self.backend.is_none() {
            return frame.clone();
        }
        if let Err(e) = frame.validate() {
            debug!("Skipping key for malformed frame: {}", e);
            return frame.clone();
        }

        if let Some(pending) = self.pending.as_mut() {
            match pending.wait(Duration::ZERO) {
                None => {
                    self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                    debug!("Previous key job still running, reusing last frame");
                    return self.fallback(frame);
                }
                Some(Ok(late)) => {
                    self.pending = None;
                    self.last_good = Some(late);
                }
                Some(Err(e)) => {
                    self.pending = None;
                    debug!("Late key job failed: {}", e);
                }
            }
        }

        let Some(backend) = self.backend.as_mut() else {
            return frame.clone();
        };
        let start = Instant::now();
        let mut completion = match backend.dispatch(frame, &settings) {
            Ok(completion) => completion,
            Err(e) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                debug!("Key dispatch failed: {}", e);
                return self.fallback(frame);
            }
        };

        match completion.wait(self.timeout) {
            Some(Ok(keyed)) => {
                self.stats.processed.fetch_add(1, Ordering::Relaxed);
                debug!("  [Perf] Chroma key: {:?}", start.elapsed());
                self.last_good = Some(keyed.clone());
                keyed
            }
            Some(Err(e)) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                debug!("Key job failed: {}", e);
                self.fallback(frame)
            }
            None => {
                self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                debug!("Key job exceeded {:?}, reusing last frame", self.timeout);
                self.pending = Some(completion);
                self.fallback(frame)
            }
        }
    }

    fn fallback(&self, frame: &VideoFrame) -> VideoFrame {
        self.last_good.clone().unwrap_or_else(|| frame.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::frame::PixelFormat;
    use std::sync::Mutex;

    /// Backend whose jobs never complete.
    struct StalledBackend {
        held: Arc<Mutex<Vec<Sender<Result<VideoFrame>>>>>,
    }

    impl KeyBackend for StalledBackend {
        fn name(&self) -> &'static str {
            "stalled"
        }

        fn dispatch(&mut self, _: &VideoFrame, _: &ChromaKeySettings) -> Result<Box<dyn Completion>> {
            let (tx, completion) = ChannelCompletion::pair();
            self.held.lock().unwrap().push(tx);
            Ok(Box::new(completion))
        }
    }

    /// Backend that completes the first `n` jobs and stalls afterwards.
    struct FlakyBackend {
        remaining: usize,
        held: Vec<Sender<Result<VideoFrame>>>,
    }

    impl KeyBackend for FlakyBackend {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn dispatch(&mut self, frame: &VideoFrame, _: &ChromaKeySettings) -> Result<Box<dyn Completion>> {
            let (tx, completion) = ChannelCompletion::pair();
            if self.remaining > 0 {
                self.remaining -= 1;
                let mut keyed = frame.clone();
                keyed.data.iter_mut().for_each(|b| *b = 7);
                tx.send(Ok(keyed)).unwrap();
            } else {
                self.held.push(tx);
            }
            Ok(Box::new(completion))
        }
    }

    fn test_frame(seed: u8) -> VideoFrame {
        let data = (0..64u32).map(|i| (i as u8).wrapping_mul(seed)).collect();
        VideoFrame::from_data(4, 4, PixelFormat::Rgba, data).with_timestamp(seed as u64)
    }

    #[test]
    fn test_disabled_is_bitwise_identity() {
        let mut processor = ChromaKeyProcessor::new(Ok(Box::new(CpuKeyer::new())), DEFAULT_KEY_TIMEOUT);
        for seed in [1u8, 3, 77, 255] {
            let frame = test_frame(seed);
            let out = processor.process(&frame, ChromaKeySettings::default());
            assert_eq!(out, frame);
        }
        assert_eq!(processor.stats().processed, 0);
    }

    #[test]
    fn test_disabled_never_dispatches() {
        let held = Arc::new(Mutex::new(Vec::new()));
        let mut processor = ChromaKeyProcessor::new(
            Ok(Box::new(StalledBackend { held: held.clone() })),
            DEFAULT_KEY_TIMEOUT,
        );
        processor.process(&test_frame(9), ChromaKeySettings::default());
        assert!(held.lock().unwrap().is_empty());
    }

    #[test]
    fn test_timeout_returns_input_on_first_call_within_bound() {
        let held = Arc::new(Mutex::new(Vec::new()));
        let timeout = Duration::from_millis(40);
        let mut processor = ChromaKeyProcessor::new(Ok(Box::new(StalledBackend { held })), timeout);
        let frame = test_frame(5);

        let start = Instant::now();
        let out = processor.process(&frame, ChromaKeySettings::green());
        let elapsed = start.elapsed();

        assert_eq!(out, frame);
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_millis(200), "took {elapsed:?}");
        assert_eq!(processor.stats().timeouts, 1);
    }

    #[test]
    fn test_timeout_reuses_previous_good_frame() {
        let backend = FlakyBackend {
            remaining: 1,
            held: Vec::new(),
        };
        let mut processor = ChromaKeyProcessor::new(Ok(Box::new(backend)), Duration::from_millis(20));
        let first = processor.process(&test_frame(2), ChromaKeySettings::green());
        assert!(first.data.iter().all(|&b| b == 7));

        let second = processor.process(&test_frame(3), ChromaKeySettings::green());
        assert_eq!(second, first);
        let stats = processor.stats();
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.timeouts, 1);
    }

    #[test]
    fn test_slow_backend_keeps_one_job_in_flight() {
        let held = Arc::new(Mutex::new(Vec::new()));
        let timeout = Duration::from_millis(20);
        let mut processor =
            ChromaKeyProcessor::new(Ok(Box::new(StalledBackend { held: held.clone() })), timeout);

        let start = Instant::now();
        for seed in 0..20u8 {
            processor.process(&test_frame(seed), ChromaKeySettings::green());
        }
        // only the first call waits; the rest see the job still running
        assert!(start.elapsed() < timeout + Duration::from_millis(200), "{:?}", start.elapsed());
        assert_eq!(held.lock().unwrap().len(), 1);
        assert_eq!(processor.stats().timeouts, 20);
    }

    #[test]
    fn test_late_result_is_used_and_next_job_dispatched() {
        let held = Arc::new(Mutex::new(Vec::new()));
        let mut processor = ChromaKeyProcessor::new(
            Ok(Box::new(StalledBackend { held: held.clone() })),
            Duration::from_millis(10),
        );
        let input = test_frame(4);
        assert_eq!(processor.process(&input, ChromaKeySettings::green()), input);

        let mut late = input.clone();
        late.data.iter_mut().for_each(|b| *b = 9);
        held.lock().unwrap()[0].send(Ok(late.clone())).unwrap();

        let out = processor.process(&test_frame(6), ChromaKeySettings::green());
        assert_eq!(out, late);
        assert_eq!(held.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_failed_construction_is_permanent_passthrough() {
        let mut processor = ChromaKeyProcessor::new(
            Err(Error::gpu("kernel did not compile")),
            DEFAULT_KEY_TIMEOUT,
        );
        assert!(!processor.is_keying_available());
        let frame = VideoFrame::solid(2, 2, Rgb::GREEN);
        for _ in 0..3 {
            assert_eq!(processor.process(&frame, ChromaKeySettings::green()), frame);
        }
        assert_eq!(processor.stats(), KeyingCounters::default());
    }

    #[test]
    fn test_malformed_frame_passes_through() {
        let mut processor = ChromaKeyProcessor::new(Ok(Box::new(CpuKeyer::new())), DEFAULT_KEY_TIMEOUT);
        let broken = VideoFrame::from_data(8, 8, PixelFormat::Rgba, vec![1, 2, 3]);
        assert_eq!(processor.process(&broken, ChromaKeySettings::green()), broken);
    }

    #[test]
    fn test_cpu_backend_keys_green() {
        let mut processor = ChromaKeyProcessor::new(Ok(Box::new(CpuKeyer::new())), DEFAULT_KEY_TIMEOUT);
        let out = processor.process(&VideoFrame::solid(3, 3, Rgb::GREEN), ChromaKeySettings::green());
        assert!(out.premultiplied);
        assert_eq!(out.pixel(1, 1), Some([0, 0, 0, 0]));
        assert_eq!(processor.stats().processed, 1);
    }

    #[test]
    fn test_sanitized_clamps_and_repairs() {
        let settings = ChromaKeySettings {
            strength: 4.0,
            softness: f32::NAN,
            white_clip: -1.0,
            ..Default::default()
        };
        let s = settings.sanitized();
        assert_eq!(s.strength, 1.0);
        assert_eq!(s.softness, ChromaKeySettings::default().softness);
        assert_eq!(s.white_clip, 0.0);
    }
}
