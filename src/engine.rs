//! Engine: the control surface and observables of the switcher.
//!
//! The control thread edits layers, buses and settings; `tick()` (manual or
//! from a `FrameClock`) pulls every referenced source once, applies bus
//! effects, composites and publishes. Ticks are serialized by a `TickGate`
//! and never queue.

use crate::audio::{self, AudioLevels};
use crate::bus::{BusId, BusState, Switcher, SwitcherSnapshot, TransitionPhase, TransportCommand};
use crate::clock::{FrameClock, TickGate};
use crate::compositor::{FrameLookup, LayerCompositor, SourceFrame};
use crate::config::EngineConfig;
use crate::effects::{apply_chain, EffectType};
use crate::frame::VideoFrame;
use crate::keying::{KeyerFactory, KeyingCounters};
use crate::layer::{Layer, LayerId, LayerStack};
use crate::output::FrameSink;
use crate::source::{BusPlayback, ConnectionStatus, Source, SourceKey, SourceRegistry};
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Bound on recomposites when cuts keep landing mid-tick.
const MAX_COMPOSITE_ATTEMPTS: usize = 3;

/// Sent to subscribers after each published frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameReady {
    /// Count of frames published so far, starting at 1
    pub sequence: u64,
    pub transitioning: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub ticks: u64,
    /// Ticks rejected because a composite was still in flight
    pub skipped_ticks: u64,
    pub malformed_frames: u64,
    pub frames_published: u64,
    /// Notifications not delivered because the subscriber was behind
    pub notifications_dropped: u64,
    /// Composites thrown away because Program was cut while they rendered
    pub stale_composites: u64,
    pub placeholders_painted: u64,
    pub keying: KeyingCounters,
}

#[derive(Debug, Default)]
struct Counters {
    ticks: AtomicU64,
    skipped_ticks: AtomicU64,
    malformed_frames: AtomicU64,
    frames_published: AtomicU64,
    notifications_dropped: AtomicU64,
    stale_composites: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
struct LiveSettings {
    key_timeout: Duration,
    default_transition_secs: f64,
    tick_interval: Duration,
}

struct EngineInner {
    layers: LayerStack,
    switcher: Mutex<Switcher>,
    registry: SourceRegistry,
    compositor: Mutex<LayerCompositor>,
    settings: RwLock<LiveSettings>,
    gate: TickGate,
    /// Newest valid frame per source, kept while the source is referenced
    held: Mutex<HashMap<SourceKey, Arc<VideoFrame>>>,
    levels: Mutex<HashMap<SourceKey, AudioLevels>>,
    program_frame: RwLock<Option<Arc<VideoFrame>>>,
    preview_frame: RwLock<Option<Arc<VideoFrame>>>,
    subscribers: Mutex<Vec<SyncSender<FrameReady>>>,
    sinks: Mutex<Vec<Box<dyn FrameSink>>>,
    counters: Counters,
    compositor_stats: Mutex<(KeyingCounters, u64)>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Shared handle to one switching engine.
#[derive(Clone)]
pub struct Engine(Arc<EngineInner>);

/// Transport controls for one bus's media source.
pub struct BusTransport<'a> {
    engine: &'a Engine,
    bus: BusId,
}

impl BusTransport<'_> {
    pub fn play(&self) -> bool {
        self.engine.transport(self.bus, TransportCommand::Play)
    }

    pub fn pause(&self) -> bool {
        self.engine.transport(self.bus, TransportCommand::Pause)
    }

    pub fn seek(&self, secs: f64) -> bool {
        self.engine.transport(self.bus, TransportCommand::Seek(secs))
    }

    pub fn set_rate(&self, rate: f32) -> bool {
        self.engine.transport(self.bus, TransportCommand::SetRate(rate))
    }

    pub fn set_loop(&self, enabled: bool) -> bool {
        self.engine.transport(self.bus, TransportCommand::SetLoop(enabled))
    }

    pub fn set_volume(&self, volume: f32) -> bool {
        self.engine.transport(self.bus, TransportCommand::SetVolume(volume))
    }

    pub fn set_muted(&self, muted: bool) -> bool {
        self.engine.transport(self.bus, TransportCommand::SetMuted(muted))
    }
}

impl Engine {
    /// `keyer` builds the keying backend for each keyed layer; `None` leaves
    /// keyed layers unkeyed.
    pub fn new(config: &EngineConfig, registry: SourceRegistry, keyer: Option<KeyerFactory>) -> Self {
        let fill = config.placeholder_rgb();
        let mut compositor = LayerCompositor::new(config.width, config.height, keyer, fill);
        compositor.set_key_timeout(config.keying_timeout());

        let mut switcher = Switcher::new();
        switcher.set_clear_preview_on_take(config.clear_preview_on_take);

        info!(
            "Engine ready: {}x{} canvas at {} fps",
            config.width, config.height, config.fps
        );
        Self(Arc::new(EngineInner {
            layers: LayerStack::new(),
            switcher: Mutex::new(switcher),
            registry,
            compositor: Mutex::new(compositor),
            settings: RwLock::new(LiveSettings {
                key_timeout: config.keying_timeout(),
                default_transition_secs: config.default_transition_secs,
                tick_interval: config.tick_interval(),
            }),
            gate: TickGate::new(),
            held: Mutex::new(HashMap::new()),
            levels: Mutex::new(HashMap::new()),
            program_frame: RwLock::new(None),
            preview_frame: RwLock::new(None),
            subscribers: Mutex::new(Vec::new()),
            sinks: Mutex::new(Vec::new()),
            counters: Counters::default(),
            compositor_stats: Mutex::new((KeyingCounters::default(), 0)),
        }))
    }

    fn switcher(&self) -> MutexGuard<'_, Switcher> {
        lock(&self.0.switcher)
    }

    fn settings(&self) -> LiveSettings {
        *self.0.settings.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Applies the fields that can change while running. Canvas size and
    /// frame rate need a restart.
    pub fn apply_config(&self, config: &EngineConfig) {
        {
            let mut settings = self.0.settings.write().unwrap_or_else(|e| e.into_inner());
            settings.key_timeout = config.keying_timeout();
            settings.default_transition_secs = config.default_transition_secs;
        }
        self.switcher()
            .set_clear_preview_on_take(config.clear_preview_on_take);
        info!(
            "Applied config: key timeout {:?}, transition {:.2}s, clear preview on take {}",
            config.keying_timeout(),
            config.default_transition_secs,
            config.clear_preview_on_take
        );
    }

    // Layers

    pub fn add_layer(&self, layer: Layer) -> LayerId {
        let id = self.0.layers.add(layer);
        debug!("Added layer {}", id);
        id
    }

    /// Replaces the layer with the same id. False if it does not exist.
    pub fn update_layer(&self, layer: Layer) -> bool {
        self.0.layers.update(layer)
    }

    pub fn remove_layer(&self, id: LayerId) -> bool {
        let removed = self.0.layers.remove(id);
        if removed {
            debug!("Removed layer {}", id);
        }
        removed
    }

    /// Moves a layer and renumbers z-indices to 0..n.
    pub fn reorder_layers(&self, from: usize, to: usize) -> bool {
        self.0.layers.reorder(from, to)
    }

    pub fn layers(&self) -> Vec<Layer> {
        self.0.layers.snapshot()
    }

    pub fn layer(&self, id: LayerId) -> Option<Layer> {
        self.0.layers.get(id)
    }

    // Buses

    pub fn load_to_preview(&self, source: Source) {
        self.switcher().load_to_preview(source);
    }

    pub fn load_to_program(&self, source: Source) {
        self.switcher().load_to_program(source);
    }

    pub fn take(&self) -> bool {
        self.switcher().take()
    }

    pub fn transition(&self, duration_secs: f64) -> bool {
        self.switcher().transition(duration_secs, Instant::now())
    }

    /// Auto transition with the configured default duration.
    pub fn auto(&self) -> bool {
        let secs = self.settings().default_transition_secs;
        self.transition(secs)
    }

    pub fn is_transitioning(&self) -> bool {
        self.switcher().is_transitioning()
    }

    pub fn bus_state(&self, bus: BusId) -> BusState {
        self.switcher().bus(bus).clone()
    }

    pub fn add_effect_to_preview(&self, effect_type: EffectType) {
        self.switcher().add_effect_to_preview(effect_type);
    }

    pub fn add_effect_to_program(&self, effect_type: EffectType) {
        self.switcher().add_effect_to_program(effect_type);
    }

    pub fn clear_preview_effects(&self) {
        self.switcher().clear_preview_effects();
    }

    pub fn clear_program_effects(&self) {
        self.switcher().clear_program_effects();
    }

    pub fn bus_transport(&self, bus: BusId) -> BusTransport<'_> {
        BusTransport { engine: self, bus }
    }

    /// Mirrors the command in the bus state and forwards it to the live
    /// media source. False if the bus is not showing media.
    fn transport(&self, bus: BusId, command: TransportCommand) -> bool {
        let source = {
            let mut switcher = self.switcher();
            if !switcher.mirror_transport(bus, command) {
                return false;
            }
            switcher.bus(bus).source.clone()
        };
        if let Some(live) = self.0.registry.resolve(&source) {
            if let Some(media) = live.as_media() {
                command.apply(media);
            }
        }
        debug!("{} transport: {:?}", bus, command);
        true
    }

    // Observables

    pub fn program_frame(&self) -> Option<Arc<VideoFrame>> {
        self.0
            .program_frame
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn preview_frame(&self) -> Option<Arc<VideoFrame>> {
        self.0
            .preview_frame
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Playback position and transport state, refreshed every tick.
    pub fn bus_playback(&self, bus: BusId) -> Option<BusPlayback> {
        self.switcher().bus(bus).playback
    }

    /// Meter levels of every layer with audio, after gain, mute and solo.
    pub fn layer_meters(&self) -> Vec<(LayerId, AudioLevels)> {
        let levels = lock(&self.0.levels);
        let pairs: Vec<(Layer, Option<AudioLevels>)> = self
            .layers()
            .into_iter()
            .map(|layer| {
                let level = layer.source.key().and_then(|key| levels.get(&key).copied());
                (layer, level)
            })
            .collect();
        audio::layer_meters(&pairs)
    }

    /// Channel that receives a `FrameReady` after every published frame.
    /// Holds at most one undelivered notification.
    pub fn subscribe(&self) -> Receiver<FrameReady> {
        let (tx, rx) = mpsc::sync_channel(1);
        lock(&self.0.subscribers).push(tx);
        rx
    }

    pub fn add_sink(&self, sink: Box<dyn FrameSink>) {
        lock(&self.0.sinks).push(sink);
    }

    pub fn stats(&self) -> EngineStats {
        let c = &self.0.counters;
        let (keying, placeholders_painted) = *lock(&self.0.compositor_stats);
        EngineStats {
            ticks: c.ticks.load(Ordering::Relaxed),
            skipped_ticks: c.skipped_ticks.load(Ordering::Relaxed),
            malformed_frames: c.malformed_frames.load(Ordering::Relaxed),
            frames_published: c.frames_published.load(Ordering::Relaxed),
            notifications_dropped: c.notifications_dropped.load(Ordering::Relaxed),
            stale_composites: c.stale_composites.load(Ordering::Relaxed),
            placeholders_painted,
            keying,
        }
    }

    /// Drives `tick()` from a frame clock at the configured rate. The engine
    /// stops ticking when the returned clock is stopped or dropped.
    pub fn start_clock(&self) -> FrameClock {
        let weak = Arc::downgrade(&self.0);
        let interval = self.settings().tick_interval;
        FrameClock::start(
            interval,
            Arc::new(move || {
                if let Some(inner) = weak.upgrade() {
                    Engine(inner).tick();
                }
            }),
        )
    }

    /// Runs one pull, composite and publish cycle. Returns false if another
    /// tick was still running.
    pub fn tick(&self) -> bool {
        let inner = &*self.0;
        let Some(_guard) = inner.gate.try_enter() else {
            inner.counters.skipped_ticks.fetch_add(1, Ordering::Relaxed);
            debug!("Tick skipped: previous composite still running");
            return false;
        };
        inner.counters.ticks.fetch_add(1, Ordering::Relaxed);

        let start = Instant::now();
        let mut snapshot = self.switcher().snapshot(start);
        let layers = inner.layers.snapshot();

        let mut sources: Vec<&Source> = vec![&snapshot.program.source, &snapshot.preview.source];
        if let Some(incoming) = &snapshot.incoming {
            sources.push(&incoming.source);
        }
        sources.extend(layers.iter().filter(|l| l.enabled).map(|l| &l.source));
        let frames = self.pull_sources(&sources);
        self.sync_bus_playback(&snapshot.preview.source, &snapshot.program.source);
        let pulled = start.elapsed();

        // A cut that lands while compositing makes the result stale. Redo it
        // from the new state when every source it needs was pulled already.
        for _ in 0..MAX_COMPOSITE_ATTEMPTS {
            let (program, preview) = self.compose(&snapshot, &layers, &frames);
            let mut switcher = self.switcher();
            if switcher.generation() == snapshot.generation {
                let transitioning = matches!(snapshot.phase, TransitionPhase::Transitioning { .. });
                let program = self.publish(Arc::new(program), Arc::new(preview), transitioning);
                drop(switcher);
                self.write_sinks(&program);
                debug!(
                    "  [Perf] Tick: pull {:?}, total {:?}",
                    pulled,
                    start.elapsed()
                );
                return true;
            }
            inner.counters.stale_composites.fetch_add(1, Ordering::Relaxed);
            let fresh = switcher.snapshot(Instant::now());
            drop(switcher);
            if !covers(&fresh, &frames) {
                break;
            }
            debug!("Program cut during composite, recompositing");
            snapshot = fresh;
        }
        debug!("Program cut during composite, frame dropped");
        true
    }

    fn compose(
        &self,
        snapshot: &SwitcherSnapshot,
        layers: &[Layer],
        frames: &FrameLookup,
    ) -> (VideoFrame, VideoFrame) {
        let inner = &*self.0;
        let program_base = bus_frame(&snapshot.program, frames);
        let preview_base = bus_frame(&snapshot.preview, frames);
        let settings = self.settings();

        let mut compositor = lock(&inner.compositor);
        compositor.set_key_timeout(settings.key_timeout);
        let program = match (&snapshot.phase, &snapshot.incoming) {
            (TransitionPhase::Transitioning { progress }, Some(incoming)) => {
                let incoming_base = bus_frame(incoming, frames);
                compositor.composite_transition(
                    program_base.as_deref(),
                    incoming_base.as_deref(),
                    *progress,
                    layers,
                    frames,
                )
            }
            _ => compositor.composite(program_base.as_deref(), layers, frames),
        };
        let preview = compositor.render_bus(preview_base.as_deref());
        *lock(&inner.compositor_stats) = (compositor.keying_stats(), compositor.placeholders_painted());
        (program, preview)
    }

    /// Pulls each distinct source once. Frames that fail validation are
    /// dropped and the previous frame of that source is kept.
    fn pull_sources(&self, sources: &[&Source]) -> FrameLookup {
        let inner = &*self.0;
        let mut lookup = FrameLookup::new();
        let mut levels = HashMap::new();
        let mut held = lock(&inner.held);

        for source in sources {
            let Some(key) = source.key() else {
                continue;
            };
            if lookup.contains_key(&key) {
                continue;
            }
            let entry = match inner.registry.resolve(source) {
                Some(live) => {
                    if let Some(frame) = live.pull() {
                        match frame.validate() {
                            Ok(()) => {
                                held.insert(key.clone(), Arc::new(frame));
                            }
                            Err(e) => {
                                inner.counters.malformed_frames.fetch_add(1, Ordering::Relaxed);
                                debug!("Dropped frame from {}: {}", source, e);
                            }
                        }
                    }
                    if let Some(level) = live.audio_levels() {
                        levels.insert(key.clone(), level);
                    }
                    let status = live.status();
                    let frame = match status {
                        ConnectionStatus::Connected | ConnectionStatus::Connecting => {
                            held.get(&key).cloned()
                        }
                        ConnectionStatus::Disconnected | ConnectionStatus::Error => None,
                    };
                    SourceFrame { frame, status }
                }
                None => {
                    held.remove(&key);
                    SourceFrame::missing(ConnectionStatus::Disconnected)
                }
            };
            lookup.insert(key, entry);
        }

        held.retain(|key, _| lookup.contains_key(key));
        drop(held);
        let keys: Vec<SourceKey> = lookup.keys().cloned().collect();
        inner.registry.retain_media(&keys);
        *lock(&inner.levels) = levels;
        lookup
    }

    fn sync_bus_playback(&self, preview: &Source, program: &Source) {
        for (bus, source) in [(BusId::Preview, preview), (BusId::Program, program)] {
            if !matches!(source, Source::Media { .. }) {
                continue;
            }
            let Some(live) = self.0.registry.resolve(source) else {
                continue;
            };
            if let Some(media) = live.as_media() {
                let playback = media.playback();
                let mut switcher = self.switcher();
                // the bus may have been reloaded since the snapshot
                if &switcher.bus(bus).source == source {
                    switcher.sync_playback(bus, playback);
                }
            }
        }
    }

    /// Stores the frames and notifies subscribers. Called with the switcher
    /// locked so no cut can land between the staleness check and this.
    fn publish(
        &self,
        program: Arc<VideoFrame>,
        preview: Arc<VideoFrame>,
        transitioning: bool,
    ) -> Arc<VideoFrame> {
        let inner = &*self.0;
        *inner.program_frame.write().unwrap_or_else(|e| e.into_inner()) = Some(program.clone());
        *inner.preview_frame.write().unwrap_or_else(|e| e.into_inner()) = Some(preview);
        let sequence = inner.counters.frames_published.fetch_add(1, Ordering::Relaxed) + 1;

        let ready = FrameReady {
            sequence,
            transitioning,
        };
        lock(&inner.subscribers).retain(|tx| match tx.try_send(ready) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                inner.counters.notifications_dropped.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
        program
    }

    fn write_sinks(&self, program: &VideoFrame) {
        for sink in lock(&self.0.sinks).iter_mut() {
            if let Err(e) = sink.write_frame(program) {
                warn!("Frame sink failed: {}", e);
            }
        }
    }
}

/// True if every source `snapshot` shows is in `frames`.
fn covers(snapshot: &SwitcherSnapshot, frames: &FrameLookup) -> bool {
    let mut buses = vec![&snapshot.program, &snapshot.preview];
    buses.extend(snapshot.incoming.as_ref());
    buses
        .iter()
        .filter_map(|bus| bus.source.key())
        .all(|key| frames.contains_key(&key))
}

/// The bus source frame with the bus effect chain applied.
fn bus_frame<'a>(bus: &BusState, frames: &'a FrameLookup) -> Option<Cow<'a, VideoFrame>> {
    let key = bus.source.key()?;
    let frame = frames.get(&key)?.frame.as_deref()?;
    if bus.effects.is_empty() {
        return Some(Cow::Borrowed(frame));
    }
    match apply_chain(frame, &bus.effects) {
        Ok(processed) => Some(Cow::Owned(processed)),
        Err(e) => {
            debug!("Effect chain failed on {}: {}", bus.source, e);
            Some(Cow::Borrowed(frame))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Rgb;
    use crate::source::{FrameSource, SourceDirectory, TestPattern};

    fn small_config() -> EngineConfig {
        EngineConfig {
            width: 32,
            height: 18,
            ..Default::default()
        }
    }

    fn engine_with(sources: &[(&str, Rgb)]) -> Engine {
        let directory = Arc::new(SourceDirectory::new());
        for (id, color) in sources {
            directory.insert(*id, Arc::new(TestPattern::solid(32, 18, *color)) as Arc<dyn FrameSource>);
        }
        let registry = SourceRegistry::new()
            .with_cameras(directory.clone())
            .with_virtual_cameras(directory);
        Engine::new(&small_config(), registry, None)
    }

    #[test]
    fn test_tick_publishes_program_and_preview() {
        let engine = engine_with(&[("a", Rgb::new(255, 0, 0)), ("b", Rgb::new(0, 0, 255))]);
        engine.load_to_program(Source::camera("a"));
        engine.load_to_preview(Source::camera("b"));
        assert!(engine.program_frame().is_none());

        assert!(engine.tick());
        let program = engine.program_frame().unwrap();
        let preview = engine.preview_frame().unwrap();
        assert_eq!((program.width, program.height), (32, 18));
        assert_eq!(program.pixel(5, 5), Some([255, 0, 0, 255]));
        assert_eq!(preview.pixel(5, 5), Some([0, 0, 255, 255]));
        assert_eq!(engine.stats().frames_published, 1);
    }

    #[test]
    fn test_program_effects_apply_to_bus_only() {
        let engine = engine_with(&[("a", Rgb::new(255, 0, 0)), ("b", Rgb::new(0, 0, 255))]);
        engine.load_to_program(Source::camera("a"));
        engine.add_effect_to_program(EffectType::Invert);
        engine.add_layer(Layer::camera("pip", "b").with_geometry([0.5, 0.5], [0.25, 0.25]));
        engine.tick();
        let program = engine.program_frame().unwrap();
        assert_eq!(program.pixel(1, 1), Some([0, 255, 255, 255]));
        assert_eq!(program.pixel(16, 9), Some([0, 0, 255, 255]));

        engine.clear_program_effects();
        engine.tick();
        assert_eq!(engine.program_frame().unwrap().pixel(1, 1), Some([255, 0, 0, 255]));
    }

    #[test]
    fn test_take_shows_preview_on_next_tick() {
        let engine = engine_with(&[("a", Rgb::new(255, 0, 0)), ("b", Rgb::new(0, 0, 255))]);
        engine.load_to_program(Source::camera("a"));
        assert!(!engine.take());
        engine.load_to_preview(Source::camera("b"));
        assert!(engine.take());
        engine.tick();
        assert_eq!(engine.program_frame().unwrap().pixel(0, 0), Some([0, 0, 255, 255]));
        assert_eq!(engine.bus_state(BusId::Preview).source, Source::camera("b"));
    }

    #[test]
    fn test_auto_with_unrepresentable_duration_is_rejected() {
        let engine = engine_with(&[("a", Rgb::new(255, 0, 0)), ("b", Rgb::new(0, 0, 255))]);
        engine.load_to_program(Source::camera("a"));
        engine.load_to_preview(Source::camera("b"));
        engine.apply_config(&EngineConfig {
            default_transition_secs: 1.0e20,
            ..small_config()
        });
        assert!(!engine.auto());
        assert!(!engine.is_transitioning());
        engine.tick();
        assert_eq!(engine.program_frame().unwrap().pixel(0, 0), Some([255, 0, 0, 255]));
    }

    #[test]
    fn test_subscriber_gets_at_most_one_pending_notification() {
        let engine = engine_with(&[("a", Rgb::BLACK)]);
        engine.load_to_program(Source::camera("a"));
        let rx = engine.subscribe();
        for _ in 0..3 {
            engine.tick();
        }
        assert_eq!(rx.try_recv().map(|r| r.sequence), Ok(1));
        assert!(rx.try_recv().is_err());
        assert_eq!(engine.stats().notifications_dropped, 2);

        drop(rx);
        engine.tick();
        assert_eq!(engine.stats().notifications_dropped, 2);
    }

    #[test]
    fn test_transport_requires_media_bus() {
        let engine = engine_with(&[("a", Rgb::BLACK)]);
        engine.load_to_program(Source::camera("a"));
        assert!(!engine.bus_transport(BusId::Program).pause());
        assert!(engine.bus_playback(BusId::Program).is_none());

        engine.load_to_preview(Source::media("/nonexistent/clip.mp4"));
        assert!(engine.bus_transport(BusId::Preview).set_volume(0.25));
        assert_eq!(engine.bus_playback(BusId::Preview).unwrap().volume, 0.25);
    }

    #[test]
    fn test_live_config_applies() {
        let engine = engine_with(&[("a", Rgb::BLACK), ("b", Rgb::BLACK)]);
        engine.apply_config(&EngineConfig {
            clear_preview_on_take: true,
            default_transition_secs: 0.0,
            ..small_config()
        });
        engine.load_to_preview(Source::camera("b"));
        assert!(engine.auto());
        assert!(!engine.is_transitioning());
        assert!(engine.bus_state(BusId::Preview).source.is_none());
        assert_eq!(engine.bus_state(BusId::Program).source, Source::camera("b"));
    }
}
