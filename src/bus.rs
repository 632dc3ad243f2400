//! Preview/Program switching state machine.
//!
//! The `Switcher` is plain state behind the engine's mutex. Time is passed
//! in explicitly so transitions can be driven from tests.

use crate::effects::{Effect, EffectType};
use crate::source::{BusPlayback, MediaTransport, Source};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BusId {
    Preview,
    Program,
}

impl fmt::Display for BusId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusId::Preview => f.write_str("PREVIEW"),
            BusId::Program => f.write_str("PROGRAM"),
        }
    }
}

/// Everything one bus shows. Replaced as a whole on every source swap.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BusState {
    pub source: Source,
    pub effects: Vec<Effect>,
    /// Present only while the source is media
    pub playback: Option<BusPlayback>,
}

impl BusState {
    fn playback_for(source: &Source) -> Option<BusPlayback> {
        match source {
            Source::Media { playback, .. } => Some(BusPlayback::from_state(playback)),
            _ => None,
        }
    }

    /// Same effects, new source.
    fn with_source(&self, source: Source, playback: Option<BusPlayback>) -> Self {
        Self {
            playback: playback.or_else(|| Self::playback_for(&source)),
            source,
            effects: self.effects.clone(),
        }
    }
}

/// Transport operation on a bus's media source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TransportCommand {
    Play,
    Pause,
    Seek(f64),
    SetRate(f32),
    SetLoop(bool),
    SetVolume(f32),
    SetMuted(bool),
}

impl TransportCommand {
    pub fn apply(&self, transport: &dyn MediaTransport) {
        match *self {
            TransportCommand::Play => transport.play(),
            TransportCommand::Pause => transport.pause(),
            TransportCommand::Seek(secs) => transport.seek(secs),
            TransportCommand::SetRate(rate) => transport.set_rate(rate),
            TransportCommand::SetLoop(enabled) => transport.set_loop(enabled),
            TransportCommand::SetVolume(volume) => transport.set_volume(volume),
            TransportCommand::SetMuted(muted) => transport.set_muted(muted),
        }
    }

    fn mirror(&self, playback: &mut BusPlayback) {
        match *self {
            TransportCommand::Play => playback.is_playing = true,
            TransportCommand::Pause => playback.is_playing = false,
            TransportCommand::Seek(secs) => {
                let mut t = secs.max(0.0);
                if playback.duration > 0.0 {
                    t = t.min(playback.duration);
                }
                playback.current_time = t;
            }
            TransportCommand::SetRate(rate) => playback.rate = rate,
            TransportCommand::SetLoop(enabled) => playback.loop_enabled = enabled,
            TransportCommand::SetVolume(volume) => playback.volume = volume.clamp(0.0, 1.0),
            TransportCommand::SetMuted(muted) => playback.muted = muted,
        }
    }
}

/// An auto transition in flight. `incoming` is Preview as it was when the
/// transition started.
#[derive(Debug, Clone)]
pub struct ActiveTransition {
    pub started_at: Instant,
    pub duration: Duration,
    pub incoming: BusState,
}

impl ActiveTransition {
    pub fn progress(&self, now: Instant) -> f32 {
        let elapsed = now.saturating_duration_since(self.started_at).as_secs_f32();
        let total = self.duration.as_secs_f32();
        if total <= 0.0 {
            return 1.0;
        }
        (elapsed / total).clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TransitionPhase {
    Idle,
    Transitioning { progress: f32 },
}

impl TransitionPhase {
    pub fn incoming_opacity(&self) -> f32 {
        match self {
            TransitionPhase::Idle => 0.0,
            TransitionPhase::Transitioning { progress } => *progress,
        }
    }

    pub fn outgoing_opacity(&self) -> f32 {
        1.0 - self.incoming_opacity()
    }
}

/// Owned copy of the switcher for one compositor tick.
#[derive(Debug, Clone)]
pub struct SwitcherSnapshot {
    pub preview: BusState,
    pub program: BusState,
    pub phase: TransitionPhase,
    /// Bus fading in while `phase` is `Transitioning`
    pub incoming: Option<BusState>,
    /// `Switcher::generation` when the snapshot was taken
    pub generation: u64,
}

#[derive(Debug, Default)]
pub struct Switcher {
    preview: BusState,
    program: BusState,
    transition: Option<ActiveTransition>,
    clear_preview_on_take: bool,
    /// Bumped whenever Program content changes hands
    generation: u64,
}

impl Switcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_clear_preview_on_take(&mut self, clear: bool) {
        self.clear_preview_on_take = clear;
    }

    pub fn clear_preview_on_take(&self) -> bool {
        self.clear_preview_on_take
    }

    pub fn bus(&self, bus: BusId) -> &BusState {
        match bus {
            BusId::Preview => &self.preview,
            BusId::Program => &self.program,
        }
    }

    fn bus_mut(&mut self, bus: BusId) -> &mut BusState {
        match bus {
            BusId::Preview => &mut self.preview,
            BusId::Program => &mut self.program,
        }
    }

    pub fn preview(&self) -> &BusState {
        &self.preview
    }

    pub fn program(&self) -> &BusState {
        &self.program
    }

    pub fn is_transitioning(&self) -> bool {
        self.transition.is_some()
    }

    /// Counts cuts: takes, Program loads and completed transitions. A
    /// composite rendered from an older generation is stale.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn load_to_preview(&mut self, source: Source) {
        debug!("Preview <- {}", source);
        self.preview = self.preview.with_source(source, None);
    }

    /// Replaces Program. An auto transition in flight is cancelled.
    pub fn load_to_program(&mut self, source: Source) {
        debug!("Program <- {}", source);
        if self.transition.take().is_some() {
            info!("Transition cancelled by Program load");
        }
        self.program = self.program.with_source(source, None);
        self.generation += 1;
    }

    /// Cuts Preview into Program. No-op returning false when Preview has no
    /// source. Cancels any transition in flight.
    pub fn take(&mut self) -> bool {
        if self.preview.source.is_none() {
            debug!("Take ignored: Preview has no source");
            return false;
        }
        if self.transition.take().is_some() {
            info!("Transition cancelled by Take");
        }
        self.cut_to(self.preview.clone());
        true
    }

    fn cut_to(&mut self, incoming: BusState) {
        info!("Take: Program <- {}", incoming.source);
        self.program = self.program.with_source(incoming.source, incoming.playback);
        self.generation += 1;
        if self.clear_preview_on_take {
            self.preview = self.preview.with_source(Source::None, None);
        }
    }

    /// Starts an auto transition from Program to Preview. A zero or
    /// negative duration behaves as `take()`; a duration too long to
    /// represent is rejected.
    pub fn transition(&mut self, duration_secs: f64, now: Instant) -> bool {
        if self.preview.source.is_none() {
            debug!("Transition ignored: Preview has no source");
            return false;
        }
        if !duration_secs.is_finite() || duration_secs <= 0.0 {
            return self.take();
        }
        let Ok(duration) = Duration::try_from_secs_f64(duration_secs) else {
            warn!("Transition ignored: duration {}s out of range", duration_secs);
            return false;
        };
        if now.checked_add(duration).is_none() {
            warn!("Transition ignored: duration {}s out of range", duration_secs);
            return false;
        }
        info!("Transition to {} over {:.2}s", self.preview.source, duration_secs);
        self.transition = Some(ActiveTransition {
            started_at: now,
            duration,
            incoming: self.preview.clone(),
        });
        true
    }

    /// Completes the transition once its progress reaches 1. Returns true
    /// if it completed on this call.
    pub fn advance(&mut self, now: Instant) -> bool {
        let done = self
            .transition
            .as_ref()
            .is_some_and(|t| t.progress(now) >= 1.0);
        if !done {
            return false;
        }
        if let Some(transition) = self.transition.take() {
            self.cut_to(transition.incoming);
        }
        true
    }

    /// Progress of the transition in flight, if any.
    pub fn progress(&self, now: Instant) -> Option<f32> {
        self.transition.as_ref().map(|t| t.progress(now))
    }

    pub fn add_effect(&mut self, bus: BusId, effect_type: EffectType) {
        self.bus_mut(bus).effects.push(Effect::new(effect_type));
    }

    pub fn push_effect(&mut self, bus: BusId, effect: Effect) {
        self.bus_mut(bus).effects.push(effect);
    }

    pub fn clear_effects(&mut self, bus: BusId) {
        self.bus_mut(bus).effects.clear();
    }

    pub fn add_effect_to_preview(&mut self, effect_type: EffectType) {
        self.add_effect(BusId::Preview, effect_type);
    }

    pub fn add_effect_to_program(&mut self, effect_type: EffectType) {
        self.add_effect(BusId::Program, effect_type);
    }

    pub fn clear_preview_effects(&mut self) {
        self.clear_effects(BusId::Preview);
    }

    pub fn clear_program_effects(&mut self) {
        self.clear_effects(BusId::Program);
    }

    /// Mirrors a transport command in the bus playback state. Returns false
    /// if the bus is not showing media.
    pub fn mirror_transport(&mut self, bus: BusId, command: TransportCommand) -> bool {
        match self.bus_mut(bus).playback.as_mut() {
            Some(playback) => {
                command.mirror(playback);
                true
            }
            None => false,
        }
    }

    /// Stores playback state reported by the bus's live media source.
    pub fn sync_playback(&mut self, bus: BusId, playback: BusPlayback) {
        let state = self.bus_mut(bus);
        if state.playback.is_some() {
            state.playback = Some(playback);
        }
    }

    /// Completes a finished transition, then copies the state out.
    pub fn snapshot(&mut self, now: Instant) -> SwitcherSnapshot {
        self.advance(now);
        let (phase, incoming) = match &self.transition {
            Some(t) => (
                TransitionPhase::Transitioning {
                    progress: t.progress(now),
                },
                Some(t.incoming.clone()),
            ),
            None => (TransitionPhase::Idle, None),
        };
        SwitcherSnapshot {
            preview: self.preview.clone(),
            program: self.program.clone(),
            phase,
            incoming,
            generation: self.generation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loaded(preview: &str, program: &str) -> Switcher {
        let mut s = Switcher::new();
        s.load_to_preview(Source::camera(preview));
        s.load_to_program(Source::camera(program));
        s
    }

    #[test]
    fn test_take_moves_preview_to_program() {
        let mut s = loaded("x", "y");
        assert!(s.take());
        assert_eq!(s.program().source, Source::camera("x"));
        assert_eq!(s.preview().source, Source::camera("x"));
    }

    #[test]
    fn test_take_can_clear_preview() {
        let mut s = loaded("x", "y");
        s.set_clear_preview_on_take(true);
        assert!(s.take());
        assert_eq!(s.program().source, Source::camera("x"));
        assert!(s.preview().source.is_none());
    }

    #[test]
    fn test_take_without_preview_is_noop() {
        let mut s = Switcher::new();
        s.load_to_program(Source::camera("y"));
        assert!(!s.take());
        assert!(!s.transition(1.0, Instant::now()));
        assert_eq!(s.program().source, Source::camera("y"));
        assert!(!s.is_transitioning());
    }

    #[test]
    fn test_transition_progress_is_monotonic_and_completes() {
        let mut s = loaded("x", "y");
        let t0 = Instant::now();
        assert!(s.transition(1.0, t0));

        let mut last = 0.0;
        for ms in (0..=1000).step_by(50) {
            let p = s.progress(t0 + Duration::from_millis(ms)).unwrap();
            assert!(p >= last);
            last = p;
        }
        assert_eq!(last, 1.0);

        let mid = s.snapshot(t0 + Duration::from_millis(500));
        assert_eq!(mid.phase, TransitionPhase::Transitioning { progress: 0.5 });
        assert_eq!(mid.program.source, Source::camera("y"));
        assert_eq!(mid.phase.outgoing_opacity(), 0.5);

        let done = s.snapshot(t0 + Duration::from_millis(1000));
        assert_eq!(done.phase, TransitionPhase::Idle);
        assert_eq!(done.program.source, Source::camera("x"));
    }

    #[test]
    fn test_take_during_transition_cancels_it() {
        let mut s = loaded("x", "y");
        let t0 = Instant::now();
        s.transition(1.0, t0);
        assert!(s.take());
        let snap = s.snapshot(t0 + Duration::from_millis(300));
        assert_eq!(snap.phase, TransitionPhase::Idle);
        assert!(snap.incoming.is_none());
        assert_eq!(snap.program.source, Source::camera("x"));
    }

    #[test]
    fn test_unrepresentable_duration_is_rejected() {
        let mut s = loaded("x", "y");
        assert!(!s.transition(1.0e20, Instant::now()));
        assert!(!s.is_transitioning());
        assert_eq!(s.program().source, Source::camera("y"));
        assert!(s.transition(3600.0, Instant::now()));
    }

    #[test]
    fn test_generation_counts_cuts() {
        let mut s = loaded("x", "y");
        let g = s.generation();
        s.load_to_preview(Source::camera("z"));
        assert_eq!(s.generation(), g);

        let t0 = Instant::now();
        s.transition(1.0, t0);
        let mid = s.snapshot(t0 + Duration::from_millis(200));
        assert_eq!(mid.generation, g);
        assert!(s.take());
        assert_eq!(s.generation(), g + 1);

        s.transition(1.0, t0);
        let done = s.snapshot(t0 + Duration::from_secs(2));
        assert_eq!(done.generation, g + 2);

        s.load_to_program(Source::camera("y"));
        assert_eq!(s.generation(), g + 3);
    }

    #[test]
    fn test_zero_duration_transition_is_take() {
        let mut s = loaded("x", "y");
        assert!(s.transition(0.0, Instant::now()));
        assert!(!s.is_transitioning());
        assert_eq!(s.program().source, Source::camera("x"));
    }

    #[test]
    fn test_program_load_cancels_transition() {
        let mut s = loaded("x", "y");
        s.transition(2.0, Instant::now());
        s.load_to_program(Source::camera("z"));
        assert!(!s.is_transitioning());
        assert_eq!(s.program().source, Source::camera("z"));
    }

    #[test]
    fn test_effects_stay_with_their_bus() {
        let mut s = loaded("x", "y");
        s.add_effect_to_preview(EffectType::Grayscale);
        s.add_effect_to_program(EffectType::Invert);
        s.add_effect_to_program(EffectType::Blur);
        s.take();
        assert_eq!(s.program().effects.len(), 2);
        assert_eq!(s.program().effects[0].effect_type(), EffectType::Invert);
        s.clear_program_effects();
        assert!(s.program().effects.is_empty());
        assert_eq!(s.preview().effects.len(), 1);
    }

    #[test]
    fn test_media_bus_has_playback_and_take_carries_it() {
        let mut s = Switcher::new();
        s.load_to_preview(Source::media("clip.mp4"));
        assert!(s.preview().playback.is_some());
        assert!(s.mirror_transport(BusId::Preview, TransportCommand::Seek(4.0)));
        assert!(s.mirror_transport(BusId::Preview, TransportCommand::Pause));
        s.take();
        let playback = s.program().playback.unwrap();
        assert_eq!(playback.current_time, 4.0);
        assert!(!playback.is_playing);

        s.load_to_program(Source::camera("cam-1"));
        assert!(s.program().playback.is_none());
        assert!(!s.mirror_transport(BusId::Program, TransportCommand::Play));
    }
}
