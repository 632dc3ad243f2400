//! Per-layer audio meter levels.
//!
//! Mixing is out of scope; the engine only reports what each layer would
//! contribute after its gain, mute and solo flags.

use crate::layer::{Layer, LayerId};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A reading older than this meters as silence.
pub const METER_HOLD: Duration = Duration::from_millis(500);

/// Linear meter reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioLevels {
    pub rms: f32,
    pub peak: f32,
}

impl AudioLevels {
    pub const SILENT: AudioLevels = AudioLevels { rms: 0.0, peak: 0.0 };

    pub fn new(rms: f32, peak: f32) -> Self {
        Self {
            rms: rms.max(0.0),
            peak: peak.max(rms).max(0.0),
        }
    }

    /// RMS and peak of a block of samples in [-1, 1].
    pub fn measure(samples: &[f32]) -> Self {
        if samples.is_empty() {
            return Self::SILENT;
        }
        let (sum, peak) = samples
            .iter()
            .filter(|s| s.is_finite())
            .fold((0.0f64, 0.0f32), |(sum, peak), &s| {
                (sum + (s as f64) * (s as f64), peak.max(s.abs()))
            });
        let rms = (sum / samples.len() as f64).sqrt() as f32;
        Self::new(rms.min(1.0), peak.min(1.0))
    }

    pub fn scaled(self, gain: f32) -> Self {
        let gain = if gain.is_finite() { gain.max(0.0) } else { 0.0 };
        Self {
            rms: self.rms * gain,
            peak: self.peak * gain,
        }
    }
}

/// Slot between a source's audio tap and the engine's meters.
///
/// Whatever decodes or captures the audio calls `report`; the source hands
/// the newest reading to the engine through `FrameSource::audio_levels`.
#[derive(Debug, Default)]
pub struct LevelMeter {
    latest: Mutex<Option<(AudioLevels, Instant)>>,
}

impl LevelMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&self, levels: AudioLevels) {
        *self.latest.lock().unwrap_or_else(|e| e.into_inner()) = Some((levels, Instant::now()));
    }

    pub fn report_samples(&self, samples: &[f32]) {
        self.report(AudioLevels::measure(samples));
    }

    /// `None` until the tap reports once; silence once it stops reporting.
    pub fn read(&self) -> Option<AudioLevels> {
        self.read_at(Instant::now())
    }

    fn read_at(&self, now: Instant) -> Option<AudioLevels> {
        let latest = *self.latest.lock().unwrap_or_else(|e| e.into_inner());
        latest.map(|(levels, at)| {
            if now.saturating_duration_since(at) > METER_HOLD {
                AudioLevels::SILENT
            } else {
                levels
            }
        })
    }
}

/// Applies gain, mute and solo to raw source levels.
///
/// `levels` pairs each layer with what its source reported this tick. Layers
/// without an audio block are not metered. If any enabled layer is soloed,
/// every other layer reads silent.
pub fn layer_meters(layers: &[(Layer, Option<AudioLevels>)]) -> Vec<(LayerId, AudioLevels)> {
    let any_solo = layers
        .iter()
        .any(|(layer, _)| layer.enabled && layer.audio.is_some_and(|a| a.solo));

    layers
        .iter()
        .filter_map(|(layer, levels)| {
            let audio = layer.audio?;
            let raw = levels.unwrap_or(AudioLevels::SILENT);
            let audible = layer.enabled && !audio.muted && (!any_solo || audio.solo);
            let level = if audible { raw.scaled(audio.gain) } else { AudioLevels::SILENT };
            Some((layer.id, level))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::LayerAudio;

    fn with_audio(audio: LayerAudio) -> Layer {
        let mut layer = Layer::camera("cam", "cam-1");
        layer.audio = Some(audio);
        layer
    }

    #[test]
    fn test_gain_and_mute() {
        let loud = AudioLevels::new(0.4, 0.8);
        let a = with_audio(LayerAudio {
            gain: 0.5,
            ..Default::default()
        });
        let b = with_audio(LayerAudio {
            muted: true,
            ..Default::default()
        });
        let meters = layer_meters(&[(a.clone(), Some(loud)), (b.clone(), Some(loud))]);
        assert_eq!(meters[0], (a.id, AudioLevels::new(0.2, 0.4)));
        assert_eq!(meters[1], (b.id, AudioLevels::SILENT));
    }

    #[test]
    fn test_solo_silences_others() {
        let level = Some(AudioLevels::new(0.3, 0.6));
        let solo = with_audio(LayerAudio {
            solo: true,
            ..Default::default()
        });
        let other = with_audio(LayerAudio::default());
        let no_audio = Layer::camera("silent", "cam-2");
        let meters = layer_meters(&[(solo, level), (other, level), (no_audio, level)]);
        assert_eq!(meters.len(), 2);
        assert_eq!(meters[0].1, level.unwrap());
        assert_eq!(meters[1].1, AudioLevels::SILENT);
    }

    #[test]
    fn test_measure_block() {
        let levels = AudioLevels::measure(&[0.5, -0.5, 0.5, -0.5]);
        assert!((levels.rms - 0.5).abs() < 1e-6);
        assert_eq!(levels.peak, 0.5);
        assert_eq!(AudioLevels::measure(&[]), AudioLevels::SILENT);
    }

    #[test]
    fn test_meter_holds_then_decays_to_silence() {
        let meter = LevelMeter::new();
        assert_eq!(meter.read(), None);
        meter.report(AudioLevels::new(0.2, 0.4));
        assert_eq!(meter.read(), Some(AudioLevels::new(0.2, 0.4)));
        let later = Instant::now() + METER_HOLD + Duration::from_millis(50);
        assert_eq!(meter.read_at(later), Some(AudioLevels::SILENT));
    }

    #[test]
    fn test_peak_never_below_rms() {
        let l = AudioLevels::new(0.5, 0.1);
        assert!(l.peak >= l.rms);
    }
}
