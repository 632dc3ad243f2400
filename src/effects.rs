//! Per-bus effect chains.
//!
//! Effects run on the CPU over straight-alpha RGBA, in chain order, on the
//! bus source frame before any overlay layer is painted.
//!
//! | Type | Parameters |
//! |------|------------|
//! | BrightnessContrast | `brightness: -1..1`, `contrast: -1..1` |
//! | Grayscale | `amount: 0..1` |
//! | Invert | none |
//! | Sepia | `amount: 0..1` |
//! | Blur | `radius: 0..64` pixels |

use crate::error::Result;
use crate::frame::VideoFrame;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EffectType {
    BrightnessContrast,
    Grayscale,
    Invert,
    Sepia,
    Blur,
}

impl EffectType {
    pub fn display_name(&self) -> &'static str {
        match self {
            EffectType::BrightnessContrast => "Brightness/Contrast",
            EffectType::Grayscale => "Grayscale",
            EffectType::Invert => "Invert",
            EffectType::Sepia => "Sepia",
            EffectType::Blur => "Blur",
        }
    }

    pub fn all() -> &'static [EffectType] {
        &[
            EffectType::BrightnessContrast,
            EffectType::Grayscale,
            EffectType::Invert,
            EffectType::Sepia,
            EffectType::Blur,
        ]
    }
}

/// One configured effect.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Effect {
    BrightnessContrast { brightness: f32, contrast: f32 },
    Grayscale { amount: f32 },
    Invert,
    Sepia { amount: f32 },
    Blur { radius: f32 },
}

const MAX_BLUR_RADIUS: f32 = 64.0;

impl Effect {
    /// Effect of the given type with its default parameters.
    pub fn new(effect_type: EffectType) -> Self {
        match effect_type {
            EffectType::BrightnessContrast => Effect::BrightnessContrast {
                brightness: 0.1,
                contrast: 0.1,
            },
            EffectType::Grayscale => Effect::Grayscale { amount: 1.0 },
            EffectType::Invert => Effect::Invert,
            EffectType::Sepia => Effect::Sepia { amount: 1.0 },
            EffectType::Blur => Effect::Blur { radius: 4.0 },
        }
    }

    pub fn effect_type(&self) -> EffectType {
        match self {
            Effect::BrightnessContrast { .. } => EffectType::BrightnessContrast,
            Effect::Grayscale { .. } => EffectType::Grayscale,
            Effect::Invert => EffectType::Invert,
            Effect::Sepia { .. } => EffectType::Sepia,
            Effect::Blur { .. } => EffectType::Blur,
        }
    }

    /// Applies the effect in place to a straight-alpha RGBA buffer.
    fn apply_rgba(&self, width: u32, height: u32, data: &mut [u8]) {
        match *self {
            Effect::BrightnessContrast { brightness, contrast } => {
                let b = brightness.clamp(-1.0, 1.0);
                let cf = 1.0 + contrast.clamp(-1.0, 1.0);
                map_rgb(data, |[r, g, bl]| {
                    let f = |v: f32| (v - 0.5) * cf + 0.5 + b;
                    [f(r), f(g), f(bl)]
                });
            }
            Effect::Grayscale { amount } => {
                let t = amount.clamp(0.0, 1.0);
                map_rgb(data, |[r, g, b]| {
                    let y = 0.2126 * r + 0.7152 * g + 0.0722 * b;
                    [mix(r, y, t), mix(g, y, t), mix(b, y, t)]
                });
            }
            Effect::Invert => {
                for px in data.chunks_exact_mut(4) {
                    for c in &mut px[..3] {
                        *c = 255 - *c;
                    }
                }
            }
            Effect::Sepia { amount } => {
                let t = amount.clamp(0.0, 1.0);
                map_rgb(data, |[r, g, b]| {
                    let sr = 0.393 * r + 0.769 * g + 0.189 * b;
                    let sg = 0.349 * r + 0.686 * g + 0.168 * b;
                    let sb = 0.272 * r + 0.534 * g + 0.131 * b;
                    [mix(r, sr, t), mix(g, sg, t), mix(b, sb, t)]
                });
            }
            Effect::Blur { radius } => {
                let radius = if radius.is_finite() {
                    radius.clamp(0.0, MAX_BLUR_RADIUS)
                } else {
                    0.0
                };
                gaussian_blur(width as usize, height as usize, data, radius);
            }
        }
    }
}

fn mix(a: f32, b: f32, t: f32) -> f32 {
    a * (1.0 - t) + b * t
}

fn map_rgb(data: &mut [u8], f: impl Fn([f32; 3]) -> [f32; 3]) {
    for px in data.chunks_exact_mut(4) {
        let out = f([
            px[0] as f32 / 255.0,
            px[1] as f32 / 255.0,
            px[2] as f32 / 255.0,
        ]);
        for (dst, v) in px[..3].iter_mut().zip(out) {
            *dst = (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        }
    }
}

fn gaussian_kernel(radius: f32) -> Vec<f32> {
    let r = radius.ceil() as i32;
    let sigma = (radius / 2.0).max(0.5);
    let weights: Vec<f32> = (-r..=r)
        .map(|i| (-(i * i) as f32 / (2.0 * sigma * sigma)).exp())
        .collect();
    let sum: f32 = weights.iter().sum();
    weights.into_iter().map(|w| w / sum).collect()
}

/// Separable Gaussian blur of all four channels, edges clamped.
fn gaussian_blur(width: usize, height: usize, data: &mut [u8], radius: f32) {
    if radius < 0.5 || width == 0 || height == 0 {
        return;
    }
    let kernel = gaussian_kernel(radius);
    let r = (kernel.len() / 2) as isize;
    let mut tmp = vec![0f32; width * height * 4];

    for y in 0..height {
        for x in 0..width {
            let mut acc = [0f32; 4];
            for (k, w) in kernel.iter().enumerate() {
                let sx = (x as isize + k as isize - r).clamp(0, width as isize - 1) as usize;
                let i = (y * width + sx) * 4;
                for c in 0..4 {
                    acc[c] += data[i + c] as f32 * w;
                }
            }
            tmp[(y * width + x) * 4..][..4].copy_from_slice(&acc);
        }
    }
    for y in 0..height {
        for x in 0..width {
            let mut acc = [0f32; 4];
            for (k, w) in kernel.iter().enumerate() {
                let sy = (y as isize + k as isize - r).clamp(0, height as isize - 1) as usize;
                let i = (sy * width + x) * 4;
                for c in 0..4 {
                    acc[c] += tmp[i + c] * w;
                }
            }
            let o = (y * width + x) * 4;
            for c in 0..4 {
                data[o + c] = acc[c].round().clamp(0.0, 255.0) as u8;
            }
        }
    }
}

/// Runs `effects` in order. An empty chain returns the frame untouched;
/// otherwise the result is straight-alpha RGBA.
pub fn apply_chain(frame: &VideoFrame, effects: &[Effect]) -> Result<VideoFrame> {
    if effects.is_empty() {
        return Ok(frame.clone());
    }
    let mut rgba = frame.to_rgba()?;
    for effect in effects {
        effect.apply_rgba(rgba.width, rgba.height, &mut rgba.data);
    }
    Ok(rgba)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{PixelFormat, Rgb};

    fn gradient() -> VideoFrame {
        let data = (0..8u32 * 8)
            .flat_map(|i| [(i * 4) as u8, (255 - i * 3) as u8, (i * 2) as u8, 255])
            .collect();
        VideoFrame::from_data(8, 8, PixelFormat::Rgba, data)
    }

    #[test]
    fn test_empty_chain_is_identity() {
        let frame = gradient();
        assert_eq!(apply_chain(&frame, &[]).unwrap(), frame);
    }

    #[test]
    fn test_double_invert_is_identity() {
        let frame = gradient();
        let out = apply_chain(&frame, &[Effect::Invert, Effect::Invert]).unwrap();
        assert_eq!(out.data, frame.data);
    }

    #[test]
    fn test_grayscale_equalizes_channels() {
        let out = apply_chain(&gradient(), &[Effect::new(EffectType::Grayscale)]).unwrap();
        for px in out.data.chunks_exact(4) {
            assert_eq!(px[0], px[1]);
            assert_eq!(px[1], px[2]);
        }
    }

    #[test]
    fn test_chain_order_matters() {
        let frame = VideoFrame::solid(1, 1, Rgb::new(200, 100, 50));
        let bright = Effect::BrightnessContrast {
            brightness: 0.2,
            contrast: 0.0,
        };
        let a = apply_chain(&frame, &[bright, Effect::Invert]).unwrap();
        let b = apply_chain(&frame, &[Effect::Invert, bright]).unwrap();
        assert_ne!(a.data, b.data);
    }

    #[test]
    fn test_blur_keeps_uniform_frames() {
        let frame = VideoFrame::solid(9, 5, Rgb::new(10, 200, 30));
        let out = apply_chain(&frame, &[Effect::Blur { radius: 3.0 }]).unwrap();
        assert_eq!(out.data, frame.data);
    }

    #[test]
    fn test_blur_softens_an_edge() {
        let mut frame = VideoFrame::solid(8, 1, Rgb::BLACK);
        for px in frame.data.chunks_exact_mut(4).skip(4) {
            px[..3].copy_from_slice(&[255, 255, 255]);
        }
        let out = apply_chain(&frame, &[Effect::Blur { radius: 2.0 }]).unwrap();
        let left = out.pixel(3, 0).unwrap()[0];
        assert!(left > 0 && left < 255);
    }

    #[test]
    fn test_default_params_match_type() {
        for t in EffectType::all() {
            assert_eq!(Effect::new(*t).effect_type(), *t);
        }
    }
}
