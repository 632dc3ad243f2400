//! Per-pixel chroma key math.
//!
//! `key_pixel` is the reference for the WGSL kernel in `gpu.rs`; both read
//! the same `KeyParams` block so the CPU and GPU paths agree to within
//! 8-bit rounding.

use super::ChromaKeySettings;
use crate::frame::{PixelFormat, VideoFrame};
use bytemuck::{Pod, Zeroable};

const KR: f32 = 0.2126;
const KG: f32 = 0.7152;
const KB: f32 = 0.0722;
const CB_SCALE: f32 = 1.8556;
const CR_SCALE: f32 = 1.5748;
/// Floor for the key's chroma magnitude so a near-gray key still has a
/// usable distance scale.
const MIN_KEY_CHROMA: f32 = 0.05;
const EPS: f32 = 1e-4;

/// Uniform block shared with the compute kernel (80 bytes, vec4-aligned).
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct KeyParams {
    /// key r, g, b, strength
    pub key: [f32; 4],
    /// softness, balance, matte_shift, edge_softness
    pub shape: [f32; 4],
    /// black_clip, white_clip, spill_strength, spill_desaturation
    pub clip_spill: [f32; 4],
    /// despill_bias, light_wrap, view_matte_only, unused
    pub extra: [f32; 4],
    /// width, height, unused, unused
    pub size: [u32; 4],
}

impl KeyParams {
    pub fn new(settings: &ChromaKeySettings, width: u32, height: u32) -> Self {
        let s = settings.sanitized();
        let [r, g, b] = s.key_color.to_f32();
        Self {
            key: [r, g, b, s.strength],
            shape: [s.softness, s.balance, s.matte_shift, s.edge_softness],
            clip_spill: [
                s.black_clip,
                s.white_clip,
                s.spill_strength,
                s.spill_desaturation,
            ],
            extra: [
                s.despill_bias,
                s.light_wrap,
                if s.view_matte_only { 1.0 } else { 0.0 },
                0.0,
            ],
            size: [width, height, 0, 0],
        }
    }
}

fn luma(c: [f32; 3]) -> f32 {
    KR * c[0] + KG * c[1] + KB * c[2]
}

fn cbcr(c: [f32; 3]) -> [f32; 2] {
    let y = luma(c);
    [(c[2] - y) / CB_SCALE, (c[0] - y) / CR_SCALE]
}

fn from_ycbcr(y: f32, cb: f32, cr: f32) -> [f32; 3] {
    let r = y + CR_SCALE * cr;
    let b = y + CB_SCALE * cb;
    let g = (y - KR * r - KB * b) / KG;
    [saturate(r), saturate(g), saturate(b)]
}

fn saturate(v: f32) -> f32 {
    v.clamp(0.0, 1.0)
}

fn smoothstep(lo: f32, hi: f32, x: f32) -> f32 {
    let t = saturate((x - lo) / (hi - lo));
    t * t * (3.0 - 2.0 * t)
}

fn mix(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

fn length2(v: [f32; 2]) -> f32 {
    (v[0] * v[0] + v[1] * v[1]).sqrt()
}

/// Normalized distance of `rgb` from the key color in [0, 1].
pub fn key_distance(rgb: [f32; 3], p: &KeyParams) -> f32 {
    let key = [p.key[0], p.key[1], p.key[2]];
    let key_c = cbcr(key);
    let px_c = cbcr(rgb);
    let chroma = length2([px_c[0] - key_c[0], px_c[1] - key_c[1]])
        / length2(key_c).max(MIN_KEY_CHROMA);
    let rgb_dist = ((rgb[0] - key[0]).powi(2) + (rgb[1] - key[1]).powi(2) + (rgb[2] - key[2]).powi(2))
        .sqrt()
        / 3f32.sqrt();
    saturate(mix(saturate(chroma), rgb_dist, p.shape[1]))
}

/// Keys one straight-alpha RGBA pixel (channels in [0, 1]) and returns
/// premultiplied RGBA.
pub fn key_pixel(rgba: [f32; 4], p: &KeyParams) -> [f32; 4] {
    let rgb = [rgba[0], rgba[1], rgba[2]];
    let key = [p.key[0], p.key[1], p.key[2]];
    let [softness, _balance, matte_shift, edge_softness] = p.shape;
    let [black_clip, white_clip, spill_strength, spill_desat] = p.clip_spill;
    let [despill_bias, light_wrap, view_matte, _] = p.extra;

    let dist = key_distance(rgb, p);
    let threshold = p.key[3] + matte_shift;
    let width = (softness + edge_softness * 0.5).max(EPS);

    let mut alpha = smoothstep(threshold, threshold + width, dist);
    if edge_softness > 0.0 {
        alpha = alpha.powf(1.0 / (1.0 + edge_softness));
    }
    alpha = saturate((alpha - black_clip) / (white_clip - black_clip).max(EPS));

    // Spill: pull the key's chroma out of pixels close to the key.
    let zone = saturate(1.0 - (dist - threshold) / (4.0 * width + despill_bias).max(EPS));
    let y = luma(rgb);
    let mut c = cbcr(rgb);
    let key_c = cbcr(key);
    let key_len = length2(key_c);
    if key_len > EPS {
        let dir = [key_c[0] / key_len, key_c[1] / key_len];
        let along = (c[0] * dir[0] + c[1] * dir[1]).max(0.0);
        let remove = along * spill_strength * zone;
        c = [c[0] - dir[0] * remove, c[1] - dir[1] * remove];
    }
    let desat = 1.0 - zone * spill_desat;
    let mut out = from_ycbcr(y, c[0] * desat, c[1] * desat);

    let edge = 4.0 * alpha * (1.0 - alpha);
    let wrap = saturate(edge * light_wrap);
    for i in 0..3 {
        out[i] = mix(out[i], key[i], wrap);
    }

    let alpha = alpha * rgba[3];
    if view_matte > 0.5 {
        return [alpha, alpha, alpha, 1.0];
    }
    [out[0] * alpha, out[1] * alpha, out[2] * alpha, alpha]
}

fn to_unit(v: u8) -> f32 {
    v as f32 / 255.0
}

fn to_byte(v: f32) -> u8 {
    (saturate(v) * 255.0).round() as u8
}

/// Keys a whole straight-alpha RGBA frame on the CPU.
pub fn key_frame(rgba: &VideoFrame, p: &KeyParams) -> VideoFrame {
    let mut data = vec![0u8; rgba.data.len()];
    for (dst, src) in data.chunks_exact_mut(4).zip(rgba.data.chunks_exact(4)) {
        let keyed = key_pixel(
            [to_unit(src[0]), to_unit(src[1]), to_unit(src[2]), to_unit(src[3])],
            p,
        );
        for (d, v) in dst.iter_mut().zip(keyed) {
            *d = to_byte(v);
        }
    }
    VideoFrame {
        width: rgba.width,
        height: rgba.height,
        format: PixelFormat::Rgba,
        timestamp_us: rgba.timestamp_us,
        premultiplied: true,
        data,
    }
}
