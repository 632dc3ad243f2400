//! Video frame types and pixel format conversions.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Supported pixel formats for video frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// RGB with 8 bits per channel (24 bits per pixel)
    Rgb,
    /// RGBA with 8 bits per channel (32 bits per pixel)
    Rgba,
    /// YUV 4:2:2 packed format (Y0 U0 Y1 V0)
    Yuyv,
    /// YUV 4:2:2 packed format (U0 Y0 V0 Y1) - used by macOS
    Uyvy,
    /// NV12 semi-planar format (Y plane + interleaved UV)
    Nv12,
}

impl PixelFormat {
    /// Returns the number of bytes per pixel for packed formats.
    /// For planar formats like NV12, this returns the bytes for the Y component only.
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Rgb => 3,
            PixelFormat::Rgba => 4,
            PixelFormat::Yuyv => 2,
            PixelFormat::Uyvy => 2,
            PixelFormat::Nv12 => 1, // Y plane only
        }
    }

    /// Minimum buffer length for a frame of the given size.
    pub fn frame_len(&self, width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        match self {
            PixelFormat::Nv12 => {
                let uv_stride = w + (w % 2);
                w * h + uv_stride * h.div_ceil(2)
            }
            _ => w * h * self.bytes_per_pixel(),
        }
    }
}

/// 8-bit RGB color used for key colors and fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const BLACK: Rgb = Rgb::new(0, 0, 0);
    pub const GREEN: Rgb = Rgb::new(0, 255, 0);
    pub const BLUE: Rgb = Rgb::new(0, 0, 255);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Parses `#rrggbb` or `rrggbb`.
    pub fn from_hex(hex: &str) -> Option<Self> {
        let hex = hex.trim().trim_start_matches('#');
        if hex.len() != 6 {
            return None;
        }
        let channel = |i: usize| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok();
        Some(Self::new(channel(0)?, channel(2)?, channel(4)?))
    }

    /// Channels normalized to [0, 1].
    pub fn to_f32(self) -> [f32; 3] {
        [
            self.r as f32 / 255.0,
            self.g as f32 / 255.0,
            self.b as f32 / 255.0,
        ]
    }
}

/// A video frame containing image data.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFrame {
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Pixel format of the frame data
    pub format: PixelFormat,
    /// Timestamp in microseconds (if available). Only meaningful against
    /// other frames of the same source.
    pub timestamp_us: Option<u64>,
    /// Whether RGBA color channels are already multiplied by alpha
    pub premultiplied: bool,
    /// Raw pixel data
    pub data: Vec<u8>,
}

impl VideoFrame {
    /// Creates a new video frame with the given dimensions and format.
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
            timestamp_us: None,
            premultiplied: false,
            data: vec![0; format.frame_len(width, height)],
        }
    }

    /// Creates a video frame from existing data.
    pub fn from_data(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            format,
            timestamp_us: None,
            premultiplied: false,
            data,
        }
    }

    /// Opaque RGBA frame filled with one color.
    pub fn solid(width: u32, height: u32, color: Rgb) -> Self {
        let pixel = [color.r, color.g, color.b, 255];
        let data = pixel
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * 4)
            .collect();
        Self::from_data(width, height, PixelFormat::Rgba, data)
    }

    pub fn with_timestamp(mut self, timestamp_us: u64) -> Self {
        self.timestamp_us = Some(timestamp_us);
        self
    }

    /// Checks that the frame has a non-zero size and a buffer large enough
    /// for its format.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::invalid_frame(format!(
                "zero-sized frame {}x{}",
                self.width, self.height
            )));
        }
        let expected = self.format.frame_len(self.width, self.height);
        if self.data.len() < expected {
            return Err(Error::invalid_frame(format!(
                "{:?} frame {}x{} has {} bytes, expected {}",
                self.format,
                self.width,
                self.height,
                self.data.len(),
                expected
            )));
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// RGBA pixel at (x, y). Only defined for RGBA frames.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if self.format != PixelFormat::Rgba || x >= self.width || y >= self.height {
            return None;
        }
        let i = (y as usize * self.width as usize + x as usize) * 4;
        let px = self.data.get(i..i + 4)?;
        Some([px[0], px[1], px[2], px[3]])
    }

    /// Converts this frame to RGBA format.
    pub fn to_rgba(&self) -> Result<VideoFrame> {
        self.validate()?;
        if self.format == PixelFormat::Rgba {
            return Ok(self.clone());
        }

        let width = self.width as usize;
        let height = self.height as usize;
        let pixel_count = width * height;
        let mut rgba_data = vec![0u8; pixel_count * 4];

        // Fast path for RGB -> RGBA: just add alpha=255, no color conversion needed
        if self.format == PixelFormat::Rgb {
            for (dst, src) in rgba_data
                .chunks_exact_mut(4)
                .zip(self.data.chunks_exact(3))
            {
                dst[..3].copy_from_slice(src);
                dst[3] = 255;
            }
            return Ok(self.rebuilt(PixelFormat::Rgba, rgba_data));
        }

        let dst_color = ezk_image::ColorInfo::RGB(ezk_image::RgbColorInfo {
            transfer: ezk_image::ColorTransfer::Linear,
            primaries: ezk_image::ColorPrimaries::BT709,
        });
        let src_color_yuv = ezk_image::ColorInfo::YUV(ezk_image::YuvColorInfo {
            transfer: ezk_image::ColorTransfer::Linear,
            primaries: ezk_image::ColorPrimaries::BT709,
            space: ezk_image::ColorSpace::BT709,
            full_range: false,
        });

        // ezk-image has no UYVY reader; swap into YUYV order first.
        let swapped;
        let (src_format, src_data) = match self.format {
            PixelFormat::Yuyv => (ezk_image::PixelFormat::YUYV, &self.data[..]),
            PixelFormat::Nv12 => (ezk_image::PixelFormat::NV12, &self.data[..]),
            PixelFormat::Uyvy => {
                swapped = swap_byte_pairs(&self.data);
                (ezk_image::PixelFormat::YUYV, &swapped[..])
            }
            PixelFormat::Rgb | PixelFormat::Rgba => unreachable!("handled above"),
        };

        {
            let mut dst_image = ezk_image::Image::from_buffer(
                ezk_image::PixelFormat::RGBA,
                &mut rgba_data[..],
                None,
                width,
                height,
                dst_color,
            )
            .map_err(|e| Error::invalid_frame(format!("RGBA buffer: {e:?}")))?;

            let src_image = ezk_image::Image::from_buffer(
                src_format,
                src_data,
                None,
                width,
                height,
                src_color_yuv,
            )
            .map_err(|e| Error::invalid_frame(format!("{:?} buffer: {e:?}", self.format)))?;

            ezk_image::convert(&src_image, &mut dst_image)
                .map_err(|e| Error::invalid_frame(format!("conversion failed: {e:?}")))?;
        }

        Ok(self.rebuilt(PixelFormat::Rgba, rgba_data))
    }

    /// RGBA frame with color channels multiplied by alpha.
    pub fn to_premultiplied_rgba(&self) -> Result<VideoFrame> {
        let mut rgba = self.to_rgba()?;
        if !rgba.premultiplied {
            for px in rgba.data.chunks_exact_mut(4) {
                let a = px[3] as u16;
                if a == 255 {
                    continue;
                }
                for c in &mut px[..3] {
                    *c = ((*c as u16 * a + 127) / 255) as u8;
                }
            }
            rgba.premultiplied = true;
        }
        Ok(rgba)
    }

    fn rebuilt(&self, format: PixelFormat, data: Vec<u8>) -> VideoFrame {
        VideoFrame {
            width: self.width,
            height: self.height,
            format,
            timestamp_us: self.timestamp_us,
            premultiplied: false,
            data,
        }
    }
}

/// U0 Y0 V0 Y1 <-> Y0 U0 Y1 V0
fn swap_byte_pairs(data: &[u8]) -> Vec<u8> {
    let mut out = data.to_vec();
    for pair in out.chunks_exact_mut(2) {
        pair.swap(0, 1);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rgb_to_rgba_conversion() {
        let rgb_data = vec![255, 0, 0, 0, 255, 0, 0, 0, 255, 255, 255, 255];
        let frame = VideoFrame::from_data(2, 2, PixelFormat::Rgb, rgb_data);
        let rgba_frame = frame.to_rgba().unwrap();

        assert_eq!(rgba_frame.format, PixelFormat::Rgba);
        assert_eq!(rgba_frame.data.len(), 16);
        // Check first pixel (red)
        assert_eq!(&rgba_frame.data[0..4], &[255, 0, 0, 255]);
        // Check second pixel (green)
        assert_eq!(&rgba_frame.data[4..8], &[0, 255, 0, 255]);
    }

    #[test]
    fn test_validate_rejects_zero_and_short_buffers() {
        let zero = VideoFrame::from_data(0, 10, PixelFormat::Rgba, vec![]);
        assert!(zero.validate().is_err());

        let short = VideoFrame::from_data(4, 4, PixelFormat::Rgba, vec![0; 10]);
        assert!(short.validate().is_err());
        assert!(short.to_rgba().is_err());

        assert!(VideoFrame::new(4, 4, PixelFormat::Nv12).is_valid());
    }

    #[test]
    fn test_solid_and_pixel() {
        let frame = VideoFrame::solid(3, 2, Rgb::new(10, 20, 30));
        assert_eq!(frame.pixel(2, 1), Some([10, 20, 30, 255]));
        assert_eq!(frame.pixel(3, 0), None);
    }

    #[test]
    fn test_premultiply() {
        let frame = VideoFrame::from_data(1, 1, PixelFormat::Rgba, vec![200, 100, 50, 128]);
        let pm = frame.to_premultiplied_rgba().unwrap();
        assert!(pm.premultiplied);
        assert_eq!(pm.data, vec![100, 50, 25, 128]);
    }

    #[test]
    fn test_uyvy_swap() {
        assert_eq!(swap_byte_pairs(&[1, 2, 3, 4]), vec![2, 1, 4, 3]);
    }

    #[test]
    fn test_hex_color() {
        assert_eq!(Rgb::from_hex("#00ff00"), Some(Rgb::GREEN));
        assert_eq!(Rgb::from_hex("12345"), None);
    }
}
