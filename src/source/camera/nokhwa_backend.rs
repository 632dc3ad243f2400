//! Nokhwa-based camera capture backend.

use super::{CameraInfo, CaptureBackend, CaptureConfig};
use crate::frame::{PixelFormat, VideoFrame};
use anyhow::{anyhow, Result};
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{
    ApiBackend, CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType,
    Resolution,
};
use nokhwa::Camera;
use tracing::{info, warn};

/// Camera capture using the nokhwa library.
pub struct NokhwaCapture {
    camera: Camera,
    width: u32,
    height: u32,
}

/// Formats tried in order until one opens a stream. Built-in cameras tend to
/// want NV12/YUYV, USB cameras MJPEG.
fn seed_formats(config: &CaptureConfig) -> Vec<CameraFormat> {
    let mut resolutions = vec![(config.width, config.height)];
    for fallback in [(1920, 1080), (1280, 720), (640, 480)] {
        if !resolutions.contains(&fallback) {
            resolutions.push(fallback);
        }
    }
    let mut seeds = Vec::new();
    for (w, h) in resolutions {
        for fps in [config.fps, 30, 15] {
            for format in [FrameFormat::NV12, FrameFormat::YUYV, FrameFormat::MJPEG] {
                let seed = CameraFormat::new(Resolution::new(w, h), format, fps);
                if !seeds.contains(&seed) {
                    seeds.push(seed);
                }
            }
        }
    }
    seeds
}

impl CaptureBackend for NokhwaCapture {
    fn list_devices() -> Result<Vec<CameraInfo>> {
        let devices = nokhwa::query(ApiBackend::Auto)?;
        Ok(devices
            .into_iter()
            .map(|d| CameraInfo {
                index: d.index().as_index().unwrap_or(0),
                name: d.human_name().to_string(),
            })
            .collect())
    }

    fn open(config: CaptureConfig) -> Result<Self> {
        let mut opened = None;
        for seed in seed_formats(&config) {
            let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(seed));
            let Ok(mut camera) = Camera::new(CameraIndex::Index(config.device_index), requested) else {
                continue;
            };
            // Some drivers accept the request but refuse the stream.
            if camera.open_stream().is_ok() {
                info!("Camera {} streaming with {:?}", config.device_index, seed);
                opened = Some(camera);
                break;
            }
        }
        let camera = opened.ok_or_else(|| {
            anyhow!(
                "Could not open a stream on camera index {} with any standard format",
                config.device_index
            )
        })?;

        let resolution = camera.resolution();
        if resolution.width() != config.width || resolution.height() != config.height {
            warn!(
                "Camera {} delivers {} instead of {}x{}",
                config.device_index, resolution, config.width, config.height
            );
        }

        Ok(Self {
            camera,
            width: resolution.width(),
            height: resolution.height(),
        })
    }

    fn capture_frame(&mut self) -> Result<VideoFrame> {
        let frame = self.camera.frame()?;
        let decoded = frame.decode_image::<RgbFormat>()?;
        Ok(VideoFrame::from_data(
            self.width,
            self.height,
            PixelFormat::Rgb,
            decoded.into_raw(),
        ))
    }

    fn frame_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}
