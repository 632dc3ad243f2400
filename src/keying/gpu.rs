//! wgpu compute backend for chroma keying.

use super::kernel::KeyParams;
use super::{ChromaKeySettings, Completion, KeyBackend};
use crate::error::{Error, Result};
use crate::frame::{PixelFormat, VideoFrame};
use crate::gpu::GpuContext;
use naga::valid::{Capabilities, ValidationFlags, Validator};
use std::borrow::Cow;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

const WORKGROUP_SIZE: u32 = 8;

/// Compute kernel. Mirrors `kernel::key_pixel`.
pub const KEY_KERNEL_WGSL: &str = r#"
struct KeyParams {
    key: vec4<f32>,
    shape: vec4<f32>,
    clip_spill: vec4<f32>,
    extra: vec4<f32>,
    size: vec4<u32>,
}

@group(0) @binding(0) var src_tex: texture_2d<f32>;
@group(0) @binding(1) var dst_tex: texture_storage_2d<rgba8unorm, write>;
@group(0) @binding(2) var<uniform> params: KeyParams;

const KR: f32 = 0.2126;
const KG: f32 = 0.7152;
const KB: f32 = 0.0722;
const CB_SCALE: f32 = 1.8556;
const CR_SCALE: f32 = 1.5748;
const MIN_KEY_CHROMA: f32 = 0.05;
const EPS: f32 = 1e-4;

fn luma(c: vec3<f32>) -> f32 {
    return KR * c.r + KG * c.g + KB * c.b;
}

fn cbcr(c: vec3<f32>) -> vec2<f32> {
    let y = luma(c);
    return vec2<f32>((c.b - y) / CB_SCALE, (c.r - y) / CR_SCALE);
}

fn from_ycbcr(y: f32, c: vec2<f32>) -> vec3<f32> {
    let r = y + CR_SCALE * c.y;
    let b = y + CB_SCALE * c.x;
    let g = (y - KR * r - KB * b) / KG;
    return saturate(vec3<f32>(r, g, b));
}

fn ramp(lo: f32, hi: f32, x: f32) -> f32 {
    let t = saturate((x - lo) / (hi - lo));
    return t * t * (3.0 - 2.0 * t);
}

@compute @workgroup_size(8, 8, 1)
fn key_main(@builtin(global_invocation_id) gid: vec3<u32>) {
    if (gid.x >= params.size.x || gid.y >= params.size.y) {
        return;
    }
    let coords = vec2<i32>(gid.xy);
    let px = textureLoad(src_tex, coords, 0);
    let rgb = px.rgb;
    let key = params.key.rgb;

    let key_c = cbcr(key);
    let px_c = cbcr(rgb);
    let chroma = saturate(length(px_c - key_c) / max(length(key_c), MIN_KEY_CHROMA));
    let rgb_dist = length(rgb - key) / sqrt(3.0);
    let dist = saturate(mix(chroma, rgb_dist, params.shape.y));

    let threshold = params.key.w + params.shape.z;
    let width = max(params.shape.x + params.shape.w * 0.5, EPS);
    var alpha = ramp(threshold, threshold + width, dist);
    if (params.shape.w > 0.0) {
        alpha = pow(alpha, 1.0 / (1.0 + params.shape.w));
    }
    alpha = saturate((alpha - params.clip_spill.x) / max(params.clip_spill.y - params.clip_spill.x, EPS));

    let zone = saturate(1.0 - (dist - threshold) / max(4.0 * width + params.extra.x, EPS));
    let y = luma(rgb);
    var c = px_c;
    let key_len = length(key_c);
    if (key_len > EPS) {
        let dir = key_c / key_len;
        let along = max(dot(c, dir), 0.0);
        c = c - dir * (along * params.clip_spill.z * zone);
    }
    var out_rgb = from_ycbcr(y, c * (1.0 - zone * params.clip_spill.w));

    let edge = 4.0 * alpha * (1.0 - alpha);
    out_rgb = mix(out_rgb, key, saturate(edge * params.extra.y));

    let a = alpha * px.a;
    if (params.extra.z > 0.5) {
        textureStore(dst_tex, coords, vec4<f32>(a, a, a, 1.0));
        return;
    }
    textureStore(dst_tex, coords, vec4<f32>(out_rgb * a, a));
}
"#;

/// Parses and validates a WGSL kernel with naga before it reaches the device.
pub fn validate_kernel(source: &str) -> Result<()> {
    let module = naga::front::wgsl::parse_str(source).map_err(|e| Error::ShaderValidation {
        message: e.emit_to_string(source),
    })?;
    let mut validator = Validator::new(ValidationFlags::all(), Capabilities::all());
    validator
        .validate(&module)
        .map_err(|e| Error::ShaderValidation {
            message: format!("{:?}", e),
        })?;
    Ok(())
}

/// Render targets for one frame size.
struct KeyTargets {
    width: u32,
    height: u32,
    input: wgpu::Texture,
    bind_group: wgpu::BindGroup,
    output: wgpu::Texture,
    readback: Arc<wgpu::Buffer>,
    /// Set while a readback is mapped or pending. A buffer left pending by a
    /// timed-out wait is replaced, never reused.
    readback_busy: Arc<AtomicBool>,
    padded_bytes_per_row: u32,
}

/// GPU chroma keyer owning its pipeline and per-size render targets.
pub struct GpuKeyer {
    ctx: GpuContext,
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    params_buffer: wgpu::Buffer,
    targets: Option<KeyTargets>,
}

impl GpuKeyer {
    pub fn new(ctx: GpuContext) -> Result<Self> {
        Self::with_kernel(ctx, KEY_KERNEL_WGSL)
    }

    /// Builds the compute pipeline from `source`. Any failure here is final
    /// for this keyer.
    pub fn with_kernel(ctx: GpuContext, source: &str) -> Result<Self> {
        validate_kernel(source)?;

        let device = ctx.device.clone();
        let built = catch_unwind(AssertUnwindSafe(|| {
            let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("Chroma Key Kernel"),
                source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(source)),
            });

            let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("Chroma Key Bind Group Layout"),
                entries: &[
                    wgpu::BindGroupLayoutEntry {
                        binding: 0,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::Texture {
                            sample_type: wgpu::TextureSampleType::Float { filterable: false },
                            view_dimension: wgpu::TextureViewDimension::D2,
                            multisampled: false,
                        },
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: 1,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::StorageTexture {
                            access: wgpu::StorageTextureAccess::WriteOnly,
                            format: wgpu::TextureFormat::Rgba8Unorm,
                            view_dimension: wgpu::TextureViewDimension::D2,
                        },
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: 2,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::Buffer {
                            ty: wgpu::BufferBindingType::Uniform,
                            has_dynamic_offset: false,
                            min_binding_size: None,
                        },
                        count: None,
                    },
                ],
            });

            let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("Chroma Key Pipeline Layout"),
                bind_group_layouts: &[&bind_group_layout],
                immediate_size: 0,
            });

            let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("Chroma Key Pipeline"),
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point: Some("key_main"),
                compilation_options: Default::default(),
                cache: None,
            });

            let params_buffer = device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("Chroma Key Params"),
                size: std::mem::size_of::<KeyParams>() as wgpu::BufferAddress,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });

            (pipeline, bind_group_layout, params_buffer)
        }))
        .map_err(|_| Error::gpu("device rejected the chroma key pipeline"))?;

        let (pipeline, bind_group_layout, params_buffer) = built;
        info!("Chroma key compute pipeline ready");
        Ok(Self {
            ctx,
            pipeline,
            bind_group_layout,
            params_buffer,
            targets: None,
        })
    }

    fn new_readback(&self, padded_bytes_per_row: u32, height: u32) -> Arc<wgpu::Buffer> {
        Arc::new(self.ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Chroma Key Readback"),
            size: (padded_bytes_per_row * height) as wgpu::BufferAddress,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        }))
    }

    /// Rebuilds the targets when the frame size changes; the old entry is
    /// dropped instead of kept alongside. Creation runs in a validation
    /// error scope so a rejected size fails this frame instead of reaching
    /// the device's uncaptured-error handler.
    fn ensure_targets(&mut self, width: u32, height: u32) -> Result<()> {
        if let Some(targets) = &self.targets {
            if targets.width == width && targets.height == height {
                if targets.readback_busy.load(Ordering::Acquire) {
                    let fresh = self.new_readback(targets.padded_bytes_per_row, height);
                    if let Some(targets) = self.targets.as_mut() {
                        targets.readback = fresh;
                        targets.readback_busy = Arc::new(AtomicBool::new(false));
                    }
                }
                return Ok(());
            }
            debug!(
                "Evicting key targets {}x{} for {}x{}",
                targets.width, targets.height, width, height
            );
        }

        self.targets = None;
        let device = self.ctx.device.clone();
        let scope = device.push_error_scope(wgpu::ErrorFilter::Validation);
        let extent = wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        };
        let input = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Chroma Key Input"),
            size: extent,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let output = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Chroma Key Output"),
            size: extent,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::STORAGE_BINDING | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });

        let input_view = input.create_view(&wgpu::TextureViewDescriptor::default());
        let output_view = output.create_view(&wgpu::TextureViewDescriptor::default());
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Chroma Key Bind Group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&input_view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&output_view),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: self.params_buffer.as_entire_binding(),
                },
            ],
        });

        let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let padded_bytes_per_row = (width * 4).div_ceil(align) * align;
        let readback = self.new_readback(padded_bytes_per_row, height);
        if let Some(e) = pollster::block_on(scope.pop()) {
            return Err(Error::gpu(format!(
                "key targets for {width}x{height} rejected: {e}"
            )));
        }

        info!("Created chroma key targets for {}x{}", width, height);
        self.targets = Some(KeyTargets {
            width,
            height,
            input,
            bind_group,
            output,
            readback,
            readback_busy: Arc::new(AtomicBool::new(false)),
            padded_bytes_per_row,
        });
        Ok(())
    }
}

/// Rejects frames larger than the device can hold in one texture.
fn check_texture_size(width: u32, height: u32, max_dimension: u32) -> Result<()> {
    if width > max_dimension || height > max_dimension {
        return Err(Error::gpu(format!(
            "{width}x{height} frame exceeds the device texture limit of {max_dimension}"
        )));
    }
    Ok(())
}

impl KeyBackend for GpuKeyer {
    fn name(&self) -> &'static str {
        "gpu"
    }

    fn dispatch(
        &mut self,
        frame: &VideoFrame,
        settings: &ChromaKeySettings,
    ) -> Result<Box<dyn Completion>> {
        let upload_start = Instant::now();
        let rgba = frame.to_rgba()?;
        let (width, height) = (rgba.width, rgba.height);
        check_texture_size(width, height, self.ctx.device.limits().max_texture_dimension_2d)?;
        self.ensure_targets(width, height)?;
        let targets = self
            .targets
            .as_ref()
            .ok_or_else(|| Error::gpu("key targets missing"))?;

        let scope = self.ctx.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let params = KeyParams::new(settings, width, height);
        self.ctx
            .queue
            .write_buffer(&self.params_buffer, 0, bytemuck::cast_slice(&[params]));

        let extent = wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        };
        self.ctx.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &targets.input,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &rgba.data,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(width * 4),
                rows_per_image: Some(height),
            },
            extent,
        );
        debug!("  [Perf] Key upload: {:?}", upload_start.elapsed());

        let mut encoder = self
            .ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Chroma Key Encoder"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Chroma Key Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &targets.bind_group, &[]);
            pass.dispatch_workgroups(
                width.div_ceil(WORKGROUP_SIZE),
                height.div_ceil(WORKGROUP_SIZE),
                1,
            );
        }
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &targets.output,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &targets.readback,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(targets.padded_bytes_per_row),
                    rows_per_image: Some(height),
                },
            },
            extent,
        );
        let submission = self.ctx.queue.submit(std::iter::once(encoder.finish()));
        if let Some(e) = pollster::block_on(scope.pop()) {
            return Err(Error::gpu(format!("key dispatch rejected: {e}")));
        }

        targets.readback_busy.store(true, Ordering::Release);
        let (sender, receiver) = mpsc::channel();
        targets
            .readback
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |result| {
                let _ = sender.send(result);
            });

        Ok(Box::new(GpuCompletion {
            device: self.ctx.device.clone(),
            readback: targets.readback.clone(),
            busy: targets.readback_busy.clone(),
            receiver,
            submission,
            width,
            height,
            padded_bytes_per_row: targets.padded_bytes_per_row,
            timestamp_us: rgba.timestamp_us,
        }))
    }
}

struct GpuCompletion {
    device: Arc<wgpu::Device>,
    readback: Arc<wgpu::Buffer>,
    busy: Arc<AtomicBool>,
    receiver: Receiver<std::result::Result<(), wgpu::BufferAsyncError>>,
    submission: wgpu::SubmissionIndex,
    width: u32,
    height: u32,
    padded_bytes_per_row: u32,
    timestamp_us: Option<u64>,
}

impl Completion for GpuCompletion {
    fn wait(&mut self, timeout: Duration) -> Option<Result<VideoFrame>> {
        let deadline = Instant::now() + timeout;
        if self
            .device
            .poll(wgpu::PollType::Wait {
                submission_index: Some(self.submission.clone()),
                timeout: Some(timeout),
            })
            .is_err()
        {
            return None;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        match self.receiver.recv_timeout(remaining) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Some(Err(Error::gpu(format!("readback failed: {e}")))),
            Err(_) => return None,
        }

        let row_bytes = (self.width * 4) as usize;
        let mut data = Vec::with_capacity(row_bytes * self.height as usize);
        {
            let mapped = self.readback.slice(..).get_mapped_range();
            for row in mapped.chunks(self.padded_bytes_per_row as usize) {
                data.extend_from_slice(&row[..row_bytes]);
            }
        }
        self.readback.unmap();
        self.busy.store(false, Ordering::Release);

        Some(Ok(VideoFrame {
            width: self.width,
            height: self.height,
            format: PixelFormat::Rgba,
            timestamp_us: self.timestamp_us,
            premultiplied: true,
            data,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Rgb;

    #[test]
    fn test_kernel_validates() {
        validate_kernel(KEY_KERNEL_WGSL).unwrap();
    }

    #[test]
    fn test_broken_kernel_is_rejected() {
        let err = validate_kernel("@compute fn key_main( {").unwrap_err();
        assert!(matches!(err, Error::ShaderValidation { .. }));
    }

    #[test]
    fn test_texture_limit() {
        assert!(check_texture_size(3840, 2160, 8192).is_ok());
        assert!(check_texture_size(8192, 8192, 8192).is_ok());
        let err = check_texture_size(3840, 2160, 2048).unwrap_err();
        assert!(matches!(err, Error::Gpu { .. }));
        assert!(check_texture_size(16, 9000, 8192).is_err());
    }

    #[test]
    fn test_oversized_frame_fails_dispatch() {
        let Ok(ctx) = GpuContext::headless() else {
            eprintln!("no GPU adapter, skipping");
            return;
        };
        let max = ctx.device.limits().max_texture_dimension_2d;
        let mut keyer = GpuKeyer::new(ctx).unwrap();
        let frame = VideoFrame::solid(max + 1, 1, Rgb::GREEN);
        assert!(keyer.dispatch(&frame, &ChromaKeySettings::green()).is_err());
        // the keyer stays usable at a normal size
        let small = VideoFrame::solid(8, 8, Rgb::GREEN);
        let out = keyer
            .dispatch(&small, &ChromaKeySettings::green())
            .unwrap()
            .wait(Duration::from_secs(5))
            .unwrap()
            .unwrap();
        assert_eq!(out.pixel(4, 4), Some([0, 0, 0, 0]));
    }

    #[test]
    fn test_gpu_matches_cpu_reference() {
        let Ok(ctx) = GpuContext::headless() else {
            eprintln!("no GPU adapter, skipping");
            return;
        };
        let mut keyer = GpuKeyer::new(ctx).unwrap();
        let mut frame = VideoFrame::solid(37, 5, Rgb::GREEN);
        for (i, px) in frame.data.chunks_exact_mut(4).enumerate() {
            if i % 3 == 0 {
                px.copy_from_slice(&[180, 60, 40, 255]);
            }
        }
        let settings = ChromaKeySettings::green();
        let gpu = keyer
            .dispatch(&frame, &settings)
            .unwrap()
            .wait(Duration::from_secs(5))
            .unwrap()
            .unwrap();
        let cpu = super::super::kernel::key_frame(&frame, &KeyParams::new(&settings, 37, 5));
        assert_eq!(gpu.data.len(), cpu.data.len());
        for (g, c) in gpu.data.iter().zip(&cpu.data) {
            assert!(g.abs_diff(*c) <= 2, "gpu {g} vs cpu {c}");
        }
    }
}
