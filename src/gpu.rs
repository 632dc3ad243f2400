//! Shared GPU context for wgpu resources.
//!
//! The engine never initializes a backend on its own: a `GpuContext` is
//! handed in by whoever owns the device. `headless()` exists for the CLI and
//! for tests that want a real adapter.

use anyhow::{anyhow, Result};
use std::sync::Arc;

/// Device and queue shared by every GPU stage of the engine.
#[derive(Clone)]
pub struct GpuContext {
    pub device: Arc<wgpu::Device>,
    pub queue: Arc<wgpu::Queue>,
}

impl GpuContext {
    /// Wraps an existing device and queue.
    pub fn from_device_queue(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>) -> Self {
        Self { device, queue }
    }

    /// Initialize a GPU context for offscreen compute. Uncaptured device
    /// errors are logged rather than left to wgpu's default handler, which
    /// panics.
    pub fn headless() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|_| anyhow!("Failed to obtain GPU adapter"))?;

        let info = adapter.get_info();
        tracing::info!("Using GPU adapter {} ({:?})", info.name, info.backend);

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("Keymix Device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            ..Default::default()
        }))?;
        device.on_uncaptured_error(Arc::new(|e: wgpu::Error| {
            tracing::error!("Uncaptured GPU error: {}", e);
        }));

        Ok(Self {
            device: Arc::new(device),
            queue: Arc::new(queue),
        })
    }
}
