//! Keymix CLI: runs the switcher headless and writes Program to PNGs.

use anyhow::{anyhow, Result};
use clap::Parser;
use keymix::config::{ConfigWatcher, EngineConfig};
use keymix::frame::Rgb;
use keymix::gpu::GpuContext;
use keymix::keying::{cpu_keyer_factory, gpu_keyer_factory, ChromaKeySettings, KeyerFactory};
use keymix::layer::Layer;
use keymix::output::PngSequenceOutput;
use keymix::source::{
    FfmpegDecoder, FrameSource, Source, SourceDirectory, SourceRegistry, TestPattern,
};
use keymix::Engine;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Real-time Preview/Program switcher with PiP layers and chroma keying.
///
/// Sources are given as `camera:<index>`, `media:<path>`, `bars` or
/// `color:<rrggbb>`. Append `,key` to a layer source to key out green.
#[derive(Parser, Debug)]
#[command(name = "keymix")]
#[command(about = "Preview/Program video switcher with PiP layers and chroma keying")]
struct Args {
    /// YAML engine config; watched for live changes
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Source loaded into Program at start
    #[arg(long, default_value = "bars")]
    program: String,

    /// Source loaded into Preview at start
    #[arg(long)]
    preview: Option<String>,

    /// Overlay layer source (repeatable)
    #[arg(short, long)]
    layer: Vec<String>,

    /// Stop after this many published frames
    #[arg(long)]
    frames: Option<u64>,

    /// Directory for the Program PNG sequence
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Cut Preview to Program after this many seconds
    #[arg(long)]
    take_after: Option<f64>,

    /// Start an auto transition after this many seconds
    #[arg(long)]
    transition_after: Option<f64>,

    /// Key on the CPU even if a GPU is available
    #[arg(long)]
    cpu_keying: bool,

    /// List available cameras and exit
    #[arg(long)]
    list_devices: bool,
}

/// Footprints for successive layers: the four corners.
const LAYER_SLOTS: [[f32; 2]; 4] = [[0.8, 0.2], [0.2, 0.2], [0.8, 0.8], [0.2, 0.8]];

/// Parses a source spec and registers the live source it needs.
fn parse_source(spec: &str, directory: &SourceDirectory, config: &EngineConfig) -> Result<Source> {
    let (kind, value) = spec.split_once(':').unwrap_or((spec, ""));
    match kind {
        "bars" => {
            if !directory.contains("bars") {
                let bars = TestPattern::bars(config.width, config.height);
                directory.insert("bars", Arc::new(bars) as Arc<dyn FrameSource>);
            }
            Ok(Source::Virtual("bars".into()))
        }
        "color" => {
            let color = Rgb::from_hex(value).ok_or_else(|| anyhow!("Invalid color '{}'", value))?;
            let id = format!("color-{}", value.trim_start_matches('#').to_lowercase());
            if !directory.contains(&id) {
                let solid = TestPattern::solid(config.width, config.height, color);
                directory.insert(id.clone(), Arc::new(solid) as Arc<dyn FrameSource>);
            }
            Ok(Source::Virtual(id))
        }
        "media" if !value.is_empty() => Ok(Source::media(value)),
        "camera" => {
            let index: u32 = value
                .parse()
                .map_err(|_| anyhow!("Invalid camera index '{}'", value))?;
            let id = format!("cam-{index}");
            if !directory.contains(&id) {
                open_camera(directory, &id, index, config);
            }
            Ok(Source::Camera(id))
        }
        _ => Err(anyhow!(
            "Unknown source '{}'; expected camera:<index>, media:<path>, bars or color:<hex>",
            spec
        )),
    }
}

#[cfg(feature = "camera")]
fn open_camera(directory: &SourceDirectory, id: &str, index: u32, config: &EngineConfig) {
    use keymix::source::{CameraFeed, CaptureConfig, NokhwaCapture};
    info!("Opening camera device {}...", index);
    let feed = CameraFeed::open::<NokhwaCapture>(
        id,
        CaptureConfig {
            device_index: index,
            width: config.width,
            height: config.height,
            fps: config.fps,
        },
    );
    directory.insert(id, Arc::new(feed) as Arc<dyn FrameSource>);
}

#[cfg(not(feature = "camera"))]
fn open_camera(_directory: &SourceDirectory, id: &str, index: u32, _config: &EngineConfig) {
    warn!(
        "Built without the `camera` feature; camera {} ({}) will show a placeholder",
        index, id
    );
}

fn list_devices() {
    #[cfg(feature = "camera")]
    {
        use keymix::source::{CaptureBackend, NokhwaCapture};
        println!("Available cameras:");
        match NokhwaCapture::list_devices() {
            Ok(devices) => {
                for device in devices {
                    println!("  [{}] {}", device.index, device.name);
                }
            }
            Err(e) => eprintln!("Failed to list devices: {}", e),
        }
    }
    #[cfg(not(feature = "camera"))]
    eprintln!("Camera support not compiled in; rebuild with --features camera");
}

fn keyer_factory(force_cpu: bool) -> KeyerFactory {
    if force_cpu {
        info!("Using CPU keying");
        return cpu_keyer_factory();
    }
    match GpuContext::headless() {
        Ok(ctx) => gpu_keyer_factory(ctx),
        Err(e) => {
            warn!("No GPU available ({}), keying on the CPU", e);
            cpu_keyer_factory()
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => EngineConfig::load(path),
        None => Ok(EngineConfig::default()),
    };
    let level = config
        .as_ref()
        .map(|c| c.log_level.clone())
        .unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();
    let config = config?;

    if args.list_devices {
        list_devices();
        return Ok(());
    }

    info!("Starting Keymix...");

    let directory = Arc::new(SourceDirectory::new());
    let registry = SourceRegistry::new()
        .with_cameras(directory.clone())
        .with_virtual_cameras(directory.clone())
        .with_media(Arc::new(FfmpegDecoder));
    let engine = Engine::new(&config, registry, Some(keyer_factory(args.cpu_keying)));

    engine.load_to_program(parse_source(&args.program, &directory, &config)?);
    if let Some(spec) = &args.preview {
        engine.load_to_preview(parse_source(spec, &directory, &config)?);
    }
    for (i, spec) in args.layer.iter().enumerate() {
        let (spec, keyed) = match spec.strip_suffix(",key") {
            Some(base) => (base, true),
            None => (spec.as_str(), false),
        };
        let source = parse_source(spec, &directory, &config)?;
        let mut layer = Layer::new(format!("layer {}", i + 1), source)
            .with_z(i as i32)
            .with_geometry(LAYER_SLOTS[i % LAYER_SLOTS.len()], [0.3, 0.3]);
        if keyed {
            layer = layer.with_chroma_key(ChromaKeySettings::green());
        }
        engine.add_layer(layer);
    }

    if let Some(dir) = &args.output {
        let mut sink = PngSequenceOutput::new(dir)?;
        if let Some(frames) = args.frames {
            sink = sink.with_limit(frames);
        }
        engine.add_sink(Box::new(sink));
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("Received interrupt signal, shutting down...");
        r.store(false, Ordering::SeqCst);
    })?;

    let mut watcher = ConfigWatcher::new(args.config.clone());
    let ready = engine.subscribe();
    let mut clock = engine.start_clock();
    let start = Instant::now();
    let mut take_pending = args.take_after;
    let mut transition_pending = args.transition_after;
    let mut published = 0u64;

    while running.load(Ordering::SeqCst) {
        match ready.recv_timeout(Duration::from_millis(50)) {
            Ok(frame) => published = frame.sequence,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if args.frames.is_some_and(|limit| published >= limit) {
            info!("Published {} frames, stopping", published);
            break;
        }

        let elapsed = start.elapsed().as_secs_f64();
        if take_pending.is_some_and(|at| elapsed >= at) {
            take_pending = None;
            if !engine.take() {
                warn!("Take ignored: nothing in Preview");
            }
        }
        if transition_pending.is_some_and(|at| elapsed >= at) {
            transition_pending = None;
            if !engine.auto() {
                warn!("Transition ignored: nothing in Preview");
            }
        }

        if let Some((_, new_config)) = watcher.as_mut().and_then(|w| w.check_for_changes()) {
            engine.apply_config(&new_config);
        }
    }

    clock.stop();
    let stats = engine.stats();
    info!(
        "Stopped: {} frames published, {} ticks skipped, {} key timeouts",
        stats.frames_published, stats.skipped_ticks, stats.keying.timeouts
    );
    Ok(())
}
