//! Engine configuration.
//!
//! Loaded from YAML; every field has a default, so an empty file is a
//! valid config. `ConfigWatcher` reports edits to the file while running.

use crate::error::{Error, Result};
use crate::frame::Rgb;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};
use std::time::Duration;
use tracing::{error, info, warn};

/// Longest accepted auto transition.
pub const MAX_TRANSITION_SECS: f64 = 600.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Canvas width in pixels
    pub width: u32,
    /// Canvas height in pixels
    pub height: u32,
    /// Source pull and composite rate
    pub fps: u32,
    /// Preferred refresh of an attached render surface; not used for pulls
    pub render_fps: u32,
    pub keying_timeout_ms: u64,
    pub clear_preview_on_take: bool,
    pub default_transition_secs: f64,
    /// `#rrggbb`
    pub placeholder_color: String,
    /// `tracing` filter directive used when `RUST_LOG` is unset
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            fps: 30,
            render_fps: 60,
            keying_timeout_ms: 100,
            clear_preview_on_take: false,
            default_transition_secs: 1.0,
            placeholder_color: "#28282f".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        // an empty document parses as null
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::config(format!(
                "canvas size {}x{} must be non-zero",
                self.width, self.height
            )));
        }
        if self.fps == 0 || self.fps > 240 {
            return Err(Error::config(format!("fps {} out of range 1..=240", self.fps)));
        }
        if self.render_fps == 0 || self.render_fps > 240 {
            return Err(Error::config(format!(
                "render_fps {} out of range 1..=240",
                self.render_fps
            )));
        }
        if !(0.0..=MAX_TRANSITION_SECS).contains(&self.default_transition_secs) {
            return Err(Error::config(format!(
                "default_transition_secs {} out of range 0..={}",
                self.default_transition_secs, MAX_TRANSITION_SECS
            )));
        }
        if Rgb::from_hex(&self.placeholder_color).is_none() {
            return Err(Error::config(format!(
                "placeholder_color '{}' is not #rrggbb",
                self.placeholder_color
            )));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps.max(1) as f64)
    }

    pub fn keying_timeout(&self) -> Duration {
        Duration::from_millis(self.keying_timeout_ms)
    }

    pub fn placeholder_rgb(&self) -> Rgb {
        Rgb::from_hex(&self.placeholder_color).unwrap_or(Rgb::new(0x28, 0x28, 0x2f))
    }
}

/// Watches a config file and re-parses it on change.
pub struct ConfigWatcher {
    path: PathBuf,
    _watcher: RecommendedWatcher,
    rx: Receiver<std::result::Result<Event, notify::Error>>,
    current_config: Option<EngineConfig>,
}

impl ConfigWatcher {
    /// Create a new config watcher if a path is provided.
    pub fn new(path: Option<PathBuf>) -> Option<Self> {
        let path = path?;
        let (tx, rx) = channel();

        match RecommendedWatcher::new(tx, notify::Config::default()) {
            Ok(mut watcher) => {
                if let Err(e) = watcher.watch(&path, RecursiveMode::NonRecursive) {
                    warn!("Failed to watch config file {:?}: {}", path, e);
                    return None;
                }
                info!("Watching config file {:?} for changes", path);

                let current_config = EngineConfig::load(&path).ok();
                Some(Self {
                    path,
                    _watcher: watcher,
                    rx,
                    current_config,
                })
            }
            Err(e) => {
                warn!("Failed to create config watcher: {}", e);
                None
            }
        }
    }

    pub fn current(&self) -> Option<&EngineConfig> {
        self.current_config.as_ref()
    }

    /// Check for changes and return (old_config, new_config) if changed.
    pub fn check_for_changes(&mut self) -> Option<(Option<EngineConfig>, EngineConfig)> {
        let mut needs_reload = false;
        while let Ok(res) = self.rx.try_recv() {
            if let Ok(event) = res {
                if matches!(
                    event.kind,
                    notify::EventKind::Modify(_) | notify::EventKind::Create(_)
                ) {
                    needs_reload = true;
                }
            }
        }

        if needs_reload {
            info!("Config file changed, checking for updates...");
            match EngineConfig::load(&self.path) {
                Ok(new_config) => {
                    if self.current_config.as_ref() == Some(&new_config) {
                        return None;
                    }
                    let old = self.current_config.replace(new_config.clone());
                    return Some((old, new_config));
                }
                Err(e) => error!("Failed to reload config: {}", e),
            }
        }
        None
    }
}
