//! Keymix: real-time Preview/Program video switcher
//!
//! Pulls camera, media and synthetic sources on a fixed clock, keys layers
//! on the GPU, composites picture-in-picture layers over the Program bus and
//! publishes the result.

pub mod audio;
pub mod bus;
pub mod clock;
pub mod compositor;
pub mod config;
pub mod effects;
pub mod engine;
pub mod error;
pub mod frame;
pub mod gpu;
pub mod keying;
pub mod layer;
pub mod output;
pub mod placeholder;
pub mod source;

pub use engine::{Engine, EngineStats, FrameReady};
pub use error::{Error, Result};
