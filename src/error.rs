//! Error types for the switching engine.
//!
//! Most runtime failures never surface as errors: the engine degrades to
//! passthrough, placeholders or stale frames instead. These variants cover
//! construction-time and I/O failures.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("GPU error: {message}")]
    Gpu { message: String },

    #[error("Keying kernel failed validation: {message}")]
    ShaderValidation { message: String },

    #[error("Source error: {message}")]
    Source { message: String },

    #[error("Invalid frame: {message}")]
    InvalidFrame { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("File not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn gpu(msg: impl Into<String>) -> Self {
        Self::Gpu {
            message: msg.into(),
        }
    }

    pub fn source(msg: impl Into<String>) -> Self {
        Self::Source {
            message: msg.into(),
        }
    }

    pub fn invalid_frame(msg: impl Into<String>) -> Self {
        Self::InvalidFrame {
            message: msg.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(
            Error::gpu("no adapter").to_string(),
            "GPU error: no adapter"
        );
        assert_eq!(
            Error::invalid_frame("zero size").to_string(),
            "Invalid frame: zero size"
        );
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
