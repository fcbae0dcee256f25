//! Error types for the capture, preview and recording paths

use std::path::PathBuf;

/// Top-level error type for clipcam operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration, detected before capture starts.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// The sensor or capture driver failed to deliver a frame.
    #[error("Capture error: {message}")]
    Capture { message: String },

    /// The capture channel has ended and will produce no more frames.
    #[error("Frame source closed")]
    SourceClosed,

    /// Color conversion or JPEG encoding failed for a single preview frame.
    #[error("Transcode error: {message}")]
    Transcode { message: String },

    /// Encoder or muxer failure while writing a clip.
    #[error("Recording error for {}: {message}", .path.display())]
    Recording { path: PathBuf, message: String },

    /// A supervised task panicked or was aborted.
    #[error("Task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Settings(#[from] config::ConfigError),
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    pub fn capture(msg: impl Into<String>) -> Self {
        Self::Capture {
            message: msg.into(),
        }
    }

    pub fn transcode(msg: impl Into<String>) -> Self {
        Self::Transcode {
            message: msg.into(),
        }
    }

    pub fn recording(path: impl Into<PathBuf>, msg: impl Into<String>) -> Self {
        Self::Recording {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Whether the error only affects a single frame and the loop may continue.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Capture { .. } | Self::Transcode { .. })
    }
}
