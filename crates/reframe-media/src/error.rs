//! Media error types.

use std::path::PathBuf;

use reframe_models::{AspectRatio, PlanError};
use reframe_storage::StorageError;
use thiserror::Error;

/// Result type for media operations.
pub type MediaResult<T> = Result<T, MediaError>;

/// Errors that can occur while analyzing or rendering video.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("FFmpeg not found in PATH")]
    FfmpegNotFound,

    #[error("FFprobe not found in PATH")]
    FfprobeNotFound,

    #[error("FFmpeg failed: {message}{}", stderr_suffix(.stderr))]
    FfmpegFailed {
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    /// The source could not be opened or decoded. Fatal for the analysis.
    #[error("Cannot open video {}: {message}", .path.display())]
    VideoOpen { path: PathBuf, message: String },

    /// A detector backend failed to initialize or run. The shot falls back to saliency framing.
    #[error("Detection backend failed{}: {message}", shot_suffix(.shot_id))]
    DetectionBackend {
        shot_id: Option<u32>,
        message: String,
    },

    /// External encode failure for one output aspect ratio.
    #[error("Render failed for {aspect}: {message}{}", stderr_suffix(.stderr))]
    Render {
        aspect: AspectRatio,
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    #[error(transparent)]
    InvalidCropPlan(#[from] PlanError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid video: {0}")]
    InvalidVideo(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn stderr_suffix(stderr: &Option<String>) -> String {
    match stderr {
        Some(s) if !s.trim().is_empty() => format!("\n{}", s.trim_end()),
        _ => String::new(),
    }
}

fn shot_suffix(shot_id: &Option<u32>) -> String {
    shot_id.map(|id| format!(" (shot {})", id)).unwrap_or_default()
}

impl MediaError {
    pub fn ffmpeg_failed(
        message: impl Into<String>,
        stderr: Option<String>,
        exit_code: Option<i32>,
    ) -> Self {
        Self::FfmpegFailed {
            message: message.into(),
            stderr,
            exit_code,
        }
    }

    pub fn video_open(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::VideoOpen {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn detection_backend(message: impl Into<String>) -> Self {
        Self::DetectionBackend {
            shot_id: None,
            message: message.into(),
        }
    }

    pub fn render_failed(aspect: AspectRatio, message: impl Into<String>) -> Self {
        Self::Render {
            aspect,
            message: message.into(),
            stderr: None,
            exit_code: None,
        }
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Attach the shot a detection failure happened in.
    pub fn in_shot(self, id: u32) -> Self {
        match self {
            Self::DetectionBackend { message, .. } => Self::DetectionBackend {
                shot_id: Some(id),
                message,
            },
            other => other,
        }
    }

    /// Re-label an encode failure with the aspect ratio being rendered.
    pub fn for_aspect(self, aspect: AspectRatio) -> Self {
        match self {
            Self::FfmpegFailed {
                message,
                stderr,
                exit_code,
            } => Self::Render {
                aspect,
                message,
                stderr,
                exit_code,
            },
            Self::Render { .. } => self,
            other => Self::Render {
                aspect,
                message: other.to_string(),
                stderr: None,
                exit_code: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_error_carries_context() {
        let err = MediaError::ffmpeg_failed(
            "segment 2 encode",
            Some("Error opening output file".to_string()),
            Some(1),
        )
        .for_aspect(AspectRatio::PORTRAIT);

        let text = err.to_string();
        assert!(text.contains("9:16"));
        assert!(text.contains("segment 2 encode"));
        assert!(text.contains("Error opening output file"));
    }

    #[test]
    fn test_detection_error_shot_context() {
        let err = MediaError::detection_backend("session lost").in_shot(4);
        assert_eq!(err.to_string(), "Detection backend failed (shot 4): session lost");
    }
}
