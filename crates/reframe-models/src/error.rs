//! Error types for model parsing and crop plan persistence.

use std::path::PathBuf;

use thiserror::Error;

/// Result alias for crop plan operations.
pub type PlanResult<T> = Result<T, PlanError>;

/// Errors raised while loading, saving or validating a crop plan.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("Invalid crop plan{}: {message}", path_suffix(.path))]
    Invalid {
        path: Option<PathBuf>,
        message: String,
    },

    #[error("Crop plan version {found} is not supported (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PlanError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            path: None,
            message: message.into(),
        }
    }

    /// Attach the file the plan was read from.
    pub fn at_path(self, at: impl Into<PathBuf>) -> Self {
        match self {
            Self::Invalid { message, .. } => Self::Invalid {
                path: Some(at.into()),
                message,
            },
            Self::Json(e) => Self::Invalid {
                path: Some(at.into()),
                message: e.to_string(),
            },
            other => other,
        }
    }
}

fn path_suffix(path: &Option<PathBuf>) -> String {
    path.as_ref()
        .map(|p| format!(" ({})", p.display()))
        .unwrap_or_default()
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AspectRatioParseError {
    #[error("Invalid aspect ratio format: {0}, expected 'W:H'")]
    InvalidFormat(String),
    #[error("Invalid number in aspect ratio: {0}")]
    InvalidNumber(String),
    #[error("Aspect ratio cannot have zero values")]
    ZeroValue,
}
