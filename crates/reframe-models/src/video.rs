//! Source video facts.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Facts about the source video an analysis ran against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoMeta {
    pub path: PathBuf,
    /// Duration in seconds
    pub duration: f64,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Frame rate (fps)
    pub fps: f64,
}

impl VideoMeta {
    /// Source `width / height`.
    pub fn ratio(&self) -> f64 {
        self.width as f64 / self.height.max(1) as f64
    }
}
