//! Pixel crop windows per target aspect ratio.

use serde::{Deserialize, Serialize};

use crate::geometry::AspectRatio;

/// Source-pixel rectangle extracted for output at a given time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CropWindow {
    /// Timestamp in seconds
    pub time: f64,
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl CropWindow {
    pub fn new(time: f64, x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            time,
            x,
            y,
            width,
            height,
        }
    }

    /// True when the window lies within a `frame_width x frame_height` frame.
    pub fn fits_within(&self, frame_width: u32, frame_height: u32) -> bool {
        self.width >= 1
            && self.height >= 1
            && self.x >= 0
            && self.y >= 0
            && self.x + self.width <= frame_width as i32
            && self.y + self.height <= frame_height as i32
    }

    #[inline]
    pub fn ratio(&self) -> f64 {
        self.width as f64 / self.height.max(1) as f64
    }

    /// Same rectangle at a different time.
    pub fn at(&self, time: f64) -> Self {
        Self { time, ..*self }
    }
}

/// Crop windows for one (shot, aspect ratio) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShotCropPlan {
    pub shot_id: u32,
    pub aspect_ratio: AspectRatio,
    pub crop_windows: Vec<CropWindow>,
}
