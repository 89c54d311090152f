//! Virtual camera keyframes and per-shot camera plans.

use serde::{Deserialize, Serialize};

use crate::geometry::BoundingBox;

/// One instant of virtual-camera focus.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraKeyframe {
    /// Timestamp in seconds
    pub time: f64,
    /// Focus center x-coordinate
    pub cx: f64,
    /// Focus center y-coordinate
    pub cy: f64,
    /// Focus region width
    pub width: f64,
    /// Focus region height
    pub height: f64,
}

impl CameraKeyframe {
    pub fn new(time: f64, cx: f64, cy: f64, width: f64, height: f64) -> Self {
        Self {
            time,
            cx,
            cy,
            width,
            height,
        }
    }

    pub fn from_focus(time: f64, focus: &BoundingBox) -> Self {
        Self::new(time, focus.cx(), focus.cy(), focus.width, focus.height)
    }

    /// Focus region as a box.
    pub fn focus(&self) -> BoundingBox {
        BoundingBox::from_center(self.cx, self.cy, self.width, self.height)
    }
}

/// How the virtual camera behaves within a shot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraMode {
    /// Fixed framing for the whole shot
    Static,
    /// Camera follows the subject
    Tracking,
    /// Focus extent varies noticeably
    Zoom,
}

impl std::fmt::Display for CameraMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CameraMode::Static => "static",
            CameraMode::Tracking => "tracking",
            CameraMode::Zoom => "zoom",
        };
        f.write_str(name)
    }
}

/// Smoothed camera path for a shot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShotCameraPlan {
    pub shot_id: u32,
    pub mode: CameraMode,
    pub keyframes: Vec<CameraKeyframe>,
}
