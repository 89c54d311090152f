//! Crop window computation for different aspect ratios.
//!
//! This module converts camera keyframes to integer crop windows that keep
//! the target aspect ratio, respect the zoom limits and stay inside the
//! source frame.

use reframe_models::{AspectRatio, CameraKeyframe, CropWindow, ShotCameraPlan, ShotCropPlan};

use super::config::ReframeConfig;

/// Fraction of the crop height the headroom ratio is scaled by.
const HEADROOM_SHIFT: f64 = 0.3;

/// Crop planner for one source frame size.
#[derive(Debug, Clone)]
pub struct CropPlanner {
    safe_margin: f64,
    headroom_ratio: f64,
    max_zoom_factor: f64,
    min_zoom_factor: f64,
    frame_width: u32,
    frame_height: u32,
}

impl CropPlanner {
    pub fn new(config: &ReframeConfig, frame_width: u32, frame_height: u32) -> Self {
        Self {
            safe_margin: config.safe_margin,
            headroom_ratio: config.headroom_ratio,
            max_zoom_factor: config.max_zoom_factor,
            min_zoom_factor: config.min_zoom_factor,
            frame_width,
            frame_height,
        }
    }

    /// Crop windows for one shot's camera plan at one aspect ratio.
    pub fn plan_shot(&self, camera: &ShotCameraPlan, aspect_ratio: AspectRatio) -> ShotCropPlan {
        ShotCropPlan {
            shot_id: camera.shot_id,
            aspect_ratio,
            crop_windows: self.compute_crop_windows(&camera.keyframes, aspect_ratio),
        }
    }

    /// Compute crop windows for camera keyframes.
    pub fn compute_crop_windows(&self, keyframes: &[CameraKeyframe], aspect_ratio: AspectRatio) -> Vec<CropWindow> {
        keyframes
            .iter()
            .map(|kf| self.keyframe_to_crop(kf, aspect_ratio))
            .collect()
    }

    /// Convert a camera keyframe to a crop window.
    ///
    /// The crop is centered on the focus point, shifted up to leave headroom,
    /// then clamped and rounded to whole pixels.
    pub fn keyframe_to_crop(&self, keyframe: &CameraKeyframe, aspect_ratio: AspectRatio) -> CropWindow {
        let (crop_width, crop_height) = self.crop_size(keyframe, aspect_ratio.ratio());
        let (fw, fh) = (self.frame_width as f64, self.frame_height as f64);

        let x = keyframe.cx - crop_width / 2.0;
        let y = keyframe.cy - crop_height / 2.0 - self.headroom_ratio * HEADROOM_SHIFT * crop_height;
        let x = x.max(0.0).min(fw - crop_width);
        let y = y.max(0.0).min(fh - crop_height);

        let width = (crop_width.round() as i32).clamp(1, self.frame_width.max(1) as i32);
        let height = (crop_height.round() as i32).clamp(1, self.frame_height.max(1) as i32);
        let x = (x.round() as i32).clamp(0, self.frame_width as i32 - width);
        let y = (y.round() as i32).clamp(0, self.frame_height as i32 - height);

        CropWindow::new(keyframe.time, x, y, width, height)
    }

    /// Crop dimensions in source pixels for a keyframe's focus box.
    ///
    /// Narrow targets (ratio at most the source ratio) derive height first;
    /// wide targets derive width first. Zoom limits are applied along the
    /// derived axis. When the zoom limit forces the crop past the frame on the
    /// other axis, that axis is clamped to the frame and the window no longer
    /// matches the target ratio exactly.
    pub fn crop_size(&self, keyframe: &CameraKeyframe, target_ratio: f64) -> (f64, f64) {
        let (fw, fh) = (self.frame_width as f64, self.frame_height as f64);
        let source_ratio = fw / fh;

        let required_width = keyframe.width * (1.0 + 2.0 * self.safe_margin);
        let required_height = keyframe.height * (1.0 + 2.0 * self.safe_margin);

        let (w, h) = if target_ratio <= source_ratio {
            let mut h = required_height.max(required_width / target_ratio).min(fh);
            let mut w = h * target_ratio;
            if w > fw {
                w = fw;
                h = w / target_ratio;
            }

            let zoom = fw / w;
            if zoom > self.max_zoom_factor {
                w = fw / self.max_zoom_factor;
                h = w / target_ratio;
            } else if zoom < self.min_zoom_factor {
                w = fw / self.min_zoom_factor;
                h = w / target_ratio;
            }
            (w, h)
        } else {
            let mut w = required_width.max(required_height * target_ratio).min(fw);
            let mut h = w / target_ratio;
            if h > fh {
                h = fh;
                w = h * target_ratio;
            }

            let zoom = fh / h;
            if zoom > self.max_zoom_factor {
                h = fh / self.max_zoom_factor;
                w = h * target_ratio;
            } else if zoom < self.min_zoom_factor {
                h = fh / self.min_zoom_factor;
                w = h * target_ratio;
            }
            (w, h)
        };

        (w.min(fw), h.min(fh))
    }
}
