//! Fallback focus regions for shots without a usable subject.

use image::{imageops, GrayImage};

use reframe_models::BoundingBox;

use super::config::FallbackPolicy;
use crate::frames::Frame;

const GRID_COLS: u32 = 16;
const GRID_ROWS: u32 = 9;

/// Produces a focus box in source pixels according to a [`FallbackPolicy`].
#[derive(Debug, Clone, Copy)]
pub struct SaliencyEstimator {
    policy: FallbackPolicy,
}

impl SaliencyEstimator {
    pub fn new(policy: FallbackPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> FallbackPolicy {
        self.policy
    }

    /// Focus region for a `width` x `height` source.
    ///
    /// `frame` is only consulted by [`FallbackPolicy::Saliency`]; without one
    /// that policy behaves like [`FallbackPolicy::UpperCenter`].
    pub fn focus(&self, width: u32, height: u32, frame: Option<&Frame>) -> BoundingBox {
        let (w, h) = (width as f64, height as f64);
        match self.policy {
            FallbackPolicy::Center => BoundingBox::from_center(w / 2.0, h / 2.0, 0.6 * w, 0.6 * h),
            FallbackPolicy::UpperCenter => upper_center(w, h),
            FallbackPolicy::RuleOfThirds => {
                BoundingBox::from_center(w / 2.0, h / 3.0, 0.6 * w, 0.45 * h).clamp(width, height)
            }
            FallbackPolicy::Saliency => match frame {
                Some(frame) => saliency_focus(frame, width, height),
                None => upper_center(w, h),
            },
        }
    }
}

fn upper_center(w: f64, h: f64) -> BoundingBox {
    BoundingBox::new(0.25 * w, 0.15 * h, 0.5 * w, 0.5 * h)
}

/// Edge density per grid cell, weighted toward the center and upper half.
pub fn saliency_map(gray: &GrayImage) -> Vec<f64> {
    let (width, height) = gray.dimensions();
    let mut map = vec![0f64; (GRID_COLS * GRID_ROWS) as usize];
    if width < 3 || height < 3 {
        return map;
    }

    let mut counts = vec![0u32; map.len()];
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let gx = gray.get_pixel(x + 1, y)[0] as f64 - gray.get_pixel(x - 1, y)[0] as f64;
            let gy = gray.get_pixel(x, y + 1)[0] as f64 - gray.get_pixel(x, y - 1)[0] as f64;
            let col = (x * GRID_COLS / width).min(GRID_COLS - 1);
            let row = (y * GRID_ROWS / height).min(GRID_ROWS - 1);
            let idx = (row * GRID_COLS + col) as usize;
            map[idx] += (gx * gx + gy * gy).sqrt();
            counts[idx] += 1;
        }
    }

    for row in 0..GRID_ROWS {
        for col in 0..GRID_COLS {
            let idx = (row * GRID_COLS + col) as usize;
            let density = if counts[idx] > 0 {
                map[idx] / counts[idx] as f64
            } else {
                0.0
            };
            let nx = (col as f64 + 0.5) / GRID_COLS as f64 - 0.5;
            let ny = (row as f64 + 0.5) / GRID_ROWS as f64;
            let center_bias = 1.0 - nx.abs();
            let upper_bias = 1.0 - 0.5 * ny;
            map[idx] = density * center_bias * upper_bias;
        }
    }
    map
}

/// Weighted centroid of the saliency map as a half-frame focus box.
fn saliency_focus(frame: &Frame, width: u32, height: u32) -> BoundingBox {
    let gray = imageops::grayscale(&frame.image);
    let map = saliency_map(&gray);
    let total: f64 = map.iter().sum();
    let (w, h) = (width as f64, height as f64);
    if total <= 1e-9 {
        return upper_center(w, h);
    }

    let (mut cx, mut cy) = (0.0, 0.0);
    for row in 0..GRID_ROWS {
        for col in 0..GRID_COLS {
            let weight = map[(row * GRID_COLS + col) as usize] / total;
            cx += weight * (col as f64 + 0.5) / GRID_COLS as f64;
            cy += weight * (row as f64 + 0.5) / GRID_ROWS as f64;
        }
    }

    BoundingBox::from_center(cx * w, cy * h, 0.5 * w, 0.5 * h).clamp(width, height)
}
