//! Active-subject selection for multi-subject shots.
//!
//! Each tracked subject gets a per-sample activity score from up to three
//! visual cues:
//! - Mouth openness from lip landmarks, normalized by face height
//! - Motion inside the subject box, from sparse optical flow over
//!   Shi-Tomasi corners (frame differencing when the region lacks texture)
//! - Growth of box area and detector confidence over a short window
//!
//! [`TemporalActivityTracker`] smooths those scores per track and picks the
//! active subject with hysteresis so the camera does not flicker between
//! speakers.

use std::collections::HashMap;

use image::{imageops, GrayImage};
use tracing::debug;

use reframe_models::BoundingBox;

use super::config::ReframeConfig;
use crate::frames::Frame;

/// Margin by which a candidate must beat the active subject to take over.
pub const SWITCH_MARGIN: f64 = 0.2;

/// Typical lip-gap / face-height range, remapped to `[0, 1]`.
const MOUTH_OPENNESS_RANGE: (f64, f64) = (0.01, 0.08);

const MAX_CORNERS: usize = 50;
const MIN_CORNERS: usize = 6;
const CORNER_SPACING: f64 = 4.0;
const FLOW_HALF_WINDOW: i32 = 3;
const FLOW_ITERATIONS: usize = 10;

/// Settings for activity scoring and active-subject switching.
#[derive(Debug, Clone)]
pub struct ActivityConfig {
    pub enable_mouth: bool,
    pub enable_motion: bool,
    pub enable_size: bool,
    pub weight_mouth: f64,
    pub weight_motion: f64,
    pub weight_size: f64,
    /// Seconds of history for smoothing and size trends
    pub window: f64,
    pub min_switch_duration: f64,
    pub smoothing_alpha: f64,
    pub switch_margin: f64,
}

impl ActivityConfig {
    pub fn from_config(config: &ReframeConfig) -> Self {
        Self {
            enable_mouth: config.enable_mouth_cue,
            enable_motion: config.enable_motion_cue,
            enable_size: config.enable_size_cue,
            weight_mouth: config.activity_weight_mouth,
            weight_motion: config.activity_weight_motion,
            weight_size: config.activity_weight_size,
            window: config.face_activity_window,
            min_switch_duration: config.min_switch_duration,
            smoothing_alpha: config.activity_smoothing_alpha,
            switch_margin: SWITCH_MARGIN,
        }
    }
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self::from_config(&ReframeConfig::default())
    }
}

/// Source of lip landmarks for the mouth cue.
pub trait LandmarkProvider: Send {
    /// Vertical distance between inner lips in frame pixels, `None` when
    /// the face is not usable.
    fn lip_distance(&mut self, frame: &Frame, face: &BoundingBox) -> Option<f64>;
}

/// Lip-gap estimate from the darkest horizontal band in the mouth area.
///
/// An open mouth shows as a run of rows clearly darker than the surrounding
/// skin; the run length stands in for the inner-lip distance.
#[derive(Debug, Clone, Default)]
pub struct DarkBandLipEstimator;

impl LandmarkProvider for DarkBandLipEstimator {
    fn lip_distance(&mut self, frame: &Frame, face: &BoundingBox) -> Option<f64> {
        let mouth = BoundingBox::new(
            face.x + 0.3 * face.width,
            face.y + 0.55 * face.height,
            0.4 * face.width,
            0.4 * face.height,
        )
        .intersect_frame(frame.width(), frame.height());

        let (x0, y0) = (mouth.x.floor() as u32, mouth.y.floor() as u32);
        let (x1, y1) = (mouth.x2().ceil() as u32, mouth.y2().ceil() as u32);
        if x1 <= x0 + 1 || y1 < y0 + 4 {
            return None;
        }

        let row_means: Vec<f64> = (y0..y1.min(frame.height()))
            .map(|y| {
                let sum: f64 = (x0..x1.min(frame.width()))
                    .map(|x| {
                        let p = frame.image.get_pixel(x, y);
                        0.299 * p[0] as f64 + 0.587 * p[1] as f64 + 0.114 * p[2] as f64
                    })
                    .sum();
                sum / (x1 - x0) as f64
            })
            .collect();

        let skin = row_means.iter().copied().fold(0.0, f64::max);
        if skin <= 0.0 {
            return None;
        }

        let mut longest = 0usize;
        let mut run = 0usize;
        for mean in &row_means {
            if *mean < 0.6 * skin {
                run += 1;
                longest = longest.max(run);
            } else {
                run = 0;
            }
        }
        Some(longest as f64)
    }
}

/// Remap a lip-gap / face-height ratio into `[0, 1]`.
pub fn mouth_openness_score(lip_distance: f64, face_height: f64) -> f64 {
    if face_height <= 0.0 {
        return 0.0;
    }
    let ratio = lip_distance / face_height;
    let (lo, hi) = MOUTH_OPENNESS_RANGE;
    ((ratio - lo) / (hi - lo)).clamp(0.0, 1.0)
}

/// Pixel bounds of a box inside an image, leaving a one pixel border for gradients.
fn region_bounds(bbox: &BoundingBox, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
    if width < 3 || height < 3 {
        return None;
    }
    let x0 = (bbox.x.floor().max(1.0) as u32).min(width - 2);
    let y0 = (bbox.y.floor().max(1.0) as u32).min(height - 2);
    let x1 = (bbox.x2().ceil().max(0.0) as u32).min(width - 1);
    let y1 = (bbox.y2().ceil().max(0.0) as u32).min(height - 1);
    (x1 > x0 + 2 && y1 > y0 + 2).then_some((x0, y0, x1, y1))
}

#[inline]
fn px(img: &GrayImage, x: u32, y: u32) -> f64 {
    img.get_pixel(x, y)[0] as f64
}

/// Bilinear sample with edge clamping.
fn sample(img: &GrayImage, x: f64, y: f64) -> f64 {
    let max_x = (img.width() - 1) as f64;
    let max_y = (img.height() - 1) as f64;
    let x = x.clamp(0.0, max_x);
    let y = y.clamp(0.0, max_y);
    let (x0, y0) = (x.floor(), y.floor());
    let (x1, y1) = ((x0 + 1.0).min(max_x), (y0 + 1.0).min(max_y));
    let (fx, fy) = (x - x0, y - y0);

    let top = px(img, x0 as u32, y0 as u32) * (1.0 - fx) + px(img, x1 as u32, y0 as u32) * fx;
    let bottom = px(img, x0 as u32, y1 as u32) * (1.0 - fx) + px(img, x1 as u32, y1 as u32) * fx;
    top * (1.0 - fy) + bottom * fy
}

/// Shi-Tomasi corners (minimum eigenvalue of the 3x3 structure tensor) in a region.
pub fn good_features(gray: &GrayImage, bounds: (u32, u32, u32, u32)) -> Vec<(f64, f64)> {
    let (x0, y0, x1, y1) = bounds;
    let (w, h) = ((x1 - x0) as usize, (y1 - y0) as usize);
    if w < 5 || h < 5 {
        return Vec::new();
    }

    let mut ixx = vec![0f64; w * h];
    let mut ixy = vec![0f64; w * h];
    let mut iyy = vec![0f64; w * h];
    for y in 0..h {
        for x in 0..w {
            let (gx_, gy_) = (x0 + x as u32, y0 + y as u32);
            let gx = (px(gray, gx_ + 1, gy_) - px(gray, gx_ - 1, gy_)) / 2.0;
            let gy = (px(gray, gx_, gy_ + 1) - px(gray, gx_, gy_ - 1)) / 2.0;
            let i = y * w + x;
            ixx[i] = gx * gx;
            ixy[i] = gx * gy;
            iyy[i] = gy * gy;
        }
    }

    let mut responses: Vec<(f64, f64, f64)> = Vec::new();
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let (mut a, mut b, mut c) = (0.0, 0.0, 0.0);
            for dy in 0..3 {
                for dx in 0..3 {
                    let i = (y + dy - 1) * w + (x + dx - 1);
                    a += ixx[i];
                    b += ixy[i];
                    c += iyy[i];
                }
            }
            let min_eig = (a + c) / 2.0 - (((a - c) / 2.0).powi(2) + b * b).sqrt();
            if min_eig > 1e-3 {
                responses.push((min_eig, (x0 as usize + x) as f64, (y0 as usize + y) as f64));
            }
        }
    }

    let strongest = responses.iter().map(|r| r.0).fold(0.0, f64::max);
    responses.retain(|r| r.0 >= 0.01 * strongest);
    responses.sort_by(|a, b| b.0.total_cmp(&a.0));

    let mut corners: Vec<(f64, f64)> = Vec::new();
    for (_, x, y) in responses {
        let spaced = corners
            .iter()
            .all(|(cx, cy)| (cx - x).powi(2) + (cy - y).powi(2) >= CORNER_SPACING * CORNER_SPACING);
        if spaced {
            corners.push((x, y));
            if corners.len() == MAX_CORNERS {
                break;
            }
        }
    }
    corners
}

/// Single-level iterative Lucas-Kanade displacement of one point.
pub fn lucas_kanade(prev: &GrayImage, curr: &GrayImage, point: (f64, f64)) -> Option<(f64, f64)> {
    let mut grads = Vec::with_capacity(((2 * FLOW_HALF_WINDOW + 1) * (2 * FLOW_HALF_WINDOW + 1)) as usize);
    let (mut gxx, mut gxy, mut gyy) = (0.0, 0.0, 0.0);
    for dy in -FLOW_HALF_WINDOW..=FLOW_HALF_WINDOW {
        for dx in -FLOW_HALF_WINDOW..=FLOW_HALF_WINDOW {
            let (x, y) = (point.0 + dx as f64, point.1 + dy as f64);
            let gx = (sample(prev, x + 1.0, y) - sample(prev, x - 1.0, y)) / 2.0;
            let gy = (sample(prev, x, y + 1.0) - sample(prev, x, y - 1.0)) / 2.0;
            gxx += gx * gx;
            gxy += gx * gy;
            gyy += gy * gy;
            grads.push((x, y, gx, gy, sample(prev, x, y)));
        }
    }

    let det = gxx * gyy - gxy * gxy;
    if det < 1e-6 {
        return None;
    }

    let (mut u, mut v) = (0.0, 0.0);
    for _ in 0..FLOW_ITERATIONS {
        let (mut bx, mut by) = (0.0, 0.0);
        for &(x, y, gx, gy, i0) in &grads {
            let it = sample(curr, x + u, y + v) - i0;
            bx += gx * it;
            by += gy * it;
        }
        let du = -(gyy * bx - gxy * by) / det;
        let dv = -(gxx * by - gxy * bx) / det;
        u += du;
        v += dv;
        if du.abs() < 0.01 && dv.abs() < 0.01 {
            break;
        }
    }
    (u.is_finite() && v.is_finite()).then_some((u, v))
}

/// Motion inside `bbox` between two grayscale frames, in `[0, 1]`.
pub fn region_motion(prev: &GrayImage, curr: &GrayImage, bbox: &BoundingBox) -> f64 {
    if prev.dimensions() != curr.dimensions() {
        return 0.0;
    }
    let bounds = match region_bounds(bbox, curr.width(), curr.height()) {
        Some(b) => b,
        None => return 0.0,
    };

    let corners = good_features(prev, bounds);
    if corners.len() >= MIN_CORNERS {
        let flows: Vec<f64> = corners
            .iter()
            .filter_map(|&p| lucas_kanade(prev, curr, p))
            .map(|(u, v)| (u * u + v * v).sqrt())
            .collect();
        if flows.len() >= MIN_CORNERS {
            let (x0, y0, x1, y1) = bounds;
            let diag = (((x1 - x0) as f64).powi(2) + ((y1 - y0) as f64).powi(2)).sqrt();
            let mean = flows.iter().sum::<f64>() / flows.len() as f64;
            return (mean / (0.05 * diag).max(1e-6)).clamp(0.0, 1.0);
        }
    }

    // Too little texture for flow
    let (x0, y0, x1, y1) = bounds;
    let mut diff = 0.0;
    for y in y0..y1 {
        for x in x0..x1 {
            diff += (px(curr, x, y) - px(prev, x, y)).abs();
        }
    }
    let mean = diff / ((x1 - x0) * (y1 - y0)) as f64;
    (mean / 255.0 * 10.0).clamp(0.0, 1.0)
}

/// Per-sample activity scoring for tracked subjects.
pub struct ActivityAnalyzer {
    config: ActivityConfig,
    landmarks: Option<Box<dyn LandmarkProvider>>,
    previous: Option<GrayImage>,
    current: Option<GrayImage>,
    /// (area, score, time) per track
    size_history: HashMap<u32, Vec<(f64, f64, f64)>>,
}

impl ActivityAnalyzer {
    pub fn new(config: ActivityConfig) -> Self {
        let landmarks: Option<Box<dyn LandmarkProvider>> = if config.enable_mouth {
            Some(Box::new(DarkBandLipEstimator))
        } else {
            None
        };
        Self {
            config,
            landmarks,
            previous: None,
            current: None,
            size_history: HashMap::new(),
        }
    }

    /// Replace the lip landmark source.
    pub fn with_landmarks(mut self, provider: Box<dyn LandmarkProvider>) -> Self {
        self.landmarks = Some(provider);
        self
    }

    /// Advance to a new sample. Must be called once per frame before scoring.
    pub fn begin_frame(&mut self, frame: &Frame) {
        if !self.config.enable_motion {
            return;
        }
        self.previous = self.current.take();
        self.current = Some(imageops::grayscale(&frame.image));
    }

    pub fn mouth_score(&mut self, frame: &Frame, bbox: &BoundingBox) -> Option<f64> {
        let provider = self.landmarks.as_mut()?;
        provider
            .lip_distance(frame, bbox)
            .map(|d| mouth_openness_score(d, bbox.height))
    }

    pub fn motion_score(&self, bbox: &BoundingBox) -> Option<f64> {
        match (&self.previous, &self.current) {
            (Some(prev), Some(curr)) => Some(region_motion(prev, curr, bbox)),
            _ => None,
        }
    }

    /// Relative growth of area and confidence over the window, in `[0, 1]`.
    pub fn size_score(&mut self, track_id: u32, bbox: &BoundingBox, score: f64, time: f64) -> f64 {
        let history = self.size_history.entry(track_id).or_default();
        history.push((bbox.area(), score, time));
        let window_start = time - self.config.window;
        history.retain(|(_, _, t)| *t >= window_start);

        match (history.first(), history.last()) {
            (Some(first), Some(last)) if history.len() >= 2 => {
                let area_trend = (last.0 - first.0) / (first.0 + 1e-6);
                let conf_trend = last.1 - first.1;
                (area_trend * 0.7 + conf_trend * 0.3).clamp(0.0, 1.0)
            }
            _ => 0.0,
        }
    }

    /// Weighted average of the enabled cues that produced a value.
    ///
    /// `bbox` is in the coordinates of `frame`.
    pub fn score(&mut self, frame: &Frame, track_id: u32, bbox: &BoundingBox, score: f64, time: f64) -> f64 {
        let mut weighted = 0.0;
        let mut total_weight = 0.0;

        if self.config.enable_mouth && self.config.weight_mouth > 0.0 {
            if let Some(mouth) = self.mouth_score(frame, bbox) {
                weighted += mouth * self.config.weight_mouth;
                total_weight += self.config.weight_mouth;
            }
        }
        if self.config.enable_motion && self.config.weight_motion > 0.0 {
            if let Some(motion) = self.motion_score(bbox) {
                weighted += motion * self.config.weight_motion;
                total_weight += self.config.weight_motion;
            }
        }
        if self.config.enable_size && self.config.weight_size > 0.0 {
            let size = self.size_score(track_id, bbox, score, time);
            weighted += size * self.config.weight_size;
            total_weight += self.config.weight_size;
        }

        if total_weight > 0.0 {
            (weighted / total_weight).clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    pub fn cleanup_track(&mut self, track_id: u32) {
        self.size_history.remove(&track_id);
    }

    pub fn reset(&mut self) {
        self.previous = None;
        self.current = None;
        self.size_history.clear();
    }
}

/// Smoothed per-track activity with hysteresis-based active selection.
#[derive(Debug, Clone)]
pub struct TemporalActivityTracker {
    /// (time, score) per track within the window
    history: HashMap<u32, Vec<(f64, f64)>>,
    current: Option<u32>,
    current_since: f64,
    window: f64,
    alpha: f64,
    min_switch_duration: f64,
    switch_margin: f64,
}

impl TemporalActivityTracker {
    pub fn new(config: &ActivityConfig) -> Self {
        Self {
            history: HashMap::new(),
            current: None,
            current_since: 0.0,
            window: config.window,
            alpha: config.smoothing_alpha,
            min_switch_duration: config.min_switch_duration,
            switch_margin: config.switch_margin,
        }
    }

    pub fn update(&mut self, track_id: u32, score: f64, time: f64) {
        let history = self.history.entry(track_id).or_default();
        history.push((time, score));
        let window_start = time - self.window;
        history.retain(|(t, _)| *t >= window_start);
    }

    /// EMA of the track's scores within the window ending at `time`.
    pub fn average(&self, track_id: u32, time: f64) -> f64 {
        let window_start = time - self.window;
        let mut recent = self
            .history
            .get(&track_id)
            .into_iter()
            .flatten()
            .filter(|(t, _)| *t >= window_start)
            .map(|(_, s)| *s);

        match recent.next() {
            Some(first) => recent.fold(first, |acc, s| self.alpha * s + (1.0 - self.alpha) * acc),
            None => 0.0,
        }
    }

    /// Pick the active track among `available` at `time`.
    pub fn select(&mut self, available: &[u32], time: f64) -> Option<u32> {
        if available.is_empty() {
            self.current = None;
            return None;
        }

        let (best, best_activity) = available
            .iter()
            .map(|&id| (id, self.average(id, time)))
            .max_by(|a, b| a.1.total_cmp(&b.1).then(b.0.cmp(&a.0)))?;

        let current = match self.current {
            Some(id) if available.contains(&id) => id,
            previous => {
                if let Some(lost) = previous {
                    debug!(lost, track = best, "Active subject lost, switching");
                }
                self.current = Some(best);
                self.current_since = time;
                return Some(best);
            }
        };

        if time - self.current_since < self.min_switch_duration {
            return Some(current);
        }

        let improvement = best_activity - self.average(current, time);
        if best != current && improvement > self.switch_margin {
            debug!(from = current, to = best, improvement, time, "Switching active subject");
            self.current = Some(best);
            self.current_since = time;
            return Some(best);
        }

        Some(current)
    }

    pub fn current(&self) -> Option<u32> {
        self.current
    }

    /// Forget a track that left the shot.
    pub fn cleanup_track(&mut self, track_id: u32) {
        self.history.remove(&track_id);
        if self.current == Some(track_id) {
            self.current = None;
        }
    }

    pub fn reset(&mut self) {
        self.history.clear();
        self.current = None;
        self.current_since = 0.0;
    }
}
