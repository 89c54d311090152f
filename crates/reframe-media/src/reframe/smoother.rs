//! Camera path smoothing for jitter-free virtual camera motion.
//!
//! Raw focus boxes sampled at `fps_sample` become keyframes; the shot is
//! classified as static, tracking or zoom, smoothed accordingly and then
//! run through the pan acceleration and speed limits.

use tracing::debug;

use reframe_models::{
    nearest_by_time, BoundingBox, CameraKeyframe, CameraMode, Detection, Shot, ShotCameraPlan, ShotDetections,
};

use super::config::ReframeConfig;
use super::saliency::SaliencyEstimator;

/// Builds per-shot virtual camera plans.
#[derive(Debug, Clone)]
pub struct CameraSmoother {
    fps_sample: f64,
    subject_padding: f64,
    prefer_primary_subject: bool,
    smoothing_window: f64,
    max_pan_speed: f64,
    max_pan_acceleration: f64,
    saliency: SaliencyEstimator,
}

impl CameraSmoother {
    pub fn new(config: &ReframeConfig) -> Self {
        Self {
            fps_sample: config.fps_sample,
            subject_padding: config.subject_padding,
            prefer_primary_subject: config.prefer_primary_subject,
            smoothing_window: config.smoothing_window,
            max_pan_speed: config.max_pan_speed,
            max_pan_acceleration: config.max_pan_acceleration,
            saliency: SaliencyEstimator::new(config.fallback_policy),
        }
    }

    /// Smoothed, constrained camera plan for one shot.
    pub fn plan_shot(&self, shot: &Shot, detections: &ShotDetections, width: u32, height: u32) -> ShotCameraPlan {
        let raw = self.raw_keyframes(shot, detections, width, height);
        let mode = classify_camera_mode(&raw);
        let smoothed = match mode {
            CameraMode::Static => smooth_static(&raw),
            CameraMode::Tracking | CameraMode::Zoom => self.smooth_moving(&raw),
        };
        let keyframes = self.enforce_constraints(&smoothed, width, height);

        debug!(
            shot_id = shot.id,
            mode = %mode,
            keyframes = keyframes.len(),
            subjects = detections.max_simultaneous(),
            "Camera plan computed"
        );

        ShotCameraPlan {
            shot_id: shot.id,
            mode,
            keyframes,
        }
    }

    /// Unsmoothed focus keyframes at every sample time, plus one at the shot end.
    pub fn raw_keyframes(&self, shot: &Shot, detections: &ShotDetections, width: u32, height: u32) -> Vec<CameraKeyframe> {
        let interval = 1.0 / self.fps_sample;
        let frames = detections.frames();
        let fallback = detections
            .fallback_focus
            .unwrap_or_else(|| self.saliency.focus(width, height, None))
            .clamp(width, height);

        let mut times = Vec::new();
        let mut k = 0u32;
        loop {
            let t = shot.start_time + k as f64 * interval;
            if t >= shot.end_time - 1e-9 {
                break;
            }
            times.push(t);
            k += 1;
        }
        times.push(shot.end_time);

        times
            .into_iter()
            .map(|t| {
                let nearest = nearest_by_time(&frames, t, |(ft, _)| *ft)
                    .map(|i| &frames[i])
                    .filter(|(ft, _)| (ft - t).abs() <= interval + 1e-9);

                let focus = nearest
                    .and_then(|(_, dets)| self.focus_for(dets, detections.active_track_at(t, interval)))
                    .map(|focus| focus.clamp(width, height))
                    .unwrap_or(fallback);
                CameraKeyframe::from_focus(t, &focus)
            })
            .collect()
    }

    /// Focus box for one sampled frame of detections.
    fn focus_for(&self, dets: &[&Detection], active_track: Option<u32>) -> Option<BoundingBox> {
        let active = active_track.and_then(|id| dets.iter().find(|d| d.track_id == id));
        if let Some(det) = active {
            return Some(det.bbox.pad(det.bbox.width * self.subject_padding));
        }

        if self.prefer_primary_subject || dets.len() == 1 {
            return dets
                .iter()
                .max_by(|a, b| a.weight().total_cmp(&b.weight()))
                .map(|det| det.bbox.pad(det.bbox.width * self.subject_padding));
        }

        let boxes: Vec<BoundingBox> = dets.iter().map(|d| d.bbox).collect();
        let widest = boxes.iter().map(|b| b.width).fold(0.0, f64::max);
        BoundingBox::union(&boxes).map(|u| u.pad(widest * self.subject_padding))
    }

    /// Centered moving average over every keyframe field.
    fn smooth_moving(&self, keyframes: &[CameraKeyframe]) -> Vec<CameraKeyframe> {
        let window = smoothing_window_samples(self.smoothing_window, self.fps_sample);
        if window <= 1 || keyframes.len() < 2 {
            return keyframes.to_vec();
        }

        let field = |f: fn(&CameraKeyframe) -> f64| {
            moving_average(&keyframes.iter().map(f).collect::<Vec<_>>(), window)
        };
        let cx = field(|k| k.cx);
        let cy = field(|k| k.cy);
        let width = field(|k| k.width);
        let height = field(|k| k.height);

        keyframes
            .iter()
            .enumerate()
            .map(|(i, kf)| CameraKeyframe::new(kf.time, cx[i], cy[i], width[i], height[i]))
            .collect()
    }

    /// Apply the acceleration limit, then the speed limit, then keep the
    /// focus box inside the frame without exceeding the speed limit.
    pub fn enforce_constraints(&self, keyframes: &[CameraKeyframe], width: u32, height: u32) -> Vec<CameraKeyframe> {
        let mut constrained: Vec<CameraKeyframe> = Vec::with_capacity(keyframes.len());
        let mut velocity = (0.0, 0.0);

        for curr in keyframes {
            let prev = match constrained.last() {
                Some(prev) => *prev,
                None => {
                    let (cx, cy) = clamp_center(curr.cx, curr.cy, curr.width, curr.height, width, height);
                    constrained.push(CameraKeyframe::new(curr.time, cx, cy, curr.width, curr.height));
                    continue;
                }
            };

            let dt = curr.time - prev.time;
            if dt <= 0.0 {
                constrained.push(CameraKeyframe::new(curr.time, prev.cx, prev.cy, curr.width, curr.height));
                continue;
            }

            let mut vx = (curr.cx - prev.cx) / dt;
            let mut vy = (curr.cy - prev.cy) / dt;

            if self.max_pan_acceleration > 0.0 {
                let (ax, ay) = ((vx - velocity.0) / dt, (vy - velocity.1) / dt);
                let accel = (ax * ax + ay * ay).sqrt();
                if accel > self.max_pan_acceleration {
                    let scale = self.max_pan_acceleration / accel;
                    vx = velocity.0 + ax * scale * dt;
                    vy = velocity.1 + ay * scale * dt;
                }
            }

            let speed = (vx * vx + vy * vy).sqrt();
            if speed > self.max_pan_speed {
                let scale = self.max_pan_speed / speed;
                vx *= scale;
                vy *= scale;
            }

            let (mut cx, mut cy) =
                clamp_center(prev.cx + vx * dt, prev.cy + vy * dt, curr.width, curr.height, width, height);
            // Clamping a growing box can push the center further than the speed
            // limit allows; the crop planner keeps the window inside the frame.
            let (dx, dy) = (cx - prev.cx, cy - prev.cy);
            let step = (dx * dx + dy * dy).sqrt();
            let max_step = self.max_pan_speed * dt;
            if step > max_step {
                let scale = max_step / step;
                cx = prev.cx + dx * scale;
                cy = prev.cy + dy * scale;
            }
            velocity = ((cx - prev.cx) / dt, (cy - prev.cy) / dt);
            constrained.push(CameraKeyframe::new(curr.time, cx, cy, curr.width, curr.height));
        }

        constrained
    }
}

/// Keep a focus box of the given size inside the frame; oversized axes are centered.
fn clamp_center(cx: f64, cy: f64, box_w: f64, box_h: f64, width: u32, height: u32) -> (f64, f64) {
    let clamp_axis = |c: f64, size: f64, frame: f64| {
        let half = size / 2.0;
        if size >= frame {
            frame / 2.0
        } else {
            c.clamp(half, frame - half)
        }
    };
    (
        clamp_axis(cx, box_w, width as f64),
        clamp_axis(cy, box_h, height as f64),
    )
}

/// Classify the camera mode from raw keyframes.
pub fn classify_camera_mode(keyframes: &[CameraKeyframe]) -> CameraMode {
    if keyframes.len() < 2 {
        return CameraMode::Static;
    }

    let cx: Vec<f64> = keyframes.iter().map(|kf| kf.cx).collect();
    let cy: Vec<f64> = keyframes.iter().map(|kf| kf.cy).collect();
    let widths: Vec<f64> = keyframes.iter().map(|kf| kf.width).collect();

    let avg_width = mean(&widths);
    if std_deviation(&widths) > avg_width * 0.15 {
        CameraMode::Zoom
    } else if std_deviation(&cx) > avg_width * 0.1 || std_deviation(&cy) > avg_width * 0.1 {
        CameraMode::Tracking
    } else {
        CameraMode::Static
    }
}

/// Collapse every keyframe to the per-field median.
pub fn smooth_static(keyframes: &[CameraKeyframe]) -> Vec<CameraKeyframe> {
    let field = |f: fn(&CameraKeyframe) -> f64| median(&keyframes.iter().map(f).collect::<Vec<_>>());
    let (cx, cy) = (field(|k| k.cx), field(|k| k.cy));
    let (width, height) = (field(|k| k.width), field(|k| k.height));

    keyframes
        .iter()
        .map(|kf| CameraKeyframe::new(kf.time, cx, cy, width, height))
        .collect()
}

/// Odd moving-average window in samples for a window in seconds.
pub fn smoothing_window_samples(seconds: f64, sample_rate: f64) -> usize {
    let window = (seconds * sample_rate).round().max(0.0) as usize;
    if window <= 1 {
        return 1;
    }
    let window = window.max(3);
    if window % 2 == 0 {
        window + 1
    } else {
        window
    }
}

// === Helper Functions ===

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation.
fn std_deviation(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let avg = mean(values);
    let variance = values.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Centered moving average, edges padded by repeating the end values.
pub fn moving_average(data: &[f64], window: usize) -> Vec<f64> {
    if data.is_empty() || window <= 1 {
        return data.to_vec();
    }

    let pad = (window / 2) as isize;
    let last = data.len() as isize - 1;
    (0..data.len() as isize)
        .map(|i| {
            let sum: f64 = (i - pad..=i + pad).map(|j| data[j.clamp(0, last) as usize]).sum();
            sum / (2 * pad + 1) as f64
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reframe_models::SubjectKind;

    fn kf(time: f64, cx: f64, width: f64) -> CameraKeyframe {
        CameraKeyframe::new(time, cx, 500.0, width, width)
    }

    #[test]
    fn test_moving_average_edge_padded() {
        let smoothed = moving_average(&[1.0, 2.0, 3.0, 4.0, 5.0], 3);
        assert_eq!(smoothed.len(), 5);
        assert!((smoothed[0] - 4.0 / 3.0).abs() < 1e-12);
        assert!((smoothed[2] - 3.0).abs() < 1e-12);
        assert!((smoothed[4] - 14.0 / 3.0).abs() < 1e-12);

        // Window longer than the data still keeps the length
        assert_eq!(moving_average(&[1.0, 9.0], 7).len(), 2);
    }

    #[test]
    fn test_window_is_odd() {
        assert_eq!(smoothing_window_samples(0.3, 8.0), 3);
        assert_eq!(smoothing_window_samples(0.5, 8.0), 5);
        assert_eq!(smoothing_window_samples(0.75, 8.0), 7);
        assert_eq!(smoothing_window_samples(1.0, 10.0), 11);
        assert_eq!(smoothing_window_samples(0.1, 8.0), 1);
    }

    #[test]
    fn test_statistics() {
        let data = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert!((std_deviation(&data) - 2.0).abs() < 1e-12);
        assert_eq!(median(&[1.0, 3.0, 5.0, 7.0, 9.0]), 5.0);
        assert_eq!(median(&[1.0, 2.0, 3.0, 4.0]), 2.5);
    }

    #[test]
    fn test_camera_mode_classification() {
        let still: Vec<_> = (0..5).map(|i| kf(i as f64, 500.0, 100.0)).collect();
        assert_eq!(classify_camera_mode(&still), CameraMode::Static);

        let pan: Vec<_> = (0..5).map(|i| kf(i as f64, 100.0 + 100.0 * i as f64, 100.0)).collect();
        assert_eq!(classify_camera_mode(&pan), CameraMode::Tracking);

        let zoom: Vec<_> = (0..5).map(|i| kf(i as f64, 500.0, 100.0 + 40.0 * i as f64)).collect();
        assert_eq!(classify_camera_mode(&zoom), CameraMode::Zoom);
    }

    #[test]
    fn test_static_uses_median() {
        let mut frames: Vec<_> = (0..5).map(|i| kf(i as f64, 500.0, 100.0)).collect();
        frames[2].cx = 900.0;
        let smoothed = smooth_static(&frames);
        assert!(smoothed.iter().all(|k| k.cx == 500.0));
        assert_eq!(smoothed[4].time, 4.0);
    }

    #[test]
    fn test_speed_limit_holds() {
        let smoother = CameraSmoother::new(&ReframeConfig {
            max_pan_acceleration: 0.0,
            ..Default::default()
        });
        // Jump across the frame between consecutive samples
        let frames: Vec<_> = (0..40)
            .map(|i| kf(i as f64 / 8.0, if i < 4 { 300.0 } else { 1600.0 }, 200.0))
            .collect();
        let out = smoother.enforce_constraints(&frames, 1920, 1080);
        assert_eq!(out.len(), frames.len());
        for pair in out.windows(2) {
            let dt = pair[1].time - pair[0].time;
            let dist = ((pair[1].cx - pair[0].cx).powi(2) + (pair[1].cy - pair[0].cy).powi(2)).sqrt();
            assert!(dist <= 600.0 * dt + 1e-6);
        }
        assert!((out.last().unwrap().cx - 1600.0).abs() < 1e-6);
    }

    #[test]
    fn test_acceleration_limit_eases_in() {
        let smoother = CameraSmoother::new(&ReframeConfig::default());
        let frames: Vec<_> = (0..16).map(|i| kf(i as f64 / 8.0, if i == 0 { 300.0 } else { 900.0 }, 200.0)).collect();
        let out = smoother.enforce_constraints(&frames, 1920, 1080);
        // First step limited to a * dt^2
        let first_step = out[1].cx - out[0].cx;
        assert!((first_step - 2000.0 / 64.0).abs() < 1e-6);
        assert!(out[2].cx - out[1].cx > first_step);
    }

    #[test]
    fn test_speed_limit_holds_while_zooming_at_edge() {
        let smoother = CameraSmoother::new(&ReframeConfig {
            max_pan_acceleration: 0.0,
            ..Default::default()
        });
        // Box grows at the left edge, pulling the clamped center inward
        let mut frames = vec![kf(0.0, 10.0, 400.0)];
        frames.extend((1..9).map(|i| kf(i as f64 / 8.0, 10.0, 1000.0)));
        let out = smoother.enforce_constraints(&frames, 1920, 1080);

        assert_eq!(out[0].cx, 200.0);
        for pair in out.windows(2) {
            let dt = pair[1].time - pair[0].time;
            let dist = ((pair[1].cx - pair[0].cx).powi(2) + (pair[1].cy - pair[0].cy).powi(2)).sqrt();
            assert!(dist <= 600.0 * dt + 1e-6, "step {dist} at {}", pair[1].time);
        }
        assert!((out[1].cx - 275.0).abs() < 1e-6);
        assert!((out.last().unwrap().cx - 500.0).abs() < 1e-6);
    }

    #[test]
    fn test_center_clamped_to_frame() {
        let smoother = CameraSmoother::new(&ReframeConfig::default());
        let frames = vec![kf(0.0, 10.0, 400.0), kf(0.125, 10.0, 400.0)];
        let out = smoother.enforce_constraints(&frames, 1920, 1080);
        assert!(out.iter().all(|k| k.cx == 200.0));

        let wide = vec![kf(0.0, 10.0, 2400.0)];
        assert_eq!(smoother.enforce_constraints(&wide, 1920, 1080)[0].cx, 960.0);
    }

    #[test]
    fn test_plan_covers_shot_with_fallback() {
        let smoother = CameraSmoother::new(&ReframeConfig::default());
        let shot = Shot::new(0, 2.0, 4.0);
        let plan = smoother.plan_shot(&shot, &ShotDetections::new(0), 1920, 1080);
        assert_eq!(plan.mode, CameraMode::Static);
        assert_eq!(plan.keyframes.first().unwrap().time, 2.0);
        assert_eq!(plan.keyframes.last().unwrap().time, 4.0);
        assert_eq!(plan.keyframes.len(), 17);
        // Upper-center fallback: 50% box starting 15% down
        let k = plan.keyframes[0];
        assert_eq!((k.cx, k.cy, k.width), (960.0, 432.0, 960.0));
    }

    #[test]
    fn test_primary_subject_and_active_track_focus() {
        let smoother = CameraSmoother::new(&ReframeConfig::default());
        let shot = Shot::new(0, 0.0, 1.0);
        let mut dets = ShotDetections::new(0);
        for i in 0..8 {
            let t = i as f64 / 8.0;
            dets.detections.push(Detection::new(t, BoundingBox::new(200.0, 300.0, 200.0, 200.0), 0.9, 0, SubjectKind::Face));
            dets.detections.push(Detection::new(t, BoundingBox::new(1400.0, 300.0, 100.0, 100.0), 0.9, 1, SubjectKind::Face));
        }

        let raw = smoother.raw_keyframes(&shot, &dets, 1920, 1080);
        // Larger subject wins, padded by 20% of its width on each side
        assert_eq!(raw[0].cx, 300.0);
        assert_eq!(raw[0].width, 280.0);

        dets.active_tracks = (0..8)
            .map(|i| reframe_models::ActiveTrackSample { time: i as f64 / 8.0, track_id: 1 })
            .collect();
        let raw = smoother.raw_keyframes(&shot, &dets, 1920, 1080);
        assert_eq!(raw[0].cx, 1450.0);
    }

    #[test]
    fn test_union_focus_when_not_preferring_primary() {
        let smoother = CameraSmoother::new(&ReframeConfig {
            prefer_primary_subject: false,
            ..Default::default()
        });
        let shot = Shot::new(0, 0.0, 0.5);
        let mut dets = ShotDetections::new(0);
        dets.detections.push(Detection::new(0.0, BoundingBox::new(400.0, 300.0, 100.0, 100.0), 0.9, 0, SubjectKind::Face));
        dets.detections.push(Detection::new(0.0, BoundingBox::new(800.0, 300.0, 100.0, 100.0), 0.9, 1, SubjectKind::Face));
        let raw = smoother.raw_keyframes(&shot, &dets, 1920, 1080);
        assert_eq!(raw[0].cx, 650.0);
        assert_eq!(raw[0].width, 540.0);
    }
}
