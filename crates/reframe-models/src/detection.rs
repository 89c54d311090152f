//! Subject detections grouped per shot.

use serde::{Deserialize, Serialize};

use crate::geometry::BoundingBox;

/// What kind of subject a detector reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    #[default]
    Face,
    Person,
}

/// One subject sighting at a sampled time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Timestamp in seconds
    pub time: f64,
    /// Box in source pixel coordinates
    pub bbox: BoundingBox,
    /// Detection confidence score (0.0-1.0)
    pub score: f64,
    /// Track ID for identity persistence within the shot
    pub track_id: u32,
    #[serde(rename = "type", default)]
    pub kind: SubjectKind,
    /// Combined activity score when several subjects shared the frame
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<f64>,
}

impl Detection {
    pub fn new(time: f64, bbox: BoundingBox, score: f64, track_id: u32, kind: SubjectKind) -> Self {
        Self {
            time,
            bbox,
            score: score.clamp(0.0, 1.0),
            track_id,
            kind,
            activity: None,
        }
    }

    /// Primary-subject ranking key.
    #[inline]
    pub fn weight(&self) -> f64 {
        self.bbox.area() * self.score
    }
}

/// Which track was selected as active at a sampled time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActiveTrackSample {
    pub time: f64,
    pub track_id: u32,
}

/// All detections belonging to one shot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ShotDetections {
    pub shot_id: u32,
    pub detections: Vec<Detection>,
    /// Active-subject decisions, present only for multi-subject shots
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub active_tracks: Vec<ActiveTrackSample>,
    /// Fallback framing when the shot had no reliable subject
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_focus: Option<BoundingBox>,
}

impl ShotDetections {
    pub fn new(shot_id: u32) -> Self {
        Self {
            shot_id,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }

    /// Group detections by sample time, in time order.
    ///
    /// Detections of one frame keep their stored order.
    pub fn frames(&self) -> Vec<(f64, Vec<&Detection>)> {
        let mut sorted: Vec<&Detection> = self.detections.iter().collect();
        sorted.sort_by(|a, b| a.time.total_cmp(&b.time));

        let mut frames: Vec<(f64, Vec<&Detection>)> = Vec::new();
        for det in sorted {
            match frames.last_mut() {
                Some((t, dets)) if (det.time - *t).abs() < 1e-9 => dets.push(det),
                _ => frames.push((det.time, vec![det])),
            }
        }
        frames
    }

    /// Active track decided closest to `time`, if within `tolerance` seconds.
    ///
    /// `active_tracks` is kept in time order.
    pub fn active_track_at(&self, time: f64, tolerance: f64) -> Option<u32> {
        let idx = nearest_by_time(&self.active_tracks, time, |s| s.time)?;
        let sample = &self.active_tracks[idx];
        ((sample.time - time).abs() <= tolerance).then_some(sample.track_id)
    }

    /// Largest number of subjects seen in a single sampled frame.
    pub fn max_simultaneous(&self) -> usize {
        self.frames().iter().map(|(_, d)| d.len()).max().unwrap_or(0)
    }
}

/// Index of the item closest to `time` in a slice sorted by `time_of`.
///
/// Ties go to the earlier item.
pub fn nearest_by_time<T>(items: &[T], time: f64, time_of: impl Fn(&T) -> f64) -> Option<usize> {
    if items.is_empty() {
        return None;
    }
    let after = items.partition_point(|item| time_of(item) < time);
    if after == 0 {
        return Some(0);
    }
    if after == items.len() {
        return Some(after - 1);
    }
    let before = after - 1;
    if time - time_of(&items[before]) <= time_of(&items[after]) - time {
        Some(before)
    } else {
        Some(after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(time: f64, track_id: u32) -> Detection {
        Detection::new(time, BoundingBox::new(0.0, 0.0, 10.0, 10.0), 0.9, track_id, SubjectKind::Face)
    }

    #[test]
    fn test_frames_grouped_in_time_order() {
        let mut shot = ShotDetections::new(3);
        shot.detections = vec![det(0.5, 1), det(0.0, 1), det(0.5, 2)];
        let frames = shot.frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].0, 0.0);
        assert_eq!(frames[1].1.len(), 2);
        assert_eq!(shot.max_simultaneous(), 2);
    }

    #[test]
    fn test_active_track_lookup() {
        let mut shot = ShotDetections::new(0);
        shot.active_tracks = vec![
            ActiveTrackSample { time: 0.0, track_id: 1 },
            ActiveTrackSample { time: 1.0, track_id: 2 },
        ];
        assert_eq!(shot.active_track_at(0.9, 0.25), Some(2));
        assert_eq!(shot.active_track_at(0.2, 0.25), Some(1));
        assert_eq!(shot.active_track_at(5.0, 0.25), None);
    }

    #[test]
    fn test_frames_group_long_shot() {
        // Two subjects per sample, stored newest first
        let mut shot = ShotDetections::new(0);
        for i in (0..5000).rev() {
            let t = i as f64 / 8.0;
            shot.detections.push(det(t, 0));
            shot.detections.push(det(t, 1));
        }
        let frames = shot.frames();
        assert_eq!(frames.len(), 5000);
        assert!(frames.windows(2).all(|w| w[0].0 < w[1].0));
        assert!(frames.iter().all(|(_, d)| d.len() == 2 && d[0].track_id == 0 && d[1].track_id == 1));
        assert_eq!(frames[4999].0, 4999.0 / 8.0);
    }

    #[test]
    fn test_nearest_by_time() {
        let times = [0.0, 0.5, 1.0, 2.0];
        let at = |t: f64| nearest_by_time(&times, t, |x| *x);
        assert_eq!(at(-3.0), Some(0));
        assert_eq!(at(0.2), Some(0));
        // Midway between samples picks the earlier one
        assert_eq!(at(0.25), Some(0));
        assert_eq!(at(0.3), Some(1));
        assert_eq!(at(1.0), Some(2));
        assert_eq!(at(1.6), Some(3));
        assert_eq!(at(9.0), Some(3));
        assert_eq!(nearest_by_time(&[] as &[f64], 1.0, |x| *x), None);
    }

    #[test]
    fn test_score_is_clamped() {
        let d = Detection::new(0.0, BoundingBox::new(0.0, 0.0, 1.0, 1.0), 1.7, 0, SubjectKind::Person);
        assert_eq!(d.score, 1.0);
    }
}
