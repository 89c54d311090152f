//! IoU-based tracker for maintaining subject identity across samples.
//!
//! Matching is greedy over all (track, detection) pairs: the highest-IoU pair
//! above the threshold binds first, and each track and detection is used at
//! most once.

use std::collections::BTreeMap;

use reframe_models::BoundingBox;

/// State kept for one live track.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackState {
    /// Last matched bounding box
    pub bbox: BoundingBox,
    /// Consecutive samples without a match
    pub misses: u32,
    /// Total samples matched
    pub hits: u32,
    /// Time of the last match
    pub last_seen: f64,
}

/// Simple IoU tracker with age-out.
#[derive(Debug, Clone)]
pub struct SimpleTracker {
    iou_threshold: f64,
    /// Misses a track survives before deletion
    max_gap: u32,
    tracks: BTreeMap<u32, TrackState>,
    next_track_id: u32,
    /// Tracks deleted since the last `take_expired`
    expired: Vec<u32>,
}

impl SimpleTracker {
    pub fn new(iou_threshold: f64, max_gap: u32) -> Self {
        Self {
            iou_threshold,
            max_gap,
            tracks: BTreeMap::new(),
            next_track_id: 0,
            expired: Vec::new(),
        }
    }

    /// Assign track ids to one sample's detections.
    ///
    /// Returns `(track_id, bbox, score)` in the same order as `detections`.
    pub fn update(&mut self, time: f64, detections: &[(BoundingBox, f64)]) -> Vec<(u32, BoundingBox, f64)> {
        let mut pairs: Vec<(f64, u32, usize)> = Vec::new();
        for (&track_id, track) in &self.tracks {
            for (det_idx, (bbox, _)) in detections.iter().enumerate() {
                let iou = bbox.iou(&track.bbox);
                if iou > self.iou_threshold {
                    pairs.push((iou, track_id, det_idx));
                }
            }
        }
        pairs.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

        let mut assigned: Vec<Option<u32>> = vec![None; detections.len()];
        let mut used_tracks: Vec<u32> = Vec::new();
        for (_, track_id, det_idx) in pairs {
            if assigned[det_idx].is_some() || used_tracks.contains(&track_id) {
                continue;
            }
            assigned[det_idx] = Some(track_id);
            used_tracks.push(track_id);
        }

        let mut output = Vec::with_capacity(detections.len());
        for (det_idx, &(bbox, score)) in detections.iter().enumerate() {
            let track_id = match assigned[det_idx] {
                Some(id) => {
                    if let Some(track) = self.tracks.get_mut(&id) {
                        track.bbox = bbox;
                        track.misses = 0;
                        track.hits += 1;
                        track.last_seen = time;
                    }
                    id
                }
                None => {
                    let id = self.next_track_id;
                    self.next_track_id += 1;
                    self.tracks.insert(
                        id,
                        TrackState {
                            bbox,
                            misses: 0,
                            hits: 1,
                            last_seen: time,
                        },
                    );
                    used_tracks.push(id);
                    id
                }
            };
            output.push((track_id, bbox, score));
        }

        let max_gap = self.max_gap;
        let expired = &mut self.expired;
        self.tracks.retain(|id, track| {
            if used_tracks.contains(id) {
                return true;
            }
            track.misses += 1;
            if track.misses > max_gap {
                expired.push(*id);
                return false;
            }
            true
        });

        output
    }

    pub fn track(&self, id: u32) -> Option<&TrackState> {
        self.tracks.get(&id)
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    /// Ids of tracks aged out since the previous call.
    pub fn take_expired(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.expired)
    }

    /// Drop all tracks. Ids restart from zero.
    pub fn reset(&mut self) {
        self.tracks.clear();
        self.expired.clear();
        self.next_track_id = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(x: f64, y: f64) -> BoundingBox {
        BoundingBox::new(x, y, 50.0, 50.0)
    }

    #[test]
    fn test_new_detections_get_sequential_ids() {
        let mut tracker = SimpleTracker::new(0.3, 10);
        let tracked = tracker.update(0.0, &[(b(100.0, 100.0), 0.9), (b(200.0, 200.0), 0.8)]);
        assert_eq!(tracked[0].0, 0);
        assert_eq!(tracked[1].0, 1);
    }

    #[test]
    fn test_identity_persists_through_motion() {
        let mut tracker = SimpleTracker::new(0.3, 10);
        tracker.update(0.0, &[(b(100.0, 100.0), 0.9), (b(300.0, 100.0), 0.9)]);
        // Input order swapped, boxes moved slightly
        let tracked = tracker.update(0.125, &[(b(305.0, 102.0), 0.9), (b(104.0, 98.0), 0.9)]);
        assert_eq!(tracked[0].0, 1);
        assert_eq!(tracked[1].0, 0);
        assert_eq!(tracker.track(0).unwrap().hits, 2);
    }

    #[test]
    fn test_highest_iou_pair_binds_first() {
        let mut tracker = SimpleTracker::new(0.1, 10);
        tracker.update(0.0, &[(b(100.0, 100.0), 0.9)]);
        // Both overlap track 0; the closer one keeps the id even though it comes second
        let tracked = tracker.update(0.125, &[(b(125.0, 100.0), 0.9), (b(102.0, 100.0), 0.9)]);
        assert_eq!(tracked[1].0, 0);
        assert_eq!(tracked[0].0, 1);
    }

    #[test]
    fn test_track_ages_out_after_max_gap() {
        let mut tracker = SimpleTracker::new(0.3, 2);
        tracker.update(0.0, &[(b(100.0, 100.0), 0.9)]);
        tracker.update(0.1, &[]);
        tracker.update(0.2, &[]);
        assert_eq!(tracker.track(0).unwrap().misses, 2);

        // Still alive at the gap limit, so it re-binds
        let tracked = tracker.update(0.3, &[(b(101.0, 100.0), 0.9)]);
        assert_eq!(tracked[0].0, 0);

        for i in 0..3 {
            tracker.update(0.4 + i as f64 * 0.1, &[]);
        }
        assert_eq!(tracker.track_count(), 0);
        let tracked = tracker.update(1.0, &[(b(100.0, 100.0), 0.9)]);
        assert_eq!(tracked[0].0, 1);
    }

    #[test]
    fn test_expired_tracks_reported_once() {
        let mut tracker = SimpleTracker::new(0.3, 1);
        tracker.update(0.0, &[(b(100.0, 100.0), 0.9), (b(300.0, 100.0), 0.9)]);
        tracker.update(0.1, &[(b(300.0, 100.0), 0.9)]);
        assert!(tracker.take_expired().is_empty());

        tracker.update(0.2, &[(b(300.0, 100.0), 0.9)]);
        assert_eq!(tracker.take_expired(), vec![0]);
        assert!(tracker.take_expired().is_empty());
        assert_eq!(tracker.track_count(), 1);
    }

    #[test]
    fn test_reset() {
        let mut tracker = SimpleTracker::new(0.3, 10);
        tracker.update(0.0, &[(b(0.0, 0.0), 0.9)]);
        tracker.reset();
        assert_eq!(tracker.track_count(), 0);
        assert_eq!(tracker.update(0.0, &[(b(0.0, 0.0), 0.9)])[0].0, 0);
    }
}
