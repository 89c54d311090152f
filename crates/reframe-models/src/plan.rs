//! The persisted crop plan.
//!
//! A `CropPlan` captures everything an analysis produced so that rendering
//! can be repeated (different resolution, letterbox on/off) without decoding
//! the source again. Plans are stored as pretty-printed JSON.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::camera::ShotCameraPlan;
use crate::crop::{CropWindow, ShotCropPlan};
use crate::detection::ShotDetections;
use crate::error::{PlanError, PlanResult};
use crate::geometry::AspectRatio;
use crate::shot::Shot;
use crate::video::VideoMeta;

/// Current crop plan document version.
pub const CROP_PLAN_VERSION: u32 = 1;

/// Analyzed time range in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

impl TimeRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// Full serializable analysis result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CropPlan {
    pub version: u32,
    pub plan_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub video: VideoMeta,
    /// Range the analysis covered; `None` means the full video
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_range: Option<TimeRange>,
    pub aspect_ratios: Vec<AspectRatio>,
    pub shots: Vec<Shot>,
    pub detections: Vec<ShotDetections>,
    pub camera_plans: Vec<ShotCameraPlan>,
    pub crop_plans: Vec<ShotCropPlan>,
}

impl CropPlan {
    /// Create an empty plan for a source video.
    pub fn new(video: VideoMeta, time_range: Option<TimeRange>, aspect_ratios: Vec<AspectRatio>) -> Self {
        Self {
            version: CROP_PLAN_VERSION,
            plan_id: Uuid::new_v4(),
            created_at: Utc::now(),
            video,
            time_range,
            aspect_ratios,
            shots: Vec::new(),
            detections: Vec::new(),
            camera_plans: Vec::new(),
            crop_plans: Vec::new(),
        }
    }

    /// Effective analyzed range.
    pub fn range(&self) -> TimeRange {
        self.time_range
            .unwrap_or_else(|| TimeRange::new(0.0, self.video.duration))
    }

    pub fn shot(&self, shot_id: u32) -> Option<&Shot> {
        self.shots.iter().find(|s| s.id == shot_id)
    }

    /// All crop windows for `aspect`, ordered along the timeline.
    pub fn windows_for(&self, aspect: AspectRatio) -> Vec<CropWindow> {
        let mut windows: Vec<CropWindow> = self
            .crop_plans
            .iter()
            .filter(|p| p.aspect_ratio == aspect)
            .flat_map(|p| p.crop_windows.iter().copied())
            .collect();
        windows.sort_by(|a, b| a.time.total_cmp(&b.time));
        windows
    }

    /// Whether this plan was produced for `path` and covers every aspect in `aspects`.
    pub fn matches_source(&self, path: &Path, aspects: &[AspectRatio]) -> bool {
        self.video.path == path && aspects.iter().all(|a| self.aspect_ratios.contains(a))
    }

    pub fn to_json(&self) -> PlanResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> PlanResult<Self> {
        let plan: CropPlan = serde_json::from_str(json)?;
        if plan.version != CROP_PLAN_VERSION {
            return Err(PlanError::UnsupportedVersion {
                found: plan.version,
                expected: CROP_PLAN_VERSION,
            });
        }
        plan.validate()?;
        Ok(plan)
    }

    /// Write the plan as JSON, creating parent directories as needed.
    pub fn save(&self, path: impl AsRef<Path>) -> PlanResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> PlanResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json).map_err(|e| e.at_path(path))
    }

    /// Check structural invariants of a (possibly hand-edited) plan.
    pub fn validate(&self) -> PlanResult<()> {
        let video = &self.video;
        if video.width == 0 || video.height == 0 {
            return Err(PlanError::invalid("video dimensions must be positive"));
        }
        if !(video.duration.is_finite() && video.duration >= 0.0) {
            return Err(PlanError::invalid("video duration must be a non-negative number"));
        }
        if self.aspect_ratios.iter().any(|a| a.width == 0 || a.height == 0) {
            return Err(PlanError::invalid("aspect ratios must be at least 1:1 in each term"));
        }

        for pair in self.shots.windows(2) {
            if (pair[0].end_time - pair[1].start_time).abs() > 1e-6 {
                return Err(PlanError::invalid(format!(
                    "shots {} and {} do not tile the timeline",
                    pair[0].id, pair[1].id
                )));
            }
        }
        for shot in &self.shots {
            if !(shot.start_time >= 0.0 && shot.end_time > shot.start_time) {
                return Err(PlanError::invalid(format!(
                    "shot {} has an empty or negative time range",
                    shot.id
                )));
            }
        }

        for dets in &self.detections {
            if dets.active_tracks.windows(2).any(|a| a[1].time < a[0].time) {
                return Err(PlanError::invalid(format!(
                    "active tracks for shot {} are not time ordered",
                    dets.shot_id
                )));
            }
        }

        for camera in &self.camera_plans {
            if self.shot(camera.shot_id).is_none() {
                return Err(PlanError::invalid(format!(
                    "camera plan references unknown shot {}",
                    camera.shot_id
                )));
            }
            if camera.keyframes.windows(2).any(|k| k[1].time < k[0].time) {
                return Err(PlanError::invalid(format!(
                    "camera keyframes for shot {} are not time ordered",
                    camera.shot_id
                )));
            }
        }

        for crop in &self.crop_plans {
            if self.shot(crop.shot_id).is_none() {
                return Err(PlanError::invalid(format!(
                    "crop plan references unknown shot {}",
                    crop.shot_id
                )));
            }
            if let Some(w) = crop
                .crop_windows
                .iter()
                .find(|w| !w.fits_within(video.width, video.height))
            {
                return Err(PlanError::invalid(format!(
                    "crop window {}x{}+{}+{} at {:.3}s (shot {}, {}) exceeds the {}x{} frame",
                    w.width, w.height, w.x, w.y, w.time, crop.shot_id, crop.aspect_ratio, video.width, video.height
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CameraKeyframe, CameraMode};
    use crate::detection::{ActiveTrackSample, Detection, SubjectKind};
    use crate::geometry::BoundingBox;
    use std::path::PathBuf;

    fn sample_plan() -> CropPlan {
        let video = VideoMeta {
            path: PathBuf::from("/videos/interview.mp4"),
            duration: 12.345678901234567,
            width: 1920,
            height: 1080,
            fps: 29.97002997002997,
        };
        let mut plan = CropPlan::new(video, Some(TimeRange::new(0.1, 12.0)), vec![AspectRatio::PORTRAIT, AspectRatio::SQUARE]);
        plan.shots = vec![Shot::new(0, 0.1, 4.2), Shot::new(1, 4.2, 12.0)];

        let mut dets = ShotDetections::new(0);
        dets.detections = vec![
            Detection::new(0.1, BoundingBox::new(800.1, 200.7, 310.25, 330.0), 0.93, 0, SubjectKind::Face),
            Detection::new(0.1, BoundingBox::new(100.0, 220.0, 290.0, 300.0), 0.71, 1, SubjectKind::Face),
        ];
        dets.detections[0].activity = Some(0.66);
        dets.active_tracks = vec![ActiveTrackSample { time: 0.1, track_id: 0 }];
        let mut empty = ShotDetections::new(1);
        empty.fallback_focus = Some(BoundingBox::new(480.0, 162.0, 960.0, 540.0));
        plan.detections = vec![dets, empty];

        plan.camera_plans = vec![ShotCameraPlan {
            shot_id: 0,
            mode: CameraMode::Tracking,
            keyframes: vec![
                CameraKeyframe::new(0.1, 955.3, 365.7, 400.0, 420.0),
                CameraKeyframe::new(0.225, 957.0 / 3.0, 366.0, 401.5, 421.0),
            ],
        }];
        plan.crop_plans = vec![ShotCropPlan {
            shot_id: 0,
            aspect_ratio: AspectRatio::PORTRAIT,
            crop_windows: vec![CropWindow::new(0.1, 656, 0, 608, 1080)],
        }];
        plan
    }

    #[test]
    fn test_json_round_trip_is_exact() {
        let plan = sample_plan();
        let json = plan.to_json().unwrap();
        let restored = CropPlan::from_json(&json).unwrap();
        assert_eq!(plan, restored);
        assert_eq!(restored.camera_plans[0].keyframes[1].cx, 957.0 / 3.0);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plans").join("interview.json");
        let plan = sample_plan();
        plan.save(&path).unwrap();
        assert_eq!(CropPlan::load(&path).unwrap(), plan);
    }

    #[test]
    fn test_load_rejects_out_of_frame_window() {
        let mut plan = sample_plan();
        plan.crop_plans[0].crop_windows[0].x = 1500;
        let json = serde_json::to_string(&plan).unwrap();
        let err = CropPlan::from_json(&json).unwrap_err();
        assert!(matches!(err, PlanError::Invalid { .. }));
        assert!(err.to_string().contains("shot 0"));
    }

    #[test]
    fn test_load_rejects_unordered_active_tracks() {
        let mut plan = sample_plan();
        plan.detections[0]
            .active_tracks
            .insert(0, ActiveTrackSample { time: 3.0, track_id: 1 });
        let json = serde_json::to_string(&plan).unwrap();
        let err = CropPlan::from_json(&json).unwrap_err();
        assert!(matches!(err, PlanError::Invalid { .. }));
        assert!(err.to_string().contains("active tracks for shot 0"));
    }

    #[test]
    fn test_load_malformed_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ \"version\": 1, ").unwrap();
        let err = CropPlan::load(&path).unwrap_err();
        assert!(err.to_string().contains("broken.json"));
    }

    #[test]
    fn test_unsupported_version() {
        let mut plan = sample_plan();
        plan.version = 99;
        let json = serde_json::to_string(&plan).unwrap();
        assert!(matches!(
            CropPlan::from_json(&json),
            Err(PlanError::UnsupportedVersion { found: 99, .. })
        ));
    }

    #[test]
    fn test_windows_for_and_matches_source() {
        let plan = sample_plan();
        assert_eq!(plan.windows_for(AspectRatio::PORTRAIT).len(), 1);
        assert!(plan.windows_for(AspectRatio::LANDSCAPE).is_empty());
        assert!(plan.matches_source(Path::new("/videos/interview.mp4"), &[AspectRatio::SQUARE]));
        assert!(!plan.matches_source(Path::new("/videos/interview.mp4"), &[AspectRatio::LANDSCAPE]));
        assert_eq!(plan.range(), TimeRange::new(0.1, 12.0));
    }
}
