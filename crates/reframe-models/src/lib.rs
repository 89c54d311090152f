//! Shared data models for the reframing pipeline.
//!
//! This crate provides Serde-serializable value objects for:
//! - Frame geometry (aspect ratios, bounding boxes)
//! - Shots and per-shot subject detections
//! - Virtual camera keyframes and crop windows
//! - The persisted crop plan tying an analysis run together

pub mod camera;
pub mod crop;
pub mod detection;
pub mod error;
pub mod geometry;
pub mod plan;
pub mod shot;
pub mod video;

// Re-export common types
pub use camera::{CameraKeyframe, CameraMode, ShotCameraPlan};
pub use crop::{CropWindow, ShotCropPlan};
pub use detection::{nearest_by_time, ActiveTrackSample, Detection, ShotDetections, SubjectKind};
pub use error::{AspectRatioParseError, PlanError, PlanResult};
pub use geometry::{AspectRatio, BoundingBox};
pub use plan::{CropPlan, TimeRange, CROP_PLAN_VERSION};
pub use shot::Shot;
pub use video::VideoMeta;
