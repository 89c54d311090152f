//! Automatic reframing: shot-aware subject tracking and virtual camera
//! planning for a different output aspect ratio.
//!
//! # Architecture
//!
//! ```text
//! Video Input
//!     │
//!     ▼
//! ┌──────────────────┐
//! │  Shot Detector   │ ← HS histogram cuts (cached per source)
//! └────────┬─────────┘
//!          │  per shot
//!          ▼
//! ┌──────────────────┐
//! │ Content Analyzer │ ← Detector + IoU tracker + activity scoring
//! └────────┬─────────┘
//!          │  subjects, or fallback focus from the saliency estimator
//!          ▼
//! ┌──────────────────┐
//! │ Camera Smoother  │ ← Static/tracking/zoom paths, pan limits
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │  Crop Planner    │ ← Crop windows per aspect ratio
//! └────────┬─────────┘
//!          │  CropPlan (JSON, reusable)
//!          ▼
//! ┌──────────────────┐
//! │    Renderer      │ ← Static crop or concatenated segments
//! └────────┬─────────┘
//!          │
//!          ▼
//!   One output per aspect ratio
//! ```
//!
//! [`Reframer`] ties the stages together.

pub mod activity;
pub mod config;
pub mod content_analyzer;
pub mod crop_planner;
pub mod detector;
pub mod filters;
pub mod reframer;
pub mod renderer;
pub mod saliency;
pub mod shot_detector;
pub mod smoother;
pub mod tracker;

pub use activity::{ActivityAnalyzer, TemporalActivityTracker};
pub use config::{EarlyExitPolicy, FallbackPolicy, ReframeConfig};
pub use content_analyzer::{ContentAnalyzer, NoSubjectReason, ShotContent};
pub use crop_planner::CropPlanner;
pub use detector::{create_detector, DetectorBackend, OnnxDetectorConfig, SubjectDetector};
pub use reframer::{output_path_for, RenderOutcome, Reframer};
pub use renderer::{RenderStrategy, Renderer};
pub use saliency::SaliencyEstimator;
pub use shot_detector::ShotDetector;
pub use smoother::CameraSmoother;
pub use tracker::SimpleTracker;
