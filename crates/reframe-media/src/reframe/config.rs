//! Configuration for the reframing pipeline.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use reframe_models::AspectRatio;

use super::detector::DetectorBackend;
use crate::error::{MediaError, MediaResult};

/// Framing used when no subject is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// 60% box in the middle of the frame
    Center,
    /// 50% box biased toward the top, favoring head-and-shoulders framing
    #[default]
    UpperCenter,
    /// Box around the upper-third line
    RuleOfThirds,
    /// Edge-density saliency map with center and upper bias
    Saliency,
}

impl FromStr for FallbackPolicy {
    type Err = MediaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "center" => Ok(Self::Center),
            "upper_center" => Ok(Self::UpperCenter),
            "rule_of_thirds" => Ok(Self::RuleOfThirds),
            "saliency" => Ok(Self::Saliency),
            other => Err(MediaError::invalid_config(format!(
                "unknown fallback policy '{}'",
                other
            ))),
        }
    }
}

/// When to give up on a shot that shows no subject early on.
///
/// Analysis stops once every sample so far was empty, at least
/// `min_empty_samples` were taken and sampling has covered
/// `window_fraction` of the shot. This trades recall on shots whose subject
/// enters late for analysis speed, so it can be switched off.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EarlyExitPolicy {
    pub enabled: bool,
    pub window_fraction: f64,
    pub min_empty_samples: u32,
}

impl Default for EarlyExitPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            window_fraction: 0.1,
            min_empty_samples: 3,
        }
    }
}

impl EarlyExitPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Whether a shot with only empty samples so far should stop.
    pub fn should_stop(&self, empty_samples: u32, elapsed: f64, shot_duration: f64) -> bool {
        self.enabled
            && empty_samples >= self.min_empty_samples
            && elapsed >= self.window_fraction * shot_duration
    }
}

/// Configuration for the reframing pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReframeConfig {
    // === Output ===
    /// Target aspect ratios to plan and render (default: 9:16)
    pub aspect_ratios: Vec<AspectRatio>,

    // === Analysis Settings ===
    /// Frames per second sampled for subject analysis and camera keyframes (default: 8.0)
    pub fps_sample: f64,

    /// Height used for subject analysis frames (default: 480)
    pub analysis_resolution: u32,

    // === Shot Detection ===
    /// Frames per second sampled for shot detection (default: 4.0)
    pub shot_sample_rate: f64,

    /// Height used for shot detection histograms (default: 144)
    pub shot_detection_resolution: u32,

    /// Histogram difference score above which a cut is declared (default: 0.3)
    pub shot_threshold: f64,

    /// Shots shorter than this are merged forward, in seconds (default: 1.0)
    pub min_shot_duration: f64,

    // === Subject Detection ===
    pub detector: DetectorBackend,

    /// Minimum detector confidence (default: 0.5)
    pub min_detection_confidence: f64,

    /// Minimum subject size as fraction of frame area (default: 0.003)
    pub min_face_size: f64,

    /// Expand detected face boxes by this ratio (default: 0.3)
    pub face_expand_ratio: f64,

    pub early_exit: EarlyExitPolicy,

    // === Tracking ===
    /// IoU threshold for track matching (default: 0.3)
    pub iou_threshold: f64,

    /// Samples a track survives without a match (default: 10)
    pub max_track_gap: u32,

    // === Composition ===
    /// Headroom as fraction of crop height (default: 0.15)
    pub headroom_ratio: f64,

    /// Padding around subject as fraction of subject width (default: 0.2)
    pub subject_padding: f64,

    /// Margin kept around the focus box as fraction of its size (default: 0.05)
    pub safe_margin: f64,

    pub fallback_policy: FallbackPolicy,

    /// Frame the single most prominent subject instead of all subjects (default: true)
    pub prefer_primary_subject: bool,

    // === Camera Smoothing ===
    /// Maximum virtual camera pan speed in pixels per second (default: 600.0)
    pub max_pan_speed: f64,

    /// Maximum change of pan speed in pixels per second squared, 0 disables (default: 2000.0)
    pub max_pan_acceleration: f64,

    /// Moving-average window in seconds (default: 0.3)
    pub smoothing_window: f64,

    // === Zoom Limits ===
    /// Maximum zoom factor relative to source (default: 3.0)
    pub max_zoom_factor: f64,

    /// Minimum zoom factor (default: 1.0)
    pub min_zoom_factor: f64,

    // === Active Subject Selection ===
    pub enable_mouth_cue: bool,
    pub enable_motion_cue: bool,
    pub enable_size_cue: bool,
    pub activity_weight_mouth: f64,
    pub activity_weight_motion: f64,
    pub activity_weight_size: f64,

    /// Window in seconds for activity averaging and size trends (default: 0.5)
    pub face_activity_window: f64,

    /// Minimum time an active subject is held before switching (default: 1.0)
    pub min_switch_duration: f64,

    /// EMA factor for per-track activity smoothing (default: 0.3)
    pub activity_smoothing_alpha: f64,

    // === Rendering ===
    /// Crop change (fraction of width) that starts a new render segment (default: 0.1)
    pub group_threshold: f64,

    /// x264 preset (default: "veryfast")
    pub render_preset: String,

    /// x264 CRF (default: 23)
    pub render_crf: u8,

    pub audio_bitrate: String,

    /// Composite the crop over a blurred full-frame background (default: false)
    pub letterbox_blur: bool,

    pub letterbox_blur_sigma: f64,

    /// Round output dimensions down to even values when no explicit resolution is given (default: true)
    pub output_even_dims: bool,

    // === Parallelism ===
    /// Independent shot analysis workers, each with its own decoder and detector (default: 1)
    pub analysis_workers: usize,
}

impl Default for ReframeConfig {
    fn default() -> Self {
        Self {
            aspect_ratios: vec![AspectRatio::PORTRAIT],

            fps_sample: 8.0,
            analysis_resolution: 480,

            shot_sample_rate: 4.0,
            shot_detection_resolution: 144,
            shot_threshold: 0.3,
            min_shot_duration: 1.0,

            detector: DetectorBackend::default(),
            min_detection_confidence: 0.5,
            min_face_size: 0.003,
            face_expand_ratio: 0.3,
            early_exit: EarlyExitPolicy::default(),

            iou_threshold: 0.3,
            max_track_gap: 10,

            headroom_ratio: 0.15,
            subject_padding: 0.2,
            safe_margin: 0.05,
            fallback_policy: FallbackPolicy::UpperCenter,
            prefer_primary_subject: true,

            max_pan_speed: 600.0,
            max_pan_acceleration: 2000.0,
            smoothing_window: 0.3,

            max_zoom_factor: 3.0,
            min_zoom_factor: 1.0,

            enable_mouth_cue: true,
            enable_motion_cue: true,
            enable_size_cue: true,
            activity_weight_mouth: 0.6,
            activity_weight_motion: 0.3,
            activity_weight_size: 0.1,
            face_activity_window: 0.5,
            min_switch_duration: 1.0,
            activity_smoothing_alpha: 0.3,

            group_threshold: 0.1,
            render_preset: "veryfast".to_string(),
            render_crf: 23,
            audio_bitrate: "128k".to_string(),
            letterbox_blur: false,
            letterbox_blur_sigma: 20.0,
            output_even_dims: true,

            analysis_workers: 1,
        }
    }
}

impl ReframeConfig {
    /// Lower sample rates and a faster encoder preset.
    pub fn fast() -> Self {
        Self {
            fps_sample: 4.0,
            analysis_resolution: 360,
            shot_sample_rate: 2.0,
            render_preset: "ultrafast".to_string(),
            render_crf: 23,
            ..Default::default()
        }
    }

    /// Denser sampling, smoother camera and a slower, higher quality encode.
    pub fn quality() -> Self {
        Self {
            fps_sample: 10.0,
            analysis_resolution: 720,
            smoothing_window: 0.6,
            max_pan_speed: 450.0,
            render_preset: "slow".to_string(),
            render_crf: 18,
            early_exit: EarlyExitPolicy::disabled(),
            ..Default::default()
        }
    }

    /// Multi-speaker conversations: quicker speaker switches, wider fallback.
    pub fn podcast() -> Self {
        Self {
            fps_sample: 10.0,
            min_switch_duration: 0.8,
            face_activity_window: 0.6,
            smoothing_window: 0.25,
            max_pan_speed: 900.0,
            max_pan_acceleration: 0.0,
            fallback_policy: FallbackPolicy::Center,
            ..Default::default()
        }
    }

    /// Look up a preset by name.
    pub fn preset(name: &str) -> MediaResult<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "default" => Ok(Self::default()),
            "fast" => Ok(Self::fast()),
            "quality" => Ok(Self::quality()),
            "podcast" => Ok(Self::podcast()),
            other => Err(MediaError::invalid_config(format!("unknown preset '{}'", other))),
        }
    }

    /// Overlay `REFRAME_*` environment variables on the defaults.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Overlay `REFRAME_*` environment variables on this configuration.
    pub fn with_env_overrides(self) -> Self {
        let aspect_ratios = std::env::var("REFRAME_ASPECT_RATIOS")
            .ok()
            .and_then(|s| {
                s.split(',')
                    .map(|a| a.trim().parse::<AspectRatio>().ok())
                    .collect::<Option<Vec<_>>>()
            })
            .filter(|v| !v.is_empty())
            .unwrap_or(self.aspect_ratios);

        let detector = match std::env::var("REFRAME_DETECTOR").ok() {
            Some(name) => DetectorBackend::from_env_name(&name).unwrap_or(self.detector),
            None => self.detector,
        };

        Self {
            aspect_ratios,
            fps_sample: env_or("REFRAME_FPS_SAMPLE", self.fps_sample),
            analysis_resolution: env_or("REFRAME_ANALYSIS_RESOLUTION", self.analysis_resolution),
            shot_sample_rate: env_or("REFRAME_SHOT_SAMPLE_RATE", self.shot_sample_rate),
            shot_detection_resolution: env_or("REFRAME_SHOT_DETECTION_RESOLUTION", self.shot_detection_resolution),
            shot_threshold: env_or("REFRAME_SHOT_THRESHOLD", self.shot_threshold),
            min_shot_duration: env_or("REFRAME_MIN_SHOT_DURATION", self.min_shot_duration),
            detector,
            min_detection_confidence: env_or("REFRAME_MIN_DETECTION_CONFIDENCE", self.min_detection_confidence),
            min_face_size: env_or("REFRAME_MIN_FACE_SIZE", self.min_face_size),
            face_expand_ratio: env_or("REFRAME_FACE_EXPAND_RATIO", self.face_expand_ratio),
            early_exit: EarlyExitPolicy {
                enabled: env_or("REFRAME_EARLY_EXIT", self.early_exit.enabled),
                ..self.early_exit
            },
            iou_threshold: env_or("REFRAME_IOU_THRESHOLD", self.iou_threshold),
            max_track_gap: env_or("REFRAME_MAX_TRACK_GAP", self.max_track_gap),
            headroom_ratio: env_or("REFRAME_HEADROOM_RATIO", self.headroom_ratio),
            subject_padding: env_or("REFRAME_SUBJECT_PADDING", self.subject_padding),
            safe_margin: env_or("REFRAME_SAFE_MARGIN", self.safe_margin),
            fallback_policy: env_or("REFRAME_FALLBACK_POLICY", self.fallback_policy),
            prefer_primary_subject: env_or("REFRAME_PREFER_PRIMARY_SUBJECT", self.prefer_primary_subject),
            max_pan_speed: env_or("REFRAME_MAX_PAN_SPEED", self.max_pan_speed),
            max_pan_acceleration: env_or("REFRAME_MAX_PAN_ACCELERATION", self.max_pan_acceleration),
            smoothing_window: env_or("REFRAME_SMOOTHING_WINDOW", self.smoothing_window),
            max_zoom_factor: env_or("REFRAME_MAX_ZOOM_FACTOR", self.max_zoom_factor),
            min_zoom_factor: env_or("REFRAME_MIN_ZOOM_FACTOR", self.min_zoom_factor),
            enable_mouth_cue: env_or("REFRAME_ENABLE_MOUTH_CUE", self.enable_mouth_cue),
            enable_motion_cue: env_or("REFRAME_ENABLE_MOTION_CUE", self.enable_motion_cue),
            enable_size_cue: env_or("REFRAME_ENABLE_SIZE_CUE", self.enable_size_cue),
            activity_weight_mouth: env_or("REFRAME_ACTIVITY_WEIGHT_MOUTH", self.activity_weight_mouth),
            activity_weight_motion: env_or("REFRAME_ACTIVITY_WEIGHT_MOTION", self.activity_weight_motion),
            activity_weight_size: env_or("REFRAME_ACTIVITY_WEIGHT_SIZE", self.activity_weight_size),
            face_activity_window: env_or("REFRAME_FACE_ACTIVITY_WINDOW", self.face_activity_window),
            min_switch_duration: env_or("REFRAME_MIN_SWITCH_DURATION", self.min_switch_duration),
            activity_smoothing_alpha: env_or("REFRAME_ACTIVITY_SMOOTHING_ALPHA", self.activity_smoothing_alpha),
            group_threshold: env_or("REFRAME_GROUP_THRESHOLD", self.group_threshold),
            render_preset: std::env::var("REFRAME_RENDER_PRESET").unwrap_or(self.render_preset),
            render_crf: env_or("REFRAME_RENDER_CRF", self.render_crf),
            audio_bitrate: std::env::var("REFRAME_AUDIO_BITRATE").unwrap_or(self.audio_bitrate),
            letterbox_blur: env_or("REFRAME_LETTERBOX_BLUR", self.letterbox_blur),
            letterbox_blur_sigma: env_or("REFRAME_LETTERBOX_BLUR_SIGMA", self.letterbox_blur_sigma),
            output_even_dims: env_or("REFRAME_OUTPUT_EVEN_DIMS", self.output_even_dims),
            analysis_workers: env_or("REFRAME_ANALYSIS_WORKERS", self.analysis_workers),
        }
    }

    /// Reject values the pipeline cannot work with.
    pub fn validate(&self) -> MediaResult<()> {
        let positive = [
            ("fps_sample", self.fps_sample),
            ("shot_sample_rate", self.shot_sample_rate),
            ("max_pan_speed", self.max_pan_speed),
            ("max_zoom_factor", self.max_zoom_factor),
            ("min_zoom_factor", self.min_zoom_factor),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(MediaError::invalid_config(format!("{} must be positive, got {}", name, value)));
            }
        }

        let unit = [
            ("shot_threshold", self.shot_threshold),
            ("iou_threshold", self.iou_threshold),
            ("min_detection_confidence", self.min_detection_confidence),
            ("min_face_size", self.min_face_size),
            ("activity_smoothing_alpha", self.activity_smoothing_alpha),
            ("group_threshold", self.group_threshold),
        ];
        for (name, value) in unit {
            if !(0.0..=1.0).contains(&value) {
                return Err(MediaError::invalid_config(format!("{} must be within [0, 1], got {}", name, value)));
            }
        }

        let non_negative = [
            ("min_shot_duration", self.min_shot_duration),
            ("headroom_ratio", self.headroom_ratio),
            ("subject_padding", self.subject_padding),
            ("safe_margin", self.safe_margin),
            ("max_pan_acceleration", self.max_pan_acceleration),
            ("smoothing_window", self.smoothing_window),
            ("face_expand_ratio", self.face_expand_ratio),
            ("face_activity_window", self.face_activity_window),
            ("min_switch_duration", self.min_switch_duration),
            ("letterbox_blur_sigma", self.letterbox_blur_sigma),
        ];
        for (name, value) in non_negative {
            if !(value.is_finite() && value >= 0.0) {
                return Err(MediaError::invalid_config(format!("{} must be non-negative, got {}", name, value)));
            }
        }

        if self.min_zoom_factor > self.max_zoom_factor {
            return Err(MediaError::invalid_config(format!(
                "min_zoom_factor {} exceeds max_zoom_factor {}",
                self.min_zoom_factor, self.max_zoom_factor
            )));
        }
        if self.aspect_ratios.is_empty() {
            return Err(MediaError::invalid_config("at least one aspect ratio is required"));
        }
        if self.analysis_resolution < 32 || self.shot_detection_resolution < 16 {
            return Err(MediaError::invalid_config("analysis resolutions are too small"));
        }
        if self.analysis_workers == 0 {
            return Err(MediaError::invalid_config("analysis_workers must be at least 1"));
        }
        if self.render_crf > 51 {
            return Err(MediaError::invalid_config("render_crf must be within 0..=51"));
        }
        Ok(())
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}
