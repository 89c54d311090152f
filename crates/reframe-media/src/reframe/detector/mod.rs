//! Pluggable subject detectors.
//!
//! A detector turns one analysis frame into scored boxes in that frame's
//! pixel coordinates. The backend is chosen once from [`DetectorBackend`]
//! when an analyzer is built:
//!
//! - **Onnx**: YOLO-family model through ONNX Runtime (`onnx` feature)
//! - **SkinTone**: YCbCr skin-region heuristic, no model needed
//! - **Motion**: largest moving region between consecutive samples
//! - **Disabled**: never reports a subject, every shot uses fallback framing
//!
//! Detectors keep per-shot state (previous frame, warm sessions) and must be
//! released with [`SubjectDetector::close`].

mod motion;
#[cfg(feature = "onnx")]
mod onnx;
mod skin_tone;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use reframe_models::{BoundingBox, SubjectKind};

use crate::error::MediaResult;
use crate::frames::Frame;

pub use motion::MotionDetector;
#[cfg(feature = "onnx")]
pub use onnx::OnnxDetector;
pub use skin_tone::SkinToneDetector;

/// A scored box in analysis-frame pixels.
pub type RawDetection = (BoundingBox, f64);

/// Subject detection capability.
pub trait SubjectDetector: Send {
    /// Backend name for logs.
    fn name(&self) -> &'static str;

    /// Kind of subject this detector reports.
    fn kind(&self) -> SubjectKind;

    fn detect(&mut self, frame: &Frame) -> MediaResult<Vec<RawDetection>>;

    /// Forget state carried between frames, called at shot boundaries.
    fn reset(&mut self) {}

    /// Release backend resources. The detector must not be used afterwards.
    fn close(&mut self) {}
}

/// Settings for an ONNX Runtime detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnnxDetectorConfig {
    pub model_path: PathBuf,
    /// What the model's boxes represent
    pub kind: SubjectKind,
    /// Square model input edge (default: 640)
    pub input_size: u32,
    /// Output tensor name (default: "output0")
    pub output_name: String,
    pub confidence_threshold: f64,
    pub nms_threshold: f64,
}

impl OnnxDetectorConfig {
    pub fn new(model_path: impl Into<PathBuf>, kind: SubjectKind) -> Self {
        Self {
            model_path: model_path.into(),
            kind,
            input_size: 640,
            output_name: "output0".to_string(),
            confidence_threshold: 0.25,
            nms_threshold: 0.45,
        }
    }
}

/// Detector backend selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "backend")]
pub enum DetectorBackend {
    Onnx(OnnxDetectorConfig),
    #[default]
    SkinTone,
    Motion,
    Disabled,
}

impl DetectorBackend {
    /// Parse a backend name as used by `REFRAME_DETECTOR`.
    ///
    /// `onnx` reads the model from `REFRAME_DETECTOR_MODEL` and its subject
    /// kind from `REFRAME_DETECTOR_KIND` (`face` or `person`).
    pub fn from_env_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "skin_tone" | "skin" => Some(Self::SkinTone),
            "motion" => Some(Self::Motion),
            "disabled" | "none" => Some(Self::Disabled),
            "onnx" => {
                let model = std::env::var("REFRAME_DETECTOR_MODEL").ok()?;
                let kind = match std::env::var("REFRAME_DETECTOR_KIND").ok().as_deref() {
                    Some("person") => SubjectKind::Person,
                    _ => SubjectKind::Face,
                };
                Some(Self::Onnx(OnnxDetectorConfig::new(model, kind)))
            }
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Onnx(_) => "onnx",
            Self::SkinTone => "skin_tone",
            Self::Motion => "motion",
            Self::Disabled => "disabled",
        }
    }
}

/// Build a detector for the configured backend.
///
/// Failures are reported as [`MediaError::DetectionBackend`].
pub fn create_detector(backend: &DetectorBackend) -> MediaResult<Box<dyn SubjectDetector>> {
    match backend {
        #[cfg(feature = "onnx")]
        DetectorBackend::Onnx(config) => Ok(Box::new(OnnxDetector::new(config.clone())?)),
        #[cfg(not(feature = "onnx"))]
        DetectorBackend::Onnx(_) => Err(crate::error::MediaError::detection_backend(
            "built without the `onnx` feature",
        )),
        DetectorBackend::SkinTone => Ok(Box::new(SkinToneDetector::default())),
        DetectorBackend::Motion => Ok(Box::new(MotionDetector::default())),
        DetectorBackend::Disabled => Ok(Box::new(NullDetector)),
    }
}

/// Detector that never finds anything.
#[derive(Debug, Default)]
pub struct NullDetector;

impl SubjectDetector for NullDetector {
    fn name(&self) -> &'static str {
        "disabled"
    }

    fn kind(&self) -> SubjectKind {
        SubjectKind::Face
    }

    fn detect(&mut self, _frame: &Frame) -> MediaResult<Vec<RawDetection>> {
        Ok(Vec::new())
    }
}

/// Greedy non-maximum suppression, highest score first.
pub(crate) fn non_maximum_suppression(mut detections: Vec<RawDetection>, threshold: f64) -> Vec<RawDetection> {
    detections.sort_by(|a, b| b.1.total_cmp(&a.1));

    let mut keep: Vec<RawDetection> = Vec::with_capacity(detections.len());
    for candidate in detections {
        if keep.iter().all(|(kept, _)| kept.iou(&candidate.0) <= threshold) {
            keep.push(candidate);
        }
    }
    keep
}

/// Bounding rectangle of a connected group of grid cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CellComponent {
    pub min_col: usize,
    pub min_row: usize,
    pub max_col: usize,
    pub max_row: usize,
    pub cells: usize,
}

impl CellComponent {
    pub fn cols(&self) -> usize {
        self.max_col - self.min_col + 1
    }

    pub fn rows(&self) -> usize {
        self.max_row - self.min_row + 1
    }

    /// Share of the bounding rectangle covered by member cells.
    pub fn fill(&self) -> f64 {
        self.cells as f64 / (self.cols() * self.rows()) as f64
    }

    pub fn to_bbox(&self, cell_size: u32) -> BoundingBox {
        let c = cell_size as f64;
        BoundingBox::new(
            self.min_col as f64 * c,
            self.min_row as f64 * c,
            self.cols() as f64 * c,
            self.rows() as f64 * c,
        )
    }
}

/// 4-connected components of a row-major cell mask.
pub(crate) fn connected_components(mask: &[bool], cols: usize, rows: usize) -> Vec<CellComponent> {
    let mut seen = vec![false; mask.len()];
    let mut components = Vec::new();
    let mut stack = Vec::new();

    for start in 0..mask.len().min(cols * rows) {
        if !mask[start] || seen[start] {
            continue;
        }
        seen[start] = true;
        stack.push(start);

        let mut comp = CellComponent {
            min_col: usize::MAX,
            min_row: usize::MAX,
            max_col: 0,
            max_row: 0,
            cells: 0,
        };

        while let Some(idx) = stack.pop() {
            let (col, row) = (idx % cols, idx / cols);
            comp.min_col = comp.min_col.min(col);
            comp.min_row = comp.min_row.min(row);
            comp.max_col = comp.max_col.max(col);
            comp.max_row = comp.max_row.max(row);
            comp.cells += 1;

            let mut visit = |n: usize| {
                if mask[n] && !seen[n] {
                    seen[n] = true;
                    stack.push(n);
                }
            };
            if col > 0 {
                visit(idx - 1);
            }
            if col + 1 < cols {
                visit(idx + 1);
            }
            if row > 0 {
                visit(idx - cols);
            }
            if row + 1 < rows {
                visit(idx + cols);
            }
        }

        components.push(comp);
    }

    components
}

/// Luma plane of an RGB frame.
pub(crate) fn to_gray(frame: &Frame) -> Vec<u8> {
    frame
        .image
        .pixels()
        .map(|p| (0.299 * p[0] as f64 + 0.587 * p[1] as f64 + 0.114 * p[2] as f64).round() as u8)
        .collect()
}

#[cfg(test)]
pub(crate) mod test_support {
    use image::{Rgb, RgbImage};

    use crate::frames::Frame;

    pub const BACKGROUND: Rgb<u8> = Rgb([30, 60, 200]);
    pub const SKIN: Rgb<u8> = Rgb([224, 172, 140]);

    /// Solid background with filled rectangles.
    pub fn frame_with(width: u32, height: u32, time: f64, rects: &[(u32, u32, u32, u32, Rgb<u8>)]) -> Frame {
        let mut image = RgbImage::from_pixel(width, height, BACKGROUND);
        for &(x, y, w, h, color) in rects {
            for py in y..(y + h).min(height) {
                for px in x..(x + w).min(width) {
                    image.put_pixel(px, py, color);
                }
            }
        }
        Frame { time, index: 0, image }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MediaError;

    #[test]
    fn test_nms_keeps_best_of_overlapping() {
        let dets = vec![
            (BoundingBox::new(0.0, 0.0, 10.0, 10.0), 0.6),
            (BoundingBox::new(1.0, 1.0, 10.0, 10.0), 0.9),
            (BoundingBox::new(50.0, 50.0, 10.0, 10.0), 0.5),
        ];
        let kept = non_maximum_suppression(dets, 0.45);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].1, 0.9);
        assert_eq!(kept[1].1, 0.5);
    }

    #[test]
    fn test_connected_components() {
        // 5x3 grid with an L-shape and an isolated cell
        #[rustfmt::skip]
        let mask = [
            true,  true,  false, false, false,
            true,  false, false, false, true,
            false, false, false, false, false,
        ];
        let comps = connected_components(&mask, 5, 3);
        assert_eq!(comps.len(), 2);
        assert_eq!(comps[0].cells, 3);
        assert_eq!((comps[0].cols(), comps[0].rows()), (2, 2));
        assert_eq!(comps[1].cells, 1);
        assert_eq!(comps[1].to_bbox(8), BoundingBox::new(32.0, 8.0, 8.0, 8.0));
    }

    #[test]
    fn test_create_detector_backends() {
        assert_eq!(create_detector(&DetectorBackend::SkinTone).unwrap().name(), "skin_tone");
        assert_eq!(create_detector(&DetectorBackend::Motion).unwrap().name(), "motion");
        assert_eq!(create_detector(&DetectorBackend::Disabled).unwrap().name(), "disabled");

        let missing = DetectorBackend::Onnx(OnnxDetectorConfig::new("/no/such/model.onnx", SubjectKind::Face));
        assert!(matches!(
            create_detector(&missing),
            Err(MediaError::DetectionBackend { .. })
        ));
    }

    #[test]
    fn test_backend_from_name() {
        assert_eq!(DetectorBackend::from_env_name("Motion"), Some(DetectorBackend::Motion));
        assert_eq!(DetectorBackend::from_env_name("none"), Some(DetectorBackend::Disabled));
        assert_eq!(DetectorBackend::from_env_name("yunet"), None);
    }
}
