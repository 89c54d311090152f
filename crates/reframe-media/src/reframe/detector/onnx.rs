//! YOLO-family detector through ONNX Runtime.
//!
//! Supports the two output layouts in common use:
//! - COCO models, `[1, 84, N]` (4 box + 80 class scores), person class only
//! - single-class face models, `[1, 5, N]` or `[1, 20, N]` with landmarks,
//!   where row 4 is the face confidence
//!
//! `N` follows from the input size and the stride-8/16/32 heads.

use image::imageops::FilterType;
use ndarray::Array;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::{Tensor, Value};
use tracing::{debug, info};

use reframe_models::{BoundingBox, SubjectKind};

use super::{non_maximum_suppression, OnnxDetectorConfig, RawDetection, SubjectDetector};
use crate::error::{MediaError, MediaResult};
use crate::frames::Frame;

const STRIDES: [u32; 3] = [8, 16, 32];
const COCO_FEATURES: usize = 84;
const PERSON_CLASS: usize = 0;

pub struct OnnxDetector {
    session: Option<Session>,
    config: OnnxDetectorConfig,
}

impl OnnxDetector {
    pub fn new(config: OnnxDetectorConfig) -> MediaResult<Self> {
        if !config.model_path.exists() {
            return Err(MediaError::detection_backend(format!(
                "model not found: {}",
                config.model_path.display()
            )));
        }
        if config.input_size == 0 || config.input_size % 32 != 0 {
            return Err(MediaError::detection_backend(format!(
                "input size {} is not a multiple of 32",
                config.input_size
            )));
        }

        let session = create_session(&config)?;
        info!(
            model_path = %config.model_path.display(),
            input_size = config.input_size,
            kind = ?config.kind,
            "ONNX detector initialized"
        );

        Ok(Self {
            session: Some(session),
            config,
        })
    }

    fn preprocess(&self, frame: &Frame) -> MediaResult<Value> {
        let size = self.config.input_size;
        let resized = image::imageops::resize(&frame.image, size, size, FilterType::Triangle);
        let (w, h) = (size as usize, size as usize);

        // HWC -> CHW, normalized to [0, 1]
        let mut chw_data: Vec<f32> = Vec::with_capacity(3 * h * w);
        for c in 0..3 {
            for pixel in resized.pixels() {
                chw_data.push(pixel[c] as f32 / 255.0);
            }
        }

        let shape = vec![1usize, 3, h, w];
        Tensor::from_array((shape, chw_data.into_boxed_slice()))
            .map(Value::from)
            .map_err(|e| MediaError::detection_backend(format!("failed to create tensor: {}", e)))
    }

    fn run_inference(&mut self, input: Value) -> MediaResult<Vec<f32>> {
        let output_name = self.config.output_name.clone();
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| MediaError::detection_backend("detector already closed"))?;

        let outputs = session
            .run(ort::inputs![input])
            .map_err(|e| MediaError::detection_backend(format!("inference failed: {}", e)))?;

        let output = outputs
            .get(output_name.as_str())
            .ok_or_else(|| MediaError::detection_backend(format!("missing {} tensor", output_name)))?;

        let tensor = output
            .try_extract_tensor::<f32>()
            .map_err(|e| MediaError::detection_backend(format!("failed to extract tensor: {}", e)))?;

        Ok(tensor.1.iter().copied().collect())
    }
}

/// Candidate boxes produced by the detection heads for a square input.
pub(crate) fn anchor_count(input_size: u32) -> usize {
    STRIDES
        .iter()
        .map(|s| ((input_size / s) * (input_size / s)) as usize)
        .sum()
}

/// Decode a `[features, boxes]` YOLO output into frame-space boxes.
pub(crate) fn decode_output(
    outputs: &[f32],
    input_size: u32,
    frame_width: u32,
    frame_height: u32,
    confidence_threshold: f64,
) -> MediaResult<Vec<RawDetection>> {
    let num_boxes = anchor_count(input_size);
    if num_boxes == 0 || outputs.len() % num_boxes != 0 {
        return Err(MediaError::detection_backend(format!(
            "output of {} values does not match {} anchors",
            outputs.len(),
            num_boxes
        )));
    }
    let num_features = outputs.len() / num_boxes;
    let score_row = match num_features {
        COCO_FEATURES => 4 + PERSON_CLASS,
        5 | 20 => 4,
        other => {
            return Err(MediaError::detection_backend(format!(
                "unsupported output layout with {} features",
                other
            )))
        }
    };

    let output_array = Array::from_shape_vec((num_features, num_boxes), outputs.to_vec())
        .map_err(|e| MediaError::detection_backend(format!("failed to reshape output: {}", e)))?;
    let transposed = output_array.t();

    let scale_w = frame_width as f64 / input_size as f64;
    let scale_h = frame_height as f64 / input_size as f64;

    let mut candidates = Vec::new();
    for i in 0..num_boxes {
        let score = transposed[[i, score_row]] as f64;
        if score < confidence_threshold {
            continue;
        }
        let cx = transposed[[i, 0]] as f64;
        let cy = transposed[[i, 1]] as f64;
        let w = transposed[[i, 2]] as f64;
        let h = transposed[[i, 3]] as f64;

        let bbox = BoundingBox::from_center(cx * scale_w, cy * scale_h, w * scale_w, h * scale_h)
            .intersect_frame(frame_width, frame_height);
        if bbox.area() > 0.0 {
            candidates.push((bbox, score.min(1.0)));
        }
    }

    Ok(candidates)
}

impl SubjectDetector for OnnxDetector {
    fn name(&self) -> &'static str {
        "onnx"
    }

    fn kind(&self) -> SubjectKind {
        self.config.kind
    }

    fn detect(&mut self, frame: &Frame) -> MediaResult<Vec<RawDetection>> {
        let input = self.preprocess(frame)?;
        let outputs = self.run_inference(input)?;
        let candidates = decode_output(
            &outputs,
            self.config.input_size,
            frame.width(),
            frame.height(),
            self.config.confidence_threshold,
        )?;
        Ok(non_maximum_suppression(candidates, self.config.nms_threshold))
    }

    fn close(&mut self) {
        if self.session.take().is_some() {
            debug!(model_path = %self.config.model_path.display(), "ONNX session released");
        }
    }
}

fn create_session(config: &OnnxDetectorConfig) -> MediaResult<Session> {
    let model_bytes = std::fs::read(&config.model_path)
        .map_err(|e| MediaError::detection_backend(format!("failed to read model file: {}", e)))?;

    Session::builder()
        .map_err(|e| MediaError::detection_backend(format!("failed to create session builder: {}", e)))?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(|e| MediaError::detection_backend(format!("failed to set optimization level: {}", e)))?
        .commit_from_memory(&model_bytes)
        .map_err(|e| MediaError::detection_backend(format!("failed to load ONNX model: {}", e)))
}
