//! Skin-region face heuristic.
//!
//! Classifies pixels with a fixed YCbCr skin rule, aggregates them on a
//! coarse grid and keeps face-shaped connected regions. Works without a
//! model, at the cost of false positives on skin-colored backgrounds.

use reframe_models::{BoundingBox, SubjectKind};

use super::{connected_components, non_maximum_suppression, RawDetection, SubjectDetector};
use crate::error::MediaResult;
use crate::frames::Frame;

const CB_RANGE: (f64, f64) = (77.0, 127.0);
const CR_RANGE: (f64, f64) = (133.0, 173.0);
const MIN_LUMA: f64 = 40.0;

#[derive(Debug, Clone)]
pub struct SkinToneDetector {
    /// Grid cell edge in analysis pixels
    cell_size: u32,
    /// Share of skin pixels for a cell to count
    cell_coverage: f64,
    min_cells: usize,
    /// Accepted height / width of a region
    aspect_range: (f64, f64),
    min_fill: f64,
}

impl Default for SkinToneDetector {
    fn default() -> Self {
        Self {
            cell_size: 8,
            cell_coverage: 0.5,
            min_cells: 4,
            aspect_range: (0.6, 2.2),
            min_fill: 0.4,
        }
    }
}

#[inline]
fn is_skin(r: u8, g: u8, b: u8) -> bool {
    let (r, g, b) = (r as f64, g as f64, b as f64);
    let y = 0.299 * r + 0.587 * g + 0.114 * b;
    let cb = 128.0 - 0.168736 * r - 0.331264 * g + 0.5 * b;
    let cr = 128.0 + 0.5 * r - 0.418688 * g - 0.081312 * b;
    y > MIN_LUMA
        && (CB_RANGE.0..=CB_RANGE.1).contains(&cb)
        && (CR_RANGE.0..=CR_RANGE.1).contains(&cr)
}

impl SkinToneDetector {
    fn skin_mask(&self, frame: &Frame) -> (Vec<bool>, usize, usize) {
        let cell = self.cell_size;
        let cols = (frame.width() / cell) as usize;
        let rows = (frame.height() / cell) as usize;
        let mut mask = vec![false; cols * rows];

        for row in 0..rows {
            for col in 0..cols {
                let mut skin = 0u32;
                for dy in 0..cell {
                    for dx in 0..cell {
                        let p = frame.image.get_pixel(col as u32 * cell + dx, row as u32 * cell + dy);
                        if is_skin(p[0], p[1], p[2]) {
                            skin += 1;
                        }
                    }
                }
                mask[row * cols + col] = skin as f64 >= self.cell_coverage * (cell * cell) as f64;
            }
        }

        (mask, cols, rows)
    }
}

impl SubjectDetector for SkinToneDetector {
    fn name(&self) -> &'static str {
        "skin_tone"
    }

    fn kind(&self) -> SubjectKind {
        SubjectKind::Face
    }

    fn detect(&mut self, frame: &Frame) -> MediaResult<Vec<RawDetection>> {
        let (mask, cols, rows) = self.skin_mask(frame);

        let mut detections = Vec::new();
        for comp in connected_components(&mask, cols, rows) {
            if comp.cells < self.min_cells {
                continue;
            }
            let aspect = comp.rows() as f64 / comp.cols() as f64;
            if aspect < self.aspect_range.0 || aspect > self.aspect_range.1 {
                continue;
            }
            let fill = comp.fill();
            if fill < self.min_fill {
                continue;
            }

            let mut bbox = comp.to_bbox(self.cell_size);
            // Exposed neck and chest extend the region downward
            if bbox.height > 1.4 * bbox.width {
                bbox = BoundingBox::new(bbox.x, bbox.y, bbox.width, 1.3 * bbox.width);
            }
            detections.push((bbox, 0.5 + 0.5 * fill));
        }

        Ok(non_maximum_suppression(detections, 0.3))
    }
}
