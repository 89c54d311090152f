//! Moving-region detector.
//!
//! Reports the largest region of cells whose mean absolute luma difference
//! from the previous sample exceeds a threshold.

use reframe_models::SubjectKind;

use super::{connected_components, to_gray, RawDetection, SubjectDetector};
use crate::error::MediaResult;
use crate::frames::Frame;

#[derive(Debug, Clone)]
pub struct MotionDetector {
    cell_size: u32,
    /// Mean per-pixel luma change for a cell to count as moving
    diff_threshold: f64,
    min_cells: usize,
    previous: Option<(u32, u32, Vec<u8>)>,
}

impl Default for MotionDetector {
    fn default() -> Self {
        Self {
            cell_size: 16,
            diff_threshold: 20.0,
            min_cells: 2,
            previous: None,
        }
    }
}

impl SubjectDetector for MotionDetector {
    fn name(&self) -> &'static str {
        "motion"
    }

    fn kind(&self) -> SubjectKind {
        SubjectKind::Person
    }

    fn detect(&mut self, frame: &Frame) -> MediaResult<Vec<RawDetection>> {
        let (width, height) = (frame.width(), frame.height());
        let gray = to_gray(frame);

        let previous = match self.previous.replace((width, height, gray)) {
            Some((w, h, prev)) if w == width && h == height => prev,
            _ => return Ok(Vec::new()),
        };
        let current = match &self.previous {
            Some((_, _, g)) => g,
            None => return Ok(Vec::new()),
        };

        let cell = self.cell_size;
        let cols = (width / cell) as usize;
        let rows = (height / cell) as usize;
        let mut mask = vec![false; cols * rows];

        for row in 0..rows {
            for col in 0..cols {
                let mut diff = 0u64;
                for dy in 0..cell as usize {
                    let base = (row * cell as usize + dy) * width as usize + col * cell as usize;
                    for i in base..base + cell as usize {
                        diff += current[i].abs_diff(previous[i]) as u64;
                    }
                }
                let mean = diff as f64 / (cell * cell) as f64;
                mask[row * cols + col] = mean > self.diff_threshold;
            }
        }

        let best = connected_components(&mask, cols, rows)
            .into_iter()
            .filter(|c| c.cells >= self.min_cells)
            .max_by_key(|c| c.cells);

        Ok(best
            .map(|c| vec![(c.to_bbox(cell), (0.5 + 0.5 * c.fill()).min(1.0))])
            .unwrap_or_default())
    }

    fn reset(&mut self) {
        self.previous = None;
    }

    fn close(&mut self) {
        self.previous = None;
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{frame_with, SKIN};
    use super::*;

    #[test]
    fn test_first_frame_reports_nothing() {
        let mut det = MotionDetector::default();
        let frame = frame_with(160, 96, 0.0, &[]);
        assert!(det.detect(&frame).unwrap().is_empty());
    }

    #[test]
    fn test_moving_block_detected() {
        let mut det = MotionDetector::default();
        det.detect(&frame_with(160, 96, 0.0, &[])).unwrap();

        let dets = det.detect(&frame_with(160, 96, 0.125, &[(32, 16, 48, 48, SKIN)])).unwrap();
        assert_eq!(dets.len(), 1);
        let (bbox, score) = dets[0];
        assert_eq!((bbox.x, bbox.y, bbox.width, bbox.height), (32.0, 16.0, 48.0, 48.0));
        assert!(score > 0.9);
    }

    #[test]
    fn test_reset_forgets_previous_frame() {
        let mut det = MotionDetector::default();
        det.detect(&frame_with(160, 96, 0.0, &[])).unwrap();
        det.reset();
        let dets = det.detect(&frame_with(160, 96, 0.125, &[(32, 16, 48, 48, SKIN)])).unwrap();
        assert!(dets.is_empty());
    }
}
