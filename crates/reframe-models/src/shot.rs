//! Shot (scene) segments.

use serde::{Deserialize, Serialize};

/// A temporally contiguous segment of video with consistent visual content.
///
/// Shots produced for one analysis tile the analyzed range: each shot's
/// `end_time` equals the next shot's `start_time`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Shot {
    /// Sequential id, starting at 0 within an analysis
    pub id: u32,
    /// Start time in seconds (inclusive)
    pub start_time: f64,
    /// End time in seconds (exclusive)
    pub end_time: f64,
}

impl Shot {
    pub fn new(id: u32, start_time: f64, end_time: f64) -> Self {
        Self {
            id,
            start_time,
            end_time,
        }
    }

    #[inline]
    pub fn duration(&self) -> f64 {
        self.end_time - self.start_time
    }

    /// Half-open containment test `[start, end)`.
    #[inline]
    pub fn contains(&self, time: f64) -> bool {
        time >= self.start_time && time < self.end_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_is_half_open() {
        let shot = Shot::new(0, 1.0, 3.5);
        assert!(shot.contains(1.0));
        assert!(shot.contains(3.4999));
        assert!(!shot.contains(3.5));
        assert_eq!(shot.duration(), 2.5);
    }
}
