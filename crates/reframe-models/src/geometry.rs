//! Frame geometry: target aspect ratios and pixel bounding boxes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AspectRatioParseError;

/// Target output aspect ratio expressed as integer `width:height`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AspectRatio {
    pub width: u32,
    pub height: u32,
}

impl AspectRatio {
    /// Vertical short-form video (9:16)
    pub const PORTRAIT: AspectRatio = AspectRatio {
        width: 9,
        height: 16,
    };

    /// Square (1:1)
    pub const SQUARE: AspectRatio = AspectRatio {
        width: 1,
        height: 1,
    };

    /// Feed portrait (4:5)
    pub const FEED_PORTRAIT: AspectRatio = AspectRatio {
        width: 4,
        height: 5,
    };

    /// Widescreen (16:9)
    pub const LANDSCAPE: AspectRatio = AspectRatio {
        width: 16,
        height: 9,
    };

    /// Create a new aspect ratio.
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Returns `width / height`.
    pub fn ratio(&self) -> f64 {
        self.width as f64 / self.height as f64
    }

    /// File-name friendly form, e.g. `9x16`.
    pub fn slug(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.width, self.height)
    }
}

impl FromStr for AspectRatio {
    type Err = AspectRatioParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| AspectRatioParseError::InvalidFormat(s.to_string()))?;

        let width: u32 = w
            .parse()
            .map_err(|_| AspectRatioParseError::InvalidNumber(w.to_string()))?;
        let height: u32 = h
            .parse()
            .map_err(|_| AspectRatioParseError::InvalidNumber(h.to_string()))?;

        if width == 0 || height == 0 {
            return Err(AspectRatioParseError::ZeroValue);
        }

        Ok(AspectRatio { width, height })
    }
}

impl Default for AspectRatio {
    fn default() -> Self {
        Self::PORTRAIT
    }
}

/// Bounding box in source pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// Left edge x-coordinate
    pub x: f64,
    /// Top edge y-coordinate
    pub y: f64,
    /// Box width
    pub width: f64,
    /// Box height
    pub height: f64,
}

impl BoundingBox {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width: width.max(0.0),
            height: height.max(0.0),
        }
    }

    /// Build a box of the given size around a center point.
    pub fn from_center(cx: f64, cy: f64, width: f64, height: f64) -> Self {
        Self::new(cx - width / 2.0, cy - height / 2.0, width, height)
    }

    #[inline]
    pub fn cx(&self) -> f64 {
        self.x + self.width / 2.0
    }

    #[inline]
    pub fn cy(&self) -> f64 {
        self.y + self.height / 2.0
    }

    #[inline]
    pub fn center(&self) -> (f64, f64) {
        (self.cx(), self.cy())
    }

    /// Right edge x-coordinate.
    #[inline]
    pub fn x2(&self) -> f64 {
        self.x + self.width
    }

    /// Bottom edge y-coordinate.
    #[inline]
    pub fn y2(&self) -> f64 {
        self.y + self.height
    }

    #[inline]
    pub fn area(&self) -> f64 {
        self.width * self.height
    }

    /// Intersection over Union with another box, in `[0, 1]`.
    pub fn iou(&self, other: &BoundingBox) -> f64 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = self.x2().min(other.x2());
        let y2 = self.y2().min(other.y2());

        if x2 <= x1 || y2 <= y1 {
            return 0.0;
        }

        let intersection = (x2 - x1) * (y2 - y1);
        let union = self.area() + other.area() - intersection;

        if union > 0.0 {
            (intersection / union).clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    /// Return a new box with `padding` pixels added on all sides.
    pub fn pad(&self, padding: f64) -> BoundingBox {
        BoundingBox::new(
            self.x - padding,
            self.y - padding,
            self.width + 2.0 * padding,
            self.height + 2.0 * padding,
        )
    }

    /// Grow both dimensions by `ratio` around the center (0.3 = 30% larger).
    pub fn expand(&self, ratio: f64) -> BoundingBox {
        let scale = 1.0 + ratio;
        BoundingBox::from_center(self.cx(), self.cy(), self.width * scale, self.height * scale)
    }

    /// Map a box between coordinate spaces (e.g. analysis frame to source frame).
    pub fn scale(&self, sx: f64, sy: f64) -> BoundingBox {
        BoundingBox::new(self.x * sx, self.y * sy, self.width * sx, self.height * sy)
    }

    /// Clamp box to frame boundaries while preserving its size.
    ///
    /// A dimension larger than the frame is centered on that axis instead.
    pub fn clamp(&self, frame_width: u32, frame_height: u32) -> BoundingBox {
        let fw = frame_width as f64;
        let fh = frame_height as f64;

        let x = if self.width > fw {
            (fw - self.width) / 2.0
        } else {
            self.x.max(0.0).min(fw - self.width)
        };

        let y = if self.height > fh {
            (fh - self.height) / 2.0
        } else {
            self.y.max(0.0).min(fh - self.height)
        };

        BoundingBox {
            x,
            y,
            width: self.width,
            height: self.height,
        }
    }

    /// Clip the box to the frame, shrinking it where it overhangs.
    pub fn intersect_frame(&self, frame_width: u32, frame_height: u32) -> BoundingBox {
        let x1 = self.x.max(0.0);
        let y1 = self.y.max(0.0);
        let x2 = self.x2().min(frame_width as f64);
        let y2 = self.y2().min(frame_height as f64);
        BoundingBox::new(x1, y1, x2 - x1, y2 - y1)
    }

    /// Smallest box containing all input boxes.
    pub fn union(boxes: &[BoundingBox]) -> Option<BoundingBox> {
        if boxes.is_empty() {
            return None;
        }

        let x = boxes.iter().map(|b| b.x).fold(f64::INFINITY, f64::min);
        let y = boxes.iter().map(|b| b.y).fold(f64::INFINITY, f64::min);
        let x2 = boxes.iter().map(|b| b.x2()).fold(f64::NEG_INFINITY, f64::max);
        let y2 = boxes.iter().map(|b| b.y2()).fold(f64::NEG_INFINITY, f64::max);

        Some(BoundingBox::new(x, y, x2 - x, y2 - y))
    }
}
