//! # Geometry Module
//!
//! Pixel and resolution-independent rectangles, overlap measures, and the
//! storage codec for normalized rectangles.
//!
//! ## Storage format
//!
//! A [`NormalizedRect`] is persisted as `"x,y,w,h"` with exactly six decimal
//! digits per component. A rectangle that came from a low-confidence source
//! (fallback locator strategies) carries a trailing `|fallback` marker:
//!
//! ```text
//! 0.050000,0.050000,0.100000,0.030000
//! 0.050000,0.050000,0.100000,0.030000|fallback
//! ```

use crate::errors::{LearningError, LearningResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Marker appended to stored rectangles produced by fallback strategies
pub const FALLBACK_MARKER: &str = "|fallback";

/// Pixel dimensions of the prepared (perspective-corrected) image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// True when the image has no usable area for pixel/normalized conversions
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Axis-aligned rectangle in image pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PixelRect {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

impl PixelRect {
    pub fn new(left: f64, top: f64, width: f64, height: f64) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    pub fn right(&self) -> f64 {
        self.left + self.width
    }

    pub fn bottom(&self) -> f64 {
        self.top + self.height
    }

    pub fn area(&self) -> f64 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    pub fn center(&self) -> (f64, f64) {
        (self.left + self.width * 0.5, self.top + self.height * 0.5)
    }

    /// Smallest rectangle enclosing both rectangles
    pub fn union(&self, other: &Self) -> Self {
        let left = self.left.min(other.left);
        let top = self.top.min(other.top);
        let right = self.right().max(other.right());
        let bottom = self.bottom().max(other.bottom());
        Self::new(left, top, right - left, bottom - top)
    }

    pub fn intersection_area(&self, other: &Self) -> f64 {
        let w = (self.right().min(other.right()) - self.left.max(other.left)).max(0.0);
        let h = (self.bottom().min(other.bottom()) - self.top.max(other.top)).max(0.0);
        w * h
    }

    pub fn intersects(&self, other: &Self) -> bool {
        self.intersection_area(other) > 0.0
    }

    /// Intersection-over-union; 0.0 when the union is degenerate
    pub fn iou(&self, other: &Self) -> f64 {
        let inter = self.intersection_area(other);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// Bounding envelope of a set of rectangles, `None` when the set is empty
pub fn envelope<'a, I>(rects: I) -> Option<PixelRect>
where
    I: IntoIterator<Item = &'a PixelRect>,
{
    rects
        .into_iter()
        .fold(None, |acc: Option<PixelRect>, r| match acc {
            Some(env) => Some(env.union(r)),
            None => Some(*r),
        })
}

/// Median of a sample: middle value, or mean of the two middle values for even counts
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        Some(sorted[mid])
    } else {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    }
}

/// Rectangle as fractions of the image width/height
///
/// Invariant: every component is finite, `x, y` lie in `[0, 1]` and
/// `w, h` lie in `(0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalizedRect {
    x: f64,
    y: f64,
    w: f64,
    h: f64,
}

impl NormalizedRect {
    /// Build a rectangle, rejecting components outside the normalized range
    pub fn new(x: f64, y: f64, w: f64, h: f64) -> Option<Self> {
        let finite = [x, y, w, h].iter().all(|v| v.is_finite());
        let in_range = (0.0..=1.0).contains(&x)
            && (0.0..=1.0).contains(&y)
            && w > 0.0
            && w <= 1.0
            && h > 0.0
            && h <= 1.0;
        if finite && in_range {
            Some(Self { x, y, w, h })
        } else {
            None
        }
    }

    pub fn x(&self) -> f64 {
        self.x
    }

    pub fn y(&self) -> f64 {
        self.y
    }

    pub fn w(&self) -> f64 {
        self.w
    }

    pub fn h(&self) -> f64 {
        self.h
    }

    pub fn center(&self) -> (f64, f64) {
        (self.x + self.w * 0.5, self.y + self.h * 0.5)
    }

    /// Convert a pixel rectangle, clipping it to the image first
    pub fn from_pixels(rect: &PixelRect, image: ImageSize) -> Option<Self> {
        if image.is_empty() {
            return None;
        }
        let iw = image.width as f64;
        let ih = image.height as f64;
        let left = rect.left.clamp(0.0, iw);
        let top = rect.top.clamp(0.0, ih);
        let right = rect.right().clamp(0.0, iw);
        let bottom = rect.bottom().clamp(0.0, ih);
        Self::new(left / iw, top / ih, (right - left) / iw, (bottom - top) / ih)
    }

    /// Project onto an image, clipping the far edges to the image bounds
    pub fn to_pixels(&self, image: ImageSize) -> PixelRect {
        let iw = image.width as f64;
        let ih = image.height as f64;
        let left = self.x * iw;
        let top = self.y * ih;
        let right = (left + self.w * iw).min(iw);
        let bottom = (top + self.h * ih).min(ih);
        PixelRect::new(left, top, (right - left).max(0.0), (bottom - top).max(0.0))
    }

    /// Shift by a normalized offset, keeping the rectangle inside the unit square
    pub fn translated(&self, dx: f64, dy: f64) -> Self {
        let x = (self.x + dx).clamp(0.0, (1.0 - self.w).max(0.0));
        let y = (self.y + dy).clamp(0.0, (1.0 - self.h).max(0.0));
        Self {
            x,
            y,
            w: self.w,
            h: self.h,
        }
    }

    /// Six-decimal `"x,y,w,h"` representation
    pub fn encode(&self) -> String {
        format!("{:.6},{:.6},{:.6},{:.6}", self.x, self.y, self.w, self.h)
    }
}

impl fmt::Display for NormalizedRect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for NormalizedRect {
    type Err = LearningError;

    fn from_str(s: &str) -> LearningResult<Self> {
        let parts: Vec<f64> = s
            .split(',')
            .map(|p| p.trim().parse::<f64>())
            .collect::<Result<_, _>>()
            .map_err(|e| LearningError::Format(format!("rectangle '{}': {}", s, e)))?;
        if parts.len() != 4 {
            return Err(LearningError::Format(format!(
                "rectangle '{}' has {} components, expected 4",
                s,
                parts.len()
            )));
        }
        Self::new(parts[0], parts[1], parts[2], parts[3]).ok_or_else(|| {
            LearningError::Format(format!("rectangle '{}' is outside the unit square", s))
        })
    }
}

/// A normalized rectangle as persisted, with its low-confidence flag
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StoredRect {
    pub rect: NormalizedRect,
    pub fallback: bool,
}

impl StoredRect {
    pub fn new(rect: NormalizedRect, fallback: bool) -> Self {
        Self { rect, fallback }
    }

    pub fn encode(&self) -> String {
        if self.fallback {
            format!("{}{}", self.rect.encode(), FALLBACK_MARKER)
        } else {
            self.rect.encode()
        }
    }
}

impl FromStr for StoredRect {
    type Err = LearningError;

    fn from_str(s: &str) -> LearningResult<Self> {
        let trimmed = s.trim();
        match trimmed.strip_suffix(FALLBACK_MARKER) {
            Some(body) => Ok(Self::new(body.parse()?, true)),
            None => Ok(Self::new(trimmed.parse()?, false)),
        }
    }
}

impl TryFrom<String> for StoredRect {
    type Error = LearningError;

    fn try_from(value: String) -> LearningResult<Self> {
        value.parse()
    }
}

impl From<StoredRect> for String {
    fn from(value: StoredRect) -> Self {
        value.encode()
    }
}
