use std::time::Instant;

use serde::Serialize;
use thiserror::Error;

/// Axis-aligned box. Inside a pipeline every box is normalized to 0..1.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Build from center/size form (YOLO style).
    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self {
            x1: cx - w / 2.0,
            y1: cy - h / 2.0,
            x2: cx + w / 2.0,
            y2: cy + h / 2.0,
        }
    }

    pub fn check(&self) -> Result<(), MalformedDetection> {
        let coords = [self.x1, self.y1, self.x2, self.y2];
        if coords.iter().any(|c| !c.is_finite()) {
            return Err(MalformedDetection::NonFiniteBox);
        }
        if self.x1 >= self.x2 || self.y1 >= self.y2 {
            return Err(MalformedDetection::InvertedBox);
        }
        Ok(())
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn aspect_ratio(&self) -> f32 {
        self.width() / self.height()
    }

    /// Intersection over union, 0 when either box is empty.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }

    /// Scale from pixel space into 0..1, clamping to the frame.
    pub fn normalized(&self, width: u32, height: u32) -> Self {
        let w = width.max(1) as f32;
        let h = height.max(1) as f32;
        Self {
            x1: (self.x1 / w).clamp(0.0, 1.0),
            y1: (self.y1 / h).clamp(0.0, 1.0),
            x2: (self.x2 / w).clamp(0.0, 1.0),
            y2: (self.y2 / h).clamp(0.0, 1.0),
        }
    }
}

/// Coordinate space a detector reports boxes in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoordinateSpace {
    /// Pixel coordinates of a `width` x `height` image.
    Pixels { width: u32, height: u32 },
    /// Already 0..1.
    Normalized,
}

/// Detector output before normalization and validation.
#[derive(Clone, Debug, PartialEq)]
pub struct RawDetection {
    pub class_id: u32,
    pub confidence: f32,
    pub bbox: BoundingBox,
    pub space: CoordinateSpace,
}

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum MalformedDetection {
    #[error("bounding box has non-finite coordinates")]
    NonFiniteBox,
    #[error("bounding box is inverted or empty")]
    InvertedBox,
    #[error("confidence is not a finite value in 0..=1")]
    ConfidenceOutOfRange,
}

/// One validated candidate object from one frame.
///
/// Fields are private so the invariants checked in `new` hold for the lifetime of
/// the value: the box is finite and ordered, confidence is finite and in 0..=1.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    class_id: u32,
    class_name: String,
    confidence: f32,
    bbox: BoundingBox,
    timestamp: Instant,
}

impl Detection {
    pub fn new(
        class_id: u32,
        class_name: impl Into<String>,
        confidence: f32,
        bbox: BoundingBox,
        timestamp: Instant,
    ) -> Result<Self, MalformedDetection> {
        if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
            return Err(MalformedDetection::ConfidenceOutOfRange);
        }
        bbox.check()?;
        Ok(Self {
            class_id,
            class_name: class_name.into(),
            confidence,
            bbox,
            timestamp,
        })
    }

    pub fn class_id(&self) -> u32 {
        self.class_id
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn bbox(&self) -> &BoundingBox {
        &self.bbox
    }

    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }

    pub fn center(&self) -> (f32, f32) {
        self.bbox.center()
    }

    /// Box area as a fraction of the frame.
    pub fn area(&self) -> f32 {
        self.bbox.area()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_inverted_and_non_finite_boxes() {
        let now = Instant::now();
        let inverted = BoundingBox::new(0.5, 0.1, 0.4, 0.3);
        assert_eq!(
            Detection::new(5, "bus", 0.9, inverted, now).unwrap_err(),
            MalformedDetection::InvertedBox
        );
        let nan = BoundingBox::new(f32::NAN, 0.1, 0.4, 0.3);
        assert_eq!(
            Detection::new(5, "bus", 0.9, nan, now).unwrap_err(),
            MalformedDetection::NonFiniteBox
        );
        let ok = BoundingBox::new(0.1, 0.1, 0.4, 0.3);
        assert_eq!(
            Detection::new(5, "bus", 1.2, ok, now).unwrap_err(),
            MalformedDetection::ConfidenceOutOfRange
        );
        assert!(Detection::new(5, "bus", 1.0, ok, now).is_ok());
    }

    #[test]
    fn derived_geometry() {
        let b = BoundingBox::new(0.2, 0.4, 0.6, 0.6);
        let (cx, cy) = b.center();
        assert!((cx - 0.4).abs() < 1e-6);
        assert!((cy - 0.5).abs() < 1e-6);
        assert!((b.area() - 0.08).abs() < 1e-6);
        assert!((b.aspect_ratio() - 2.0).abs() < 1e-6);
    }

    #[test]
    fn normalizes_pixel_boxes_and_clamps() {
        let b = BoundingBox::new(-10.0, 72.0, 640.0, 800.0).normalized(1280, 720);
        assert_eq!(b.x1, 0.0);
        assert!((b.y1 - 0.1).abs() < 1e-6);
        assert!((b.x2 - 0.5).abs() < 1e-6);
        assert_eq!(b.y2, 1.0);
    }

    #[test]
    fn iou_of_overlapping_boxes() {
        let a = BoundingBox::new(0.0, 0.0, 2.0, 2.0);
        let b = BoundingBox::new(1.0, 1.0, 3.0, 3.0);
        assert!((a.iou(&b) - 1.0 / 7.0).abs() < 1e-6);
        let far = BoundingBox::new(5.0, 5.0, 6.0, 6.0);
        assert_eq!(a.iou(&far), 0.0);
    }
}
