//! YOLOv8 output decoding shared by model backends.
//!
//! The head emits a `[4 + classes, anchors]` matrix (batch dimension dropped):
//! rows 0..4 are `cx, cy, w, h` in model input pixels, the remaining rows are
//! per-class scores.

use crate::detect::result::{BoundingBox, CoordinateSpace, RawDetection};

/// Default IoU above which a lower-scored box of the same class is suppressed.
pub const DEFAULT_NMS_THRESHOLD: f32 = 0.45;

/// Geometry needed to map model-space boxes back onto the source frame.
#[derive(Clone, Copy, Debug)]
pub struct DecodeGeometry {
    pub input_width: u32,
    pub input_height: u32,
    pub frame_width: u32,
    pub frame_height: u32,
}

/// Decode a row-major `[4 + classes, anchors]` head into candidates.
///
/// Each anchor keeps only its best class. Anchors under `score_threshold`
/// are skipped. Boxes come back in frame pixel space.
pub fn decode(
    output: &[f32],
    classes: usize,
    score_threshold: f32,
    geometry: DecodeGeometry,
) -> Vec<RawDetection> {
    let rows = 4 + classes;
    if classes == 0 || output.len() % rows != 0 {
        return Vec::new();
    }
    let anchors = output.len() / rows;
    let sx = geometry.frame_width as f32 / geometry.input_width.max(1) as f32;
    let sy = geometry.frame_height as f32 / geometry.input_height.max(1) as f32;
    let at = |row: usize, anchor: usize| output[row * anchors + anchor];

    let mut out = Vec::new();
    for anchor in 0..anchors {
        let mut best_class = 0usize;
        let mut best_score = f32::NEG_INFINITY;
        for class in 0..classes {
            let score = at(4 + class, anchor);
            if score > best_score {
                best_score = score;
                best_class = class;
            }
        }
        if !(best_score >= score_threshold) {
            continue;
        }
        let bbox = BoundingBox::from_center(
            at(0, anchor) * sx,
            at(1, anchor) * sy,
            at(2, anchor) * sx,
            at(3, anchor) * sy,
        );
        out.push(RawDetection {
            class_id: best_class as u32,
            confidence: best_score,
            bbox,
            space: CoordinateSpace::Pixels {
                width: geometry.frame_width,
                height: geometry.frame_height,
            },
        });
    }
    out
}

/// Greedy per-class non-maximum suppression.
pub fn nms(mut candidates: Vec<RawDetection>, iou_threshold: f32) -> Vec<RawDetection> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<RawDetection> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let suppressed = kept.iter().any(|k| {
            k.class_id == candidate.class_id && k.bbox.iou(&candidate.bbox) > iou_threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> DecodeGeometry {
        DecodeGeometry {
            input_width: 100,
            input_height: 100,
            frame_width: 200,
            frame_height: 100,
        }
    }

    #[test]
    fn decode_picks_best_class_and_scales_to_frame() {
        // 2 classes, 2 anchors; second anchor is below threshold.
        #[rustfmt::skip]
        let output = [
            50.0, 10.0, // cx
            50.0, 10.0, // cy
            20.0, 4.0,  // w
            10.0, 4.0,  // h
            0.2, 0.1,   // class 0
            0.9, 0.2,   // class 1
        ];
        let dets = decode(&output, 2, 0.5, geometry());
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].class_id, 1);
        assert_eq!(dets[0].bbox, BoundingBox::new(80.0, 45.0, 120.0, 55.0));
        assert_eq!(
            dets[0].space,
            CoordinateSpace::Pixels {
                width: 200,
                height: 100
            }
        );
    }

    #[test]
    fn decode_rejects_misshapen_output() {
        assert!(decode(&[0.0; 7], 2, 0.1, geometry()).is_empty());
    }

    #[test]
    fn nms_is_per_class() {
        let det = |class_id, confidence, x1: f32| RawDetection {
            class_id,
            confidence,
            bbox: BoundingBox::new(x1, 0.0, x1 + 10.0, 10.0),
            space: CoordinateSpace::Normalized,
        };
        let kept = nms(
            vec![det(5, 0.6, 1.0), det(5, 0.9, 0.0), det(2, 0.5, 0.0), det(5, 0.4, 50.0)],
            DEFAULT_NMS_THRESHOLD,
        );
        let summary: Vec<(u32, f32)> = kept.iter().map(|d| (d.class_id, d.confidence)).collect();
        assert_eq!(summary, vec![(5, 0.9), (2, 0.5), (5, 0.4)]);
    }
}
