//! Detection filter: turns validated candidates into qualifying detections.
//!
//! Rules run in a fixed order and a candidate leaves at the first rule it
//! fails: class allowlist, confidence, zone, size/aspect. Survivors are ranked
//! by confidence (larger area wins ties) and capped at `max_detections`.

use std::cmp::Ordering;

use crate::config::PipelineConfig;
use crate::detect::Detection;

/// Which rule dropped a candidate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rejection {
    Class,
    Confidence,
    Zone,
    Size,
    /// Did not make the `max_detections` cut.
    Capped,
}

/// Per-rule rejection tally for one call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RejectionCounts {
    pub class: u64,
    pub confidence: u64,
    pub zone: u64,
    pub size: u64,
    pub capped: u64,
}

impl RejectionCounts {
    fn record(&mut self, rejection: Rejection) {
        match rejection {
            Rejection::Class => self.class += 1,
            Rejection::Confidence => self.confidence += 1,
            Rejection::Zone => self.zone += 1,
            Rejection::Size => self.size += 1,
            Rejection::Capped => self.capped += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.class + self.confidence + self.zone + self.size + self.capped
    }
}

#[derive(Clone, Debug, Default)]
pub struct FilterOutcome {
    /// Qualifying detections, best first.
    pub qualifying: Vec<Detection>,
    pub rejected: RejectionCounts,
}

impl FilterOutcome {
    /// The detection that would trigger an event, if any.
    pub fn best(&self) -> Option<&Detection> {
        self.qualifying.first()
    }
}

/// Check one detection against the per-detection rules.
pub fn check(detection: &Detection, config: &PipelineConfig) -> Result<(), Rejection> {
    if !config.targets(detection.class_name()) {
        return Err(Rejection::Class);
    }
    if detection.confidence() < config.min_confidence {
        return Err(Rejection::Confidence);
    }
    let (cx, cy) = detection.center();
    if !config.zone.contains(cx, cy) {
        return Err(Rejection::Zone);
    }
    let bbox = detection.bbox();
    let aspect = bbox.aspect_ratio();
    if bbox.area() < config.min_area
        || aspect < config.min_aspect_ratio
        || aspect > config.max_aspect_ratio
    {
        return Err(Rejection::Size);
    }
    Ok(())
}

/// Ranking used for the cap and for choosing an event trigger.
pub fn rank(a: &Detection, b: &Detection) -> Ordering {
    b.confidence()
        .total_cmp(&a.confidence())
        .then_with(|| b.area().total_cmp(&a.area()))
}

/// Apply every rule to `candidates`. Pure: same input, same output.
pub fn filter(candidates: Vec<Detection>, config: &PipelineConfig) -> FilterOutcome {
    let mut rejected = RejectionCounts::default();
    let mut qualifying: Vec<Detection> = candidates
        .into_iter()
        .filter(|det| match check(det, config) {
            Ok(()) => true,
            Err(rule) => {
                rejected.record(rule);
                false
            }
        })
        .collect();

    // Stable sort keeps input order for exact ties, so replays rank identically.
    qualifying.sort_by(rank);
    if qualifying.len() > config.max_detections {
        let dropped = qualifying.len() - config.max_detections;
        qualifying.truncate(config.max_detections);
        for _ in 0..dropped {
            rejected.record(Rejection::Capped);
        }
    }

    FilterOutcome {
        qualifying,
        rejected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Zone;
    use crate::detect::BoundingBox;
    use std::time::Instant;

    fn det(class: &str, confidence: f32, bbox: BoundingBox) -> Detection {
        Detection::new(5, class, confidence, bbox, Instant::now()).unwrap()
    }

    fn wide_box() -> BoundingBox {
        BoundingBox::new(0.1, 0.3, 0.7, 0.7)
    }

    fn config() -> PipelineConfig {
        PipelineConfig {
            min_area: 0.05,
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn first_failing_rule_is_counted() {
        let cfg = config();
        let out = filter(
            vec![
                det("car", 0.99, wide_box()),
                det("bus", 0.5, wide_box()),
                det("bus", 0.9, BoundingBox::new(0.0, 0.0, 0.1, 0.1)),
                det("bus", 0.9, wide_box()),
            ],
            &cfg,
        );
        assert_eq!(out.qualifying.len(), 1);
        assert_eq!(out.rejected.class, 1);
        assert_eq!(out.rejected.confidence, 1);
        assert_eq!(out.rejected.size, 1);
        assert_eq!(out.rejected.total(), 3);
    }

    #[test]
    fn class_rule_runs_before_confidence() {
        let out = filter(vec![det("truck", 0.1, wide_box())], &config());
        assert_eq!(out.rejected.class, 1);
        assert_eq!(out.rejected.confidence, 0);
    }

    #[test]
    fn zone_uses_box_center() {
        let cfg = PipelineConfig {
            zone: Zone {
                x1: 0.5,
                y1: 0.0,
                x2: 1.0,
                y2: 1.0,
            },
            ..config()
        };
        // Box straddles the zone edge, but its center is left of it.
        let straddling = det("bus", 0.9, BoundingBox::new(0.1, 0.3, 0.8, 0.7));
        let inside = det("bus", 0.9, BoundingBox::new(0.5, 0.3, 0.95, 0.7));
        let out = filter(vec![straddling, inside], &cfg);
        assert_eq!(out.qualifying.len(), 1);
        assert_eq!(out.rejected.zone, 1);
    }

    #[test]
    fn aspect_band_is_enforced() {
        let cfg = PipelineConfig {
            min_aspect_ratio: 1.0,
            max_aspect_ratio: 3.0,
            ..config()
        };
        let tall = det("bus", 0.9, BoundingBox::new(0.4, 0.1, 0.6, 0.9));
        let very_wide = det("bus", 0.9, BoundingBox::new(0.0, 0.45, 1.0, 0.55));
        let out = filter(vec![tall, very_wide, det("bus", 0.9, wide_box())], &cfg);
        assert_eq!(out.qualifying.len(), 1);
        assert_eq!(out.rejected.size, 2);
    }

    #[test]
    fn cap_keeps_top_by_confidence_then_area() {
        let cfg = PipelineConfig {
            max_detections: 2,
            ..config()
        };
        let small = BoundingBox::new(0.3, 0.3, 0.7, 0.6);
        let large = BoundingBox::new(0.1, 0.2, 0.9, 0.8);
        let out = filter(
            vec![
                det("bus", 0.8, wide_box()),
                det("bus", 0.95, small),
                det("bus", 0.95, large),
                det("bus", 0.9, wide_box()),
            ],
            &cfg,
        );
        assert_eq!(out.qualifying.len(), 2);
        assert_eq!(out.qualifying[0].bbox(), &large);
        assert_eq!(out.qualifying[1].bbox(), &small);
        assert_eq!(out.rejected.capped, 2);
        assert_eq!(out.best().map(|d| d.confidence()), Some(0.95));
    }

    #[test]
    fn below_threshold_never_passes() {
        let cfg = config();
        let boxes = [
            wide_box(),
            BoundingBox::new(0.0, 0.0, 1.0, 1.0),
            BoundingBox::new(0.2, 0.2, 0.9, 0.5),
        ];
        for bbox in boxes {
            for class in ["bus", "school_bus"] {
                let out = filter(vec![det(class, 0.69, bbox)], &cfg);
                assert!(out.qualifying.is_empty());
            }
        }
    }
}
