use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::detect::backend::{Detector, InferenceError};
use crate::detect::labels::COCO_BUS;
use crate::detect::result::{BoundingBox, CoordinateSpace, RawDetection};
use crate::frame::Frame;

/// Frames per simulated bus visit cycle (about a minute at 10 fps).
const DEFAULT_PERIOD_FRAMES: u64 = 600;
/// Frames the bus stays in view during a visit.
const DEFAULT_DWELL_FRAMES: u64 = 120;

/// Stub backend for dry runs on `stub://` sources.
///
/// Every `period` frames a bus drives into the frame, stops for a while and
/// leaves again; a parked car sits in the corner the whole time. Confidence
/// jitter comes from a seeded RNG, so two runs see the same sequence.
pub struct StubBackend {
    period: u64,
    dwell: u64,
    rng: StdRng,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::with_schedule(DEFAULT_PERIOD_FRAMES, DEFAULT_DWELL_FRAMES)
    }

    pub fn with_schedule(period: u64, dwell: u64) -> Self {
        let period = period.max(1);
        Self {
            period,
            dwell: dwell.min(period),
            rng: StdRng::seed_from_u64(0x5c4b_0b05),
        }
    }

    fn bus_for(&mut self, sequence: u64) -> Option<RawDetection> {
        let phase = sequence % self.period;
        if phase >= self.dwell {
            return None;
        }
        // First third: drive in from the right edge. Then park at the stop.
        let progress = (phase as f32 / (self.dwell as f32 / 3.0)).min(1.0);
        let cx = 0.85 - 0.35 * progress;
        let confidence = 0.72 + 0.2 * progress + self.rng.gen_range(-0.03..0.03);
        Some(RawDetection {
            class_id: COCO_BUS,
            confidence: confidence.clamp(0.0, 1.0),
            bbox: BoundingBox::from_center(cx, 0.55, 0.45, 0.3),
            space: CoordinateSpace::Normalized,
        })
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Detector for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn infer(
        &mut self,
        frame: &Frame,
        _timeout: Duration,
    ) -> Result<Vec<RawDetection>, InferenceError> {
        let parked_car = RawDetection {
            class_id: 2,
            confidence: 0.81,
            bbox: BoundingBox::new(0.02, 0.7, 0.18, 0.85),
            space: CoordinateSpace::Normalized,
        };
        let mut out = vec![parked_car];
        out.extend(self.bus_for(frame.sequence));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn bus_appears_only_inside_dwell_window() {
        let mut backend = StubBackend::with_schedule(10, 3);
        let now = Instant::now();
        let mut bus_frames = Vec::new();
        for seq in 0..20 {
            let frame = Frame::empty(64, 48, now, seq);
            let dets = backend.infer(&frame, Duration::from_secs(1)).unwrap();
            if dets.iter().any(|d| d.class_id == COCO_BUS) {
                bus_frames.push(seq);
            }
        }
        assert_eq!(bus_frames, vec![0, 1, 2, 10, 11, 12]);
    }

    #[test]
    fn bus_boxes_are_valid() {
        let mut backend = StubBackend::with_schedule(30, 30);
        let now = Instant::now();
        for seq in 0..30 {
            let frame = Frame::empty(64, 48, now, seq);
            for det in backend.infer(&frame, Duration::from_secs(1)).unwrap() {
                assert!(det.bbox.check().is_ok());
                assert!((0.0..=1.0).contains(&det.confidence));
            }
        }
    }
}
