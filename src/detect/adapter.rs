use std::time::{Duration, Instant};

use crate::detect::backend::{Detector, InferenceError};
use crate::detect::labels::ClassLabels;
use crate::detect::result::{CoordinateSpace, Detection, RawDetection};
use crate::frame::Frame;

/// Output of one adapted inference call.
#[derive(Clone, Debug, Default)]
pub struct Inference {
    /// Validated detections in normalized coordinates.
    pub detections: Vec<Detection>,
    /// Raw candidates the backend returned, valid or not.
    pub raw_count: usize,
    /// Candidates dropped because they broke the `Detection` invariants.
    pub malformed: u64,
    pub latency: Duration,
}

/// Wraps a backend: enforces the time budget, normalizes coordinates, names
/// classes and validates every candidate.
pub struct DetectorAdapter<D> {
    backend: D,
    labels: ClassLabels,
}

impl<D: Detector> DetectorAdapter<D> {
    pub fn new(backend: D, labels: ClassLabels) -> Self {
        Self { backend, labels }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn warm_up(&mut self) -> anyhow::Result<()> {
        self.backend.warm_up()
    }

    /// Run the backend on `frame`.
    ///
    /// A call that returns after `timeout` is reported as `Timeout` and its boxes
    /// are thrown away, so a late result never leaks into a later cycle.
    pub fn detect(
        &mut self,
        frame: &Frame,
        timeout: Duration,
    ) -> Result<Inference, InferenceError> {
        let started = Instant::now();
        let raw = self.backend.infer(frame, timeout)?;
        let latency = started.elapsed();
        if latency > timeout {
            return Err(InferenceError::Timeout {
                elapsed: latency,
                limit: timeout,
            });
        }

        let raw_count = raw.len();
        let mut malformed = 0u64;
        let mut detections = Vec::with_capacity(raw_count);
        for candidate in raw {
            match self.adapt(candidate, frame) {
                Ok(det) => detections.push(det),
                Err(reason) => {
                    malformed += 1;
                    log::debug!(
                        "dropping malformed detection from {}: {}",
                        self.backend.name(),
                        reason
                    );
                }
            }
        }

        Ok(Inference {
            detections,
            raw_count,
            malformed,
            latency,
        })
    }

    fn adapt(
        &self,
        raw: RawDetection,
        frame: &Frame,
    ) -> Result<Detection, crate::detect::result::MalformedDetection> {
        // Validate before normalizing; clamping could hide an out-of-frame box's shape.
        raw.bbox.check()?;
        let bbox = match raw.space {
            CoordinateSpace::Pixels { width, height } => raw.bbox.normalized(width, height),
            CoordinateSpace::Normalized => raw.bbox,
        };
        Detection::new(
            raw.class_id,
            self.labels.name(raw.class_id),
            raw.confidence,
            bbox,
            frame.captured_at,
        )
    }
}
