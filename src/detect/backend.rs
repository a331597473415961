use std::time::Duration;

use thiserror::Error;

use crate::detect::result::RawDetection;
use crate::frame::Frame;

/// Why an inference call produced no usable result.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum InferenceError {
    /// The call ran past its budget. Any boxes it produced are discarded.
    #[error("inference exceeded {limit:?} (took {elapsed:?})")]
    Timeout { elapsed: Duration, limit: Duration },
    #[error("inference failed: {0}")]
    Failed(String),
}

impl InferenceError {
    pub fn failed(err: impl std::fmt::Display) -> Self {
        Self::Failed(err.to_string())
    }
}

/// Object detector backend.
///
/// Backends treat the frame as read-only and must not retain it past `infer`.
/// `timeout` is the caller's budget; a backend that cannot be preempted should
/// still return promptly once it notices the budget is spent.
pub trait Detector: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on one frame.
    fn infer(&mut self, frame: &Frame, timeout: Duration)
        -> Result<Vec<RawDetection>, InferenceError>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

impl<D: Detector + ?Sized> Detector for Box<D> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn infer(
        &mut self,
        frame: &Frame,
        timeout: Duration,
    ) -> Result<Vec<RawDetection>, InferenceError> {
        (**self).infer(frame, timeout)
    }

    fn warm_up(&mut self) -> anyhow::Result<()> {
        (**self).warm_up()
    }
}
