use std::collections::VecDeque;
use std::time::Duration;

use crate::detect::backend::{Detector, InferenceError};
use crate::detect::result::RawDetection;
use crate::frame::Frame;

/// Replays pre-recorded inference results, one per call.
///
/// Once the script runs out every call returns an empty detection list.
pub struct ScriptedBackend {
    script: VecDeque<Result<Vec<RawDetection>, InferenceError>>,
    delay: Option<Duration>,
    calls: u64,
}

impl ScriptedBackend {
    pub fn new(script: Vec<Result<Vec<RawDetection>, InferenceError>>) -> Self {
        Self {
            script: script.into(),
            delay: None,
            calls: 0,
        }
    }

    /// Sleep this long inside every call (simulates a slow accelerator).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }

    pub fn remaining(&self) -> usize {
        self.script.len()
    }
}

impl Detector for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn infer(
        &mut self,
        _frame: &Frame,
        _timeout: Duration,
    ) -> Result<Vec<RawDetection>, InferenceError> {
        self.calls += 1;
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        self.script.pop_front().unwrap_or_else(|| Ok(Vec::new()))
    }
}
