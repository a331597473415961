use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::frame::{CaptureError, Frame, FrameSource, SourceStats};

enum Outcome {
    Frame,
    Error(CaptureError),
}

struct Entry {
    offset: Duration,
    outcome: Outcome,
}

/// Scripted frame source.
///
/// Every entry is a capture outcome at `base + offset`. Frames carry that
/// instant as their capture time, so a replay is reproducible no matter how
/// fast it is consumed. With pacing on, `next_frame` also waits for the
/// offset to arrive in real time.
pub struct ReplaySource {
    name: String,
    width: u32,
    height: u32,
    base: Instant,
    paced: bool,
    entries: VecDeque<Entry>,
    sequence: u64,
    frames_captured: u64,
    capture_errors: u64,
}

impl ReplaySource {
    pub fn new(name: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            name: name.into(),
            width,
            height,
            base: Instant::now(),
            paced: false,
            entries: VecDeque::new(),
            sequence: 0,
            frames_captured: 0,
            capture_errors: 0,
        }
    }

    pub fn with_base(mut self, base: Instant) -> Self {
        self.base = base;
        self
    }

    pub fn paced(mut self) -> Self {
        self.paced = true;
        self
    }

    pub fn frame_at(mut self, offset: Duration) -> Self {
        self.entries.push_back(Entry {
            offset,
            outcome: Outcome::Frame,
        });
        self
    }

    /// Frames every `step` for `count` frames, starting at `start`.
    pub fn frames_every(mut self, start: Duration, step: Duration, count: u32) -> Self {
        for i in 0..count {
            self = self.frame_at(start + step * i);
        }
        self
    }

    pub fn error_at(mut self, offset: Duration, error: CaptureError) -> Self {
        self.entries.push_back(Entry {
            offset,
            outcome: Outcome::Error(error),
        });
        self
    }

    pub fn base(&self) -> Instant {
        self.base
    }

    pub fn remaining(&self) -> usize {
        self.entries.len()
    }

    pub fn is_exhausted(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FrameSource for ReplaySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<Frame, CaptureError> {
        let Some(entry) = self.entries.pop_front() else {
            self.capture_errors += 1;
            return Err(CaptureError::Disconnected("replay exhausted".to_string()));
        };
        let at = self.base + entry.offset;
        if self.paced {
            let wait = at.saturating_duration_since(Instant::now());
            if wait > timeout {
                std::thread::sleep(timeout);
                self.entries.push_front(entry);
                self.capture_errors += 1;
                return Err(CaptureError::Timeout(timeout));
            }
            std::thread::sleep(wait);
        }
        match entry.outcome {
            Outcome::Frame => {
                self.sequence += 1;
                self.frames_captured += 1;
                Ok(Frame::empty(self.width, self.height, at, self.sequence))
            }
            Outcome::Error(err) => {
                self.capture_errors += 1;
                Err(err)
            }
        }
    }

    fn is_healthy(&self) -> bool {
        !self.entries.is_empty()
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frames_captured,
            capture_errors: self.capture_errors,
            name: self.name.clone(),
        }
    }
}
