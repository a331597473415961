//! Captured frames and the frame source contract.
//!
//! - `Frame`: one captured image buffer plus its monotonic capture instant.
//! - `FrameSource`: anything that hands out frames on demand (camera, replay, stub).
//! - `CaptureError`: the two ways a capture can fail without yielding a frame.
//!
//! Sources are driven from the coordinator's capture loop only, so they take
//! `&mut self` and do not need interior locking.

use std::time::{Duration, Instant};

use thiserror::Error;

/// One captured image.
///
/// Pixel data is packed RGB24 unless the source documents otherwise. The buffer is
/// only borrowed by the detector; nothing downstream of the detector sees it.
pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Monotonic capture instant. Debounce and cooldown math runs on this clock.
    pub captured_at: Instant,
    /// Per-source frame counter, starting at 1.
    pub sequence: u64,
}

impl Frame {
    pub fn new(
        data: Vec<u8>,
        width: u32,
        height: u32,
        captured_at: Instant,
        sequence: u64,
    ) -> Self {
        Self {
            data,
            width,
            height,
            captured_at,
            sequence,
        }
    }

    /// Frame with no pixel payload. Replay and scripted pipelines use these when the
    /// detector never looks at pixels.
    pub fn empty(width: u32, height: u32, captured_at: Instant, sequence: u64) -> Self {
        Self::new(Vec::new(), width, height, captured_at, sequence)
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("sequence", &self.sequence)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Why a capture attempt produced no frame.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CaptureError {
    /// No frame arrived within the requested timeout. The stream may recover by itself.
    #[error("no frame within {0:?}")]
    Timeout(Duration),
    /// The source is gone (device unplugged, stream ended). Needs `reconnect()`.
    #[error("frame source disconnected: {0}")]
    Disconnected(String),
}

/// Counters reported by every source.
#[derive(Clone, Debug, Default)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub capture_errors: u64,
    pub name: String,
}

/// Frame producer.
///
/// `next_frame` may block up to `timeout`; it must never block indefinitely.
pub trait FrameSource: Send {
    /// Source identifier used in logs.
    fn name(&self) -> &str;

    /// Open the underlying device or stream.
    fn connect(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Re-open after a `Disconnected` error. Defaults to `connect`.
    fn reconnect(&mut self) -> anyhow::Result<()> {
        self.connect()
    }

    /// Capture the next frame, waiting at most `timeout`.
    fn next_frame(&mut self, timeout: Duration) -> Result<Frame, CaptureError>;

    fn is_healthy(&self) -> bool;

    fn stats(&self) -> SourceStats;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn connect(&mut self) -> anyhow::Result<()> {
        (**self).connect()
    }

    fn reconnect(&mut self) -> anyhow::Result<()> {
        (**self).reconnect()
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<Frame, CaptureError> {
        (**self).next_frame(timeout)
    }

    fn is_healthy(&self) -> bool {
        (**self).is_healthy()
    }

    fn stats(&self) -> SourceStats {
        (**self).stats()
    }
}
