use std::time::{Duration, Instant};

use crate::frame::{CaptureError, Frame, FrameSource, SourceStats};

/// Frame generator for `stub://` cameras.
///
/// Produces RGB frames at `fps`. Pixel content is a moving gradient; pair it
/// with the stub detector, which keys off the frame sequence instead.
pub struct SyntheticSource {
    url: String,
    width: u32,
    height: u32,
    interval: Duration,
    next_due: Option<Instant>,
    frames_captured: u64,
}

impl SyntheticSource {
    pub fn new(url: impl Into<String>, width: u32, height: u32, fps: u32) -> Self {
        let interval = if fps == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(1.0 / fps as f64)
        };
        Self {
            url: url.into(),
            width,
            height,
            interval,
            next_due: None,
            frames_captured: 0,
        }
    }

    fn render(&self) -> Vec<u8> {
        let pixel_count = (self.width as usize) * (self.height as usize) * 3;
        let shift = self.frames_captured as usize;
        (0..pixel_count)
            .map(|i| ((i / 3 + shift) % 256) as u8)
            .collect()
    }
}

impl FrameSource for SyntheticSource {
    fn name(&self) -> &str {
        &self.url
    }

    fn connect(&mut self) -> anyhow::Result<()> {
        log::info!(
            "synthetic source {} ready ({}x{})",
            self.url,
            self.width,
            self.height
        );
        self.next_due = None;
        Ok(())
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<Frame, CaptureError> {
        let now = Instant::now();
        if let Some(due) = self.next_due {
            let wait = due.saturating_duration_since(now);
            if wait > timeout {
                std::thread::sleep(timeout);
                return Err(CaptureError::Timeout(timeout));
            }
            std::thread::sleep(wait);
        }
        let captured_at = Instant::now();
        self.next_due = Some(captured_at + self.interval);
        self.frames_captured += 1;
        Ok(Frame::new(
            self.render(),
            self.width,
            self.height,
            captured_at,
            self.frames_captured,
        ))
    }

    fn is_healthy(&self) -> bool {
        true
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frames_captured,
            capture_errors: 0,
            name: self.url.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn produces_rgb_frames_with_increasing_sequence() {
        let mut source = SyntheticSource::new("stub://yard", 8, 4, 0);
        source.connect().unwrap();
        let a = source.next_frame(Duration::from_millis(50)).unwrap();
        let b = source.next_frame(Duration::from_millis(50)).unwrap();
        assert_eq!(a.byte_len(), 8 * 4 * 3);
        assert_eq!((a.sequence, b.sequence), (1, 2));
        assert!(b.captured_at >= a.captured_at);
        assert_eq!(source.stats().frames_captured, 2);
    }

    #[test]
    fn short_timeout_before_next_due_frame_times_out() {
        let mut source = SyntheticSource::new("stub://slow", 2, 2, 1);
        source.next_frame(Duration::from_millis(10)).unwrap();
        let err = source.next_frame(Duration::from_millis(5)).unwrap_err();
        assert_eq!(err, CaptureError::Timeout(Duration::from_millis(5)));
    }
}
