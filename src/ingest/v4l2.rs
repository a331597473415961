//! V4L2 camera source (USB webcams and CSI bridges exposing /dev/videoN).
//!
//! Frames are requested as packed RGB24. A stream that stops delivering is
//! reported as `Timeout`; any other device error as `Disconnected`, after
//! which the coordinator backs off and calls `reconnect`.

use std::io::ErrorKind;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use ouroboros::self_referencing;

use crate::frame::{CaptureError, Frame, FrameSource, SourceStats};

#[derive(Clone, Debug)]
pub struct V4l2Config {
    /// Device path (e.g., "/dev/video0")
    pub device: String,
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
}

pub struct V4l2Source {
    config: V4l2Config,
    state: Option<DeviceState>,
    frames_captured: u64,
    capture_errors: u64,
    last_frame_at: Option<Instant>,
    last_error: Option<String>,
    active_width: u32,
    active_height: u32,
}

#[self_referencing]
struct DeviceState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2Source {
    pub fn new(config: V4l2Config) -> Self {
        Self {
            active_width: config.width,
            active_height: config.height,
            config,
            state: None,
            frames_captured: 0,
            capture_errors: 0,
            last_frame_at: None,
            last_error: None,
        }
    }

    fn health_grace(&self) -> Duration {
        let base_ms = if self.config.target_fps == 0 {
            2_000
        } else {
            (1000 / self.config.target_fps).saturating_mul(6)
        };
        Duration::from_millis(base_ms.max(2_000) as u64)
    }

    fn fail(&mut self, err: CaptureError) -> CaptureError {
        self.capture_errors += 1;
        if let CaptureError::Disconnected(reason) = &err {
            self.last_error = Some(reason.clone());
            self.state = None;
        }
        err
    }
}

impl FrameSource for V4l2Source {
    fn name(&self) -> &str {
        &self.config.device
    }

    fn connect(&mut self) -> Result<()> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        self.state = None;
        let mut device = v4l::Device::with_path(&self.config.device)
            .with_context(|| format!("open v4l2 device {}", self.config.device))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = self.config.width;
        format.height = self.config.height;
        format.fourcc = v4l::FourCC::new(b"RGB3");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!("v4l2 {}: failed to set format: {}", self.config.device, err);
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };

        if self.config.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(self.config.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!("v4l2 {}: failed to set fps: {}", self.config.device, err);
            }
        }

        self.active_width = format.width;
        self.active_height = format.height;

        let state = DeviceStateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()
        .map_err(|err| {
            self.last_error = Some(err.to_string());
            err
        })?;
        self.state = Some(state);
        self.last_error = None;

        log::info!(
            "v4l2 {}: connected ({}x{})",
            self.config.device,
            self.active_width,
            self.active_height
        );
        Ok(())
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<Frame, CaptureError> {
        use v4l::io::traits::CaptureStream;

        let Some(state) = self.state.as_mut() else {
            return Err(self.fail(CaptureError::Disconnected("not connected".to_string())));
        };
        let captured = state.with_mut(|fields| {
            fields.stream.set_timeout(timeout);
            fields.stream.next().map(|(buf, _meta)| buf.to_vec())
        });
        let data = match captured {
            Ok(data) => data,
            Err(err) if matches!(err.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                return Err(self.fail(CaptureError::Timeout(timeout)));
            }
            Err(err) => {
                return Err(self.fail(CaptureError::Disconnected(err.to_string())));
            }
        };

        let captured_at = Instant::now();
        self.frames_captured += 1;
        self.last_frame_at = Some(captured_at);
        Ok(Frame::new(
            data,
            self.active_width,
            self.active_height,
            captured_at,
            self.frames_captured,
        ))
    }

    fn is_healthy(&self) -> bool {
        if self.last_error.is_some() || self.state.is_none() {
            return false;
        }
        let Some(last_frame_at) = self.last_frame_at else {
            return true;
        };
        last_frame_at.elapsed() <= self.health_grace()
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frames_captured,
            capture_errors: self.capture_errors,
            name: self.config.device.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconnected_source_reports_disconnected() {
        let mut source = V4l2Source::new(V4l2Config {
            device: "/dev/video-missing".to_string(),
            target_fps: 10,
            width: 640,
            height: 480,
        });
        assert!(!source.is_healthy());
        assert!(matches!(
            source.next_frame(Duration::from_millis(10)),
            Err(CaptureError::Disconnected(_))
        ));
        assert!(source.connect().is_err());
        assert_eq!(source.stats().capture_errors, 1);
    }
}
