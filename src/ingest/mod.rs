//! Frame sources.
//!
//! - `stub://<name>`: synthetic frames for dry runs (pairs with the stub detector)
//! - `/dev/videoN`: V4L2 capture (feature: ingest-v4l2)
//! - `ReplaySource`: scripted outcomes for tests and offline replays
//!
//! Sources hand frames to the coordinator only; nothing here stores or forwards pixels.

mod replay;
mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

use anyhow::{bail, Result};

use crate::config::CameraSettings;
use crate::frame::FrameSource;

pub use replay::ReplaySource;
pub use synthetic::SyntheticSource;
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::{V4l2Config, V4l2Source};

/// Build the source named by `camera.url`.
pub fn open_source(camera: &CameraSettings) -> Result<Box<dyn FrameSource>> {
    if camera.url.starts_with("stub://") {
        return Ok(Box::new(SyntheticSource::new(
            camera.url.clone(),
            camera.width,
            camera.height,
            camera.fps,
        )));
    }
    if camera.url.starts_with("/dev/video") {
        return open_v4l2(camera);
    }
    bail!("unsupported camera url '{}'", camera.url)
}

#[cfg(feature = "ingest-v4l2")]
fn open_v4l2(camera: &CameraSettings) -> Result<Box<dyn FrameSource>> {
    Ok(Box::new(V4l2Source::new(V4l2Config {
        device: camera.url.clone(),
        target_fps: camera.fps,
        width: camera.width,
        height: camera.height,
    })))
}

#[cfg(not(feature = "ingest-v4l2"))]
fn open_v4l2(camera: &CameraSettings) -> Result<Box<dyn FrameSource>> {
    bail!(
        "camera '{}' needs V4L2 support; rebuild with --features ingest-v4l2",
        camera.url
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera(url: &str) -> CameraSettings {
        CameraSettings {
            url: url.to_string(),
            ..CameraSettings::default()
        }
    }

    #[test]
    fn stub_urls_open_synthetic_sources() {
        let source = open_source(&camera("stub://driveway")).unwrap();
        assert_eq!(source.name(), "stub://driveway");
    }

    #[test]
    fn unknown_schemes_are_rejected() {
        let err = open_source(&camera("rtsp://cam/stream")).err().unwrap();
        assert!(err.to_string().contains("unsupported camera url"));
    }
}
