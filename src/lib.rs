//! School bus watcher.
//!
//! Watches a camera for school buses and turns sightings into Home Assistant
//! automation: lights, switches, announcements and notifications switched on
//! for a hold period, then off again.
//!
//! # Pipeline
//!
//! ```text
//! FrameSource -> DetectorAdapter -> filter -> Debouncer -> Dispatcher
//!                                                 \-> TelemetryPublisher
//! ```
//!
//! # Module Structure
//!
//! - `frame`, `ingest`: frame sources (synthetic, replay, V4L2)
//! - `detect`: detector backends, coordinate normalization, validated `Detection`
//! - `filter`, `debounce`: qualifying detections and debounced events
//! - `automation`: device commands and the activation state machine
//! - `transport`, `telemetry`, `control`: MQTT in and out
//! - `config`: typed, validated, reloadable configuration
//! - `pipeline`: the coordinator that ties it together

pub mod automation;
pub mod config;
pub mod control;
pub mod debounce;
pub mod detect;
pub mod filter;
pub mod frame;
pub mod ingest;
pub mod pipeline;
pub mod telemetry;
pub mod transport;

pub use config::{AppConfig, ConfigHandle, PipelineConfig};
pub use debounce::{Debouncer, DetectionEvent};
pub use detect::{BoundingBox, Detection, Detector, DetectorAdapter};
pub use frame::{CaptureError, Frame, FrameSource};
pub use pipeline::{Pipeline, ShutdownSignal};
