mod adapter;
mod backend;
pub mod backends;
mod labels;
mod registry;
mod result;
pub mod yolo;

pub use adapter::{DetectorAdapter, Inference};
pub use backend::{Detector, InferenceError};
pub use backends::{ScriptedBackend, StubBackend};
pub use labels::{ClassLabels, COCO_BUS, COCO_CLASSES};
pub use registry::BackendRegistry;
pub use result::{BoundingBox, CoordinateSpace, Detection, MalformedDetection, RawDetection};
