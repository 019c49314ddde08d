mod adapter;
mod backend;
mod backends;
mod registry;
mod result;

pub use adapter::{normalize_batch, AdapterConfig, DetectorAdapter};
pub use backend::{DetectionCapability, DetectorBackend};
pub use backends::{ReplayBackend, StubBackend};
pub use registry::BackendRegistry;
pub use result::{
    BoundingBox, Detection, DetectionBatch, FrameObservations, HandLandmarkSet, Landmark,
    RawDetection, RawHand, HAND_CLASS, HAND_LANDMARK_COUNT,
};
