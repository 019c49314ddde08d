use anyhow::Result;

use crate::detect::result::DetectionBatch;
use crate::frame::Frame;

/// Detection capabilities supported by backends.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectionCapability {
    /// Class-labelled bounding boxes (hotspots, obstacles).
    Objects,
    /// 21-point hand landmarks.
    HandLandmarks,
}

/// Detector backend trait.
///
/// Backends wrap an external model. They see the frame for the duration of
/// `detect` only and return what they found in backend coordinates; the
/// adapter is responsible for normalization and filtering.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Returns true when the backend supports a capability.
    fn supports(&self, capability: DetectionCapability) -> bool;

    /// Run detection on a frame.
    ///
    /// An empty batch is the normal "nothing seen" result, not an error.
    fn detect(&mut self, frame: &Frame) -> Result<DetectionBatch>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }

    /// True once a finite source (e.g. a recording) has nothing left to report.
    fn is_exhausted(&self) -> bool {
        false
    }
}
