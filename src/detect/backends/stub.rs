use anyhow::Result;

use crate::detect::backend::{DetectionCapability, DetectorBackend};
use crate::detect::result::DetectionBatch;
use crate::frame::Frame;

/// Stub backend for bench runs without a model. Never reports anything.
pub struct StubBackend {
    frames_seen: u64,
}

impl StubBackend {
    pub fn new() -> Self {
        Self { frames_seen: 0 }
    }

    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn supports(&self, capability: DetectionCapability) -> bool {
        matches!(capability, DetectionCapability::Objects)
    }

    fn detect(&mut self, _frame: &Frame) -> Result<DetectionBatch> {
        self.frames_seen += 1;
        Ok(DetectionBatch::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_backend_reports_nothing() {
        let mut backend = StubBackend::new();
        let frame = Frame::blank(640, 480, 1, 0);
        let batch = backend.detect(&frame).unwrap();
        assert!(batch.is_empty());
        assert_eq!(backend.frames_seen(), 1);
        assert!(!backend.supports(DetectionCapability::HandLandmarks));
    }
}
