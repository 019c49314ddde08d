//! Detector adapter.
//!
//! Turns whatever a backend reports into `Detection` / `HandLandmarkSet`
//! records stamped with the frame timestamp. Low-confidence objects are
//! dropped here as ordinary "nothing seen" results. Degenerate boxes are kept
//! so the distance estimator can reject them explicitly.

use anyhow::Result;

use crate::detect::backend::DetectionCapability;
use crate::detect::registry::BackendRegistry;
use crate::detect::result::{
    BoundingBox, Detection, DetectionBatch, FrameObservations, HandLandmarkSet, Landmark,
};
use crate::frame::Frame;

#[derive(Clone, Debug)]
pub struct AdapterConfig {
    /// Objects below this confidence are discarded.
    pub min_confidence: f32,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.25,
        }
    }
}

pub struct DetectorAdapter {
    registry: BackendRegistry,
    config: AdapterConfig,
}

impl DetectorAdapter {
    pub fn new(registry: BackendRegistry, config: AdapterConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    /// True once the active backend is a finished recording.
    pub fn is_exhausted(&self) -> bool {
        self.registry.default_exhausted()
    }

    /// Run the registered backends on one frame.
    pub fn detect(&mut self, frame: &Frame) -> Result<FrameObservations> {
        let (object_backend, mut batch) = self
            .registry
            .detect_with_capability(DetectionCapability::Objects, frame)?;

        if let Some(hand_backend) = self
            .registry
            .backend_for_capability(DetectionCapability::HandLandmarks)
        {
            if hand_backend != object_backend {
                let (_, hands) = self
                    .registry
                    .detect_with_capability(DetectionCapability::HandLandmarks, frame)?;
                batch.hands.extend(hands.hands);
            }
        }

        Ok(normalize_batch(&self.config, batch, frame))
    }
}

/// Normalize a raw backend batch against the frame it came from.
pub fn normalize_batch(
    config: &AdapterConfig,
    batch: DetectionBatch,
    frame: &Frame,
) -> FrameObservations {
    let mut detections = Vec::with_capacity(batch.detections.len());
    for raw in batch.detections {
        if !raw.confidence.is_finite() || raw.bbox.iter().any(|v| !v.is_finite()) {
            log::debug!("dropping non-finite detection of class {}", raw.class_label);
            continue;
        }
        let confidence = raw.confidence.clamp(0.0, 1.0);
        if confidence < config.min_confidence {
            continue;
        }
        let [x0, y0, x1, y1] = raw.bbox;
        let bbox = if raw.normalized {
            let (w, h) = (frame.width as f32, frame.height as f32);
            BoundingBox::new(x0 * w, y0 * h, x1 * w, y1 * h)
        } else {
            BoundingBox::new(x0, y0, x1, y1)
        };
        detections.push(Detection {
            class_label: raw.class_label.trim().to_lowercase(),
            confidence,
            bbox: bbox.clamp_to(frame.width, frame.height),
            frame_timestamp_ms: frame.timestamp_ms,
        });
    }

    let mut hands = Vec::with_capacity(batch.hands.len());
    for raw in batch.hands {
        let landmarks = raw
            .landmarks
            .iter()
            .map(|&[x, y, z]| Landmark { x, y, z })
            .collect();
        let confidence = if raw.confidence.is_finite() {
            raw.confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        match HandLandmarkSet::new(
            landmarks,
            confidence,
            frame.width,
            frame.height,
            frame.timestamp_ms,
        ) {
            Ok(hand) => hands.push(hand),
            Err(e) => log::warn!("dropping malformed hand landmarks: {}", e),
        }
    }

    FrameObservations {
        frame_timestamp_ms: frame.timestamp_ms,
        detections,
        hands,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::backends::ReplayBackend;
    use crate::detect::result::{RawDetection, RawHand};

    fn raw(class: &str, confidence: f32, bbox: [f32; 4], normalized: bool) -> RawDetection {
        RawDetection {
            class_label: class.to_string(),
            confidence,
            bbox,
            normalized,
        }
    }

    #[test]
    fn filters_low_confidence_and_stamps_timestamp() {
        let frame = Frame::blank(640, 480, 3, 1234);
        let batch = DetectionBatch {
            detections: vec![
                raw("Hotspot", 0.9, [100.0, 100.0, 200.0, 200.0], false),
                raw("hotspot", 0.1, [0.0, 0.0, 10.0, 10.0], false),
                raw("person", f32::NAN, [0.0, 0.0, 10.0, 10.0], false),
            ],
            hands: vec![],
        };
        let obs = normalize_batch(&AdapterConfig::default(), batch, &frame);
        assert_eq!(obs.frame_timestamp_ms, 1234);
        assert_eq!(obs.detections.len(), 1);
        assert_eq!(obs.detections[0].class_label, "hotspot");
        assert_eq!(obs.detections[0].frame_timestamp_ms, 1234);
    }

    #[test]
    fn scales_normalized_boxes_and_clamps() {
        let frame = Frame::blank(640, 480, 1, 0);
        let batch = DetectionBatch {
            detections: vec![raw("tree", 0.8, [0.5, 0.5, 1.2, 0.75], true)],
            hands: vec![],
        };
        let obs = normalize_batch(&AdapterConfig::default(), batch, &frame);
        let bbox = obs.detections[0].bbox;
        assert_eq!(bbox, BoundingBox::new(320.0, 240.0, 640.0, 360.0));
    }

    #[test]
    fn keeps_degenerate_boxes_for_the_estimator() {
        let frame = Frame::blank(640, 480, 1, 0);
        let batch = DetectionBatch {
            detections: vec![raw("hotspot", 0.8, [200.0, 10.0, 200.0, 40.0], false)],
            hands: vec![],
        };
        let obs = normalize_batch(&AdapterConfig::default(), batch, &frame);
        assert_eq!(obs.detections.len(), 1);
        assert_eq!(obs.detections[0].bbox.width(), 0.0);
    }

    #[test]
    fn drops_malformed_hands() {
        let frame = Frame::blank(640, 480, 1, 0);
        let batch = DetectionBatch {
            detections: vec![],
            hands: vec![
                RawHand {
                    landmarks: vec![[0.4, 0.4, 0.0]; 21],
                    confidence: 0.9,
                },
                RawHand {
                    landmarks: vec![[0.4, 0.4, 0.0]; 5],
                    confidence: 0.9,
                },
            ],
        };
        let obs = normalize_batch(&AdapterConfig::default(), batch, &frame);
        assert_eq!(obs.hands.len(), 1);
    }

    #[test]
    fn adapter_runs_registered_backend() {
        let mut registry = BackendRegistry::new();
        registry.register(ReplayBackend::from_batches(vec![DetectionBatch {
            detections: vec![raw("hotspot", 0.9, [10.0, 10.0, 60.0, 60.0], false)],
            hands: vec![],
        }]));
        let mut adapter = DetectorAdapter::new(registry, AdapterConfig::default());
        let obs = adapter.detect(&Frame::blank(640, 480, 1, 50)).unwrap();
        assert_eq!(obs.detections.len(), 1);
        assert!(adapter.is_exhausted());
    }
}
