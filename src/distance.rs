//! Monocular distance estimation.
//!
//! Pinhole model: an object of known real width `W` that spans `p` pixels in
//! a camera with focal length `f` (pixels) is `W * f / p` meters away. Hands
//! use the horizontal spread of their 21 landmarks against a calibrated hand
//! span. Estimation is a pure function of the current frame; smoothing happens
//! in the tracker.

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::fmt;

use crate::detect::{Detection, HandLandmarkSet};

#[derive(Clone, Debug)]
pub struct EstimatorConfig {
    pub focal_length_px: f32,
    /// Real width used for classes without an entry in `object_widths_m`.
    pub default_object_width_m: f32,
    pub object_widths_m: HashMap<String, f32>,
    /// Boxes narrower than this are too far or too occluded to range.
    pub min_bbox_width_px: f32,
    /// Calibrated palm width for landmark ranging.
    pub hand_span_m: f32,
    pub min_landmark_confidence: f32,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            focal_length_px: 800.0,
            default_object_width_m: 0.5,
            object_widths_m: HashMap::new(),
            min_bbox_width_px: 4.0,
            hand_span_m: 0.085,
            min_landmark_confidence: 0.5,
        }
    }
}

impl EstimatorConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.focal_length_px.is_finite() && self.focal_length_px > 0.0) {
            return Err(anyhow!("focal_length_px must be a positive number"));
        }
        if !(self.default_object_width_m.is_finite() && self.default_object_width_m > 0.0) {
            return Err(anyhow!("known_object_width_m must be a positive number"));
        }
        for (class, width) in &self.object_widths_m {
            if !(width.is_finite() && *width > 0.0) {
                return Err(anyhow!("object width for class '{}' must be positive", class));
            }
        }
        if !(self.min_bbox_width_px.is_finite() && self.min_bbox_width_px >= 0.0) {
            return Err(anyhow!("min_bbox_width_px must be zero or positive"));
        }
        if !(self.hand_span_m.is_finite() && self.hand_span_m > 0.0) {
            return Err(anyhow!("hand_span_m must be a positive number"));
        }
        if !(0.0..=1.0).contains(&self.min_landmark_confidence) {
            return Err(anyhow!("min_landmark_confidence must be within 0..=1"));
        }
        Ok(())
    }
}

/// Why a detection could not be ranged.
#[derive(Clone, Debug, PartialEq)]
pub enum GeometryShortfall {
    NonPositiveWidth { width_px: f32 },
    BelowMinimumWidth { width_px: f32, minimum_px: f32 },
    LowLandmarkConfidence { confidence: f32, minimum: f32 },
}

/// The detection's geometry is not trustworthy enough to range.
///
/// Recovered locally: the detection is skipped for this frame and the tracker
/// sees a miss.
#[derive(Clone, Debug, PartialEq)]
pub struct InsufficientGeometry {
    pub class_label: String,
    pub shortfall: GeometryShortfall,
}

impl fmt::Display for InsufficientGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.shortfall {
            GeometryShortfall::NonPositiveWidth { width_px } => write!(
                f,
                "INSUFFICIENT_GEOMETRY: {} box width {:.1}px is not positive",
                self.class_label, width_px
            ),
            GeometryShortfall::BelowMinimumWidth {
                width_px,
                minimum_px,
            } => write!(
                f,
                "INSUFFICIENT_GEOMETRY: {} box width {:.1}px below minimum {:.1}px",
                self.class_label, width_px, minimum_px
            ),
            GeometryShortfall::LowLandmarkConfidence {
                confidence,
                minimum,
            } => write!(
                f,
                "INSUFFICIENT_GEOMETRY: {} landmark confidence {:.2} below {:.2}",
                self.class_label, confidence, minimum
            ),
        }
    }
}

impl std::error::Error for InsufficientGeometry {}

/// Range to one detection in one frame.
#[derive(Clone, Debug, PartialEq)]
pub struct DistanceEstimate {
    /// The detection this estimate was derived from.
    pub source: Detection,
    pub distance_m: f32,
    pub confidence: f32,
    pub frame_timestamp_ms: u64,
}

/// `known_width_m * focal_length_px / pixel_width`.
pub fn pinhole_distance(known_width_m: f32, focal_length_px: f32, pixel_width: f32) -> f32 {
    known_width_m * focal_length_px / pixel_width
}

/// Focal length from one capture of a known-width object at a known distance.
pub fn calibrate_focal_length(
    pixel_width: f32,
    real_width_m: f32,
    known_distance_m: f32,
) -> Result<f32> {
    if !(pixel_width.is_finite() && pixel_width > 0.0) {
        return Err(anyhow!(
            "measured pixel width must be positive; is the object in view?"
        ));
    }
    if !(real_width_m.is_finite() && real_width_m > 0.0) {
        return Err(anyhow!("real width must be a positive number"));
    }
    if !(known_distance_m.is_finite() && known_distance_m > 0.0) {
        return Err(anyhow!("known distance must be a positive number"));
    }
    Ok(pixel_width * known_distance_m / real_width_m)
}

pub struct DistanceEstimator {
    config: EstimatorConfig,
}

impl DistanceEstimator {
    pub fn new(config: EstimatorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    /// Real width assumed for a class label.
    pub fn known_width_for(&self, class_label: &str) -> f32 {
        self.config
            .object_widths_m
            .get(class_label)
            .copied()
            .unwrap_or(self.config.default_object_width_m)
    }

    /// Range a detection with explicit calibration values.
    pub fn estimate(
        &self,
        detection: &Detection,
        known_object_width_m: f32,
        camera_focal_length_px: f32,
    ) -> std::result::Result<DistanceEstimate, InsufficientGeometry> {
        let width_px = detection.bbox.width();
        self.check_width(&detection.class_label, width_px)?;
        Ok(DistanceEstimate {
            source: detection.clone(),
            distance_m: pinhole_distance(known_object_width_m, camera_focal_length_px, width_px),
            confidence: detection.confidence,
            frame_timestamp_ms: detection.frame_timestamp_ms,
        })
    }

    /// Range a detection using the configured width for its class.
    pub fn estimate_detection(
        &self,
        detection: &Detection,
    ) -> std::result::Result<DistanceEstimate, InsufficientGeometry> {
        let known_width = self.known_width_for(&detection.class_label);
        self.estimate(detection, known_width, self.config.focal_length_px)
    }

    /// Range a hand from the pixel spread of its landmarks.
    pub fn estimate_hand(
        &self,
        hand: &HandLandmarkSet,
    ) -> std::result::Result<DistanceEstimate, InsufficientGeometry> {
        let detection = hand.to_detection();
        if hand.confidence < self.config.min_landmark_confidence {
            return Err(InsufficientGeometry {
                class_label: detection.class_label,
                shortfall: GeometryShortfall::LowLandmarkConfidence {
                    confidence: hand.confidence,
                    minimum: self.config.min_landmark_confidence,
                },
            });
        }
        let span_px = hand.pixel_span();
        self.check_width(&detection.class_label, span_px)?;
        Ok(DistanceEstimate {
            distance_m: pinhole_distance(
                self.config.hand_span_m,
                self.config.focal_length_px,
                span_px,
            ),
            confidence: hand.confidence,
            frame_timestamp_ms: hand.frame_timestamp_ms,
            source: detection,
        })
    }

    fn check_width(
        &self,
        class_label: &str,
        width_px: f32,
    ) -> std::result::Result<(), InsufficientGeometry> {
        if !(width_px > 0.0) {
            return Err(InsufficientGeometry {
                class_label: class_label.to_string(),
                shortfall: GeometryShortfall::NonPositiveWidth { width_px },
            });
        }
        if width_px < self.config.min_bbox_width_px {
            return Err(InsufficientGeometry {
                class_label: class_label.to_string(),
                shortfall: GeometryShortfall::BelowMinimumWidth {
                    width_px,
                    minimum_px: self.config.min_bbox_width_px,
                },
            });
        }
        Ok(())
    }
}
