use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Number of landmarks a hand-landmark detector reports per hand.
pub const HAND_LANDMARK_COUNT: usize = 21;

/// Class label given to hands when they join the obstacle stream.
pub const HAND_CLASS: &str = "hand";

/// Axis-aligned bounding box in pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x_min: f32,
    pub y_min: f32,
    pub x_max: f32,
    pub y_max: f32,
}

impl BoundingBox {
    pub fn new(x_min: f32, y_min: f32, x_max: f32, y_max: f32) -> Self {
        Self {
            x_min,
            y_min,
            x_max,
            y_max,
        }
    }

    pub fn width(&self) -> f32 {
        self.x_max - self.x_min
    }

    pub fn height(&self) -> f32 {
        self.y_max - self.y_min
    }

    pub fn center(&self) -> (f32, f32) {
        (
            (self.x_min + self.x_max) * 0.5,
            (self.y_min + self.y_max) * 0.5,
        )
    }

    /// Euclidean distance between box centers, in pixels.
    pub fn center_distance(&self, other: &BoundingBox) -> f32 {
        let (ax, ay) = self.center();
        let (bx, by) = other.center();
        ((ax - bx).powi(2) + (ay - by).powi(2)).sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.x_min.is_finite()
            && self.y_min.is_finite()
            && self.x_max.is_finite()
            && self.y_max.is_finite()
    }

    pub fn clamp_to(&self, width: u32, height: u32) -> Self {
        let w = width as f32;
        let h = height as f32;
        Self {
            x_min: self.x_min.clamp(0.0, w),
            y_min: self.y_min.clamp(0.0, h),
            x_max: self.x_max.clamp(0.0, w),
            y_max: self.y_max.clamp(0.0, h),
        }
    }

    /// Exponential moving average toward `observed` with weight `alpha`.
    pub fn blend(&self, observed: &BoundingBox, alpha: f32) -> Self {
        let mix = |prev: f32, new: f32| alpha * new + (1.0 - alpha) * prev;
        Self {
            x_min: mix(self.x_min, observed.x_min),
            y_min: mix(self.y_min, observed.y_min),
            x_max: mix(self.x_max, observed.x_max),
            y_max: mix(self.y_max, observed.y_max),
        }
    }
}

/// Normalized detector output for one object in one frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_label: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
    pub frame_timestamp_ms: u64,
}

impl Detection {
    pub fn is_hand(&self) -> bool {
        self.class_label == HAND_CLASS
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Landmark {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// 21 normalized hand landmarks from one frame.
///
/// `x`/`y` are normalized to the frame size recorded alongside them; `z` is
/// relative depth and is not used for ranging.
#[derive(Clone, Debug, PartialEq)]
pub struct HandLandmarkSet {
    landmarks: Vec<Landmark>,
    pub confidence: f32,
    pub frame_width: u32,
    pub frame_height: u32,
    pub frame_timestamp_ms: u64,
}

impl HandLandmarkSet {
    pub fn new(
        landmarks: Vec<Landmark>,
        confidence: f32,
        frame_width: u32,
        frame_height: u32,
        frame_timestamp_ms: u64,
    ) -> Result<Self> {
        if landmarks.len() != HAND_LANDMARK_COUNT {
            return Err(anyhow!(
                "hand landmark set must contain {} points, got {}",
                HAND_LANDMARK_COUNT,
                landmarks.len()
            ));
        }
        if frame_width == 0 || frame_height == 0 {
            return Err(anyhow!("hand landmark frame size must be non-zero"));
        }
        if landmarks
            .iter()
            .any(|p| !p.x.is_finite() || !p.y.is_finite() || !p.z.is_finite())
        {
            return Err(anyhow!("hand landmark contains a non-finite coordinate"));
        }
        Ok(Self {
            landmarks,
            confidence,
            frame_width,
            frame_height,
            frame_timestamp_ms,
        })
    }

    pub fn landmarks(&self) -> &[Landmark] {
        &self.landmarks
    }

    /// Tight pixel box around all landmarks.
    pub fn pixel_bbox(&self) -> BoundingBox {
        let w = self.frame_width as f32;
        let h = self.frame_height as f32;
        let mut bbox = BoundingBox::new(f32::MAX, f32::MAX, f32::MIN, f32::MIN);
        for point in &self.landmarks {
            let (px, py) = (point.x * w, point.y * h);
            bbox.x_min = bbox.x_min.min(px);
            bbox.y_min = bbox.y_min.min(py);
            bbox.x_max = bbox.x_max.max(px);
            bbox.y_max = bbox.y_max.max(py);
        }
        bbox
    }

    /// Horizontal landmark spread in pixels.
    pub fn pixel_span(&self) -> f32 {
        self.pixel_bbox().width()
    }

    pub fn to_detection(&self) -> Detection {
        Detection {
            class_label: HAND_CLASS.to_string(),
            confidence: self.confidence,
            bbox: self.pixel_bbox(),
            frame_timestamp_ms: self.frame_timestamp_ms,
        }
    }
}

/// Object detection as a backend reports it, before normalization.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    #[serde(alias = "class")]
    pub class_label: String,
    pub confidence: f32,
    /// `[x_min, y_min, x_max, y_max]`.
    pub bbox: [f32; 4],
    /// Coordinates are in 0..1 rather than pixels.
    #[serde(default)]
    pub normalized: bool,
}

/// Hand as a backend reports it, before validation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawHand {
    pub landmarks: Vec<[f32; 3]>,
    pub confidence: f32,
}

/// Everything a backend saw in one frame.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionBatch {
    #[serde(default)]
    pub detections: Vec<RawDetection>,
    #[serde(default)]
    pub hands: Vec<RawHand>,
}

impl DetectionBatch {
    pub fn is_empty(&self) -> bool {
        self.detections.is_empty() && self.hands.is_empty()
    }
}

/// Adapter output for one frame.
#[derive(Clone, Debug, Default)]
pub struct FrameObservations {
    pub frame_timestamp_ms: u64,
    pub detections: Vec<Detection>,
    pub hands: Vec<HandLandmarkSet>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_hand(offset_x: f32, spread: f32) -> Vec<Landmark> {
        (0..HAND_LANDMARK_COUNT)
            .map(|i| Landmark {
                x: offset_x + spread * (i as f32 / (HAND_LANDMARK_COUNT - 1) as f32),
                y: 0.5 + 0.01 * i as f32,
                z: 0.0,
            })
            .collect()
    }

    #[test]
    fn hand_requires_21_landmarks() {
        let mut points = open_hand(0.2, 0.1);
        points.pop();
        assert!(HandLandmarkSet::new(points, 0.9, 640, 480, 0).is_err());
    }

    #[test]
    fn hand_pixel_bbox_scales_by_frame() {
        let hand = HandLandmarkSet::new(open_hand(0.25, 0.25), 0.9, 640, 480, 7).unwrap();
        let bbox = hand.pixel_bbox();
        assert!((bbox.x_min - 160.0).abs() < 1e-3);
        assert!((bbox.x_max - 320.0).abs() < 1e-3);
        assert!((hand.pixel_span() - 160.0).abs() < 1e-3);

        let det = hand.to_detection();
        assert!(det.is_hand());
        assert_eq!(det.frame_timestamp_ms, 7);
    }

    #[test]
    fn blend_moves_toward_observation() {
        let prev = BoundingBox::new(0.0, 0.0, 100.0, 100.0);
        let obs = BoundingBox::new(10.0, 10.0, 110.0, 110.0);
        let mixed = prev.blend(&obs, 0.5);
        assert_eq!(mixed, BoundingBox::new(5.0, 5.0, 105.0, 105.0));
        assert_eq!(prev.blend(&obs, 1.0), obs);
    }

    #[test]
    fn raw_detection_accepts_class_alias() {
        let raw: RawDetection =
            serde_json::from_str(r#"{"class":"hotspot","confidence":0.8,"bbox":[1,2,3,4]}"#)
                .unwrap();
        assert_eq!(raw.class_label, "hotspot");
        assert!(!raw.normalized);
    }
}
