use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::command::{DispatchPolicy, LinkKind};
use crate::decision::{CollisionThresholds, DropWindow};
use crate::detect::AdapterConfig;
use crate::distance::EstimatorConfig;
use crate::frame::FrameSourceConfig;
use crate::tracker::TrackerConfig;

const DEFAULT_FOCAL_LENGTH_PX: f32 = 800.0;
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_TARGET_FPS: u32 = 10;
const DEFAULT_OBJECT_WIDTH_M: f32 = 0.5;
const DEFAULT_MIN_BBOX_WIDTH_PX: f32 = 4.0;
const DEFAULT_HAND_SPAN_M: f32 = 0.085;
const DEFAULT_MIN_LANDMARK_CONFIDENCE: f32 = 0.5;
const DEFAULT_BACKEND: &str = "stub";
const DEFAULT_MIN_CONFIDENCE: f32 = 0.25;
const DEFAULT_HOTSPOT_CLASS: &str = "hotspot";
const DEFAULT_GATE_PX: f32 = 80.0;
const DEFAULT_SMOOTHING_FACTOR: f32 = 0.6;
const DEFAULT_STABILITY_THRESHOLD: u32 = 3;
const DEFAULT_MISS_LIMIT: u32 = 10;
const DEFAULT_DROP_MIN_M: f32 = 3.0;
const DEFAULT_DROP_MAX_M: f32 = 5.0;
const DEFAULT_WARN_M: f32 = 2.0;
const DEFAULT_ABORT_M: f32 = 1.0;
const DEFAULT_HYSTERESIS_M: f32 = 0.5;
const DEFAULT_LINK_ADDR: &str = "127.0.0.1:14550";
const DEFAULT_TOPIC_PREFIX: &str = "dropzone";
const DEFAULT_ACK_TIMEOUT_MS: u64 = 250;
const DEFAULT_RETRY_COUNT: u32 = 3;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DropzoneConfigFile {
    camera: Option<CameraConfigFile>,
    distance: Option<DistanceConfigFile>,
    detector: Option<DetectorConfigFile>,
    tracker: Option<TrackerConfigFile>,
    payload: Option<PayloadConfigFile>,
    collision: Option<CollisionConfigFile>,
    link: Option<LinkConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CameraConfigFile {
    focal_length_px: Option<f32>,
    width: Option<u32>,
    height: Option<u32>,
    target_fps: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DistanceConfigFile {
    known_object_width_m: Option<f32>,
    min_bbox_width_px: Option<f32>,
    hand_span_m: Option<f32>,
    min_landmark_confidence: Option<f32>,
    object_widths: Option<HashMap<String, f32>>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DetectorConfigFile {
    backend: Option<String>,
    replay_path: Option<PathBuf>,
    min_confidence: Option<f32>,
    hotspot_classes: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct TrackerConfigFile {
    gate_px: Option<f32>,
    smoothing_factor: Option<f32>,
    stability_threshold: Option<u32>,
    miss_limit: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PayloadConfigFile {
    drop_min_m: Option<f32>,
    drop_max_m: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CollisionConfigFile {
    warn_m: Option<f32>,
    abort_m: Option<f32>,
    hysteresis_m: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct LinkConfigFile {
    kind: Option<String>,
    addr: Option<String>,
    topic_prefix: Option<String>,
    ack_timeout_ms: Option<u64>,
    retry_count: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct DropzoneConfig {
    pub camera: CameraSettings,
    pub distance: DistanceSettings,
    pub detector: DetectorSettings,
    pub tracker: TrackerConfig,
    pub payload: PayloadSettings,
    pub collision: CollisionSettings,
    pub link: LinkSettings,
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub focal_length_px: f32,
    pub width: u32,
    pub height: u32,
    pub target_fps: u32,
}

#[derive(Debug, Clone)]
pub struct DistanceSettings {
    pub known_object_width_m: f32,
    pub min_bbox_width_px: f32,
    pub hand_span_m: f32,
    pub min_landmark_confidence: f32,
    pub object_widths: HashMap<String, f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Stub,
    Replay,
}

impl BackendKind {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "stub" => Ok(Self::Stub),
            "replay" => Ok(Self::Replay),
            other => Err(anyhow!(
                "unknown detector backend '{}' (expected stub or replay)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub backend: BackendKind,
    pub replay_path: Option<PathBuf>,
    pub min_confidence: f32,
    /// Class labels treated as drop targets; every other class is an obstacle.
    pub hotspot_classes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PayloadSettings {
    pub drop_min_m: f32,
    pub drop_max_m: f32,
}

#[derive(Debug, Clone)]
pub struct CollisionSettings {
    pub warn_m: f32,
    pub abort_m: f32,
    pub hysteresis_m: f32,
}

#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub kind: LinkKind,
    pub addr: String,
    pub topic_prefix: String,
    pub ack_timeout: Duration,
    pub retry_count: u32,
}

impl DropzoneConfig {
    /// Load from the file named by `DROPZONE_CONFIG` (if set), then apply
    /// environment overrides and validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("DROPZONE_CONFIG").ok();
        match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Self::load_path(Path::new(path)),
            _ => Self::finish(DropzoneConfigFile::default()),
        }
    }

    pub fn load_path(path: &Path) -> Result<Self> {
        Self::finish(read_config_file(path)?)
    }

    /// Parse TOML text without consulting the environment.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let file: DropzoneConfigFile =
            toml::from_str(raw).map_err(|e| anyhow!("invalid config: {}", e))?;
        let cfg = Self::from_file(file)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn finish(file: DropzoneConfigFile) -> Result<Self> {
        let mut cfg = Self::from_file(file)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: DropzoneConfigFile) -> Result<Self> {
        let camera_file = file.camera.unwrap_or_default();
        let camera = CameraSettings {
            focal_length_px: camera_file
                .focal_length_px
                .unwrap_or(DEFAULT_FOCAL_LENGTH_PX),
            width: camera_file.width.unwrap_or(DEFAULT_WIDTH),
            height: camera_file.height.unwrap_or(DEFAULT_HEIGHT),
            target_fps: camera_file.target_fps.unwrap_or(DEFAULT_TARGET_FPS),
        };

        let distance_file = file.distance.unwrap_or_default();
        let distance = DistanceSettings {
            known_object_width_m: distance_file
                .known_object_width_m
                .unwrap_or(DEFAULT_OBJECT_WIDTH_M),
            min_bbox_width_px: distance_file
                .min_bbox_width_px
                .unwrap_or(DEFAULT_MIN_BBOX_WIDTH_PX),
            hand_span_m: distance_file.hand_span_m.unwrap_or(DEFAULT_HAND_SPAN_M),
            min_landmark_confidence: distance_file
                .min_landmark_confidence
                .unwrap_or(DEFAULT_MIN_LANDMARK_CONFIDENCE),
            object_widths: distance_file
                .object_widths
                .unwrap_or_default()
                .into_iter()
                .map(|(class, width)| (class.trim().to_lowercase(), width))
                .collect(),
        };

        let detector_file = file.detector.unwrap_or_default();
        let detector = DetectorSettings {
            backend: BackendKind::parse(
                detector_file.backend.as_deref().unwrap_or(DEFAULT_BACKEND),
            )?,
            replay_path: detector_file.replay_path,
            min_confidence: detector_file
                .min_confidence
                .unwrap_or(DEFAULT_MIN_CONFIDENCE),
            hotspot_classes: detector_file
                .hotspot_classes
                .map(|classes| {
                    classes
                        .iter()
                        .map(|class| class.trim().to_lowercase())
                        .filter(|class| !class.is_empty())
                        .collect()
                })
                .unwrap_or_else(|| vec![DEFAULT_HOTSPOT_CLASS.to_string()]),
        };

        let tracker_file = file.tracker.unwrap_or_default();
        let tracker = TrackerConfig {
            gate_px: tracker_file.gate_px.unwrap_or(DEFAULT_GATE_PX),
            smoothing_factor: tracker_file
                .smoothing_factor
                .unwrap_or(DEFAULT_SMOOTHING_FACTOR),
            stability_threshold: tracker_file
                .stability_threshold
                .unwrap_or(DEFAULT_STABILITY_THRESHOLD),
            miss_limit: tracker_file.miss_limit.unwrap_or(DEFAULT_MISS_LIMIT),
        };

        let payload_file = file.payload.unwrap_or_default();
        let payload = PayloadSettings {
            drop_min_m: payload_file.drop_min_m.unwrap_or(DEFAULT_DROP_MIN_M),
            drop_max_m: payload_file.drop_max_m.unwrap_or(DEFAULT_DROP_MAX_M),
        };

        let collision_file = file.collision.unwrap_or_default();
        let collision = CollisionSettings {
            warn_m: collision_file.warn_m.unwrap_or(DEFAULT_WARN_M),
            abort_m: collision_file.abort_m.unwrap_or(DEFAULT_ABORT_M),
            hysteresis_m: collision_file.hysteresis_m.unwrap_or(DEFAULT_HYSTERESIS_M),
        };

        let link_file = file.link.unwrap_or_default();
        let link = LinkSettings {
            kind: match link_file.kind.as_deref() {
                Some(kind) => LinkKind::parse(kind)?,
                None => LinkKind::Loopback,
            },
            addr: link_file
                .addr
                .unwrap_or_else(|| DEFAULT_LINK_ADDR.to_string()),
            topic_prefix: link_file
                .topic_prefix
                .unwrap_or_else(|| DEFAULT_TOPIC_PREFIX.to_string()),
            ack_timeout: Duration::from_millis(
                link_file.ack_timeout_ms.unwrap_or(DEFAULT_ACK_TIMEOUT_MS),
            ),
            retry_count: link_file.retry_count.unwrap_or(DEFAULT_RETRY_COUNT),
        };

        Ok(Self {
            camera,
            distance,
            detector,
            tracker,
            payload,
            collision,
            link,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(kind) = std::env::var("DROPZONE_LINK_KIND") {
            if !kind.trim().is_empty() {
                self.link.kind = LinkKind::parse(&kind)?;
            }
        }
        if let Ok(addr) = std::env::var("DROPZONE_LINK_ADDR") {
            if !addr.trim().is_empty() {
                self.link.addr = addr.trim().to_string();
            }
        }
        if let Ok(focal) = std::env::var("DROPZONE_FOCAL_PX") {
            self.camera.focal_length_px = focal
                .trim()
                .parse()
                .map_err(|_| anyhow!("DROPZONE_FOCAL_PX must be a number of pixels"))?;
        }
        if let Ok(retries) = std::env::var("DROPZONE_RETRY_COUNT") {
            self.link.retry_count = retries
                .trim()
                .parse()
                .map_err(|_| anyhow!("DROPZONE_RETRY_COUNT must be a positive integer"))?;
        }
        if let Ok(timeout) = std::env::var("DROPZONE_ACK_TIMEOUT_MS") {
            let millis: u64 = timeout.trim().parse().map_err(|_| {
                anyhow!("DROPZONE_ACK_TIMEOUT_MS must be an integer number of milliseconds")
            })?;
            self.link.ack_timeout = Duration::from_millis(millis);
        }
        if let Ok(path) = std::env::var("DROPZONE_REPLAY_PATH") {
            if !path.trim().is_empty() {
                self.detector.replay_path = Some(PathBuf::from(path));
                self.detector.backend = BackendKind::Replay;
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(anyhow!("camera width and height must be non-zero"));
        }
        if self.camera.target_fps == 0 {
            return Err(anyhow!("camera target_fps must be greater than zero"));
        }
        self.estimator_config().validate()?;
        if !(0.0..=1.0).contains(&self.detector.min_confidence) {
            return Err(anyhow!("detector min_confidence must be within [0, 1]"));
        }
        if self.detector.hotspot_classes.is_empty() {
            return Err(anyhow!("detector hotspot_classes must name at least one class"));
        }
        if self.detector.backend == BackendKind::Replay && self.detector.replay_path.is_none() {
            return Err(anyhow!("detector replay_path is required for the replay backend"));
        }
        self.tracker.validate()?;
        self.drop_window()?;
        self.collision_thresholds()?;
        if self.link.retry_count == 0 {
            return Err(anyhow!("link retry_count must be at least 1"));
        }
        if self.link.ack_timeout.is_zero() {
            return Err(anyhow!("link ack_timeout_ms must be greater than zero"));
        }
        if self.link.topic_prefix.trim().is_empty() {
            return Err(anyhow!("link topic_prefix must not be empty"));
        }
        Ok(())
    }

    pub fn frame_source_config(&self) -> FrameSourceConfig {
        FrameSourceConfig {
            width: self.camera.width,
            height: self.camera.height,
            target_fps: self.camera.target_fps,
        }
    }

    pub fn adapter_config(&self) -> AdapterConfig {
        AdapterConfig {
            min_confidence: self.detector.min_confidence,
        }
    }

    pub fn estimator_config(&self) -> EstimatorConfig {
        EstimatorConfig {
            focal_length_px: self.camera.focal_length_px,
            default_object_width_m: self.distance.known_object_width_m,
            object_widths_m: self.distance.object_widths.clone(),
            min_bbox_width_px: self.distance.min_bbox_width_px,
            hand_span_m: self.distance.hand_span_m,
            min_landmark_confidence: self.distance.min_landmark_confidence,
        }
    }

    pub fn drop_window(&self) -> Result<DropWindow> {
        DropWindow::new(self.payload.drop_min_m, self.payload.drop_max_m)
            .map_err(|e| anyhow!("payload: {}", e))
    }

    pub fn collision_thresholds(&self) -> Result<CollisionThresholds> {
        CollisionThresholds::new(
            self.collision.warn_m,
            self.collision.abort_m,
            self.collision.hysteresis_m,
        )
        .map_err(|e| anyhow!("collision: {}", e))
    }

    pub fn dispatch_policy(&self) -> DispatchPolicy {
        DispatchPolicy {
            ack_timeout: self.link.ack_timeout,
            retry_count: self.link.retry_count,
        }
    }

    pub fn is_hotspot_class(&self, class_label: &str) -> bool {
        self.detector
            .hotspot_classes
            .iter()
            .any(|class| class == class_label)
    }
}

fn read_config_file(path: &Path) -> Result<DropzoneConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
