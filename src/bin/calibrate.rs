//! calibrate - camera focal-length calibration and distance check
//!
//! `focal` derives the focal length (pixels) from an object of known width
//! held at a known distance, either from an explicit pixel width or averaged
//! over a replay recording. `measure` replays a recording through the
//! configured estimator and prints per-frame ranges with a warning when a
//! hand or obstacle is closer than the collision warn threshold.

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use dropzone_kernel::config::DropzoneConfig;
use dropzone_kernel::detect::{BackendRegistry, DetectorAdapter, ReplayBackend};
use dropzone_kernel::distance::{calibrate_focal_length, DistanceEstimator};
use dropzone_kernel::frame::SyntheticFrameSource;

#[derive(Parser, Debug)]
#[command(name = "calibrate", about = "Focal-length calibration and range check")]
struct Args {
    /// TOML configuration file.
    #[arg(long, env = "DROPZONE_CONFIG", global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Derive focal length = pixel_width * distance / real_width
    Focal {
        /// Distance between camera and reference object, meters.
        #[arg(long)]
        distance: f32,
        /// Real width of the reference object, meters (defaults to the hand span).
        #[arg(long)]
        real_width: Option<f32>,
        /// Measured pixel width of the reference object.
        #[arg(long, conflicts_with = "replay")]
        pixel_width: Option<f32>,
        /// Average the pixel width over a replay recording instead.
        #[arg(long)]
        replay: Option<PathBuf>,
        /// Class to measure in the recording (hands when omitted).
        #[arg(long)]
        class: Option<String>,
    },

    /// Print per-frame ranges from a replay recording
    Measure {
        #[arg(long)]
        replay: PathBuf,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let cfg = match args.config.as_deref() {
        Some(path) => DropzoneConfig::load_path(path)?,
        None => DropzoneConfig::load()?,
    };

    match args.command {
        Command::Focal {
            distance,
            real_width,
            pixel_width,
            replay,
            class,
        } => {
            let real_width = real_width.unwrap_or(match class {
                Some(ref class) => cfg
                    .distance
                    .object_widths
                    .get(&class.to_lowercase())
                    .copied()
                    .unwrap_or(cfg.distance.known_object_width_m),
                None => cfg.distance.hand_span_m,
            });
            let pixel_width = match (pixel_width, replay) {
                (Some(width), _) => width,
                (None, Some(path)) => average_pixel_width(&cfg, &path, class.as_deref())?,
                (None, None) => return Err(anyhow!("provide --pixel-width or --replay")),
            };
            let focal = calibrate_focal_length(pixel_width, real_width, distance)?;
            println!(
                "focal_length_px = {:.1}  (pixel width {:.1}px, real width {:.3}m, distance {:.2}m)",
                focal, pixel_width, real_width, distance
            );
        }
        Command::Measure { replay } => measure(&cfg, &replay)?,
    }
    Ok(())
}

fn open_replay(
    cfg: &DropzoneConfig,
    path: &Path,
) -> Result<(DetectorAdapter, SyntheticFrameSource)> {
    let mut registry = BackendRegistry::new();
    registry.register(ReplayBackend::open(path)?);
    let adapter = DetectorAdapter::new(registry, cfg.adapter_config());
    let source = SyntheticFrameSource::new(cfg.frame_source_config())?;
    Ok((adapter, source))
}

fn average_pixel_width(cfg: &DropzoneConfig, path: &Path, class: Option<&str>) -> Result<f32> {
    let (mut adapter, mut source) = open_replay(cfg, path)?;
    let class = class.map(|c| c.trim().to_lowercase());
    let mut total = 0.0f64;
    let mut samples = 0u32;
    while !adapter.is_exhausted() {
        let frame = source.next_frame();
        let observations = adapter.detect(&frame)?;
        let widths: Vec<f32> = match class.as_deref() {
            Some(class) => observations
                .detections
                .iter()
                .filter(|d| d.class_label == class)
                .map(|d| d.bbox.width())
                .collect(),
            None => observations.hands.iter().map(|h| h.pixel_span()).collect(),
        };
        for width in widths.into_iter().filter(|w| *w > 0.0) {
            total += width as f64;
            samples += 1;
        }
    }
    if samples == 0 {
        return Err(anyhow!("no measurable samples in {}", path.display()));
    }
    log::info!("averaged {} samples from {}", samples, path.display());
    Ok((total / samples as f64) as f32)
}

fn measure(cfg: &DropzoneConfig, path: &Path) -> Result<()> {
    let estimator = DistanceEstimator::new(cfg.estimator_config())?;
    let (mut adapter, mut source) = open_replay(cfg, path)?;
    let warn_m = cfg.collision.warn_m;
    while !adapter.is_exhausted() {
        let frame = source.next_frame();
        let observations = adapter.detect(&frame)?;
        let mut ranges = Vec::new();
        for hand in &observations.hands {
            ranges.push(("hand".to_string(), estimator.estimate_hand(hand)));
        }
        for detection in &observations.detections {
            ranges.push((
                detection.class_label.clone(),
                estimator.estimate_detection(detection),
            ));
        }
        if ranges.is_empty() {
            println!("frame {:>5}: nothing detected", frame.index);
            continue;
        }
        for (class, range) in ranges {
            match range {
                Ok(estimate) if estimate.distance_m < warn_m => println!(
                    "frame {:>5}: {} at {:.2}m  -- too close, move back",
                    frame.index, class, estimate.distance_m
                ),
                Ok(estimate) => println!(
                    "frame {:>5}: {} at {:.2}m",
                    frame.index, class, estimate.distance_m
                ),
                Err(e) => println!("frame {:>5}: {}", frame.index, e),
            }
        }
    }
    Ok(())
}
