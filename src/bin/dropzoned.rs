//! dropzoned - dropzone decision daemon
//!
//! This daemon:
//! 1. Loads configuration (file named by DROPZONE_CONFIG, env overrides)
//! 2. Opens the detector backend and the drone link
//! 3. Runs one decision tick per frame at the configured frame rate
//! 4. Journals every command dispatch (optional)
//! 5. Stops on Ctrl-C, a frame limit, or the end of a replay recording

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dropzone_kernel::config::DropzoneConfig;
use dropzone_kernel::pipeline::{link_from_config, registry_from_config, FramePipeline};
use dropzone_kernel::{CommandJournal, SyntheticFrameSource};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// TOML configuration file.
    #[arg(long, env = "DROPZONE_CONFIG")]
    config: Option<PathBuf>,
    /// Stop after this many frames.
    #[arg(long)]
    frames: Option<u64>,
    /// Write the hash-chained command journal to this file.
    #[arg(long, env = "DROPZONE_JOURNAL")]
    journal: Option<PathBuf>,
    /// MQTT client id (mqtt link only).
    #[arg(long, env = "DROPZONE_CLIENT_ID", default_value = "dropzoned")]
    client_id: String,
    /// Process frames as fast as possible instead of pacing to target_fps.
    #[arg(long)]
    unpaced: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let cfg = match args.config.as_deref() {
        Some(path) => DropzoneConfig::load_path(path)?,
        None => DropzoneConfig::load()?,
    };

    let registry = registry_from_config(&cfg)?;
    log::info!(
        "detector backends: {:?} (default {})",
        registry.list(),
        registry.default_name().unwrap_or("none")
    );
    let link = link_from_config(&cfg, &args.client_id)?;
    let mut pipeline = FramePipeline::from_config(&cfg, registry, link)?;
    if let Some(path) = &args.journal {
        pipeline = pipeline.with_journal(CommandJournal::create(path)?);
    }

    let mut source = SyntheticFrameSource::new(cfg.frame_source_config())?;
    let interval = source.frame_interval();

    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    ctrlc::set_handler(move || {
        flag.store(false, Ordering::SeqCst);
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!(
        "dropzoned running: {}x{} @ {} fps, drop window {:.1}-{:.1}m, warn {:.1}m, abort {:.1}m",
        cfg.camera.width,
        cfg.camera.height,
        cfg.camera.target_fps,
        cfg.payload.drop_min_m,
        cfg.payload.drop_max_m,
        cfg.collision.warn_m,
        cfg.collision.abort_m
    );

    let mut last_health_log = Instant::now();
    while running.load(Ordering::SeqCst) {
        if args.frames.is_some_and(|limit| pipeline.stats().frames >= limit) {
            log::info!("frame limit reached");
            break;
        }
        if pipeline.detector_exhausted() {
            log::info!("detector recording exhausted");
            break;
        }

        let started = Instant::now();
        let frame = source.next_frame();
        let report = pipeline.tick(&frame)?;
        for failure in &report.delivery_failures {
            log::error!("frame {}: {}", report.frame_timestamp_ms, failure);
        }
        if let Some(target_id) = report.released_target() {
            log::info!("payload released on target {}", target_id);
        }

        if last_health_log.elapsed() >= Duration::from_secs(5) {
            let stats = pipeline.stats();
            log::info!(
                "health frames={} collision={} payload={} hotspots={} obstacles={} releases={} halts={} failures={}",
                stats.frames,
                pipeline.collision_state().as_str(),
                pipeline.payload_state().as_str(),
                report.hotspots.len(),
                report.obstacles.len(),
                stats.releases,
                stats.halts,
                stats.delivery_failures
            );
            last_health_log = Instant::now();
        }

        if !args.unpaced {
            if let Some(rest) = interval.checked_sub(started.elapsed()) {
                std::thread::sleep(rest);
            }
        }
    }

    let stats = pipeline.stats();
    log::info!(
        "shutting down after {} frames ({} releases, {} delivery failures)",
        stats.frames,
        stats.releases,
        stats.delivery_failures
    );
    if let Some(journal) = pipeline.journal() {
        journal.verify()?;
        log::info!(
            "journal holds {} entries, head {}",
            journal.len(),
            journal.head_hex()
        );
    }
    pipeline.shutdown()?;
    Ok(())
}
