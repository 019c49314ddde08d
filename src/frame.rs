//! Camera frame handoff.
//!
//! - `Frame`: one captured image plus its capture timestamp. Pixels are private;
//!   detector backends read them through `Frame::pixels`.
//! - `SyntheticFrameSource`: deterministic frame generator used by the daemon when
//!   no camera pipeline is attached (the replay backend supplies detections).
//!
//! Frame acquisition and decoding live outside this crate. The kernel only
//! requires that frames arrive with non-decreasing timestamps.

use anyhow::{anyhow, Result};
use std::time::{Duration, Instant};

/// A single camera frame.
pub struct Frame {
    /// Private pixel data (packed RGB). Never retained past the frame tick.
    pixels: Vec<u8>,

    pub width: u32,
    pub height: u32,

    /// Monotonic frame counter assigned by the source.
    pub index: u64,

    /// Capture time in milliseconds since the source started.
    pub timestamp_ms: u64,
}

impl Frame {
    pub fn new(
        pixels: Vec<u8>,
        width: u32,
        height: u32,
        index: u64,
        timestamp_ms: u64,
    ) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(anyhow!("frame dimensions must be non-zero"));
        }
        let expected = width as usize * height as usize * 3;
        if !pixels.is_empty() && pixels.len() != expected {
            return Err(anyhow!(
                "frame pixel buffer has {} bytes, expected {} for {}x{} RGB",
                pixels.len(),
                expected,
                width,
                height
            ));
        }
        Ok(Self {
            pixels,
            width,
            height,
            index,
            timestamp_ms,
        })
    }

    /// Metadata-only frame. Used when detections come from a recording.
    pub fn blank(width: u32, height: u32, index: u64, timestamp_ms: u64) -> Self {
        Self {
            pixels: Vec::new(),
            width,
            height,
            index,
            timestamp_ms,
        }
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn has_pixels(&self) -> bool {
        !self.pixels.is_empty()
    }
}

/// Configuration for the synthetic frame source.
#[derive(Clone, Debug)]
pub struct FrameSourceConfig {
    pub width: u32,
    pub height: u32,
    pub target_fps: u32,
}

impl Default for FrameSourceConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            target_fps: 10,
        }
    }
}

/// Statistics for a frame source.
#[derive(Clone, Debug)]
pub struct FrameSourceStats {
    pub frames_captured: u64,
    pub last_timestamp_ms: u64,
}

/// Blank frames at a fixed rate with timestamps taken from a monotonic clock.
pub struct SyntheticFrameSource {
    config: FrameSourceConfig,
    started: Instant,
    frame_count: u64,
    last_timestamp_ms: u64,
}

impl SyntheticFrameSource {
    pub fn new(config: FrameSourceConfig) -> Result<Self> {
        if config.target_fps == 0 {
            return Err(anyhow!("target_fps must be greater than zero"));
        }
        Ok(Self {
            config,
            started: Instant::now(),
            frame_count: 0,
            last_timestamp_ms: 0,
        })
    }

    /// Time budget for one frame at the configured rate.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(1000 / self.config.target_fps as u64)
    }

    pub fn next_frame(&mut self) -> Frame {
        self.frame_count += 1;
        let elapsed = self.started.elapsed().as_millis() as u64;
        // Clock reads can coincide at high rates; keep timestamps strictly increasing.
        let timestamp_ms = elapsed.max(self.last_timestamp_ms + 1);
        self.last_timestamp_ms = timestamp_ms;
        Frame::blank(
            self.config.width,
            self.config.height,
            self.frame_count,
            timestamp_ms,
        )
    }

    pub fn stats(&self) -> FrameSourceStats {
        FrameSourceStats {
            frames_captured: self.frame_count,
            last_timestamp_ms: self.last_timestamp_ms,
        }
    }
}
