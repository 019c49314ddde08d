//! Recorded-detection backend.
//!
//! Reads a JSON-lines file where each line is one frame's `DetectionBatch`:
//!
//! ```text
//! {"detections":[{"class_label":"hotspot","confidence":0.9,"bbox":[270,190,370,290]}]}
//! {"detections":[],"hands":[{"confidence":0.95,"landmarks":[[0.41,0.52,0.0], ...]}]}
//! ```
//!
//! Blank lines are skipped. Once the recording is exhausted every call returns
//! an empty batch and `is_exhausted` turns true.

use anyhow::{anyhow, Result};
use std::collections::VecDeque;
use std::path::Path;

use crate::detect::backend::{DetectionCapability, DetectorBackend};
use crate::detect::result::DetectionBatch;
use crate::frame::Frame;

pub struct ReplayBackend {
    frames: VecDeque<DetectionBatch>,
    frames_replayed: u64,
    has_hands: bool,
}

impl ReplayBackend {
    pub fn from_batches(batches: Vec<DetectionBatch>) -> Self {
        let has_hands = batches.iter().any(|b| !b.hands.is_empty());
        Self {
            frames: batches.into(),
            frames_replayed: 0,
            has_hands,
        }
    }

    pub fn parse(jsonl: &str) -> Result<Self> {
        let mut batches = Vec::new();
        for (line_no, line) in jsonl.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let batch: DetectionBatch = serde_json::from_str(line)
                .map_err(|e| anyhow!("invalid replay frame on line {}: {}", line_no + 1, e))?;
            batches.push(batch);
        }
        Ok(Self::from_batches(batches))
    }

    pub fn open(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("failed to read replay file {}: {}", path.display(), e))?;
        let backend = Self::parse(&raw)?;
        log::info!(
            "replay backend loaded {} frames from {}",
            backend.remaining(),
            path.display()
        );
        Ok(backend)
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }

    pub fn frames_replayed(&self) -> u64 {
        self.frames_replayed
    }
}

impl DetectorBackend for ReplayBackend {
    fn name(&self) -> &'static str {
        "replay"
    }

    fn supports(&self, capability: DetectionCapability) -> bool {
        match capability {
            DetectionCapability::Objects => true,
            DetectionCapability::HandLandmarks => self.has_hands,
        }
    }

    fn detect(&mut self, _frame: &Frame) -> Result<DetectionBatch> {
        match self.frames.pop_front() {
            Some(batch) => {
                self.frames_replayed += 1;
                Ok(batch)
            }
            None => Ok(DetectionBatch::default()),
        }
    }

    fn is_exhausted(&self) -> bool {
        self.frames.is_empty()
    }
}
