//! Cross-frame target tracking.
//!
//! Targets live in an id-indexed map owned by the tracker and are updated in
//! place once per frame. Callers only ever receive cloned snapshots.
//!
//! Association: every ranged detection proposes to the nearest same-class
//! target whose smoothed center lies inside the gate (equal distance goes to
//! the older target). When several detections propose to one target, the
//! most confident one keeps it; the others retry against their next-nearest
//! target and spawn a new one when nothing is left inside the gate.

use anyhow::{anyhow, Result};
use std::collections::{BTreeMap, HashSet};

use crate::detect::BoundingBox;
use crate::distance::DistanceEstimate;

/// Stable per-session target identity. Ids are never reused.
pub type TargetId = u64;

#[derive(Clone, Debug)]
pub struct TrackerConfig {
    /// Maximum center distance (pixels) for a detection to match a target.
    pub gate_px: f32,
    /// EMA weight of the newest observation (1.0 = no smoothing).
    pub smoothing_factor: f32,
    /// A target is locked once its consecutive hits exceed this.
    pub stability_threshold: u32,
    /// A target is purged once its consecutive misses exceed this.
    pub miss_limit: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            gate_px: 80.0,
            smoothing_factor: 0.6,
            stability_threshold: 3,
            miss_limit: 10,
        }
    }
}

impl TrackerConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.gate_px.is_finite() && self.gate_px > 0.0) {
            return Err(anyhow!("tracker gate_px must be a positive number"));
        }
        if !(self.smoothing_factor > 0.0 && self.smoothing_factor <= 1.0) {
            return Err(anyhow!("tracker smoothing_factor must be within (0, 1]"));
        }
        Ok(())
    }
}

/// One tracked target. Constructed and mutated only by `HotspotTracker`.
///
/// Fields are private, so code outside the tracker can neither build a target:
///
/// ```compile_fail
/// use dropzone_kernel::TrackedTarget;
///
/// let _forged = TrackedTarget {
///     target_id: 1,
///     class_label: "hotspot".to_string(),
///     smoothed_bbox: dropzone_kernel::BoundingBox::new(0.0, 0.0, 10.0, 10.0),
///     smoothed_distance_m: 4.0,
///     frames_seen_consecutively: 99,
///     consecutive_misses: 0,
///     age_frames: 99,
///     first_seen_timestamp_ms: 0,
///     last_seen_timestamp_ms: 0,
///     last_confidence: 1.0,
///     locked: true,
/// };
/// ```
///
/// nor promote a snapshot to locked:
///
/// ```compile_fail
/// use dropzone_kernel::{HotspotTracker, tracker::TrackerConfig};
///
/// let mut tracker = HotspotTracker::new(TrackerConfig::default()).unwrap();
/// let mut snapshot = tracker.update(0, &[]);
/// for target in snapshot.iter_mut() {
///     target.locked = true;
/// }
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct TrackedTarget {
    target_id: TargetId,
    class_label: String,
    smoothed_bbox: BoundingBox,
    smoothed_distance_m: f32,
    frames_seen_consecutively: u32,
    consecutive_misses: u32,
    age_frames: u32,
    first_seen_timestamp_ms: u64,
    last_seen_timestamp_ms: u64,
    last_confidence: f32,
    locked: bool,
}

impl TrackedTarget {
    pub fn target_id(&self) -> TargetId {
        self.target_id
    }

    pub fn class_label(&self) -> &str {
        &self.class_label
    }

    pub fn smoothed_bbox(&self) -> BoundingBox {
        self.smoothed_bbox
    }

    pub fn smoothed_distance_m(&self) -> f32 {
        self.smoothed_distance_m
    }

    pub fn frames_seen_consecutively(&self) -> u32 {
        self.frames_seen_consecutively
    }

    pub fn consecutive_misses(&self) -> u32 {
        self.consecutive_misses
    }

    /// Frames since the target was spawned, hits and misses alike.
    pub fn age_frames(&self) -> u32 {
        self.age_frames
    }

    pub fn first_seen_timestamp_ms(&self) -> u64 {
        self.first_seen_timestamp_ms
    }

    pub fn last_seen_timestamp_ms(&self) -> u64 {
        self.last_seen_timestamp_ms
    }

    pub fn last_confidence(&self) -> f32 {
        self.last_confidence
    }

    /// Lock-on as of the frame this snapshot was taken.
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    fn spawn(target_id: TargetId, estimate: &DistanceEstimate, timestamp_ms: u64) -> Self {
        Self {
            target_id,
            class_label: estimate.source.class_label.clone(),
            smoothed_bbox: estimate.source.bbox,
            smoothed_distance_m: estimate.distance_m,
            frames_seen_consecutively: 1,
            consecutive_misses: 0,
            age_frames: 1,
            first_seen_timestamp_ms: timestamp_ms,
            last_seen_timestamp_ms: timestamp_ms,
            last_confidence: estimate.confidence,
            locked: false,
        }
    }

    fn observe(&mut self, estimate: &DistanceEstimate, timestamp_ms: u64, alpha: f32) {
        self.smoothed_bbox = self.smoothed_bbox.blend(&estimate.source.bbox, alpha);
        self.smoothed_distance_m =
            alpha * estimate.distance_m + (1.0 - alpha) * self.smoothed_distance_m;
        self.frames_seen_consecutively = self.frames_seen_consecutively.saturating_add(1);
        self.consecutive_misses = 0;
        self.age_frames = self.age_frames.saturating_add(1);
        self.last_seen_timestamp_ms = timestamp_ms;
        self.last_confidence = estimate.confidence;
    }

    fn mark_missed(&mut self) {
        self.frames_seen_consecutively = 0;
        self.consecutive_misses = self.consecutive_misses.saturating_add(1);
        self.age_frames = self.age_frames.saturating_add(1);
    }
}

/// Counters for health logging.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TrackerStats {
    pub spawned: u64,
    pub purged: u64,
    /// Contested gates resolved by the confidence / age tie-break.
    pub ambiguities_resolved: u64,
}

pub struct HotspotTracker {
    config: TrackerConfig,
    targets: BTreeMap<TargetId, TrackedTarget>,
    next_id: TargetId,
    stats: TrackerStats,
}

impl HotspotTracker {
    pub fn new(config: TrackerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            targets: BTreeMap::new(),
            next_id: 1,
            stats: TrackerStats::default(),
        })
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn get(&self, target_id: TargetId) -> Option<&TrackedTarget> {
        self.targets.get(&target_id)
    }

    pub fn stats(&self) -> &TrackerStats {
        &self.stats
    }

    /// Advance one frame and return a snapshot of every live target.
    pub fn update(
        &mut self,
        frame_timestamp_ms: u64,
        estimates: &[DistanceEstimate],
    ) -> Vec<TrackedTarget> {
        let assignment = self.associate(estimates);
        let alpha = self.config.smoothing_factor;

        let mut matched: HashSet<TargetId> = HashSet::with_capacity(assignment.len());
        for (index, estimate) in estimates.iter().enumerate() {
            match assignment[index] {
                Some(target_id) => {
                    if let Some(target) = self.targets.get_mut(&target_id) {
                        target.observe(estimate, frame_timestamp_ms, alpha);
                        matched.insert(target_id);
                    }
                }
                None => {
                    let target_id = self.next_id;
                    self.next_id += 1;
                    self.targets.insert(
                        target_id,
                        TrackedTarget::spawn(target_id, estimate, frame_timestamp_ms),
                    );
                    matched.insert(target_id);
                    self.stats.spawned += 1;
                    log::debug!(
                        "target {} spawned ({} at {:.2}m)",
                        target_id,
                        estimate.source.class_label,
                        estimate.distance_m
                    );
                }
            }
        }

        let miss_limit = self.config.miss_limit;
        let mut purged = Vec::new();
        for (target_id, target) in self.targets.iter_mut() {
            if !matched.contains(target_id) {
                target.mark_missed();
                if target.consecutive_misses > miss_limit {
                    purged.push(*target_id);
                }
            }
        }
        for target_id in purged {
            self.targets.remove(&target_id);
            self.stats.purged += 1;
            log::debug!(
                "target {} purged after more than {} missed frames",
                target_id,
                miss_limit
            );
        }

        let threshold = self.config.stability_threshold;
        for target in self.targets.values_mut() {
            target.locked = target.frames_seen_consecutively > threshold;
        }

        self.targets.values().cloned().collect()
    }

    fn associate(&mut self, estimates: &[DistanceEstimate]) -> Vec<Option<TargetId>> {
        let mut assignment: Vec<Option<TargetId>> = vec![None; estimates.len()];
        let mut rejected: Vec<HashSet<TargetId>> = vec![HashSet::new(); estimates.len()];
        let mut exhausted = vec![false; estimates.len()];
        let mut holder: BTreeMap<TargetId, usize> = BTreeMap::new();

        loop {
            let mut proposals: BTreeMap<TargetId, Vec<usize>> = BTreeMap::new();
            for index in 0..estimates.len() {
                if assignment[index].is_some() || exhausted[index] {
                    continue;
                }
                match self.nearest_target(&estimates[index], &rejected[index]) {
                    Some(target_id) => proposals.entry(target_id).or_default().push(index),
                    None => exhausted[index] = true,
                }
            }
            if proposals.is_empty() {
                break;
            }

            for (target_id, mut contenders) in proposals {
                if let Some(&current) = holder.get(&target_id) {
                    contenders.push(current);
                }
                if contenders.len() > 1 {
                    self.stats.ambiguities_resolved += 1;
                }
                let Some(target) = self.targets.get(&target_id) else {
                    continue;
                };
                let winner = contenders
                    .iter()
                    .copied()
                    .min_by(|&a, &b| {
                        let ea = &estimates[a];
                        let eb = &estimates[b];
                        eb.confidence
                            .total_cmp(&ea.confidence)
                            .then_with(|| {
                                let da = target.smoothed_bbox.center_distance(&ea.source.bbox);
                                let db = target.smoothed_bbox.center_distance(&eb.source.bbox);
                                da.total_cmp(&db)
                            })
                            .then_with(|| a.cmp(&b))
                    })
                    .unwrap_or(contenders[0]);
                if contenders.len() > 1 {
                    log::debug!(
                        "target {} contested by {} detections; detection {} kept it",
                        target_id,
                        contenders.len(),
                        winner
                    );
                }
                for &loser in contenders.iter().filter(|&&c| c != winner) {
                    assignment[loser] = None;
                    rejected[loser].insert(target_id);
                }
                assignment[winner] = Some(target_id);
                holder.insert(target_id, winner);
            }
        }
        assignment
    }

    /// Nearest same-class target inside the gate, oldest first on ties.
    fn nearest_target(
        &self,
        estimate: &DistanceEstimate,
        rejected: &HashSet<TargetId>,
    ) -> Option<TargetId> {
        let gate = self.config.gate_px;
        self.targets
            .values()
            .filter(|t| t.class_label == estimate.source.class_label)
            .filter(|t| !rejected.contains(&t.target_id))
            .map(|t| (t.smoothed_bbox.center_distance(&estimate.source.bbox), t))
            .filter(|(d, _)| *d <= gate)
            .min_by(|(da, ta), (db, tb)| {
                da.total_cmp(db).then_with(|| {
                    ta.first_seen_timestamp_ms
                        .cmp(&tb.first_seen_timestamp_ms)
                        .then_with(|| ta.target_id.cmp(&tb.target_id))
                })
            })
            .map(|(_, t)| t.target_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::Detection;

    fn ranged(
        class: &str,
        cx: f32,
        width: f32,
        distance: f32,
        confidence: f32,
        ts: u64,
    ) -> DistanceEstimate {
        let half = width / 2.0;
        DistanceEstimate {
            source: Detection {
                class_label: class.to_string(),
                confidence,
                bbox: BoundingBox::new(cx - half, 200.0, cx + half, 200.0 + width),
                frame_timestamp_ms: ts,
            },
            distance_m: distance,
            confidence,
            frame_timestamp_ms: ts,
        }
    }

    fn tracker() -> HotspotTracker {
        HotspotTracker::new(TrackerConfig::default()).unwrap()
    }

    #[test]
    fn spawns_then_associates_same_target() {
        let mut tracker = tracker();
        let snap = tracker.update(0, &[ranged("hotspot", 300.0, 100.0, 4.0, 0.9, 0)]);
        assert_eq!(snap.len(), 1);
        let id = snap[0].target_id();

        let snap = tracker.update(100, &[ranged("hotspot", 310.0, 100.0, 4.0, 0.9, 100)]);
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].target_id(), id);
        assert_eq!(snap[0].frames_seen_consecutively(), 2);
        assert_eq!(snap[0].last_seen_timestamp_ms(), 100);
    }

    #[test]
    fn detections_outside_gate_spawn_new_targets() {
        let mut tracker = tracker();
        tracker.update(0, &[ranged("hotspot", 100.0, 50.0, 8.0, 0.9, 0)]);
        let snap = tracker.update(100, &[ranged("hotspot", 400.0, 50.0, 8.0, 0.9, 100)]);
        assert_eq!(snap.len(), 2);
        assert_eq!(tracker.stats().spawned, 2);
    }

    #[test]
    fn classes_never_cross_associate() {
        let mut tracker = tracker();
        tracker.update(0, &[ranged("person", 300.0, 80.0, 5.0, 0.9, 0)]);
        let snap = tracker.update(100, &[ranged("hand", 300.0, 80.0, 1.0, 0.9, 100)]);
        assert_eq!(snap.len(), 2);
    }

    #[test]
    fn smooths_distance_with_ema() {
        let mut tracker = HotspotTracker::new(TrackerConfig {
            smoothing_factor: 0.5,
            ..TrackerConfig::default()
        })
        .unwrap();
        tracker.update(0, &[ranged("hotspot", 300.0, 100.0, 4.0, 0.9, 0)]);
        let snap = tracker.update(100, &[ranged("hotspot", 300.0, 100.0, 6.0, 0.9, 100)]);
        assert!((snap[0].smoothed_distance_m() - 5.0).abs() < 1e-5);
    }

    #[test]
    fn locks_only_after_exceeding_threshold() {
        let mut tracker = tracker();
        for frame in 0..3u64 {
            let ts = frame * 100;
            let snap = tracker.update(ts, &[ranged("hotspot", 300.0, 100.0, 4.0, 0.9, ts)]);
            assert!(!snap[0].is_locked(), "locked early on frame {}", frame);
        }
        let snap = tracker.update(300, &[ranged("hotspot", 300.0, 100.0, 4.0, 0.9, 300)]);
        assert!(snap[0].is_locked());

        // A single miss drops the lock but keeps the target.
        let snap = tracker.update(400, &[]);
        assert_eq!(snap.len(), 1);
        assert!(!snap[0].is_locked());
        assert_eq!(snap[0].frames_seen_consecutively(), 0);
    }

    #[test]
    fn purges_only_after_exceeding_miss_limit() {
        for miss_limit in [0u32, 1, 3, 10] {
            let mut tracker = HotspotTracker::new(TrackerConfig {
                miss_limit,
                ..TrackerConfig::default()
            })
            .unwrap();
            tracker.update(0, &[ranged("hotspot", 300.0, 100.0, 4.0, 0.9, 0)]);
            for miss in 1..=miss_limit {
                let snap = tracker.update(miss as u64 * 100, &[]);
                assert_eq!(snap.len(), 1, "purged early at miss {} (limit {})", miss, miss_limit);
                assert_eq!(snap[0].consecutive_misses(), miss);
            }
            let snap = tracker.update((miss_limit as u64 + 1) * 100, &[]);
            assert!(snap.is_empty(), "not purged after limit {}", miss_limit);
            assert_eq!(tracker.stats().purged, 1);
        }
    }

    #[test]
    fn hit_resets_miss_counter() {
        let mut tracker = HotspotTracker::new(TrackerConfig {
            miss_limit: 2,
            ..TrackerConfig::default()
        })
        .unwrap();
        tracker.update(0, &[ranged("hotspot", 300.0, 100.0, 4.0, 0.9, 0)]);
        for round in 0..5u64 {
            let base = 1000 * (round + 1);
            tracker.update(base, &[]);
            tracker.update(base + 100, &[]);
            let ts = base + 200;
            let snap = tracker.update(ts, &[ranged("hotspot", 300.0, 100.0, 4.0, 0.9, ts)]);
            assert_eq!(snap.len(), 1);
            assert_eq!(snap[0].consecutive_misses(), 0);
        }
    }

    #[test]
    fn contested_gate_goes_to_most_confident_detection() {
        let mut tracker = tracker();
        let snap = tracker.update(0, &[ranged("hotspot", 300.0, 100.0, 4.0, 0.9, 0)]);
        let original = snap[0].target_id();

        // The nearer detection is less confident; the confident one keeps the track.
        let near_weak = ranged("hotspot", 305.0, 100.0, 4.0, 0.4, 100);
        let far_strong = ranged("hotspot", 340.0, 100.0, 3.0, 0.95, 100);
        let snap = tracker.update(100, &[near_weak, far_strong]);
        assert_eq!(snap.len(), 2);
        let kept = tracker.get(original).unwrap();
        assert_eq!(kept.last_confidence(), 0.95);
        assert_eq!(kept.frames_seen_consecutively(), 2);
        assert_eq!(tracker.stats().ambiguities_resolved, 1);
    }

    #[test]
    fn equidistant_targets_favor_oldest_track() {
        let mut tracker = tracker();
        tracker.update(0, &[ranged("hotspot", 200.0, 40.0, 9.0, 0.9, 0)]);
        tracker.update(100, &[
            ranged("hotspot", 200.0, 40.0, 9.0, 0.9, 100),
            ranged("hotspot", 300.0, 40.0, 9.0, 0.9, 100),
        ]);
        let older = 1;
        let younger = 2;
        assert!(tracker.get(younger).is_some());

        // A lone detection exactly halfway between both tracks.
        let snap = tracker.update(200, &[ranged("hotspot", 250.0, 40.0, 9.0, 0.9, 200)]);
        let older_target = snap.iter().find(|t| t.target_id() == older).unwrap();
        let younger_target = snap.iter().find(|t| t.target_id() == younger).unwrap();
        assert_eq!(older_target.consecutive_misses(), 0);
        assert_eq!(younger_target.consecutive_misses(), 1);
    }

    #[test]
    fn rejects_invalid_smoothing_factor() {
        assert!(HotspotTracker::new(TrackerConfig {
            smoothing_factor: 0.0,
            ..TrackerConfig::default()
        })
        .is_err());
        assert!(HotspotTracker::new(TrackerConfig {
            smoothing_factor: 1.5,
            ..TrackerConfig::default()
        })
        .is_err());
    }
}
