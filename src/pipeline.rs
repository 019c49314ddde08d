//! One decision tick per camera frame.
//!
//! detect -> range -> track -> decide -> dispatch, strictly in frame order.
//! The dispatcher's ack wait is the only blocking step and is deadline
//! bounded, so a tick always finishes before the next frame is taken.
//!
//! Fail-safe coupling between the two machines:
//! - entering ABORT queues a HALT, retried every frame while ABORT persists;
//! - leaving ABORT queues a RESUME, retried every frame until delivered;
//! - a release proposed while ABORT is held (payload stays ARMED);
//! - a release that is not acknowledged leaves the payload ARMED so the next
//!   frame tries again with the same message and sequence number; the drone
//!   may already have dropped, and it only re-acks a sequence it executed.

use std::collections::HashMap;

use anyhow::{anyhow, Result};

use crate::command::{
    CommandDeliveryError, CommandDispatcher, CommandMessage, CommandSequencer, CommandType,
    DispatchReceipt, DispatchResult, DroneLink, LinkKind, LoopbackLink, MqttLink, UdpLink,
};
use crate::config::{BackendKind, DropzoneConfig};
use crate::decision::{
    CollisionMachine, CollisionState, CollisionStep, PayloadMachine, PayloadState,
};
use crate::detect::{
    BackendRegistry, DetectorAdapter, FrameObservations, ReplayBackend, StubBackend,
};
use crate::distance::{DistanceEstimate, DistanceEstimator, InsufficientGeometry};
use crate::frame::Frame;
use crate::journal::{CommandJournal, JournalRecord};
use crate::tracker::{HotspotTracker, TargetId, TrackedTarget};

/// What one tick saw and did.
#[derive(Clone, Debug)]
pub struct TickReport {
    pub frame_timestamp_ms: u64,
    pub collision: CollisionStep,
    pub payload: PayloadState,
    pub hotspots: Vec<TrackedTarget>,
    pub obstacles: Vec<TrackedTarget>,
    pub skipped_geometry: Vec<InsufficientGeometry>,
    pub dispatched: Vec<DispatchReceipt>,
    pub delivery_failures: Vec<CommandDeliveryError>,
    /// A release was due but ABORT held it back.
    pub release_held: bool,
}

impl TickReport {
    pub fn released_target(&self) -> Option<TargetId> {
        match self.payload {
            PayloadState::Released { target_id } => Some(target_id),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub frames: u64,
    pub releases: u64,
    pub halts: u64,
    pub delivery_failures: u64,
    pub skipped_geometry: u64,
}

pub struct FramePipeline {
    adapter: DetectorAdapter,
    estimator: DistanceEstimator,
    hotspot_tracker: HotspotTracker,
    obstacle_tracker: HotspotTracker,
    payload: PayloadMachine,
    collision: CollisionMachine,
    dispatcher: CommandDispatcher,
    journal: Option<CommandJournal>,
    hotspot_classes: Vec<String>,
    last_timestamp_ms: Option<u64>,
    halt_pending: bool,
    resume_pending: bool,
    /// Releases sent but never acknowledged, by target.
    unresolved_releases: HashMap<TargetId, CommandMessage>,
    stats: PipelineStats,
}

impl FramePipeline {
    pub fn from_config(
        cfg: &DropzoneConfig,
        registry: BackendRegistry,
        link: Box<dyn DroneLink>,
    ) -> Result<Self> {
        let dispatcher =
            CommandDispatcher::new(link, cfg.dispatch_policy(), CommandSequencer::random());
        log::info!(
            "pipeline session {} over {} link (ack timeout {:?}, {} attempts)",
            dispatcher.session_id(),
            dispatcher.link_name(),
            cfg.link.ack_timeout,
            cfg.link.retry_count
        );
        Ok(Self {
            adapter: DetectorAdapter::new(registry, cfg.adapter_config()),
            estimator: DistanceEstimator::new(cfg.estimator_config())?,
            hotspot_tracker: HotspotTracker::new(cfg.tracker.clone())?,
            obstacle_tracker: HotspotTracker::new(cfg.tracker.clone())?,
            payload: PayloadMachine::new(cfg.drop_window()?),
            collision: CollisionMachine::new(cfg.collision_thresholds()?),
            dispatcher,
            journal: None,
            hotspot_classes: cfg.detector.hotspot_classes.clone(),
            last_timestamp_ms: None,
            halt_pending: false,
            resume_pending: false,
            unresolved_releases: HashMap::new(),
            stats: PipelineStats::default(),
        })
    }

    pub fn with_journal(mut self, journal: CommandJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn payload_state(&self) -> PayloadState {
        self.payload.state()
    }

    pub fn collision_state(&self) -> CollisionState {
        self.collision.state()
    }

    pub fn has_released(&self, target_id: TargetId) -> bool {
        self.payload.has_released(target_id)
    }

    pub fn hotspot_tracker(&self) -> &HotspotTracker {
        &self.hotspot_tracker
    }

    pub fn obstacle_tracker(&self) -> &HotspotTracker {
        &self.obstacle_tracker
    }

    /// Target of a release that went out but was never acknowledged.
    pub fn release_unresolved(&self, target_id: TargetId) -> bool {
        self.unresolved_releases.contains_key(&target_id)
    }

    pub fn journal(&self) -> Option<&CommandJournal> {
        self.journal.as_ref()
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    pub fn detector_exhausted(&self) -> bool {
        self.adapter.is_exhausted()
    }

    /// Run the detector on `frame` and process what it reports.
    pub fn tick(&mut self, frame: &Frame) -> Result<TickReport> {
        self.check_order(frame.timestamp_ms)?;
        let observations = self.adapter.detect(frame)?;
        self.process(observations)
    }

    /// Process already-normalized observations for one frame.
    pub fn process(&mut self, observations: FrameObservations) -> Result<TickReport> {
        let ts = observations.frame_timestamp_ms;
        self.check_order(ts)?;
        self.last_timestamp_ms = Some(ts);
        self.stats.frames += 1;

        let mut skipped_geometry = Vec::new();
        let mut hotspot_estimates: Vec<DistanceEstimate> = Vec::new();
        let mut obstacle_estimates: Vec<DistanceEstimate> = Vec::new();
        for detection in &observations.detections {
            match self.estimator.estimate_detection(detection) {
                Ok(estimate) if self.is_hotspot(&detection.class_label) => {
                    hotspot_estimates.push(estimate)
                }
                Ok(estimate) => obstacle_estimates.push(estimate),
                Err(e) => {
                    log::warn!("frame {}: {}", ts, e);
                    skipped_geometry.push(e);
                }
            }
        }
        for hand in &observations.hands {
            match self.estimator.estimate_hand(hand) {
                Ok(estimate) => obstacle_estimates.push(estimate),
                Err(e) => {
                    log::warn!("frame {}: {}", ts, e);
                    skipped_geometry.push(e);
                }
            }
        }
        self.stats.skipped_geometry += skipped_geometry.len() as u64;

        let hotspots = self.hotspot_tracker.update(ts, &hotspot_estimates);
        let obstacles = self.obstacle_tracker.update(ts, &obstacle_estimates);
        self.unresolved_releases.retain(|target_id, message| {
            let tracked = hotspots.iter().any(|t| t.target_id() == *target_id);
            if !tracked {
                log::warn!(
                    "target {} purged with release seq={} unacknowledged",
                    target_id,
                    message.sequence_number
                );
            }
            tracked
        });

        let collision = self.collision.evaluate(&obstacles);
        if collision.entered_abort() {
            self.halt_pending = true;
            self.resume_pending = false;
        } else if collision.left_abort() {
            self.halt_pending = false;
            self.resume_pending = true;
        }

        let mut dispatched = Vec::new();
        let mut delivery_failures = Vec::new();

        if self.halt_pending && collision.current == CollisionState::Abort {
            match self.send(ts, CommandType::Halt, None) {
                Ok(receipt) => {
                    self.halt_pending = false;
                    self.stats.halts += 1;
                    dispatched.push(receipt);
                }
                Err(e) => delivery_failures.push(e),
            }
        }
        if self.resume_pending && collision.current != CollisionState::Abort {
            match self.send(ts, CommandType::Resume, None) {
                Ok(receipt) => {
                    self.resume_pending = false;
                    dispatched.push(receipt);
                }
                Err(e) => delivery_failures.push(e),
            }
        }

        let mut release_held = false;
        let proposed = self.payload.propose(&hotspots);
        let next = match proposed {
            PayloadState::Released { target_id } if collision.current == CollisionState::Abort => {
                log::warn!("release of target {} held: collision ABORT", target_id);
                release_held = true;
                PayloadState::Armed { target_id }
            }
            PayloadState::Released { target_id } => match self.send_release(ts, target_id) {
                Ok(receipt) => {
                    dispatched.push(receipt);
                    self.stats.releases += 1;
                    proposed
                }
                Err(e) => {
                    delivery_failures.push(e);
                    PayloadState::Armed { target_id }
                }
            },
            other => other,
        };
        if let Err(e) = self.payload.commit(next) {
            log::error!("{}", e);
        }

        self.stats.delivery_failures += delivery_failures.len() as u64;
        Ok(TickReport {
            frame_timestamp_ms: ts,
            collision,
            payload: self.payload.state(),
            hotspots,
            obstacles,
            skipped_geometry,
            dispatched,
            delivery_failures,
            release_held,
        })
    }

    pub fn shutdown(&mut self) -> Result<()> {
        self.dispatcher.close()
    }

    fn is_hotspot(&self, class_label: &str) -> bool {
        self.hotspot_classes.iter().any(|class| class == class_label)
    }

    fn check_order(&self, timestamp_ms: u64) -> Result<()> {
        match self.last_timestamp_ms {
            Some(last) if timestamp_ms < last => Err(anyhow!(
                "frame at {}ms arrived after frame at {}ms; frames must be processed in order",
                timestamp_ms,
                last
            )),
            _ => Ok(()),
        }
    }

    fn send(
        &mut self,
        frame_timestamp_ms: u64,
        command_type: CommandType,
        target_ref: Option<TargetId>,
    ) -> DispatchResult {
        let message = self.dispatcher.issue(command_type, target_ref);
        self.deliver(frame_timestamp_ms, &message)
    }

    /// Release `target_id`, reusing the unacknowledged message from an
    /// earlier frame if there is one.
    fn send_release(&mut self, frame_timestamp_ms: u64, target_id: TargetId) -> DispatchResult {
        let message = match self.unresolved_releases.remove(&target_id) {
            Some(message) => {
                log::info!(
                    "resending release seq={} for target {}",
                    message.sequence_number,
                    target_id
                );
                message
            }
            None => self.dispatcher.issue(CommandType::ReleasePayload, Some(target_id)),
        };
        let result = self.deliver(frame_timestamp_ms, &message);
        if result.is_err() {
            self.unresolved_releases.insert(target_id, message);
        }
        result
    }

    fn deliver(&mut self, frame_timestamp_ms: u64, message: &CommandMessage) -> DispatchResult {
        let command_type = message.command_type;
        let result = self.dispatcher.dispatch(message);
        if let Ok(receipt) = &result {
            log::info!(
                "{} seq={} delivered{}",
                command_type.as_str(),
                receipt.sequence_number,
                message
                    .target_ref
                    .map(|id| format!(" for target {}", id))
                    .unwrap_or_default()
            );
        }
        if let Some(journal) = self.journal.as_mut() {
            let record = JournalRecord::from_dispatch(frame_timestamp_ms, message, &result);
            if let Err(e) = journal.record(record) {
                log::error!("failed to journal {}: {}", command_type.as_str(), e);
            }
        }
        result
    }
}

/// Build the detector registry named by the configuration.
pub fn registry_from_config(cfg: &DropzoneConfig) -> Result<BackendRegistry> {
    let mut registry = BackendRegistry::new();
    match cfg.detector.backend {
        BackendKind::Stub => registry.register(StubBackend::new()),
        BackendKind::Replay => {
            let path = cfg
                .detector
                .replay_path
                .as_deref()
                .ok_or_else(|| anyhow!("replay backend selected without replay_path"))?;
            registry.register(ReplayBackend::open(path)?);
        }
    }
    registry.warm_up_all()?;
    Ok(registry)
}

/// Open the drone link named by the configuration.
pub fn link_from_config(cfg: &DropzoneConfig, client_id: &str) -> Result<Box<dyn DroneLink>> {
    Ok(match cfg.link.kind {
        LinkKind::Loopback => Box::new(LoopbackLink::new()),
        LinkKind::Udp => Box::new(UdpLink::connect(&cfg.link.addr)?),
        LinkKind::Mqtt => Box::new(MqttLink::connect(
            &cfg.link.addr,
            &cfg.link.topic_prefix,
            client_id,
        )?),
    })
}
