use dropzone_kernel::command::{CommandType, LoopbackFaults, LoopbackHandle, LoopbackLink};
use dropzone_kernel::config::DropzoneConfig;
use dropzone_kernel::detect::{
    BackendRegistry, BoundingBox, Detection, FrameObservations, HandLandmarkSet, Landmark,
    StubBackend,
};
use dropzone_kernel::journal::DispatchOutcome;
use dropzone_kernel::{CollisionState, CommandJournal, FramePipeline, PayloadState, TickReport};

const FRAME_MS: u64 = 100;

struct Harness {
    pipeline: FramePipeline,
    link: LoopbackHandle,
    ts: u64,
}

impl Harness {
    fn new() -> Self {
        let cfg = DropzoneConfig::from_toml_str("[link]\nack_timeout_ms = 5\nretry_count = 3")
            .expect("config");
        let link = LoopbackLink::new();
        let handle = link.handle();
        let mut registry = BackendRegistry::new();
        registry.register(StubBackend::new());
        let pipeline = FramePipeline::from_config(&cfg, registry, Box::new(link))
            .expect("pipeline")
            .with_journal(CommandJournal::new());
        Self {
            pipeline,
            link: handle,
            ts: 0,
        }
    }

    fn frame(&mut self, detections: Vec<Detection>, hands: Vec<HandLandmarkSet>) -> TickReport {
        self.ts += FRAME_MS;
        let ts = self.ts;
        let detections = detections
            .into_iter()
            .map(|mut d| {
                d.frame_timestamp_ms = ts;
                d
            })
            .collect();
        self.pipeline
            .process(FrameObservations {
                frame_timestamp_ms: ts,
                detections,
                hands,
            })
            .expect("tick")
    }

    fn executed(&self, command_type: CommandType) -> usize {
        self.link
            .executed()
            .unwrap()
            .iter()
            .filter(|m| m.command_type == command_type)
            .count()
    }

    fn releases(&self) -> Vec<u64> {
        self.link
            .executed()
            .unwrap()
            .iter()
            .filter(|m| m.command_type == CommandType::ReleasePayload)
            .map(|m| m.sequence_number)
            .collect()
    }

    fn drop_acks(&self, count: u32) {
        self.link
            .set_faults(LoopbackFaults {
                drop_next_acks: count,
                ..LoopbackFaults::default()
            })
            .unwrap();
    }

    fn silence_link(&self, silent: bool) {
        self.link
            .set_faults(LoopbackFaults {
                silent,
                ..LoopbackFaults::default()
            })
            .unwrap();
    }
}

/// Square box `width` pixels wide; with the default 0.5 m / 800 px
/// calibration it ranges to `400 / width` meters.
fn object(class: &str, x: f32, width: f32) -> Detection {
    Detection {
        class_label: class.to_string(),
        confidence: 0.9,
        bbox: BoundingBox::new(x, 100.0, x + width, 100.0 + width),
        frame_timestamp_ms: 0,
    }
}

fn hotspot_at_4m() -> Detection {
    object("hotspot", 100.0, 100.0)
}

fn person_at_half_meter() -> Detection {
    object("person", 0.0, 800.0)
}

#[test]
fn stable_hotspot_in_window_is_released_once() {
    let mut h = Harness::new();
    let mut states = Vec::new();
    for _ in 0..5 {
        let report = h.frame(vec![hotspot_at_4m()], Vec::new());
        states.push(report.payload);
    }
    let target_id = match states[4] {
        PayloadState::Released { target_id } => target_id,
        other => panic!("expected release on frame 5, got {:?}", other),
    };
    assert_eq!(states[0], PayloadState::Searching);
    assert_eq!(states[2], PayloadState::Searching);
    assert_eq!(states[3], PayloadState::Armed { target_id });

    for _ in 0..50 {
        let report = h.frame(vec![hotspot_at_4m()], Vec::new());
        assert_eq!(report.payload, PayloadState::Searching);
        assert!(report.released_target().is_none());
    }
    assert!(h.pipeline.has_released(target_id));
    assert_eq!(h.executed(CommandType::ReleasePayload), 1);
}

#[test]
fn lost_lock_returns_to_searching_after_miss_limit() {
    let mut h = Harness::new();
    // 8 m: locked but outside the drop window.
    for _ in 0..5 {
        h.frame(vec![object("hotspot", 100.0, 50.0)], Vec::new());
    }
    let armed = h.pipeline.payload_state();
    assert!(matches!(armed, PayloadState::Armed { .. }));

    for miss in 1..=10 {
        let report = h.frame(Vec::new(), Vec::new());
        assert_eq!(report.payload, armed, "disarmed early on miss {}", miss);
        assert_eq!(report.hotspots.len(), 1);
    }
    let report = h.frame(Vec::new(), Vec::new());
    assert!(report.hotspots.is_empty());
    assert_eq!(report.payload, PayloadState::Searching);
    assert_eq!(h.executed(CommandType::ReleasePayload), 0);
}

#[test]
fn unacknowledged_release_stays_armed_and_retries() {
    let mut h = Harness::new();
    for _ in 0..4 {
        h.frame(vec![hotspot_at_4m()], Vec::new());
    }
    let target_id = h.pipeline.payload_state().target_id().unwrap();

    h.silence_link(true);
    let report = h.frame(vec![hotspot_at_4m()], Vec::new());
    assert_eq!(report.delivery_failures.len(), 1);
    let failure = &report.delivery_failures[0];
    assert_eq!(failure.command_type, CommandType::ReleasePayload);
    assert_eq!(failure.attempts, 3);
    assert_eq!(failure.target_ref, Some(target_id));
    assert_eq!(report.payload, PayloadState::Armed { target_id });
    assert!(!h.pipeline.has_released(target_id));

    h.silence_link(false);
    let report = h.frame(vec![hotspot_at_4m()], Vec::new());
    assert_eq!(report.payload, PayloadState::Released { target_id });

    let journal = h.pipeline.journal().unwrap();
    journal.verify().unwrap();
    let outcomes: Vec<&DispatchOutcome> =
        journal.entries().iter().map(|e| &e.record.outcome).collect();
    assert!(matches!(outcomes[0], DispatchOutcome::Failed { attempts: 3, .. }));
    assert!(matches!(outcomes[1], DispatchOutcome::Delivered { attempts: 1 }));
    let sequences: Vec<u64> = journal
        .entries()
        .iter()
        .map(|e| e.record.sequence_number)
        .collect();
    assert_eq!(sequences[0], sequences[1]);
    assert_eq!(h.releases(), vec![sequences[0]]);
}

#[test]
fn executed_release_with_lost_acks_drops_only_once() {
    let mut h = Harness::new();
    for _ in 0..4 {
        h.frame(vec![hotspot_at_4m()], Vec::new());
    }
    let target_id = h.pipeline.payload_state().target_id().unwrap();

    // The drone executes the drop but every ack of this dispatch is lost.
    h.drop_acks(3);
    let report = h.frame(vec![hotspot_at_4m()], Vec::new());
    assert_eq!(report.delivery_failures.len(), 1);
    assert_eq!(report.payload, PayloadState::Armed { target_id });
    assert!(h.pipeline.release_unresolved(target_id));
    assert_eq!(h.releases().len(), 1);

    let report = h.frame(vec![hotspot_at_4m()], Vec::new());
    assert_eq!(report.payload, PayloadState::Released { target_id });
    assert!(!h.pipeline.release_unresolved(target_id));
    assert_eq!(report.dispatched.len(), 1);
    assert_eq!(h.releases(), vec![report.dispatched[0].sequence_number]);

    for _ in 0..20 {
        h.frame(vec![hotspot_at_4m()], Vec::new());
    }
    assert_eq!(h.releases().len(), 1);
    assert_eq!(h.link.duplicates().unwrap(), 3);
}

#[test]
fn unacked_release_is_reacked_after_halt_and_resume() {
    let mut h = Harness::new();
    for _ in 0..4 {
        h.frame(vec![hotspot_at_4m()], Vec::new());
    }
    let target_id = h.pipeline.payload_state().target_id().unwrap();
    h.drop_acks(3);
    h.frame(vec![hotspot_at_4m()], Vec::new());
    assert!(h.pipeline.release_unresolved(target_id));

    // An obstacle forces HALT and later RESUME with newer sequence numbers.
    let report = h.frame(vec![hotspot_at_4m(), person_at_half_meter()], Vec::new());
    assert_eq!(report.collision.current, CollisionState::Abort);
    assert!(report.release_held);

    let mut released = false;
    for _ in 0..15 {
        let report = h.frame(vec![hotspot_at_4m()], Vec::new());
        if report.released_target() == Some(target_id) {
            released = true;
            break;
        }
    }
    assert!(released);
    assert_eq!(h.releases().len(), 1);
    let order: Vec<CommandType> = h
        .link
        .executed()
        .unwrap()
        .iter()
        .map(|m| m.command_type)
        .collect();
    assert_eq!(order, vec![CommandType::ReleasePayload, CommandType::Halt, CommandType::Resume]);
}

#[test]
fn release_is_held_while_collision_abort() {
    let mut h = Harness::new();
    let mut held = false;
    for _ in 0..6 {
        let report = h.frame(vec![hotspot_at_4m(), person_at_half_meter()], Vec::new());
        assert_eq!(report.collision.current, CollisionState::Abort);
        assert!(report.released_target().is_none());
        held |= report.release_held;
    }
    assert!(held);
    assert!(matches!(h.pipeline.payload_state(), PayloadState::Armed { .. }));
    assert_eq!(h.executed(CommandType::Halt), 1);

    // The obstacle leaves; it coasts until purged, then the release goes out.
    let mut released = None;
    for _ in 0..15 {
        let report = h.frame(vec![hotspot_at_4m()], Vec::new());
        if let Some(target_id) = report.released_target() {
            assert_ne!(report.collision.current, CollisionState::Abort);
            released = Some(target_id);
            break;
        }
    }
    assert!(released.is_some());
    let order: Vec<CommandType> = h
        .link
        .executed()
        .unwrap()
        .iter()
        .map(|m| m.command_type)
        .collect();
    assert_eq!(order, vec![CommandType::Halt, CommandType::Resume, CommandType::ReleasePayload]);
}

#[test]
fn nearest_to_window_center_wins_among_armed_targets() {
    let mut h = Harness::new();
    // 4.0 m sits on the window center; 3.2 m is in the window but off-center.
    let centered = object("hotspot", 100.0, 100.0);
    let off_center = object("hotspot", 400.0, 125.0);
    let mut first_release = None;
    for _ in 0..6 {
        let report = h.frame(vec![off_center.clone(), centered.clone()], Vec::new());
        if let Some(target_id) = report.released_target() {
            first_release = Some((target_id, report.hotspots.clone()));
            break;
        }
    }
    let (target_id, hotspots) = first_release.expect("a release");
    let released = hotspots
        .iter()
        .find(|t| t.target_id() == target_id)
        .unwrap();
    assert!((released.smoothed_distance_m() - 4.0).abs() < 1e-3);

    // The second target still gets its own, single release afterwards.
    for _ in 0..10 {
        h.frame(vec![off_center.clone(), centered.clone()], Vec::new());
    }
    assert_eq!(h.executed(CommandType::ReleasePayload), 2);
}

#[test]
fn close_hand_triggers_abort() {
    let mut h = Harness::new();
    // Landmarks spread over 136 px of a 640 px frame: 0.085 m * 800 / 136 = 0.5 m.
    let span = 136.0 / 640.0;
    let landmarks = (0..21)
        .map(|i| Landmark {
            x: 0.3 + span * i as f32 / 20.0,
            y: 0.5,
            z: 0.0,
        })
        .collect();
    let ts = h.ts + FRAME_MS;
    let hand = HandLandmarkSet::new(landmarks, 0.9, 640, 480, ts).unwrap();
    let report = h.frame(Vec::new(), vec![hand]);
    assert_eq!(report.obstacles.len(), 1);
    assert!((report.obstacles[0].smoothed_distance_m() - 0.5).abs() < 0.01);
    assert_eq!(report.collision.current, CollisionState::Abort);
    assert_eq!(h.executed(CommandType::Halt), 1);
}

#[test]
fn degenerate_geometry_counts_as_a_miss() {
    let mut h = Harness::new();
    for _ in 0..3 {
        h.frame(vec![hotspot_at_4m()], Vec::new());
    }
    // A 2 px sliver at the same spot cannot be ranged.
    let report = h.frame(vec![object("hotspot", 149.0, 2.0)], Vec::new());
    assert_eq!(report.skipped_geometry.len(), 1);
    assert_eq!(report.hotspots.len(), 1);
    assert_eq!(report.hotspots[0].consecutive_misses(), 1);
    assert!(!report.hotspots[0].is_locked());
}
