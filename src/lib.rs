//! Dropzone decision kernel
//!
//! Turns per-frame camera detections into two drone decisions: a collision
//! guard (SAFE / WARNING / ABORT, with HALT and RESUME commands) and a payload
//! release on stable ground hotspots (SEARCHING / ARMED / RELEASED, with an
//! acknowledged RELEASE_PAYLOAD command).
//!
//! # Guarantees
//!
//! 1. **Frame order**: frames are processed one tick at a time, in timestamp
//!    order; no decision state is shared between ticks running concurrently.
//! 2. **At-most-once release**: a target id is released at most once for the
//!    whole session.
//! 3. **No silent command loss**: an unacknowledged command surfaces as a
//!    `CommandDeliveryError`; a failed release leaves the payload ARMED.
//! 4. **Tracker ownership**: tracked targets are created and mutated only by
//!    the tracker; decisions read snapshots.
//!
//! # Module Structure
//!
//! - `frame`: frames and the synthetic frame source
//! - `detect`: detector backends, registry, and adapter
//! - `distance`: pinhole ranging and focal calibration
//! - `tracker`: cross-frame association, smoothing, lock-on
//! - `decision`: payload and collision state machines
//! - `command`: wire format, drone links, acknowledged dispatch
//! - `journal`: hash-chained dispatch record
//! - `pipeline`: the per-frame tick tying it all together

use std::time::{SystemTime, UNIX_EPOCH};

pub mod command;
pub mod config;
pub mod decision;
pub mod detect;
pub mod distance;
pub mod frame;
pub mod journal;
pub mod pipeline;
pub mod tracker;

pub use command::{
    CommandDeliveryError, CommandDispatcher, CommandMessage, CommandType, DispatchPolicy,
    DispatchReceipt, DispatchResult, DroneLink,
};
pub use config::DropzoneConfig;
pub use decision::{CollisionState, PayloadState};
pub use detect::{BoundingBox, Detection, HandLandmarkSet};
pub use distance::{DistanceEstimate, DistanceEstimator, InsufficientGeometry};
pub use frame::{Frame, SyntheticFrameSource};
pub use journal::CommandJournal;
pub use pipeline::{FramePipeline, TickReport};
pub use tracker::{HotspotTracker, TargetId, TrackedTarget};

/// Wall-clock milliseconds since the Unix epoch (0 if the clock is before it).
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
