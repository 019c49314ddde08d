//! Release and collision decisions.
//!
//! Two independent machines read the same tracker snapshots. Each exposes a
//! pure `transition` function so every state/input pair can be tested without
//! the rest of the pipeline.

pub mod collision;
pub mod payload;

pub use collision::{CollisionMachine, CollisionState, CollisionStep, CollisionThresholds};
pub use payload::{DropWindow, PayloadInput, PayloadMachine, PayloadState};
