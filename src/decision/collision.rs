//! Collision avoidance state machine.
//!
//! Keyed on the nearest tracked obstacle or hand. Escalation is immediate;
//! de-escalation requires clearing the threshold by the hysteresis margin.

use anyhow::{anyhow, Result};

use crate::tracker::TrackedTarget;

/// Validated thresholds. `warn_m` is always strictly greater than `abort_m`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CollisionThresholds {
    warn_m: f32,
    abort_m: f32,
    hysteresis_m: f32,
}

impl CollisionThresholds {
    pub fn new(warn_m: f32, abort_m: f32, hysteresis_m: f32) -> Result<Self> {
        if !(warn_m.is_finite() && abort_m.is_finite() && hysteresis_m.is_finite()) {
            return Err(anyhow!("collision thresholds must be finite"));
        }
        if abort_m <= 0.0 {
            return Err(anyhow!("abort threshold must be positive"));
        }
        if warn_m <= abort_m {
            return Err(anyhow!(
                "warn threshold ({}) must exceed abort threshold ({})",
                warn_m,
                abort_m
            ));
        }
        if hysteresis_m < 0.0 {
            return Err(anyhow!("hysteresis margin must not be negative"));
        }
        Ok(Self {
            warn_m,
            abort_m,
            hysteresis_m,
        })
    }

    pub fn warn_m(&self) -> f32 {
        self.warn_m
    }

    pub fn abort_m(&self) -> f32 {
        self.abort_m
    }

    pub fn hysteresis_m(&self) -> f32 {
        self.hysteresis_m
    }

    /// Distance that must be exceeded to return to `Safe`.
    pub fn safe_clearance_m(&self) -> f32 {
        self.warn_m + self.hysteresis_m
    }

    /// Distance that must be exceeded to leave `Abort`.
    pub fn abort_clearance_m(&self) -> f32 {
        self.abort_m + self.hysteresis_m
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CollisionState {
    Safe,
    Warning,
    Abort,
}

impl CollisionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Safe => "SAFE",
            Self::Warning => "WARNING",
            Self::Abort => "ABORT",
        }
    }
}

/// Pure transition function.
///
/// `nearest_m` is the minimum smoothed distance over all tracked obstacles;
/// `None` means nothing is tracked, which counts as unlimited clearance.
pub fn transition(
    state: CollisionState,
    nearest_m: Option<f32>,
    thresholds: &CollisionThresholds,
) -> CollisionState {
    use CollisionState::{Abort, Safe, Warning};

    let Some(d) = nearest_m else {
        return Safe;
    };
    if d < thresholds.abort_m {
        return Abort;
    }
    match state {
        Safe => {
            if d < thresholds.warn_m {
                Warning
            } else {
                Safe
            }
        }
        Warning => {
            if d > thresholds.safe_clearance_m() {
                Safe
            } else {
                Warning
            }
        }
        Abort => {
            if d > thresholds.safe_clearance_m() {
                Safe
            } else if d > thresholds.abort_clearance_m() {
                Warning
            } else {
                Abort
            }
        }
    }
}

/// One frame's collision evaluation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CollisionStep {
    pub previous: CollisionState,
    pub current: CollisionState,
    pub nearest_m: Option<f32>,
}

impl CollisionStep {
    pub fn entered_abort(&self) -> bool {
        self.previous != CollisionState::Abort && self.current == CollisionState::Abort
    }

    pub fn left_abort(&self) -> bool {
        self.previous == CollisionState::Abort && self.current != CollisionState::Abort
    }
}

pub struct CollisionMachine {
    thresholds: CollisionThresholds,
    state: CollisionState,
}

impl CollisionMachine {
    pub fn new(thresholds: CollisionThresholds) -> Self {
        Self {
            thresholds,
            state: CollisionState::Safe,
        }
    }

    pub fn state(&self) -> CollisionState {
        self.state
    }

    pub fn thresholds(&self) -> &CollisionThresholds {
        &self.thresholds
    }

    /// Evaluate against every tracked obstacle, coasting ones included.
    pub fn evaluate(&mut self, obstacles: &[TrackedTarget]) -> CollisionStep {
        let nearest_m = obstacles
            .iter()
            .map(|t| t.smoothed_distance_m())
            .filter(|d| d.is_finite())
            .min_by(|a, b| a.total_cmp(b));
        let previous = self.state;
        let current = transition(previous, nearest_m, &self.thresholds);
        if current != previous {
            match current {
                CollisionState::Abort => log::warn!(
                    "collision {} -> ABORT (nearest {:.2}m)",
                    previous.as_str(),
                    nearest_m.unwrap_or(f32::INFINITY)
                ),
                _ => log::info!(
                    "collision {} -> {} (nearest {})",
                    previous.as_str(),
                    current.as_str(),
                    nearest_m
                        .map(|d| format!("{:.2}m", d))
                        .unwrap_or_else(|| "none".to_string())
                ),
            }
        }
        self.state = current;
        CollisionStep {
            previous,
            current,
            nearest_m,
        }
    }
}
