//! Payload release state machine.
//!
//! `Searching -> Armed -> Released -> Searching`. `Released` lasts one frame
//! and is recorded in a per-session ledger, so a target id can be released at
//! most once no matter how long it stays in view.

use anyhow::{anyhow, Result};
use std::collections::BTreeSet;

use crate::tracker::{TargetId, TrackedTarget};

/// Distance band in which a release is allowed.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DropWindow {
    min_m: f32,
    max_m: f32,
}

impl DropWindow {
    pub fn new(min_m: f32, max_m: f32) -> Result<Self> {
        if !(min_m.is_finite() && max_m.is_finite()) {
            return Err(anyhow!("drop window bounds must be finite"));
        }
        if min_m < 0.0 {
            return Err(anyhow!("drop_min_m must not be negative"));
        }
        if min_m >= max_m {
            return Err(anyhow!(
                "drop_min_m ({}) must be less than drop_max_m ({})",
                min_m,
                max_m
            ));
        }
        Ok(Self { min_m, max_m })
    }

    pub fn min_m(&self) -> f32 {
        self.min_m
    }

    pub fn max_m(&self) -> f32 {
        self.max_m
    }

    pub fn center_m(&self) -> f32 {
        (self.min_m + self.max_m) * 0.5
    }

    pub fn contains(&self, distance_m: f32) -> bool {
        distance_m >= self.min_m && distance_m <= self.max_m
    }

    /// How far a distance is from the ideal drop point.
    pub fn offset_from_center(&self, distance_m: f32) -> f32 {
        (distance_m - self.center_m()).abs()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PayloadState {
    Searching,
    Armed { target_id: TargetId },
    Released { target_id: TargetId },
}

impl PayloadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Searching => "SEARCHING",
            Self::Armed { .. } => "ARMED",
            Self::Released { .. } => "RELEASED",
        }
    }

    pub fn target_id(&self) -> Option<TargetId> {
        match self {
            Self::Searching => None,
            Self::Armed { target_id } | Self::Released { target_id } => Some(*target_id),
        }
    }
}

/// What the payload machine sees in one frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PayloadInput {
    /// No eligible target (none locked, or the armed target was purged).
    NoCandidate,
    /// The highest-priority eligible target.
    Candidate {
        target_id: TargetId,
        locked: bool,
        in_window: bool,
    },
}

/// Pure transition function.
pub fn transition(state: PayloadState, input: PayloadInput) -> PayloadState {
    use PayloadInput::{Candidate, NoCandidate};
    use PayloadState::{Armed, Released, Searching};

    match (state, input) {
        (Searching, NoCandidate) => Searching,
        (Searching, Candidate { target_id, locked, .. }) => {
            if locked {
                Armed { target_id }
            } else {
                Searching
            }
        }
        (Armed { .. }, NoCandidate) => Searching,
        (
            Armed { target_id: armed },
            Candidate {
                target_id,
                locked,
                in_window,
            },
        ) => {
            if target_id == armed {
                if locked && in_window {
                    Released { target_id }
                } else {
                    Armed { target_id }
                }
            } else if locked {
                Armed { target_id }
            } else {
                Searching
            }
        }
        (Released { .. }, _) => Searching,
    }
}

pub struct PayloadMachine {
    window: DropWindow,
    state: PayloadState,
    released: BTreeSet<TargetId>,
}

impl PayloadMachine {
    pub fn new(window: DropWindow) -> Self {
        Self {
            window,
            state: PayloadState::Searching,
            released: BTreeSet::new(),
        }
    }

    pub fn state(&self) -> PayloadState {
        self.state
    }

    pub fn window(&self) -> DropWindow {
        self.window
    }

    pub fn has_released(&self, target_id: TargetId) -> bool {
        self.released.contains(&target_id)
    }

    pub fn released_count(&self) -> usize {
        self.released.len()
    }

    /// Pick the target this frame is about.
    ///
    /// Eligible: never released, and either locked or the currently armed
    /// target while it is still tracked. Priority goes to the smallest offset
    /// from the drop-window center, then the lowest id.
    pub fn select(&self, hotspots: &[TrackedTarget]) -> PayloadInput {
        let armed = match self.state {
            PayloadState::Armed { target_id } => Some(target_id),
            _ => None,
        };
        hotspots
            .iter()
            .filter(|t| !self.released.contains(&t.target_id()))
            .filter(|t| t.is_locked() || Some(t.target_id()) == armed)
            .min_by(|a, b| {
                let oa = self.window.offset_from_center(a.smoothed_distance_m());
                let ob = self.window.offset_from_center(b.smoothed_distance_m());
                oa.total_cmp(&ob)
                    .then_with(|| a.target_id().cmp(&b.target_id()))
            })
            .map(|t| PayloadInput::Candidate {
                target_id: t.target_id(),
                locked: t.is_locked(),
                in_window: self.window.contains(t.smoothed_distance_m()),
            })
            .unwrap_or(PayloadInput::NoCandidate)
    }

    /// Next state for this frame, not yet applied.
    pub fn propose(&self, hotspots: &[TrackedTarget]) -> PayloadState {
        transition(self.state, self.select(hotspots))
    }

    /// Apply a state. A second release of the same target is refused and the
    /// machine falls back to `Searching`.
    pub fn commit(&mut self, next: PayloadState) -> Result<()> {
        if let PayloadState::Released { target_id } = next {
            if !self.released.insert(target_id) {
                self.state = PayloadState::Searching;
                return Err(anyhow!(
                    "target {} already released; refusing a second release",
                    target_id
                ));
            }
        }
        if self.state != next {
            log::info!(
                "payload {} -> {}{}",
                self.state.as_str(),
                next.as_str(),
                next.target_id()
                    .map(|id| format!(" (target {})", id))
                    .unwrap_or_default()
            );
        }
        self.state = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use PayloadInput::{Candidate, NoCandidate};
    use PayloadState::{Armed, Released, Searching};

    fn candidate(target_id: TargetId, locked: bool, in_window: bool) -> PayloadInput {
        Candidate {
            target_id,
            locked,
            in_window,
        }
    }

    #[test]
    fn window_validation() {
        assert!(DropWindow::new(3.0, 5.0).is_ok());
        assert!(DropWindow::new(5.0, 5.0).is_err());
        assert!(DropWindow::new(6.0, 5.0).is_err());
        assert!(DropWindow::new(-1.0, 5.0).is_err());
        let window = DropWindow::new(3.0, 5.0).unwrap();
        assert_eq!(window.center_m(), 4.0);
        assert!(window.contains(3.0) && window.contains(5.0) && window.contains(4.0));
        assert!(!window.contains(2.99) && !window.contains(5.01));
    }

    #[test]
    fn searching_transitions() {
        assert_eq!(transition(Searching, NoCandidate), Searching);
        assert_eq!(transition(Searching, candidate(1, false, true)), Searching);
        assert_eq!(transition(Searching, candidate(1, true, false)), Armed { target_id: 1 });
        // Arming always takes a frame, even inside the window.
        assert_eq!(transition(Searching, candidate(1, true, true)), Armed { target_id: 1 });
    }

    #[test]
    fn armed_transitions() {
        let armed = Armed { target_id: 1 };
        assert_eq!(transition(armed, NoCandidate), Searching);
        assert_eq!(transition(armed, candidate(1, true, true)), Released { target_id: 1 });
        assert_eq!(transition(armed, candidate(1, true, false)), armed);
        assert_eq!(transition(armed, candidate(1, false, true)), armed);
        assert_eq!(transition(armed, candidate(1, false, false)), armed);
        assert_eq!(transition(armed, candidate(2, true, true)), Armed { target_id: 2 });
        assert_eq!(transition(armed, candidate(2, false, true)), Searching);
    }

    #[test]
    fn released_always_returns_to_searching() {
        let released = Released { target_id: 1 };
        assert_eq!(transition(released, NoCandidate), Searching);
        assert_eq!(transition(released, candidate(1, true, true)), Searching);
        assert_eq!(transition(released, candidate(2, true, true)), Searching);
    }

    #[test]
    fn commit_refuses_second_release() {
        let mut machine = PayloadMachine::new(DropWindow::new(3.0, 5.0).unwrap());
        machine.commit(Armed { target_id: 4 }).unwrap();
        machine.commit(Released { target_id: 4 }).unwrap();
        assert!(machine.has_released(4));
        assert!(machine.commit(Released { target_id: 4 }).is_err());
        assert_eq!(machine.state(), Searching);
        assert_eq!(machine.released_count(), 1);
    }

    #[test]
    fn state_names() {
        assert_eq!(Searching.as_str(), "SEARCHING");
        assert_eq!(Armed { target_id: 1 }.as_str(), "ARMED");
        assert_eq!(Released { target_id: 1 }.target_id(), Some(1));
        assert_eq!(Searching.target_id(), None);
    }
}
