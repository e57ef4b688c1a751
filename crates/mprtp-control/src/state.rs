//! # Subflow State Machine
//!
//! ```text
//!                  Distortion                      Lost
//!   NonCongested ─────────────▶ Congested ◀──── Lossy ◀──── NonCongested
//!        ▲                         │   Distortion  │
//!        └──────── Settlement ─────┴───────────────┘
//!
//!   any active state ── Late ──▶ Passive ── rejoin ──▶ NonCongested
//! ```
//!
//! Every transition carries the rate action it implies so the rate
//! controller never has to re-derive it from the pair of states.

use serde::{Deserialize, Serialize};

/// Health of one subflow. Ordered from least to most healthy so that
/// `state >= threshold` reads as "at least this healthy".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubflowState {
    /// Detached: no feedback, no traffic.
    Passive,
    Congested,
    Lossy,
    NonCongested,
}

impl SubflowState {
    pub fn is_active(self) -> bool {
        self != SubflowState::Passive
    }
}

/// Input derived once per tick from the subflow's latest feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubflowEvent {
    Distortion,
    Lost,
    Settlement,
    Late,
    NoOp,
}

/// What the bitrate controller does as a consequence of a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateAction {
    Keep,
    /// Settled while healthy: probe upward.
    Increase,
    /// Multiplicative decrease by β.
    Shrink,
    /// Decrease by the measured loss fraction.
    ShrinkByLoss,
    /// Leave congestion: restore toward the pre-congestion target.
    Restore,
    /// Detached: target drops to zero.
    Zero,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: SubflowState,
    pub to: SubflowState,
    pub event: SubflowEvent,
    pub action: RateAction,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// The transition table. Pure so it can be checked exhaustively.
pub fn transition(from: SubflowState, event: SubflowEvent) -> Transition {
    use RateAction::*;
    use SubflowEvent::*;
    use SubflowState::*;

    let (to, action) = match (from, event) {
        (Passive, _) => (Passive, Keep),
        (_, Late) => (Passive, Zero),
        (_, NoOp) => (from, Keep),

        (NonCongested, Distortion) => (Congested, Shrink),
        (NonCongested, Lost) => (Lossy, ShrinkByLoss),
        (NonCongested, Settlement) => (NonCongested, Increase),

        (Congested, Distortion) => (Congested, Shrink),
        (Congested, Lost) => (Congested, ShrinkByLoss),
        (Congested, Settlement) => (NonCongested, Restore),

        (Lossy, Distortion) => (Congested, Shrink),
        (Lossy, Lost) => (Lossy, ShrinkByLoss),
        (Lossy, Settlement) => (NonCongested, Restore),
    };
    Transition {
        from,
        to,
        event,
        action,
    }
}

/// Holds one subflow's state. The field is private: it moves only through
/// [`transition`] or an explicit [`rejoin`](Self::rejoin).
#[derive(Debug, Clone)]
pub struct SubflowStateMachine {
    state: SubflowState,
    transitions: u64,
}

impl Default for SubflowStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SubflowStateMachine {
    pub fn new() -> Self {
        Self {
            state: SubflowState::NonCongested,
            transitions: 0,
        }
    }

    pub fn state(&self) -> SubflowState {
        self.state
    }

    /// Number of state changes so far.
    pub fn transitions(&self) -> u64 {
        self.transitions
    }

    pub fn fire(&mut self, event: SubflowEvent) -> Transition {
        let t = transition(self.state, event);
        if t.changed() {
            self.transitions += 1;
        }
        self.state = t.to;
        t
    }

    /// External re-join of a passive subflow. Returns `false` (and does
    /// nothing) if the subflow is not passive.
    pub fn rejoin(&mut self) -> bool {
        if self.state != SubflowState::Passive {
            return false;
        }
        self.state = SubflowState::NonCongested;
        self.transitions += 1;
        true
    }
}
