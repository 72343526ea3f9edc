// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Gossip-level (SWIM) node state: incarnation numbers and the
//! Alive/Suspect/Dead/Left state used by the failure detector. This is
//! distinct from the overlay [`super::Status`], which the Serf layer derives
//! from intents and memberlist callbacks.

use serde::{Deserialize, Serialize};
use std::time::Instant;

/// SWIM-level liveness state of a peer, as seen by the local failure
/// detector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    Alive,
    Suspect,
    Dead,
    Left,
}

/// Per-peer gossip state: incarnation plus the SWIM state machine.
#[derive(Clone, Debug)]
pub struct NodeState {
    pub incarnation: u32,
    pub state: State,
    #[cfg_attr(not(test), allow(dead_code))]
    pub state_change: Instant,
}

impl NodeState {
    pub fn alive(incarnation: u32) -> Self {
        Self::with_state(incarnation, State::Alive)
    }

    /// Builds a `NodeState` starting in an arbitrary SWIM state, for a member
    /// first learned about via push/pull anti-entropy while already
    /// `Suspect`/`Dead`/`Left` rather than `Alive`.
    pub fn with_state(incarnation: u32, state: State) -> Self {
        Self {
            incarnation,
            state,
            state_change: Instant::now(),
        }
    }

    fn set(&mut self, state: State) {
        self.state = state;
        self.state_change = Instant::now();
    }

    /// Applies the six-row transition table from the gossip engine spec.
    /// Returns `true` if a broadcast should be generated (every row in the
    /// table results in one, so this always returns `true` when the
    /// transition is accepted and `false` when the rumor is stale).
    ///
    /// `is_self` must be `true` only when this `NodeState` belongs to the
    /// local node; the caller is responsible for performing the refutation
    /// incarnation bump separately (see [`crate::gossip::refute`]).
    pub fn apply_alive(&mut self, incarnation: u32) -> bool {
        if incarnation > self.incarnation || (incarnation >= self.incarnation && self.state != State::Alive) {
            self.incarnation = incarnation.max(self.incarnation);
            self.set(State::Alive);
            true
        } else {
            false
        }
    }

    pub fn apply_suspect(&mut self, incarnation: u32, is_self: bool) -> bool {
        if is_self {
            return false;
        }
        match self.state {
            State::Alive if incarnation >= self.incarnation => {
                self.incarnation = incarnation;
                self.set(State::Suspect);
                true
            }
            _ => false,
        }
    }

    pub fn apply_dead(&mut self, incarnation: u32) -> bool {
        match self.state {
            State::Suspect if incarnation >= self.incarnation => {
                self.incarnation = incarnation;
                self.set(State::Dead);
                true
            }
            _ => false,
        }
    }

    /// The suspicion timer for this peer fired with no refutation.
    pub fn expire_suspicion(&mut self) -> bool {
        if self.state == State::Suspect {
            self.set(State::Dead);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alive_refutes_suspect() {
        let mut ns = NodeState::alive(1);
        assert!(ns.apply_suspect(1, false));
        assert_eq!(ns.state, State::Suspect);
        assert!(ns.apply_alive(2));
        assert_eq!(ns.state, State::Alive);
        assert_eq!(ns.incarnation, 2);
    }

    #[test]
    fn stale_alive_is_ignored() {
        let mut ns = NodeState::alive(5);
        assert!(!ns.apply_alive(3));
        assert_eq!(ns.incarnation, 5);
    }

    #[test]
    fn suspect_never_applies_to_self() {
        let mut ns = NodeState::alive(1);
        assert!(!ns.apply_suspect(1, true));
        assert_eq!(ns.state, State::Alive);
    }

    #[test]
    fn suspicion_expires_to_dead() {
        let mut ns = NodeState::alive(1);
        assert!(ns.apply_suspect(1, false));
        assert!(ns.expire_suspicion());
        assert_eq!(ns.state, State::Dead);
    }
}
