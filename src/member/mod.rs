// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Overlay membership: node identity, per-member status, and the Serf-level
//! state machine that arbitrates intents against authoritative memberlist
//! notifications. See [`crate::gossip::node_state`] for the gossip-level
//! (SWIM) state, which is a separate, lower-level notion of aliveness.

pub mod node_state;
pub mod suspicion;
pub mod table;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::SystemTime;

/// Transport-level identity of a node: a cluster-unique name, network
/// address, opaque metadata, and the protocol/delegate version triple it
/// advertises.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub addr: SocketAddr,
    /// Opaque metadata, at most 512 bytes once encoded. Carries the
    /// encoded [`Tags`](type@Tags) for Serf-layer nodes.
    pub meta: Vec<u8>,
    /// `[protocol_min, protocol_max, protocol_cur, delegate_min, delegate_max, delegate_cur]`
    pub vsn: [u8; 6],
}

/// Maximum encoded length of [`Node::meta`], per the wire contract.
pub const MAX_META_LEN: usize = 512;

impl Node {
    pub fn new(name: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            addr,
            meta: Vec::new(),
            vsn: [0; 6],
        }
    }
}

/// String-to-string tags, encoded into [`Node::meta`] for transmission.
pub type Tags = BTreeMap<String, String>;

/// Overlay-visible status of a member. Distinct from the gossip-level
/// [`node_state::NodeState::state`], which tracks direct SWIM aliveness.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    /// Known only by name; no intent or memberlist event has confirmed it.
    None,
    Alive,
    /// A leave intent has been accepted; still reachable, winding down.
    Leaving,
    /// Left gracefully and confirmed by the memberlist.
    Left,
    /// Presumed dead by the failure detector.
    Failed,
}

impl Default for Status {
    fn default() -> Self {
        Status::None
    }
}

/// Overlay identity and state of a cluster member.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemberInfo {
    pub node: Node,
    pub tags: Tags,
    pub status: Status,
    /// Lamport time of the last intent that touched `status`, monotonic
    /// even across rejected transitions (invariant 1).
    pub status_ltime: u64,
    /// Wall-clock time this member entered `Left`/`Failed`, used by the
    /// reaper to decide when to forget it.
    #[serde(skip, default = "SystemTime::now")]
    pub wall_clock_time: SystemTime,
}

impl MemberInfo {
    pub fn new(node: Node) -> Self {
        Self {
            node,
            tags: Tags::new(),
            status: Status::Alive,
            status_ltime: 0,
            wall_clock_time: SystemTime::now(),
        }
    }
}

/// Outcome of applying a transition to a member's state machine. A tagged
/// result rather than an exception, per the "tagged variants, not
/// inheritance" design note.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// `status` changed as a result of this transition.
    StateChanged,
    /// `status_ltime` advanced but `status` itself did not change.
    LTimeUpdated,
    /// Neither `status` nor `status_ltime` changed.
    NoChange,
    /// The transition was rejected outright (stale Lamport time).
    Rejected,
}

impl MemberInfo {
    /// Applies a join intent with Lamport time `t`.
    ///
    /// Implements the anti-resurrection rule (invariant 2): a member in
    /// `Left` or `Failed` never becomes `Alive` via an intent, only via
    /// [`Self::on_memberlist_join`].
    pub fn join_intent(&mut self, t: u64) -> Outcome {
        if t <= self.status_ltime {
            return Outcome::Rejected;
        }
        self.status_ltime = t;

        match self.status {
            Status::Left | Status::Failed => Outcome::LTimeUpdated,
            Status::Leaving => {
                self.status = Status::Alive;
                Outcome::StateChanged
            }
            Status::Alive | Status::None => Outcome::LTimeUpdated,
        }
    }

    /// Applies a leave intent with Lamport time `t`.
    pub fn leave_intent(&mut self, t: u64) -> Outcome {
        if t <= self.status_ltime {
            return Outcome::Rejected;
        }
        self.status_ltime = t;

        match self.status {
            Status::Alive => {
                self.status = Status::Leaving;
                Outcome::StateChanged
            }
            Status::Failed => {
                self.status = Status::Left;
                self.wall_clock_time = SystemTime::now();
                Outcome::StateChanged
            }
            Status::Left | Status::Leaving => Outcome::LTimeUpdated,
            Status::None => Outcome::LTimeUpdated,
        }
    }

    /// Authoritative transition from a memberlist join notification. This is
    /// the *only* path that can bring a `Left`/`Failed` member back to
    /// `Alive` (invariant 2).
    pub fn on_memberlist_join(&mut self) -> Outcome {
        let changed = !matches!(self.status, Status::Alive);
        self.status = Status::Alive;
        if changed {
            Outcome::StateChanged
        } else {
            Outcome::NoChange
        }
    }

    /// Authoritative transition from a memberlist leave notification.
    pub fn on_memberlist_leave(&mut self, is_dead: bool) -> Outcome {
        let new_status = if is_dead { Status::Failed } else { Status::Left };
        let changed = self.status != new_status;
        self.status = new_status;
        if changed {
            self.wall_clock_time = SystemTime::now();
            Outcome::StateChanged
        } else {
            Outcome::NoChange
        }
    }

    /// Completes a graceful leave after `LeavePropagateDelay` has elapsed.
    pub fn on_leave_complete(&mut self) -> Outcome {
        if self.status == Status::Leaving {
            self.status = Status::Left;
            self.wall_clock_time = SystemTime::now();
            Outcome::StateChanged
        } else {
            Outcome::NoChange
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

    fn member() -> MemberInfo {
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 7946));
        MemberInfo::new(Node::new("a", addr))
    }

    #[test]
    fn ltime_monotonic_even_when_rejected() {
        let mut m = member();
        assert_eq!(m.join_intent(5), Outcome::LTimeUpdated);
        assert_eq!(m.status_ltime, 5);
        assert_eq!(m.join_intent(3), Outcome::Rejected);
        assert_eq!(m.status_ltime, 5, "rejected transitions must not roll back status_ltime");
    }

    #[test]
    fn resurrection_via_intent_is_blocked() {
        let mut m = member();
        m.status = Status::Left;
        m.status_ltime = 1;

        assert_eq!(m.join_intent(10), Outcome::LTimeUpdated);
        assert_eq!(m.status, Status::Left, "a join intent must never resurrect a Left member");
        assert_eq!(m.status_ltime, 10);

        // Only an authoritative memberlist join can resurrect it.
        assert_eq!(m.on_memberlist_join(), Outcome::StateChanged);
        assert_eq!(m.status, Status::Alive);
    }

    #[test]
    fn resurrection_from_failed_also_blocked() {
        let mut m = member();
        m.status = Status::Failed;
        m.status_ltime = 1;

        assert_eq!(m.join_intent(99), Outcome::LTimeUpdated);
        assert_eq!(m.status, Status::Failed);
    }

    #[test]
    fn leaving_refuted_by_join_intent() {
        let mut m = member();
        m.status = Status::Leaving;
        m.status_ltime = 1;

        assert_eq!(m.join_intent(2), Outcome::StateChanged);
        assert_eq!(m.status, Status::Alive);
    }

    #[test]
    fn leave_intent_transitions_alive_to_leaving() {
        let mut m = member();
        assert_eq!(m.leave_intent(1), Outcome::StateChanged);
        assert_eq!(m.status, Status::Leaving);
    }

    #[test]
    fn leave_intent_transitions_failed_to_left() {
        let mut m = member();
        m.status = Status::Failed;
        assert_eq!(m.leave_intent(1), Outcome::StateChanged);
        assert_eq!(m.status, Status::Left);
    }
}
