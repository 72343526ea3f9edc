// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The member table: an arena of members keyed by name, an ordered probe
//! list of names (not owning pointers, per the "arena over pointer graph"
//! design note), and the buffer of intents received for not-yet-known
//! members. Everything here is meant to sit behind a single `memberLock`
//! held by the coordinator; no method here performs I/O or awaits.

use crate::member::node_state::{NodeState, State as GossipState};
use crate::member::{MemberInfo, Node, Outcome, Status};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// A member as tracked by the local node: the Serf-level overlay info plus
/// the gossip-level SWIM state, when known.
#[derive(Clone, Debug)]
pub struct MemberEntry {
    pub info: MemberInfo,
    pub gossip: Option<NodeState>,
}

/// An intent that arrived for a member not yet present in the table. Parked
/// here, keyed by name, keeping only the newest; replayed once the member is
/// learned from gossip.
#[derive(Clone, Debug)]
pub struct RecentIntent {
    pub ltime: u64,
    pub is_join: bool,
    pub received_at: Instant,
}

#[derive(Default)]
pub struct MemberTable {
    members: HashMap<String, MemberEntry>,
    probe_order: Vec<String>,
    probe_idx: usize,
    recent_intents: HashMap<String, RecentIntent>,
}

impl MemberTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&MemberEntry> {
        self.members.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut MemberEntry> {
        self.members.get_mut(name)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &MemberEntry)> {
        self.members.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.members.keys().cloned().collect()
    }

    /// Inserts a brand-new alive member, created on first intent or first
    /// memberlist join. Also appends it to the probe list and replays any
    /// buffered intent for it.
    pub fn insert_new(&mut self, node: Node, incarnation: u32) -> Outcome {
        self.insert_new_with_state(node, incarnation, GossipState::Alive)
    }

    /// Like [`Self::insert_new`], but for a member first learned about via
    /// push/pull anti-entropy, whose reported SWIM state may already be
    /// `Suspect`/`Dead`/`Left` rather than `Alive`. The caller is
    /// responsible for following up with the matching authoritative
    /// `Delegate` notification (or none, for `Suspect`) exactly as it would
    /// for an already-known member (see `gossip::Engine::merge_remote`).
    pub fn insert_new_with_state(&mut self, node: Node, incarnation: u32, state: GossipState) -> Outcome {
        let name = node.name.clone();
        let mut info = MemberInfo::new(node);
        let mut gossip = Some(NodeState::with_state(incarnation, state));

        if let Some(buffered) = self.recent_intents.remove(&name) {
            let outcome = if buffered.is_join {
                info.join_intent(buffered.ltime)
            } else {
                info.leave_intent(buffered.ltime)
            };
            let _ = outcome;
        }

        self.probe_order.push(name.clone());
        self.members.insert(
            name,
            MemberEntry {
                info,
                gossip: gossip.take(),
            },
        );
        Outcome::StateChanged
    }

    /// Applies a join intent, buffering it if the member is unknown.
    pub fn apply_join_intent(&mut self, name: &str, ltime: u64) -> Outcome {
        if let Some(entry) = self.members.get_mut(name) {
            entry.info.join_intent(ltime)
        } else {
            self.buffer_intent(name, ltime, true);
            Outcome::NoChange
        }
    }

    /// Applies a leave intent, buffering it if the member is unknown.
    pub fn apply_leave_intent(&mut self, name: &str, ltime: u64) -> Outcome {
        if let Some(entry) = self.members.get_mut(name) {
            entry.info.leave_intent(ltime)
        } else {
            self.buffer_intent(name, ltime, false);
            Outcome::NoChange
        }
    }

    fn buffer_intent(&mut self, name: &str, ltime: u64, is_join: bool) {
        let replace = match self.recent_intents.get(name) {
            Some(existing) => ltime > existing.ltime,
            None => true,
        };
        if replace {
            self.recent_intents.insert(
                name.to_string(),
                RecentIntent {
                    ltime,
                    is_join,
                    received_at: Instant::now(),
                },
            );
        }
    }

    /// Prunes buffered intents older than `timeout`.
    pub fn prune_recent_intents(&mut self, timeout: Duration) {
        let now = Instant::now();
        self.recent_intents
            .retain(|_, intent| now.duration_since(intent.received_at) < timeout);
    }

    pub fn on_memberlist_join(&mut self, name: &str) -> Outcome {
        match self.members.get_mut(name) {
            Some(entry) => entry.info.on_memberlist_join(),
            None => Outcome::NoChange,
        }
    }

    pub fn on_memberlist_leave(&mut self, name: &str, is_dead: bool) -> Outcome {
        match self.members.get_mut(name) {
            Some(entry) => entry.info.on_memberlist_leave(is_dead),
            None => Outcome::NoChange,
        }
    }

    /// Picks the next probe target round-robin, reshuffling with a fresh
    /// random offset once a full cycle completes. Reshuffling never
    /// disturbs the hash-map lookup since the list only holds names.
    pub fn next_probe_target(&mut self, rng: &mut impl Rng, exclude: &str) -> Option<String> {
        self.probe_order.retain(|n| self.members.contains_key(n));
        if self.probe_order.is_empty() {
            return None;
        }
        if self.probe_idx >= self.probe_order.len() {
            self.probe_order.shuffle(rng);
            self.probe_idx = 0;
        }
        let start = self.probe_idx;
        loop {
            let candidate = self.probe_order[self.probe_idx].clone();
            self.probe_idx += 1;
            if candidate != exclude {
                return Some(candidate);
            }
            if self.probe_idx >= self.probe_order.len() {
                self.probe_order.shuffle(rng);
                self.probe_idx = 0;
            }
            if self.probe_idx == start {
                return None;
            }
        }
    }

    /// Picks up to `k` random alive peers excluding `exclude`, for indirect
    /// probing and gossip fan-out.
    pub fn random_alive_peers(&self, rng: &mut impl Rng, k: usize, exclude: &str) -> Vec<String> {
        let mut candidates: Vec<&String> = self
            .members
            .iter()
            .filter(|(name, entry)| {
                name.as_str() != exclude
                    && matches!(
                        entry.gossip.as_ref().map(|g| g.state),
                        Some(GossipState::Alive)
                    )
            })
            .map(|(name, _)| name)
            .collect();
        candidates.shuffle(rng);
        candidates.into_iter().take(k).cloned().collect()
    }

    /// Removes members that have been `Failed` longer than
    /// `reconnect_timeout` or `Left` longer than `tombstone_timeout`.
    /// Returns the names removed, for the caller to write `not-alive`
    /// snapshot directives.
    pub fn reap(&mut self, reconnect_timeout: Duration, tombstone_timeout: Duration) -> Vec<String> {
        let now = std::time::SystemTime::now();
        let mut removed = Vec::new();
        self.members.retain(|name, entry| {
            let age = now
                .duration_since(entry.info.wall_clock_time)
                .unwrap_or_default();
            let expired = match entry.info.status {
                Status::Failed => age >= reconnect_timeout,
                Status::Left => age >= tombstone_timeout,
                _ => false,
            };
            if expired {
                removed.push(name.clone());
            }
            !expired
        });
        self.probe_order.retain(|n| self.members.contains_key(n));
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
    }

    #[test]
    fn buffered_intent_replays_on_insert() {
        let mut table = MemberTable::new();
        assert_eq!(table.apply_leave_intent("a", 5), Outcome::NoChange);

        table.insert_new(Node::new("a", addr(1)), 1);
        let entry = table.get("a").unwrap();
        // The leave intent was buffered and replayed: Alive -> Leaving.
        assert_eq!(entry.info.status, Status::Leaving);
        assert_eq!(entry.info.status_ltime, 5);
    }

    #[test]
    fn newest_buffered_intent_wins() {
        let mut table = MemberTable::new();
        assert_eq!(table.apply_join_intent("a", 5), Outcome::NoChange);
        assert_eq!(table.apply_leave_intent("a", 3), Outcome::NoChange); // stale, ignored
        table.insert_new(Node::new("a", addr(1)), 1);
        assert_eq!(table.get("a").unwrap().info.status_ltime, 5);
    }

    #[test]
    fn reap_removes_expired_failed_and_left() {
        let mut table = MemberTable::new();
        table.insert_new(Node::new("a", addr(1)), 1);
        table.insert_new(Node::new("b", addr(2)), 1);
        table.get_mut("a").unwrap().info.status = Status::Failed;
        table.get_mut("a").unwrap().info.wall_clock_time =
            std::time::SystemTime::now() - Duration::from_secs(1000);
        table.get_mut("b").unwrap().info.status = Status::Alive;

        let removed = table.reap(Duration::from_secs(10), Duration::from_secs(10));
        assert_eq!(removed, vec!["a".to_string()]);
        assert!(table.get("a").is_none());
        assert!(table.get("b").is_some());
    }
}
