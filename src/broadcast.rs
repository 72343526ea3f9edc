// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Transmit-limited broadcast queues. Each class (memberlist, serf intents,
//! user events, queries) gets its own [`BroadcastQueue`] so that a burst of
//! user traffic can never starve control traffic (§4.C). Grounded on the
//! teacher's guarded-update pattern in `routing::section` (`update_member`
//! replacing an entry rather than appending), generalized here to ordering by
//! fewest transmissions first rather than signature validity.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::time::Instant;
use tokio::sync::oneshot;

/// One of the four independent broadcast classes (§4.C). Each gets its own
/// queue so a flood of user events cannot delay a `Suspect` broadcast.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Class {
    Memberlist,
    Serf,
    Event,
    Query,
}

/// `R · ⌈log10(N+1)⌉`, the retransmit budget shared by both the broadcast
/// queue and (conceptually) any caller reasoning about propagation time.
pub fn retransmit_limit(retransmit_mult: u32, n: usize) -> u32 {
    let log_n = ((n + 1) as f64).log10().ceil().max(1.0);
    retransmit_mult * log_n as u32
}

/// A queued broadcast: its wire bytes, a dedup key, and how many times it has
/// already been drawn.
struct Entry {
    key: String,
    bytes: Vec<u8>,
    transmits: u32,
    enqueued_at: Instant,
    notify: Option<oneshot::Sender<()>>,
}

impl Entry {
    fn order_key(&self) -> (u32, Instant) {
        (self.transmits, self.enqueued_at)
    }
}

/// Min-heap wrapper: `BinaryHeap` is a max-heap, so we invert comparisons to
/// get "fewest transmissions, then earliest enqueue time" out first.
struct HeapEntry(Entry);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.order_key() == other.0.order_key()
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.0.order_key().cmp(&self.0.order_key())
    }
}

/// A transmit-limited, dedup-by-key broadcast queue for a single class.
/// Not internally synchronized: callers hold it behind whichever lock their
/// class implies (memberLock for `Memberlist`/`Serf`, eventLock for `Event`,
/// queryLock for `Query`), matching the crate's "no suspension under a lock"
/// and "fine-grained lock" discipline.
#[derive(Default)]
pub struct BroadcastQueue {
    heap: BinaryHeap<HeapEntry>,
    limit: u32,
}

impl BroadcastQueue {
    pub fn new(limit: u32) -> Self {
        Self {
            heap: BinaryHeap::new(),
            limit: limit.max(1),
        }
    }

    /// Updates the retransmit limit, e.g. as cluster size `N` changes.
    pub fn set_limit(&mut self, limit: u32) {
        self.limit = limit.max(1);
    }

    /// Enqueues a broadcast under `key`, replacing any prior entry with the
    /// same key (dedup). The replaced entry's `notify` channel, if any, is
    /// dropped without firing — it has been superseded, not sent.
    pub fn queue(&mut self, key: impl Into<String>, bytes: Vec<u8>, notify: Option<oneshot::Sender<()>>) {
        let key = key.into();
        let mut rebuilt: BinaryHeap<HeapEntry> = self
            .heap
            .drain()
            .filter(|e| e.0.key != key)
            .collect();
        rebuilt.push(HeapEntry(Entry {
            key,
            bytes,
            transmits: 0,
            enqueued_at: Instant::now(),
            notify,
        }));
        self.heap = rebuilt;
    }

    /// Drains up to `limit_count` broadcasts whose total size (each plus
    /// `overhead`) fits under `byte_budget`, fewest-transmissions-first.
    /// Drawn entries are incremented and re-inserted unless their transmit
    /// count has now exceeded this queue's retransmit limit, in which case
    /// they are dropped and their `notify` channel fired.
    pub fn get_broadcasts(&mut self, overhead: usize, byte_budget: usize, limit_count: usize) -> Vec<Vec<u8>> {
        let mut drawn = Vec::new();
        let mut used = 0usize;
        let mut set_aside = Vec::new();

        while drawn.len() < limit_count {
            let HeapEntry(mut entry) = match self.heap.pop() {
                Some(e) => e,
                None => break,
            };
            let cost = overhead + entry.bytes.len();
            if used + cost > byte_budget {
                set_aside.push(HeapEntry(entry));
                break;
            }
            used += cost;
            entry.transmits += 1;
            drawn.push(entry.bytes.clone());

            if entry.transmits >= self.limit {
                if let Some(notify) = entry.notify.take() {
                    let _ = notify.send(());
                }
            } else {
                set_aside.push(HeapEntry(entry));
            }
        }

        for item in set_aside {
            self.heap.push(item);
        }
        drawn
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

/// Owns one [`BroadcastQueue`] per [`Class`], mirroring the per-class
/// starvation-prevention requirement of §4.C.
pub struct BroadcastQueues {
    memberlist: BroadcastQueue,
    serf: BroadcastQueue,
    event: BroadcastQueue,
    query: BroadcastQueue,
}

impl BroadcastQueues {
    pub fn new(limit: u32) -> Self {
        Self {
            memberlist: BroadcastQueue::new(limit),
            serf: BroadcastQueue::new(limit),
            event: BroadcastQueue::new(limit),
            query: BroadcastQueue::new(limit),
        }
    }

    pub fn set_limit(&mut self, limit: u32) {
        self.memberlist.set_limit(limit);
        self.serf.set_limit(limit);
        self.event.set_limit(limit);
        self.query.set_limit(limit);
    }

    pub fn queue(&mut self, class: Class, key: impl Into<String>, bytes: Vec<u8>, notify: Option<oneshot::Sender<()>>) {
        self.for_class(class).queue(key, bytes, notify)
    }

    pub fn for_class(&mut self, class: Class) -> &mut BroadcastQueue {
        match class {
            Class::Memberlist => &mut self.memberlist,
            Class::Serf => &mut self.serf,
            Class::Event => &mut self.event,
            Class::Query => &mut self.query,
        }
    }

    /// Assembles a compound payload for one gossip round: control traffic
    /// (memberlist, then serf intents) is drawn first so user events/queries
    /// can never starve it, filling the remaining byte budget.
    pub fn drain_for_compound(&mut self, overhead: usize, byte_budget: usize, limit_count: usize) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        let mut remaining_budget = byte_budget;
        let mut remaining_count = limit_count;

        for class in [Class::Memberlist, Class::Serf, Class::Event, Class::Query] {
            if remaining_count == 0 || remaining_budget == 0 {
                break;
            }
            let drawn = self
                .for_class(class)
                .get_broadcasts(overhead, remaining_budget, remaining_count);
            let used: usize = drawn.iter().map(|b| overhead + b.len()).sum();
            remaining_budget = remaining_budget.saturating_sub(used);
            remaining_count = remaining_count.saturating_sub(drawn.len());
            out.extend(drawn);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retransmit_limit_matches_formula() {
        // ceil(log10(10+1)) == 2 ⇒ 3 * 2 == 6.
        assert_eq!(retransmit_limit(3, 10), 6);
        // A single-node cluster still gets at least one retransmit per mult.
        assert_eq!(retransmit_limit(3, 0), 3);
    }

    #[test]
    fn dedup_replaces_prior_entry_for_key() {
        let mut q = BroadcastQueue::new(10);
        q.queue("node-a", vec![1], None);
        q.queue("node-a", vec![2], None);
        assert_eq!(q.len(), 1);
        let drawn = q.get_broadcasts(0, 1024, 10);
        assert_eq!(drawn, vec![vec![2]]);
    }

    #[test]
    fn fewest_transmits_drawn_first() {
        let mut q = BroadcastQueue::new(10);
        q.queue("a", vec![1], None);
        let _ = q.get_broadcasts(0, 1024, 1); // a now has 1 transmit
        q.queue("b", vec![2], None); // b has 0 transmits
        let drawn = q.get_broadcasts(0, 1024, 1);
        assert_eq!(drawn, vec![vec![2]], "b has fewer transmits, must be drawn first");
    }

    #[test]
    fn exceeding_limit_drops_and_notifies() {
        let mut q = BroadcastQueue::new(2);
        let (tx, mut rx) = oneshot::channel();
        q.queue("a", vec![9], Some(tx));
        let _ = q.get_broadcasts(0, 1024, 1);
        let _ = q.get_broadcasts(0, 1024, 1);
        assert!(q.is_empty(), "entry should have been dropped after reaching the limit");
        assert!(rx.try_recv().is_ok(), "notify must fire once the limit is exceeded");
    }

    #[test]
    fn byte_budget_is_respected() {
        let mut q = BroadcastQueue::new(10);
        q.queue("a", vec![0u8; 100], None);
        q.queue("b", vec![0u8; 100], None);
        let drawn = q.get_broadcasts(0, 150, 10);
        assert_eq!(drawn.len(), 1, "only one entry fits the byte budget");
    }

    #[test]
    fn compound_drain_prioritizes_control_traffic() {
        let mut qs = BroadcastQueues::new(10);
        qs.queue(Class::Event, "e1", vec![1], None);
        qs.queue(Class::Memberlist, "m1", vec![2], None);
        let drawn = qs.drain_for_compound(0, 1024, 1);
        assert_eq!(drawn, vec![vec![2]], "memberlist traffic must be drained before event traffic");
    }
}
