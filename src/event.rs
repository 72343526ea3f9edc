// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The event pipeline contract (§6) and the user-event ring buffer that
//! backs its de-dup/coalesce rules (§3, §4.G). `emit -> eventManager ->
//! [snapshotter] -> [internal query handler] -> external event sink`: this
//! module supplies the `Event` vocabulary that flows through every stage and
//! the buffer the Serf layer dedupes against before anything reaches it.

use crate::clock::LTime;
use crate::member::MemberInfo;
use std::sync::Arc;
use tokio::sync::mpsc;

/// What triggered a [`MemberEvent`]; `Reap` is raised by the coordinator's
/// reaper loop rather than the gossip/intent layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemberEventType {
    Join,
    Leave,
    Failed,
    Update,
    Reap,
}

/// A (possibly coalesced) batch of members that underwent the same
/// transition in one coalescing window (§4.G "Member-event coalescence").
#[derive(Clone, Debug)]
pub struct MemberEvent {
    pub event_type: MemberEventType,
    pub members: Vec<MemberInfo>,
}

/// A user-defined event, broadcast via `Coordinator::user_event` and
/// delivered to every reachable node's sink at most once (§8 "Event dedup").
#[derive(Clone, Debug)]
pub struct UserEvent {
    pub name: String,
    pub payload: Vec<u8>,
    pub ltime: LTime,
    pub coalesce: bool,
}

/// A query observed locally, either because we issued it or because a peer's
/// query matched our filters. `responder` is `None` for queries the local
/// node itself issued (nothing to respond to).
pub struct Query {
    pub name: String,
    pub payload: Vec<u8>,
    pub ltime: LTime,
    pub deadline: std::time::Instant,
    responder: Option<Arc<dyn Fn(Vec<u8>) -> crate::error::Result<()> + Send + Sync>>,
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("name", &self.name)
            .field("ltime", &self.ltime)
            .field("deadline", &self.deadline)
            .finish()
    }
}

impl Query {
    pub fn new(
        name: String,
        payload: Vec<u8>,
        ltime: LTime,
        deadline: std::time::Instant,
        responder: Arc<dyn Fn(Vec<u8>) -> crate::error::Result<()> + Send + Sync>,
    ) -> Self {
        Self {
            name,
            payload,
            ltime,
            deadline,
            responder: Some(responder),
        }
    }

    /// Sends `payload` back to the query's source, per the event pipeline's
    /// `Query{..., Respond(bytes)}` contract (§6). A no-op past `deadline`.
    pub fn respond(&self, payload: Vec<u8>) -> crate::error::Result<()> {
        if std::time::Instant::now() > self.deadline {
            return Ok(());
        }
        match &self.responder {
            Some(f) => f(payload),
            None => Ok(()),
        }
    }
}

/// One item flowing through the event pipeline (§6).
#[derive(Debug)]
pub enum Event {
    Member(MemberEvent),
    User(UserEvent),
    Query(Query),
}

/// The external event consumer interface the coordinator's pipeline
/// terminates into. Scripts/RPC fan-out (the out-of-scope collaborators) sit
/// behind an implementation of this trait; the core ships a channel-backed
/// default.
pub trait EventSink: Send + Sync {
    fn notify(&self, event: Event);
}

/// Discards every event; used where no sink was configured.
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn notify(&self, _event: Event) {}
}

/// Forwards events into a bounded channel. Per §6, "back-pressure ... is
/// handled ... by the external sink (drops with log, per configuration)":
/// a full channel drops the event and logs, it never blocks the pipeline.
pub struct ChannelEventSink {
    tx: mpsc::Sender<Event>,
}

impl ChannelEventSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelEventSink {
    fn notify(&self, event: Event) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.tx.try_send(event) {
            tracing::warn!("event sink channel full, dropping event");
        }
    }
}

/// One ring slot: the Lamport time it currently represents, and the
/// `(name, payload)` pairs dispatched for that time so far. A slot is reset
/// whenever it is revisited for a different `ltime`, which is what bounds
/// memory: the ring only ever remembers `EventBuffer` distinct times.
#[derive(Default)]
struct Slot {
    ltime: LTime,
    touched: bool,
    entries: Vec<(String, Vec<u8>)>,
}

/// Ring buffer used to dedupe and coalesce user events within the moving
/// window `[min_time, clock)` (§3 "User-event buffer", §8 "Event dedup" /
/// "Coalesce law").
pub struct EventBuffer {
    size: u64,
    slots: Vec<Slot>,
    min_time: LTime,
}

impl EventBuffer {
    pub fn new(size: u64) -> Self {
        let size = size.max(1);
        let mut slots = Vec::with_capacity(size as usize);
        slots.resize_with(size as usize, Slot::default);
        Self {
            size,
            slots,
            min_time: 0,
        }
    }

    pub fn min_time(&self) -> LTime {
        self.min_time
    }

    /// Advances the dedup floor; events with `ltime < min_time` are dropped
    /// unseen. Called on snapshot replay and periodic trimming (§4.G).
    pub fn advance_min_time(&mut self, t: LTime) {
        if t > self.min_time {
            self.min_time = t;
        }
    }

    /// Records `(name, payload)` at `ltime`. Returns `true` if this is the
    /// first time this event should be dispatched downstream.
    ///
    /// Non-coalesced events are deduped on the exact `(name, payload)` pair;
    /// coalesced events are deduped on `name` alone, replacing any prior
    /// payload in the slot and still dispatching exactly once per distinct
    /// `name` (§8 "Coalesce law").
    pub fn record(&mut self, name: &str, payload: &[u8], ltime: LTime, coalesce: bool) -> bool {
        if ltime < self.min_time {
            return false;
        }
        let idx = (ltime % self.size) as usize;
        let slot = &mut self.slots[idx];
        if !slot.touched || slot.ltime != ltime {
            slot.ltime = ltime;
            slot.touched = true;
            slot.entries.clear();
        }

        if coalesce {
            if let Some(existing) = slot.entries.iter_mut().find(|(n, _)| n == name) {
                existing.1 = payload.to_vec();
                return false;
            }
            slot.entries.push((name.to_string(), payload.to_vec()));
            true
        } else {
            if slot.entries.iter().any(|(n, p)| n == name && p == payload) {
                return false;
            }
            slot.entries.push((name.to_string(), payload.to_vec()));
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedups_exact_repeat() {
        let mut buf = EventBuffer::new(8);
        assert!(buf.record("deploy", b"v1", 1, false));
        assert!(!buf.record("deploy", b"v1", 1, false), "exact repeat must not re-dispatch");
    }

    #[test]
    fn distinct_payload_without_coalesce_dispatches_again() {
        let mut buf = EventBuffer::new(8);
        assert!(buf.record("deploy", b"v1", 1, false));
        assert!(buf.record("deploy", b"v2", 1, false));
    }

    #[test]
    fn coalesce_replaces_and_dispatches_once() {
        let mut buf = EventBuffer::new(8);
        assert!(buf.record("deploy", b"v1", 5, true), "first observation dispatches");
        assert!(!buf.record("deploy", b"v2", 5, true), "second observation in the same slot coalesces silently");
    }

    #[test]
    fn below_min_time_is_dropped() {
        let mut buf = EventBuffer::new(8);
        buf.advance_min_time(10);
        assert!(!buf.record("deploy", b"v1", 3, false));
    }

    #[test]
    fn ring_wraparound_evicts_stale_slot() {
        let mut buf = EventBuffer::new(4);
        assert!(buf.record("a", b"1", 1, false));
        // ltime 5 reuses slot 1 (5 % 4 == 1); the old entry for ltime 1 must
        // not leak into this slot's dedup state.
        assert!(buf.record("a", b"1", 5, false));
    }
}
