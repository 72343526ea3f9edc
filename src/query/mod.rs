// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The query engine (§4.H): outgoing query registration, ack/response
//! fan-in, node/tag filter evaluation, and the reserved internal query
//! names that back the key manager and conflict resolution.
//!
//! Grounded on the teacher's `routing::dkg::voter` vote-tally shape (a
//! registry of in-flight rounds keyed by an id, each accumulating
//! per-peer contributions until a deadline) — generalized here from DKG
//! rounds to query acks/responses keyed by Lamport time.

pub mod internal;
pub mod keymgr;

use crate::broadcast::Class;
use crate::clock::{LTime, LamportClock};
use crate::codec::{Encoder, MsgType};
use crate::error::Result;
use crate::keyring::Keyring;
use crate::member::table::MemberTable;
use crate::member::Tags;
use crate::serf::messages::{Filters, Query, QueryFlags, QueryResponse};
use crate::transport::Comm;
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::warn;

/// Tunables for an outgoing query.
#[derive(Clone, Debug, Default)]
pub struct QueryParam {
    pub filters: Filters,
    pub request_ack: bool,
    pub timeout: Option<Duration>,
    pub relay_factor: u8,
}

/// Handle returned to the caller of [`QueryManager::query`]: acks and
/// responses stream in until `timeout` elapses, at which point both
/// channels close (§4.G "Response path").
pub struct QueryHandle {
    pub ltime: LTime,
    pub acks: mpsc::Receiver<String>,
    pub responses: mpsc::Receiver<(String, Vec<u8>)>,
}

struct PendingQuery {
    acked_from: HashSet<String>,
    responded_from: HashSet<String>,
    ack_tx: mpsc::Sender<String>,
    resp_tx: mpsc::Sender<(String, Vec<u8>)>,
}

/// One ring slot of the inbound dedup buffer, analogous to
/// [`crate::event::EventBuffer`] but tracking query ids seen at a given
/// Lamport time rather than `(name, payload)` pairs.
#[derive(Default)]
struct QuerySlot {
    ltime: LTime,
    touched: bool,
    seen_ids: HashSet<u64>,
}

struct QueryDedup {
    size: u64,
    slots: Vec<QuerySlot>,
    min_time: LTime,
}

impl QueryDedup {
    fn new(size: u64) -> Self {
        let size = size.max(1);
        let mut slots = Vec::with_capacity(size as usize);
        slots.resize_with(size as usize, QuerySlot::default);
        Self { size, slots, min_time: 0 }
    }

    fn advance_min_time(&mut self, t: LTime) {
        if t > self.min_time {
            self.min_time = t;
        }
    }

    /// Returns `true` if `(ltime, id)` is new and should be processed.
    fn observe(&mut self, ltime: LTime, id: u64) -> bool {
        if ltime < self.min_time {
            return false;
        }
        let idx = (ltime % self.size) as usize;
        let slot = &mut self.slots[idx];
        if !slot.touched || slot.ltime != ltime {
            slot.ltime = ltime;
            slot.touched = true;
            slot.seen_ids.clear();
        }
        slot.seen_ids.insert(id)
    }
}

/// Evaluates §4.G's filter semantics: an empty node whitelist matches
/// everyone; every `(tag, pattern)` pair must match the local tag value,
/// anchored with `^...$` unless already anchored.
pub fn filters_match(filters: &Filters, local_name: &str, local_tags: &Tags) -> bool {
    if !filters.nodes.is_empty() && !filters.nodes.iter().any(|n| n == local_name) {
        return false;
    }
    for (tag, pattern) in &filters.tags {
        let anchored = if pattern.starts_with('^') && pattern.ends_with('$') {
            pattern.clone()
        } else {
            format!("^{}$", pattern)
        };
        let re = match regex::Regex::new(&anchored) {
            Ok(re) => re,
            Err(err) => {
                warn!("invalid tag filter regex {:?}: {:?}", pattern, err);
                return false;
            }
        };
        match local_tags.get(tag) {
            Some(value) if re.is_match(value) => {}
            _ => return false,
        }
    }
    true
}

/// The outgoing+incoming half of the query engine. Shares the same
/// `Comm`/broadcast-queue/keyring/label plumbing as [`crate::gossip::Engine`]
/// but answers and originates Serf-level `Query`/`QueryResponse` frames
/// rather than SWIM probes.
pub struct QueryManager {
    local_name: String,
    local_addr: SocketAddr,
    clock: Arc<LamportClock>,
    comm: Arc<Comm>,
    broadcasts: Arc<Mutex<crate::broadcast::BroadcastQueues>>,
    keyring: Option<Arc<RwLock<Keyring>>>,
    label: Option<String>,
    members: Arc<RwLock<MemberTable>>,
    pending: Arc<Mutex<HashMap<LTime, PendingQuery>>>,
    dedup: Mutex<QueryDedup>,
    next_id: AtomicU64,
    default_timeout: Duration,
    query_buffer_size: u64,
}

impl QueryManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_name: String,
        local_addr: SocketAddr,
        clock: Arc<LamportClock>,
        comm: Arc<Comm>,
        broadcasts: Arc<Mutex<crate::broadcast::BroadcastQueues>>,
        keyring: Option<Arc<RwLock<Keyring>>>,
        label: Option<String>,
        members: Arc<RwLock<MemberTable>>,
        default_timeout: Duration,
        query_buffer_size: u64,
    ) -> Self {
        Self {
            local_name,
            local_addr,
            clock,
            comm,
            broadcasts,
            keyring,
            label,
            members,
            pending: Arc::new(Mutex::new(HashMap::new())),
            dedup: Mutex::new(QueryDedup::new(query_buffer_size)),
            next_id: AtomicU64::new(1),
            default_timeout,
            query_buffer_size: query_buffer_size.max(1),
        }
    }

    fn encoder(&self) -> Encoder<'_> {
        Encoder {
            label: self.label.as_deref(),
            keyring: None,
        }
    }

    async fn encode<T: serde::Serialize>(&self, msg_type: MsgType, body: &T) -> Result<Bytes> {
        // A short, synchronous-only critical section, matching the same
        // try-read discipline `gossip::Engine` uses around its keyring.
        match &self.keyring {
            Some(lock) => {
                let guard = lock.read().await;
                if guard.is_empty() {
                    self.encoder().encode(msg_type, body)
                } else {
                    Encoder {
                        label: self.label.as_deref(),
                        keyring: Some(&guard),
                    }
                    .encode(msg_type, body)
                }
            }
            None => self.encoder().encode(msg_type, body),
        }
    }

    /// Broadcasts an outgoing query (§4.G "Broadcast path"): increments the
    /// query clock, registers a response handler keyed by the new Lamport
    /// time, and enqueues the framed `Query` for gossip dispatch.
    pub async fn query(&self, name: String, payload: Vec<u8>, param: QueryParam) -> Result<QueryHandle> {
        let ltime = self.clock.increment();
        let timeout = param.timeout.unwrap_or(self.default_timeout);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let msg = Query {
            ltime,
            id,
            name,
            payload,
            filters: param.filters,
            flags: QueryFlags { ack: param.request_ack },
            relay_factor: param.relay_factor,
            timeout_ms: timeout.as_millis() as u64,
            source_name: self.local_name.clone(),
            source_addr: self.local_addr,
        };
        let bytes = self.encode(MsgType::Query, &msg).await?;

        let (ack_tx, ack_rx) = mpsc::channel(256);
        let (resp_tx, resp_rx) = mpsc::channel(256);
        self.pending.lock().await.insert(
            ltime,
            PendingQuery {
                acked_from: HashSet::new(),
                responded_from: HashSet::new(),
                ack_tx,
                resp_tx,
            },
        );

        self.broadcasts
            .lock()
            .await
            .queue(Class::Query, format!("Query:{}", ltime), bytes.to_vec(), None);

        // Deregister and close the channels once the deadline passes (§5
        // "Queries carry their own deadlines; expired handlers are
        // deregistered and their channels closed").
        let pending = self.pending.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            pending.lock().await.remove(&ltime);
        });

        Ok(QueryHandle { ltime, acks: ack_rx, responses: resp_rx })
    }

    /// Handles an inbound `QueryResponse` frame: routes it to the matching
    /// pending query's ack/response channel by non-blocking send, per §5
    /// "Query response channels: non-blocking writes; full channels drop
    /// the ack/response and log".
    pub async fn handle_response(&self, resp: QueryResponse) {
        let mut pending = self.pending.lock().await;
        let entry = match pending.get_mut(&resp.ltime) {
            Some(e) => e,
            None => return,
        };
        if resp.ack {
            if !entry.acked_from.insert(resp.from.clone()) {
                return;
            }
            if let Err(mpsc::error::TrySendError::Full(_)) = entry.ack_tx.try_send(resp.from) {
                warn!("query ack channel full, dropping ack");
            }
        } else {
            if !entry.responded_from.insert(resp.from.clone()) {
                return;
            }
            if let Err(mpsc::error::TrySendError::Full(_)) = entry.resp_tx.try_send((resp.from, resp.payload)) {
                warn!("query response channel full, dropping response");
            }
        }
    }

    /// Handles an inbound `Query` frame (§4.G "Receive path"): witnesses the
    /// clock, drops stale/duplicate/self-originated queries, and evaluates
    /// it against `local_name`/`local_tags`. Returns `Some(query)` when it
    /// matched and should be delivered to the event pipeline.
    pub async fn handle_query(
        &self,
        msg: Query,
        local_name: &str,
        local_tags: &Tags,
    ) -> Option<Query> {
        self.clock.witness(msg.ltime);

        {
            let mut dedup = self.dedup.lock().await;
            if !dedup.observe(msg.ltime, msg.id) {
                return None;
            }
        }

        if msg.source_name == local_name {
            return None;
        }

        if !filters_match(&msg.filters, local_name, local_tags) {
            return None;
        }

        if msg.flags.ack {
            self.send_response(&msg, Vec::new(), true).await;
        }

        Some(msg)
    }

    /// Sends a `QueryResponse` for `query` directly to its source, or
    /// relayed through `relay_factor` random peers if requested (§4.G).
    pub async fn send_response(&self, query: &Query, payload: Vec<u8>, ack: bool) {
        let resp = QueryResponse {
            ltime: query.ltime,
            id: query.id,
            from: self.local_name.clone(),
            payload,
            ack,
        };
        let bytes = match self.encode(MsgType::QueryResponse, &resp).await {
            Ok(b) => b,
            Err(_) => return,
        };

        if query.relay_factor == 0 {
            let _ = self.comm.send_packet(query.source_addr, &bytes).await;
            return;
        }

        // Relay through a handful of random peers rather than sending
        // directly, trading one extra hop for resilience against loss on
        // the direct path back to a query's source (§4.G).
        let relay_peers = {
            let members = self.members.read().await;
            let mut rng = StdRng::from_entropy();
            members.random_alive_peers(&mut rng, query.relay_factor as usize, &self.local_name)
        };
        if relay_peers.is_empty() {
            let _ = self.comm.send_packet(query.source_addr, &bytes).await;
            return;
        }

        let relay = crate::serf::messages::Relay {
            target: query.source_addr,
            inner_type: MsgType::QueryResponse as u8,
            inner_body: bytes.to_vec(),
        };
        let relay_bytes = match self.encode(MsgType::Relay, &relay).await {
            Ok(b) => b,
            Err(_) => return,
        };
        for peer in relay_peers {
            if let Some(addr) = self.members.read().await.get(&peer).map(|e| e.info.node.addr) {
                let _ = self.comm.send_packet(addr, &relay_bytes).await;
            }
        }
    }

    /// Advances the inbound dedup floor, mirroring
    /// [`crate::event::EventBuffer::advance_min_time`].
    pub async fn advance_min_time(&self, t: LTime) {
        self.dedup.lock().await.advance_min_time(t);
    }

    pub fn query_buffer_size(&self) -> u64 {
        self.query_buffer_size
    }

    /// Exposes the query Lamport clock for the snapshotter to persist.
    pub fn clock(&self) -> &Arc<LamportClock> {
        &self.clock
    }
}

/// Unwraps an inbound `Relay` frame addressed to `local_addr`, forwarding
/// the inner message on if it is addressed elsewhere. Relaying peers never
/// interpret `inner_body`; they only re-send it.
pub async fn forward_relay(comm: &Comm, relay: crate::serf::messages::Relay, local_addr: SocketAddr) -> Result<()> {
    if relay.target == local_addr {
        // Already home: the caller decodes and handles `inner_body` itself.
        return Ok(());
    }
    let mut framed = Vec::with_capacity(1 + relay.inner_body.len());
    framed.push(relay.inner_type);
    framed.extend_from_slice(&relay.inner_body);
    comm.send_packet(relay.target, &framed).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::member::Tags;

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn empty_filters_match_everyone() {
        let filters = Filters::default();
        assert!(filters_match(&filters, "node-a", &tags(&[])));
    }

    #[test]
    fn node_whitelist_restricts_match() {
        let filters = Filters {
            nodes: vec!["node-a".to_string()],
            tags: vec![],
        };
        assert!(filters_match(&filters, "node-a", &tags(&[])));
        assert!(!filters_match(&filters, "node-b", &tags(&[])));
    }

    #[test]
    fn tag_regex_is_anchored() {
        let filters = Filters {
            nodes: vec![],
            tags: vec![("role".to_string(), "web".to_string())],
        };
        assert!(filters_match(&filters, "node-a", &tags(&[("role", "web")])));
        assert!(!filters_match(&filters, "node-a", &tags(&[("role", "webserver")])));
    }

    #[test]
    fn missing_tag_never_matches() {
        let filters = Filters {
            nodes: vec![],
            tags: vec![("role".to_string(), "web".to_string())],
        };
        assert!(!filters_match(&filters, "node-a", &tags(&[])));
    }

    #[test]
    fn query_dedup_rejects_repeat_id_same_ltime() {
        let mut dedup = QueryDedup::new(8);
        assert!(dedup.observe(5, 1));
        assert!(!dedup.observe(5, 1));
        assert!(dedup.observe(5, 2));
    }

    #[test]
    fn query_dedup_below_min_time_rejected() {
        let mut dedup = QueryDedup::new(8);
        dedup.advance_min_time(10);
        assert!(!dedup.observe(3, 1));
    }
}
