// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The Serf overlay (§4.F, §4.G): join/leave intents, the local-node leave
//! refutation special case, member-event coalescing, tags, and the bridge
//! from [`crate::gossip::Engine`]'s [`Delegate`](crate::gossip::Delegate)
//! callbacks into the member state machine, event buffer, and query engine.
//!
//! Grounded on the teacher's `routing::Core` as the layer that sits above
//! `routing::comm` and interprets application-level messages the transport
//! layer only forwards; generalized here from section-membership messages to
//! Serf intents/events/queries.

pub mod messages;

use crate::broadcast::{BroadcastQueues, Class};
use crate::clock::{LTime, LamportClock};
use crate::codec::{Decoder, Encoder, MsgType};
use crate::error::Result;
use crate::event::{Event, EventBuffer, EventSink, MemberEvent, MemberEventType};
use crate::gossip::Delegate;
use crate::keyring::Keyring;
use crate::member::table::MemberTable;
use crate::member::{MemberInfo, Outcome, Status, Tags};
use crate::query::{self, QueryManager};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Tunables for the Serf overlay (§4.G), all taken from
/// [`crate::config::Config`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SerfConfig {
    /// How long a member must go unchanged before its coalesced event fires
    /// (the "quiet" debounce window).
    pub coalesce_quiet: Duration,
    /// Hard cap on how long a busy member can be held back by repeated
    /// transitions before it is force-flushed.
    pub coalesce_max: Duration,
    /// How often the coalesce sweep runs.
    pub coalesce_tick: Duration,
    /// How long a buffered (not-yet-known-member) intent is kept before
    /// being discarded.
    pub recent_intent_timeout: Duration,
    /// How often buffered intents are pruned.
    pub housekeeping_interval: Duration,
}

impl Default for SerfConfig {
    fn default() -> Self {
        Self {
            coalesce_quiet: Duration::from_millis(200),
            coalesce_max: Duration::from_secs(3),
            coalesce_tick: Duration::from_millis(50),
            recent_intent_timeout: Duration::from_secs(5),
            housekeeping_interval: Duration::from_secs(5),
        }
    }
}

struct CoalesceEntry {
    event_type: MemberEventType,
    member: MemberInfo,
    first_seen: Instant,
    last_seen: Instant,
}

#[derive(Default)]
struct CoalesceState {
    pending: HashMap<String, CoalesceEntry>,
}

/// The remote-anti-entropy payload exchanged as `PushPull::user_state`: a
/// full snapshot of every known member's tags and Serf-level status, used to
/// reconcile state the SWIM layer's per-node `meta` blob does not carry on
/// its own (§9 "push/pull carries Serf state too").
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct UserStateNode {
    name: String,
    tags: Tags,
    status: u8,
    status_ltime: LTime,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct UserState {
    nodes: Vec<UserStateNode>,
}

fn status_byte(status: Status) -> u8 {
    match status {
        Status::None => 0,
        Status::Alive => 1,
        Status::Leaving => 2,
        Status::Left => 3,
        Status::Failed => 4,
    }
}

fn status_from_byte(byte: u8) -> Status {
    match byte {
        1 => Status::Alive,
        2 => Status::Leaving,
        3 => Status::Left,
        4 => Status::Failed,
        _ => Status::None,
    }
}

struct SerfInner {
    local_name: String,
    local_addr: SocketAddr,
    member_clock: LamportClock,
    event_clock: LamportClock,
    query: Arc<QueryManager>,
    members: Arc<RwLock<MemberTable>>,
    broadcasts: Arc<Mutex<BroadcastQueues>>,
    comm: Arc<crate::transport::Comm>,
    keyring: Option<Arc<RwLock<Keyring>>>,
    label: Option<String>,
    tags: std::sync::RwLock<Tags>,
    tags_file: Option<std::path::PathBuf>,
    event_buffer: Mutex<EventBuffer>,
    sink: Arc<dyn EventSink>,
    coalesce: Mutex<CoalesceState>,
    config: SerfConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

/// Cheaply-clonable handle onto the Serf overlay. [`Delegate`] methods are
/// synchronous (the gossip engine never awaits a callback), so each one
/// clones `self` and spawns the actual async work — the same pattern
/// [`crate::gossip::Engine`] uses for its own background loops.
#[derive(Clone)]
pub struct Serf(Arc<SerfInner>);

impl std::ops::Deref for Serf {
    type Target = SerfInner;
    fn deref(&self) -> &SerfInner {
        &self.0
    }
}

impl Serf {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_name: String,
        local_addr: SocketAddr,
        member_ltime: LTime,
        event_ltime: LTime,
        query: Arc<QueryManager>,
        members: Arc<RwLock<MemberTable>>,
        broadcasts: Arc<Mutex<BroadcastQueues>>,
        comm: Arc<crate::transport::Comm>,
        keyring: Option<Arc<RwLock<Keyring>>>,
        label: Option<String>,
        initial_tags: Tags,
        tags_file: Option<std::path::PathBuf>,
        sink: Arc<dyn EventSink>,
        event_buffer_size: u64,
        config: SerfConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self(Arc::new(SerfInner {
            local_name,
            local_addr,
            member_clock: LamportClock::starting_at(member_ltime),
            event_clock: LamportClock::starting_at(event_ltime),
            query,
            members,
            broadcasts,
            comm,
            keyring,
            label,
            tags: std::sync::RwLock::new(initial_tags),
            tags_file,
            event_buffer: Mutex::new(EventBuffer::new(event_buffer_size)),
            sink,
            coalesce: Mutex::new(CoalesceState::default()),
            config,
            shutdown_tx,
            shutdown_rx,
        }))
    }

    pub fn member_ltime(&self) -> LTime {
        self.member_clock.time()
    }

    pub fn event_ltime(&self) -> LTime {
        self.event_clock.time()
    }

    pub fn tags(&self) -> Tags {
        self.tags.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Updates the local node's tags. Exchanged with peers on the next
    /// push/pull anti-entropy round via `user_state`; not immediately
    /// re-gossiped as a fresh `Alive` announcement. Persisted to
    /// `tags_file` immediately, best-effort (§7: a write failure here is
    /// logged and never fatal).
    pub fn set_tags(&self, tags: Tags) {
        if let Some(path) = &self.tags_file {
            if let Err(err) = crate::tags::save(&tags, path) {
                warn!("failed to persist tags to {}: {:?}", path.display(), err);
            }
        }
        *self.tags.write().unwrap_or_else(|e| e.into_inner()) = tags;
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    pub fn spawn_loops(&self) -> Vec<JoinHandle<()>> {
        vec![
            {
                let serf = self.clone();
                tokio::spawn(async move { serf.coalesce_loop().await })
            },
            {
                let serf = self.clone();
                tokio::spawn(async move { serf.housekeeping_loop().await })
            },
        ]
    }

    async fn encode<T: Serialize>(&self, msg_type: MsgType, body: &T) -> Result<Bytes> {
        match &self.keyring {
            Some(lock) => {
                let guard = lock.read().await;
                if guard.is_empty() {
                    Encoder { label: self.label.as_deref(), keyring: None }.encode(msg_type, body)
                } else {
                    Encoder { label: self.label.as_deref(), keyring: Some(&guard) }.encode(msg_type, body)
                }
            }
            None => Encoder { label: self.label.as_deref(), keyring: None }.encode(msg_type, body),
        }
    }

    async fn queue_serf<T: Serialize>(&self, key: String, msg_type: MsgType, body: &T) {
        if let Ok(bytes) = self.encode(msg_type, body).await {
            self.broadcasts.lock().await.queue(Class::Serf, key, bytes.to_vec(), None);
        }
    }

    /// Records (or refreshes) a coalesced member-event observation; the
    /// sweep in [`Self::coalesce_loop`] decides when to actually dispatch it.
    async fn record_member_event(&self, name: &str, event_type: MemberEventType) {
        let member = match self.members.read().await.get(name) {
            Some(entry) => entry.info.clone(),
            None => return,
        };
        let now = Instant::now();
        let mut coalesce = self.coalesce.lock().await;
        match coalesce.pending.get_mut(name) {
            Some(entry) => {
                // A later transition always wins, per §4.G: "a member that
                // joins and then fails within the window is emitted as a
                // single failure".
                entry.event_type = event_type;
                entry.member = member;
                entry.last_seen = now;
            }
            None => {
                coalesce.pending.insert(
                    name.to_string(),
                    CoalesceEntry { event_type, member, first_seen: now, last_seen: now },
                );
            }
        }
    }

    async fn coalesce_loop(self) {
        let mut rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.coalesce_tick) => {}
                _ = rx.changed() => break,
            }
            if self.is_shutdown() {
                break;
            }
            self.flush_ready_coalesced().await;
        }
    }

    async fn flush_ready_coalesced(&self) {
        let now = Instant::now();
        let ready: Vec<(String, MemberEventType, MemberInfo)> = {
            let mut coalesce = self.coalesce.lock().await;
            let ready_names: Vec<String> = coalesce
                .pending
                .iter()
                .filter(|(_, e)| {
                    now.duration_since(e.last_seen) >= self.config.coalesce_quiet
                        || now.duration_since(e.first_seen) >= self.config.coalesce_max
                })
                .map(|(name, _)| name.clone())
                .collect();
            ready_names
                .into_iter()
                .filter_map(|name| coalesce.pending.remove(&name).map(|e| (name, e.event_type, e.member)))
                .collect()
        };
        if ready.is_empty() {
            return;
        }

        let mut grouped: HashMap<u8, Vec<MemberInfo>> = HashMap::new();
        for (_, event_type, member) in ready {
            grouped.entry(event_type as u8).or_default().push(member);
        }
        for (event_type_byte, members) in grouped {
            let event_type = match event_type_byte {
                0 => MemberEventType::Join,
                1 => MemberEventType::Leave,
                2 => MemberEventType::Failed,
                3 => MemberEventType::Update,
                _ => MemberEventType::Reap,
            };
            self.sink.notify(Event::Member(MemberEvent { event_type, members }));
        }
    }

    async fn housekeeping_loop(self) {
        let mut rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.housekeeping_interval) => {}
                _ = rx.changed() => break,
            }
            if self.is_shutdown() {
                break;
            }
            self.members.write().await.prune_recent_intents(self.config.recent_intent_timeout);
        }
    }

    async fn local_status(&self) -> Option<Status> {
        self.members.read().await.get(&self.local_name).map(|e| e.info.status)
    }

    /// Refutes an inbound leave rumor about the local node (§4.F "local-node
    /// special case"): bump `memberClock`, broadcast a fresh `Join`, and let
    /// the strictly-greater Lamport time naturally reject the stale leave.
    async fn refute_leave(&self) {
        let t = self.member_clock.increment();
        {
            let mut members = self.members.write().await;
            members.apply_join_intent(&self.local_name, t);
        }
        self.queue_serf(
            format!("Join:{}", self.local_name),
            MsgType::Join,
            &messages::Join { ltime: t, node: self.local_name.clone() },
        )
        .await;
        debug!("refuted leave intent for local node at ltime {}", t);
    }

    /// Broadcasts a join intent for the local node, e.g. on startup or after
    /// a refutation is needed outside the packet-handling path.
    pub async fn broadcast_join_intent(&self) -> LTime {
        let t = self.member_clock.increment();
        {
            let mut members = self.members.write().await;
            members.apply_join_intent(&self.local_name, t);
        }
        self.queue_serf(
            format!("Join:{}", self.local_name),
            MsgType::Join,
            &messages::Join { ltime: t, node: self.local_name.clone() },
        )
        .await;
        t
    }

    /// Broadcasts a leave intent for the local node (§4.K "Leave"):
    /// transitions `Alive -> Leaving` and announces it.
    pub async fn broadcast_leave_intent(&self) -> LTime {
        let t = self.member_clock.increment();
        let outcome = {
            let mut members = self.members.write().await;
            members.apply_leave_intent(&self.local_name, t)
        };
        if outcome == Outcome::StateChanged {
            self.record_member_event(&self.local_name, MemberEventType::Leave).await;
        }
        self.queue_serf(
            format!("Leave:{}", self.local_name),
            MsgType::Leave,
            &messages::Leave { ltime: t, node: self.local_name.clone() },
        )
        .await;
        t
    }

    /// Broadcasts a user-defined event (§4.G "Broadcast path").
    pub async fn user_event(&self, name: String, payload: Vec<u8>, coalesce: bool) -> Result<LTime> {
        let ltime = self.event_clock.increment();
        let is_new = {
            let mut buf = self.event_buffer.lock().await;
            buf.record(&name, &payload, ltime, coalesce)
        };
        let msg = messages::UserEvent { ltime, name: name.clone(), payload: payload.clone(), coalesce };
        self.queue_serf(format!("UserEvent:{}:{}", ltime, name), MsgType::UserEvent, &msg).await;
        if is_new {
            self.sink.notify(Event::User(crate::event::UserEvent { name, payload, ltime, coalesce }));
        }
        Ok(ltime)
    }

    async fn handle_join(&self, msg: messages::Join) {
        self.member_clock.witness(msg.ltime);
        if msg.node == self.local_name {
            // A stray rumor of our own join; harmless, nothing to refute.
            return;
        }
        let outcome = {
            let mut members = self.members.write().await;
            members.apply_join_intent(&msg.node, msg.ltime)
        };
        match outcome {
            Outcome::Rejected => {}
            Outcome::StateChanged => {
                self.record_member_event(&msg.node, MemberEventType::Join).await;
                self.queue_serf(format!("Join:{}", msg.node), MsgType::Join, &msg).await;
            }
            Outcome::LTimeUpdated | Outcome::NoChange => {
                self.queue_serf(format!("Join:{}", msg.node), MsgType::Join, &msg).await;
            }
        }
    }

    async fn handle_leave(&self, msg: messages::Leave) {
        self.member_clock.witness(msg.ltime);
        if msg.node == self.local_name {
            if matches!(self.local_status().await, Some(Status::Alive)) {
                self.refute_leave().await;
            }
            return;
        }
        let outcome = {
            let mut members = self.members.write().await;
            members.apply_leave_intent(&msg.node, msg.ltime)
        };
        match outcome {
            Outcome::Rejected => {}
            Outcome::StateChanged => {
                self.record_member_event(&msg.node, MemberEventType::Leave).await;
                self.queue_serf(format!("Leave:{}", msg.node), MsgType::Leave, &msg).await;
            }
            Outcome::LTimeUpdated | Outcome::NoChange => {
                self.queue_serf(format!("Leave:{}", msg.node), MsgType::Leave, &msg).await;
            }
        }
    }

    async fn handle_user_event(&self, msg: messages::UserEvent) {
        self.event_clock.witness(msg.ltime);
        let is_new = {
            let mut buf = self.event_buffer.lock().await;
            buf.record(&msg.name, &msg.payload, msg.ltime, msg.coalesce)
        };
        if is_new {
            self.queue_serf(format!("UserEvent:{}:{}", msg.ltime, msg.name), MsgType::UserEvent, &msg).await;
            self.sink.notify(Event::User(crate::event::UserEvent {
                name: msg.name,
                payload: msg.payload,
                ltime: msg.ltime,
                coalesce: msg.coalesce,
            }));
        }
    }

    async fn handle_query(&self, msg: messages::Query) {
        let local_tags = self.tags();
        let accepted = match self.query.handle_query(msg, &self.local_name, &local_tags).await {
            Some(q) => q,
            None => return,
        };

        if query::internal::is_internal(&accepted.name) {
            let keyring = match &self.keyring {
                Some(k) => k.clone(),
                None => Arc::new(RwLock::new(Keyring::empty())),
            };
            if let Some(result) =
                query::internal::handle(&accepted.name, &accepted.payload, &keyring, &self.local_name, self.local_addr).await
            {
                match result {
                    Ok(payload) => self.query.send_response(&accepted, payload, false).await,
                    Err(err) => warn!("internal query {:?} failed: {:?}", accepted.name, err),
                }
            }
            return;
        }

        let query_mgr = self.query.clone();
        let msg_clone = accepted.clone();
        let responder = Arc::new(move |payload: Vec<u8>| -> Result<()> {
            let query_mgr = query_mgr.clone();
            let msg_clone = msg_clone.clone();
            tokio::spawn(async move {
                query_mgr.send_response(&msg_clone, payload, false).await;
            });
            Ok(())
        });
        let deadline = Instant::now() + Duration::from_millis(accepted.timeout_ms);
        let event_query = crate::event::Query::new(accepted.name.clone(), accepted.payload.clone(), accepted.ltime, deadline, responder);
        self.sink.notify(Event::Query(event_query));
    }

    async fn handle_inner(&self, msg_type: MsgType, body: Bytes, from: SocketAddr) {
        match msg_type {
            MsgType::Join => {
                if let Ok(msg) = Decoder::deserialize(&body) {
                    self.handle_join(msg).await;
                }
            }
            MsgType::Leave => {
                if let Ok(msg) = Decoder::deserialize(&body) {
                    self.handle_leave(msg).await;
                }
            }
            MsgType::UserEvent => {
                if let Ok(msg) = Decoder::deserialize(&body) {
                    self.handle_user_event(msg).await;
                }
            }
            MsgType::Query => {
                if let Ok(msg) = Decoder::deserialize(&body) {
                    self.handle_query(msg).await;
                }
            }
            MsgType::QueryResponse => {
                if let Ok(resp) = Decoder::deserialize(&body) {
                    self.query.handle_response(resp).await;
                }
            }
            MsgType::Relay => {
                if let Ok(relay) = Decoder::deserialize::<messages::Relay>(&body) {
                    if relay.target == self.local_addr {
                        if let Ok(inner_type) = MsgType::from_byte(relay.inner_type) {
                            let inner_body = Bytes::from(relay.inner_body);
                            self.handle_inner(inner_type, inner_body, from).await;
                        }
                    } else if let Err(err) = query::forward_relay(&self.comm, relay, self.local_addr).await {
                        trace!("failed to forward relay to its target: {:?}", err);
                    }
                }
            }
            other => trace!("serf overlay: unhandled wire type {:?} from {}", other, from),
        }
    }

    async fn on_memberlist_join(&self, name: String) {
        {
            let mut members = self.members.write().await;
            members.on_memberlist_join(&name);
        }
        self.record_member_event(&name, MemberEventType::Join).await;
    }

    async fn on_memberlist_leave(&self, name: String, is_dead: bool) {
        {
            let mut members = self.members.write().await;
            members.on_memberlist_leave(&name, is_dead);
        }
        let event_type = if is_dead { MemberEventType::Failed } else { MemberEventType::Leave };
        self.record_member_event(&name, event_type).await;
    }

    async fn merge_remote_user_state_async(&self, bytes: Vec<u8>, _is_join: bool) {
        let remote: UserState = match rmp_serde::from_slice(&bytes) {
            Ok(r) => r,
            Err(_) => return,
        };
        for node in remote.nodes {
            if node.name == self.local_name {
                continue;
            }
            let outcome = {
                let mut members = self.members.write().await;
                match status_from_byte(node.status) {
                    Status::Alive | Status::None => members.apply_join_intent(&node.name, node.status_ltime),
                    _ => members.apply_leave_intent(&node.name, node.status_ltime),
                }
            };
            if let Some(entry) = self.members.write().await.get_mut(&node.name) {
                entry.info.tags = node.tags;
            }
            if outcome == Outcome::StateChanged {
                let event_type = match status_from_byte(node.status) {
                    Status::Alive => MemberEventType::Join,
                    Status::Failed => MemberEventType::Failed,
                    _ => MemberEventType::Leave,
                };
                self.record_member_event(&node.name, event_type).await;
            }
        }
    }
}

impl Delegate for Serf {
    fn local_user_state(&self) -> Vec<u8> {
        let members = match self.members.try_read() {
            Ok(m) => m,
            Err(_) => return Vec::new(),
        };
        let nodes = members
            .iter()
            .map(|(name, entry)| UserStateNode {
                name: name.clone(),
                tags: entry.info.tags.clone(),
                status: status_byte(entry.info.status),
                status_ltime: entry.info.status_ltime,
            })
            .collect();
        rmp_serde::to_vec_named(&UserState { nodes }).unwrap_or_default()
    }

    fn merge_remote_user_state(&self, user_state: &[u8], is_join: bool) {
        let serf = self.clone();
        let bytes = user_state.to_vec();
        tokio::spawn(async move { serf.merge_remote_user_state_async(bytes, is_join).await });
    }

    fn notify_join(&self, name: &str) {
        let serf = self.clone();
        let name = name.to_string();
        tokio::spawn(async move { serf.on_memberlist_join(name).await });
    }

    fn notify_leave(&self, name: &str, is_dead: bool) {
        let serf = self.clone();
        let name = name.to_string();
        tokio::spawn(async move { serf.on_memberlist_leave(name, is_dead).await });
    }

    fn handle_serf_packet(&self, msg_type: MsgType, body: Bytes, from: SocketAddr) {
        let serf = self.clone();
        tokio::spawn(async move { serf.handle_inner(msg_type, body, from).await });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_byte_round_trips() {
        for status in [Status::None, Status::Alive, Status::Leaving, Status::Left, Status::Failed] {
            assert_eq!(status_from_byte(status_byte(status)), status);
        }
    }
}
