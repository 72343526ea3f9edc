// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The SWIM + Lifeguard gossip engine and failure detector (§4.D): node
//! table, direct/indirect probing, suspicion, periodic gossip, and push/pull
//! anti-entropy. Grounded on the teacher's `routing::comm::Comm` for the
//! send/receive shape and on `routing::section::Section::update_member`'s
//! guarded-merge pattern (§4.D's six-row transition table is the same idea:
//! apply a remote claim only if it is not stale).
//!
//! The Serf overlay above this engine (join/leave intents, tags, events,
//! queries) is reached only through [`Delegate`] — this module has no
//! knowledge of Lamport clocks or user events, matching §9's "refutation is
//! orthogonal to transport" and the general layering of §1.

pub mod awareness;
pub mod messages;

use crate::broadcast::{retransmit_limit, BroadcastQueues, Class};
use crate::codec::{Decoder, Encoder, MsgType};
use crate::error::Result;
use crate::keyring::Keyring;
use crate::member::node_state::{NodeState, State as GossipState};
use crate::member::table::MemberTable;
use crate::member::Node;
use crate::transport::Comm;
use awareness::Awareness;
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::member::suspicion::{bounds, SuspicionTimer};

/// Tunables for the gossip/FD engine, all taken from [`crate::config::Config`].
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct GossipConfig {
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub indirect_checks: usize,
    pub gossip_interval: Duration,
    pub gossip_nodes: usize,
    pub gossip_to_the_dead_time: Duration,
    pub push_pull_interval: Duration,
    pub suspicion_mult: u32,
    pub suspicion_max_mult: u32,
    pub retransmit_mult: u32,
    pub max_awareness_mult: i32,
    pub expected_confirmations: u32,
    pub label: Option<String>,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_millis(1000),
            probe_timeout: Duration::from_millis(500),
            indirect_checks: 3,
            gossip_interval: Duration::from_millis(200),
            gossip_nodes: 3,
            gossip_to_the_dead_time: Duration::from_secs(30),
            push_pull_interval: Duration::from_secs(30),
            suspicion_mult: 4,
            suspicion_max_mult: 6,
            retransmit_mult: 3,
            max_awareness_mult: 8,
            expected_confirmations: 3,
            label: None,
        }
    }
}

/// Callbacks into the Serf overlay that the gossip engine never interprets
/// itself: authoritative join/leave notifications and the opaque user-state
/// blob exchanged during push/pull.
pub trait Delegate: Send + Sync {
    fn local_user_state(&self) -> Vec<u8>;
    fn merge_remote_user_state(&self, user_state: &[u8], is_join: bool);
    fn notify_join(&self, name: &str);
    fn notify_leave(&self, name: &str, is_dead: bool);

    /// Forwards a still-encoded Serf-overlay body (Join/Leave/UserEvent/
    /// Query/QueryResponse/Relay) to the Serf layer. The gossip engine
    /// shares one UDP socket and one compound-packet dispatcher for both
    /// layers but never interprets these bodies itself, matching §9's
    /// "refutation is orthogonal to transport" layering.
    fn handle_serf_packet(&self, msg_type: MsgType, body: Bytes, from: SocketAddr);
}

struct PendingProbe {
    tx: oneshot::Sender<()>,
}

struct SuspectEntry {
    timer: SuspicionTimer,
    deadline: Instant,
}

/// The gossip/failure-detector engine. One instance per node; owns the
/// member table and drives the probe/gossip/push-pull background loops.
pub struct Engine {
    local_name: String,
    local_addr: SocketAddr,
    tcp_bind_addr: SocketAddr,
    incarnation: AtomicU32,
    comm: Arc<Comm>,
    members: Arc<RwLock<MemberTable>>,
    broadcasts: Arc<Mutex<BroadcastQueues>>,
    awareness: Awareness,
    config: GossipConfig,
    keyring: Option<Arc<RwLock<Keyring>>>,
    delegate: Arc<dyn Delegate>,
    pending_probes: Mutex<HashMap<String, PendingProbe>>,
    seq_to_target: Mutex<HashMap<u32, String>>,
    seq_no: AtomicU32,
    suspicions: Mutex<HashMap<String, SuspectEntry>>,
    recently_dead: Mutex<HashMap<String, Instant>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_name: String,
        local_addr: SocketAddr,
        tcp_bind_addr: SocketAddr,
        comm: Arc<Comm>,
        members: Arc<RwLock<MemberTable>>,
        broadcasts: Arc<Mutex<BroadcastQueues>>,
        keyring: Option<Arc<RwLock<Keyring>>>,
        delegate: Arc<dyn Delegate>,
        config: GossipConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            local_name,
            local_addr,
            tcp_bind_addr,
            incarnation: AtomicU32::new(0),
            comm,
            members,
            broadcasts,
            awareness: Awareness::new(config.max_awareness_mult),
            config,
            keyring,
            delegate,
            pending_probes: Mutex::new(HashMap::new()),
            seq_to_target: Mutex::new(HashMap::new()),
            seq_no: AtomicU32::new(0),
            suspicions: Mutex::new(HashMap::new()),
            recently_dead: Mutex::new(HashMap::new()),
            shutdown_tx,
            shutdown_rx,
        }
    }

    fn next_seq(&self) -> u32 {
        self.seq_no.fetch_add(1, Ordering::Relaxed)
    }

    async fn member_count(&self) -> usize {
        self.members.read().await.len().max(1)
    }

    async fn retransmit_budget(&self) -> u32 {
        retransmit_limit(self.config.retransmit_mult, self.member_count().await)
    }

    fn encoder(&self) -> EncoderGuard<'_> {
        EncoderGuard { engine: self }
    }

    fn decoder(&self) -> DecoderGuard<'_> {
        DecoderGuard { engine: self }
    }

    /// Spawns the probe, gossip, and push/pull loops, returning their join
    /// handles so the coordinator can await them on shutdown.
    pub fn spawn_loops(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        vec![
            {
                let engine = self.clone();
                tokio::spawn(async move { engine.probe_loop().await })
            },
            {
                let engine = self.clone();
                tokio::spawn(async move { engine.gossip_loop().await })
            },
            {
                let engine = self.clone();
                tokio::spawn(async move { engine.push_pull_loop().await })
            },
            {
                let engine = self.clone();
                tokio::spawn(async move { engine.suspicion_sweep_loop().await })
            },
            {
                let engine = self.clone();
                tokio::spawn(async move { engine.packet_dispatch_loop().await })
            },
            {
                let engine = self.clone();
                tokio::spawn(async move { engine.request_dispatch_loop().await })
            },
        ]
    }

    /// Reads inbound UDP packets (pings, acks, compounded gossip) and
    /// dispatches each to its handler, peeling `Compound` into its parts.
    async fn packet_dispatch_loop(self: Arc<Self>) {
        let mut packets = self.comm.packet_stream();
        let mut rx = self.shutdown_rx.clone();
        loop {
            let (from, bytes) = tokio::select! {
                p = packets.next() => match p {
                    Some(p) => p,
                    None => break,
                },
                _ = rx.changed() => break,
            };
            if self.is_shutdown() {
                break;
            }
            self.dispatch_packet(from, bytes).await;
        }
    }

    async fn dispatch_packet(self: &Arc<Self>, from: SocketAddr, bytes: Bytes) {
        let decoder = self.decoder();
        let (msg_type, body) = match decoder.peel(bytes) {
            Ok(r) => r,
            Err(err) => {
                trace!("dropping undecodable packet from {}: {:?}", from, err);
                return;
            }
        };
        match msg_type {
            MsgType::Ping => {
                if let Ok(ping) = Decoder::deserialize(&body) {
                    self.handle_ping(ping, from).await;
                }
            }
            MsgType::IndirectPing => {
                if let Ok(ind) = Decoder::deserialize(&body) {
                    self.handle_indirect_ping(ind).await;
                }
            }
            MsgType::AckResp => {
                if let Ok(ack) = Decoder::deserialize::<messages::AckResp>(&body) {
                    if let Some(target) = self.seq_to_target.lock().await.get(&ack.seq_no).cloned() {
                        self.resolve_probe(&target).await;
                    }
                    self.resolve_probe(&format!("__indirect__{}", ack.seq_no)).await;
                }
            }
            MsgType::NackResp => {}
            MsgType::Suspect => {
                if let Ok(suspect) = Decoder::deserialize(&body) {
                    self.handle_suspect(suspect).await;
                }
            }
            MsgType::Alive => {
                if let Ok(alive) = Decoder::deserialize(&body) {
                    self.handle_alive(alive).await;
                }
            }
            MsgType::Dead => {
                if let Ok(dead) = Decoder::deserialize(&body) {
                    self.handle_dead(dead).await;
                }
            }
            MsgType::Compound => {
                if let Ok(compound) = Decoder::deserialize::<messages::Compound>(&body) {
                    for part in compound.parts {
                        self.dispatch_packet(from, Bytes::from(part)).await;
                    }
                }
            }
            MsgType::Join
            | MsgType::Leave
            | MsgType::UserEvent
            | MsgType::Query
            | MsgType::QueryResponse
            | MsgType::Relay => {
                self.delegate.handle_serf_packet(msg_type, body, from);
            }
            other => trace!("packet dispatch: unhandled type {:?} from {}", other, from),
        }
    }

    /// Answers inbound TCP push/pull requests.
    async fn request_dispatch_loop(self: Arc<Self>) {
        let mut listener = match self.comm.listen_requests(self.tcp_bind_addr).await {
            Ok(l) => l,
            Err(err) => {
                warn!("failed to bind push/pull request listener: {:?}", err);
                return;
            }
        };
        let mut rx = self.shutdown_rx.clone();
        loop {
            let (from, bytes, reply) = tokio::select! {
                r = listener.next() => match r {
                    Some(r) => r,
                    None => break,
                },
                _ = rx.changed() => break,
            };
            if self.is_shutdown() {
                break;
            }
            let decoder = self.decoder();
            let body = match decoder.peel(bytes) {
                Ok((MsgType::PushPull, body)) => body,
                Ok((other, _)) => {
                    trace!("push/pull listener got unexpected type {:?} from {}", other, from);
                    continue;
                }
                Err(err) => {
                    trace!("undecodable push/pull request from {}: {:?}", from, err);
                    continue;
                }
            };
            let remote: messages::PushPull = match Decoder::deserialize(&body) {
                Ok(m) => m,
                Err(_) => continue,
            };
            let response = self.handle_push_pull_request(remote).await;
            let _ = reply.send(response);
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    async fn probe_loop(self: Arc<Self>) {
        let mut rx = self.shutdown_rx.clone();
        loop {
            let interval = self.awareness.scale(self.config.probe_interval);
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = rx.changed() => break,
            }
            if self.is_shutdown() {
                break;
            }
            self.probe_once().await;
        }
    }

    /// One SWIM probe round: direct ping, then indirect + TCP fallback on
    /// timeout, then Suspect on total failure (§4.D steps 1-2).
    async fn probe_once(self: &Arc<Self>) {
        let target = {
            let mut members = self.members.write().await;
            let mut rng = StdRng::from_entropy();
            members.next_probe_target(&mut rng, &self.local_name)
        };
        let target = match target {
            Some(t) => t,
            None => return,
        };
        let target_addr = match self.members.read().await.get(&target) {
            Some(entry) => entry.info.node.addr,
            None => return,
        };

        let seq = self.next_seq();
        self.seq_to_target.lock().await.insert(seq, target.clone());
        let (tx, rx) = oneshot::channel();
        self.pending_probes
            .lock()
            .await
            .insert(target.clone(), PendingProbe { tx });

        let ping = messages::Ping {
            seq_no: seq,
            target: target.clone(),
            source_addr: self.local_addr,
        };
        if let Ok(bytes) = self.encoder().encode(MsgType::Ping, &ping) {
            let _ = self.comm.send_packet(target_addr, &bytes).await;
        }

        let direct_ok = tokio::time::timeout(self.config.probe_timeout, rx).await.is_ok();
        if direct_ok {
            self.awareness.on_success();
            self.seq_to_target.lock().await.remove(&seq);
            return;
        }

        // Direct ping timed out: fan out indirect probes plus a TCP fallback,
        // and give the target the remainder of the interval to respond via
        // any path (§4.D step 2).
        let (tx2, rx2) = oneshot::channel();
        self.pending_probes
            .lock()
            .await
            .insert(target.clone(), PendingProbe { tx: tx2 });

        let helpers = {
            let members = self.members.read().await;
            let mut rng = StdRng::from_entropy();
            members.random_alive_peers(&mut rng, self.config.indirect_checks, &target)
        };
        for helper in &helpers {
            if let Some(addr) = self.members.read().await.get(helper).map(|e| e.info.node.addr) {
                let ind = messages::IndirectPing {
                    seq_no: seq,
                    target: target.clone(),
                    target_addr,
                    source_addr: self.local_addr,
                    nack: true,
                };
                if let Ok(bytes) = self.encoder().encode(MsgType::IndirectPing, &ind) {
                    let _ = self.comm.send_packet(addr, &bytes).await;
                }
            }
        }

        let remaining = self
            .config
            .probe_interval
            .saturating_sub(self.config.probe_timeout);
        let ok = tokio::time::timeout(remaining.max(Duration::from_millis(1)), rx2)
            .await
            .is_ok();

        self.pending_probes.lock().await.remove(&target);
        self.seq_to_target.lock().await.remove(&seq);

        if ok {
            self.awareness.on_success();
            return;
        }

        self.awareness.on_miss();
        self.mark_suspect(&target, &self.local_name).await;
    }

    async fn mark_suspect(&self, target: &str, from: &str) {
        let incarnation = {
            let mut members = self.members.write().await;
            let entry = match members.get_mut(target) {
                Some(e) => e,
                None => return,
            };
            let gossip = entry.gossip.get_or_insert_with(|| NodeState::alive(0));
            if !gossip.apply_suspect(gossip.incarnation, false) {
                return;
            }
            gossip.incarnation
        };

        let n = self.member_count().await;
        let (min, max) = bounds(n, self.config.suspicion_mult, self.config.suspicion_max_mult, self.config.probe_interval);
        let timer = SuspicionTimer::new(min, max, self.config.expected_confirmations);
        self.suspicions.lock().await.insert(
            target.to_string(),
            SuspectEntry {
                timer,
                deadline: Instant::now() + max,
            },
        );

        self.broadcast_suspect(target, incarnation, from).await;
        warn!("marking {} as Suspect (incarnation {})", target, incarnation);
    }

    async fn broadcast_suspect(&self, target: &str, incarnation: u32, from: &str) {
        let msg = messages::Suspect {
            incarnation,
            node: target.to_string(),
            from: from.to_string(),
        };
        self.enqueue(Class::Memberlist, target, MsgType::Suspect, &msg).await;
    }

    async fn enqueue<T: serde::Serialize>(&self, class: Class, key: &str, msg_type: MsgType, msg: &T) {
        if let Ok(bytes) = self.encoder().encode(msg_type, msg) {
            let limit = self.retransmit_budget().await;
            let mut queues = self.broadcasts.lock().await;
            queues.set_limit(limit);
            queues.queue(class, format!("{:?}:{}", msg_type, key), bytes.to_vec(), None);
        }
    }

    /// Sweeps suspicion timers every 100ms, expiring any whose deadline has
    /// passed (§4.D: "Suspect -> suspicion timer fires -> Dead").
    async fn suspicion_sweep_loop(self: Arc<Self>) {
        let mut rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                _ = rx.changed() => break,
            }
            if self.is_shutdown() {
                break;
            }
            let now = Instant::now();
            let expired: Vec<String> = {
                let suspicions = self.suspicions.lock().await;
                suspicions
                    .iter()
                    .filter(|(_, e)| e.deadline <= now)
                    .map(|(name, _)| name.clone())
                    .collect()
            };
            for name in expired {
                self.suspicions.lock().await.remove(&name);
                let incarnation = {
                    let mut members = self.members.write().await;
                    match members.get_mut(&name).and_then(|e| e.gossip.as_mut()) {
                        Some(gossip) if gossip.expire_suspicion() => Some(gossip.incarnation),
                        _ => None,
                    }
                };
                if let Some(incarnation) = incarnation {
                    self.recently_dead.lock().await.insert(name.clone(), Instant::now());
                    self.delegate.notify_leave(&name, true);
                    let msg = messages::Dead {
                        incarnation,
                        node: name.clone(),
                        from: self.local_name.clone(),
                    };
                    self.enqueue(Class::Memberlist, &name, MsgType::Dead, &msg).await;
                    debug!("{} suspicion timer expired, marking Dead", name);
                }
            }
        }
    }

    async fn gossip_loop(self: Arc<Self>) {
        let mut rx = self.shutdown_rx.clone();
        loop {
            let interval = self.awareness.scale(self.config.gossip_interval);
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = rx.changed() => break,
            }
            if self.is_shutdown() {
                break;
            }
            self.gossip_once().await;
        }
    }

    async fn gossip_once(&self) {
        let budget = self.retransmit_budget().await;
        let parts = {
            let mut queues = self.broadcasts.lock().await;
            queues.set_limit(budget);
            // Overhead per part accounts for the compound length prefix.
            queues.drain_for_compound(2, crate::transport::UDP_BUFFER_SIZE, 255)
        };
        if parts.is_empty() {
            return;
        }

        let compound = messages::Compound { parts };
        let bytes = match self.encoder().encode(MsgType::Compound, &compound) {
            Ok(b) => b,
            Err(_) => return,
        };

        let mut targets = {
            let members = self.members.read().await;
            let mut rng = StdRng::from_entropy();
            members.random_alive_peers(&mut rng, self.config.gossip_nodes, &self.local_name)
        };

        let now = Instant::now();
        let dead_targets: Vec<String> = self
            .recently_dead
            .lock()
            .await
            .iter()
            .filter(|(_, since)| now.duration_since(**since) < self.config.gossip_to_the_dead_time)
            .map(|(name, _)| name.clone())
            .collect();
        targets.extend(dead_targets);

        for name in targets {
            if let Some(addr) = self.members.read().await.get(&name).map(|e| e.info.node.addr) {
                let _ = self.comm.send_packet(addr, &bytes).await;
            }
        }
    }

    async fn push_pull_loop(self: Arc<Self>) {
        let mut rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.push_pull_interval) => {}
                _ = rx.changed() => break,
            }
            if self.is_shutdown() {
                break;
            }
            self.push_pull_once().await;
        }
    }

    async fn push_pull_once(&self) {
        let peer = {
            let members = self.members.read().await;
            let mut rng = StdRng::from_entropy();
            members.random_alive_peers(&mut rng, 1, &self.local_name).into_iter().next()
        };
        let (peer, addr) = match peer {
            Some(name) => {
                let addr = self.members.read().await.get(&name).map(|e| e.info.node.addr);
                match addr {
                    Some(addr) => (name, addr),
                    None => return,
                }
            }
            None => return,
        };

        let local = self.snapshot_push_pull(false).await;
        let bytes = match self.encoder().encode(MsgType::PushPull, &local) {
            Ok(b) => b,
            Err(_) => return,
        };

        let response = match self.comm.request_stream(addr, bytes).await {
            Ok(r) => r,
            Err(err) => {
                trace!("push/pull with {} failed: {:?}", peer, err);
                return;
            }
        };

        let (_, body) = match self.decoder().peel(response) {
            Ok(r) => r,
            Err(_) => return,
        };
        let remote: messages::PushPull = match Decoder::deserialize(&body) {
            Ok(m) => m,
            Err(_) => return,
        };

        self.merge_remote(remote).await;
    }

    /// Dials each address directly and exchanges push/pull state, for nodes
    /// the member table doesn't know about yet (the coordinator's `Join`,
    /// §4.K). `push_pull_once` only ever targets an already-known peer, so
    /// joining needs this separate caller-supplied-address path. Returns how
    /// many of the given addresses answered.
    pub async fn join(self: &Arc<Self>, peers: &[SocketAddr]) -> usize {
        let local = self.snapshot_push_pull(true).await;
        let bytes = match self.encoder().encode(MsgType::PushPull, &local) {
            Ok(b) => b,
            Err(_) => return 0,
        };
        let mut successes = 0;
        for &addr in peers {
            let response = match self.comm.request_stream(addr, bytes.clone()).await {
                Ok(r) => r,
                Err(err) => {
                    trace!("join dial to {} failed: {:?}", addr, err);
                    continue;
                }
            };
            let (_, body) = match self.decoder().peel(response) {
                Ok(r) => r,
                Err(_) => continue,
            };
            let remote: messages::PushPull = match Decoder::deserialize(&body) {
                Ok(m) => m,
                Err(_) => continue,
            };
            self.merge_remote(remote).await;
            successes += 1;
        }
        successes
    }

    async fn snapshot_push_pull(&self, join: bool) -> messages::PushPull {
        let members = self.members.read().await;
        let nodes = members
            .iter()
            .filter_map(|(_, entry)| {
                entry.gossip.as_ref().map(|g| messages::PushPullNode {
                    name: entry.info.node.name.clone(),
                    addr: entry.info.node.addr,
                    incarnation: g.incarnation,
                    state: gossip_state_byte(g.state),
                    meta: entry.info.node.meta.clone(),
                    vsn: entry.info.node.vsn,
                })
            })
            .collect();
        messages::PushPull {
            nodes,
            user_state: self.delegate.local_user_state(),
            join,
        }
    }

    /// Merges a remote push/pull snapshot into the local table, applying the
    /// six-row transition table per node (§4.D) and delegating brand-new
    /// arrivals to the Serf overlay's authoritative join path.
    async fn merge_remote(&self, remote: messages::PushPull) {
        for node in remote.nodes {
            if node.name == self.local_name {
                self.handle_rumor_about_self(node.incarnation).await;
                continue;
            }

            let state = gossip_state_from_byte(node.state);
            let is_new = self.members.read().await.get(&node.name).is_none();
            if is_new {
                let mut members = self.members.write().await;
                if members.get(&node.name).is_none() {
                    members.insert_new_with_state(
                        Node {
                            name: node.name.clone(),
                            addr: node.addr,
                            meta: node.meta.clone(),
                            vsn: node.vsn,
                        },
                        node.incarnation,
                        state,
                    );
                }
                drop(members);
                // Mirror the existing-member dispatch below: a brand-new
                // member learned as already Dead/Left is never authoritatively
                // resurrected to Alive, and a brand-new Suspect member gets no
                // overlay notification until its suspicion resolves.
                match state {
                    GossipState::Dead | GossipState::Left => {
                        self.recently_dead.lock().await.insert(node.name.clone(), Instant::now());
                        self.delegate.notify_leave(&node.name, matches!(state, GossipState::Dead));
                    }
                    GossipState::Alive => self.delegate.notify_join(&node.name),
                    GossipState::Suspect => {}
                }
                continue;
            }
            let changed = {
                let mut members = self.members.write().await;
                let entry = match members.get_mut(&node.name) {
                    Some(e) => e,
                    None => continue,
                };
                let gossip = entry.gossip.get_or_insert_with(|| NodeState::alive(node.incarnation));
                match state {
                    GossipState::Alive => gossip.apply_alive(node.incarnation),
                    GossipState::Suspect => gossip.apply_suspect(node.incarnation, false),
                    GossipState::Dead | GossipState::Left => gossip.apply_dead(node.incarnation),
                }
            };
            if changed {
                self.suspicions.lock().await.remove(&node.name);
                if matches!(state, GossipState::Dead | GossipState::Left) {
                    self.recently_dead.lock().await.insert(node.name.clone(), Instant::now());
                    self.delegate.notify_leave(&node.name, matches!(state, GossipState::Dead));
                } else if matches!(state, GossipState::Alive) {
                    self.delegate.notify_join(&node.name);
                }
            }
        }

        self.delegate.merge_remote_user_state(&remote.user_state, remote.join);
    }

    /// A rumor claims our own name with `incarnation`. If it is not stale,
    /// refute by bumping our incarnation strictly higher and broadcasting
    /// Alive (§4.D's "rumor about self" row, §9 "refutation").
    async fn handle_rumor_about_self(&self, incarnation: u32) {
        let current = self.incarnation.load(Ordering::SeqCst);
        if incarnation < current {
            return;
        }
        let new_incarnation = self.incarnation.fetch_add(1, Ordering::SeqCst).max(incarnation) + 1;
        self.incarnation.store(new_incarnation, Ordering::SeqCst);

        let msg = messages::Alive {
            incarnation: new_incarnation,
            node: self.local_name.clone(),
            addr: self.local_addr,
            meta: Vec::new(),
            vsn: [0; 6],
        };
        self.enqueue(Class::Memberlist, &self.local_name, MsgType::Alive, &msg).await;
    }

    // -- Inbound handlers, invoked by the transport dispatcher --

    pub async fn handle_ping(&self, ping: messages::Ping, from: SocketAddr) {
        let ack = messages::AckResp { seq_no: ping.seq_no };
        if let Ok(bytes) = self.encoder().encode(MsgType::AckResp, &ack) {
            let target = if ping.source_addr.port() != 0 { ping.source_addr } else { from };
            let _ = self.comm.send_packet(target, &bytes).await;
        }
    }

    /// Resolves a pending probe for `target`, called once the dispatcher has
    /// matched an inbound `AckResp` back to the node it was probing.
    pub async fn resolve_probe(&self, target: &str) {
        if let Some(pending) = self.pending_probes.lock().await.remove(target) {
            let _ = pending.tx.send(());
        }
    }

    pub async fn handle_indirect_ping(&self, ind: messages::IndirectPing) {
        let ping = messages::Ping {
            seq_no: ind.seq_no,
            target: ind.target.clone(),
            source_addr: self.local_addr,
        };
        let relay_ok = if let Ok(bytes) = self.encoder().encode(MsgType::Ping, &ping) {
            if self.comm.send_packet(ind.target_addr, &bytes).await.is_ok() {
                let (tx, rx) = oneshot::channel();
                self.pending_probes.lock().await.insert(format!("__indirect__{}", ind.seq_no), PendingProbe { tx });
                tokio::time::timeout(self.config.probe_timeout, rx).await.is_ok()
            } else {
                false
            }
        } else {
            false
        };

        if relay_ok {
            let ack = messages::AckResp { seq_no: ind.seq_no };
            if let Ok(bytes) = self.encoder().encode(MsgType::AckResp, &ack) {
                let _ = self.comm.send_packet(ind.source_addr, &bytes).await;
            }
        } else if ind.nack {
            let nack = messages::NackResp { seq_no: ind.seq_no };
            if let Ok(bytes) = self.encoder().encode(MsgType::NackResp, &nack) {
                let _ = self.comm.send_packet(ind.source_addr, &bytes).await;
            }
        }
    }

    pub async fn handle_alive(&self, alive: messages::Alive) {
        if alive.node == self.local_name {
            self.handle_rumor_about_self(alive.incarnation).await;
            return;
        }
        let is_new = self.members.read().await.get(&alive.node).is_none();
        if is_new {
            self.members.write().await.insert_new(
                Node {
                    name: alive.node.clone(),
                    addr: alive.addr,
                    meta: alive.meta.clone(),
                    vsn: alive.vsn,
                },
                alive.incarnation,
            );
            self.delegate.notify_join(&alive.node);
            self.enqueue(Class::Memberlist, &alive.node, MsgType::Alive, &alive).await;
            return;
        }
        let changed = {
            let mut members = self.members.write().await;
            match members.get_mut(&alive.node).and_then(|e| e.gossip.as_mut()) {
                Some(gossip) => gossip.apply_alive(alive.incarnation),
                None => false,
            }
        };
        if changed {
            self.suspicions.lock().await.remove(&alive.node);
            self.delegate.notify_join(&alive.node);
            self.enqueue(Class::Memberlist, &alive.node, MsgType::Alive, &alive).await;
        }
    }

    pub async fn handle_suspect(&self, suspect: messages::Suspect) {
        if suspect.node == self.local_name {
            self.handle_rumor_about_self(suspect.incarnation).await;
            return;
        }
        if let Some(entry) = self.suspicions.lock().await.get_mut(&suspect.node) {
            let remaining = entry.timer.confirm(&suspect.from);
            entry.deadline = Instant::now() + remaining;
            return;
        }
        let changed = {
            let mut members = self.members.write().await;
            match members.get_mut(&suspect.node).and_then(|e| e.gossip.as_mut()) {
                Some(gossip) => gossip.apply_suspect(suspect.incarnation, false),
                None => false,
            }
        };
        if changed {
            self.mark_suspect(&suspect.node, &suspect.from).await;
        }
    }

    pub async fn handle_dead(&self, dead: messages::Dead) {
        if dead.node == self.local_name {
            self.handle_rumor_about_self(dead.incarnation).await;
            return;
        }
        let changed = {
            let mut members = self.members.write().await;
            match members.get_mut(&dead.node).and_then(|e| e.gossip.as_mut()) {
                Some(gossip) => gossip.apply_dead(dead.incarnation),
                None => false,
            }
        };
        if changed {
            self.suspicions.lock().await.remove(&dead.node);
            self.recently_dead.lock().await.insert(dead.node.clone(), Instant::now());
            self.delegate.notify_leave(&dead.node, true);
            self.enqueue(Class::Memberlist, &dead.node, MsgType::Dead, &dead).await;
        }
    }

    /// Answers an inbound push/pull request (we are the passive side).
    pub async fn handle_push_pull_request(&self, remote: messages::PushPull) -> Bytes {
        let join = remote.join;
        self.merge_remote(remote).await;
        let local = self.snapshot_push_pull(false).await;
        let _ = join;
        self.encoder().encode(MsgType::PushPull, &local).unwrap_or_default()
    }

    pub fn local_incarnation(&self) -> u32 {
        self.incarnation.load(Ordering::SeqCst)
    }
}

fn gossip_state_byte(state: GossipState) -> u8 {
    match state {
        GossipState::Alive => 0,
        GossipState::Suspect => 1,
        GossipState::Dead => 2,
        GossipState::Left => 3,
    }
}

fn gossip_state_from_byte(byte: u8) -> GossipState {
    match byte {
        0 => GossipState::Alive,
        1 => GossipState::Suspect,
        3 => GossipState::Left,
        _ => GossipState::Dead,
    }
}

/// Borrows the engine's label/keyring to build an [`Encoder`] without storing
/// a second copy of either.
struct EncoderGuard<'a> {
    engine: &'a Engine,
}

impl<'a> EncoderGuard<'a> {
    fn encode<T: serde::Serialize>(&self, msg_type: MsgType, body: &T) -> Result<Bytes> {
        // Keyring access is synchronous-read-only here; the gossip engine
        // only ever reads the current primary/all keys, never mutates them,
        // so a blocking try-read is acceptable off the async executor's
        // cooperative budget for this short critical section.
        let label = self.engine.config.label.as_deref();
        match &self.engine.keyring {
            Some(lock) => {
                let guard = lock.try_read();
                match guard {
                    Ok(keyring) if !keyring.is_empty() => Encoder { label, keyring: Some(&keyring) }.encode(msg_type, body),
                    _ => Encoder { label, keyring: None }.encode(msg_type, body),
                }
            }
            None => Encoder { label, keyring: None }.encode(msg_type, body),
        }
    }
}

/// Mirrors [`EncoderGuard`] for decoding: borrows the engine's label/keyring
/// for the duration of one `peel` call.
struct DecoderGuard<'a> {
    engine: &'a Engine,
}

impl<'a> DecoderGuard<'a> {
    fn peel(&self, bytes: Bytes) -> Result<(MsgType, Bytes)> {
        let label = self.engine.config.label.as_deref();
        match &self.engine.keyring {
            Some(lock) => {
                let guard = lock.try_read();
                match guard {
                    Ok(keyring) if !keyring.is_empty() => Decoder { label, keyring: Some(&keyring) }.peel(bytes),
                    _ => Decoder { label, keyring: None }.peel(bytes),
                }
            }
            None => Decoder { label, keyring: None }.peel(bytes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gossip_state_byte_round_trips() {
        for state in [GossipState::Alive, GossipState::Suspect, GossipState::Dead, GossipState::Left] {
            assert_eq!(gossip_state_from_byte(gossip_state_byte(state)), if state == GossipState::Dead { GossipState::Dead } else { state });
        }
    }
}
