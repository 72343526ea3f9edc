// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The coordinator (§4.K): wires the transport, broadcast queues, gossip/FD
//! engine, Serf overlay, query engine, key manager and snapshotter into one
//! node, and owns the lifecycle the other modules only participate in —
//! `create`/`join`/`leave`/`shutdown`, the reaper loop, and the optional
//! reconnector loop.
//!
//! Grounded on the same `Arc<Inner>` + `spawn_loops(self: &Arc<Self>) ->
//! Vec<JoinHandle<()>>` shape [`crate::gossip::Engine`] and [`crate::serf::Serf`]
//! already use one layer down — the coordinator is simply the outermost
//! instance of that pattern, matching the teacher's `routing::Core` sitting
//! above `routing::comm::Comm`.
//!
//! Lock discipline (§5): `members` (the `memberLock`), `broadcasts`, and the
//! keyring's `RwLock` are the only locks the coordinator itself ever takes,
//! and only ever across a synchronous section — never held across an
//! `.await`. Everything else is owned outright by the subsystem that uses
//! it (`gossip::Engine`, `serf::Serf`, `query::QueryManager`) and is never
//! reached into directly.

use crate::broadcast::BroadcastQueues;
use crate::clock::LamportClock;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::{EventSink, NullEventSink};
use crate::gossip::Engine as GossipEngine;
use crate::keyring::Keyring;
use crate::member::table::MemberTable;
use crate::member::{Node, Status, Tags};
use crate::query::keymgr::{KeyManager, KeyResponseAggregate};
use crate::query::{QueryHandle, QueryManager, QueryParam};
use crate::serf::Serf;
use crate::snapshot::Snapshotter;
use crate::transport::Comm;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

struct Inner {
    config: Config,
    members: Arc<RwLock<MemberTable>>,
    broadcasts: Arc<Mutex<BroadcastQueues>>,
    comm: Arc<Comm>,
    gossip: Arc<GossipEngine>,
    serf: Serf,
    query: Arc<QueryManager>,
    keymgr: KeyManager,
    snapshot: Option<Arc<Snapshotter>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
    left: AtomicBool,
}

/// The top-level handle onto a running node. Cheaply clonable; every method
/// either reads cheap atomics or awaits one of the subsystem locks listed in
/// the module's lock-discipline note above.
#[derive(Clone)]
pub struct Coordinator(Arc<Inner>);

impl std::ops::Deref for Coordinator {
    type Target = Inner;
    fn deref(&self) -> &Inner {
        &self.0
    }
}

impl Coordinator {
    /// Brings a node up: validates `config`, opens the snapshotter (replaying
    /// any existing log), binds the UDP socket, builds the member table
    /// (seeded from the recovered alive set), constructs the gossip engine,
    /// Serf overlay, and query engine, inserts the local node as `Alive`, and
    /// spawns every background loop. Returns a fully running [`Coordinator`].
    pub async fn create(config: Config, sink: Option<Arc<dyn EventSink>>) -> Result<Self> {
        config.validate()?;

        let keyring = match &config.keyring_file {
            Some(path) if path.exists() => {
                let loaded = Keyring::load(path)?;
                Some(Arc::new(RwLock::new(loaded)))
            }
            Some(path) => {
                let kr = match &config.encrypt_key {
                    Some(key) => Keyring::new(key.clone())?,
                    None => Keyring::empty(),
                };
                if !kr.is_empty() {
                    kr.save(path)?;
                }
                Some(Arc::new(RwLock::new(kr)))
            }
            None => config.encrypt_key.as_ref().map(|key| -> Result<_> {
                Ok(Arc::new(RwLock::new(Keyring::new(key.clone())?)))
            }).transpose()?,
        };

        let (snapshot, recovered, snapshot_inputs) = match &config.snapshot_path {
            Some(path) => {
                let (snap, recovered, inputs) =
                    Snapshotter::open(path.clone(), config.snapshot.clone(), config.rejoin_after_leave).await?;
                (Some(snap), recovered, Some(inputs))
            }
            None => (None, crate::snapshot::RecoveredState::default(), None),
        };

        if recovered.left && !config.rejoin_after_leave {
            info!("snapshot recovered a prior leave; starting in the Left state per rejoin_after_leave=false");
        }

        // Tags file is the authority once present: an existing file wins
        // over `config.tags` (e.g. tags set by a prior run's `set_tags`),
        // otherwise it's seeded from `config.tags` so a later restart has
        // something to load (mirrors the keyring_file seeding above).
        let initial_tags = match &config.tags_file {
            Some(path) if path.exists() => crate::tags::load(path)?,
            Some(path) => {
                crate::tags::save(&config.tags, path)?;
                config.tags.clone()
            }
            None => config.tags.clone(),
        };

        let members = Arc::new(RwLock::new(MemberTable::new()));
        let broadcasts_inner = BroadcastQueues::new(crate::broadcast::retransmit_limit(config.gossip.retransmit_mult, 1));
        let broadcasts = Arc::new(Mutex::new(broadcasts_inner));

        let comm = Arc::new(
            Comm::new(config.bind_addr, config.advertise_addr, config.cidr_allow_list(), config.stream_timeout).await?,
        );

        let sink: Arc<dyn EventSink> = sink.unwrap_or_else(|| Arc::new(NullEventSink));

        let query_clock = Arc::new(LamportClock::starting_at(recovered.query_clock));
        let query = Arc::new(QueryManager::new(
            config.node_name.clone(),
            config.advertise_addr,
            query_clock,
            comm.clone(),
            broadcasts.clone(),
            keyring.clone(),
            config.label.clone(),
            members.clone(),
            config.query_timeout,
            config.query_buffer_size,
        ));

        let keymgr = KeyManager::new(query.clone(), members.clone(), config.key_query_timeout);

        let serf = Serf::new(
            config.node_name.clone(),
            config.advertise_addr,
            recovered.member_clock,
            recovered.event_clock,
            query.clone(),
            members.clone(),
            broadcasts.clone(),
            comm.clone(),
            keyring.clone(),
            config.label.clone(),
            initial_tags,
            config.tags_file.clone(),
            sink,
            config.event_buffer_size,
            config.serf.clone(),
        );

        let mut gossip_config = config.gossip.clone();
        gossip_config.label = config.label.clone();
        let gossip = Arc::new(GossipEngine::new(
            config.node_name.clone(),
            config.advertise_addr,
            config.tcp_bind_addr,
            comm.clone(),
            members.clone(),
            broadcasts.clone(),
            keyring.clone(),
            Arc::new(serf.clone()),
            gossip_config,
        ));

        // Seed the table with whatever the snapshot recovered as alive, so
        // the reconnector loop (and an operator re-running `join`) has
        // somewhere to start even before the first push/pull.
        if config.rejoin_after_leave || !recovered.left {
            let mut table = members.write().await;
            for (name, addr) in &recovered.alive {
                if name != &config.node_name {
                    table.insert_new(Node::new(name.clone(), *addr), 0);
                }
            }
        }

        {
            let mut table = members.write().await;
            table.insert_new(Node::new(config.node_name.clone(), config.advertise_addr), gossip.local_incarnation());
            if let Some(entry) = table.get_mut(&config.node_name) {
                entry.info.status = Status::Alive;
            }
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let inner = Arc::new(Inner {
            config,
            members,
            broadcasts,
            comm,
            gossip,
            serf,
            query,
            keymgr,
            snapshot,
            shutdown_tx,
            shutdown_rx,
            handles: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
            left: AtomicBool::new(false),
        });
        let this = Coordinator(inner);

        let mut handles = Vec::new();
        if let (Some(snap), Some(inputs)) = (&this.snapshot, snapshot_inputs) {
            handles.extend(snap.spawn_loops(inputs));
            snap.alive(this.config.node_name.clone(), this.config.advertise_addr).await;
        }
        handles.extend(this.gossip.spawn_loops());
        handles.extend(this.serf.spawn_loops());
        handles.push(this.clone().spawn_reaper_loop());
        if this.config.gossip.gossip_to_the_dead_time > std::time::Duration::from_secs(0) {
            handles.push(this.clone().spawn_reconnector_loop());
        }
        *this.handles.lock().await = handles;

        Ok(this)
    }

    /// Dials each address in `peers` directly, push/pull-exchanging member
    /// state, then broadcasts the local join intent so the rest of the
    /// cluster learns of it over gossip rather than a second round of dials.
    /// Returns how many peers answered.
    pub async fn join(&self, peers: &[SocketAddr]) -> Result<usize> {
        if self.is_shut_down() {
            return Err(Error::LifecycleMisuse("join called after shutdown"));
        }
        let successes = self.gossip.join(peers).await;
        self.serf.broadcast_join_intent().await;
        Ok(successes)
    }

    /// Graceful leave (§4.K "Leave"): `Alive -> Leaving`, broadcast the leave
    /// intent, wait up to `broadcast_timeout` for it to finish propagating,
    /// then sleep `leave_propagate_delay` before settling into `Left` —
    /// unless a concurrent `shutdown` raced in first.
    pub async fn leave(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(Error::LifecycleMisuse("leave called after shutdown"));
        }
        if self.left.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.serf.broadcast_leave_intent().await;

        // The broadcast queue's own retransmit accounting is the closest
        // thing to an acknowledgement this layer exposes; approximate
        // "wait for acknowledgement" by giving the gossip loop up to
        // `broadcast_timeout` to draw and send it at least once.
        tokio::time::sleep(self.config.broadcast_timeout).await;

        if let Some(snap) = &self.snapshot {
            snap.leave().await;
        }

        tokio::time::sleep(self.config.leave_propagate_delay).await;

        if self.is_shut_down() {
            return Ok(());
        }

        {
            let mut members = self.members.write().await;
            members.on_memberlist_leave(&self.config.node_name, false);
        }
        debug!("local node transitioned to Left after leave_propagate_delay");
        Ok(())
    }

    /// Tears the node down: signals every background loop to stop and awaits
    /// them all, then shuts the subsystems that own their own sockets/files.
    /// Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        self.gossip.shutdown();
        self.serf.shutdown();
        if let Some(snap) = &self.snapshot {
            snap.shutdown();
        }
        self.comm.shutdown().await;

        let handles = std::mem::take(&mut *self.handles.lock().await);
        for handle in handles {
            let _ = handle.await;
        }
        info!("coordinator shutdown complete, no background task remains");
    }

    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Reaps `Failed`/`Left` members past their retention window every
    /// `reap_interval`, writing a `not-alive` snapshot directive for each one
    /// removed so a restart doesn't resurrect them from an already-stale log
    /// entry.
    fn spawn_reaper_loop(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut rx = self.shutdown_rx.clone();
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.reap_interval) => {}
                    _ = rx.changed() => break,
                }
                if *rx.borrow() {
                    break;
                }
                let removed = {
                    let mut members = self.members.write().await;
                    members.reap(self.config.reconnect_timeout, self.config.tombstone_timeout)
                };
                if removed.is_empty() {
                    continue;
                }
                debug!("reaper removed {} member(s): {:?}", removed.len(), removed);
                if let Some(snap) = &self.snapshot {
                    for name in &removed {
                        snap.not_alive(name.clone()).await;
                    }
                }
            }
        })
    }

    /// Optional: periodically tries to rejoin a random `Failed` member over
    /// TCP, so a transient network partition heals without an operator
    /// manually re-running `join` (§4.K "Reconnector").
    fn spawn_reconnector_loop(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut rx = self.shutdown_rx.clone();
            let mut rng = rand::rngs::StdRng::from_entropy();
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.gossip.gossip_to_the_dead_time) => {}
                    _ = rx.changed() => break,
                }
                if *rx.borrow() {
                    break;
                }
                let candidate = {
                    let members = self.members.read().await;
                    let mut failed: Vec<SocketAddr> = members
                        .iter()
                        .filter(|(_, entry)| entry.info.status == Status::Failed)
                        .map(|(_, entry)| entry.info.node.addr)
                        .collect();
                    failed.shuffle(&mut rng);
                    failed.into_iter().next()
                };
                if let Some(addr) = candidate {
                    let successes = self.gossip.join(&[addr]).await;
                    if successes > 0 {
                        debug!("reconnector successfully re-joined {}", addr);
                    }
                }
            }
        })
    }

    /// Current snapshot of the member table, for callers that just want to
    /// list the cluster (`members` CLI command's library-side data source).
    pub async fn members(&self) -> Vec<crate::member::MemberInfo> {
        self.members.read().await.iter().map(|(_, entry)| entry.info.clone()).collect()
    }

    pub fn tags(&self) -> Tags {
        self.serf.tags()
    }

    /// Replaces the local node's tags. Exchanged with peers on the next
    /// push/pull round, matching [`Serf::set_tags`]'s own doc note.
    pub fn set_tags(&self, tags: Tags) {
        self.serf.set_tags(tags);
    }

    pub async fn user_event(&self, name: String, payload: Vec<u8>, coalesce: bool) -> Result<u64> {
        self.serf.user_event(name, payload, coalesce).await
    }

    pub async fn query(&self, name: String, payload: Vec<u8>, param: QueryParam) -> Result<QueryHandle> {
        self.query.query(name, payload, param).await
    }

    pub async fn install_key(&self, key: Vec<u8>) -> Result<KeyResponseAggregate> {
        self.keymgr.install_key(key).await
    }

    pub async fn use_key(&self, key: Vec<u8>) -> Result<KeyResponseAggregate> {
        self.keymgr.use_key(key).await
    }

    pub async fn remove_key(&self, key: Vec<u8>) -> Result<KeyResponseAggregate> {
        self.keymgr.remove_key(key).await
    }

    pub async fn list_keys(&self) -> Result<KeyResponseAggregate> {
        self.keymgr.list_keys().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ChannelEventSink;
    use std::net::SocketAddr;

    fn addr() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn test_config(name: &str) -> Config {
        let mut cfg = Config::new(name, addr());
        cfg.reap_interval = std::time::Duration::from_secs(3600);
        cfg.gossip.gossip_to_the_dead_time = std::time::Duration::from_secs(0);
        cfg
    }

    #[tokio::test]
    async fn create_then_shutdown_leaves_no_background_task() {
        let cfg = test_config("node1");
        let (sink, _rx) = ChannelEventSink::new(16);
        let coord = Coordinator::create(cfg, Some(Arc::new(sink))).await.unwrap();
        assert_eq!(coord.members().await.len(), 1);
        coord.shutdown().await;
        // idempotent
        coord.shutdown().await;
    }

    #[tokio::test]
    async fn leave_after_shutdown_is_rejected() {
        let cfg = test_config("node2");
        let coord = Coordinator::create(cfg, None).await.unwrap();
        coord.shutdown().await;
        assert!(matches!(coord.leave().await, Err(Error::LifecycleMisuse(_))));
    }

    #[tokio::test]
    async fn join_against_an_unreachable_peer_reports_zero_successes() {
        let cfg = test_config("solo");
        let coord = Coordinator::create(cfg, None).await.unwrap();

        let nobody_listening: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let joined = coord.join(&[nobody_listening]).await.unwrap();
        assert_eq!(joined, 0);

        coord.shutdown().await;
    }
}
