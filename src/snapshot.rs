// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The crash-recovery snapshotter (§4.J): an append-only, line-oriented log
//! of the alive set and the three Lamport clocks, replayed on startup so a
//! restarted node doesn't have to rediscover its peers (or regress its
//! clocks) from scratch.
//!
//! Grounded on the teacher's `Comm` producer-consumer shape
//! (`transport::comm`): a bounded `tokio::sync::mpsc` channel feeding a
//! dedicated background task, with a `watch` channel driving cooperative
//! cancellation on shutdown. Here the pipeline is two bounded channels deep
//! (`inCh` -> tee -> `streamCh` -> writer) rather than one, matching §4.J's
//! own two-stage description, but the task/channel/`watch` idiom is the same
//! one `transport::comm::Comm::packet_stream` and
//! `gossip::Engine::packet_dispatch_loop` already use.

use crate::clock::LTime;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// A Lamport clock recovered from a snapshot is bumped past the highest
/// value seen on disk by this much, so a node that crashed between
/// incrementing a clock and flushing its new value can never hand out a
/// `LTime` it has already used (§4.J "recovers clocks... with a small safety
/// margin").
const CLOCK_SAFETY_BIAS: LTime = 1;

/// Tunables for the snapshotter, all taken from [`crate::config::Config`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotConfig {
    pub flush_interval: std::time::Duration,
    /// Deadline the final drain on shutdown gets before outstanding
    /// directives are abandoned (§4.J "Shutdown drain").
    pub shutdown_flush_timeout: std::time::Duration,
    /// Absolute floor on the on-disk size that triggers compaction,
    /// regardless of member count.
    pub min_compaction_size: u64,
    /// Per-member multiplier used to scale the compaction threshold with
    /// cluster size: `threshold = max(min_compaction_size, alive_len * factor)`.
    pub compaction_size_per_member: u64,
    pub in_channel_capacity: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            flush_interval: std::time::Duration::from_millis(500),
            shutdown_flush_timeout: std::time::Duration::from_millis(250),
            min_compaction_size: 4096,
            compaction_size_per_member: 128 * 2,
            in_channel_capacity: 2048,
        }
    }
}

/// One line of the on-disk log. `Coordinate` is accepted (and re-emitted
/// verbatim) on replay for forward compatibility with snapshots written by
/// network-coordinate-aware peers, but this crate never produces one itself
/// (network coordinates are out of scope, §2 Non-goals).
#[derive(Clone, Debug, PartialEq)]
enum Directive {
    Alive { name: String, addr: SocketAddr },
    NotAlive { name: String },
    Clock(LTime),
    EventClock(LTime),
    QueryClock(LTime),
    Coordinate { name: String, raw: String },
    Leave,
}

impl Directive {
    fn format(&self) -> String {
        match self {
            Directive::Alive { name, addr } => format!("alive: {} {}", name, addr),
            Directive::NotAlive { name } => format!("not-alive: {}", name),
            Directive::Clock(t) => format!("clock: {}", t),
            Directive::EventClock(t) => format!("event-clock: {}", t),
            Directive::QueryClock(t) => format!("query-clock: {}", t),
            Directive::Coordinate { name, raw } => format!("coordinate: {} {}", name, raw),
            Directive::Leave => "leave".to_string(),
        }
    }

    /// Parses one line, ignoring (not erroring on) anything unrecognised —
    /// §4.J: "unknown or malformed lines are skipped", so a future directive
    /// this version doesn't know about never blocks recovery.
    fn parse(line: &str) -> Option<Directive> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        if line == "leave" {
            return Some(Directive::Leave);
        }
        let (key, rest) = line.split_once(':')?;
        let rest = rest.trim();
        match key {
            "alive" => {
                let mut parts = rest.splitn(2, ' ');
                let name = parts.next()?.to_string();
                let addr: SocketAddr = parts.next()?.trim().parse().ok()?;
                Some(Directive::Alive { name, addr })
            }
            "not-alive" => Some(Directive::NotAlive { name: rest.to_string() }),
            "clock" => Some(Directive::Clock(rest.parse().ok()?)),
            "event-clock" => Some(Directive::EventClock(rest.parse().ok()?)),
            "query-clock" => Some(Directive::QueryClock(rest.parse().ok()?)),
            "coordinate" => {
                let mut parts = rest.splitn(2, ' ');
                let name = parts.next()?.to_string();
                let raw = parts.next().unwrap_or("").to_string();
                Some(Directive::Coordinate { name, raw })
            }
            _ => None,
        }
    }
}

/// What startup replay recovered from an existing snapshot file.
#[derive(Clone, Debug, Default)]
pub struct RecoveredState {
    pub alive: Vec<(String, SocketAddr)>,
    pub member_clock: LTime,
    pub event_clock: LTime,
    pub query_clock: LTime,
    /// Whether the log's last word before the crash/restart was `leave`.
    /// The coordinator decides what to do with this based on
    /// `rejoin_after_leave` (§4.J, §7 Open Question).
    pub left: bool,
}

struct SnapshotData {
    alive: HashMap<String, SocketAddr>,
}

struct SnapshotFile {
    writer: BufWriter<File>,
    path: PathBuf,
    size: u64,
}

/// The snapshotter: an `inCh` (capacity [`SnapshotConfig::in_channel_capacity`])
/// feeding a tee task that relays onto an internal `streamCh` of the same
/// capacity, consumed by the writer task that updates the in-memory alive
/// set and appends to the log. Pushing a directive onto `inCh` blocks once
/// it's full — that backpressure is intentional (§4.J): a snapshotter that
/// can't keep up with its disk should slow its producers down rather than
/// buffer unboundedly in memory.
pub struct Snapshotter {
    in_tx: mpsc::Sender<Directive>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    data: Arc<Mutex<SnapshotData>>,
    config: SnapshotConfig,
}

/// The receiver half and file handle [`Snapshotter::open`] sets up but
/// doesn't start consuming yet — handed to [`Snapshotter::spawn_loops`]
/// once the coordinator is ready to let the background tasks run.
pub struct SnapshotLoopInputs {
    in_rx: mpsc::Receiver<Directive>,
    file: Arc<Mutex<SnapshotFile>>,
}

impl Snapshotter {
    /// Opens (or creates) the snapshot file at `path`, replays it, and
    /// returns the live snapshotter handle, what replay recovered, and the
    /// inputs [`Self::spawn_loops`] needs. The background tee/writer tasks
    /// are not started yet, so the coordinator can finish wiring the rest of
    /// the node (which may itself consult `RecoveredState`) before anything
    /// starts writing.
    pub async fn open(
        path: PathBuf,
        config: SnapshotConfig,
        rejoin_after_leave: bool,
    ) -> crate::error::Result<(Arc<Self>, RecoveredState, SnapshotLoopInputs)> {
        let recovered = replay(&path, rejoin_after_leave).await?;

        let file = OpenOptions::new().create(true).append(true).open(&path).await?;
        let size = file.metadata().await.map(|m| m.len()).unwrap_or(0);

        let mut alive = HashMap::new();
        for (name, addr) in &recovered.alive {
            alive.insert(name.clone(), *addr);
        }

        let (in_tx, in_rx) = mpsc::channel(config.in_channel_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let this = Arc::new(Self {
            in_tx,
            shutdown_tx,
            shutdown_rx,
            data: Arc::new(Mutex::new(SnapshotData { alive })),
            config,
        });

        let file = Arc::new(Mutex::new(SnapshotFile { writer: BufWriter::new(file), path, size }));

        Ok((this, recovered, SnapshotLoopInputs { in_rx, file }))
    }

    /// Starts the tee and writer background loops from the inputs
    /// [`Self::open`] returned.
    pub fn spawn_loops(self: &Arc<Self>, inputs: SnapshotLoopInputs) -> Vec<JoinHandle<()>> {
        let SnapshotLoopInputs { in_rx, file: snapshot_file } = inputs;

        let (stream_tx, stream_rx) = mpsc::channel::<Directive>(self.config.in_channel_capacity.max(1));

        let tee = {
            let mut rx = self.shutdown_rx.clone();
            tokio::spawn(async move { tee_task(in_rx, stream_tx, &mut rx).await })
        };
        let writer = {
            let data = self.data.clone();
            let config = self.config.clone();
            let mut rx = self.shutdown_rx.clone();
            tokio::spawn(async move { writer_task(stream_rx, snapshot_file, data, config, &mut rx).await })
        };

        vec![tee, writer]
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn alive(&self, name: String, addr: SocketAddr) {
        let _ = self.in_tx.send(Directive::Alive { name, addr }).await;
    }

    pub async fn not_alive(&self, name: String) {
        let _ = self.in_tx.send(Directive::NotAlive { name }).await;
    }

    pub async fn update_clocks(&self, member: LTime, event: LTime, query: LTime) {
        let _ = self.in_tx.send(Directive::Clock(member)).await;
        let _ = self.in_tx.send(Directive::EventClock(event)).await;
        let _ = self.in_tx.send(Directive::QueryClock(query)).await;
    }

    pub async fn leave(&self) {
        let _ = self.in_tx.send(Directive::Leave).await;
    }

    /// Current in-memory alive set, as last observed by the writer task.
    /// Exposed for tests; the coordinator itself tracks the authoritative
    /// copy in [`crate::member::table::MemberTable`].
    pub async fn alive_set(&self) -> HashMap<String, SocketAddr> {
        self.data.lock().await.alive.clone()
    }
}

/// Relays `inCh` onto `streamCh` verbatim. On shutdown, drains whatever is
/// still buffered in `inCh` before returning so the writer task sees every
/// directive that was accepted before the signal (§4.J "Shutdown drain").
async fn tee_task(mut in_rx: mpsc::Receiver<Directive>, stream_tx: mpsc::Sender<Directive>, shutdown_rx: &mut watch::Receiver<bool>) {
    loop {
        tokio::select! {
            item = in_rx.recv() => match item {
                Some(directive) => {
                    if stream_tx.send(directive).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            _ = shutdown_rx.changed() => break,
        }
        if *shutdown_rx.borrow() {
            break;
        }
    }
    while let Ok(directive) = in_rx.try_recv() {
        if stream_tx.send(directive).await.is_err() {
            break;
        }
    }
}

/// Consumes `streamCh`, updating the in-memory alive set and appending each
/// directive to the log. Flushes the buffered writer every
/// [`SnapshotConfig::flush_interval`], immediately on `Alive`/`Leave` (the
/// directives a crash could least afford to lose), and compacts once the
/// file crosses the size threshold.
async fn writer_task(
    mut stream_rx: mpsc::Receiver<Directive>,
    file: Arc<Mutex<SnapshotFile>>,
    data: Arc<Mutex<SnapshotData>>,
    config: SnapshotConfig,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(config.flush_interval);
    loop {
        tokio::select! {
            item = stream_rx.recv() => match item {
                Some(directive) => apply_and_append(&directive, &file, &data, &config).await,
                None => break,
            },
            _ = ticker.tick() => flush(&file).await,
            _ = shutdown_rx.changed() => break,
        }
        if *shutdown_rx.borrow() {
            break;
        }
    }

    let deadline = tokio::time::Instant::now() + config.shutdown_flush_timeout;
    loop {
        match tokio::time::timeout_at(deadline, stream_rx.recv()).await {
            Ok(Some(directive)) => apply_and_append(&directive, &file, &data, &config).await,
            Ok(None) | Err(_) => break,
        }
    }
    flush(&file).await;
}

async fn apply_and_append(directive: &Directive, file: &Arc<Mutex<SnapshotFile>>, data: &Arc<Mutex<SnapshotData>>, config: &SnapshotConfig) {
    let force_flush = matches!(directive, Directive::Alive { .. } | Directive::Leave);

    {
        let mut data = data.lock().await;
        match directive {
            Directive::Alive { name, addr } => {
                data.alive.insert(name.clone(), *addr);
            }
            Directive::NotAlive { name } => {
                data.alive.remove(name);
            }
            Directive::Leave => {
                data.alive.clear();
            }
            _ => {}
        }
    }

    let line = directive.format();
    let mut guard = file.lock().await;
    if let Err(err) = guard.writer.write_all(line.as_bytes()).await {
        error!("snapshot write failed, disabling further writes: {:?}", err);
        return;
    }
    if let Err(err) = guard.writer.write_all(b"\n").await {
        error!("snapshot write failed, disabling further writes: {:?}", err);
        return;
    }
    guard.size += line.len() as u64 + 1;

    if force_flush {
        if let Err(err) = guard.writer.flush().await {
            warn!("snapshot flush failed: {:?}", err);
        }
    }

    let alive_len = data.lock().await.alive.len() as u64;
    let threshold = config.min_compaction_size.max(alive_len * config.compaction_size_per_member);
    if guard.size >= threshold {
        drop(guard);
        compact(file, data).await;
    }
}

async fn flush(file: &Arc<Mutex<SnapshotFile>>) {
    let mut guard = file.lock().await;
    if let Err(err) = guard.writer.flush().await {
        warn!("periodic snapshot flush failed: {:?}", err);
    }
}

/// Rewrites the log as just the current alive set plus the latest clocks,
/// dropping every historical `not-alive`/superseded `alive` line. The new
/// content is written to a sibling `.tmp` file and renamed over the original
/// — a rename is atomic on every platform this crate targets, so a crash
/// mid-compaction leaves either the old file or the new one, never a
/// half-written one (§4.J "Compaction").
async fn compact(file: &Arc<Mutex<SnapshotFile>>, data: &Arc<Mutex<SnapshotData>>) {
    let snapshot: Vec<(String, SocketAddr)> = {
        let data = data.lock().await;
        data.alive.iter().map(|(n, a)| (n.clone(), *a)).collect()
    };

    let mut body = String::new();
    for (name, addr) in &snapshot {
        body.push_str(&Directive::Alive { name: name.clone(), addr: *addr }.format());
        body.push('\n');
    }

    let mut guard = file.lock().await;
    let tmp_path = tmp_path_for(&guard.path);
    let write_result: std::io::Result<()> = async {
        let mut tmp = File::create(&tmp_path).await?;
        tmp.write_all(body.as_bytes()).await?;
        tmp.flush().await?;
        Ok(())
    }
    .await;

    if let Err(err) = write_result {
        warn!("snapshot compaction failed to write tmp file: {:?}", err);
        let _ = fs::remove_file(&tmp_path).await;
        return;
    }

    if let Err(err) = fs::rename(&tmp_path, &guard.path).await {
        warn!("snapshot compaction rename failed: {:?}", err);
        let _ = fs::remove_file(&tmp_path).await;
        return;
    }

    match OpenOptions::new().append(true).open(&guard.path).await {
        Ok(reopened) => {
            guard.writer = BufWriter::new(reopened);
            guard.size = body.len() as u64;
            debug!("compacted snapshot at {:?} to {} bytes", guard.path, guard.size);
        }
        Err(err) => error!("failed to reopen snapshot after compaction: {:?}", err),
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

/// Parses an existing snapshot file into the state a node should resume
/// with. A missing file is not an error — a brand-new node simply recovers
/// nothing.
async fn replay(path: &Path, rejoin_after_leave: bool) -> crate::error::Result<RecoveredState> {
    let file = match File::open(path).await {
        Ok(f) => f,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(RecoveredState::default()),
        Err(err) => return Err(err.into()),
    };

    let mut alive = HashMap::new();
    let mut member_clock = 0;
    let mut event_clock = 0;
    let mut query_clock = 0;
    let mut left = false;

    let mut lines = BufReader::new(file).lines();
    while let Some(line) = lines.next_line().await? {
        let directive = match Directive::parse(&line) {
            Some(d) => d,
            None => continue,
        };
        match directive {
            Directive::Alive { name, addr } => {
                alive.insert(name, addr);
                left = false;
            }
            Directive::NotAlive { name } => {
                alive.remove(&name);
            }
            Directive::Clock(t) => member_clock = member_clock.max(t),
            Directive::EventClock(t) => event_clock = event_clock.max(t),
            Directive::QueryClock(t) => query_clock = query_clock.max(t),
            Directive::Leave => {
                // §4.J "apply not-alive (remove) and leave (clear set if
                // RejoinAfterLeave=false)": when the operator has asked to
                // rejoin after a graceful leave, keep the recovered alive set
                // around as rejoin candidates instead of discarding it.
                if !rejoin_after_leave {
                    alive.clear();
                }
                left = true;
            }
            Directive::Coordinate { .. } => {}
        }
    }

    Ok(RecoveredState {
        alive: alive.into_iter().collect(),
        member_clock: member_clock + CLOCK_SAFETY_BIAS,
        event_clock: event_clock + CLOCK_SAFETY_BIAS,
        query_clock: query_clock + CLOCK_SAFETY_BIAS,
        left,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[test]
    fn directive_round_trips_through_format_and_parse() {
        let cases = vec![
            Directive::Alive { name: "a".into(), addr: addr(1) },
            Directive::NotAlive { name: "a".into() },
            Directive::Clock(42),
            Directive::EventClock(7),
            Directive::QueryClock(3),
            Directive::Leave,
        ];
        for d in cases {
            let line = d.format();
            assert_eq!(Directive::parse(&line), Some(d));
        }
    }

    #[test]
    fn malformed_and_unknown_lines_are_skipped() {
        assert_eq!(Directive::parse(""), None);
        assert_eq!(Directive::parse("nonsense"), None);
        assert_eq!(Directive::parse("alive: onlyname"), None);
        assert_eq!(Directive::parse("future-directive: 1 2 3"), None);
        assert_eq!(Directive::parse("clock: not-a-number"), None);
    }

    #[tokio::test]
    async fn replay_of_missing_file_recovers_nothing() {
        let recovered = replay(Path::new("/nonexistent/path/snapshot"), false).await.unwrap();
        assert!(recovered.alive.is_empty());
        assert_eq!(recovered.member_clock, 0);
    }

    #[tokio::test]
    async fn replay_recovers_alive_set_and_biases_clocks_past_the_last_seen_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("serf.snapshot");
        tokio::fs::write(
            &path,
            "alive: node1 127.0.0.1:1\nalive: node2 127.0.0.1:2\nnot-alive: node1\nclock: 10\nevent-clock: 5\n",
        )
        .await
        .unwrap();

        let recovered = replay(&path, false).await.unwrap();
        assert_eq!(recovered.alive, vec![("node2".to_string(), addr(2))]);
        assert_eq!(recovered.member_clock, 10 + CLOCK_SAFETY_BIAS);
        assert_eq!(recovered.event_clock, 5 + CLOCK_SAFETY_BIAS);
        assert!(!recovered.left);
    }

    #[tokio::test]
    async fn trailing_leave_is_recovered_as_left() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("serf.snapshot");
        tokio::fs::write(&path, "alive: node1 127.0.0.1:1\nleave\n").await.unwrap();

        let recovered = replay(&path, false).await.unwrap();
        assert!(recovered.left);
        assert!(recovered.alive.is_empty());
    }

    #[tokio::test]
    async fn trailing_leave_keeps_alive_set_when_rejoin_after_leave_is_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("serf.snapshot");
        tokio::fs::write(&path, "alive: node1 127.0.0.1:1\nleave\n").await.unwrap();

        let recovered = replay(&path, true).await.unwrap();
        assert!(recovered.left);
        assert_eq!(recovered.alive, vec![("node1".to_string(), addr(1))]);
    }

    #[tokio::test]
    async fn open_then_directives_are_visible_after_a_shutdown_drain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("serf.snapshot");
        let config = SnapshotConfig {
            flush_interval: Duration::from_millis(20),
            ..SnapshotConfig::default()
        };

        let (snap, recovered, inputs) = Snapshotter::open(path.clone(), config, false).await.unwrap();
        assert!(recovered.alive.is_empty());
        let handles = snap.spawn_loops(inputs);

        snap.alive("node1".to_string(), addr(1)).await;
        snap.alive("node2".to_string(), addr(2)).await;
        snap.not_alive("node1".to_string()).await;

        // give the writer a moment to drain before asking it to shut down
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(snap.alive_set().await.len(), 1);

        snap.shutdown();
        for h in handles {
            let _ = h.await;
        }

        let recovered_again = replay(&path, false).await.unwrap();
        assert_eq!(recovered_again.alive, vec![("node2".to_string(), addr(2))]);
    }
}
