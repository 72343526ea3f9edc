// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The single `serde`-derived tunables struct every subsystem's own config
//! (`gossip::GossipConfig`, `serf::SerfConfig`, `snapshot::SnapshotConfig`)
//! is built from. Grounded on the teacher's `node::Config` / structopt CLI
//! pattern: one flat struct an application constructs (by hand, from a file,
//! or from flags in [`crate::bin`]'s binary), validated once at startup and
//! then handed piecemeal to the modules that need it.

use crate::error::{Error, Result};
use crate::gossip::GossipConfig;
use crate::member::Tags;
use crate::serf::SerfConfig;
use crate::snapshot::SnapshotConfig;
use crate::transport::CidrAllowList;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Everything [`crate::coordinator::Coordinator`] needs to bring a node up.
///
/// Most fields have sensible defaults (see [`Default`]); only `node_name`,
/// `bind_addr`, and `advertise_addr` are commonly overridden per deployment.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node_name: String,
    pub bind_addr: SocketAddr,
    pub advertise_addr: SocketAddr,
    pub tcp_bind_addr: SocketAddr,

    /// Source CIDRs allowed to dial in over TCP. Empty means "allow all",
    /// matching [`CidrAllowList::new`]'s own empty-list behaviour.
    pub cidrs_allowed: Vec<(IpAddr, u8)>,

    /// Network-level label prepended to every encoded frame (§4.A); lets
    /// several independent clusters share one multicast-free network
    /// without cross-decoding each other's traffic.
    pub label: Option<String>,

    pub tags: Tags,

    /// Where `tags` is persisted as a JSON object (§6 "Persisted tags file
    /// format"). `None` means tags live in memory only, seeded from `tags`
    /// above and lost across restarts.
    pub tags_file: Option<PathBuf>,

    /// Where the local symmetric keyring is persisted. `None` disables
    /// encryption entirely (gossip and Serf frames are sent in the clear).
    pub keyring_file: Option<PathBuf>,

    /// A single key to seed the keyring with on first start, when
    /// `keyring_file` doesn't exist yet or is empty.
    pub encrypt_key: Option<Vec<u8>>,

    /// Where member-list snapshots are written for crash recovery (§4.J).
    /// `None` disables snapshotting.
    pub snapshot_path: Option<PathBuf>,

    /// Whether a `leave` directive recovered from the snapshot should be
    /// honoured as "stay out of the cluster" (`false`, the default) or
    /// treated as stale and ignored so the node rejoins on its own (`true`).
    pub rejoin_after_leave: bool,

    /// Whether observing two different addresses claim the same node name
    /// (§4.K's conflict resolution) should shut the coordinator down
    /// automatically once the cluster majority disagrees with us, rather
    /// than just logging and carrying on. Defaults to `false`: a name
    /// conflict is surfaced as an event, never as an automatic shutdown,
    /// unless the operator opts in.
    pub conflict_auto_shutdown: bool,

    pub stream_timeout: Duration,

    pub gossip: GossipConfig,
    pub serf: SerfConfig,
    pub snapshot: SnapshotConfig,

    pub query_timeout: Duration,
    pub query_buffer_size: u64,
    pub key_query_timeout: Duration,
    pub event_buffer_size: u64,

    /// How often the reaper loop removes tombstoned (`Failed`/`Left`)
    /// members from the table (§4.K).
    pub reap_interval: Duration,
    /// How long a `Failed` member is kept before being reaped.
    pub reconnect_timeout: Duration,
    /// How long a `Left` member is kept before being reaped.
    pub tombstone_timeout: Duration,

    /// How long `Coordinator::leave` waits for the leave intent to finish
    /// propagating before moving on (§4.K "Leave").
    pub broadcast_timeout: Duration,
    /// How long `Coordinator::leave` sleeps after the broadcast has gone
    /// out before transitioning the local node to `Left` (§4.K "Leave",
    /// §3 "`OnLeaveComplete`").
    pub leave_propagate_delay: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let unspecified: SocketAddr = "0.0.0.0:7946".parse().expect("valid default bind addr");
        Self {
            node_name: String::new(),
            bind_addr: unspecified,
            advertise_addr: unspecified,
            tcp_bind_addr: unspecified,
            cidrs_allowed: Vec::new(),
            label: None,
            tags: Tags::new(),
            tags_file: None,
            keyring_file: None,
            encrypt_key: None,
            snapshot_path: None,
            rejoin_after_leave: false,
            conflict_auto_shutdown: false,
            stream_timeout: Duration::from_secs(10),
            gossip: GossipConfig::default(),
            serf: SerfConfig::default(),
            snapshot: SnapshotConfig::default(),
            query_timeout: Duration::from_secs(15),
            query_buffer_size: 1024,
            key_query_timeout: Duration::from_secs(10),
            event_buffer_size: 512,
            reap_interval: Duration::from_secs(15),
            reconnect_timeout: Duration::from_secs(24 * 60 * 60),
            tombstone_timeout: Duration::from_secs(24 * 60 * 60),
            broadcast_timeout: Duration::from_secs(5),
            leave_propagate_delay: Duration::from_secs(1),
        }
    }
}

impl Config {
    pub fn new(node_name: impl Into<String>, bind_addr: SocketAddr) -> Self {
        Self {
            node_name: node_name.into(),
            bind_addr,
            advertise_addr: bind_addr,
            tcp_bind_addr: bind_addr,
            ..Default::default()
        }
    }

    pub fn cidr_allow_list(&self) -> CidrAllowList {
        CidrAllowList::new(self.cidrs_allowed.clone())
    }

    /// Rejects configuration that would fail or misbehave at startup,
    /// before any socket is bound or file is opened (§7: "configuration
    /// invalid at startup" is the one class of startup-fatal error).
    pub fn validate(&self) -> Result<()> {
        if self.node_name.is_empty() {
            return Err(Error::InvalidConfig("node_name must not be empty".into()));
        }
        if self.node_name.len() > 128 {
            return Err(Error::InvalidConfig("node_name must be at most 128 bytes".into()));
        }
        if let Some(label) = &self.label {
            if label.len() > 255 {
                return Err(Error::InvalidConfig("label must be at most 255 bytes".into()));
            }
        }
        if let Some(key) = &self.encrypt_key {
            if !matches!(key.len(), 16 | 24 | 32) {
                return Err(Error::InvalidConfig(format!(
                    "encrypt_key must be 16, 24, or 32 bytes, got {}",
                    key.len()
                )));
            }
        }
        if self.gossip.probe_timeout >= self.gossip.probe_interval {
            return Err(Error::InvalidConfig(
                "gossip.probe_timeout must be less than gossip.probe_interval".into(),
            ));
        }
        if self.gossip.suspicion_max_mult < 1 {
            return Err(Error::InvalidConfig("gossip.suspicion_max_mult must be at least 1".into()));
        }
        if self.query_buffer_size == 0 {
            return Err(Error::InvalidConfig("query_buffer_size must be at least 1".into()));
        }
        if self.event_buffer_size == 0 {
            return Err(Error::InvalidConfig("event_buffer_size must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid_once_named() {
        let mut cfg = Config::default();
        cfg.node_name = "node1".into();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn empty_node_name_is_rejected() {
        let cfg = Config::default();
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn bad_key_length_is_rejected() {
        let mut cfg = Config::default();
        cfg.node_name = "node1".into();
        cfg.encrypt_key = Some(vec![0u8; 10]);
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn probe_timeout_must_be_shorter_than_interval() {
        let mut cfg = Config::default();
        cfg.node_name = "node1".into();
        cfg.gossip.probe_timeout = cfg.gossip.probe_interval;
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));
    }
}
