// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Msgpack bodies for the Serf-overlay message types (§6): join/leave
//! intents, user events, queries/responses, key requests, relays, and
//! conflict responses. Pairs with the Serf-layer [`crate::codec::MsgType`]
//! variants, mirroring [`crate::gossip::messages`] one level up.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Join {
    pub ltime: u64,
    pub node: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Leave {
    pub ltime: u64,
    pub node: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserEvent {
    pub ltime: u64,
    pub name: String,
    pub payload: Vec<u8>,
    pub coalesce: bool,
}

/// Node-name whitelist plus tag-regex map, ANDed together (§4.G "Filter
/// semantics"). An empty `nodes` list matches every node.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Filters {
    pub nodes: Vec<String>,
    /// `(tag name, regex pattern)`; the pattern is anchored with `^...$`
    /// at evaluation time if it is not already.
    pub tags: Vec<(String, String)>,
}

impl Filters {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.tags.is_empty()
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct QueryFlags {
    /// Whether responders should send an immediate ack in addition to any
    /// response payload.
    pub ack: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Query {
    pub ltime: u64,
    pub id: u64,
    pub name: String,
    pub payload: Vec<u8>,
    pub filters: Filters,
    pub flags: QueryFlags,
    pub relay_factor: u8,
    pub timeout_ms: u64,
    pub source_name: String,
    pub source_addr: SocketAddr,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryResponse {
    pub ltime: u64,
    pub id: u64,
    pub from: String,
    pub payload: Vec<u8>,
    pub ack: bool,
}

/// Wraps a response so it can be forwarded through `relay_factor` random
/// peers instead of going straight back to the query source (§4.G).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Relay {
    pub target: SocketAddr,
    pub inner_type: u8,
    pub inner_body: Vec<u8>,
}

/// Body of the `install-key`/`use-key`/`remove-key` internal queries
/// (§4.H); `list-keys` carries `key: None`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyRequest {
    pub key: Option<Vec<u8>>,
}

/// Response body for every key-manager internal query.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeyResponse {
    pub result: bool,
    pub message: String,
    /// Populated only for `list-keys`: base64-encoded key -> not meaningful
    /// per-node, so the aggregator on the query side counts occurrences.
    pub keys: Vec<String>,
}

/// Response to the `conflict-resolution` internal query: how the responder
/// itself sees the disputed node (§7 "Intent conflict").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConflictResponse {
    pub node_name: String,
    pub addr: SocketAddr,
}
