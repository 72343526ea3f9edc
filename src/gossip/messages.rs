// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Msgpack bodies for the SWIM-layer message types (§6). Each struct pairs
//! with the [`crate::codec::MsgType`] variant of the same name.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Ping {
    pub seq_no: u32,
    pub target: String,
    pub source_addr: SocketAddr,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndirectPing {
    pub seq_no: u32,
    pub target: String,
    pub target_addr: SocketAddr,
    pub source_addr: SocketAddr,
    /// Also attempt a direct TCP ping, per §4.D step 2.
    pub nack: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AckResp {
    pub seq_no: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NackResp {
    pub seq_no: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Suspect {
    pub incarnation: u32,
    pub node: String,
    /// The peer that observed the timeout, so the suspicion timer on other
    /// nodes can register this as a confirmation.
    pub from: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Alive {
    pub incarnation: u32,
    pub node: String,
    pub addr: SocketAddr,
    pub meta: Vec<u8>,
    pub vsn: [u8; 6],
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Dead {
    pub incarnation: u32,
    pub node: String,
    pub from: String,
}

/// One peer's full state as exchanged in a push/pull sync.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PushPullNode {
    pub name: String,
    pub addr: SocketAddr,
    pub incarnation: u32,
    pub state: u8,
    pub meta: Vec<u8>,
    pub vsn: [u8; 6],
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PushPull {
    pub nodes: Vec<PushPullNode>,
    /// Serf-layer user state delegated opaquely by the gossip layer: the
    /// Serf overlay encodes member tags/status here; the gossip engine
    /// itself never interprets these bytes.
    pub user_state: Vec<u8>,
    pub join: bool,
}

/// `Compound{count(u8), [len(u16), body]×}`. Bundles up to 255 inner
/// messages into one datagram to amortize UDP overhead (§4.A).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Compound {
    pub parts: Vec<Vec<u8>>,
}
