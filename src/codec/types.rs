// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use crate::error::Error;

/// The leading type byte of every framed message, SWIM types first and Serf
/// overlay types after, matching the wire-compatible layout in spec §6.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    Ping = 0,
    IndirectPing = 1,
    AckResp = 2,
    NackResp = 3,
    Suspect = 4,
    Alive = 5,
    Dead = 6,
    PushPull = 7,
    Compound = 8,
    User = 9,
    Compress = 10,
    Encrypt = 11,
    Join = 12,
    Leave = 13,
    UserEvent = 14,
    Query = 15,
    QueryResponse = 16,
    KeyRequest = 17,
    Relay = 18,
    ConflictResponse = 19,
}

impl MsgType {
    pub fn from_byte(byte: u8) -> Result<Self, Error> {
        use MsgType::*;
        Ok(match byte {
            0 => Ping,
            1 => IndirectPing,
            2 => AckResp,
            3 => NackResp,
            4 => Suspect,
            5 => Alive,
            6 => Dead,
            7 => PushPull,
            8 => Compound,
            9 => User,
            10 => Compress,
            11 => Encrypt,
            12 => Join,
            13 => Leave,
            14 => UserEvent,
            15 => Query,
            16 => QueryResponse,
            17 => KeyRequest,
            18 => Relay,
            19 => ConflictResponse,
            other => {
                return Err(Error::MalformedFile {
                    kind: "packet",
                    path: String::new(),
                    reason: format!("unknown message type byte {}", other),
                })
            }
        })
    }
}
