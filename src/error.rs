// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use std::net::SocketAddr;
use thiserror::Error;

/// A specialised `Result` type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Structured error kinds surfaced by the core engine.
///
/// Variants are grouped loosely by the subsystem that raises them; callers
/// that only care whether an error is fatal-at-startup should use
/// [`Error::is_fatal`] rather than matching on the full set.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The packet or stream label did not match the configured cluster label.
    #[error("label mismatch: expected {expected:?}, got {got:?}")]
    LabelMismatch {
        expected: Option<String>,
        got: Option<String>,
    },

    /// CRC32 check failed on an inbound UDP datagram.
    #[error("CRC32 mismatch on inbound packet")]
    CrcMismatch,

    /// Decryption failed with every key in the keyring.
    #[error("failed to decrypt message with any known key")]
    DecryptionFailed,

    /// Msgpack encode/decode failure.
    #[error("serialisation error: {0}")]
    Serialisation(String),

    /// A keyring, tags, or snapshot file was malformed.
    #[error("malformed {kind} file at {path}: {reason}")]
    MalformedFile {
        kind: &'static str,
        path: String,
        reason: String,
    },

    /// I/O failure talking to disk (snapshot, keyring, tags).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A send to `addr` failed after exhausting all fallbacks.
    #[error("failed to send to {addr}")]
    SendFailed { addr: SocketAddr },

    /// No live connection and dialing a fresh one failed.
    #[error("failed to dial {addr}: {reason}")]
    DialFailed { addr: SocketAddr, reason: String },

    /// A remote peer is running an incompatible protocol version.
    #[error("protocol version mismatch with {addr}: local max {local_max}, remote min {remote_min}")]
    ProtocolVersionMismatch {
        addr: SocketAddr,
        local_max: u8,
        remote_min: u8,
    },

    /// A name collision was observed: two peers claim the same node name
    /// with different addresses.
    #[error("name conflict for {name}: {a} vs {b}")]
    NameConflict {
        name: String,
        a: SocketAddr,
        b: SocketAddr,
    },

    /// Configuration failed validation at startup. Always fatal.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Lifecycle method called out of order (e.g. `leave` after `shutdown`).
    #[error("lifecycle misuse: {0}")]
    LifecycleMisuse(&'static str),

    /// A query or key-manager operation timed out waiting for responses.
    #[error("operation timed out waiting for responses")]
    QueryTimeout,

    /// The local keyring rejected a key of the wrong length.
    #[error("invalid key length {0}, expected 16, 24 or 32 bytes")]
    InvalidKeyLength(usize),

    /// Attempted to remove the primary key from the keyring.
    #[error("cannot remove the primary key")]
    CannotRemovePrimaryKey,
}

impl Error {
    /// Whether this error should abort `Coordinator::create` (startup-fatal)
    /// as opposed to being logged and treated as best-effort at runtime.
    ///
    /// Per the error-handling design: configuration errors and lifecycle
    /// misuse are the only two fatal categories; everything else (network,
    /// framing, snapshot I/O, protocol mismatch) is runtime best-effort.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::InvalidConfig(_) | Error::LifecycleMisuse(_))
    }
}
