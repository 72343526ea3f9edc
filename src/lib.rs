// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! A Serf-compatible cluster membership, gossip, event, and query engine.
//!
//! The crate is layered bottom-up: [`transport`] moves bytes, [`codec`]
//! frames and (optionally) encrypts/compresses them, [`gossip`] runs the
//! SWIM + Lifeguard failure detector over that transport, and [`serf`] sits
//! above the gossip engine interpreting join/leave intents, user events, and
//! queries. [`coordinator`] wires all of it together into the single
//! lifecycle entry point applications use.

pub mod broadcast;
pub mod clock;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod event;
pub mod gossip;
pub mod keyring;
pub mod member;
pub mod query;
pub mod serf;
pub mod snapshot;
pub mod tags;
pub mod transport;

pub use coordinator::Coordinator;
pub use error::{Error, Result};
