// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The key manager (§4.I): `install`/`use`/`remove`/`list` over internal
//! queries, aggregating per-node responses. The local keyring itself lives
//! in [`crate::keyring`]; this module is the cluster-wide rotation protocol
//! layered on top of it via [`super::internal`]'s reserved query names.

use super::internal::{INSTALL_KEY, LIST_KEYS, REMOVE_KEY, USE_KEY};
use super::{QueryManager, QueryParam};
use crate::error::{Error, Result};
use crate::member::table::MemberTable;
use crate::serf::messages::{KeyRequest, KeyResponse};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Aggregated result of a cluster-wide key operation.
#[derive(Clone, Debug, Default)]
pub struct KeyResponseAggregate {
    pub num_resp: usize,
    pub num_err: usize,
    pub num_nodes: usize,
    /// base64 key -> number of nodes reporting it (only populated by
    /// [`KeyManager::list_keys`]).
    pub keys: HashMap<String, usize>,
    pub messages: Vec<String>,
}

pub struct KeyManager {
    query: Arc<QueryManager>,
    members: Arc<RwLock<MemberTable>>,
    timeout: Duration,
}

impl KeyManager {
    pub fn new(query: Arc<QueryManager>, members: Arc<RwLock<MemberTable>>, timeout: Duration) -> Self {
        Self { query, members, timeout }
    }

    pub async fn install_key(&self, key: Vec<u8>) -> Result<KeyResponseAggregate> {
        self.run(INSTALL_KEY, Some(key)).await
    }

    pub async fn use_key(&self, key: Vec<u8>) -> Result<KeyResponseAggregate> {
        self.run(USE_KEY, Some(key)).await
    }

    pub async fn remove_key(&self, key: Vec<u8>) -> Result<KeyResponseAggregate> {
        self.run(REMOVE_KEY, Some(key)).await
    }

    pub async fn list_keys(&self) -> Result<KeyResponseAggregate> {
        self.run(LIST_KEYS, None).await
    }

    async fn run(&self, name: &str, key: Option<Vec<u8>>) -> Result<KeyResponseAggregate> {
        let payload = rmp_serde::to_vec_named(&KeyRequest { key })
            .map_err(|err| Error::Serialisation(err.to_string()))?;

        let num_nodes = self.members.read().await.len() + 1; // +1 for the local node itself
        let mut handle = self
            .query
            .query(
                name.to_string(),
                payload,
                QueryParam {
                    timeout: Some(self.timeout),
                    ..Default::default()
                },
            )
            .await?;

        let mut agg = KeyResponseAggregate {
            num_nodes,
            ..Default::default()
        };
        while let Some((from, payload)) = handle.responses.recv().await {
            agg.num_resp += 1;
            match rmp_serde::from_slice::<KeyResponse>(&payload) {
                Ok(resp) => {
                    if !resp.result {
                        agg.num_err += 1;
                        agg.messages.push(format!("{}: {}", from, resp.message));
                    }
                    for key in resp.keys {
                        *agg.keys.entry(key).or_insert(0) += 1;
                    }
                }
                Err(err) => {
                    agg.num_err += 1;
                    agg.messages.push(format!("{}: malformed response: {}", from, err));
                }
            }
        }
        Ok(agg)
    }
}
