// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Reserved internal query names (§4.H): `install-key`, `use-key`,
//! `remove-key`, `list-keys`, `conflict-resolution`. A node receiving one of
//! these never delivers it to the external event sink; the response is
//! auto-written from the handler's result.

use crate::error::{Error, Result};
use crate::keyring::Keyring;
use crate::serf::messages::{ConflictResponse, KeyRequest, KeyResponse};
use std::net::SocketAddr;
use tokio::sync::RwLock;

/// Prefix shared by every internal query name, chosen to avoid collision
/// with user-defined query names (§4.H).
pub const PREFIX: &str = "_serf_";

pub const INSTALL_KEY: &str = "_serf_install-key";
pub const USE_KEY: &str = "_serf_use-key";
pub const REMOVE_KEY: &str = "_serf_remove-key";
pub const LIST_KEYS: &str = "_serf_list-keys";
pub const CONFLICT_RESOLUTION: &str = "_serf_conflict-resolution";

pub fn is_internal(name: &str) -> bool {
    name.starts_with(PREFIX)
}

/// Runs a reserved query locally and returns its msgpack-encoded response,
/// or `None` if `name` isn't one of the names this module handles (the
/// caller should fall through to delivering it to the event pipeline).
pub async fn handle(
    name: &str,
    payload: &[u8],
    keyring: &RwLock<Keyring>,
    local_node_name: &str,
    local_addr: SocketAddr,
) -> Option<Result<Vec<u8>>> {
    let response = match name {
        INSTALL_KEY => Some(handle_install(payload, keyring).await),
        USE_KEY => Some(handle_use(payload, keyring).await),
        REMOVE_KEY => Some(handle_remove(payload, keyring).await),
        LIST_KEYS => Some(handle_list(keyring).await),
        CONFLICT_RESOLUTION => Some(handle_conflict(local_node_name, local_addr)),
        _ => None,
    }?;
    Some(response)
}

fn decode_request(payload: &[u8]) -> Result<KeyRequest> {
    rmp_serde::from_slice(payload).map_err(|err| Error::Serialisation(err.to_string()))
}

fn encode_response(resp: &KeyResponse) -> Result<Vec<u8>> {
    rmp_serde::to_vec_named(resp).map_err(|err| Error::Serialisation(err.to_string()))
}

async fn handle_install(payload: &[u8], keyring: &RwLock<Keyring>) -> Result<Vec<u8>> {
    let req = decode_request(payload)?;
    let key = req.key.ok_or_else(|| Error::InvalidConfig("install-key requires a key".into()))?;
    let resp = match keyring.write().await.install(key) {
        Ok(()) => KeyResponse { result: true, message: String::new(), keys: Vec::new() },
        Err(err) => KeyResponse { result: false, message: err.to_string(), keys: Vec::new() },
    };
    encode_response(&resp)
}

async fn handle_use(payload: &[u8], keyring: &RwLock<Keyring>) -> Result<Vec<u8>> {
    let req = decode_request(payload)?;
    let key = req.key.ok_or_else(|| Error::InvalidConfig("use-key requires a key".into()))?;
    let resp = match keyring.write().await.use_key(&key) {
        Ok(()) => KeyResponse { result: true, message: String::new(), keys: Vec::new() },
        Err(err) => KeyResponse { result: false, message: err.to_string(), keys: Vec::new() },
    };
    encode_response(&resp)
}

async fn handle_remove(payload: &[u8], keyring: &RwLock<Keyring>) -> Result<Vec<u8>> {
    let req = decode_request(payload)?;
    let key = req.key.ok_or_else(|| Error::InvalidConfig("remove-key requires a key".into()))?;
    let resp = match keyring.write().await.remove(&key) {
        Ok(()) => KeyResponse { result: true, message: String::new(), keys: Vec::new() },
        Err(err) => KeyResponse { result: false, message: err.to_string(), keys: Vec::new() },
    };
    encode_response(&resp)
}

async fn handle_list(keyring: &RwLock<Keyring>) -> Result<Vec<u8>> {
    let keyring = keyring.read().await;
    let keys = keyring.all().map(|k| base64::encode(&k)).collect();
    encode_response(&KeyResponse { result: true, message: String::new(), keys })
}

fn handle_conflict(local_node_name: &str, local_addr: SocketAddr) -> Result<Vec<u8>> {
    let resp = ConflictResponse {
        node_name: local_node_name.to_string(),
        addr: local_addr,
    };
    rmp_serde::to_vec_named(&resp).map_err(|err| Error::Serialisation(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn install_then_list_round_trips() {
        let keyring = RwLock::new(Keyring::new(vec![1u8; 16]).unwrap());
        let req = rmp_serde::to_vec_named(&KeyRequest { key: Some(vec![2u8; 16]) }).unwrap();
        let resp = handle(INSTALL_KEY, &req, &keyring, "a", "127.0.0.1:7946".parse().unwrap())
            .await
            .unwrap()
            .unwrap();
        let decoded: KeyResponse = rmp_serde::from_slice(&resp).unwrap();
        assert!(decoded.result);

        let resp = handle(LIST_KEYS, &[], &keyring, "a", "127.0.0.1:7946".parse().unwrap())
            .await
            .unwrap()
            .unwrap();
        let decoded: KeyResponse = rmp_serde::from_slice(&resp).unwrap();
        assert_eq!(decoded.keys.len(), 2);
    }

    #[test]
    fn unknown_name_is_not_internal() {
        assert!(!is_internal("deploy"));
        assert!(is_internal(INSTALL_KEY));
    }
}
