// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The local keyring: an ordered list of AES keys, the first of which is
//! primary. Persisted to disk as a JSON array of base64 strings. Cluster-wide
//! rotation (install/use/remove/list) lives in [`crate::query::keymgr`]; this
//! module only owns the local, single-node view.

use crate::error::{Error, Result};
use std::fs;
use std::path::Path;

/// An ordered set of AES keys (16/24/32 bytes); `keys[0]` is primary.
#[derive(Clone, Debug, Default)]
pub struct Keyring {
    keys: Vec<Vec<u8>>,
}

fn validate_len(key: &[u8]) -> Result<()> {
    match key.len() {
        16 | 24 | 32 => Ok(()),
        other => Err(Error::InvalidKeyLength(other)),
    }
}

impl Keyring {
    /// Creates a keyring with a single primary key.
    pub fn new(primary: Vec<u8>) -> Result<Self> {
        validate_len(&primary)?;
        Ok(Self { keys: vec![primary] })
    }

    /// An empty keyring: encryption is disabled until a key is installed.
    pub fn empty() -> Self {
        Self { keys: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn primary(&self) -> &[u8] {
        &self.keys[0]
    }

    pub fn all(&self) -> impl Iterator<Item = Vec<u8>> + '_ {
        self.keys.iter().cloned()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Installs `key` as a non-primary member of the keyring, so messages
    /// encrypted with it by peers mid-rotation can still be decrypted.
    /// Idempotent: installing an already-present key is a no-op.
    pub fn install(&mut self, key: Vec<u8>) -> Result<()> {
        validate_len(&key)?;
        if !self.keys.iter().any(|k| k == &key) {
            self.keys.push(key);
        }
        Ok(())
    }

    /// Promotes `key` to primary. The key must already be installed.
    pub fn use_key(&mut self, key: &[u8]) -> Result<()> {
        let pos = self
            .keys
            .iter()
            .position(|k| k == key)
            .ok_or(Error::InvalidKeyLength(key.len()))?;
        self.keys.swap(0, pos);
        Ok(())
    }

    /// Removes a non-primary key from the keyring.
    pub fn remove(&mut self, key: &[u8]) -> Result<()> {
        if self.keys.first().map(Vec::as_slice) == Some(key) {
            return Err(Error::CannotRemovePrimaryKey);
        }
        self.keys.retain(|k| k != key);
        Ok(())
    }

    /// Loads a keyring from a JSON array of base64-encoded keys, as required
    /// at startup when `KeyringFile` is configured.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let encoded: Vec<String> = serde_json::from_str(&contents).map_err(|err| {
            Error::MalformedFile {
                kind: "keyring",
                path: path.display().to_string(),
                reason: err.to_string(),
            }
        })?;

        let mut keys = Vec::with_capacity(encoded.len());
        for entry in encoded {
            let decoded = base64::decode(&entry).map_err(|err| Error::MalformedFile {
                kind: "keyring",
                path: path.display().to_string(),
                reason: err.to_string(),
            })?;
            validate_len(&decoded)?;
            keys.push(decoded);
        }
        Ok(Self { keys })
    }

    /// Persists the keyring to `path` as a JSON array of base64 strings,
    /// primary key first.
    pub fn save(&self, path: &Path) -> Result<()> {
        let encoded: Vec<String> = self.keys.iter().map(|k| base64::encode(k)).collect();
        let json = serde_json::to_string_pretty(&encoded)
            .map_err(|err| Error::Serialisation(err.to_string()))?;
        fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_wrong_length_keys() {
        assert!(Keyring::new(vec![0u8; 10]).is_err());
        assert!(Keyring::new(vec![0u8; 16]).is_ok());
    }

    #[test]
    fn use_key_promotes_to_primary() {
        let mut keyring = Keyring::new(vec![1u8; 16]).unwrap();
        keyring.install(vec![2u8; 16]).unwrap();
        assert_eq!(keyring.primary(), &[1u8; 16][..]);
        keyring.use_key(&[2u8; 16]).unwrap();
        assert_eq!(keyring.primary(), &[2u8; 16][..]);
    }

    #[test]
    fn cannot_remove_primary() {
        let mut keyring = Keyring::new(vec![1u8; 16]).unwrap();
        assert!(keyring.remove(&[1u8; 16]).is_err());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keyring.json");

        let mut keyring = Keyring::new(vec![9u8; 32]).unwrap();
        keyring.install(vec![8u8; 32]).unwrap();
        keyring.save(&path).unwrap();

        let loaded = Keyring::load(&path).unwrap();
        assert_eq!(loaded.primary(), &[9u8; 32][..]);
        assert_eq!(loaded.len(), 2);
    }
}
