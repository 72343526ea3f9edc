// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Persistence for the local node's tags (§6 "Persisted tags file format:
//! JSON object `{string: string}`"). Mirrors [`crate::keyring::Keyring`]'s
//! own `load`/`save` pair: a plain file format with no surrounding trait,
//! since neither this crate nor the teacher reaches for one just to wrap a
//! single load/save pair.

use crate::error::{Error, Result};
use crate::member::Tags;
use std::fs;
use std::path::Path;

/// Loads tags from a JSON object file, as required at startup when
/// `tags_file` is configured and the file already exists.
pub fn load(path: &Path) -> Result<Tags> {
    let contents = fs::read_to_string(path)?;
    serde_json::from_str(&contents).map_err(|err| Error::MalformedFile {
        kind: "tags",
        path: path.display().to_string(),
        reason: err.to_string(),
    })
}

/// Persists `tags` to `path` as a JSON object, overwriting whatever was
/// there. Called on startup (to seed a not-yet-existing file) and on every
/// `set_tags` thereafter, matching the keyring's own save-on-change policy.
pub fn save(tags: &Tags, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(tags).map_err(|err| Error::Serialisation(err.to_string()))?;
    fs::write(path, json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tags.json");

        let mut tags = Tags::new();
        tags.insert("role".to_string(), "web".to_string());
        tags.insert("az".to_string(), "us-east-1a".to_string());
        save(&tags, &path).unwrap();

        let loaded = load(&path).unwrap();
        assert_eq!(loaded, tags);
    }

    #[test]
    fn malformed_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tags.json");
        fs::write(&path, "not json").unwrap();
        assert!(load(&path).is_err());
    }
}
