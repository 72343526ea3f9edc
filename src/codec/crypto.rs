// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! AES-GCM message encryption: `{version(1), nonce(12), ciphertext, tag(16)}`,
//! wrapped behind an outer [`MsgType::Encrypt`] type byte so the receiver
//! always knows a frame is encrypted before it can possibly inspect the
//! (still-encrypted) inner type. The AAD is `label || Encrypt`, matching the
//! "AAD = label || type" wire contract with `type` read as the *outer*
//! envelope's type, not the plaintext's.

use crate::codec::types::MsgType;
use crate::error::{Error, Result};
use crate::keyring::Keyring;
use aes_gcm::aead::generic_array::typenum::U12;
use aes_gcm::aead::{Aead, NewAead};
use aes_gcm::{AesGcm, Key, Nonce};
use aes_gcm::aes::{Aes128, Aes192, Aes256};
use bytes::Bytes;
use rand::RngCore;

const VERSION: u8 = 1;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

type Aes128Gcm = AesGcm<Aes128, U12>;
type Aes192Gcm = AesGcm<Aes192, U12>;
type Aes256Gcm = AesGcm<Aes256, U12>;

/// Keyring entries are 16/24/32 bytes (AES-128/192/256); dispatch to the
/// matching cipher rather than assuming a fixed key width.
enum AnyAesGcm {
    Aes128(Aes128Gcm),
    Aes192(Aes192Gcm),
    Aes256(Aes256Gcm),
}

impl AnyAesGcm {
    fn new(key_bytes: &[u8]) -> Result<Self> {
        Ok(match key_bytes.len() {
            16 => AnyAesGcm::Aes128(Aes128Gcm::new(Key::from_slice(key_bytes))),
            24 => AnyAesGcm::Aes192(Aes192Gcm::new(Key::from_slice(key_bytes))),
            32 => AnyAesGcm::Aes256(Aes256Gcm::new(Key::from_slice(key_bytes))),
            other => return Err(Error::InvalidKeyLength(other)),
        })
    }

    fn encrypt(&self, nonce: &Nonce<U12>, payload: aes_gcm::aead::Payload) -> Result<Vec<u8>> {
        let result = match self {
            AnyAesGcm::Aes128(c) => c.encrypt(nonce, payload),
            AnyAesGcm::Aes192(c) => c.encrypt(nonce, payload),
            AnyAesGcm::Aes256(c) => c.encrypt(nonce, payload),
        };
        result.map_err(|_| Error::DecryptionFailed)
    }

    fn decrypt(&self, nonce: &Nonce<U12>, payload: aes_gcm::aead::Payload) -> Result<Vec<u8>> {
        let result = match self {
            AnyAesGcm::Aes128(c) => c.decrypt(nonce, payload),
            AnyAesGcm::Aes192(c) => c.decrypt(nonce, payload),
            AnyAesGcm::Aes256(c) => c.decrypt(nonce, payload),
        };
        result.map_err(|_| Error::DecryptionFailed)
    }
}

fn aad(label: Option<&str>) -> Vec<u8> {
    let mut aad = label.map(str::as_bytes).unwrap_or(&[]).to_vec();
    aad.push(MsgType::Encrypt as u8);
    aad
}

/// Encrypts `frame` (an already type-byte-prefixed, possibly-compressed
/// inner frame) with the keyring's primary key, returning a new frame
/// prefixed with [`MsgType::Encrypt`].
pub fn encrypt(keyring: &Keyring, label: Option<&str>, frame: &Bytes) -> Result<Bytes> {
    let key_bytes = keyring.primary();
    let cipher = AnyAesGcm::new(key_bytes)?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let aad_bytes = aad(label);
    let ciphertext = cipher.encrypt(
        nonce,
        aes_gcm::aead::Payload {
            msg: frame,
            aad: &aad_bytes,
        },
    )?;

    let mut out = Vec::with_capacity(2 + NONCE_LEN + ciphertext.len());
    out.push(MsgType::Encrypt as u8);
    out.push(VERSION);
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(Bytes::from(out))
}

/// Decrypts the body following the outer `Encrypt` type byte (already
/// stripped by the caller): `{version, nonce, ciphertext+tag}`. Tries every
/// key in the keyring, primary first, since a peer mid-rotation may have
/// encrypted with any key still installed.
pub fn decrypt(keyring: &Keyring, label: Option<&str>, body: Bytes) -> Result<Bytes> {
    if body.len() < 1 + NONCE_LEN + TAG_LEN {
        return Err(Error::DecryptionFailed);
    }
    if body[0] != VERSION {
        return Err(Error::DecryptionFailed);
    }
    let nonce = Nonce::from_slice(&body[1..1 + NONCE_LEN]);
    let ciphertext = &body[1 + NONCE_LEN..];
    let aad_bytes = aad(label);

    for key_bytes in keyring.all() {
        let cipher = match AnyAesGcm::new(&key_bytes) {
            Ok(c) => c,
            Err(_) => continue,
        };
        if let Ok(plaintext) = cipher.decrypt(
            nonce,
            aes_gcm::aead::Payload {
                msg: ciphertext,
                aad: &aad_bytes,
            },
        ) {
            return Ok(Bytes::from(plaintext));
        }
    }

    Err(Error::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_with_primary_key() {
        let keyring = Keyring::new([7u8; 32].to_vec()).unwrap();
        let frame = Bytes::from_static(&[MsgType::Ping as u8, 1, 2, 3]);
        let encrypted = encrypt(&keyring, Some("cluster"), &frame).unwrap();
        // Strip the outer Encrypt type byte as the decoder would.
        let decrypted = decrypt(&keyring, Some("cluster"), encrypted.slice(1..)).unwrap();
        assert_eq!(decrypted, frame);
    }

    #[test]
    fn wrong_label_fails_authentication() {
        let keyring = Keyring::new([7u8; 32].to_vec()).unwrap();
        let frame = Bytes::from_static(&[MsgType::Ping as u8]);
        let encrypted = encrypt(&keyring, Some("cluster-a"), &frame).unwrap();
        assert!(decrypt(&keyring, Some("cluster-b"), encrypted.slice(1..)).is_err());
    }

    #[test]
    fn decrypt_tries_all_keyring_entries() {
        let mut keyring = Keyring::new([1u8; 32].to_vec()).unwrap();
        let frame = Bytes::from_static(&[MsgType::Ping as u8, 9]);
        let encrypted = encrypt(&keyring, None, &frame).unwrap();

        // Rotate: install a new primary, but the old key (used to encrypt
        // above) is still present, so decryption must still succeed.
        keyring.install([2u8; 32].to_vec()).unwrap();
        keyring.use_key(&[2u8; 32]).unwrap();

        let decrypted = decrypt(&keyring, None, encrypted.slice(1..)).unwrap();
        assert_eq!(decrypted, frame);
    }
}
