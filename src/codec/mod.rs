// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Wire codec: type byte + msgpack body, optional label prefix, optional
//! AES-GCM encryption, optional LZW compression, and CRC32 framing for UDP.
//!
//! Every outbound payload is built bottom-up by [`Encoder`] and read back by
//! [`Decoder`]; both share the [`MsgType`] discriminant so a peer can dispatch
//! before fully deserialising the msgpack body.

pub mod compress;
pub mod crypto;
pub mod framing;
pub mod types;

pub use types::MsgType;

use crate::error::{Error, Result};
use crate::keyring::Keyring;
use bytes::{Bytes, BytesMut};
use serde::{de::DeserializeOwned, Serialize};

/// Payloads larger than this are eligible for LZW compression.
pub const COMPRESSION_THRESHOLD: usize = 1024;

/// Encodes a typed message body into a complete outbound payload, applying
/// label prefixing, compression, and encryption as configured. CRC framing
/// is applied separately by the transport layer, since it only applies to
/// UDP datagrams (see [`framing::append_crc`]).
pub struct Encoder<'a> {
    pub label: Option<&'a str>,
    pub keyring: Option<&'a Keyring>,
}

impl<'a> Encoder<'a> {
    pub fn encode<T: Serialize>(&self, msg_type: MsgType, body: &T) -> Result<Bytes> {
        let encoded = rmp_serde::to_vec_named(body)
            .map_err(|err| Error::Serialisation(err.to_string()))?;

        let mut framed = BytesMut::with_capacity(1 + encoded.len());
        framed.extend_from_slice(&[msg_type as u8]);
        framed.extend_from_slice(&encoded);

        let framed = if framed.len() > COMPRESSION_THRESHOLD {
            compress::wrap(framed.freeze())?
        } else {
            framed.freeze()
        };

        let framed = match self.keyring {
            Some(keyring) => crypto::encrypt(keyring, self.label, &framed)?,
            None => framed,
        };

        Ok(framing::prepend_label(self.label, framed))
    }
}

/// Decodes an inbound payload, peeling off label, decryption, and
/// decompression as needed, leaving a `(MsgType, Bytes)` pair ready for
/// msgpack deserialisation.
pub struct Decoder<'a> {
    pub label: Option<&'a str>,
    pub keyring: Option<&'a Keyring>,
}

impl<'a> Decoder<'a> {
    /// Peels the envelope and returns the message type plus the still-encoded
    /// body, recursing once through compression if the outer type is
    /// [`MsgType::Compress`].
    pub fn peel(&self, bytes: Bytes) -> Result<(MsgType, Bytes)> {
        let bytes = framing::strip_label(self.label, bytes)?;
        self.peel_type(bytes, true, true)
    }

    fn peel_type(
        &self,
        bytes: Bytes,
        allow_compress_recursion: bool,
        allow_decrypt: bool,
    ) -> Result<(MsgType, Bytes)> {
        if bytes.is_empty() {
            return Err(Error::MalformedFile {
                kind: "packet",
                path: String::new(),
                reason: "empty payload".to_string(),
            });
        }
        let msg_type = MsgType::from_byte(bytes[0])?;
        let body = bytes.slice(1..);

        if msg_type == MsgType::Encrypt {
            if !allow_decrypt {
                return Err(Error::Serialisation(
                    "nested encryption is not supported".to_string(),
                ));
            }
            let keyring = self.keyring.ok_or(Error::DecryptionFailed)?;
            let decrypted = crypto::decrypt(keyring, self.label, body)?;
            return self.peel_type(decrypted, allow_compress_recursion, false);
        }

        if msg_type == MsgType::Compress {
            if !allow_compress_recursion {
                return Err(Error::Serialisation(
                    "nested compression is not supported".to_string(),
                ));
            }
            let decompressed = compress::unwrap(body)?;
            return self.peel_type(decompressed, false, allow_decrypt);
        }

        Ok((msg_type, body))
    }

    pub fn deserialize<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
        rmp_serde::from_slice(body).map_err(|err| Error::Serialisation(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Ping {
        seq: u32,
    }

    #[test]
    fn round_trips_without_label_or_keyring() {
        let enc = Encoder {
            label: None,
            keyring: None,
        };
        let payload = enc.encode(MsgType::Ping, &Ping { seq: 7 }).unwrap();

        let dec = Decoder {
            label: None,
            keyring: None,
        };
        let (msg_type, body) = dec.peel(payload).unwrap();
        assert_eq!(msg_type, MsgType::Ping);
        let ping: Ping = Decoder::deserialize(&body).unwrap();
        assert_eq!(ping, Ping { seq: 7 });
    }

    #[test]
    fn round_trips_with_label() {
        let enc = Encoder {
            label: Some("cluster-a"),
            keyring: None,
        };
        let payload = enc.encode(MsgType::Ping, &Ping { seq: 1 }).unwrap();

        let dec = Decoder {
            label: Some("cluster-a"),
            keyring: None,
        };
        let (msg_type, _) = dec.peel(payload).unwrap();
        assert_eq!(msg_type, MsgType::Ping);
    }

    #[test]
    fn mismatched_label_is_rejected() {
        let enc = Encoder {
            label: Some("cluster-a"),
            keyring: None,
        };
        let payload = enc.encode(MsgType::Ping, &Ping { seq: 1 }).unwrap();

        let dec = Decoder {
            label: Some("cluster-b"),
            keyring: None,
        };
        assert!(dec.peel(payload).is_err());
    }

    #[test]
    fn large_payload_is_compressed_and_recovered() {
        let enc = Encoder {
            label: None,
            keyring: None,
        };
        let big = "x".repeat(4096);
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Big {
            data: String,
        }
        let payload = enc
            .encode(MsgType::User, &Big { data: big.clone() })
            .unwrap();

        let dec = Decoder {
            label: None,
            keyring: None,
        };
        let (msg_type, body) = dec.peel(payload).unwrap();
        assert_eq!(msg_type, MsgType::User);
        let recovered: Big = Decoder::deserialize(&body).unwrap();
        assert_eq!(recovered.data, big);
    }
}
