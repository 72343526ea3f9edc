// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Label prefix (`0xFE, len(u8), label`) and CRC32 framing for UDP
//! datagrams.

use crate::error::{Error, Result};
use bytes::{Bytes, BytesMut};

/// Magic byte marking a label-prefixed packet/stream.
pub const LABEL_MAGIC: u8 = 0xFE;

/// Prepends `[LABEL_MAGIC, len(u8), label]` to `body` if a label is
/// configured. `label` must be ≤ 255 bytes; longer labels are truncated,
/// since the wire format only reserves one length byte (configuration
/// validation should reject them earlier — see [`crate::config::Config::validate`]).
pub fn prepend_label(label: Option<&str>, body: Bytes) -> Bytes {
    let label = match label {
        Some(l) if !l.is_empty() => l,
        _ => return body,
    };
    let label_bytes = &label.as_bytes()[..label.len().min(255)];

    let mut out = BytesMut::with_capacity(2 + label_bytes.len() + body.len());
    out.extend_from_slice(&[LABEL_MAGIC, label_bytes.len() as u8]);
    out.extend_from_slice(label_bytes);
    out.extend_from_slice(&body);
    out.freeze()
}

/// Strips a label prefix if present, verifying it matches `expected`.
/// Packets carrying no label when one is expected, or a mismatching label,
/// are rejected (per the framing error policy: drop, don't propagate).
pub fn strip_label(expected: Option<&str>, bytes: Bytes) -> Result<Bytes> {
    let expected = expected.filter(|l| !l.is_empty());

    if bytes.first() == Some(&LABEL_MAGIC) {
        if bytes.len() < 2 {
            return Err(Error::MalformedFile {
                kind: "packet",
                path: String::new(),
                reason: "truncated label prefix".to_string(),
            });
        }
        let len = bytes[1] as usize;
        if bytes.len() < 2 + len {
            return Err(Error::MalformedFile {
                kind: "packet",
                path: String::new(),
                reason: "truncated label".to_string(),
            });
        }
        let got_label = String::from_utf8_lossy(&bytes[2..2 + len]).to_string();
        match expected {
            Some(exp) if exp == got_label => Ok(bytes.slice(2 + len..)),
            _ => Err(Error::LabelMismatch {
                expected: expected.map(str::to_string),
                got: Some(got_label),
            }),
        }
    } else {
        match expected {
            None => Ok(bytes),
            Some(exp) => Err(Error::LabelMismatch {
                expected: Some(exp.to_string()),
                got: None,
            }),
        }
    }
}

/// Appends a 4-byte IEEE CRC32 to a pre-encryption UDP packet.
pub fn append_crc(mut body: Vec<u8>) -> Vec<u8> {
    let crc = crc32fast::hash(&body);
    body.extend_from_slice(&crc.to_be_bytes());
    body
}

/// Verifies and strips the trailing CRC32 from an inbound UDP packet.
/// Mismatches are reported as an error; the transport layer drops and logs
/// rather than propagating (per §4.A: "never fatal").
pub fn verify_and_strip_crc(body: &[u8]) -> Result<&[u8]> {
    if body.len() < 4 {
        return Err(Error::CrcMismatch);
    }
    let (payload, crc_bytes) = body.split_at(body.len() - 4);
    let expected = u32::from_be_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
    let actual = crc32fast::hash(payload);
    if expected != actual {
        return Err(Error::CrcMismatch);
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_round_trips() {
        let body = Bytes::from_static(b"hello");
        let framed = prepend_label(Some("my-cluster"), body.clone());
        let stripped = strip_label(Some("my-cluster"), framed).unwrap();
        assert_eq!(stripped, body);
    }

    #[test]
    fn no_label_passes_through() {
        let body = Bytes::from_static(b"hello");
        let framed = prepend_label(None, body.clone());
        assert_eq!(framed, body);
        let stripped = strip_label(None, framed).unwrap();
        assert_eq!(stripped, body);
    }

    #[test]
    fn mismatched_label_rejected() {
        let framed = prepend_label(Some("a"), Bytes::from_static(b"x"));
        assert!(strip_label(Some("b"), framed).is_err());
    }

    #[test]
    fn crc_detects_corruption() {
        let body = append_crc(b"payload".to_vec());
        assert_eq!(verify_and_strip_crc(&body).unwrap(), b"payload");

        let mut corrupted = body.clone();
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0xFF;
        assert!(verify_and_strip_crc(&corrupted).is_err());
    }
}
