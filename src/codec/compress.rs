// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! LZW compression wrapper: `Compress{algo: LZW, payload}`. The decoder
//! recurses exactly once into a compressed body (enforced by the caller in
//! [`super::Decoder::peel_type`]).

use crate::codec::types::MsgType;
use crate::error::{Error, Result};
use bytes::Bytes;

const LITERAL_WIDTH: u8 = 8;

/// Wraps `body` (a fully type-byte-prefixed frame) as a `Compress` message.
pub fn wrap(body: Bytes) -> Result<Bytes> {
    let mut encoder = weezl::encode::Encoder::new(weezl::BitOrder::Msb, LITERAL_WIDTH);
    let compressed = encoder
        .encode(&body)
        .map_err(|err| Error::Serialisation(format!("LZW compression failed: {}", err)))?;

    let mut out = Vec::with_capacity(1 + compressed.len());
    out.push(MsgType::Compress as u8);
    out.extend_from_slice(&compressed);
    Ok(Bytes::from(out))
}

/// Recovers the original body from a `Compress` payload (type byte already
/// stripped by the caller).
pub fn unwrap(compressed: Bytes) -> Result<Bytes> {
    let mut decoder = weezl::decode::Decoder::new(weezl::BitOrder::Msb, LITERAL_WIDTH);
    let decompressed = decoder
        .decode(&compressed)
        .map_err(|err| Error::Serialisation(format!("LZW decompression failed: {}", err)))?;
    Ok(Bytes::from(decompressed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let original = Bytes::from(vec![9u8; 4096]);
        let wrapped = wrap(original.clone()).unwrap();
        assert_eq!(wrapped[0], MsgType::Compress as u8);
        let recovered = unwrap(wrapped.slice(1..)).unwrap();
        assert_eq!(recovered, original);
    }
}
