// Copyright 2024 RiftKV Project Authors. Licensed under Apache-2.0.

use crate::kv::codec;
use crate::Error;
use crate::Result;

/// The version of a key's lock slot. Descending version encoding puts it
/// ahead of every committed version of the same key.
pub const LOCK_VER: u64 = u64::MAX;

/// Encodes a user key and version into the engine's storage key.
pub fn mvcc_encode(key: &[u8], ver: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(codec::max_encoded_bytes_size(key.len()) + 8);
    codec::encode_bytes(&mut buf, key);
    codec::encode_u64_desc(&mut buf, ver);
    buf
}

/// Decodes a storage key back into `(user_key, ver)`. A bare meta key (no
/// version suffix) decodes with version 0.
pub fn mvcc_decode(encoded: &[u8]) -> Result<(Vec<u8>, u64)> {
    let (key, consumed) = codec::decode_bytes(encoded)?;
    let rest = &encoded[consumed..];
    if rest.is_empty() {
        return Ok((key, 0));
    }
    let (ver, rest) = codec::decode_u64_desc(rest)?;
    if !rest.is_empty() {
        return Err(Error::InvalidKeyEncoding {
            key: encoded.to_vec(),
        });
    }
    Ok((key, ver))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        for (key, ver) in [
            (b"".to_vec(), 0u64),
            (b"k".to_vec(), 1),
            (b"key".to_vec(), LOCK_VER),
            (vec![0xFF; 17], 12345),
        ] {
            let encoded = mvcc_encode(&key, ver);
            assert_eq!(mvcc_decode(&encoded).unwrap(), (key, ver));
        }
    }

    #[test]
    fn lock_slot_sorts_before_all_versions() {
        let lock = mvcc_encode(b"k", LOCK_VER);
        let newest = mvcc_encode(b"k", 100);
        let older = mvcc_encode(b"k", 50);
        let next_key_lock = mvcc_encode(b"k\x00", LOCK_VER);
        assert!(lock < newest);
        assert!(newest < older);
        assert!(older < next_key_lock);
    }

    #[test]
    fn garbage_fails_to_decode() {
        assert!(mvcc_decode(&[0x01, 0x02]).is_err());
        // A truncated version suffix is rejected, not silently ignored.
        let mut encoded = mvcc_encode(b"k", 7);
        encoded.pop();
        assert!(mvcc_decode(&encoded).is_err());
    }
}
