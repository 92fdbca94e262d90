// Copyright 2024 RiftKV Project Authors. Licensed under Apache-2.0.

pub mod codec;
mod key;
mod kvpair;

use std::fmt;

pub use key::Key;
pub use kvpair::BoundRange;
pub use kvpair::IntoOwnedRange;
pub use kvpair::KvPair;

/// The value part of a key/value pair. Arbitrary bytes.
pub type Value = Vec<u8>;

struct HexRepr<'a>(pub &'a [u8]);

impl fmt::Display for HexRepr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}
