// Copyright 2024 RiftKV Project Authors. Licensed under Apache-2.0.

use std::fmt;
use std::ops::Bound;
use std::ops::Range;
use std::ops::RangeFrom;
use std::ops::RangeFull;
use std::ops::RangeInclusive;

use super::HexRepr;
use crate::kv::Key;
use crate::kv::Value;
use crate::proto::kvpb;

/// A key/value pair.
#[derive(Default, Clone, Eq, PartialEq)]
pub struct KvPair(pub Key, pub Value);

impl KvPair {
    pub fn new(key: impl Into<Key>, value: impl Into<Value>) -> Self {
        KvPair(key.into(), value.into())
    }

    #[inline]
    pub fn key(&self) -> &Key {
        &self.0
    }

    #[inline]
    pub fn value(&self) -> &Value {
        &self.1
    }

    #[inline]
    pub fn into_key(self) -> Key {
        self.0
    }

    #[inline]
    pub fn into_value(self) -> Value {
        self.1
    }
}

impl From<(Key, Value)> for KvPair {
    fn from((k, v): (Key, Value)) -> Self {
        KvPair(k, v)
    }
}

impl From<KvPair> for (Key, Value) {
    fn from(pair: KvPair) -> Self {
        (pair.0, pair.1)
    }
}

impl From<kvpb::KvPair> for KvPair {
    fn from(pair: kvpb::KvPair) -> Self {
        KvPair(pair.key.into(), pair.value)
    }
}

impl From<KvPair> for kvpb::KvPair {
    fn from(pair: KvPair) -> Self {
        let mut result = kvpb::KvPair::default();
        result.key = pair.0.into();
        result.value = pair.1;
        result
    }
}

impl fmt::Debug for KvPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let KvPair(key, value) = self;
        write!(f, "KvPair({}, {})", HexRepr(&key.0), HexRepr(value))
    }
}

/// A struct for expressing ranges. This type is semi-opaque and is not really
/// meant for users to deal with directly. Most functions which operate
/// on ranges will accept any types which implement `Into<BoundRange>`.
///
/// We are restricted by the protocol to an inclusive lower bound and an
/// exclusive upper bound; an empty upper bound denotes +inf.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BoundRange {
    pub from: Bound<Key>,
    pub to: Bound<Key>,
}

impl Default for BoundRange {
    fn default() -> BoundRange {
        BoundRange {
            from: Bound::Unbounded,
            to: Bound::Unbounded,
        }
    }
}

impl BoundRange {
    pub fn new(from: Bound<Key>, to: Bound<Key>) -> BoundRange {
        BoundRange { from, to }
    }

    pub fn range_from(from: Key) -> BoundRange {
        BoundRange {
            from: Bound::Included(from),
            to: Bound::Unbounded,
        }
    }

    /// Flattens the range into `(start, end)` wire keys: start inclusive,
    /// end exclusive, empty end = +inf.
    pub fn into_keys(self) -> (Key, Option<Key>) {
        let start = match self.from {
            Bound::Included(v) => v,
            Bound::Excluded(v) => v.next_key(),
            Bound::Unbounded => Key::EMPTY,
        };
        let end = match self.to {
            Bound::Included(v) => Some(v.next_key()),
            Bound::Excluded(v) if v.is_empty() => None,
            Bound::Excluded(v) => Some(v),
            Bound::Unbounded => None,
        };
        (start, end)
    }
}

impl<T: Into<Key>> From<Range<T>> for BoundRange {
    fn from(other: Range<T>) -> BoundRange {
        BoundRange::new(
            other.start.into().into_lower_bound(),
            other.end.into().into_upper_bound(),
        )
    }
}

impl<T: Into<Key>> From<RangeFrom<T>> for BoundRange {
    fn from(other: RangeFrom<T>) -> BoundRange {
        BoundRange::new(other.start.into().into_lower_bound(), Bound::Unbounded)
    }
}

impl From<RangeFull> for BoundRange {
    fn from(_other: RangeFull) -> BoundRange {
        BoundRange::new(Bound::Unbounded, Bound::Unbounded)
    }
}

impl<T: Into<Key>> From<RangeInclusive<T>> for BoundRange {
    fn from(other: RangeInclusive<T>) -> BoundRange {
        let (start, end) = other.into_inner();
        BoundRange::new(
            start.into().into_lower_bound(),
            Bound::Included(end.into()),
        )
    }
}

impl<T: Into<Key>> From<(T, T)> for BoundRange {
    fn from((start, end): (T, T)) -> BoundRange {
        BoundRange::new(
            start.into().into_lower_bound(),
            end.into().into_upper_bound(),
        )
    }
}

impl<T: Into<Key>> From<(T, Option<T>)> for BoundRange {
    fn from((start, end): (T, Option<T>)) -> BoundRange {
        let to = match end {
            Some(to) => to.into().into_upper_bound(),
            None => Bound::Unbounded,
        };
        BoundRange::new(start.into().into_lower_bound(), to)
    }
}

/// A convenience trait for converting borrowed ranges into a [`BoundRange`].
pub trait IntoOwnedRange {
    fn into_owned(self) -> BoundRange;
}

impl IntoOwnedRange for Range<&[u8]> {
    fn into_owned(self) -> BoundRange {
        From::from(Range {
            start: self.start.to_vec(),
            end: self.end.to_vec(),
        })
    }
}

impl IntoOwnedRange for RangeFrom<&[u8]> {
    fn into_owned(self) -> BoundRange {
        From::from(RangeFrom {
            start: self.start.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bound_range_into_keys() {
        let range: BoundRange = ("a".."z").into();
        let (start, end) = range.into_keys();
        assert_eq!(start, Key::from("a"));
        assert_eq!(end, Some(Key::from("z")));

        let range: BoundRange = ("a"..).into();
        let (start, end) = range.into_keys();
        assert_eq!(start, Key::from("a"));
        assert_eq!(end, None);

        let range: BoundRange = ("a"..="z").into();
        let (start, end) = range.into_keys();
        assert_eq!(start, Key::from("a"));
        assert_eq!(end, Some(Key::from("z").next_key()));
    }
}
