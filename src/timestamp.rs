// Copyright 2024 RiftKV Project Authors. Licensed under Apache-2.0.

//! Cluster timestamps.
//!
//! A timestamp allocated by the placement driver packs physical milliseconds
//! in the upper bits and a logical counter in the lower
//! [`TIMESTAMP_LOGICAL_BITS`] bits. The packed form ("version") is what the
//! transactional protocol passes around as `start_ts` / `commit_ts`.

use std::time::SystemTime;
use std::time::UNIX_EPOCH;

pub use crate::proto::pdpb::Timestamp;

pub const TIMESTAMP_LOGICAL_BITS: u32 = 18;
const LOGICAL_MASK: u64 = (1 << TIMESTAMP_LOGICAL_BITS) - 1;

/// The reserved `caller_start_ts` sentinel for point-gets under autocommit.
pub const CALLER_START_TS_MAX: u64 = u64::MAX;

/// A helper trait to convert a Timestamp to and from an u64.
pub trait TimestampExt: Sized {
    /// Convert the timestamp to u64.
    fn version(&self) -> u64;
    /// Convert u64 to a timestamp.
    fn from_version(version: u64) -> Self;
    /// Convert u64 to an optional timestamp, where `0` represents no timestamp.
    fn try_from_version(version: u64) -> Option<Self>;
    /// The physical millisecond component.
    fn physical_ms(&self) -> u64;
}

impl TimestampExt for Timestamp {
    fn version(&self) -> u64 {
        ((self.physical << TIMESTAMP_LOGICAL_BITS) | self.logical) as u64
    }

    fn from_version(version: u64) -> Self {
        Self {
            physical: (version >> TIMESTAMP_LOGICAL_BITS) as i64,
            logical: (version & LOGICAL_MASK) as i64,
        }
    }

    fn try_from_version(version: u64) -> Option<Self> {
        if version == 0 {
            None
        } else {
            Some(Self::from_version(version))
        }
    }

    fn physical_ms(&self) -> u64 {
        self.physical as u64
    }
}

/// Extracts the physical millisecond component of a packed version.
pub fn extract_physical(version: u64) -> u64 {
    version >> TIMESTAMP_LOGICAL_BITS
}

/// Composes a packed version from physical milliseconds and a logical count.
pub fn compose_ts(physical_ms: u64, logical: u64) -> u64 {
    (physical_ms << TIMESTAMP_LOGICAL_BITS) | (logical & LOGICAL_MASK)
}

/// Wall-clock milliseconds since the epoch, used to evaluate lock TTLs when
/// a fresh PD timestamp is not at hand.
pub(crate) fn now_physical_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_round_trip() {
        let ts = Timestamp {
            physical: 1_697_000_000_123,
            logical: 42,
        };
        let version = ts.version();
        assert_eq!(Timestamp::from_version(version), ts);
        assert_eq!(extract_physical(version), 1_697_000_000_123);
        assert_eq!(version, compose_ts(1_697_000_000_123, 42));
    }

    #[test]
    fn zero_version_is_none() {
        assert_eq!(Timestamp::try_from_version(0), None);
        assert!(Timestamp::try_from_version(1).is_some());
    }
}
