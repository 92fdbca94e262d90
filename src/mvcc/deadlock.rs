// Copyright 2024 RiftKV Project Authors. Licensed under Apache-2.0.

//! Waits-for graph for pessimistic lock acquisition.

use std::collections::HashMap;
use std::sync::Mutex;

/// Tracks which transaction waits on which. A cycle at registration time is
/// a deadlock, reported with the key hash on the cycle so the caller can
/// pick a victim.
#[derive(Debug, Default)]
pub struct DeadlockDetector {
    wait_for: Mutex<HashMap<u64, Vec<WaitForEntry>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct WaitForEntry {
    txn: u64,
    key_hash: u64,
}

impl DeadlockDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the edge `txn -> wait_for_txn` on `key_hash`, unless doing
    /// so closes a cycle. On a cycle, returns the key hash already on it.
    pub fn detect(&self, txn: u64, wait_for_txn: u64, key_hash: u64) -> Result<(), u64> {
        let mut map = self.wait_for.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(cycle_hash) = find_path(&map, txn, wait_for_txn) {
            return Err(cycle_hash);
        }
        let entry = WaitForEntry {
            txn: wait_for_txn,
            key_hash,
        };
        let list = map.entry(txn).or_default();
        if !list.contains(&entry) {
            list.push(entry);
        }
        Ok(())
    }

    /// Drops all edges out of `txn`; called when it commits or rolls back.
    pub fn clean_up(&self, txn: u64) {
        self.wait_for
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&txn);
    }

    /// Drops one edge, for a wait that resolved without finishing the txn.
    pub fn clean_up_wait_for(&self, txn: u64, wait_for_txn: u64, key_hash: u64) {
        let entry = WaitForEntry {
            txn: wait_for_txn,
            key_hash,
        };
        let mut map = self.wait_for.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(list) = map.get_mut(&txn) {
            list.retain(|e| *e != entry);
            if list.is_empty() {
                map.remove(&txn);
            }
        }
    }
}

fn find_path(map: &HashMap<u64, Vec<WaitForEntry>>, source: u64, through: u64) -> Option<u64> {
    let list = map.get(&through)?;
    for entry in list {
        if entry.txn == source {
            return Some(entry.key_hash);
        }
        if let Some(hash) = find_path(map, source, entry.txn) {
            return Some(hash);
        }
    }
    None
}

/// A stable 64-bit key fingerprint (FNV-1a). Only equality of hashes
/// matters, so any stable function works, but it must not vary per process.
pub(crate) fn key_hash(key: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    for b in key {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_cycles() {
        let detector = DeadlockDetector::new();
        detector.detect(1, 2, 100).unwrap();
        detector.detect(2, 3, 200).unwrap();
        assert_eq!(detector.detect(3, 1, 300).unwrap_err(), 200);

        detector.clean_up(2);
        detector.detect(3, 1, 300).unwrap();
    }

    #[test]
    fn duplicate_edges_do_not_grow() {
        let detector = DeadlockDetector::new();
        detector.detect(3, 1, 400).unwrap();
        detector.detect(3, 1, 400).unwrap();
        detector.clean_up_wait_for(3, 1, 400);
        let map = detector.wait_for.lock().unwrap();
        assert!(!map.contains_key(&3));
    }

    #[test]
    fn key_hash_is_stable() {
        assert_eq!(key_hash(b"x"), key_hash(b"x"));
        assert_ne!(key_hash(b"x"), key_hash(b"y"));
    }
}
