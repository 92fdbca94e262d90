// Copyright 2024 RiftKV Project Authors. Licensed under Apache-2.0.

//! Constructors for transactional requests, and lock extraction from their
//! responses.

use crate::proto::kvpb;

/// Responses from which blocking locks can be harvested for resolution.
pub trait HasLocks {
    fn take_locks(&mut self) -> Vec<kvpb::LockInfo> {
        Vec::new()
    }
}

// Locks surface through the single `error` field.
macro_rules! error_locks {
    ($($response:ty),+ $(,)?) => {
        $(
            impl HasLocks for $response {
                fn take_locks(&mut self) -> Vec<kvpb::LockInfo> {
                    self.error
                        .as_mut()
                        .and_then(|error| error.locked.take())
                        .into_iter()
                        .collect()
                }
            }
        )+
    };
}

// Locks surface through per-pair errors.
macro_rules! pair_locks {
    ($($response:ty),+ $(,)?) => {
        $(
            impl HasLocks for $response {
                fn take_locks(&mut self) -> Vec<kvpb::LockInfo> {
                    self.pairs
                        .iter_mut()
                        .filter_map(|pair| {
                            pair.error.as_mut().and_then(|error| error.locked.take())
                        })
                        .collect()
                }
            }
        )+
    };
}

error_locks!(kvpb::GetResponse, kvpb::CommitResponse);
pair_locks!(kvpb::BatchGetResponse, kvpb::ScanResponse);

pub fn new_get_request(key: Vec<u8>, version: u64) -> kvpb::GetRequest {
    let mut req = kvpb::GetRequest::default();
    req.key = key;
    req.version = version;
    req
}

pub fn new_batch_get_request(keys: Vec<Vec<u8>>, version: u64) -> kvpb::BatchGetRequest {
    let mut req = kvpb::BatchGetRequest::default();
    req.keys = keys;
    req.version = version;
    req
}

pub fn new_scan_request(
    start_key: Vec<u8>,
    end_key: Vec<u8>,
    limit: u32,
    version: u64,
    key_only: bool,
    reverse: bool,
) -> kvpb::ScanRequest {
    let mut req = kvpb::ScanRequest::default();
    req.start_key = start_key;
    req.end_key = end_key;
    req.limit = limit;
    req.version = version;
    req.key_only = key_only;
    req.reverse = reverse;
    req
}

pub fn new_commit_request(
    keys: Vec<Vec<u8>>,
    start_version: u64,
    commit_version: u64,
) -> kvpb::CommitRequest {
    let mut req = kvpb::CommitRequest::default();
    req.keys = keys;
    req.start_version = start_version;
    req.commit_version = commit_version;
    req
}

pub fn new_batch_rollback_request(
    keys: Vec<Vec<u8>>,
    start_version: u64,
) -> kvpb::BatchRollbackRequest {
    let mut req = kvpb::BatchRollbackRequest::default();
    req.keys = keys;
    req.start_version = start_version;
    req
}

pub fn new_check_txn_status_request(
    primary_key: Vec<u8>,
    lock_ts: u64,
    caller_start_ts: u64,
    current_ts: u64,
    rollback_if_not_exist: bool,
    resolving_pessimistic_lock: bool,
) -> kvpb::CheckTxnStatusRequest {
    let mut req = kvpb::CheckTxnStatusRequest::default();
    req.primary_key = primary_key;
    req.lock_ts = lock_ts;
    req.caller_start_ts = caller_start_ts;
    req.current_ts = current_ts;
    req.rollback_if_not_exist = rollback_if_not_exist;
    req.resolving_pessimistic_lock = resolving_pessimistic_lock;
    req
}

pub fn new_resolve_lock_request(
    start_version: u64,
    commit_version: u64,
) -> kvpb::ResolveLockRequest {
    let mut req = kvpb::ResolveLockRequest::default();
    req.start_version = start_version;
    req.commit_version = commit_version;
    req
}

pub fn new_batch_resolve_lock_request(txn_infos: Vec<kvpb::TxnInfo>) -> kvpb::ResolveLockRequest {
    let mut req = kvpb::ResolveLockRequest::default();
    req.txn_infos = txn_infos;
    req
}

pub fn new_heart_beat_request(
    primary_lock: Vec<u8>,
    start_version: u64,
    advise_lock_ttl: u64,
) -> kvpb::TxnHeartBeatRequest {
    let mut req = kvpb::TxnHeartBeatRequest::default();
    req.primary_lock = primary_lock;
    req.start_version = start_version;
    req.advise_lock_ttl = advise_lock_ttl;
    req
}

pub fn new_scan_lock_request(
    start_key: Vec<u8>,
    end_key: Vec<u8>,
    max_version: u64,
    limit: u32,
) -> kvpb::ScanLockRequest {
    let mut req = kvpb::ScanLockRequest::default();
    req.start_key = start_key;
    req.end_key = end_key;
    req.max_version = max_version;
    req.limit = limit;
    req
}

pub fn new_pessimistic_lock_request(
    keys: Vec<Vec<u8>>,
    primary_lock: Vec<u8>,
    start_version: u64,
    lock_ttl: u64,
    for_update_ts: u64,
) -> kvpb::PessimisticLockRequest {
    let mut req = kvpb::PessimisticLockRequest::default();
    req.mutations = keys
        .into_iter()
        .map(|key| kvpb::Mutation {
            op: kvpb::Op::PessimisticLock as i32,
            key,
            value: Vec::new(),
            assertion: kvpb::Assertion::None as i32,
        })
        .collect();
    req.primary_lock = primary_lock;
    req.start_version = start_version;
    req.lock_ttl = lock_ttl;
    req.for_update_ts = for_update_ts;
    req
}

pub fn new_pessimistic_rollback_request(
    keys: Vec<Vec<u8>>,
    start_version: u64,
    for_update_ts: u64,
) -> kvpb::PessimisticRollbackRequest {
    let mut req = kvpb::PessimisticRollbackRequest::default();
    req.keys = keys;
    req.start_version = start_version;
    req.for_update_ts = for_update_ts;
    req
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_response_yields_its_lock() {
        let mut resp = kvpb::GetResponse::default();
        assert!(resp.take_locks().is_empty());

        resp.error = Some(kvpb::KeyError {
            locked: Some(kvpb::LockInfo {
                lock_version: 9,
                ..Default::default()
            }),
            ..Default::default()
        });
        let locks = resp.take_locks();
        assert_eq!(locks.len(), 1);
        assert_eq!(locks[0].lock_version, 9);
        // The lock is consumed.
        assert!(resp.take_locks().is_empty());
    }

    #[test]
    fn batch_get_response_yields_pair_locks() {
        let mut resp = kvpb::BatchGetResponse::default();
        resp.pairs = vec![
            kvpb::KvPair {
                key: b"a".to_vec(),
                value: b"1".to_vec(),
                error: None,
            },
            kvpb::KvPair {
                key: b"b".to_vec(),
                value: vec![],
                error: Some(kvpb::KeyError {
                    locked: Some(kvpb::LockInfo {
                        lock_version: 7,
                        key: b"b".to_vec(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
            },
        ];
        let locks = resp.take_locks();
        assert_eq!(locks.len(), 1);
        assert_eq!(locks[0].lock_version, 7);
    }
}
