// Copyright 2024 RiftKV Project Authors. Licensed under Apache-2.0.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::ops::Bound;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::RwLock;

use prost::Message;
use thiserror::Error;

use super::codec::mvcc_encode;
use super::codec::LOCK_VER;
use super::deadlock::key_hash;
use super::DeadlockDetector;
use crate::proto::kvpb;
use crate::timestamp::extract_physical;
use crate::timestamp::CALLER_START_TS_MAX;

/// Engine-level errors, the native form of `kvpb::KeyError`.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum MvccError {
    #[error("key is locked by txn {}", .0.lock_version)]
    KeyIsLocked(kvpb::LockInfo),
    #[error("retryable: {0}")]
    Retryable(String),
    #[error("abort: {0}")]
    Abort(String),
    #[error("txn already committed at {commit_ts}")]
    AlreadyCommitted { commit_ts: u64 },
    #[error("txn {start_ts} already rolled back")]
    AlreadyRolledBack { start_ts: u64, key: Vec<u8> },
    #[error("write conflict on {key:?}")]
    WriteConflict {
        start_ts: u64,
        conflict_start_ts: u64,
        conflict_commit_ts: u64,
        key: Vec<u8>,
        primary: Vec<u8>,
    },
    #[error("key already exists")]
    AlreadyExist { key: Vec<u8> },
    #[error("deadlock, key hash {key_hash}")]
    Deadlock {
        lock_ts: u64,
        lock_key: Vec<u8>,
        key_hash: u64,
    },
    #[error("assertion failed on {key:?}")]
    AssertionFailed {
        start_ts: u64,
        key: Vec<u8>,
        assertion: i32,
        existing_start_ts: u64,
        existing_commit_ts: u64,
    },
    #[error("commit ts {attempted_commit_ts} expired, minimum {min_commit_ts}")]
    CommitTsExpired {
        start_ts: u64,
        attempted_commit_ts: u64,
        key: Vec<u8>,
        min_commit_ts: u64,
    },
    #[error("txn {start_ts} not found")]
    TxnNotFound {
        start_ts: u64,
        primary_key: Vec<u8>,
    },
    #[error("corrupted record: {0}")]
    Corrupted(String),
}

pub type MvccResult<T> = Result<T, MvccError>;

impl MvccError {
    /// The wire form served to clients.
    pub fn to_key_error(&self) -> kvpb::KeyError {
        let mut e = kvpb::KeyError::default();
        match self {
            MvccError::KeyIsLocked(info) => e.locked = Some(info.clone()),
            MvccError::Retryable(msg) => e.retryable = msg.clone(),
            MvccError::Abort(msg) => e.abort = msg.clone(),
            MvccError::AlreadyCommitted { .. } => {
                e.abort = self.to_string();
            }
            MvccError::AlreadyRolledBack { .. } => {
                e.abort = self.to_string();
            }
            MvccError::WriteConflict {
                start_ts,
                conflict_start_ts,
                conflict_commit_ts,
                key,
                primary,
            } => {
                e.conflict = Some(kvpb::WriteConflict {
                    start_ts: *start_ts,
                    conflict_ts: *conflict_start_ts,
                    conflict_commit_ts: *conflict_commit_ts,
                    key: key.clone(),
                    primary: primary.clone(),
                });
            }
            MvccError::AlreadyExist { key } => {
                e.already_exist = Some(kvpb::AlreadyExist { key: key.clone() });
            }
            MvccError::Deadlock {
                lock_ts,
                lock_key,
                key_hash,
            } => {
                e.deadlock = Some(kvpb::Deadlock {
                    lock_ts: *lock_ts,
                    lock_key: lock_key.clone(),
                    deadlock_key_hash: *key_hash,
                });
            }
            MvccError::AssertionFailed {
                start_ts,
                key,
                assertion,
                existing_start_ts,
                existing_commit_ts,
            } => {
                e.assertion_failed = Some(kvpb::AssertionFailed {
                    start_ts: *start_ts,
                    key: key.clone(),
                    assertion: *assertion,
                    existing_start_ts: *existing_start_ts,
                    existing_commit_ts: *existing_commit_ts,
                });
            }
            MvccError::CommitTsExpired {
                start_ts,
                attempted_commit_ts,
                key,
                min_commit_ts,
            } => {
                e.commit_ts_expired = Some(kvpb::CommitTsExpired {
                    start_ts: *start_ts,
                    attempted_commit_ts: *attempted_commit_ts,
                    key: key.clone(),
                    min_commit_ts: *min_commit_ts,
                });
            }
            MvccError::TxnNotFound {
                start_ts,
                primary_key,
            } => {
                e.txn_not_found = Some(kvpb::TxnNotFound {
                    start_ts: *start_ts,
                    primary_key: primary_key.clone(),
                });
            }
            MvccError::Corrupted(msg) => e.abort = msg.clone(),
        }
        e
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
enum WriteKind {
    Put = 0,
    Delete = 1,
    Lock = 2,
    Rollback = 3,
}

/// A lock slot record. At most one exists per user key.
#[derive(Clone, PartialEq, ::prost::Message)]
struct LockRecord {
    #[prost(uint64, tag = "1")]
    start_ts: u64,
    #[prost(bytes = "vec", tag = "2")]
    primary: Vec<u8>,
    #[prost(enumeration = "crate::proto::kvpb::Op", tag = "3")]
    op: i32,
    #[prost(bytes = "vec", tag = "4")]
    value: Vec<u8>,
    #[prost(uint64, tag = "5")]
    ttl: u64,
    #[prost(uint64, tag = "6")]
    for_update_ts: u64,
    #[prost(uint64, tag = "7")]
    txn_size: u64,
    #[prost(uint64, tag = "8")]
    min_commit_ts: u64,
    #[prost(bool, tag = "9")]
    use_async_commit: bool,
    #[prost(bytes = "vec", repeated, tag = "10")]
    secondaries: Vec<Vec<u8>>,
}

/// A committed version record, stored at `encode(key, commit_ts)`. Rollback
/// records have `start_ts == commit_ts` and act as tombstones that fence a
/// late prewrite of the same transaction.
#[derive(Clone, PartialEq, ::prost::Message)]
struct WriteRecord {
    #[prost(enumeration = "WriteKind", tag = "1")]
    kind: i32,
    #[prost(uint64, tag = "2")]
    start_ts: u64,
    #[prost(uint64, tag = "3")]
    commit_ts: u64,
    #[prost(bytes = "vec", tag = "4")]
    value: Vec<u8>,
}

impl LockRecord {
    fn lock_info(&self, key: &[u8]) -> kvpb::LockInfo {
        kvpb::LockInfo {
            primary_lock: self.primary.clone(),
            lock_version: self.start_ts,
            key: key.to_vec(),
            lock_ttl: self.ttl,
            txn_size: self.txn_size,
            lock_type: self.op,
            lock_for_update_ts: self.for_update_ts,
            use_async_commit: self.use_async_commit,
            min_commit_ts: self.min_commit_ts,
            secondaries: self.secondaries.clone(),
        }
    }

    /// Evaluates visibility of this lock to a read at `ts`. Returns the
    /// (possibly adjusted) read version, or the lock error.
    fn check_read(&self, ts: u64, key: &[u8], resolved_locks: &[u64]) -> MvccResult<u64> {
        // A read never blocks on a newer lock or on a lock that holds no
        // data intent.
        if self.start_ts > ts
            || self.op == kvpb::Op::Lock as i32
            || self.op == kvpb::Op::PessimisticLock as i32
        {
            return Ok(ts);
        }
        // A point-get of the latest version may read just below the primary
        // lock instead of blocking.
        if ts == CALLER_START_TS_MAX && self.primary == key {
            return Ok(self.start_ts - 1);
        }
        if resolved_locks.contains(&self.start_ts) {
            return Ok(ts);
        }
        Err(MvccError::KeyIsLocked(self.lock_info(key)))
    }
}

impl WriteKind {
    fn of_op(op: i32) -> WriteKind {
        if op == kvpb::Op::Put as i32 {
            WriteKind::Put
        } else if op == kvpb::Op::Lock as i32 {
            WriteKind::Lock
        } else {
            WriteKind::Delete
        }
    }
}

/// A read result for one key; `err` is set instead of `value` when the key
/// was unreadable (locked).
#[derive(Debug, Clone)]
pub struct MvccPair {
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
    pub err: Option<MvccError>,
}

/// The outcome of a prewrite over a whole batch.
#[derive(Debug, Default)]
pub struct PrewriteResult {
    /// Per-mutation errors; empty when everything succeeded.
    pub errors: Vec<MvccError>,
    /// Non-zero when async commit may proceed.
    pub min_commit_ts: u64,
    /// Non-zero when the batch was committed in one phase.
    pub one_pc_commit_ts: u64,
}

/// Result of `check_txn_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnStatus {
    pub ttl: u64,
    pub commit_ts: u64,
    pub action: kvpb::Action,
}

type Map = BTreeMap<Vec<u8>, Vec<u8>>;

enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// Mutations staged by one engine operation; applied only when the whole
/// operation validated.
#[derive(Default)]
struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(BatchOp::Put(key, value));
    }

    fn delete(&mut self, key: Vec<u8>) {
        self.ops.push(BatchOp::Delete(key));
    }

    fn apply(self, map: &mut Map) {
        for op in self.ops {
            match op {
                BatchOp::Put(k, v) => {
                    map.insert(k, v);
                }
                BatchOp::Delete(k) => {
                    map.remove(&k);
                }
            }
        }
    }
}

/// The reference MVCC engine: one key-space, all mutating operations
/// serialized by the writer lock.
pub struct MvccEngine {
    data: RwLock<Map>,
    detector: DeadlockDetector,
    /// Largest timestamp observed, used to compute pushed commit versions
    /// for async commit and 1PC.
    max_ts: AtomicU64,
}

impl Default for MvccEngine {
    fn default() -> Self {
        MvccEngine::new()
    }
}

impl MvccEngine {
    pub fn new() -> MvccEngine {
        MvccEngine {
            data: RwLock::new(BTreeMap::new()),
            detector: DeadlockDetector::new(),
            max_ts: AtomicU64::new(0),
        }
    }

    fn observe_ts(&self, ts: u64) {
        if ts == u64::MAX {
            return;
        }
        self.max_ts.fetch_max(ts, Ordering::SeqCst);
    }

    /// Advances the engine's observed maximum timestamp, as serving a read
    /// at `ts` would. Pushed commit versions for async commit and 1PC start
    /// above this mark.
    pub fn observe_max_ts(&self, ts: u64) {
        self.observe_ts(ts);
    }

    // Reads

    pub fn get(
        &self,
        key: &[u8],
        start_ts: u64,
        isolation: kvpb::IsolationLevel,
        resolved_locks: &[u64],
    ) -> MvccResult<Option<Vec<u8>>> {
        self.observe_ts(start_ts);
        let map = self.data.read().unwrap_or_else(|e| e.into_inner());
        get_value(&map, key, start_ts, isolation, resolved_locks)
    }

    pub fn batch_get(
        &self,
        keys: &[Vec<u8>],
        start_ts: u64,
        isolation: kvpb::IsolationLevel,
        resolved_locks: &[u64],
    ) -> Vec<MvccPair> {
        self.observe_ts(start_ts);
        let map = self.data.read().unwrap_or_else(|e| e.into_inner());
        let mut pairs = Vec::new();
        for key in keys {
            match get_value(&map, key, start_ts, isolation, resolved_locks) {
                Ok(None) => {}
                Ok(Some(value)) => pairs.push(MvccPair {
                    key: key.clone(),
                    value: Some(value),
                    err: None,
                }),
                Err(e) => pairs.push(MvccPair {
                    key: key.clone(),
                    value: None,
                    err: Some(e),
                }),
            }
        }
        pairs
    }

    /// Scans readable versions in `[start_key, end_key)`, at most `limit`
    /// entries. Locked keys surface their lock error in the result.
    pub fn scan(
        &self,
        start_key: &[u8],
        end_key: &[u8],
        limit: usize,
        start_ts: u64,
        isolation: kvpb::IsolationLevel,
        resolved_locks: &[u64],
    ) -> Vec<MvccPair> {
        self.observe_ts(start_ts);
        let map = self.data.read().unwrap_or_else(|e| e.into_inner());
        let mut pairs = Vec::new();
        let mut cursor = first_user_key_at_or_after(&map, start_key);
        while let Some(key) = cursor {
            if pairs.len() >= limit {
                break;
            }
            if !end_key.is_empty() && key.as_slice() >= end_key {
                break;
            }
            match get_value(&map, &key, start_ts, isolation, resolved_locks) {
                Ok(None) => {}
                Ok(Some(value)) => pairs.push(MvccPair {
                    key: key.clone(),
                    value: Some(value),
                    err: None,
                }),
                Err(e) => pairs.push(MvccPair {
                    key: key.clone(),
                    value: None,
                    err: Some(e),
                }),
            }
            cursor = next_user_key(&map, &key);
        }
        pairs
    }

    /// Scans backwards from `end_key` (exclusive) down to `start_key`.
    pub fn reverse_scan(
        &self,
        start_key: &[u8],
        end_key: &[u8],
        limit: usize,
        start_ts: u64,
        isolation: kvpb::IsolationLevel,
        resolved_locks: &[u64],
    ) -> Vec<MvccPair> {
        self.observe_ts(start_ts);
        let map = self.data.read().unwrap_or_else(|e| e.into_inner());
        let upper = if end_key.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Excluded(mvcc_encode(end_key, LOCK_VER))
        };
        // Collect distinct user keys descending, then read each.
        let mut keys: Vec<Vec<u8>> = Vec::new();
        for (encoded, _) in map.range((Bound::Unbounded, upper)).rev() {
            let Ok((key, _)) = super::mvcc_decode(encoded) else {
                continue;
            };
            if key.as_slice() < start_key {
                break;
            }
            if keys.last().map(|k| *k != key).unwrap_or(true) {
                if keys.len() >= limit {
                    break;
                }
                keys.push(key);
            }
        }
        let mut pairs = Vec::new();
        for key in keys {
            match get_value(&map, &key, start_ts, isolation, resolved_locks) {
                Ok(None) => {}
                Ok(Some(value)) => pairs.push(MvccPair {
                    key,
                    value: Some(value),
                    err: None,
                }),
                Err(e) => pairs.push(MvccPair {
                    key,
                    value: None,
                    err: Some(e),
                }),
            }
        }
        pairs
    }

    // Prewrite

    pub fn prewrite(&self, req: &kvpb::PrewriteRequest) -> PrewriteResult {
        self.observe_ts(req.start_version);
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        let mut batch = WriteBatch::default();
        let mut errors = Vec::new();
        let resolved_locks = req
            .context
            .as_ref()
            .map(|c| c.resolved_locks.clone())
            .unwrap_or_default();

        for (i, m) in req.mutations.iter().enumerate() {
            let op = m.op;
            // Insert checks absence at read time; no need for pessimistic
            // transactions, which validated on lock acquisition.
            if (op == kvpb::Op::Insert as i32 || op == kvpb::Op::CheckNotExists as i32)
                && req.for_update_ts == 0
            {
                match get_value(
                    &data,
                    &m.key,
                    req.start_version,
                    kvpb::IsolationLevel::Si,
                    &resolved_locks,
                ) {
                    Ok(Some(_)) => {
                        errors.push(MvccError::AlreadyExist { key: m.key.clone() });
                        continue;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        errors.push(e);
                        continue;
                    }
                }
            }
            if op == kvpb::Op::CheckNotExists as i32 {
                continue;
            }
            let is_pessimistic = req
                .is_pessimistic_lock
                .get(i)
                .copied()
                .unwrap_or(false);
            if let Err(e) = prewrite_mutation(&data, &mut batch, m, req, is_pessimistic) {
                errors.push(e);
            }
        }

        if !errors.is_empty() {
            return PrewriteResult {
                errors,
                ..Default::default()
            };
        }

        let mut result = PrewriteResult::default();
        if req.use_async_commit || req.try_one_pc {
            let pushed = self
                .max_ts
                .load(Ordering::SeqCst)
                .saturating_add(1)
                .max(req.start_version + 1)
                .max(req.min_commit_ts);
            let fits = req.max_commit_ts == 0 || pushed <= req.max_commit_ts;
            if req.try_one_pc && fits {
                // Commit directly instead of installing locks.
                let mut one_pc = WriteBatch::default();
                for m in &req.mutations {
                    if m.op == kvpb::Op::CheckNotExists as i32 {
                        continue;
                    }
                    let kind = WriteKind::of_op(if m.op == kvpb::Op::Insert as i32 {
                        kvpb::Op::Put as i32
                    } else {
                        m.op
                    });
                    let record = WriteRecord {
                        kind: kind as i32,
                        start_ts: req.start_version,
                        commit_ts: pushed,
                        value: m.value.clone(),
                    };
                    one_pc.put(mvcc_encode(&m.key, pushed), record.encode_to_vec());
                    one_pc.delete(mvcc_encode(&m.key, LOCK_VER));
                }
                one_pc.apply(&mut data);
                self.observe_ts(pushed);
                result.one_pc_commit_ts = pushed;
                return result;
            }
            if req.use_async_commit && fits {
                result.min_commit_ts = pushed;
            }
            // When the pushed version does not fit under max_commit_ts the
            // zeroed fields tell the client to fall back to plain 2PC, with
            // ordinary locks installed below.
        }

        batch.apply(&mut data);
        result
    }

    // Pessimistic locks

    pub fn pessimistic_lock(
        &self,
        req: &kvpb::PessimisticLockRequest,
    ) -> (Vec<MvccError>, Vec<Vec<u8>>, Vec<bool>) {
        self.observe_ts(req.start_version);
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        let mut batch = WriteBatch::default();
        let mut errors = Vec::new();
        let mut values = Vec::new();
        let mut not_founds = Vec::new();

        for m in &req.mutations {
            match self.pessimistic_lock_mutation(&data, &mut batch, m, req) {
                Ok(value) => {
                    if req.return_values {
                        values.push(value.clone().unwrap_or_default());
                        not_founds.push(value.map(|v| v.is_empty()).unwrap_or(true));
                    } else if req.check_existence {
                        not_founds.push(value.map(|v| v.is_empty()).unwrap_or(true));
                    }
                }
                Err(e) => errors.push(e),
            }
        }
        if !errors.is_empty() {
            return (errors, Vec::new(), Vec::new());
        }
        batch.apply(&mut data);
        (errors, values, not_founds)
    }

    fn pessimistic_lock_mutation(
        &self,
        map: &Map,
        batch: &mut WriteBatch,
        m: &kvpb::Mutation,
        req: &kvpb::PessimisticLockRequest,
    ) -> MvccResult<Option<Vec<u8>>> {
        if let Some(lock) = get_lock(map, &m.key)? {
            if lock.start_ts != req.start_version {
                if let Err(hash) =
                    self.detector
                        .detect(req.start_version, lock.start_ts, key_hash(&m.key))
                {
                    return Err(MvccError::Deadlock {
                        lock_ts: lock.start_ts,
                        lock_key: m.key.clone(),
                        key_hash: hash,
                    });
                }
                return Err(MvccError::KeyIsLocked(lock.lock_info(&m.key)));
            }
            // Idempotent re-acquisition.
            return Ok(None);
        }

        // The rollback fence between start_ts and for_update_ts still
        // applies; check conflicts against for_update_ts.
        let value = check_conflict_value(
            map,
            m,
            req.for_update_ts,
            req.start_version,
            true,
            kvpb::AssertionLevel::Off,
        )?;
        if req.lock_only_if_exists && value.is_none() {
            return Ok(value);
        }

        let lock = LockRecord {
            start_ts: req.start_version,
            primary: req.primary_lock.clone(),
            op: kvpb::Op::PessimisticLock as i32,
            value: Vec::new(),
            ttl: req.lock_ttl,
            for_update_ts: req.for_update_ts,
            txn_size: 0,
            min_commit_ts: req.min_commit_ts,
            use_async_commit: false,
            secondaries: Vec::new(),
        };
        batch.put(mvcc_encode(&m.key, LOCK_VER), lock.encode_to_vec());
        Ok(value)
    }

    pub fn pessimistic_rollback(
        &self,
        keys: &[Vec<u8>],
        start_ts: u64,
        for_update_ts: u64,
    ) -> Vec<MvccError> {
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        let mut batch = WriteBatch::default();
        let mut errors = Vec::new();
        for key in keys {
            if let Err(e) = pessimistic_rollback_key(&data, &mut batch, key, start_ts, for_update_ts)
            {
                errors.push(e);
            }
        }
        if errors.is_empty() {
            batch.apply(&mut data);
            self.detector.clean_up(start_ts);
        }
        errors
    }

    // Commit / rollback

    pub fn commit(&self, keys: &[Vec<u8>], start_ts: u64, commit_ts: u64) -> MvccResult<()> {
        self.observe_ts(commit_ts);
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        let mut batch = WriteBatch::default();
        for key in keys {
            commit_key(&data, &mut batch, key, start_ts, commit_ts)?;
        }
        batch.apply(&mut data);
        drop(data);
        self.detector.clean_up(start_ts);
        Ok(())
    }

    pub fn rollback(&self, keys: &[Vec<u8>], start_ts: u64) -> MvccResult<()> {
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        let mut batch = WriteBatch::default();
        for key in keys {
            rollback_key(&data, &mut batch, key, start_ts)?;
        }
        batch.apply(&mut data);
        drop(data);
        self.detector.clean_up(start_ts);
        Ok(())
    }

    /// Deprecated single-key rollback; returns the commit version when the
    /// transaction turned out to be committed.
    pub fn cleanup(&self, key: &[u8], start_ts: u64, current_ts: u64) -> MvccResult<()> {
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        let mut batch = WriteBatch::default();

        if let Some(lock) = get_lock(&data, key)? {
            if lock.start_ts == start_ts {
                let expired = current_ts == 0
                    || extract_physical(lock.start_ts) + lock.ttl < extract_physical(current_ts);
                if expired {
                    rollback_lock(&mut batch, key, start_ts);
                    batch.apply(&mut data);
                    drop(data);
                    self.detector.clean_up(start_ts);
                    return Ok(());
                }
                return Err(MvccError::KeyIsLocked(lock.lock_info(key)));
            }
        }
        if let Some(write) = get_txn_commit_info(&data, key, start_ts)? {
            if write.kind != WriteKind::Rollback as i32 {
                return Err(MvccError::AlreadyCommitted {
                    commit_ts: write.commit_ts,
                });
            }
            return Ok(());
        }
        write_rollback(&mut batch, key, start_ts);
        batch.apply(&mut data);
        Ok(())
    }

    /// Checks the primary lock of a transaction to decide its status,
    /// possibly rolling it back or pushing its `min_commit_ts` forward.
    pub fn check_txn_status(
        &self,
        primary_key: &[u8],
        lock_ts: u64,
        caller_start_ts: u64,
        current_ts: u64,
        rollback_if_not_exist: bool,
        resolving_pessimistic_lock: bool,
    ) -> MvccResult<TxnStatus> {
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());

        if let Some(mut lock) = get_lock(&data, primary_key)? {
            if lock.start_ts == lock_ts {
                let mut batch = WriteBatch::default();

                // Expired: clean the lock up. The pessimistic flavor keeps
                // write intents of other statements of the same transaction.
                if extract_physical(lock.start_ts) + lock.ttl < extract_physical(current_ts) {
                    let action = if resolving_pessimistic_lock
                        && lock.op == kvpb::Op::PessimisticLock as i32
                    {
                        pessimistic_rollback_key(
                            &data,
                            &mut batch,
                            primary_key,
                            lock.start_ts,
                            lock.for_update_ts,
                        )?;
                        kvpb::Action::TtlExpirePessimisticRollback
                    } else {
                        rollback_lock(&mut batch, primary_key, lock_ts);
                        kvpb::Action::TtlExpireRollback
                    };
                    batch.apply(&mut data);
                    drop(data);
                    self.detector.clean_up(lock_ts);
                    return Ok(TxnStatus {
                        ttl: 0,
                        commit_ts: 0,
                        action,
                    });
                }

                let mut action = kvpb::Action::NoAction;
                if caller_start_ts == CALLER_START_TS_MAX {
                    // An autocommit point-get; the read may ignore the lock
                    // next time, so pretend the push happened.
                    action = kvpb::Action::MinCommitTsPushed;
                } else if lock.min_commit_ts > 0 {
                    action = kvpb::Action::MinCommitTsPushed;
                    // Pushing keeps the invariant min_commit_ts >= caller+1.
                    if lock.min_commit_ts < caller_start_ts + 1 {
                        lock.min_commit_ts = (caller_start_ts + 1).max(current_ts);
                        batch.put(
                            mvcc_encode(primary_key, LOCK_VER),
                            lock.encode_to_vec(),
                        );
                        batch.apply(&mut data);
                    }
                }
                return Ok(TxnStatus {
                    ttl: lock.ttl,
                    commit_ts: 0,
                    action,
                });
            }
        }

        if let Some(write) = get_txn_commit_info(&data, primary_key, lock_ts)? {
            if write.kind != WriteKind::Rollback as i32 {
                return Ok(TxnStatus {
                    ttl: 0,
                    commit_ts: write.commit_ts,
                    action: kvpb::Action::NoAction,
                });
            }
            return Ok(TxnStatus {
                ttl: 0,
                commit_ts: 0,
                action: kvpb::Action::NoAction,
            });
        }

        // No lock and no commit info: either the primary was never written
        // (slow prewrite) or a pessimistic rollback left no tombstone.
        if rollback_if_not_exist {
            if resolving_pessimistic_lock {
                return Ok(TxnStatus {
                    ttl: 0,
                    commit_ts: 0,
                    action: kvpb::Action::LockNotExistDoNothing,
                });
            }
            // Write a rollback tombstone but do not delete any lock on the
            // primary: a lock with a different start_ts may legitimately sit
            // there.
            let mut batch = WriteBatch::default();
            write_rollback(&mut batch, primary_key, lock_ts);
            batch.apply(&mut data);
            return Ok(TxnStatus {
                ttl: 0,
                commit_ts: 0,
                action: kvpb::Action::LockNotExistRollback,
            });
        }

        Err(MvccError::TxnNotFound {
            start_ts: lock_ts,
            primary_key: primary_key.to_vec(),
        })
    }

    /// Extends the primary lock's TTL to `advise_ttl` if larger. Returns the
    /// lock's TTL after the call.
    pub fn txn_heart_beat(&self, key: &[u8], start_ts: u64, advise_ttl: u64) -> MvccResult<u64> {
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        if let Some(mut lock) = get_lock(&data, key)? {
            if lock.start_ts == start_ts {
                if lock.primary != key {
                    return Err(MvccError::Abort(
                        "txn_heart_beat on non-primary key".to_owned(),
                    ));
                }
                if advise_ttl > lock.ttl {
                    lock.ttl = advise_ttl;
                    let mut batch = WriteBatch::default();
                    batch.put(mvcc_encode(key, LOCK_VER), lock.encode_to_vec());
                    batch.apply(&mut data);
                }
                return Ok(lock.ttl);
            }
        }
        Err(MvccError::Retryable("lock doesn't exist".to_owned()))
    }

    // Lock housekeeping

    /// Locks in `[start_key, end_key)` with `start_ts <= max_ts`.
    pub fn scan_lock(
        &self,
        start_key: &[u8],
        end_key: &[u8],
        max_ts: u64,
    ) -> MvccResult<Vec<kvpb::LockInfo>> {
        let map = self.data.read().unwrap_or_else(|e| e.into_inner());
        let mut locks = Vec::new();
        let mut cursor = first_user_key_at_or_after(&map, start_key);
        while let Some(key) = cursor {
            if !end_key.is_empty() && key.as_slice() >= end_key {
                break;
            }
            if let Some(lock) = get_lock(&map, &key)? {
                if lock.start_ts <= max_ts {
                    locks.push(lock.lock_info(&key));
                }
            }
            cursor = next_user_key(&map, &key);
        }
        Ok(locks)
    }

    /// Commits (commit_ts > 0) or rolls back every lock of `start_ts` in the
    /// range.
    pub fn resolve_lock(
        &self,
        start_key: &[u8],
        end_key: &[u8],
        start_ts: u64,
        commit_ts: u64,
    ) -> MvccResult<()> {
        let mut txn_infos = HashMap::new();
        txn_infos.insert(start_ts, commit_ts);
        self.batch_resolve_lock(start_key, end_key, &txn_infos)
    }

    pub fn batch_resolve_lock(
        &self,
        start_key: &[u8],
        end_key: &[u8],
        txn_infos: &HashMap<u64, u64>,
    ) -> MvccResult<()> {
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        let mut batch = WriteBatch::default();
        let mut cursor = first_user_key_at_or_after(&data, start_key);
        while let Some(key) = cursor {
            if !end_key.is_empty() && key.as_slice() >= end_key {
                break;
            }
            if let Some(lock) = get_lock(&data, &key)? {
                if let Some(&commit_ts) = txn_infos.get(&lock.start_ts) {
                    if commit_ts > 0 {
                        commit_lock(&mut batch, &lock, &key, lock.start_ts, commit_ts);
                    } else {
                        rollback_lock(&mut batch, &key, lock.start_ts);
                    }
                }
            }
            cursor = next_user_key(&data, &key);
        }
        batch.apply(&mut data);
        drop(data);
        for (&start_ts, _) in txn_infos {
            self.detector.clean_up(start_ts);
        }
        Ok(())
    }

    /// Reclaims versions at or below `safe_point`. Every user key keeps its
    /// newest `Put` at-or-under the safepoint; everything older, and all
    /// Lock/Rollback records under it, are deleted.
    pub fn gc(&self, start_key: &[u8], end_key: &[u8], safe_point: u64) -> MvccResult<()> {
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        let mut batch = WriteBatch::default();
        let mut cursor = first_user_key_at_or_after(&data, start_key);
        while let Some(key) = cursor {
            if !end_key.is_empty() && key.as_slice() >= end_key {
                break;
            }
            if let Some(lock) = get_lock(&data, &key)? {
                if lock.start_ts <= safe_point {
                    return Err(MvccError::Abort(format!(
                        "key {:?} has lock with start_ts {} under safe point {}",
                        key, lock.start_ts, safe_point
                    )));
                }
            }
            let mut keep_next = true;
            for entry in writes_of(&data, &key) {
                let (ver, write) = entry?;
                if write.commit_ts > safe_point {
                    continue;
                }
                if write.kind == WriteKind::Put as i32 || write.kind == WriteKind::Delete as i32 {
                    // The newest record at-or-under the safepoint survives
                    // only if it is a Put.
                    if !keep_next || write.kind == WriteKind::Delete as i32 {
                        batch.delete(mvcc_encode(&key, ver));
                    }
                    keep_next = false;
                } else {
                    batch.delete(mvcc_encode(&key, ver));
                }
            }
            cursor = next_user_key(&data, &key);
        }
        batch.apply(&mut data);
        Ok(())
    }

    /// Unconditionally removes every record of keys in `[start_key,
    /// end_key)`, locks included.
    pub fn delete_range(&self, start_key: &[u8], end_key: &[u8]) -> MvccResult<()> {
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        let lower = mvcc_encode(start_key, LOCK_VER);
        let upper = if end_key.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Excluded(mvcc_encode(end_key, LOCK_VER))
        };
        let doomed: Vec<Vec<u8>> = data
            .range((Bound::Included(lower), upper))
            .map(|(k, _)| k.clone())
            .collect();
        for k in doomed {
            data.remove(&k);
        }
        Ok(())
    }
}

// Record-level helpers. All take the map immutably and stage changes in a
// batch so a failed operation leaves no partial writes.

fn get_lock(map: &Map, key: &[u8]) -> MvccResult<Option<LockRecord>> {
    let Some(raw) = map.get(&mvcc_encode(key, LOCK_VER)) else {
        return Ok(None);
    };
    LockRecord::decode(raw.as_slice())
        .map(Some)
        .map_err(|e| MvccError::Corrupted(format!("lock record: {e}")))
}

/// Versions of `key`, newest commit first.
fn writes_of<'a>(
    map: &'a Map,
    key: &[u8],
) -> impl Iterator<Item = MvccResult<(u64, WriteRecord)>> + 'a {
    let lower = Bound::Excluded(mvcc_encode(key, LOCK_VER));
    let upper = Bound::Included(mvcc_encode(key, 0));
    map.range((lower, upper)).map(|(encoded, raw)| {
        let (_, ver) = super::mvcc_decode(encoded)
            .map_err(|_| MvccError::Corrupted("undecodable version key".to_owned()))?;
        let record = WriteRecord::decode(raw.as_slice())
            .map_err(|e| MvccError::Corrupted(format!("write record: {e}")))?;
        Ok((ver, record))
    })
}

fn get_value(
    map: &Map,
    key: &[u8],
    mut start_ts: u64,
    isolation: kvpb::IsolationLevel,
    resolved_locks: &[u64],
) -> MvccResult<Option<Vec<u8>>> {
    if isolation == kvpb::IsolationLevel::Si {
        if let Some(lock) = get_lock(map, key)? {
            start_ts = lock.check_read(start_ts, key, resolved_locks)?;
        }
    }
    for entry in writes_of(map, key) {
        let (_, write) = entry?;
        if write.kind == WriteKind::Rollback as i32 || write.kind == WriteKind::Lock as i32 {
            continue;
        }
        // The first committed value visible at start_ts.
        if write.commit_ts <= start_ts {
            if write.kind == WriteKind::Delete as i32 {
                return Ok(None);
            }
            return Ok(Some(write.value));
        }
    }
    Ok(None)
}

fn get_txn_commit_info(map: &Map, key: &[u8], start_ts: u64) -> MvccResult<Option<WriteRecord>> {
    for entry in writes_of(map, key) {
        let (_, write) = entry?;
        if write.start_ts == start_ts {
            return Ok(Some(write));
        }
    }
    Ok(None)
}

/// The write-conflict / assertion / rollback walk over a key's versions,
/// newest first. Returns the latest Put/Delete value when `get_val` is set.
fn check_conflict_value(
    map: &Map,
    m: &kvpb::Mutation,
    for_update_ts: u64,
    start_ts: u64,
    get_val: bool,
    assertion_level: kvpb::AssertionLevel,
) -> MvccResult<Option<Vec<u8>>> {
    let assertions_on = assertion_level != kvpb::AssertionLevel::Off;
    let mut iter = writes_of(map, &m.key);
    let Some(first) = iter.next() else {
        if m.assertion == kvpb::Assertion::Exist as i32
            && assertions_on
            && m.op != kvpb::Op::PessimisticLock as i32
        {
            return Err(MvccError::AssertionFailed {
                start_ts,
                key: m.key.clone(),
                assertion: m.assertion,
                existing_start_ts: 0,
                existing_commit_ts: 0,
            });
        }
        return Ok(None);
    };
    let (_, first) = first?;

    // Any newer committed record is a conflict, rollbacks and intent locks
    // included.
    if first.commit_ts > for_update_ts {
        return Err(MvccError::WriteConflict {
            start_ts: for_update_ts,
            conflict_start_ts: first.start_ts,
            conflict_commit_ts: first.commit_ts,
            key: m.key.clone(),
            primary: Vec::new(),
        });
    }

    let mut need_get_val = get_val;
    let mut need_check_not_exist_pessimistic = m.assertion == kvpb::Assertion::NotExist as i32
        && m.op == kvpb::Op::PessimisticLock as i32;
    let need_check_assertion = m.assertion != kvpb::Assertion::None as i32
        && m.op != kvpb::Op::PessimisticLock as i32
        && assertions_on;
    let mut need_check_rollback = true;
    let mut ret_val: Option<Vec<u8>> = None;
    let mut current = first;
    loop {
        if need_check_rollback {
            if current.kind == WriteKind::Rollback as i32 && current.commit_ts == start_ts {
                return Err(MvccError::AlreadyRolledBack {
                    start_ts,
                    key: m.key.clone(),
                });
            }
            if current.commit_ts < start_ts {
                need_check_rollback = false;
            }
        }

        if current.kind == WriteKind::Put as i32 || current.kind == WriteKind::Lock as i32 {
            if need_check_not_exist_pessimistic
                || (need_check_assertion && m.assertion == kvpb::Assertion::NotExist as i32)
            {
                return Err(MvccError::AssertionFailed {
                    start_ts,
                    key: m.key.clone(),
                    assertion: m.assertion,
                    existing_start_ts: current.start_ts,
                    existing_commit_ts: current.commit_ts,
                });
            }
        } else if current.kind == WriteKind::Delete as i32 {
            need_check_not_exist_pessimistic = false;
        }

        if need_get_val
            && (current.kind == WriteKind::Delete as i32 || current.kind == WriteKind::Put as i32)
        {
            ret_val = Some(current.value.clone());
            need_get_val = false;
        }

        if !need_check_not_exist_pessimistic && !need_get_val && !need_check_rollback {
            break;
        }
        match iter.next() {
            Some(entry) => current = entry?.1,
            None => {
                if m.assertion == kvpb::Assertion::Exist as i32 && assertions_on && ret_val.is_none()
                {
                    return Err(MvccError::AssertionFailed {
                        start_ts,
                        key: m.key.clone(),
                        assertion: m.assertion,
                        existing_start_ts: 0,
                        existing_commit_ts: 0,
                    });
                }
                break;
            }
        }
    }
    if get_val {
        return Ok(ret_val.filter(|v| !v.is_empty()));
    }
    Ok(None)
}

fn prewrite_mutation(
    map: &Map,
    batch: &mut WriteBatch,
    m: &kvpb::Mutation,
    req: &kvpb::PrewriteRequest,
    is_pessimistic: bool,
) -> MvccResult<()> {
    let start_ts = req.start_version;
    let mut ttl = req.lock_ttl;
    let mut min_commit_ts = req.min_commit_ts;

    match get_lock(map, &m.key)? {
        Some(lock) if lock.start_ts != start_ts => {
            let mut info = lock.lock_info(&m.key);
            if is_pessimistic {
                // Telling the caller TTL = 0 lets it roll the blocking
                // transaction back unconditionally.
                info.lock_ttl = 0;
            }
            return Err(MvccError::KeyIsLocked(info));
        }
        Some(lock) => {
            if lock.op != kvpb::Op::PessimisticLock as i32 {
                // Idempotent prewrite retry; the lock is already in place.
                return Ok(());
            }
            // Promoting this transaction's pessimistic lock: never shrink
            // what the TTL manager or a pushed reader established.
            ttl = ttl.max(lock.ttl);
            min_commit_ts = min_commit_ts.max(lock.min_commit_ts);
            check_conflict_value(map, m, start_ts, start_ts, false, req.assertion_level())?;
        }
        None => {
            if is_pessimistic {
                return Err(MvccError::Abort("pessimistic lock not found".to_owned()));
            }
            check_conflict_value(map, m, start_ts, start_ts, false, req.assertion_level())?;
        }
    }

    let op = if m.op == kvpb::Op::Insert as i32 {
        kvpb::Op::Put as i32
    } else {
        m.op
    };
    let is_primary = req.primary_lock == m.key;
    let lock = LockRecord {
        start_ts,
        primary: req.primary_lock.clone(),
        op,
        value: m.value.clone(),
        ttl,
        for_update_ts: 0,
        txn_size: req.txn_size,
        // min_commit_ts rides on the primary lock; with async commit every
        // lock carries it so readers can push any of them.
        min_commit_ts: if is_primary || req.use_async_commit {
            min_commit_ts
        } else {
            0
        },
        use_async_commit: req.use_async_commit,
        secondaries: if is_primary {
            req.secondaries.clone()
        } else {
            Vec::new()
        },
    };
    batch.put(mvcc_encode(&m.key, LOCK_VER), lock.encode_to_vec());
    Ok(())
}

fn commit_key(
    map: &Map,
    batch: &mut WriteBatch,
    key: &[u8],
    start_ts: u64,
    commit_ts: u64,
) -> MvccResult<()> {
    let lock = get_lock(map, key)?;
    let lock = match lock {
        Some(lock) if lock.start_ts == start_ts => lock,
        _ => {
            // The lock is gone or belongs to someone else; check whether
            // this transaction already committed (idempotent retry) or was
            // rolled back.
            if let Some(write) = get_txn_commit_info(map, key, start_ts)? {
                if write.kind != WriteKind::Rollback as i32 {
                    return Ok(());
                }
            }
            return Err(MvccError::Retryable("txn not found".to_owned()));
        }
    };
    if lock.min_commit_ts > commit_ts {
        return Err(MvccError::CommitTsExpired {
            start_ts,
            attempted_commit_ts: commit_ts,
            key: key.to_vec(),
            min_commit_ts: lock.min_commit_ts,
        });
    }
    commit_lock(batch, &lock, key, start_ts, commit_ts);
    Ok(())
}

fn commit_lock(batch: &mut WriteBatch, lock: &LockRecord, key: &[u8], start_ts: u64, commit_ts: u64) {
    let kind = WriteKind::of_op(lock.op);
    let record = WriteRecord {
        kind: kind as i32,
        start_ts,
        commit_ts,
        value: lock.value.clone(),
    };
    batch.put(mvcc_encode(key, commit_ts), record.encode_to_vec());
    batch.delete(mvcc_encode(key, LOCK_VER));
}

fn rollback_key(map: &Map, batch: &mut WriteBatch, key: &[u8], start_ts: u64) -> MvccResult<()> {
    if let Some(lock) = get_lock(map, key)? {
        if lock.start_ts == start_ts {
            rollback_lock(batch, key, start_ts);
            return Ok(());
        }
    }
    if let Some(write) = get_txn_commit_info(map, key, start_ts)? {
        if write.kind != WriteKind::Rollback as i32 {
            return Err(MvccError::AlreadyCommitted {
                commit_ts: write.commit_ts,
            });
        }
        return Ok(());
    }
    // Not prewritten (yet): leave a tombstone to fence a late prewrite.
    write_rollback(batch, key, start_ts);
    Ok(())
}

fn write_rollback(batch: &mut WriteBatch, key: &[u8], start_ts: u64) {
    let tomb = WriteRecord {
        kind: WriteKind::Rollback as i32,
        start_ts,
        commit_ts: start_ts,
        value: Vec::new(),
    };
    batch.put(mvcc_encode(key, start_ts), tomb.encode_to_vec());
}

fn rollback_lock(batch: &mut WriteBatch, key: &[u8], start_ts: u64) {
    write_rollback(batch, key, start_ts);
    batch.delete(mvcc_encode(key, LOCK_VER));
}

fn pessimistic_rollback_key(
    map: &Map,
    batch: &mut WriteBatch,
    key: &[u8],
    start_ts: u64,
    for_update_ts: u64,
) -> MvccResult<()> {
    if let Some(lock) = get_lock(map, key)? {
        if lock.op == kvpb::Op::PessimisticLock as i32
            && lock.start_ts == start_ts
            && lock.for_update_ts <= for_update_ts
        {
            batch.delete(mvcc_encode(key, LOCK_VER));
        }
    }
    Ok(())
}

fn first_user_key_at_or_after(map: &Map, from: &[u8]) -> Option<Vec<u8>> {
    let lower = mvcc_encode(from, LOCK_VER);
    let (encoded, _) = map.range(lower..).next()?;
    super::mvcc_decode(encoded).ok().map(|(key, _)| key)
}

fn next_user_key(map: &Map, current: &[u8]) -> Option<Vec<u8>> {
    let after = mvcc_encode(current, 0);
    let (encoded, _) = map
        .range((Bound::Excluded(after), Bound::Unbounded))
        .next()?;
    super::mvcc_decode(encoded).ok().map(|(key, _)| key)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SI: kvpb::IsolationLevel = kvpb::IsolationLevel::Si;

    fn ts(physical_ms: u64, logical: u64) -> u64 {
        crate::timestamp::compose_ts(physical_ms, logical)
    }

    fn mutation(op: kvpb::Op, key: &[u8], value: &[u8]) -> kvpb::Mutation {
        kvpb::Mutation {
            op: op as i32,
            key: key.to_vec(),
            value: value.to_vec(),
            assertion: kvpb::Assertion::None as i32,
        }
    }

    fn prewrite_req(
        mutations: Vec<kvpb::Mutation>,
        primary: &[u8],
        start_ts: u64,
    ) -> kvpb::PrewriteRequest {
        kvpb::PrewriteRequest {
            mutations,
            primary_lock: primary.to_vec(),
            start_version: start_ts,
            lock_ttl: 3000,
            ..Default::default()
        }
    }

    fn must_prewrite_put(engine: &MvccEngine, key: &[u8], value: &[u8], primary: &[u8], start: u64) {
        let result = engine.prewrite(&prewrite_req(
            vec![mutation(kvpb::Op::Put, key, value)],
            primary,
            start,
        ));
        assert!(result.errors.is_empty(), "{:?}", result.errors);
    }

    fn must_commit(engine: &MvccEngine, key: &[u8], start: u64, commit: u64) {
        engine.commit(&[key.to_vec()], start, commit).unwrap();
    }

    #[test]
    fn put_commit_get_visibility() {
        let engine = MvccEngine::new();
        must_prewrite_put(&engine, b"a", b"1", b"a", ts(100, 0));
        must_commit(&engine, b"a", ts(100, 0), ts(110, 0));

        assert_eq!(
            engine.get(b"a", ts(110, 0), SI, &[]).unwrap(),
            Some(b"1".to_vec())
        );
        assert_eq!(engine.get(b"a", ts(109, 0), SI, &[]).unwrap(), None);

        // Overwrite at a later version; both versions remain addressable.
        must_prewrite_put(&engine, b"a", b"2", b"a", ts(120, 0));
        must_commit(&engine, b"a", ts(120, 0), ts(130, 0));
        assert_eq!(
            engine.get(b"a", ts(125, 0), SI, &[]).unwrap(),
            Some(b"1".to_vec())
        );
        assert_eq!(
            engine.get(b"a", ts(130, 0), SI, &[]).unwrap(),
            Some(b"2".to_vec())
        );
    }

    #[test]
    fn reads_block_on_older_locks_only() {
        let engine = MvccEngine::new();
        must_prewrite_put(&engine, b"k", b"v", b"k", ts(100, 0));

        // A read below the lock passes; a read above it is blocked.
        assert_eq!(engine.get(b"k", ts(99, 0), SI, &[]).unwrap(), None);
        let err = engine.get(b"k", ts(101, 0), SI, &[]).unwrap_err();
        let MvccError::KeyIsLocked(info) = err else {
            panic!("expected lock error");
        };
        assert_eq!(info.lock_version, ts(100, 0));

        // Read-committed ignores locks; resolved locks are skipped too.
        assert_eq!(
            engine
                .get(b"k", ts(101, 0), kvpb::IsolationLevel::Rc, &[])
                .unwrap(),
            None
        );
        assert_eq!(
            engine.get(b"k", ts(101, 0), SI, &[ts(100, 0)]).unwrap(),
            None
        );
    }

    #[test]
    fn prewrite_write_conflict() {
        let engine = MvccEngine::new();
        must_prewrite_put(&engine, b"k", b"v", b"k", ts(100, 0));
        must_commit(&engine, b"k", ts(100, 0), ts(120, 0));

        let result = engine.prewrite(&prewrite_req(
            vec![mutation(kvpb::Op::Put, b"k", b"w")],
            b"k",
            ts(100, 0),
        ));
        assert_eq!(result.errors.len(), 1);
        let MvccError::WriteConflict {
            conflict_commit_ts, ..
        } = &result.errors[0]
        else {
            panic!("expected write conflict, got {:?}", result.errors[0]);
        };
        assert_eq!(*conflict_commit_ts, ts(120, 0));
        // No lock must have been installed.
        assert!(get_lock(&engine.data.read().unwrap(), b"k").unwrap().is_none());
    }

    #[test]
    fn prewrite_is_idempotent() {
        let engine = MvccEngine::new();
        must_prewrite_put(&engine, b"k", b"v", b"k", ts(100, 0));
        must_prewrite_put(&engine, b"k", b"v", b"k", ts(100, 0));
        must_commit(&engine, b"k", ts(100, 0), ts(110, 0));
        assert_eq!(
            engine.get(b"k", ts(110, 0), SI, &[]).unwrap(),
            Some(b"v".to_vec())
        );
    }

    #[test]
    fn insert_checks_existence() {
        let engine = MvccEngine::new();
        must_prewrite_put(&engine, b"k", b"v", b"k", ts(100, 0));
        must_commit(&engine, b"k", ts(100, 0), ts(110, 0));

        let result = engine.prewrite(&prewrite_req(
            vec![mutation(kvpb::Op::Insert, b"k", b"w")],
            b"k",
            ts(120, 0),
        ));
        assert!(matches!(
            result.errors[0],
            MvccError::AlreadyExist { .. }
        ));

        // Deleting first clears the way.
        let del = engine.prewrite(&prewrite_req(
            vec![mutation(kvpb::Op::Del, b"k", b"")],
            b"k",
            ts(120, 0),
        ));
        assert!(del.errors.is_empty());
        must_commit(&engine, b"k", ts(120, 0), ts(130, 0));
        let result = engine.prewrite(&prewrite_req(
            vec![mutation(kvpb::Op::Insert, b"k", b"w")],
            b"k",
            ts(140, 0),
        ));
        assert!(result.errors.is_empty());
    }

    #[test]
    fn rollback_fences_late_prewrite() {
        let engine = MvccEngine::new();
        engine.rollback(&[b"k".to_vec()], ts(100, 0)).unwrap();

        let result = engine.prewrite(&prewrite_req(
            vec![mutation(kvpb::Op::Put, b"k", b"v")],
            b"k",
            ts(100, 0),
        ));
        assert!(matches!(
            result.errors[0],
            MvccError::AlreadyRolledBack { .. }
        ));
    }

    #[test]
    fn commit_is_idempotent_and_checks_history() {
        let engine = MvccEngine::new();
        must_prewrite_put(&engine, b"k", b"v", b"k", ts(100, 0));
        must_commit(&engine, b"k", ts(100, 0), ts(110, 0));
        // Re-commit of a committed txn succeeds silently.
        must_commit(&engine, b"k", ts(100, 0), ts(110, 0));

        // Committing a rolled-back txn reports it.
        engine.rollback(&[b"r".to_vec()], ts(100, 0)).unwrap();
        let err = engine
            .commit(&[b"r".to_vec()], ts(100, 0), ts(110, 0))
            .unwrap_err();
        assert!(matches!(err, MvccError::Retryable(_)));
    }

    #[test]
    fn commit_respects_min_commit_ts() {
        let engine = MvccEngine::new();
        let mut req = prewrite_req(
            vec![mutation(kvpb::Op::Put, b"k", b"v")],
            b"k",
            ts(100, 0),
        );
        req.min_commit_ts = ts(150, 0);
        let result = engine.prewrite(&req);
        assert!(result.errors.is_empty());

        let err = engine
            .commit(&[b"k".to_vec()], ts(100, 0), ts(140, 0))
            .unwrap_err();
        let MvccError::CommitTsExpired { min_commit_ts, .. } = err else {
            panic!("expected CommitTsExpired");
        };
        assert_eq!(min_commit_ts, ts(150, 0));
        engine
            .commit(&[b"k".to_vec()], ts(100, 0), ts(150, 0))
            .unwrap();
    }

    #[test]
    fn check_txn_status_paths() {
        let engine = MvccEngine::new();

        // Committed: reports the commit version.
        must_prewrite_put(&engine, b"c", b"v", b"c", ts(100, 0));
        must_commit(&engine, b"c", ts(100, 0), ts(110, 0));
        let status = engine
            .check_txn_status(b"c", ts(100, 0), ts(115, 0), ts(115, 0), true, false)
            .unwrap();
        assert_eq!(status.commit_ts, ts(110, 0));

        // Live lock within TTL: reports the TTL.
        must_prewrite_put(&engine, b"l", b"v", b"l", ts(200, 0));
        let status = engine
            .check_txn_status(b"l", ts(200, 0), ts(201, 0), ts(201, 0), true, false)
            .unwrap();
        assert_eq!(status.ttl, 3000);
        assert_eq!(status.commit_ts, 0);

        // Expired lock: rolled back.
        let status = engine
            .check_txn_status(b"l", ts(200, 0), ts(99_999, 0), ts(99_999, 0), true, false)
            .unwrap();
        assert_eq!(status.action, kvpb::Action::TtlExpireRollback);
        assert!(get_lock(&engine.data.read().unwrap(), b"l").unwrap().is_none());

        // Unknown txn: a rollback tombstone is written.
        let status = engine
            .check_txn_status(b"n", ts(300, 0), ts(301, 0), ts(301, 0), true, false)
            .unwrap();
        assert_eq!(status.action, kvpb::Action::LockNotExistRollback);
        let late = engine.prewrite(&prewrite_req(
            vec![mutation(kvpb::Op::Put, b"n", b"v")],
            b"n",
            ts(300, 0),
        ));
        assert!(matches!(
            late.errors[0],
            MvccError::AlreadyRolledBack { .. }
        ));

        // Unknown txn without rollback permission: TxnNotFound.
        let err = engine
            .check_txn_status(b"m", ts(300, 0), ts(301, 0), ts(301, 0), false, false)
            .unwrap_err();
        assert!(matches!(err, MvccError::TxnNotFound { .. }));
    }

    #[test]
    fn check_txn_status_pushes_min_commit_ts() {
        let engine = MvccEngine::new();
        let mut req = prewrite_req(
            vec![mutation(kvpb::Op::Put, b"k", b"v")],
            b"k",
            ts(100, 0),
        );
        req.min_commit_ts = ts(100, 1);
        assert!(engine.prewrite(&req).errors.is_empty());

        let status = engine
            .check_txn_status(b"k", ts(100, 0), ts(120, 0), ts(121, 0), true, false)
            .unwrap();
        assert_eq!(status.action, kvpb::Action::MinCommitTsPushed);

        // The commit may now only use a version above the pushed floor.
        let err = engine
            .commit(&[b"k".to_vec()], ts(100, 0), ts(110, 0))
            .unwrap_err();
        assert!(matches!(err, MvccError::CommitTsExpired { .. }));
    }

    #[test]
    fn check_txn_status_point_get_sentinel_does_not_push() {
        let engine = MvccEngine::new();
        let mut req = prewrite_req(
            vec![mutation(kvpb::Op::Put, b"k", b"v")],
            b"k",
            ts(100, 0),
        );
        req.min_commit_ts = ts(100, 1);
        assert!(engine.prewrite(&req).errors.is_empty());

        let status = engine
            .check_txn_status(b"k", ts(100, 0), u64::MAX, ts(120, 0), true, false)
            .unwrap();
        assert_eq!(status.action, kvpb::Action::MinCommitTsPushed);
        // The lock itself is unchanged.
        let lock = get_lock(&engine.data.read().unwrap(), b"k")
            .unwrap()
            .unwrap();
        assert_eq!(lock.min_commit_ts, ts(100, 1));
    }

    #[test]
    fn pessimistic_lock_and_promotion() {
        let engine = MvccEngine::new();
        let lock_req = kvpb::PessimisticLockRequest {
            mutations: vec![mutation(kvpb::Op::PessimisticLock, b"k", b"")],
            primary_lock: b"k".to_vec(),
            start_version: ts(100, 0),
            lock_ttl: 3000,
            for_update_ts: ts(100, 0),
            ..Default::default()
        };
        let (errors, _, _) = engine.pessimistic_lock(&lock_req);
        assert!(errors.is_empty());

        // Prewrite of the same txn promotes the lock.
        let mut req = prewrite_req(
            vec![mutation(kvpb::Op::Put, b"k", b"v")],
            b"k",
            ts(100, 0),
        );
        req.for_update_ts = ts(100, 0);
        req.is_pessimistic_lock = vec![true];
        req.lock_ttl = 2000; // smaller than the pessimistic lock's
        let result = engine.prewrite(&req);
        assert!(result.errors.is_empty());
        let lock = get_lock(&engine.data.read().unwrap(), b"k")
            .unwrap()
            .unwrap();
        assert_eq!(lock.op, kvpb::Op::Put as i32);
        // TTL was clamped up, not down.
        assert_eq!(lock.ttl, 3000);

        must_commit(&engine, b"k", ts(100, 0), ts(110, 0));
        assert_eq!(
            engine.get(b"k", ts(110, 0), SI, &[]).unwrap(),
            Some(b"v".to_vec())
        );
    }

    #[test]
    fn pessimistic_prewrite_without_lock_aborts() {
        let engine = MvccEngine::new();
        let mut req = prewrite_req(
            vec![mutation(kvpb::Op::Put, b"k", b"v")],
            b"k",
            ts(100, 0),
        );
        req.for_update_ts = ts(100, 0);
        req.is_pessimistic_lock = vec![true];
        let result = engine.prewrite(&req);
        assert!(matches!(result.errors[0], MvccError::Abort(_)));
    }

    #[test]
    fn deadlock_detected_on_cycle() {
        let engine = MvccEngine::new();
        let lock = |key: &[u8], primary: &[u8], start: u64, for_update: u64| {
            kvpb::PessimisticLockRequest {
                mutations: vec![mutation(kvpb::Op::PessimisticLock, key, b"")],
                primary_lock: primary.to_vec(),
                start_version: start,
                lock_ttl: 3000,
                for_update_ts: for_update,
                ..Default::default()
            }
        };
        let t1 = ts(100, 0);
        let t2 = ts(101, 0);
        assert!(engine.pessimistic_lock(&lock(b"x", b"x", t1, t1)).0.is_empty());
        assert!(engine.pessimistic_lock(&lock(b"y", b"y", t2, t2)).0.is_empty());

        // T1 waits on y (held by T2), then T2 waits on x: cycle.
        let (errors, _, _) = engine.pessimistic_lock(&lock(b"y", b"x", t1, t1));
        assert!(matches!(errors[0], MvccError::KeyIsLocked(_)));
        let (errors, _, _) = engine.pessimistic_lock(&lock(b"x", b"y", t2, t2));
        let MvccError::Deadlock { key_hash: hash, .. } = &errors[0] else {
            panic!("expected deadlock, got {:?}", errors[0]);
        };
        assert_eq!(*hash, key_hash(b"y"));

        // T2 backs off and rolls back; T1 may proceed.
        engine.pessimistic_rollback(&[b"y".to_vec()], t2, t2);
        let (errors, _, _) = engine.pessimistic_lock(&lock(b"y", b"x", t1, t1));
        assert!(errors.is_empty(), "{errors:?}");
    }

    #[test]
    fn resolve_lock_commits_or_rolls_back_in_range() {
        let engine = MvccEngine::new();
        must_prewrite_put(&engine, b"a", b"1", b"a", ts(100, 0));
        must_prewrite_put(&engine, b"b", b"2", b"a", ts(100, 0));
        must_prewrite_put(&engine, b"c", b"3", b"c", ts(105, 0));

        engine.resolve_lock(b"", b"", ts(100, 0), ts(110, 0)).unwrap();
        assert_eq!(
            engine.get(b"b", ts(110, 0), SI, &[]).unwrap(),
            Some(b"2".to_vec())
        );
        // The unrelated txn's lock is untouched.
        assert!(engine.get(b"c", ts(110, 0), SI, &[]).is_err());

        engine.resolve_lock(b"", b"", ts(105, 0), 0).unwrap();
        assert_eq!(engine.get(b"c", ts(110, 0), SI, &[]).unwrap(), None);
    }

    #[test]
    fn scan_skips_deleted_and_respects_limit() {
        let engine = MvccEngine::new();
        for (key, value) in [(b"a", b"1"), (b"b", b"2"), (b"c", b"3")] {
            must_prewrite_put(&engine, key, value, key, ts(100, 0));
            must_commit(&engine, key, ts(100, 0), ts(110, 0));
        }
        let del = engine.prewrite(&prewrite_req(
            vec![mutation(kvpb::Op::Del, b"b", b"")],
            b"b",
            ts(120, 0),
        ));
        assert!(del.errors.is_empty());
        must_commit(&engine, b"b", ts(120, 0), ts(130, 0));

        let pairs = engine.scan(b"", b"", 10, ts(130, 0), SI, &[]);
        let keys: Vec<&[u8]> = pairs.iter().map(|p| p.key.as_slice()).collect();
        assert_eq!(keys, vec![b"a" as &[u8], b"c"]);

        let pairs = engine.scan(b"", b"", 1, ts(130, 0), SI, &[]);
        assert_eq!(pairs.len(), 1);

        let pairs = engine.reverse_scan(b"", b"", 10, ts(130, 0), SI, &[]);
        let keys: Vec<&[u8]> = pairs.iter().map(|p| p.key.as_slice()).collect();
        assert_eq!(keys, vec![b"c" as &[u8], b"a"]);
    }

    #[test]
    fn gc_keeps_newest_put_under_safepoint() {
        let engine = MvccEngine::new();
        // Three versions of "k": put@110, put@130, delete@150.
        for (value, start, commit) in [
            (b"1" as &[u8], ts(100, 0), ts(110, 0)),
            (b"2", ts(120, 0), ts(130, 0)),
        ] {
            must_prewrite_put(&engine, b"k", value, b"k", start);
            must_commit(&engine, b"k", start, commit);
        }
        let del = engine.prewrite(&prewrite_req(
            vec![mutation(kvpb::Op::Del, b"k", b"")],
            b"k",
            ts(140, 0),
        ));
        assert!(del.errors.is_empty());
        must_commit(&engine, b"k", ts(140, 0), ts(150, 0));
        engine.rollback(&[b"k".to_vec()], ts(155, 0)).unwrap();

        // Safepoint between the two puts: the newer survives, the older and
        // the tombstones go.
        engine.gc(b"", b"", ts(135, 0)).unwrap();
        assert_eq!(
            engine.get(b"k", ts(135, 0), SI, &[]).unwrap(),
            Some(b"2".to_vec())
        );
        assert_eq!(engine.get(b"k", ts(115, 0), SI, &[]).unwrap(), None);

        // Safepoint above the delete: everything at-or-under goes, including
        // the delete itself.
        engine.gc(b"", b"", ts(160, 0)).unwrap();
        assert_eq!(engine.get(b"k", ts(160, 0), SI, &[]).unwrap(), None);
        let data = engine.data.read().unwrap();
        assert!(data.is_empty(), "{} records left", data.len());
    }

    #[test]
    fn gc_refuses_ranges_with_old_locks() {
        let engine = MvccEngine::new();
        must_prewrite_put(&engine, b"k", b"v", b"k", ts(100, 0));
        assert!(engine.gc(b"", b"", ts(120, 0)).is_err());
        assert!(engine.gc(b"", b"", ts(99, 0)).is_ok());
    }

    #[test]
    fn one_pc_commits_without_locks() {
        let engine = MvccEngine::new();
        let mut req = prewrite_req(
            vec![
                mutation(kvpb::Op::Put, b"a", b"1"),
                mutation(kvpb::Op::Put, b"b", b"2"),
            ],
            b"a",
            ts(100, 0),
        );
        req.try_one_pc = true;
        let result = engine.prewrite(&req);
        assert!(result.errors.is_empty());
        assert!(result.one_pc_commit_ts > ts(100, 0));
        assert!(get_lock(&engine.data.read().unwrap(), b"a").unwrap().is_none());
        assert_eq!(
            engine
                .get(b"a", result.one_pc_commit_ts, SI, &[])
                .unwrap(),
            Some(b"1".to_vec())
        );
    }

    #[test]
    fn one_pc_falls_back_when_max_commit_ts_too_low() {
        let engine = MvccEngine::new();
        engine.observe_ts(ts(200, 0));
        let mut req = prewrite_req(
            vec![mutation(kvpb::Op::Put, b"a", b"1")],
            b"a",
            ts(100, 0),
        );
        req.try_one_pc = true;
        req.max_commit_ts = ts(150, 0);
        let result = engine.prewrite(&req);
        assert!(result.errors.is_empty());
        assert_eq!(result.one_pc_commit_ts, 0);
        assert_eq!(result.min_commit_ts, 0);
        // Ordinary locks were installed for the 2PC fallback.
        assert!(get_lock(&engine.data.read().unwrap(), b"a").unwrap().is_some());
    }

    #[test]
    fn async_commit_returns_pushed_min_commit_ts() {
        let engine = MvccEngine::new();
        engine.observe_ts(ts(180, 0));
        let mut req = prewrite_req(
            vec![mutation(kvpb::Op::Put, b"a", b"1")],
            b"a",
            ts(100, 0),
        );
        req.use_async_commit = true;
        req.secondaries = vec![b"b".to_vec()];
        let result = engine.prewrite(&req);
        assert!(result.errors.is_empty());
        assert!(result.min_commit_ts > ts(180, 0));

        let lock = get_lock(&engine.data.read().unwrap(), b"a")
            .unwrap()
            .unwrap();
        assert!(lock.use_async_commit);
        assert_eq!(lock.secondaries, vec![b"b".to_vec()]);
    }

    #[test]
    fn txn_heart_beat_extends_ttl() {
        let engine = MvccEngine::new();
        must_prewrite_put(&engine, b"k", b"v", b"k", ts(100, 0));
        assert_eq!(engine.txn_heart_beat(b"k", ts(100, 0), 5000).unwrap(), 5000);
        // Never shrinks.
        assert_eq!(engine.txn_heart_beat(b"k", ts(100, 0), 1000).unwrap(), 5000);
        assert!(engine.txn_heart_beat(b"k", ts(999, 0), 5000).is_err());
    }

    #[test]
    fn scan_lock_filters_by_ts() {
        let engine = MvccEngine::new();
        must_prewrite_put(&engine, b"a", b"1", b"a", ts(100, 0));
        must_prewrite_put(&engine, b"b", b"2", b"b", ts(200, 0));
        let locks = engine.scan_lock(b"", b"", ts(150, 0)).unwrap();
        assert_eq!(locks.len(), 1);
        assert_eq!(locks[0].key, b"a".to_vec());
    }

    #[test]
    fn delete_range_removes_everything() {
        let engine = MvccEngine::new();
        for key in [b"a" as &[u8], b"b", b"c"] {
            must_prewrite_put(&engine, key, b"v", key, ts(100, 0));
            must_commit(&engine, key, ts(100, 0), ts(110, 0));
        }
        engine.delete_range(b"a", b"c").unwrap();
        assert_eq!(engine.get(b"a", ts(120, 0), SI, &[]).unwrap(), None);
        assert_eq!(engine.get(b"b", ts(120, 0), SI, &[]).unwrap(), None);
        assert_eq!(
            engine.get(b"c", ts(120, 0), SI, &[]).unwrap(),
            Some(b"v".to_vec())
        );
    }
}
