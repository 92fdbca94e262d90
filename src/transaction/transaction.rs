// Copyright 2024 RiftKV Project Authors. Licensed under Apache-2.0.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::debug;
use log::warn;

use super::requests::new_batch_get_request;
use super::requests::new_get_request;
use super::requests::HasLocks;
use super::requests::new_heart_beat_request;
use super::requests::new_scan_request;
use super::resolve_locks;
use super::Committer;
use super::TtlManager;
use super::TxnStore;
use super::MANAGED_LOCK_TTL;
use crate::backoff::BackoffContext;
use crate::backoff::Backoffer;
use crate::backoff::BO_TXN_LOCK_FAST;
use crate::backoff::GET_MAX_BACKOFF_MS;
use crate::backoff::SCAN_MAX_BACKOFF_MS;
use crate::pd::PdClient;
use crate::proto::kvpb;
use crate::request::READ_TIMEOUT_MEDIUM;
use crate::request::READ_TIMEOUT_SHORT;
use crate::store::KvConnect;
use crate::timestamp::Timestamp;
use crate::timestamp::TimestampExt;
use crate::Error;
use crate::Key;
use crate::KvPair;
use crate::Result;
use crate::Value;

/// Optimistic transactions buffer everything and validate at prewrite time;
/// pessimistic ones take server-side locks as statements touch keys, with a
/// per-statement `for_update_ts`.
#[derive(Clone, PartialEq, Debug)]
pub enum TransactionKind {
    Optimistic,
    Pessimistic(u64),
}

/// What `Drop` does when a transaction was neither committed nor rolled
/// back.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum CheckLevel {
    Panic,
    Warn,
    None,
}

/// Options for transactions.
#[derive(Clone, PartialEq, Debug)]
pub struct TransactionOptions {
    kind: TransactionKind,
    async_commit: bool,
    try_one_pc: bool,
    read_only: bool,
    assertion_level: kvpb::AssertionLevel,
    check_level: CheckLevel,
}

impl Default for TransactionOptions {
    fn default() -> TransactionOptions {
        TransactionOptions::new_optimistic()
    }
}

impl TransactionOptions {
    pub fn new_optimistic() -> TransactionOptions {
        TransactionOptions {
            kind: TransactionKind::Optimistic,
            async_commit: false,
            try_one_pc: false,
            read_only: false,
            assertion_level: kvpb::AssertionLevel::Off,
            check_level: CheckLevel::Panic,
        }
    }

    pub fn new_pessimistic() -> TransactionOptions {
        TransactionOptions {
            kind: TransactionKind::Pessimistic(0),
            async_commit: false,
            try_one_pc: false,
            read_only: false,
            assertion_level: kvpb::AssertionLevel::Off,
            check_level: CheckLevel::Panic,
        }
    }

    /// Commit as soon as all prewrites succeed, without a second phase on
    /// the critical path.
    #[must_use]
    pub fn use_async_commit(mut self) -> TransactionOptions {
        self.async_commit = true;
        self
    }

    /// Try to commit in a single round when the transaction fits one region.
    #[must_use]
    pub fn try_one_pc(mut self) -> TransactionOptions {
        self.try_one_pc = true;
        self
    }

    #[must_use]
    pub fn read_only(mut self) -> TransactionOptions {
        self.read_only = true;
        self
    }

    #[must_use]
    pub fn assertion_level(mut self, level: kvpb::AssertionLevel) -> TransactionOptions {
        self.assertion_level = level;
        self
    }

    #[must_use]
    pub fn drop_check(mut self, level: CheckLevel) -> TransactionOptions {
        self.check_level = level;
        self
    }

    pub fn is_pessimistic(&self) -> bool {
        matches!(self.kind, TransactionKind::Pessimistic(_))
    }
}

#[repr(u8)]
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
enum TransactionStatus {
    /// Read-only snapshot; nothing to commit, roll back or warn about.
    ReadOnly = 0,
    /// Not yet committed or rolled back.
    Active = 1,
    Committed = 2,
    /// Commit was attempted; only `commit` may be retried.
    StartedCommit = 3,
    Rolledback = 4,
    /// Rollback was attempted; only `rollback` may be retried.
    StartedRollback = 5,
    Dropped = 6,
}

impl From<u8> for TransactionStatus {
    fn from(value: u8) -> TransactionStatus {
        match value {
            0 => TransactionStatus::ReadOnly,
            1 => TransactionStatus::Active,
            2 => TransactionStatus::Committed,
            3 => TransactionStatus::StartedCommit,
            4 => TransactionStatus::Rolledback,
            5 => TransactionStatus::StartedRollback,
            _ => TransactionStatus::Dropped,
        }
    }
}

/// A buffered write awaiting commit.
#[derive(Clone, Debug, PartialEq)]
enum BufferEntry {
    Put(Value),
    Insert(Value),
    Del,
    /// Key locked at commit time without writing a value.
    Lock,
}

impl BufferEntry {
    fn to_mutation(&self, key: &Key) -> kvpb::Mutation {
        let mut m = kvpb::Mutation {
            op: 0,
            key: key.clone().into(),
            value: Vec::new(),
            assertion: kvpb::Assertion::None as i32,
        };
        match self {
            BufferEntry::Put(value) => {
                m.op = kvpb::Op::Put as i32;
                m.value = value.clone();
            }
            BufferEntry::Insert(value) => {
                m.op = kvpb::Op::Insert as i32;
                m.value = value.clone();
                m.assertion = kvpb::Assertion::NotExist as i32;
            }
            BufferEntry::Del => m.op = kvpb::Op::Del as i32,
            BufferEntry::Lock => m.op = kvpb::Op::Lock as i32,
        }
        m
    }
}

/// An in-progress transaction.
///
/// Writes are buffered locally and sent through the two-phase protocol on
/// [`Transaction::commit`]; reads see the cluster at the transaction's start
/// timestamp, overlaid with the local buffer.
pub struct Transaction<PdC: PdClient, Cn: KvConnect> {
    status: AtomicU8,
    timestamp: Timestamp,
    buffer: BTreeMap<Key, BufferEntry>,
    store: Arc<TxnStore<PdC, Cn>>,
    options: TransactionOptions,
    /// Keys holding this transaction's pessimistic locks.
    locked_keys: HashSet<Vec<u8>>,
    /// The first pessimistically locked key; the transaction's primary must
    /// not move once any lock points at it.
    pessimistic_primary: Option<Vec<u8>>,
    /// Lock versions readers of this transaction may bypass (pushed locks).
    bypass_locks: Vec<u64>,
    ttl_manager: TtlManager,
}

impl<PdC: PdClient, Cn: KvConnect> Transaction<PdC, Cn> {
    pub(crate) fn new(
        timestamp: Timestamp,
        store: Arc<TxnStore<PdC, Cn>>,
        options: TransactionOptions,
    ) -> Transaction<PdC, Cn> {
        let status = if options.read_only {
            TransactionStatus::ReadOnly
        } else {
            TransactionStatus::Active
        };
        Transaction {
            status: AtomicU8::new(status as u8),
            timestamp,
            buffer: BTreeMap::new(),
            store,
            options,
            locked_keys: HashSet::new(),
            pessimistic_primary: None,
            bypass_locks: Vec::new(),
            ttl_manager: TtlManager::new(),
        }
    }

    /// The transaction's start timestamp.
    pub fn start_timestamp(&self) -> Timestamp {
        self.timestamp
    }

    fn start_ts(&self) -> u64 {
        self.timestamp.version()
    }

    /// Gets the value associated with the given key.
    pub async fn get(&mut self, key: impl Into<Key>) -> Result<Option<Value>> {
        self.check_allow_operation()?;
        let key = key.into();
        match self.buffer.get(&key) {
            Some(BufferEntry::Put(value)) | Some(BufferEntry::Insert(value)) => {
                return Ok(Some(value.clone()));
            }
            Some(BufferEntry::Del) => return Ok(None),
            Some(BufferEntry::Lock) | None => {}
        }
        self.snapshot_get(key).await
    }

    pub async fn key_exists(&mut self, key: impl Into<Key>) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Gets the values of the given keys, omitting missing ones. Keys may
    /// arrive in any order; results are keyed pairs.
    pub async fn batch_get(
        &mut self,
        keys: impl IntoIterator<Item = impl Into<Key>>,
    ) -> Result<Vec<KvPair>> {
        self.check_allow_operation()?;
        let mut from_buffer = HashMap::new();
        let mut remote = Vec::new();
        for key in keys {
            let key = key.into();
            match self.buffer.get(&key) {
                Some(BufferEntry::Put(value)) | Some(BufferEntry::Insert(value)) => {
                    from_buffer.insert(key, Some(value.clone()));
                }
                Some(BufferEntry::Del) => {
                    from_buffer.insert(key, None);
                }
                Some(BufferEntry::Lock) | None => remote.push(Vec::<u8>::from(key)),
            }
        }

        let mut pairs: Vec<KvPair> = from_buffer
            .into_iter()
            .filter_map(|(key, value)| value.map(|value| KvPair(key, value)))
            .collect();
        if !remote.is_empty() {
            pairs.extend(self.snapshot_batch_get(remote).await?);
        }
        Ok(pairs)
    }

    /// Scans `[start, end)` of the snapshot merged with the local buffer, up
    /// to `limit` pairs.
    pub async fn scan(
        &mut self,
        range: impl Into<crate::BoundRange>,
        limit: u32,
    ) -> Result<Vec<KvPair>> {
        self.scan_inner(range.into(), limit, false).await
    }

    pub async fn scan_reverse(
        &mut self,
        range: impl Into<crate::BoundRange>,
        limit: u32,
    ) -> Result<Vec<KvPair>> {
        self.scan_inner(range.into(), limit, true).await
    }

    /// Sets the value associated with the given key.
    pub async fn put(&mut self, key: impl Into<Key>, value: impl Into<Value>) -> Result<()> {
        self.check_allow_operation()?;
        let key = key.into();
        if self.options.is_pessimistic() {
            self.pessimistic_lock(vec![key.clone().into()], false).await?;
        }
        self.buffer.insert(key, BufferEntry::Put(value.into()));
        Ok(())
    }

    /// Like `put`, and additionally requires the key to be absent at commit
    /// time.
    pub async fn insert(&mut self, key: impl Into<Key>, value: impl Into<Value>) -> Result<()> {
        self.check_allow_operation()?;
        let key = key.into();
        if let Some(BufferEntry::Del) = self.buffer.get(&key) {
            // The transaction deleted it, so a plain put is what insert
            // means now.
            self.buffer.insert(key, BufferEntry::Put(value.into()));
            return Ok(());
        }
        if self.options.is_pessimistic() {
            self.pessimistic_lock(vec![key.clone().into()], false).await?;
        }
        self.buffer.insert(key, BufferEntry::Insert(value.into()));
        Ok(())
    }

    /// Deletes the given key.
    pub async fn delete(&mut self, key: impl Into<Key>) -> Result<()> {
        self.check_allow_operation()?;
        let key = key.into();
        if self.options.is_pessimistic() {
            self.pessimistic_lock(vec![key.clone().into()], false).await?;
        }
        self.buffer.insert(key, BufferEntry::Del);
        Ok(())
    }

    /// Locks the given keys without writing values, preventing other
    /// writers from changing them before this transaction commits.
    pub async fn lock_keys(
        &mut self,
        keys: impl IntoIterator<Item = impl Into<Key>>,
    ) -> Result<()> {
        self.check_allow_operation()?;
        let keys: Vec<Key> = keys.into_iter().map(Into::into).collect();
        match self.options.kind {
            TransactionKind::Optimistic => {
                for key in keys {
                    self.buffer.entry(key).or_insert(BufferEntry::Lock);
                }
            }
            TransactionKind::Pessimistic(_) => {
                let raw: Vec<Vec<u8>> = keys.iter().cloned().map(Into::into).collect();
                self.pessimistic_lock(raw, false).await?;
                for key in keys {
                    self.buffer.entry(key).or_insert(BufferEntry::Lock);
                }
            }
        }
        Ok(())
    }

    /// Reads a key and pessimistically locks it with a fresh
    /// `for_update_ts`, so the value cannot change before commit.
    pub async fn get_for_update(&mut self, key: impl Into<Key>) -> Result<Option<Value>> {
        self.check_allow_operation()?;
        if !self.options.is_pessimistic() {
            return Err(Error::InvalidTransactionType);
        }
        let key = key.into();
        let mut values = self.pessimistic_lock(vec![key.clone().into()], true).await?;
        Ok(values
            .remove(<&[u8]>::from(&key))
            .and_then(|(value, not_found)| (!not_found).then_some(value)))
    }

    pub async fn batch_get_for_update(
        &mut self,
        keys: impl IntoIterator<Item = impl Into<Key>>,
    ) -> Result<Vec<KvPair>> {
        self.check_allow_operation()?;
        if !self.options.is_pessimistic() {
            return Err(Error::InvalidTransactionType);
        }
        let keys: Vec<Vec<u8>> = keys.into_iter().map(|k| k.into().into()).collect();
        let values = self.pessimistic_lock(keys.clone(), true).await?;
        let mut pairs = Vec::new();
        for key in keys {
            if let Some((value, not_found)) = values.get(key.as_slice()) {
                if !*not_found {
                    pairs.push(KvPair(key.into(), value.clone()));
                }
            }
        }
        Ok(pairs)
    }

    /// Commits the transaction, returning the commit timestamp (`None` when
    /// there was nothing to commit).
    pub async fn commit(&mut self) -> Result<Option<Timestamp>> {
        if !self.transit_status(
            |status| {
                matches!(
                    status,
                    TransactionStatus::StartedCommit | TransactionStatus::Active
                )
            },
            TransactionStatus::StartedCommit,
        ) {
            return Err(Error::OperationAfterCommitError);
        }

        let result = self.build_committer().commit().await;
        if result.is_ok() {
            self.set_status(TransactionStatus::Committed);
        }
        result
    }

    /// Rolls the transaction back, undoing its locks.
    pub async fn rollback(&mut self) -> Result<()> {
        if !self.transit_status(
            |status| {
                matches!(
                    status,
                    TransactionStatus::StartedRollback | TransactionStatus::Active
                )
            },
            TransactionStatus::StartedRollback,
        ) {
            return Err(Error::OperationAfterCommitError);
        }

        let result = self.build_committer().rollback().await;
        if result.is_ok() {
            self.set_status(TransactionStatus::Rolledback);
        }
        result
    }

    /// Manually extends the primary lock's TTL, for callers that manage
    /// their own keep-alive cadence. Returns the TTL the lock now has.
    pub async fn send_heart_beat(&mut self) -> Result<u64> {
        self.check_allow_operation()?;
        let Some(primary_key) = self.primary_key() else {
            return Err(Error::NoPrimaryKey);
        };
        let (ctx, _cancel) = BackoffContext::new();
        let mut bo = Backoffer::new(ctx, GET_MAX_BACKOFF_MS);
        let mut req =
            new_heart_beat_request(primary_key.clone(), self.start_ts(), MANAGED_LOCK_TTL);
        let resp: kvpb::TxnHeartBeatResponse = self
            .store
            .send_to_key(&mut bo, &mut req, &primary_key, READ_TIMEOUT_SHORT)
            .await?;
        if let Some(key_error) = resp.error {
            return Err(Error::from(key_error));
        }
        Ok(resp.lock_ttl)
    }

    // Internals

    fn primary_key(&self) -> Option<Vec<u8>> {
        // Pessimistic transactions pin the primary on the first locked key;
        // otherwise the first buffered mutation is it.
        self.pessimistic_primary
            .clone()
            .or_else(|| self.buffer.keys().next().map(|k| k.clone().into()))
    }

    fn build_committer(&mut self) -> Committer<PdC, Cn> {
        let mut mutations: Vec<kvpb::Mutation> = self
            .buffer
            .iter()
            .map(|(key, entry)| {
                let mut m = entry.to_mutation(key);
                if self.options.assertion_level == kvpb::AssertionLevel::Off {
                    m.assertion = kvpb::Assertion::None as i32;
                }
                m
            })
            .collect();
        // Pessimistically locked keys with no buffered write still commit
        // (as Lock records), otherwise their locks would be orphaned.
        for key in &self.locked_keys {
            let buffered: &Key = key.as_ref();
            if !self.buffer.contains_key(buffered) {
                mutations.push(kvpb::Mutation {
                    op: kvpb::Op::Lock as i32,
                    key: key.clone(),
                    value: Vec::new(),
                    assertion: kvpb::Assertion::None as i32,
                });
            }
        }
        mutations.sort_by(|a, b| a.key.cmp(&b.key));
        let primary_key = self
            .primary_key()
            .unwrap_or_else(|| mutations.first().map(|m| m.key.clone()).unwrap_or_default());
        let for_update_ts = match self.options.kind {
            TransactionKind::Optimistic => 0,
            TransactionKind::Pessimistic(ts) => ts,
        };
        Committer::new(
            self.store.clone(),
            mutations,
            primary_key,
            self.start_ts(),
            self.options.is_pessimistic(),
            for_update_ts,
            self.locked_keys.clone(),
            self.options.async_commit,
            self.options.try_one_pc,
            self.options.assertion_level as i32,
            self.ttl_manager.clone(),
        )
    }

    /// Acquires pessimistic locks with a fresh `for_update_ts`, remembering
    /// the keys for prewrite promotion. Returns read values when requested.
    async fn pessimistic_lock(
        &mut self,
        keys: Vec<Vec<u8>>,
        return_values: bool,
    ) -> Result<HashMap<Vec<u8>, (Vec<u8>, bool)>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let for_update_ts = self.store.current_timestamp().await?.version();
        if let TransactionKind::Pessimistic(current) = &mut self.options.kind {
            *current = (*current).max(for_update_ts);
        }

        let mut sorted: Vec<Vec<u8>> = keys;
        sorted.sort();
        sorted.dedup();
        let primary = self
            .pessimistic_primary
            .get_or_insert_with(|| sorted[0].clone())
            .clone();
        let mutations: Vec<kvpb::Mutation> = sorted
            .iter()
            .map(|key| kvpb::Mutation {
                op: kvpb::Op::PessimisticLock as i32,
                key: key.clone(),
                value: Vec::new(),
                assertion: kvpb::Assertion::None as i32,
            })
            .collect();

        let committer = Committer::new(
            self.store.clone(),
            mutations,
            primary,
            self.start_ts(),
            true,
            for_update_ts,
            HashSet::new(),
            false,
            false,
            kvpb::AssertionLevel::Off as i32,
            self.ttl_manager.clone(),
        );
        let values = committer
            .acquire_pessimistic_locks(for_update_ts, return_values, false)
            .await?;
        self.locked_keys.extend(sorted);
        Ok(values)
    }

    async fn snapshot_get(&mut self, key: Key) -> Result<Option<Value>> {
        let (ctx, _cancel) = BackoffContext::new();
        let mut bo = Backoffer::new(ctx, GET_MAX_BACKOFF_MS);
        let raw_key: Vec<u8> = key.into();
        loop {
            let mut req = new_get_request(raw_key.clone(), self.start_ts());
            req.context_mut_resolved(&self.bypass_locks);
            let mut resp: kvpb::GetResponse = self
                .store
                .send_to_key(&mut bo, &mut req, &raw_key, READ_TIMEOUT_SHORT)
                .await?;
            let locks = resp.take_locks();
            if !locks.is_empty() {
                self.resolve_read_locks(&mut bo, locks).await?;
                continue;
            }
            if let Some(key_error) = resp.error.take() {
                return Err(Error::from(key_error));
            }
            if resp.not_found {
                return Ok(None);
            }
            return Ok(Some(resp.value));
        }
    }

    async fn snapshot_batch_get(&mut self, keys: Vec<Vec<u8>>) -> Result<Vec<KvPair>> {
        let (ctx, _cancel) = BackoffContext::new();
        let mut bo = Backoffer::new(ctx, GET_MAX_BACKOFF_MS);
        let mut sorted = keys;
        sorted.sort();
        sorted.dedup();

        let mut pairs = Vec::new();
        // Group per region and read each group, resolving locks as they
        // surface.
        let mut pending = sorted;
        while !pending.is_empty() {
            let (groups, _) = self.store.cache.group_keys_by_region(&mut bo, &pending).await?;
            let mut next_round = Vec::new();
            for (region, group_keys) in groups {
                let mut req = new_batch_get_request(group_keys.clone(), self.start_ts());
                req.context_mut_resolved(&self.bypass_locks);
                let mut sender = self.store.sender();
                match sender
                    .send::<kvpb::BatchGetRequest, kvpb::BatchGetResponse>(
                        &mut bo,
                        &mut req,
                        region,
                        READ_TIMEOUT_SHORT,
                    )
                    .await?
                {
                    crate::request::SendOutcome::Response(resp) => {
                        let mut locks = Vec::new();
                        for pair in resp.pairs {
                            if let Some(mut key_error) = pair.error {
                                if let Some(lock) = key_error.locked.take() {
                                    next_round.push(lock.key.clone());
                                    locks.push(lock);
                                    continue;
                                }
                                return Err(Error::from(key_error));
                            }
                            pairs.push(KvPair(pair.key.into(), pair.value));
                        }
                        if !locks.is_empty() {
                            self.resolve_read_locks(&mut bo, locks).await?;
                        }
                    }
                    crate::request::SendOutcome::RegionError(_) => {
                        // Routing moved underneath us; retry these keys with
                        // fresh locations.
                        next_round.extend(group_keys);
                    }
                }
            }
            pending = next_round;
        }
        Ok(pairs)
    }

    async fn scan_inner(
        &mut self,
        range: crate::BoundRange,
        limit: u32,
        reverse: bool,
    ) -> Result<Vec<KvPair>> {
        self.check_allow_operation()?;
        let (ctx, _cancel) = BackoffContext::new();
        let mut bo = Backoffer::new(ctx, SCAN_MAX_BACKOFF_MS);
        let (start, end) = range.into_keys();
        let start: Vec<u8> = start.into();
        let end: Vec<u8> = end.map(Into::into).unwrap_or_default();

        let mut remote: Vec<KvPair> = Vec::new();
        let mut cursor = if reverse { end.clone() } else { start.clone() };
        loop {
            if remote.len() >= limit as usize {
                break;
            }
            let loc = if reverse {
                if cursor.is_empty() {
                    // +inf: walk the end-key chain to the region with an
                    // open end.
                    let mut loc = self.store.cache.locate_key(&mut bo, &[0xFF; 32]).await?;
                    while !loc.end_key.is_empty() {
                        let next = loc.end_key.clone();
                        loc = self.store.cache.locate_key(&mut bo, &next).await?;
                    }
                    loc
                } else {
                    self.store.cache.locate_end_key(&mut bo, &cursor).await?
                }
            } else {
                self.store.cache.locate_key(&mut bo, &cursor).await?
            };

            let (req_start, req_end) = if reverse {
                let req_end = if cursor.is_empty() {
                    loc.end_key.clone()
                } else {
                    cursor.clone()
                };
                (loc.start_key.clone().max(start.clone()), req_end)
            } else {
                let req_end = if end.is_empty() {
                    loc.end_key.clone()
                } else if loc.end_key.is_empty() {
                    end.clone()
                } else {
                    loc.end_key.clone().min(end.clone())
                };
                (cursor.clone(), req_end)
            };

            let mut req = new_scan_request(
                req_start.clone(),
                req_end.clone(),
                limit,
                self.start_ts(),
                false,
                reverse,
            );
            req.context_mut_resolved(&self.bypass_locks);
            let mut sender = self.store.sender();
            match sender
                .send::<kvpb::ScanRequest, kvpb::ScanResponse>(
                    &mut bo,
                    &mut req,
                    loc.region.clone(),
                    READ_TIMEOUT_MEDIUM,
                )
                .await?
            {
                crate::request::SendOutcome::Response(resp) => {
                    let mut locks = Vec::new();
                    for pair in resp.pairs {
                        if let Some(mut key_error) = pair.error {
                            if let Some(lock) = key_error.locked.take() {
                                locks.push(lock);
                                continue;
                            }
                            return Err(Error::from(key_error));
                        }
                        remote.push(KvPair(pair.key.into(), pair.value));
                    }
                    if !locks.is_empty() {
                        self.resolve_read_locks(&mut bo, locks).await?;
                        // Retry the same stretch after resolution.
                        continue;
                    }
                    if reverse {
                        if loc.start_key.is_empty() || loc.start_key.as_slice() <= start.as_slice()
                        {
                            break;
                        }
                        cursor = loc.start_key.clone();
                    } else {
                        if loc.end_key.is_empty()
                            || (!end.is_empty() && loc.end_key.as_slice() >= end.as_slice())
                        {
                            break;
                        }
                        cursor = loc.end_key.clone();
                    }
                }
                crate::request::SendOutcome::RegionError(_) => continue,
            }
        }

        Ok(self.overlay_buffer(remote, &start, &end, limit, reverse))
    }

    /// Merges buffered mutations over pairs read from the cluster.
    fn overlay_buffer(
        &self,
        remote: Vec<KvPair>,
        start: &[u8],
        end: &[u8],
        limit: u32,
        reverse: bool,
    ) -> Vec<KvPair> {
        let mut merged: BTreeMap<Key, Value> = remote
            .into_iter()
            .map(|KvPair(key, value)| (key, value))
            .collect();
        let range = (
            std::ops::Bound::Included(Key::from(start.to_vec())),
            if end.is_empty() {
                std::ops::Bound::Unbounded
            } else {
                std::ops::Bound::Excluded(Key::from(end.to_vec()))
            },
        );
        for (key, entry) in self.buffer.range(range) {
            match entry {
                BufferEntry::Put(value) | BufferEntry::Insert(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                BufferEntry::Del => {
                    merged.remove(key);
                }
                BufferEntry::Lock => {}
            }
        }
        let iter: Box<dyn Iterator<Item = (Key, Value)>> = if reverse {
            Box::new(merged.into_iter().rev())
        } else {
            Box::new(merged.into_iter())
        };
        iter.take(limit as usize)
            .map(|(key, value)| KvPair(key, value))
            .collect()
    }

    /// Resolves locks blocking a read; locks whose `min_commit_ts` got
    /// pushed past us are remembered and bypassed from then on.
    async fn resolve_read_locks(
        &mut self,
        bo: &mut Backoffer,
        locks: Vec<kvpb::LockInfo>,
    ) -> Result<()> {
        let lock_count = locks.len();
        let resolved = resolve_locks(&self.store, bo, self.start_ts(), locks).await?;
        self.bypass_locks.extend(resolved.pushed);
        if resolved.ms_before_txn_expired > 0 {
            bo.backoff_with_max_sleep(
                &BO_TXN_LOCK_FAST,
                Some(resolved.ms_before_txn_expired),
                format!("read of txn {} blocked by {lock_count} locks", self.start_ts()),
            )
            .await?;
        }
        Ok(())
    }

    fn check_allow_operation(&self) -> Result<()> {
        match self.get_status() {
            TransactionStatus::ReadOnly | TransactionStatus::Active => Ok(()),
            _ => Err(Error::OperationAfterCommitError),
        }
    }

    fn get_status(&self) -> TransactionStatus {
        self.status.load(Ordering::Acquire).into()
    }

    fn set_status(&self, status: TransactionStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    fn transit_status(
        &self,
        check_status: impl Fn(TransactionStatus) -> bool,
        next: TransactionStatus,
    ) -> bool {
        let mut current = self.get_status();
        while check_status(current) {
            if current == next {
                return true;
            }
            match self.status.compare_exchange_weak(
                current as u8,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual.into(),
            }
        }
        false
    }
}

impl<PdC: PdClient, Cn: KvConnect> Drop for Transaction<PdC, Cn> {
    fn drop(&mut self) {
        debug!("dropping transaction");
        if std::thread::panicking() {
            return;
        }
        self.ttl_manager.close();
        let status = self.get_status();
        if matches!(
            status,
            TransactionStatus::Active
        ) {
            match self.options.check_level {
                CheckLevel::Panic => {
                    panic!("transaction dropped without committing or rolling back")
                }
                CheckLevel::Warn => {
                    warn!("transaction dropped without committing or rolling back")
                }
                CheckLevel::None => {}
            }
        }
        self.set_status(TransactionStatus::Dropped);
    }
}

trait ContextExt {
    fn context_mut_resolved(&mut self, bypass: &[u64]);
}

macro_rules! impl_context_ext {
    ($($t:ty),+ $(,)?) => {
        $(
            impl ContextExt for $t {
                fn context_mut_resolved(&mut self, bypass: &[u64]) {
                    if bypass.is_empty() {
                        return;
                    }
                    let context = self.context.get_or_insert_with(kvpb::Context::default);
                    context.resolved_locks = bypass.to_vec();
                }
            }
        )+
    };
}

impl_context_ext!(kvpb::GetRequest, kvpb::BatchGetRequest, kvpb::ScanRequest);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_entries_build_expected_mutations() {
        let key = Key::from("k");
        let m = BufferEntry::Put(b"v".to_vec()).to_mutation(&key);
        assert_eq!(m.op, kvpb::Op::Put as i32);
        assert_eq!(m.value, b"v".to_vec());

        let m = BufferEntry::Insert(b"v".to_vec()).to_mutation(&key);
        assert_eq!(m.op, kvpb::Op::Insert as i32);
        assert_eq!(m.assertion, kvpb::Assertion::NotExist as i32);

        let m = BufferEntry::Del.to_mutation(&key);
        assert_eq!(m.op, kvpb::Op::Del as i32);

        let m = BufferEntry::Lock.to_mutation(&key);
        assert_eq!(m.op, kvpb::Op::Lock as i32);
    }

    #[test]
    fn status_transitions() {
        assert_eq!(
            TransactionStatus::from(TransactionStatus::StartedCommit as u8),
            TransactionStatus::StartedCommit
        );
        assert_eq!(
            TransactionStatus::from(250),
            TransactionStatus::Dropped
        );
    }
}
