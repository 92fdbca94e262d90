// Copyright 2024 RiftKV Project Authors. Licensed under Apache-2.0.

//! Lock resolution: turning blocking locks into progress.
//!
//! For each blocking lock the resolver asks the lock's primary what became
//! of the owning transaction (`CheckTxnStatus`), then either resolves the
//! lock (`ResolveLock` commit or rollback), reports how long the caller
//! should wait for a still-live lock, or records that the lock's
//! `min_commit_ts` was pushed so readers may pass it by.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Mutex;

use log::debug;

use super::requests::new_check_txn_status_request;
use super::requests::new_resolve_lock_request;
use super::TxnStore;
use crate::backoff::Backoffer;
use crate::backoff::BO_REGION_MISS;
use crate::backoff::BO_TXN_NOT_FOUND;
use crate::pd::PdClient;
use crate::proto::kvpb;
use crate::region::RegionVerId;
use crate::request::is_fake_region_error;
use crate::request::SendOutcome;
use crate::request::READ_TIMEOUT_SHORT;
use crate::store::KvConnect;
use crate::timestamp::extract_physical;
use crate::timestamp::TimestampExt;
use crate::Error;
use crate::Result;

const RESOLVED_CACHE_SIZE: usize = 2048;

/// Status of a transaction as decided through its primary lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TxnStatus {
    Committed { commit_ts: u64 },
    RolledBack,
    /// The primary lock is still alive with this much TTL granted.
    Active { ttl: u64, min_commit_ts_pushed: bool },
}

/// Cache of finalized transaction statuses, so a storm of locks from one
/// dead transaction costs one `CheckTxnStatus`.
#[derive(Default)]
pub(crate) struct ResolvedCache {
    inner: Mutex<HashMap<u64, TxnStatus>>,
}

impl ResolvedCache {
    fn get(&self, start_ts: u64) -> Option<TxnStatus> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&start_ts)
            .copied()
    }

    fn put(&self, start_ts: u64, status: TxnStatus) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.len() >= RESOLVED_CACHE_SIZE {
            let evict = inner.keys().next().copied();
            if let Some(evict) = evict {
                inner.remove(&evict);
            }
        }
        inner.insert(start_ts, status);
    }
}

/// The outcome of one resolution round.
#[derive(Debug, Default)]
pub(crate) struct ResolveLocksResult {
    /// How long the youngest still-live blocking lock has to live, in ms.
    /// Zero when every lock was resolved or pushed.
    pub(crate) ms_before_txn_expired: u64,
    /// Transactions whose `min_commit_ts` was pushed past the caller;
    /// readers list them as resolved to pass their locks.
    pub(crate) pushed: Vec<u64>,
}

/// Resolves `locks` on behalf of a reader or writer at `caller_start_ts`.
pub(crate) async fn resolve_locks<PdC: PdClient, Cn: KvConnect>(
    store: &TxnStore<PdC, Cn>,
    bo: &mut Backoffer,
    caller_start_ts: u64,
    locks: Vec<kvpb::LockInfo>,
) -> Result<ResolveLocksResult> {
    let mut result = ResolveLocksResult::default();
    // Regions already swept per transaction; a second lock of the same txn
    // in the same region needs no second ResolveLock.
    let mut clean_regions: HashMap<u64, HashSet<RegionVerId>> = HashMap::new();

    for lock in locks {
        let status = txn_status_of_lock(store, bo, &lock, caller_start_ts).await?;
        match status {
            TxnStatus::Committed { commit_ts } => {
                resolve_lock(store, bo, &lock, commit_ts, &mut clean_regions).await?;
            }
            TxnStatus::RolledBack => {
                resolve_lock(store, bo, &lock, 0, &mut clean_regions).await?;
            }
            TxnStatus::Active {
                ttl,
                min_commit_ts_pushed,
            } => {
                if min_commit_ts_pushed {
                    result.pushed.push(lock.lock_version);
                    continue;
                }
                let current = store.current_timestamp().await?;
                let expires_at = extract_physical(lock.lock_version).saturating_add(ttl);
                let remaining = expires_at.saturating_sub(extract_physical(current.version()));
                result.ms_before_txn_expired = result.ms_before_txn_expired.max(remaining.max(1));
            }
        }
    }
    Ok(result)
}

pub(crate) async fn txn_status_of_lock<PdC: PdClient, Cn: KvConnect>(
    store: &TxnStore<PdC, Cn>,
    bo: &mut Backoffer,
    lock: &kvpb::LockInfo,
    caller_start_ts: u64,
) -> Result<TxnStatus> {
    if let Some(status) = store.resolved.get(lock.lock_version) {
        return Ok(status);
    }

    // A zero-TTL lock may be rolled back unconditionally; anything else is
    // judged against a fresh cluster timestamp.
    let current_ts = if lock.lock_ttl == 0 {
        u64::MAX
    } else {
        store.current_timestamp().await?.version()
    };
    let resolving_pessimistic = lock.lock_type == kvpb::Op::PessimisticLock as i32;

    loop {
        let mut req = new_check_txn_status_request(
            lock.primary_lock.clone(),
            lock.lock_version,
            caller_start_ts,
            current_ts,
            true,
            resolving_pessimistic,
        );
        let resp: kvpb::CheckTxnStatusResponse = store
            .send_to_key(bo, &mut req, &lock.primary_lock, READ_TIMEOUT_SHORT)
            .await?;

        if let Some(key_error) = resp.error {
            // The primary may trail the secondary that blocked us; give the
            // prewrite a moment to arrive.
            if key_error.txn_not_found.is_some() {
                debug!(
                    "txn {} not found on primary, waiting for prewrite",
                    lock.lock_version
                );
                bo.backoff(
                    &BO_TXN_NOT_FOUND,
                    format!("txn {} not found", lock.lock_version),
                )
                .await?;
                continue;
            }
            return Err(Error::from(key_error));
        }

        let status = if resp.commit_version > 0 {
            TxnStatus::Committed {
                commit_ts: resp.commit_version,
            }
        } else if resp.lock_ttl > 0 {
            TxnStatus::Active {
                ttl: resp.lock_ttl,
                min_commit_ts_pushed: resp.action == kvpb::Action::MinCommitTsPushed as i32,
            }
        } else {
            TxnStatus::RolledBack
        };
        if !matches!(status, TxnStatus::Active { .. }) {
            store.resolved.put(lock.lock_version, status);
        }
        return Ok(status);
    }
}

/// Resolves all of a transaction's locks in the region holding `lock.key`.
async fn resolve_lock<PdC: PdClient, Cn: KvConnect>(
    store: &TxnStore<PdC, Cn>,
    bo: &mut Backoffer,
    lock: &kvpb::LockInfo,
    commit_ts: u64,
    clean_regions: &mut HashMap<u64, HashSet<RegionVerId>>,
) -> Result<()> {
    loop {
        let loc = store.cache.locate_key(bo, &lock.key).await?;
        if clean_regions
            .get(&lock.lock_version)
            .is_some_and(|regions| regions.contains(&loc.region))
        {
            return Ok(());
        }

        let mut req = new_resolve_lock_request(lock.lock_version, commit_ts);
        let mut sender = store.sender();
        match sender
            .send::<kvpb::ResolveLockRequest, kvpb::ResolveLockResponse>(
                bo,
                &mut req,
                loc.region.clone(),
                READ_TIMEOUT_SHORT,
            )
            .await?
        {
            SendOutcome::Response(resp) => {
                if let Some(key_error) = resp.error {
                    return Err(Error::from(key_error));
                }
                clean_regions
                    .entry(lock.lock_version)
                    .or_default()
                    .insert(loc.region);
                return Ok(());
            }
            SendOutcome::RegionError(e) => {
                if e.epoch_not_match.is_none() || is_fake_region_error(&e) {
                    bo.backoff(&BO_REGION_MISS, format!("{e:?}")).await?;
                }
            }
        }
    }
}
