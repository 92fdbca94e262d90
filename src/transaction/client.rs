// Copyright 2024 RiftKV Project Authors. Licensed under Apache-2.0.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use log::info;

use super::lock_resolver;
use super::requests::new_batch_resolve_lock_request;
use super::requests::new_scan_lock_request;
use super::Snapshot;
use super::Transaction;
use super::TransactionOptions;
use super::TxnStore;
use crate::backoff::BackoffContext;
use crate::backoff::Backoffer;
use crate::backoff::BO_REGION_MISS;
use crate::backoff::GC_RESOLVE_LOCK_MAX_BACKOFF_MS;
use crate::pd::Cluster;
use crate::pd::PdClient;
use crate::pd::RetryClient;
use crate::proto::kvpb;
use crate::region_cache::RegionCache;
use crate::request::is_fake_region_error;
use crate::request::SendOutcome;
use crate::request::READ_TIMEOUT_MEDIUM;
use crate::store::KvConnect;
use crate::store::TonicConnect;
use crate::timestamp::Timestamp;
use crate::timestamp::TimestampExt;
use crate::Config;
use crate::Error;
use crate::Result;

const SCAN_LOCK_BATCH_SIZE: u32 = 1024;

/// The entry point for transactional interaction with a RiftKV cluster.
///
/// A client holds the routing cache and connection pools; it is cheap to
/// clone and intended to be shared.
pub struct Client<PdC: PdClient = RetryClient, Cn: KvConnect = TonicConnect> {
    store: Arc<TxnStore<PdC, Cn>>,
}

impl<PdC: PdClient, Cn: KvConnect> Clone for Client<PdC, Cn> {
    fn clone(&self) -> Self {
        Client {
            store: self.store.clone(),
        }
    }
}

impl Client<RetryClient, TonicConnect> {
    /// Connects to the placement drivers at `pd_endpoints` with default
    /// configuration.
    pub async fn new(pd_endpoints: Vec<String>) -> Result<Client> {
        Self::new_with_config(pd_endpoints, Config::default()).await
    }

    pub async fn new_with_config(pd_endpoints: Vec<String>, config: Config) -> Result<Client> {
        debug!("creating new transactional client");
        let cluster = Cluster::connect(&pd_endpoints, config.timeout).await?;
        let pd = Arc::new(RetryClient::new(cluster));
        let cache = RegionCache::new(pd.clone(), config.clone());
        let connector = TonicConnect::new(config.timeout);
        Ok(Client {
            store: Arc::new(TxnStore::new(pd, cache, connector)),
        })
    }
}

impl<PdC: PdClient, Cn: KvConnect> Client<PdC, Cn> {
    /// Builds a client over externally constructed parts; the entry point
    /// for in-process mocks and custom transports.
    pub fn with_parts(pd: Arc<PdC>, cache: Arc<RegionCache<PdC>>, connector: Cn) -> Self {
        Client {
            store: Arc::new(TxnStore::new(pd, cache, connector)),
        }
    }

    /// Creates a new optimistic transaction.
    ///
    /// The transaction buffers writes locally and sends them on
    /// [`Transaction::commit`]; conflicts surface at commit time.
    pub async fn begin_optimistic(&self) -> Result<Transaction<PdC, Cn>> {
        debug!("creating new optimistic transaction");
        self.begin_with_options(TransactionOptions::new_optimistic())
            .await
    }

    /// Creates a new pessimistic transaction, which locks keys on the
    /// stores as statements touch them.
    pub async fn begin_pessimistic(&self) -> Result<Transaction<PdC, Cn>> {
        debug!("creating new pessimistic transaction");
        self.begin_with_options(TransactionOptions::new_pessimistic())
            .await
    }

    pub async fn begin_with_options(
        &self,
        options: TransactionOptions,
    ) -> Result<Transaction<PdC, Cn>> {
        let timestamp = self.current_timestamp().await?;
        Ok(Transaction::new(timestamp, self.store.clone(), options))
    }

    /// A read-only snapshot at the given timestamp.
    pub fn snapshot(&self, timestamp: Timestamp, options: TransactionOptions) -> Snapshot<PdC, Cn> {
        debug!("creating new snapshot");
        Snapshot::new(Transaction::new(
            timestamp,
            self.store.clone(),
            options.read_only(),
        ))
    }

    /// The current cluster timestamp.
    pub async fn current_timestamp(&self) -> Result<Timestamp> {
        self.store.current_timestamp().await
    }

    /// Garbage-collects MVCC versions older than `safepoint`.
    ///
    /// Resolves every lock under the safepoint first (so no transaction's
    /// outcome is lost), then advances the cluster safepoint in PD. Returns
    /// false when PD rejected the new safepoint as older than the current
    /// one.
    pub async fn gc(&self, safepoint: Timestamp) -> Result<bool> {
        debug!("invoking transactional gc request");
        self.resolve_locks_in_range(safepoint.version(), vec![], vec![])
            .await?;
        let new_safepoint = self
            .store
            .pd
            .update_gc_safe_point(safepoint.version())
            .await?;
        if new_safepoint != safepoint.version() {
            info!("gc: another safepoint {} is newer", new_safepoint);
            return Ok(false);
        }
        Ok(true)
    }

    /// Unsafely removes every MVCC record of keys in `range`, bypassing the
    /// transactional protocol. Only for reclaiming dropped key spaces; any
    /// concurrent transaction touching the range loses its writes.
    pub async fn delete_range(&self, range: impl Into<crate::BoundRange>) -> Result<()> {
        let (start, end) = range.into().into_keys();
        let start: Vec<u8> = start.into();
        let end: Vec<u8> = end.map(Into::into).unwrap_or_default();

        let (ctx, _cancel) = BackoffContext::new();
        let mut bo = Backoffer::new(ctx, GC_RESOLVE_LOCK_MAX_BACKOFF_MS);
        let mut cursor = start;
        loop {
            let loc = self.store.cache.locate_key(&mut bo, &cursor).await?;
            let mut req = kvpb::DeleteRangeRequest::default();
            req.start_key = cursor.clone().max(loc.start_key.clone());
            req.end_key = if end.is_empty() {
                loc.end_key.clone()
            } else if loc.end_key.is_empty() {
                end.clone()
            } else {
                loc.end_key.clone().min(end.clone())
            };
            let mut sender = self.store.sender();
            match sender
                .send::<kvpb::DeleteRangeRequest, kvpb::DeleteRangeResponse>(
                    &mut bo,
                    &mut req,
                    loc.region.clone(),
                    READ_TIMEOUT_MEDIUM,
                )
                .await?
            {
                SendOutcome::RegionError(e) => {
                    if e.epoch_not_match.is_none() || is_fake_region_error(&e) {
                        bo.backoff(&BO_REGION_MISS, format!("{e:?}")).await?;
                    }
                    continue;
                }
                SendOutcome::Response(resp) => {
                    if !resp.error.is_empty() {
                        return Err(Error::StringError(resp.error));
                    }
                }
            }
            if loc.end_key.is_empty() || (!end.is_empty() && loc.end_key >= end) {
                return Ok(());
            }
            cursor = loc.end_key;
        }
    }

    /// Scans and resolves every lock with `start_ts <= before_ts` in the
    /// given range, region by region.
    async fn resolve_locks_in_range(
        &self,
        before_ts: u64,
        start_key: Vec<u8>,
        end_key: Vec<u8>,
    ) -> Result<()> {
        let (ctx, _cancel) = BackoffContext::new();
        let mut bo = Backoffer::new(ctx, GC_RESOLVE_LOCK_MAX_BACKOFF_MS);
        let mut cursor = start_key;
        loop {
            let loc = self.store.cache.locate_key(&mut bo, &cursor).await?;
            let mut req = new_scan_lock_request(
                cursor.clone(),
                loc.end_key.clone(),
                before_ts,
                SCAN_LOCK_BATCH_SIZE,
            );
            let mut sender = self.store.sender();
            let locks = match sender
                .send::<kvpb::ScanLockRequest, kvpb::ScanLockResponse>(
                    &mut bo,
                    &mut req,
                    loc.region.clone(),
                    READ_TIMEOUT_MEDIUM,
                )
                .await?
            {
                SendOutcome::RegionError(e) => {
                    if e.epoch_not_match.is_none() || is_fake_region_error(&e) {
                        bo.backoff(&BO_REGION_MISS, format!("{e:?}")).await?;
                    }
                    continue;
                }
                SendOutcome::Response(resp) => {
                    if let Some(key_error) = resp.error {
                        return Err(Error::from(key_error));
                    }
                    resp.locks
                }
            };

            if !locks.is_empty() {
                self.batch_resolve_locks(&mut bo, &loc.region, locks).await?;
                // Stay on this region: there may be more than one batch of
                // locks in it.
                continue;
            }

            if loc.end_key.is_empty() || (!end_key.is_empty() && loc.end_key >= end_key) {
                return Ok(());
            }
            cursor = loc.end_key;
        }
    }

    /// Determines the status of each lock's transaction, then resolves them
    /// all in one request against the region.
    async fn batch_resolve_locks(
        &self,
        bo: &mut Backoffer,
        region: &crate::region::RegionVerId,
        locks: Vec<kvpb::LockInfo>,
    ) -> Result<()> {
        let mut statuses: HashMap<u64, u64> = HashMap::new();
        for lock in &locks {
            if statuses.contains_key(&lock.lock_version) {
                continue;
            }
            // Zeroing the TTL forces a still-live lock under the safepoint
            // to be judged expired and rolled back.
            let mut gc_lock = lock.clone();
            gc_lock.lock_ttl = 0;
            match lock_resolver::txn_status_of_lock(&self.store, bo, &gc_lock, 0).await? {
                lock_resolver::TxnStatus::Committed { commit_ts } => {
                    statuses.insert(lock.lock_version, commit_ts);
                }
                lock_resolver::TxnStatus::RolledBack => {
                    statuses.insert(lock.lock_version, 0);
                }
                lock_resolver::TxnStatus::Active { .. } => {
                    info!(
                        "gc: txn {} still alive under the safepoint, skipping",
                        lock.lock_version
                    );
                }
            }
        }
        let txn_infos: Vec<kvpb::TxnInfo> = statuses
            .into_iter()
            .map(|(txn, status)| kvpb::TxnInfo { txn, status })
            .collect();
        if txn_infos.is_empty() {
            return Ok(());
        }

        let mut region = region.clone();
        loop {
            let mut req = new_batch_resolve_lock_request(txn_infos.clone());
            let mut sender = self.store.sender();
            match sender
                .send::<kvpb::ResolveLockRequest, kvpb::ResolveLockResponse>(
                    bo,
                    &mut req,
                    region.clone(),
                    READ_TIMEOUT_MEDIUM,
                )
                .await?
            {
                SendOutcome::RegionError(e) => {
                    if e.epoch_not_match.is_none() || is_fake_region_error(&e) {
                        bo.backoff(&BO_REGION_MISS, format!("{e:?}")).await?;
                    }
                    let loc = self
                        .store
                        .cache
                        .locate_key(bo, &locks[0].key)
                        .await?;
                    region = loc.region;
                }
                SendOutcome::Response(resp) => {
                    if let Some(key_error) = resp.error {
                        return Err(Error::from(key_error));
                    }
                    return Ok(());
                }
            }
        }
    }
}
