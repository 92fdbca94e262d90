// Copyright 2024 RiftKV Project Authors. Licensed under Apache-2.0.

//! The two-phase-commit driver.
//!
//! One committer drives one transaction's write phase: it splits the sorted
//! mutation set into per-region batches, prewrites the primary batch first
//! and the rest concurrently, resolves blocking locks, falls back from 1PC
//! and async commit when the server says so, commits the primary, and pushes
//! secondary commits into the background.
//!
//! All five mutating commands (prewrite, commit, cleanup, pessimistic lock,
//! pessimistic rollback) share one batch driver; the action variant decides
//! how a single batch is built and handled.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Instant;

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use log::debug;
use log::warn;
use tokio::sync::Semaphore;

use super::requests::new_batch_rollback_request;
use super::requests::new_commit_request;
use super::requests::new_heart_beat_request;
use super::requests::new_pessimistic_lock_request;
use super::requests::new_pessimistic_rollback_request;
use super::resolve_locks;
use super::TxnStore;
use super::COMMITTER_CONCURRENCY;
use super::DEFAULT_LOCK_TTL;
use super::MANAGED_LOCK_TTL;
use super::MAX_COMMIT_TS_SAFE_WINDOW_MS;
use super::MAX_TTL;
use super::TTL_FACTOR;
use super::TTL_REFRESHED_TXN_SIZE;
use super::TXN_COMMIT_BATCH_SIZE;
use crate::backoff::BackoffContext;
use crate::backoff::Backoffer;
use crate::backoff::BO_REGION_MISS;
use crate::backoff::BO_TXN_LOCK;
use crate::backoff::COMMIT_MAX_BACKOFF_MS;
use crate::backoff::PREWRITE_MAX_BACKOFF_MS;
use crate::common::WriteConflictError;
use crate::pd::PdClient;
use crate::proto::kvpb;
use crate::region::RegionVerId;
use crate::request::is_fake_region_error;
use crate::request::RegionRequestSender;
use crate::request::SendOutcome;
use crate::request::READ_TIMEOUT_SHORT;
use crate::store::KvConnect;
use crate::timestamp::extract_physical;
use crate::timestamp::now_physical_ms;
use crate::timestamp::Timestamp;
use crate::timestamp::TimestampExt;
use crate::timestamp::TIMESTAMP_LOGICAL_BITS;
use crate::Error;
use crate::Result;

/// One region-confined slice of the transaction's mutations.
struct Batch {
    region: RegionVerId,
    mutations: Vec<kvpb::Mutation>,
    is_primary: bool,
}

impl Batch {
    fn keys(&self) -> Vec<Vec<u8>> {
        self.mutations.iter().map(|m| m.key.clone()).collect()
    }
}

#[derive(Clone)]
enum CommitAction {
    Prewrite {
        retry: bool,
    },
    Commit {
        commit_version: u64,
    },
    Cleanup,
    PessimisticLock {
        for_update_ts: u64,
        return_values: bool,
        check_existence: bool,
    },
    PessimisticRollback {
        for_update_ts: u64,
    },
}

impl CommitAction {
    fn label(&self) -> &'static str {
        match self {
            CommitAction::Prewrite { .. } => "prewrite",
            CommitAction::Commit { .. } => "commit",
            CommitAction::Cleanup => "cleanup",
            CommitAction::PessimisticLock { .. } => "pessimistic_lock",
            CommitAction::PessimisticRollback { .. } => "pessimistic_rollback",
        }
    }

    /// Whether the primary batch must complete before any other batch of
    /// this action is dispatched.
    fn primary_first(&self) -> bool {
        matches!(
            self,
            CommitAction::Prewrite { .. }
                | CommitAction::Commit { .. }
                | CommitAction::PessimisticLock { .. }
        )
    }
}

const TTL_UNINIT: u8 = 0;
const TTL_RUNNING: u8 = 1;
const TTL_CLOSED: u8 = 2;

/// Keeps a big transaction's primary lock alive until commit or rollback.
/// Single-shot: once closed it can not be restarted.
#[derive(Clone, Default)]
pub(crate) struct TtlManager {
    state: Arc<AtomicU8>,
}

impl TtlManager {
    pub(crate) fn new() -> TtlManager {
        TtlManager::default()
    }

    fn start<PdC: PdClient, Cn: KvConnect>(
        &self,
        store: Arc<TxnStore<PdC, Cn>>,
        primary: Vec<u8>,
        start_ts: u64,
    ) {
        if self
            .state
            .compare_exchange(TTL_UNINIT, TTL_RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let state = self.state.clone();
        tokio::spawn(keep_alive(store, primary, start_ts, state));
    }

    pub(crate) fn close(&self) {
        self.state.store(TTL_CLOSED, Ordering::SeqCst);
    }
}

async fn keep_alive<PdC: PdClient, Cn: KvConnect>(
    store: Arc<TxnStore<PdC, Cn>>,
    primary: Vec<u8>,
    start_ts: u64,
    state: Arc<AtomicU8>,
) {
    let period = std::time::Duration::from_millis(MANAGED_LOCK_TTL / 2);
    loop {
        tokio::time::sleep(period).await;
        if state.load(Ordering::SeqCst) == TTL_CLOSED {
            return;
        }
        let uptime = now_physical_ms().saturating_sub(extract_physical(start_ts));
        let new_ttl = (uptime.saturating_mul(2)).clamp(MANAGED_LOCK_TTL, MAX_TTL);
        let (ctx, _cancel) = BackoffContext::new();
        let mut bo = Backoffer::new(ctx, MANAGED_LOCK_TTL);
        let mut req = new_heart_beat_request(primary.clone(), start_ts, new_ttl);
        match store
            .send_to_key::<kvpb::TxnHeartBeatRequest, kvpb::TxnHeartBeatResponse>(
                &mut bo,
                &mut req,
                &primary,
                READ_TIMEOUT_SHORT,
            )
            .await
        {
            Ok(resp) => {
                if let Some(e) = resp.error {
                    warn!("txn {} heartbeat rejected: {:?}", start_ts, e);
                    return;
                }
                debug!("txn {} ttl advanced to {}", start_ts, new_ttl);
            }
            Err(e) => {
                warn!("txn {} heartbeat failed: {}", start_ts, e);
                return;
            }
        }
    }
}

/// Per-transaction write-phase driver. Construct once the mutation set is
/// final, then call exactly one of [`Committer::commit`] /
/// [`Committer::rollback`] (or the pessimistic-lock entry points while the
/// transaction is still open).
pub(crate) struct Committer<PdC: PdClient, Cn: KvConnect> {
    store: Arc<TxnStore<PdC, Cn>>,
    /// Canonically sorted; the first mutation's key is the primary.
    mutations: Vec<kvpb::Mutation>,
    primary_key: Vec<u8>,
    start_ts: u64,
    lock_ttl: u64,
    write_size: u64,
    is_pessimistic: bool,
    for_update_ts: u64,
    /// Keys already holding this transaction's pessimistic locks.
    pessimistic_keys: HashSet<Vec<u8>>,
    assertion_level: i32,

    min_commit_ts: AtomicU64,
    use_async_commit: AtomicBool,
    try_one_pc: AtomicBool,
    one_pc_commit_ts: AtomicU64,

    undetermined: AtomicBool,
    prewrite_cancelled: AtomicBool,

    ttl_manager: TtlManager,
    region_txn_size: Mutex<HashMap<u64, u64>>,
    /// Values returned by pessimistic locks: key -> (value, not_found).
    lock_values: Mutex<HashMap<Vec<u8>, (Vec<u8>, bool)>>,
    start_instant: Instant,
}

#[allow(clippy::too_many_arguments)]
impl<PdC: PdClient, Cn: KvConnect> Committer<PdC, Cn> {
    pub(crate) fn new(
        store: Arc<TxnStore<PdC, Cn>>,
        mutations: Vec<kvpb::Mutation>,
        primary_key: Vec<u8>,
        start_ts: u64,
        is_pessimistic: bool,
        for_update_ts: u64,
        pessimistic_keys: HashSet<Vec<u8>>,
        use_async_commit: bool,
        try_one_pc: bool,
        assertion_level: i32,
        ttl_manager: TtlManager,
    ) -> Self {
        let write_size = mutations
            .iter()
            .map(|m| (m.key.len() + m.value.len()) as u64)
            .sum();
        let mut committer = Committer {
            store,
            mutations,
            primary_key,
            start_ts,
            lock_ttl: DEFAULT_LOCK_TTL,
            write_size,
            is_pessimistic,
            for_update_ts,
            pessimistic_keys,
            assertion_level,
            min_commit_ts: AtomicU64::new(0),
            use_async_commit: AtomicBool::new(use_async_commit),
            try_one_pc: AtomicBool::new(try_one_pc),
            one_pc_commit_ts: AtomicU64::new(0),
            undetermined: AtomicBool::new(false),
            prewrite_cancelled: AtomicBool::new(false),
            ttl_manager,
            region_txn_size: Mutex::new(HashMap::new()),
            lock_values: Mutex::new(HashMap::new()),
            start_instant: Instant::now(),
        };
        committer.lock_ttl = committer.calc_txn_lock_ttl();
        committer
    }

    fn calc_txn_lock_ttl(&self) -> u64 {
        let mut lock_ttl = DEFAULT_LOCK_TTL;
        if self.write_size > TXN_COMMIT_BATCH_SIZE {
            let size_mib = self.write_size as f64 / 1024.0 / 1024.0;
            lock_ttl = (TTL_FACTOR * size_mib.sqrt()) as u64;
            lock_ttl = lock_ttl.clamp(DEFAULT_LOCK_TTL, MAX_TTL);
        }
        lock_ttl
    }

    fn use_async_commit(&self) -> bool {
        self.use_async_commit.load(Ordering::SeqCst)
    }

    fn try_one_pc(&self) -> bool {
        self.try_one_pc.load(Ordering::SeqCst)
    }

    fn wrap_undetermined(&self, e: Error) -> Error {
        if self.undetermined.load(Ordering::SeqCst) {
            Error::Undetermined(Box::new(e))
        } else {
            e
        }
    }

    // Entry points

    /// Runs the full commit protocol. Returns the commit timestamp, or
    /// `None` for a read-only transaction with nothing to write.
    pub(crate) async fn commit(self) -> Result<Option<Timestamp>> {
        if self.mutations.is_empty() {
            return Ok(None);
        }
        debug!("committing txn {}", self.start_ts);

        let (ctx, _cancel) = BackoffContext::new();
        let mut bo = Backoffer::new(ctx, PREWRITE_MAX_BACKOFF_MS);
        if let Err(e) = self
            .do_action_on_mutations(
                &mut bo,
                CommitAction::Prewrite { retry: false },
                self.mutations.clone(),
            )
            .await
        {
            self.ttl_manager.close();
            return Err(self.wrap_undetermined(e));
        }

        fail::fail_point!("after-prewrite", |_| {
            self.ttl_manager.close();
            Err(Error::StringError(
                "injected error after prewrite".to_owned(),
            ))
        });

        let one_pc_ts = self.one_pc_commit_ts.load(Ordering::SeqCst);
        if one_pc_ts != 0 {
            self.ttl_manager.close();
            return Ok(Some(Timestamp::from_version(one_pc_ts)));
        }

        let (ctx, _cancel) = BackoffContext::new();
        let mut commit_bo = Backoffer::new(ctx, COMMIT_MAX_BACKOFF_MS);
        let commit_ts = if self.use_async_commit() {
            // Durable already; the effective commit version is the largest
            // min_commit_ts any prewrite returned.
            Timestamp::from_version(self.min_commit_ts.load(Ordering::SeqCst))
        } else {
            match self.commit_primary(&mut commit_bo).await {
                Ok(ts) => ts,
                Err(e) => {
                    self.ttl_manager.close();
                    return Err(self.wrap_undetermined(e));
                }
            }
        };

        self.ttl_manager.close();
        let version = commit_ts.version();
        tokio::spawn(async move {
            if let Err(e) = self.commit_secondaries(version).await {
                warn!("failed to commit secondary keys: {}", e);
            }
        });
        Ok(Some(commit_ts))
    }

    async fn commit_primary(&self, bo: &mut Backoffer) -> Result<Timestamp> {
        debug!("committing primary of txn {}", self.start_ts);
        let primary = self
            .mutations
            .iter()
            .find(|m| m.key == self.primary_key)
            .cloned()
            .ok_or(Error::NoPrimaryKey)?;

        let mut commit_version = self
            .store
            .current_timestamp()
            .await?
            .version()
            .max(self.min_commit_ts.load(Ordering::SeqCst));
        loop {
            match self
                .do_action_on_mutations(
                    bo,
                    CommitAction::Commit { commit_version },
                    vec![primary.clone()],
                )
                .await
            {
                Ok(()) => return Ok(Timestamp::from_version(commit_version)),
                Err(Error::CommitTsExpired { min_commit_ts, .. }) => {
                    // A reader pushed the lock past our version; commit with
                    // a fresher one.
                    debug!(
                        "commit ts {} of txn {} expired, min is now {}",
                        commit_version, self.start_ts, min_commit_ts
                    );
                    commit_version = self
                        .store
                        .current_timestamp()
                        .await?
                        .version()
                        .max(min_commit_ts);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn commit_secondaries(self, commit_version: u64) -> Result<()> {
        fail::fail_point!("before-commit-secondary", |_| {
            Err(Error::StringError(
                "injected error before committing secondaries".to_owned(),
            ))
        });
        // With async commit the primary was never committed separately, so
        // it belongs to this pass too.
        let mutations: Vec<kvpb::Mutation> = if self.use_async_commit() {
            self.mutations.clone()
        } else {
            self.mutations
                .iter()
                .filter(|m| m.key != self.primary_key)
                .cloned()
                .collect()
        };
        if mutations.is_empty() {
            return Ok(());
        }
        let (ctx, _cancel) = BackoffContext::new();
        let mut bo = Backoffer::new(ctx, COMMIT_MAX_BACKOFF_MS);
        self.do_action_on_mutations(&mut bo, CommitAction::Commit { commit_version }, mutations)
            .await
    }

    /// Rolls the transaction's locks back: batch rollback for optimistic
    /// transactions, pessimistic rollback (which spares write intents of
    /// other statements) for pessimistic ones.
    pub(crate) async fn rollback(self) -> Result<()> {
        self.ttl_manager.close();
        if self.mutations.is_empty() {
            return Ok(());
        }
        debug!("rolling back txn {}", self.start_ts);
        let (ctx, _cancel) = BackoffContext::new();
        let mut bo = Backoffer::new(ctx, crate::backoff::CLEANUP_MAX_BACKOFF_MS);
        let action = if self.is_pessimistic {
            CommitAction::PessimisticRollback {
                for_update_ts: self.for_update_ts,
            }
        } else {
            CommitAction::Cleanup
        };
        self.do_action_on_mutations(&mut bo, action, self.mutations.clone())
            .await
    }

    /// Acquires pessimistic locks for every mutation. Returns the observed
    /// values as `key -> (value, not_found)` when `return_values` is set.
    pub(crate) async fn acquire_pessimistic_locks(
        &self,
        for_update_ts: u64,
        return_values: bool,
        check_existence: bool,
    ) -> Result<HashMap<Vec<u8>, (Vec<u8>, bool)>> {
        let (ctx, _cancel) = BackoffContext::new();
        let mut bo = Backoffer::new(ctx, crate::backoff::PESSIMISTIC_LOCK_MAX_BACKOFF_MS);
        self.do_action_on_mutations(
            &mut bo,
            CommitAction::PessimisticLock {
                for_update_ts,
                return_values,
                check_existence,
            },
            self.mutations.clone(),
        )
        .await?;
        let mut lock_values = self.lock_values.lock().unwrap_or_else(|e| e.into_inner());
        Ok(std::mem::take(&mut *lock_values))
    }

    // The shared batch driver

    fn do_action_on_mutations<'a>(
        &'a self,
        bo: &'a mut Backoffer,
        action: CommitAction,
        mutations: Vec<kvpb::Mutation>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if mutations.is_empty() {
                return Ok(());
            }
            debug!(
                "{} of txn {}: {} mutations",
                action.label(),
                self.start_ts,
                mutations.len()
            );
            let keys: Vec<Vec<u8>> = mutations.iter().map(|m| m.key.clone()).collect();
            let (groups, _first_region) =
                self.store.cache.group_keys_by_region(bo, &keys).await?;

            let by_key: HashMap<Vec<u8>, kvpb::Mutation> = mutations
                .into_iter()
                .map(|m| (m.key.clone(), m))
                .collect();

            let mut batches = Vec::new();
            for (region, group_keys) in groups {
                if matches!(action, CommitAction::Prewrite { .. }) {
                    self.region_txn_size
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(region.id, group_keys.len() as u64);
                }
                let mut current = Vec::new();
                let mut current_size = 0u64;
                for key in &group_keys {
                    let m = by_key[key].clone();
                    let size = (m.key.len() + m.value.len()) as u64;
                    if current_size + size >= TXN_COMMIT_BATCH_SIZE && !current.is_empty() {
                        batches.push(self.make_batch(region.clone(), std::mem::take(&mut current)));
                        current_size = 0;
                    }
                    current_size += size;
                    current.push(m);
                }
                if !current.is_empty() {
                    batches.push(self.make_batch(region.clone(), current));
                }
            }

            // 1PC requires the whole transaction to land in one request.
            if batches.len() > 1
                && matches!(action, CommitAction::Prewrite { .. })
                && self.try_one_pc()
            {
                self.try_one_pc.store(false, Ordering::SeqCst);
                self.use_async_commit.store(false, Ordering::SeqCst);
            }

            if action.primary_first() {
                if let Some(pos) = batches.iter().position(|b| b.is_primary) {
                    let primary_batch = batches.remove(pos);
                    self.handle_single_batch(bo, &action, primary_batch).await?;
                }
            }
            match batches.len() {
                0 => Ok(()),
                1 => {
                    let batch = batches.pop().expect("len checked");
                    self.handle_single_batch(bo, &action, batch).await
                }
                _ => self.handle_batches_concurrently(bo, &action, batches).await,
            }
        })
    }

    fn make_batch(&self, region: RegionVerId, mutations: Vec<kvpb::Mutation>) -> Batch {
        let is_primary = mutations.iter().any(|m| m.key == self.primary_key);
        Batch {
            region,
            mutations,
            is_primary,
        }
    }

    async fn handle_batches_concurrently(
        &self,
        bo: &mut Backoffer,
        action: &CommitAction,
        batches: Vec<Batch>,
    ) -> Result<()> {
        let permits = Arc::new(Semaphore::new(COMMITTER_CONCURRENCY));
        let mut cancels = Vec::with_capacity(batches.len());
        let mut tasks: FuturesUnordered<_> = batches
            .into_iter()
            .map(|batch| {
                let (mut forked, cancel) = bo.fork();
                cancels.push(cancel);
                let action = action.clone();
                let permits = permits.clone();
                async move {
                    let _permit = permits
                        .acquire()
                        .await
                        .map_err(|_| crate::internal_err!("committer semaphore closed"))?;
                    self.handle_single_batch(&mut forked, &action, batch).await
                }
            })
            .collect();

        while let Some(result) = tasks.next().await {
            if let Err(e) = result {
                // The cancelled flag must be visible before the in-flight
                // RPCs are torn down, or their failures would read as
                // undetermined outcomes.
                self.prewrite_cancelled.store(true, Ordering::SeqCst);
                for cancel in &cancels {
                    cancel.cancel();
                }
                drop(tasks);
                return Err(e);
            }
        }
        Ok(())
    }

    async fn handle_single_batch(
        &self,
        bo: &mut Backoffer,
        action: &CommitAction,
        batch: Batch,
    ) -> Result<()> {
        match action {
            CommitAction::Prewrite { retry } => self.prewrite_batch(bo, batch, *retry).await,
            CommitAction::Commit { commit_version } => {
                self.commit_batch(bo, batch, *commit_version).await
            }
            CommitAction::Cleanup => self.cleanup_batch(bo, batch).await,
            CommitAction::PessimisticLock {
                for_update_ts,
                return_values,
                check_existence,
            } => {
                self.pessimistic_lock_batch(bo, batch, *for_update_ts, *return_values, *check_existence)
                    .await
            }
            CommitAction::PessimisticRollback { for_update_ts } => {
                self.pessimistic_rollback_batch(bo, batch, *for_update_ts)
                    .await
            }
        }
    }

    /// Handles a region error common to all actions. `Ok(true)` means the
    /// batch still fits one region and should be retried in place;
    /// `Ok(false)` means the caller must re-split.
    async fn on_batch_region_error(
        &self,
        bo: &mut Backoffer,
        batch: &mut Batch,
        e: crate::proto::errorpb::Error,
    ) -> Result<bool> {
        // Back off for everything except a real epoch-not-match, which
        // already carries fresh routing.
        if e.epoch_not_match.is_none() || is_fake_region_error(&e) {
            bo.backoff(&BO_REGION_MISS, format!("{e:?}")).await?;
        }
        let first_key = match batch.mutations.first() {
            Some(m) => m.key.clone(),
            None => return Ok(true),
        };
        let loc = self.store.cache.locate_key(bo, &first_key).await?;
        if batch.mutations.iter().all(|m| loc.contains(&m.key)) {
            batch.region = loc.region;
            return Ok(true);
        }
        Ok(false)
    }

    // Prewrite

    fn prewrite_min_commit_ts(&self) -> u64 {
        let mut min_commit_ts = self.min_commit_ts.load(Ordering::SeqCst);
        if self.for_update_ts > 0 && self.for_update_ts >= min_commit_ts {
            min_commit_ts = self.for_update_ts + 1;
        } else if self.start_ts >= min_commit_ts {
            min_commit_ts = self.start_ts + 1;
        }
        fail::fail_point!("mock-zero-commit-ts", |_| 0);
        min_commit_ts
    }

    fn prewrite_lock_ttl(&self) -> u64 {
        fail::fail_point!("short-lock-ttl", |_| 1);
        let elapsed_ms = self.start_instant.elapsed().as_millis() as u64;
        self.lock_ttl.saturating_add(elapsed_ms)
    }

    fn effective_assertion_level(&self) -> i32 {
        fail::fail_point!("assertion-skip-check-from-prewrite", |_| {
            kvpb::AssertionLevel::Off as i32
        });
        self.assertion_level
    }

    fn max_commit_ts(&self, min_commit_ts: u64) -> u64 {
        let elapsed_ms = self.start_instant.elapsed().as_millis() as u64;
        let window = elapsed_ms.saturating_add(MAX_COMMIT_TS_SAFE_WINDOW_MS);
        let max_commit_ts = self
            .start_ts
            .saturating_add(window.saturating_mul(1 << TIMESTAMP_LOGICAL_BITS));
        fail::fail_point!("invalid-max-commit-ts", |_| {
            min_commit_ts.saturating_sub(1)
        });
        max_commit_ts
    }

    fn build_prewrite_request(&self, batch: &Batch, txn_size: u64) -> kvpb::PrewriteRequest {
        let mut req = kvpb::PrewriteRequest::default();
        req.mutations = batch.mutations.clone();
        req.is_pessimistic_lock = batch
            .mutations
            .iter()
            .map(|m| self.pessimistic_keys.contains(&m.key))
            .collect();
        req.primary_lock = self.primary_key.clone();
        req.start_version = self.start_ts;
        req.lock_ttl = self.prewrite_lock_ttl();
        req.for_update_ts = self.for_update_ts;
        req.txn_size = txn_size;
        req.min_commit_ts = self.prewrite_min_commit_ts();
        req.assertion_level = self.effective_assertion_level();
        if self.use_async_commit() {
            req.use_async_commit = true;
            if batch.is_primary {
                req.secondaries = self
                    .mutations
                    .iter()
                    .filter(|m| m.key != self.primary_key)
                    .map(|m| m.key.clone())
                    .collect();
            }
        }
        if self.try_one_pc() {
            req.try_one_pc = true;
        }
        if req.use_async_commit || req.try_one_pc {
            req.max_commit_ts = self.max_commit_ts(req.min_commit_ts);
        }
        req
    }

    async fn prewrite_batch(&self, bo: &mut Backoffer, batch: Batch, retry: bool) -> Result<()> {
        if batch.is_primary {
            fail::fail_point!("prewrite-primary-fail", |_| {
                Err(Error::StringError(
                    "injected error on prewriting primary batch".to_owned(),
                ))
            });
        } else {
            fail::fail_point!("prewrite-secondary-fail", |_| {
                Err(Error::StringError(
                    "injected error on prewriting secondary batch".to_owned(),
                ))
            });
        }

        // On a region-miss retry the transaction size for the region is
        // unknown; report unknown-large so the server does not treat the
        // locks as a tiny transaction's.
        let txn_size = if retry {
            u64::MAX
        } else {
            self.region_txn_size
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(&batch.region.id)
                .copied()
                .unwrap_or(u64::MAX)
        };

        let mut sender = self.store.sender();
        let result = self
            .prewrite_batch_inner(&mut sender, bo, batch, txn_size)
            .await;
        if result.is_err()
            && (self.use_async_commit() || self.try_one_pc())
            && sender.rpc_error().is_some()
            && !self.prewrite_cancelled.load(Ordering::SeqCst)
        {
            // An async-commit/1PC prewrite died mid-air: the server may or
            // may not have made the transaction durable.
            self.undetermined.store(true, Ordering::SeqCst);
        }
        result
    }

    async fn prewrite_batch_inner(
        &self,
        sender: &mut RegionRequestSender<PdC, Cn>,
        bo: &mut Backoffer,
        mut batch: Batch,
        txn_size: u64,
    ) -> Result<()> {
        loop {
            let mut req = self.build_prewrite_request(&batch, txn_size);
            let outcome = sender
                .send::<kvpb::PrewriteRequest, kvpb::PrewriteResponse>(
                    bo,
                    &mut req,
                    batch.region.clone(),
                    READ_TIMEOUT_SHORT,
                )
                .await?;
            let resp = match outcome {
                SendOutcome::RegionError(e) => {
                    if self.on_batch_region_error(bo, &mut batch, e).await? {
                        continue;
                    }
                    // The batch now spans regions; re-split from scratch.
                    return self
                        .do_action_on_mutations(
                            bo,
                            CommitAction::Prewrite { retry: true },
                            batch.mutations,
                        )
                        .await;
                }
                SendOutcome::Response(resp) => resp,
            };

            if resp.errors.is_empty() {
                sender.clear_rpc_error();
                return self.on_prewrite_success(&batch, &resp);
            }

            let mut locks = Vec::new();
            for mut key_error in resp.errors {
                if key_error.already_exist.is_some() {
                    return Err(Error::from(key_error));
                }
                let Some(lock) = key_error.locked.take() else {
                    return Err(Error::from(key_error));
                };
                // An optimistic transaction blocked by a newer lock will
                // fail with WriteConflict anyway; don't bother resolving.
                if !self.is_pessimistic && lock.lock_version > self.start_ts {
                    return Err(Error::WriteConflict(WriteConflictError {
                        start_ts: self.start_ts,
                        conflict_ts: lock.lock_version,
                        conflict_commit_ts: 0,
                        key: lock.key,
                        primary: lock.primary_lock,
                    }));
                }
                debug!(
                    "prewrite of txn {} encounters lock of txn {}",
                    self.start_ts, lock.lock_version
                );
                locks.push(lock);
            }
            let lock_count = locks.len();
            let resolved = resolve_locks(&self.store, bo, self.start_ts, locks).await?;
            if resolved.ms_before_txn_expired > 0 {
                bo.backoff_with_max_sleep(
                    &BO_TXN_LOCK,
                    Some(resolved.ms_before_txn_expired),
                    format!("prewrite of txn {} blocked by {lock_count} locks", self.start_ts),
                )
                .await?;
            }
        }
    }

    fn on_prewrite_success(&self, batch: &Batch, resp: &kvpb::PrewriteResponse) -> Result<()> {
        if batch.is_primary
            && self.write_size > TTL_REFRESHED_TXN_SIZE
            && resp.one_pc_commit_ts == 0
        {
            self.ttl_manager
                .start(self.store.clone(), self.primary_key.clone(), self.start_ts);
        }

        if self.try_one_pc() {
            if resp.one_pc_commit_ts == 0 {
                if resp.min_commit_ts != 0 {
                    return Err(Error::OnePcFallbackInvalid);
                }
                warn!(
                    "1PC of txn {} fell back to the normal commit procedure",
                    self.start_ts
                );
                self.try_one_pc.store(false, Ordering::SeqCst);
                self.use_async_commit.store(false, Ordering::SeqCst);
                return Ok(());
            }
            if self
                .one_pc_commit_ts
                .compare_exchange(0, resp.one_pc_commit_ts, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return Err(crate::internal_err!(
                    "1PC of txn {} committed more than once",
                    self.start_ts
                ));
            }
            return Ok(());
        }
        if resp.one_pc_commit_ts != 0 {
            return Err(Error::OnePcCommitMismatch {
                commit_ts: resp.one_pc_commit_ts,
            });
        }

        if self.use_async_commit() {
            if resp.min_commit_ts == 0 {
                warn!(
                    "async commit of txn {} cannot proceed, falling back to the normal path",
                    self.start_ts
                );
                self.use_async_commit.store(false, Ordering::SeqCst);
            } else {
                self.min_commit_ts
                    .fetch_max(resp.min_commit_ts, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    // Commit

    async fn commit_batch(
        &self,
        bo: &mut Backoffer,
        mut batch: Batch,
        commit_version: u64,
    ) -> Result<()> {
        let mut sender = self.store.sender();
        let result = loop {
            let mut req = new_commit_request(batch.keys(), self.start_ts, commit_version);
            let outcome = sender
                .send::<kvpb::CommitRequest, kvpb::CommitResponse>(
                    bo,
                    &mut req,
                    batch.region.clone(),
                    READ_TIMEOUT_SHORT,
                )
                .await;
            match outcome {
                Ok(SendOutcome::RegionError(e)) => {
                    match self.on_batch_region_error(bo, &mut batch, e).await {
                        Ok(true) => continue,
                        Ok(false) => {
                            break self
                                .do_action_on_mutations(
                                    bo,
                                    CommitAction::Commit { commit_version },
                                    batch.mutations,
                                )
                                .await;
                        }
                        Err(e) => break Err(e),
                    }
                }
                Ok(SendOutcome::Response(resp)) => {
                    if let Some(key_error) = resp.error {
                        break Err(Error::from(key_error));
                    }
                    sender.clear_rpc_error();
                    break Ok(());
                }
                Err(e) => break Err(e),
            }
        };
        // A primary commit that died on the wire has an unknown outcome.
        if result.is_err()
            && batch.is_primary
            && !self.use_async_commit()
            && sender.rpc_error().is_some()
        {
            self.undetermined.store(true, Ordering::SeqCst);
        }
        result
    }

    // Cleanup (optimistic rollback)

    async fn cleanup_batch(&self, bo: &mut Backoffer, mut batch: Batch) -> Result<()> {
        let mut sender = self.store.sender();
        loop {
            let mut req = new_batch_rollback_request(batch.keys(), self.start_ts);
            match sender
                .send::<kvpb::BatchRollbackRequest, kvpb::BatchRollbackResponse>(
                    bo,
                    &mut req,
                    batch.region.clone(),
                    READ_TIMEOUT_SHORT,
                )
                .await?
            {
                SendOutcome::RegionError(e) => {
                    if self.on_batch_region_error(bo, &mut batch, e).await? {
                        continue;
                    }
                    return self
                        .do_action_on_mutations(bo, CommitAction::Cleanup, batch.mutations)
                        .await;
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

    // Pessimistic lock / rollback

    async fn pessimistic_lock_batch(
        &self,
        bo: &mut Backoffer,
        mut batch: Batch,
        for_update_ts: u64,
        return_values: bool,
        check_existence: bool,
    ) -> Result<()> {
        let mut sender = self.store.sender();
        loop {
            let mut req = new_pessimistic_lock_request(
                batch.keys(),
                self.primary_key.clone(),
                self.start_ts,
                self.lock_ttl,
                for_update_ts,
            );
            req.return_values = return_values;
            req.check_existence = check_existence;
            match sender
                .send::<kvpb::PessimisticLockRequest, kvpb::PessimisticLockResponse>(
                    bo,
                    &mut req,
                    batch.region.clone(),
                    READ_TIMEOUT_SHORT,
                )
                .await?
            {
                SendOutcome::RegionError(e) => {
                    if self.on_batch_region_error(bo, &mut batch, e).await? {
                        continue;
                    }
                    return self
                        .do_action_on_mutations(
                            bo,
                            CommitAction::PessimisticLock {
                                for_update_ts,
                                return_values,
                                check_existence,
                            },
                            batch.mutations,
                        )
                        .await;
                }
                SendOutcome::Response(resp) => {
                    if resp.errors.is_empty() {
                        if batch.is_primary {
                            self.ttl_manager.start(
                                self.store.clone(),
                                self.primary_key.clone(),
                                self.start_ts,
                            );
                        }
                        if return_values || check_existence {
                            let mut lock_values =
                                self.lock_values.lock().unwrap_or_else(|e| e.into_inner());
                            for (i, m) in batch.mutations.iter().enumerate() {
                                let value =
                                    resp.values.get(i).cloned().unwrap_or_default();
                                let not_found =
                                    resp.not_founds.get(i).copied().unwrap_or(true);
                                lock_values.insert(m.key.clone(), (value, not_found));
                            }
                        }
                        return Ok(());
                    }

                    let mut locks = Vec::new();
                    for mut key_error in resp.errors {
                        if key_error.deadlock.is_some() {
                            return Err(Error::from(key_error));
                        }
                        let Some(lock) = key_error.locked.take() else {
                            return Err(Error::from(key_error));
                        };
                        locks.push(lock);
                    }
                    let lock_count = locks.len();
                    let resolved =
                        resolve_locks(&self.store, bo, self.start_ts, locks).await?;
                    if resolved.ms_before_txn_expired > 0 {
                        bo.backoff_with_max_sleep(
                            &BO_TXN_LOCK,
                            Some(resolved.ms_before_txn_expired),
                            format!(
                                "pessimistic lock of txn {} blocked by {lock_count} locks",
                                self.start_ts
                            ),
                        )
                        .await?;
                    }
                }
            }
        }
    }

    async fn pessimistic_rollback_batch(
        &self,
        bo: &mut Backoffer,
        mut batch: Batch,
        for_update_ts: u64,
    ) -> Result<()> {
        let mut sender = self.store.sender();
        loop {
            let mut req =
                new_pessimistic_rollback_request(batch.keys(), self.start_ts, for_update_ts);
            match sender
                .send::<kvpb::PessimisticRollbackRequest, kvpb::PessimisticRollbackResponse>(
                    bo,
                    &mut req,
                    batch.region.clone(),
                    READ_TIMEOUT_SHORT,
                )
                .await?
            {
                SendOutcome::RegionError(e) => {
                    if self.on_batch_region_error(bo, &mut batch, e).await? {
                        continue;
                    }
                    return self
                        .do_action_on_mutations(
                            bo,
                            CommitAction::PessimisticRollback { for_update_ts },
                            batch.mutations,
                        )
                        .await;
                }
                SendOutcome::Response(resp) => {
                    if let Some(key_error) = resp.errors.into_iter().next() {
                        return Err(Error::from(key_error));
                    }
                    return Ok(());
                }
            }
        }
    }
}
