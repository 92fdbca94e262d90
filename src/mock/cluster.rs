// Copyright 2024 RiftKV Project Authors. Licensed under Apache-2.0.

use std::any::Any;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::mvcc::MvccEngine;
use crate::proto::errorpb;
use crate::proto::kvpb;
use crate::proto::metapb;
use crate::proto::pdpb;
use crate::region::StoreId;
use crate::store::KvClient;
use crate::store::KvConnect;
use crate::store::Request;
use crate::Error;
use crate::Result;

/// Overrides responses for matching requests; return `None` to fall through
/// to the real handler.
pub type Interceptor =
    Box<dyn Fn(&dyn Request) -> Option<Result<Box<dyn Any>>> + Send + Sync + 'static>;

#[derive(Clone)]
struct MockRegion {
    meta: metapb::Region,
    leader_store: StoreId,
}

struct ClusterInner {
    regions: Vec<MockRegion>,
    stores: Vec<metapb::Store>,
    next_id: u64,
}

impl ClusterInner {
    fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn region_containing(&self, key: &[u8]) -> Option<&MockRegion> {
        self.regions
            .iter()
            .find(|r| crate::region::contains(&r.meta.start_key, &r.meta.end_key, key))
    }

    fn regions_overlapping(&self, start: &[u8], end: &[u8]) -> Vec<metapb::Region> {
        let mut out: Vec<metapb::Region> = self
            .regions
            .iter()
            .filter(|r| {
                let after_start = r.meta.end_key.is_empty() || r.meta.end_key.as_slice() > start;
                let before_end = end.is_empty() || r.meta.start_key.as_slice() < end;
                after_start && before_end
            })
            .map(|r| r.meta.clone())
            .collect();
        out.sort_by(|a, b| a.start_key.cmp(&b.start_key));
        out
    }
}

/// An in-process cluster: region/store metadata plus one shared MVCC engine
/// that every (simulated) store serves from.
pub struct MockCluster {
    engine: Arc<MvccEngine>,
    inner: Mutex<ClusterInner>,
    ts: Mutex<(i64, i64)>,
    interceptor: Mutex<Option<Interceptor>>,
}

impl Default for MockCluster {
    fn default() -> Self {
        MockCluster::new(3)
    }
}

impl MockCluster {
    /// A cluster of `store_count` stores and a single region spanning the
    /// whole key space, with its leader on the first store.
    pub fn new(store_count: u64) -> MockCluster {
        assert!(store_count > 0);
        let stores: Vec<metapb::Store> = (1..=store_count)
            .map(|id| metapb::Store {
                id,
                address: store_address(id),
                status_address: String::new(),
                state: metapb::StoreState::Up as i32,
                labels: Vec::new(),
            })
            .collect();
        let mut next_id = store_count;
        let region_id = {
            next_id += 1;
            next_id
        };
        let peers = stores
            .iter()
            .map(|s| {
                next_id += 1;
                metapb::Peer {
                    id: next_id,
                    store_id: s.id,
                    role: metapb::PeerRole::Voter as i32,
                }
            })
            .collect();
        let region = MockRegion {
            meta: metapb::Region {
                id: region_id,
                start_key: Vec::new(),
                end_key: Vec::new(),
                region_epoch: Some(metapb::RegionEpoch {
                    conf_ver: 1,
                    version: 1,
                }),
                peers,
            },
            leader_store: 1,
        };
        MockCluster {
            engine: Arc::new(MvccEngine::new()),
            inner: Mutex::new(ClusterInner {
                regions: vec![region],
                stores,
                next_id,
            }),
            ts: Mutex::new((0, 0)),
            interceptor: Mutex::new(None),
        }
    }

    pub fn engine(&self) -> Arc<MvccEngine> {
        self.engine.clone()
    }

    /// Installs (or clears) the request interceptor.
    pub fn set_interceptor(&self, interceptor: Option<Interceptor>) {
        *self.interceptor.lock().unwrap_or_else(|e| e.into_inner()) = interceptor;
    }

    /// Splits the region containing `split_key` at it. The left half keeps
    /// the region id with a bumped version, mirroring a real split.
    pub fn split(&self, split_key: &[u8]) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let pos = inner
            .regions
            .iter()
            .position(|r| crate::region::contains(&r.meta.start_key, &r.meta.end_key, split_key))
            .expect("split key must land in some region");
        let old = inner.regions[pos].clone();
        let old_epoch = old.meta.region_epoch.unwrap_or_default();

        let right_id = inner.alloc_id();
        let right_peers: Vec<metapb::Peer> = old
            .meta
            .peers
            .iter()
            .map(|p| {
                let id = inner.alloc_id();
                metapb::Peer {
                    id,
                    store_id: p.store_id,
                    role: p.role,
                }
            })
            .collect();

        let mut left = old.clone();
        left.meta.end_key = split_key.to_vec();
        left.meta.region_epoch = Some(metapb::RegionEpoch {
            conf_ver: old_epoch.conf_ver,
            version: old_epoch.version + 1,
        });
        let right = MockRegion {
            meta: metapb::Region {
                id: right_id,
                start_key: split_key.to_vec(),
                end_key: old.meta.end_key.clone(),
                region_epoch: Some(metapb::RegionEpoch {
                    conf_ver: old_epoch.conf_ver,
                    version: old_epoch.version + 1,
                }),
                peers: right_peers,
            },
            leader_store: old.leader_store,
        };
        inner.regions[pos] = left;
        inner.regions.push(right);
        inner.regions.sort_by(|a, b| a.meta.start_key.cmp(&b.meta.start_key));
    }

    /// Moves a region's leader to another store.
    pub fn transfer_leader(&self, region_id: u64, store_id: StoreId) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(region) = inner.regions.iter_mut().find(|r| r.meta.id == region_id) {
            region.leader_store = store_id;
        }
    }

    pub fn region_id_for(&self, key: &[u8]) -> u64 {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.region_containing(key).map(|r| r.meta.id).unwrap_or(0)
    }

    // PD-facing surface

    pub(crate) fn timestamp(&self) -> pdpb::Timestamp {
        let now_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        let mut ts = self.ts.lock().unwrap_or_else(|e| e.into_inner());
        if now_ms > ts.0 {
            *ts = (now_ms, 0);
        } else {
            ts.1 += 1;
        }
        pdpb::Timestamp {
            physical: ts.0,
            logical: ts.1,
        }
    }

    pub(crate) fn region_for_key(&self, key: &[u8]) -> Option<(metapb::Region, metapb::Peer)> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let region = inner.region_containing(key)?;
        let leader = leader_peer(region)?;
        Some((region.meta.clone(), leader))
    }

    pub(crate) fn prev_region_for_key(&self, key: &[u8]) -> Option<(metapb::Region, metapb::Peer)> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let region = inner
            .regions
            .iter()
            .filter(|r| !r.meta.end_key.is_empty() && r.meta.end_key.as_slice() <= key)
            .max_by(|a, b| a.meta.end_key.cmp(&b.meta.end_key))?;
        let leader = leader_peer(region)?;
        Some((region.meta.clone(), leader))
    }

    pub(crate) fn region_by_id(&self, id: u64) -> Option<(metapb::Region, metapb::Peer)> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let region = inner.regions.iter().find(|r| r.meta.id == id)?;
        let leader = leader_peer(region)?;
        Some((region.meta.clone(), leader))
    }

    pub(crate) fn scan_region_metas(
        &self,
        start: &[u8],
        end: &[u8],
        limit: usize,
    ) -> Vec<(metapb::Region, Option<metapb::Peer>)> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut regions: Vec<&MockRegion> = inner
            .regions
            .iter()
            .filter(|r| {
                let after_start = r.meta.end_key.is_empty() || r.meta.end_key.as_slice() > start;
                let before_end = end.is_empty() || r.meta.start_key.as_slice() < end;
                after_start && before_end
            })
            .collect();
        regions.sort_by(|a, b| a.meta.start_key.cmp(&b.meta.start_key));
        regions
            .into_iter()
            .take(limit)
            .map(|r| (r.meta.clone(), leader_peer(r)))
            .collect()
    }

    pub(crate) fn store_meta(&self, id: StoreId) -> Option<metapb::Store> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.stores.iter().find(|s| s.id == id).cloned()
    }

    pub(crate) fn all_store_metas(&self) -> Vec<metapb::Store> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .stores
            .clone()
    }

    // KV-facing surface

    /// Validates a request's region targeting, the way a store node would.
    fn check_context(&self, context: Option<&kvpb::Context>, keys: &[&[u8]]) -> Option<errorpb::Error> {
        let mut err = errorpb::Error::default();
        let Some(context) = context else {
            err.message = "missing context".to_owned();
            return Some(err);
        };
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(region) = inner.regions.iter().find(|r| r.meta.id == context.region_id) else {
            err.region_not_found = Some(errorpb::RegionNotFound {
                region_id: context.region_id,
            });
            return Some(err);
        };

        let current_epoch = region.meta.region_epoch.unwrap_or_default();
        let request_epoch = context.region_epoch.unwrap_or_default();
        if request_epoch != current_epoch {
            // Cover the span the request actually touches, so the client can
            // re-split against the successors.
            let (min_key, max_key) = key_span(keys);
            let mut current_regions = match (min_key, max_key) {
                (Some(min), Some(max)) => inner.regions_overlapping(min, &upper_bound(max)),
                _ => Vec::new(),
            };
            if !current_regions.iter().any(|r| r.id == region.meta.id) {
                current_regions.push(region.meta.clone());
            }
            err.epoch_not_match = Some(errorpb::EpochNotMatch { current_regions });
            return Some(err);
        }

        let peer_store = context.peer.as_ref().map(|p| p.store_id).unwrap_or(0);
        if peer_store != region.leader_store {
            err.not_leader = Some(errorpb::NotLeader {
                region_id: region.meta.id,
                leader: region
                    .meta
                    .peers
                    .iter()
                    .find(|p| p.store_id == region.leader_store)
                    .cloned(),
            });
            return Some(err);
        }

        for key in keys {
            if !crate::region::contains(&region.meta.start_key, &region.meta.end_key, key) {
                err.key_not_in_region = Some(errorpb::KeyNotInRegion {
                    key: key.to_vec(),
                    region_id: region.meta.id,
                    start_key: region.meta.start_key.clone(),
                    end_key: region.meta.end_key.clone(),
                });
                return Some(err);
            }
        }
        None
    }

    /// The region range a request is clipped to (for range operations).
    fn region_range(&self, context: Option<&kvpb::Context>) -> Option<(Vec<u8>, Vec<u8>)> {
        let context = context?;
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .regions
            .iter()
            .find(|r| r.meta.id == context.region_id)
            .map(|r| (r.meta.start_key.clone(), r.meta.end_key.clone()))
    }

    pub(crate) fn dispatch(&self, request: &dyn Request) -> Result<Box<dyn Any>> {
        if let Some(interceptor) = &*self.interceptor.lock().unwrap_or_else(|e| e.into_inner()) {
            if let Some(result) = interceptor(request) {
                return result;
            }
        }

        let any = request.as_any();
        if let Some(req) = any.downcast_ref::<kvpb::GetRequest>() {
            return Ok(Box::new(self.handle_get(req)));
        }
        if let Some(req) = any.downcast_ref::<kvpb::BatchGetRequest>() {
            return Ok(Box::new(self.handle_batch_get(req)));
        }
        if let Some(req) = any.downcast_ref::<kvpb::ScanRequest>() {
            return Ok(Box::new(self.handle_scan(req)));
        }
        if let Some(req) = any.downcast_ref::<kvpb::PrewriteRequest>() {
            return Ok(Box::new(self.handle_prewrite(req)));
        }
        if let Some(req) = any.downcast_ref::<kvpb::CommitRequest>() {
            return Ok(Box::new(self.handle_commit(req)));
        }
        if let Some(req) = any.downcast_ref::<kvpb::BatchRollbackRequest>() {
            return Ok(Box::new(self.handle_batch_rollback(req)));
        }
        if let Some(req) = any.downcast_ref::<kvpb::CleanupRequest>() {
            return Ok(Box::new(self.handle_cleanup(req)));
        }
        if let Some(req) = any.downcast_ref::<kvpb::CheckTxnStatusRequest>() {
            return Ok(Box::new(self.handle_check_txn_status(req)));
        }
        if let Some(req) = any.downcast_ref::<kvpb::TxnHeartBeatRequest>() {
            return Ok(Box::new(self.handle_heart_beat(req)));
        }
        if let Some(req) = any.downcast_ref::<kvpb::ScanLockRequest>() {
            return Ok(Box::new(self.handle_scan_lock(req)));
        }
        if let Some(req) = any.downcast_ref::<kvpb::ResolveLockRequest>() {
            return Ok(Box::new(self.handle_resolve_lock(req)));
        }
        if let Some(req) = any.downcast_ref::<kvpb::PessimisticLockRequest>() {
            return Ok(Box::new(self.handle_pessimistic_lock(req)));
        }
        if let Some(req) = any.downcast_ref::<kvpb::PessimisticRollbackRequest>() {
            return Ok(Box::new(self.handle_pessimistic_rollback(req)));
        }
        if let Some(req) = any.downcast_ref::<kvpb::GcRequest>() {
            return Ok(Box::new(self.handle_gc(req)));
        }
        if let Some(req) = any.downcast_ref::<kvpb::DeleteRangeRequest>() {
            return Ok(Box::new(self.handle_delete_range(req)));
        }
        Err(crate::internal_err!(
            "mock cluster cannot serve {}",
            request.label()
        ))
    }

    fn handle_get(&self, req: &kvpb::GetRequest) -> kvpb::GetResponse {
        let mut resp = kvpb::GetResponse::default();
        if let Some(e) = self.check_context(req.context.as_ref(), &[req.key.as_slice()]) {
            resp.region_error = Some(e);
            return resp;
        }
        let resolved = resolved_locks(req.context.as_ref());
        match self
            .engine
            .get(&req.key, req.version, kvpb::IsolationLevel::Si, &resolved)
        {
            Ok(Some(value)) => resp.value = value,
            Ok(None) => resp.not_found = true,
            Err(e) => resp.error = Some(e.to_key_error()),
        }
        resp
    }

    fn handle_batch_get(&self, req: &kvpb::BatchGetRequest) -> kvpb::BatchGetResponse {
        let mut resp = kvpb::BatchGetResponse::default();
        let keys: Vec<&[u8]> = req.keys.iter().map(|k| k.as_slice()).collect();
        if let Some(e) = self.check_context(req.context.as_ref(), &keys) {
            resp.region_error = Some(e);
            return resp;
        }
        let resolved = resolved_locks(req.context.as_ref());
        for pair in self
            .engine
            .batch_get(&req.keys, req.version, kvpb::IsolationLevel::Si, &resolved)
        {
            resp.pairs.push(kvpb::KvPair {
                error: pair.err.map(|e| e.to_key_error()),
                key: pair.key,
                value: pair.value.unwrap_or_default(),
            });
        }
        resp
    }

    fn handle_scan(&self, req: &kvpb::ScanRequest) -> kvpb::ScanResponse {
        let mut resp = kvpb::ScanResponse::default();
        if let Some(e) = self.check_context(req.context.as_ref(), &[]) {
            resp.region_error = Some(e);
            return resp;
        }
        let Some((region_start, region_end)) = self.region_range(req.context.as_ref()) else {
            resp.region_error = Some(errorpb::Error::default());
            return resp;
        };
        let start = clip_start(&req.start_key, &region_start);
        let end = clip_end(&req.end_key, &region_end);
        let resolved = resolved_locks(req.context.as_ref());
        let pairs = if req.reverse {
            self.engine.reverse_scan(
                &start,
                &end,
                req.limit as usize,
                req.version,
                kvpb::IsolationLevel::Si,
                &resolved,
            )
        } else {
            self.engine.scan(
                &start,
                &end,
                req.limit as usize,
                req.version,
                kvpb::IsolationLevel::Si,
                &resolved,
            )
        };
        for pair in pairs {
            resp.pairs.push(kvpb::KvPair {
                error: pair.err.map(|e| e.to_key_error()),
                key: pair.key,
                value: pair.value.unwrap_or_default(),
            });
        }
        resp
    }

    fn handle_prewrite(&self, req: &kvpb::PrewriteRequest) -> kvpb::PrewriteResponse {
        let mut resp = kvpb::PrewriteResponse::default();
        let keys: Vec<&[u8]> = req.mutations.iter().map(|m| m.key.as_slice()).collect();
        if let Some(e) = self.check_context(req.context.as_ref(), &keys) {
            resp.region_error = Some(e);
            return resp;
        }
        let result = self.engine.prewrite(req);
        resp.errors = result.errors.iter().map(|e| e.to_key_error()).collect();
        resp.min_commit_ts = result.min_commit_ts;
        resp.one_pc_commit_ts = result.one_pc_commit_ts;
        resp
    }

    fn handle_commit(&self, req: &kvpb::CommitRequest) -> kvpb::CommitResponse {
        let mut resp = kvpb::CommitResponse::default();
        let keys: Vec<&[u8]> = req.keys.iter().map(|k| k.as_slice()).collect();
        if let Some(e) = self.check_context(req.context.as_ref(), &keys) {
            resp.region_error = Some(e);
            return resp;
        }
        match self
            .engine
            .commit(&req.keys, req.start_version, req.commit_version)
        {
            Ok(()) => resp.commit_version = req.commit_version,
            Err(e) => resp.error = Some(e.to_key_error()),
        }
        resp
    }

    fn handle_batch_rollback(
        &self,
        req: &kvpb::BatchRollbackRequest,
    ) -> kvpb::BatchRollbackResponse {
        let mut resp = kvpb::BatchRollbackResponse::default();
        let keys: Vec<&[u8]> = req.keys.iter().map(|k| k.as_slice()).collect();
        if let Some(e) = self.check_context(req.context.as_ref(), &keys) {
            resp.region_error = Some(e);
            return resp;
        }
        if let Err(e) = self.engine.rollback(&req.keys, req.start_version) {
            resp.error = Some(e.to_key_error());
        }
        resp
    }

    fn handle_cleanup(&self, req: &kvpb::CleanupRequest) -> kvpb::CleanupResponse {
        let mut resp = kvpb::CleanupResponse::default();
        if let Some(e) = self.check_context(req.context.as_ref(), &[req.key.as_slice()]) {
            resp.region_error = Some(e);
            return resp;
        }
        match self
            .engine
            .cleanup(&req.key, req.start_version, req.current_ts)
        {
            Ok(()) => {}
            Err(crate::mvcc::MvccError::AlreadyCommitted { commit_ts }) => {
                resp.commit_version = commit_ts;
            }
            Err(e) => resp.error = Some(e.to_key_error()),
        }
        resp
    }

    fn handle_check_txn_status(
        &self,
        req: &kvpb::CheckTxnStatusRequest,
    ) -> kvpb::CheckTxnStatusResponse {
        let mut resp = kvpb::CheckTxnStatusResponse::default();
        if let Some(e) = self.check_context(req.context.as_ref(), &[req.primary_key.as_slice()]) {
            resp.region_error = Some(e);
            return resp;
        }
        match self.engine.check_txn_status(
            &req.primary_key,
            req.lock_ts,
            req.caller_start_ts,
            req.current_ts,
            req.rollback_if_not_exist,
            req.resolving_pessimistic_lock,
        ) {
            Ok(status) => {
                resp.lock_ttl = status.ttl;
                resp.commit_version = status.commit_ts;
                resp.action = status.action as i32;
            }
            Err(e) => resp.error = Some(e.to_key_error()),
        }
        resp
    }

    fn handle_heart_beat(&self, req: &kvpb::TxnHeartBeatRequest) -> kvpb::TxnHeartBeatResponse {
        let mut resp = kvpb::TxnHeartBeatResponse::default();
        if let Some(e) = self.check_context(req.context.as_ref(), &[req.primary_lock.as_slice()]) {
            resp.region_error = Some(e);
            return resp;
        }
        match self
            .engine
            .txn_heart_beat(&req.primary_lock, req.start_version, req.advise_lock_ttl)
        {
            Ok(ttl) => resp.lock_ttl = ttl,
            Err(e) => resp.error = Some(e.to_key_error()),
        }
        resp
    }

    fn handle_scan_lock(&self, req: &kvpb::ScanLockRequest) -> kvpb::ScanLockResponse {
        let mut resp = kvpb::ScanLockResponse::default();
        if let Some(e) = self.check_context(req.context.as_ref(), &[]) {
            resp.region_error = Some(e);
            return resp;
        }
        let Some((region_start, region_end)) = self.region_range(req.context.as_ref()) else {
            resp.region_error = Some(errorpb::Error::default());
            return resp;
        };
        let start = clip_start(&req.start_key, &region_start);
        let end = clip_end(&req.end_key, &region_end);
        match self.engine.scan_lock(&start, &end, req.max_version) {
            Ok(locks) => {
                resp.locks = locks;
                if req.limit > 0 {
                    resp.locks.truncate(req.limit as usize);
                }
            }
            Err(e) => resp.error = Some(e.to_key_error()),
        }
        resp
    }

    fn handle_resolve_lock(&self, req: &kvpb::ResolveLockRequest) -> kvpb::ResolveLockResponse {
        let mut resp = kvpb::ResolveLockResponse::default();
        if let Some(e) = self.check_context(req.context.as_ref(), &[]) {
            resp.region_error = Some(e);
            return resp;
        }
        let Some((region_start, region_end)) = self.region_range(req.context.as_ref()) else {
            resp.region_error = Some(errorpb::Error::default());
            return resp;
        };
        let result = if !req.txn_infos.is_empty() {
            let txn_infos = req
                .txn_infos
                .iter()
                .map(|info| (info.txn, info.status))
                .collect();
            self.engine
                .batch_resolve_lock(&region_start, &region_end, &txn_infos)
        } else if !req.keys.is_empty() {
            // Lite resolve: only the named keys.
            req.keys.iter().try_for_each(|key| {
                let end = upper_bound(key);
                self.engine
                    .resolve_lock(key, &end, req.start_version, req.commit_version)
            })
        } else {
            self.engine.resolve_lock(
                &region_start,
                &region_end,
                req.start_version,
                req.commit_version,
            )
        };
        if let Err(e) = result {
            resp.error = Some(e.to_key_error());
        }
        resp
    }

    fn handle_pessimistic_lock(
        &self,
        req: &kvpb::PessimisticLockRequest,
    ) -> kvpb::PessimisticLockResponse {
        let mut resp = kvpb::PessimisticLockResponse::default();
        let keys: Vec<&[u8]> = req.mutations.iter().map(|m| m.key.as_slice()).collect();
        if let Some(e) = self.check_context(req.context.as_ref(), &keys) {
            resp.region_error = Some(e);
            return resp;
        }
        let (errors, values, not_founds) = self.engine.pessimistic_lock(req);
        resp.errors = errors.iter().map(|e| e.to_key_error()).collect();
        resp.values = values;
        resp.not_founds = not_founds;
        resp
    }

    fn handle_pessimistic_rollback(
        &self,
        req: &kvpb::PessimisticRollbackRequest,
    ) -> kvpb::PessimisticRollbackResponse {
        let mut resp = kvpb::PessimisticRollbackResponse::default();
        let keys: Vec<&[u8]> = req.keys.iter().map(|k| k.as_slice()).collect();
        if let Some(e) = self.check_context(req.context.as_ref(), &keys) {
            resp.region_error = Some(e);
            return resp;
        }
        resp.errors = self
            .engine
            .pessimistic_rollback(&req.keys, req.start_version, req.for_update_ts)
            .iter()
            .map(|e| e.to_key_error())
            .collect();
        resp
    }

    fn handle_gc(&self, req: &kvpb::GcRequest) -> kvpb::GcResponse {
        let mut resp = kvpb::GcResponse::default();
        if let Some(e) = self.check_context(req.context.as_ref(), &[]) {
            resp.region_error = Some(e);
            return resp;
        }
        let Some((region_start, region_end)) = self.region_range(req.context.as_ref()) else {
            resp.region_error = Some(errorpb::Error::default());
            return resp;
        };
        if let Err(e) = self.engine.gc(&region_start, &region_end, req.safe_point) {
            resp.error = Some(e.to_key_error());
        }
        resp
    }

    fn handle_delete_range(&self, req: &kvpb::DeleteRangeRequest) -> kvpb::DeleteRangeResponse {
        let mut resp = kvpb::DeleteRangeResponse::default();
        if let Some(e) = self.check_context(req.context.as_ref(), &[]) {
            resp.region_error = Some(e);
            return resp;
        }
        if let Err(e) = self.engine.delete_range(&req.start_key, &req.end_key) {
            resp.error = e.to_string();
        }
        resp
    }
}

pub(crate) fn store_address(id: StoreId) -> String {
    format!("store{id}")
}

fn leader_peer(region: &MockRegion) -> Option<metapb::Peer> {
    region
        .meta
        .peers
        .iter()
        .find(|p| p.store_id == region.leader_store)
        .cloned()
}

fn resolved_locks(context: Option<&kvpb::Context>) -> Vec<u64> {
    context.map(|c| c.resolved_locks.clone()).unwrap_or_default()
}

fn key_span<'a>(keys: &[&'a [u8]]) -> (Option<&'a [u8]>, Option<&'a [u8]>) {
    (keys.iter().copied().min(), keys.iter().copied().max())
}

/// The smallest exclusive upper bound containing `key`.
fn upper_bound(key: &[u8]) -> Vec<u8> {
    let mut bound = key.to_vec();
    bound.push(0);
    bound
}

fn clip_start(request_start: &[u8], region_start: &[u8]) -> Vec<u8> {
    std::cmp::max(request_start, region_start).to_vec()
}

fn clip_end(request_end: &[u8], region_end: &[u8]) -> Vec<u8> {
    match (request_end.is_empty(), region_end.is_empty()) {
        (true, _) => region_end.to_vec(),
        (_, true) => request_end.to_vec(),
        _ => std::cmp::min(request_end, region_end).to_vec(),
    }
}

/// A mock client for one store address. Forwarded hosts resolve to their
/// target store, mirroring a proxying peer.
#[derive(Clone)]
pub struct MockKvClient {
    cluster: Arc<MockCluster>,
    addr: String,
    forwarded_host: Option<String>,
}

#[async_trait]
impl KvClient for MockKvClient {
    async fn dispatch(&self, request: &dyn Request, _timeout: Duration) -> Result<Box<dyn Any>> {
        let _effective = self.forwarded_host.as_ref().unwrap_or(&self.addr);
        self.cluster.dispatch(request)
    }

    fn with_forwarded_host(&self, host: &str) -> Self {
        MockKvClient {
            cluster: self.cluster.clone(),
            addr: self.addr.clone(),
            forwarded_host: Some(host.to_owned()),
        }
    }
}

/// Connector producing [`MockKvClient`]s.
#[derive(Clone)]
pub struct MockConnect {
    cluster: Arc<MockCluster>,
}

impl MockConnect {
    pub fn new(cluster: Arc<MockCluster>) -> MockConnect {
        MockConnect { cluster }
    }
}

#[async_trait]
impl KvConnect for MockConnect {
    type KvClient = MockKvClient;

    async fn connect(&self, address: &str) -> Result<MockKvClient> {
        let known = self
            .cluster
            .all_store_metas()
            .iter()
            .any(|s| s.address == address);
        if !known {
            return Err(Error::StringError(format!(
                "mock cluster has no store at {address}"
            )));
        }
        Ok(MockKvClient {
            cluster: self.cluster.clone(),
            addr: address.to_owned(),
            forwarded_host: None,
        })
    }
}
