// Copyright 2024 RiftKV Project Authors. Licensed under Apache-2.0.

//! The region routing cache.
//!
//! Two indices cover the same set of cached [`Region`]s: `region_id ->
//! latest version -> region`, and an ordered map `start_key -> region` for
//! key addressing. Entries are invalidated in place (with a reason) rather
//! than removed; lookups treat an invalidated or idle-expired entry as a
//! miss and read through PD.
//!
//! The cache also owns the store registry and its two background concerns:
//! the check-and-resolve loop that refreshes store addresses, and the
//! per-store health-check loops that watch unreachable stores when
//! forwarding is enabled.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use log::error;
use log::info;
use log::warn;
use tokio::sync::watch;
use tokio::sync::Notify;

use crate::backoff::Backoffer;
use crate::backoff::BO_REGION_MISS;
use crate::pd::PdClient;
use crate::pd::RegionInfo;
use crate::proto::metapb;
use crate::region::contains;
use crate::region::AccessIndex;
use crate::region::AccessMode;
use crate::region::InvalidReason;
use crate::region::Region;
use crate::region::RegionId;
use crate::region::RegionVerId;
use crate::region::StoreSelector;
use crate::store::GrpcHealthProbe;
use crate::store::HealthProbe;
use crate::store::LivenessState;
use crate::store::ResolveState;
use crate::store::SingleFlightLiveness;
use crate::store::Store;
use crate::store::StoreMap;
use crate::Config;
use crate::Error;
use crate::Result;

const DEFAULT_REGIONS_PER_BATCH: i32 = 128;
const HEALTH_CHECK_TICK: Duration = Duration::from_secs(1);
const HEALTH_CHECK_PD_INTERVAL: Duration = Duration::from_secs(30);

pub(crate) fn now_epoch_sec() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// The region and range a key resolved to.
#[derive(Clone, Debug)]
pub struct KeyLocation {
    pub region: RegionVerId,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub buckets: Option<metapb::Buckets>,
}

impl KeyLocation {
    /// Whether `key` is in `[start_key, end_key)`.
    pub fn contains(&self, key: &[u8]) -> bool {
        contains(&self.start_key, &self.end_key, key)
    }

    pub fn bucket_version(&self) -> u64 {
        self.buckets.as_ref().map(|b| b.version).unwrap_or(0)
    }

    /// The bucket holding `key`, or `None` when bucket data is missing or
    /// too stale to place it.
    pub fn locate_bucket(&self, key: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
        let keys = &self.buckets.as_ref()?.keys;
        if keys.len() < 2 {
            return None;
        }
        let search_len = keys.len() - 1;
        let i = keys[..search_len].partition_point(|k| k.as_slice() <= key);
        // Bucket keys include the region boundaries, so i == 0 means the
        // bucket data does not cover the key.
        if i == 0 || (i == search_len && !keys[search_len].is_empty() && key >= keys[search_len].as_slice())
        {
            return None;
        }
        Some((keys[i - 1].clone(), keys[i].clone()))
    }
}

/// Everything needed to address one RPC at one replica.
#[derive(Clone)]
pub struct RpcContext {
    pub region: RegionVerId,
    pub meta: metapb::Region,
    pub peer: metapb::Peer,
    pub access_idx: AccessIndex,
    pub store: Arc<Store>,
    pub addr: String,
    /// Set when the target store is unreachable and the request should be
    /// forwarded through this store.
    pub proxy_store: Option<Arc<Store>>,
    pub proxy_addr: Option<String>,
}

impl std::fmt::Debug for RpcContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcContext")
            .field("region", &self.region)
            .field("peer", &self.peer)
            .field("addr", &self.addr)
            .field("proxy_addr", &self.proxy_addr)
            .finish()
    }
}

struct CacheInner {
    /// Concrete cached regions, keyed by their version id.
    regions: HashMap<RegionVerId, Arc<Region>>,
    /// region id -> the latest version id present in `regions`.
    latest_versions: HashMap<RegionId, RegionVerId>,
    /// start_key -> region, non-overlapping for valid entries.
    sorted: BTreeMap<Vec<u8>, Arc<Region>>,
}

pub struct RegionCache<PdC: PdClient> {
    pd_client: Arc<PdC>,
    inner: RwLock<CacheInner>,
    stores: StoreMap,
    notify_check: Arc<Notify>,
    close_tx: watch::Sender<bool>,
    config: Config,
    ttl_sec: i64,
    health_probe: Arc<dyn HealthProbe>,
    liveness: Arc<SingleFlightLiveness>,
}

impl<PdC: PdClient> RegionCache<PdC> {
    pub fn new(pd_client: Arc<PdC>, config: Config) -> Arc<Self> {
        Self::with_health_probe(pd_client, config, Arc::new(GrpcHealthProbe))
    }

    pub fn with_health_probe(
        pd_client: Arc<PdC>,
        config: Config,
        health_probe: Arc<dyn HealthProbe>,
    ) -> Arc<Self> {
        let (close_tx, close_rx) = watch::channel(false);
        let cache = Arc::new(RegionCache {
            pd_client,
            inner: RwLock::new(CacheInner {
                regions: HashMap::new(),
                latest_versions: HashMap::new(),
                sorted: BTreeMap::new(),
            }),
            stores: StoreMap::default(),
            notify_check: Arc::new(Notify::new()),
            close_tx,
            ttl_sec: config.region_cache_ttl.as_secs() as i64,
            config,
            health_probe,
            liveness: Arc::new(SingleFlightLiveness::default()),
        });
        tokio::spawn(check_and_resolve_loop(Arc::downgrade(&cache), close_rx));
        cache
    }

    /// Stops the background loops. Idempotent; also triggered by drop.
    pub fn close(&self) {
        let _ = self.close_tx.send(true);
    }

    fn inner_read(&self) -> std::sync::RwLockReadGuard<'_, CacheInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn inner_write(&self) -> std::sync::RwLockWriteGuard<'_, CacheInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    // Lookup

    /// Searches for the region and range a key belongs to, reading through
    /// PD on a miss.
    pub async fn locate_key(&self, bo: &mut Backoffer, key: &[u8]) -> Result<KeyLocation> {
        let region = self.find_region_by_key(bo, key, false).await?;
        Ok(self.key_location(&region))
    }

    /// Like [`Self::locate_key`] but start keys are exclusive and end keys
    /// inclusive, for addressing by a range's end.
    pub async fn locate_end_key(&self, bo: &mut Backoffer, key: &[u8]) -> Result<KeyLocation> {
        let region = self.find_region_by_key(bo, key, true).await?;
        Ok(self.key_location(&region))
    }

    pub async fn locate_region_by_id(
        &self,
        bo: &mut Backoffer,
        region_id: RegionId,
    ) -> Result<KeyLocation> {
        if let Some(region) = self.get_cached_region_by_id(region_id) {
            let region = if region.check_need_reload_and_mark_updated() {
                match self.load_region_by_id(bo, region_id).await {
                    Ok(loaded) => {
                        self.insert_region(loaded.clone());
                        loaded
                    }
                    Err(e) => {
                        error!("load region {} failure: {}", region_id, e);
                        region
                    }
                }
            } else {
                region
            };
            return Ok(self.key_location(&region));
        }

        let region = self.load_region_by_id(bo, region_id).await?;
        self.insert_region(region.clone());
        Ok(self.key_location(&region))
    }

    fn key_location(&self, region: &Arc<Region>) -> KeyLocation {
        KeyLocation {
            region: region.ver_id(),
            start_key: region.start_key().to_vec(),
            end_key: region.end_key().to_vec(),
            buckets: region.view().buckets.clone(),
        }
    }

    async fn find_region_by_key(
        &self,
        bo: &mut Backoffer,
        key: &[u8],
        is_end_key: bool,
    ) -> Result<Arc<Region>> {
        if let Some(region) = self.search_cached_region(key, is_end_key) {
            if !region.check_need_reload_and_mark_updated() {
                return Ok(region);
            }
            // A reload was scheduled; refresh but fall back to the old
            // entry when PD is unavailable.
            return match self.load_region(bo, key, is_end_key).await {
                Ok(loaded) => {
                    self.insert_region(loaded.clone());
                    Ok(loaded)
                }
                Err(e) => {
                    error!("load region failure for key {:?}: {}", key, e);
                    Ok(region)
                }
            };
        }

        let region = self.load_region(bo, key, is_end_key).await?;
        self.insert_region(region.clone());
        Ok(region)
    }

    fn search_cached_region(&self, key: &[u8], is_end_key: bool) -> Option<Arc<Region>> {
        let ts = now_epoch_sec();
        let inner = self.inner_read();
        let mut found = None;
        for (start_key, region) in inner.sorted.range(..=key.to_vec()).rev() {
            if is_end_key && start_key.as_slice() == key {
                continue;
            }
            if !region.check_cache_ttl(ts, self.ttl_sec) {
                continue;
            }
            found = Some(region.clone());
            break;
        }
        drop(inner);
        let region = found?;
        let hit = if is_end_key {
            region.contains_by_end(key)
        } else {
            region.contains(key)
        };
        hit.then_some(region)
    }

    fn get_cached_region_by_id(&self, region_id: RegionId) -> Option<Arc<Region>> {
        let ts = now_epoch_sec();
        let inner = self.inner_read();
        let ver_id = inner.latest_versions.get(&region_id)?;
        let region = inner.regions.get(ver_id)?;
        region
            .check_cache_ttl(ts, self.ttl_sec)
            .then(|| region.clone())
    }

    pub(crate) fn get_cached_region(&self, ver_id: &RegionVerId) -> Option<Arc<Region>> {
        self.inner_read().regions.get(ver_id).cloned()
    }

    // Loading

    async fn load_region(
        &self,
        bo: &mut Backoffer,
        key: &[u8],
        is_end_key: bool,
    ) -> Result<Arc<Region>> {
        loop {
            let info = if is_end_key {
                self.pd_client.get_prev_region(key.to_vec()).await
            } else {
                self.pd_client.get_region(key.to_vec()).await
            };
            match info {
                Ok(info) => {
                    if info.leader.is_none() {
                        bo.backoff(
                            &BO_REGION_MISS,
                            format!("region for key {key:?} has no leader yet"),
                        )
                        .await?;
                        continue;
                    }
                    return self.build_region(info).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn load_region_by_id(&self, bo: &mut Backoffer, id: RegionId) -> Result<Arc<Region>> {
        loop {
            let info = self.pd_client.get_region_by_id(id).await?;
            if info.leader.is_none() {
                bo.backoff(&BO_REGION_MISS, format!("region {id} has no leader yet"))
                    .await?;
                continue;
            }
            return self.build_region(info).await;
        }
    }

    /// Scans up to `count` regions of `[start_key, end_key)` from PD into
    /// the cache. Leaderless regions are skipped, not cached.
    pub async fn batch_load_regions(
        &self,
        _bo: &mut Backoffer,
        start_key: &[u8],
        end_key: &[u8],
        count: i32,
    ) -> Result<Vec<KeyLocation>> {
        let infos = self
            .pd_client
            .scan_regions(start_key.to_vec(), end_key.to_vec(), count)
            .await?;
        if infos.is_empty() {
            return Err(crate::internal_err!(
                "PD returned no region for range {:?}..{:?}",
                start_key,
                end_key
            ));
        }
        let mut loaded = Vec::with_capacity(infos.len());
        for info in infos {
            let has_leader = info.leader.as_ref().map(|l| l.id != 0).unwrap_or(false);
            if !has_leader {
                continue;
            }
            let region = self.build_region(info).await?;
            self.insert_region(region.clone());
            loaded.push(self.key_location(&region));
        }
        Ok(loaded)
    }

    /// Loads all regions intersecting `[start_key, end_key)`, batch by batch.
    pub async fn load_regions_in_key_range(
        &self,
        bo: &mut Backoffer,
        start_key: &[u8],
        end_key: &[u8],
    ) -> Result<Vec<KeyLocation>> {
        let mut regions = Vec::new();
        let mut cursor = start_key.to_vec();
        loop {
            let batch = self
                .batch_load_regions(bo, &cursor, end_key, DEFAULT_REGIONS_PER_BATCH)
                .await?;
            let Some(last) = batch.last() else {
                break;
            };
            let last_end = last.end_key.clone();
            let covered = last_end.is_empty()
                || (!end_key.is_empty() && last_end.as_slice() >= end_key);
            regions.extend(batch);
            if covered {
                break;
            }
            cursor = last_end;
        }
        Ok(regions)
    }

    /// Builds a descriptor, resolving each peer's store. Peers on tombstone
    /// stores are dropped.
    async fn build_region(&self, info: RegionInfo) -> Result<Arc<Region>> {
        let mut peers = Vec::with_capacity(info.region.peers.len());
        let mut stores = Vec::with_capacity(info.region.peers.len());
        for peer in &info.region.peers {
            let store = self.stores.get_or_insert(peer.store_id);
            match self.init_resolve(&store).await? {
                Some(_) => {
                    peers.push(peer.clone());
                    stores.push(store);
                }
                None => continue,
            }
        }
        if peers.is_empty() {
            return Err(crate::internal_err!(
                "no available peers, region {}",
                info.region.id
            ));
        }
        Ok(Arc::new(Region::new(
            info.region,
            peers,
            stores,
            info.leader.as_ref(),
            info.buckets,
            now_epoch_sec(),
        )))
    }

    // Insertion & invalidation

    pub(crate) fn insert_region(&self, region: Arc<Region>) {
        let mut inner = self.inner_write();
        let new_ver = region.ver_id();

        // The previous version of the same region id may live under a
        // different start key; drop it explicitly.
        let mut stale: Vec<Arc<Region>> = Vec::new();
        if let Some(old_ver) = inner.latest_versions.get(&region.id()) {
            if *old_ver != new_ver {
                if let Some(old) = inner.regions.get(old_ver) {
                    stale.push(old.clone());
                }
            }
        }

        // Remove overlapping entries, scanning backwards from the new end
        // key. Valid entries never overlap, so the scan stops at the first
        // region entirely before the new start key.
        let new_start = region.start_key().to_vec();
        let range = if region.end_key().is_empty() {
            inner.sorted.range::<Vec<u8>, _>(..)
        } else {
            inner.sorted.range(..region.end_key().to_vec())
        };
        for (_, cached) in range.rev() {
            let cached_end = cached.end_key();
            let overlaps = cached_end.is_empty() || cached_end > new_start.as_slice();
            if overlaps {
                stale.push(cached.clone());
            } else {
                break;
            }
        }

        for old in stale {
            if old.id() == region.id() {
                let old_view = old.view();
                // A predecessor that died leaderless taints its work index;
                // start the new incarnation from the next peer over.
                if old.invalid_reason() == InvalidReason::NoLeader {
                    region.seed_work_index(old_view.work_kv_idx + 1);
                }
                // Carry buckets forward unless the new region has newer ones.
                let new_view = region.view();
                let keep_old_buckets = match (&new_view.buckets, &old_view.buckets) {
                    (None, Some(_)) => true,
                    (Some(new_b), Some(old_b)) => new_b.version < old_b.version,
                    _ => false,
                };
                if keep_old_buckets {
                    region.set_buckets(old_view.buckets.clone());
                }
            }
            old.invalidate(InvalidReason::Other);
            let old_ver = old.ver_id();
            inner.sorted.remove(old.start_key());
            inner.regions.remove(&old_ver);
            if inner
                .latest_versions
                .get(&old_ver.id)
                .is_some_and(|v| *v == old_ver)
            {
                inner.latest_versions.remove(&old_ver.id);
            }
        }

        inner.sorted.insert(new_start, region.clone());
        inner.regions.insert(new_ver.clone(), region.clone());
        let update_latest = inner
            .latest_versions
            .get(&new_ver.id)
            .map_or(true, |latest| {
                latest.ver < new_ver.ver || latest.conf_ver < new_ver.conf_ver
            });
        if update_latest {
            inner.latest_versions.insert(new_ver.id, new_ver);
        }
    }

    pub fn invalidate_region(&self, ver_id: &RegionVerId, reason: InvalidReason) {
        if let Some(region) = self.get_cached_region(ver_id) {
            region.invalidate(reason);
        }
    }

    /// Installs a fresher leader for a region, or rotates away from the
    /// reporting peer when the server did not name one.
    pub fn update_leader(
        &self,
        ver_id: &RegionVerId,
        leader: Option<&metapb::Peer>,
        current_idx: AccessIndex,
    ) {
        let Some(region) = self.get_cached_region(ver_id) else {
            return;
        };
        match leader {
            None => {
                region.switch_next_kv_peer(current_idx);
                info!(
                    "switch region {} peer to next, NotLeader with no leader hint",
                    ver_id
                );
            }
            Some(leader) => {
                if !region.switch_work_leader_to_peer(leader) {
                    info!(
                        "invalidate region {}: advertised leader on store {} is not a cached peer",
                        ver_id, leader.store_id
                    );
                    region.invalidate(InvalidReason::StoreNotFound);
                }
            }
        }
    }

    // Grouping

    /// Separates keys into groups by the region containing them. The first
    /// key's region is returned distinguished: it holds the primary and is
    /// committed ahead of the others. Keys must arrive in caller order.
    pub async fn group_keys_by_region(
        &self,
        bo: &mut Backoffer,
        keys: &[Vec<u8>],
    ) -> Result<(HashMap<RegionVerId, Vec<Vec<u8>>>, RegionVerId)> {
        let mut groups: HashMap<RegionVerId, Vec<Vec<u8>>> = HashMap::new();
        let mut first = RegionVerId::default();
        let mut last_loc: Option<KeyLocation> = None;
        for (i, key) in keys.iter().enumerate() {
            let loc = match &last_loc {
                Some(loc) if loc.contains(key) => loc.clone(),
                _ => {
                    let loc = self.locate_key(bo, key).await?;
                    last_loc = Some(loc.clone());
                    loc
                }
            };
            if i == 0 {
                first = loc.region.clone();
            }
            groups.entry(loc.region).or_default().push(key.clone());
        }
        Ok((groups, first))
    }

    // RPC context

    /// Resolves a region version into a replica address. `None` means the
    /// entry is stale or gone and the caller should relocate.
    pub async fn get_rpc_context(
        &self,
        bo: &mut Backoffer,
        ver_id: &RegionVerId,
        selector: &StoreSelector,
        seed: u32,
    ) -> Result<Option<RpcContext>> {
        let Some(region) = self.get_cached_region(ver_id) else {
            return Ok(None);
        };
        if !region.is_valid(now_epoch_sec(), self.ttl_sec) {
            return Ok(None);
        }

        let view = region.view();
        let access_idx = if selector.leader_only {
            view.work_kv_idx
        } else if selector.prefer_follower {
            view.follower(seed, selector)
        } else {
            view.kv_peer(seed, selector)
        };
        let (sidx, store) = view.access_store(AccessMode::Kv, access_idx);
        let store = store.clone();
        let peer = region.kv_peer_at(&view, access_idx).clone();

        let Some(addr) = self.store_addr(bo, &region, &store).await? else {
            // Store gone; the region must be out of date.
            region.invalidate(InvalidReason::StoreNotFound);
            return Ok(None);
        };

        if store.epoch() != view.store_epochs[sidx] {
            // Another request failed on this store; our view is stale.
            info!(
                "invalidate region {}, store {} failed elsewhere",
                ver_id,
                store.id()
            );
            region.invalidate(InvalidReason::Other);
            return Ok(None);
        }

        let mut proxy_store = None;
        let mut proxy_addr = None;
        if self.config.enable_forwarding && store.access_mode() == AccessMode::Kv {
            if store.is_unreachable() {
                if let Some((p_store, _p_idx)) = self.select_proxy_store(&region, &view, access_idx)
                {
                    proxy_addr = self.store_addr(bo, &region, &p_store).await?;
                    if proxy_addr.is_some() {
                        proxy_store = Some(p_store);
                    }
                }
            } else {
                region.set_proxy_idx(None);
            }
        }

        Ok(Some(RpcContext {
            region: ver_id.clone(),
            meta: region.meta().clone(),
            peer,
            access_idx,
            store,
            addr,
            proxy_store,
            proxy_addr,
        }))
    }

    fn select_proxy_store(
        &self,
        region: &Arc<Region>,
        view: &Arc<crate::region::RegionView>,
        work_idx: AccessIndex,
    ) -> Option<(Arc<Store>, AccessIndex)> {
        if let Some(idx) = view.proxy_kv_idx {
            let (_, store) = view.access_store(AccessMode::Kv, idx);
            return Some((store.clone(), idx));
        }
        let n = view.access_store_num(AccessMode::Kv);
        if n <= 1 {
            return None;
        }
        // Randomized start so retries spread over the peers.
        let mut first = rand::random::<usize>() % (n - 1);
        if first >= work_idx {
            first = (first + 1) % n;
        }
        for i in 0..n {
            let idx = (first + i) % n;
            if idx == work_idx {
                continue;
            }
            let (_, store) = view.access_store(AccessMode::Kv, idx);
            if store.is_unreachable() {
                continue;
            }
            region.set_proxy_idx(Some(idx));
            return Some((store.clone(), idx));
        }
        None
    }

    // Failure handling

    /// Handles a transport-level send failure: attributes it to the store
    /// (epoch bump + re-resolve), advances the replica index on the same
    /// view, kicks off the liveness watcher when forwarding applies, and
    /// optionally schedules a reload.
    pub async fn on_send_fail(
        self: &Arc<Self>,
        _bo: &mut Backoffer,
        ctx: &RpcContext,
        schedule_reload: bool,
        err: &Error,
    ) {
        let Some(region) = self.get_cached_region(&ctx.region) else {
            return;
        };
        if region.meta().peers.len() != ctx.meta.peers.len() {
            // Peer set changed under us; the retry path reloads anyway.
            return;
        }

        let view = region.view();
        let (sidx, store) = view.access_store(AccessMode::Kv, ctx.access_idx);
        let store = store.clone();
        if store.bump_epoch_from(view.store_epochs[sidx]) {
            info!("mark store {}'s regions need be refill", store.id());
        }
        store.mark_need_check(&self.notify_check);

        if self.config.enable_forwarding && store.access_mode() == AccessMode::Kv {
            self.start_health_check_loop_if_needed(store.clone());
        }

        region.switch_next_kv_peer(ctx.access_idx);
        warn!(
            "switch region {} peer to next due to send request fail: {}",
            ctx.region, err
        );
        if schedule_reload {
            region.schedule_reload();
        }
    }

    /// Handles `EpochNotMatch`. Returns `true` when the caller should retry
    /// the same region (our epoch was ahead of the server's), `false` when
    /// the region was replaced or invalidated and the caller must relocate.
    pub async fn on_epoch_not_match(
        &self,
        bo: &mut Backoffer,
        ctx: &RpcContext,
        current_regions: Vec<metapb::Region>,
    ) -> Result<bool> {
        if current_regions.is_empty() {
            self.invalidate_region(&ctx.region, InvalidReason::EpochNotMatch);
            return Ok(false);
        }

        // If our epoch is ahead of the server's the server is still catching
        // up; retry the same region after a pause.
        for meta in &current_regions {
            if meta.id == ctx.region.id {
                let epoch = meta.region_epoch.unwrap_or_default();
                if epoch.conf_ver < ctx.region.conf_ver || epoch.version < ctx.region.ver {
                    info!(
                        "region {} epoch is ahead of server ({},{}) < ({},{})",
                        ctx.region.id, epoch.version, epoch.conf_ver, ctx.region.ver, ctx.region.conf_ver
                    );
                    bo.backoff(&BO_REGION_MISS, "client region epoch is ahead of server")
                        .await?;
                    return Ok(true);
                }
            }
        }

        let buckets = self
            .get_cached_region(&ctx.region)
            .and_then(|r| r.view().buckets.clone());

        let mut needs_invalidate_old = true;
        let mut new_regions = Vec::with_capacity(current_regions.len());
        for meta in current_regions {
            // Successors inherit the pre-split buckets; they may be stale
            // and out of range, which locate_bucket tolerates.
            let region = self
                .build_region(RegionInfo {
                    region: meta,
                    leader: None,
                    buckets: buckets.clone(),
                })
                .await?;
            // The replying store usually hosts a peer of every successor;
            // start there, or at the first voter otherwise.
            let seed_peer = region
                .peer_on_store(ctx.store.id())
                .or_else(|| region.peer_on_store(region.electable_store_id()))
                .cloned();
            if let Some(peer) = seed_peer {
                region.switch_work_leader_to_peer(&peer);
            }
            if region.ver_id() == ctx.region {
                needs_invalidate_old = false;
            }
            new_regions.push(region);
        }

        if needs_invalidate_old {
            self.invalidate_region(&ctx.region, InvalidReason::EpochNotMatch);
        }
        for region in new_regions {
            self.insert_region(region);
        }
        Ok(false)
    }

    // Store resolution

    async fn store_addr(
        &self,
        _bo: &mut Backoffer,
        region: &Arc<Region>,
        store: &Arc<Store>,
    ) -> Result<Option<String>> {
        match store.resolve_state() {
            ResolveState::Resolved | ResolveState::NeedCheck => Ok(Some(store.address())),
            ResolveState::Unresolved => self.init_resolve(store).await,
            ResolveState::Deleted => Ok(Some(self.change_to_active_store(region, store))),
            ResolveState::Tombstone => Ok(None),
        }
    }

    /// First-time address resolution, coalesced per store. Returns `None`
    /// for tombstones.
    async fn init_resolve(&self, store: &Arc<Store>) -> Result<Option<String>> {
        let _guard = store.resolve_mutex.lock().await;
        match store.resolve_state() {
            ResolveState::Unresolved => {}
            ResolveState::Tombstone => return Ok(None),
            _ => return Ok(Some(store.address())),
        }
        let Some(meta) = self.pd_client.get_store(store.id()).await? else {
            store.set_resolve_state(ResolveState::Tombstone);
            return Ok(None);
        };
        if meta.address.is_empty() {
            return Err(Error::EmptyStoreAddress {
                store_id: store.id(),
            });
        }
        store.apply_meta(&meta);
        store.change_resolve_state(ResolveState::Unresolved, ResolveState::Resolved);
        Ok(Some(store.address()))
    }

    /// Re-resolves a store flagged `NeedCheck`. Returns false when the store
    /// was deleted or tombstoned and callers must reload.
    async fn re_resolve(&self, store: &Arc<Store>) -> Result<bool> {
        let meta = match self.pd_client.get_store(store.id()).await {
            Ok(meta) => meta,
            Err(e) => {
                error!("re-resolve store {} from PD failed: {}", store.id(), e);
                return Err(e);
            }
        };
        let Some(meta) = meta else {
            info!(
                "invalidate regions in removed store {} ({})",
                store.id(),
                store.address()
            );
            store.bump_epoch_from(store.epoch());
            store.set_resolve_state(ResolveState::Tombstone);
            return Ok(false);
        };

        if store.address() != meta.address || !store.same_labels(&meta.labels) {
            let replacement = Arc::new(Store::from_meta(&meta));
            self.stores.replace(replacement);
            store.set_resolve_state(ResolveState::Deleted);
            return Ok(false);
        }
        store.change_resolve_state(ResolveState::NeedCheck, ResolveState::Resolved);
        Ok(true)
    }

    /// Replaces a deleted store reference in the region's view with the
    /// registry's live object for the same id.
    fn change_to_active_store(&self, region: &Arc<Region>, store: &Arc<Store>) -> String {
        let current = self.stores.get_or_insert(store.id());
        loop {
            let old = region.view();
            let mut stores = Vec::with_capacity(old.stores.len());
            for s in &old.stores {
                if s.id() == current.id() {
                    stores.push(current.clone());
                } else {
                    stores.push(s.clone());
                }
            }
            let new = old.replace_stores(stores);
            if region.compare_and_swap_view(&old, new) {
                break;
            }
        }
        current.address()
    }

    // Liveness

    /// Probes a store's health endpoint. Concurrent probes of one address
    /// are single-flighted.
    pub async fn request_liveness(&self, store: &Store) -> LivenessState {
        let timeout = self.config.store_liveness_timeout;
        if timeout.is_zero() {
            return LivenessState::Unreachable;
        }
        if store.resolve_state() != ResolveState::Resolved {
            return LivenessState::Unknown;
        }
        let addr = store.address();
        self.liveness
            .request(&addr, self.health_probe.as_ref(), timeout)
            .await
    }

    fn start_health_check_loop_if_needed(self: &Arc<Self>, store: Arc<Store>) {
        if store.access_mode() != AccessMode::Kv {
            return;
        }
        if store.set_unreachable() {
            let cache = Arc::downgrade(self);
            let close_rx = self.close_tx.subscribe();
            tokio::spawn(async move {
                check_until_health(cache, store, close_rx).await;
            });
        }
    }

}

impl<PdC: PdClient> Drop for RegionCache<PdC> {
    fn drop(&mut self) {
        let _ = self.close_tx.send(true);
    }
}

/// Sweeps stores needing re-resolution: reacts to the (lossy) notification
/// channel and ticks on the configured interval to refresh labels.
async fn check_and_resolve_loop<PdC: PdClient>(
    cache: std::sync::Weak<RegionCache<PdC>>,
    mut close_rx: watch::Receiver<bool>,
) {
    let (interval, notify) = {
        let Some(cache) = cache.upgrade() else {
            return;
        };
        (cache.config.store_check_interval, cache.notify_check.clone())
    };
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.reset();
    loop {
        let sweep_all = tokio::select! {
            _ = close_rx.changed() => return,
            _ = notify.notified() => false,
            _ = ticker.tick() => true,
        };
        let Some(cache) = cache.upgrade() else {
            return;
        };
        let stores = cache.stores.filter(|s| {
            let state = s.resolve_state();
            if sweep_all {
                state != ResolveState::Unresolved
                    && state != ResolveState::Tombstone
                    && state != ResolveState::Deleted
            } else {
                state == ResolveState::NeedCheck
            }
        });
        for store in stores {
            if let Err(e) = cache.re_resolve(&store).await {
                warn!("background re-resolve of store {} failed: {}", store.id(), e);
            }
        }
    }
}

/// Watches an unreachable store until a probe reports it reachable, checking
/// PD every 30s for a rename or removal. Clears the unreachable flag on exit.
async fn check_until_health<PdC: PdClient>(
    cache: std::sync::Weak<RegionCache<PdC>>,
    store: Arc<Store>,
    mut close_rx: watch::Receiver<bool>,
) {
    let mut last_pd_check = tokio::time::Instant::now();
    loop {
        tokio::select! {
            _ = close_rx.changed() => break,
            _ = tokio::time::sleep(HEALTH_CHECK_TICK) => {}
        }
        let Some(cache) = cache.upgrade() else {
            break;
        };
        if last_pd_check.elapsed() > HEALTH_CHECK_PD_INTERVAL {
            last_pd_check = tokio::time::Instant::now();
            match cache.re_resolve(&store).await {
                Ok(true) => {}
                Ok(false) => {
                    info!(
                        "health check: store {} meta deleted, stop checking",
                        store.id()
                    );
                    break;
                }
                Err(e) => {
                    warn!("health check: re-resolve store {} failed: {}", store.id(), e);
                }
            }
        }
        if cache.request_liveness(&store).await == LivenessState::Reachable {
            info!(
                "health check: store {} became reachable after {:?}",
                store.id(),
                store.unreachable_duration().unwrap_or_default()
            );
            break;
        }
    }
    store.clear_unreachable();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffContext;
    use crate::mock::MockCluster;
    use crate::mock::MockPdClient;
    use crate::region::StoreSelector;

    fn backoffer() -> Backoffer {
        let (ctx, _cancel) = BackoffContext::new();
        Backoffer::new(ctx, 1000)
    }

    fn cache_for(cluster: Arc<MockCluster>) -> Arc<RegionCache<MockPdClient>> {
        RegionCache::new(Arc::new(MockPdClient::new(cluster)), Config::default())
    }

    #[tokio::test]
    async fn locate_key_caches_until_invalidated() {
        let cluster = Arc::new(MockCluster::new(3));
        let cache = cache_for(cluster.clone());
        let mut bo = backoffer();

        let loc = cache.locate_key(&mut bo, b"k").await.unwrap();
        assert!(loc.contains(b"k"));

        // A split at PD is not observed while the cached entry is valid.
        cluster.split(b"m");
        let cached = cache.locate_key(&mut bo, b"k").await.unwrap();
        assert_eq!(cached.region, loc.region);

        cache.invalidate_region(&loc.region, InvalidReason::Other);
        let reloaded = cache.locate_key(&mut bo, b"k").await.unwrap();
        assert_ne!(reloaded.region, loc.region);
        assert_eq!(reloaded.end_key, b"m".to_vec());
    }

    #[tokio::test]
    async fn locate_end_key_flips_boundaries() {
        let cluster = Arc::new(MockCluster::new(3));
        cluster.split(b"m");
        let cache = cache_for(cluster.clone());
        let mut bo = backoffer();

        // As an end key, "m" belongs to the region it closes; as a start
        // key, to the region it opens.
        let left = cache.locate_end_key(&mut bo, b"m").await.unwrap();
        assert_eq!(left.end_key, b"m".to_vec());
        let right = cache.locate_key(&mut bo, b"m").await.unwrap();
        assert_eq!(right.start_key, b"m".to_vec());
        assert_ne!(left.region, right.region);
    }

    #[tokio::test]
    async fn group_keys_distinguishes_first_region() {
        let cluster = Arc::new(MockCluster::new(3));
        cluster.split(b"m");
        let cache = cache_for(cluster.clone());
        let mut bo = backoffer();

        let keys = vec![b"n".to_vec(), b"a".to_vec(), b"b".to_vec()];
        let (groups, first) = cache.group_keys_by_region(&mut bo, &keys).await.unwrap();
        assert_eq!(groups.len(), 2);
        // The first key's region holds the primary.
        let first_loc = cache.locate_key(&mut bo, b"n").await.unwrap();
        assert_eq!(first, first_loc.region);
        assert_eq!(groups[&first], vec![b"n".to_vec()]);
    }

    #[tokio::test]
    async fn epoch_not_match_installs_successor_regions() {
        let cluster = Arc::new(MockCluster::new(3));
        let cache = cache_for(cluster.clone());
        let mut bo = backoffer();

        let stale = cache.locate_key(&mut bo, b"a").await.unwrap();
        let selector = StoreSelector {
            leader_only: true,
            ..Default::default()
        };
        let ctx = cache
            .get_rpc_context(&mut bo, &stale.region, &selector, 0)
            .await
            .unwrap()
            .expect("cached region must resolve");

        cluster.split(b"m");
        let current_regions: Vec<metapb::Region> = cluster
            .scan_region_metas(b"", b"", usize::MAX)
            .into_iter()
            .map(|(region, _)| region)
            .collect();
        assert_eq!(current_regions.len(), 2);

        let retry_same = cache
            .on_epoch_not_match(&mut bo, &ctx, current_regions)
            .await
            .unwrap();
        assert!(!retry_same);

        // Both successors are served from the cache now.
        let left = cache.locate_key(&mut bo, b"a").await.unwrap();
        assert_eq!(left.end_key, b"m".to_vec());
        assert_ne!(left.region, stale.region);
        let right = cache.locate_key(&mut bo, b"x").await.unwrap();
        assert_eq!(right.start_key, b"m".to_vec());
    }

    #[tokio::test]
    async fn no_leader_invalidation_seeds_next_work_index() {
        let cluster = Arc::new(MockCluster::new(3));
        let cache = cache_for(cluster.clone());
        let mut bo = backoffer();

        let loc = cache.locate_key(&mut bo, b"a").await.unwrap();
        let old_idx = cache
            .get_cached_region(&loc.region)
            .unwrap()
            .view()
            .work_kv_idx;

        cache.invalidate_region(&loc.region, InvalidReason::NoLeader);
        let reloaded = cache.locate_key(&mut bo, b"a").await.unwrap();
        let new_idx = cache
            .get_cached_region(&reloaded.region)
            .unwrap()
            .view()
            .work_kv_idx;
        // The fresh incarnation starts from the peer after the dead leader.
        assert_eq!(new_idx, (old_idx + 1) % 3);
    }

    #[tokio::test]
    async fn rpc_context_is_none_for_stale_entries() {
        let cluster = Arc::new(MockCluster::new(3));
        let cache = cache_for(cluster.clone());
        let mut bo = backoffer();
        let selector = StoreSelector {
            leader_only: true,
            ..Default::default()
        };

        let loc = cache.locate_key(&mut bo, b"a").await.unwrap();
        cache.invalidate_region(&loc.region, InvalidReason::Other);
        let ctx = cache
            .get_rpc_context(&mut bo, &loc.region, &selector, 0)
            .await
            .unwrap();
        assert!(ctx.is_none());
    }

    #[tokio::test]
    async fn bucket_location_tolerates_stale_data() {
        let loc = KeyLocation {
            region: RegionVerId::default(),
            start_key: b"a".to_vec(),
            end_key: b"z".to_vec(),
            buckets: Some(metapb::Buckets {
                region_id: 1,
                version: 3,
                keys: vec![b"a".to_vec(), b"h".to_vec(), b"z".to_vec()],
            }),
        };
        assert_eq!(loc.locate_bucket(b"c"), Some((b"a".to_vec(), b"h".to_vec())));
        assert_eq!(loc.locate_bucket(b"h"), Some((b"h".to_vec(), b"z".to_vec())));
        // Out of covered range: bucket data is stale, not authoritative.
        assert_eq!(loc.locate_bucket(b"zz"), None);
        assert_eq!(loc.bucket_version(), 3);
    }
}
