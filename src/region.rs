// Copyright 2024 RiftKV Project Authors. Licensed under Apache-2.0.

//! The region descriptor: immutable routing meta plus a swappable view of
//! replica state.
//!
//! A [`Region`] is shared (`Arc`) between the cache and any number of
//! in-flight requests. Its meta never changes after construction; everything
//! that can change while requests are in flight (work replica, forwarding
//! proxy, store epoch snapshots) lives in a [`RegionView`] published through
//! a compare-and-swap handle, so routing updates never block readers.

use std::fmt;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::RwLock;

use crate::proto::metapb;
use crate::store::Store;

pub type RegionId = u64;
pub type StoreId = u64;

/// The unique identifier of a region *across time*: regions with the same id
/// but different epochs are different routing entities.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct RegionVerId {
    pub id: RegionId,
    pub conf_ver: u64,
    pub ver: u64,
}

impl fmt::Display for RegionVerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}, {})", self.id, self.ver, self.conf_ver)
    }
}

/// Why a cached region was invalidated. The cache takes different strategies
/// per reason, e.g. `NoLeader` makes the next incarnation start from a
/// different peer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(i32)]
pub enum InvalidReason {
    Ok = 0,
    NoLeader = 1,
    NotFound = 2,
    EpochNotMatch = 3,
    StoreNotFound = 4,
    Other = 5,
}

impl From<i32> for InvalidReason {
    fn from(value: i32) -> Self {
        match value {
            0 => InvalidReason::Ok,
            1 => InvalidReason::NoLeader,
            2 => InvalidReason::NotFound,
            3 => InvalidReason::EpochNotMatch,
            4 => InvalidReason::StoreNotFound,
            _ => InvalidReason::Other,
        }
    }
}

/// Which replica class a request may be served by.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AccessMode {
    Kv = 0,
    Analytics = 1,
}

const NUM_ACCESS_MODES: usize = 2;

/// Index into a view's per-mode access array, *not* into the peer list.
pub type AccessIndex = usize;

/// Label filters and routing directives for replica selection.
/// `leader_only` collapses the other preferences.
#[derive(Clone, Debug, Default)]
pub struct StoreSelector {
    pub labels: Vec<metapb::StoreLabel>,
    pub leader_only: bool,
    /// Prefer a non-leader voter (read offload); falls back to the leader
    /// when no follower qualifies.
    pub prefer_follower: bool,
}

const INVALIDATED_LAST_ACCESS: i64 = -1;

const SYNC_UPDATED: i32 = 0;
const SYNC_NEEDED: i32 = 1;

/// An immutable snapshot of a region's replica routing state.
pub struct RegionView {
    /// Stores of `Region::peers`, in the same order.
    pub(crate) stores: Vec<Arc<Store>>,
    /// Snapshot of each store's fail epoch at view construction. A live
    /// epoch ahead of the snapshot means the peer's routing data is stale.
    pub(crate) store_epochs: Vec<u32>,
    /// Per access mode: access index -> index into `stores`.
    access_index: [Vec<usize>; NUM_ACCESS_MODES],
    /// Access index of the current preferred KV replica (normally the
    /// leader).
    pub(crate) work_kv_idx: AccessIndex,
    /// Access index of the peer that forwards to an unreachable leader.
    pub(crate) proxy_kv_idx: Option<AccessIndex>,
    /// Advisory bucket split keys; may be stale.
    pub(crate) buckets: Option<metapb::Buckets>,
}

impl RegionView {
    pub(crate) fn access_store(&self, mode: AccessMode, idx: AccessIndex) -> (usize, &Arc<Store>) {
        let sidx = self.access_index[mode as usize][idx];
        (sidx, &self.stores[sidx])
    }

    pub(crate) fn access_store_num(&self, mode: AccessMode) -> usize {
        self.access_index[mode as usize].len()
    }

    /// A copy of this view with the store list swapped, for routing a
    /// deleted store reference to its replacement object.
    pub(crate) fn replace_stores(&self, stores: Vec<Arc<Store>>) -> RegionView {
        let mut new = self.clone_view();
        new.stores = stores;
        new
    }

    fn clone_view(&self) -> RegionView {
        RegionView {
            stores: self.stores.clone(),
            store_epochs: self.store_epochs.clone(),
            access_index: self.access_index.clone(),
            work_kv_idx: self.work_kv_idx,
            proxy_kv_idx: self.proxy_kv_idx,
            buckets: self.buckets.clone(),
        }
    }

    /// Deterministically selects a non-leader voter passing the label
    /// filters, or falls back to the work index if none qualifies.
    pub(crate) fn follower(&self, seed: u32, op: &StoreSelector) -> AccessIndex {
        let n = self.access_store_num(AccessMode::Kv) as u32;
        if n <= 1 {
            return self.work_kv_idx;
        }
        let mut seed = seed;
        for _ in 1..n {
            let mut follower_idx = (seed % (n - 1)) as AccessIndex;
            if follower_idx >= self.work_kv_idx {
                follower_idx += 1;
            }
            let (sidx, store) = self.access_store(AccessMode::Kv, follower_idx);
            if self.store_epochs[sidx] == store.epoch() && self.candidate_matches(follower_idx, op)
            {
                return follower_idx;
            }
            seed += 1;
        }
        self.work_kv_idx
    }

    /// Selects any valid candidate (leader included), or the work index when
    /// none qualifies.
    pub(crate) fn kv_peer(&self, seed: u32, op: &StoreSelector) -> AccessIndex {
        if op.leader_only {
            return self.work_kv_idx;
        }
        let mut candidates = Vec::with_capacity(self.access_store_num(AccessMode::Kv));
        for aidx in 0..self.access_store_num(AccessMode::Kv) {
            let (sidx, store) = self.access_store(AccessMode::Kv, aidx);
            if self.store_epochs[sidx] == store.epoch() && self.candidate_matches(aidx, op) {
                candidates.push(aidx);
            }
        }
        if candidates.is_empty() {
            return self.work_kv_idx;
        }
        candidates[seed as usize % candidates.len()]
    }

    fn candidate_matches(&self, aidx: AccessIndex, op: &StoreSelector) -> bool {
        let (_, store) = self.access_store(AccessMode::Kv, aidx);
        store.labels_match(&op.labels)
    }
}

/// A region descriptor shared between the cache and in-flight requests.
pub struct Region {
    meta: metapb::Region,
    view: RwLock<Arc<RegionView>>,
    /// Epoch seconds of the last cache access; `-1` once invalidated.
    last_access: AtomicI64,
    sync_flag: AtomicI32,
    invalid_reason: AtomicI32,
}

impl Region {
    /// Builds a descriptor from resolved peers. `peers`, `stores` and
    /// `store_epochs` run parallel and contain only peers on live stores.
    pub(crate) fn new(
        mut meta: metapb::Region,
        peers: Vec<metapb::Peer>,
        stores: Vec<Arc<Store>>,
        leader: Option<&metapb::Peer>,
        buckets: Option<metapb::Buckets>,
        now_epoch_sec: i64,
    ) -> Region {
        let mut access_index: [Vec<usize>; NUM_ACCESS_MODES] = Default::default();
        let mut work_kv_idx = 0;
        for (sidx, store) in stores.iter().enumerate() {
            let mode = store.access_mode();
            if mode == AccessMode::Kv {
                if let Some(leader) = leader {
                    if peers[sidx].id == leader.id && peers[sidx].store_id == leader.store_id {
                        work_kv_idx = access_index[AccessMode::Kv as usize].len();
                    }
                }
            }
            access_index[mode as usize].push(sidx);
        }
        let store_epochs = stores.iter().map(|s| s.epoch()).collect();
        meta.peers = peers;
        Region {
            meta,
            view: RwLock::new(Arc::new(RegionView {
                stores,
                store_epochs,
                access_index,
                work_kv_idx,
                proxy_kv_idx: None,
                buckets,
            })),
            last_access: AtomicI64::new(now_epoch_sec),
            sync_flag: AtomicI32::new(SYNC_UPDATED),
            invalid_reason: AtomicI32::new(InvalidReason::Ok as i32),
        }
    }

    pub fn meta(&self) -> &metapb::Region {
        &self.meta
    }

    pub fn id(&self) -> RegionId {
        self.meta.id
    }

    pub fn start_key(&self) -> &[u8] {
        &self.meta.start_key
    }

    pub fn end_key(&self) -> &[u8] {
        &self.meta.end_key
    }

    pub fn ver_id(&self) -> RegionVerId {
        let epoch = self.meta.region_epoch.unwrap_or_default();
        RegionVerId {
            id: self.meta.id,
            conf_ver: epoch.conf_ver,
            ver: epoch.version,
        }
    }

    /// start_key <= key < end_key; an empty end key is +inf.
    pub fn contains(&self, key: &[u8]) -> bool {
        contains(&self.meta.start_key, &self.meta.end_key, key)
    }

    /// start_key < key <= end_key, for locating by a range's end key.
    pub fn contains_by_end(&self, key: &[u8]) -> bool {
        self.meta.start_key.as_slice() < key
            && (key <= self.meta.end_key.as_slice() || self.meta.end_key.is_empty())
    }

    pub(crate) fn view(&self) -> Arc<RegionView> {
        self.view
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Publishes `new` if the current view is still `old`. Losers reload the
    /// view and retry their mutation against it.
    pub(crate) fn compare_and_swap_view(&self, old: &Arc<RegionView>, new: RegionView) -> bool {
        let mut guard = self.view.write().unwrap_or_else(|e| e.into_inner());
        if Arc::ptr_eq(&guard, old) {
            *guard = Arc::new(new);
            true
        } else {
            false
        }
    }

    /// Refreshes the access time; returns false once the entry has idled
    /// past `ttl_sec` (or was invalidated).
    pub(crate) fn check_cache_ttl(&self, now_epoch_sec: i64, ttl_sec: i64) -> bool {
        fail::fail_point!("invalidate-region-cache", |_| {
            self.invalidate(InvalidReason::Other);
            false
        });
        loop {
            let last = self.last_access.load(Ordering::Relaxed);
            if now_epoch_sec - last > ttl_sec {
                return false;
            }
            if self
                .last_access
                .compare_exchange(last, now_epoch_sec, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }

    pub(crate) fn invalidate(&self, reason: InvalidReason) {
        self.invalid_reason.store(reason as i32, Ordering::Relaxed);
        self.last_access
            .store(INVALIDATED_LAST_ACCESS, Ordering::Relaxed);
    }

    pub(crate) fn invalid_reason(&self) -> InvalidReason {
        self.invalid_reason.load(Ordering::Relaxed).into()
    }

    /// Requests a reload on the next locate of this region.
    pub(crate) fn schedule_reload(&self) {
        let old = self.sync_flag.load(Ordering::Relaxed);
        if old != SYNC_UPDATED {
            return;
        }
        let _ = self
            .sync_flag
            .compare_exchange(old, SYNC_NEEDED, Ordering::Relaxed, Ordering::Relaxed);
    }

    /// Returns whether a reload is due, marking the region refreshed if so.
    pub(crate) fn check_need_reload_and_mark_updated(&self) -> bool {
        let old = self.sync_flag.load(Ordering::Relaxed);
        if old == SYNC_UPDATED {
            return false;
        }
        self.sync_flag
            .compare_exchange(old, SYNC_UPDATED, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    pub(crate) fn needs_reload(&self) -> bool {
        self.sync_flag.load(Ordering::Relaxed) != SYNC_UPDATED
    }

    pub(crate) fn is_valid(&self, now_epoch_sec: i64, ttl_sec: i64) -> bool {
        !self.needs_reload() && self.check_cache_ttl(now_epoch_sec, ttl_sec)
    }

    pub(crate) fn peer_on_store(&self, store_id: StoreId) -> Option<&metapb::Peer> {
        self.meta.peers.iter().find(|p| p.store_id == store_id)
    }

    /// The store id of the first voter peer; 0 when the region has none.
    pub(crate) fn electable_store_id(&self) -> StoreId {
        self.meta
            .peers
            .iter()
            .find(|p| !p.is_learner())
            .map(|p| p.store_id)
            .unwrap_or(0)
    }

    /// The peer at a view's KV access index.
    pub(crate) fn kv_peer_at(&self, view: &RegionView, aidx: AccessIndex) -> &metapb::Peer {
        let (sidx, _) = view.access_store(AccessMode::Kv, aidx);
        &self.meta.peers[sidx]
    }

    /// Moves the work index to the peer's store. Returns false when the peer
    /// is not part of this region.
    pub(crate) fn switch_work_leader_to_peer(&self, peer: &metapb::Peer) -> bool {
        let Some(target_sidx) = self
            .meta
            .peers
            .iter()
            .position(|p| p.id == peer.id && p.store_id == peer.store_id)
        else {
            return false;
        };
        loop {
            let old = self.view();
            let Some(leader_idx) = old.access_index[AccessMode::Kv as usize]
                .iter()
                .position(|sidx| *sidx == target_sidx)
            else {
                return false;
            };
            if old.work_kv_idx == leader_idx {
                return true;
            }
            let mut new = old.clone_view();
            new.work_kv_idx = leader_idx;
            if self.compare_and_swap_view(&old, new) {
                return true;
            }
        }
    }

    /// Rotates the work index past `current_idx`. A no-op when another
    /// failover has already moved it.
    pub(crate) fn switch_next_kv_peer(&self, current_idx: AccessIndex) {
        loop {
            let old = self.view();
            if old.work_kv_idx != current_idx {
                return;
            }
            let next = (current_idx + 1) % old.access_store_num(AccessMode::Kv).max(1);
            let mut new = old.clone_view();
            new.work_kv_idx = next;
            if self.compare_and_swap_view(&old, new) {
                return;
            }
        }
    }

    pub(crate) fn set_proxy_idx(&self, idx: Option<AccessIndex>) {
        loop {
            let old = self.view();
            if old.proxy_kv_idx == idx {
                return;
            }
            let mut new = old.clone_view();
            new.proxy_kv_idx = idx;
            if self.compare_and_swap_view(&old, new) {
                return;
            }
        }
    }

    /// Seeds the work index of a fresh incarnation, used when the previous
    /// one was invalidated for lack of a leader.
    pub(crate) fn seed_work_index(&self, work_kv_idx: AccessIndex) {
        loop {
            let old = self.view();
            let n = old.access_store_num(AccessMode::Kv);
            if n == 0 {
                return;
            }
            let mut new = old.clone_view();
            new.work_kv_idx = work_kv_idx % n;
            if self.compare_and_swap_view(&old, new) {
                return;
            }
        }
    }

    pub(crate) fn set_buckets(&self, buckets: Option<metapb::Buckets>) {
        loop {
            let old = self.view();
            let mut new = old.clone_view();
            new.buckets = buckets.clone();
            if self.compare_and_swap_view(&old, new) {
                return;
            }
        }
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("ver_id", &self.ver_id())
            .field("start_key", &self.meta.start_key)
            .field("end_key", &self.meta.end_key)
            .finish()
    }
}

/// start_key <= key < end_key, empty end_key meaning +inf.
pub(crate) fn contains(start_key: &[u8], end_key: &[u8], key: &[u8]) -> bool {
    start_key <= key && (key < end_key || end_key.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: u64, store_id: u64) -> metapb::Peer {
        metapb::Peer {
            id,
            store_id,
            role: metapb::PeerRole::Voter as i32,
        }
    }

    fn region_with_three_peers() -> Region {
        let meta = metapb::Region {
            id: 7,
            start_key: b"a".to_vec(),
            end_key: b"m".to_vec(),
            region_epoch: Some(metapb::RegionEpoch {
                conf_ver: 2,
                version: 5,
            }),
            peers: vec![],
        };
        let peers = vec![peer(71, 1), peer(72, 2), peer(73, 3)];
        let stores = peers
            .iter()
            .map(|p| Arc::new(Store::with_address(p.store_id, format!("s{}", p.store_id))))
            .collect();
        let leader = peers[1].clone();
        Region::new(meta, peers, stores, Some(&leader), None, 0)
    }

    #[test]
    fn ver_id_reflects_epoch() {
        let region = region_with_three_peers();
        let ver_id = region.ver_id();
        assert_eq!(ver_id.id, 7);
        assert_eq!(ver_id.conf_ver, 2);
        assert_eq!(ver_id.ver, 5);
    }

    #[test]
    fn contains_respects_empty_end_key() {
        let region = region_with_three_peers();
        assert!(region.contains(b"a"));
        assert!(region.contains(b"ab"));
        assert!(!region.contains(b"m"));
        assert!(!region.contains(b"0"));
        assert!(!region.contains_by_end(b"a"));
        assert!(region.contains_by_end(b"m"));
    }

    #[test]
    fn leader_switch_and_rotation() {
        let region = region_with_three_peers();
        assert_eq!(region.view().work_kv_idx, 1);

        assert!(region.switch_work_leader_to_peer(&peer(73, 3)));
        assert_eq!(region.view().work_kv_idx, 2);

        // Rotation from a stale index is a no-op.
        region.switch_next_kv_peer(0);
        assert_eq!(region.view().work_kv_idx, 2);

        region.switch_next_kv_peer(2);
        assert_eq!(region.view().work_kv_idx, 0);

        assert!(!region.switch_work_leader_to_peer(&peer(99, 9)));
    }

    #[test]
    fn follower_skips_work_index() {
        let region = region_with_three_peers();
        let view = region.view();
        let op = StoreSelector::default();
        for seed in 0..6 {
            let idx = view.follower(seed, &op);
            assert_ne!(idx, view.work_kv_idx);
        }
    }

    #[test]
    fn kv_peer_respects_leader_only() {
        let region = region_with_three_peers();
        let view = region.view();
        let op = StoreSelector {
            leader_only: true,
            ..Default::default()
        };
        assert_eq!(view.kv_peer(42, &op), view.work_kv_idx);
    }

    #[test]
    fn ttl_expiry_and_invalidation() {
        let region = region_with_three_peers();
        assert!(region.check_cache_ttl(10, 600));
        assert!(!region.check_cache_ttl(1000, 600));

        let region = region_with_three_peers();
        region.invalidate(InvalidReason::NoLeader);
        assert_eq!(region.invalid_reason(), InvalidReason::NoLeader);
        assert!(!region.check_cache_ttl(0, 600));
    }

    #[test]
    fn reload_flag_round_trip() {
        let region = region_with_three_peers();
        assert!(!region.needs_reload());
        region.schedule_reload();
        assert!(region.needs_reload());
        assert!(region.check_need_reload_and_mark_updated());
        assert!(!region.needs_reload());
    }
}
