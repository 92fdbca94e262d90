// Copyright 2024 RiftKV Project Authors. Licensed under Apache-2.0.

//! The store registry: one [`Store`] object per store id, created lazily on
//! first peer reference and never removed. An address or label change
//! replaces the object (old one marked [`ResolveState::Deleted`]); removal
//! from the cluster marks it [`ResolveState::Tombstone`].

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;
use std::time::Instant;

use tokio::sync::Notify;

use crate::proto::metapb;
use crate::region::AccessMode;
use crate::region::StoreId;

const ENGINE_LABEL_KEY: &str = "engine";
const ENGINE_LABEL_ANALYTICS: &str = "analytics";

/// The resolve-state machine of a store's address.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u64)]
pub enum ResolveState {
    /// Just created; the address is resolved on first use.
    Unresolved = 0,
    /// Address is valid.
    Resolved = 1,
    /// A request failed on this store; the background loop re-resolves it.
    NeedCheck = 2,
    /// Address or labels changed; the registry holds a replacement object.
    Deleted = 3,
    /// Removed from the cluster; regions referencing it must reload.
    Tombstone = 4,
}

impl From<u64> for ResolveState {
    fn from(value: u64) -> Self {
        match value {
            0 => ResolveState::Unresolved,
            1 => ResolveState::Resolved,
            2 => ResolveState::NeedCheck,
            3 => ResolveState::Deleted,
            _ => ResolveState::Tombstone,
        }
    }
}

/// A store node. Identity (`id`) is stable; address, labels and kind can all
/// change behind it.
pub struct Store {
    id: StoreId,
    state: AtomicU64,
    addr: RwLock<String>,
    status_addr: RwLock<String>,
    labels: RwLock<Vec<metapb::StoreLabel>>,
    kind: AtomicI32,
    /// Fail epoch. Bumped when a send failure is attributed to this store;
    /// region views holding an older snapshot reload on next access.
    epoch: AtomicU32,
    /// Set while a health-check loop runs for this store. Requests to it are
    /// forwarded through a proxy peer when forwarding is enabled.
    unreachable: AtomicBool,
    unreachable_since: Mutex<Option<Instant>>,
    /// Coalesces concurrent first-time resolutions.
    pub(crate) resolve_mutex: tokio::sync::Mutex<()>,
}

impl Store {
    pub(crate) fn unresolved(id: StoreId) -> Store {
        Store {
            id,
            state: AtomicU64::new(ResolveState::Unresolved as u64),
            addr: RwLock::new(String::new()),
            status_addr: RwLock::new(String::new()),
            labels: RwLock::new(Vec::new()),
            kind: AtomicI32::new(AccessMode::Kv as i32),
            epoch: AtomicU32::new(0),
            unreachable: AtomicBool::new(false),
            unreachable_since: Mutex::new(None),
            resolve_mutex: tokio::sync::Mutex::new(()),
        }
    }

    /// A resolved store, for construction from a fresh PD record or tests.
    pub fn with_address(id: StoreId, addr: String) -> Store {
        let store = Store::unresolved(id);
        store.set_resolve_state(ResolveState::Resolved);
        *store.addr.write().unwrap_or_else(|e| e.into_inner()) = addr;
        store
    }

    pub(crate) fn from_meta(meta: &metapb::Store) -> Store {
        let store = Store::unresolved(meta.id);
        store.apply_meta(meta);
        store.set_resolve_state(ResolveState::Resolved);
        store
    }

    pub(crate) fn apply_meta(&self, meta: &metapb::Store) {
        *self.addr.write().unwrap_or_else(|e| e.into_inner()) = meta.address.clone();
        *self.status_addr.write().unwrap_or_else(|e| e.into_inner()) =
            meta.status_address.clone();
        *self.labels.write().unwrap_or_else(|e| e.into_inner()) = meta.labels.clone();
        self.kind
            .store(access_mode_of(&meta.labels) as i32, Ordering::Relaxed);
    }

    pub fn id(&self) -> StoreId {
        self.id
    }

    pub fn address(&self) -> String {
        self.addr.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn labels(&self) -> Vec<metapb::StoreLabel> {
        self.labels
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn access_mode(&self) -> AccessMode {
        if self.kind.load(Ordering::Relaxed) == AccessMode::Analytics as i32 {
            AccessMode::Analytics
        } else {
            AccessMode::Kv
        }
    }

    pub fn epoch(&self) -> u32 {
        self.epoch.load(Ordering::Relaxed)
    }

    /// Bumps the fail epoch if it still equals `seen`, invalidating every
    /// region view that snapshotted it. Returns whether this call did the
    /// bump (losers raced another failure report).
    pub(crate) fn bump_epoch_from(&self, seen: u32) -> bool {
        self.epoch
            .compare_exchange(seen, seen + 1, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    pub fn resolve_state(&self) -> ResolveState {
        self.state.load(Ordering::Relaxed).into()
    }

    pub(crate) fn set_resolve_state(&self, state: ResolveState) {
        self.state.store(state as u64, Ordering::Relaxed);
    }

    /// Moves the state from `from` to `to`. Returns true when the state ends
    /// up at `to`, no matter who moved it.
    pub(crate) fn change_resolve_state(&self, from: ResolveState, to: ResolveState) -> bool {
        loop {
            let state = self.resolve_state();
            if state == to {
                return true;
            }
            if state != from {
                return false;
            }
            if self
                .state
                .compare_exchange(
                    from as u64,
                    to as u64,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Flags the store for background re-resolution. The notification channel
    /// is lossy: a pending signal is enough for the loop to sweep all stores.
    pub(crate) fn mark_need_check(&self, notify: &Notify) {
        if self.change_resolve_state(ResolveState::Resolved, ResolveState::NeedCheck) {
            notify.notify_one();
        }
    }

    pub fn is_unreachable(&self) -> bool {
        self.unreachable.load(Ordering::Relaxed)
    }

    /// Sets the unreachable flag; returns true when this call owns the
    /// transition (and therefore the health-check loop).
    pub(crate) fn set_unreachable(&self) -> bool {
        if self
            .unreachable
            .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            *self
                .unreachable_since
                .lock()
                .unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
            true
        } else {
            false
        }
    }

    pub(crate) fn clear_unreachable(&self) {
        self.unreachable.store(false, Ordering::Relaxed);
    }

    /// How long the store has been unreachable, when it is.
    pub(crate) fn unreachable_duration(&self) -> Option<std::time::Duration> {
        if !self.is_unreachable() {
            return None;
        }
        self.unreachable_since
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .map(|since| since.elapsed())
    }

    /// Whether every target label matches one of the store's labels. An
    /// empty target always matches.
    pub fn labels_match(&self, target: &[metapb::StoreLabel]) -> bool {
        if target.is_empty() {
            return true;
        }
        let labels = self.labels.read().unwrap_or_else(|e| e.into_inner());
        target
            .iter()
            .all(|t| labels.iter().any(|l| l.key == t.key && l.value == t.value))
    }

    /// Whether the store's labels are exactly `other` (orderless).
    pub(crate) fn same_labels(&self, other: &[metapb::StoreLabel]) -> bool {
        let labels = self.labels.read().unwrap_or_else(|e| e.into_inner());
        labels.len() == other.len()
            && other
                .iter()
                .all(|t| labels.iter().any(|l| l.key == t.key && l.value == t.value))
    }
}

pub(crate) fn access_mode_of(labels: &[metapb::StoreLabel]) -> AccessMode {
    let analytics = labels
        .iter()
        .any(|l| l.key == ENGINE_LABEL_KEY && l.value == ENGINE_LABEL_ANALYTICS);
    if analytics {
        AccessMode::Analytics
    } else {
        AccessMode::Kv
    }
}

/// The registry map. Entries are only ever replaced, never removed, so a
/// stale `Arc<Store>` can always be routed to the live object by id.
#[derive(Default)]
pub(crate) struct StoreMap {
    stores: RwLock<HashMap<StoreId, Arc<Store>>>,
}

impl StoreMap {
    pub(crate) fn get_or_insert(&self, id: StoreId) -> Arc<Store> {
        if let Some(store) = self
            .stores
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
        {
            return store.clone();
        }
        let mut stores = self.stores.write().unwrap_or_else(|e| e.into_inner());
        stores
            .entry(id)
            .or_insert_with(|| Arc::new(Store::unresolved(id)))
            .clone()
    }

    pub(crate) fn replace(&self, store: Arc<Store>) {
        self.stores
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(store.id(), store);
    }

    pub(crate) fn filter(&self, pred: impl Fn(&Store) -> bool) -> Vec<Arc<Store>> {
        self.stores
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|s| pred(s))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_state_transitions() {
        let store = Store::unresolved(1);
        assert_eq!(store.resolve_state(), ResolveState::Unresolved);

        assert!(store.change_resolve_state(ResolveState::Unresolved, ResolveState::Resolved));
        assert_eq!(store.resolve_state(), ResolveState::Resolved);

        // Already at the target: reports success.
        assert!(store.change_resolve_state(ResolveState::NeedCheck, ResolveState::Resolved));

        assert!(store.change_resolve_state(ResolveState::Resolved, ResolveState::NeedCheck));
        assert!(!store.change_resolve_state(ResolveState::Resolved, ResolveState::Tombstone));
        assert_eq!(store.resolve_state(), ResolveState::NeedCheck);
    }

    #[test]
    fn epoch_bump_is_once_per_observation() {
        let store = Store::unresolved(1);
        assert!(store.bump_epoch_from(0));
        // A second report that saw the same epoch loses the race.
        assert!(!store.bump_epoch_from(0));
        assert_eq!(store.epoch(), 1);
    }

    #[test]
    fn label_matching() {
        let store = Store::unresolved(1);
        store.apply_meta(&metapb::Store {
            id: 1,
            address: "s1".to_owned(),
            status_address: String::new(),
            state: metapb::StoreState::Up as i32,
            labels: vec![
                metapb::StoreLabel {
                    key: "zone".to_owned(),
                    value: "eu-1".to_owned(),
                },
                metapb::StoreLabel {
                    key: "disk".to_owned(),
                    value: "ssd".to_owned(),
                },
            ],
        });

        assert!(store.labels_match(&[]));
        assert!(store.labels_match(&[metapb::StoreLabel {
            key: "zone".to_owned(),
            value: "eu-1".to_owned(),
        }]));
        assert!(!store.labels_match(&[metapb::StoreLabel {
            key: "zone".to_owned(),
            value: "eu-2".to_owned(),
        }]));
        assert!(!store.same_labels(&[metapb::StoreLabel {
            key: "zone".to_owned(),
            value: "eu-1".to_owned(),
        }]));
    }

    #[test]
    fn analytics_kind_from_labels() {
        let labels = vec![metapb::StoreLabel {
            key: ENGINE_LABEL_KEY.to_owned(),
            value: ENGINE_LABEL_ANALYTICS.to_owned(),
        }];
        assert_eq!(access_mode_of(&labels), AccessMode::Analytics);
        assert_eq!(access_mode_of(&[]), AccessMode::Kv);
    }

    #[test]
    fn unreachable_flag_owned_by_first_setter() {
        let store = Store::unresolved(1);
        assert!(store.set_unreachable());
        assert!(!store.set_unreachable());
        store.clear_unreachable();
        assert!(store.set_unreachable());
    }
}
