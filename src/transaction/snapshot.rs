// Copyright 2024 RiftKV Project Authors. Licensed under Apache-2.0.

use log::debug;

use crate::pd::PdClient;
use crate::store::KvConnect;
use crate::transaction::Transaction;
use crate::BoundRange;
use crate::Key;
use crate::KvPair;
use crate::Result;
use crate::Value;

/// A read-only view of the cluster at one timestamp.
///
/// A snapshot is a thin wrapper over a read-only transaction: it never
/// writes, needs no commit or rollback, and may outlive any number of
/// concurrent writers.
pub struct Snapshot<PdC: PdClient, Cn: KvConnect> {
    transaction: Transaction<PdC, Cn>,
}

impl<PdC: PdClient, Cn: KvConnect> Snapshot<PdC, Cn> {
    pub(crate) fn new(transaction: Transaction<PdC, Cn>) -> Snapshot<PdC, Cn> {
        Snapshot { transaction }
    }

    /// Gets the value associated with the given key.
    pub async fn get(&mut self, key: impl Into<Key>) -> Result<Option<Value>> {
        debug!("invoking get request on snapshot");
        self.transaction.get(key).await
    }

    pub async fn key_exists(&mut self, key: impl Into<Key>) -> Result<bool> {
        debug!("invoking key_exists request on snapshot");
        self.transaction.key_exists(key).await
    }

    pub async fn batch_get(
        &mut self,
        keys: impl IntoIterator<Item = impl Into<Key>>,
    ) -> Result<Vec<KvPair>> {
        debug!("invoking batch_get request on snapshot");
        self.transaction.batch_get(keys).await
    }

    pub async fn scan(&mut self, range: impl Into<BoundRange>, limit: u32) -> Result<Vec<KvPair>> {
        debug!("invoking scan request on snapshot");
        self.transaction.scan(range, limit).await
    }

    pub async fn scan_reverse(
        &mut self,
        range: impl Into<BoundRange>,
        limit: u32,
    ) -> Result<Vec<KvPair>> {
        debug!("invoking scan_reverse request on snapshot");
        self.transaction.scan_reverse(range, limit).await
    }
}
