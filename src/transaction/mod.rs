// Copyright 2024 RiftKV Project Authors. Licensed under Apache-2.0.

mod client;
mod committer;
mod lock_resolver;
mod requests;
mod snapshot;
#[allow(clippy::module_inception)]
mod transaction;

pub use client::Client;
pub use snapshot::Snapshot;
pub use transaction::CheckLevel;
pub use transaction::Transaction;
pub use transaction::TransactionKind;
pub use transaction::TransactionOptions;

pub(crate) use committer::Committer;
pub(crate) use committer::TtlManager;
pub(crate) use lock_resolver::resolve_locks;
pub(crate) use lock_resolver::ResolvedCache;

use std::sync::Arc;
use std::time::Duration;

use crate::backoff::Backoffer;
use crate::backoff::BO_REGION_MISS;
use crate::pd::PdClient;
use crate::proto::pdpb::Timestamp;
use crate::region_cache::RegionCache;
use crate::request::is_fake_region_error;
use crate::request::HasRegionError;
use crate::request::RegionRequestSender;
use crate::request::SendOutcome;
use crate::store::KvClientCache;
use crate::store::KvConnect;
use crate::store::Request;
use crate::Result;

/// Initial TTL of a transaction's locks.
pub(crate) const DEFAULT_LOCK_TTL: u64 = 3_000;
/// TTL granted to locks kept alive by the heartbeat task.
pub(crate) const MANAGED_LOCK_TTL: u64 = 20_000;
/// Upper bound on any lock TTL.
pub(crate) const MAX_TTL: u64 = 120_000;
/// Scales lock TTL with the square root of the transaction's size in MiB.
pub(crate) const TTL_FACTOR: f64 = 6_000.0;
/// Transactions above this many bytes keep their primary lock alive with
/// heartbeats instead of relying on the initial TTL.
pub(crate) const TTL_REFRESHED_TXN_SIZE: u64 = 32 * 1024 * 1024;
/// Per-region batches are capped at this many bytes of mutations.
pub(crate) const TXN_COMMIT_BATCH_SIZE: u64 = 16 * 1024;
/// Maximum concurrently in-flight batches of one committer.
pub(crate) const COMMITTER_CONCURRENCY: usize = 128;
/// Slack added to `max_commit_ts` for async commit and 1PC.
pub(crate) const MAX_COMMIT_TS_SAFE_WINDOW_MS: u64 = 2_000;

/// The shared machinery a transaction drives: PD, the region cache, the
/// per-address client cache and the resolved-transaction status cache.
pub struct TxnStore<PdC: PdClient, Cn: KvConnect> {
    pub(crate) pd: Arc<PdC>,
    pub(crate) cache: Arc<RegionCache<PdC>>,
    pub(crate) clients: Arc<KvClientCache<Cn>>,
    pub(crate) resolved: ResolvedCache,
}

impl<PdC: PdClient, Cn: KvConnect> TxnStore<PdC, Cn> {
    pub(crate) fn new(pd: Arc<PdC>, cache: Arc<RegionCache<PdC>>, connector: Cn) -> Self {
        TxnStore {
            pd,
            cache,
            clients: Arc::new(KvClientCache::new(connector)),
            resolved: ResolvedCache::default(),
        }
    }

    pub(crate) fn sender(&self) -> RegionRequestSender<PdC, Cn> {
        RegionRequestSender::new(self.cache.clone(), self.clients.clone())
    }

    pub(crate) async fn current_timestamp(&self) -> Result<Timestamp> {
        self.pd.get_timestamp().await
    }

    /// Sends a single-key request, relocating on region errors until it is
    /// evaluated. The caller still handles key errors in the body.
    pub(crate) async fn send_to_key<Req, Resp>(
        &self,
        bo: &mut Backoffer,
        req: &mut Req,
        key: &[u8],
        timeout: Duration,
    ) -> Result<Resp>
    where
        Req: Request + Clone,
        Resp: HasRegionError + std::any::Any,
    {
        loop {
            let loc = self.cache.locate_key(bo, key).await?;
            let mut sender = self.sender();
            match sender.send::<Req, Resp>(bo, req, loc.region, timeout).await? {
                SendOutcome::Response(resp) => return Ok(resp),
                SendOutcome::RegionError(e) => {
                    if e.epoch_not_match.is_none() || is_fake_region_error(&e) {
                        bo.backoff(&BO_REGION_MISS, format!("{e:?}")).await?;
                    }
                }
            }
        }
    }
}
