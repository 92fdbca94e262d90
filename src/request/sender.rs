// Copyright 2024 RiftKV Project Authors. Licensed under Apache-2.0.

//! The region request sender: targets one region version and drives
//! retry-on-region-error, replica failover and proxy forwarding until the
//! request lands, a relocation is needed, or the error is the caller's
//! problem.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use log::warn;

use crate::backoff::Backoffer;
use crate::backoff::BO_MAX_TS_NOT_SYNCED;
use crate::backoff::BO_REGION_MISS;
use crate::backoff::BO_REGION_NOT_INITIALIZED;
use crate::backoff::BO_SERVER_BUSY;
use crate::backoff::BO_STORE_RPC;
use crate::pd::PdClient;
use crate::proto::errorpb;
use crate::proto::metapb;
use crate::region::InvalidReason;
use crate::region::RegionVerId;
use crate::region::StoreSelector;
use crate::region_cache::RegionCache;
use crate::region_cache::RpcContext;
use crate::request::HasRegionError;
use crate::request::MAX_WRITE_EXECUTION_MS;
use crate::store::KvClient;
use crate::store::KvConnect;
use crate::store::Request;
use crate::Error;
use crate::Result;

/// Attempts of one logical send spanning longer than this are logged.
const SLOW_REQUEST_THRESHOLD: Duration = Duration::from_secs(30);

/// A region error the client is expected to resolve by relocating, carrying
/// no server-side region data. Used when the local cache entry went stale
/// before a request could even be sent.
pub(crate) fn fake_epoch_not_match() -> errorpb::Error {
    let mut err = errorpb::Error::default();
    err.epoch_not_match = Some(errorpb::EpochNotMatch::default());
    err
}

pub(crate) fn is_fake_region_error(err: &errorpb::Error) -> bool {
    err.epoch_not_match
        .as_ref()
        .is_some_and(|enm| enm.current_regions.is_empty())
}

/// What one `send` produced.
pub enum SendOutcome<Resp> {
    /// The request was evaluated (its body may still carry key errors).
    Response(Resp),
    /// A region error the caller must react to by relocating its batch.
    RegionError(errorpb::Error),
}

enum RegionErrorAction {
    RetrySameRegion,
    ReturnToCaller(errorpb::Error),
}

fn is_transport_error(e: &Error) -> bool {
    matches!(e, Error::Grpc(_) | Error::GrpcApi(_))
}

/// Sends region-targeted requests. One sender serves one logical operation
/// (e.g. one commit batch); the recorded RPC error feeds the committer's
/// undetermined-result handling.
pub struct RegionRequestSender<PdC: PdClient, Cn: KvConnect> {
    cache: Arc<RegionCache<PdC>>,
    clients: Arc<crate::store::KvClientCache<Cn>>,
    rpc_error: Option<Error>,
}

impl<PdC: PdClient, Cn: KvConnect> RegionRequestSender<PdC, Cn> {
    pub(crate) fn new(
        cache: Arc<RegionCache<PdC>>,
        clients: Arc<crate::store::KvClientCache<Cn>>,
    ) -> Self {
        RegionRequestSender {
            cache,
            clients,
            rpc_error: None,
        }
    }

    /// The last transport-level error observed, if the most recent attempt
    /// did not evaluate cleanly.
    pub fn rpc_error(&self) -> Option<&Error> {
        self.rpc_error.as_ref()
    }

    pub fn take_rpc_error(&mut self) -> Option<Error> {
        self.rpc_error.take()
    }

    pub fn clear_rpc_error(&mut self) {
        self.rpc_error = None;
    }

    /// Sends `req` to the given region version, retrying through transport
    /// failures and locally-resolvable region errors.
    pub async fn send<Req, Resp>(
        &mut self,
        bo: &mut Backoffer,
        req: &mut Req,
        region: RegionVerId,
        timeout: Duration,
    ) -> Result<SendOutcome<Resp>>
    where
        Req: Request + Clone,
        Resp: HasRegionError + Any,
    {
        let selector = StoreSelector {
            leader_only: true,
            ..Default::default()
        };
        let mut attempts: u64 = 0;
        let mut t_begin = Instant::now();
        loop {
            attempts += 1;
            if t_begin.elapsed() > SLOW_REQUEST_THRESHOLD {
                warn!(
                    "slow request, label: {}, region: {}, attempts: {}",
                    req.label(),
                    region,
                    attempts
                );
                t_begin = Instant::now();
            }

            let Some(ctx) = self.cache.get_rpc_context(bo, &region, &selector, 0).await? else {
                // The cached entry went stale; hand a retryable region error
                // back so the caller relocates against fresh routing.
                return Ok(SendOutcome::RegionError(fake_epoch_not_match()));
            };

            self.apply_context(req, &ctx, attempts);

            let resp = self.dispatch::<Req, Resp>(req, &ctx, timeout).await;
            let mut resp = match resp {
                Ok(resp) => resp,
                Err(e) if is_transport_error(&e) => {
                    self.cache.on_send_fail(bo, &ctx, false, &e).await;
                    bo.backoff(&BO_STORE_RPC, format!("send request error: {e}"))
                        .await?;
                    self.rpc_error = Some(e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            if let Some(region_error) = resp.take_region_error() {
                match self.on_region_error(bo, &ctx, region_error).await? {
                    RegionErrorAction::RetrySameRegion => continue,
                    RegionErrorAction::ReturnToCaller(e) => {
                        return Ok(SendOutcome::RegionError(e));
                    }
                }
            }
            return Ok(SendOutcome::Response(resp));
        }
    }

    fn apply_context<Req: Request>(&self, req: &mut Req, ctx: &RpcContext, attempts: u64) {
        let is_write = req.is_txn_write();
        let context = req.context_mut();
        context.region_id = ctx.region.id;
        context.region_epoch = Some(metapb::RegionEpoch {
            conf_ver: ctx.region.conf_ver,
            version: ctx.region.ver,
        });
        context.peer = Some(ctx.peer.clone());
        context.is_retry_request = attempts > 1;
        if is_write {
            context.max_execution_duration_ms = MAX_WRITE_EXECUTION_MS;
        }
    }

    async fn dispatch<Req, Resp>(
        &self,
        req: &Req,
        ctx: &RpcContext,
        timeout: Duration,
    ) -> Result<Resp>
    where
        Req: Request,
        Resp: Any,
    {
        let boxed = match &ctx.proxy_addr {
            Some(proxy_addr) => {
                let client = self
                    .clients
                    .client(proxy_addr)
                    .await?
                    .with_forwarded_host(&ctx.addr);
                client.dispatch(req, timeout).await?
            }
            None => {
                let client = self.clients.client(&ctx.addr).await?;
                client.dispatch(req, timeout).await?
            }
        };
        // A body of the wrong type means the response carried no usable
        // payload at all.
        boxed.downcast::<Resp>().map(|resp| *resp).map_err(|_| {
            warn!("response body missing for {}", req.label());
            Error::BodyMissing
        })
    }

    async fn on_region_error(
        &mut self,
        bo: &mut Backoffer,
        ctx: &RpcContext,
        mut e: errorpb::Error,
    ) -> Result<RegionErrorAction> {
        if let Some(not_leader) = e.not_leader.take() {
            match not_leader.leader {
                Some(leader) => {
                    // A fresher leader was advertised; follow it and retry
                    // without consuming backoff.
                    self.cache
                        .update_leader(&ctx.region, Some(&leader), ctx.access_idx);
                }
                None => {
                    // The peer is mid-election or isolated. Invalidate with
                    // NoLeader so the reloaded region starts from the next
                    // peer, and wait for the election to settle.
                    self.cache
                        .invalidate_region(&ctx.region, InvalidReason::NoLeader);
                    bo.backoff(
                        &BO_REGION_MISS,
                        format!("region {} has no leader", ctx.region),
                    )
                    .await?;
                }
            }
            return Ok(RegionErrorAction::RetrySameRegion);
        }

        if let Some(epoch_not_match) = e.epoch_not_match.take() {
            let retry_same = self
                .cache
                .on_epoch_not_match(bo, ctx, epoch_not_match.current_regions.clone())
                .await?;
            return if retry_same {
                Ok(RegionErrorAction::RetrySameRegion)
            } else {
                e.epoch_not_match = Some(epoch_not_match);
                Ok(RegionErrorAction::ReturnToCaller(e))
            };
        }

        if e.store_not_match.is_some() {
            self.cache
                .invalidate_region(&ctx.region, InvalidReason::StoreNotFound);
            return Ok(RegionErrorAction::RetrySameRegion);
        }

        if e.region_not_found.is_some() || e.key_not_in_region.is_some() {
            self.cache
                .invalidate_region(&ctx.region, InvalidReason::NotFound);
            return Ok(RegionErrorAction::ReturnToCaller(e));
        }

        if e.stale_command.is_some() {
            bo.backoff(&BO_REGION_MISS, format!("stale command in {}", ctx.region))
                .await?;
            return Ok(RegionErrorAction::RetrySameRegion);
        }

        if let Some(server_is_busy) = &e.server_is_busy {
            bo.backoff(
                &BO_SERVER_BUSY,
                format!("server busy on {}: {}", ctx.addr, server_is_busy.reason),
            )
            .await?;
            return Ok(RegionErrorAction::RetrySameRegion);
        }

        if e.max_timestamp_not_synced.is_some() {
            bo.backoff(
                &BO_MAX_TS_NOT_SYNCED,
                format!("max timestamp not synced on {}", ctx.addr),
            )
            .await?;
            return Ok(RegionErrorAction::RetrySameRegion);
        }

        if e.region_not_initialized.is_some() {
            bo.backoff(
                &BO_REGION_NOT_INITIALIZED,
                format!("region {} not initialized", ctx.region),
            )
            .await?;
            return Ok(RegionErrorAction::RetrySameRegion);
        }

        warn!("unknown region error for {}: {:?}", ctx.region, e);
        self.cache
            .invalidate_region(&ctx.region, InvalidReason::Other);
        Ok(RegionErrorAction::ReturnToCaller(e))
    }
}
