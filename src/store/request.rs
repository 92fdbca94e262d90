// Copyright 2024 RiftKV Project Authors. Licensed under Apache-2.0.

use std::any::Any;
use std::time::Duration;

use async_trait::async_trait;
use tonic::client::Grpc;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::metadata::MetadataValue;
use tonic::transport::Channel;

use crate::internal_err;
use crate::proto::kvpb;
use crate::Error;
use crate::Result;

/// Metadata key naming the final target when a request is proxied through
/// another store.
pub(crate) const FORWARD_METADATA_KEY: &str = "riftkv-forwarded-host";

/// A dispatchable KV request. Implemented for every `kvpb` request type; the
/// response comes back as `Box<dyn Any>` and is downcast by the sender.
#[async_trait]
pub trait Request: Any + Sync + Send + 'static {
    async fn dispatch(
        &self,
        channel: Channel,
        forwarded_host: Option<&str>,
        timeout: Duration,
    ) -> Result<Box<dyn Any>>;
    fn label(&self) -> &'static str;
    fn as_any(&self) -> &dyn Any;
    fn context_mut(&mut self) -> &mut kvpb::Context;
    /// Whether the request proposes writes; such requests carry a server-side
    /// execution deadline.
    fn is_txn_write(&self) -> bool {
        false
    }
}

async fn unary<Req, Resp>(
    channel: Channel,
    req: Req,
    path: &'static str,
    forwarded_host: Option<&str>,
    timeout: Duration,
) -> Result<Resp>
where
    Req: prost::Message + Clone + Send + Sync + 'static,
    Resp: prost::Message + Default + Send + Sync + 'static,
{
    let mut grpc = Grpc::new(channel);
    grpc.ready().await.map_err(Error::Grpc)?;

    let mut request = tonic::Request::new(req);
    request.set_timeout(timeout);
    if let Some(host) = forwarded_host {
        let value = MetadataValue::try_from(host)
            .map_err(|e| internal_err!("invalid forwarded host {}: {}", host, e))?;
        request.metadata_mut().insert(FORWARD_METADATA_KEY, value);
    }

    let codec: ProstCodec<Req, Resp> = ProstCodec::default();
    let response = grpc
        .unary(request, PathAndQuery::from_static(path), codec)
        .await
        .map_err(Error::GrpcApi)?;
    Ok(response.into_inner())
}

macro_rules! impl_request {
    ($req:ident, $resp:ident, $path:literal, $label:literal) => {
        impl_request!($req, $resp, $path, $label, is_txn_write = false);
    };
    ($req:ident, $resp:ident, $path:literal, $label:literal, is_txn_write = $write:literal) => {
        #[async_trait]
        impl Request for kvpb::$req {
            async fn dispatch(
                &self,
                channel: Channel,
                forwarded_host: Option<&str>,
                timeout: Duration,
            ) -> Result<Box<dyn Any>> {
                unary::<kvpb::$req, kvpb::$resp>(
                    channel,
                    self.clone(),
                    $path,
                    forwarded_host,
                    timeout,
                )
                .await
                .map(|resp| Box::new(resp) as Box<dyn Any>)
            }

            fn label(&self) -> &'static str {
                $label
            }

            fn as_any(&self) -> &dyn Any {
                self
            }

            fn context_mut(&mut self) -> &mut kvpb::Context {
                self.context.get_or_insert_with(kvpb::Context::default)
            }

            fn is_txn_write(&self) -> bool {
                $write
            }
        }
    };
}

impl_request!(GetRequest, GetResponse, "/kvpb.Kv/Get", "kv_get");
impl_request!(
    BatchGetRequest,
    BatchGetResponse,
    "/kvpb.Kv/BatchGet",
    "kv_batch_get"
);
impl_request!(ScanRequest, ScanResponse, "/kvpb.Kv/Scan", "kv_scan");
impl_request!(
    PrewriteRequest,
    PrewriteResponse,
    "/kvpb.Kv/Prewrite",
    "kv_prewrite",
    is_txn_write = true
);
impl_request!(
    CommitRequest,
    CommitResponse,
    "/kvpb.Kv/Commit",
    "kv_commit",
    is_txn_write = true
);
impl_request!(
    BatchRollbackRequest,
    BatchRollbackResponse,
    "/kvpb.Kv/BatchRollback",
    "kv_batch_rollback",
    is_txn_write = true
);
impl_request!(
    CleanupRequest,
    CleanupResponse,
    "/kvpb.Kv/Cleanup",
    "kv_cleanup",
    is_txn_write = true
);
impl_request!(
    CheckTxnStatusRequest,
    CheckTxnStatusResponse,
    "/kvpb.Kv/CheckTxnStatus",
    "kv_check_txn_status",
    is_txn_write = true
);
impl_request!(
    TxnHeartBeatRequest,
    TxnHeartBeatResponse,
    "/kvpb.Kv/TxnHeartBeat",
    "kv_txn_heart_beat",
    is_txn_write = true
);
impl_request!(
    ScanLockRequest,
    ScanLockResponse,
    "/kvpb.Kv/ScanLock",
    "kv_scan_lock"
);
impl_request!(
    ResolveLockRequest,
    ResolveLockResponse,
    "/kvpb.Kv/ResolveLock",
    "kv_resolve_lock",
    is_txn_write = true
);
impl_request!(
    PessimisticLockRequest,
    PessimisticLockResponse,
    "/kvpb.Kv/PessimisticLock",
    "kv_pessimistic_lock",
    is_txn_write = true
);
impl_request!(
    PessimisticRollbackRequest,
    PessimisticRollbackResponse,
    "/kvpb.Kv/PessimisticRollback",
    "kv_pessimistic_rollback",
    is_txn_write = true
);
impl_request!(GcRequest, GcResponse, "/kvpb.Kv/Gc", "kv_gc", is_txn_write = true);
impl_request!(
    DeleteRangeRequest,
    DeleteRangeResponse,
    "/kvpb.Kv/DeleteRange",
    "kv_delete_range",
    is_txn_write = true
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_mut_initializes_context() {
        let mut req = kvpb::PrewriteRequest::default();
        assert!(req.context.is_none());
        req.context_mut().region_id = 7;
        assert_eq!(req.context.as_ref().unwrap().region_id, 7);
        assert!(req.is_txn_write());
        assert_eq!(req.label(), "kv_prewrite");
    }

    #[test]
    fn reads_are_not_txn_writes() {
        let req = kvpb::GetRequest::default();
        assert!(!req.is_txn_write());
        let req = kvpb::ScanLockRequest::default();
        assert!(!req.is_txn_write());
    }
}
