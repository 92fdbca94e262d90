// Copyright 2024 RiftKV Project Authors. Licensed under Apache-2.0.

mod sender;

pub use sender::RegionRequestSender;
pub use sender::SendOutcome;
pub(crate) use sender::is_fake_region_error;

use crate::proto::errorpb;

/// Per-attempt timeout for point requests.
pub const READ_TIMEOUT_SHORT: std::time::Duration = std::time::Duration::from_secs(30);
/// Per-attempt timeout for range requests.
pub const READ_TIMEOUT_MEDIUM: std::time::Duration = std::time::Duration::from_secs(60);

/// Server-side proposal deadline carried by write requests, chosen so the
/// server refuses to apply proposals the client has already given up on.
pub(crate) const MAX_WRITE_EXECUTION_MS: u64 =
    READ_TIMEOUT_SHORT.as_millis() as u64 - 10_000;

/// Responses that may carry a region error instead of a body.
pub trait HasRegionError {
    fn take_region_error(&mut self) -> Option<errorpb::Error>;
}

macro_rules! has_region_error {
    ($($t:ty),+ $(,)?) => {
        $(
            impl HasRegionError for $t {
                fn take_region_error(&mut self) -> Option<errorpb::Error> {
                    self.region_error.take()
                }
            }
        )+
    };
}

use crate::proto::kvpb;

has_region_error!(
    kvpb::GetResponse,
    kvpb::BatchGetResponse,
    kvpb::ScanResponse,
    kvpb::PrewriteResponse,
    kvpb::CommitResponse,
    kvpb::BatchRollbackResponse,
    kvpb::CleanupResponse,
    kvpb::CheckTxnStatusResponse,
    kvpb::TxnHeartBeatResponse,
    kvpb::ScanLockResponse,
    kvpb::ResolveLockResponse,
    kvpb::PessimisticLockResponse,
    kvpb::PessimisticRollbackResponse,
    kvpb::GcResponse,
    kvpb::DeleteRangeResponse,
);
