// Copyright 2024 RiftKV Project Authors. Licensed under Apache-2.0.

use async_trait::async_trait;

use crate::proto::metapb;
use crate::proto::pdpb::Timestamp;
use crate::region::RegionId;
use crate::region::StoreId;
use crate::Result;

/// A region record as PD reports it.
#[derive(Clone, Debug, PartialEq)]
pub struct RegionInfo {
    pub region: metapb::Region,
    /// Absent when the region currently has no leader.
    pub leader: Option<metapb::Peer>,
    pub buckets: Option<metapb::Buckets>,
}

impl RegionInfo {
    pub fn new(region: metapb::Region, leader: Option<metapb::Peer>) -> RegionInfo {
        RegionInfo {
            region,
            leader,
            buckets: None,
        }
    }
}

/// The placement-driver surface the client consumes.
///
/// All keys crossing this trait are in raw (user) format. PD itself stores
/// region boundaries in the memcomparable encoding; the concrete gRPC client
/// translates at that boundary so nothing above it has to care.
#[async_trait]
pub trait PdClient: Send + Sync + 'static {
    async fn get_timestamp(&self) -> Result<Timestamp>;

    /// The region containing `key`.
    async fn get_region(&self, key: Vec<u8>) -> Result<RegionInfo>;

    /// The region immediately before the one containing `key`, used when a
    /// range end key should resolve to the region it closes.
    async fn get_prev_region(&self, key: Vec<u8>) -> Result<RegionInfo>;

    async fn get_region_by_id(&self, id: RegionId) -> Result<RegionInfo>;

    /// Up to `limit` regions covering `[start_key, end_key)`, in key order.
    async fn scan_regions(
        &self,
        start_key: Vec<u8>,
        end_key: Vec<u8>,
        limit: i32,
    ) -> Result<Vec<RegionInfo>>;

    /// `None` when the store has been removed from the cluster.
    async fn get_store(&self, id: StoreId) -> Result<Option<metapb::Store>>;

    async fn get_all_stores(&self) -> Result<Vec<metapb::Store>>;

    /// Returns the new cluster-wide safepoint.
    async fn update_gc_safe_point(&self, safe_point: u64) -> Result<u64>;

    async fn update_service_safe_point(
        &self,
        service_id: Vec<u8>,
        ttl: i64,
        safe_point: u64,
    ) -> Result<()>;
}
