// Copyright 2024 RiftKV Project Authors. Licensed under Apache-2.0.

use std::sync::Arc;

use async_trait::async_trait;

use super::MockCluster;
use crate::pd::PdClient;
use crate::pd::RegionInfo;
use crate::proto::metapb;
use crate::proto::pdpb::Timestamp;
use crate::region::RegionId;
use crate::region::StoreId;
use crate::Error;
use crate::Result;

/// A placement driver answering from a [`MockCluster`]'s metadata.
pub struct MockPdClient {
    cluster: Arc<MockCluster>,
    safe_point: std::sync::atomic::AtomicU64,
}

impl MockPdClient {
    pub fn new(cluster: Arc<MockCluster>) -> MockPdClient {
        MockPdClient {
            cluster,
            safe_point: std::sync::atomic::AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl PdClient for MockPdClient {
    async fn get_timestamp(&self) -> Result<Timestamp> {
        Ok(self.cluster.timestamp())
    }

    async fn get_region(&self, key: Vec<u8>) -> Result<RegionInfo> {
        match self.cluster.region_for_key(&key) {
            Some((region, leader)) => Ok(RegionInfo::new(region, Some(leader))),
            None => Err(Error::RegionForKeyNotFound { key }),
        }
    }

    async fn get_prev_region(&self, key: Vec<u8>) -> Result<RegionInfo> {
        match self.cluster.prev_region_for_key(&key) {
            Some((region, leader)) => Ok(RegionInfo::new(region, Some(leader))),
            None => Err(Error::RegionForKeyNotFound { key }),
        }
    }

    async fn get_region_by_id(&self, id: RegionId) -> Result<RegionInfo> {
        match self.cluster.region_by_id(id) {
            Some((region, leader)) => Ok(RegionInfo::new(region, Some(leader))),
            None => Err(Error::RegionNotFoundInResponse { region_id: id }),
        }
    }

    async fn scan_regions(
        &self,
        start_key: Vec<u8>,
        end_key: Vec<u8>,
        limit: i32,
    ) -> Result<Vec<RegionInfo>> {
        let limit = if limit <= 0 { usize::MAX } else { limit as usize };
        Ok(self
            .cluster
            .scan_region_metas(&start_key, &end_key, limit)
            .into_iter()
            .map(|(region, leader)| RegionInfo::new(region, leader))
            .collect())
    }

    async fn get_store(&self, id: StoreId) -> Result<Option<metapb::Store>> {
        Ok(self.cluster.store_meta(id))
    }

    async fn get_all_stores(&self) -> Result<Vec<metapb::Store>> {
        Ok(self.cluster.all_store_metas())
    }

    async fn update_gc_safe_point(&self, safe_point: u64) -> Result<u64> {
        let previous = self
            .safe_point
            .fetch_max(safe_point, std::sync::atomic::Ordering::SeqCst);
        Ok(previous.max(safe_point))
    }

    async fn update_service_safe_point(
        &self,
        _service_id: Vec<u8>,
        _ttl: i64,
        safe_point: u64,
    ) -> Result<()> {
        self.safe_point
            .fetch_max(safe_point, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}
