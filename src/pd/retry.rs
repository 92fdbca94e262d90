// Copyright 2024 RiftKV Project Authors. Licensed under Apache-2.0.

//! Retry wrapper around the PD cluster client. Every call gets a fresh
//! backoffer under `BO_PD_RPC` so a flaky PD does not poison unrelated
//! operations' budgets.

use async_trait::async_trait;
use log::warn;

use super::Cluster;
use super::PdClient;
use super::RegionInfo;
use crate::backoff::BackoffContext;
use crate::backoff::Backoffer;
use crate::backoff::BO_PD_RPC;
use crate::proto::metapb;
use crate::proto::pdpb::Timestamp;
use crate::region::RegionId;
use crate::region::StoreId;
use crate::Error;
use crate::Result;

const PD_MAX_BACKOFF_MS: u64 = 10_000;

pub struct RetryClient {
    cluster: Cluster,
}

impl RetryClient {
    pub fn new(cluster: Cluster) -> RetryClient {
        RetryClient { cluster }
    }

    async fn retry<T, Fut>(&self, mut call: impl FnMut(Cluster) -> Fut) -> Result<T>
    where
        Fut: std::future::Future<Output = Result<T>>,
    {
        let (ctx, _cancel) = BackoffContext::new();
        let mut bo = Backoffer::new(ctx, PD_MAX_BACKOFF_MS);
        loop {
            match call(self.cluster.clone()).await {
                Ok(value) => return Ok(value),
                Err(e @ (Error::Grpc(_) | Error::GrpcApi(_))) => {
                    warn!("PD request failed, retrying: {}", e);
                    bo.backoff(&BO_PD_RPC, e.to_string()).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl PdClient for RetryClient {
    async fn get_timestamp(&self) -> Result<Timestamp> {
        self.retry(|c| async move { c.get_timestamp().await }).await
    }

    async fn get_region(&self, key: Vec<u8>) -> Result<RegionInfo> {
        let resp = self
            .retry(|c| {
                let key = key.clone();
                async move { c.get_region(key).await }
            })
            .await?;
        let region = resp.region.ok_or_else(|| Error::RegionForKeyNotFound {
            key: key.clone(),
        })?;
        Ok(RegionInfo {
            region,
            leader: resp.leader,
            buckets: resp.buckets,
        })
    }

    async fn get_prev_region(&self, key: Vec<u8>) -> Result<RegionInfo> {
        let resp = self
            .retry(|c| {
                let key = key.clone();
                async move { c.get_prev_region(key).await }
            })
            .await?;
        let region = resp.region.ok_or_else(|| Error::RegionForKeyNotFound {
            key: key.clone(),
        })?;
        Ok(RegionInfo {
            region,
            leader: resp.leader,
            buckets: resp.buckets,
        })
    }

    async fn get_region_by_id(&self, id: RegionId) -> Result<RegionInfo> {
        let resp = self
            .retry(|c| async move { c.get_region_by_id(id).await })
            .await?;
        let region = resp
            .region
            .ok_or(Error::RegionNotFoundInResponse { region_id: id })?;
        Ok(RegionInfo {
            region,
            leader: resp.leader,
            buckets: resp.buckets,
        })
    }

    async fn scan_regions(
        &self,
        start_key: Vec<u8>,
        end_key: Vec<u8>,
        limit: i32,
    ) -> Result<Vec<RegionInfo>> {
        let resp = self
            .retry(|c| {
                let start_key = start_key.clone();
                let end_key = end_key.clone();
                async move { c.scan_regions(start_key, end_key, limit).await }
            })
            .await?;
        Ok(resp
            .regions
            .into_iter()
            .filter_map(|entry| {
                entry.region.map(|region| RegionInfo {
                    region,
                    leader: entry.leader,
                    buckets: None,
                })
            })
            .collect())
    }

    async fn get_store(&self, id: StoreId) -> Result<Option<metapb::Store>> {
        let resp = self.retry(|c| async move { c.get_store(id).await }).await?;
        Ok(resp.store)
    }

    async fn get_all_stores(&self) -> Result<Vec<metapb::Store>> {
        let resp = self
            .retry(|c| async move { c.get_all_stores().await })
            .await?;
        Ok(resp.stores)
    }

    async fn update_gc_safe_point(&self, safe_point: u64) -> Result<u64> {
        self.retry(|c| async move { c.update_gc_safe_point(safe_point).await })
            .await
    }

    async fn update_service_safe_point(
        &self,
        service_id: Vec<u8>,
        ttl: i64,
        safe_point: u64,
    ) -> Result<()> {
        self.retry(|c| {
            let service_id = service_id.clone();
            async move { c.update_service_safe_point(service_id, ttl, safe_point).await }
        })
        .await
    }
}
