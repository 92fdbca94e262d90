// Copyright 2024 RiftKV Project Authors. Licensed under Apache-2.0.

//! The raw gRPC client against one placement-driver endpoint set.

use std::time::Duration;

use tonic::client::Grpc;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::Channel;

use crate::kv::codec;
use crate::proto::metapb;
use crate::proto::pdpb;
use crate::Error;
use crate::Result;

/// A connection to a PD cluster. Clones share the underlying channel.
#[derive(Clone)]
pub struct Cluster {
    channel: Channel,
    timeout: Duration,
}

impl Cluster {
    /// Dials the first reachable endpoint.
    pub async fn connect(endpoints: &[String], timeout: Duration) -> Result<Cluster> {
        let mut last_err = None;
        for endpoint in endpoints {
            let channel = match Channel::from_shared(format!("http://{endpoint}")) {
                Ok(endpoint) => endpoint.connect_timeout(timeout).connect().await,
                Err(e) => return Err(Error::Url(e)),
            };
            match channel {
                Ok(channel) => return Ok(Cluster { channel, timeout }),
                Err(e) => last_err = Some(Error::Grpc(e)),
            }
        }
        Err(last_err.unwrap_or_else(|| crate::internal_err!("no PD endpoints given")))
    }

    async fn unary<Req, Resp>(&self, req: Req, path: &'static str) -> Result<Resp>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        let mut grpc = Grpc::new(self.channel.clone());
        grpc.ready().await.map_err(Error::Grpc)?;
        let mut request = tonic::Request::new(req);
        request.set_timeout(self.timeout);
        let codec: ProstCodec<Req, Resp> = ProstCodec::default();
        let response = grpc
            .unary(request, PathAndQuery::from_static(path), codec)
            .await
            .map_err(Error::GrpcApi)?;
        Ok(response.into_inner())
    }

    pub(crate) async fn get_timestamp(&self) -> Result<pdpb::Timestamp> {
        let resp: pdpb::GetTimestampResponse = self
            .unary(
                pdpb::GetTimestampRequest { count: 1 },
                "/pdpb.Placement/GetTimestamp",
            )
            .await?;
        resp.timestamp
            .ok_or(Error::PdResponseMissing { field: "timestamp" })
    }

    pub(crate) async fn get_region(&self, key: Vec<u8>) -> Result<pdpb::GetRegionResponse> {
        // PD holds region boundaries in memcomparable form.
        let mut encoded = Vec::new();
        codec::encode_bytes(&mut encoded, &key);
        let mut resp: pdpb::GetRegionResponse = self
            .unary(
                pdpb::GetRegionRequest {
                    region_key: encoded,
                    need_buckets: true,
                },
                "/pdpb.Placement/GetRegion",
            )
            .await?;
        if let Some(region) = resp.region.as_mut() {
            decode_region_keys(region)?;
        }
        Ok(resp)
    }

    pub(crate) async fn get_prev_region(&self, key: Vec<u8>) -> Result<pdpb::GetRegionResponse> {
        let mut encoded = Vec::new();
        codec::encode_bytes(&mut encoded, &key);
        let mut resp: pdpb::GetRegionResponse = self
            .unary(
                pdpb::GetRegionRequest {
                    region_key: encoded,
                    need_buckets: true,
                },
                "/pdpb.Placement/GetPrevRegion",
            )
            .await?;
        if let Some(region) = resp.region.as_mut() {
            decode_region_keys(region)?;
        }
        Ok(resp)
    }

    pub(crate) async fn get_region_by_id(&self, id: u64) -> Result<pdpb::GetRegionResponse> {
        let mut resp: pdpb::GetRegionResponse = self
            .unary(
                pdpb::GetRegionByIdRequest {
                    region_id: id,
                    need_buckets: true,
                },
                "/pdpb.Placement/GetRegionById",
            )
            .await?;
        if let Some(region) = resp.region.as_mut() {
            decode_region_keys(region)?;
        }
        Ok(resp)
    }

    pub(crate) async fn scan_regions(
        &self,
        start_key: Vec<u8>,
        end_key: Vec<u8>,
        limit: i32,
    ) -> Result<pdpb::ScanRegionsResponse> {
        let mut encoded_start = Vec::new();
        codec::encode_bytes(&mut encoded_start, &start_key);
        let encoded_end = if end_key.is_empty() {
            Vec::new()
        } else {
            let mut buf = Vec::new();
            codec::encode_bytes(&mut buf, &end_key);
            buf
        };
        let mut resp: pdpb::ScanRegionsResponse = self
            .unary(
                pdpb::ScanRegionsRequest {
                    start_key: encoded_start,
                    end_key: encoded_end,
                    limit,
                },
                "/pdpb.Placement/ScanRegions",
            )
            .await?;
        for entry in resp.regions.iter_mut() {
            if let Some(region) = entry.region.as_mut() {
                decode_region_keys(region)?;
            }
        }
        Ok(resp)
    }

    pub(crate) async fn get_store(&self, id: u64) -> Result<pdpb::GetStoreResponse> {
        self.unary(
            pdpb::GetStoreRequest { store_id: id },
            "/pdpb.Placement/GetStore",
        )
        .await
    }

    pub(crate) async fn get_all_stores(&self) -> Result<pdpb::GetAllStoresResponse> {
        self.unary(
            pdpb::GetAllStoresRequest {
                exclude_tombstone: true,
            },
            "/pdpb.Placement/GetAllStores",
        )
        .await
    }

    pub(crate) async fn update_gc_safe_point(&self, safe_point: u64) -> Result<u64> {
        let resp: pdpb::UpdateGcSafePointResponse = self
            .unary(
                pdpb::UpdateGcSafePointRequest { safe_point },
                "/pdpb.Placement/UpdateGcSafePoint",
            )
            .await?;
        Ok(resp.new_safe_point)
    }

    pub(crate) async fn update_service_safe_point(
        &self,
        service_id: Vec<u8>,
        ttl: i64,
        safe_point: u64,
    ) -> Result<()> {
        let _: pdpb::UpdateServiceGcSafePointResponse = self
            .unary(
                pdpb::UpdateServiceGcSafePointRequest {
                    service_id,
                    ttl,
                    safe_point,
                },
                "/pdpb.Placement/UpdateServiceGcSafePoint",
            )
            .await?;
        Ok(())
    }
}

fn decode_region_keys(region: &mut metapb::Region) -> Result<()> {
    codec::decode_bytes_in_place(&mut region.start_key)?;
    codec::decode_bytes_in_place(&mut region.end_key)?;
    Ok(())
}
