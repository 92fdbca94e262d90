// Copyright 2024 RiftKV Project Authors. Licensed under Apache-2.0.

//! The placement-driver RPC surface consumed by the client.

use super::metapb;

/// A cluster timestamp. `physical` is milliseconds since the epoch; the
/// logical counter disambiguates timestamps within one millisecond.
#[derive(Clone, Copy, PartialEq, Eq, Hash, ::prost::Message)]
pub struct Timestamp {
    #[prost(int64, tag = "1")]
    pub physical: i64,
    #[prost(int64, tag = "2")]
    pub logical: i64,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct GetTimestampRequest {
    #[prost(uint32, tag = "1")]
    pub count: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetTimestampResponse {
    #[prost(message, optional, tag = "1")]
    pub timestamp: Option<Timestamp>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetRegionRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub region_key: Vec<u8>,
    #[prost(bool, tag = "2")]
    pub need_buckets: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetRegionByIdRequest {
    #[prost(uint64, tag = "1")]
    pub region_id: u64,
    #[prost(bool, tag = "2")]
    pub need_buckets: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetRegionResponse {
    #[prost(message, optional, tag = "1")]
    pub region: Option<metapb::Region>,
    #[prost(message, optional, tag = "2")]
    pub leader: Option<metapb::Peer>,
    #[prost(message, optional, tag = "3")]
    pub buckets: Option<metapb::Buckets>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ScanRegionsRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub start_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub end_key: Vec<u8>,
    #[prost(int32, tag = "3")]
    pub limit: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegionWithLeader {
    #[prost(message, optional, tag = "1")]
    pub region: Option<metapb::Region>,
    #[prost(message, optional, tag = "2")]
    pub leader: Option<metapb::Peer>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ScanRegionsResponse {
    #[prost(message, repeated, tag = "1")]
    pub regions: Vec<RegionWithLeader>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetStoreRequest {
    #[prost(uint64, tag = "1")]
    pub store_id: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetStoreResponse {
    /// Absent when the store has been removed from the cluster.
    #[prost(message, optional, tag = "1")]
    pub store: Option<metapb::Store>,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct GetAllStoresRequest {
    #[prost(bool, tag = "1")]
    pub exclude_tombstone: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetAllStoresResponse {
    #[prost(message, repeated, tag = "1")]
    pub stores: Vec<metapb::Store>,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct UpdateGcSafePointRequest {
    #[prost(uint64, tag = "1")]
    pub safe_point: u64,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct UpdateGcSafePointResponse {
    #[prost(uint64, tag = "1")]
    pub new_safe_point: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateServiceGcSafePointRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub service_id: Vec<u8>,
    #[prost(int64, tag = "2")]
    pub ttl: i64,
    #[prost(uint64, tag = "3")]
    pub safe_point: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateServiceGcSafePointResponse {
    #[prost(bytes = "vec", tag = "1")]
    pub service_id: Vec<u8>,
    #[prost(int64, tag = "2")]
    pub ttl: i64,
    #[prost(uint64, tag = "3")]
    pub min_safe_point: u64,
}
