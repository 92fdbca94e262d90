// Copyright 2024 RiftKV Project Authors. Licensed under Apache-2.0.

//! Region-level errors returned by store nodes.

use super::metapb;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NotLeader {
    #[prost(uint64, tag = "1")]
    pub region_id: u64,
    /// The advertised leader, if the replying peer knows one.
    #[prost(message, optional, tag = "2")]
    pub leader: Option<metapb::Peer>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegionNotFound {
    #[prost(uint64, tag = "1")]
    pub region_id: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KeyNotInRegion {
    #[prost(bytes = "vec", tag = "1")]
    pub key: Vec<u8>,
    #[prost(uint64, tag = "2")]
    pub region_id: u64,
    #[prost(bytes = "vec", tag = "3")]
    pub start_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub end_key: Vec<u8>,
}

/// The request's region epoch is behind (or ahead of) the server's. When the
/// mismatch comes from a split/merge the server attaches the regions that
/// currently cover its side of the range.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EpochNotMatch {
    #[prost(message, repeated, tag = "1")]
    pub current_regions: Vec<metapb::Region>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StoreNotMatch {
    #[prost(uint64, tag = "1")]
    pub request_store_id: u64,
    #[prost(uint64, tag = "2")]
    pub actual_store_id: u64,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct StaleCommand {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServerIsBusy {
    #[prost(string, tag = "1")]
    pub reason: String,
    #[prost(uint64, tag = "2")]
    pub backoff_ms: u64,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct MaxTimestampNotSynced {}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct RegionNotInitialized {
    #[prost(uint64, tag = "1")]
    pub region_id: u64,
}

/// The region error envelope. At most one of the detail fields is set.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Error {
    #[prost(string, tag = "1")]
    pub message: String,
    #[prost(message, optional, tag = "2")]
    pub not_leader: Option<NotLeader>,
    #[prost(message, optional, tag = "3")]
    pub region_not_found: Option<RegionNotFound>,
    #[prost(message, optional, tag = "4")]
    pub key_not_in_region: Option<KeyNotInRegion>,
    #[prost(message, optional, tag = "5")]
    pub epoch_not_match: Option<EpochNotMatch>,
    #[prost(message, optional, tag = "6")]
    pub store_not_match: Option<StoreNotMatch>,
    #[prost(message, optional, tag = "7")]
    pub stale_command: Option<StaleCommand>,
    #[prost(message, optional, tag = "8")]
    pub server_is_busy: Option<ServerIsBusy>,
    #[prost(message, optional, tag = "9")]
    pub max_timestamp_not_synced: Option<MaxTimestampNotSynced>,
    #[prost(message, optional, tag = "10")]
    pub region_not_initialized: Option<RegionNotInitialized>,
}
