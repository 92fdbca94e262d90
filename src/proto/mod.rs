// Copyright 2024 RiftKV Project Authors. Licensed under Apache-2.0.

//! Wire types for the RiftKV protocol family.
//!
//! These are maintained by hand in the layout `prost-build` would emit, one
//! module per protobuf package. The transport layer ships them with
//! [`tonic::codec::ProstCodec`], so field tags here are the wire contract and
//! must never be reused or renumbered.

#![allow(clippy::large_enum_variant)]
#![allow(clippy::enum_variant_names)]

pub mod errorpb;
pub mod healthpb;
pub mod kvpb;
pub mod metapb;
pub mod pdpb;
