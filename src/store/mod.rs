// Copyright 2024 RiftKV Project Authors. Licensed under Apache-2.0.

mod client;
mod liveness;
mod registry;
mod request;

pub use client::KvClient;
pub use client::KvConnect;
pub use client::KvRpcClient;
pub(crate) use client::KvClientCache;
pub use client::TonicConnect;
pub use liveness::GrpcHealthProbe;
pub use liveness::HealthProbe;
pub use liveness::LivenessState;
pub(crate) use liveness::SingleFlightLiveness;
pub use registry::ResolveState;
pub use registry::Store;
pub(crate) use registry::StoreMap;
pub use request::Request;
