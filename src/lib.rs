// Copyright 2024 RiftKV Project Authors. Licensed under Apache-2.0.

//! This crate provides an async client for RiftKV, a distributed,
//! transactional key-value database.
//!
//! The client exposes serializable, cross-shard transactions over a cluster
//! whose data is partitioned into contiguous key ranges ("regions")
//! replicated by consensus groups. Commits follow the Percolator-style
//! optimistic two-phase protocol, with pessimistic locking, async commit and
//! single-phase (1PC) variants layered on top.
//!
//! The important moving parts, bottom to top:
//!
//! * [`region_cache::RegionCache`] — the routing cache mapping keys to
//!   regions and regions to replica addresses, with failover, forwarding
//!   and epoch-based invalidation.
//! * [`request::RegionRequestSender`] — region-targeted RPC with
//!   retry-on-region-error.
//! * [`Transaction`] — buffered reads/writes over one start timestamp, with
//!   the two-phase committer and lock resolver behind
//!   [`Transaction::commit`].
//! * [`mvcc::MvccEngine`] — the in-memory reference engine that defines the
//!   transactional protocol precisely; the in-process mock cluster serves
//!   requests from it.
//!
//! # Examples
//!
//! ```rust,no_run
//! # use riftkv_client::{TransactionClient, Result};
//! # async fn example() -> Result<()> {
//! let client = TransactionClient::new(vec!["127.0.0.1:2379".to_owned()]).await?;
//! let mut txn = client.begin_optimistic().await?;
//! txn.put("key", "value").await?;
//! let _value = txn.get("key").await?;
//! txn.commit().await?;
//! # Ok(())
//! # }
//! ```
//!
//! Since this crate provides an async API, you need an async runtime
//! (Tokio-only).

pub mod backoff;
pub mod mvcc;
pub mod pd;
pub mod region;
pub mod region_cache;
pub mod request;
pub mod store;
pub mod transaction;

mod common;
mod config;
mod kv;
mod proto;
mod timestamp;

pub mod mock;

#[doc(inline)]
pub use common::Error;
#[doc(inline)]
pub use common::Result;
#[doc(inline)]
pub use common::WriteConflictError;
#[doc(inline)]
pub use config::Config;

#[doc(inline)]
pub use crate::kv::BoundRange;
#[doc(inline)]
pub use crate::kv::IntoOwnedRange;
#[doc(inline)]
pub use crate::kv::Key;
#[doc(inline)]
pub use crate::kv::KvPair;
#[doc(inline)]
pub use crate::kv::Value;
#[doc(inline)]
pub use crate::pd::PdClient;
#[doc(inline)]
pub use crate::pd::RegionInfo;
#[doc(inline)]
pub use crate::timestamp::compose_ts;
#[doc(inline)]
pub use crate::timestamp::CALLER_START_TS_MAX;
#[doc(inline)]
pub use crate::timestamp::extract_physical;
#[doc(inline)]
pub use crate::timestamp::Timestamp;
#[doc(inline)]
pub use crate::timestamp::TimestampExt;
#[doc(inline)]
pub use crate::transaction::CheckLevel;
#[doc(inline)]
pub use crate::transaction::Client as TransactionClient;
#[doc(inline)]
pub use crate::transaction::Snapshot;
#[doc(inline)]
pub use crate::transaction::Transaction;
#[doc(inline)]
pub use crate::transaction::TransactionOptions;

#[doc(hidden)]
pub mod kvpb {
    pub use crate::proto::kvpb::*;
}
#[doc(hidden)]
pub mod metapb {
    pub use crate::proto::metapb::*;
}
#[doc(hidden)]
pub mod errorpb {
    pub use crate::proto::errorpb::*;
}
