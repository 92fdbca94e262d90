// Copyright 2024 RiftKV Project Authors. Licensed under Apache-2.0.

//! The in-memory MVCC engine.
//!
//! This is the authoritative state machine the transactional commands act
//! upon. The in-process mock cluster serves requests from it, and its
//! semantics — not any particular server build — are what the client's
//! conformance tests pin down.
//!
//! Storage is one sorted byte-keyed map per engine. Each user key `K` owns a
//! contiguous run of entries `encode_bytes(K) ∥ encode_u64_desc(ver)`: the
//! lock slot (`ver = u64::MAX`) first, then committed versions in descending
//! `commit_ts`.

mod codec;
mod deadlock;
mod engine;

pub use codec::mvcc_decode;
pub use codec::mvcc_encode;
pub use codec::LOCK_VER;
pub use deadlock::DeadlockDetector;
pub use engine::MvccEngine;
pub use engine::MvccError;
pub use engine::MvccPair;
pub use engine::MvccResult;
pub use engine::PrewriteResult;
pub use engine::TxnStatus;
