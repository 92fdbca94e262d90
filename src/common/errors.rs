// Copyright 2024 RiftKV Project Authors. Licensed under Apache-2.0.

use std::fmt;
use std::result;

use thiserror::Error;

use crate::proto::kvpb;

/// A write conflict reported by a store node.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WriteConflictError {
    pub start_ts: u64,
    pub conflict_ts: u64,
    pub conflict_commit_ts: u64,
    pub key: Vec<u8>,
    pub primary: Vec<u8>,
}

impl From<kvpb::WriteConflict> for WriteConflictError {
    fn from(conflict: kvpb::WriteConflict) -> Self {
        Self {
            start_ts: conflict.start_ts,
            conflict_ts: conflict.conflict_ts,
            conflict_commit_ts: conflict.conflict_commit_ts,
            key: conflict.key,
            primary: conflict.primary,
        }
    }
}

impl fmt::Display for WriteConflictError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "start_ts={}, conflict_ts={}, conflict_commit_ts={}, key_len={}",
            self.start_ts,
            self.conflict_ts,
            self.conflict_commit_ts,
            self.key.len()
        )
    }
}

/// An error originating from the RiftKV client or its dependencies.
#[derive(Debug, Error)]
#[allow(clippy::large_enum_variant)]
pub enum Error {
    /// Write conflict detected at prewrite time.
    #[error("write conflict: {0}")]
    WriteConflict(WriteConflictError),
    /// A pessimistic acquisition closed a cycle in the waits-for graph.
    #[error("deadlock, conflicting key hash {key_hash}")]
    Deadlock {
        lock_ts: u64,
        key: Vec<u8>,
        key_hash: u64,
    },
    /// Insert over an existing value.
    #[error("key already exists")]
    KeyExists { key: Vec<u8> },
    /// An `Exist`/`NotExist` assertion did not hold.
    #[error("assertion failed for key of txn {start_ts}")]
    AssertionFailed {
        start_ts: u64,
        key: Vec<u8>,
        assertion: kvpb::Assertion,
    },
    /// The attempted commit ts fell below the lock's `min_commit_ts`; the
    /// caller should fetch a newer ts and retry the commit.
    #[error("commit ts {attempted_commit_ts} expired, min commit ts {min_commit_ts}")]
    CommitTsExpired {
        start_ts: u64,
        attempted_commit_ts: u64,
        min_commit_ts: u64,
        key: Vec<u8>,
    },
    /// The transaction was not found on the store.
    #[error("txn {start_ts} not found")]
    TxnNotFound { start_ts: u64 },
    /// The server aborted the transaction.
    #[error("txn aborted: {message}")]
    TxnAborted { message: String },
    /// The server asked the client to retry the whole transaction.
    #[error("retryable: {message}")]
    Retryable { message: String },
    /// Whether the transaction committed is genuinely unknown to the client.
    /// Once raised the logical commit must not be retried.
    #[error("whether the transaction is committed or not is undetermined")]
    Undetermined(Box<Error>),
    /// A region error the sender could not resolve locally.
    #[error("region error: {0:?}")]
    RegionError(Box<crate::proto::errorpb::Error>),
    /// A response arrived with neither errors nor a body.
    #[error("response body missing")]
    BodyMissing,
    /// The server committed with the 1PC protocol although the request did
    /// not ask for it.
    #[error("server returned one_pc_commit_ts for a non-1PC prewrite")]
    OnePcCommitMismatch { commit_ts: u64 },
    /// A 1PC prewrite fell back without clearing `min_commit_ts`.
    #[error("invalid prewrite response: min_commit_ts must be 0 when 1PC falls back")]
    OnePcFallbackInvalid,
    /// Leftover key errors that did not map to a typed variant.
    #[error("{0:?}")]
    KeyError(Box<kvpb::KeyError>),
    /// No region covers the key even after a PD load.
    #[error("region not found for key {key:?}")]
    RegionForKeyNotFound { key: Vec<u8> },
    #[error("region {region_id} not found in PD response")]
    RegionNotFoundInResponse { region_id: u64 },
    #[error("store {store_id} has an empty address")]
    EmptyStoreAddress { store_id: u64 },
    /// PD answered but the expected field was absent.
    #[error("missing {field} in PD response")]
    PdResponseMissing { field: &'static str },
    /// The retry budget of a backoff policy ran out.
    #[error("backoff exhausted: {0}")]
    Backoff(#[from] crate::backoff::BackofferError),
    #[error("invalid memcomparable key encoding")]
    InvalidKeyEncoding { key: Vec<u8> },
    /// A pessimistic-only operation was used on an optimistic transaction.
    #[error("invalid operation for this type of transaction")]
    InvalidTransactionType,
    /// Reads and writes are rejected after a commit or rollback attempt.
    #[error("cannot read or write data after any attempt to commit or roll back")]
    OperationAfterCommitError,
    /// An operation requires a primary key but the transaction is empty.
    #[error("transaction has no primary key")]
    NoPrimaryKey,
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::transport::Error),
    #[error("gRPC api error: {0}")]
    GrpcApi(#[from] tonic::Status),
    #[error("url error: {0}")]
    Url(#[from] tonic::codegen::http::uri::InvalidUri),
    #[error("{message}")]
    Internal { message: String },
    #[error("{0}")]
    StringError(String),
}

impl From<crate::proto::errorpb::Error> for Error {
    fn from(e: crate::proto::errorpb::Error) -> Error {
        Error::RegionError(Box::new(e))
    }
}

impl From<kvpb::KeyError> for Error {
    fn from(mut e: kvpb::KeyError) -> Error {
        if let Some(conflict) = e.conflict.take() {
            return Error::WriteConflict(conflict.into());
        }
        if let Some(deadlock) = e.deadlock.take() {
            return Error::Deadlock {
                lock_ts: deadlock.lock_ts,
                key: deadlock.lock_key,
                key_hash: deadlock.deadlock_key_hash,
            };
        }
        if let Some(exist) = e.already_exist.take() {
            return Error::KeyExists { key: exist.key };
        }
        if let Some(failed) = e.assertion_failed.take() {
            return Error::AssertionFailed {
                start_ts: failed.start_ts,
                key: failed.key,
                assertion: kvpb::Assertion::try_from(failed.assertion)
                    .unwrap_or(kvpb::Assertion::None),
            };
        }
        if let Some(expired) = e.commit_ts_expired.take() {
            return Error::CommitTsExpired {
                start_ts: expired.start_ts,
                attempted_commit_ts: expired.attempted_commit_ts,
                min_commit_ts: expired.min_commit_ts,
                key: expired.key,
            };
        }
        if let Some(txn_not_found) = e.txn_not_found.take() {
            return Error::TxnNotFound {
                start_ts: txn_not_found.start_ts,
            };
        }
        if !e.retryable.is_empty() {
            return Error::Retryable {
                message: std::mem::take(&mut e.retryable),
            };
        }
        if !e.abort.is_empty() {
            return Error::TxnAborted {
                message: std::mem::take(&mut e.abort),
            };
        }
        Error::KeyError(Box::new(e))
    }
}

/// A result holding an [`Error`](enum@Error).
pub type Result<T> = result::Result<T, Error>;

impl Error {
    pub fn is_write_conflict(&self) -> bool {
        self.any(&|e| matches!(e, Error::WriteConflict(_)))
    }

    pub fn is_deadlock(&self) -> bool {
        self.any(&|e| matches!(e, Error::Deadlock { .. }))
    }

    pub fn is_key_exists(&self) -> bool {
        self.any(&|e| matches!(e, Error::KeyExists { .. }))
    }

    pub fn is_undetermined(&self) -> bool {
        self.any(&|e| matches!(e, Error::Undetermined(_)))
    }

    /// Whether this error (or the error it wraps) matches the predicate.
    fn any(&self, pred: &dyn Fn(&Error) -> bool) -> bool {
        if pred(self) {
            return true;
        }
        match self {
            Error::Undetermined(inner) => inner.any(pred),
            _ => false,
        }
    }
}

#[doc(hidden)]
#[macro_export]
macro_rules! internal_err {
    ($e:expr) => ({
        $crate::Error::Internal {
            message: format!("[{}:{}]: {}", file!(), line!(), $e)
        }
    });
    ($f:tt, $($arg:expr),+) => ({
        $crate::internal_err!(format!($f, $($arg),+))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_error_conflict_maps_to_write_conflict() {
        let mut key_error = kvpb::KeyError::default();
        key_error.conflict = Some(kvpb::WriteConflict {
            start_ts: 1,
            conflict_ts: 2,
            conflict_commit_ts: 3,
            key: vec![0xAA],
            primary: vec![0xBB],
        });
        let err: Error = key_error.into();
        let Error::WriteConflict(conflict) = err else {
            panic!("expected Error::WriteConflict");
        };
        assert_eq!(conflict.start_ts, 1);
        assert_eq!(conflict.conflict_ts, 2);
        assert_eq!(conflict.conflict_commit_ts, 3);
        assert_eq!(conflict.key, vec![0xAA]);
        assert_eq!(conflict.primary, vec![0xBB]);
    }

    #[test]
    fn key_error_deadlock_maps_to_deadlock() {
        let mut key_error = kvpb::KeyError::default();
        key_error.deadlock = Some(kvpb::Deadlock {
            lock_ts: 10,
            lock_key: vec![0x11],
            deadlock_key_hash: 42,
        });
        let err: Error = key_error.into();
        let Error::Deadlock {
            lock_ts, key_hash, ..
        } = err
        else {
            panic!("expected Error::Deadlock");
        };
        assert_eq!(lock_ts, 10);
        assert_eq!(key_hash, 42);
    }

    #[test]
    fn key_error_commit_ts_expired_maps() {
        let mut key_error = kvpb::KeyError::default();
        key_error.commit_ts_expired = Some(kvpb::CommitTsExpired {
            start_ts: 5,
            attempted_commit_ts: 9,
            key: vec![0x01],
            min_commit_ts: 11,
        });
        let err: Error = key_error.into();
        let Error::CommitTsExpired {
            attempted_commit_ts,
            min_commit_ts,
            ..
        } = err
        else {
            panic!("expected Error::CommitTsExpired");
        };
        assert_eq!(attempted_commit_ts, 9);
        assert_eq!(min_commit_ts, 11);
    }

    #[test]
    fn error_queries_recurse_through_wrappers() {
        fn make_wc() -> Error {
            Error::WriteConflict(WriteConflictError {
                start_ts: 1,
                conflict_ts: 2,
                conflict_commit_ts: 3,
                key: vec![0x01],
                primary: vec![0x02],
            })
        }

        assert!(make_wc().is_write_conflict());
        assert!(!make_wc().is_deadlock());

        let wrapped = Error::Undetermined(Box::new(make_wc()));
        assert!(wrapped.is_write_conflict());
        assert!(wrapped.is_undetermined());
        assert!(!Error::NoPrimaryKey.is_undetermined());
    }

    #[test]
    fn internal_err_macro_contains_message() {
        let err = crate::internal_err!("boom");
        assert!(err.to_string().contains("boom"));
    }
}
