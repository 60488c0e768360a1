//! Shared error model for cross-crate APIs.

use thiserror::Error;

use crate::ids::{PartitionId, TxnId};

/// Unified result type used by all public interfaces in `kestrel-rs`.
pub type KstResult<T> = Result<T, KstError>;

/// High-level error categories surfaced by the scheduling core.
///
/// Client-visible failures travel through the normal transaction-response channel wrapped
/// in one of these variants; internal estimator/ledger failures additionally downgrade the
/// owning partition to conservative admission.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KstError {
    /// Configuration is invalid for the requested operation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// Runtime state does not allow this operation.
    #[error("invalid runtime state: {0}")]
    InvalidState(&'static str),

    /// Transaction-path model artifact is malformed or semantically invalid.
    #[error("path model error: {0}")]
    Model(String),

    /// Partition store rejected or failed an execution request.
    #[error("storage error: {0}")]
    Storage(String),

    /// An undo record could not be applied cleanly.
    ///
    /// Fatal to the owning partition's consistency; the partition transitions to failed
    /// mode and every later submission is rejected.
    #[error("undo failure: {0}")]
    UndoFailure(String),

    /// The partition is in failed mode and accepts no further work.
    #[error("partition {0} is in failed mode")]
    PartitionFailed(PartitionId),

    /// The transaction was aborted before producing a committed result.
    #[error("transaction {0} aborted: {1}")]
    Aborted(TxnId, String),

    /// Filesystem I/O failed.
    #[error("io error: {0}")]
    Io(String),
}
