// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replication engine.
//!
//! Two layers of errors live here:
//!
//! - [`ReplicationError`]: everything the fetcher, the service and the
//!   watermark store can fail with. Each variant maps to a closed
//!   [`ErrorKind`] with a stable discriminant.
//! - [`ApplyError`]: what the batch executor reports when a single operation
//!   or a batch cannot be applied to the local store.
//!
//! # Error Categories
//!
//! | Variant | Kind | Retryable | Fetcher reaction |
//! |---------|------|-----------|------------------|
//! | `SourceUnreachable` | `SourceUnreachable` | Yes | sleep, reselect |
//! | `NoSyncSource` | `NoSyncSource` | Yes | sleep, reselect |
//! | `Network` | `Transient` | Yes | restart attempt |
//! | `OplogStartMissing` | `ProtocolViolation` | No | abort |
//! | `UnsupportedOperation` | `ProtocolViolation` | No | abort |
//! | `OutOfOrder` | `ProtocolViolation` | No | abort |
//! | `GiveUp` | `GiveUp` | No | batch fails |
//! | `ApplyAborted` | `Abort` / `UserData` | No | batch fails |
//! | `WatermarkStore` | `Storage` | No | operator attention |
//! | `Config` | `Config` | No | fix and restart |
//! | `InvalidState` | `Internal` | No | caller bug |
//! | `Shutdown` | `Shutdown` | No | terminating |
//! | `Internal` | `Internal` | No | abort |

use crate::oplog::OpTime;
use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Closed classification of every failure the engine can report.
///
/// Discriminants are stable and may be exported (e.g. as a metric label value
/// or an exit code).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorKind {
    SourceUnreachable = 1,
    NoSyncSource = 2,
    Transient = 3,
    Rollback = 4,
    ProtocolViolation = 5,
    GiveUp = 6,
    Abort = 7,
    UserData = 8,
    Config = 9,
    Storage = 10,
    Shutdown = 11,
    Internal = 12,
}

impl ErrorKind {
    /// Short label used for logging and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SourceUnreachable => "source_unreachable",
            Self::NoSyncSource => "no_sync_source",
            Self::Transient => "transient",
            Self::Rollback => "rollback",
            Self::ProtocolViolation => "protocol_violation",
            Self::GiveUp => "give_up",
            Self::Abort => "abort",
            Self::UserData => "user_data",
            Self::Config => "config",
            Self::Storage => "storage",
            Self::Shutdown => "shutdown",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur during replication.
///
/// Use [`is_retryable()`](Self::is_retryable) to check whether the fetcher
/// should try again, and [`kind()`](Self::kind) for the closed classification.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// The chosen sync source could not be contacted.
    #[error("Sync source {source_id} unreachable: {message}")]
    SourceUnreachable { source_id: String, message: String },

    /// No candidate qualifies as a sync source right now.
    #[error("No sync source available: {0}")]
    NoSyncSource(String),

    /// Transient network or backend failure while streaming.
    ///
    /// The fetch attempt is restarted from the current watermark.
    #[error("Network error ({operation}): {message}")]
    Network { operation: String, message: String },

    /// The source's oplog is empty, so our position cannot be verified.
    #[error("Oplog start missing on {source_id}")]
    OplogStartMissing { source_id: String },

    /// The source returned an operation we cannot interpret.
    #[error("Unsupported oplog operation kind {kind:?}")]
    UnsupportedOperation { kind: String },

    /// The source returned an operation that does not advance the watermark.
    #[error("Out of order operation: {received} does not follow {watermark}")]
    OutOfOrder { watermark: OpTime, received: OpTime },

    /// Backend conflict retries were exhausted for one batch.
    #[error("Gave up applying batch after {attempts} attempts: {last}")]
    GiveUp {
        attempts: usize,
        #[source]
        last: ApplyError,
    },

    /// A batch failed with a non-retryable error.
    #[error("Apply aborted: {0}")]
    ApplyAborted(#[source] ApplyError),

    /// SQLite error while persisting the watermark.
    ///
    /// Not retryable - indicates local database issues that need attention.
    #[error("Watermark store error: {0}")]
    WatermarkStore(#[from] sqlx::Error),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation attempted in the wrong lifecycle state.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a network error.
    pub fn network(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Network {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a source-unreachable error.
    pub fn unreachable(source_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SourceUnreachable {
            source_id: source_id.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::SourceUnreachable { .. } => true,
            Self::NoSyncSource(_) => true,
            Self::Network { .. } => true,
            Self::OplogStartMissing { .. } => false,
            Self::UnsupportedOperation { .. } => false,
            Self::OutOfOrder { .. } => false,
            Self::GiveUp { .. } => false,
            Self::ApplyAborted(_) => false,
            Self::WatermarkStore(_) => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Closed classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SourceUnreachable { .. } => ErrorKind::SourceUnreachable,
            Self::NoSyncSource(_) => ErrorKind::NoSyncSource,
            Self::Network { .. } => ErrorKind::Transient,
            Self::OplogStartMissing { .. }
            | Self::UnsupportedOperation { .. }
            | Self::OutOfOrder { .. } => ErrorKind::ProtocolViolation,
            Self::GiveUp { .. } => ErrorKind::GiveUp,
            Self::ApplyAborted(e) if e.root().is_user_data() => ErrorKind::UserData,
            Self::ApplyAborted(_) => ErrorKind::Abort,
            Self::WatermarkStore(_) => ErrorKind::Storage,
            Self::Config(_) => ErrorKind::Config,
            Self::InvalidState { .. } => ErrorKind::Internal,
            Self::Shutdown => ErrorKind::Shutdown,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// Errors reported by the batch executor.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    /// The operation could not be translated into a backend write.
    #[error("Cannot apply operation at {op_time}: {message}")]
    Translation { op_time: OpTime, message: String },

    /// The backend rolled the transaction back (conflict, deadlock, serialization).
    ///
    /// Retryable under the executor's retry policy.
    #[error("Backend rolled back the transaction: {message}")]
    BackendRollback { message: String },

    /// The backend rejected data that is legal in the document model.
    #[error("User data rejected at {op_time}: {message}")]
    UserData { op_time: OpTime, message: String },

    /// One operation of a CUD batch failed; nothing of the batch was committed.
    #[error("Operation {index} of batch on {namespace} failed: {source}")]
    InBatch {
        index: usize,
        namespace: String,
        #[source]
        source: Box<ApplyError>,
    },
}

impl ApplyError {
    /// Whether the executor should retry the whole unit of work.
    pub fn is_retryable(&self) -> bool {
        matches!(self.root(), Self::BackendRollback { .. })
    }

    /// Index of the failed operation inside its batch, if the failure came from a batch.
    pub fn failed_index(&self) -> Option<usize> {
        match self {
            Self::InBatch { index, .. } => Some(*index),
            _ => None,
        }
    }

    /// The innermost error, unwrapping batch context.
    pub fn root(&self) -> &ApplyError {
        match self {
            Self::InBatch { source, .. } => source.root(),
            other => other,
        }
    }

    fn is_user_data(&self) -> bool {
        matches!(self, Self::UserData { .. })
    }
}
