//! Service state types.
//!
//! Defines the state machine for the replication service lifecycle.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Starting ──────────────→ Failed
//!    │                              │   (no watermark,
//!    │                              │    store error)
//!    │                              ↓
//!    │          resume()        Running ─────────────→ RollbackRequired
//!    │        ┌──────────────→    │  │  (divergence)
//!    │        │                   │  │
//!    │      Paused ←──────────────┘  │ (fetcher aborted)
//!    │        (pause(), failed batch)└──────────────→ Failed
//!    │
//!    │ shutdown() (from any non-terminal state)
//!    ↓
//! ShuttingDown ──→ Stopped
//! ```
//!
//! # State Descriptions
//!
//! - **Created**: After `ReplicationService::new()`. Nothing running.
//! - **Starting**: Loading the watermark and spawning tasks.
//! - **Running**: Fetching and applying.
//! - **Paused**: No new reads. Either requested, or a batch failed and the
//!   service waits for [`ResumeMode`].
//! - **RollbackRequired**: Divergence handed to the rollback handler.
//! - **ShuttingDown**: Draining delivered operations.
//! - **Stopped**: Clean shutdown complete.
//! - **Failed**: Unrecoverable error. Check logs.

use crate::error::ErrorKind;
use crate::fetcher::{FetcherState, RollbackReason, Watermark};
use crate::oplog::OpTime;

/// State of the replication service.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Created,
    Starting,
    Running,
    Paused,
    RollbackRequired,
    ShuttingDown,
    Stopped,
    Failed,
}

impl ServiceState {
    /// No further transitions except `shutdown()` bookkeeping.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RollbackRequired | Self::Stopped | Self::Failed)
    }

    pub fn can_transition_to(&self, to: ServiceState) -> bool {
        match (self, to) {
            (from, to) if *from == to => false,
            (Self::Stopped, _) => false,
            (Self::ShuttingDown, to) => to == Self::Stopped,
            (Self::RollbackRequired | Self::Failed, to) => to == Self::ShuttingDown,
            _ => true,
        }
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceState::Created => write!(f, "Created"),
            ServiceState::Starting => write!(f, "Starting"),
            ServiceState::Running => write!(f, "Running"),
            ServiceState::Paused => write!(f, "Paused"),
            ServiceState::RollbackRequired => write!(f, "RollbackRequired"),
            ServiceState::ShuttingDown => write!(f, "ShuttingDown"),
            ServiceState::Stopped => write!(f, "Stopped"),
            ServiceState::Failed => write!(f, "Failed"),
        }
    }
}

/// What to do with a batch that failed to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeMode {
    /// Apply the failed batch again.
    Retry,
    /// Drop the failed batch and continue with the next one.
    SkipFailed,
}

/// A batch the applier could not apply, kept for an operator decision.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedBatch {
    /// `single_op`, `cud_batch` or `namespace_job`.
    pub batch: &'static str,
    pub first: OpTime,
    pub last: OpTime,
    pub ops: usize,
    pub kind: ErrorKind,
    pub error: String,
}

/// How the fetcher terminated, as reported through its view.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Finished,
    Aborted { kind: ErrorKind, message: String },
    Rollback(RollbackReason),
}

/// Snapshot for health endpoints. Collected without I/O.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub state: ServiceState,
    /// Running and the fetcher is streaming or selecting a source.
    pub ready: bool,
    /// Ready, no failed batch, and apply lag within SLO.
    pub healthy: bool,
    pub fetcher_state: Option<FetcherState>,
    pub fetched: Option<Watermark>,
    pub applied: Option<Watermark>,
    /// Delivered but not yet applied.
    pub pending_ops: u64,
    pub apply_lag_secs: u64,
    pub current_source: Option<String>,
    pub failed_batch: Option<FailedBatch>,
    pub fetch_outcome: Option<FetchOutcome>,
}
