//! Fetcher state types.
//!
//! # State Transitions
//!
//! ```text
//!                     run()
//!                       │
//!                       ↓
//!               SelectingSource ←──────────── Restarting
//!                       │                          ↑
//!                       │ (reader open)            │ (transient error,
//!                       ↓                          │  better source, pause)
//!                   Streaming ─────────────────────┘
//!                  │    │    │
//!   (divergence)   │    │    │ (protocol violation / unexpected error)
//!                  ↓    │    ↓
//!    RollbackDetected   │   Aborted
//!                       │ (stop signal)
//!                       ↓
//!                    Stopped
//! ```
//!
//! `RollbackDetected`, `Stopped` and `Aborted` are terminal.

use crate::oplog::{OpTime, OplogOperation};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// State of one fetcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetcherState {
    /// Waiting on pause/backpressure, choosing a source, or opening a reader.
    SelectingSource,
    /// Reading batches and delivering operations.
    Streaming,
    /// Divergence detected; the reader was handed to the rollback handler.
    RollbackDetected,
    /// Closing the current attempt before reselecting.
    Restarting,
    /// Stopped on request.
    Stopped,
    /// Unrecoverable error; reported once through `fetch_aborted`.
    Aborted,
}

impl FetcherState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RollbackDetected | Self::Stopped | Self::Aborted)
    }
}

impl fmt::Display for FetcherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetcherState::SelectingSource => write!(f, "SelectingSource"),
            FetcherState::Streaming => write!(f, "Streaming"),
            FetcherState::RollbackDetected => write!(f, "RollbackDetected"),
            FetcherState::Restarting => write!(f, "Restarting"),
            FetcherState::Stopped => write!(f, "Stopped"),
            FetcherState::Aborted => write!(f, "Aborted"),
        }
    }
}

/// Position and hash of the last operation delivered downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub op_time: OpTime,
    pub hash: i64,
}

impl Watermark {
    pub fn new(op_time: OpTime, hash: i64) -> Self {
        Self { op_time, hash }
    }

    pub fn of(op: &OplogOperation) -> Self {
        Self::new(op.op_time, op.hash)
    }

    /// Exact `(op_time, hash)` match: the source agrees with our history up to here.
    pub fn matches(&self, op: &OplogOperation) -> bool {
        self.op_time == op.op_time && self.hash == op.hash
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (hash {})", self.op_time, self.hash)
    }
}

/// Why the fetcher declared a rollback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackReason {
    /// The source returned nothing at our position and its newest operation
    /// is older than our watermark.
    SourceBehind { watermark: Watermark, source_last: OpTime },
    /// The source's operation at our position differs from what we applied.
    Diverged { watermark: Watermark, source_first: Watermark },
}

impl RollbackReason {
    pub fn watermark(&self) -> Watermark {
        match self {
            Self::SourceBehind { watermark, .. } | Self::Diverged { watermark, .. } => *watermark,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::SourceBehind { .. } => "source_behind",
            Self::Diverged { .. } => "diverged",
        }
    }
}

impl fmt::Display for RollbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SourceBehind { watermark, source_last } => {
                write!(f, "source's last op {} is behind our watermark {}", source_last, watermark)
            }
            Self::Diverged { watermark, source_first } => {
                write!(f, "source has {} where we applied {}", source_first, watermark)
            }
        }
    }
}

/// Counters a fetcher exposes while it runs.
#[derive(Debug, Default)]
pub struct FetcherStats {
    ops_read: AtomicU64,
    restarts: AtomicU64,
    pauses: AtomicU64,
    pacing_sleeps: AtomicU64,
    rollbacks: AtomicU64,
}

impl FetcherStats {
    /// Operations delivered downstream.
    pub fn ops_read(&self) -> u64 {
        self.ops_read.load(Ordering::Relaxed)
    }

    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }

    /// Streams ended because replication was paused.
    pub fn pauses(&self) -> u64 {
        self.pauses.load(Ordering::Relaxed)
    }

    pub fn pacing_sleeps(&self) -> u64 {
        self.pacing_sleeps.load(Ordering::Relaxed)
    }

    pub fn rollbacks(&self) -> u64 {
        self.rollbacks.load(Ordering::Relaxed)
    }

    pub(crate) fn record_op_read(&self) {
        self.ops_read.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_restart(&self) {
        self.restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_pause(&self) {
        self.pauses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_pacing_sleep(&self) {
        self.pacing_sleeps.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rollback(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }
}
