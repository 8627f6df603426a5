// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Oplog readers.
//!
//! A reader is a connection to one sync source's oplog. The fetcher opens one
//! reader per fetch attempt, asks it for a tailing cursor positioned at the
//! watermark, and closes it on every exit path (or hands it to the rollback
//! handler).
//!
//! ```text
//! OplogReaderProvider ──new_reader(source)──► OplogReader
//!                                                 │
//!                         query_gte(op_time) ─────┤──► OplogCursor ──fetch_batch()──► OplogBatch
//!                         get_last_op() ──────────┘
//! ```
//!
//! Network-facing implementations live outside this crate. [`memory`] provides
//! an in-process source used by the tests and by embedders that replicate
//! between two local stores.

pub mod memory;

use crate::error::Result;
use crate::oplog::{OpTime, OplogOperation};
use crate::sync_source::SyncSource;
use futures::future::BoxFuture;
use std::collections::VecDeque;
use tokio::time::Instant;

pub use memory::{Fault, MemoryOplog, MemoryReaderProvider};

/// Ordered window of operations returned by one cursor round trip.
#[derive(Debug, Clone)]
pub struct OplogBatch {
    ops: VecDeque<OplogOperation>,
    size: usize,
    fetched_at: Instant,
}

impl OplogBatch {
    pub fn new(ops: Vec<OplogOperation>) -> Self {
        Self {
            size: ops.len(),
            ops: ops.into(),
            fetched_at: Instant::now(),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Number of operations the batch was fetched with.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Operations not yet consumed.
    pub fn remaining(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn fetched_at(&self) -> Instant {
        self.fetched_at
    }

    pub fn peek(&self) -> Option<&OplogOperation> {
        self.ops.front()
    }

    pub fn pop_front(&mut self) -> Option<OplogOperation> {
        self.ops.pop_front()
    }
}

/// Tailing cursor over one source's oplog.
pub trait OplogCursor: Send {
    /// Next batch of operations, possibly empty when the source is idle.
    ///
    /// `Ok(None)` means the remote cursor is gone and the attempt must restart.
    fn fetch_batch(&mut self) -> BoxFuture<'_, Result<Option<OplogBatch>>>;

    fn close(&mut self) -> BoxFuture<'_, ()>;
}

/// Connection to one sync source's oplog.
pub trait OplogReader: Send {
    fn source(&self) -> &SyncSource;

    /// Tailing cursor over operations at or after `from`.
    fn query_gte(&mut self, from: OpTime) -> BoxFuture<'_, Result<Box<dyn OplogCursor>>>;

    /// Most recent operation on the source.
    ///
    /// Fails with `OplogStartMissing` if the log is empty and
    /// `UnsupportedOperation` if the entry cannot be interpreted.
    fn get_last_op(&mut self) -> BoxFuture<'_, Result<OplogOperation>>;

    fn close(&mut self) -> BoxFuture<'_, ()>;
}

/// Opens readers against sync sources.
pub trait OplogReaderProvider: Send + Sync {
    /// Fails with `SourceUnreachable` when the source cannot be contacted.
    fn new_reader(&self, source: &SyncSource) -> BoxFuture<'_, Result<Box<dyn OplogReader>>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oplog::{Namespace, OpKind};
    use serde_json::json;

    #[test]
    fn test_batch_tracks_original_size() {
        let ops = (0..3)
            .map(|i| {
                OplogOperation::chained(0, OpTime::new(1, 10, i), OpKind::Noop, Namespace::parse(""), json!({}))
            })
            .collect();
        let mut batch = OplogBatch::new(ops);
        assert_eq!(batch.size(), 3);
        assert_eq!(batch.peek().map(|op| op.op_time.inc), Some(0));

        batch.pop_front();
        batch.pop_front();
        assert_eq!(batch.size(), 3);
        assert_eq!(batch.remaining(), 1);
        assert!(!batch.is_empty());

        batch.pop_front();
        assert!(batch.is_empty());
        assert!(batch.pop_front().is_none());
    }

    #[test]
    fn test_empty_batch() {
        let batch = OplogBatch::empty();
        assert_eq!(batch.size(), 0);
        assert!(batch.is_empty());
    }
}
