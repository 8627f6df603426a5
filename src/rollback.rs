// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Rollback handoff.
//!
//! When the fetcher finds that the local history diverged from the sync
//! source, it stops and hands the open reader plus the reason to a
//! [`RollbackHandler`]. Undoing local writes is the handler's business; the
//! service only guarantees the handoff happens once and nothing else is
//! applied afterwards.

use crate::fetcher::RollbackReason;
use crate::reader::OplogReader;
use futures::future::{BoxFuture, FutureExt};
use tracing::warn;

/// Receives the reader and reason when a rollback is detected.
///
/// The handler owns the reader and must close it.
pub trait RollbackHandler: Send + Sync {
    fn handle(&self, replica: &str, reader: Box<dyn OplogReader>, reason: RollbackReason) -> BoxFuture<'_, ()>;
}

/// Logs the rollback and closes the reader.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingRollbackHandler;

impl RollbackHandler for LoggingRollbackHandler {
    fn handle(&self, replica: &str, mut reader: Box<dyn OplogReader>, reason: RollbackReason) -> BoxFuture<'_, ()> {
        let replica = replica.to_string();
        async move {
            warn!(
                replica = %replica,
                source = %reader.source(),
                reason = reason.label(),
                watermark = %reason.watermark(),
                "Rollback required: {}",
                reason
            );
            reader.close().await;
        }
        .boxed()
    }
}
