//! The fetcher's view of the replication service.
//!
//! [`SyncServiceView`] is the only way the fetcher talks downstream: it hands
//! over operations, asks whether to pause, waits for the applier to catch up,
//! and reports how it terminated. The service implements it over a bounded
//! channel (see [`ChannelSyncView`](crate::coordinator::ChannelSyncView));
//! tests implement it directly.

use super::types::RollbackReason;
use crate::error::ReplicationError;
use crate::oplog::OplogOperation;
use crate::reader::OplogReader;
use futures::future::BoxFuture;
use thiserror::Error;

/// Why a delivery did not go through.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// Spurious interruption; the fetcher retries the same operation.
    #[error("delivery interrupted")]
    Interrupted,

    /// The receiving side is gone.
    #[error("delivery channel closed")]
    Closed,
}

/// Downstream callbacks used by [`ReplicationFetcher`](super::ReplicationFetcher).
///
/// Exactly one of `rollback`, `fetch_finished` and `fetch_aborted` is invoked,
/// once, when the fetcher terminates.
pub trait SyncServiceView: Send + Sync {
    /// Hand one operation downstream. May block while downstream is full.
    fn deliver(&self, op: &OplogOperation) -> BoxFuture<'_, Result<(), DeliveryError>>;

    /// Divergence detected: take ownership of the open reader.
    fn rollback(&self, reader: Box<dyn OplogReader>, reason: RollbackReason) -> BoxFuture<'_, ()>;

    /// Whether the fetcher should stop reading at the next batch boundary.
    fn should_pause(&self) -> bool;

    fn await_until_unpaused(&self) -> BoxFuture<'_, ()>;

    /// Resolve once every delivered operation has been applied.
    fn await_until_all_fetched_are_applied(&self) -> BoxFuture<'_, ()>;

    /// The fetcher stopped on request.
    fn fetch_finished(&self);

    /// The fetcher stopped on an unrecoverable error.
    fn fetch_aborted(&self, cause: &ReplicationError);
}
