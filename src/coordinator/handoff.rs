// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fetcher → applier handoff.
//!
//! [`ChannelSyncView`] implements [`SyncServiceView`] over a bounded channel:
//!
//! ```text
//! fetcher ──deliver()──► mpsc (handoff_capacity) ──recv()──► applier
//!    │                                                          │
//!    │ await_until_all_fetched_are_applied()        mark_applied(n)
//!    └────────────── delivered == applied ◄─── Notify ──────────┘
//! ```
//!
//! A delivery that waits longer than `deliver_timeout` on a full channel is
//! reported as [`DeliveryError::Interrupted`]; the fetcher retries the same
//! operation, so nothing is lost or reordered.

use super::types::FetchOutcome;
use crate::error::ReplicationError;
use crate::fetcher::{DeliveryError, RollbackReason, SyncServiceView};
use crate::oplog::OplogOperation;
use crate::reader::OplogReader;
use crate::rollback::RollbackHandler;
use futures::future::{BoxFuture, FutureExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info};

/// Bounded-channel implementation of the fetcher's view.
pub struct ChannelSyncView {
    replica: String,
    tx: mpsc::Sender<OplogOperation>,
    deliver_timeout: Duration,
    delivered: AtomicU64,
    applied: AtomicU64,
    applied_notify: Notify,
    paused_tx: watch::Sender<bool>,
    outcome: Mutex<Option<FetchOutcome>>,
    terminations: AtomicU64,
    rollback_handler: Arc<dyn RollbackHandler>,
}

impl ChannelSyncView {
    /// Create the view and the applier's end of the channel.
    pub fn new(
        replica: &str,
        capacity: usize,
        deliver_timeout: Duration,
        rollback_handler: Arc<dyn RollbackHandler>,
    ) -> (Self, mpsc::Receiver<OplogOperation>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (paused_tx, _) = watch::channel(false);
        let view = Self {
            replica: replica.to_string(),
            tx,
            deliver_timeout,
            delivered: AtomicU64::new(0),
            applied: AtomicU64::new(0),
            applied_notify: Notify::new(),
            paused_tx,
            outcome: Mutex::new(None),
            terminations: AtomicU64::new(0),
            rollback_handler,
        };
        (view, rx)
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::SeqCst)
    }

    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::SeqCst)
    }

    /// Delivered but not yet applied.
    pub fn pending(&self) -> u64 {
        self.delivered().saturating_sub(self.applied())
    }

    /// Called by the applier once `count` operations are applied (or skipped).
    pub fn mark_applied(&self, count: u64) {
        self.applied.fetch_add(count, Ordering::SeqCst);
        self.applied_notify.notify_waiters();
    }

    pub fn pause(&self) {
        if !self.paused_tx.send_replace(true) {
            info!(replica = %self.replica, "Replication paused");
        }
    }

    pub fn resume(&self) {
        if self.paused_tx.send_replace(false) {
            info!(replica = %self.replica, "Replication resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        *self.paused_tx.borrow()
    }

    /// How the fetcher terminated, once it has.
    pub fn outcome(&self) -> Option<FetchOutcome> {
        self.outcome.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Number of termination callbacks received. Never more than one.
    pub fn terminations(&self) -> u64 {
        self.terminations.load(Ordering::SeqCst)
    }

    fn terminate(&self, outcome: FetchOutcome) {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        *self.outcome.lock().unwrap_or_else(PoisonError::into_inner) = Some(outcome);
    }
}

impl SyncServiceView for ChannelSyncView {
    fn deliver(&self, op: &OplogOperation) -> BoxFuture<'_, Result<(), DeliveryError>> {
        let op = op.clone();
        async move {
            match tokio::time::timeout(self.deliver_timeout, self.tx.send(op)).await {
                Ok(Ok(())) => {
                    self.delivered.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
                Ok(Err(_)) => Err(DeliveryError::Closed),
                Err(_) => {
                    debug!(replica = %self.replica, "Handoff channel full past deliver timeout");
                    Err(DeliveryError::Interrupted)
                }
            }
        }
        .boxed()
    }

    fn rollback(&self, reader: Box<dyn OplogReader>, reason: RollbackReason) -> BoxFuture<'_, ()> {
        async move {
            self.terminate(FetchOutcome::Rollback(reason.clone()));
            self.rollback_handler.handle(&self.replica, reader, reason).await;
        }
        .boxed()
    }

    fn should_pause(&self) -> bool {
        self.is_paused()
    }

    fn await_until_unpaused(&self) -> BoxFuture<'_, ()> {
        let mut paused_rx = self.paused_tx.subscribe();
        async move {
            // The sender lives as long as self
            let _ = paused_rx.wait_for(|paused| !*paused).await;
        }
        .boxed()
    }

    fn await_until_all_fetched_are_applied(&self) -> BoxFuture<'_, ()> {
        async move {
            loop {
                let notified = self.applied_notify.notified();
                if self.applied() >= self.delivered() {
                    return;
                }
                notified.await;
            }
        }
        .boxed()
    }

    fn fetch_finished(&self) {
        self.terminate(FetchOutcome::Finished);
    }

    fn fetch_aborted(&self, cause: &ReplicationError) {
        self.terminate(FetchOutcome::Aborted {
            kind: cause.kind(),
            message: cause.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oplog::{Namespace, OpKind, OpTime};
    use crate::rollback::LoggingRollbackHandler;
    use serde_json::json;

    fn op(inc: u32) -> OplogOperation {
        OplogOperation::chained(0, OpTime::new(1, 5, inc), OpKind::Insert, Namespace::parse("db.c"), json!({}))
    }

    fn view(capacity: usize) -> (Arc<ChannelSyncView>, mpsc::Receiver<OplogOperation>) {
        let (view, rx) = ChannelSyncView::new("rs0", capacity, Duration::from_millis(50), Arc::new(LoggingRollbackHandler));
        (Arc::new(view), rx)
    }

    #[tokio::test]
    async fn test_deliver_and_receive_in_order() {
        let (view, mut rx) = view(4);
        view.deliver(&op(1)).await.unwrap();
        view.deliver(&op(2)).await.unwrap();
        assert_eq!(view.delivered(), 2);
        assert_eq!(rx.recv().await.unwrap().op_time.inc, 1);
        assert_eq!(rx.recv().await.unwrap().op_time.inc, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_channel_reports_interrupted() {
        let (view, _rx) = view(1);
        view.deliver(&op(1)).await.unwrap();
        assert_eq!(view.deliver(&op(2)).await, Err(DeliveryError::Interrupted));
        assert_eq!(view.delivered(), 1);
    }

    #[tokio::test]
    async fn test_closed_channel() {
        let (view, rx) = view(1);
        drop(rx);
        assert_eq!(view.deliver(&op(1)).await, Err(DeliveryError::Closed));
    }

    #[tokio::test]
    async fn test_backpressure_waits_for_applied() {
        let (view, mut rx) = view(4);
        view.deliver(&op(1)).await.unwrap();
        view.deliver(&op(2)).await.unwrap();

        let waiter = {
            let view = Arc::clone(&view);
            tokio::spawn(async move { view.await_until_all_fetched_are_applied().await })
        };
        rx.recv().await.unwrap();
        view.mark_applied(1);
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        rx.recv().await.unwrap();
        view.mark_applied(1);
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(view.pending(), 0);
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let (view, _rx) = view(1);
        view.pause();
        assert!(view.should_pause());

        let waiter = {
            let view = Arc::clone(&view);
            tokio::spawn(async move { view.await_until_unpaused().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        view.resume();
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(!view.should_pause());
    }

    #[test]
    fn test_termination_recorded() {
        let (view, _rx) = view(1);
        assert!(view.outcome().is_none());
        view.fetch_aborted(&ReplicationError::OplogStartMissing { source_id: "db1:27017".into() });
        assert!(matches!(view.outcome(), Some(FetchOutcome::Aborted { .. })));
        assert_eq!(view.terminations(), 1);
    }
}
