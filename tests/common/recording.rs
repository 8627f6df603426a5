//! Recording fetcher view and rollback handler.
//!
//! Records all callbacks for assertions. The view can be told to interrupt
//! every n-th delivery attempt, which the fetcher must retry transparently.

use futures::future::{BoxFuture, FutureExt};
use oplog_replication::{
    DeliveryError, OplogOperation, OplogReader, ReplicationError, RollbackHandler, RollbackReason, SyncServiceView,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// How the fetcher terminated.
#[derive(Debug, Clone, PartialEq)]
pub enum Termination {
    Finished,
    Aborted(String),
    Rollback(RollbackReason),
}

/// [`SyncServiceView`] that accepts every delivery and records it.
#[derive(Default)]
pub struct RecordingView {
    delivered: Mutex<Vec<OplogOperation>>,
    terminations: Mutex<Vec<Termination>>,
    interrupt_every: usize,
    attempts: AtomicUsize,
    interruptions: AtomicUsize,
}

impl RecordingView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every `n`-th delivery attempt with [`DeliveryError::Interrupted`].
    pub fn interrupting_every(n: usize) -> Self {
        Self {
            interrupt_every: n,
            ..Self::default()
        }
    }

    pub fn delivered(&self) -> Vec<OplogOperation> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn delivered_len(&self) -> usize {
        self.delivered.lock().unwrap().len()
    }

    pub fn terminations(&self) -> Vec<Termination> {
        self.terminations.lock().unwrap().clone()
    }

    pub fn interruptions(&self) -> usize {
        self.interruptions.load(Ordering::SeqCst)
    }

    fn terminate(&self, termination: Termination) {
        self.terminations.lock().unwrap().push(termination);
    }
}

impl SyncServiceView for RecordingView {
    fn deliver(&self, op: &OplogOperation) -> BoxFuture<'_, Result<(), DeliveryError>> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let result = if self.interrupt_every > 0 && attempt % self.interrupt_every == 0 {
            self.interruptions.fetch_add(1, Ordering::SeqCst);
            Err(DeliveryError::Interrupted)
        } else {
            self.delivered.lock().unwrap().push(op.clone());
            Ok(())
        };
        async move { result }.boxed()
    }

    fn rollback(&self, mut reader: Box<dyn OplogReader>, reason: RollbackReason) -> BoxFuture<'_, ()> {
        self.terminate(Termination::Rollback(reason));
        async move { reader.close().await }.boxed()
    }

    fn should_pause(&self) -> bool {
        false
    }

    fn await_until_unpaused(&self) -> BoxFuture<'_, ()> {
        async {}.boxed()
    }

    fn await_until_all_fetched_are_applied(&self) -> BoxFuture<'_, ()> {
        async {}.boxed()
    }

    fn fetch_finished(&self) {
        self.terminate(Termination::Finished);
    }

    fn fetch_aborted(&self, cause: &ReplicationError) {
        self.terminate(Termination::Aborted(cause.to_string()));
    }
}

/// [`RollbackHandler`] that records `(replica, reason)` and closes the reader.
#[derive(Default)]
pub struct RecordingRollbackHandler {
    handled: Mutex<Vec<(String, RollbackReason)>>,
}

impl RecordingRollbackHandler {
    pub fn handled(&self) -> Vec<(String, RollbackReason)> {
        self.handled.lock().unwrap().clone()
    }
}

impl RollbackHandler for RecordingRollbackHandler {
    fn handle(&self, replica: &str, mut reader: Box<dyn OplogReader>, reason: RollbackReason) -> BoxFuture<'_, ()> {
        self.handled.lock().unwrap().push((replica.to_string(), reason));
        async move { reader.close().await }.boxed()
    }
}
