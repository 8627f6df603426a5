// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Applier task.
//!
//! Drains delivered operations in rounds, analyzes them, applies every batch
//! through the executor and persists the watermark after each commit.
//!
//! ```text
//! recv() ──► round (≤ max_ops_per_round) ──► analyze ──► record intent ──► apply batch ──► save watermark
//!                                                                              │
//!                                                          GiveUp / ApplyAborted
//!                                                                              ↓
//!                                                 keep failed ops, pause, wait for ResumeMode
//! ```
//!
//! # Replay Window
//!
//! After a restart every operation up to the stored apply intent may already
//! be in the backend. Batches starting inside that window run in reapplying
//! mode, however the window is split into rounds and batches.
//!
//! # Pause Ownership
//!
//! Recording a failure (and pausing) and clearing it (and resuming) both happen
//! under the `failed` lock, so an operator resume never sees a half-recorded
//! failure.
//! Decisions carry the first position of the failed batch; one sent for an
//! earlier failure is ignored.
//!
//! On shutdown the applier drains whatever is still in the channel, then exits.

use super::handoff::ChannelSyncView;
use super::types::{FailedBatch, ResumeMode, ServiceState};
use crate::analyzer::{AnalyzedOplogBatch, OplogBatchAnalyzer};
use crate::backend::ApplierContext;
use crate::config::{ApplierConfig, SloConfig};
use crate::error::{ReplicationError, Result};
use crate::executor::AnalyzedOplogBatchExecutor;
use crate::fetcher::Watermark;
use crate::metrics;
use crate::oplog::{OpTime, OplogOperation};
use crate::watermark::WatermarkStore;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// A round stopped at a batch that could not be applied.
struct RoundFailure {
    /// Operations of the failed batch, at the front of the pending run.
    failed_len: usize,
    error: ReplicationError,
}

pub(crate) struct Applier {
    pub replica: String,
    pub config: ApplierConfig,
    pub slo: SloConfig,
    pub rx: mpsc::Receiver<OplogOperation>,
    pub view: Arc<ChannelSyncView>,
    pub analyzer: OplogBatchAnalyzer,
    pub executor: AnalyzedOplogBatchExecutor,
    pub store: Option<Arc<WatermarkStore>>,
    pub state_tx: Arc<watch::Sender<ServiceState>>,
    pub applied_tx: Arc<watch::Sender<Option<Watermark>>>,
    pub fetched_rx: watch::Receiver<Watermark>,
    pub failed: Arc<Mutex<Option<FailedBatch>>>,
    /// Operator decisions, keyed by the first position of the failed batch.
    pub resume_rx: mpsc::Receiver<(OpTime, ResumeMode)>,
    pub shutdown_rx: watch::Receiver<bool>,
    /// Batches starting at or before this position may already be committed.
    pub replay_until: Option<OpTime>,
    /// Highest apply intent on record; starts at the stored one so replay
    /// never lowers it.
    pub intent: Option<OpTime>,
}

/// Resolves once stop is requested or the sender is gone.
pub(crate) async fn stop_requested(shutdown_rx: &mut watch::Receiver<bool>) {
    let _ = shutdown_rx.wait_for(|stop| *stop).await;
}

pub(crate) fn transition(state_tx: &watch::Sender<ServiceState>, replica: &str, to: ServiceState) -> bool {
    let changed = state_tx.send_if_modified(|state| {
        if state.can_transition_to(to) {
            *state = to;
            true
        } else {
            false
        }
    });
    if changed {
        metrics::set_service_state(replica, &to.to_string());
    }
    changed
}

impl Applier {
    pub async fn run(mut self) {
        let span = info_span!("applier", replica = %self.replica);
        async move {
            info!("Starting applier");
            if let Some(until) = self.replay_until {
                info!(until = %until, "Re-applying operations that may already be committed");
            }
            let mut pending: Vec<OplogOperation> = Vec::new();

            loop {
                if pending.is_empty() {
                    match self.next_round().await {
                        Some(round) => pending = round,
                        None => break,
                    }
                }

                let Err(failure) = self.apply_round(&mut pending).await else {
                    continue;
                };
                if *self.shutdown_rx.borrow() {
                    warn!(pending = pending.len(), error = %failure.error, "Batch failed during shutdown, leaving it unapplied");
                    break;
                }
                if !self.hold_failed(&mut pending, failure).await {
                    break;
                }
            }
            info!(applied = self.view.applied(), "Applier stopped");
        }
        .instrument(span)
        .await
    }

    /// Wait for at least one operation, then take whatever else is ready.
    /// `None` once shutdown is requested and the channel is empty.
    async fn next_round(&mut self) -> Option<Vec<OplogOperation>> {
        let first = if *self.shutdown_rx.borrow() {
            self.rx.try_recv().ok()?
        } else {
            tokio::select! {
                biased;
                op = self.rx.recv() => op?,
                () = stop_requested(&mut self.shutdown_rx) => self.rx.try_recv().ok()?,
            }
        };

        let mut round = Vec::with_capacity(self.config.max_ops_per_round.min(1024));
        round.push(first);
        while round.len() < self.config.max_ops_per_round {
            match self.rx.try_recv() {
                Ok(op) => round.push(op),
                Err(_) => break,
            }
        }
        metrics::set_pending_ops(&self.replica, self.view.pending());
        Some(round)
    }

    fn context(&self, reapplying: bool) -> ApplierContext {
        let base = if reapplying {
            ApplierContext::reapplying()
        } else {
            ApplierContext::normal()
        };
        base.with_updates_as_upserts(self.config.updates_as_upserts)
    }

    /// Whether `batch` starts inside the replay window.
    fn replays(&self, batch: &AnalyzedOplogBatch) -> bool {
        match (self.replay_until, batch.first_op()) {
            (Some(until), Some(first)) => first.op_time <= until,
            _ => false,
        }
    }

    /// Persist the apply intent for `batch` unless an earlier one covers it.
    async fn record_intent(&mut self, batch: &AnalyzedOplogBatch) -> Result<()> {
        let (Some(store), Some(last)) = (&self.store, batch.last_op()) else {
            return Ok(());
        };
        if self.intent.is_some_and(|intent| intent >= last.op_time) {
            return Ok(());
        }
        store.record_intent(&self.replica, last.op_time).await?;
        self.intent = Some(last.op_time);
        Ok(())
    }

    async fn apply_batch(&mut self, batch: &AnalyzedOplogBatch) -> Result<OplogOperation> {
        self.record_intent(batch).await?;
        let ctx = self.context(self.replays(batch));
        let last = self.executor.apply(batch, ctx).await?;

        if self.replay_until.is_some_and(|until| last.op_time >= until) {
            self.replay_until = None;
            info!(through = %last.op_time, "Replay window applied");
        }
        Ok(last)
    }

    /// Apply `pending` batch by batch. On failure `pending` holds the failed
    /// batch followed by everything after it.
    async fn apply_round(&mut self, pending: &mut Vec<OplogOperation>) -> std::result::Result<(), RoundFailure> {
        let batches = self.analyzer.analyze(std::mem::take(pending));
        debug!(batches = batches.len(), "Applying round");

        let mut batches = batches.into_iter();
        while let Some(batch) = batches.next() {
            let started = Instant::now();
            match self.apply_batch(&batch).await {
                Ok(last) => {
                    self.batch_applied(&batch, &last, started).await;
                }
                Err(error) => {
                    let failed_len = batch.len();
                    self.record_failure(&batch, &error);
                    *pending = std::iter::once(batch)
                        .chain(batches)
                        .flat_map(AnalyzedOplogBatch::into_ops)
                        .collect();
                    return Err(RoundFailure { failed_len, error });
                }
            }
        }
        Ok(())
    }

    async fn batch_applied(&self, batch: &AnalyzedOplogBatch, last: &OplogOperation, started: Instant) {
        let watermark = Watermark::of(last);
        self.persist(&watermark).await;
        self.applied_tx.send_replace(Some(watermark));
        self.view.mark_applied(batch.len() as u64);

        let latency = started.elapsed();
        metrics::record_batch_applied(&self.replica, batch.label(), batch.len(), latency);
        if self.slo.is_batch_apply_violation(latency) {
            warn!(
                batch = batch.label(),
                ops = batch.len(),
                latency_ms = latency.as_millis() as u64,
                threshold_ms = self.slo.max_batch_apply_latency_ms,
                "Batch apply exceeded SLO"
            );
            metrics::record_slo_violation(&self.replica, "batch_apply");
        }

        let fetched = self.fetched_rx.borrow().op_time;
        let lag = watermark.op_time.lag_secs(&fetched);
        metrics::set_apply_lag(&self.replica, &watermark.op_time, lag);
        if self.slo.is_apply_lag_violation(lag) {
            metrics::record_slo_violation(&self.replica, "apply_lag");
        }
    }

    async fn persist(&self, watermark: &Watermark) {
        let Some(store) = &self.store else {
            return;
        };
        // A failed save only widens the window re-applied after a restart
        if let Err(e) = store.save(&self.replica, watermark).await {
            error!(watermark = %watermark, error = %e, "Failed to persist watermark");
        }
    }

    /// Keep the failure for the operator and pause replication.
    fn record_failure(&mut self, batch: &AnalyzedOplogBatch, error: &ReplicationError) {
        let (Some(first), Some(last)) = (batch.first_op(), batch.last_op()) else {
            return;
        };
        error!(
            batch = batch.label(),
            first = %first.op_time,
            last = %last.op_time,
            kind = %error.kind(),
            error = %error,
            "Batch could not be applied, pausing replication"
        );
        metrics::record_applier_paused(&self.replica, error.kind());

        let mut failed = self.failed.lock().unwrap_or_else(PoisonError::into_inner);
        *failed = Some(FailedBatch {
            batch: batch.label(),
            first: first.op_time,
            last: last.op_time,
            ops: batch.len(),
            kind: error.kind(),
            error: error.to_string(),
        });
        self.view.pause();
        transition(&self.state_tx, &self.replica, ServiceState::Paused);
    }

    /// Pause until the operator decides. Returns `false` on shutdown.
    async fn hold_failed(&mut self, pending: &mut Vec<OplogOperation>, failure: RoundFailure) -> bool {
        let held = pending.first().map(|op| op.op_time);
        let mode = loop {
            let decision = tokio::select! {
                biased;
                () = stop_requested(&mut self.shutdown_rx) => None,
                decision = self.resume_rx.recv() => decision,
            };
            match decision {
                None => return false,
                Some((first, mode)) if Some(first) == held => break mode,
                Some((first, _)) => debug!(%first, "Ignoring decision for an earlier failed batch"),
            }
        };

        match mode {
            ResumeMode::Retry => {
                info!(ops = failure.failed_len, "Retrying failed batch");
            }
            ResumeMode::SkipFailed => {
                let skipped: Vec<OplogOperation> = pending.drain(..failure.failed_len.min(pending.len())).collect();
                if let Some(last) = skipped.last() {
                    let watermark = Watermark::of(last);
                    warn!(ops = skipped.len(), through = %watermark, "Skipping failed batch");
                    self.persist(&watermark).await;
                    self.applied_tx.send_replace(Some(watermark));
                }
                metrics::record_batch_skipped(&self.replica, skipped.len());
                self.view.mark_applied(skipped.len() as u64);
            }
        }

        let mut failed = self.failed.lock().unwrap_or_else(PoisonError::into_inner);
        *failed = None;
        transition(&self.state_tx, &self.replica, ServiceState::Running);
        self.view.resume();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::oplog::OpKind;
    use crate::reader::MemoryOplog;
    use crate::resilience::RetryConfig;
    use crate::rollback::LoggingRollbackHandler;
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        applier: Applier,
        resume_tx: mpsc::Sender<(OpTime, ResumeMode)>,
        _shutdown_tx: watch::Sender<bool>,
        _fetched_tx: watch::Sender<Watermark>,
    }

    fn fixture(backend: &MemoryBackend, store: Option<Arc<WatermarkStore>>, replay_until: Option<OpTime>) -> Fixture {
        let (view, rx) = ChannelSyncView::new("rs0", 4, Duration::from_millis(50), Arc::new(LoggingRollbackHandler));
        let (resume_tx, resume_rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (fetched_tx, fetched_rx) = watch::channel(Watermark::new(OpTime::new(1, 1, 0), 0));
        let applier = Applier {
            replica: "rs0".to_string(),
            config: ApplierConfig::for_testing(),
            slo: SloConfig::default(),
            rx,
            view: Arc::new(view),
            analyzer: OplogBatchAnalyzer::default(),
            executor: AnalyzedOplogBatchExecutor::new("rs0", Arc::new(backend.clone()), RetryConfig::testing()),
            store,
            state_tx: Arc::new(watch::channel(ServiceState::Running).0),
            applied_tx: Arc::new(watch::channel(None).0),
            fetched_rx,
            failed: Arc::new(Mutex::new(None)),
            resume_rx,
            shutdown_rx,
            replay_until,
            intent: replay_until,
        };
        Fixture { applier, resume_tx, _shutdown_tx: shutdown_tx, _fetched_tx: fetched_tx }
    }

    fn ops(n: usize) -> Vec<OplogOperation> {
        let log = MemoryOplog::new();
        (0..n).map(|i| log.append(OpKind::Insert, "app.users", json!({"_id": i}))).collect()
    }

    fn single(op: &OplogOperation) -> AnalyzedOplogBatch {
        let mut batches = OplogBatchAnalyzer::default().analyze([op.clone()]);
        batches.remove(0)
    }

    #[tokio::test]
    async fn test_decision_for_earlier_failure_is_ignored() {
        let backend = MemoryBackend::new();
        let ops = ops(3);
        let mut f = fixture(&backend, None, None);

        let failed = single(&ops[1]);
        f.applier.record_failure(&failed, &ReplicationError::Internal("rejected".into()));
        assert_eq!(*f.applier.state_tx.borrow(), ServiceState::Paused);

        f.resume_tx.send((ops[0].op_time, ResumeMode::SkipFailed)).await.unwrap();
        f.resume_tx.send((ops[1].op_time, ResumeMode::Retry)).await.unwrap();

        let mut pending = ops[1..].to_vec();
        let failure = RoundFailure {
            failed_len: 1,
            error: ReplicationError::Internal("rejected".into()),
        };
        assert!(f.applier.hold_failed(&mut pending, failure).await);

        // Retried, not skipped
        assert_eq!(pending, ops[1..].to_vec());
        assert_eq!(*f.applier.applied_tx.borrow(), None);
        assert!(f.applier.failed.lock().unwrap().is_none());
        assert_eq!(*f.applier.state_tx.borrow(), ServiceState::Running);
    }

    #[tokio::test]
    async fn test_replay_window_spans_batches_and_keeps_intent() {
        let backend = MemoryBackend::new();
        let ops = ops(5);
        let executor = AnalyzedOplogBatchExecutor::new("rs0", Arc::new(backend.clone()), RetryConfig::testing());
        let committed = OplogBatchAnalyzer::default().analyze(ops[..3].to_vec());
        for batch in &committed {
            executor.apply(batch, ApplierContext::normal()).await.unwrap();
        }

        let store = Arc::new(WatermarkStore::in_memory().await.unwrap());
        let mut f = fixture(&backend, Some(Arc::clone(&store)), Some(ops[2].op_time));

        for op in &ops[..3] {
            f.applier.apply_batch(&single(op)).await.unwrap();
            // Covered by the window, nothing rewritten
            assert_eq!(store.load_intent("rs0").await.unwrap(), None);
        }
        assert_eq!(f.applier.replay_until, None);

        // Outside the window duplicates fail again
        f.applier.apply_batch(&single(&ops[3])).await.unwrap();
        assert_eq!(store.load_intent("rs0").await.unwrap(), Some(ops[3].op_time));
        assert!(f.applier.apply_batch(&single(&ops[3])).await.is_err());

        assert_eq!(backend.committed(), ops[..4].to_vec());
    }
}
