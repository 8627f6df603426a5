// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Analyzed batch executor.
//!
//! Applies one [`AnalyzedOplogBatch`] inside one backend transaction:
//!
//! ```text
//! apply(batch)
//!   │
//!   ├── SingleOp      ──► execute_single        begin → apply → commit
//!   ├── CudBatch      ──► execute_cud           begin → apply × N → commit
//!   └── NamespaceJob  ──► execute_namespace_job begin → apply → commit
//!
//! BackendRollback ──► retry whole unit (bounded)    ──► GiveUp
//! anything else   ──► roll back, report immediately ──► ApplyAborted
//! ```
//!
//! A CUD batch either commits whole or leaves nothing behind; a failure at
//! position `k` is reported as `ApplyError::InBatch { index: k, .. }`.

pub mod metrics;

pub use metrics::ExecutorMetrics;

use crate::analyzer::{AnalyzedOplogBatch, CudBatch, NamespaceJob};
use crate::backend::{ApplierContext, StorageBackend};
use crate::error::{ApplyError, ReplicationError, Result};
use crate::oplog::OplogOperation;
use crate::resilience::{retry, RetryConfig, RetryError};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

/// Applies analyzed batches to a [`StorageBackend`].
pub struct AnalyzedOplogBatchExecutor {
    replica: String,
    backend: Arc<dyn StorageBackend>,
    conflict_retry: RetryConfig,
    metrics: ExecutorMetrics,
}

impl AnalyzedOplogBatchExecutor {
    pub fn new(replica: &str, backend: Arc<dyn StorageBackend>, conflict_retry: RetryConfig) -> Self {
        Self {
            replica: replica.to_string(),
            backend,
            conflict_retry,
            metrics: ExecutorMetrics::new(replica),
        }
    }

    pub fn metrics(&self) -> &ExecutorMetrics {
        &self.metrics
    }

    /// Apply one operation in its own transaction.
    #[instrument(skip_all, fields(replica = %self.replica, op_time = %op.op_time, kind = %op.kind))]
    pub async fn execute_single(&self, op: &OplogOperation, ctx: ApplierContext) -> std::result::Result<(), ApplyError> {
        let started = Instant::now();
        let mut tx = self.backend.begin(ctx).await.map_err(|e| e.at(op.op_time))?;

        if let Err(e) = tx.apply(op, ctx).await {
            tx.rollback().await;
            return Err(e.at(op.op_time));
        }
        tx.commit().await.map_err(|e| e.at(op.op_time))?;

        self.metrics.record_single_op(op, started.elapsed());
        Ok(())
    }

    /// Apply a whole CUD batch in one transaction, in order.
    #[instrument(skip_all, fields(replica = %self.replica, namespace = %batch.namespace, len = batch.ops.len()))]
    pub async fn execute_cud(&self, batch: &CudBatch, ctx: ApplierContext) -> std::result::Result<(), ApplyError> {
        let Some(last) = batch.ops.last() else {
            return Ok(());
        };
        let started = Instant::now();
        let mut tx = self.backend.begin(ctx).await.map_err(|e| e.at(batch.ops[0].op_time))?;

        for (index, op) in batch.ops.iter().enumerate() {
            if let Err(e) = tx.apply(op, ctx).await {
                tx.rollback().await;
                debug!(index, op_time = %op.op_time, error = %e, "CUD batch failed, rolled back");
                return Err(ApplyError::InBatch {
                    index,
                    namespace: batch.namespace.to_string(),
                    source: Box::new(e.at(op.op_time)),
                });
            }
        }
        tx.commit().await.map_err(|e| e.at(last.op_time))?;

        self.metrics.record_cud_batch(batch.ops.len(), started.elapsed());
        Ok(())
    }

    /// Apply a collection-level DDL operation in its own transaction.
    #[instrument(skip_all, fields(replica = %self.replica, namespace = %job.namespace, op_time = %job.op.op_time))]
    pub async fn execute_namespace_job(
        &self,
        job: &NamespaceJob,
        ctx: ApplierContext,
    ) -> std::result::Result<(), ApplyError> {
        let started = Instant::now();
        let mut tx = self.backend.begin(ctx).await.map_err(|e| e.at(job.op.op_time))?;

        if let Err(e) = tx.apply(&job.op, ctx).await {
            tx.rollback().await;
            return Err(e.at(job.op.op_time));
        }
        tx.commit().await.map_err(|e| e.at(job.op.op_time))?;

        self.metrics.record_namespace_job(started.elapsed());
        Ok(())
    }

    async fn execute(&self, batch: &AnalyzedOplogBatch, ctx: ApplierContext) -> std::result::Result<(), ApplyError> {
        match batch {
            AnalyzedOplogBatch::SingleOp(op) => self.execute_single(op, ctx).await,
            AnalyzedOplogBatch::CudBatch(cud) => self.execute_cud(cud, ctx).await,
            AnalyzedOplogBatch::NamespaceJob(job) => self.execute_namespace_job(job, ctx).await,
        }
    }

    /// Apply `batch`, retrying backend conflicts, and return its last operation.
    ///
    /// # Errors
    ///
    /// - [`ReplicationError::GiveUp`] once the conflict retry budget is spent
    /// - [`ReplicationError::ApplyAborted`] for any non-retryable failure
    pub async fn apply(&self, batch: &AnalyzedOplogBatch, ctx: ApplierContext) -> Result<OplogOperation> {
        let last_op = batch
            .last_op()
            .cloned()
            .ok_or_else(|| ReplicationError::Internal("empty analyzed batch".to_string()))?;

        let mut attempts = 0usize;
        let outcome = retry(&self.conflict_retry, batch.label(), |attempt| {
            attempts = attempt;
            self.execute(batch, ctx)
        })
        .await;
        self.metrics.record_retries(batch.label(), attempts.saturating_sub(1));

        match outcome {
            Ok(()) => Ok(last_op),
            Err(RetryError::GiveUp { attempts, last }) => {
                warn!(
                    replica = %self.replica,
                    batch = batch.label(),
                    attempts,
                    last_op = %last_op.op_time,
                    error = %last,
                    "Giving up on batch after repeated backend conflicts"
                );
                self.metrics.record_failure(batch.label(), "give_up");
                Err(ReplicationError::GiveUp { attempts, last })
            }
            Err(RetryError::Abort(cause)) => {
                warn!(
                    replica = %self.replica,
                    batch = batch.label(),
                    failed_index = ?cause.failed_index(),
                    error = %cause,
                    "Batch failed"
                );
                self.metrics.record_failure(batch.label(), "aborted");
                Err(ReplicationError::ApplyAborted(cause))
            }
        }
    }
}
