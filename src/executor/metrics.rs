//! Executor timing and size metrics.
//!
//! Per-kind timers are created on first use and cached in a [`DashMap`], so a
//! command name seen for the first time costs one registration and every later
//! operation of that kind is a map lookup.

use crate::oplog::{OpKind, OplogOperation};
use dashmap::DashMap;
use metrics::{counter, histogram, Histogram};
use std::time::Duration;

/// Key used for commands whose payload names no command.
pub const UNKNOWN_COMMAND: &str = "unknownCmd";

/// Metric key for one operation: the command name for commands, the
/// lower-cased kind otherwise.
pub fn timer_key(op: &OplogOperation) -> String {
    match op.kind {
        OpKind::Command => op.command_name().unwrap_or(UNKNOWN_COMMAND).to_string(),
        kind => kind.name().to_lowercase(),
    }
}

/// Metric handles owned by one executor.
pub struct ExecutorMetrics {
    replica: String,
    single_op_timers: DashMap<String, Histogram>,
    cud_batch_size: Histogram,
    cud_batch_timer: Histogram,
    namespace_job_timer: Histogram,
}

impl ExecutorMetrics {
    pub fn new(replica: &str) -> Self {
        let replica = replica.to_string();
        Self {
            cud_batch_size: histogram!("replication_oplog_batch_executor_cud_batch_size", "replica" => replica.clone()),
            cud_batch_timer: histogram!("replication_oplog_batch_executor_cud_batch_seconds", "replica" => replica.clone()),
            namespace_job_timer: histogram!(
                "replication_oplog_batch_executor_namespace_job_seconds",
                "replica" => replica.clone()
            ),
            single_op_timers: DashMap::new(),
            replica,
        }
    }

    pub fn record_single_op(&self, op: &OplogOperation, elapsed: Duration) {
        let key = timer_key(op);
        let label = key.clone();
        self.single_op_timers
            .entry(key)
            .or_insert_with(|| {
                histogram!(
                    "replication_oplog_batch_executor_single_op_seconds",
                    "replica" => self.replica.clone(),
                    "kind" => label
                )
            })
            .record(elapsed.as_secs_f64());
    }

    pub fn record_cud_batch(&self, size: usize, elapsed: Duration) {
        self.cud_batch_size.record(size as f64);
        self.cud_batch_timer.record(elapsed.as_secs_f64());
    }

    pub fn record_namespace_job(&self, elapsed: Duration) {
        self.namespace_job_timer.record(elapsed.as_secs_f64());
    }

    /// Extra attempts spent on backend conflicts for one batch.
    pub fn record_retries(&self, batch_kind: &'static str, retries: usize) {
        if retries > 0 {
            counter!(
                "replication_oplog_batch_executor_retries_total",
                "replica" => self.replica.clone(),
                "batch" => batch_kind
            )
            .increment(retries as u64);
        }
    }

    pub fn record_failure(&self, batch_kind: &'static str, outcome: &'static str) {
        counter!(
            "replication_oplog_batch_executor_failures_total",
            "replica" => self.replica.clone(),
            "batch" => batch_kind,
            "outcome" => outcome
        )
        .increment(1);
    }

    /// Number of distinct per-kind timers registered so far.
    pub fn timer_count(&self) -> usize {
        self.single_op_timers.len()
    }
}
