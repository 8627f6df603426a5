//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Sync source selection and circuit state
//! - Oplog fetching performance and restarts
//! - Rollback detection and fetcher aborts
//! - Applier throughput and lag
//! - Watermark persistence
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replication_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! Executor metrics live in [`crate::executor::ExecutorMetrics`] under
//! `replication_oplog_batch_executor_*`.
//!
//! # Usage
//!
//! ```rust,no_run
//! use oplog_replication::metrics;
//! use std::time::Duration;
//!
//! // In the fetcher after reading a batch
//! metrics::record_batch_read("rs0", 42, Duration::from_millis(3));
//!
//! // In the applier after a batch commits
//! metrics::record_batch_applied("rs0", "cud_batch", 42, Duration::from_millis(8));
//! ```

use crate::error::ErrorKind;
use crate::fetcher::FetcherState;
use crate::oplog::OpTime;
use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Sync Source Metrics
// =============================================================================

/// Record that a sync source was chosen for a fetch attempt.
pub fn record_source_selected(replica: &str, source: &str) {
    counter!(
        "replication_source_selections_total",
        "replica" => replica.to_string(),
        "source" => source.to_string()
    )
    .increment(1);
}

/// Record a candidate's circuit opening after repeated failures.
pub fn record_source_circuit_open(replica: &str, source: &str) {
    counter!(
        "replication_source_circuit_opened_total",
        "replica" => replica.to_string(),
        "source" => source.to_string()
    )
    .increment(1);
}

// =============================================================================
// Fetcher Metrics
// =============================================================================

/// Gauge for fetcher state.
pub fn set_fetcher_state(replica: &str, state: FetcherState) {
    let value = match state {
        FetcherState::SelectingSource => 0.0,
        FetcherState::Streaming => 1.0,
        FetcherState::Restarting => 2.0,
        FetcherState::RollbackDetected => 3.0,
        FetcherState::Stopped => 4.0,
        FetcherState::Aborted => 5.0,
    };
    gauge!("replication_fetcher_state", "replica" => replica.to_string()).set(value);
}

/// Record one oplog batch read from the source.
pub fn record_batch_read(replica: &str, size: usize, latency: Duration) {
    histogram!("replication_batch_read_duration_seconds", "replica" => replica.to_string())
        .record(latency.as_secs_f64());
    histogram!("replication_batch_read_size", "replica" => replica.to_string()).record(size as f64);
}

/// Record one operation delivered downstream.
pub fn record_op_fetched(replica: &str, op_time: &OpTime) {
    counter!("replication_ops_fetched_total", "replica" => replica.to_string()).increment(1);
    gauge!("replication_last_fetched_op_secs", "replica" => replica.to_string()).set(f64::from(op_time.secs));
}

/// Record a pacing sleep (small batch inside the batching window).
pub fn record_pacing_sleep(replica: &str) {
    counter!("replication_pacing_sleeps_total", "replica" => replica.to_string()).increment(1);
}

/// Record a stream ended by a pause request.
pub fn record_fetcher_pause(replica: &str) {
    counter!("replication_fetcher_pauses_total", "replica" => replica.to_string()).increment(1);
}

/// Record a fetch attempt restart.
pub fn record_fetcher_restart(replica: &str, reason: &str) {
    counter!(
        "replication_fetcher_restarts_total",
        "replica" => replica.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record a recoverable fetcher error by kind.
pub fn record_fetcher_error(replica: &str, kind: ErrorKind) {
    counter!(
        "replication_fetcher_errors_total",
        "replica" => replica.to_string(),
        "kind" => kind.as_str()
    )
    .increment(1);
}

/// Record a fetcher abort.
pub fn record_fetcher_abort(replica: &str, kind: ErrorKind) {
    counter!(
        "replication_fetcher_aborts_total",
        "replica" => replica.to_string(),
        "kind" => kind.as_str()
    )
    .increment(1);
}

/// Record a detected rollback.
pub fn record_rollback_detected(replica: &str, reason: &str) {
    counter!(
        "replication_rollbacks_total",
        "replica" => replica.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

// =============================================================================
// Applier Metrics
// =============================================================================

/// Record one analyzed batch applied and committed.
pub fn record_batch_applied(replica: &str, batch: &'static str, size: usize, latency: Duration) {
    counter!(
        "replication_applied_ops_total",
        "replica" => replica.to_string(),
        "batch" => batch
    )
    .increment(size as u64);
    histogram!(
        "replication_batch_apply_duration_seconds",
        "replica" => replica.to_string(),
        "batch" => batch
    )
    .record(latency.as_secs_f64());
}

/// Set the applied position and lag behind the fetched position.
pub fn set_apply_lag(replica: &str, applied: &OpTime, lag_secs: u64) {
    gauge!("replication_last_applied_op_secs", "replica" => replica.to_string()).set(f64::from(applied.secs));
    gauge!("replication_apply_lag_seconds", "replica" => replica.to_string()).set(lag_secs as f64);
}

/// Set the number of operations delivered but not yet applied.
pub fn set_pending_ops(replica: &str, pending: u64) {
    gauge!("replication_pending_ops", "replica" => replica.to_string()).set(pending as f64);
}

/// Record the applier pausing replication on a failed batch.
pub fn record_applier_paused(replica: &str, kind: ErrorKind) {
    counter!(
        "replication_applier_pauses_total",
        "replica" => replica.to_string(),
        "kind" => kind.as_str()
    )
    .increment(1);
}

/// Record a failed batch skipped by the operator.
pub fn record_batch_skipped(replica: &str, ops: usize) {
    counter!("replication_skipped_ops_total", "replica" => replica.to_string()).increment(ops as u64);
}

// =============================================================================
// Service Metrics
// =============================================================================

/// Gauge for service state.
pub fn set_service_state(replica: &str, state: &str) {
    // Encode state as numeric for alerting
    let value = match state {
        "Created" => 0.0,
        "Starting" => 1.0,
        "Running" => 2.0,
        "Paused" => 3.0,
        "RollbackRequired" => 4.0,
        "ShuttingDown" => 5.0,
        "Stopped" => 6.0,
        "Failed" => 7.0,
        _ => -1.0,
    };
    gauge!("replication_service_state", "replica" => replica.to_string()).set(value);
}

/// Record an SLO violation.
pub fn record_slo_violation(replica: &str, kind: &str) {
    counter!(
        "replication_slo_violations_total",
        "replica" => replica.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

// =============================================================================
// Watermark Store Metrics
// =============================================================================

/// Record a watermark persisted.
pub fn record_watermark_saved(replica: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "replication_watermark_saves_total",
        "replica" => replica.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Record a watermark store SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn record_watermark_store_retry(operation: &str) {
    counter!("replication_watermark_store_retries_total", "operation" => operation.to_string()).increment(1);
}
