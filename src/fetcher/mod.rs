// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Oplog fetcher.
//!
//! One [`ReplicationFetcher`] per replicated source. It runs as a single task
//! that repeatedly:
//!
//! 1. Waits while replication is paused and until everything it delivered
//!    has been applied (backpressure)
//! 2. Selects a sync source and opens a reader at the watermark
//! 3. Verifies the first batch against the watermark (rollback detection)
//! 4. Streams operations one at a time into the [`SyncServiceView`],
//!    advancing the watermark after each accepted delivery
//!
//! Each pass through these steps is an *attempt*. Transient failures, a better
//! sync source, a lost cursor or a pause request end the attempt and the loop
//! starts another one. Rollback, stop and unrecoverable errors end the task.
//!
//! # Rollback Detection
//!
//! ```text
//! first batch empty  → source.get_last_op().op_time < watermark.op_time ⇒ SourceBehind
//! first batch        → first.(op_time, hash) != watermark               ⇒ Diverged
//!                      otherwise the first op is ours already and is discarded
//! ```
//!
//! # Adaptive Batching
//!
//! When a batch had fewer than `min_batch_size` operations and was fetched
//! less than `batching_window` ago, the fetcher sleeps `batching_sleep` before
//! the next fetch so a trickle of writes is collected into larger batches.
//!
//! # Cancellation
//!
//! The shutdown `watch` channel is raced against every await point. On stop,
//! the cursor and reader are closed and `fetch_finished` is called once.

mod types;
mod view;

pub use types::{FetcherState, FetcherStats, RollbackReason, Watermark};
pub use view::{DeliveryError, SyncServiceView};

use crate::config::{FetcherConfig, SloConfig};
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::oplog::OplogOperation;
use crate::reader::{OplogBatch, OplogCursor, OplogReader, OplogReaderProvider};
use crate::sync_source::SyncSourceProvider;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Outcome of one fetch attempt.
enum Attempt {
    Stopped,
    /// Source selection failed; the retry delay has already elapsed.
    Reselect,
    /// Replication was paused mid-stream; the next attempt waits it out.
    Paused,
    Restart {
        reason: &'static str,
        failed: bool,
        progressed: bool,
    },
    Rollback(Box<dyn OplogReader>, RollbackReason),
    Abort(ReplicationError),
}

/// How streaming from an open reader ended.
enum StreamEnd {
    Stopped,
    Paused,
    Restart(&'static str),
    Rollback(RollbackReason),
}

enum Fetched {
    Batch(OplogBatch),
    Lost,
    Stopped,
}

/// Run `fut` unless the stop signal fires first. `None` means stop.
///
/// A dropped sender counts as a stop request.
async fn until_stopped<F: Future>(shutdown: &mut watch::Receiver<bool>, fut: F) -> Option<F::Output> {
    if *shutdown.borrow() {
        return None;
    }
    tokio::pin!(fut);
    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return None;
                }
            }
            out = &mut fut => return Some(out),
        }
    }
}

/// Fetch loop for one replicated source.
pub struct ReplicationFetcher {
    replica: String,
    config: FetcherConfig,
    slo: SloConfig,
    sources: Arc<dyn SyncSourceProvider>,
    readers: Arc<dyn OplogReaderProvider>,
    view: Arc<dyn SyncServiceView>,
    watermark_tx: watch::Sender<Watermark>,
    state_tx: watch::Sender<FetcherState>,
    shutdown_rx: watch::Receiver<bool>,
    stats: Arc<FetcherStats>,
}

impl ReplicationFetcher {
    /// Create a fetcher resuming after `watermark`.
    pub fn new(
        replica: impl Into<String>,
        config: FetcherConfig,
        watermark: Watermark,
        sources: Arc<dyn SyncSourceProvider>,
        readers: Arc<dyn OplogReaderProvider>,
        view: Arc<dyn SyncServiceView>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let (watermark_tx, _) = watch::channel(watermark);
        let (state_tx, _) = watch::channel(FetcherState::SelectingSource);
        Self {
            replica: replica.into(),
            config,
            slo: SloConfig::default(),
            sources,
            readers,
            view,
            watermark_tx,
            state_tx,
            shutdown_rx,
            stats: Arc::new(FetcherStats::default()),
        }
    }

    pub fn with_slo(mut self, slo: SloConfig) -> Self {
        self.slo = slo;
        self
    }

    /// Snapshot receiver for the watermark. The fetcher is its only writer.
    pub fn watermark(&self) -> watch::Receiver<Watermark> {
        self.watermark_tx.subscribe()
    }

    pub fn state(&self) -> watch::Receiver<FetcherState> {
        self.state_tx.subscribe()
    }

    pub fn stats(&self) -> Arc<FetcherStats> {
        Arc::clone(&self.stats)
    }

    fn current(&self) -> Watermark {
        *self.watermark_tx.borrow()
    }

    fn set_state(&self, state: FetcherState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Fetcher state change");
            metrics::set_fetcher_state(&self.replica, state);
        }
    }

    /// Run until stopped, rolled back or aborted. Returns the terminal state.
    pub async fn run(mut self) -> FetcherState {
        let span = info_span!("fetcher", replica = %self.replica);

        async move {
            info!(watermark = %self.current(), "Starting oplog fetcher");

            let backoff = self.config.restart_backoff();
            let mut consecutive_failures = 0usize;

            let outcome = loop {
                match self.run_attempt().await {
                    Attempt::Reselect => continue,
                    Attempt::Paused => {
                        self.stats.record_pause();
                        metrics::record_fetcher_pause(&self.replica);
                    }
                    Attempt::Restart { reason, failed, progressed } => {
                        self.set_state(FetcherState::Restarting);
                        self.stats.record_restart();
                        metrics::record_fetcher_restart(&self.replica, reason);

                        if progressed {
                            consecutive_failures = 0;
                        }
                        if failed {
                            consecutive_failures += 1;
                            let delay = backoff.delay_for_attempt(consecutive_failures);
                            debug!(reason, delay_ms = delay.as_millis() as u64, "Backing off before restart");
                            if until_stopped(&mut self.shutdown_rx, tokio::time::sleep(delay)).await.is_none() {
                                break Attempt::Stopped;
                            }
                        }
                    }
                    terminal => break terminal,
                }
            };

            match outcome {
                Attempt::Rollback(reader, reason) => {
                    self.set_state(FetcherState::RollbackDetected);
                    self.stats.record_rollback();
                    metrics::record_rollback_detected(&self.replica, reason.label());
                    warn!(source = %reader.source(), %reason, "Rollback detected, handing off reader");
                    self.view.rollback(reader, reason).await;
                    FetcherState::RollbackDetected
                }
                Attempt::Abort(err) => {
                    self.set_state(FetcherState::Aborted);
                    metrics::record_fetcher_abort(&self.replica, err.kind());
                    error!(error = %err, kind = %err.kind(), watermark = %self.current(), "Oplog fetcher aborted");
                    self.view.fetch_aborted(&err);
                    FetcherState::Aborted
                }
                _ => {
                    self.set_state(FetcherState::Stopped);
                    info!(
                        watermark = %self.current(),
                        ops_read = self.stats.ops_read(),
                        "Oplog fetcher stopped"
                    );
                    self.view.fetch_finished();
                    FetcherState::Stopped
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Sleep the source retry delay, then ask for a new source.
    async fn reselect_later(&mut self) -> Attempt {
        let delay = self.config.source_retry_delay_duration();
        match until_stopped(&mut self.shutdown_rx, tokio::time::sleep(delay)).await {
            Some(()) => Attempt::Reselect,
            None => Attempt::Stopped,
        }
    }

    async fn run_attempt(&mut self) -> Attempt {
        self.set_state(FetcherState::SelectingSource);

        if self.view.should_pause() {
            info!("Replication paused, waiting");
            if until_stopped(&mut self.shutdown_rx, self.view.await_until_unpaused()).await.is_none() {
                return Attempt::Stopped;
            }
            info!("Replication resumed");
        }
        if until_stopped(&mut self.shutdown_rx, self.view.await_until_all_fetched_are_applied())
            .await
            .is_none()
        {
            return Attempt::Stopped;
        }

        let start = self.current();
        let source = match until_stopped(&mut self.shutdown_rx, self.sources.new_sync_source(start.op_time)).await {
            None => return Attempt::Stopped,
            Some(Ok(source)) => source,
            Some(Err(e)) if e.is_retryable() => {
                warn!(error = %e, "No usable sync source, retrying");
                metrics::record_fetcher_error(&self.replica, e.kind());
                return self.reselect_later().await;
            }
            Some(Err(e)) => return Attempt::Abort(e),
        };

        let mut reader = match until_stopped(&mut self.shutdown_rx, self.readers.new_reader(&source)).await {
            None => return Attempt::Stopped,
            Some(Ok(reader)) => reader,
            Some(Err(e)) if e.is_retryable() => {
                warn!(source = %source, error = %e, "Sync source unreachable, retrying");
                metrics::record_fetcher_error(&self.replica, e.kind());
                self.sources.source_failed(&source);
                return self.reselect_later().await;
            }
            Some(Err(e)) => return Attempt::Abort(e),
        };

        info!(source = %source, from = %start, "Fetching from sync source");
        self.set_state(FetcherState::Streaming);

        let ops_before = self.stats.ops_read();
        let result = self.stream(reader.as_mut(), start).await;
        let progressed = self.stats.ops_read() > ops_before;

        match result {
            Ok(StreamEnd::Rollback(reason)) => Attempt::Rollback(reader, reason),
            Ok(StreamEnd::Stopped) => {
                reader.close().await;
                Attempt::Stopped
            }
            Ok(StreamEnd::Paused) => {
                reader.close().await;
                debug!(source = %source, "Paused mid-stream, closed reader");
                Attempt::Paused
            }
            Ok(StreamEnd::Restart(reason)) => {
                reader.close().await;
                info!(source = %source, reason, "Restarting fetch");
                Attempt::Restart { reason, failed: false, progressed }
            }
            Err(e) if e.is_retryable() => {
                reader.close().await;
                warn!(source = %source, error = %e, "Transient error while fetching, restarting");
                metrics::record_fetcher_error(&self.replica, e.kind());
                Attempt::Restart {
                    reason: e.kind().as_str(),
                    failed: true,
                    progressed,
                }
            }
            Err(e) => {
                reader.close().await;
                Attempt::Abort(e)
            }
        }
    }

    async fn stream(&mut self, reader: &mut dyn OplogReader, start: Watermark) -> Result<StreamEnd> {
        let mut cursor = match until_stopped(&mut self.shutdown_rx, reader.query_gte(start.op_time)).await {
            None => return Ok(StreamEnd::Stopped),
            Some(cursor) => cursor?,
        };
        let end = self.consume(cursor.as_mut(), reader).await;
        cursor.close().await;
        end
    }

    async fn consume(&mut self, cursor: &mut dyn OplogCursor, reader: &mut dyn OplogReader) -> Result<StreamEnd> {
        let mut batch = match self.next_batch(cursor).await? {
            Fetched::Batch(batch) => batch,
            Fetched::Lost => return Ok(StreamEnd::Restart("cursor_lost")),
            Fetched::Stopped => return Ok(StreamEnd::Stopped),
        };
        if self.sources.should_change_sync_source() {
            return Ok(StreamEnd::Restart("better_source"));
        }
        if let Some(end) = self.check_rollback(&mut batch, reader).await? {
            return Ok(end);
        }

        loop {
            if *self.shutdown_rx.borrow() {
                return Ok(StreamEnd::Stopped);
            }
            if self.view.should_pause() {
                return Ok(StreamEnd::Paused);
            }

            if let Some(op) = batch.pop_front() {
                if !self.deliver(op).await? {
                    return Ok(StreamEnd::Stopped);
                }
                continue;
            }

            if !self.pace(&batch).await {
                return Ok(StreamEnd::Stopped);
            }
            batch = match self.next_batch(cursor).await? {
                Fetched::Batch(batch) => batch,
                Fetched::Lost => return Ok(StreamEnd::Restart("cursor_lost")),
                Fetched::Stopped => return Ok(StreamEnd::Stopped),
            };
            if self.sources.should_change_sync_source() {
                return Ok(StreamEnd::Restart("better_source"));
            }
        }
    }

    async fn next_batch(&mut self, cursor: &mut dyn OplogCursor) -> Result<Fetched> {
        let started = Instant::now();
        let fetched = match until_stopped(&mut self.shutdown_rx, cursor.fetch_batch()).await {
            None => return Ok(Fetched::Stopped),
            Some(fetched) => fetched?,
        };
        let latency = started.elapsed();

        let Some(batch) = fetched else {
            return Ok(Fetched::Lost);
        };
        metrics::record_batch_read(&self.replica, batch.size(), latency);
        if self.slo.is_batch_read_violation(latency) {
            warn!(
                latency_ms = latency.as_millis() as u64,
                threshold_ms = self.slo.max_batch_read_latency_ms,
                "Oplog batch read exceeded SLO"
            );
            metrics::record_slo_violation(&self.replica, "batch_read");
        }
        Ok(Fetched::Batch(batch))
    }

    /// Compare the first batch with the watermark. `Some` ends the attempt.
    async fn check_rollback(&mut self, batch: &mut OplogBatch, reader: &mut dyn OplogReader) -> Result<Option<StreamEnd>> {
        let watermark = self.current();

        let Some(first) = batch.pop_front() else {
            let last = match until_stopped(&mut self.shutdown_rx, reader.get_last_op()).await {
                None => return Ok(Some(StreamEnd::Stopped)),
                Some(last) => last?,
            };
            if last.op_time < watermark.op_time {
                return Ok(Some(StreamEnd::Rollback(RollbackReason::SourceBehind {
                    watermark,
                    source_last: last.op_time,
                })));
            }
            return Ok(None);
        };

        if !watermark.matches(&first) {
            return Ok(Some(StreamEnd::Rollback(RollbackReason::Diverged {
                watermark,
                source_first: Watermark::of(&first),
            })));
        }
        debug!(op_time = %first.op_time, "First operation matches watermark, skipping");
        Ok(None)
    }

    /// Sleep before the next fetch if the last batch was tiny and recent.
    /// Returns `false` if stopped while sleeping.
    async fn pace(&mut self, previous: &OplogBatch) -> bool {
        let size = previous.size();
        if size == 0 || size >= self.config.min_batch_size {
            return true;
        }
        if previous.fetched_at().elapsed() >= self.config.batching_window_duration() {
            return true;
        }
        self.stats.record_pacing_sleep();
        metrics::record_pacing_sleep(&self.replica);
        let pause = self.config.batching_sleep_duration();
        until_stopped(&mut self.shutdown_rx, tokio::time::sleep(pause)).await.is_some()
    }

    /// Deliver one operation, retrying spurious interruptions. Returns `false`
    /// if stopped before the delivery was accepted.
    async fn deliver(&mut self, op: OplogOperation) -> Result<bool> {
        let watermark = self.current();
        if op.op_time <= watermark.op_time {
            return Err(ReplicationError::OutOfOrder {
                watermark: watermark.op_time,
                received: op.op_time,
            });
        }

        let mut interruptions = 0u64;
        loop {
            match until_stopped(&mut self.shutdown_rx, self.view.deliver(&op)).await {
                None => return Ok(false),
                Some(Ok(())) => break,
                Some(Err(DeliveryError::Interrupted)) => {
                    interruptions += 1;
                    debug!(op_time = %op.op_time, interruptions, "Delivery interrupted, retrying");
                    tokio::task::yield_now().await;
                }
                Some(Err(DeliveryError::Closed)) => {
                    return Err(ReplicationError::Internal("delivery channel closed".to_string()));
                }
            }
        }

        self.watermark_tx.send_replace(Watermark::of(&op));
        self.stats.record_op_read();
        metrics::record_op_fetched(&self.replica, &op.op_time);
        Ok(true)
    }
}
