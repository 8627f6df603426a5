// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication service coordinator.
//!
//! The main orchestrator that ties together:
//! - Sync source selection via [`crate::sync_source::SyncSourceProvider`]
//! - Oplog fetching via [`crate::fetcher::ReplicationFetcher`]
//! - Batch analysis and application via [`crate::executor::AnalyzedOplogBatchExecutor`]
//! - Watermark persistence via [`crate::watermark::WatermarkStore`]
//!
//! # Architecture
//!
//! One service replicates one source set into one backend:
//! 1. Loads the applied watermark (or takes the caller's initial one)
//! 2. Spawns the fetcher task, which streams into a [`ChannelSyncView`]
//! 3. Spawns the applier task, which drains the view and applies batches
//! 4. Handles pause/resume, failed batches, and graceful shutdown with draining

mod applier;
mod handoff;
mod types;

pub use handoff::ChannelSyncView;
pub use types::{FailedBatch, FetchOutcome, HealthCheck, ResumeMode, ServiceState};

use crate::analyzer::OplogBatchAnalyzer;
use crate::backend::StorageBackend;
use crate::config::ReplicationConfig;
use crate::error::{ReplicationError, Result};
use crate::executor::AnalyzedOplogBatchExecutor;
use crate::fetcher::{FetcherState, FetcherStats, ReplicationFetcher, SyncServiceView, Watermark};
use crate::metrics;
use crate::oplog::OpTime;
use crate::reader::OplogReaderProvider;
use crate::rollback::{LoggingRollbackHandler, RollbackHandler};
use crate::sync_source::{RankedSyncSourceProvider, SyncSourceProvider};
use crate::watermark::WatermarkStore;
use applier::{transition, Applier};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Handles available once the service has started.
struct Running {
    view: Arc<ChannelSyncView>,
    fetched_rx: watch::Receiver<Watermark>,
    fetcher_state_rx: watch::Receiver<FetcherState>,
    fetcher_stats: Arc<FetcherStats>,
    resume_tx: mpsc::Sender<(OpTime, ResumeMode)>,
}

/// Oplog replication service for one replica set.
///
/// # Example
///
/// ```rust,no_run
/// use oplog_replication::{ReplicationConfig, ReplicationService, MemoryBackend, MemoryReaderProvider};
/// use std::sync::Arc;
///
/// # async fn example() -> oplog_replication::Result<()> {
/// let config = ReplicationConfig::default();
/// let mut service = ReplicationService::from_config(
///     config,
///     Arc::new(MemoryReaderProvider::new()),
///     Arc::new(MemoryBackend::new()),
/// )?;
/// service.start(None).await?;
/// // ...
/// service.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct ReplicationService {
    config: ReplicationConfig,

    /// Service state (broadcast to watchers)
    state_tx: Arc<watch::Sender<ServiceState>>,
    state_rx: watch::Receiver<ServiceState>,

    sources: Arc<dyn SyncSourceProvider>,
    readers: Arc<dyn OplogReaderProvider>,
    backend: Arc<dyn StorageBackend>,
    rollback_handler: Arc<dyn RollbackHandler>,

    store: Option<Arc<WatermarkStore>>,

    /// Last applied watermark
    applied_tx: Arc<watch::Sender<Option<Watermark>>>,
    failed: Arc<Mutex<Option<FailedBatch>>>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    running: Option<Running>,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl ReplicationService {
    /// Create a service. It starts in `Created`; call [`start()`](Self::start).
    pub fn new(
        config: ReplicationConfig,
        sources: Arc<dyn SyncSourceProvider>,
        readers: Arc<dyn OplogReaderProvider>,
        backend: Arc<dyn StorageBackend>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ServiceState::Created);
        let (applied_tx, _) = watch::channel(None);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            config,
            state_tx: Arc::new(state_tx),
            state_rx,
            sources,
            readers,
            backend,
            rollback_handler: Arc::new(LoggingRollbackHandler),
            store: None,
            applied_tx: Arc::new(applied_tx),
            failed: Arc::new(Mutex::new(None)),
            shutdown_tx,
            shutdown_rx,
            running: None,
            handles: Vec::new(),
        }
    }

    /// Create a service choosing among `config.sources` by priority and latency.
    pub fn from_config(
        config: ReplicationConfig,
        readers: Arc<dyn OplogReaderProvider>,
        backend: Arc<dyn StorageBackend>,
    ) -> Result<Self> {
        let sources = RankedSyncSourceProvider::new(config.replica_name.clone(), &config.sources)?;
        Ok(Self::new(config, Arc::new(sources), readers, backend))
    }

    pub fn with_rollback_handler(mut self, handler: Arc<dyn RollbackHandler>) -> Self {
        self.rollback_handler = handler;
        self
    }

    pub fn replica(&self) -> &str {
        &self.config.replica_name
    }

    pub fn state(&self) -> ServiceState {
        *self.state_rx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ServiceState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), ServiceState::Running)
    }

    /// Fetched watermark (last delivered operation). `None` before `start()`.
    pub fn watermark_receiver(&self) -> Option<watch::Receiver<Watermark>> {
        self.running.as_ref().map(|r| r.fetched_rx.clone())
    }

    /// Last applied and persisted watermark.
    pub fn applied_receiver(&self) -> watch::Receiver<Option<Watermark>> {
        self.applied_tx.subscribe()
    }

    pub fn fetcher_stats(&self) -> Option<Arc<FetcherStats>> {
        self.running.as_ref().map(|r| Arc::clone(&r.fetcher_stats))
    }

    pub fn failed_batch(&self) -> Option<FailedBatch> {
        self.failed.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn fetch_outcome(&self) -> Option<FetchOutcome> {
        self.running.as_ref().and_then(|r| r.view.outcome())
    }

    fn set_state(&self, to: ServiceState) -> bool {
        transition(&self.state_tx, &self.config.replica_name, to)
    }

    fn expect_state(&self, expected: ServiceState) -> Result<()> {
        let actual = self.state();
        if actual != expected {
            return Err(ReplicationError::InvalidState {
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(())
    }

    /// Start replicating.
    ///
    /// 1. Opens the watermark store
    /// 2. Resumes from the persisted watermark, or `initial` on first start
    /// 3. Spawns the fetcher and applier tasks
    ///
    /// # Errors
    ///
    /// [`ReplicationError::InvalidState`] unless `Created`;
    /// [`ReplicationError::Config`] when there is neither a persisted nor an
    /// initial watermark (an initial sync is required first).
    pub async fn start(&mut self, initial: Option<Watermark>) -> Result<()> {
        self.expect_state(ServiceState::Created)?;

        let replica = self.config.replica_name.clone();
        info!(
            replica = %replica,
            sources = self.config.sources.len(),
            "Starting replication service"
        );
        self.set_state(ServiceState::Starting);

        let (watermark, replay_until) = match self.resolve_watermark(initial).await {
            Ok(resolved) => resolved,
            Err(e) => {
                error!(replica = %replica, error = %e, "Failed to start replication service");
                self.set_state(ServiceState::Failed);
                return Err(e);
            }
        };
        self.applied_tx.send_replace(Some(watermark));

        let settings = &self.config.settings;
        let (view, rx) = ChannelSyncView::new(
            &replica,
            settings.applier.handoff_capacity,
            settings.applier.deliver_timeout_duration(),
            Arc::clone(&self.rollback_handler),
        );
        let view = Arc::new(view);

        let fetcher = ReplicationFetcher::new(
            replica.clone(),
            settings.fetcher.clone(),
            watermark,
            Arc::clone(&self.sources),
            Arc::clone(&self.readers),
            Arc::clone(&view) as Arc<dyn SyncServiceView>,
            self.shutdown_rx.clone(),
        )
        .with_slo(settings.slo.clone());

        let (resume_tx, resume_rx) = mpsc::channel(1);
        let applier = Applier {
            replica: replica.clone(),
            config: settings.applier.clone(),
            slo: settings.slo.clone(),
            rx,
            view: Arc::clone(&view),
            analyzer: OplogBatchAnalyzer::new(settings.analyzer.clone()),
            executor: AnalyzedOplogBatchExecutor::new(
                &replica,
                Arc::clone(&self.backend),
                settings.applier.conflict_retry(),
            ),
            store: self.store.clone(),
            state_tx: Arc::clone(&self.state_tx),
            applied_tx: Arc::clone(&self.applied_tx),
            fetched_rx: fetcher.watermark(),
            failed: Arc::clone(&self.failed),
            resume_rx,
            shutdown_rx: self.shutdown_rx.clone(),
            replay_until,
            intent: replay_until,
        };

        self.running = Some(Running {
            view,
            fetched_rx: fetcher.watermark(),
            fetcher_state_rx: fetcher.state(),
            fetcher_stats: fetcher.stats(),
            resume_tx,
        });

        self.handles.push(tokio::spawn(applier.run()));

        let state_tx = Arc::clone(&self.state_tx);
        let fetcher_replica = replica.clone();
        self.handles.push(tokio::spawn(async move {
            match fetcher.run().await {
                FetcherState::RollbackDetected => {
                    transition(&state_tx, &fetcher_replica, ServiceState::RollbackRequired);
                }
                FetcherState::Aborted => {
                    transition(&state_tx, &fetcher_replica, ServiceState::Failed);
                }
                _ => {}
            }
        }));

        self.set_state(ServiceState::Running);
        info!(replica = %replica, watermark = %watermark, "Replication service running");
        Ok(())
    }

    /// Starting watermark, plus the end of the window that may already be
    /// committed past it.
    async fn resolve_watermark(&mut self, initial: Option<Watermark>) -> Result<(Watermark, Option<OpTime>)> {
        let store = WatermarkStore::from_config(&self.config.watermark).await?;
        let persisted = store.load(&self.config.replica_name).await?;
        let intent = store.load_intent(&self.config.replica_name).await?;
        self.store = Some(Arc::new(store));

        let watermark = match (persisted, initial) {
            (Some(persisted), Some(initial)) if persisted != initial => {
                warn!(%persisted, %initial, "Ignoring initial watermark, resuming from persisted one");
                persisted
            }
            (Some(persisted), _) => {
                info!(watermark = %persisted, "Resuming from persisted watermark");
                persisted
            }
            (None, Some(initial)) => initial,
            (None, None) => {
                return Err(ReplicationError::Config(format!(
                    "no watermark for replica {:?}; initial sync required",
                    self.config.replica_name
                )))
            }
        };

        let replay_until = intent.filter(|intent| *intent > watermark.op_time);
        if let Some(until) = replay_until {
            warn!(watermark = %watermark, intent = %until, "Previous run stopped between commit and watermark save");
        }
        Ok((watermark, replay_until))
    }

    /// Stop reading from the source at the next batch boundary. Already
    /// delivered operations are still applied.
    pub fn pause(&self) -> Result<()> {
        let _failed = self.failed.lock().unwrap_or_else(PoisonError::into_inner);
        self.expect_state(ServiceState::Running)?;
        if let Some(running) = &self.running {
            running.view.pause();
        }
        self.set_state(ServiceState::Paused);
        Ok(())
    }

    /// Resume after [`pause()`](Self::pause) or a failed batch.
    ///
    /// `mode` decides what happens to a failed batch; it is ignored when
    /// nothing failed.
    pub async fn resume(&self, mode: ResumeMode) -> Result<()> {
        let Some(running) = &self.running else {
            return Err(ReplicationError::InvalidState {
                expected: "started".to_string(),
                actual: self.state().to_string(),
            });
        };

        // The applier records failures under the same lock
        let holding_failure = {
            let failed = self.failed.lock().unwrap_or_else(PoisonError::into_inner);
            self.expect_state(ServiceState::Paused)?;
            let holding = failed.as_ref().map(|failed| failed.first);
            if holding.is_none() {
                running.view.resume();
                self.set_state(ServiceState::Running);
            }
            holding
        };

        if let Some(first) = holding_failure {
            // The applier clears the failure, unpauses and goes back to Running
            running
                .resume_tx
                .send((first, mode))
                .await
                .map_err(|_| ReplicationError::Internal("applier is gone".to_string()))?;
        }
        Ok(())
    }

    /// Health snapshot. Performs no I/O.
    pub fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let applied = *self.applied_tx.borrow();
        let failed_batch = self.failed_batch();

        let (fetcher_state, fetched, pending_ops, fetch_outcome) = match &self.running {
            Some(running) => (
                Some(*running.fetcher_state_rx.borrow()),
                Some(*running.fetched_rx.borrow()),
                running.view.pending(),
                running.view.outcome(),
            ),
            None => (None, None, 0, None),
        };

        let apply_lag_secs = match (applied, fetched) {
            (Some(applied), Some(fetched)) => applied.op_time.lag_secs(&fetched.op_time),
            _ => 0,
        };

        let ready = state == ServiceState::Running
            && matches!(fetcher_state, Some(FetcherState::Streaming | FetcherState::SelectingSource));
        let healthy = ready && failed_batch.is_none() && !self.config.settings.slo.is_apply_lag_violation(apply_lag_secs);

        HealthCheck {
            state,
            ready,
            healthy,
            fetcher_state,
            fetched,
            applied,
            pending_ops,
            apply_lag_secs,
            current_source: self.sources.current_source().map(|s| s.to_string()),
            failed_batch,
            fetch_outcome,
        }
    }

    /// Shutdown gracefully.
    ///
    /// Shutdown sequence:
    /// 1. Signal the fetcher and applier to stop
    /// 2. Let the applier drain delivered operations (bounded by `drain_timeout`)
    /// 3. Checkpoint and close the watermark store
    pub async fn shutdown(&mut self) {
        info!(replica = %self.config.replica_name, "Shutting down replication service");
        self.set_state(ServiceState::ShuttingDown);

        let _ = self.shutdown_tx.send(true);

        let handles = std::mem::take(&mut self.handles);
        let task_count = handles.len();
        if task_count > 0 {
            info!(task_count, "Waiting for tasks to drain and complete");
        }

        let drain_timeout = self.config.settings.applier.drain_timeout_duration();
        for (i, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(drain_timeout, handle).await {
                Ok(Ok(())) => {
                    debug!(task = i + 1, "Task completed gracefully");
                }
                Ok(Err(e)) => {
                    warn!(task = i + 1, error = %e, "Task panicked during shutdown");
                }
                Err(_) => {
                    warn!(task = i + 1, "Task timed out during shutdown (operations may be re-applied)");
                }
            }
        }

        if let Some(store) = self.store.take() {
            store.close().await;
        }

        self.set_state(ServiceState::Stopped);
        metrics::set_pending_ops(&self.config.replica_name, 0);
        info!(replica = %self.config.replica_name, "Replication service stopped");
    }
}
