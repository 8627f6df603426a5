//! # Oplog Replication
//!
//! Replicates a document database's operation log (oplog) into a storage
//! backend, keeping the backend a faithful, ordered copy of the source.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                        ReplicationService (per replica)                   │
//! │                                                                           │
//! │  ┌────────────────────┐   ┌────────────────────┐   ┌───────────────────┐  │
//! │  │ SyncSourceProvider │──►│ ReplicationFetcher │──►│ ChannelSyncView   │  │
//! │  │ (pick upstream)    │   │ (rollback check,   │   │ (bounded handoff, │  │
//! │  └────────────────────┘   │  pacing, restarts) │   │  backpressure)    │  │
//! │                           └────────────────────┘   └─────────┬─────────┘  │
//! │                                    │ divergence              │            │
//! │                                    ▼                         ▼            │
//! │                           ┌─────────────────┐   ┌────────────────────────┐│
//! │                           │ RollbackHandler │   │ Applier                ││
//! │                           └─────────────────┘   │  OplogBatchAnalyzer    ││
//! │                                                 │  BatchExecutor ──► StorageBackend
//! │  ┌────────────────┐                             │  (one tx per batch)    ││
//! │  │ WatermarkStore │◄────────────────────────────┴────────────────────────┘│
//! │  │ (SQLite)       │   applied (op_time, hash) after every commit          │
//! │  └────────────────┘                                                       │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! - Operations are applied in source order, each exactly once per run
//!   (after a restart, operations up to the last recorded apply intent are
//!   applied in reapplying mode)
//! - Every batch commits whole or not at all
//! - Divergence from the source stops replication and is handed off once
//!
//! ## Usage
//!
//! ```rust,no_run
//! use oplog_replication::{
//!     MemoryBackend, MemoryReaderProvider, ReplicationConfig, ReplicationService, ResumeMode,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> oplog_replication::Result<()> {
//!     let config = ReplicationConfig::default();
//!     let mut service = ReplicationService::from_config(
//!         config,
//!         Arc::new(MemoryReaderProvider::new()),
//!         Arc::new(MemoryBackend::new()),
//!     )?;
//!     service.start(None).await?;
//!
//!     if service.failed_batch().is_some() {
//!         service.resume(ResumeMode::Retry).await?;
//!     }
//!
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod analyzer;
pub mod backend;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod fetcher;
pub mod metrics;
pub mod oplog;
pub mod reader;
pub mod resilience;
pub mod rollback;
pub mod sync_source;
pub mod watermark;

// Re-exports for convenience
pub use analyzer::{AnalyzedOplogBatch, CudBatch, NamespaceJob, OplogBatchAnalyzer};
pub use backend::{ApplierContext, BackendError, MemoryBackend, NoOpBackend, StorageBackend, WriteTransaction};
pub use config::{
    AnalyzerConfig, ApplierConfig, FetcherConfig, ReplicationConfig, ReplicationSettings, SloConfig, SourceConfig,
    WatermarkConfig,
};
pub use coordinator::{ChannelSyncView, FailedBatch, FetchOutcome, HealthCheck, ReplicationService, ResumeMode, ServiceState};
pub use error::{ApplyError, ErrorKind, ReplicationError, Result};
pub use executor::AnalyzedOplogBatchExecutor;
pub use fetcher::{DeliveryError, FetcherState, ReplicationFetcher, RollbackReason, SyncServiceView, Watermark};
pub use oplog::{Namespace, OpKind, OpTime, OplogOperation};
pub use reader::{MemoryOplog, MemoryReaderProvider, OplogBatch, OplogCursor, OplogReader, OplogReaderProvider};
pub use rollback::{LoggingRollbackHandler, RollbackHandler};
pub use sync_source::{RankedSyncSourceProvider, SyncSource, SyncSourceProvider};
pub use watermark::WatermarkStore;
