// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage backend integration traits.
//!
//! Defines the interface the executor writes through. A backend hands out
//! [`WriteTransaction`]s; each analyzed batch is applied inside exactly one of
//! them and either committed whole or rolled back.
//!
//! # Example
//!
//! ```rust,no_run
//! use oplog_replication::backend::{ApplierContext, BackendError, StorageBackend, WriteTransaction};
//! use oplog_replication::OplogOperation;
//! use futures::future::{BoxFuture, FutureExt};
//!
//! struct Discard;
//!
//! impl WriteTransaction for Discard {
//!     fn apply<'a>(&'a mut self, _op: &'a OplogOperation, _ctx: ApplierContext) -> BoxFuture<'a, Result<(), BackendError>> {
//!         async { Ok(()) }.boxed()
//!     }
//!     fn commit(self: Box<Self>) -> BoxFuture<'static, Result<(), BackendError>> {
//!         async { Ok(()) }.boxed()
//!     }
//!     fn rollback(self: Box<Self>) -> BoxFuture<'static, ()> {
//!         async {}.boxed()
//!     }
//! }
//!
//! struct MyBackend;
//!
//! impl StorageBackend for MyBackend {
//!     fn begin(&self, _ctx: ApplierContext) -> BoxFuture<'_, Result<Box<dyn WriteTransaction>, BackendError>> {
//!         async { Ok(Box::new(Discard) as Box<dyn WriteTransaction>) }.boxed()
//!     }
//! }
//! ```

use crate::error::ApplyError;
use crate::oplog::{OpTime, OplogOperation};
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

/// How operations should be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ApplierContext {
    /// Operations may already be applied (replayed after a restart);
    /// the backend must tolerate duplicates.
    pub reapplying: bool,
    /// Treat updates whose target does not exist as inserts.
    pub updates_as_upserts: bool,
}

impl ApplierContext {
    pub fn normal() -> Self {
        Self::default()
    }

    pub fn reapplying() -> Self {
        Self {
            reapplying: true,
            updates_as_upserts: true,
        }
    }

    pub fn with_updates_as_upserts(mut self, enabled: bool) -> Self {
        self.updates_as_upserts = self.updates_as_upserts || enabled;
        self
    }
}

/// Errors a backend reports.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The backend aborted the transaction (conflict, deadlock). Retryable.
    #[error("transaction rolled back: {0}")]
    Rollback(String),

    /// Data the document model allows but the backend refuses.
    #[error("user data rejected: {0}")]
    UserData(String),

    /// The operation has no backend equivalent.
    #[error("untranslatable operation: {0}")]
    Translation(String),
}

impl BackendError {
    /// Attach the position of the operation that failed.
    pub fn at(self, op_time: OpTime) -> ApplyError {
        match self {
            Self::Rollback(message) => ApplyError::BackendRollback { message },
            Self::UserData(message) => ApplyError::UserData { op_time, message },
            Self::Translation(message) => ApplyError::Translation { op_time, message },
        }
    }
}

/// Errors outside any single operation (`begin`, `commit`) carry no position.
impl From<BackendError> for ApplyError {
    fn from(e: BackendError) -> Self {
        e.at(OpTime::ZERO)
    }
}

/// One backend transaction.
pub trait WriteTransaction: Send {
    fn apply<'a>(&'a mut self, op: &'a OplogOperation, ctx: ApplierContext) -> BoxFuture<'a, Result<(), BackendError>>;

    /// Make every applied operation visible at once.
    fn commit(self: Box<Self>) -> BoxFuture<'static, Result<(), BackendError>>;

    /// Discard every applied operation.
    fn rollback(self: Box<Self>) -> BoxFuture<'static, ()>;
}

/// Where replicated operations are written.
pub trait StorageBackend: Send + Sync + 'static {
    fn begin(&self, ctx: ApplierContext) -> BoxFuture<'_, Result<Box<dyn WriteTransaction>, BackendError>>;
}

/// Backend that accepts and discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpBackend;

struct NoOpTransaction;

impl WriteTransaction for NoOpTransaction {
    fn apply<'a>(&'a mut self, _op: &'a OplogOperation, _ctx: ApplierContext) -> BoxFuture<'a, Result<(), BackendError>> {
        async { Ok(()) }.boxed()
    }

    fn commit(self: Box<Self>) -> BoxFuture<'static, Result<(), BackendError>> {
        async { Ok(()) }.boxed()
    }

    fn rollback(self: Box<Self>) -> BoxFuture<'static, ()> {
        async {}.boxed()
    }
}

impl StorageBackend for NoOpBackend {
    fn begin(&self, _ctx: ApplierContext) -> BoxFuture<'_, Result<Box<dyn WriteTransaction>, BackendError>> {
        async { Ok(Box::new(NoOpTransaction) as Box<dyn WriteTransaction>) }.boxed()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MemoryBackend: in-process backend with fault injection
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct BackendInner {
    committed: Mutex<Vec<OplogOperation>>,
    faults: DashMap<OpTime, (BackendError, usize)>,
    begins: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
}

impl BackendInner {
    fn committed(&self) -> std::sync::MutexGuard<'_, Vec<OplogOperation>> {
        self.committed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Consume one injected failure for `op_time`, if any remain.
    fn take_fault(&self, op_time: &OpTime) -> Option<BackendError> {
        let mut entry = self.faults.get_mut(op_time)?;
        let (error, remaining) = entry.value_mut();
        if *remaining == 0 {
            return None;
        }
        *remaining -= 1;
        Some(error.clone())
    }
}

/// In-memory backend that records committed operations.
///
/// Outside reapplying mode an operation whose position was already committed
/// is rejected as a duplicate. Failures can be injected per operation.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<BackendInner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` attempts to apply the operation at `op_time`.
    pub fn inject(&self, op_time: OpTime, error: BackendError, times: usize) {
        self.inner.faults.insert(op_time, (error, times));
    }

    pub fn clear_faults(&self) {
        self.inner.faults.clear();
    }

    /// Snapshot of committed operations, in commit order.
    pub fn committed(&self) -> Vec<OplogOperation> {
        self.inner.committed().clone()
    }

    pub fn committed_len(&self) -> usize {
        self.inner.committed().len()
    }

    pub fn begins(&self) -> u64 {
        self.inner.begins.load(Ordering::Relaxed)
    }

    pub fn commits(&self) -> u64 {
        self.inner.commits.load(Ordering::Relaxed)
    }

    pub fn rollbacks(&self) -> u64 {
        self.inner.rollbacks.load(Ordering::Relaxed)
    }
}

struct MemoryTransaction {
    inner: Arc<BackendInner>,
    staged: Vec<OplogOperation>,
}

impl WriteTransaction for MemoryTransaction {
    fn apply<'a>(&'a mut self, op: &'a OplogOperation, ctx: ApplierContext) -> BoxFuture<'a, Result<(), BackendError>> {
        async move {
            if let Some(error) = self.inner.take_fault(&op.op_time) {
                return Err(error);
            }
            let seen = self.staged.iter().any(|s| s.op_time == op.op_time)
                || self.inner.committed().iter().any(|c| c.op_time == op.op_time);
            match (seen, ctx.reapplying) {
                (false, _) => {
                    self.staged.push(op.clone());
                    Ok(())
                }
                (true, true) => Ok(()),
                (true, false) => Err(BackendError::UserData(format!("duplicate operation at {}", op.op_time))),
            }
        }
        .boxed()
    }

    fn commit(self: Box<Self>) -> BoxFuture<'static, Result<(), BackendError>> {
        async move {
            let MemoryTransaction { inner, staged } = *self;
            inner.committed().extend(staged);
            inner.commits.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
        .boxed()
    }

    fn rollback(self: Box<Self>) -> BoxFuture<'static, ()> {
        async move {
            self.inner.rollbacks.fetch_add(1, Ordering::Relaxed);
        }
        .boxed()
    }
}

impl StorageBackend for MemoryBackend {
    fn begin(&self, _ctx: ApplierContext) -> BoxFuture<'_, Result<Box<dyn WriteTransaction>, BackendError>> {
        async move {
            self.inner.begins.fetch_add(1, Ordering::Relaxed);
            Ok(Box::new(MemoryTransaction {
                inner: Arc::clone(&self.inner),
                staged: Vec::new(),
            }) as Box<dyn WriteTransaction>)
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oplog::{Namespace, OpKind};
    use serde_json::json;

    fn op(inc: u32) -> OplogOperation {
        OplogOperation::chained(0, OpTime::new(1, 10, inc), OpKind::Insert, Namespace::parse("db.c"), json!({"_id": inc}))
    }

    #[test]
    fn test_backend_error_mapping() {
        let at = OpTime::new(1, 2, 3);
        assert_eq!(
            BackendError::Rollback("deadlock".into()).at(at),
            ApplyError::BackendRollback { message: "deadlock".into() }
        );
        assert_eq!(
            BackendError::UserData("bad key".into()).at(at),
            ApplyError::UserData { op_time: at, message: "bad key".into() }
        );
        let untimed: ApplyError = BackendError::Translation("x".into()).into();
        assert_eq!(untimed, ApplyError::Translation { op_time: OpTime::ZERO, message: "x".into() });
    }

    #[test]
    fn test_context_presets() {
        assert!(!ApplierContext::normal().reapplying);
        assert!(ApplierContext::reapplying().reapplying);
        assert!(ApplierContext::normal().with_updates_as_upserts(true).updates_as_upserts);
        assert!(ApplierContext::reapplying().with_updates_as_upserts(false).updates_as_upserts);
    }

    #[tokio::test]
    async fn test_commit_makes_ops_visible() {
        let backend = MemoryBackend::new();
        let ctx = ApplierContext::normal();
        let mut tx = backend.begin(ctx).await.unwrap();
        tx.apply(&op(1), ctx).await.unwrap();
        tx.apply(&op(2), ctx).await.unwrap();
        assert_eq!(backend.committed_len(), 0);
        tx.commit().await.unwrap();
        assert_eq!(backend.committed_len(), 2);
        assert_eq!(backend.commits(), 1);
    }

    #[tokio::test]
    async fn test_rollback_discards() {
        let backend = MemoryBackend::new();
        let ctx = ApplierContext::normal();
        let mut tx = backend.begin(ctx).await.unwrap();
        tx.apply(&op(1), ctx).await.unwrap();
        tx.rollback().await;
        assert_eq!(backend.committed_len(), 0);
        assert_eq!(backend.rollbacks(), 1);
    }

    #[tokio::test]
    async fn test_duplicates_only_tolerated_when_reapplying() {
        let backend = MemoryBackend::new();
        let ctx = ApplierContext::normal();
        let mut tx = backend.begin(ctx).await.unwrap();
        tx.apply(&op(1), ctx).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = backend.begin(ctx).await.unwrap();
        assert!(matches!(tx.apply(&op(1), ctx).await, Err(BackendError::UserData(_))));
        tx.rollback().await;

        let replay = ApplierContext::reapplying();
        let mut tx = backend.begin(replay).await.unwrap();
        tx.apply(&op(1), replay).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(backend.committed_len(), 1);
    }

    #[tokio::test]
    async fn test_injected_fault_is_consumed() {
        let backend = MemoryBackend::new();
        let ctx = ApplierContext::normal();
        backend.inject(op(1).op_time, BackendError::Rollback("conflict".into()), 1);

        let mut tx = backend.begin(ctx).await.unwrap();
        assert_eq!(tx.apply(&op(1), ctx).await, Err(BackendError::Rollback("conflict".into())));
        tx.rollback().await;

        let mut tx = backend.begin(ctx).await.unwrap();
        tx.apply(&op(1), ctx).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(backend.committed(), vec![op(1)]);
    }
}
