//! In-process oplog source.
//!
//! [`MemoryOplog`] is a hash-chained, append-only log with the knobs a real
//! upstream exposes to failure: it can be truncated (a source-side rollback),
//! marked unreachable, and fed one-shot [`Fault`]s that the next cursor fetch
//! consumes.

use super::{OplogBatch, OplogCursor, OplogReader, OplogReaderProvider};
use crate::error::{ReplicationError, Result};
use crate::oplog::{Namespace, OpKind, OpTime, OplogOperation};
use crate::sync_source::SyncSource;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

/// Base seconds for generated op times.
const BASE_SECS: u32 = 1_700_000_000;

/// Failure injected into the next cursor fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The fetch fails with a transient network error.
    Network,
    /// The remote cursor disappears.
    CursorLost,
}

#[derive(Default)]
struct LogInner {
    ops: Mutex<Vec<OplogOperation>>,
    appended: Notify,
    term: AtomicI64,
    unreachable: AtomicBool,
}

/// Hash-chained in-memory oplog. Cloning shares the log.
#[derive(Clone, Default)]
pub struct MemoryOplog {
    inner: Arc<LogInner>,
}

impl MemoryOplog {
    pub fn new() -> Self {
        let log = Self::default();
        log.inner.term.store(1, Ordering::Relaxed);
        log
    }

    fn ops(&self) -> std::sync::MutexGuard<'_, Vec<OplogOperation>> {
        self.inner.ops.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Term stamped on subsequently appended operations.
    pub fn set_term(&self, term: i64) {
        self.inner.term.store(term, Ordering::Relaxed);
    }

    /// Append an operation chained to the current tail.
    pub fn append(&self, kind: OpKind, namespace: &str, payload: Value) -> OplogOperation {
        let op = {
            let mut ops = self.ops();
            let (prev_hash, op_time) = match ops.last() {
                Some(last) => (last.hash, next_op_time(&last.op_time, self.inner.term.load(Ordering::Relaxed))),
                None => (0, OpTime::new(self.inner.term.load(Ordering::Relaxed), BASE_SECS, 1)),
            };
            let op = OplogOperation::chained(prev_hash, op_time, kind, Namespace::parse(namespace), payload);
            ops.push(op.clone());
            op
        };
        self.inner.appended.notify_waiters();
        op
    }

    /// Append an arbitrary operation without chaining it.
    pub fn push_raw(&self, op: OplogOperation) {
        self.ops().push(op);
        self.inner.appended.notify_waiters();
    }

    /// Drop every operation after `op_time`.
    pub fn truncate_after(&self, op_time: OpTime) {
        self.ops().retain(|op| op.op_time <= op_time);
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.inner.unreachable.store(!reachable, Ordering::Relaxed);
    }

    pub fn is_reachable(&self) -> bool {
        !self.inner.unreachable.load(Ordering::Relaxed)
    }

    pub fn last(&self) -> Option<OplogOperation> {
        self.ops().last().cloned()
    }

    pub fn len(&self) -> usize {
        self.ops().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops().is_empty()
    }

    /// Snapshot of every operation.
    pub fn snapshot(&self) -> Vec<OplogOperation> {
        self.ops().clone()
    }

    /// Up to `limit` operations at or after `from` (inclusive) or strictly
    /// after it (exclusive).
    fn read(&self, from: OpTime, inclusive: bool, limit: usize) -> Vec<OplogOperation> {
        let ops = self.ops();
        let start = ops.partition_point(|op| if inclusive { op.op_time < from } else { op.op_time <= from });
        ops[start..].iter().take(limit).cloned().collect()
    }
}

fn next_op_time(last: &OpTime, term: i64) -> OpTime {
    let term = term.max(last.term);
    if last.inc >= 9 {
        OpTime::new(term, last.secs + 1, 1)
    } else {
        OpTime::new(term, last.secs, last.inc + 1)
    }
}

/// Serves readers over a set of [`MemoryOplog`]s keyed by sync source.
pub struct MemoryReaderProvider {
    logs: DashMap<SyncSource, MemoryOplog>,
    faults: Arc<Mutex<VecDeque<Fault>>>,
    batch_size: usize,
    await_data: Duration,
    opened: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
}

impl Default for MemoryReaderProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryReaderProvider {
    pub fn new() -> Self {
        Self {
            logs: DashMap::new(),
            faults: Arc::new(Mutex::new(VecDeque::new())),
            batch_size: 100,
            await_data: Duration::from_millis(20),
            opened: Arc::new(AtomicUsize::new(0)),
            closed: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Maximum operations per fetched batch.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// How long an idle cursor waits for new operations before returning an empty batch.
    pub fn with_await_data(mut self, await_data: Duration) -> Self {
        self.await_data = await_data;
        self
    }

    pub fn add_source(&self, source: SyncSource, log: MemoryOplog) {
        self.logs.insert(source, log);
    }

    /// Queue a fault for the next cursor fetch on any source.
    pub fn inject(&self, fault: Fault) {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner).push_back(fault);
    }

    pub fn readers_opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn readers_closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

impl OplogReaderProvider for MemoryReaderProvider {
    fn new_reader(&self, source: &SyncSource) -> BoxFuture<'_, Result<Box<dyn OplogReader>>> {
        let result = match self.logs.get(source) {
            Some(log) if log.is_reachable() => {
                self.opened.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(MemoryReader {
                    source: source.clone(),
                    log: log.clone(),
                    faults: Arc::clone(&self.faults),
                    batch_size: self.batch_size,
                    await_data: self.await_data,
                    closed: Some(Arc::clone(&self.closed)),
                }) as Box<dyn OplogReader>)
            }
            Some(_) => Err(ReplicationError::unreachable(source.to_string(), "connection refused")),
            None => Err(ReplicationError::unreachable(source.to_string(), "unknown host")),
        };
        async move { result }.boxed()
    }
}

struct MemoryReader {
    source: SyncSource,
    log: MemoryOplog,
    faults: Arc<Mutex<VecDeque<Fault>>>,
    batch_size: usize,
    await_data: Duration,
    /// Taken on the first close so double closes count once.
    closed: Option<Arc<AtomicUsize>>,
}

impl OplogReader for MemoryReader {
    fn source(&self) -> &SyncSource {
        &self.source
    }

    fn query_gte(&mut self, from: OpTime) -> BoxFuture<'_, Result<Box<dyn OplogCursor>>> {
        let result = if self.log.is_reachable() {
            Ok(Box::new(MemoryCursor {
                log: self.log.clone(),
                faults: Arc::clone(&self.faults),
                position: from,
                inclusive: true,
                batch_size: self.batch_size,
                await_data: self.await_data,
            }) as Box<dyn OplogCursor>)
        } else {
            Err(ReplicationError::network("query", format!("{} unreachable", self.source)))
        };
        async move { result }.boxed()
    }

    fn get_last_op(&mut self) -> BoxFuture<'_, Result<OplogOperation>> {
        let result = if !self.log.is_reachable() {
            Err(ReplicationError::network("getLastOp", format!("{} unreachable", self.source)))
        } else {
            self.log.last().ok_or_else(|| ReplicationError::OplogStartMissing {
                source_id: self.source.to_string(),
            })
        };
        async move { result }.boxed()
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        if let Some(closed) = self.closed.take() {
            closed.fetch_add(1, Ordering::SeqCst);
        }
        async {}.boxed()
    }
}

struct MemoryCursor {
    log: MemoryOplog,
    faults: Arc<Mutex<VecDeque<Fault>>>,
    position: OpTime,
    inclusive: bool,
    batch_size: usize,
    await_data: Duration,
}

impl MemoryCursor {
    fn take_fault(&self) -> Option<Fault> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner).pop_front()
    }
}

impl OplogCursor for MemoryCursor {
    fn fetch_batch(&mut self) -> BoxFuture<'_, Result<Option<OplogBatch>>> {
        async move {
            match self.take_fault() {
                Some(Fault::Network) => return Err(ReplicationError::network("getMore", "injected network fault")),
                Some(Fault::CursorLost) => return Ok(None),
                None => {}
            }
            if !self.log.is_reachable() {
                return Err(ReplicationError::network("getMore", "source unreachable"));
            }

            let notified = self.log.inner.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let mut ops = self.log.read(self.position, self.inclusive, self.batch_size);
            if ops.is_empty() {
                let _ = tokio::time::timeout(self.await_data, notified).await;
                ops = self.log.read(self.position, self.inclusive, self.batch_size);
            }
            if let Some(last) = ops.last() {
                self.position = last.op_time;
                self.inclusive = false;
            }
            Ok(Some(OplogBatch::new(ops)))
        }
        .boxed()
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        async {}.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn source() -> SyncSource {
        SyncSource::new("mem", 27017)
    }

    #[test]
    fn test_append_chains_hashes() {
        let log = MemoryOplog::new();
        let a = log.append(OpKind::Insert, "app.users", json!({"_id": 1}));
        let b = log.append(OpKind::Insert, "app.users", json!({"_id": 2}));
        assert!(a.verify_chain(0));
        assert!(b.verify_chain(a.hash));
        assert!(a.op_time < b.op_time);
    }

    #[test]
    fn test_op_times_roll_over_and_follow_term() {
        let log = MemoryOplog::new();
        let mut last = OpTime::ZERO;
        for i in 0..25 {
            if i == 20 {
                log.set_term(2);
            }
            let op = log.append(OpKind::Noop, "", json!({}));
            assert!(op.op_time > last);
            last = op.op_time;
        }
        assert_eq!(last.term, 2);
    }

    #[test]
    fn test_truncate_after() {
        let log = MemoryOplog::new();
        let a = log.append(OpKind::Insert, "app.users", json!({"_id": 1}));
        log.append(OpKind::Insert, "app.users", json!({"_id": 2}));
        log.truncate_after(a.op_time);
        assert_eq!(log.len(), 1);
        assert_eq!(log.last(), Some(a));
    }

    #[tokio::test]
    async fn test_cursor_reads_in_batches() {
        let log = MemoryOplog::new();
        let ops: Vec<_> = (0..5).map(|i| log.append(OpKind::Insert, "app.users", json!({"_id": i}))).collect();
        let provider = MemoryReaderProvider::new().with_batch_size(2).with_await_data(Duration::from_millis(1));
        provider.add_source(source(), log);

        let mut reader = provider.new_reader(&source()).await.unwrap();
        let mut cursor = reader.query_gte(ops[1].op_time).await.unwrap();

        let first = cursor.fetch_batch().await.unwrap().unwrap();
        assert_eq!(first.size(), 2);
        assert_eq!(first.peek().unwrap().op_time, ops[1].op_time);

        let second = cursor.fetch_batch().await.unwrap().unwrap();
        assert_eq!(second.peek().unwrap().op_time, ops[3].op_time);

        let third = cursor.fetch_batch().await.unwrap().unwrap();
        assert_eq!(third.size(), 0);

        reader.close().await;
        reader.close().await;
        assert_eq!(provider.readers_opened(), 1);
        assert_eq!(provider.readers_closed(), 1);
    }

    #[tokio::test]
    async fn test_idle_cursor_wakes_on_append() {
        let log = MemoryOplog::new();
        let first = log.append(OpKind::Insert, "app.users", json!({"_id": 1}));
        let provider = MemoryReaderProvider::new().with_await_data(Duration::from_secs(5));
        provider.add_source(source(), log.clone());

        let mut reader = provider.new_reader(&source()).await.unwrap();
        let mut cursor = reader.query_gte(first.op_time).await.unwrap();
        cursor.fetch_batch().await.unwrap();

        let writer = log.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            writer.append(OpKind::Insert, "app.users", json!({"_id": 2}));
        });

        let batch = tokio::time::timeout(Duration::from_secs(1), cursor.fetch_batch())
            .await
            .expect("cursor should wake on append")
            .unwrap()
            .unwrap();
        assert_eq!(batch.size(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_and_faults() {
        let log = MemoryOplog::new();
        log.append(OpKind::Insert, "app.users", json!({"_id": 1}));
        let provider = MemoryReaderProvider::new();
        provider.add_source(source(), log.clone());

        log.set_reachable(false);
        let err = provider.new_reader(&source()).await.err().unwrap();
        assert!(matches!(err, ReplicationError::SourceUnreachable { .. }));

        log.set_reachable(true);
        let mut reader = provider.new_reader(&source()).await.unwrap();
        let mut cursor = reader.query_gte(OpTime::ZERO).await.unwrap();

        provider.inject(Fault::Network);
        provider.inject(Fault::CursorLost);
        assert!(cursor.fetch_batch().await.unwrap_err().is_retryable());
        assert!(cursor.fetch_batch().await.unwrap().is_none());
        assert_eq!(cursor.fetch_batch().await.unwrap().unwrap().size(), 1);
    }

    #[tokio::test]
    async fn test_get_last_op_on_empty_log() {
        let provider = MemoryReaderProvider::new();
        provider.add_source(source(), MemoryOplog::new());
        let mut reader = provider.new_reader(&source()).await.unwrap();
        let err = reader.get_last_op().await.unwrap_err();
        assert!(matches!(err, ReplicationError::OplogStartMissing { .. }));
    }
}
