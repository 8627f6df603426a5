//! In-memory upstream replica set and service wiring.
//!
//! Every member gets its own [`MemoryOplog`]; [`Upstream::append`] writes to
//! the first member and copies the operation to the others, so members share
//! history until a test makes them diverge.

use oplog_replication::{
    MemoryBackend, MemoryOplog, MemoryReaderProvider, OpKind, OplogOperation, RankedSyncSourceProvider,
    ReplicationConfig, ReplicationService, ServiceState, SourceConfig, SyncSource, Watermark,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

pub const REPLICA: &str = "rs-test";

/// Upper bound on any wait in these tests.
pub const WAIT: Duration = Duration::from_secs(5);

pub struct Upstream {
    pub members: Vec<(SyncSource, MemoryOplog)>,
    pub readers: Arc<MemoryReaderProvider>,
    pub sources: Arc<RankedSyncSourceProvider>,
}

impl Upstream {
    /// Single member `db1:27017`.
    pub fn new() -> Self {
        Self::with_members(&[("db1:27017", 0)])
    }

    /// Members as `(host:port, priority)`.
    pub fn with_members(members: &[(&str, u32)]) -> Self {
        let readers = Arc::new(MemoryReaderProvider::new().with_await_data(Duration::from_millis(5)));
        let configs: Vec<SourceConfig> = members
            .iter()
            .map(|(host, priority)| SourceConfig::for_testing(host, *priority))
            .collect();
        let sources = Arc::new(RankedSyncSourceProvider::new(REPLICA, &configs).expect("valid hosts"));

        let members = members
            .iter()
            .map(|(host, _)| {
                let source: SyncSource = host.parse().expect("valid host");
                let log = MemoryOplog::new();
                readers.add_source(source.clone(), log.clone());
                (source, log)
            })
            .collect();

        Self { members, readers, sources }
    }

    pub fn primary(&self) -> &MemoryOplog {
        &self.members[0].1
    }

    pub fn member(&self, index: usize) -> &MemoryOplog {
        &self.members[index].1
    }

    /// Append to the first member and replicate to the rest.
    pub fn append(&self, kind: OpKind, namespace: &str, payload: Value) -> OplogOperation {
        let op = self.primary().append(kind, namespace, payload);
        for (_, log) in &self.members[1..] {
            log.push_raw(op.clone());
        }
        op
    }

    pub fn insert(&self, namespace: &str, id: usize) -> OplogOperation {
        self.append(OpKind::Insert, namespace, json!({"_id": id}))
    }

    pub fn insert_many(&self, namespace: &str, count: usize) -> Vec<OplogOperation> {
        (0..count).map(|id| self.insert(namespace, id)).collect()
    }
}

pub fn service(upstream: &Upstream, backend: &MemoryBackend) -> ReplicationService {
    service_with_config(upstream, backend, ReplicationConfig::for_testing(REPLICA))
}

pub fn service_with_config(
    upstream: &Upstream,
    backend: &MemoryBackend,
    config: ReplicationConfig,
) -> ReplicationService {
    ReplicationService::new(
        config,
        upstream.sources.clone(),
        upstream.readers.clone(),
        Arc::new(backend.clone()),
    )
}

/// Wait until the applied watermark is exactly `op`'s.
pub async fn wait_applied(service: &ReplicationService, op: &OplogOperation) {
    let target = Watermark::of(op);
    let mut rx = service.applied_receiver();
    tokio::time::timeout(WAIT, rx.wait_for(|applied| *applied == Some(target)))
        .await
        .unwrap_or_else(|_| panic!("applied watermark did not reach {target}, at {:?}", *service.applied_receiver().borrow()))
        .expect("service dropped its applied watermark");
}

pub async fn wait_state(service: &ReplicationService, state: ServiceState) {
    let mut rx = service.state_receiver();
    tokio::time::timeout(WAIT, rx.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("service never reached {state}, still {}", service.state()))
        .expect("service dropped its state");
}

/// Poll `condition` until it holds.
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
