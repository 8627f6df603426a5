// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync source selection.
//!
//! The fetcher asks a [`SyncSourceProvider`] for an upstream member to follow
//! and polls it at every batch boundary to learn whether a better one has
//! appeared. [`RankedSyncSourceProvider`] is the built-in implementation: it
//! ranks configured candidates by priority, then latency, and excludes
//! candidates that keep failing.
//!
//! # Candidate Circuit
//!
//! ```text
//! Closed ──(N consecutive failures)──► Open ──(reset timeout)──► Closed (half-open)
//!   ▲                                                                 │
//!   └───────────────────────(report_status reachable)─────────────────┘
//! ```
//!
//! # Eligibility
//!
//! A candidate is eligible when it is reachable, its circuit is closed, and its
//! last known position is not behind the replica's watermark. A candidate that
//! has never reported a position is eligible; report positions through
//! [`RankedSyncSourceProvider::report_status`] to keep lagging members out.

use crate::config::SourceConfig;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::oplog::OpTime;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// `host:port` of an upstream member.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SyncSource {
    pub host: String,
    pub port: u16,
}

impl SyncSource {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }
}

impl fmt::Display for SyncSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for SyncSource {
    type Err = ReplicationError;

    /// Parse `"host:port"`; the port defaults to 27017.
    fn from_str(s: &str) -> Result<Self> {
        match s.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                let port = port
                    .parse()
                    .map_err(|_| ReplicationError::Config(format!("invalid port in sync source {s:?}")))?;
                Ok(Self::new(host, port))
            }
            None if !s.is_empty() => Ok(Self::new(s, 27017)),
            _ => Err(ReplicationError::Config(format!("invalid sync source {s:?}"))),
        }
    }
}

/// Chooses and monitors the upstream member the fetcher follows.
pub trait SyncSourceProvider: Send + Sync {
    /// Pick a source whose oplog reaches at least `last_fetched`.
    ///
    /// Fails with [`ReplicationError::NoSyncSource`] when nothing qualifies.
    fn new_sync_source(&self, last_fetched: OpTime) -> BoxFuture<'_, Result<SyncSource>>;

    /// Whether a strictly better source than the current one is available.
    fn should_change_sync_source(&self) -> bool;

    /// The fetcher could not reach `source`.
    fn source_failed(&self, _source: &SyncSource) {}

    /// Source currently followed, if the provider tracks one.
    fn current_source(&self) -> Option<SyncSource> {
        None
    }
}

/// Observed state of a candidate, reported by whoever monitors the upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandidateStatus {
    pub reachable: bool,
    /// Last operation the candidate has written, if known.
    pub last_op_time: Option<OpTime>,
    /// Round-trip latency, if measured.
    pub ping: Option<Duration>,
}

impl Default for CandidateStatus {
    fn default() -> Self {
        Self {
            reachable: true,
            last_op_time: None,
            ping: None,
        }
    }
}

struct Candidate {
    config: SourceConfig,
    status: CandidateStatus,
    consecutive_failures: u32,
    circuit_opened_at: Option<Instant>,
}

impl Candidate {
    fn circuit_open(&self) -> bool {
        match self.circuit_opened_at {
            Some(opened_at) => opened_at.elapsed() < self.config.circuit_reset_timeout(),
            None => false,
        }
    }

    fn eligible(&self, last_fetched: Option<OpTime>) -> bool {
        if !self.status.reachable || self.circuit_open() {
            return false;
        }
        match (self.status.last_op_time, last_fetched) {
            (Some(theirs), Some(ours)) => theirs >= ours,
            _ => true,
        }
    }

    fn rank(&self) -> (u32, Duration) {
        (self.config.priority, self.status.ping.unwrap_or(Duration::MAX))
    }
}

/// Priority- and latency-ranked provider over a fixed candidate list.
pub struct RankedSyncSourceProvider {
    replica: String,
    candidates: DashMap<SyncSource, Candidate>,
    current: Mutex<Option<SyncSource>>,
    /// Same-priority candidates must be at least this much faster to preempt.
    max_latency_advantage: Duration,
}

impl RankedSyncSourceProvider {
    /// Build from configuration. Fails if a host cannot be parsed.
    pub fn new(replica: impl Into<String>, sources: &[SourceConfig]) -> Result<Self> {
        let provider = Self {
            replica: replica.into(),
            candidates: DashMap::new(),
            current: Mutex::new(None),
            max_latency_advantage: Duration::from_millis(30),
        };
        for config in sources {
            provider.add_candidate(config.clone())?;
        }
        Ok(provider)
    }

    pub fn with_max_latency_advantage(mut self, advantage: Duration) -> Self {
        self.max_latency_advantage = advantage;
        self
    }

    pub fn add_candidate(&self, config: SourceConfig) -> Result<()> {
        let source: SyncSource = config.host.parse()?;
        self.candidates.insert(
            source,
            Candidate {
                config,
                status: CandidateStatus::default(),
                consecutive_failures: 0,
                circuit_opened_at: None,
            },
        );
        Ok(())
    }

    pub fn remove_candidate(&self, source: &SyncSource) {
        self.candidates.remove(source);
    }

    /// Update a candidate's observed state. A reachable report closes its circuit.
    pub fn report_status(&self, source: &SyncSource, status: CandidateStatus) {
        if let Some(mut candidate) = self.candidates.get_mut(source) {
            if status.reachable {
                candidate.consecutive_failures = 0;
                candidate.circuit_opened_at = None;
            }
            candidate.status = status;
        }
    }

    /// Record a failure against a candidate; may open its circuit.
    pub fn record_failure(&self, source: &SyncSource) {
        let Some(mut candidate) = self.candidates.get_mut(source) else {
            return;
        };
        candidate.consecutive_failures += 1;
        let threshold = candidate.config.circuit_failure_threshold;
        if candidate.consecutive_failures >= threshold {
            candidate.circuit_opened_at = Some(Instant::now());
            warn!(
                replica = %self.replica,
                source = %source,
                failures = candidate.consecutive_failures,
                threshold,
                reset_timeout_sec = candidate.config.circuit_reset_timeout_sec,
                "Sync source excluded after repeated failures"
            );
            metrics::record_source_circuit_open(&self.replica, &source.to_string());
        }
    }

    /// The source handed out by the last successful `new_sync_source`.
    pub fn current(&self) -> Option<SyncSource> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Number of configured candidates.
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    fn best(&self, last_fetched: Option<OpTime>) -> Option<(SyncSource, (u32, Duration))> {
        self.candidates
            .iter()
            .filter(|entry| entry.value().eligible(last_fetched))
            .map(|entry| (entry.key().clone(), entry.value().rank()))
            .min_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)))
    }

    fn select(&self, last_fetched: OpTime) -> Result<SyncSource> {
        let Some((source, (priority, _))) = self.best(Some(last_fetched)) else {
            return Err(ReplicationError::NoSyncSource(format!(
                "none of {} candidates is reachable and caught up to {}",
                self.candidates.len(),
                last_fetched
            )));
        };

        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if current.as_ref() != Some(&source) {
            info!(replica = %self.replica, source = %source, priority, "Selected sync source");
            metrics::record_source_selected(&self.replica, &source.to_string());
        }
        *current = Some(source.clone());
        Ok(source)
    }
}

impl SyncSourceProvider for RankedSyncSourceProvider {
    fn new_sync_source(&self, last_fetched: OpTime) -> BoxFuture<'_, Result<SyncSource>> {
        let selected = self.select(last_fetched);
        async move { selected }.boxed()
    }

    fn should_change_sync_source(&self) -> bool {
        let Some(current) = self.current() else {
            return false;
        };
        let Some(ours) = self.candidates.get(&current) else {
            debug!(replica = %self.replica, source = %current, "Current sync source removed");
            return true;
        };
        if !ours.eligible(None) {
            return true;
        }
        let (our_priority, our_ping) = ours.rank();
        let our_position = ours.status.last_op_time;
        drop(ours);

        let Some((better, (priority, ping))) = self.best(our_position) else {
            return false;
        };
        if better == current {
            return false;
        }
        let preempt = priority < our_priority
            || (priority == our_priority && our_ping.saturating_sub(ping) > self.max_latency_advantage);
        if preempt {
            debug!(replica = %self.replica, current = %current, better = %better, "Better sync source available");
        }
        preempt
    }

    fn source_failed(&self, source: &SyncSource) {
        self.record_failure(source);
    }

    fn current_source(&self) -> Option<SyncSource> {
        self.current()
    }
}
