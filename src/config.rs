//! Configuration for the replication engine.
//!
//! Configuration is passed to [`ReplicationService::new()`](crate::ReplicationService::new)
//! and can be constructed programmatically or deserialized from JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use oplog_replication::config::{ReplicationConfig, SourceConfig};
//!
//! let config = ReplicationConfig {
//!     replica_name: "rs0".into(),
//!     sources: vec![
//!         SourceConfig::for_testing("db1.example.com:27017", 0),
//!         SourceConfig::for_testing("db2.example.com:27017", 1),
//!     ],
//!     ..Default::default()
//! };
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicationConfig
//! ├── replica_name: String          # Key for the persisted watermark, metric label
//! ├── settings: ReplicationSettings
//! │   ├── fetcher: FetcherConfig    # Pacing, source retry, restart backoff
//! │   ├── analyzer: AnalyzerConfig  # Batch split policy
//! │   ├── applier: ApplierConfig    # Handoff capacity, conflict retries
//! │   └── slo: SloConfig            # SLO thresholds
//! ├── sources: Vec<SourceConfig>    # Upstream candidates
//! └── watermark: WatermarkConfig    # SQLite watermark persistence
//! ```
//!
//! # JSON Example
//!
//! ```json
//! {
//!   "replica_name": "rs0",
//!   "settings": {
//!     "fetcher": { "min_batch_size": 5, "batching_window": "2ms" },
//!     "applier": { "conflict_retry_attempts": 10 }
//!   },
//!   "sources": [ { "host": "db1:27017", "priority": 0 } ],
//!   "watermark": { "sqlite_path": "/var/lib/app/watermarks.db" }
//! }
//! ```

use crate::resilience::RetryConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `ReplicationService::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Name of the replicated source (replica set or shard).
    /// Keys the persisted watermark and labels every metric.
    pub replica_name: String,

    /// Tunable parameters for fetching, batching, applying and SLOs.
    #[serde(default)]
    pub settings: ReplicationSettings,

    /// Upstream members eligible as sync source.
    #[serde(default)]
    pub sources: Vec<SourceConfig>,

    /// Watermark persistence settings.
    #[serde(default)]
    pub watermark: WatermarkConfig,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            replica_name: "rs0".to_string(),
            settings: ReplicationSettings::default(),
            sources: Vec::new(),
            watermark: WatermarkConfig::default(),
        }
    }
}

impl ReplicationConfig {
    /// Create a minimal config for testing.
    pub fn for_testing(replica_name: &str) -> Self {
        Self {
            replica_name: replica_name.to_string(),
            settings: ReplicationSettings::for_testing(),
            sources: Vec::new(),
            watermark: WatermarkConfig::in_memory(),
        }
    }
}

/// General settings for the replication logic.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReplicationSettings {
    #[serde(default)]
    pub fetcher: FetcherConfig,
    #[serde(default)]
    pub analyzer: AnalyzerConfig,
    #[serde(default)]
    pub applier: ApplierConfig,
    #[serde(default)]
    pub slo: SloConfig,
}

impl ReplicationSettings {
    pub fn for_testing() -> Self {
        Self {
            fetcher: FetcherConfig::for_testing(),
            analyzer: AnalyzerConfig::default(),
            applier: ApplierConfig::for_testing(),
            slo: SloConfig::default(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SourceConfig: one entry per upstream member
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for one sync source candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// `host:port` of the member.
    pub host: String,

    /// Lower = preferred.
    #[serde(default)]
    pub priority: u32,

    /// Number of consecutive failures before the candidate is excluded.
    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,

    /// How long an excluded candidate stays excluded (seconds).
    #[serde(default = "default_circuit_reset_timeout")]
    pub circuit_reset_timeout_sec: u64,
}

fn default_circuit_failure_threshold() -> u32 {
    3
}

fn default_circuit_reset_timeout() -> u64 {
    30
}

impl SourceConfig {
    /// Create a source config for testing.
    pub fn for_testing(host: &str, priority: u32) -> Self {
        Self {
            host: host.to_string(),
            priority,
            circuit_failure_threshold: 3,
            circuit_reset_timeout_sec: 30,
        }
    }

    pub fn circuit_reset_timeout(&self) -> Duration {
        Duration::from_secs(self.circuit_reset_timeout_sec)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// FetcherConfig: oplog tailing settings
// ═══════════════════════════════════════════════════════════════════════════════

/// Fetch loop configuration.
///
/// Duration fields are humantime strings (`"2ms"`, `"1s"`) parsed on use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetcherConfig {
    /// Batches smaller than this are considered "tiny" for pacing.
    #[serde(default = "default_min_batch_size")]
    pub min_batch_size: usize,

    /// A tiny batch fetched less than this long ago triggers a pacing sleep.
    #[serde(default = "default_batching_window")]
    pub batching_window: String,

    /// Length of the pacing sleep.
    #[serde(default = "default_batching_sleep")]
    pub batching_sleep: String,

    /// Sleep between attempts when no source is reachable.
    #[serde(default = "default_source_retry_delay")]
    pub source_retry_delay: String,

    /// First restart backoff after a transient streaming failure.
    #[serde(default = "default_restart_backoff_initial")]
    pub restart_backoff_initial: String,

    /// Ceiling for restart backoff.
    #[serde(default = "default_restart_backoff_max")]
    pub restart_backoff_max: String,
}

fn default_min_batch_size() -> usize {
    5
}

fn default_batching_window() -> String {
    "2ms".to_string()
}

fn default_batching_sleep() -> String {
    "2ms".to_string()
}

fn default_source_retry_delay() -> String {
    "1s".to_string()
}

fn default_restart_backoff_initial() -> String {
    "100ms".to_string()
}

fn default_restart_backoff_max() -> String {
    "30s".to_string()
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            min_batch_size: default_min_batch_size(),
            batching_window: default_batching_window(),
            batching_sleep: default_batching_sleep(),
            source_retry_delay: default_source_retry_delay(),
            restart_backoff_initial: default_restart_backoff_initial(),
            restart_backoff_max: default_restart_backoff_max(),
        }
    }
}

impl FetcherConfig {
    /// Short delays so tests don't wait on real-world timings.
    pub fn for_testing() -> Self {
        Self {
            source_retry_delay: "20ms".to_string(),
            restart_backoff_initial: "5ms".to_string(),
            restart_backoff_max: "50ms".to_string(),
            ..Default::default()
        }
    }

    pub fn batching_window_duration(&self) -> Duration {
        humantime::parse_duration(&self.batching_window).unwrap_or(Duration::from_millis(2))
    }

    pub fn batching_sleep_duration(&self) -> Duration {
        humantime::parse_duration(&self.batching_sleep).unwrap_or(Duration::from_millis(2))
    }

    pub fn source_retry_delay_duration(&self) -> Duration {
        humantime::parse_duration(&self.source_retry_delay).unwrap_or(Duration::from_secs(1))
    }

    /// Restart backoff policy: [`RetryConfig::daemon`] with the configured
    /// delays. The fetcher resets it after progress.
    pub fn restart_backoff(&self) -> RetryConfig {
        let daemon = RetryConfig::daemon();
        RetryConfig {
            initial_delay: humantime::parse_duration(&self.restart_backoff_initial).unwrap_or(daemon.initial_delay),
            max_delay: humantime::parse_duration(&self.restart_backoff_max).unwrap_or(daemon.max_delay),
            ..daemon
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// AnalyzerConfig: batch split policy
// ═══════════════════════════════════════════════════════════════════════════════

/// Policy the analyzer uses to split a run of operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    /// Upper bound on operations in one CUD batch (one transaction).
    #[serde(default = "default_max_cud_batch_size")]
    pub max_cud_batch_size: usize,

    /// Let no-ops ride along in the CUD batch in progress instead of
    /// becoming their own single-op batch.
    #[serde(default = "default_true")]
    pub merge_noops: bool,
}

fn default_max_cud_batch_size() -> usize {
    1000
}

fn default_true() -> bool {
    true
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            max_cud_batch_size: default_max_cud_batch_size(),
            merge_noops: true,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ApplierConfig: handoff and executor settings
// ═══════════════════════════════════════════════════════════════════════════════

/// Applier-side configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplierConfig {
    /// Capacity of the bounded fetcher → applier channel.
    #[serde(default = "default_handoff_capacity")]
    pub handoff_capacity: usize,

    /// Maximum operations the applier drains before analyzing a round.
    #[serde(default = "default_max_ops_per_round")]
    pub max_ops_per_round: usize,

    /// How long `deliver` waits on a full channel before reporting an
    /// interruption (the fetcher then retries the same operation).
    #[serde(default = "default_deliver_timeout")]
    pub deliver_timeout: String,

    /// Attempts per batch before giving up on backend conflicts.
    #[serde(default = "default_conflict_retry_attempts")]
    pub conflict_retry_attempts: usize,

    /// First delay between conflict retries.
    #[serde(default = "default_conflict_retry_initial")]
    pub conflict_retry_initial: String,

    /// Ceiling for conflict retry delay.
    #[serde(default = "default_conflict_retry_max")]
    pub conflict_retry_max: String,

    /// Treat updates as upserts for every batch, not only while reapplying.
    #[serde(default)]
    pub updates_as_upserts: bool,

    /// How long shutdown waits for the tasks to finish.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout: String,
}

fn default_handoff_capacity() -> usize {
    1024
}

fn default_max_ops_per_round() -> usize {
    10_000
}

fn default_deliver_timeout() -> String {
    "5s".to_string()
}

fn default_conflict_retry_attempts() -> usize {
    5
}

fn default_conflict_retry_initial() -> String {
    "10ms".to_string()
}

fn default_conflict_retry_max() -> String {
    "1s".to_string()
}

fn default_drain_timeout() -> String {
    "10s".to_string()
}

impl Default for ApplierConfig {
    fn default() -> Self {
        Self {
            handoff_capacity: default_handoff_capacity(),
            max_ops_per_round: default_max_ops_per_round(),
            deliver_timeout: default_deliver_timeout(),
            conflict_retry_attempts: default_conflict_retry_attempts(),
            conflict_retry_initial: default_conflict_retry_initial(),
            conflict_retry_max: default_conflict_retry_max(),
            updates_as_upserts: false,
            drain_timeout: default_drain_timeout(),
        }
    }
}

impl ApplierConfig {
    pub fn for_testing() -> Self {
        Self {
            handoff_capacity: 16,
            deliver_timeout: "200ms".to_string(),
            conflict_retry_attempts: 3,
            conflict_retry_initial: "1ms".to_string(),
            conflict_retry_max: "10ms".to_string(),
            drain_timeout: "2s".to_string(),
            ..Default::default()
        }
    }

    pub fn deliver_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.deliver_timeout).unwrap_or(Duration::from_secs(5))
    }

    pub fn drain_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.drain_timeout).unwrap_or(Duration::from_secs(10))
    }

    /// Retry policy for backend conflicts: [`RetryConfig::backend_conflicts`]
    /// with the configured attempts and delays.
    pub fn conflict_retry(&self) -> RetryConfig {
        let preset = RetryConfig::backend_conflicts();
        RetryConfig {
            max_attempts: self.conflict_retry_attempts.max(1),
            initial_delay: humantime::parse_duration(&self.conflict_retry_initial).unwrap_or(preset.initial_delay),
            max_delay: humantime::parse_duration(&self.conflict_retry_max).unwrap_or(preset.max_delay),
            ..preset
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SloConfig: Service Level Objectives for alerting
// ═══════════════════════════════════════════════════════════════════════════════

/// SLO thresholds for detecting performance degradation.
///
/// Violations are logged and exposed via metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SloConfig {
    /// Maximum acceptable batch fetch latency (ms).
    #[serde(default = "default_max_batch_read_latency_ms")]
    pub max_batch_read_latency_ms: u64,

    /// Maximum acceptable latency for applying one analyzed batch (ms).
    #[serde(default = "default_max_batch_apply_latency_ms")]
    pub max_batch_apply_latency_ms: u64,

    /// Maximum acceptable gap between fetched and applied positions (seconds).
    #[serde(default = "default_max_apply_lag_sec")]
    pub max_apply_lag_sec: u64,
}

fn default_max_batch_read_latency_ms() -> u64 {
    500
}

fn default_max_batch_apply_latency_ms() -> u64 {
    200
}

fn default_max_apply_lag_sec() -> u64 {
    30
}

impl Default for SloConfig {
    fn default() -> Self {
        Self {
            max_batch_read_latency_ms: 500,
            max_batch_apply_latency_ms: 200,
            max_apply_lag_sec: 30,
        }
    }
}

impl SloConfig {
    pub fn is_batch_read_violation(&self, latency: Duration) -> bool {
        latency.as_millis() as u64 > self.max_batch_read_latency_ms
    }

    pub fn is_batch_apply_violation(&self, latency: Duration) -> bool {
        latency.as_millis() as u64 > self.max_batch_apply_latency_ms
    }

    pub fn is_apply_lag_violation(&self, lag_secs: u64) -> bool {
        lag_secs > self.max_apply_lag_sec
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// WatermarkConfig: applied-position persistence
// ═══════════════════════════════════════════════════════════════════════════════

/// Watermark persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatermarkConfig {
    /// Path to SQLite database for watermark storage.
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

impl Default for WatermarkConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "replication_watermarks.db".to_string(),
            wal_mode: true,
        }
    }
}

impl WatermarkConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetcher_defaults_match_pacing_constants() {
        let config = FetcherConfig::default();
        assert_eq!(config.min_batch_size, 5);
        assert_eq!(config.batching_window_duration(), Duration::from_millis(2));
        assert_eq!(config.batching_sleep_duration(), Duration::from_millis(2));
        assert_eq!(config.source_retry_delay_duration(), Duration::from_secs(1));
    }

    #[test]
    fn test_duration_parsing_various_formats() {
        let test_cases = [
            ("5s", Duration::from_secs(5)),
            ("1m", Duration::from_secs(60)),
            ("500ms", Duration::from_millis(500)),
            ("2min", Duration::from_secs(120)),
        ];

        for (input, expected) in test_cases {
            let config = FetcherConfig {
                source_retry_delay: input.to_string(),
                ..Default::default()
            };
            assert_eq!(config.source_retry_delay_duration(), expected, "Failed for input: {}", input);
        }
    }

    #[test]
    fn test_duration_invalid_fallback() {
        let config = FetcherConfig {
            batching_sleep: "soon".to_string(),
            source_retry_delay: "invalid".to_string(),
            ..Default::default()
        };
        assert_eq!(config.batching_sleep_duration(), Duration::from_millis(2));
        assert_eq!(config.source_retry_delay_duration(), Duration::from_secs(1));
    }

    #[test]
    fn test_restart_backoff_never_gives_up() {
        let backoff = FetcherConfig::default().restart_backoff();
        assert_eq!(backoff.max_attempts, usize::MAX);
        assert_eq!(backoff.initial_delay, Duration::from_millis(100));
        assert_eq!(backoff.max_delay, Duration::from_secs(30));
    }

    #[test]
    fn test_conflict_retry_at_least_one_attempt() {
        let config = ApplierConfig {
            conflict_retry_attempts: 0,
            ..Default::default()
        };
        assert_eq!(config.conflict_retry().max_attempts, 1);
        assert_eq!(ApplierConfig::default().conflict_retry().max_attempts, 5);
    }

    #[test]
    fn test_retry_policies_fall_back_to_presets() {
        let fetcher = FetcherConfig {
            restart_backoff_initial: "whenever".to_string(),
            restart_backoff_max: "later".to_string(),
            ..Default::default()
        };
        assert_eq!(fetcher.restart_backoff(), RetryConfig::daemon());

        let applier = ApplierConfig {
            conflict_retry_initial: "asap".to_string(),
            conflict_retry_max: "eventually".to_string(),
            ..Default::default()
        };
        assert_eq!(applier.conflict_retry(), RetryConfig::backend_conflicts());
    }

    #[test]
    fn test_slo_violations() {
        let config = SloConfig::default();

        assert!(!config.is_batch_read_violation(Duration::from_millis(500)));
        assert!(config.is_batch_read_violation(Duration::from_millis(501)));

        assert!(!config.is_batch_apply_violation(Duration::from_millis(200)));
        assert!(config.is_batch_apply_violation(Duration::from_millis(201)));

        assert!(!config.is_apply_lag_violation(30));
        assert!(config.is_apply_lag_violation(31));
    }

    #[test]
    fn test_source_config_defaults() {
        let source: SourceConfig = serde_json::from_str(r#"{"host": "db1:27017"}"#).unwrap();
        assert_eq!(source.priority, 0);
        assert_eq!(source.circuit_failure_threshold, 3);
        assert_eq!(source.circuit_reset_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_watermark_config_in_memory() {
        let config = WatermarkConfig::in_memory();
        assert_eq!(config.sqlite_path, ":memory:");
        assert!(!config.wal_mode);
        assert!(WatermarkConfig::default().wal_mode);
    }

    #[test]
    fn test_for_testing_config() {
        let config = ReplicationConfig::for_testing("rs-test");
        assert_eq!(config.replica_name, "rs-test");
        assert_eq!(config.watermark.sqlite_path, ":memory:");
        assert_eq!(config.settings.applier.handoff_capacity, 16);
    }

    #[test]
    fn test_minimal_json_uses_defaults() {
        let config: ReplicationConfig = serde_json::from_str(r#"{"replica_name": "shard-a"}"#).unwrap();
        assert_eq!(config.replica_name, "shard-a");
        assert!(config.sources.is_empty());
        assert_eq!(config.settings.fetcher.min_batch_size, 5);
        assert_eq!(config.settings.analyzer.max_cud_batch_size, 1000);
        assert!(config.settings.analyzer.merge_noops);
        assert_eq!(config.watermark.sqlite_path, "replication_watermarks.db");
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config = ReplicationConfig {
            replica_name: "rs-roundtrip".to_string(),
            settings: ReplicationSettings::default(),
            sources: vec![
                SourceConfig::for_testing("db1:27017", 0),
                SourceConfig::for_testing("db2:27017", 2),
            ],
            watermark: WatermarkConfig::default(),
        };

        let json = serde_json::to_string(&config).unwrap();
        let parsed: ReplicationConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.replica_name, "rs-roundtrip");
        assert_eq!(parsed.sources.len(), 2);
        assert_eq!(parsed.sources[1].host, "db2:27017");
        assert_eq!(parsed.sources[1].priority, 2);
    }
}
