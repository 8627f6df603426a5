//! Property-based tests using proptest.
//!
//! These tests verify invariants that should hold for all inputs,
//! helping catch edge cases that unit tests might miss.

use oplog_replication::analyzer::OpClass;
use oplog_replication::resilience::RetryConfig;
use oplog_replication::{
    AnalyzedOplogBatch, AnalyzerConfig, Namespace, OpKind, OpTime, OplogBatchAnalyzer, OplogOperation,
};
use proptest::prelude::*;
use serde_json::{json, Value};
use std::time::Duration;

// =============================================================================
// Generators
// =============================================================================

const NAMESPACES: &[&str] = &["app.users", "app.orders", "logs.events"];

/// One operation shape: `(kind selector, namespace selector)`.
fn op_shape() -> impl Strategy<Value = (u8, usize)> {
    (0u8..8, 0usize..NAMESPACES.len())
}

fn payload_for(kind: u8, ns: usize, id: usize) -> (OpKind, String, Value) {
    let namespace = NAMESPACES[ns];
    let (db, coll) = namespace.split_once('.').unwrap();
    match kind {
        0 | 1 => (OpKind::Insert, namespace.to_string(), json!({"_id": id})),
        2 => (OpKind::Update, namespace.to_string(), json!({"$set": {"n": id}})),
        3 => (OpKind::Delete, namespace.to_string(), json!({"_id": id})),
        4 => (OpKind::Noop, String::new(), json!({"msg": "periodic noop"})),
        5 => (OpKind::Command, format!("{db}.$cmd"), json!({"create": coll})),
        6 => (OpKind::Command, format!("{db}.$cmd"), json!({"createIndexes": coll, "indexes": []})),
        _ => (OpKind::Command, format!("{db}.$cmd"), json!({"dropDatabase": 1})),
    }
}

/// A hash-chained run of operations with strictly increasing op times.
fn build_run(shapes: &[(u8, usize)]) -> Vec<OplogOperation> {
    let mut prev = 0i64;
    shapes
        .iter()
        .enumerate()
        .map(|(i, &(kind, ns))| {
            let (kind, namespace, payload) = payload_for(kind, ns, i);
            let op = OplogOperation::chained(
                prev,
                OpTime::new(1, 1_000 + (i / 10) as u32, (i % 10) as u32 + 1),
                kind,
                Namespace::parse(&namespace),
                payload,
            );
            prev = op.hash;
            op
        })
        .collect()
}

// =============================================================================
// Analyzer Properties
// =============================================================================

proptest! {
    /// Flattening the analyzed batches reproduces the input exactly
    #[test]
    fn analyzer_preserves_order_and_content(
        shapes in prop::collection::vec(op_shape(), 0..60),
        max in 1usize..8,
        merge_noops in any::<bool>(),
    ) {
        let ops = build_run(&shapes);
        let analyzer = OplogBatchAnalyzer::new(AnalyzerConfig { max_cud_batch_size: max, merge_noops });

        let flattened: Vec<_> = analyzer
            .analyze(ops.clone())
            .into_iter()
            .flat_map(AnalyzedOplogBatch::into_ops)
            .collect();
        prop_assert_eq!(flattened, ops);
    }

    /// CUD batches are non-empty, capped, and touch a single namespace
    #[test]
    fn cud_batches_are_bounded_and_single_namespace(
        shapes in prop::collection::vec(op_shape(), 1..60),
        max in 1usize..8,
        merge_noops in any::<bool>(),
    ) {
        let ops = build_run(&shapes);
        let analyzer = OplogBatchAnalyzer::new(AnalyzerConfig { max_cud_batch_size: max, merge_noops });

        for batch in analyzer.analyze(ops) {
            prop_assert!(!batch.is_empty());
            if let AnalyzedOplogBatch::CudBatch(cud) = batch {
                prop_assert!(cud.ops.len() <= max);
                for op in &cud.ops {
                    match OplogBatchAnalyzer::classify(op) {
                        OpClass::Cud(namespace) => prop_assert_eq!(&namespace, &cud.namespace),
                        OpClass::Noop => prop_assert!(merge_noops),
                        other => prop_assert!(false, "{:?} inside a CUD batch", other),
                    }
                }
            }
        }
    }

    /// Commands never share a batch with anything else
    #[test]
    fn commands_stand_alone(shapes in prop::collection::vec(op_shape(), 1..60)) {
        let ops = build_run(&shapes);
        let commands = ops.iter().filter(|op| op.kind == OpKind::Command).count();

        let standalone = OplogBatchAnalyzer::default()
            .analyze(ops)
            .iter()
            .filter(|batch| match batch {
                AnalyzedOplogBatch::NamespaceJob(_) => true,
                AnalyzedOplogBatch::SingleOp(op) => op.kind == OpKind::Command,
                AnalyzedOplogBatch::CudBatch(_) => false,
            })
            .count();
        prop_assert_eq!(standalone, commands);
    }
}

// =============================================================================
// OpTime Properties
// =============================================================================

proptest! {
    /// Ordering is lexicographic over (term, secs, inc)
    #[test]
    fn optime_order_matches_tuple_order(
        a in (any::<i64>(), any::<u32>(), any::<u32>()),
        b in (any::<i64>(), any::<u32>(), any::<u32>()),
    ) {
        let x = OpTime::new(a.0, a.1, a.2);
        let y = OpTime::new(b.0, b.1, b.2);
        prop_assert_eq!(x.cmp(&y), a.cmp(&b));
    }

    /// Display output parses back to the same position
    #[test]
    fn optime_display_parses_back(term in any::<i64>(), secs in any::<u32>(), inc in any::<u32>()) {
        let op_time = OpTime::new(term, secs, inc);
        let parsed: OpTime = op_time.to_string().parse().unwrap();
        prop_assert_eq!(parsed, op_time);
    }

    /// Lag never underflows and is zero when the newer position is not newer
    #[test]
    fn lag_is_saturating(a in any::<u32>(), b in any::<u32>()) {
        let older = OpTime::new(1, a, 1);
        let newer = OpTime::new(1, b, 1);
        let lag = older.lag_secs(&newer);
        prop_assert_eq!(lag, u64::from(b.saturating_sub(a)));
    }

    /// Arbitrary strings never panic the parser
    #[test]
    fn optime_parse_never_panics(s in ".{0,40}") {
        let _ = s.parse::<OpTime>();
    }
}

// =============================================================================
// Hash Chain Properties
// =============================================================================

proptest! {
    /// Every operation of a built run verifies against its predecessor
    #[test]
    fn chain_verifies_end_to_end(shapes in prop::collection::vec(op_shape(), 1..40)) {
        let ops = build_run(&shapes);
        let mut prev = 0i64;
        for op in &ops {
            prop_assert!(op.verify_chain(prev));
            prev = op.hash;
        }
    }

    /// Changing the payload of any operation breaks its link
    #[test]
    fn tampered_payload_breaks_chain(
        shapes in prop::collection::vec(op_shape(), 1..40),
        pick in any::<prop::sample::Index>(),
    ) {
        let mut ops = build_run(&shapes);
        let i = pick.index(ops.len());
        let prev = if i == 0 { 0 } else { ops[i - 1].hash };
        ops[i].payload = json!({"tampered": true});
        prop_assert!(!ops[i].verify_chain(prev));
    }

    /// Raw document rendering parses back to the same operation
    #[test]
    fn raw_document_parses_back(shapes in prop::collection::vec(op_shape(), 1..10)) {
        for op in build_run(&shapes) {
            let parsed = OplogOperation::from_document(&op.to_document()).unwrap();
            prop_assert_eq!(parsed, op);
        }
    }
}

// =============================================================================
// Retry Backoff Properties
// =============================================================================

proptest! {
    /// Delays never decrease and never exceed the ceiling
    #[test]
    fn backoff_is_monotonic_and_capped(
        initial_ms in 1u64..1_000,
        max_ms in 1u64..60_000,
        factor in 1.0f64..4.0,
    ) {
        let config = RetryConfig {
            max_attempts: 20,
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(max_ms),
            backoff_factor: factor,
        };
        let ceiling = Duration::from_millis(max_ms.max(initial_ms));
        let mut last = Duration::ZERO;
        for attempt in 1..=20 {
            let delay = config.delay_for_attempt(attempt);
            prop_assert!(delay >= last || delay == config.max_delay);
            prop_assert!(delay <= ceiling);
            last = delay;
        }
    }
}
