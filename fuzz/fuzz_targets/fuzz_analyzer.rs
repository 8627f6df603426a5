//! Fuzz target for the oplog batch analyzer.
//!
//! Every byte picks one operation; the analyzed batches must flatten back to
//! the exact input and respect the batch size cap.

#![no_main]

use libfuzzer_sys::fuzz_target;
use oplog_replication::{
    AnalyzedOplogBatch, AnalyzerConfig, Namespace, OpKind, OpTime, OplogBatchAnalyzer, OplogOperation,
};
use serde_json::json;

fn op_for(byte: u8, index: u32, prev: i64) -> OplogOperation {
    let db = if byte & 0x08 == 0 { "app" } else { "logs" };
    let coll = if byte & 0x10 == 0 { "users" } else { "events" };
    let (kind, ns, payload) = match byte & 0x07 {
        0 | 1 => (OpKind::Insert, format!("{db}.{coll}"), json!({"_id": index})),
        2 => (OpKind::Update, format!("{db}.{coll}"), json!({"$set": {"n": index}})),
        3 => (OpKind::Delete, format!("{db}.{coll}"), json!({"_id": index})),
        4 => (OpKind::Noop, String::new(), json!({})),
        5 => (OpKind::Command, format!("{db}.$cmd"), json!({"create": coll})),
        6 => (OpKind::Command, format!("{db}.$cmd"), json!({"renameCollection": format!("{db}.{coll}"), "to": "x.y"})),
        _ => (OpKind::Command, format!("{db}.$cmd"), json!({"applyOps": []})),
    };
    OplogOperation::chained(prev, OpTime::new(1, 1, index + 1), kind, Namespace::parse(&ns), payload)
}

fuzz_target!(|data: (u8, bool, Vec<u8>)| {
    let (max, merge_noops, bytes) = data;
    let max = usize::from(max % 16) + 1;

    let mut prev = 0;
    let ops: Vec<OplogOperation> = bytes
        .iter()
        .take(512)
        .enumerate()
        .map(|(i, &byte)| {
            let op = op_for(byte, i as u32, prev);
            prev = op.hash;
            op
        })
        .collect();

    let analyzer = OplogBatchAnalyzer::new(AnalyzerConfig { max_cud_batch_size: max, merge_noops });
    let batches = analyzer.analyze(ops.clone());
    for batch in &batches {
        assert!(!batch.is_empty());
        if let AnalyzedOplogBatch::CudBatch(cud) = batch {
            assert!(cud.ops.len() <= max);
        }
    }
    let flattened: Vec<_> = batches.into_iter().flat_map(AnalyzedOplogBatch::into_ops).collect();
    assert_eq!(flattened, ops);
});
