// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Oplog batch analyzer.
//!
//! Splits an ordered run of operations into [`AnalyzedOplogBatch`]es that can
//! each be applied in one transaction:
//!
//! ```text
//! i(a.x) i(a.x) u(a.x) | c:create(a.y) | i(a.y) d(a.y) n | c:dropDatabase(a) | i(a.x)
//! └────CudBatch a.x───┘ └─NamespaceJob─┘ └──CudBatch a.y─┘ └─────SingleOp─────┘ └Cud┘
//! ```
//!
//! Flattening the output in order always reproduces the input exactly. The
//! split policy (batch size cap, no-op merging) lives in [`AnalyzerConfig`].

use crate::config::AnalyzerConfig;
use crate::oplog::{Namespace, OpKind, OplogOperation};
use tracing::trace;

/// Commands that change one collection's definition.
const NAMESPACE_COMMANDS: &[&str] = &[
    "create",
    "drop",
    "createIndexes",
    "dropIndexes",
    "deleteIndexes",
    "collMod",
    "emptycapped",
    "renameCollection",
];

/// Contiguous inserts/updates/deletes on one namespace.
#[derive(Debug, Clone, PartialEq)]
pub struct CudBatch {
    pub namespace: Namespace,
    /// Never empty.
    pub ops: Vec<OplogOperation>,
}

/// A collection-level DDL operation that must be applied on its own.
#[derive(Debug, Clone, PartialEq)]
pub struct NamespaceJob {
    pub namespace: Namespace,
    pub op: OplogOperation,
}

/// Unit of application produced by the analyzer.
#[derive(Debug, Clone, PartialEq)]
pub enum AnalyzedOplogBatch {
    /// One operation that cannot be merged (e.g. an administrative command).
    SingleOp(OplogOperation),
    CudBatch(CudBatch),
    NamespaceJob(NamespaceJob),
}

impl AnalyzedOplogBatch {
    pub fn first_op(&self) -> Option<&OplogOperation> {
        match self {
            Self::SingleOp(op) => Some(op),
            Self::CudBatch(batch) => batch.ops.first(),
            Self::NamespaceJob(job) => Some(&job.op),
        }
    }

    /// Last operation in the batch: the position reached once it is applied.
    pub fn last_op(&self) -> Option<&OplogOperation> {
        match self {
            Self::SingleOp(op) => Some(op),
            Self::CudBatch(batch) => batch.ops.last(),
            Self::NamespaceJob(job) => Some(&job.op),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::CudBatch(batch) => batch.ops.len(),
            Self::SingleOp(_) | Self::NamespaceJob(_) => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_ops(self) -> Vec<OplogOperation> {
        match self {
            Self::SingleOp(op) => vec![op],
            Self::CudBatch(batch) => batch.ops,
            Self::NamespaceJob(job) => vec![job.op],
        }
    }

    /// Short label used in logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::SingleOp(_) => "single_op",
            Self::CudBatch(_) => "cud_batch",
            Self::NamespaceJob(_) => "namespace_job",
        }
    }
}

/// How one operation may be grouped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpClass {
    Cud(Namespace),
    NamespaceJob(Namespace),
    Single,
    Noop,
}

/// Groups fetched operations into classified batches.
#[derive(Debug, Clone, Default)]
pub struct OplogBatchAnalyzer {
    config: AnalyzerConfig,
}

impl OplogBatchAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        Self { config }
    }

    pub fn classify(op: &OplogOperation) -> OpClass {
        match op.kind {
            OpKind::Insert | OpKind::Update | OpKind::Delete => OpClass::Cud(op.namespace.clone()),
            OpKind::Noop => OpClass::Noop,
            OpKind::Command => match op.command_name() {
                Some(name) if NAMESPACE_COMMANDS.contains(&name) => OpClass::NamespaceJob(op.target_namespace()),
                _ => OpClass::Single,
            },
        }
    }

    /// Split `ops` into batches, preserving order.
    pub fn analyze(&self, ops: impl IntoIterator<Item = OplogOperation>) -> Vec<AnalyzedOplogBatch> {
        let max = self.config.max_cud_batch_size.max(1);
        let mut out = Vec::new();
        let mut current: Option<CudBatch> = None;

        for op in ops {
            match Self::classify(&op) {
                OpClass::Cud(namespace) => match current.as_mut() {
                    Some(batch) if batch.namespace == namespace && batch.ops.len() < max => batch.ops.push(op),
                    _ => {
                        out.extend(current.take().map(AnalyzedOplogBatch::CudBatch));
                        current = Some(CudBatch { namespace, ops: vec![op] });
                    }
                },
                OpClass::Noop if self.config.merge_noops => match current.as_mut() {
                    Some(batch) if batch.ops.len() < max => batch.ops.push(op),
                    _ => {
                        out.extend(current.take().map(AnalyzedOplogBatch::CudBatch));
                        out.push(AnalyzedOplogBatch::SingleOp(op));
                    }
                },
                OpClass::Noop | OpClass::Single => {
                    out.extend(current.take().map(AnalyzedOplogBatch::CudBatch));
                    out.push(AnalyzedOplogBatch::SingleOp(op));
                }
                OpClass::NamespaceJob(namespace) => {
                    out.extend(current.take().map(AnalyzedOplogBatch::CudBatch));
                    out.push(AnalyzedOplogBatch::NamespaceJob(NamespaceJob { namespace, op }));
                }
            }
        }
        out.extend(current.map(AnalyzedOplogBatch::CudBatch));

        trace!(batches = out.len(), "Analyzed oplog run");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oplog::OpTime;
    use serde_json::{json, Value};

    struct Builder {
        next: u32,
        ops: Vec<OplogOperation>,
    }

    impl Builder {
        fn new() -> Self {
            Self { next: 1, ops: Vec::new() }
        }

        fn push(mut self, kind: OpKind, ns: &str, payload: Value) -> Self {
            let prev = self.ops.last().map_or(0, |op| op.hash);
            self.ops.push(OplogOperation::chained(
                prev,
                OpTime::new(1, 100, self.next),
                kind,
                Namespace::parse(ns),
                payload,
            ));
            self.next += 1;
            self
        }

        fn cud(self, kind: OpKind, ns: &str) -> Self {
            self.push(kind, ns, json!({"_id": 1}))
        }

        fn cmd(self, db: &str, payload: Value) -> Self {
            self.push(OpKind::Command, &format!("{db}.$cmd"), payload)
        }

        fn noop(self) -> Self {
            self.push(OpKind::Noop, "", json!({"msg": "periodic noop"}))
        }
    }

    fn labels(batches: &[AnalyzedOplogBatch]) -> Vec<(&'static str, usize)> {
        batches.iter().map(|b| (b.label(), b.len())).collect()
    }

    fn flatten(batches: Vec<AnalyzedOplogBatch>) -> Vec<OplogOperation> {
        batches.into_iter().flat_map(AnalyzedOplogBatch::into_ops).collect()
    }

    #[test]
    fn test_classify() {
        let ops = Builder::new()
            .cud(OpKind::Insert, "app.users")
            .cmd("app", json!({"createIndexes": "users", "indexes": []}))
            .cmd("app", json!({"dropDatabase": 1}))
            .cmd("app", json!({"somethingNew": 1}))
            .noop()
            .ops;

        assert_eq!(OplogBatchAnalyzer::classify(&ops[0]), OpClass::Cud(Namespace::new("app", "users")));
        assert_eq!(OplogBatchAnalyzer::classify(&ops[1]), OpClass::NamespaceJob(Namespace::new("app", "users")));
        assert_eq!(OplogBatchAnalyzer::classify(&ops[2]), OpClass::Single);
        assert_eq!(OplogBatchAnalyzer::classify(&ops[3]), OpClass::Single);
        assert_eq!(OplogBatchAnalyzer::classify(&ops[4]), OpClass::Noop);
    }

    #[test]
    fn test_mixed_run_splits_at_boundaries() {
        let ops = Builder::new()
            .cud(OpKind::Insert, "app.x")
            .cud(OpKind::Insert, "app.x")
            .cud(OpKind::Update, "app.x")
            .cmd("app", json!({"create": "y"}))
            .cud(OpKind::Insert, "app.y")
            .cud(OpKind::Delete, "app.y")
            .noop()
            .cmd("app", json!({"dropDatabase": 1}))
            .cud(OpKind::Insert, "app.x")
            .ops;

        let batches = OplogBatchAnalyzer::default().analyze(ops.clone());
        assert_eq!(
            labels(&batches),
            vec![
                ("cud_batch", 3),
                ("namespace_job", 1),
                ("cud_batch", 3),
                ("single_op", 1),
                ("cud_batch", 1),
            ]
        );
        assert_eq!(flatten(batches), ops);
    }

    #[test]
    fn test_namespace_change_closes_batch() {
        let ops = Builder::new()
            .cud(OpKind::Insert, "app.a")
            .cud(OpKind::Insert, "app.b")
            .cud(OpKind::Insert, "app.a")
            .ops;
        let batches = OplogBatchAnalyzer::default().analyze(ops);
        assert_eq!(labels(&batches), vec![("cud_batch", 1); 3]);
    }

    #[test]
    fn test_max_batch_size() {
        let mut builder = Builder::new();
        for _ in 0..7 {
            builder = builder.cud(OpKind::Insert, "app.a");
        }
        let analyzer = OplogBatchAnalyzer::new(AnalyzerConfig { max_cud_batch_size: 3, merge_noops: true });
        let batches = analyzer.analyze(builder.ops);
        assert_eq!(labels(&batches), vec![("cud_batch", 3), ("cud_batch", 3), ("cud_batch", 1)]);
    }

    #[test]
    fn test_noop_policy() {
        let ops = Builder::new().cud(OpKind::Insert, "app.a").noop().cud(OpKind::Insert, "app.a").ops;

        let merged = OplogBatchAnalyzer::default().analyze(ops.clone());
        assert_eq!(labels(&merged), vec![("cud_batch", 3)]);

        let separate = OplogBatchAnalyzer::new(AnalyzerConfig { merge_noops: false, ..Default::default() });
        let split = separate.analyze(ops);
        assert_eq!(labels(&split), vec![("cud_batch", 1), ("single_op", 1), ("cud_batch", 1)]);
    }

    #[test]
    fn test_leading_noop_is_single_op() {
        let ops = Builder::new().noop().cud(OpKind::Insert, "app.a").ops;
        let batches = OplogBatchAnalyzer::default().analyze(ops);
        assert_eq!(labels(&batches), vec![("single_op", 1), ("cud_batch", 1)]);
    }

    #[test]
    fn test_last_op_is_batch_position() {
        let ops = Builder::new().cud(OpKind::Insert, "app.a").cud(OpKind::Delete, "app.a").ops;
        let batches = OplogBatchAnalyzer::default().analyze(ops.clone());
        assert_eq!(batches[0].last_op(), ops.last());
    }

    #[test]
    fn test_empty_input() {
        assert!(OplogBatchAnalyzer::default().analyze(Vec::new()).is_empty());
    }
}
