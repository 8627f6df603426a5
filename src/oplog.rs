// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Oplog data model.
//!
//! An upstream source records every write as an [`OplogOperation`]. Operations
//! from one source form a strict total order by [`OpTime`] and are chained by
//! `hash`: each operation's hash is derived from its own content and its
//! predecessor's hash, so comparing one `(op_time, hash)` pair is enough to
//! tell whether two histories agree up to that point.
//!
//! # Raw Document Shape
//!
//! ```text
//! {
//!   "ts": { "t": <secs>, "i": <inc> },   // timestamp
//!   "t":  <term>,                          // election term
//!   "h":  <hash>,                          // chain hash
//!   "op": "i" | "u" | "d" | "c" | "n",
//!   "ns": "<database>.<collection>",
//!   "o":  { ... },                          // payload
//!   "o2": { ... }                           // update selector (optional)
//! }
//! ```

use crate::error::{ReplicationError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

// ═══════════════════════════════════════════════════════════════════════════════
// OpTime
// ═══════════════════════════════════════════════════════════════════════════════

/// Position of an operation in a source's oplog.
///
/// Ordered by `(term, secs, inc)`. Field order matters: the derived `Ord`
/// compares fields top to bottom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpTime {
    /// Election term of the primary that wrote the operation.
    pub term: i64,
    /// Seconds component of the timestamp.
    pub secs: u32,
    /// Ordinal within the second.
    pub inc: u32,
}

impl OpTime {
    pub const ZERO: OpTime = OpTime { term: 0, secs: 0, inc: 0 };

    pub fn new(term: i64, secs: u32, inc: u32) -> Self {
        Self { term, secs, inc }
    }

    /// Whole seconds between `self` and a later position (0 if `newer` is not later).
    pub fn lag_secs(&self, newer: &OpTime) -> u64 {
        u64::from(newer.secs.saturating_sub(self.secs))
    }
}

impl fmt::Display for OpTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.term, self.secs, self.inc)
    }
}

impl FromStr for OpTime {
    type Err = ReplicationError;

    /// Parse `"<term>:<secs>:<inc>"`.
    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, ':');
        let (Some(term), Some(secs), Some(inc)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(ReplicationError::Config(format!("invalid op time {s:?}")));
        };
        let bad = |_| ReplicationError::Config(format!("invalid op time {s:?}"));
        Ok(Self {
            term: term.parse().map_err(bad)?,
            secs: secs.parse().map_err(bad)?,
            inc: inc.parse().map_err(bad)?,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// OpKind
// ═══════════════════════════════════════════════════════════════════════════════

/// The kind of write an operation records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Insert,
    Update,
    Delete,
    Command,
    Noop,
}

impl OpKind {
    /// Parse the single-letter oplog code.
    pub fn from_code(code: &str) -> Result<Self> {
        match code {
            "i" => Ok(Self::Insert),
            "u" => Ok(Self::Update),
            "d" => Ok(Self::Delete),
            "c" => Ok(Self::Command),
            "n" => Ok(Self::Noop),
            other => Err(ReplicationError::UnsupportedOperation { kind: other.to_string() }),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Insert => "i",
            Self::Update => "u",
            Self::Delete => "d",
            Self::Command => "c",
            Self::Noop => "n",
        }
    }

    /// Lower-case name, used as a metric key.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Command => "command",
            Self::Noop => "noop",
        }
    }

    /// Insert, update or delete.
    pub fn is_cud(&self) -> bool {
        matches!(self, Self::Insert | Self::Update | Self::Delete)
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Namespace
// ═══════════════════════════════════════════════════════════════════════════════

/// `database.collection` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Namespace {
    pub database: String,
    pub collection: String,
}

impl Namespace {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }

    /// Split at the first dot. A string without a dot is a bare database name.
    pub fn parse(s: &str) -> Self {
        match s.split_once('.') {
            Some((db, coll)) => Self::new(db, coll),
            None => Self::new(s, ""),
        }
    }

    /// `<db>.$cmd`, the pseudo-collection commands are logged against.
    pub fn is_command(&self) -> bool {
        self.collection == "$cmd"
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.collection.is_empty() {
            f.write_str(&self.database)
        } else {
            write!(f, "{}.{}", self.database, self.collection)
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// OplogOperation
// ═══════════════════════════════════════════════════════════════════════════════

/// One write recorded in a source's oplog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OplogOperation {
    pub op_time: OpTime,
    pub hash: i64,
    pub kind: OpKind,
    pub namespace: Namespace,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<Value>,
}

impl OplogOperation {
    /// Build an operation whose hash chains from `prev_hash`.
    pub fn chained(
        prev_hash: i64,
        op_time: OpTime,
        kind: OpKind,
        namespace: Namespace,
        payload: Value,
    ) -> Self {
        let hash = chain_hash(prev_hash, &op_time, kind, &namespace, &payload);
        Self {
            op_time,
            hash,
            kind,
            namespace,
            payload,
            selector: None,
        }
    }

    pub fn with_selector(mut self, selector: Value) -> Self {
        self.selector = Some(selector);
        self
    }

    /// Command name (first payload key) for command operations.
    pub fn command_name(&self) -> Option<&str> {
        if self.kind != OpKind::Command {
            return None;
        }
        self.payload.as_object()?.keys().next().map(String::as_str)
    }

    /// Namespace the operation actually affects.
    ///
    /// Commands are logged against `<db>.$cmd`; their target collection is the
    /// value of the command field (`{"create": "users"}`), except for
    /// `renameCollection`, whose value is already a full namespace.
    pub fn target_namespace(&self) -> Namespace {
        let Some(name) = self.command_name() else {
            return self.namespace.clone();
        };
        match self.payload.get(name).and_then(Value::as_str) {
            Some(target) if name == "renameCollection" => Namespace::parse(target),
            Some(target) => Namespace::new(self.namespace.database.clone(), target),
            None => Namespace::new(self.namespace.database.clone(), ""),
        }
    }

    /// Whether `prev_hash` followed by this operation's content reproduces `hash`.
    pub fn verify_chain(&self, prev_hash: i64) -> bool {
        chain_hash(prev_hash, &self.op_time, self.kind, &self.namespace, &self.payload) == self.hash
    }

    /// Parse a raw oplog document.
    ///
    /// Fails with [`ReplicationError::UnsupportedOperation`] for an unknown `op`
    /// code and [`ReplicationError::Internal`] for a structurally broken entry.
    pub fn from_document(doc: &Value) -> Result<Self> {
        let malformed = |field: &str| ReplicationError::Internal(format!("malformed oplog entry: missing {field}"));

        let ts = doc.get("ts").ok_or_else(|| malformed("ts"))?;
        let secs = ts.get("t").and_then(Value::as_u64).ok_or_else(|| malformed("ts.t"))?;
        let inc = ts.get("i").and_then(Value::as_u64).ok_or_else(|| malformed("ts.i"))?;
        let term = doc.get("t").and_then(Value::as_i64).unwrap_or(-1);
        let hash = doc.get("h").and_then(Value::as_i64).ok_or_else(|| malformed("h"))?;
        let code = doc.get("op").and_then(Value::as_str).ok_or_else(|| malformed("op"))?;
        let kind = OpKind::from_code(code)?;
        let ns = doc.get("ns").and_then(Value::as_str).unwrap_or("");

        let secs = u32::try_from(secs).map_err(|_| malformed("ts.t in range"))?;
        let inc = u32::try_from(inc).map_err(|_| malformed("ts.i in range"))?;

        Ok(Self {
            op_time: OpTime::new(term, secs, inc),
            hash,
            kind,
            namespace: Namespace::parse(ns),
            payload: doc.get("o").cloned().unwrap_or(Value::Null),
            selector: doc.get("o2").cloned(),
        })
    }

    /// Render as a raw oplog document (inverse of [`from_document`](Self::from_document)).
    pub fn to_document(&self) -> Value {
        let mut doc = serde_json::json!({
            "ts": { "t": self.op_time.secs, "i": self.op_time.inc },
            "t": self.op_time.term,
            "h": self.hash,
            "op": self.kind.code(),
            "ns": self.namespace.to_string(),
            "o": self.payload,
        });
        if let (Some(selector), Some(obj)) = (&self.selector, doc.as_object_mut()) {
            obj.insert("o2".to_string(), selector.clone());
        }
        doc
    }
}

/// Chain hash of an operation given its predecessor's hash.
///
/// SHA-256 over the predecessor hash and the operation content, truncated to
/// the first eight bytes.
pub fn chain_hash(
    prev_hash: i64,
    op_time: &OpTime,
    kind: OpKind,
    namespace: &Namespace,
    payload: &Value,
) -> i64 {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.to_be_bytes());
    hasher.update(op_time.term.to_be_bytes());
    hasher.update(op_time.secs.to_be_bytes());
    hasher.update(op_time.inc.to_be_bytes());
    hasher.update(kind.code().as_bytes());
    hasher.update(namespace.to_string().as_bytes());
    hasher.update(payload.to_string().as_bytes());
    let digest = hasher.finalize();

    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(head)
}
