//! Database types for the pipeline storage layer.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use spinsync_core::{FieldSet, Provenance, Table};
use std::fmt;

/// Opaque per-processor resume position.
///
/// Processors decide what the string means: a block number, a timestamp, a
/// pagination token or a seed marker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    /// Wrap an arbitrary position.
    pub fn new(position: impl Into<String>) -> Self {
        Self(position.into())
    }

    /// Cursor for "everything up to and including this block is done".
    pub fn from_block(block_number: u64) -> Self {
        Self(block_number.to_string())
    }

    /// Interpret the cursor as a block number.
    pub fn as_block(&self) -> Option<u64> {
        self.0.parse().ok()
    }

    /// Raw string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of staged write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOperation {
    /// Creates the register if missing.
    Insert,
    /// Applies only once the register exists.
    Update,
}

impl StageOperation {
    /// Convert to database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            StageOperation::Insert => "insert",
            StageOperation::Update => "update",
        }
    }
}

impl std::str::FromStr for StageOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "insert" => Ok(StageOperation::Insert),
            "update" => Ok(StageOperation::Update),
            _ => Err(format!("Unknown stage operation: {}", s)),
        }
    }
}

/// A staged write as stored in the mempool.
#[derive(Debug, Clone, PartialEq)]
pub struct MempoolEntry {
    /// Insertion order.
    pub id: i64,
    /// Target table.
    pub table: Table,
    /// Target entity.
    pub entity_id: String,
    /// Insert or update.
    pub operation: StageOperation,
    /// Proposed field values.
    pub fields: FieldSet,
    /// Ordinal and source of the write.
    pub provenance: Provenance,
    /// Unix time the write was staged.
    pub staged_at: i64,
}

/// Category of an error annotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Input could not be transformed.
    Data,
    /// Stored register is unreadable or over capacity.
    Integrity,
}

impl ErrorKind {
    /// Convert to database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Data => "data",
            ErrorKind::Integrity => "integrity",
        }
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "data" => Ok(ErrorKind::Data),
            "integrity" => Ok(ErrorKind::Integrity),
            _ => Err(format!("Unknown error kind: {}", s)),
        }
    }
}

/// Lifecycle of an error annotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStatus {
    /// Errored; eligible for an automatic reset.
    PendingRetry,
    /// Previously errored, reset and back in normal processing.
    Reset,
    /// Repeated resets did not help; left for an operator.
    NeedsIntervention,
}

impl ErrorStatus {
    /// Convert to database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorStatus::PendingRetry => "pending_retry",
            ErrorStatus::Reset => "reset",
            ErrorStatus::NeedsIntervention => "needs_intervention",
        }
    }

    /// Whether processors should leave the entity alone.
    pub fn is_active(&self) -> bool {
        !matches!(self, ErrorStatus::Reset)
    }
}

impl std::str::FromStr for ErrorStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_retry" => Ok(ErrorStatus::PendingRetry),
            "reset" => Ok(ErrorStatus::Reset),
            "needs_intervention" => Ok(ErrorStatus::NeedsIntervention),
            _ => Err(format!("Unknown error status: {}", s)),
        }
    }
}

/// An error recorded against one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorAnnotation {
    /// Table of the entity.
    pub table: Table,
    /// Entity id.
    pub entity_id: String,
    /// Category.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
    /// Processor that hit the error.
    pub processor: String,
    /// Retry state.
    pub status: ErrorStatus,
    /// Automatic resets performed so far.
    pub reset_count: u32,
    /// Fields to clear when resetting.
    pub reset_fields: Vec<String>,
    /// Unix timestamp of the first annotation.
    pub created_at: i64,
    /// Unix timestamp of the last change.
    pub updated_at: i64,
}

/// New annotation to record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewErrorAnnotation {
    /// Table of the entity.
    pub table: Table,
    /// Entity id.
    pub entity_id: String,
    /// Category.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
    /// Processor that hit the error.
    pub processor: String,
    /// Fields holding partial output to clear on reset.
    pub reset_fields: Vec<String>,
}

/// A materialized record as read by processors.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalRecord {
    /// Entity id.
    pub id: String,
    /// Projected field values.
    pub fields: Map<String, Value>,
}

impl CanonicalRecord {
    /// Field value, if present.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// String field value, if present and a string.
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }
}

/// Outcome of a reset sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResetSummary {
    /// Entities returned to normal processing.
    pub reset: u64,
    /// Entities flagged for manual intervention.
    pub escalated: u64,
}
