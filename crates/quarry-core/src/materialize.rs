//! Materialization graph and refresh types.

use crate::ids::RefreshRunId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A derived aggregate table, defined declaratively over its sources.
///
/// Definitions are static configuration; only the refresher writes the
/// runtime fields (`last_refreshed_at`, `last_row_count`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaterializationNode {
    pub name: String,
    /// Source table names: raw sources or other nodes. Must be acyclic.
    pub sources: Vec<String>,
    pub aggregation: AggregationDef,
    pub partition_keys: Vec<String>,
    pub last_refreshed_at: Option<DateTime<Utc>>,
    pub last_row_count: Option<u64>,
}

impl MaterializationNode {
    pub fn new(
        name: impl Into<String>,
        sources: Vec<String>,
        aggregation: AggregationDef,
    ) -> Self {
        Self {
            name: name.into(),
            sources,
            aggregation,
            partition_keys: Vec::new(),
            last_refreshed_at: None,
            last_row_count: None,
        }
    }
}

/// Deterministic aggregation: group rows by keys, fold measures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationDef {
    pub group_by: Vec<String>,
    pub measures: Vec<Measure>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Measure {
    /// Output column name.
    pub name: String,
    pub op: MeasureOp,
    /// Input column; ignored for `Count`.
    pub column: String,
}

impl Measure {
    pub fn sum(name: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op: MeasureOp::Sum,
            column: column.into(),
        }
    }

    pub fn count(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op: MeasureOp::Count,
            column: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasureOp {
    Sum,
    Count,
    Min,
    Max,
    Avg,
}

/// One refresh attempt for one node. Terminal states are final; a new
/// attempt is a new instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshJob {
    pub run_id: RefreshRunId,
    pub node: String,
    pub started_at: DateTime<Utc>,
    pub status: RefreshStatus,
    pub rows_before: Option<u64>,
    pub rows_after: Option<u64>,
    pub validation: Option<ValidationResult>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RefreshJob {
    pub fn pending(run_id: RefreshRunId, node: impl Into<String>) -> Self {
        Self {
            run_id,
            node: node.into(),
            started_at: Utc::now(),
            status: RefreshStatus::Pending,
            rows_before: None,
            rows_after: None,
            validation: None,
            finished_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshStatus {
    Pending,
    Computing,
    Validating,
    Success,
    Failed,
}

impl RefreshStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RefreshStatus::Success | RefreshStatus::Failed)
    }
}

/// Reconciliation of a freshly built version against an independent
/// recomputation over the raw source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub passed: bool,
    pub expected_rows: u64,
    pub actual_rows: u64,
    pub expected_checksum: Option<String>,
    pub actual_checksum: Option<String>,
}

impl ValidationResult {
    pub fn passed(rows: u64, checksum: Option<String>) -> Self {
        Self {
            passed: true,
            expected_rows: rows,
            actual_rows: rows,
            expected_checksum: checksum.clone(),
            actual_checksum: checksum,
        }
    }
}

impl fmt::Display for ValidationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.expected_rows != self.actual_rows {
            write!(
                f,
                "row count mismatch: expected {}, got {}",
                self.expected_rows, self.actual_rows
            )
        } else if self.expected_checksum != self.actual_checksum {
            write!(
                f,
                "checksum mismatch: expected {:?}, got {:?}",
                self.expected_checksum, self.actual_checksum
            )
        } else if self.passed {
            write!(f, "validated ({} rows)", self.actual_rows)
        } else {
            write!(f, "validation failed ({} rows)", self.actual_rows)
        }
    }
}

/// Handle to a freshly built, not-yet-visible table version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableVersion {
    pub node: String,
    pub version_id: String,
}

/// Operator-facing alert raised when a cascade aborts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshAlert {
    pub run_id: RefreshRunId,
    pub node: String,
    pub validation: Option<ValidationResult>,
    pub detail: String,
    pub occurred_at: DateTime<Utc>,
}
