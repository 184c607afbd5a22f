//! Result section types.

use crate::ids::JobId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionKind {
    Table,
    Narrative,
    Metadata,
    Raw,
}

/// A section as declared by the computing path, before it has an order or
/// timestamps assigned by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSection {
    pub kind: SectionKind,
    pub name: String,
    pub category: Option<String>,
    pub payload: serde_json::Value,
    /// Section-specific metadata, e.g. column headers for a table.
    pub metadata: Option<serde_json::Value>,
}

impl NewSection {
    pub fn table(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind: SectionKind::Table,
            name: name.into(),
            category: None,
            payload,
            metadata: None,
        }
    }

    pub fn narrative(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            kind: SectionKind::Narrative,
            name: name.into(),
            category: None,
            payload: serde_json::Value::String(text.into()),
            metadata: None,
        }
    }
}

/// A committed section. Immutable once written; a corrected analysis is a
/// new job id, never a mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultSection {
    pub job_id: JobId,
    pub display_order: u32,
    pub kind: SectionKind,
    pub name: String,
    pub category: Option<String>,
    pub payload: serde_json::Value,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Read outcome for a job's sections.
#[derive(Debug, Clone)]
pub enum SectionRead {
    /// All declared sections, in display order.
    Ready(Vec<ResultSection>),
    /// The job exists but its sections are not committed yet.
    NotReady,
    NotFound,
}
