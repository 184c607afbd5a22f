//! Analysis job types.

use crate::ids::{CacheKey, JobId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One execution of an expensive analysis.
///
/// The job id is deliberately distinct from the cache key: a cached result
/// is replayed under its original job id without recomputation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisJob {
    pub id: JobId,
    pub cache_key: CacheKey,
    pub app_name: String,
    pub status: JobStatus,
    pub duration_ms: Option<u64>,
    /// Warehouse queries issued while computing, for cost attribution.
    pub warehouse_queries: u32,
    /// Generative-model calls issued while computing, for cost attribution.
    pub generative_calls: u32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl AnalysisJob {
    pub fn started(cache_key: CacheKey, app_name: impl Into<String>) -> Self {
        Self {
            id: JobId::new(),
            cache_key,
            app_name: app_name.into(),
            status: JobStatus::Running,
            duration_ms: None,
            warehouse_queries: 0,
            generative_calls: 0,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}
