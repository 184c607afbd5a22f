//! Usage ledger types.

use crate::ids::{CacheKey, JobId, RequestId};
use crate::params::CanonicalParams;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cost attributed to one request, in configured currency units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub warehouse_cost: f64,
    pub generative_cost: f64,
    pub total: f64,
}

impl CostBreakdown {
    pub fn new(warehouse_cost: f64, generative_cost: f64) -> Self {
        Self {
            warehouse_cost,
            generative_cost,
            total: warehouse_cost + generative_cost,
        }
    }
}

/// One inbound request, recorded append-only and never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageLogEntry {
    pub request_id: RequestId,
    pub timestamp: DateTime<Utc>,
    pub requester_class: String,
    pub app_name: String,
    pub parameters: CanonicalParams,
    pub cache_key: CacheKey,
    pub cache_hit: bool,
    pub job_id: Option<JobId>,
    pub latency_ms: u64,
    pub cost: CostBreakdown,
    pub error: Option<String>,
}
