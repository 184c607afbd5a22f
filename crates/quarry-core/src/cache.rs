//! Cache entry types and acquire outcomes.

use crate::ids::{CacheKey, JobId};
use crate::params::CanonicalParams;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One row of the fingerprint-keyed result cache.
///
/// Exactly one entry exists per cache key. State transitions are
/// `claimed -> computed` or `claimed -> failed`, and a failed entry is
/// immediately re-claimable (failures are never served as hits).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub app_name: String,
    /// Set when the claimant completes; a hit replays this job id.
    pub job_id: Option<JobId>,
    /// Canonical parameter payload, stored alongside the key so a suspected
    /// fingerprint collision can be detected on hit instead of trusted away.
    pub parameters: CanonicalParams,
    pub state: CacheState,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u32,
    pub result_bytes: Option<u64>,
    /// Estimated cost the cache saves per hit, set at completion.
    pub cost_saved: f64,
    pub expires_at: Option<DateTime<Utc>>,
    pub claimed_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl CacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Age of the current claim, zero if the clock went backwards.
    pub fn claim_age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.claimed_at).to_std().unwrap_or(Duration::ZERO)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheState {
    Claimed,
    Computed,
    Failed,
}

/// Request to acquire a cache key for serving.
#[derive(Debug, Clone)]
pub struct AcquireRequest {
    pub app_name: String,
    pub key: CacheKey,
    pub parameters: CanonicalParams,
    pub requester: String,
    /// Claims older than this are treated as abandoned and re-claimable.
    pub claim_timeout: Duration,
}

/// Outcome of [`crate::ports::CacheStore::acquire`].
#[derive(Debug, Clone)]
pub enum Acquired {
    /// A computed, unexpired result exists; serve it.
    Hit { job_id: JobId, cost_saved: f64 },
    /// The caller won the claim and is obligated to compute, then call
    /// `complete` or `fail`.
    Claimed,
    /// Another claimant is computing; retry after the suggested delay.
    Wait { retry_after: Duration },
}

/// Completion payload for a claimed entry.
#[derive(Debug, Clone)]
pub struct Completion {
    pub job_id: JobId,
    pub result_bytes: u64,
    pub cost_saved: f64,
    /// Time-to-live for the completed entry; expiry starts at completion.
    pub ttl: Option<Duration>,
}
