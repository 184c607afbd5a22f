//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the core domain and external
//! adapters. The serving path (cache, jobs, sections, usage) is implemented
//! against a backing store; the materialization path is implemented against
//! a table engine and a refresh journal.

use crate::cache::{AcquireRequest, Acquired, CacheEntry, Completion};
use crate::ids::{CacheKey, JobId, RequestId};
use crate::job::AnalysisJob;
use crate::materialize::{MaterializationNode, RefreshAlert, RefreshJob, TableVersion};
use crate::params::CanonicalParams;
use crate::section::{NewSection, ResultSection};
use crate::usage::UsageLogEntry;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Fingerprint-keyed cache of completed analyses.
///
/// `acquire` is the singleflight serialization point: the claim insert must
/// be a single atomic conditional write against the backing store, never
/// read-then-write.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Consult the cache for a key, claiming it if absent, expired, failed,
    /// or abandoned past its claim timeout.
    async fn acquire(&self, request: &AcquireRequest) -> Result<Acquired>;

    /// Mark a claimed entry computed. Idempotent: repeating a completion
    /// with the same job id must not create a second result set.
    async fn complete(&self, key: &CacheKey, completion: &Completion) -> Result<()>;

    /// Mark a claimed entry failed, releasing waiters. Failures are never
    /// cached; the entry is immediately re-claimable.
    async fn fail(&self, key: &CacheKey, error: &str) -> Result<()>;

    /// Fetch an entry without claiming (used by waiters and diagnostics).
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>>;
}

/// Repository for analysis jobs.
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn create(&self, job: &AnalysisJob) -> Result<()>;

    async fn get(&self, id: JobId) -> Result<Option<AnalysisJob>>;

    async fn update(&self, job: &AnalysisJob) -> Result<()>;
}

/// Store for committed result sections.
#[async_trait]
pub trait SectionStore: Send + Sync {
    /// Persist all sections for a job transactionally: either every section
    /// becomes visible or none do. Re-writing an identical section set is a
    /// no-op; a differing set is `Error::SectionConflict`.
    async fn write_all(&self, job_id: JobId, sections: Vec<NewSection>) -> Result<()>;

    /// All committed sections in display order, empty if none committed.
    async fn read_all(&self, job_id: JobId) -> Result<Vec<ResultSection>>;

    /// One committed section by name.
    async fn read_one(&self, job_id: JobId, name: &str) -> Result<Option<ResultSection>>;
}

/// Append-only sink for usage records. Implementations may fail; the
/// recorder in front of them must not let that reach the serving path.
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn append(&self, entry: &UsageLogEntry) -> Result<()>;

    async fn get(&self, id: RequestId) -> Result<Option<UsageLogEntry>>;
}

/// Storage engine for materialized aggregate tables.
///
/// Visible versions are replaced only through `swap`, so readers observe
/// fully-old or fully-new data, never a mix.
#[async_trait]
pub trait TableEngine: Send + Sync {
    /// Compute a node's aggregate into a side location, reading the current
    /// visible versions of its sources. The result is not visible until
    /// swapped.
    async fn build_version(&self, node: &MaterializationNode) -> Result<TableVersion>;

    /// Row count of a side version.
    async fn version_row_count(&self, version: &TableVersion) -> Result<u64>;

    /// Content checksum of a side version (order-independent).
    async fn version_checksum(&self, version: &TableVersion) -> Result<String>;

    /// Independently recompute the node from its raw inputs and return the
    /// expected row count and checksum for reconciliation.
    async fn reconcile(&self, node: &MaterializationNode) -> Result<(u64, String)>;

    /// Atomically make a side version the visible version.
    async fn swap(&self, version: &TableVersion) -> Result<()>;

    /// Drop a side version that failed validation.
    async fn discard(&self, version: &TableVersion) -> Result<()>;

    /// Row count of the currently visible version, if any.
    async fn visible_row_count(&self, node_name: &str) -> Result<Option<u64>>;
}

/// Journal of refresh attempts and node runtime metadata.
#[async_trait]
pub trait RefreshJournal: Send + Sync {
    async fn record(&self, job: &RefreshJob) -> Result<()>;

    async fn update(&self, job: &RefreshJob) -> Result<()>;

    async fn latest_for_node(&self, node_name: &str) -> Result<Option<RefreshJob>>;

    /// Persist a node's last successful refresh time and row count.
    async fn update_node_stats(
        &self,
        node_name: &str,
        refreshed_at: DateTime<Utc>,
        row_count: u64,
    ) -> Result<()>;
}

/// Outbound operator alert on cascade failure.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn alert(&self, alert: &RefreshAlert) -> Result<()>;
}

/// The expensive analysis itself: an external collaborator that queries
/// the current aggregate tables and produces sections.
#[async_trait]
pub trait Computation: Send + Sync {
    async fn compute(&self, app_name: &str, params: &CanonicalParams)
        -> Result<ComputedAnalysis>;
}

/// Output of one computation, with the counts the ledger prices.
#[derive(Debug, Clone)]
pub struct ComputedAnalysis {
    pub sections: Vec<NewSection>,
    pub warehouse_queries: u32,
    pub generative_calls: u32,
}
