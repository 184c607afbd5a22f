//! In-memory adapters for local development and tests.
//!
//! These implement the same port contracts as the Postgres adapters in
//! `quarry-db`. The cache store serializes every state transition under one
//! mutex, which makes the claim insert atomic by construction.

use async_trait::async_trait;
use chrono::Utc;
use quarry_core::cache::{AcquireRequest, Acquired, CacheEntry, CacheState, Completion};
use quarry_core::ids::{CacheKey, JobId};
use quarry_core::job::AnalysisJob;
use quarry_core::ports::{CacheStore, JobRepository, SectionStore};
use quarry_core::section::{NewSection, ResultSection};
use quarry_core::{Error, Result};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Suggested retry delay handed to waiters.
const RETRY_HINT: Duration = Duration::from_millis(500);

/// In-memory [`CacheStore`].
#[derive(Default)]
pub struct MemoryCacheStore {
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn fresh_claim(request: &AcquireRequest) -> CacheEntry {
        let now = Utc::now();
        CacheEntry {
            key: request.key.clone(),
            app_name: request.app_name.clone(),
            job_id: None,
            parameters: request.parameters.clone(),
            state: CacheState::Claimed,
            created_at: now,
            created_by: request.requester.clone(),
            last_accessed: now,
            access_count: 0,
            result_bytes: None,
            cost_saved: 0.0,
            expires_at: None,
            claimed_at: now,
            error: None,
        }
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn acquire(&self, request: &AcquireRequest) -> Result<Acquired> {
        let mut entries = self.entries.lock().await;
        let now = Utc::now();

        let Some(entry) = entries.get_mut(&request.key) else {
            entries.insert(request.key.clone(), Self::fresh_claim(request));
            return Ok(Acquired::Claimed);
        };

        match entry.state {
            CacheState::Computed if !entry.is_expired(now) => {
                // Never trust the hash alone: a hit must carry the same
                // canonical parameters it was computed for.
                if entry.parameters != request.parameters {
                    return Err(Error::FingerprintCollision {
                        key: request.key.to_string(),
                    });
                }
                let job_id = entry.job_id.ok_or_else(|| {
                    Error::Internal(format!("computed entry {} has no job id", request.key))
                })?;
                entry.last_accessed = now;
                entry.access_count += 1;
                Ok(Acquired::Hit {
                    job_id,
                    cost_saved: entry.cost_saved,
                })
            }
            // Expired results and failed computations are treated exactly
            // like an absent entry.
            CacheState::Computed | CacheState::Failed => {
                *entry = Self::fresh_claim(request);
                Ok(Acquired::Claimed)
            }
            CacheState::Claimed => {
                if entry.claim_age(now) > request.claim_timeout {
                    info!(
                        key = %request.key,
                        claimed_by = %entry.created_by,
                        "stale claim recovered"
                    );
                    *entry = Self::fresh_claim(request);
                    Ok(Acquired::Claimed)
                } else {
                    Ok(Acquired::Wait {
                        retry_after: RETRY_HINT,
                    })
                }
            }
        }
    }

    async fn complete(&self, key: &CacheKey, completion: &Completion) -> Result<()> {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .get_mut(key)
            .ok_or_else(|| Error::CacheEntryNotFound(key.to_string()))?;

        match entry.state {
            CacheState::Claimed => {
                entry.state = CacheState::Computed;
                entry.job_id = Some(completion.job_id);
                entry.result_bytes = Some(completion.result_bytes);
                entry.cost_saved = completion.cost_saved;
                entry.expires_at = completion
                    .ttl
                    .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
                    .map(|ttl| Utc::now() + ttl);
                entry.error = None;
                Ok(())
            }
            // Retried completion after a transient failure: same job id is
            // a no-op, a different one would mean two result sets per key.
            CacheState::Computed if entry.job_id == Some(completion.job_id) => Ok(()),
            _ => Err(Error::InvalidCacheState {
                key: key.to_string(),
                expected: "claimed".to_string(),
            }),
        }
    }

    async fn fail(&self, key: &CacheKey, error: &str) -> Result<()> {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(key) {
            Some(entry) if entry.state == CacheState::Claimed => {
                entry.state = CacheState::Failed;
                entry.error = Some(error.to_string());
                Ok(())
            }
            // Completed or re-claimed in the meantime; nothing to release.
            Some(_) => Ok(()),
            None => {
                warn!(key = %key, "fail() on absent cache entry");
                Ok(())
            }
        }
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }
}

/// In-memory [`SectionStore`]. Sections for a job are committed in one
/// map insert, so readers see all of them or none.
#[derive(Default)]
pub struct MemorySectionStore {
    committed: Mutex<HashMap<JobId, Vec<ResultSection>>>,
}

impl MemorySectionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn validate_sections(job_id: JobId, sections: &[NewSection]) -> Result<()> {
    if sections.is_empty() {
        return Err(Error::SectionWriteIncomplete {
            job_id: job_id.to_string(),
            reason: "no sections declared".to_string(),
        });
    }
    let mut names: Vec<&str> = sections.iter().map(|s| s.name.as_str()).collect();
    names.sort_unstable();
    names.dedup();
    if names.len() != sections.len() {
        return Err(Error::SectionWriteIncomplete {
            job_id: job_id.to_string(),
            reason: "duplicate section names".to_string(),
        });
    }
    Ok(())
}

fn same_content(committed: &[ResultSection], sections: &[NewSection]) -> bool {
    committed.len() == sections.len()
        && committed.iter().zip(sections).all(|(have, want)| {
            have.kind == want.kind
                && have.name == want.name
                && have.category == want.category
                && have.payload == want.payload
                && have.metadata == want.metadata
        })
}

#[async_trait]
impl SectionStore for MemorySectionStore {
    async fn write_all(&self, job_id: JobId, sections: Vec<NewSection>) -> Result<()> {
        validate_sections(job_id, &sections)?;
        let mut committed = self.committed.lock().await;

        if let Some(existing) = committed.get(&job_id) {
            // Idempotent re-write after a retried complete().
            if same_content(existing, &sections) {
                return Ok(());
            }
            return Err(Error::SectionConflict {
                job_id: job_id.to_string(),
            });
        }

        let now = Utc::now();
        let rows = sections
            .into_iter()
            .enumerate()
            .map(|(order, s)| ResultSection {
                job_id,
                display_order: order as u32,
                kind: s.kind,
                name: s.name,
                category: s.category,
                payload: s.payload,
                metadata: s.metadata,
                created_at: now,
                updated_at: now,
            })
            .collect();
        committed.insert(job_id, rows);
        Ok(())
    }

    async fn read_all(&self, job_id: JobId) -> Result<Vec<ResultSection>> {
        Ok(self
            .committed
            .lock()
            .await
            .get(&job_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn read_one(&self, job_id: JobId, name: &str) -> Result<Option<ResultSection>> {
        Ok(self
            .committed
            .lock()
            .await
            .get(&job_id)
            .and_then(|rows| rows.iter().find(|s| s.name == name).cloned()))
    }
}

/// In-memory [`JobRepository`].
#[derive(Default)]
pub struct MemoryJobRepository {
    jobs: Mutex<HashMap<JobId, AnalysisJob>>,
}

impl MemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobRepository for MemoryJobRepository {
    async fn create(&self, job: &AnalysisJob) -> Result<()> {
        self.jobs.lock().await.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<AnalysisJob>> {
        Ok(self.jobs.lock().await.get(&id).cloned())
    }

    async fn update(&self, job: &AnalysisJob) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        if !jobs.contains_key(&job.id) {
            return Err(Error::JobNotFound(job.id.to_string()));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }
}
