//! PostgreSQL implementation of CacheStore.
//!
//! The claim insert (`INSERT ... ON CONFLICT DO NOTHING`) is the
//! serialization point: exactly one concurrent caller wins it for a given
//! key. Reclaims of expired, failed, or abandoned entries are guarded
//! conditional updates, so a racing caller loses cleanly and falls back
//! to WAIT.

use async_trait::async_trait;
use quarry_core::cache::{AcquireRequest, Acquired, CacheEntry, CacheState, Completion};
use quarry_core::ids::{CacheKey, JobId};
use quarry_core::params::CanonicalParams;
use quarry_core::ports::CacheStore;
use quarry_core::{Error, Result};
use sqlx::{PgPool, Row};
use std::time::Duration;
use tracing::{info, warn};

const RETRY_HINT: Duration = Duration::from_millis(500);

pub struct PgCacheStore {
    pool: PgPool,
}

impl PgCacheStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn str_to_state(s: &str) -> CacheState {
        match s {
            "computed" => CacheState::Computed,
            "failed" => CacheState::Failed,
            _ => CacheState::Claimed,
        }
    }

    fn row_to_entry(r: &sqlx::postgres::PgRow) -> Result<CacheEntry> {
        let parameters: CanonicalParams = serde_json::from_value(r.get("parameters_canonical"))
            .map_err(|e| Error::Serialization(e.to_string()))?;
        let state_str: String = r.get("state");

        Ok(CacheEntry {
            key: CacheKey::from_digest(r.get::<String, _>("cache_key")),
            app_name: r.get("app_name"),
            job_id: r
                .get::<Option<uuid::Uuid>, _>("job_id")
                .map(JobId::from_uuid),
            parameters,
            state: Self::str_to_state(&state_str),
            created_at: r.get("created_at"),
            created_by: r.get("created_by"),
            last_accessed: r.get("last_accessed"),
            access_count: r.get::<i32, _>("access_count") as u32,
            result_bytes: r.get::<Option<i64>, _>("result_size").map(|n| n as u64),
            cost_saved: r.get("cost_saved"),
            expires_at: r.get("expires_at"),
            claimed_at: r.get("claimed_at"),
            error: r.get("error"),
        })
    }
}

#[async_trait]
impl CacheStore for PgCacheStore {
    async fn acquire(&self, request: &AcquireRequest) -> Result<Acquired> {
        let params_json = serde_json::to_value(&request.parameters)
            .map_err(|e| Error::Serialization(e.to_string()))?;

        // Fresh claim: winning this insert obligates the caller to compute.
        let inserted = sqlx::query(
            r#"INSERT INTO cache_entries (cache_key, app_name, parameters_canonical, state, created_by, claimed_at)
               VALUES ($1, $2, $3, 'claimed', $4, now())
               ON CONFLICT (cache_key) DO NOTHING"#,
        )
        .bind(request.key.as_str())
        .bind(&request.app_name)
        .bind(&params_json)
        .bind(&request.requester)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        if inserted.rows_affected() == 1 {
            return Ok(Acquired::Claimed);
        }

        // Serve a live computed entry. The stored parameters are part of the
        // WHERE clause, so an entry whose parameters differ from the request
        // is never touched: a collision must not mutate access bookkeeping.
        let hit = sqlx::query(
            r#"UPDATE cache_entries
               SET last_accessed = now(), access_count = access_count + 1
               WHERE cache_key = $1
                 AND state = 'computed'
                 AND parameters_canonical = $2
                 AND (expires_at IS NULL OR expires_at > now())
               RETURNING job_id, cost_saved"#,
        )
        .bind(request.key.as_str())
        .bind(&params_json)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        if let Some(row) = hit {
            let job_id = row
                .get::<Option<uuid::Uuid>, _>("job_id")
                .map(JobId::from_uuid)
                .ok_or_else(|| {
                    Error::Internal(format!("computed entry {} has no job id", request.key))
                })?;
            return Ok(Acquired::Hit {
                job_id,
                cost_saved: row.get("cost_saved"),
            });
        }

        // A live computed entry that the update skipped can only differ in
        // its parameters.
        let colliding = sqlx::query(
            r#"SELECT 1 AS live FROM cache_entries
               WHERE cache_key = $1
                 AND state = 'computed'
                 AND (expires_at IS NULL OR expires_at > now())"#,
        )
        .bind(request.key.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        if colliding.is_some() {
            return Err(Error::FingerprintCollision {
                key: request.key.to_string(),
            });
        }

        // Expired results, failed computations, and abandoned claims are
        // all treated like an absent entry; the guarded update decides the
        // race.
        let reclaimed = sqlx::query(
            r#"UPDATE cache_entries
               SET state = 'claimed', app_name = $2, parameters_canonical = $3,
                   created_by = $4, created_at = now(), claimed_at = now(),
                   job_id = NULL, error = NULL, result_size = NULL,
                   cost_saved = 0, expires_at = NULL, access_count = 0
               WHERE cache_key = $1
                 AND (
                     (state = 'computed' AND expires_at IS NOT NULL AND expires_at <= now())
                     OR state = 'failed'
                     OR (state = 'claimed' AND claimed_at < now() - ($5 * interval '1 second'))
                 )
               RETURNING (state = 'claimed') AS was_claimed"#,
        )
        .bind(request.key.as_str())
        .bind(&request.app_name)
        .bind(&params_json)
        .bind(&request.requester)
        .bind(request.claim_timeout.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        if reclaimed.is_some() {
            info!(key = %request.key, "cache entry reclaimed");
            return Ok(Acquired::Claimed);
        }

        Ok(Acquired::Wait {
            retry_after: RETRY_HINT,
        })
    }

    async fn complete(&self, key: &CacheKey, completion: &Completion) -> Result<()> {
        let result = sqlx::query(
            r#"UPDATE cache_entries
               SET state = 'computed', job_id = $2, result_size = $3,
                   cost_saved = $4, error = NULL,
                   expires_at = CASE
                       WHEN $5::double precision IS NULL THEN NULL
                       ELSE now() + ($5 * interval '1 second')
                   END
               WHERE cache_key = $1
                 AND (state = 'claimed' OR (state = 'computed' AND job_id = $2))"#,
        )
        .bind(key.as_str())
        .bind(completion.job_id.as_uuid())
        .bind(completion.result_bytes as i64)
        .bind(completion.cost_saved)
        .bind(completion.ttl.map(|ttl| ttl.as_secs_f64()))
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        match self.get(key).await? {
            None => Err(Error::CacheEntryNotFound(key.to_string())),
            Some(_) => Err(Error::InvalidCacheState {
                key: key.to_string(),
                expected: "claimed".to_string(),
            }),
        }
    }

    async fn fail(&self, key: &CacheKey, error: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE cache_entries SET state = 'failed', error = $2 WHERE cache_key = $1 AND state = 'claimed'",
        )
        .bind(key.as_str())
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        // Completed or re-claimed in the meantime; nothing to release.
        if result.rows_affected() == 0 {
            warn!(key = %key, "fail() did not transition any claim");
        }
        Ok(())
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let row = sqlx::query(
            r#"SELECT cache_key, app_name, job_id, parameters_canonical, state, created_at,
                      created_by, last_accessed, access_count, result_size, cost_saved,
                      expires_at, claimed_at, error
               FROM cache_entries WHERE cache_key = $1"#,
        )
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        match row {
            Some(r) => Ok(Some(Self::row_to_entry(&r)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_mapping() {
        assert_eq!(PgCacheStore::str_to_state("computed"), CacheState::Computed);
        assert_eq!(PgCacheStore::str_to_state("failed"), CacheState::Failed);
        assert_eq!(PgCacheStore::str_to_state("claimed"), CacheState::Claimed);
    }
}
