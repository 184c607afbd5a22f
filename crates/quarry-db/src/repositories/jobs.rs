//! PostgreSQL implementation of JobRepository.

use async_trait::async_trait;
use quarry_core::ids::{CacheKey, JobId};
use quarry_core::job::{AnalysisJob, JobStatus};
use quarry_core::ports::JobRepository;
use quarry_core::{Error, Result};
use sqlx::{PgPool, Row};

pub struct PgJobRepository {
    pool: PgPool,
}

impl PgJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn status_to_str(status: &JobStatus) -> &'static str {
        match status {
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }

    fn str_to_status(s: &str) -> JobStatus {
        match s {
            "succeeded" => JobStatus::Succeeded,
            "failed" => JobStatus::Failed,
            _ => JobStatus::Running,
        }
    }

    fn row_to_job(r: &sqlx::postgres::PgRow) -> AnalysisJob {
        let status_str: String = r.get("status");
        AnalysisJob {
            id: JobId::from_uuid(r.get("id")),
            cache_key: CacheKey::from_digest(r.get::<String, _>("cache_key")),
            app_name: r.get("app_name"),
            status: Self::str_to_status(&status_str),
            duration_ms: r.get::<Option<i64>, _>("duration_ms").map(|n| n as u64),
            warehouse_queries: r.get::<i32, _>("warehouse_queries") as u32,
            generative_calls: r.get::<i32, _>("generative_calls") as u32,
            error: r.get("error"),
            created_at: r.get("created_at"),
            completed_at: r.get("completed_at"),
        }
    }
}

#[async_trait]
impl JobRepository for PgJobRepository {
    async fn create(&self, job: &AnalysisJob) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO analysis_jobs
               (id, cache_key, app_name, status, duration_ms, warehouse_queries,
                generative_calls, error, created_at, completed_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"#,
        )
        .bind(job.id.as_uuid())
        .bind(job.cache_key.as_str())
        .bind(&job.app_name)
        .bind(Self::status_to_str(&job.status))
        .bind(job.duration_ms.map(|n| n as i64))
        .bind(job.warehouse_queries as i32)
        .bind(job.generative_calls as i32)
        .bind(&job.error)
        .bind(job.created_at)
        .bind(job.completed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<AnalysisJob>> {
        let row = sqlx::query(
            r#"SELECT id, cache_key, app_name, status, duration_ms, warehouse_queries,
                      generative_calls, error, created_at, completed_at
               FROM analysis_jobs WHERE id = $1"#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(row.map(|r| Self::row_to_job(&r)))
    }

    async fn update(&self, job: &AnalysisJob) -> Result<()> {
        let result = sqlx::query(
            r#"UPDATE analysis_jobs
               SET status = $2, duration_ms = $3, warehouse_queries = $4,
                   generative_calls = $5, error = $6, completed_at = $7
               WHERE id = $1"#,
        )
        .bind(job.id.as_uuid())
        .bind(Self::status_to_str(&job.status))
        .bind(job.duration_ms.map(|n| n as i64))
        .bind(job.warehouse_queries as i32)
        .bind(job.generative_calls as i32)
        .bind(&job.error)
        .bind(job.completed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(Error::JobNotFound(job.id.to_string()));
        }
        Ok(())
    }
}
