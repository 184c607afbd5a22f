//! PostgreSQL implementation of RefreshJournal.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quarry_core::ids::RefreshRunId;
use quarry_core::materialize::{RefreshJob, RefreshStatus, ValidationResult};
use quarry_core::ports::RefreshJournal;
use quarry_core::{Error, Result};
use sqlx::{PgPool, Row};

pub struct PgRefreshJournal {
    pool: PgPool,
}

impl PgRefreshJournal {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn status_to_str(status: &RefreshStatus) -> &'static str {
        match status {
            RefreshStatus::Pending => "pending",
            RefreshStatus::Computing => "computing",
            RefreshStatus::Validating => "validating",
            RefreshStatus::Success => "success",
            RefreshStatus::Failed => "failed",
        }
    }

    fn str_to_status(s: &str) -> RefreshStatus {
        match s {
            "computing" => RefreshStatus::Computing,
            "validating" => RefreshStatus::Validating,
            "success" => RefreshStatus::Success,
            "failed" => RefreshStatus::Failed,
            _ => RefreshStatus::Pending,
        }
    }

    fn row_to_job(r: &sqlx::postgres::PgRow) -> Result<RefreshJob> {
        let status_str: String = r.get("status");
        let validation: Option<ValidationResult> = r
            .get::<Option<serde_json::Value>, _>("validation_result")
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| Error::Serialization(e.to_string()))?;

        Ok(RefreshJob {
            run_id: RefreshRunId::from_uuid(r.get("run_id")),
            node: r.get("node_name"),
            started_at: r.get("started_at"),
            status: Self::str_to_status(&status_str),
            rows_before: r.get::<Option<i64>, _>("row_count_before").map(|n| n as u64),
            rows_after: r.get::<Option<i64>, _>("row_count_after").map(|n| n as u64),
            validation,
            finished_at: r.get("finished_at"),
        })
    }

    fn validation_json(job: &RefreshJob) -> Result<Option<serde_json::Value>> {
        job.validation
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| Error::Serialization(e.to_string()))
    }
}

#[async_trait]
impl RefreshJournal for PgRefreshJournal {
    async fn record(&self, job: &RefreshJob) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO refresh_jobs
               (node_name, started_at, run_id, status, row_count_before, row_count_after,
                validation_result, finished_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"#,
        )
        .bind(&job.node)
        .bind(job.started_at)
        .bind(job.run_id.as_uuid())
        .bind(Self::status_to_str(&job.status))
        .bind(job.rows_before.map(|n| n as i64))
        .bind(job.rows_after.map(|n| n as i64))
        .bind(Self::validation_json(job)?)
        .bind(job.finished_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn update(&self, job: &RefreshJob) -> Result<()> {
        let result = sqlx::query(
            r#"UPDATE refresh_jobs
               SET status = $3, row_count_before = $4, row_count_after = $5,
                   validation_result = $6, finished_at = $7
               WHERE node_name = $1 AND started_at = $2"#,
        )
        .bind(&job.node)
        .bind(job.started_at)
        .bind(Self::status_to_str(&job.status))
        .bind(job.rows_before.map(|n| n as i64))
        .bind(job.rows_after.map(|n| n as i64))
        .bind(Self::validation_json(job)?)
        .bind(job.finished_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(Error::Internal(format!(
                "refresh job ({}, {}) not recorded",
                job.node, job.started_at
            )));
        }
        Ok(())
    }

    async fn latest_for_node(&self, node_name: &str) -> Result<Option<RefreshJob>> {
        let row = sqlx::query(
            r#"SELECT node_name, started_at, run_id, status, row_count_before,
                      row_count_after, validation_result, finished_at
               FROM refresh_jobs WHERE node_name = $1
               ORDER BY started_at DESC LIMIT 1"#,
        )
        .bind(node_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        match row {
            Some(r) => Ok(Some(Self::row_to_job(&r)?)),
            None => Ok(None),
        }
    }

    async fn update_node_stats(
        &self,
        node_name: &str,
        refreshed_at: DateTime<Utc>,
        row_count: u64,
    ) -> Result<()> {
        sqlx::query(
            r#"UPDATE materialization_nodes
               SET last_refreshed_at = $2, last_row_count = $3
               WHERE node_name = $1"#,
        )
        .bind(node_name)
        .bind(refreshed_at)
        .bind(row_count as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            RefreshStatus::Pending,
            RefreshStatus::Computing,
            RefreshStatus::Validating,
            RefreshStatus::Success,
            RefreshStatus::Failed,
        ] {
            assert_eq!(
                PgRefreshJournal::str_to_status(PgRefreshJournal::status_to_str(&status)),
                status
            );
        }
    }
}
