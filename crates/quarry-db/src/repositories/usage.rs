//! PostgreSQL implementation of UsageSink (append-only).

use async_trait::async_trait;
use quarry_core::ids::{CacheKey, JobId, RequestId};
use quarry_core::params::CanonicalParams;
use quarry_core::ports::UsageSink;
use quarry_core::usage::{CostBreakdown, UsageLogEntry};
use quarry_core::{Error, Result};
use sqlx::{PgPool, Row};

pub struct PgUsageLog {
    pool: PgPool,
}

impl PgUsageLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UsageSink for PgUsageLog {
    async fn append(&self, entry: &UsageLogEntry) -> Result<()> {
        let params_json = serde_json::to_value(&entry.parameters)
            .map_err(|e| Error::Serialization(e.to_string()))?;

        sqlx::query(
            r#"INSERT INTO usage_log
               (request_id, timestamp, requester_class, app_name, parameters, cache_key,
                cache_hit, job_id, latency_ms, warehouse_cost, generative_cost, total_cost, error)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"#,
        )
        .bind(entry.request_id.as_uuid())
        .bind(entry.timestamp)
        .bind(&entry.requester_class)
        .bind(&entry.app_name)
        .bind(&params_json)
        .bind(entry.cache_key.as_str())
        .bind(entry.cache_hit)
        .bind(entry.job_id.map(|id| *id.as_uuid()))
        .bind(entry.latency_ms as i64)
        .bind(entry.cost.warehouse_cost)
        .bind(entry.cost.generative_cost)
        .bind(entry.cost.total)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, id: RequestId) -> Result<Option<UsageLogEntry>> {
        let row = sqlx::query(
            r#"SELECT request_id, timestamp, requester_class, app_name, parameters, cache_key,
                      cache_hit, job_id, latency_ms, warehouse_cost, generative_cost, total_cost, error
               FROM usage_log WHERE request_id = $1"#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        let Some(r) = row else {
            return Ok(None);
        };

        let parameters: CanonicalParams = serde_json::from_value(r.get("parameters"))
            .map_err(|e| Error::Serialization(e.to_string()))?;

        Ok(Some(UsageLogEntry {
            request_id: RequestId::from_uuid(r.get("request_id")),
            timestamp: r.get("timestamp"),
            requester_class: r.get("requester_class"),
            app_name: r.get("app_name"),
            parameters,
            cache_key: CacheKey::from_digest(r.get::<String, _>("cache_key")),
            cache_hit: r.get("cache_hit"),
            job_id: r
                .get::<Option<uuid::Uuid>, _>("job_id")
                .map(JobId::from_uuid),
            latency_ms: r.get::<i64, _>("latency_ms") as u64,
            cost: CostBreakdown {
                warehouse_cost: r.get("warehouse_cost"),
                generative_cost: r.get("generative_cost"),
                total: r.get("total_cost"),
            },
            error: r.get("error"),
        }))
    }
}
