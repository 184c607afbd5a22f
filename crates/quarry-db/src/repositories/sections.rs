//! PostgreSQL implementation of SectionStore.
//!
//! All sections for a job are written in one transaction, so a reader
//! either sees the complete set or none of it. Re-writing an identical set
//! is a no-op; rows are immutable once committed.

use async_trait::async_trait;
use quarry_core::ids::JobId;
use quarry_core::ports::SectionStore;
use quarry_core::section::{NewSection, ResultSection, SectionKind};
use quarry_core::{Error, Result};
use sqlx::{PgPool, Row};

pub struct PgSectionStore {
    pool: PgPool,
}

impl PgSectionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn kind_to_str(kind: &SectionKind) -> &'static str {
        match kind {
            SectionKind::Table => "table",
            SectionKind::Narrative => "narrative",
            SectionKind::Metadata => "metadata",
            SectionKind::Raw => "raw",
        }
    }

    fn str_to_kind(s: &str) -> SectionKind {
        match s {
            "table" => SectionKind::Table,
            "narrative" => SectionKind::Narrative,
            "metadata" => SectionKind::Metadata,
            _ => SectionKind::Raw,
        }
    }

    fn row_to_section(r: &sqlx::postgres::PgRow) -> ResultSection {
        let kind_str: String = r.get("kind");
        ResultSection {
            job_id: JobId::from_uuid(r.get("job_id")),
            display_order: r.get::<i32, _>("display_order") as u32,
            kind: Self::str_to_kind(&kind_str),
            name: r.get("name"),
            category: r.get("category"),
            payload: r.get("payload"),
            metadata: r.get("metadata"),
            created_at: r.get("created_at"),
            updated_at: r.get("updated_at"),
        }
    }

    fn validate(job_id: JobId, sections: &[NewSection]) -> Result<()> {
        if sections.is_empty() {
            return Err(Error::SectionWriteIncomplete {
                job_id: job_id.to_string(),
                reason: "section set is empty".to_string(),
            });
        }
        let mut names: Vec<&str> = sections.iter().map(|s| s.name.as_str()).collect();
        names.sort_unstable();
        if names.windows(2).any(|w| w[0] == w[1]) {
            return Err(Error::SectionWriteIncomplete {
                job_id: job_id.to_string(),
                reason: "duplicate section names".to_string(),
            });
        }
        Ok(())
    }

    fn same_content(existing: &[ResultSection], sections: &[NewSection]) -> bool {
        existing.len() == sections.len()
            && existing.iter().zip(sections.iter()).all(|(have, want)| {
                have.kind == want.kind
                    && have.name == want.name
                    && have.category == want.category
                    && have.payload == want.payload
                    && have.metadata == want.metadata
            })
    }
}

#[async_trait]
impl SectionStore for PgSectionStore {
    async fn write_all(&self, job_id: JobId, sections: Vec<NewSection>) -> Result<()> {
        Self::validate(job_id, &sections)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        // Lock any existing rows for this job so a concurrent identical
        // retry serializes against us.
        let existing = sqlx::query(
            r#"SELECT job_id, display_order, kind, name, category, payload, metadata,
                      created_at, updated_at
               FROM result_sections WHERE job_id = $1
               ORDER BY display_order FOR UPDATE"#,
        )
        .bind(job_id.as_uuid())
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        if !existing.is_empty() {
            let committed: Vec<ResultSection> =
                existing.iter().map(Self::row_to_section).collect();
            tx.rollback()
                .await
                .map_err(|e| Error::Database(e.to_string()))?;
            if Self::same_content(&committed, &sections) {
                return Ok(());
            }
            return Err(Error::SectionConflict {
                job_id: job_id.to_string(),
            });
        }

        for (order, section) in sections.iter().enumerate() {
            sqlx::query(
                r#"INSERT INTO result_sections
                   (job_id, display_order, kind, name, category, payload, metadata)
                   VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
            )
            .bind(job_id.as_uuid())
            .bind(order as i32)
            .bind(Self::kind_to_str(&section.kind))
            .bind(&section.name)
            .bind(&section.category)
            .bind(&section.payload)
            .bind(&section.metadata)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        }

        tx.commit().await.map_err(|e| Error::Database(e.to_string()))
    }

    async fn read_all(&self, job_id: JobId) -> Result<Vec<ResultSection>> {
        let rows = sqlx::query(
            r#"SELECT job_id, display_order, kind, name, category, payload, metadata,
                      created_at, updated_at
               FROM result_sections WHERE job_id = $1 ORDER BY display_order"#,
        )
        .bind(job_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(rows.iter().map(Self::row_to_section).collect())
    }

    async fn read_one(&self, job_id: JobId, name: &str) -> Result<Option<ResultSection>> {
        let row = sqlx::query(
            r#"SELECT job_id, display_order, kind, name, category, payload, metadata,
                      created_at, updated_at
               FROM result_sections WHERE job_id = $1 AND name = $2"#,
        )
        .bind(job_id.as_uuid())
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(row.map(|r| Self::row_to_section(&r)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip() {
        for kind in [
            SectionKind::Table,
            SectionKind::Narrative,
            SectionKind::Metadata,
            SectionKind::Raw,
        ] {
            assert_eq!(
                PgSectionStore::str_to_kind(PgSectionStore::kind_to_str(&kind)),
                kind
            );
        }
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let job_id = JobId::new();
        let sections = vec![
            NewSection::narrative("summary", "a"),
            NewSection::narrative("summary", "b"),
        ];
        assert!(matches!(
            PgSectionStore::validate(job_id, &sections),
            Err(Error::SectionWriteIncomplete { .. })
        ));
    }
}
