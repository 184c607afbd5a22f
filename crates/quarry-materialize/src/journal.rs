//! In-memory refresh journal.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quarry_core::materialize::RefreshJob;
use quarry_core::ports::RefreshJournal;
use quarry_core::{Error, Result};
use std::collections::HashMap;
use tokio::sync::Mutex;

/// In-memory [`RefreshJournal`] for local development and tests.
#[derive(Default)]
pub struct MemoryRefreshJournal {
    jobs: Mutex<Vec<RefreshJob>>,
    node_stats: Mutex<HashMap<String, (DateTime<Utc>, u64)>>,
}

impl MemoryRefreshJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn history_for_node(&self, node_name: &str) -> Vec<RefreshJob> {
        self.jobs
            .lock()
            .await
            .iter()
            .filter(|j| j.node == node_name)
            .cloned()
            .collect()
    }

    pub async fn node_stats(&self, node_name: &str) -> Option<(DateTime<Utc>, u64)> {
        self.node_stats.lock().await.get(node_name).copied()
    }
}

#[async_trait]
impl RefreshJournal for MemoryRefreshJournal {
    async fn record(&self, job: &RefreshJob) -> Result<()> {
        self.jobs.lock().await.push(job.clone());
        Ok(())
    }

    async fn update(&self, job: &RefreshJob) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        let slot = jobs
            .iter_mut()
            .find(|j| j.node == job.node && j.started_at == job.started_at)
            .ok_or_else(|| {
                Error::Internal(format!(
                    "refresh job ({}, {}) not recorded",
                    job.node, job.started_at
                ))
            })?;
        *slot = job.clone();
        Ok(())
    }

    async fn latest_for_node(&self, node_name: &str) -> Result<Option<RefreshJob>> {
        Ok(self
            .jobs
            .lock()
            .await
            .iter()
            .filter(|j| j.node == node_name)
            .max_by_key(|j| j.started_at)
            .cloned())
    }

    async fn update_node_stats(
        &self,
        node_name: &str,
        refreshed_at: DateTime<Utc>,
        row_count: u64,
    ) -> Result<()> {
        self.node_stats
            .lock()
            .await
            .insert(node_name.to_string(), (refreshed_at, row_count));
        Ok(())
    }
}
