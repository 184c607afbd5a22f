//! Cascading refresher.
//!
//! Executes refresh jobs in dependency order, validates every rebuilt
//! version against an independent recomputation, and swaps validated
//! versions into place atomically. A validation failure keeps the prior
//! version visible, skips every descendant for the rest of the cascade,
//! and raises an operator alert. Staleness is acceptable; inconsistency
//! is not.

use crate::graph::MaterializationGraph;
use chrono::Utc;
use futures::future::join_all;
use quarry_core::cache::{AcquireRequest, Acquired};
use quarry_core::ids::{CacheKey, RefreshRunId};
use quarry_core::materialize::{
    MaterializationNode, RefreshAlert, RefreshJob, RefreshStatus, ValidationResult,
};
use quarry_core::params::CanonicalParams;
use quarry_core::ports::{AlertSink, CacheStore, RefreshJournal, TableEngine};
use quarry_core::{Error, Result};
use quarry_fingerprint::fingerprint;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Reserved application name for the refresher's exclusivity claim.
pub const REFRESHER_APP: &str = "quarry.refresher";

/// The refresher's system-wide lock key. Claimed through the ordinary
/// cache-store acquire path and always released with `fail`, so it is a
/// control lock, never a cached result.
pub fn refresher_lock_key() -> CacheKey {
    fingerprint(REFRESHER_APP, &CanonicalParams::new())
}

#[derive(Debug, Clone)]
pub struct RefresherConfig {
    /// Upper bound on concurrently refreshing independent nodes.
    pub parallelism: usize,
    /// Claim timeout for the exclusivity lock; a refresher that crashes is
    /// recoverable after this long.
    pub lock_timeout: Duration,
    pub requester: String,
}

impl Default for RefresherConfig {
    fn default() -> Self {
        Self {
            parallelism: 4,
            lock_timeout: Duration::from_secs(3600),
            requester: "refresher".to_string(),
        }
    }
}

/// What changed, and therefore what must refresh.
#[derive(Debug, Clone)]
pub enum RefreshTrigger {
    /// Every node, in dependency order.
    All,
    /// These nodes and everything downstream of them.
    Nodes(Vec<String>),
    /// Raw sources changed; every node reading them, transitively.
    SourcesChanged(Vec<String>),
}

/// Outcome of one cascade run.
#[derive(Debug, Clone)]
pub struct CascadeReport {
    pub run_id: RefreshRunId,
    pub refreshed: Vec<String>,
    pub failed: Vec<String>,
    /// Downstream of a failure; not attempted this run.
    pub skipped: Vec<String>,
}

impl CascadeReport {
    pub fn fully_succeeded(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }
}

pub struct Refresher {
    graph: MaterializationGraph,
    engine: Arc<dyn TableEngine>,
    journal: Arc<dyn RefreshJournal>,
    alerts: Arc<dyn AlertSink>,
    lock: Arc<dyn CacheStore>,
    config: RefresherConfig,
}

impl Refresher {
    pub fn new(
        graph: MaterializationGraph,
        engine: Arc<dyn TableEngine>,
        journal: Arc<dyn RefreshJournal>,
        alerts: Arc<dyn AlertSink>,
        lock: Arc<dyn CacheStore>,
        config: RefresherConfig,
    ) -> Self {
        Self {
            graph,
            engine,
            journal,
            alerts,
            lock,
            config,
        }
    }

    pub fn graph(&self) -> &MaterializationGraph {
        &self.graph
    }

    /// Run one cascade. At most one cascade may be active system-wide; a
    /// second concurrent call fails fast with `RefreshInProgress`.
    pub async fn run_cascade(&self, trigger: RefreshTrigger) -> Result<CascadeReport> {
        let lock_request = AcquireRequest {
            app_name: REFRESHER_APP.to_string(),
            key: refresher_lock_key(),
            parameters: CanonicalParams::new(),
            requester: self.config.requester.clone(),
            claim_timeout: self.config.lock_timeout,
        };

        match self.lock.acquire(&lock_request).await? {
            Acquired::Claimed => {}
            Acquired::Wait { .. } => return Err(Error::RefreshInProgress),
            Acquired::Hit { .. } => {
                return Err(Error::Internal(
                    "refresher lock key unexpectedly completed".to_string(),
                ));
            }
        }

        let result = self.run_locked(trigger).await;
        // fail() releases the claim; a Failed entry is immediately
        // re-claimable by the next cascade.
        if let Err(e) = self.lock.fail(&lock_request.key, "cascade finished").await {
            warn!(error = %e, "failed to release refresher lock");
        }
        result
    }

    async fn run_locked(&self, trigger: RefreshTrigger) -> Result<CascadeReport> {
        let run_id = RefreshRunId::new();
        let targets: Vec<String> = match &trigger {
            RefreshTrigger::All => self
                .graph
                .topological_order()
                .into_iter()
                .map(str::to_string)
                .collect(),
            RefreshTrigger::Nodes(names) => {
                for name in names {
                    if self.graph.node(name).is_none() {
                        return Err(Error::NodeNotFound(name.clone()));
                    }
                }
                self.graph
                    .cascade_from(names)
                    .into_iter()
                    .map(str::to_string)
                    .collect()
            }
            RefreshTrigger::SourcesChanged(sources) => self
                .graph
                .cascade_from(sources)
                .into_iter()
                .map(str::to_string)
                .collect(),
        };

        info!(run_id = %run_id, nodes = targets.len(), "starting refresh cascade");

        let target_set: HashSet<String> = targets.iter().cloned().collect();
        let mut remaining = targets;
        let mut succeeded: HashSet<String> = HashSet::new();
        let mut failed: Vec<String> = Vec::new();
        let mut skipped: HashSet<String> = HashSet::new();

        loop {
            // A node downstream of a failed or skipped node must not
            // refresh from it this run, even though the old version is
            // still visible. Propagate until settled.
            let mut settled = false;
            while !settled {
                settled = true;
                remaining.retain(|name| {
                    let blocked = self.graph.upstream(name).iter().any(|up| {
                        target_set.contains(*up)
                            && (failed.iter().any(|f| f == up) || skipped.contains(*up))
                    });
                    if blocked {
                        skipped.insert(name.clone());
                        settled = false;
                    }
                    !blocked
                });
            }

            let ready: Vec<String> = remaining
                .iter()
                .filter(|name| {
                    self.graph
                        .upstream(name)
                        .iter()
                        .all(|up| !target_set.contains(*up) || succeeded.contains(*up))
                })
                .cloned()
                .collect();
            if ready.is_empty() {
                break;
            }
            remaining.retain(|name| !ready.contains(name));

            // Independent subtrees run concurrently, bounded by the
            // configured width.
            for wave in ready.chunks(self.config.parallelism.max(1)) {
                let outcomes =
                    join_all(wave.iter().map(|name| self.refresh_node(run_id, name))).await;
                for (name, ok) in wave.iter().zip(outcomes) {
                    if ok {
                        succeeded.insert(name.clone());
                    } else {
                        failed.push(name.clone());
                    }
                }
            }
        }

        let mut refreshed: Vec<String> = succeeded.into_iter().collect();
        refreshed.sort_unstable();
        let mut skipped: Vec<String> = skipped.into_iter().collect();
        skipped.sort_unstable();

        info!(
            run_id = %run_id,
            refreshed = refreshed.len(),
            failed = failed.len(),
            skipped = skipped.len(),
            "refresh cascade finished"
        );

        Ok(CascadeReport {
            run_id,
            refreshed,
            failed,
            skipped,
        })
    }

    /// Refresh one node through its full state machine. Returns whether the
    /// new version became visible. Never propagates node-level failures;
    /// they are journaled and alerted.
    async fn refresh_node(&self, run_id: RefreshRunId, name: &str) -> bool {
        let Some(node) = self.graph.node(name).cloned() else {
            error!(node = name, "refresh requested for unknown node");
            return false;
        };

        let mut job = RefreshJob::pending(run_id, name);
        if let Err(e) = self.journal.record(&job).await {
            warn!(node = name, error = %e, "refresh journal write failed");
        }

        job.rows_before = match self.engine.visible_row_count(name).await {
            Ok(count) => count,
            Err(e) => {
                self.fail_job(&mut job, &node, format!("reading current row count: {e}"), None)
                    .await;
                return false;
            }
        };

        job.status = RefreshStatus::Computing;
        self.update_journal(&job).await;

        let version = match self.engine.build_version(&node).await {
            Ok(version) => version,
            Err(e) => {
                self.fail_job(&mut job, &node, format!("building new version: {e}"), None)
                    .await;
                return false;
            }
        };

        job.status = RefreshStatus::Validating;
        self.update_journal(&job).await;

        let validation = match self.validate(&node, &version).await {
            Ok(validation) => validation,
            Err(e) => {
                let _ = self.engine.discard(&version).await;
                self.fail_job(&mut job, &node, format!("validating new version: {e}"), None)
                    .await;
                return false;
            }
        };

        job.rows_after = Some(validation.actual_rows);
        job.validation = Some(validation.clone());

        if !validation.passed {
            let _ = self.engine.discard(&version).await;
            let cause = Error::RefreshValidationMismatch {
                node: node.name.clone(),
                detail: validation.to_string(),
            };
            self.fail_job(&mut job, &node, cause.to_string(), Some(validation))
                .await;
            return false;
        }

        if let Err(e) = self.engine.swap(&version).await {
            self.fail_job(&mut job, &node, format!("swapping version: {e}"), None)
                .await;
            return false;
        }

        let now = Utc::now();
        job.status = RefreshStatus::Success;
        job.finished_at = Some(now);
        self.update_journal(&job).await;
        if let Err(e) = self
            .journal
            .update_node_stats(&node.name, now, validation.actual_rows)
            .await
        {
            warn!(node = %node.name, error = %e, "refresh journal write failed");
        }

        info!(node = name, rows = validation.actual_rows, "node refreshed");
        true
    }

    async fn validate(
        &self,
        node: &MaterializationNode,
        version: &quarry_core::materialize::TableVersion,
    ) -> Result<ValidationResult> {
        let actual_rows = self.engine.version_row_count(version).await?;
        let actual_checksum = self.engine.version_checksum(version).await?;
        let (expected_rows, expected_checksum) = self.engine.reconcile(node).await?;

        Ok(ValidationResult {
            passed: actual_rows == expected_rows && actual_checksum == expected_checksum,
            expected_rows,
            actual_rows,
            expected_checksum: Some(expected_checksum),
            actual_checksum: Some(actual_checksum),
        })
    }

    async fn fail_job(
        &self,
        job: &mut RefreshJob,
        node: &MaterializationNode,
        detail: String,
        validation: Option<ValidationResult>,
    ) {
        error!(node = %node.name, detail = %detail, "node refresh failed, prior version stays visible");
        job.status = RefreshStatus::Failed;
        job.finished_at = Some(Utc::now());
        if job.validation.is_none() {
            job.validation = validation.clone();
        }
        self.update_journal(job).await;

        let alert = RefreshAlert {
            run_id: job.run_id,
            node: node.name.clone(),
            validation: job.validation.clone(),
            detail,
            occurred_at: Utc::now(),
        };
        if let Err(e) = self.alerts.alert(&alert).await {
            warn!(node = %node.name, error = %e, "alert delivery failed");
        }
    }

    async fn update_journal(&self, job: &RefreshJob) {
        if let Err(e) = self.journal.update(job).await {
            warn!(node = %job.node, error = %e, "refresh journal write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{MemoryTableEngine, Row};
    use crate::graph::GraphBuilder;
    use crate::journal::MemoryRefreshJournal;
    use async_trait::async_trait;
    use quarry_cache::MemoryCacheStore;
    use quarry_core::materialize::{AggregationDef, Measure};
    use serde_json::json;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct CollectingAlertSink {
        alerts: Mutex<Vec<RefreshAlert>>,
    }

    #[async_trait]
    impl AlertSink for CollectingAlertSink {
        async fn alert(&self, alert: &RefreshAlert) -> Result<()> {
            self.alerts.lock().await.push(alert.clone());
            Ok(())
        }
    }

    fn loan(tract: &str, county: &str, amount: i64) -> Row {
        Row::from([
            ("tract".to_string(), json!(tract)),
            ("county".to_string(), json!(county)),
            ("amount".to_string(), json!(amount)),
        ])
    }

    fn tiered_nodes() -> Vec<MaterializationNode> {
        vec![
            MaterializationNode::new(
                "tract_volume",
                vec!["loans".to_string()],
                AggregationDef {
                    group_by: vec!["tract".to_string(), "county".to_string()],
                    measures: vec![Measure::sum("total_amount", "amount")],
                },
            ),
            MaterializationNode::new(
                "county_volume",
                vec!["tract_volume".to_string()],
                AggregationDef {
                    group_by: vec!["county".to_string()],
                    measures: vec![Measure::sum("total_amount", "total_amount")],
                },
            ),
        ]
    }

    async fn fixture() -> (Refresher, Arc<MemoryTableEngine>, Arc<MemoryRefreshJournal>, Arc<CollectingAlertSink>) {
        let engine = Arc::new(MemoryTableEngine::new());
        engine
            .load_source(
                "loans",
                vec![
                    loan("t1", "c1", 100),
                    loan("t2", "c1", 50),
                    loan("t3", "c2", 75),
                ],
            )
            .await;
        engine.register_nodes(tiered_nodes()).await;

        let graph = GraphBuilder::new()
            .raw_source("loans")
            .build(tiered_nodes())
            .unwrap();
        let journal = Arc::new(MemoryRefreshJournal::new());
        let alerts = Arc::new(CollectingAlertSink::default());
        let refresher = Refresher::new(
            graph,
            engine.clone(),
            journal.clone(),
            alerts.clone(),
            Arc::new(MemoryCacheStore::new()),
            RefresherConfig::default(),
        );
        (refresher, engine, journal, alerts)
    }

    #[tokio::test]
    async fn test_cascade_refreshes_in_order_and_stays_consistent() {
        let (refresher, engine, journal, _) = fixture().await;

        let report = refresher.run_cascade(RefreshTrigger::All).await.unwrap();
        assert!(report.fully_succeeded());
        assert_eq!(report.refreshed.len(), 2);

        // County totals must equal the sum of their tract rows.
        let tracts = engine.snapshot("tract_volume").await.unwrap();
        let counties = engine.snapshot("county_volume").await.unwrap();
        for county_row in counties.iter() {
            let county = county_row.get("county").unwrap();
            let tract_sum: i64 = tracts
                .iter()
                .filter(|r| r.get("county") == Some(county))
                .filter_map(|r| r.get("total_amount").and_then(|v| v.as_i64()))
                .sum();
            assert_eq!(county_row.get("total_amount").unwrap().as_i64().unwrap(), tract_sum);
        }

        let stats = journal.node_stats("county_volume").await.unwrap();
        assert_eq!(stats.1, 2); // c1, c2
    }

    #[tokio::test]
    async fn test_validation_failure_aborts_descendants() {
        let (refresher, engine, journal, alerts) = fixture().await;

        // Seed a good first run so prior versions exist.
        refresher.run_cascade(RefreshTrigger::All).await.unwrap();
        let before = engine.snapshot("tract_volume").await.unwrap();

        engine.poison("tract_volume").await;
        let report = refresher.run_cascade(RefreshTrigger::All).await.unwrap();

        assert_eq!(report.failed, vec!["tract_volume".to_string()]);
        assert_eq!(report.skipped, vec!["county_volume".to_string()]);
        assert!(report.refreshed.is_empty());

        // Prior version untouched.
        let after = engine.snapshot("tract_volume").await.unwrap();
        assert_eq!(before.as_ref(), after.as_ref());

        // Only the failing node gets a journaled failure; the skipped node
        // has no new attempt.
        let latest = journal.latest_for_node("tract_volume").await.unwrap().unwrap();
        assert_eq!(latest.status, RefreshStatus::Failed);
        assert!(!latest.validation.unwrap().passed);
        let county_history = journal.history_for_node("county_volume").await;
        assert_eq!(county_history.len(), 1); // from the seed run only

        let alerts = alerts.alerts.lock().await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].node, "tract_volume");
    }

    #[tokio::test]
    async fn test_only_one_cascade_runs_at_a_time() {
        let (refresher, _, _, _) = fixture().await;
        let lock = refresher.lock.clone();

        // Simulate another live refresher holding the lock.
        let request = AcquireRequest {
            app_name: REFRESHER_APP.to_string(),
            key: refresher_lock_key(),
            parameters: CanonicalParams::new(),
            requester: "other-refresher".to_string(),
            claim_timeout: Duration::from_secs(3600),
        };
        assert!(matches!(lock.acquire(&request).await.unwrap(), Acquired::Claimed));

        let err = refresher.run_cascade(RefreshTrigger::All).await.unwrap_err();
        assert!(matches!(err, Error::RefreshInProgress));

        // Releasing the lock lets the next cascade in.
        lock.fail(&request.key, "done").await.unwrap();
        assert!(refresher.run_cascade(RefreshTrigger::All).await.is_ok());
    }

    #[tokio::test]
    async fn test_source_change_trigger_refreshes_dependents_only() {
        let (refresher, _, journal, _) = fixture().await;
        let report = refresher
            .run_cascade(RefreshTrigger::SourcesChanged(vec!["loans".to_string()]))
            .await
            .unwrap();
        assert_eq!(report.refreshed.len(), 2);

        let report = refresher
            .run_cascade(RefreshTrigger::Nodes(vec!["county_volume".to_string()]))
            .await
            .unwrap();
        assert_eq!(report.refreshed, vec!["county_volume".to_string()]);
        assert_eq!(journal.history_for_node("tract_volume").await.len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_node_trigger_is_rejected() {
        let (refresher, _, _, _) = fixture().await;
        let err = refresher
            .run_cascade(RefreshTrigger::Nodes(vec!["nope".to_string()]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NodeNotFound(_)));
    }
}
