//! Test fixtures for creating sample data and wired-up services.

use async_trait::async_trait;
use quarry_cache::{MemoryCacheStore, MemoryJobRepository, MemorySectionStore, WaitPolicy};
use quarry_core::materialize::{AggregationDef, MaterializationNode, Measure};
use quarry_core::params::CanonicalParams;
use quarry_core::ports::{Computation, ComputedAnalysis};
use quarry_core::section::NewSection;
use quarry_core::{Error, Result};
use quarry_fingerprint::ParamSchema;
use quarry_ledger::{CostModel, LedgerHandle, MemoryUsageSink, UsageRecorder};
use quarry_materialize::engine::Row;
use quarry_materialize::{
    GraphBuilder, MaterializationGraph, MemoryRefreshJournal, MemoryTableEngine, Refresher,
    RefresherConfig,
};
use quarry_notify::TracingAlertSink;
use quarry_service::{AnalysisService, AppDefinition, AppRegistry};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

/// Parameter schema for the sample lending-report application.
pub fn lending_schema() -> ParamSchema {
    ParamSchema::new()
        .categorical("state")
        .number("year")
        .string_list("loan_purpose")
        .integer_list("counties")
}

/// Raw loan rows backing the tiered aggregate fixtures.
pub fn loan_rows() -> Vec<Row> {
    let loan = |tract: &str, county: &str, state: &str, amount: i64| {
        Row::from([
            ("tract".to_string(), json!(tract)),
            ("county".to_string(), json!(county)),
            ("state".to_string(), json!(state)),
            ("amount".to_string(), json!(amount)),
        ])
    };
    vec![
        loan("06037.01", "los_angeles", "ca", 450_000),
        loan("06037.01", "los_angeles", "ca", 320_000),
        loan("06037.02", "los_angeles", "ca", 275_000),
        loan("06075.01", "san_francisco", "ca", 910_000),
        loan("48201.01", "harris", "tx", 180_000),
        loan("48201.02", "harris", "tx", 240_000),
    ]
}

/// Tract -> county -> state aggregation tiers over the `loans` source.
pub fn tiered_nodes() -> Vec<MaterializationNode> {
    vec![
        MaterializationNode::new(
            "tract_volume",
            vec!["loans".to_string()],
            AggregationDef {
                group_by: vec![
                    "tract".to_string(),
                    "county".to_string(),
                    "state".to_string(),
                ],
                measures: vec![
                    Measure::sum("total_amount", "amount"),
                    Measure::count("loans"),
                ],
            },
        ),
        MaterializationNode::new(
            "county_volume",
            vec!["tract_volume".to_string()],
            AggregationDef {
                group_by: vec!["county".to_string(), "state".to_string()],
                measures: vec![
                    Measure::sum("total_amount", "total_amount"),
                    Measure::sum("loans", "loans"),
                ],
            },
        ),
        MaterializationNode::new(
            "state_volume",
            vec!["county_volume".to_string()],
            AggregationDef {
                group_by: vec!["state".to_string()],
                measures: vec![
                    Measure::sum("total_amount", "total_amount"),
                    Measure::sum("loans", "loans"),
                ],
            },
        ),
    ]
}

pub fn tiered_graph() -> MaterializationGraph {
    GraphBuilder::new()
        .raw_source("loans")
        .build(tiered_nodes())
        .expect("fixture graph is valid")
}

/// Scripted [`Computation`] that counts calls and can be told to fail or
/// stall, for singleflight and retry scenarios.
pub struct ScriptedComputation {
    calls: AtomicU32,
    fail: AtomicBool,
    delay: Duration,
}

impl ScriptedComputation {
    pub fn new() -> Self {
        Self {
            calls: AtomicU32::new(0),
            fail: AtomicBool::new(false),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new()
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedComputation {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Computation for ScriptedComputation {
    async fn compute(
        &self,
        app_name: &str,
        params: &CanonicalParams,
    ) -> Result<ComputedAnalysis> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::ComputationFailed(
                "scripted computation failure".to_string(),
            ));
        }
        Ok(ComputedAnalysis {
            sections: vec![
                NewSection::table(
                    "volume_by_county",
                    json!([["los_angeles", 1_045_000], ["san_francisco", 910_000]]),
                ),
                NewSection::narrative(
                    "summary",
                    format!("{app_name}: computed over {} parameter(s)", params.len()),
                ),
            ],
            warehouse_queries: 4,
            generative_calls: 1,
        })
    }
}

/// Fully wired service over the in-memory adapters, with handles on every
/// collaborator so scenarios can inspect or perturb them.
pub struct ServiceHarness {
    pub service: Arc<AnalysisService>,
    pub cache: Arc<MemoryCacheStore>,
    pub jobs: Arc<MemoryJobRepository>,
    pub sections: Arc<MemorySectionStore>,
    pub sink: Arc<MemoryUsageSink>,
    pub engine: Arc<MemoryTableEngine>,
    pub journal: Arc<MemoryRefreshJournal>,
    pub computation: Arc<ScriptedComputation>,
    pub ledger: LedgerHandle,
}

impl ServiceHarness {
    pub async fn new() -> Self {
        Self::with_computation(Arc::new(ScriptedComputation::new())).await
    }

    pub async fn with_computation(computation: Arc<ScriptedComputation>) -> Self {
        let cache = Arc::new(MemoryCacheStore::new());
        let jobs = Arc::new(MemoryJobRepository::new());
        let sections = Arc::new(MemorySectionStore::new());
        let sink = Arc::new(MemoryUsageSink::new());
        let (recorder, ledger) = UsageRecorder::spawn(sink.clone(), 256);

        let engine = Arc::new(MemoryTableEngine::new());
        engine.load_source("loans", loan_rows()).await;
        engine.register_nodes(tiered_nodes()).await;
        let journal = Arc::new(MemoryRefreshJournal::new());

        let refresher = Arc::new(Refresher::new(
            tiered_graph(),
            engine.clone(),
            journal.clone(),
            Arc::new(TracingAlertSink),
            cache.clone(),
            RefresherConfig::default(),
        ));

        let mut registry = AppRegistry::new();
        registry.register("lending-report", AppDefinition::new(lending_schema()));

        let service = Arc::new(
            AnalysisService::new(
                registry,
                cache.clone(),
                jobs.clone(),
                sections.clone(),
                computation.clone(),
                recorder,
                CostModel::default(),
                WaitPolicy {
                    initial_interval: Duration::from_millis(10),
                    max_interval: Duration::from_millis(50),
                    deadline: Duration::from_secs(10),
                },
                Duration::from_secs(60),
            )
            .with_refresher(refresher),
        );

        Self {
            service,
            cache,
            jobs,
            sections,
            sink,
            engine,
            journal,
            computation,
            ledger,
        }
    }
}
