//! The serving path: submit, read sections, trigger refresh.

use crate::registry::AppRegistry;
use chrono::Utc;
use quarry_cache::{WaitPolicy, acquire_or_wait};
use quarry_core::cache::{AcquireRequest, Acquired, Completion};
use quarry_core::ids::{CacheKey, JobId, RequestId};
use quarry_core::job::{AnalysisJob, JobStatus};
use quarry_core::params::CanonicalParams;
use quarry_core::ports::{CacheStore, Computation, ComputedAnalysis, JobRepository, SectionStore};
use quarry_core::section::SectionRead;
use quarry_core::usage::{CostBreakdown, UsageLogEntry};
use quarry_core::{Error, Result};
use quarry_fingerprint::{fingerprint, normalize};
use quarry_ledger::{CostModel, UsageRecorder};
use quarry_materialize::{CascadeReport, RefreshTrigger, Refresher};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};

/// One inbound analysis request with its raw, un-normalized parameter bag.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub app_name: String,
    pub parameters: serde_json::Value,
    /// Caller class for the usage ledger ("api", "scheduler", ...).
    pub requester_class: String,
}

/// What the caller learns from a submit: the job id under which the result
/// sections live, and whether the result was replayed from cache.
#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub request_id: RequestId,
    pub job_id: JobId,
    pub cache_hit: bool,
}

pub struct AnalysisService {
    registry: AppRegistry,
    cache: Arc<dyn CacheStore>,
    jobs: Arc<dyn JobRepository>,
    sections: Arc<dyn SectionStore>,
    computation: Arc<dyn Computation>,
    recorder: UsageRecorder,
    cost_model: CostModel,
    wait_policy: WaitPolicy,
    default_claim_timeout: Duration,
    refresher: Option<Arc<Refresher>>,
}

impl AnalysisService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: AppRegistry,
        cache: Arc<dyn CacheStore>,
        jobs: Arc<dyn JobRepository>,
        sections: Arc<dyn SectionStore>,
        computation: Arc<dyn Computation>,
        recorder: UsageRecorder,
        cost_model: CostModel,
        wait_policy: WaitPolicy,
        default_claim_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            cache,
            jobs,
            sections,
            computation,
            recorder,
            cost_model,
            wait_policy,
            default_claim_timeout,
            refresher: None,
        }
    }

    pub fn with_refresher(mut self, refresher: Arc<Refresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    /// Serve one analysis request.
    ///
    /// Validation failures are rejected before fingerprinting and are never
    /// cached. Past that point exactly one concurrent caller computes per
    /// cache key; everyone else waits and replays the completed job id.
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitOutcome> {
        let request_id = RequestId::new();
        let started = Instant::now();

        let app = self.registry.get(&request.app_name)?;
        let params = normalize(&app.schema, &request.parameters)?;
        let key = fingerprint(&request.app_name, &params);

        let acquire = AcquireRequest {
            app_name: request.app_name.clone(),
            key: key.clone(),
            parameters: params.clone(),
            requester: request.requester_class.clone(),
            claim_timeout: app.claim_timeout.unwrap_or(self.default_claim_timeout),
        };
        let result_ttl = app.result_ttl;

        match acquire_or_wait(self.cache.as_ref(), &acquire, self.wait_policy).await? {
            Acquired::Hit { job_id, .. } => {
                info!(request_id = %request_id, key = %key, job_id = %job_id, "cache hit");
                self.record(
                    request_id,
                    &request,
                    &params,
                    &key,
                    true,
                    Some(job_id),
                    started,
                    CostBreakdown::default(),
                    None,
                );
                Ok(SubmitOutcome {
                    request_id,
                    job_id,
                    cache_hit: true,
                })
            }
            Acquired::Claimed => {
                self.compute_claimed(request_id, request, params, key, result_ttl, started)
                    .await
            }
            Acquired::Wait { .. } => Err(Error::Internal(
                "acquire_or_wait returned an unresolved wait".to_string(),
            )),
        }
    }

    /// This caller won the claim and is obligated to compute. Any failure
    /// on this path releases the claim with `fail` so waiters can retry,
    /// and is recorded in the ledger with the error attached.
    async fn compute_claimed(
        &self,
        request_id: RequestId,
        request: SubmitRequest,
        params: CanonicalParams,
        key: CacheKey,
        result_ttl: Option<Duration>,
        started: Instant,
    ) -> Result<SubmitOutcome> {
        let mut job = AnalysisJob::started(key.clone(), request.app_name.clone());
        self.jobs.create(&job).await?;

        let computed = match self.computation.compute(&request.app_name, &params).await {
            Ok(computed) => computed,
            Err(e) => {
                return Err(self
                    .abandon_claim(request_id, &request, &params, &key, &mut job, started, e)
                    .await);
            }
        };

        match self
            .store_result(&key, &mut job, computed, result_ttl)
            .await
        {
            Ok(cost) => {
                info!(
                    request_id = %request_id,
                    key = %key,
                    job_id = %job.id,
                    duration_ms = job.duration_ms,
                    "analysis computed"
                );
                self.record(
                    request_id,
                    &request,
                    &params,
                    &key,
                    false,
                    Some(job.id),
                    started,
                    cost,
                    None,
                );
                Ok(SubmitOutcome {
                    request_id,
                    job_id: job.id,
                    cache_hit: false,
                })
            }
            Err(e) => Err(self
                .abandon_claim(request_id, &request, &params, &key, &mut job, started, e)
                .await),
        }
    }

    /// Commit sections, complete the claim, and finalize the job row.
    async fn store_result(
        &self,
        key: &CacheKey,
        job: &mut AnalysisJob,
        computed: ComputedAnalysis,
        result_ttl: Option<Duration>,
    ) -> Result<CostBreakdown> {
        let result_bytes = serde_json::to_vec(&computed.sections)?.len() as u64;
        let cost = self
            .cost_model
            .attribute(computed.warehouse_queries, computed.generative_calls);

        self.sections.write_all(job.id, computed.sections).await?;
        self.cache
            .complete(
                key,
                &Completion {
                    job_id: job.id,
                    result_bytes,
                    cost_saved: cost.total,
                    ttl: result_ttl,
                },
            )
            .await?;

        job.status = JobStatus::Succeeded;
        job.warehouse_queries = computed.warehouse_queries;
        job.generative_calls = computed.generative_calls;
        job.completed_at = Some(Utc::now());
        job.duration_ms = Some((Utc::now() - job.created_at).num_milliseconds().max(0) as u64);
        self.jobs.update(job).await?;

        Ok(cost)
    }

    /// Release the claim after a failed computation so the key is
    /// immediately re-claimable, then mark the job failed and ledger the
    /// error. Returns the error to surface to the caller.
    #[allow(clippy::too_many_arguments)]
    async fn abandon_claim(
        &self,
        request_id: RequestId,
        request: &SubmitRequest,
        params: &CanonicalParams,
        key: &CacheKey,
        job: &mut AnalysisJob,
        started: Instant,
        cause: Error,
    ) -> Error {
        error!(request_id = %request_id, key = %key, error = %cause, "analysis failed");

        if let Err(e) = self.cache.fail(key, &cause.to_string()).await {
            error!(key = %key, error = %e, "failed to release claim");
        }

        job.status = JobStatus::Failed;
        job.error = Some(cause.to_string());
        job.completed_at = Some(Utc::now());
        if let Err(e) = self.jobs.update(job).await {
            error!(job_id = %job.id, error = %e, "failed to finalize job row");
        }

        self.record(
            request_id,
            request,
            params,
            key,
            false,
            Some(job.id),
            started,
            CostBreakdown::default(),
            Some(cause.to_string()),
        );
        cause
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        request_id: RequestId,
        request: &SubmitRequest,
        params: &CanonicalParams,
        key: &CacheKey,
        cache_hit: bool,
        job_id: Option<JobId>,
        started: Instant,
        cost: CostBreakdown,
        error: Option<String>,
    ) {
        self.recorder.record(UsageLogEntry {
            request_id,
            timestamp: Utc::now(),
            requester_class: request.requester_class.clone(),
            app_name: request.app_name.clone(),
            parameters: params.clone(),
            cache_key: key.clone(),
            cache_hit,
            job_id,
            latency_ms: started.elapsed().as_millis() as u64,
            cost,
            error,
        });
    }

    /// Fetch a job's committed sections.
    ///
    /// Distinguishes "no such job" from "job exists but sections are not
    /// committed yet": section writes are all-or-nothing, so a running or
    /// failed job has none.
    pub async fn get_sections(&self, job_id: JobId) -> Result<SectionRead> {
        let Some(_job) = self.jobs.get(job_id).await? else {
            return Ok(SectionRead::NotFound);
        };
        let sections = self.sections.read_all(job_id).await?;
        if sections.is_empty() {
            return Ok(SectionRead::NotReady);
        }
        Ok(SectionRead::Ready(sections))
    }

    /// Kick a refresh cascade. Fails fast with `RefreshInProgress` when a
    /// cascade is already running.
    pub async fn trigger_refresh(&self, trigger: RefreshTrigger) -> Result<CascadeReport> {
        let refresher = self
            .refresher
            .as_ref()
            .ok_or_else(|| Error::Internal("no refresher configured".to_string()))?;
        refresher.run_cascade(trigger).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::AppDefinition;
    use async_trait::async_trait;
    use quarry_cache::{MemoryCacheStore, MemoryJobRepository, MemorySectionStore};
    use quarry_core::section::NewSection;
    use quarry_fingerprint::ParamSchema;
    use quarry_ledger::MemoryUsageSink;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingComputation {
        calls: AtomicU32,
        fail: bool,
    }

    impl CountingComputation {
        fn new() -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail: true,
            }
        }
    }

    #[async_trait]
    impl Computation for CountingComputation {
        async fn compute(
            &self,
            _app_name: &str,
            _params: &CanonicalParams,
        ) -> Result<ComputedAnalysis> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::ComputationFailed("warehouse timeout".to_string()));
            }
            Ok(ComputedAnalysis {
                sections: vec![
                    NewSection::table("originations", json!([["ca", 120]])),
                    NewSection::narrative("summary", "volume up 4% year over year"),
                ],
                warehouse_queries: 3,
                generative_calls: 1,
            })
        }
    }

    fn service(computation: Arc<CountingComputation>) -> (AnalysisService, Arc<MemoryUsageSink>) {
        let mut registry = AppRegistry::new();
        registry.register(
            "lending-report",
            AppDefinition::new(ParamSchema::new().categorical("state").number("year")),
        );

        let sink = Arc::new(MemoryUsageSink::new());
        let (recorder, _handle) = UsageRecorder::spawn(sink.clone(), 64);

        let service = AnalysisService::new(
            registry,
            Arc::new(MemoryCacheStore::new()),
            Arc::new(MemoryJobRepository::new()),
            Arc::new(MemorySectionStore::new()),
            computation,
            recorder,
            CostModel::default(),
            WaitPolicy::default(),
            Duration::from_secs(900),
        );
        (service, sink)
    }

    fn request() -> SubmitRequest {
        SubmitRequest {
            app_name: "lending-report".to_string(),
            parameters: json!({"state": "CA", "year": 2024}),
            requester_class: "api".to_string(),
        }
    }

    #[tokio::test]
    async fn test_second_submit_is_a_hit() {
        let computation = Arc::new(CountingComputation::new());
        let (service, _sink) = service(computation.clone());

        let first = service.submit(request()).await.unwrap();
        assert!(!first.cache_hit);

        // Different surface form, same canonical request.
        let second = service
            .submit(SubmitRequest {
                parameters: json!({"state": "ca", "year": "2024"}),
                ..request()
            })
            .await
            .unwrap();

        assert!(second.cache_hit);
        assert_eq!(second.job_id, first.job_id);
        assert_eq!(computation.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_releases_claim_for_retry() {
        let failing = Arc::new(CountingComputation::failing());
        let (service, _sink) = service(failing.clone());

        let err = service.submit(request()).await.unwrap_err();
        assert!(matches!(err, Error::ComputationFailed(_)));

        // The key is immediately re-claimable; a retry computes again.
        let err = service.submit(request()).await.unwrap_err();
        assert!(matches!(err, Error::ComputationFailed(_)));
        assert_eq!(failing.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unknown_application_never_reaches_cache() {
        let computation = Arc::new(CountingComputation::new());
        let (service, _sink) = service(computation.clone());

        let err = service
            .submit(SubmitRequest {
                app_name: "nope".to_string(),
                ..request()
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::UnknownApplication(_)));
        assert_eq!(computation.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_sections_readable_after_submit() {
        let computation = Arc::new(CountingComputation::new());
        let (service, _sink) = service(computation);

        let outcome = service.submit(request()).await.unwrap();
        match service.get_sections(outcome.job_id).await.unwrap() {
            SectionRead::Ready(sections) => {
                assert_eq!(sections.len(), 2);
                assert_eq!(sections[0].name, "originations");
            }
            other => panic!("expected ready sections, got {other:?}"),
        }

        assert!(matches!(
            service.get_sections(JobId::new()).await.unwrap(),
            SectionRead::NotFound
        ));
    }

    #[tokio::test]
    async fn test_usage_recorded_for_hit_and_miss() {
        let computation = Arc::new(CountingComputation::new());
        let (service, sink) = service(computation);

        service.submit(request()).await.unwrap();
        service.submit(request()).await.unwrap();

        // Drain task is asynchronous; give it a beat.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let entries = sink.all().await;
        assert_eq!(entries.len(), 2);
        assert!(!entries[0].cache_hit);
        assert!(entries[1].cache_hit);
        assert!(entries[0].cost.total > 0.0);
    }
}
