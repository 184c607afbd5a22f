//! Wait-with-backoff coordination over the cache store.

use quarry_core::cache::{AcquireRequest, Acquired};
use quarry_core::ports::CacheStore;
use quarry_core::{Error, Result};
use std::time::{Duration, Instant};
use tracing::debug;

/// Polling policy for callers that receive WAIT.
///
/// Polling against the backing store is the only coordination mechanism;
/// there is no cross-process notification channel. The backoff doubles per
/// attempt up to `max_interval`, and the whole wait is bounded by
/// `deadline` so a caller never outlives an abandoned claim by much more
/// than the claim timeout itself.
#[derive(Debug, Clone, Copy)]
pub struct WaitPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub deadline: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(250),
            max_interval: Duration::from_secs(5),
            deadline: Duration::from_secs(600),
        }
    }
}

/// Acquire a cache key, suspending through WAIT outcomes until the key
/// resolves to HIT or CLAIMED.
///
/// This is the only intentional blocking point in the serving path. If the
/// in-flight claimant fails, the next poll re-claims the key and this
/// caller becomes the computing one.
pub async fn acquire_or_wait(
    store: &dyn CacheStore,
    request: &AcquireRequest,
    policy: WaitPolicy,
) -> Result<Acquired> {
    let started = Instant::now();
    let mut interval = policy.initial_interval;

    loop {
        match store.acquire(request).await? {
            Acquired::Wait { retry_after } => {
                if started.elapsed() >= policy.deadline {
                    return Err(Error::WaitTimeout {
                        key: request.key.to_string(),
                        waited_ms: started.elapsed().as_millis() as u64,
                    });
                }
                let sleep_for = retry_after.max(interval).min(policy.max_interval);
                debug!(
                    key = %request.key,
                    sleep_ms = sleep_for.as_millis() as u64,
                    "in-flight computation on key, waiting"
                );
                tokio::time::sleep(sleep_for).await;
                interval = (interval * 2).min(policy.max_interval);
            }
            resolved => return Ok(resolved),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCacheStore;
    use quarry_core::cache::Completion;
    use quarry_core::ids::JobId;
    use quarry_core::params::CanonicalParams;
    use quarry_fingerprint::fingerprint;
    use std::sync::Arc;

    fn request(key_seed: &str) -> AcquireRequest {
        AcquireRequest {
            app_name: "lending-report".to_string(),
            key: fingerprint(key_seed, &CanonicalParams::new()),
            parameters: CanonicalParams::new(),
            requester: "test".to_string(),
            claim_timeout: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn test_waiter_observes_completion() {
        let store = Arc::new(MemoryCacheStore::new());
        let req = request("wait-hit");

        // First caller wins the claim.
        assert!(matches!(
            store.acquire(&req).await.unwrap(),
            Acquired::Claimed
        ));

        let job_id = JobId::new();
        let waiter = {
            let store = store.clone();
            let req = req.clone();
            tokio::spawn(async move {
                acquire_or_wait(store.as_ref(), &req, WaitPolicy::default()).await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        store
            .complete(
                &req.key,
                &Completion {
                    job_id,
                    result_bytes: 128,
                    cost_saved: 1.5,
                    ttl: None,
                },
            )
            .await
            .unwrap();

        match waiter.await.unwrap().unwrap() {
            Acquired::Hit { job_id: seen, .. } => assert_eq!(seen, job_id),
            other => panic!("expected hit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_wait_deadline_expires() {
        let store = MemoryCacheStore::new();
        let req = request("wait-deadline");
        assert!(matches!(
            store.acquire(&req).await.unwrap(),
            Acquired::Claimed
        ));

        let policy = WaitPolicy {
            initial_interval: Duration::from_millis(10),
            max_interval: Duration::from_millis(20),
            deadline: Duration::from_millis(60),
        };
        let err = acquire_or_wait(&store, &req, policy).await.unwrap_err();
        assert!(matches!(err, Error::WaitTimeout { .. }));
    }
}
