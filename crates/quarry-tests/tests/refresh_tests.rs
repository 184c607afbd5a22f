//! Materialization cascade scenarios through the serving facade.

use quarry_core::cache::{AcquireRequest, Acquired};
use quarry_core::materialize::RefreshStatus;
use quarry_core::params::CanonicalParams;
use quarry_core::ports::{CacheStore, RefreshJournal};
use quarry_core::Error;
use quarry_materialize::refresher::{REFRESHER_APP, refresher_lock_key};
use quarry_materialize::RefreshTrigger;
use quarry_tests::{ServiceHarness, init_test_logging};
use serde_json::json;
use std::time::Duration;

/// Sum of a numeric column across a node's visible rows.
async fn visible_total(harness: &ServiceHarness, node: &str, column: &str) -> i64 {
    harness
        .engine
        .snapshot(node)
        .await
        .map(|rows| {
            rows.iter()
                .filter_map(|r| r.get(column).and_then(|v| v.as_i64()))
                .sum()
        })
        .unwrap_or(0)
}

#[tokio::test]
async fn test_full_cascade_keeps_tiers_consistent() {
    init_test_logging();
    let harness = ServiceHarness::new().await;

    let report = harness
        .service
        .trigger_refresh(RefreshTrigger::All)
        .await
        .unwrap();

    assert!(report.fully_succeeded());
    assert_eq!(report.refreshed.len(), 3);

    // Every tier sums to the same grand total as the raw loans.
    let tract = visible_total(&harness, "tract_volume", "total_amount").await;
    let county = visible_total(&harness, "county_volume", "total_amount").await;
    let state = visible_total(&harness, "state_volume", "total_amount").await;
    assert_eq!(tract, 2_375_000);
    assert_eq!(county, tract);
    assert_eq!(state, tract);

    for node in ["tract_volume", "county_volume", "state_volume"] {
        let latest = harness.journal.latest_for_node(node).await.unwrap().unwrap();
        assert_eq!(latest.status, RefreshStatus::Success);
        assert!(latest.rows_after.unwrap() > 0);
    }
}

#[tokio::test]
async fn test_validation_failure_keeps_prior_version_and_skips_downstream() {
    init_test_logging();
    let harness = ServiceHarness::new().await;

    harness
        .service
        .trigger_refresh(RefreshTrigger::All)
        .await
        .unwrap();
    let state_before = visible_total(&harness, "state_volume", "total_amount").await;

    // New raw data arrives, but the county tier will build corrupt output.
    let mut rows = quarry_tests::loan_rows();
    rows.push(quarry_materialize::engine::Row::from([
        ("tract".to_string(), json!("06075.02")),
        ("county".to_string(), json!("san_francisco")),
        ("state".to_string(), json!("ca")),
        ("amount".to_string(), json!(500_000)),
    ]));
    harness.engine.load_source("loans", rows).await;
    harness.engine.poison("county_volume").await;

    let report = harness
        .service
        .trigger_refresh(RefreshTrigger::All)
        .await
        .unwrap();

    assert_eq!(report.refreshed, vec!["tract_volume".to_string()]);
    assert_eq!(report.failed, vec!["county_volume".to_string()]);
    assert_eq!(report.skipped, vec!["state_volume".to_string()]);

    // Tract picked up the new loan; the failed tier and its descendant
    // kept their prior versions.
    let tract = visible_total(&harness, "tract_volume", "total_amount").await;
    assert_eq!(tract, 2_875_000);
    let county = visible_total(&harness, "county_volume", "total_amount").await;
    assert_eq!(county, state_before);
    let state = visible_total(&harness, "state_volume", "total_amount").await;
    assert_eq!(state, state_before);

    let failed = harness
        .journal
        .latest_for_node("county_volume")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failed.status, RefreshStatus::Failed);
    assert!(!failed.validation.unwrap().passed);

    // Clearing the fault lets the next cascade converge all tiers.
    harness.engine.clear_poison("county_volume").await;
    let report = harness
        .service
        .trigger_refresh(RefreshTrigger::All)
        .await
        .unwrap();
    assert!(report.fully_succeeded());
    assert_eq!(
        visible_total(&harness, "state_volume", "total_amount").await,
        2_875_000
    );
}

#[tokio::test]
async fn test_source_change_refreshes_everything_downstream() {
    init_test_logging();
    let harness = ServiceHarness::new().await;
    harness
        .service
        .trigger_refresh(RefreshTrigger::All)
        .await
        .unwrap();

    harness
        .engine
        .load_source(
            "loans",
            vec![quarry_materialize::engine::Row::from([
                ("tract".to_string(), json!("48201.01")),
                ("county".to_string(), json!("harris")),
                ("state".to_string(), json!("tx")),
                ("amount".to_string(), json!(100_000)),
            ])],
        )
        .await;

    let report = harness
        .service
        .trigger_refresh(RefreshTrigger::SourcesChanged(vec!["loans".to_string()]))
        .await
        .unwrap();

    assert!(report.fully_succeeded());
    assert_eq!(report.refreshed.len(), 3);
    assert_eq!(
        visible_total(&harness, "state_volume", "total_amount").await,
        100_000
    );
}

#[tokio::test]
async fn test_second_cascade_fails_fast_while_one_is_running() {
    init_test_logging();
    let harness = ServiceHarness::new().await;

    // Hold the refresher's exclusivity lock by claiming its reserved key.
    let lock_request = AcquireRequest {
        app_name: REFRESHER_APP.to_string(),
        key: refresher_lock_key(),
        parameters: CanonicalParams::new(),
        requester: "test".to_string(),
        claim_timeout: Duration::from_secs(60),
    };
    assert!(matches!(
        harness.cache.acquire(&lock_request).await.unwrap(),
        Acquired::Claimed
    ));

    let err = harness
        .service
        .trigger_refresh(RefreshTrigger::All)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RefreshInProgress));

    // Releasing the lock makes the cascade runnable again.
    harness
        .cache
        .fail(&refresher_lock_key(), "released")
        .await
        .unwrap();
    let report = harness
        .service
        .trigger_refresh(RefreshTrigger::All)
        .await
        .unwrap();
    assert!(report.fully_succeeded());
}
