//! PostgresJobStore and RedisKeyValueStore against real containers.
//!
//! Needs Docker: `cargo test -- --ignored`

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{unique_url, TestHarness};
use phishwatch_core::config::OrchestratorConfig;
use phishwatch_core::kernel::jobs::{
    Artifact, ArtifactPayload, ArtifactStore, DedupLock, DispatchPlan, Dispatcher, JobOutcome,
    JobStatus, JobStore, LocalTaskQueue, LockKey, UrlScanResult, WorkType, Worker,
    STALE_JOB_ERROR,
};
use phishwatch_core::kernel::{
    KeyValueStore, MockAnalyzer, MockScanner, RecordingTransport, ServerKernel,
};
use test_context::test_context;

fn stale_after() -> chrono::Duration {
    chrono::Duration::minutes(45)
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "needs Docker"]
async fn plan_dispatch_creates_then_attaches(ctx: &TestHarness) {
    let store = ctx.job_store();
    let url = unique_url();

    let (plan, record) = store
        .plan_dispatch(&url, WorkType::Report, Some("203.0.113.7"), Utc::now(), stale_after())
        .await
        .unwrap();
    let DispatchPlan::Dispatch { task_id, recovered_stale } = plan else {
        panic!("expected a dispatch, got {:?}", plan);
    };
    assert!(!recovered_stale);
    assert_eq!(record.status, JobStatus::Pending);
    assert_eq!(record.task_id.as_deref(), Some(task_id.as_str()));
    assert_eq!(record.caller_ip.as_deref(), Some("203.0.113.7"));

    let (again, same) = store
        .plan_dispatch(&url, WorkType::Report, None, Utc::now(), stale_after())
        .await
        .unwrap();
    assert_eq!(again, DispatchPlan::Attach);
    assert_eq!(same.id, record.id);
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "needs Docker"]
async fn concurrent_plans_dispatch_once(ctx: &TestHarness) {
    let store = Arc::new(ctx.job_store());
    let url = unique_url();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = store.clone();
            let url = url.clone();
            tokio::spawn(async move {
                store
                    .plan_dispatch(&url, WorkType::Classification, None, Utc::now(), stale_after())
                    .await
            })
        })
        .collect();

    let mut dispatched = 0;
    for handle in handles {
        let (plan, _) = handle.await.unwrap().unwrap();
        if matches!(plan, DispatchPlan::Dispatch { .. }) {
            dispatched += 1;
        }
    }
    assert_eq!(dispatched, 1);
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "needs Docker"]
async fn stale_record_is_recovered(ctx: &TestHarness) {
    let store = ctx.job_store();
    let url = unique_url();
    let then = Utc::now() - chrono::Duration::hours(2);

    let (plan, _) = store
        .plan_dispatch(&url, WorkType::Report, None, then, stale_after())
        .await
        .unwrap();
    let DispatchPlan::Dispatch { task_id: old, .. } = plan else {
        panic!("expected a dispatch");
    };

    let (plan, record) = store
        .plan_dispatch(&url, WorkType::Report, None, Utc::now(), stale_after())
        .await
        .unwrap();
    let DispatchPlan::Dispatch { task_id, recovered_stale } = plan else {
        panic!("expected a dispatch");
    };
    assert!(recovered_stale);
    assert_ne!(task_id, old);
    assert_eq!(record.status, JobStatus::Pending);
    assert_ne!(record.last_error, STALE_JOB_ERROR);

    assert!(store.claim(&url, WorkType::Report, &old).await.unwrap().is_none());
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "needs Docker"]
async fn transitions_require_the_current_task(ctx: &TestHarness) {
    let store = ctx.job_store();
    let url = unique_url();

    let (plan, _) = store
        .plan_dispatch(&url, WorkType::UrlScan, None, Utc::now(), stale_after())
        .await
        .unwrap();
    let DispatchPlan::Dispatch { task_id, .. } = plan else {
        panic!("expected a dispatch");
    };

    let claimed = store
        .claim(&url, WorkType::UrlScan, &task_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.status, JobStatus::Started);
    assert!(claimed.started_at.is_some());

    assert!(!store
        .mark_failed(&url, WorkType::UrlScan, "someone-else", "boom")
        .await
        .unwrap());
    assert!(store
        .mark_retrying(&url, WorkType::UrlScan, &task_id, "retrying (1/6): timeout")
        .await
        .unwrap());
    assert!(store
        .mark_succeeded(&url, WorkType::UrlScan, &task_id, None)
        .await
        .unwrap());

    let record = store.find(&url, WorkType::UrlScan).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Success);
    assert!(record.last_error.is_empty());
    assert!(record.finished_at.is_some());
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "needs Docker"]
async fn artifacts_upsert_and_complete_screenshots(ctx: &TestHarness) {
    let store = ctx.job_store();
    let url = unique_url();

    let first = store
        .save_artifact(Artifact::new(
            &url,
            ArtifactPayload::UrlScan(UrlScanResult {
                scan_id: "scan-1".into(),
                result: None,
                screenshot_url: None,
            }),
            false,
        ))
        .await
        .unwrap();
    let second = store
        .save_artifact(Artifact::new(
            &url,
            ArtifactPayload::UrlScan(UrlScanResult {
                scan_id: "scan-1".into(),
                result: Some(MockScanner::default_result("scan-1")),
                screenshot_url: Some("https://urlscan.test/screenshots/scan-1.png".into()),
            }),
            false,
        ))
        .await
        .unwrap();
    assert_eq!(first.id, second.id);

    let pending = store.pending_screenshots(1000).await.unwrap();
    assert!(pending.iter().any(|a| a.url == url));

    store
        .mark_processed(second.id, Some(b"\x89PNG".to_vec()))
        .await
        .unwrap();
    let pending = store.pending_screenshots(1000).await.unwrap();
    assert!(!pending.iter().any(|a| a.url == url));

    let stored = store
        .find_artifact(&url, WorkType::UrlScan)
        .await
        .unwrap()
        .unwrap();
    assert!(stored.processed);
    assert_eq!(stored.screenshot.as_deref(), Some(&b"\x89PNG"[..]));
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "needs Docker"]
async fn touched_scans_rotate_and_deleted_scans_unlink(ctx: &TestHarness) {
    let store = ctx.job_store();
    let (older, newer) = (unique_url(), unique_url());
    let mut ids = Vec::new();
    for url in [&older, &newer] {
        let saved = store
            .save_artifact(Artifact::new(
                url,
                ArtifactPayload::UrlScan(UrlScanResult {
                    scan_id: format!("scan-{url}"),
                    result: None,
                    screenshot_url: None,
                }),
                false,
            ))
            .await
            .unwrap();
        ids.push(saved.id);
    }
    let position = |pending: &[Artifact], url: &str| pending.iter().position(|a| a.url == url);

    store.touch_artifact(ids[0]).await.unwrap();
    let pending = store.pending_screenshots(1000).await.unwrap();
    assert!(position(&pending, &newer) < position(&pending, &older));

    let record = store
        .mark_success_without_run(&older, WorkType::UrlScan, Some(ids[0]))
        .await
        .unwrap();
    assert_eq!(record.result_ref, Some(ids[0]));

    store.delete_artifact(ids[0]).await.unwrap();
    store.delete_artifact(ids[0]).await.unwrap();

    assert!(store
        .find_artifact(&older, WorkType::UrlScan)
        .await
        .unwrap()
        .is_none());
    let record = store.find(&older, WorkType::UrlScan).await.unwrap().unwrap();
    assert_eq!(record.result_ref, None);
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "needs Docker"]
async fn redis_lock_is_exclusive_and_expires(ctx: &TestHarness) {
    let lock = DedupLock::new(ctx.kv.clone());
    let key = LockKey::new(WorkType::Report, &unique_url());

    assert!(lock.try_acquire(&key, Duration::from_secs(1)).await);
    assert!(!lock.try_acquire(&key, Duration::from_secs(1)).await);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert!(lock.try_acquire(&key, Duration::from_secs(30)).await);

    lock.release(&key).await;
    assert!(!lock.is_held(&key).await);
    assert_eq!(ctx.kv.get(key.as_str()).await.unwrap(), None);
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "needs Docker"]
async fn report_runs_end_to_end_on_real_backends(ctx: &TestHarness) {
    let store = Arc::new(ctx.job_store());
    let transport = Arc::new(RecordingTransport::new());
    let (queue, mut tasks) = LocalTaskQueue::new();
    let kernel = Arc::new(ServerKernel::new(
        store.clone(),
        store.clone(),
        ctx.kv.clone(),
        transport.clone(),
        Arc::new(MockAnalyzer::new()),
        Arc::new(MockScanner::new()),
        Arc::new(queue),
        OrchestratorConfig::default(),
    ));
    let url = unique_url();
    store
        .save_artifact(Artifact::new(
            &url,
            ArtifactPayload::Classification(MockAnalyzer::default_classification()),
            true,
        ))
        .await
        .unwrap();

    let outcome = Dispatcher::new(kernel.clone())
        .request_job(&url, WorkType::Report, None)
        .await
        .unwrap();
    assert!(outcome.accepted);

    let envelope = tasks.recv().await.unwrap();
    let result = Worker::new(kernel.clone()).process(envelope).await.unwrap();
    assert_eq!(result, JobOutcome::Succeeded);

    let record = store.find(&url, WorkType::Report).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Success);
    assert!(ctx
        .kv
        .get(LockKey::new(WorkType::Report, &url).as_str())
        .await
        .unwrap()
        .is_none());
    let cached = kernel.status_cache().get(&url).await.unwrap().unwrap();
    assert_eq!(cached.to_message("status")["report_ready"], true);
}
