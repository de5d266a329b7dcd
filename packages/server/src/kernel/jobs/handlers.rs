//! Per-work-type execution: call the backend, persist the artifact.
//!
//! Handlers know nothing about records, locks or retries. They either return
//! the saved artifact or a [`JobError`] the worker classifies.

use tracing::{debug, info, warn};

use super::artifacts::{Artifact, ArtifactPayload, UrlScanResult};
use super::error::{BackendError, JobError};
use super::queue::TaskEnvelope;
use super::record::WorkType;
use crate::kernel::ServerKernel;

pub async fn run(kernel: &ServerKernel, envelope: &TaskEnvelope) -> Result<Artifact, JobError> {
    match envelope.work_type {
        WorkType::Classification => classify(kernel, envelope).await,
        WorkType::Report => deep_report(kernel, envelope).await,
        WorkType::UrlScan => url_scan(kernel, envelope).await,
    }
}

async fn classify(kernel: &ServerKernel, envelope: &TaskEnvelope) -> Result<Artifact, JobError> {
    let classification = kernel.analyzer.classify(&envelope.url).await?;
    debug!(
        url = %envelope.url,
        threat_type = %classification.threat_type,
        threat_score = classification.threat_score,
        "classified"
    );

    let artifact = Artifact::new(
        &envelope.url,
        ArtifactPayload::Classification(classification),
        true,
    )
    .with_caller_ip(envelope.caller_ip.clone());
    Ok(kernel.artifact_store.save_artifact(artifact).await?)
}

async fn deep_report(kernel: &ServerKernel, envelope: &TaskEnvelope) -> Result<Artifact, JobError> {
    let prior = kernel
        .artifact_store
        .find_artifact(&envelope.url, WorkType::Classification)
        .await?
        .filter(|a| a.processed)
        .and_then(|a| a.classification().cloned())
        .ok_or_else(|| JobError::Fatal("classification result missing".to_string()))?;

    let report = kernel.analyzer.deep_scan(&envelope.url, &prior).await?.cleaned();

    let artifact = Artifact::new(&envelope.url, ArtifactPayload::DeepReport(report), true)
        .with_caller_ip(envelope.caller_ip.clone());
    Ok(kernel.artifact_store.save_artifact(artifact).await?)
}

/// Submit (once), wait for the result, then try for the screenshot.
///
/// The scan id is persisted right after submission so a retry polls the same
/// scan instead of submitting again. A scan the provider reports gone is
/// dropped, so the next attempt submits a new one.
async fn url_scan(kernel: &ServerKernel, envelope: &TaskEnvelope) -> Result<Artifact, JobError> {
    let url = &envelope.url;
    let existing = kernel
        .artifact_store
        .find_artifact(url, WorkType::UrlScan)
        .await?;

    let resumed = existing
        .as_ref()
        .and_then(|a| a.url_scan().map(|scan| (a.id, scan.scan_id.clone())));
    let (pending_id, scan_id) = match resumed {
        Some((id, scan_id)) => {
            debug!(url = %url, scan_id = %scan_id, "resuming submitted scan");
            (id, scan_id)
        }
        None => {
            let scan_id = kernel.scanner.submit_scan(url).await?;
            info!(url = %url, scan_id = %scan_id, "scan submitted");
            let pending = Artifact::new(
                url,
                ArtifactPayload::UrlScan(UrlScanResult {
                    scan_id: scan_id.clone(),
                    result: None,
                    screenshot_url: None,
                }),
                false,
            )
            .with_caller_ip(envelope.caller_ip.clone());
            let saved = kernel.artifact_store.save_artifact(pending).await?;
            (saved.id, scan_id)
        }
    };

    let result = match kernel.scanner.wait_for_result(&scan_id).await {
        Ok(result) => result,
        Err(e @ BackendError::Gone(_)) => {
            warn!(url = %url, scan_id = %scan_id, "submitted scan is gone, dropping it");
            kernel.artifact_store.delete_artifact(pending_id).await?;
            return Err(e.into());
        }
        Err(e) => return Err(e.into()),
    };
    let screenshot_url = result
        .pointer("/task/screenshotURL")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| kernel.scanner.screenshot_url(&scan_id));

    let screenshot = match kernel.scanner.fetch_screenshot(&scan_id).await {
        Ok(screenshot) => screenshot,
        Err(e) => {
            // Left for the screenshot sweep
            warn!(url = %url, scan_id = %scan_id, error = %e, "screenshot fetch failed");
            None
        }
    };

    let artifact = Artifact::new(
        url,
        ArtifactPayload::UrlScan(UrlScanResult {
            scan_id,
            result: Some(result),
            screenshot_url: Some(screenshot_url),
        }),
        false,
    )
    .with_caller_ip(envelope.caller_ip.clone());
    let mut saved = kernel.artifact_store.save_artifact(artifact).await?;

    if let Some(bytes) = screenshot {
        kernel
            .artifact_store
            .mark_processed(saved.id, Some(bytes.clone()))
            .await?;
        saved.processed = true;
        saved.screenshot = Some(bytes);
    }
    Ok(saved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::jobs::{ArtifactStore, BackendError};
    use crate::kernel::{MockAnalyzer, MockScanner, TestDependencies};

    const URL: &str = "https://x.test";

    fn envelope(work_type: WorkType) -> TaskEnvelope {
        TaskEnvelope::new(URL, work_type, "t1", Some("10.0.0.1".into()))
    }

    #[tokio::test]
    async fn test_classification_saves_processed_artifact() {
        let test = TestDependencies::new().into_kernel();

        let artifact = run(&test.kernel, &envelope(WorkType::Classification))
            .await
            .unwrap();

        assert!(artifact.processed);
        assert_eq!(artifact.classification().unwrap().threat_score, 3);
        assert_eq!(artifact.caller_ip.as_deref(), Some("10.0.0.1"));
        assert_eq!(test.artifact_store.len(), 1);
    }

    #[tokio::test]
    async fn test_report_requires_classification() {
        let test = TestDependencies::new().into_kernel();

        let err = run(&test.kernel, &envelope(WorkType::Report))
            .await
            .unwrap_err();

        assert_eq!(err, JobError::Fatal("classification result missing".into()));
        assert_eq!(test.analyzer.deep_scan_calls(), 0);
    }

    #[tokio::test]
    async fn test_report_is_cleaned_before_saving() {
        let test = TestDependencies::new().into_kernel();
        run(&test.kernel, &envelope(WorkType::Classification))
            .await
            .unwrap();

        let artifact = run(&test.kernel, &envelope(WorkType::Report)).await.unwrap();

        assert_eq!(
            artifact.report().unwrap().description,
            "Credential harvesting form"
        );
    }

    #[tokio::test]
    async fn test_malformed_analysis_is_fatal() {
        let test = TestDependencies::new()
            .mock_analyzer(
                MockAnalyzer::new().with_classify_error(BackendError::Malformed("not json".into())),
            )
            .into_kernel();

        let err = run(&test.kernel, &envelope(WorkType::Classification))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Fatal(_)));
    }

    #[tokio::test]
    async fn test_url_scan_stores_screenshot() {
        let test = TestDependencies::new().into_kernel();

        let artifact = run(&test.kernel, &envelope(WorkType::UrlScan)).await.unwrap();

        assert!(artifact.processed);
        assert!(artifact.screenshot.is_some());
        assert_eq!(
            artifact.url_scan().unwrap().screenshot_url.as_deref(),
            Some("https://urlscan.test/screenshots/scan-1.png")
        );
        let stored = test
            .artifact_store
            .find_artifact(URL, WorkType::UrlScan)
            .await
            .unwrap()
            .unwrap();
        assert!(stored.processed);
    }

    #[tokio::test]
    async fn test_url_scan_retry_reuses_scan_id() {
        let test = TestDependencies::new()
            .mock_scanner(
                MockScanner::new()
                    .with_wait_result(Err(BackendError::Timeout("scan-1".into()))),
            )
            .into_kernel();

        let err = run(&test.kernel, &envelope(WorkType::UrlScan))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Transient(_)));

        run(&test.kernel, &envelope(WorkType::UrlScan)).await.unwrap();

        assert_eq!(test.scanner.submit_calls(), 1);
        assert_eq!(test.scanner.wait_calls(), 2);
    }

    #[tokio::test]
    async fn test_gone_scan_is_resubmitted_next_time() {
        let test = TestDependencies::new()
            .mock_scanner(
                MockScanner::new()
                    .with_wait_result(Err(BackendError::Gone("scan-1".into())))
                    .with_submit_result(Ok("scan-1".into()))
                    .with_submit_result(Ok("scan-2".into())),
            )
            .into_kernel();

        let err = run(&test.kernel, &envelope(WorkType::UrlScan))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Fatal(_)));
        assert!(test
            .artifact_store
            .find_artifact(URL, WorkType::UrlScan)
            .await
            .unwrap()
            .is_none());

        let artifact = run(&test.kernel, &envelope(WorkType::UrlScan)).await.unwrap();

        assert_eq!(test.scanner.submit_calls(), 2);
        assert_eq!(artifact.url_scan().unwrap().scan_id, "scan-2");
        assert!(artifact.processed);
    }

    #[tokio::test]
    async fn test_missing_screenshot_leaves_artifact_unprocessed() {
        let test = TestDependencies::new()
            .mock_scanner(MockScanner::new().with_screenshot_result(Ok(None)))
            .into_kernel();

        let artifact = run(&test.kernel, &envelope(WorkType::UrlScan)).await.unwrap();

        assert!(!artifact.processed);
        let pending = test.artifact_store.pending_screenshots(10).await.unwrap();
        assert_eq!(pending.len(), 1);
    }
}
