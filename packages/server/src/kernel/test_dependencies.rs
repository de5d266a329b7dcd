// TestDependencies - mock implementations for testing
//
// Scripted backends plus in-memory stores, bundled into a ServerKernel so the
// dispatcher and worker can run end to end without Postgres, Redis or network.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use super::jobs::{
    BackendError, Classification, DeepReport, LocalTaskQueue, MemoryArtifactStore,
    MemoryJobStore, TaskReceiver,
};
use super::kv::MemoryKeyValueStore;
use super::transport::RecordingTransport;
use super::{Analyzer, Scanner, ServerKernel};
use crate::config::OrchestratorConfig;

type Scripted<T> = Mutex<VecDeque<Result<T, BackendError>>>;

fn next_scripted<T>(script: &Scripted<T>) -> Option<Result<T, BackendError>> {
    script.lock().unwrap_or_else(|e| e.into_inner()).pop_front()
}

fn push_scripted<T>(script: &Scripted<T>, result: Result<T, BackendError>) {
    script
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .push_back(result);
}

// =============================================================================
// Mock Analyzer
// =============================================================================

/// Returns scripted results in order, then a fixed default once the script runs out.
#[derive(Default)]
pub struct MockAnalyzer {
    classify_results: Scripted<Classification>,
    deep_scan_results: Scripted<DeepReport>,
    classify_calls: AtomicUsize,
    deep_scan_calls: AtomicUsize,
}

impl MockAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_classification(self, classification: Classification) -> Self {
        push_scripted(&self.classify_results, Ok(classification));
        self
    }

    pub fn with_classify_error(self, error: BackendError) -> Self {
        push_scripted(&self.classify_results, Err(error));
        self
    }

    /// Queue the same classify error `times` times.
    pub fn with_classify_errors(self, times: usize, error: BackendError) -> Self {
        (0..times).fold(self, |mock, _| mock.with_classify_error(error.clone()))
    }

    pub fn with_report(self, report: DeepReport) -> Self {
        push_scripted(&self.deep_scan_results, Ok(report));
        self
    }

    pub fn with_deep_scan_error(self, error: BackendError) -> Self {
        push_scripted(&self.deep_scan_results, Err(error));
        self
    }

    pub fn with_deep_scan_errors(self, times: usize, error: BackendError) -> Self {
        (0..times).fold(self, |mock, _| mock.with_deep_scan_error(error.clone()))
    }

    pub fn classify_calls(&self) -> usize {
        self.classify_calls.load(Ordering::SeqCst)
    }

    pub fn deep_scan_calls(&self) -> usize {
        self.deep_scan_calls.load(Ordering::SeqCst)
    }

    pub fn default_classification() -> Classification {
        Classification {
            site_name: "Example Bank".to_string(),
            threat_type: "phishing".to_string(),
            description: "Login page imitating a bank".to_string(),
            threat_score: 3,
        }
    }

    pub fn default_report(url: &str) -> DeepReport {
        DeepReport {
            url: url.to_string(),
            site_name: "Example Bank".to_string(),
            threat_type: "phishing".to_string(),
            description: "Credential harvesting form []()".to_string(),
            probability: 0.92,
            reason: Some("Lookalike domain".to_string()),
            depth: None,
        }
    }
}

#[async_trait]
impl Analyzer for MockAnalyzer {
    async fn classify(&self, _url: &str) -> Result<Classification, BackendError> {
        self.classify_calls.fetch_add(1, Ordering::SeqCst);
        next_scripted(&self.classify_results).unwrap_or_else(|| Ok(Self::default_classification()))
    }

    async fn deep_scan(
        &self,
        url: &str,
        _prior: &Classification,
    ) -> Result<DeepReport, BackendError> {
        self.deep_scan_calls.fetch_add(1, Ordering::SeqCst);
        next_scripted(&self.deep_scan_results).unwrap_or_else(|| Ok(Self::default_report(url)))
    }
}

// =============================================================================
// Mock Scanner
// =============================================================================

#[derive(Default)]
pub struct MockScanner {
    submit_results: Scripted<String>,
    poll_results: Scripted<Option<serde_json::Value>>,
    wait_results: Scripted<serde_json::Value>,
    screenshot_results: Scripted<Option<Vec<u8>>>,
    submit_calls: AtomicUsize,
    poll_calls: AtomicUsize,
    wait_calls: AtomicUsize,
    screenshot_calls: AtomicUsize,
}

impl MockScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_submit_result(self, result: Result<String, BackendError>) -> Self {
        push_scripted(&self.submit_results, result);
        self
    }

    pub fn with_poll_result(self, result: Result<Option<serde_json::Value>, BackendError>) -> Self {
        push_scripted(&self.poll_results, result);
        self
    }

    pub fn with_wait_result(self, result: Result<serde_json::Value, BackendError>) -> Self {
        push_scripted(&self.wait_results, result);
        self
    }

    pub fn with_screenshot_result(self, result: Result<Option<Vec<u8>>, BackendError>) -> Self {
        push_scripted(&self.screenshot_results, result);
        self
    }

    pub fn submit_calls(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub fn poll_calls(&self) -> usize {
        self.poll_calls.load(Ordering::SeqCst)
    }

    pub fn wait_calls(&self) -> usize {
        self.wait_calls.load(Ordering::SeqCst)
    }

    pub fn screenshot_calls(&self) -> usize {
        self.screenshot_calls.load(Ordering::SeqCst)
    }

    pub fn default_result(scan_id: &str) -> serde_json::Value {
        json!({
            "task": {
                "uuid": scan_id,
                "screenshotURL": format!("https://urlscan.test/screenshots/{}.png", scan_id),
            },
            "verdicts": {"overall": {"malicious": true}},
        })
    }
}

#[async_trait]
impl Scanner for MockScanner {
    async fn submit_scan(&self, _url: &str) -> Result<String, BackendError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        next_scripted(&self.submit_results).unwrap_or_else(|| Ok("scan-1".to_string()))
    }

    async fn poll_result(&self, scan_id: &str) -> Result<Option<serde_json::Value>, BackendError> {
        self.poll_calls.fetch_add(1, Ordering::SeqCst);
        next_scripted(&self.poll_results).unwrap_or_else(|| Ok(Some(Self::default_result(scan_id))))
    }

    async fn wait_for_result(&self, scan_id: &str) -> Result<serde_json::Value, BackendError> {
        self.wait_calls.fetch_add(1, Ordering::SeqCst);
        next_scripted(&self.wait_results).unwrap_or_else(|| Ok(Self::default_result(scan_id)))
    }

    async fn fetch_screenshot(&self, _scan_id: &str) -> Result<Option<Vec<u8>>, BackendError> {
        self.screenshot_calls.fetch_add(1, Ordering::SeqCst);
        next_scripted(&self.screenshot_results).unwrap_or_else(|| Ok(Some(b"\x89PNG".to_vec())))
    }

    fn screenshot_url(&self, scan_id: &str) -> String {
        format!("https://urlscan.test/screenshots/{}.png", scan_id)
    }
}

// =============================================================================
// TestDependencies - Builder for test dependencies
// =============================================================================

pub struct TestDependencies {
    pub job_store: Arc<MemoryJobStore>,
    pub artifact_store: Arc<MemoryArtifactStore>,
    pub kv: Arc<MemoryKeyValueStore>,
    pub transport: Arc<RecordingTransport>,
    pub analyzer: Arc<MockAnalyzer>,
    pub scanner: Arc<MockScanner>,
    pub config: OrchestratorConfig,
}

impl TestDependencies {
    pub fn new() -> Self {
        Self {
            job_store: Arc::new(MemoryJobStore::new()),
            artifact_store: Arc::new(MemoryArtifactStore::new()),
            kv: Arc::new(MemoryKeyValueStore::new()),
            transport: Arc::new(RecordingTransport::new()),
            analyzer: Arc::new(MockAnalyzer::new()),
            scanner: Arc::new(MockScanner::new()),
            config: OrchestratorConfig::default(),
        }
    }

    /// Set a mock analyzer
    pub fn mock_analyzer(mut self, analyzer: MockAnalyzer) -> Self {
        self.analyzer = Arc::new(analyzer);
        self
    }

    /// Set a mock scanner
    pub fn mock_scanner(mut self, scanner: MockScanner) -> Self {
        self.scanner = Arc::new(scanner);
        self
    }

    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Build a kernel over the in-memory dependencies.
    ///
    /// The task receiver is handed back so tests decide when envelopes run.
    pub fn into_kernel(self) -> TestKernel {
        let (queue, tasks) = LocalTaskQueue::new();
        let kernel = Arc::new(ServerKernel::new(
            self.job_store.clone(),
            self.artifact_store.clone(),
            self.kv.clone(),
            self.transport.clone(),
            self.analyzer.clone(),
            self.scanner.clone(),
            Arc::new(queue),
            self.config,
        ));

        TestKernel {
            kernel,
            tasks,
            job_store: self.job_store,
            artifact_store: self.artifact_store,
            kv: self.kv,
            transport: self.transport,
            analyzer: self.analyzer,
            scanner: self.scanner,
        }
    }
}

impl Default for TestDependencies {
    fn default() -> Self {
        Self::new()
    }
}

/// A kernel plus typed handles to its test doubles.
pub struct TestKernel {
    pub kernel: Arc<ServerKernel>,
    pub tasks: TaskReceiver,
    pub job_store: Arc<MemoryJobStore>,
    pub artifact_store: Arc<MemoryArtifactStore>,
    pub kv: Arc<MemoryKeyValueStore>,
    pub transport: Arc<RecordingTransport>,
    pub analyzer: Arc<MockAnalyzer>,
    pub scanner: Arc<MockScanner>,
}
