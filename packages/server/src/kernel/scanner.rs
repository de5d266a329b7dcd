//! urlscan.io-backed [`Scanner`].

use async_trait::async_trait;
use urlscan_client::{PollOptions, UrlscanClient, UrlscanError};

use super::jobs::BackendError;
use super::traits::Scanner;

/// Which call produced an error; the same status means different things.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Call {
    Submit,
    Poll,
    Screenshot,
}

fn backend_error(call: Call, e: UrlscanError) -> BackendError {
    match e {
        UrlscanError::Http(e) => BackendError::from(e),
        UrlscanError::Gone { scan_id } => BackendError::Gone(scan_id),
        UrlscanError::Timeout { scan_id } => {
            BackendError::Timeout(format!("scan {} did not finish in time", scan_id))
        }
        // Anything but 410 while polling is worth another try
        UrlscanError::Api { status, message } if call == Call::Poll && status != 410 => {
            BackendError::Upstream { status, message }
        }
        UrlscanError::Api { status, message } => BackendError::from_status(status, message),
        UrlscanError::MissingScanId => BackendError::Malformed("submit response has no scan id".into()),
        UrlscanError::Decode(e) => BackendError::Malformed(e.to_string()),
    }
}

pub struct UrlscanScanner {
    client: UrlscanClient,
    poll: PollOptions,
}

impl UrlscanScanner {
    pub fn new(client: UrlscanClient) -> Self {
        Self {
            client,
            poll: PollOptions::default(),
        }
    }
}

#[async_trait]
impl Scanner for UrlscanScanner {
    async fn submit_scan(&self, url: &str) -> Result<String, BackendError> {
        self.client
            .submit(url)
            .await
            .map_err(|e| backend_error(Call::Submit, e))
    }

    async fn poll_result(&self, scan_id: &str) -> Result<Option<serde_json::Value>, BackendError> {
        self.client
            .result(scan_id)
            .await
            .map(|r| r.map(|r| r.0))
            .map_err(|e| backend_error(Call::Poll, e))
    }

    async fn wait_for_result(&self, scan_id: &str) -> Result<serde_json::Value, BackendError> {
        self.client
            .wait_for_result(scan_id, self.poll)
            .await
            .map(|r| r.0)
            .map_err(|e| backend_error(Call::Poll, e))
    }

    async fn fetch_screenshot(&self, scan_id: &str) -> Result<Option<Vec<u8>>, BackendError> {
        self.client
            .screenshot(scan_id)
            .await
            .map_err(|e| backend_error(Call::Screenshot, e))
    }

    fn screenshot_url(&self, scan_id: &str) -> String {
        self.client.screenshot_url(scan_id)
    }
}
