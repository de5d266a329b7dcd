use thiserror::Error;

pub type Result<T> = std::result::Result<T, UrlscanError>;

#[derive(Debug, Error)]
pub enum UrlscanError {
    /// Transport failure (connect, timeout, body read)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-2xx response from the API
    #[error("urlscan API error (status={status}): {message}")]
    Api { status: u16, message: String },

    /// The result was deleted upstream and will never become available
    #[error("urlscan result deleted (410) for scan {scan_id}")]
    Gone { scan_id: String },

    /// Polling deadline passed before the result was ready
    #[error("timed out waiting for urlscan result {scan_id}")]
    Timeout { scan_id: String },

    /// Submit response carried no scan id
    #[error("urlscan submit response has no scan id")]
    MissingScanId,

    #[error("failed to decode urlscan response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl UrlscanError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            UrlscanError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            UrlscanError::Api { status, .. } => *status == 429 || *status >= 500,
            UrlscanError::Timeout { .. } => true,
            UrlscanError::Gone { .. } | UrlscanError::MissingScanId | UrlscanError::Decode(_) => {
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_and_rate_limits_are_transient() {
        let rate_limited = UrlscanError::Api {
            status: 429,
            message: String::new(),
        };
        let upstream = UrlscanError::Api {
            status: 503,
            message: String::new(),
        };
        assert!(rate_limited.is_transient());
        assert!(upstream.is_transient());
    }

    #[test]
    fn client_errors_and_gone_are_fatal() {
        let bad_request = UrlscanError::Api {
            status: 400,
            message: "invalid url".into(),
        };
        let gone = UrlscanError::Gone {
            scan_id: "abc".into(),
        };
        assert!(!bad_request.is_transient());
        assert!(!gone.is_transient());
        assert!(!UrlscanError::MissingScanId.is_transient());
    }

    #[test]
    fn poll_timeout_is_transient() {
        assert!(UrlscanError::Timeout {
            scan_id: "abc".into()
        }
        .is_transient());
    }
}
