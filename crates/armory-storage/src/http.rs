//! Single-attempt HTTP fetches and the backoff policy callers retry with.

use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

#[derive(Debug, Error)]
pub enum FetchError {
    /// Built with the URL stripped; see `HttpFetcher::fetch_bytes`.
    #[error("request failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("{url} answered {status}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed metadata response: {0}")]
    Malformed(String),
    #[error("missing access credential: {0}")]
    MissingCredential(&'static str),
    #[error("unparseable modification time {value:?}: {reason}")]
    Timestamp { value: String, reason: String },
}

impl FetchError {
    /// Transport hiccups, throttling and server errors. Everything else fails the run.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Request(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(|s| s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS)
                .unwrap_or(false),
            FetchError::Malformed(_)
            | FetchError::MissingCredential(_)
            | FetchError::Timestamp { .. } => false,
        }
    }
}

/// Capped exponential backoff: `base * 2^attempt`, never above `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        u32::try_from(attempt)
            .ok()
            .and_then(|exp| 2u32.checked_pow(exp))
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

/// Drop the query string so API keys stay out of logs and error messages.
pub fn redact_url(url: &str) -> &str {
    url.split_once('?').map_or(url, |(base, _)| base)
}

/// Shared reqwest client. One attempt per call; retry policy belongs to the caller.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(agent) = config.user_agent {
            builder = builder.user_agent(agent);
        }
        Ok(Self {
            client: builder.build().context("building http client")?,
        })
    }

    /// GET `url` and return the body of a 2xx response.
    pub async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let span = info_span!("http_fetch", url = redact_url(url));
        async {
            let response = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|err| FetchError::Request(err.without_url()))?;
            let status = response.status();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: redact_url(response.url().as_str()).to_string(),
                });
            }
            let body = response
                .bytes()
                .await
                .map_err(|err| FetchError::Request(err.without_url()))?;
            debug!(status = status.as_u16(), bytes = body.len(), "fetched");
            Ok(body.to_vec())
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_backoff_doubles_until_the_cap() {
        let policy = BackoffPolicy::default();
        let delays: Vec<u64> = (0..7)
            .map(|n| policy.delay_for_attempt(n).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![500, 1_000, 2_000, 4_000, 8_000, 10_000, 10_000]);
        assert_eq!(policy.delay_for_attempt(usize::MAX), policy.max_delay);
        assert_eq!(BackoffPolicy::none().max_retries, 0);
    }

    #[test]
    fn throttling_and_server_errors_are_retryable() {
        let status = |status| FetchError::HttpStatus {
            status,
            url: "https://www.googleapis.com/drive/v3/files/x".into(),
        };
        assert!(status(429).is_retryable());
        assert!(status(502).is_retryable());
        assert!(!status(403).is_retryable());
        assert!(!status(404).is_retryable());
        assert!(!FetchError::MissingCredential("drive api key").is_retryable());
        assert!(!FetchError::Malformed("missing modifiedTime".into()).is_retryable());
    }

    #[tokio::test]
    async fn transport_errors_do_not_carry_the_api_key() {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(2),
            user_agent: None,
        })
        .unwrap();
        let err = fetcher
            .fetch_bytes("http://127.0.0.1:9/drive/v3/files/x?fields=modifiedTime&key=SECRET123")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Request(_)));
        let rendered = format!("{err} {err:?}");
        assert!(!rendered.contains("SECRET123"), "{rendered}");
        assert!(err.is_retryable());
    }

    #[test]
    fn redaction_hides_api_key() {
        assert_eq!(
            redact_url("https://www.googleapis.com/drive/v3/files/x?fields=modifiedTime&key=secret"),
            "https://www.googleapis.com/drive/v3/files/x"
        );
        assert_eq!(redact_url("https://drive.test/dl"), "https://drive.test/dl");
    }
}
