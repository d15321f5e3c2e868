//! Shared HTTP retry loop for the embedding endpoint, the managed vector
//! stores, and the issue platforms.
//!
//! Retry strategy:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - Network errors and timeouts → retry
//! - Any other status → returned to the caller without retrying
//! - Backoff: base, 2×base, 4×base, ... (capped at 2^5 × base)
//! - A 429 `Retry-After` (seconds) replaces the backoff for the next
//!   attempt, up to [`MAX_RETRY_AFTER`]

use std::time::Duration;

use reqwest::{RequestBuilder, Response};
use serde_json::Value;
use tracing::debug;

use crate::error::{Result, RetrievalError};

/// Longest server-requested wait honoured before a retry.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_millis(base_delay_ms),
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay * (1u32 << (attempt.saturating_sub(1)).min(5))
    }
}

/// Build an HTTP client with a per-request timeout.
pub fn client(timeout_secs: u64) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| RetrievalError::Configuration(format!("HTTP client: {}", e)))
}

/// Send a request built by `build`, retrying transient failures.
///
/// Returns the first response whose status is not retryable (success or a
/// client error). Exhausted retries are mapped through `fail`, which picks
/// the error variant for the calling component.
pub async fn send_with_retry<F>(
    policy: &RetryPolicy,
    label: &str,
    build: F,
    fail: fn(String) -> RetrievalError,
) -> Result<Response>
where
    F: Fn() -> RequestBuilder,
{
    let mut last_err = None;
    let mut requested_wait: Option<Duration> = None;

    for attempt in 0..=policy.max_retries {
        if attempt > 0 {
            let delay = requested_wait.take().unwrap_or_else(|| policy.delay(attempt));
            debug!(label, attempt, delay_ms = delay.as_millis() as u64, "retrying request");
            tokio::time::sleep(delay).await;
        }

        match build().send().await {
            Ok(response) => {
                let status = response.status();
                if status.as_u16() == 429 || status.is_server_error() {
                    if status.as_u16() == 429 {
                        requested_wait = retry_after(response.headers());
                    }
                    let body_text = response.text().await.unwrap_or_default();
                    last_err = Some(format!("{} error {}: {}", label, status, body_text));
                    continue;
                }
                return Ok(response);
            }
            Err(e) => {
                last_err = Some(format!("{} request failed: {}", label, e));
                continue;
            }
        }
    }

    Err(fail(last_err.unwrap_or_else(|| {
        format!("{} failed after retries", label)
    })))
}

/// Wait requested by a `Retry-After: <seconds>` header, capped at
/// [`MAX_RETRY_AFTER`]. HTTP-date values are ignored.
pub fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(|secs| Duration::from_secs(secs).min(MAX_RETRY_AFTER))
}

/// Parse a successful response as JSON, or turn a failed one into an error.
pub async fn json_or_fail(
    response: Response,
    label: &str,
    fail: fn(String) -> RetrievalError,
) -> Result<Value> {
    let status = response.status();
    if !status.is_success() {
        let body_text = response.text().await.unwrap_or_default();
        return Err(fail(format!("{} error {}: {}", label, status, body_text)));
    }
    response
        .json::<Value>()
        .await
        .map_err(|e| fail(format!("{} returned invalid JSON: {}", label, e)))
}

/// Like [`json_or_fail`], but a 404 becomes `Ok(None)`.
pub async fn json_or_none(
    response: Response,
    label: &str,
    fail: fn(String) -> RetrievalError,
) -> Result<Option<Value>> {
    if response.status() == reqwest::StatusCode::NOT_FOUND {
        return Ok(None);
    }
    json_or_fail(response, label, fail).await.map(Some)
}

/// Parse an RFC 3339 timestamp, falling back to the current time.
pub fn parse_timestamp(value: Option<&Value>) -> chrono::DateTime<chrono::Utc> {
    value
        .and_then(|v| v.as_str())
        .and_then(|s| {
            chrono::DateTime::parse_from_rfc3339(s)
                .or_else(|_| chrono::DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f%z"))
                .ok()
        })
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .unwrap_or_else(chrono::Utc::now)
}
