//! The single retrying-fetch primitive every worker-facing HTTP caller in
//! the supervisor goes through: explicit attempt count, per-attempt
//! timeout, linear backoff. Readiness polling, metadata fetch and health
//! probes all reuse it rather than growing their own retry loops.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    #[error("request timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },
    #[error("network error: {0}")]
    Network(String),
    #[error("unexpected status {status}: {detail}")]
    Status { status: u16, detail: String },
    #[error("response body is not valid JSON: {0}")]
    InvalidJson(String),
    /// The body arrived intact but the caller's acceptance check refused it.
    #[error("{0}")]
    Rejected(String),
}

/// Retry schedule: `attempts` tries, each bounded by `attempt_timeout`,
/// with a `backoff_base * n` sleep after the n-th failure.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub attempt_timeout: Duration,
    pub backoff_base: Duration,
}

impl RetryPolicy {
    pub fn single(attempt_timeout: Duration) -> Self {
        RetryPolicy { attempts: 1, attempt_timeout, backoff_base: Duration::ZERO }
    }
}

async fn get_json_once(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
) -> Result<Value, FetchError> {
    // The per-request timeout cancels the in-flight request on expiry.
    let response = client.get(url).timeout(timeout).send().await.map_err(|e| {
        if e.is_timeout() {
            FetchError::Timeout { timeout_ms: timeout.as_millis() as u64 }
        } else {
            FetchError::Network(e.to_string())
        }
    })?;
    let status = response.status();
    if !status.is_success() {
        let detail = response.text().await.unwrap_or_default();
        return Err(FetchError::Status { status: status.as_u16(), detail });
    }
    response
        .json()
        .await
        .map_err(|e| FetchError::InvalidJson(e.to_string()))
}

/// GET `url` until `accept` takes the body or the attempt budget runs out.
/// A rejection by `accept` consumes an attempt like any network failure;
/// after the last attempt the most recent error is surfaced.
pub async fn get_json_with_retry<T>(
    client: &reqwest::Client,
    url: &str,
    policy: RetryPolicy,
    accept: impl Fn(Value) -> Result<T, FetchError>,
) -> Result<T, FetchError> {
    let mut last_error = FetchError::Network("no attempts were made".to_string());
    for attempt in 1..=policy.attempts.max(1) {
        if attempt > 1 {
            tokio::time::sleep(policy.backoff_base * (attempt - 1)).await;
        }
        match get_json_once(client, url, policy.attempt_timeout).await {
            Ok(body) => match accept(body) {
                Ok(value) => return Ok(value),
                Err(e) => {
                    debug!(url, attempt, error = %e, "response rejected");
                    last_error = e;
                }
            },
            Err(e) => {
                debug!(url, attempt, error = %e, "fetch attempt failed");
                last_error = e;
            }
        }
    }
    Err(last_error)
}

/// Single bounded GET that only cares about reachability and a 2xx.
pub async fn probe(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
) -> Result<(), FetchError> {
    get_json_once(client, url, timeout).await.map(|_| ())
}
