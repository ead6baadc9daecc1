//! Supervisor-side metadata discovery: fetch a worker's `/metadata` with
//! the standard retry budget and validate the shape before anything else
//! sees it.

use std::time::Duration;

use plugin_api::metadata::{PluginMetadata, validate_metadata};
use thiserror::Error;

use crate::fetch::{FetchError, RetryPolicy, get_json_with_retry};

/// The discovery budget: 3 attempts, 5 s each, 1 s / 2 s between them.
pub const METADATA_POLICY: RetryPolicy = RetryPolicy {
    attempts: 3,
    attempt_timeout: Duration::from_secs(5),
    backoff_base: Duration::from_secs(1),
};

#[derive(Error, Debug, Clone, PartialEq)]
#[error("metadata discovery failed after {attempts} attempts: {last}")]
pub struct MetadataFetchError {
    pub attempts: u32,
    pub last: FetchError,
}

/// Fetch and validate a worker's manifest. A manifest that fails
/// validation counts as a failed attempt (the worker may self-correct);
/// whatever failed last is what gets reported.
pub async fn fetch_metadata(
    client: &reqwest::Client,
    worker_address: &str,
    policy: RetryPolicy,
) -> Result<PluginMetadata, MetadataFetchError> {
    let url = format!("{}/metadata", worker_address.trim_end_matches('/'));
    get_json_with_retry(client, &url, policy, |body| {
        validate_metadata(&body).map_err(|violation| FetchError::Rejected(violation.to_string()))
    })
    .await
    .map_err(|last| MetadataFetchError { attempts: policy.attempts, last })
}
