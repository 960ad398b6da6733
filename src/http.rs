//! Shared outbound HTTP plumbing for the service adapters.
//!
//! Retry strategy (same for every adapter):
//! - HTTP 429 or 5xx → retry with exponential backoff (1s, 2s, 4s, … capped at 32s)
//! - other HTTP 4xx → fail immediately
//! - network error → retry; a timeout is reported as [`PortError::Timeout`]

use reqwest::{RequestBuilder, Response};
use std::time::Duration;
use tracing::debug;

use crate::error::PortError;

/// Build a client with a per-request timeout.
pub fn client(service: &str, timeout_secs: u64) -> Result<reqwest::Client, PortError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs.max(1)))
        .build()
        .map_err(|e| PortError::unavailable(service, format!("failed to build HTTP client: {}", e)))
}

/// Send the request built by `build`, retrying transient failures.
///
/// Returns the first successful response.
pub async fn send_with_retry<F>(
    service: &str,
    max_retries: u32,
    build: F,
) -> Result<Response, PortError>
where
    F: Fn() -> RequestBuilder,
{
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            debug!(service, attempt, ?delay, "retrying request");
            tokio::time::sleep(delay).await;
        }

        match build().send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Ok(response);
                }
                let body = response.text().await.unwrap_or_default();
                let err = PortError::from_status(service, status, &body);
                if status.as_u16() == 429 || status.is_server_error() {
                    last_err = Some(err);
                    continue;
                }
                return Err(err);
            }
            Err(e) => {
                last_err = Some(PortError::from_reqwest(service, &e));
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| PortError::unavailable(service, "request failed after retries")))
}

/// Decode a JSON body, mapping failures to [`PortError::Malformed`].
pub async fn json_body(service: &str, response: Response) -> Result<serde_json::Value, PortError> {
    let text = response
        .text()
        .await
        .map_err(|e| PortError::from_reqwest(service, &e))?;
    serde_json::from_str(&text)
        .map_err(|e| PortError::malformed(service, format!("invalid JSON: {}", e)))
}
