//! HTTP plumbing shared by the adapters

use agent_core::{AgentError, Result};
use reqwest::header::HeaderMap;
use serde_json::Value;
use std::time::Duration;

/// Build a client with the given request timeout
pub fn client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| AgentError::Config(format!("Failed to build HTTP client: {e}")))
}

/// POST a JSON body and return the response once the status is a success
pub async fn post_json(
    client: &reqwest::Client,
    url: &str,
    headers: HeaderMap,
    body: &Value,
) -> Result<reqwest::Response> {
    let response = client
        .post(url)
        .headers(headers)
        .json(body)
        .send()
        .await
        .map_err(map_transport)?;

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(map_status(status.as_u16(), message))
}

/// Classify a reqwest failure before any response arrived
pub fn map_transport(e: reqwest::Error) -> AgentError {
    if e.is_timeout() || e.is_connect() {
        AgentError::ProviderUnavailable(e.to_string())
    } else {
        AgentError::Provider(e.to_string())
    }
}

/// Classify a non-success status
pub fn map_status(status: u16, message: String) -> AgentError {
    match status {
        401 | 403 => AgentError::Auth(message),
        429 => AgentError::RateLimited(message),
        _ => AgentError::Http { status, message },
    }
}
