//! Shared HTTP plumbing: client construction and error mapping.

use std::time::Duration;

use marquee_core::error::AppError;
use reqwest::{Client, Response, StatusCode};
use url::Url;

pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Identifies the engine to upstream APIs (Wikipedia requires a descriptive agent).
pub(crate) const USER_AGENT: &str = concat!(
    "Marquee/",
    env!("CARGO_PKG_VERSION"),
    " (media metadata lookup)"
);

pub(crate) fn build_client(timeout: Duration, user_agent: &str) -> Result<Client, AppError> {
    Client::builder()
        .user_agent(user_agent)
        .timeout(timeout)
        .build()
        .map_err(|e| AppError::HttpError(e.to_string()))
}

/// Validate a base URL override and strip any trailing slash.
pub(crate) fn normalize_base_url(base_url: &str) -> Result<String, AppError> {
    let parsed = Url::parse(base_url)
        .map_err(|e| AppError::ConfigError(format!("Invalid base URL '{base_url}': {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(base_url.trim_end_matches('/').to_string()),
        scheme => Err(AppError::ConfigError(format!(
            "Base URL scheme '{scheme}' is not allowed (only http/https)"
        ))),
    }
}

/// Map a transport failure into the error taxonomy.
pub(crate) fn map_send_error(e: reqwest::Error, timeout_secs: u64) -> AppError {
    if e.is_timeout() {
        AppError::Timeout(timeout_secs)
    } else if e.is_connect() {
        AppError::NetworkError(format!("Connection failed: {e}"))
    } else {
        AppError::HttpError(e.to_string())
    }
}

/// Turn a non-success response into an error; success passes through.
pub(crate) async fn check_status(provider: &str, response: Response) -> Result<Response, AppError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(status_error(provider, status, &body))
}

pub(crate) fn status_error(provider: &str, status: StatusCode, body: &str) -> AppError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => AppError::RateLimitExceeded,
        StatusCode::NOT_FOUND => AppError::NotFound(format!("{provider}: {}", truncate(body, 200))),
        _ => {
            let status_code = status.as_u16();
            AppError::ProviderError {
                provider: provider.to_string(),
                message: if body.trim().is_empty() {
                    status.canonical_reason().unwrap_or("request failed").to_string()
                } else {
                    truncate(body, 200).to_string()
                },
                status_code,
                retryable: status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT,
            }
        }
    }
}

pub(crate) fn decode_error(provider: &str, e: reqwest::Error, timeout_secs: u64) -> AppError {
    if e.is_timeout() {
        AppError::Timeout(timeout_secs)
    } else {
        AppError::SerializationError(format!("Failed to parse {provider} response: {e}"))
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}
