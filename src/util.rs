use std::time::Duration;

use reqwest_middleware::ClientWithMiddleware;
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::de::DeserializeOwned;

#[derive(Clone)]
pub struct HttpClient {
    pub client: ClientWithMiddleware,
}

#[derive(thiserror::Error, Debug)]
pub enum HttpError {
    #[error("reqwest error: {0}")]
    ReqwestError(#[from] reqwest::Error),
    #[error("reqwest middleware error: {0}")]
    ReqwestMiddlewareError(#[from] reqwest_middleware::Error),
    #[error("unexpected status {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
}

impl HttpError {
    pub fn is_timeout(&self) -> bool {
        match self {
            HttpError::ReqwestError(e) => e.is_timeout(),
            HttpError::ReqwestMiddlewareError(reqwest_middleware::Error::Reqwest(e)) => {
                e.is_timeout()
            }
            _ => false,
        }
    }

    pub fn status(&self) -> Option<reqwest::StatusCode> {
        match self {
            HttpError::Status { status, .. } => Some(*status),
            HttpError::ReqwestError(e) => e.status(),
            _ => None,
        }
    }
}

impl HttpClient {
    /// Client for idempotent queries; transient failures are retried with
    /// exponential backoff.
    pub fn new(timeout: Duration) -> reqwest::Result<HttpClient> {
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);

        let client = reqwest::Client::builder().timeout(timeout).build()?;

        let client = reqwest_middleware::ClientBuilder::new(client)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(HttpClient { client })
    }

    /// Client for commands and webhooks. A request is sent at most once.
    pub fn without_retries(timeout: Duration) -> reqwest::Result<HttpClient> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let client = reqwest_middleware::ClientBuilder::new(client).build();

        Ok(HttpClient { client })
    }
}

/// Turns a non-2xx response into [`HttpError::Status`], keeping the body for
/// diagnostics.
pub async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, HttpError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let body = resp.text().await.unwrap_or_default();
    Err(HttpError::Status { status, body })
}

pub async fn read_json<T>(resp: reqwest::Response) -> Result<T, HttpError>
where
    T: DeserializeOwned,
{
    check_status(resp)
        .await?
        .json::<T>()
        .await
        .map_err(|e| e.into())
}

pub fn format_duration(duration: Duration) -> String {
    let mut secs = duration.as_secs();
    let hours = secs / 3600;
    secs %= 3600;
    let minutes = secs / 60;
    secs %= 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, secs)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}
