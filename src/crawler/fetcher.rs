//! Upstream HTTP client
//!
//! This module handles all HTTP requests to the index service, including:
//! - Building the HTTP client with the configured user agent and timeouts
//! - Sending the leased credential as the session cookie
//! - Classifying the service's JSON status codes
//! - Fetching the per-response decryption key

use crate::config::UpstreamConfig;
use crate::credential::Lease;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, COOKIE, REFERER};
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Status the service returns when a session is sending too many requests
pub const STATUS_REQUEST_BLOCKED: i64 = 10001;

/// Status the service returns when a session is no longer logged in
pub const STATUS_NOT_LOGGED_IN: i64 = 10000;

/// Path of the decryption key endpoint
pub const CIPHER_KEY_PATH: &str = "/Interface/ptbk";

/// Errors from one upstream request
#[derive(Debug, Error)]
pub enum FetchError {
    /// The service refused the session; the credential must be reported
    #[error("Upstream rejected the session (permanent: {permanent}): {message}")]
    Rejected { permanent: bool, message: String },

    /// Network failure, timeout, non-2xx status or an unexpected status code
    #[error("Transient upstream error: {0}")]
    Transient(String),

    /// The response did not have the expected shape
    #[error("Malformed upstream response: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Malformed(e.to_string())
        } else {
            Self::Transient(e.to_string())
        }
    }
}

/// Builds an HTTP client with proper configuration
///
/// # Arguments
///
/// * `config` - The upstream configuration
///
/// # Returns
///
/// * `Ok(Client)` - Successfully built HTTP client
/// * `Err(reqwest::Error)` - Failed to build client
pub fn build_http_client(config: &UpstreamConfig) -> Result<Client, reqwest::Error> {
    let mut headers = HeaderMap::new();
    headers.insert(
        ACCEPT,
        HeaderValue::from_static("application/json, text/plain, */*"),
    );
    if let Ok(referer) = HeaderValue::from_str(&config.base_url) {
        headers.insert(REFERER, referer);
    }

    Client::builder()
        .user_agent(config.user_agent.clone())
        .default_headers(headers)
        .timeout(Duration::from_secs(config.timeout_secs))
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .gzip(true)
        .brotli(true)
        .build()
}

/// Maps the service's in-body status code to an outcome
///
/// A missing status counts as success.
pub fn classify_status(body: &Value) -> Result<(), FetchError> {
    let status = body.get("status").and_then(Value::as_i64).unwrap_or(0);
    let message = || {
        body.get("message")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string()
    };

    match status {
        0 => Ok(()),
        STATUS_REQUEST_BLOCKED => Err(FetchError::Rejected {
            permanent: false,
            message: message(),
        }),
        STATUS_NOT_LOGGED_IN => Err(FetchError::Rejected {
            permanent: true,
            message: message(),
        }),
        other => Err(FetchError::Transient(format!(
            "upstream status {}: {}",
            other,
            message()
        ))),
    }
}

/// Client for the index service shared by all capabilities
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    client: Client,
    base_url: String,
}

impl UpstreamClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self, FetchError> {
        let client = build_http_client(config)
            .map_err(|e| FetchError::Transient(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Sends an authenticated GET and returns the status-checked JSON body
    pub async fn get_json(
        &self,
        path: &str,
        query: &[(&str, String)],
        lease: &Lease,
    ) -> Result<Value, FetchError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .query(query)
            .header(COOKIE, lease.cookie_header())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Transient(format!("HTTP {} from {}", status, path)));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| FetchError::Malformed(format!("{} returned invalid JSON: {}", path, e)))?;

        classify_status(&body)?;
        Ok(body)
    }

    /// Fetches the decryption key for a response identified by `uniqid`
    ///
    /// Returns `None` if the service answered without a key.
    pub async fn fetch_cipher_key(
        &self,
        uniqid: &str,
        lease: &Lease,
    ) -> Result<Option<String>, FetchError> {
        let body = self
            .get_json(CIPHER_KEY_PATH, &[("uniqid", uniqid.to_string())], lease)
            .await?;

        Ok(body
            .get("data")
            .and_then(Value::as_str)
            .filter(|key| !key.is_empty())
            .map(str::to_string))
    }
}
