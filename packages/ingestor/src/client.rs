//! Remote Parse Client
//!
//! Sends transaction SMS to the parsing service over HTTP and decodes its
//! verdict. Transport failures are reported separately from protocol
//! failures so the worker can decide what is worth retrying.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

use crate::message::{ParseRequest, ParseResponse};

/// Default service base URL (host loopback as seen from an emulator)
pub const DEFAULT_BASE_URL: &str = "http://10.0.2.2:8080";

/// Parse endpoint path
pub const PARSE_ENDPOINT: &str = "/api/v1/transactions/parse";

/// Connect timeout in milliseconds
pub const CONNECT_TIMEOUT_MS: u64 = 15_000;

/// Read timeout in milliseconds
pub const READ_TIMEOUT_MS: u64 = 20_000;

/// Write timeout in milliseconds
pub const WRITE_TIMEOUT_MS: u64 = 20_000;

/// Errors that can occur while calling the parsing service
#[derive(Error, Debug)]
pub enum ClientError {
    /// Connect failure, timeout, or broken transport. Worth retrying.
    #[error("Network error: {0}")]
    Network(String),

    /// The service answered but not with a usable success. Not retried.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Non-retryable failures of the wire contract
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Undecodable response body: {0}")]
    Decode(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ClientError {
    /// Only transport-level failures are retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Network(_))
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if is_transport_failure(&err) {
            ClientError::Network(err.to_string())
        } else if err.is_builder() || err.is_redirect() {
            ClientError::Protocol(ProtocolError::InvalidRequest(err.to_string()))
        } else if err.is_status() || err.is_decode() {
            ClientError::Protocol(ProtocolError::Decode(err.to_string()))
        } else {
            ClientError::Network(err.to_string())
        }
    }
}

/// Whether a reqwest error came from the connection rather than the payload
///
/// A body cut short or stalled mid-read is reported by reqwest as a decode
/// error wrapping the underlying I/O failure, so the source chain is checked
/// as well as the error kind.
fn is_transport_failure(err: &reqwest::Error) -> bool {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        return true;
    }
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        if cause.is::<std::io::Error>() {
            return true;
        }
        source = cause.source();
    }
    false
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Protocol(ProtocolError::Decode(err.to_string()))
    }
}

/// Configuration for the parse client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Service base URL without trailing slash
    pub base_url: String,
    /// Endpoint path appended to the base URL
    pub endpoint: String,
    /// Connection establishment timeout
    pub connect_timeout: Duration,
    /// Time allowed to read the response
    pub read_timeout: Duration,
    /// Time allowed to send the request
    pub write_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            endpoint: PARSE_ENDPOINT.to_string(),
            connect_timeout: Duration::from_millis(CONNECT_TIMEOUT_MS),
            read_timeout: Duration::from_millis(READ_TIMEOUT_MS),
            write_timeout: Duration::from_millis(WRITE_TIMEOUT_MS),
        }
    }
}

impl ClientConfig {
    /// Create a config pointing at the given base URL
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    /// Full URL of the parse endpoint
    pub fn parse_url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), self.endpoint)
    }

    /// Upper bound on one request once connected
    ///
    /// reqwest has a single whole-request deadline, so the write and read
    /// budgets are summed into it.
    pub fn request_timeout(&self) -> Duration {
        self.read_timeout + self.write_timeout
    }
}

/// One parse attempt against the remote service
///
/// The worker is generic over this seam so tests can stand in a fake service.
pub trait ParseService: Send + Sync {
    fn parse(
        &self,
        request: &ParseRequest,
    ) -> impl Future<Output = Result<ParseResponse, ClientError>> + Send;
}

/// HTTP client for the parse endpoint
pub struct ParseClient {
    client: reqwest::Client,
    url: String,
}

impl ParseClient {
    /// Build a client with the configured timeouts
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ClientError::Protocol(ProtocolError::InvalidRequest(e.to_string())))?;

        Ok(Self {
            client,
            url: config.parse_url(),
        })
    }

    /// Get the endpoint URL
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Parse a single message
    pub async fn parse_message(
        &self,
        body: &str,
        sender: &str,
        timestamp_millis: i64,
    ) -> Result<ParseResponse, ClientError> {
        self.send(&ParseRequest::new(body, sender, timestamp_millis)).await
    }

    async fn send(&self, request: &ParseRequest) -> Result<ParseResponse, ClientError> {
        info!(url = %self.url, sender = %request.sender, "sending parse request");

        let resp = self.client.post(&self.url).json(request).send().await?;
        let status = resp.status();
        debug!(status = status.as_u16(), "parse response status");

        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProtocolError::Status {
                status: status.as_u16(),
                body,
            }
            .into());
        }

        // the status line arrived, so a failure reading the body is the connection's
        let text = resp
            .text()
            .await
            .map_err(|e| ClientError::Network(format!("reading response body: {}", e)))?;
        decode_response(&text)
    }
}

impl ParseService for ParseClient {
    async fn parse(&self, request: &ParseRequest) -> Result<ParseResponse, ClientError> {
        self.send(request).await
    }
}

/// Decode a success body, which must be a JSON object
pub fn decode_response(text: &str) -> Result<ParseResponse, ClientError> {
    Ok(ParseResponse::from_json(text)?)
}
