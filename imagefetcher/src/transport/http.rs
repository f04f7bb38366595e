//! HTTP transport backed by `reqwest`.

use std::time::Duration;

use tracing::{debug, trace};

use super::{Downloaded, Transport};
use crate::error::TransportError;

/// Default request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default User-Agent string. Some image hosts reject requests without one.
const DEFAULT_USER_AGENT: &str = concat!("imagefetcher/", env!("CARGO_PKG_VERSION"));

/// Async HTTP transport.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Creates a transport with the default 30 second timeout.
    pub fn new() -> Result<Self, TransportError> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    /// Creates a transport with a custom request timeout.
    pub fn with_timeout(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(DEFAULT_USER_AGENT)
            .build()
            .map_err(|e| TransportError::Request(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    /// Wraps an existing client.
    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Transport for HttpTransport {
    async fn download(&self, url: &str) -> Result<Downloaded, TransportError> {
        trace!(url = url, "HTTP GET");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            debug!(url = url, status = status.as_u16(), "HTTP request rejected");
            return Err(TransportError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;

        trace!(url = url, bytes = bytes.len(), "HTTP GET complete");
        Ok(Downloaded::fetched(bytes))
    }

    fn name(&self) -> &str {
        "http"
    }
}
