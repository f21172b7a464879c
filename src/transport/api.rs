use super::PrinterTransport;
use crate::config::TransportKind;
use crate::errors::{ConnectionError, SendError};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Cloud or vendor print endpoint reached over HTTP.
///
/// `connect` checks `GET {endpoint}/status`; `send` posts the raw bytes to
/// `{endpoint}/print` as `application/octet-stream`.
pub struct ApiTransport {
    endpoint: String,
    credential: Option<String>,
    client: Client,
    connected: bool,
    last_status: String,
}

impl ApiTransport {
    pub fn new(endpoint_url: &str, credential: Option<String>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            endpoint: endpoint_url.trim_end_matches('/').to_string(),
            credential,
            client,
            connected: false,
            last_status: "api: disconnected".to_string(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let request = self
            .client
            .request(method, format!("{}{}", self.endpoint, path));
        match &self.credential {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl PrinterTransport for ApiTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Api
    }

    #[tracing::instrument(skip(self), fields(endpoint = %self.endpoint))]
    async fn connect(&mut self) -> Result<(), ConnectionError> {
        if self.connected {
            return Ok(());
        }

        let result = self.request(reqwest::Method::GET, "/status").send().await;

        let outcome = match result {
            Ok(response) => match response.status() {
                s if s.is_success() => Ok(()),
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(
                    ConnectionError::PermissionDenied(format!("print API rejected credentials ({})", response.status())),
                ),
                s => Err(ConnectionError::Unavailable(format!("print API answered {}", s))),
            },
            Err(e) if e.is_timeout() => Err(ConnectionError::Timeout(format!(
                "print API {} did not answer: {}",
                self.endpoint, e
            ))),
            Err(e) => Err(ConnectionError::Unavailable(format!(
                "print API {} unreachable: {}",
                self.endpoint, e
            ))),
        };

        match &outcome {
            Ok(()) => {
                info!("Print API {} reachable", self.endpoint);
                self.connected = true;
                self.last_status = "api: connected".to_string();
            }
            Err(e) => {
                warn!("Print API connect failed: {}", e);
                self.last_status = format!("api: {}", e);
            }
        }
        outcome
    }

    async fn disconnect(&mut self) {
        // Stateless transport: nothing held beyond the pooled client
        if self.connected {
            self.connected = false;
            self.last_status = "api: disconnected".to_string();
        }
    }

    #[tracing::instrument(skip(self, data), fields(endpoint = %self.endpoint, bytes = data.len()))]
    async fn send(&mut self, data: &[u8]) -> Result<(), SendError> {
        if !self.connected {
            return Err(SendError::NotConnected);
        }

        let response = self
            .request(reqwest::Method::POST, "/print")
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(data.to_vec())
            .send()
            .await
            .map_err(|e| {
                self.last_status = "api: request failed".to_string();
                SendError::TransportFailure(format!("print API request failed: {}", e))
            })?;

        let status = response.status();
        if status.is_success() {
            debug!("Print API accepted {} bytes", data.len());
            self.last_status = "api: connected".to_string();
            return Ok(());
        }

        let detail = response.text().await.unwrap_or_default();
        self.last_status = format!("api: print rejected ({})", status);

        match status {
            StatusCode::PAYLOAD_TOO_LARGE => Err(SendError::PayloadTooLarge {
                size: data.len(),
                limit: parse_limit(&detail).unwrap_or(0),
            }),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                self.connected = false;
                Err(SendError::NotConnected)
            }
            s => Err(SendError::TransportFailure(format!(
                "print API answered {}: {}",
                s,
                detail.trim()
            ))),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn status(&self) -> String {
        self.last_status.clone()
    }
}

/// Pull `{"limit": N}` out of a 413 body when the endpoint provides one.
fn parse_limit(body: &str) -> Option<usize> {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()?
        .get("limit")?
        .as_u64()
        .map(|n| n as usize)
}
