use crate::errors::RelayError;
use crate::relay::server::ErrorResponse;
use crate::relay::wire::{DiscoveryRequest, DiscoveryResponse, RelayRequest, RelayResponse, StatusResponse};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

/// HTTP client for the Bridge Relay Service. Cheap to clone; clones share
/// one connection pool.
#[derive(Clone)]
pub struct RelayClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl RelayClient {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Send one payload through the relay. A rejected exchange comes back as
    /// the relay's typed error.
    pub async fn relay(&self, request: &RelayRequest) -> Result<RelayResponse, RelayError> {
        debug!(
            "Relaying {} bytes to {}:{} via {}",
            request.payload.len(),
            request.host,
            request.port,
            self.base_url
        );

        let response = self
            .authorize(self.client.post(self.url("/api/relay")))
            .json(request)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        let body = response.bytes().await.map_err(map_transport_error)?;

        match serde_json::from_slice::<RelayResponse>(&body) {
            Ok(parsed) => parsed.into_result(),
            Err(_) => Err(error_from_body(status, &body)),
        }
    }

    pub async fn discover(&self, request: &DiscoveryRequest) -> Result<DiscoveryResponse, RelayError> {
        let response = self
            .authorize(self.client.post(self.url("/api/discover")))
            .json(request)
            .send()
            .await
            .map_err(map_transport_error)?;

        parse_json(response).await
    }

    pub async fn status(&self) -> Result<StatusResponse, RelayError> {
        let response = self
            .authorize(self.client.get(self.url("/api/status")))
            .send()
            .await
            .map_err(map_transport_error)?;

        parse_json(response).await
    }
}

async fn parse_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, RelayError> {
    let status = response.status();
    let body = response.bytes().await.map_err(map_transport_error)?;

    if !status.is_success() {
        return Err(error_from_body(status, &body));
    }

    serde_json::from_slice(&body)
        .map_err(|e| RelayError::Internal(format!("malformed relay response: {}", e)))
}

fn error_from_body(status: StatusCode, body: &[u8]) -> RelayError {
    if status == StatusCode::UNAUTHORIZED {
        return RelayError::InvalidRequest("relay rejected the bearer token".to_string());
    }

    if let Ok(error) = serde_json::from_slice::<ErrorResponse>(body) {
        return RelayError::from_wire(&error.kind, &error.error);
    }

    let text = String::from_utf8_lossy(body).trim().to_string();
    match status {
        s if s.is_client_error() => RelayError::InvalidRequest(format!("{}: {}", s, text)),
        StatusCode::SERVICE_UNAVAILABLE => RelayError::Busy(text),
        s => RelayError::Internal(format!("relay answered {}: {}", s, text)),
    }
}

/// Only a failed connection (or a request that never reached the relay)
/// means the relay is gone. A timeout means it is alive but slow, which is
/// reported as a send failure rather than a lost printer.
fn map_transport_error(e: reqwest::Error) -> RelayError {
    if e.is_timeout() {
        RelayError::RelayTimeout(e.to_string())
    } else if e.is_connect() || e.is_request() {
        RelayError::RelayUnreachable(e.to_string())
    } else {
        RelayError::Internal(format!("relay exchange failed: {}", e))
    }
}

/// True when the error describes the relay being gone rather than the
/// destination printer.
pub fn is_relay_unreachable(error: &RelayError) -> bool {
    matches!(error, RelayError::RelayUnreachable(_))
}
