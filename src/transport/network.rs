use super::PrinterTransport;
use crate::config::TransportKind;
use crate::errors::{ConnectionError, RelayError, SendError};
use crate::relay::client::{is_relay_unreachable, RelayClient};
use crate::relay::wire::RelayRequest;
use async_trait::async_trait;
use tracing::{debug, info, warn};

/// Raw-port printer reached through the Bridge Relay Service. Opens no
/// socket itself; "connected" means the relay answered.
pub struct NetworkTransport {
    host: String,
    port: u16,
    relay: RelayClient,
    connected: bool,
    max_payload: Option<usize>,
    last_status: String,
}

impl NetworkTransport {
    pub fn new(host: &str, port: u16, relay: RelayClient) -> Self {
        Self {
            host: host.trim().to_string(),
            port,
            relay,
            connected: false,
            max_payload: None,
            last_status: "network: disconnected".to_string(),
        }
    }

    /// Client-side payload cap, checked before anything is sent to the relay.
    pub fn with_max_payload(mut self, limit: usize) -> Self {
        self.max_payload = Some(limit);
        self
    }

    fn destination(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[async_trait]
impl PrinterTransport for NetworkTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Network
    }

    #[tracing::instrument(skip(self), fields(destination = %self.destination()))]
    async fn connect(&mut self) -> Result<(), ConnectionError> {
        if self.connected {
            return Ok(());
        }

        match self.relay.status().await {
            Ok(status) => {
                info!(
                    "Relay {} reachable (v{}, {} sessions in flight)",
                    self.relay.base_url(),
                    status.version,
                    status.in_flight_sessions
                );
                self.connected = true;
                self.last_status = format!("network: connected via {}", self.relay.base_url());
                Ok(())
            }
            Err(e) => {
                warn!("Relay {} not usable: {}", self.relay.base_url(), e);
                self.last_status = format!("network: relay unavailable ({})", e.kind());
                Err(match e {
                    RelayError::InvalidRequest(message) => ConnectionError::PermissionDenied(message),
                    RelayError::RelayTimeout(message) => ConnectionError::Timeout(format!(
                        "bridge relay at {} did not answer: {}",
                        self.relay.base_url(),
                        message
                    )),
                    other => ConnectionError::Unavailable(format!(
                        "bridge relay at {} unavailable: {}",
                        self.relay.base_url(),
                        other
                    )),
                })
            }
        }
    }

    async fn disconnect(&mut self) {
        if self.connected {
            self.connected = false;
            self.last_status = "network: disconnected".to_string();
        }
    }

    #[tracing::instrument(skip(self, data), fields(destination = %self.destination(), bytes = data.len()))]
    async fn send(&mut self, data: &[u8]) -> Result<(), SendError> {
        if !self.connected {
            return Err(SendError::NotConnected);
        }

        if let Some(limit) = self.max_payload {
            if data.len() > limit {
                return Err(SendError::PayloadTooLarge {
                    size: data.len(),
                    limit,
                });
            }
        }

        let request = RelayRequest::new(&self.host, self.port, data.to_vec());
        match self.relay.relay(&request).await {
            Ok(response) => {
                debug!(
                    "Relay wrote {} bytes to {} in {}ms",
                    response.bytes_written,
                    self.destination(),
                    response.elapsed_ms
                );
                self.last_status = "network: connected".to_string();
                Ok(())
            }
            Err(e) if is_relay_unreachable(&e) => {
                warn!("Lost the bridge relay during send: {}", e);
                self.connected = false;
                self.last_status = "network: relay lost".to_string();
                Err(SendError::NotConnected)
            }
            Err(e) => {
                self.last_status = format!("network: {} ({})", e.kind(), self.destination());
                Err(SendError::TransportFailure(format!("{}: {}", e.kind(), e)))
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn status(&self) -> String {
        self.last_status.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn unreachable_relay() -> RelayClient {
        // Port 9 (discard) on loopback is closed in test environments
        RelayClient::new("http://127.0.0.1:9", None, Duration::from_millis(500))
    }

    #[tokio::test]
    async fn test_send_requires_connect() {
        let mut transport = NetworkTransport::new("192.168.1.50", 9100, unreachable_relay());
        assert_eq!(transport.send(b"hello").await, Err(SendError::NotConnected));
    }

    #[tokio::test]
    async fn test_connect_fails_when_relay_unreachable() {
        let mut transport = NetworkTransport::new("192.168.1.50", 9100, unreachable_relay());
        let err = transport.connect().await.unwrap_err();
        assert_eq!(err.kind(), "unavailable");
        assert!(!transport.is_connected());
    }
}
