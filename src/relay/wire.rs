//! JSON bodies exchanged between the Network transport driver and the relay.
//! Byte payloads travel base64-encoded.

use crate::errors::RelayError;
use crate::relay::session::RelayOutcome;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayRequest {
    pub host: String,
    pub port: u16,
    #[serde(with = "b64")]
    pub payload: Vec<u8>,
    /// Read back whatever the printer answers (status queries)
    #[serde(default)]
    pub response_expected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_ms: Option<u64>,
}

impl RelayRequest {
    pub fn new(host: &str, port: u16, payload: Vec<u8>) -> Self {
        Self {
            host: host.to_string(),
            port,
            payload,
            response_expected: false,
            connect_timeout_ms: None,
            idle_timeout_ms: None,
        }
    }

    pub fn expect_response(mut self) -> Self {
        self.response_expected = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayResponse {
    pub accepted: bool,
    #[serde(default, with = "b64_opt", skip_serializing_if = "Option::is_none")]
    pub response_bytes: Option<Vec<u8>>,
    #[serde(default)]
    pub bytes_written: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub elapsed_ms: u64,
}

impl RelayResponse {
    pub fn from_outcome(outcome: &RelayOutcome) -> Self {
        Self {
            accepted: true,
            response_bytes: outcome.response.clone(),
            bytes_written: outcome.bytes_written,
            error_kind: None,
            message: None,
            elapsed_ms: outcome.elapsed.as_millis() as u64,
        }
    }

    pub fn from_error(error: &RelayError, elapsed_ms: u64) -> Self {
        Self {
            accepted: false,
            response_bytes: None,
            bytes_written: 0,
            error_kind: Some(error.kind().to_string()),
            message: Some(error.to_string()),
            elapsed_ms,
        }
    }

    /// Turn a rejected response back into the relay's typed error.
    pub fn into_result(self) -> Result<Self, RelayError> {
        if self.accepted {
            return Ok(self);
        }
        let kind = self.error_kind.as_deref().unwrap_or("internal");
        let message = self.message.as_deref().unwrap_or("relay rejected the request");
        Err(RelayError::from_wire(kind, message))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryRequest {
    /// "192.168.1", "192.168.1.0/24", a single address, or empty to use the
    /// relay host's own subnet
    #[serde(default)]
    pub subnet_prefix: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_host: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_host: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_timeout_ms: Option<u64>,
}

impl DiscoveryRequest {
    pub fn prefix(subnet_prefix: &str) -> Self {
        Self {
            subnet_prefix: subnet_prefix.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredHost {
    pub host: String,
    pub response_time_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryResponse {
    pub hosts: Vec<DiscoveredHost>,
    pub scanned: usize,
    pub port: u16,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub in_flight_sessions: usize,
    pub uptime_seconds: u64,
    pub version: String,
    pub max_sessions: usize,
    pub queued_requests: usize,
}

mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded.as_bytes()).map_err(serde::de::Error::custom)
    }
}

mod b64_opt {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(encoded) => STANDARD
                .decode(encoded.as_bytes())
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
