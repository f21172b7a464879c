use crate::errors::{BridgeError, RegistryError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Well-known raw printing port (JetDirect)
pub const RAW_PRINTER_PORT: u16 = 9100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Usb,
    Network,
    Bluetooth,
    Api,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Usb => "usb",
            TransportKind::Network => "network",
            TransportKind::Bluetooth => "bluetooth",
            TransportKind::Api => "api",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport-specific settings, keyed by transport kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum TransportConfig {
    Usb { vendor_id: u16, product_id: u16 },
    Network { host: String, port: u16 },
    Bluetooth { device_address: String },
    Api {
        endpoint_url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        credential: Option<String>,
    },
}

impl TransportConfig {
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportConfig::Usb { .. } => TransportKind::Usb,
            TransportConfig::Network { .. } => TransportKind::Network,
            TransportConfig::Bluetooth { .. } => TransportKind::Bluetooth,
            TransportConfig::Api { .. } => TransportKind::Api,
        }
    }

    /// Check the fields each transport kind requires.
    pub fn validate(&self) -> std::result::Result<(), RegistryError> {
        match self {
            TransportConfig::Usb { vendor_id, .. } => {
                if *vendor_id == 0 {
                    return Err(RegistryError::InvalidConfig(
                        "usb printer requires a vendor id".to_string(),
                    ));
                }
            }
            TransportConfig::Network { host, port } => {
                if host.trim().is_empty() {
                    return Err(RegistryError::InvalidConfig(
                        "network printer requires a host".to_string(),
                    ));
                }
                if *port == 0 {
                    return Err(RegistryError::InvalidConfig(
                        "network printer requires a port".to_string(),
                    ));
                }
            }
            TransportConfig::Bluetooth { device_address } => {
                if device_address.trim().is_empty() {
                    return Err(RegistryError::InvalidConfig(
                        "bluetooth printer requires a device address".to_string(),
                    ));
                }
            }
            TransportConfig::Api { endpoint_url, .. } => {
                let url = url::Url::parse(endpoint_url).map_err(|e| {
                    RegistryError::InvalidConfig(format!(
                        "api printer endpoint '{}' is not a valid URL: {}",
                        endpoint_url, e
                    ))
                })?;
                if url.scheme() != "http" && url.scheme() != "https" {
                    return Err(RegistryError::InvalidConfig(format!(
                        "api printer endpoint must be http(s), got '{}'",
                        url.scheme()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Identifies the physical endpoint so two identities never target the
    /// same device.
    pub fn endpoint_key(&self) -> String {
        match self {
            TransportConfig::Usb {
                vendor_id,
                product_id,
            } => format!("usb_{:04x}_{:04x}", vendor_id, product_id),
            TransportConfig::Network { host, port } => {
                format!("net_{}:{}", host.trim().to_lowercase(), port)
            }
            TransportConfig::Bluetooth { device_address } => {
                format!("ble_{}", device_address.trim().to_uppercase())
            }
            TransportConfig::Api { endpoint_url, .. } => {
                format!("api_{}", endpoint_url.trim_end_matches('/'))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PaperWidth {
    #[serde(rename = "58mm")]
    Width58mm,
    #[default]
    #[serde(rename = "80mm")]
    Width80mm,
}

/// A registered logical printer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrinterIdentity {
    pub id: String,
    pub display_name: String,
    #[serde(flatten)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub paper_width: PaperWidth,
}

impl PrinterIdentity {
    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }
}

/// Registration input; the id is generated by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPrinter {
    pub display_name: String,
    #[serde(flatten)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub paper_width: PaperWidth,
}

impl NewPrinter {
    pub fn network(display_name: &str, host: &str, port: u16) -> Self {
        Self {
            display_name: display_name.to_string(),
            transport: TransportConfig::Network {
                host: host.to_string(),
                port,
            },
            paper_width: PaperWidth::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrinterUpdate {
    pub display_name: Option<String>,
    pub transport: Option<TransportConfig>,
}

/// Settings for the Bridge Relay Service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub bind_address: String,
    pub connect_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    /// Upper bound on client-requested timeouts
    pub max_timeout_ms: u64,
    pub max_sessions: usize,
    pub admission_queue: usize,
    pub admission_wait_ms: u64,
    pub max_payload_bytes: usize,
    pub max_response_bytes: usize,
    pub discovery_port: u16,
    pub discovery_probe_timeout_ms: u64,
    pub discovery_concurrency: usize,
    pub discovery_max_hosts: usize,
    pub max_concurrent_discoveries: usize,
    pub auth_token: Option<String>,
    /// Period of the telemetry log line; 0 disables it
    pub telemetry_interval_secs: u64,
    /// Extra CORS origins on top of the localhost defaults
    pub allowed_origins: Vec<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8044".to_string(),
            connect_timeout_ms: 5_000,
            idle_timeout_ms: 3_000,
            max_timeout_ms: 30_000,
            max_sessions: 64,
            admission_queue: 256,
            admission_wait_ms: 10_000,
            max_payload_bytes: 4 * 1024 * 1024,
            max_response_bytes: 64 * 1024,
            discovery_port: RAW_PRINTER_PORT,
            discovery_probe_timeout_ms: 500,
            discovery_concurrency: 32,
            discovery_max_hosts: 1024,
            max_concurrent_discoveries: 2,
            auth_token: None,
            telemetry_interval_secs: 300,
            allowed_origins: Vec::new(),
        }
    }
}

impl RelayConfig {
    /// Build from `BRIDGE_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            bind_address: env_or("BRIDGE_RELAY_BIND", defaults.bind_address)?,
            connect_timeout_ms: env_or("BRIDGE_CONNECT_TIMEOUT_MS", defaults.connect_timeout_ms)?,
            idle_timeout_ms: env_or("BRIDGE_IDLE_TIMEOUT_MS", defaults.idle_timeout_ms)?,
            max_timeout_ms: env_or("BRIDGE_MAX_TIMEOUT_MS", defaults.max_timeout_ms)?,
            max_sessions: env_or("BRIDGE_MAX_SESSIONS", defaults.max_sessions)?,
            admission_queue: env_or("BRIDGE_ADMISSION_QUEUE", defaults.admission_queue)?,
            admission_wait_ms: env_or("BRIDGE_ADMISSION_WAIT_MS", defaults.admission_wait_ms)?,
            max_payload_bytes: env_or("BRIDGE_MAX_PAYLOAD_BYTES", defaults.max_payload_bytes)?,
            max_response_bytes: env_or("BRIDGE_MAX_RESPONSE_BYTES", defaults.max_response_bytes)?,
            discovery_port: env_or("BRIDGE_DISCOVERY_PORT", defaults.discovery_port)?,
            discovery_probe_timeout_ms: env_or(
                "BRIDGE_DISCOVERY_PROBE_TIMEOUT_MS",
                defaults.discovery_probe_timeout_ms,
            )?,
            discovery_concurrency: env_or(
                "BRIDGE_DISCOVERY_CONCURRENCY",
                defaults.discovery_concurrency,
            )?,
            discovery_max_hosts: env_or("BRIDGE_DISCOVERY_MAX_HOSTS", defaults.discovery_max_hosts)?,
            max_concurrent_discoveries: env_or(
                "BRIDGE_MAX_CONCURRENT_DISCOVERIES",
                defaults.max_concurrent_discoveries,
            )?,
            auth_token: std::env::var("BRIDGE_RELAY_TOKEN").ok().filter(|t| !t.is_empty()),
            telemetry_interval_secs: env_or(
                "BRIDGE_TELEMETRY_INTERVAL_SECS",
                defaults.telemetry_interval_secs,
            )?,
            allowed_origins: std::env::var("BRIDGE_ALLOWED_ORIGINS")
                .map(|v| {
                    v.split(',')
                        .map(|o| o.trim().to_string())
                        .filter(|o| !o.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
        })
    }

    pub fn admission_wait(&self) -> Duration {
        Duration::from_millis(self.admission_wait_ms)
    }

    /// Longest a single relay exchange can legitimately take: a full
    /// admission wait, then a connect and an idle period at the largest
    /// timeouts a client may request.
    pub fn longest_exchange(&self) -> Duration {
        Duration::from_millis(self.admission_wait_ms + 2 * self.max_timeout_ms)
    }

    /// Clamp a client-requested timeout into `1..=max_timeout_ms`.
    pub fn clamp_timeout(&self, requested_ms: Option<u64>, default_ms: u64) -> Duration {
        let ms = requested_ms.unwrap_or(default_ms).clamp(1, self.max_timeout_ms);
        Duration::from_millis(ms)
    }
}

/// Headroom on top of the relay's longest exchange for the HTTP round trip
const RELAY_TIMEOUT_SLACK: Duration = Duration::from_secs(5);

/// Settings for the client-side components (registry, drivers, store).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub relay_url: String,
    pub relay_token: Option<String>,
    /// Overall deadline for one call to the relay; must outlast the relay's
    /// own admission wait and session timeouts
    pub relay_timeout_ms: u64,
    /// Deadline for HTTP API printers
    pub http_timeout_ms: u64,
    pub bluetooth_scan_ms: u64,
    /// Largest payload the Network driver hands to the relay
    pub max_payload_bytes: usize,
    pub store_path: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: "http://127.0.0.1:8044".to_string(),
            relay_token: None,
            relay_timeout_ms: (RelayConfig::default().longest_exchange() + RELAY_TIMEOUT_SLACK)
                .as_millis() as u64,
            http_timeout_ms: 30_000,
            bluetooth_scan_ms: 3_000,
            max_payload_bytes: 4 * 1024 * 1024,
            store_path: Some(Self::default_store_path()),
        }
    }
}

impl ClientConfig {
    pub fn relay_timeout(&self) -> Duration {
        Duration::from_millis(self.relay_timeout_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn bluetooth_scan(&self) -> Duration {
        Duration::from_millis(self.bluetooth_scan_ms)
    }

    pub fn default_store_path() -> PathBuf {
        let config_dir = if cfg!(target_os = "macos") {
            dirs::home_dir()
                .map(|p| p.join("Library/Application Support/com.eatsome.printer-bridge"))
                .unwrap_or_else(|| PathBuf::from("."))
        } else if cfg!(target_os = "windows") {
            dirs::config_dir()
                .map(|p| p.join("Eatsome Printer Bridge"))
                .unwrap_or_else(|| PathBuf::from("."))
        } else {
            dirs::config_dir()
                .map(|p| p.join("eatsome-printer-bridge"))
                .unwrap_or_else(|| PathBuf::from("."))
        };

        config_dir.join("printers.json")
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|_| BridgeError::Config(format!("{} has an invalid value: '{}'", key, raw))),
        _ => Ok(default),
    }
}
