//! Transport drivers: one variant per transport kind behind a common
//! capability set (connect, disconnect, send, is_connected, status).

pub mod api;
pub mod bluetooth;
pub mod network;
pub mod usb;

use crate::config::{ClientConfig, PrinterIdentity, TransportConfig, TransportKind};
use crate::errors::{ConnectionError, SendError};
use crate::relay::client::RelayClient;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

pub use api::ApiTransport;
pub use bluetooth::BluetoothTransport;
pub use network::NetworkTransport;
pub use usb::UsbTransport;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PrinterTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Acquire the transport's exclusive resource. On failure nothing stays held.
    async fn connect(&mut self) -> Result<(), ConnectionError>;

    /// Release everything; a no-op when already disconnected.
    async fn disconnect(&mut self);

    async fn send(&mut self, data: &[u8]) -> Result<(), SendError>;

    fn is_connected(&self) -> bool;

    fn status(&self) -> String;
}

/// Tagged union over the concrete drivers.
pub enum Transport {
    Usb(UsbTransport),
    Network(NetworkTransport),
    Bluetooth(BluetoothTransport),
    Api(ApiTransport),
}

impl Transport {
    pub fn from_identity(
        identity: &PrinterIdentity,
        relay: &RelayClient,
        config: &ClientConfig,
    ) -> Self {
        match &identity.transport {
            TransportConfig::Usb {
                vendor_id,
                product_id,
            } => Transport::Usb(UsbTransport::new(*vendor_id, *product_id)),
            TransportConfig::Network { host, port } => {
                Transport::Network(
                    NetworkTransport::new(host, *port, relay.clone())
                        .with_max_payload(config.max_payload_bytes),
                )
            }
            TransportConfig::Bluetooth { device_address } => Transport::Bluetooth(
                BluetoothTransport::new(device_address, config.bluetooth_scan()),
            ),
            TransportConfig::Api {
                endpoint_url,
                credential,
            } => Transport::Api(ApiTransport::new(
                endpoint_url,
                credential.clone(),
                config.http_timeout(),
            )),
        }
    }
}

#[async_trait]
impl PrinterTransport for Transport {
    fn kind(&self) -> TransportKind {
        match self {
            Transport::Usb(t) => t.kind(),
            Transport::Network(t) => t.kind(),
            Transport::Bluetooth(t) => t.kind(),
            Transport::Api(t) => t.kind(),
        }
    }

    async fn connect(&mut self) -> Result<(), ConnectionError> {
        match self {
            Transport::Usb(t) => t.connect().await,
            Transport::Network(t) => t.connect().await,
            Transport::Bluetooth(t) => t.connect().await,
            Transport::Api(t) => t.connect().await,
        }
    }

    async fn disconnect(&mut self) {
        match self {
            Transport::Usb(t) => t.disconnect().await,
            Transport::Network(t) => t.disconnect().await,
            Transport::Bluetooth(t) => t.disconnect().await,
            Transport::Api(t) => t.disconnect().await,
        }
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), SendError> {
        match self {
            Transport::Usb(t) => t.send(data).await,
            Transport::Network(t) => t.send(data).await,
            Transport::Bluetooth(t) => t.send(data).await,
            Transport::Api(t) => t.send(data).await,
        }
    }

    fn is_connected(&self) -> bool {
        match self {
            Transport::Usb(t) => t.is_connected(),
            Transport::Network(t) => t.is_connected(),
            Transport::Bluetooth(t) => t.is_connected(),
            Transport::Api(t) => t.is_connected(),
        }
    }

    fn status(&self) -> String {
        match self {
            Transport::Usb(t) => t.status(),
            Transport::Network(t) => t.status(),
            Transport::Bluetooth(t) => t.status(),
            Transport::Api(t) => t.status(),
        }
    }
}

/// Creates a fresh driver for an identity each time a session is opened.
pub trait TransportFactory: Send + Sync {
    fn create(&self, identity: &PrinterIdentity) -> Box<dyn PrinterTransport>;
}

pub struct DefaultTransportFactory {
    relay: RelayClient,
    config: ClientConfig,
}

impl DefaultTransportFactory {
    pub fn new(relay: RelayClient, config: ClientConfig) -> Self {
        Self { relay, config }
    }
}

impl TransportFactory for DefaultTransportFactory {
    fn create(&self, identity: &PrinterIdentity) -> Box<dyn PrinterTransport> {
        Box::new(Transport::from_identity(identity, &self.relay, &self.config))
    }
}

/// The live, resource-holding object bound to one connected identity.
///
/// The driver sits behind an async mutex: sends to the same printer queue up
/// in arrival order instead of running concurrently.
pub struct TransportSession {
    printer_id: String,
    kind: TransportKind,
    transport: Mutex<Box<dyn PrinterTransport>>,
}

impl TransportSession {
    pub fn new(printer_id: &str, transport: Box<dyn PrinterTransport>) -> Self {
        Self {
            printer_id: printer_id.to_string(),
            kind: transport.kind(),
            transport: Mutex::new(transport),
        }
    }

    pub(crate) fn transport(&self) -> &Mutex<Box<dyn PrinterTransport>> {
        &self.transport
    }

    /// Point-in-time status; never waits behind an in-flight send.
    pub fn status(&self) -> String {
        match self.transport.try_lock() {
            Ok(transport) => transport.status(),
            Err(_) => format!("{}: sending", self.kind),
        }
    }

    pub async fn close(&self) {
        let mut transport = self.transport.lock().await;
        debug!("Closing {} session for {}", self.kind, self.printer_id);
        transport.disconnect().await;
    }
}
