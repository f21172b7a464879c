//! Printer connectivity and network bridging.
//!
//! Client side: transport drivers (USB, network, Bluetooth, HTTP API), the
//! connection registry, and the dispatcher that serializes jobs per printer.
//! Server side: the bridge relay that performs raw TCP I/O on behalf of
//! clients which cannot open sockets themselves.

pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod events;
pub mod registry;
pub mod relay;
pub mod sentry_init;
pub mod service;
pub mod status;
pub mod store;
pub mod telemetry;
pub mod transport;

pub use config::{ClientConfig, NewPrinter, PrinterIdentity, RelayConfig, TransportConfig};
pub use dispatcher::{Dispatcher, JobHandle, PrintJob};
pub use errors::{BridgeError, Result};
pub use registry::PrinterRegistry;
pub use relay::RelayService;
pub use service::PrinterService;
