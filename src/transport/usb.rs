use super::PrinterTransport;
use crate::config::TransportKind;
use crate::errors::{ConnectionError, SendError};
use async_trait::async_trait;
use rusb::{ConfigDescriptor, Context, DeviceHandle, Direction, TransferType, UsbContext};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// USB interface class code for printers
pub const PRINTER_CLASS: u8 = 0x07;

const USB_WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const USB_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// A claimable interface exposing a bulk OUT endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceCandidate {
    pub number: u8,
    pub alt_setting: u8,
    pub class_code: u8,
    pub endpoint_out: u8,
}

struct UsbClaim {
    handle: Arc<DeviceHandle<Context>>,
    interface: u8,
    endpoint_out: u8,
}

pub struct UsbTransport {
    vendor_id: u16,
    product_id: u16,
    claim: Option<UsbClaim>,
    last_status: String,
}

impl UsbTransport {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
            claim: None,
            last_status: "usb: disconnected".to_string(),
        }
    }

    fn device_label(&self) -> String {
        format!("{:04x}:{:04x}", self.vendor_id, self.product_id)
    }
}

#[async_trait]
impl PrinterTransport for UsbTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Usb
    }

    #[tracing::instrument(skip(self), fields(device = %self.device_label()))]
    async fn connect(&mut self) -> Result<(), ConnectionError> {
        if self.claim.is_some() {
            return Ok(());
        }

        let (vendor_id, product_id) = (self.vendor_id, self.product_id);
        // rusb is synchronous, run on the blocking pool
        let result = tokio::task::spawn_blocking(move || open_and_claim(vendor_id, product_id))
            .await
            .map_err(|e| ConnectionError::Unavailable(format!("USB connect task failed: {}", e)))?;

        match result {
            Ok(claim) => {
                info!(
                    "Claimed USB interface {} (endpoint 0x{:02x}) on {}",
                    claim.interface,
                    claim.endpoint_out,
                    self.device_label()
                );
                self.last_status = format!("usb: connected (interface {})", claim.interface);
                self.claim = Some(claim);
                Ok(())
            }
            Err(e) => {
                warn!("USB connect to {} failed: {}", self.device_label(), e);
                self.last_status = format!("usb: {}", e);
                Err(e)
            }
        }
    }

    async fn disconnect(&mut self) {
        let Some(claim) = self.claim.take() else {
            return;
        };

        let interface = claim.interface;
        let handle = claim.handle;
        let released = tokio::task::spawn_blocking(move || handle.release_interface(interface)).await;
        match released {
            Ok(Ok(())) => debug!("Released USB interface {}", interface),
            Ok(Err(e)) => debug!("USB interface {} release failed: {} (device gone?)", interface, e),
            Err(e) => warn!("USB release task failed: {}", e),
        }
        self.last_status = "usb: disconnected".to_string();
    }

    #[tracing::instrument(skip(self, data), fields(device = %self.device_label(), bytes = data.len()))]
    async fn send(&mut self, data: &[u8]) -> Result<(), SendError> {
        let claim = self.claim.as_ref().ok_or(SendError::NotConnected)?;

        if data.len() > USB_MAX_PAYLOAD {
            return Err(SendError::PayloadTooLarge {
                size: data.len(),
                limit: USB_MAX_PAYLOAD,
            });
        }

        let handle = claim.handle.clone();
        let endpoint = claim.endpoint_out;
        let payload = data.to_vec();
        let result = tokio::task::spawn_blocking(move || {
            write_all_bulk(&handle, endpoint, &payload, USB_WRITE_TIMEOUT)
        })
        .await
        .map_err(|e| SendError::TransportFailure(format!("USB write task failed: {}", e)))?;

        match result {
            Ok(()) => {
                debug!("USB write complete: {} bytes", data.len());
                Ok(())
            }
            Err(rusb::Error::NoDevice) => {
                warn!("USB device {} disappeared mid-send", self.device_label());
                self.claim = None;
                self.last_status = "usb: device removed".to_string();
                Err(SendError::NotConnected)
            }
            Err(e) => {
                self.last_status = format!("usb: write failed ({})", e);
                Err(SendError::TransportFailure(format!("USB write failed: {}", e)))
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.claim.is_some()
    }

    fn status(&self) -> String {
        self.last_status.clone()
    }
}

fn open_and_claim(vendor_id: u16, product_id: u16) -> Result<UsbClaim, ConnectionError> {
    let context = Context::new()
        .map_err(|e| ConnectionError::Unavailable(format!("USB subsystem unavailable: {}", e)))?;

    let devices = context.devices().map_err(map_connect_error)?;
    let device = devices
        .iter()
        .find(|d| {
            d.device_descriptor()
                .map(|desc| desc.vendor_id() == vendor_id && desc.product_id() == product_id)
                .unwrap_or(false)
        })
        .ok_or_else(|| {
            ConnectionError::Unavailable(format!(
                "USB device {:04x}:{:04x} not found",
                vendor_id, product_id
            ))
        })?;

    let handle = device.open().map_err(|e| {
        if e == rusb::Error::Access {
            warn!("USB access denied for {:04x}:{:04x}. On macOS, ensure the app has USB entitlements.", vendor_id, product_id);
        }
        map_connect_error(e)
    })?;

    let config = device.active_config_descriptor().map_err(map_connect_error)?;
    let candidates = order_candidates(collect_candidates(&config));

    // Not supported on every platform; claiming reports the real problem
    let _ = handle.set_auto_detach_kernel_driver(true);

    let chosen = claim_first(
        &candidates,
        |number| handle.claim_interface(number),
        |candidate| {
            if candidate.alt_setting != 0 {
                handle.set_alternate_setting(candidate.number, candidate.alt_setting)
            } else {
                Ok(())
            }
        },
        |number| {
            let _ = handle.release_interface(number);
        },
    )?;

    Ok(UsbClaim {
        handle: Arc::new(handle),
        interface: chosen.number,
        endpoint_out: chosen.endpoint_out,
    })
}

fn collect_candidates(config: &ConfigDescriptor) -> Vec<InterfaceCandidate> {
    let mut candidates = Vec::new();
    for interface in config.interfaces() {
        for descriptor in interface.descriptors() {
            let endpoint_out = descriptor
                .endpoint_descriptors()
                .find(|ep| ep.direction() == Direction::Out && ep.transfer_type() == TransferType::Bulk)
                .map(|ep| ep.address());

            if let Some(endpoint_out) = endpoint_out {
                candidates.push(InterfaceCandidate {
                    number: descriptor.interface_number(),
                    alt_setting: descriptor.setting_number(),
                    class_code: descriptor.class_code(),
                    endpoint_out,
                });
            }
        }
    }
    candidates
}

/// Deterministic probe order: printer-class interfaces first, then by
/// interface number and alternate setting. One entry per interface number.
pub fn order_candidates(mut candidates: Vec<InterfaceCandidate>) -> Vec<InterfaceCandidate> {
    candidates.sort_by_key(|c| (c.class_code != PRINTER_CLASS, c.number, c.alt_setting));
    let mut seen = HashSet::new();
    candidates.retain(|c| seen.insert(c.number));
    candidates
}

/// Claim the first candidate that can be claimed and activated.
///
/// A candidate whose claim succeeded but whose activation failed is released
/// before moving on, so a failed probe never leaves an interface claimed.
pub fn claim_first<C, A, R>(
    candidates: &[InterfaceCandidate],
    mut claim: C,
    mut activate: A,
    mut release: R,
) -> Result<InterfaceCandidate, ConnectionError>
where
    C: FnMut(u8) -> rusb::Result<()>,
    A: FnMut(&InterfaceCandidate) -> rusb::Result<()>,
    R: FnMut(u8),
{
    if candidates.is_empty() {
        return Err(ConnectionError::Unavailable(
            "device exposes no interface with a bulk OUT endpoint".to_string(),
        ));
    }

    let mut failures = Vec::new();
    for candidate in candidates {
        if let Err(e) = claim(candidate.number) {
            debug!("Cannot claim USB interface {}: {}", candidate.number, e);
            failures.push(format!("interface {}: {}", candidate.number, e));
            continue;
        }

        if let Err(e) = activate(candidate) {
            debug!(
                "Cannot activate USB interface {} alt {}: {}",
                candidate.number, candidate.alt_setting, e
            );
            release(candidate.number);
            failures.push(format!("interface {}: {}", candidate.number, e));
            continue;
        }

        return Ok(candidate.clone());
    }

    Err(ConnectionError::Unavailable(format!(
        "no USB interface could be claimed ({}). Close any other printer software and retry.",
        failures.join("; ")
    )))
}

fn write_all_bulk(
    handle: &DeviceHandle<Context>,
    endpoint: u8,
    data: &[u8],
    timeout: Duration,
) -> rusb::Result<()> {
    let mut offset = 0;
    while offset < data.len() {
        let written = handle.write_bulk(endpoint, &data[offset..], timeout)?;
        if written == 0 {
            return Err(rusb::Error::Io);
        }
        offset += written;
    }
    Ok(())
}

fn map_connect_error(e: rusb::Error) -> ConnectionError {
    match e {
        rusb::Error::Access => ConnectionError::PermissionDenied(format!(
            "USB permission denied ({}). Grant USB access to the bridge and retry.",
            e
        )),
        rusb::Error::Timeout => ConnectionError::Timeout(format!("USB: {}", e)),
        rusb::Error::NotSupported => ConnectionError::ProtocolMismatch(format!("USB: {}", e)),
        other => ConnectionError::Unavailable(format!("USB: {}", other)),
    }
}
