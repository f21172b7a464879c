use super::PrinterTransport;
use crate::config::TransportKind;
use crate::errors::{ConnectionError, SendError};
use async_trait::async_trait;
use btleplug::api::{
    Central, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Manager, Peripheral};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default ATT MTU (23) minus the 3-byte write header
pub const BLE_CHUNK_SIZE: usize = 20;
pub const BLE_CHUNK_PAUSE: Duration = Duration::from_millis(10);

const BLE_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const BLE_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Known printer services, probed in this order.
pub const KNOWN_PRINTER_SERVICES: &[Uuid] = &[
    // ISSC transparent UART (Star Micronics and most clones)
    Uuid::from_u128(0x49535343_FE7D_4AE5_8FA9_9FAFD205E455),
    // Generic thermal printer service
    Uuid::from_u128(0x000018F0_0000_1000_8000_00805F9B34FB),
    // Zebra / Seiko serial service
    Uuid::from_u128(0xE7810A71_73AE_499D_8C15_FAA9AEF0C3F2),
    Uuid::from_u128(0x0000FF00_0000_1000_8000_00805F9B34FB),
    Uuid::from_u128(0x0000FFE0_0000_1000_8000_00805F9B34FB),
];

/// Transport-neutral view of a discovered GATT service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristic>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub write_without_response: bool,
    pub write: bool,
}

impl GattCharacteristic {
    fn is_writable(&self) -> bool {
        self.write_without_response || self.write
    }
}

impl GattService {
    /// Preferred writable characteristic: write-without-response first.
    fn writable(&self) -> Option<&GattCharacteristic> {
        self.characteristics
            .iter()
            .find(|c| c.write_without_response)
            .or_else(|| self.characteristics.iter().find(|c| c.write))
    }
}

/// Pick the service and characteristic to write print data to.
///
/// The first known service present on the device wins. When none of them is
/// present, the first discovered service with a writable characteristic is used.
pub fn select_characteristic(
    services: &[GattService],
) -> Result<(Uuid, GattCharacteristic), ConnectionError> {
    for known in KNOWN_PRINTER_SERVICES {
        if let Some(service) = services.iter().find(|s| s.uuid == *known) {
            if let Some(characteristic) = service.writable() {
                return Ok((service.uuid, characteristic.clone()));
            }
            debug!("Known service {} has no writable characteristic", service.uuid);
        }
    }

    services
        .iter()
        .find_map(|s| s.writable().map(|c| (s.uuid, c.clone())))
        .ok_or_else(|| {
            ConnectionError::ProtocolMismatch(
                "no writable GATT characteristic found on printer".to_string(),
            )
        })
}

/// Write `data` in chunks of at most `chunk_size` bytes, pausing between
/// chunks. Any chunk failure aborts the whole write. Returns the number of
/// writes issued.
pub async fn write_chunked<F, Fut>(
    data: &[u8],
    chunk_size: usize,
    pause: Duration,
    mut write: F,
) -> Result<usize, String>
where
    F: FnMut(Vec<u8>) -> Fut,
    Fut: Future<Output = Result<(), String>>,
{
    let chunk_size = chunk_size.max(1);
    let total = data.len().div_ceil(chunk_size);

    for (index, chunk) in data.chunks(chunk_size).enumerate() {
        write(chunk.to_vec())
            .await
            .map_err(|e| format!("chunk {}/{} failed: {}", index + 1, total, e))?;

        if index + 1 < total && !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
    }

    Ok(total)
}

struct GattLink {
    peripheral: Peripheral,
    characteristic: Characteristic,
    write_type: WriteType,
}

pub struct BluetoothTransport {
    device_address: String,
    scan_duration: Duration,
    link: Option<GattLink>,
    last_status: String,
}

impl BluetoothTransport {
    pub fn new(device_address: &str, scan_duration: Duration) -> Self {
        Self {
            device_address: device_address.trim().to_string(),
            scan_duration,
            link: None,
            last_status: "bluetooth: disconnected".to_string(),
        }
    }

    async fn find_peripheral(&self) -> Result<Peripheral, ConnectionError> {
        let manager = Manager::new().await.map_err(map_ble_error)?;
        let adapters = manager.adapters().await.map_err(map_ble_error)?;
        let adapter = adapters.into_iter().next().ok_or_else(|| {
            ConnectionError::Unavailable("no Bluetooth adapter found".to_string())
        })?;

        // CoreBluetooth only reports peripherals seen during a scan
        adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(map_ble_error)?;
        tokio::time::sleep(self.scan_duration).await;
        adapter.stop_scan().await.ok();

        let peripherals = adapter.peripherals().await.map_err(map_ble_error)?;
        for peripheral in peripherals {
            if let Ok(Some(props)) = peripheral.properties().await {
                if props
                    .address
                    .to_string()
                    .eq_ignore_ascii_case(&self.device_address)
                {
                    return Ok(peripheral);
                }
            }
        }

        Err(ConnectionError::Unavailable(format!(
            "Bluetooth peripheral {} not found",
            self.device_address
        )))
    }

    async fn open_link(&self, peripheral: &Peripheral) -> Result<GattLink, ConnectionError> {
        tokio::time::timeout(BLE_CONNECT_TIMEOUT, peripheral.connect())
            .await
            .map_err(|_| {
                ConnectionError::Timeout(format!(
                    "Bluetooth connect to {} timed out",
                    self.device_address
                ))
            })?
            .map_err(map_ble_error)?;

        peripheral.discover_services().await.map_err(map_ble_error)?;

        let discovered: Vec<GattService> = peripheral
            .services()
            .iter()
            .map(|service| GattService {
                uuid: service.uuid,
                characteristics: service
                    .characteristics
                    .iter()
                    .map(|c| GattCharacteristic {
                        uuid: c.uuid,
                        write_without_response: c
                            .properties
                            .contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
                        write: c.properties.contains(CharPropFlags::WRITE),
                    })
                    .filter(GattCharacteristic::is_writable)
                    .collect(),
            })
            .collect();

        let (service_uuid, chosen) = select_characteristic(&discovered)?;

        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == chosen.uuid && c.service_uuid == service_uuid)
            .ok_or_else(|| {
                ConnectionError::ProtocolMismatch(format!(
                    "characteristic {} vanished after discovery",
                    chosen.uuid
                ))
            })?;

        let write_type = if chosen.write_without_response {
            WriteType::WithoutResponse
        } else {
            WriteType::WithResponse
        };

        info!(
            "Using BLE characteristic {} (service: {}, type: {:?})",
            characteristic.uuid, service_uuid, write_type
        );

        Ok(GattLink {
            peripheral: peripheral.clone(),
            characteristic,
            write_type,
        })
    }
}

#[async_trait]
impl PrinterTransport for BluetoothTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Bluetooth
    }

    #[tracing::instrument(skip(self), fields(address = %self.device_address))]
    async fn connect(&mut self) -> Result<(), ConnectionError> {
        if self.link.is_some() {
            return Ok(());
        }

        let peripheral = self.find_peripheral().await.inspect_err(|e| {
            self.last_status = format!("bluetooth: {}", e);
        })?;

        match self.open_link(&peripheral).await {
            Ok(link) => {
                info!("Connected to BLE peripheral {}", self.device_address);
                self.link = Some(link);
                self.last_status = "bluetooth: connected".to_string();
                Ok(())
            }
            Err(e) => {
                // Never leave a half-open GATT connection behind
                let _ = peripheral.disconnect().await;
                warn!("BLE connect to {} failed: {}", self.device_address, e);
                self.last_status = format!("bluetooth: {}", e);
                Err(e)
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Some(link) = self.link.take() {
            if let Err(e) = link.peripheral.disconnect().await {
                warn!("Failed to disconnect from BLE peripheral: {}", e);
            }
            self.last_status = "bluetooth: disconnected".to_string();
        }
    }

    #[tracing::instrument(skip(self, data), fields(address = %self.device_address, bytes = data.len()))]
    async fn send(&mut self, data: &[u8]) -> Result<(), SendError> {
        let link = self.link.as_ref().ok_or(SendError::NotConnected)?;

        let peripheral = &link.peripheral;
        let characteristic = &link.characteristic;
        let write_type = link.write_type;

        let result = write_chunked(data, BLE_CHUNK_SIZE, BLE_CHUNK_PAUSE, move |chunk| async move {
            tokio::time::timeout(
                BLE_WRITE_TIMEOUT,
                peripheral.write(characteristic, &chunk, write_type),
            )
            .await
            .map_err(|_| "write timed out".to_string())?
            .map_err(|e| e.to_string())
        })
        .await;

        match result {
            Ok(writes) => {
                debug!("BLE send complete: {} bytes in {} writes", data.len(), writes);
                Ok(())
            }
            Err(e) => {
                let still_connected = link.peripheral.is_connected().await.unwrap_or(false);
                if !still_connected {
                    warn!("BLE peripheral {} dropped the link mid-send", self.device_address);
                    self.link = None;
                    self.last_status = "bluetooth: link lost".to_string();
                    return Err(SendError::NotConnected);
                }
                self.last_status = format!("bluetooth: write failed ({})", e);
                Err(SendError::TransportFailure(format!("BLE write failed: {}", e)))
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    fn status(&self) -> String {
        self.last_status.clone()
    }
}

fn map_ble_error(e: btleplug::Error) -> ConnectionError {
    match e {
        btleplug::Error::PermissionDenied => ConnectionError::PermissionDenied(
            "Bluetooth permission denied. Allow Bluetooth access for the bridge.".to_string(),
        ),
        btleplug::Error::DeviceNotFound => {
            ConnectionError::Unavailable("Bluetooth device not found".to_string())
        }
        btleplug::Error::TimedOut(after) => {
            ConnectionError::Timeout(format!("Bluetooth operation timed out after {:?}", after))
        }
        btleplug::Error::NotSupported(what) => ConnectionError::ProtocolMismatch(what),
        other => ConnectionError::Unavailable(format!("Bluetooth: {}", other)),
    }
}
