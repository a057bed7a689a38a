//! btleplug backend for [`Transport`] and [`Scanner`].

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    CharPropFlags, Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use atc_types::uuid::{ENVIRONMENTAL_SENSING_SHORT, to_u16};

use crate::error::{Error, Result};
use crate::transport::{
    Advertisement, CharacteristicHandle, NotificationHandler, Scanner, Transport,
    frame_service_data, same_address,
};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_FIND_SCAN: Duration = Duration::from_secs(5);

/// Address reported by platforms that hide the MAC (macOS).
const HIDDEN_ADDRESS: &str = "00:00:00:00:00:00";

/// Timeouts for btleplug operations.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use atc_core::ble::ConnectionConfig;
///
/// let config = ConnectionConfig::default()
///     .connection_timeout(Duration::from_secs(20))
///     .read_timeout(Duration::from_secs(15));
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Timeout for establishing a BLE connection.
    pub connection_timeout: Duration,
    /// Timeout for BLE read operations.
    pub read_timeout: Duration,
    /// Timeout for BLE write operations.
    pub write_timeout: Duration,
    /// Timeout for service discovery after connection.
    pub discovery_timeout: Duration,
    /// Scan window used when the peripheral is not known to the adapter yet.
    pub find_scan_duration: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connection_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            find_scan_duration: DEFAULT_FIND_SCAN,
        }
    }
}

impl ConnectionConfig {
    #[must_use]
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    #[must_use]
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    #[must_use]
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    #[must_use]
    pub fn discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    #[must_use]
    pub fn find_scan_duration(mut self, duration: Duration) -> Self {
        self.find_scan_duration = duration;
        self
    }
}

/// Get the first Bluetooth adapter.
pub async fn get_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;

    adapters
        .into_iter()
        .next()
        .ok_or_else(|| Error::Transport("no Bluetooth adapter available".to_string()))
}

/// Format a peripheral ID as a string.
///
/// On macOS peripheral IDs are CoreBluetooth UUIDs; elsewhere they wrap the
/// MAC address.
pub fn format_peripheral_id(id: &PeripheralId) -> String {
    format!("{:?}", id)
        .trim_start_matches("PeripheralId(")
        .trim_end_matches(')')
        .to_string()
}

/// Identifier for a peripheral: its address, or the peripheral ID where the
/// platform hides the address.
pub fn create_identifier(address: &str, peripheral_id: &PeripheralId) -> String {
    if address == HIDDEN_ADDRESS {
        format_peripheral_id(peripheral_id)
    } else {
        address.to_string()
    }
}

fn identifier_matches(candidate: &str, wanted: &str) -> bool {
    candidate != HIDDEN_ADDRESS && same_address(candidate, wanted)
}

/// Build an advertising payload from btleplug's decoded service data.
///
/// Environmental Sensing data comes first; other 16-bit UUIDs follow in
/// ascending order. 128-bit UUIDs cannot be framed and are skipped.
fn payload_from_service_data(service_data: &HashMap<Uuid, Vec<u8>>) -> Vec<u8> {
    let mut entries: Vec<(u16, &[u8])> = service_data
        .iter()
        .filter_map(|(uuid, data)| to_u16(*uuid).map(|short| (short, data.as_slice())))
        .collect();
    entries.sort_by_key(|(short, _)| (*short != ENVIRONMENTAL_SENSING_SHORT, *short));
    frame_service_data(entries)
}

/// A connected peripheral and its discovered characteristics.
struct Link {
    peripheral: Peripheral,
    characteristics: HashMap<Uuid, Characteristic>,
}

/// btleplug-backed [`Transport`] for one peripheral.
pub struct BleTransport {
    adapter: Adapter,
    config: ConnectionConfig,
    link: RwLock<Option<Link>>,
    notifications: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl std::fmt::Debug for BleTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BleTransport")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl BleTransport {
    /// Create a transport on the first adapter.
    pub async fn new() -> Result<Self> {
        Ok(Self::with_adapter(get_adapter().await?, ConnectionConfig::default()))
    }

    pub fn with_adapter(adapter: Adapter, config: ConnectionConfig) -> Self {
        Self {
            adapter,
            config,
            link: RwLock::new(None),
            notifications: Mutex::new(HashMap::new()),
        }
    }

    /// Find a peripheral the adapter already knows about.
    async fn known_peripheral(&self, address: &str) -> Result<Option<Peripheral>> {
        for peripheral in self.adapter.peripherals().await? {
            let Ok(Some(props)) = peripheral.properties().await else {
                continue;
            };
            let id = format_peripheral_id(&peripheral.id());
            if identifier_matches(&props.address.to_string(), address)
                || id.eq_ignore_ascii_case(address)
            {
                return Ok(Some(peripheral));
            }
        }
        Ok(None)
    }

    async fn find_peripheral(&self, address: &str) -> Result<Peripheral> {
        if let Some(peripheral) = self.known_peripheral(address).await? {
            return Ok(peripheral);
        }

        debug!(address, "Peripheral not cached, scanning");
        self.adapter.start_scan(ScanFilter::default()).await?;
        sleep(self.config.find_scan_duration).await;
        self.adapter.stop_scan().await?;

        self.known_peripheral(address)
            .await?
            .ok_or_else(|| Error::Transport(format!("device {address} not found")))
    }

    async fn characteristic_of(&self, uuid: Uuid) -> Result<(Peripheral, Characteristic)> {
        let link = self.link.read().await;
        let link = link.as_ref().ok_or(Error::NotConnected)?;
        let characteristic = link
            .characteristics
            .get(&uuid)
            .cloned()
            .ok_or_else(|| Error::characteristic_not_found(Uuid::nil(), uuid))?;
        Ok((link.peripheral.clone(), characteristic))
    }

    async fn cancel_notifications(&self) {
        for (_, token) in self.notifications.lock().await.drain() {
            token.cancel();
        }
    }
}

#[async_trait]
impl Transport for BleTransport {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn connect(&self, address: &str) -> Result<()> {
        let peripheral = self.find_peripheral(address).await?;

        timeout(self.config.connection_timeout, peripheral.connect())
            .await
            .map_err(|_| Error::timeout("connect to device", self.config.connection_timeout))??;

        timeout(self.config.discovery_timeout, peripheral.discover_services())
            .await
            .map_err(|_| Error::timeout("discover services", self.config.discovery_timeout))??;

        let mut characteristics = HashMap::new();
        for service in peripheral.services() {
            trace!("Service: {}", service.uuid);
            for characteristic in service.characteristics {
                characteristics.insert(characteristic.uuid, characteristic);
            }
        }
        info!(address, characteristics = characteristics.len(), "Connected");

        *self.link.write().await = Some(Link {
            peripheral,
            characteristics,
        });
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        match self.link.read().await.as_ref() {
            Some(link) => link.peripheral.is_connected().await.unwrap_or(false),
            None => false,
        }
    }

    async fn disconnect(&self) -> Result<()> {
        self.cancel_notifications().await;
        let Some(link) = self.link.write().await.take() else {
            return Ok(());
        };
        if link.peripheral.is_connected().await.unwrap_or(false) {
            link.peripheral.disconnect().await?;
            debug!("Disconnected");
        }
        Ok(())
    }

    async fn characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Option<CharacteristicHandle>> {
        let link = self.link.read().await;
        let link = link.as_ref().ok_or(Error::NotConnected)?;

        Ok(link
            .characteristics
            .get(&characteristic)
            .filter(|c| c.service_uuid == service)
            .map(|c| CharacteristicHandle {
                service,
                uuid: c.uuid,
                can_read: c.properties.contains(CharPropFlags::READ),
                can_write: c
                    .properties
                    .intersects(CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE),
                can_notify: c
                    .properties
                    .intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE),
            }))
    }

    async fn read(&self, handle: &CharacteristicHandle) -> Result<Vec<u8>> {
        let (peripheral, characteristic) = self.characteristic_of(handle.uuid).await?;
        let data = timeout(self.config.read_timeout, peripheral.read(&characteristic))
            .await
            .map_err(|_| {
                Error::timeout(
                    format!("read characteristic {}", handle.uuid),
                    self.config.read_timeout,
                )
            })??;
        Ok(data)
    }

    async fn write(
        &self,
        handle: &CharacteristicHandle,
        data: &[u8],
        with_response: bool,
    ) -> Result<()> {
        let (peripheral, characteristic) = self.characteristic_of(handle.uuid).await?;
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        timeout(
            self.config.write_timeout,
            peripheral.write(&characteristic, data, write_type),
        )
        .await
        .map_err(|_| {
            Error::timeout(
                format!("write characteristic {}", handle.uuid),
                self.config.write_timeout,
            )
        })?
        .map_err(|e| Error::write_failed(handle.uuid, e.to_string()))
    }

    async fn subscribe(
        &self,
        handle: &CharacteristicHandle,
        on_notify: NotificationHandler,
    ) -> Result<()> {
        let (peripheral, characteristic) = self.characteristic_of(handle.uuid).await?;
        let mut stream = peripheral.notifications().await?;
        peripheral.subscribe(&characteristic).await?;

        let token = CancellationToken::new();
        if let Some(previous) = self
            .notifications
            .lock()
            .await
            .insert(handle.uuid, token.clone())
        {
            previous.cancel();
        }

        let uuid = handle.uuid;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    notification = stream.next() => match notification {
                        Some(n) if n.uuid == uuid => on_notify(&n.value),
                        Some(_) => {}
                        None => break,
                    },
                }
            }
            trace!(%uuid, "Notification task finished");
        });
        Ok(())
    }

    async fn unsubscribe(&self, handle: &CharacteristicHandle) -> Result<()> {
        if let Some(token) = self.notifications.lock().await.remove(&handle.uuid) {
            token.cancel();
        }
        match self.characteristic_of(handle.uuid).await {
            Ok((peripheral, characteristic)) => {
                if let Err(e) = peripheral.unsubscribe(&characteristic).await {
                    warn!(uuid = %handle.uuid, error = %e, "Unsubscribe failed");
                }
                Ok(())
            }
            Err(Error::NotConnected) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// btleplug-backed [`Scanner`].
#[derive(Debug, Clone)]
pub struct BleScanner {
    adapter: Adapter,
}

impl BleScanner {
    /// Create a scanner on the first adapter.
    pub async fn new() -> Result<Self> {
        Ok(Self::with_adapter(get_adapter().await?))
    }

    pub fn with_adapter(adapter: Adapter) -> Self {
        Self { adapter }
    }
}

#[async_trait]
impl Scanner for BleScanner {
    async fn scan(&self, duration: Duration) -> Result<Vec<Advertisement>> {
        debug!("Scanning for {:?}", duration);
        self.adapter.start_scan(ScanFilter::default()).await?;
        sleep(duration).await;
        self.adapter.stop_scan().await?;

        let mut advertisements = Vec::new();
        for peripheral in self.adapter.peripherals().await? {
            let props = match peripheral.properties().await {
                Ok(Some(props)) => props,
                Ok(None) => continue,
                Err(e) => {
                    debug!("Error reading peripheral properties: {}", e);
                    continue;
                }
            };
            let payload = payload_from_service_data(&props.service_data);
            if payload.is_empty() {
                continue;
            }
            advertisements.push(Advertisement {
                address: create_identifier(&props.address.to_string(), &peripheral.id()),
                name: props.local_name,
                payload,
                rssi: props.rssi,
            });
        }
        debug!("Scan complete, {} advertisement(s)", advertisements.len());
        Ok(advertisements)
    }
}
