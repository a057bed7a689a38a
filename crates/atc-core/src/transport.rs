//! Transport abstraction over a BLE peripheral client.
//!
//! [`Transport`] is the narrow set of GATT operations a [`DeviceSession`]
//! needs from one peripheral. [`Scanner`] delivers raw advertisements to the
//! [`AdvertisingRouter`]. Both are implemented by the btleplug backend in
//! [`crate::ble`] and by the scriptable doubles in [`crate::mock`].
//!
//! [`DeviceSession`]: crate::DeviceSession
//! [`AdvertisingRouter`]: crate::AdvertisingRouter

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use atc_types::advertising::AD_TYPE_SERVICE_DATA;

use crate::error::Result;

/// Callback invoked with the bytes of every notification.
///
/// Runs on the transport's own task, so it must not block.
pub type NotificationHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// A resolved GATT characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicHandle {
    /// Service that owns the characteristic.
    pub service: Uuid,
    /// Characteristic UUID.
    pub uuid: Uuid,
    pub can_read: bool,
    pub can_write: bool,
    pub can_notify: bool,
}

impl CharacteristicHandle {
    /// A handle supporting read, write and notify.
    pub fn new(service: Uuid, uuid: Uuid) -> Self {
        Self {
            service,
            uuid,
            can_read: true,
            can_write: true,
            can_notify: true,
        }
    }
}

/// One advertisement seen during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Bluetooth address (or platform identifier on macOS).
    pub address: String,
    /// Local name, if advertised.
    pub name: Option<String>,
    /// Raw payload framed as AD structures.
    pub payload: Vec<u8>,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
}

impl fmt::Display for Advertisement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} bytes", self.address, self.payload.len())?;
        if let Some(rssi) = self.rssi {
            write!(f, ", {rssi} dBm")?;
        }
        write!(f, ")")
    }
}

/// Canonical form of a Bluetooth address: lowercase with separators removed.
pub fn normalize_address(address: &str) -> String {
    address
        .chars()
        .filter(|c| !matches!(c, ':' | '-'))
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Whether two addresses name the same device, ignoring case and separators.
pub fn same_address(a: &str, b: &str) -> bool {
    normalize_address(a) == normalize_address(b)
}

/// GATT operations on one peripheral.
///
/// Implementations must tolerate `disconnect` and `unsubscribe` on a link
/// that is already down.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to the peripheral at `address` and discover its services.
    async fn connect(&self, address: &str) -> Result<()>;

    /// Whether the link is up.
    async fn is_connected(&self) -> bool;

    /// Drop the link.
    async fn disconnect(&self) -> Result<()>;

    /// Look up a characteristic. `Ok(None)` when the service or
    /// characteristic does not exist.
    async fn characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Option<CharacteristicHandle>>;

    /// Read the current value.
    async fn read(&self, handle: &CharacteristicHandle) -> Result<Vec<u8>>;

    /// Write a value.
    async fn write(
        &self,
        handle: &CharacteristicHandle,
        data: &[u8],
        with_response: bool,
    ) -> Result<()>;

    /// Deliver every notification of `handle` to `on_notify` until
    /// [`unsubscribe`](Self::unsubscribe) or disconnect.
    async fn subscribe(
        &self,
        handle: &CharacteristicHandle,
        on_notify: NotificationHandler,
    ) -> Result<()>;

    /// Stop notifications of `handle`.
    async fn unsubscribe(&self, handle: &CharacteristicHandle) -> Result<()>;
}

/// Source of advertisements.
#[async_trait]
pub trait Scanner: Send + Sync {
    /// Listen for `duration` and return one advertisement per device.
    async fn scan(&self, duration: Duration) -> Result<Vec<Advertisement>>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn connect(&self, address: &str) -> Result<()> {
        (**self).connect(address).await
    }

    async fn is_connected(&self) -> bool {
        (**self).is_connected().await
    }

    async fn disconnect(&self) -> Result<()> {
        (**self).disconnect().await
    }

    async fn characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Option<CharacteristicHandle>> {
        (**self).characteristic(service, characteristic).await
    }

    async fn read(&self, handle: &CharacteristicHandle) -> Result<Vec<u8>> {
        (**self).read(handle).await
    }

    async fn write(
        &self,
        handle: &CharacteristicHandle,
        data: &[u8],
        with_response: bool,
    ) -> Result<()> {
        (**self).write(handle, data, with_response).await
    }

    async fn subscribe(
        &self,
        handle: &CharacteristicHandle,
        on_notify: NotificationHandler,
    ) -> Result<()> {
        (**self).subscribe(handle, on_notify).await
    }

    async fn unsubscribe(&self, handle: &CharacteristicHandle) -> Result<()> {
        (**self).unsubscribe(handle).await
    }
}

/// Frame 16-bit-UUID service data as one AD structure:
/// `[len, 0x16, uuid_lo, uuid_hi, data..]`.
///
/// Returns `None` when the structure would not fit a one-byte length.
pub fn service_data_structure(uuid: u16, data: &[u8]) -> Option<Vec<u8>> {
    let len = u8::try_from(data.len() + 3).ok()?;
    let mut out = Vec::with_capacity(data.len() + 4);
    out.push(len);
    out.push(AD_TYPE_SERVICE_DATA);
    out.extend_from_slice(&uuid.to_le_bytes());
    out.extend_from_slice(data);
    Some(out)
}

/// Concatenate service-data entries into one advertising payload.
///
/// Entries keep their order; ones that do not fit are skipped.
pub fn frame_service_data<'a, I>(entries: I) -> Vec<u8>
where
    I: IntoIterator<Item = (u16, &'a [u8])>,
{
    entries
        .into_iter()
        .filter_map(|(uuid, data)| service_data_structure(uuid, data))
        .flatten()
        .collect()
}
