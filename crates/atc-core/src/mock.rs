//! Mock transport for testing.
//!
//! [`MockTransport`] behaves like a thermometer running custom firmware: it
//! exposes the environmental sensing, battery and command characteristics,
//! answers settings commands with notifications and records every operation
//! so tests can assert ordering.
//!
//! # Features
//!
//! - **Failure injection**: failing connects, missing characteristics, a
//!   command characteristic that cannot notify, a device that never answers
//! - **Latency simulation**: delayed connects, for timeout tests
//! - **Operation log**: [`MockOp`] entries in call order
//!
//! [`MockScanner`] replays scripted advertisement batches.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use atc_types::settings::{SETTINGS_RECORD_LEN, SETTINGS_WRITE_LEN, SETTINGS_WRITE_LENGTH};
use atc_types::uuid::{
    BATTERY_LEVEL, BATTERY_SERVICE, COMMAND, COMMAND_SERVICE, ENVIRONMENTAL_SENSING_SERVICE,
    HUMIDITY, TEMPERATURE, TEMPERATURE_PRECISE,
};

use crate::commands;
use crate::error::{Error, Result};
use crate::transport::{
    Advertisement, CharacteristicHandle, NotificationHandler, Scanner, Transport,
};

/// Settings record a freshly reset thermometer reports: pvvx format with
/// measurements transmitted and battery shown, 2.5 s advertising interval,
/// 0.04 dBm radio power, LYWSD03MMC B1.4 hardware.
pub const DEFAULT_SETTINGS_RECORD: [u8; SETTINGS_RECORD_LEN] = [
    commands::READ_SETTINGS,
    SETTINGS_WRITE_LENGTH,
    0x61,
    0x00,
    0x00,
    0x00,
    40,
    4,
    169,
    49,
    49,
    0x00,
    0x00,
];

/// An operation recorded by [`MockTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOp {
    Connect(String),
    Disconnect,
    Read(Uuid),
    Write(Uuid, Vec<u8>),
    Subscribe(Uuid),
    Unsubscribe(Uuid),
}

#[derive(Default)]
struct MockState {
    record: Vec<u8>,
    values: HashMap<Uuid, Vec<u8>>,
    missing: HashSet<Uuid>,
    no_notify: HashSet<Uuid>,
    subscriptions: HashMap<Uuid, NotificationHandler>,
    log: Vec<MockOp>,
    clock: Option<u32>,
}

/// A simulated thermometer.
///
/// # Example
///
/// ```
/// use atc_core::{DeviceSession, MockTransport};
/// use atc_types::ConnectionMode;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let mock = MockTransport::new();
/// mock.set_temperature(21.5).await;
///
/// let session = DeviceSession::new("A4:C1:38:00:00:01", mock);
/// session.set_connection_mode(ConnectionMode::Connection).await.unwrap();
/// assert!((session.temperature().await - 21.5).abs() < 0.01);
/// # }
/// ```
pub struct MockTransport {
    connected: AtomicBool,
    connect_count: AtomicU32,
    read_count: AtomicU32,
    /// Connects to fail before succeeding.
    remaining_failures: AtomicU32,
    /// Fail every connect.
    unreachable: AtomicBool,
    /// Accept commands but never notify a response.
    silent: AtomicBool,
    /// Simulated connect latency in milliseconds (0 = no delay).
    connect_latency_ms: AtomicU64,
    state: RwLock<MockState>,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("connected", &self.connected.load(Ordering::Relaxed))
            .field("connect_count", &self.connect_count.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Create a thermometer reporting 22.5 °C, 45 % and a full battery.
    pub fn new() -> Self {
        let mut values = HashMap::new();
        values.insert(TEMPERATURE, 225i16.to_le_bytes().to_vec());
        values.insert(TEMPERATURE_PRECISE, 2250i16.to_le_bytes().to_vec());
        values.insert(HUMIDITY, 4500u16.to_le_bytes().to_vec());
        values.insert(BATTERY_LEVEL, vec![100]);

        Self {
            connected: AtomicBool::new(false),
            connect_count: AtomicU32::new(0),
            read_count: AtomicU32::new(0),
            remaining_failures: AtomicU32::new(0),
            unreachable: AtomicBool::new(false),
            silent: AtomicBool::new(false),
            connect_latency_ms: AtomicU64::new(0),
            state: RwLock::new(MockState {
                record: DEFAULT_SETTINGS_RECORD.to_vec(),
                values,
                ..Default::default()
            }),
        }
    }

    /// Create a thermometer reporting `record` as its settings.
    pub fn with_settings_record(record: &[u8]) -> Self {
        let mut mock = Self::new();
        mock.state.get_mut().record = record.to_vec();
        mock
    }

    // --- Failure injection ---

    /// Fail the next `count` connect attempts, then succeed.
    pub fn set_connect_failures(&self, count: u32) {
        self.remaining_failures.store(count, Ordering::Relaxed);
    }

    /// Fail every connect attempt.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::Relaxed);
    }

    /// Stop answering commands.
    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::Relaxed);
    }

    /// Set simulated connect latency.
    pub fn set_connect_latency(&self, latency: Duration) {
        self.connect_latency_ms.store(
            u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
    }

    /// Hide a characteristic from lookups.
    pub async fn remove_characteristic(&self, uuid: Uuid) {
        self.state.write().await.missing.insert(uuid);
    }

    /// Report a characteristic as unable to notify.
    pub async fn disable_notify(&self, uuid: Uuid) {
        self.state.write().await.no_notify.insert(uuid);
    }

    // --- Device values ---

    pub async fn set_temperature(&self, celsius: f32) {
        let tenths = (celsius * 10.0).round() as i16;
        let hundredths = (celsius * 100.0).round() as i16;
        let mut state = self.state.write().await;
        state.values.insert(TEMPERATURE, tenths.to_le_bytes().to_vec());
        state
            .values
            .insert(TEMPERATURE_PRECISE, hundredths.to_le_bytes().to_vec());
    }

    pub async fn set_humidity(&self, percent: f32) {
        let hundredths = (percent * 100.0).round() as u16;
        self.state
            .write()
            .await
            .values
            .insert(HUMIDITY, hundredths.to_le_bytes().to_vec());
    }

    pub async fn set_battery_level(&self, level: u8) {
        self.state
            .write()
            .await
            .values
            .insert(BATTERY_LEVEL, vec![level]);
    }

    /// Set the raw bytes a characteristic read returns.
    pub async fn set_value(&self, uuid: Uuid, value: Vec<u8>) {
        self.state.write().await.values.insert(uuid, value);
    }

    /// Settings record currently stored on the device.
    pub async fn settings_record(&self) -> Vec<u8> {
        self.state.read().await.record.clone()
    }

    /// Last clock value written with the set-clock command.
    pub async fn clock(&self) -> Option<u32> {
        self.state.read().await.clock
    }

    /// Deliver a notification to the subscriber of `uuid`.
    ///
    /// Returns `false` when nobody is subscribed.
    pub async fn push_notification(&self, uuid: Uuid, data: &[u8]) -> bool {
        let handler = self.state.read().await.subscriptions.get(&uuid).cloned();
        match handler {
            Some(handler) => {
                handler(data);
                true
            }
            None => false,
        }
    }

    // --- Inspection ---

    /// Operations in call order.
    pub async fn ops(&self) -> Vec<MockOp> {
        self.state.read().await.log.clone()
    }

    pub async fn clear_ops(&self) {
        self.state.write().await.log.clear();
    }

    /// Characteristics with an active subscription.
    pub async fn subscriptions(&self) -> HashSet<Uuid> {
        self.state
            .read()
            .await
            .subscriptions
            .keys()
            .copied()
            .collect()
    }

    pub fn connect_count(&self) -> u32 {
        self.connect_count.load(Ordering::Relaxed)
    }

    pub fn read_count(&self) -> u32 {
        self.read_count.load(Ordering::Relaxed)
    }

    pub fn is_connected_sync(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn require_connected(&self) -> Result<()> {
        if self.is_connected_sync() {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    fn service_of(uuid: Uuid) -> Option<Uuid> {
        match uuid {
            u if u == TEMPERATURE || u == TEMPERATURE_PRECISE || u == HUMIDITY => {
                Some(ENVIRONMENTAL_SENSING_SERVICE)
            }
            u if u == BATTERY_LEVEL => Some(BATTERY_SERVICE),
            u if u == COMMAND => Some(COMMAND_SERVICE),
            _ => None,
        }
    }

    /// Apply a command to the stored record and build the response.
    fn handle_command(state: &mut MockState, data: &[u8]) -> Option<Vec<u8>> {
        match data {
            [commands::READ_SETTINGS] => Some(state.record.clone()),
            [commands::WRITE_SETTINGS, SETTINGS_WRITE_LENGTH, ..] if data.len() == SETTINGS_WRITE_LEN => {
                // The write form carries averaging in byte 11; the stored
                // record keeps the hardware version there.
                state.record[..11].copy_from_slice(&data[..11]);
                state.record[12] = data[11];
                Some(state.record.clone())
            }
            [commands::RESET_SETTINGS] => {
                let hw_version = state.record[11];
                state.record = DEFAULT_SETTINGS_RECORD.to_vec();
                state.record[11] = hw_version;
                Some(state.record.clone())
            }
            [commands::SET_CLOCK, t0, t1, t2, t3] => {
                state.clock = Some(u32::from_le_bytes([*t0, *t1, *t2, *t3]));
                Some(data.to_vec())
            }
            _ => None,
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, address: &str) -> Result<()> {
        let latency = self.connect_latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        self.connect_count.fetch_add(1, Ordering::Relaxed);
        self.state
            .write()
            .await
            .log
            .push(MockOp::Connect(address.to_string()));

        if self.remaining_failures.load(Ordering::Relaxed) > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(Error::Transport(format!("mock connect to {address} failed")));
        }
        if self.unreachable.load(Ordering::Relaxed) {
            return Err(Error::Transport(format!("{address} is unreachable")));
        }

        self.connected.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.is_connected_sync()
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::Relaxed);
        let mut state = self.state.write().await;
        state.subscriptions.clear();
        state.log.push(MockOp::Disconnect);
        Ok(())
    }

    async fn characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Option<CharacteristicHandle>> {
        self.require_connected()?;
        let state = self.state.read().await;
        if state.missing.contains(&characteristic) || Self::service_of(characteristic) != Some(service) {
            return Ok(None);
        }
        Ok(Some(CharacteristicHandle {
            service,
            uuid: characteristic,
            can_read: characteristic != COMMAND,
            can_write: characteristic == COMMAND,
            can_notify: !state.no_notify.contains(&characteristic),
        }))
    }

    async fn read(&self, handle: &CharacteristicHandle) -> Result<Vec<u8>> {
        self.require_connected()?;
        self.read_count.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.write().await;
        state.log.push(MockOp::Read(handle.uuid));
        state
            .values
            .get(&handle.uuid)
            .cloned()
            .ok_or_else(|| Error::characteristic_not_found(handle.service, handle.uuid))
    }

    async fn write(
        &self,
        handle: &CharacteristicHandle,
        data: &[u8],
        _with_response: bool,
    ) -> Result<()> {
        self.require_connected()?;
        if !handle.can_write {
            return Err(Error::write_failed(handle.uuid, "characteristic is read-only"));
        }

        let notify = {
            let mut state = self.state.write().await;
            state.log.push(MockOp::Write(handle.uuid, data.to_vec()));
            let response = Self::handle_command(&mut state, data);
            let handler = state.subscriptions.get(&handle.uuid).cloned();
            response.zip(handler)
        };

        if self.silent.load(Ordering::Relaxed) {
            return Ok(());
        }
        if let Some((response, handler)) = notify {
            handler(&response);
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        handle: &CharacteristicHandle,
        on_notify: NotificationHandler,
    ) -> Result<()> {
        self.require_connected()?;
        let mut state = self.state.write().await;
        state.log.push(MockOp::Subscribe(handle.uuid));
        state.subscriptions.insert(handle.uuid, on_notify);
        Ok(())
    }

    async fn unsubscribe(&self, handle: &CharacteristicHandle) -> Result<()> {
        let mut state = self.state.write().await;
        state.log.push(MockOp::Unsubscribe(handle.uuid));
        state.subscriptions.remove(&handle.uuid);
        Ok(())
    }
}

/// Replays scripted scan results, one batch per scan.
#[derive(Debug, Default)]
pub struct MockScanner {
    batches: std::sync::Mutex<VecDeque<Vec<Advertisement>>>,
    scan_count: AtomicU32,
    remaining_failures: AtomicU32,
}

impl MockScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the result of a future scan.
    pub fn push_batch(&self, batch: Vec<Advertisement>) {
        self.batches
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push_back(batch);
    }

    pub fn scan_count(&self) -> u32 {
        self.scan_count.load(Ordering::Relaxed)
    }

    /// Fail the next `count` scans with a transport error.
    pub fn fail_next_scans(&self, count: u32) {
        self.remaining_failures.store(count, Ordering::Relaxed);
    }
}

#[async_trait]
impl Scanner for MockScanner {
    async fn scan(&self, duration: Duration) -> Result<Vec<Advertisement>> {
        self.scan_count.fetch_add(1, Ordering::Relaxed);
        if self
            .remaining_failures
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Transport("scan failed to start".to_string()));
        }
        tokio::time::sleep(duration).await;
        Ok(self
            .batches
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop_front()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use atc_types::DeviceSettings;

    fn capture() -> (NotificationHandler, Arc<Mutex<Vec<Vec<u8>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: NotificationHandler = Arc::new(move |data: &[u8]| {
            sink.lock().unwrap().push(data.to_vec());
        });
        (handler, seen)
    }

    async fn command_handle(mock: &MockTransport) -> CharacteristicHandle {
        mock.characteristic(COMMAND_SERVICE, COMMAND)
            .await
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_default_record_decodes() {
        let settings = DeviceSettings::decode(&DEFAULT_SETTINGS_RECORD).unwrap();
        assert!(settings.transmit_measurements);
        assert!(settings.show_battery);
        assert_eq!(settings.advertising_interval_ms(), 2500);
        assert_eq!(settings.rf_tx_power.to_u8(), 169);
    }

    #[tokio::test]
    async fn test_requires_connection() {
        let mock = MockTransport::new();
        let result = mock.characteristic(COMMAND_SERVICE, COMMAND).await;
        assert!(matches!(result, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn test_connect_failures_then_success() {
        let mock = MockTransport::new();
        mock.set_connect_failures(2);
        assert!(mock.connect("A4").await.is_err());
        assert!(mock.connect("A4").await.is_err());
        mock.connect("A4").await.unwrap();
        assert_eq!(mock.connect_count(), 3);
        assert!(mock.is_connected().await);
    }

    #[tokio::test]
    async fn test_lookup_respects_service() {
        let mock = MockTransport::new();
        mock.connect("A4").await.unwrap();
        assert!(
            mock.characteristic(BATTERY_SERVICE, TEMPERATURE)
                .await
                .unwrap()
                .is_none()
        );
        mock.remove_characteristic(HUMIDITY).await;
        assert!(
            mock.characteristic(ENVIRONMENTAL_SENSING_SERVICE, HUMIDITY)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_read_settings_command_notifies_record() {
        let mock = MockTransport::new();
        mock.connect("A4").await.unwrap();
        let handle = command_handle(&mock).await;
        let (handler, seen) = capture();

        mock.subscribe(&handle, handler).await.unwrap();
        mock.write(&handle, &[0x55], true).await.unwrap();

        assert_eq!(seen.lock().unwrap().as_slice(), &[DEFAULT_SETTINGS_RECORD.to_vec()]);
    }

    #[tokio::test]
    async fn test_write_settings_keeps_hw_version() {
        let mut record = DEFAULT_SETTINGS_RECORD;
        record[11] = 9;
        let mock = MockTransport::with_settings_record(&record);
        mock.connect("A4").await.unwrap();
        let handle = command_handle(&mock).await;

        let mut settings = DeviceSettings::decode(&record).unwrap();
        settings.fahrenheit = true;
        settings.averaging_measurements_steps = 7;
        mock.write(&handle, &settings.encode(), true).await.unwrap();

        let stored = DeviceSettings::decode(&mock.settings_record().await).unwrap();
        assert!(stored.fahrenheit);
        assert_eq!(stored.averaging_measurements_steps, 7);
        assert_eq!(stored.hw_version.to_u8(), 9);
    }

    #[tokio::test]
    async fn test_silent_device_never_notifies() {
        let mock = MockTransport::new();
        mock.set_silent(true);
        mock.connect("A4").await.unwrap();
        let handle = command_handle(&mock).await;
        let (handler, seen) = capture();

        mock.subscribe(&handle, handler).await.unwrap();
        mock.write(&handle, &[0x55], true).await.unwrap();
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_set_clock_is_recorded() {
        let mock = MockTransport::new();
        mock.connect("A4").await.unwrap();
        let handle = command_handle(&mock).await;
        mock.write(&handle, &commands::set_clock(1_700_000_000), true)
            .await
            .unwrap();
        assert_eq!(mock.clock().await, Some(1_700_000_000));
    }

    #[tokio::test]
    async fn test_disconnect_drops_subscriptions() {
        let mock = MockTransport::new();
        mock.connect("A4").await.unwrap();
        let handle = command_handle(&mock).await;
        let (handler, _) = capture();
        mock.subscribe(&handle, handler).await.unwrap();
        assert_eq!(mock.subscriptions().await.len(), 1);

        mock.disconnect().await.unwrap();
        assert!(mock.subscriptions().await.is_empty());
        assert!(!mock.push_notification(COMMAND, &[0x55]).await);
        assert_eq!(
            mock.ops().await,
            vec![
                MockOp::Connect("A4".to_string()),
                MockOp::Subscribe(COMMAND),
                MockOp::Disconnect,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_scanner_replays_batches() {
        let scanner = MockScanner::new();
        scanner.push_batch(vec![Advertisement {
            address: "A4:C1:38:00:00:01".to_string(),
            name: None,
            payload: vec![0x05, 0x16, 0xD2, 0xFC, 0x01, 0x64],
            rssi: None,
        }]);

        assert_eq!(scanner.scan(Duration::from_secs(5)).await.unwrap().len(), 1);
        assert!(scanner.scan(Duration::from_secs(5)).await.unwrap().is_empty());
        assert_eq!(scanner.scan_count(), 2);
    }
}
