//! Per-thermometer session.
//!
//! A [`DeviceSession`] caches the last [`Reading`] and [`DeviceSettings`] of
//! one thermometer and decides, per [`ConnectionMode`], whether a getter can
//! answer from the cache or must talk to the device:
//!
//! | Mode | Getter behaviour |
//! |------|------------------|
//! | `Advertising` | cached value from the last decoded advertisement |
//! | `Notification` | one read to seed a field that is not subscribed, then cached |
//! | `Connection` | a characteristic read on every call |
//!
//! Every getter first makes sure the settings are known, because the
//! advertising format decides how cached temperatures are reported.
//!
//! Transport operations are serialized by a per-session lock. The cache sits
//! behind its own lock, never held across an `.await`, so notification
//! callbacks can update it while an exchange is in flight.

use std::sync::{Arc, PoisonError, RwLock};

use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use atc_types::uuid::{
    BATTERY_LEVEL, BATTERY_SERVICE, ENVIRONMENTAL_SENSING_SERVICE, HUMIDITY, TEMPERATURE,
    TEMPERATURE_PRECISE,
};
use atc_types::{
    AdvertisingFormat, ConnectionMode, DeviceSettings, ParseResult, Reading, RfTxPower, Smiley,
    advertising,
};

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::exchange::{SettingsExchange, ensure_connected};
use crate::transport::{NotificationHandler, Transport};

/// A GATT measurement characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Measurement {
    Temperature,
    TemperaturePrecise,
    Humidity,
    BatteryLevel,
}

impl Measurement {
    pub const ALL: [Self; 4] = [
        Self::Temperature,
        Self::TemperaturePrecise,
        Self::Humidity,
        Self::BatteryLevel,
    ];

    pub fn service(self) -> Uuid {
        match self {
            Self::BatteryLevel => BATTERY_SERVICE,
            _ => ENVIRONMENTAL_SENSING_SERVICE,
        }
    }

    pub fn characteristic(self) -> Uuid {
        match self {
            Self::Temperature => TEMPERATURE,
            Self::TemperaturePrecise => TEMPERATURE_PRECISE,
            Self::Humidity => HUMIDITY,
            Self::BatteryLevel => BATTERY_LEVEL,
        }
    }

    fn index(self) -> usize {
        self as usize
    }

    /// Apply a characteristic value to `reading`.
    pub fn apply(self, reading: &mut Reading, data: &[u8]) -> ParseResult<()> {
        match self {
            Self::Temperature => reading.apply_temperature(data),
            Self::TemperaturePrecise => reading.apply_temperature_precise(data),
            Self::Humidity => reading.apply_humidity(data),
            Self::BatteryLevel => reading.apply_battery_level(data),
        }
    }
}

#[derive(Debug, Default)]
struct SessionState {
    reading: Reading,
    settings: Option<DeviceSettings>,
    mode: ConnectionMode,
    subscribed: [bool; 4],
}

/// Cache shared with notification callbacks.
#[derive(Debug)]
struct Shared {
    state: RwLock<SessionState>,
    track_time: bool,
}

impl Shared {
    fn read<R>(&self, f: impl FnOnce(&SessionState) -> R) -> R {
        f(&self.state.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn update<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        f(&mut self.state.write().unwrap_or_else(PoisonError::into_inner))
    }

    /// Apply a decoded value to the cached reading.
    ///
    /// The single mutation path for readings, used by reads, notifications
    /// and advertisements alike.
    fn apply_reading<R>(&self, decode: impl FnOnce(&mut Reading) -> ParseResult<R>) -> ParseResult<R> {
        let track_time = self.track_time;
        self.update(|state| {
            let outcome = decode(&mut state.reading)?;
            if track_time {
                state.reading.captured_at = Some(OffsetDateTime::now_utc());
            }
            Ok(outcome)
        })
    }
}

/// Snapshot used to pick the reported value for the current mode.
struct View {
    reading: Reading,
    mode: ConnectionMode,
    format: Option<AdvertisingFormat>,
}

impl View {
    fn advertised_whole_degrees(&self) -> bool {
        self.mode == ConnectionMode::Advertising && self.format == Some(AdvertisingFormat::Atc1441)
    }

    fn temperature(&self) -> f32 {
        match self.mode {
            ConnectionMode::Advertising if !self.advertised_whole_degrees() && self.format.is_some() => {
                (self.reading.temperature_precise * 10.0).round() / 10.0
            }
            _ => self.reading.temperature,
        }
    }

    fn temperature_precise(&self) -> f32 {
        if self.advertised_whole_degrees() {
            self.reading.temperature
        } else {
            self.reading.temperature_precise
        }
    }

    fn battery_millivolts(&self) -> u16 {
        if self.mode == ConnectionMode::Advertising {
            self.reading.battery_millivolts
        } else {
            self.reading.estimated_battery_millivolts()
        }
    }
}

/// Session with one thermometer.
///
/// # Example
///
/// ```no_run
/// use atc_core::{BleTransport, DeviceSession, SessionConfig};
/// use atc_types::ConnectionMode;
///
/// # async fn example() -> atc_core::Result<()> {
/// let transport = BleTransport::new().await?;
/// let config = SessionConfig::default().initial_mode(ConnectionMode::Notification);
/// let session = DeviceSession::with_config("A4:C1:38:12:34:56", transport, config);
///
/// session.init().await?;
/// println!("{:.1} °C", session.temperature().await);
/// session.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct DeviceSession<T: Transport> {
    address: String,
    transport: T,
    config: SessionConfig,
    /// Serializes every transport operation of this session.
    link: Mutex<()>,
    shared: Arc<Shared>,
}

impl<T: Transport> std::fmt::Debug for DeviceSession<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("address", &self.address)
            .field("mode", &self.mode())
            .field("settings_known", &self.settings_known())
            .finish()
    }
}

impl<T: Transport> DeviceSession<T> {
    /// Create a session with default configuration.
    pub fn new(address: impl Into<String>, transport: T) -> Self {
        Self::with_config(address, transport, SessionConfig::default())
    }

    /// Create a session.
    ///
    /// The configured initial mode is recorded but its side effects are only
    /// established by [`init`](Self::init).
    pub fn with_config(address: impl Into<String>, transport: T, config: SessionConfig) -> Self {
        let shared = Arc::new(Shared {
            state: RwLock::new(SessionState {
                mode: config.initial_mode,
                ..Default::default()
            }),
            track_time: config.track_time,
        });
        Self {
            address: address.into(),
            transport,
            config,
            link: Mutex::new(()),
            shared,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn mode(&self) -> ConnectionMode {
        self.shared.read(|s| s.mode)
    }

    /// Whether a settings record has been decoded.
    pub fn settings_known(&self) -> bool {
        self.shared.read(|s| s.settings.is_some())
    }

    /// Last decoded settings, without fetching.
    pub fn cached_settings(&self) -> Option<DeviceSettings> {
        self.shared.read(|s| s.settings)
    }

    /// Copy of the cached reading, without any transport traffic.
    pub fn cached_reading(&self) -> Reading {
        self.shared.read(|s| s.reading)
    }

    /// Whether `measurement` currently has an active subscription.
    pub fn is_subscribed(&self, measurement: Measurement) -> bool {
        self.shared.read(|s| s.subscribed[measurement.index()])
    }

    fn view(&self) -> View {
        self.shared.read(|s| View {
            reading: s.reading,
            mode: s.mode,
            format: s.settings.map(|settings| settings.advertising_format),
        })
    }

    fn exchange(&self) -> SettingsExchange<'_, T> {
        SettingsExchange::new(&self.transport, &self.address, &self.config)
    }

    // --- Lifecycle ---

    /// Connect, read the settings and establish the configured mode.
    ///
    /// Settings are read up to `settings_attempts` times, dropping the link
    /// between failures.
    #[tracing::instrument(level = "debug", skip(self), fields(address = %self.address))]
    pub async fn init(&self) -> Result<()> {
        let _link = self.link.lock().await;

        ensure_connected(&self.transport, &self.address, &self.config).await?;

        let mut last_error = Error::SettingsUnknown;
        for attempt in 1..=self.config.settings_attempts {
            match self.exchange().read_settings().await {
                Ok(settings) => {
                    self.shared.update(|s| s.settings = Some(settings));
                    break;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Reading settings failed");
                    self.drop_link().await;
                    last_error = e;
                }
            }
        }
        if !self.settings_known() {
            warn!("Failed to read settings after {} attempts", self.config.settings_attempts);
            return Err(last_error);
        }

        match self.mode() {
            ConnectionMode::Advertising => self.drop_link().await,
            ConnectionMode::Notification => self.subscribe_all_locked().await?,
            ConnectionMode::Connection => self.read_all_locked().await?,
        }
        info!(mode = %self.mode(), "Session initialized");
        Ok(())
    }

    /// Stop notifications and disconnect.
    #[tracing::instrument(level = "debug", skip(self), fields(address = %self.address))]
    pub async fn shutdown(&self) -> Result<()> {
        let _link = self.link.lock().await;
        self.unsubscribe_all_locked().await;
        self.transport.disconnect().await
    }

    /// Switch the read policy.
    ///
    /// A no-op when `mode` is already active. Otherwise the old mode's
    /// subscriptions are stopped before the new mode connects, subscribes or
    /// reads. The mode is left unchanged if the new mode cannot connect.
    #[tracing::instrument(level = "debug", skip(self), fields(address = %self.address))]
    pub async fn set_connection_mode(&self, mode: ConnectionMode) -> Result<()> {
        let _link = self.link.lock().await;

        let old = self.mode();
        if old == mode {
            return Ok(());
        }

        if old == ConnectionMode::Notification {
            self.unsubscribe_all_locked().await;
        }

        match mode {
            ConnectionMode::Advertising => self.drop_link().await,
            ConnectionMode::Notification => {
                ensure_connected(&self.transport, &self.address, &self.config).await?;
                self.subscribe_all_locked().await?;
            }
            ConnectionMode::Connection => {
                ensure_connected(&self.transport, &self.address, &self.config).await?;
                self.read_all_locked().await?;
            }
        }

        self.shared.update(|s| s.mode = mode);
        info!(from = %old, to = %mode, "Connection mode changed");
        Ok(())
    }

    // --- Settings ---

    /// Return the settings, fetching them first if they are not known yet.
    pub async fn ensure_settings_loaded(&self) -> Result<DeviceSettings> {
        if let Some(settings) = self.cached_settings() {
            return Ok(settings);
        }
        let _link = self.link.lock().await;
        self.settings_locked().await
    }

    /// Settings, or `None` (logged) when they cannot be fetched.
    pub async fn settings(&self) -> Option<DeviceSettings> {
        self.ensure_settings_loaded()
            .await
            .inspect_err(|e| warn!(address = %self.address, error = %e, "Settings unavailable"))
            .ok()
    }

    /// Fetch the settings again, replacing the cached copy on success.
    #[tracing::instrument(level = "debug", skip(self), fields(address = %self.address))]
    pub async fn refresh_settings(&self) -> Result<DeviceSettings> {
        let _link = self.link.lock().await;
        self.fetch_settings_locked().await
    }

    /// Read-modify-write the settings record.
    ///
    /// The current record is fetched if needed, copied, mutated by `f` and
    /// pushed back whole. The cache is only replaced once the device has
    /// accepted the write.
    pub async fn update_settings<F>(&self, f: F) -> Result<DeviceSettings>
    where
        F: FnOnce(&mut DeviceSettings),
    {
        self.try_update_settings(|settings| {
            f(settings);
            Ok(())
        })
        .await
    }

    /// Like [`update_settings`](Self::update_settings) for mutations that can fail.
    #[tracing::instrument(level = "debug", skip_all, fields(address = %self.address))]
    pub async fn try_update_settings<F>(&self, f: F) -> Result<DeviceSettings>
    where
        F: FnOnce(&mut DeviceSettings) -> ParseResult<()>,
    {
        let _link = self.link.lock().await;

        let mut settings = self.settings_locked().await?;
        f(&mut settings)?;

        let outcome = self.exchange().write_settings(&settings).await;
        self.release_link_locked().await;
        let mut stored = outcome?.unwrap_or(settings);
        // Not part of the wire record, so the echo cannot carry them
        stored.temp_offset_cal = settings.temp_offset_cal;
        stored.humidity_offset_cal = settings.humidity_offset_cal;

        self.shared.update(|s| s.settings = Some(stored));
        debug!("Settings written");
        Ok(stored)
    }

    /// Restore factory settings and read them back.
    #[tracing::instrument(level = "debug", skip(self), fields(address = %self.address))]
    pub async fn reset_to_defaults(&self) -> Result<DeviceSettings> {
        let _link = self.link.lock().await;

        if let Err(e) = self.exchange().reset().await {
            self.release_link_locked().await;
            return Err(e);
        }
        self.shared.update(|s| s.settings = None);
        self.fetch_settings_locked().await
    }

    /// Set the device clock.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfig`] for times that do not fit 32-bit Unix seconds.
    #[tracing::instrument(level = "debug", skip(self), fields(address = %self.address))]
    pub async fn set_clock(&self, time: OffsetDateTime) -> Result<()> {
        let seconds = u32::try_from(time.unix_timestamp())
            .map_err(|_| Error::invalid_config(format!("clock value {time} out of range")))?;

        let _link = self.link.lock().await;
        let outcome = self.exchange().set_clock(seconds).await;
        self.release_link_locked().await;
        outcome
    }

    /// Set the device clock to the current time.
    pub async fn sync_clock(&self) -> Result<()> {
        self.set_clock(OffsetDateTime::now_utc()).await
    }

    pub async fn set_low_power(&self, enabled: bool) -> Result<DeviceSettings> {
        self.update_settings(|s| s.low_power = enabled).await
    }

    pub async fn set_transmit_measurements(&self, enabled: bool) -> Result<DeviceSettings> {
        self.update_settings(|s| s.transmit_measurements = enabled).await
    }

    pub async fn set_show_battery(&self, enabled: bool) -> Result<DeviceSettings> {
        self.update_settings(|s| s.show_battery = enabled).await
    }

    pub async fn set_fahrenheit(&self, enabled: bool) -> Result<DeviceSettings> {
        self.update_settings(|s| s.fahrenheit = enabled).await
    }

    pub async fn set_blinking_smile(&self, enabled: bool) -> Result<DeviceSettings> {
        self.update_settings(|s| s.blinking_smile = enabled).await
    }

    pub async fn set_comfort_smiley(&self, enabled: bool) -> Result<DeviceSettings> {
        self.update_settings(|s| s.comfort_smiley = enabled).await
    }

    pub async fn set_advertising_format(&self, format: AdvertisingFormat) -> Result<DeviceSettings> {
        self.update_settings(|s| s.advertising_format = format).await
    }

    pub async fn set_smiley(&self, smiley: Smiley) -> Result<DeviceSettings> {
        self.update_settings(|s| s.smiley = smiley).await
    }

    pub async fn set_screen_off(&self, enabled: bool) -> Result<DeviceSettings> {
        self.update_settings(|s| s.screen_off = enabled).await
    }

    pub async fn set_long_range(&self, enabled: bool) -> Result<DeviceSettings> {
        self.update_settings(|s| s.long_range = enabled).await
    }

    pub async fn set_bt5_phy(&self, enabled: bool) -> Result<DeviceSettings> {
        self.update_settings(|s| s.bt5_phy = enabled).await
    }

    pub async fn set_adv_flags(&self, enabled: bool) -> Result<DeviceSettings> {
        self.update_settings(|s| s.adv_flags = enabled).await
    }

    pub async fn set_adv_crypto(&self, enabled: bool) -> Result<DeviceSettings> {
        self.update_settings(|s| s.adv_crypto = enabled).await
    }

    /// Set the temperature offset in °C (0.1 resolution).
    pub async fn set_temp_offset(&self, offset: f32) -> Result<DeviceSettings> {
        self.update_settings(|s| s.temp_offset = offset).await
    }

    /// Set the humidity offset in % (0.1 resolution).
    pub async fn set_humidity_offset(&self, offset: f32) -> Result<DeviceSettings> {
        self.update_settings(|s| s.humidity_offset = offset).await
    }

    /// Set the local temperature calibration byte.
    ///
    /// The record is still written back whole; the value itself is only kept
    /// in the cache until the next fetch.
    pub async fn set_temp_offset_cal(&self, cal: i8) -> Result<DeviceSettings> {
        self.update_settings(|s| s.temp_offset_cal = cal).await
    }

    /// Set the local humidity calibration byte. See [`set_temp_offset_cal`](Self::set_temp_offset_cal).
    pub async fn set_humidity_offset_cal(&self, cal: i8) -> Result<DeviceSettings> {
        self.update_settings(|s| s.humidity_offset_cal = cal).await
    }

    // Raw step setters

    pub async fn set_advertising_interval_steps(&self, steps: u8) -> Result<DeviceSettings> {
        self.update_settings(|s| s.advertising_interval_steps = steps).await
    }

    pub async fn set_measure_interval_steps(&self, steps: u8) -> Result<DeviceSettings> {
        self.update_settings(|s| s.measure_interval_steps = steps).await
    }

    pub async fn set_connect_latency_steps(&self, steps: u8) -> Result<DeviceSettings> {
        self.update_settings(|s| s.connect_latency_steps = steps).await
    }

    pub async fn set_lcd_update_interval_steps(&self, steps: u8) -> Result<DeviceSettings> {
        self.update_settings(|s| s.lcd_update_interval_steps = steps).await
    }

    pub async fn set_averaging_measurements_steps(&self, steps: u8) -> Result<DeviceSettings> {
        self.update_settings(|s| s.averaging_measurements_steps = steps).await
    }

    pub async fn set_advertising_interval_ms(&self, ms: u16) -> Result<DeviceSettings> {
        self.update_settings(|s| s.set_advertising_interval_ms(ms)).await
    }

    pub async fn set_measure_interval_ms(&self, ms: u32) -> Result<DeviceSettings> {
        self.try_update_settings(|s| s.set_measure_interval_ms(ms)).await
    }

    pub async fn set_connect_latency_ms(&self, ms: u16) -> Result<DeviceSettings> {
        self.update_settings(|s| s.set_connect_latency_ms(ms)).await
    }

    pub async fn set_lcd_update_interval_ms(&self, ms: u16) -> Result<DeviceSettings> {
        self.update_settings(|s| s.set_lcd_update_interval_ms(ms)).await
    }

    pub async fn set_averaging_measurements_ms(&self, ms: u32) -> Result<DeviceSettings> {
        self.try_update_settings(|s| s.set_averaging_measurements_ms(ms))
            .await
    }

    pub async fn set_averaging_measurements_sec(&self, sec: u32) -> Result<DeviceSettings> {
        self.try_update_settings(|s| s.set_averaging_measurements_sec(sec))
            .await
    }

    pub async fn set_rf_tx_power(&self, power: RfTxPower) -> Result<DeviceSettings> {
        self.update_settings(|s| s.rf_tx_power = power).await
    }

    /// Select the table power nearest to `dbm`.
    pub async fn set_rf_tx_power_dbm(&self, dbm: f32) -> Result<DeviceSettings> {
        self.update_settings(|s| s.set_rf_tx_power_dbm(dbm)).await
    }

    // --- Measurements ---

    /// Temperature in °C with 0.1 resolution.
    ///
    /// Falls back to the cached value (logged) when the device cannot be
    /// reached; use [`read_temperature`](Self::read_temperature) to see the
    /// error.
    pub async fn temperature(&self) -> f32 {
        let result = self.read_temperature().await;
        self.or_cached("temperature", result, View::temperature)
    }

    /// Temperature in °C with 0.01 resolution.
    pub async fn temperature_precise(&self) -> f32 {
        let result = self.read_temperature_precise().await;
        self.or_cached("temperature_precise", result, View::temperature_precise)
    }

    /// Relative humidity in %.
    pub async fn humidity(&self) -> f32 {
        let result = self.read_humidity().await;
        self.or_cached("humidity", result, |v| v.reading.humidity)
    }

    /// Battery level in %.
    pub async fn battery_level(&self) -> u8 {
        let result = self.read_battery_level().await;
        self.or_cached("battery_level", result, |v| v.reading.battery_level)
    }

    /// Battery voltage in mV.
    ///
    /// Advertisements carry the measured voltage. Connected modes only see
    /// the level, so the voltage is estimated from it.
    pub async fn battery_millivolts(&self) -> u16 {
        let result = self.read_battery_millivolts().await;
        self.or_cached("battery_millivolts", result, View::battery_millivolts)
    }

    pub async fn read_temperature(&self) -> Result<f32> {
        Ok(self.refresh(Measurement::Temperature).await?.temperature())
    }

    pub async fn read_temperature_precise(&self) -> Result<f32> {
        Ok(self
            .refresh(Measurement::TemperaturePrecise)
            .await?
            .temperature_precise())
    }

    pub async fn read_humidity(&self) -> Result<f32> {
        Ok(self.refresh(Measurement::Humidity).await?.reading.humidity)
    }

    pub async fn read_battery_level(&self) -> Result<u8> {
        Ok(self
            .refresh(Measurement::BatteryLevel)
            .await?
            .reading
            .battery_level)
    }

    pub async fn read_battery_millivolts(&self) -> Result<u16> {
        Ok(self
            .refresh(Measurement::BatteryLevel)
            .await?
            .battery_millivolts())
    }

    fn or_cached<V>(&self, field: &str, result: Result<V>, cached: impl FnOnce(&View) -> V) -> V {
        result.unwrap_or_else(|e| {
            warn!(address = %self.address, field, error = %e, "Using cached value");
            cached(&self.view())
        })
    }

    /// Bring `measurement` up to date for the current mode.
    async fn refresh(&self, measurement: Measurement) -> Result<View> {
        self.ensure_settings_loaded().await?;

        let must_read = match self.mode() {
            ConnectionMode::Advertising => false,
            ConnectionMode::Notification => !self.is_subscribed(measurement),
            ConnectionMode::Connection => true,
        };
        if must_read {
            let _link = self.link.lock().await;
            self.read_measurement_locked(measurement).await?;
        }
        Ok(self.view())
    }

    // --- Advertisements ---

    /// Feed an advertisement payload to the session.
    ///
    /// While the settings are unknown the payload cannot be interpreted: the
    /// settings are fetched instead (dropping the link again in advertising
    /// mode) and the frame is discarded with `Ok(false)`.
    ///
    /// # Errors
    ///
    /// [`Error::Parse`] when the frame is rejected by its decoder, or the
    /// settings fetch error.
    pub async fn handle_advertisement(&self, payload: &[u8]) -> Result<bool> {
        let Some(settings) = self.cached_settings() else {
            let _link = self.link.lock().await;
            if !self.settings_known() {
                debug!(address = %self.address, "Settings unknown, fetching before decoding");
                self.fetch_settings_locked().await?;
            }
            return Ok(false);
        };

        self.shared
            .apply_reading(|reading| {
                advertising::decode(settings.advertising_format, payload, reading)
            })
            .inspect_err(|e| {
                debug!(address = %self.address, error = %e, "Advertisement rejected");
            })?;
        Ok(true)
    }

    // --- Locked helpers; the caller holds `link` ---

    async fn settings_locked(&self) -> Result<DeviceSettings> {
        match self.cached_settings() {
            Some(settings) => Ok(settings),
            None => self.fetch_settings_locked().await,
        }
    }

    async fn fetch_settings_locked(&self) -> Result<DeviceSettings> {
        let outcome = self.exchange().read_settings().await;
        self.release_link_locked().await;
        let settings = outcome?;
        self.shared.update(|s| s.settings = Some(settings));
        Ok(settings)
    }

    /// Advertising mode keeps no link open between operations.
    async fn release_link_locked(&self) {
        if self.mode() == ConnectionMode::Advertising {
            self.drop_link().await;
        }
    }

    async fn drop_link(&self) {
        if let Err(e) = self.transport.disconnect().await {
            debug!(address = %self.address, error = %e, "Disconnect failed");
        }
    }

    async fn read_measurement_locked(&self, measurement: Measurement) -> Result<()> {
        ensure_connected(&self.transport, &self.address, &self.config).await?;
        let handle = self
            .transport
            .characteristic(measurement.service(), measurement.characteristic())
            .await?
            .ok_or_else(|| {
                Error::characteristic_not_found(measurement.service(), measurement.characteristic())
            })?;
        let data = self.transport.read(&handle).await?;
        self.shared
            .apply_reading(|reading| measurement.apply(reading, &data))?;
        Ok(())
    }

    /// Read all four measurements, logging the ones that fail.
    async fn read_all_locked(&self) -> Result<()> {
        for measurement in Measurement::ALL {
            if let Err(e) = self.read_measurement_locked(measurement).await {
                match e {
                    Error::ConnectionFailed { .. } => return Err(e),
                    _ => warn!(address = %self.address, ?measurement, error = %e, "Read failed"),
                }
            }
        }
        Ok(())
    }

    /// Subscribe to every measurement that supports notifications.
    async fn subscribe_all_locked(&self) -> Result<()> {
        for measurement in Measurement::ALL {
            let handle = match self
                .transport
                .characteristic(measurement.service(), measurement.characteristic())
                .await
            {
                Ok(Some(handle)) if handle.can_notify => handle,
                Ok(Some(_)) => {
                    warn!(address = %self.address, ?measurement, "Characteristic cannot notify");
                    continue;
                }
                Ok(None) => {
                    warn!(address = %self.address, ?measurement, "Characteristic not found");
                    continue;
                }
                Err(Error::NotConnected) => return Err(Error::NotConnected),
                Err(e) => {
                    warn!(address = %self.address, ?measurement, error = %e, "Lookup failed");
                    continue;
                }
            };

            let shared = Arc::clone(&self.shared);
            let address = self.address.clone();
            let on_notify: NotificationHandler = Arc::new(move |data: &[u8]| {
                if let Err(e) = shared.apply_reading(|reading| measurement.apply(reading, data)) {
                    debug!(address = %address, ?measurement, error = %e, "Bad notification");
                }
            });

            match self.transport.subscribe(&handle, on_notify).await {
                Ok(()) => self.shared.update(|s| s.subscribed[measurement.index()] = true),
                Err(e) => warn!(address = %self.address, ?measurement, error = %e, "Subscribe failed"),
            }
        }
        Ok(())
    }

    /// Stop every active measurement subscription.
    async fn unsubscribe_all_locked(&self) {
        for measurement in Measurement::ALL {
            if !self.is_subscribed(measurement) {
                continue;
            }
            self.shared
                .update(|s| s.subscribed[measurement.index()] = false);

            let lookup = self
                .transport
                .characteristic(measurement.service(), measurement.characteristic())
                .await;
            if let Ok(Some(handle)) = lookup
                && let Err(e) = self.transport.unsubscribe(&handle).await
            {
                debug!(address = %self.address, ?measurement, error = %e, "Unsubscribe failed");
            }
        }
    }
}
