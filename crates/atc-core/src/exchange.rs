//! Request/response round trips on the command characteristic.
//!
//! Every exchange follows the same sequence:
//!
//! 1. connect (retried with a fixed backoff)
//! 2. look up the command characteristic and check it can notify
//! 3. subscribe
//! 4. write the request
//! 5. poll for the first notification until the deadline
//! 6. unsubscribe, whatever the outcome
//!
//! The caller must hold the session's link lock for the whole exchange.

use std::sync::{Arc, OnceLock};

use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use atc_types::DeviceSettings;
use atc_types::uuid::{COMMAND, COMMAND_SERVICE};

use crate::commands;
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::retry::with_retry;
use crate::transport::{CharacteristicHandle, NotificationHandler, Transport};

/// Connect unless the link is already up.
///
/// # Errors
///
/// Returns [`Error::ConnectionFailed`] once the retry budget is spent.
pub async fn ensure_connected<T: Transport + ?Sized>(
    transport: &T,
    address: &str,
    config: &SessionConfig,
) -> Result<()> {
    if transport.is_connected().await {
        return Ok(());
    }

    let retry = config.connect_retry();
    with_retry(&retry, "connect", || transport.connect(address))
        .await
        .map_err(|e| {
            warn!(address, error = %e, "Giving up on connect");
            Error::ConnectionFailed {
                address: address.to_string(),
                attempts: retry.attempts(),
            }
        })
}

/// Settings exchange bound to one transport.
pub struct SettingsExchange<'a, T: Transport + ?Sized> {
    transport: &'a T,
    address: &'a str,
    config: &'a SessionConfig,
}

impl<'a, T: Transport + ?Sized> SettingsExchange<'a, T> {
    pub fn new(transport: &'a T, address: &'a str, config: &'a SessionConfig) -> Self {
        Self {
            transport,
            address,
            config,
        }
    }

    /// Request and decode the settings record.
    ///
    /// # Errors
    ///
    /// Transport and timeout errors, or [`Error::Parse`] when the response is
    /// shorter than a settings record.
    pub async fn read_settings(&self) -> Result<DeviceSettings> {
        let response = self
            .round_trip("read settings", &commands::read_settings(), true)
            .await?;
        let settings = DeviceSettings::decode(&response).inspect_err(|e| {
            warn!(address = self.address, error = %e, "Invalid settings response");
        })?;
        Ok(settings)
    }

    /// Push a full settings record.
    ///
    /// Returns the record the device echoes back, or `None` when the echo
    /// does not decode.
    pub async fn write_settings(&self, settings: &DeviceSettings) -> Result<Option<DeviceSettings>> {
        let response = self
            .round_trip("write settings", &settings.encode(), false)
            .await?;
        Ok(DeviceSettings::decode(&response).ok())
    }

    /// Restore factory settings.
    pub async fn reset(&self) -> Result<()> {
        self.round_trip("reset settings", &commands::reset_settings(), false)
            .await
            .map(drop)
    }

    /// Set the device clock.
    pub async fn set_clock(&self, unix_seconds: u32) -> Result<()> {
        self.round_trip("set clock", &commands::set_clock(unix_seconds), false)
            .await
            .map(drop)
    }

    /// Run one exchange and return the raw response.
    ///
    /// `settle` waits [`SessionConfig::settle_delay`] between subscribing
    /// and writing, which the firmware needs before its first read request.
    pub async fn round_trip(&self, operation: &str, request: &[u8], settle: bool) -> Result<Vec<u8>> {
        ensure_connected(self.transport, self.address, self.config).await?;

        let handle = self
            .transport
            .characteristic(COMMAND_SERVICE, COMMAND)
            .await?
            .ok_or_else(|| Error::characteristic_not_found(COMMAND_SERVICE, COMMAND))?;
        if !handle.can_notify {
            return Err(Error::NotifyUnsupported {
                characteristic: COMMAND,
            });
        }

        let response = Arc::new(OnceLock::new());
        let slot = Arc::clone(&response);
        let on_notify: NotificationHandler = Arc::new(move |data: &[u8]| {
            if !data.is_empty() {
                let _ = slot.set(data.to_vec());
            }
        });
        self.transport.subscribe(&handle, on_notify).await?;

        let outcome = self
            .await_response(operation, &handle, request, settle, &response)
            .await;

        if let Err(e) = self.transport.unsubscribe(&handle).await {
            debug!(address = self.address, error = %e, "Unsubscribe after {} failed", operation);
        }

        match &outcome {
            Ok(bytes) => debug!(address = self.address, len = bytes.len(), "{} answered", operation),
            Err(e) => warn!(address = self.address, error = %e, "{} failed", operation),
        }
        outcome
    }

    async fn await_response(
        &self,
        operation: &str,
        handle: &CharacteristicHandle,
        request: &[u8],
        settle: bool,
        response: &OnceLock<Vec<u8>>,
    ) -> Result<Vec<u8>> {
        if settle && !self.config.settle_delay.is_zero() {
            sleep(self.config.settle_delay).await;
        }

        self.transport.write(handle, request, true).await?;

        let deadline = Instant::now() + self.config.exchange_timeout;
        loop {
            if let Some(bytes) = response.get() {
                return Ok(bytes.clone());
            }
            if Instant::now() >= deadline {
                return Err(Error::timeout(operation, self.config.exchange_timeout));
            }
            sleep(self.config.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::mock::{DEFAULT_SETTINGS_RECORD, MockOp, MockTransport};

    const ADDRESS: &str = "A4:C1:38:00:00:01";

    fn config() -> SessionConfig {
        SessionConfig::default()
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_settings_round_trip() {
        let mock = MockTransport::new();
        let config = config();
        let settings = SettingsExchange::new(&mock, ADDRESS, &config)
            .read_settings()
            .await
            .unwrap();

        assert_eq!(settings, DeviceSettings::decode(&DEFAULT_SETTINGS_RECORD).unwrap());
        assert_eq!(
            mock.ops().await,
            vec![
                MockOp::Connect(ADDRESS.to_string()),
                MockOp::Subscribe(COMMAND),
                MockOp::Write(COMMAND, vec![0x55]),
                MockOp::Unsubscribe(COMMAND),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_settle_delay_only_on_read() {
        let mock = MockTransport::new();
        let config = config();
        let exchange = SettingsExchange::new(&mock, ADDRESS, &config);

        let started = Instant::now();
        exchange.read_settings().await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(1));

        let started = Instant::now();
        exchange.set_clock(1_700_000_000).await.unwrap();
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_device_times_out_and_unsubscribes() {
        let mock = MockTransport::new();
        mock.set_silent(true);
        let config = config();

        let started = Instant::now();
        let result = SettingsExchange::new(&mock, ADDRESS, &config)
            .read_settings()
            .await;

        assert!(matches!(result, Err(Error::Timeout { .. })));
        // settle delay + exchange deadline
        assert!(started.elapsed() >= Duration::from_secs(6));
        assert!(started.elapsed() <= Duration::from_millis(6100));
        assert_eq!(mock.ops().await.last(), Some(&MockOp::Unsubscribe(COMMAND)));
        assert!(mock.subscriptions().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retries_then_fails() {
        let mock = MockTransport::new();
        mock.set_unreachable(true);
        let config = config();

        let started = Instant::now();
        let result = SettingsExchange::new(&mock, ADDRESS, &config)
            .read_settings()
            .await;

        assert!(matches!(
            result,
            Err(Error::ConnectionFailed { attempts: 5, .. })
        ));
        assert_eq!(mock.connect_count(), 5);
        assert_eq!(started.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_command_characteristic() {
        let mock = MockTransport::new();
        mock.remove_characteristic(COMMAND).await;
        let config = config();

        let result = SettingsExchange::new(&mock, ADDRESS, &config)
            .read_settings()
            .await;
        assert!(matches!(result, Err(Error::CharacteristicNotFound { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_characteristic_must_notify() {
        let mock = MockTransport::new();
        mock.disable_notify(COMMAND).await;
        let config = config();

        let result = SettingsExchange::new(&mock, ADDRESS, &config)
            .read_settings()
            .await;
        assert!(matches!(result, Err(Error::NotifyUnsupported { .. })));
        assert!(!mock.ops().await.contains(&MockOp::Subscribe(COMMAND)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_response_is_a_parse_error() {
        let mock = MockTransport::with_settings_record(&[0x55, 0x0A, 0x00]);
        let config = config();

        let result = SettingsExchange::new(&mock, ADDRESS, &config)
            .read_settings()
            .await;
        assert!(matches!(result, Err(Error::Parse(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_settings_returns_echo() {
        let mock = MockTransport::new();
        let config = config();
        let exchange = SettingsExchange::new(&mock, ADDRESS, &config);

        let mut settings = exchange.read_settings().await.unwrap();
        settings.fahrenheit = true;
        let echoed = exchange.write_settings(&settings).await.unwrap();
        assert_eq!(echoed, Some(settings));
    }
}
