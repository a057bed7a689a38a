//! Error types for atc-core.
//!
//! This module defines the errors that can occur when talking to a
//! thermometer through a [`Transport`](crate::Transport).
//!
//! # Error Recovery
//!
//! | Error Type | Strategy |
//! |------------|----------|
//! | [`Error::Timeout`] | Retry; the device may have missed the request |
//! | [`Error::Bluetooth`] | Retry, then reconnect |
//! | [`Error::NotConnected`] | Reconnect |
//! | [`Error::ConnectionFailed`] | Already retried; report to the caller |
//! | [`Error::WriteFailed`] | Retry once or twice |
//! | [`Error::CharacteristicNotFound`] | Do not retry; firmware lacks the feature |
//! | [`Error::NotifyUnsupported`] | Do not retry; firmware lacks the feature |
//! | [`Error::Parse`] | Do not retry; the device sent malformed data |
//! | [`Error::InvalidConfig`] | Fix configuration and restart |
//!
//! Session getters never surface these errors directly: they log the failure
//! and keep the last known value. Use the `read_*` and
//! [`ensure_settings_loaded`](crate::DeviceSession::ensure_settings_loaded)
//! methods when the failure itself matters.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use atc_types::ParseError;

/// Errors that can occur when communicating with a thermometer.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bluetooth Low Energy error.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Transport-specific failure that is not a btleplug error.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Operation attempted while not connected to device.
    #[error("Not connected to device")]
    NotConnected,

    /// The transport could not connect within the retry budget.
    #[error("Failed to connect to {address} after {attempts} attempts")]
    ConnectionFailed {
        /// Address of the thermometer.
        address: String,
        /// Number of attempts made.
        attempts: u32,
    },

    /// Required BLE characteristic not found on device.
    #[error("Characteristic {characteristic} not found in service {service}")]
    CharacteristicNotFound {
        /// Service that was searched.
        service: Uuid,
        /// The characteristic that was not found.
        characteristic: Uuid,
    },

    /// A characteristic that must notify does not support notifications.
    #[error("Characteristic {characteristic} does not support notifications")]
    NotifyUnsupported {
        /// The characteristic UUID.
        characteristic: Uuid,
    },

    /// Write operation failed.
    #[error("Write failed to characteristic {characteristic}: {reason}")]
    WriteFailed {
        /// The characteristic UUID.
        characteristic: Uuid,
        /// The reason for the failure.
        reason: String,
    },

    /// Operation timed out.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The timeout duration.
        duration: Duration,
    },

    /// Settings have not been read from the device yet.
    #[error("Device settings are not known")]
    SettingsUnknown,

    /// Malformed data received from the device.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Create a timeout error with operation context.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create a characteristic not found error.
    pub fn characteristic_not_found(service: Uuid, characteristic: Uuid) -> Self {
        Self::CharacteristicNotFound {
            service,
            characteristic,
        }
    }

    /// Create a write failure error.
    pub fn write_failed(characteristic: Uuid, reason: impl Into<String>) -> Self {
        Self::WriteFailed {
            characteristic,
            reason: reason.into(),
        }
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }
}

/// Result type alias using atc-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use atc_types::uuid::{COMMAND, COMMAND_SERVICE};

    #[test]
    fn test_timeout_display() {
        let err = Error::timeout("read settings", Duration::from_secs(5));
        assert_eq!(
            err.to_string(),
            "Operation 'read settings' timed out after 5s"
        );
    }

    #[test]
    fn test_characteristic_not_found_display() {
        let err = Error::characteristic_not_found(COMMAND_SERVICE, COMMAND);
        let msg = err.to_string();
        assert!(msg.contains("00001f1f"));
        assert!(msg.contains("00001f10"));
    }

    #[test]
    fn test_parse_error_is_transparent() {
        let err: Error = ParseError::TooShort {
            expected: 13,
            actual: 4,
        }
        .into();
        assert_eq!(err.to_string(), "Payload too short: requires 13 bytes, got 4");
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn test_connection_failed_display() {
        let err = Error::ConnectionFailed {
            address: "A4:C1:38:00:00:01".to_string(),
            attempts: 5,
        };
        assert_eq!(
            err.to_string(),
            "Failed to connect to A4:C1:38:00:00:01 after 5 attempts"
        );
    }
}
