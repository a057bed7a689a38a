//! Core types for thermometer data.

use core::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{ParseError, ParseResult};

/// Minimum length of the 0x2A1F / 0x2A6E / 0x2A6F characteristic values.
pub const MIN_MEASUREMENT_CHARACTERISTIC_BYTES: usize = 2;

/// Minimum length of the battery level characteristic value.
pub const MIN_BATTERY_CHARACTERISTIC_BYTES: usize = 1;

/// Lower end of the linear battery voltage estimate, in millivolts.
pub const BATTERY_ESTIMATE_MIN_MV: u16 = 2000;

/// Upper end of the linear battery voltage estimate, in millivolts.
pub const BATTERY_ESTIMATE_MAX_MV: u16 = 3000;

/// Last known measurement from a thermometer.
///
/// A reading is produced either by an advertising decoder or by direct
/// characteristic reads. The two temperature fields are updated independently:
/// the legacy advertising format only carries `temperature`, the others only
/// carry `temperature_precise`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Reading {
    /// Temperature in degrees Celsius, 0.1 °C resolution.
    pub temperature: f32,
    /// Temperature in degrees Celsius, 0.01 °C resolution.
    pub temperature_precise: f32,
    /// Relative humidity percentage.
    pub humidity: f32,
    /// Battery level percentage (0-100).
    pub battery_level: u8,
    /// Battery voltage in millivolts.
    pub battery_millivolts: u16,
    /// Timestamp of the last update, when time tracking is enabled.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub captured_at: Option<time::OffsetDateTime>,
}

impl Reading {
    /// Apply a temperature characteristic value (i16 LE, tenths of a degree).
    pub fn apply_temperature(&mut self, data: &[u8]) -> ParseResult<()> {
        self.temperature = f32::from(read_i16_le(data)?) / 10.0;
        Ok(())
    }

    /// Apply a precise temperature characteristic value (i16 LE, hundredths of a degree).
    pub fn apply_temperature_precise(&mut self, data: &[u8]) -> ParseResult<()> {
        self.temperature_precise = f32::from(read_i16_le(data)?) / 100.0;
        Ok(())
    }

    /// Apply a humidity characteristic value (u16 LE, hundredths of a percent).
    pub fn apply_humidity(&mut self, data: &[u8]) -> ParseResult<()> {
        ParseError::check_length(data, MIN_MEASUREMENT_CHARACTERISTIC_BYTES)?;
        self.humidity = f32::from(u16::from_le_bytes([data[0], data[1]])) / 100.0;
        Ok(())
    }

    /// Apply a battery level characteristic value.
    pub fn apply_battery_level(&mut self, data: &[u8]) -> ParseResult<()> {
        ParseError::check_length(data, MIN_BATTERY_CHARACTERISTIC_BYTES)?;
        self.battery_level = data[0];
        Ok(())
    }

    /// Linear estimate of battery voltage from the battery percentage.
    ///
    /// Used when the voltage is not carried by the data source.
    #[must_use]
    pub fn estimated_battery_millivolts(&self) -> u16 {
        let span = u32::from(BATTERY_ESTIMATE_MAX_MV - BATTERY_ESTIMATE_MIN_MV);
        let extra = u32::from(self.battery_level) * span / 100;
        BATTERY_ESTIMATE_MIN_MV.saturating_add(u16::try_from(extra).unwrap_or(u16::MAX))
    }
}

fn read_i16_le(data: &[u8]) -> ParseResult<i16> {
    ParseError::check_length(data, MIN_MEASUREMENT_CHARACTERISTIC_BYTES)?;
    Ok(i16::from_le_bytes([data[0], data[1]]))
}

/// How a session obtains fresh values from its thermometer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
#[repr(u8)]
pub enum ConnectionMode {
    /// Passive: values come from advertisements, no connection is held.
    #[default]
    Advertising = 0,
    /// Connected and subscribed to the measurement characteristics.
    Notification = 1,
    /// Connected; every getter performs a characteristic read.
    Connection = 2,
}

impl ConnectionMode {
    /// Convert a raw byte to a mode.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Advertising),
            1 => Some(Self::Notification),
            2 => Some(Self::Connection),
            _ => None,
        }
    }

    /// The raw byte value of this mode.
    #[must_use]
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Whether this mode holds a transport connection open.
    #[must_use]
    pub fn is_connected_mode(self) -> bool {
        !matches!(self, Self::Advertising)
    }
}

impl TryFrom<u8> for ConnectionMode {
    type Error = ParseError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::from_u8(value).ok_or(ParseError::UnknownValue {
            field: "connection mode",
            value,
        })
    }
}

impl fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Advertising => write!(f, "advertising"),
            Self::Notification => write!(f, "notification"),
            Self::Connection => write!(f, "connection"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reading_default_is_zero() {
        let reading = Reading::default();
        assert_eq!(reading.temperature, 0.0);
        assert_eq!(reading.temperature_precise, 0.0);
        assert_eq!(reading.humidity, 0.0);
        assert_eq!(reading.battery_level, 0);
        assert_eq!(reading.battery_millivolts, 0);
        assert!(reading.captured_at.is_none());
    }

    #[test]
    fn test_apply_temperature() {
        let mut reading = Reading::default();
        // 235 -> 23.5 °C
        reading.apply_temperature(&[0xEB, 0x00]).unwrap();
        assert!((reading.temperature - 23.5).abs() < 0.001);
    }

    #[test]
    fn test_apply_temperature_negative() {
        let mut reading = Reading::default();
        // -52 -> -5.2 °C
        reading.apply_temperature(&(-52i16).to_le_bytes()).unwrap();
        assert!((reading.temperature + 5.2).abs() < 0.001);
    }

    #[test]
    fn test_apply_temperature_precise() {
        let mut reading = Reading::default();
        reading.apply_temperature_precise(&2345i16.to_le_bytes()).unwrap();
        assert!((reading.temperature_precise - 23.45).abs() < 0.001);
    }

    #[test]
    fn test_apply_humidity() {
        let mut reading = Reading::default();
        reading.apply_humidity(&4567u16.to_le_bytes()).unwrap();
        assert!((reading.humidity - 45.67).abs() < 0.001);
    }

    #[test]
    fn test_apply_short_value_keeps_cache() {
        let mut reading = Reading {
            temperature: 21.0,
            humidity: 40.0,
            battery_level: 77,
            ..Default::default()
        };

        assert_eq!(
            reading.apply_temperature(&[0x01]),
            Err(ParseError::TooShort {
                expected: 2,
                actual: 1
            })
        );
        assert!(reading.apply_humidity(&[]).is_err());
        assert!(reading.apply_battery_level(&[]).is_err());

        assert_eq!(reading.temperature, 21.0);
        assert_eq!(reading.humidity, 40.0);
        assert_eq!(reading.battery_level, 77);
    }

    #[test]
    fn test_estimated_battery_millivolts() {
        let mut reading = Reading::default();
        assert_eq!(reading.estimated_battery_millivolts(), 2000);
        reading.battery_level = 50;
        assert_eq!(reading.estimated_battery_millivolts(), 2500);
        reading.battery_level = 100;
        assert_eq!(reading.estimated_battery_millivolts(), 3000);
    }

    #[test]
    fn test_connection_mode_conversions() {
        for mode in [
            ConnectionMode::Advertising,
            ConnectionMode::Notification,
            ConnectionMode::Connection,
        ] {
            assert_eq!(ConnectionMode::from_u8(mode.to_u8()), Some(mode));
        }
        assert_eq!(ConnectionMode::from_u8(3), None);
        assert!(ConnectionMode::try_from(7).is_err());
    }

    #[test]
    fn test_connection_mode_display() {
        assert_eq!(ConnectionMode::Notification.to_string(), "notification");
        assert!(!ConnectionMode::Advertising.is_connected_mode());
        assert!(ConnectionMode::Connection.is_connected_mode());
    }

    #[test]
    fn test_reading_serialization() {
        let reading = Reading {
            temperature: 21.5,
            battery_level: 90,
            ..Default::default()
        };
        let json = serde_json::to_string(&reading).unwrap();
        assert!(json.contains("\"battery_level\":90"));
        assert!(!json.contains("captured_at"));

        let back: Reading = serde_json::from_str(&json).unwrap();
        assert_eq!(back, reading);
    }

    #[test]
    fn test_connection_mode_serialization() {
        assert_eq!(
            serde_json::to_string(&ConnectionMode::Notification).unwrap(),
            "\"notification\""
        );
    }
}
