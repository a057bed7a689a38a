//! Device settings record and its wire codec.
//!
//! The firmware reports its configuration as a 13-byte notification on the
//! command characteristic and accepts a 12-byte write to replace it:
//!
//! | Byte | Read (13 bytes)                  | Write (12 bytes)             |
//! |------|----------------------------------|------------------------------|
//! | 0    | command echo (`0x55`)            | `0x55`                       |
//! | 1    | length                           | `0x0A`                       |
//! | 2    | flags, advertising format        | same                         |
//! | 3    | radio flags, smiley              | same                         |
//! | 4    | temperature offset (i8, tenths)  | same                         |
//! | 5    | humidity offset (i8, tenths)     | same                         |
//! | 6    | advertising interval steps       | same                         |
//! | 7    | measure interval steps           | same                         |
//! | 8    | RF TX power code                 | same                         |
//! | 9    | connect latency steps            | same                         |
//! | 10   | LCD update interval steps        | same                         |
//! | 11   | hardware version                 | averaging measurement steps  |
//! | 12   | averaging measurement steps      | -                            |

use core::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{ParseError, ParseResult};
use crate::power::RfTxPower;

/// Opcode for a settings read request and the header of a settings write.
pub const SETTINGS_OPCODE: u8 = 0x55;

/// Payload length byte of a settings write.
pub const SETTINGS_WRITE_LENGTH: u8 = 0x0A;

/// Minimum length of a settings notification.
pub const SETTINGS_RECORD_LEN: usize = 13;

/// Length of an encoded settings write.
pub const SETTINGS_WRITE_LEN: usize = 12;

/// Duration of one advertising interval step in milliseconds.
pub const ADVERTISING_INTERVAL_STEP_MS: f32 = 62.5;

/// Duration of one connect latency step in milliseconds.
pub const CONNECT_LATENCY_STEP_MS: u16 = 20;

/// Duration of one LCD update interval step in milliseconds.
pub const LCD_UPDATE_INTERVAL_STEP_MS: u16 = 50;

/// Advertising payload format selected on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum AdvertisingFormat {
    /// Legacy big-endian frame with whole-tenth temperature.
    Atc1441 = 0,
    /// Custom little-endian frame with hundredth precision.
    #[default]
    Pvvx = 1,
    /// Reserved by the firmware for the stock Xiaomi format; never decoded.
    Xiaomi = 2,
    /// BTHome object stream.
    BtHome = 3,
}

impl AdvertisingFormat {
    /// Convert the low two bits of `value` to a format.
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value & 0x03 {
            0 => Self::Atc1441,
            1 => Self::Pvvx,
            2 => Self::Xiaomi,
            _ => Self::BtHome,
        }
    }

    /// The two-bit wire value.
    #[must_use]
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for AdvertisingFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Atc1441 => write!(f, "ATC1441"),
            Self::Pvvx => write!(f, "pvvx"),
            Self::Xiaomi => write!(f, "Xiaomi"),
            Self::BtHome => write!(f, "BTHome"),
        }
    }
}

/// Comfort indicator shown on the display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum Smiley {
    #[default]
    Off = 0,
    Happy = 1,
    Sad = 2,
    Ooo = 3,
    PermanentOff = 4,
    PermanentHappy = 5,
    PermanentSad = 6,
    PermanentOoo = 7,
}

impl Smiley {
    /// Convert the low three bits of `value` to a smiley.
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value & 0x07 {
            0 => Self::Off,
            1 => Self::Happy,
            2 => Self::Sad,
            3 => Self::Ooo,
            4 => Self::PermanentOff,
            5 => Self::PermanentHappy,
            6 => Self::PermanentSad,
            _ => Self::PermanentOoo,
        }
    }

    /// The three-bit wire value.
    #[must_use]
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Hardware revision reported by the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[non_exhaustive]
pub enum HwVersion {
    Lywsd03mmcB14,
    MhoC401,
    Cgg1,
    Lywsd03mmcB19,
    Lywsd03mmcB16,
    Lywsd03mmcB17,
    Cgdk2,
    Cgg1v2022,
    MhoC401v2022,
    Mjwsd05mmc,
    Lywsd03mmcB15,
    MhoC122,
    /// Extended id; the real model is reported elsewhere.
    Extended,
    Tb03f,
    Ts0201,
    Tnk01,
    Th03z,
    Zth01,
    Zth02,
    Plm1,
    /// An id this crate does not know about.
    Unknown(u8),
}

impl HwVersion {
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Lywsd03mmcB14,
            1 => Self::MhoC401,
            2 => Self::Cgg1,
            3 => Self::Lywsd03mmcB19,
            4 => Self::Lywsd03mmcB16,
            5 => Self::Lywsd03mmcB17,
            6 => Self::Cgdk2,
            7 => Self::Cgg1v2022,
            8 => Self::MhoC401v2022,
            9 => Self::Mjwsd05mmc,
            10 => Self::Lywsd03mmcB15,
            11 => Self::MhoC122,
            15 => Self::Extended,
            16 => Self::Tb03f,
            17 => Self::Ts0201,
            18 => Self::Tnk01,
            22 => Self::Th03z,
            27 => Self::Zth01,
            28 => Self::Zth02,
            29 => Self::Plm1,
            other => Self::Unknown(other),
        }
    }

    #[must_use]
    pub fn to_u8(self) -> u8 {
        match self {
            Self::Lywsd03mmcB14 => 0,
            Self::MhoC401 => 1,
            Self::Cgg1 => 2,
            Self::Lywsd03mmcB19 => 3,
            Self::Lywsd03mmcB16 => 4,
            Self::Lywsd03mmcB17 => 5,
            Self::Cgdk2 => 6,
            Self::Cgg1v2022 => 7,
            Self::MhoC401v2022 => 8,
            Self::Mjwsd05mmc => 9,
            Self::Lywsd03mmcB15 => 10,
            Self::MhoC122 => 11,
            Self::Extended => 15,
            Self::Tb03f => 16,
            Self::Ts0201 => 17,
            Self::Tnk01 => 18,
            Self::Th03z => 22,
            Self::Zth01 => 27,
            Self::Zth02 => 28,
            Self::Plm1 => 29,
            Self::Unknown(value) => value,
        }
    }
}

impl Default for HwVersion {
    fn default() -> Self {
        Self::Lywsd03mmcB14
    }
}

impl fmt::Display for HwVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Lywsd03mmcB14 => "LYWSD03MMC B1.4",
            Self::MhoC401 => "MHO-C401",
            Self::Cgg1 => "CGG1",
            Self::Lywsd03mmcB19 => "LYWSD03MMC B1.9",
            Self::Lywsd03mmcB16 => "LYWSD03MMC B1.6",
            Self::Lywsd03mmcB17 => "LYWSD03MMC B1.7",
            Self::Cgdk2 => "CGDK2",
            Self::Cgg1v2022 => "CGG1 2022",
            Self::MhoC401v2022 => "MHO-C401 2022",
            Self::Mjwsd05mmc => "MJWSD05MMC",
            Self::Lywsd03mmcB15 => "LYWSD03MMC B1.5",
            Self::MhoC122 => "MHO-C122",
            Self::Extended => "extended",
            Self::Tb03f => "TB03F",
            Self::Ts0201 => "TS0201",
            Self::Tnk01 => "TNK01",
            Self::Th03z => "TH03Z",
            Self::Zth01 => "ZTH01",
            Self::Zth02 => "ZTH02",
            Self::Plm1 => "PLM1",
            Self::Unknown(value) => return write!(f, "unknown ({value})"),
        };
        f.write_str(name)
    }
}

/// Configuration record of a thermometer.
///
/// Timing fields are raw firmware steps; the `*_ms` accessors convert them.
/// `temp_offset_cal` and `humidity_offset_cal` are kept for callers that
/// track calibration locally and are not part of the wire record.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeviceSettings {
    pub low_power: bool,
    pub transmit_measurements: bool,
    pub show_battery: bool,
    pub fahrenheit: bool,
    pub blinking_smile: bool,
    pub comfort_smiley: bool,
    pub advertising_format: AdvertisingFormat,
    pub smiley: Smiley,
    pub screen_off: bool,
    pub long_range: bool,
    pub bt5_phy: bool,
    pub adv_flags: bool,
    pub adv_crypto: bool,
    /// Temperature offset in °C (0.1 resolution on the wire).
    pub temp_offset: f32,
    /// Humidity offset in % (0.1 resolution on the wire).
    pub humidity_offset: f32,
    pub temp_offset_cal: i8,
    pub humidity_offset_cal: i8,
    pub advertising_interval_steps: u8,
    pub measure_interval_steps: u8,
    pub rf_tx_power: RfTxPower,
    pub connect_latency_steps: u8,
    pub lcd_update_interval_steps: u8,
    /// Read-only; never written back to the device.
    pub hw_version: HwVersion,
    pub averaging_measurements_steps: u8,
}

impl DeviceSettings {
    /// Decode a settings notification.
    ///
    /// Bytes 0 and 1 are the command echo and are skipped; bytes past 12 are
    /// ignored.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::TooShort`] if `data` has fewer than
    /// [`SETTINGS_RECORD_LEN`] bytes.
    #[must_use = "parsing returns a Result that should be handled"]
    pub fn decode(data: &[u8]) -> ParseResult<Self> {
        ParseError::check_length(data, SETTINGS_RECORD_LEN)?;

        let flags = data[2];
        let radio = data[3];

        Ok(Self {
            low_power: flags & 0x80 != 0,
            transmit_measurements: flags & 0x40 != 0,
            show_battery: flags & 0x20 != 0,
            fahrenheit: flags & 0x10 != 0,
            blinking_smile: flags & 0x08 != 0,
            comfort_smiley: flags & 0x04 != 0,
            advertising_format: AdvertisingFormat::from_u8(flags),
            screen_off: radio & 0x80 != 0,
            long_range: radio & 0x40 != 0,
            bt5_phy: radio & 0x20 != 0,
            adv_flags: radio & 0x10 != 0,
            adv_crypto: radio & 0x08 != 0,
            smiley: Smiley::from_u8(radio),
            temp_offset: f32::from(data[4] as i8) / 10.0,
            humidity_offset: f32::from(data[5] as i8) / 10.0,
            temp_offset_cal: 0,
            humidity_offset_cal: 0,
            advertising_interval_steps: data[6],
            measure_interval_steps: data[7],
            rf_tx_power: RfTxPower::from_u8(data[8]),
            connect_latency_steps: data[9],
            lcd_update_interval_steps: data[10],
            hw_version: HwVersion::from_u8(data[11]),
            averaging_measurements_steps: data[12],
        })
    }

    /// Encode the record as a settings write.
    ///
    /// Offsets are scaled by ten and truncated toward zero, so sub-tenth
    /// fractions are lost. The hardware version is not written.
    #[must_use]
    pub fn encode(&self) -> [u8; SETTINGS_WRITE_LEN] {
        let mut flags = self.advertising_format.to_u8();
        if self.low_power {
            flags |= 0x80;
        }
        if self.transmit_measurements {
            flags |= 0x40;
        }
        if self.show_battery {
            flags |= 0x20;
        }
        if self.fahrenheit {
            flags |= 0x10;
        }
        if self.blinking_smile {
            flags |= 0x08;
        }
        if self.comfort_smiley {
            flags |= 0x04;
        }

        let mut radio = self.smiley.to_u8();
        if self.screen_off {
            radio |= 0x80;
        }
        if self.long_range {
            radio |= 0x40;
        }
        if self.bt5_phy {
            radio |= 0x20;
        }
        if self.adv_flags {
            radio |= 0x10;
        }
        if self.adv_crypto {
            radio |= 0x08;
        }

        [
            SETTINGS_OPCODE,
            SETTINGS_WRITE_LENGTH,
            flags,
            radio,
            tenths(self.temp_offset) as u8,
            tenths(self.humidity_offset) as u8,
            self.advertising_interval_steps,
            self.measure_interval_steps,
            self.rf_tx_power.to_u8(),
            self.connect_latency_steps,
            self.lcd_update_interval_steps,
            self.averaging_measurements_steps,
        ]
    }

    // --- Timing conversions ---

    /// Advertising interval in milliseconds.
    #[must_use]
    pub fn advertising_interval_ms(&self) -> u16 {
        (f32::from(self.advertising_interval_steps) * ADVERTISING_INTERVAL_STEP_MS) as u16
    }

    /// Set the advertising interval, truncated to whole steps.
    pub fn set_advertising_interval_ms(&mut self, ms: u16) {
        self.advertising_interval_steps = (f32::from(ms) / ADVERTISING_INTERVAL_STEP_MS) as u8;
    }

    /// Measurement interval in milliseconds (a multiple of the advertising interval).
    #[must_use]
    pub fn measure_interval_ms(&self) -> u32 {
        u32::from(self.measure_interval_steps) * u32::from(self.advertising_interval_ms())
    }

    /// Set the measurement interval, truncated to whole advertising intervals.
    ///
    /// # Errors
    ///
    /// Fails when the advertising interval is zero.
    pub fn set_measure_interval_ms(&mut self, ms: u32) -> ParseResult<()> {
        let step = u32::from(self.advertising_interval_ms());
        if step == 0 {
            return Err(ParseError::InvalidData(
                "advertising interval is zero".to_string(),
            ));
        }
        self.measure_interval_steps = saturate_steps(ms / step);
        Ok(())
    }

    /// Connection latency in milliseconds.
    #[must_use]
    pub fn connect_latency_ms(&self) -> u16 {
        u16::from(self.connect_latency_steps) * CONNECT_LATENCY_STEP_MS
    }

    pub fn set_connect_latency_ms(&mut self, ms: u16) {
        self.connect_latency_steps = saturate_steps(u32::from(ms / CONNECT_LATENCY_STEP_MS));
    }

    /// LCD refresh interval in milliseconds.
    #[must_use]
    pub fn lcd_update_interval_ms(&self) -> u16 {
        u16::from(self.lcd_update_interval_steps) * LCD_UPDATE_INTERVAL_STEP_MS
    }

    pub fn set_lcd_update_interval_ms(&mut self, ms: u16) {
        self.lcd_update_interval_steps =
            saturate_steps(u32::from(ms / LCD_UPDATE_INTERVAL_STEP_MS));
    }

    /// Averaging window in milliseconds (a multiple of the measurement interval).
    #[must_use]
    pub fn averaging_measurements_ms(&self) -> u32 {
        self.measure_interval_ms() * u32::from(self.averaging_measurements_steps)
    }

    /// Set the averaging window, truncated to whole measurement intervals.
    ///
    /// # Errors
    ///
    /// Fails when the measurement interval is zero.
    pub fn set_averaging_measurements_ms(&mut self, ms: u32) -> ParseResult<()> {
        let step = self.measure_interval_ms();
        if step == 0 {
            return Err(ParseError::InvalidData(
                "measure interval is zero".to_string(),
            ));
        }
        self.averaging_measurements_steps = saturate_steps(ms / step);
        Ok(())
    }

    /// Averaging window in whole seconds.
    #[must_use]
    pub fn averaging_measurements_sec(&self) -> u32 {
        self.averaging_measurements_ms() / 1000
    }

    /// Set the averaging window in seconds.
    ///
    /// # Errors
    ///
    /// Fails when the measurement interval is zero.
    pub fn set_averaging_measurements_sec(&mut self, sec: u32) -> ParseResult<()> {
        self.set_averaging_measurements_ms(sec.saturating_mul(1000))
    }

    /// Transmit power in dBm (0.0 for a code outside the power table).
    #[must_use]
    pub fn rf_tx_power_dbm(&self) -> f32 {
        self.rf_tx_power.dbm_or_zero()
    }

    /// Select the table power nearest to `dbm`.
    pub fn set_rf_tx_power_dbm(&mut self, dbm: f32) {
        self.rf_tx_power = RfTxPower::from_dbm(dbm);
    }
}

/// Scale an offset to tenths and truncate toward zero.
///
/// Values within float noise of a whole tenth snap to it, so decoded offsets
/// re-encode unchanged.
fn tenths(value: f32) -> i8 {
    let scaled = value * 10.0;
    let nearest = scaled.round();
    let whole = if (scaled - nearest).abs() < 1e-3 {
        nearest
    } else {
        scaled.trunc()
    };
    whole as i8
}

fn saturate_steps(steps: u32) -> u8 {
    u8::try_from(steps).unwrap_or(u8::MAX)
}
