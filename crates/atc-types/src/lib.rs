//! Platform-agnostic types for ATC/pvvx BLE thermometers.
//!
//! This crate holds everything that can be done without a radio: the
//! measurement and settings data model, the settings record codec, the RF
//! power table and the three advertising payload decoders. Transport-facing
//! code lives in `atc-core`.
//!
//! # Example
//!
//! ```
//! use atc_types::{AdvertisingFormat, Reading, advertising};
//!
//! let mut reading = Reading::default();
//! advertising::decode(
//!     AdvertisingFormat::BtHome,
//!     &[0x05, 0x16, 0xD2, 0xFC, 0x01, 0x64],
//!     &mut reading,
//! )
//! .unwrap();
//! assert_eq!(reading.battery_level, 100);
//! ```

pub mod advertising;
pub mod error;
pub mod power;
pub mod settings;
pub mod types;
pub mod uuid;

pub use error::{ParseError, ParseResult};
pub use power::RfTxPower;
pub use settings::{AdvertisingFormat, DeviceSettings, HwVersion, Smiley};
pub use types::{ConnectionMode, Reading};
