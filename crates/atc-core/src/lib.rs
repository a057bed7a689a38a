//! BLE session library for ATC/pvvx custom-firmware thermometers.
//!
//! This crate talks to Xiaomi-style LYWSD03MMC thermometers (and relatives)
//! running the ATC1441 or pvvx firmware. It keeps a cached view of each
//! thermometer's measurements and settings, and lets the caller choose how
//! fresh values are obtained.
//!
//! # Features
//!
//! - **Three read policies**: passive advertisements, notifications, or a
//!   characteristic read per call ([`ConnectionMode`](atc_types::ConnectionMode))
//! - **Settings exchange**: read, write and reset the 13-byte settings record
//!   over the command characteristic
//! - **Advertisement routing**: one scanner feeding many sessions
//! - **Pluggable transport**: btleplug on real hardware, scriptable mocks in
//!   tests
//!
//! # Platform Differences
//!
//! macOS hides Bluetooth addresses and reports `00:00:00:00:00:00`; the
//! btleplug backend identifies peripherals by their CoreBluetooth UUID there.
//! Linux and Windows use the MAC address.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use atc_core::{AdvertisingRouter, BleScanner, BleTransport, DeviceSession, RouterConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let router = AdvertisingRouter::new(RouterConfig::default());
//!     let session = Arc::new(DeviceSession::new(
//!         "A4:C1:38:12:34:56",
//!         BleTransport::new().await?,
//!     ));
//!     router.register(Arc::clone(&session));
//!     router.init_all().await;
//!
//!     let scanner = BleScanner::new().await?;
//!     router.scan_and_route(&scanner).await?;
//!     println!("{:.1} °C", session.temperature().await);
//!     Ok(())
//! }
//! ```

pub mod ble;
pub mod commands;
pub mod config;
pub mod error;
pub mod exchange;
pub mod mock;
pub mod retry;
pub mod router;
pub mod session;
pub mod transport;

pub use atc_types::uuid;

pub use ble::{BleScanner, BleTransport, ConnectionConfig};
pub use config::{
    ConfigError, MonitorConfig, RouterConfig, SensorConfig, SessionConfig, ValidationError,
};
pub use error::{Error, Result};
pub use exchange::{SettingsExchange, ensure_connected};
pub use mock::{MockOp, MockScanner, MockTransport};
pub use retry::{RetryConfig, with_retry};
pub use router::{AdvertisingRouter, RouteOutcome, RouteSummary};
pub use session::{DeviceSession, Measurement};
pub use transport::{Advertisement, CharacteristicHandle, NotificationHandler, Scanner, Transport};

pub use atc_types::{
    AdvertisingFormat, ConnectionMode, DeviceSettings, HwVersion, ParseError, Reading, RfTxPower,
    Smiley,
};
