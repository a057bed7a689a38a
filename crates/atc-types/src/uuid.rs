//! Bluetooth UUIDs for ATC/pvvx thermometers.
//!
//! All identifiers are standard 16-bit Bluetooth SIG values (or the vendor
//! command pair used by the custom firmware) expanded onto the base UUID.

use uuid::{Uuid, uuid};

/// Expand a 16-bit Bluetooth SIG identifier onto the Bluetooth base UUID.
#[must_use]
pub const fn from_u16(short: u16) -> Uuid {
    Uuid::from_u128(0x0000_0000_0000_1000_8000_0080_5f9b_34fb | ((short as u128) << 96))
}

/// Extract the 16-bit short form of a UUID built on the Bluetooth base UUID.
///
/// Returns `None` for UUIDs outside the base range.
#[must_use]
pub fn to_u16(uuid: Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    let base_mask = !(0xffff_u128 << 96);
    if value & base_mask == from_u16(0).as_u128() {
        Some((value >> 96) as u16)
    } else {
        None
    }
}

// --- Environmental sensing ---

/// Environmental Sensing service, also the service-data UUID of the pvvx advertising format.
pub const ENVIRONMENTAL_SENSING_SERVICE: Uuid = uuid!("0000181a-0000-1000-8000-00805f9b34fb");

/// Temperature characteristic (0.1 °C resolution).
pub const TEMPERATURE: Uuid = uuid!("00002a1f-0000-1000-8000-00805f9b34fb");

/// Temperature characteristic (0.01 °C resolution).
pub const TEMPERATURE_PRECISE: Uuid = uuid!("00002a6e-0000-1000-8000-00805f9b34fb");

/// Humidity characteristic (0.01 % resolution).
pub const HUMIDITY: Uuid = uuid!("00002a6f-0000-1000-8000-00805f9b34fb");

// --- Battery ---

/// Battery service.
pub const BATTERY_SERVICE: Uuid = uuid!("0000180f-0000-1000-8000-00805f9b34fb");

/// Battery level characteristic.
pub const BATTERY_LEVEL: Uuid = uuid!("00002a19-0000-1000-8000-00805f9b34fb");

// --- Vendor command channel ---

/// Command service exposed by the custom firmware.
pub const COMMAND_SERVICE: Uuid = uuid!("00001f10-0000-1000-8000-00805f9b34fb");

/// Command characteristic used for the settings exchange.
pub const COMMAND: Uuid = uuid!("00001f1f-0000-1000-8000-00805f9b34fb");

// --- Advertising ---

/// Short form of the Environmental Sensing service UUID as carried in pvvx frames.
pub const ENVIRONMENTAL_SENSING_SHORT: u16 = 0x181a;

/// Short form of the BTHome service-data UUID.
pub const BTHOME_SHORT: u16 = 0xfcd2;

/// BTHome service-data UUID.
pub const BTHOME_SERVICE: Uuid = uuid!("0000fcd2-0000-1000-8000-00805f9b34fb");
