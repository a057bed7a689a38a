//! Command bytes written to the `0x1F1F` command characteristic.
//!
//! Every command is answered by a notification on the same characteristic.

use bytes::{BufMut, BytesMut};

use atc_types::settings::SETTINGS_OPCODE;

/// Read the settings record.
/// Format: `[READ_SETTINGS]`, answered by the 13-byte record.
pub const READ_SETTINGS: u8 = SETTINGS_OPCODE;

/// Write the settings record.
/// Format: `[WRITE_SETTINGS, 0x0A, ...10 bytes]`, answered by the stored record.
pub const WRITE_SETTINGS: u8 = SETTINGS_OPCODE;

/// Restore factory settings.
/// Format: `[RESET_SETTINGS]`
pub const RESET_SETTINGS: u8 = 0x56;

/// Set the device clock.
/// Format: `[SET_CLOCK, t0, t1, t2, t3]` with Unix seconds little-endian.
pub const SET_CLOCK: u8 = 0x23;

/// Request the stored settings.
pub fn read_settings() -> Vec<u8> {
    vec![READ_SETTINGS]
}

/// Request a factory reset.
pub fn reset_settings() -> Vec<u8> {
    vec![RESET_SETTINGS]
}

/// Set the device clock to `unix_seconds`.
pub fn set_clock(unix_seconds: u32) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(5);
    buf.put_u8(SET_CLOCK);
    buf.put_u32_le(unix_seconds);
    buf.to_vec()
}
