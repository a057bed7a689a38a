//! Advertising payload decoders.
//!
//! The firmware broadcasts measurements in one of three formats, selected by
//! [`AdvertisingFormat`]. Each decoder takes the raw advertising payload and
//! updates a [`Reading`] in place. Payloads come straight off the air, so
//! every multi-byte read is bounds-checked against the bytes that are
//! actually present.
//!
//! # Formats
//!
//! - **ATC1441**: fixed big-endian layout, 0.1 °C temperature, whole-percent humidity.
//! - **pvvx**: fixed little-endian layout inside an Environmental Sensing
//!   service-data structure, 0.01 resolution.
//! - **BTHome**: a stream of AD structures whose service data carries
//!   `(object id, value)` pairs.

use bytes::Buf;

use crate::error::{ParseError, ParseResult};
use crate::settings::AdvertisingFormat;
use crate::types::Reading;
use crate::uuid::{BTHOME_SHORT, ENVIRONMENTAL_SENSING_SHORT};

/// Minimum length of an ATC1441 payload.
pub const ATC1441_MIN_LEN: usize = 18;

/// Minimum length of a pvvx payload.
pub const PVVX_MIN_LEN: usize = 19;

/// Minimum length of a BTHome payload.
pub const BTHOME_MIN_LEN: usize = 6;

/// Declared AD structure length of a pvvx frame.
pub const PVVX_STRUCT_SIZE: u8 = 18;

/// AD type for 16-bit UUID service data.
pub const AD_TYPE_SERVICE_DATA: u8 = 0x16;

/// BTHome object ids understood by [`decode_bthome`].
pub mod object {
    pub const PACKET_ID: u8 = 0x00;
    pub const BATTERY: u8 = 0x01;
    pub const TEMPERATURE: u8 = 0x02;
    pub const HUMIDITY: u8 = 0x03;
    pub const VOLTAGE: u8 = 0x0C;

    /// Value width in bytes, or `None` for an id whose width is unknown.
    #[must_use]
    pub fn width(id: u8) -> Option<usize> {
        match id {
            PACKET_ID | BATTERY => Some(1),
            TEMPERATURE | HUMIDITY | VOLTAGE => Some(2),
            _ => None,
        }
    }
}

/// Decode `payload` with the decoder for `format`.
///
/// # Errors
///
/// Returns [`ParseError::UnknownValue`] for [`AdvertisingFormat::Xiaomi`],
/// which has no decoder, [`ParseError::InvalidData`] for a BTHome payload
/// that carries no known field, or the error of the selected decoder.
pub fn decode(format: AdvertisingFormat, payload: &[u8], reading: &mut Reading) -> ParseResult<()> {
    match format {
        AdvertisingFormat::Atc1441 => decode_atc1441(payload, reading),
        AdvertisingFormat::Pvvx => decode_pvvx(payload, reading),
        AdvertisingFormat::BtHome => match decode_bthome(payload, reading)? {
            0 => Err(ParseError::InvalidData(
                "no BTHome fields in payload".to_string(),
            )),
            _ => Ok(()),
        },
        AdvertisingFormat::Xiaomi => Err(ParseError::UnknownValue {
            field: "advertising format",
            value: format.to_u8(),
        }),
    }
}

/// Decode an ATC1441 frame.
///
/// Updates `temperature`, `humidity`, `battery_level` and
/// `battery_millivolts`. `temperature_precise` is left untouched. Nothing is
/// written when the frame is rejected.
pub fn decode_atc1441(payload: &[u8], reading: &mut Reading) -> ParseResult<()> {
    ParseError::check_length(payload, ATC1441_MIN_LEN)?;

    let mut buf = &payload[10..16];
    let temperature = buf.get_i16();
    let humidity = buf.get_u8();
    let battery_level = buf.get_u8();
    let battery_millivolts = buf.get_u16();

    reading.temperature = f32::from(temperature) * 0.1;
    reading.humidity = f32::from(humidity);
    reading.battery_level = battery_level;
    reading.battery_millivolts = battery_millivolts;
    Ok(())
}

/// Decode a pvvx frame.
///
/// The structure size, AD type and service UUID are all checked before any
/// field is read. Updates `temperature_precise`, `humidity`,
/// `battery_millivolts` and `battery_level`.
pub fn decode_pvvx(payload: &[u8], reading: &mut Reading) -> ParseResult<()> {
    ParseError::check_length(payload, PVVX_MIN_LEN)?;

    if payload[0] != PVVX_STRUCT_SIZE {
        return Err(ParseError::InvalidHeader {
            field: "structure size",
            expected: u16::from(PVVX_STRUCT_SIZE),
            actual: u16::from(payload[0]),
        });
    }
    if payload[1] != AD_TYPE_SERVICE_DATA {
        return Err(ParseError::InvalidHeader {
            field: "AD type",
            expected: u16::from(AD_TYPE_SERVICE_DATA),
            actual: u16::from(payload[1]),
        });
    }
    let uuid = u16::from_le_bytes([payload[2], payload[3]]);
    if uuid != ENVIRONMENTAL_SENSING_SHORT {
        return Err(ParseError::InvalidHeader {
            field: "service UUID",
            expected: ENVIRONMENTAL_SENSING_SHORT,
            actual: uuid,
        });
    }

    let mut buf = &payload[10..17];
    let temperature = buf.get_i16_le();
    let humidity = buf.get_u16_le();
    let battery_millivolts = buf.get_u16_le();
    let battery_level = buf.get_u8();

    reading.temperature_precise = f32::from(temperature) * 0.01;
    reading.humidity = f32::from(humidity) * 0.01;
    reading.battery_millivolts = battery_millivolts;
    reading.battery_level = battery_level;
    Ok(())
}

/// Decode a BTHome frame.
///
/// This is a stream decoder: fields are applied as they are found, and a
/// malformed structure stops the scan without undoing earlier fields.
///
/// - A zero length byte ends the scan.
/// - A structure longer than the remaining payload ends the scan.
/// - Service data with a different UUID is skipped.
/// - An unknown object id skips the rest of its structure.
/// - A value running past the end of its structure is dropped.
///
/// Returns the number of fields applied.
pub fn decode_bthome(payload: &[u8], reading: &mut Reading) -> ParseResult<usize> {
    ParseError::check_length(payload, BTHOME_MIN_LEN)?;

    let mut applied = 0;
    let mut rest = payload;
    while let Some((&length, tail)) = rest.split_first() {
        let length = usize::from(length);
        if length == 0 {
            break;
        }
        if length > tail.len() {
            break;
        }
        let (structure, next) = tail.split_at(length);
        rest = next;

        let (ad_type, data) = (structure[0], &structure[1..]);
        if ad_type != AD_TYPE_SERVICE_DATA || data.len() < 2 {
            continue;
        }
        if u16::from_le_bytes([data[0], data[1]]) != BTHOME_SHORT {
            continue;
        }
        applied += apply_objects(&data[2..], reading);
    }
    Ok(applied)
}

fn apply_objects(mut objects: &[u8], reading: &mut Reading) -> usize {
    let mut applied = 0;
    while let Some((&id, tail)) = objects.split_first() {
        let Some(width) = object::width(id) else {
            break;
        };
        if width > tail.len() {
            break;
        }
        let (value, next) = tail.split_at(width);
        objects = next;

        match id {
            object::BATTERY => reading.battery_level = value[0],
            object::TEMPERATURE => {
                reading.temperature_precise =
                    f32::from(i16::from_le_bytes([value[0], value[1]])) * 0.01;
            }
            object::HUMIDITY => {
                reading.humidity = f32::from(u16::from_le_bytes([value[0], value[1]])) * 0.01;
            }
            object::VOLTAGE => {
                reading.battery_millivolts = u16::from_le_bytes([value[0], value[1]]);
            }
            // Packet id is informational only.
            _ => continue,
        }
        applied += 1;
    }
    applied
}

#[cfg(test)]
mod tests {
    //! Decoder tests.
    //!
    //! Frames are built by hand with the byte offsets of each format. The
    //! property tests check that arbitrary input never panics and that the
    //! fixed-layout formats read exactly the documented offsets.

    use super::*;
    use proptest::prelude::*;

    fn atc1441_frame(temp: i16, humidity: u8, battery: u8, mv: u16) -> [u8; 18] {
        let mut frame = [0u8; 18];
        frame[0] = 17;
        frame[1] = 0x16;
        frame[2..4].copy_from_slice(&0x181Au16.to_le_bytes());
        frame[4..10].copy_from_slice(&[0xA4, 0xC1, 0x38, 0x01, 0x02, 0x03]);
        frame[10..12].copy_from_slice(&temp.to_be_bytes());
        frame[12] = humidity;
        frame[13] = battery;
        frame[14..16].copy_from_slice(&mv.to_be_bytes());
        frame
    }

    fn pvvx_frame(temp: i16, humidity: u16, mv: u16, battery: u8) -> [u8; 19] {
        let mut frame = [0u8; 19];
        frame[0] = 18;
        frame[1] = 0x16;
        frame[2..4].copy_from_slice(&0x181Au16.to_le_bytes());
        frame[4..10].copy_from_slice(&[0x03, 0x02, 0x01, 0x38, 0xC1, 0xA4]);
        frame[10..12].copy_from_slice(&temp.to_le_bytes());
        frame[12..14].copy_from_slice(&humidity.to_le_bytes());
        frame[14..16].copy_from_slice(&mv.to_le_bytes());
        frame[16] = battery;
        frame
    }

    // --- ATC1441 ---

    #[test]
    fn test_atc1441_decode() {
        let mut reading = Reading {
            temperature_precise: 99.0,
            ..Default::default()
        };
        decode_atc1441(&atc1441_frame(215, 48, 87, 2950), &mut reading).unwrap();

        assert!((reading.temperature - 21.5).abs() < 0.001);
        assert_eq!(reading.humidity, 48.0);
        assert_eq!(reading.battery_level, 87);
        assert_eq!(reading.battery_millivolts, 2950);
        // Not carried by this format.
        assert_eq!(reading.temperature_precise, 99.0);
    }

    #[test]
    fn test_atc1441_negative_temperature() {
        let mut reading = Reading::default();
        decode_atc1441(&atc1441_frame(-123, 60, 50, 2800), &mut reading).unwrap();
        assert!((reading.temperature + 12.3).abs() < 0.001);
    }

    #[test]
    fn test_atc1441_too_short_leaves_reading() {
        let frame = atc1441_frame(215, 48, 87, 2950);
        let mut reading = Reading::default();
        let result = decode_atc1441(&frame[..17], &mut reading);
        assert_eq!(
            result,
            Err(ParseError::TooShort {
                expected: 18,
                actual: 17
            })
        );
        assert_eq!(reading, Reading::default());
    }

    // --- pvvx ---

    #[test]
    fn test_pvvx_decode() {
        let mut reading = Reading {
            temperature: 7.0,
            ..Default::default()
        };
        decode_pvvx(&pvvx_frame(2345, 4512, 3012, 95), &mut reading).unwrap();

        assert!((reading.temperature_precise - 23.45).abs() < 0.001);
        assert!((reading.humidity - 45.12).abs() < 0.001);
        assert_eq!(reading.battery_millivolts, 3012);
        assert_eq!(reading.battery_level, 95);
        assert_eq!(reading.temperature, 7.0);
    }

    #[test]
    fn test_pvvx_rejects_bad_size() {
        let mut frame = pvvx_frame(2345, 4512, 3012, 95);
        frame[0] = 17;
        let mut reading = Reading::default();
        let err = decode_pvvx(&frame, &mut reading).unwrap_err();
        assert!(matches!(
            err,
            ParseError::InvalidHeader {
                field: "structure size",
                ..
            }
        ));
        assert_eq!(reading, Reading::default());
    }

    #[test]
    fn test_pvvx_rejects_bad_ad_type() {
        let mut frame = pvvx_frame(2345, 4512, 3012, 95);
        frame[1] = 0xFF;
        let mut reading = Reading::default();
        assert!(decode_pvvx(&frame, &mut reading).is_err());
        assert_eq!(reading, Reading::default());
    }

    #[test]
    fn test_pvvx_rejects_bad_uuid() {
        let mut frame = pvvx_frame(2345, 4512, 3012, 95);
        frame[2..4].copy_from_slice(&0xFCD2u16.to_le_bytes());
        let mut reading = Reading::default();
        let err = decode_pvvx(&frame, &mut reading).unwrap_err();
        assert_eq!(
            err,
            ParseError::InvalidHeader {
                field: "service UUID",
                expected: 0x181A,
                actual: 0xFCD2,
            }
        );
    }

    #[test]
    fn test_pvvx_too_short() {
        let frame = pvvx_frame(2345, 4512, 3012, 95);
        let mut reading = Reading::default();
        assert!(decode_pvvx(&frame[..18], &mut reading).is_err());
    }

    // --- BTHome ---

    #[test]
    fn test_bthome_battery_only() {
        let mut reading = Reading {
            temperature_precise: 20.5,
            humidity: 40.0,
            ..Default::default()
        };
        let applied =
            decode_bthome(&[0x05, 0x16, 0xD2, 0xFC, 0x01, 0x64], &mut reading).unwrap();

        assert_eq!(applied, 1);
        assert_eq!(reading.battery_level, 100);
        assert_eq!(reading.temperature_precise, 20.5);
        assert_eq!(reading.humidity, 40.0);
    }

    #[test]
    fn test_bthome_full_frame() {
        let payload = [
            0x02, 0x01, 0x06, // flags structure, ignored
            0x10, 0x16, 0xD2, 0xFC, // service data header
            0x00, 0x2A, // packet id
            0x01, 0x59, // battery 89 %
            0x02, 0xCA, 0x08, // 22.50 °C
            0x03, 0xBF, 0x13, // 50.55 %
            0x0C, 0xB8, 0x0B, // 3000 mV
        ];
        let mut reading = Reading::default();
        let applied = decode_bthome(&payload, &mut reading).unwrap();

        assert_eq!(applied, 4);
        assert_eq!(reading.battery_level, 89);
        assert!((reading.temperature_precise - 22.5).abs() < 0.001);
        assert!((reading.humidity - 50.55).abs() < 0.001);
        assert_eq!(reading.battery_millivolts, 3000);
    }

    #[test]
    fn test_bthome_negative_temperature() {
        let mut payload = vec![0x06, 0x16, 0xD2, 0xFC, 0x02];
        payload.extend_from_slice(&(-550i16).to_le_bytes());
        let mut reading = Reading::default();
        decode_bthome(&payload, &mut reading).unwrap();
        assert!((reading.temperature_precise + 5.5).abs() < 0.001);
    }

    #[test]
    fn test_bthome_overlong_structure_keeps_earlier_fields() {
        let payload = [
            0x05, 0x16, 0xD2, 0xFC, 0x01, 0x32, // battery 50 %
            0x09, 0x16, 0xD2, 0xFC, 0x0C, 0xB8, // declares more than remains
        ];
        let mut reading = Reading::default();
        let applied = decode_bthome(&payload, &mut reading).unwrap();

        assert_eq!(applied, 1);
        assert_eq!(reading.battery_level, 50);
        assert_eq!(reading.battery_millivolts, 0);
    }

    #[test]
    fn test_bthome_zero_length_terminates() {
        let payload = [
            0x00, 0x05, 0x16, 0xD2, 0xFC, 0x01, 0x32, // after the terminator
        ];
        let mut reading = Reading::default();
        assert_eq!(decode_bthome(&payload, &mut reading).unwrap(), 0);
        assert_eq!(reading.battery_level, 0);
    }

    #[test]
    fn test_bthome_foreign_uuid_skips_structure() {
        let payload = [
            0x05, 0x16, 0x1A, 0x18, 0x01, 0x10, // not BTHome
            0x05, 0x16, 0xD2, 0xFC, 0x01, 0x20, // battery 32 %
        ];
        let mut reading = Reading::default();
        assert_eq!(decode_bthome(&payload, &mut reading).unwrap(), 1);
        assert_eq!(reading.battery_level, 32);
    }

    #[test]
    fn test_bthome_unknown_object_skips_rest_of_structure() {
        let payload = [
            0x07, 0x16, 0xD2, 0xFC, 0x01, 0x40, 0x45, 0x01, // battery, then unknown 0x45
            0x05, 0x16, 0xD2, 0xFC, 0x0C, 0x00, // truncated voltage pair
        ];
        let mut reading = Reading::default();
        let applied = decode_bthome(&payload, &mut reading).unwrap();

        assert_eq!(applied, 1);
        assert_eq!(reading.battery_level, 64);
        assert_eq!(reading.battery_millivolts, 0);
    }

    #[test]
    fn test_bthome_truncated_pair_dropped() {
        let payload = [0x06, 0x16, 0xD2, 0xFC, 0x01, 0x21, 0x02];
        let mut reading = Reading::default();
        assert_eq!(decode_bthome(&payload, &mut reading).unwrap(), 1);
        assert_eq!(reading.battery_level, 33);
        assert_eq!(reading.temperature_precise, 0.0);
    }

    #[test]
    fn test_bthome_too_short() {
        let mut reading = Reading::default();
        assert!(decode_bthome(&[0x04, 0x16, 0xD2, 0xFC, 0x00], &mut reading).is_err());
    }

    // --- Dispatch ---

    #[test]
    fn test_decode_dispatch() {
        let mut reading = Reading::default();
        decode(
            AdvertisingFormat::Atc1441,
            &atc1441_frame(100, 1, 2, 3),
            &mut reading,
        )
        .unwrap();
        assert!((reading.temperature - 10.0).abs() < 0.001);

        decode(
            AdvertisingFormat::Pvvx,
            &pvvx_frame(1234, 1, 2, 3),
            &mut reading,
        )
        .unwrap();
        assert!((reading.temperature_precise - 12.34).abs() < 0.001);

        decode(
            AdvertisingFormat::BtHome,
            &[0x05, 0x16, 0xD2, 0xFC, 0x01, 0x07],
            &mut reading,
        )
        .unwrap();
        assert_eq!(reading.battery_level, 7);
    }

    #[test]
    fn test_decode_bthome_without_fields() {
        // Flags plus a bare 0x181A UUID list: valid AD framing, nothing to apply.
        let mut reading = Reading::default();
        let result = decode(
            AdvertisingFormat::BtHome,
            &[0x02, 0x01, 0x06, 0x03, 0x03, 0x1A, 0x18],
            &mut reading,
        );
        assert!(matches!(result, Err(ParseError::InvalidData(_))));
        assert_eq!(reading, Reading::default());
    }

    #[test]
    fn test_decode_reserved_format() {
        let mut reading = Reading::default();
        assert!(decode(AdvertisingFormat::Xiaomi, &[0u8; 20], &mut reading).is_err());
        assert_eq!(reading, Reading::default());
    }

    proptest! {
        #[test]
        fn decoders_never_panic(data in proptest::collection::vec(any::<u8>(), 0..64)) {
            let mut reading = Reading::default();
            let _ = decode_atc1441(&data, &mut reading);
            let _ = decode_pvvx(&data, &mut reading);
            let _ = decode_bthome(&data, &mut reading);
        }

        #[test]
        fn atc1441_reads_documented_offsets(
            data in proptest::collection::vec(any::<u8>(), 18..40)
        ) {
            let mut reading = Reading::default();
            decode_atc1441(&data, &mut reading).unwrap();

            let raw = i16::from_be_bytes([data[10], data[11]]);
            prop_assert!((reading.temperature - f32::from(raw) * 0.1).abs() < 1e-3);
            prop_assert_eq!(reading.humidity, f32::from(data[12]));
            prop_assert_eq!(reading.battery_level, data[13]);
            prop_assert_eq!(reading.battery_millivolts, u16::from_be_bytes([data[14], data[15]]));
        }

        #[test]
        fn pvvx_rejects_any_bad_header(
            mut data in proptest::collection::vec(any::<u8>(), 19..40),
            which in 0usize..3,
            bad in any::<u8>(),
        ) {
            data[0] = 18;
            data[1] = 0x16;
            data[2] = 0x1A;
            data[3] = 0x18;
            let index = [0, 1, 3][which];
            prop_assume!(bad != data[index]);
            data[index] = bad;

            let mut reading = Reading::default();
            prop_assert!(decode_pvvx(&data, &mut reading).is_err());
            prop_assert_eq!(reading, Reading::default());
        }

        #[test]
        fn bthome_overlong_structure_never_errors(
            prefix_battery in any::<u8>(),
            declared in 8u8..=255,
            tail in proptest::collection::vec(any::<u8>(), 0..6),
        ) {
            let mut payload = vec![0x05, 0x16, 0xD2, 0xFC, 0x01, prefix_battery, declared];
            payload.extend_from_slice(&tail);

            let mut reading = Reading::default();
            prop_assert!(decode_bthome(&payload, &mut reading).is_ok());
            prop_assert_eq!(reading.battery_level, prefix_battery);
        }
    }
}
