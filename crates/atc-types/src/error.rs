//! Error types for data parsing in atc-types.

use thiserror::Error;

/// Errors that can occur when decoding thermometer wire data.
///
/// This error type is platform-agnostic and does not include
/// BLE-specific errors (those belong in atc-core).
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// The buffer is shorter than the format requires.
    #[error("Payload too short: requires {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum number of bytes required.
        expected: usize,
        /// Number of bytes available.
        actual: usize,
    },

    /// A fixed header field did not carry the expected value.
    #[error("Invalid {field}: expected {expected:#06x}, got {actual:#06x}")]
    InvalidHeader {
        /// Name of the header field that failed validation.
        field: &'static str,
        /// The value the format requires.
        expected: u16,
        /// The value found in the payload.
        actual: u16,
    },

    /// A byte did not map to any known enumeration value.
    #[error("Unknown {field} value: {value}")]
    UnknownValue {
        /// Name of the enumeration.
        field: &'static str,
        /// The raw byte.
        value: u8,
    },

    /// Generic malformed data.
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

impl ParseError {
    /// Check the length of `data` against `expected`.
    pub(crate) fn check_length(data: &[u8], expected: usize) -> ParseResult<()> {
        if data.len() < expected {
            Err(ParseError::TooShort {
                expected,
                actual: data.len(),
            })
        } else {
            Ok(())
        }
    }
}

/// Result type alias using atc-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
