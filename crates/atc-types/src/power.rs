//! RF transmit power codes.
//!
//! The firmware stores the radio output power as a register code. The table
//! below maps every code the firmware accepts to its output power in dBm.

use core::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Code/dBm pairs in the firmware's register enum order.
///
/// The high codes (3.01 dBm down to -50 dBm) come first, then the low codes
/// from 10.46 dBm down to 3.23 dBm. Inverse lookups walk this table in
/// order, so on an exact tie the earlier entry wins.
pub const POWER_TABLE: [(u8, f32); 52] = [
    (191, 3.01),
    (189, 2.81),
    (187, 2.61),
    (185, 2.39),
    (182, 1.99),
    (180, 1.73),
    (178, 1.45),
    (176, 1.17),
    (174, 0.90),
    (172, 0.58),
    (169, 0.04),
    (168, -0.14),
    (164, -0.97),
    (162, -1.42),
    (160, -1.89),
    (158, -2.48),
    (156, -3.03),
    (154, -3.61),
    (152, -4.26),
    (150, -5.03),
    (148, -5.81),
    (146, -6.67),
    (144, -7.65),
    (142, -8.65),
    (140, -9.89),
    (138, -11.4),
    (136, -13.29),
    (134, -15.88),
    (132, -19.27),
    (130, -25.18),
    (255, -30.0),
    (128, -50.0),
    (63, 10.46),
    (61, 10.29),
    (58, 10.01),
    (56, 9.81),
    (53, 9.48),
    (51, 9.24),
    (49, 8.97),
    (47, 8.73),
    (45, 8.44),
    (43, 8.13),
    (41, 7.79),
    (39, 7.41),
    (37, 7.02),
    (35, 6.60),
    (33, 6.14),
    (31, 5.65),
    (29, 5.13),
    (27, 4.57),
    (25, 3.94),
    (23, 3.23),
];

/// Radio transmit power as the raw firmware code.
///
/// Codes outside [`POWER_TABLE`] are kept as-is so a settings record
/// round trips, but they have no dBm value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RfTxPower(u8);

impl RfTxPower {
    /// Lowest supported output (-50 dBm).
    pub const MIN: Self = Self(128);
    /// Highest supported output (+10.46 dBm).
    pub const MAX: Self = Self(63);

    /// Wrap a raw register code.
    #[must_use]
    pub const fn from_u8(code: u8) -> Self {
        Self(code)
    }

    /// The raw register code.
    #[must_use]
    pub const fn to_u8(self) -> u8 {
        self.0
    }

    /// Whether the code appears in the power table.
    #[must_use]
    pub fn is_known(self) -> bool {
        self.dbm().is_some()
    }

    /// Output power in dBm, or `None` for a code the table does not list.
    #[must_use]
    pub fn dbm(self) -> Option<f32> {
        POWER_TABLE
            .iter()
            .find(|(code, _)| *code == self.0)
            .map(|(_, dbm)| *dbm)
    }

    /// Output power in dBm, with unknown codes reported as 0 dBm.
    #[must_use]
    pub fn dbm_or_zero(self) -> f32 {
        self.dbm().unwrap_or(0.0)
    }

    /// The table entry whose power is nearest to `dbm`.
    ///
    /// Exact matches return that entry. Among equidistant entries the first
    /// in table order wins. NaN maps to the first entry.
    #[must_use]
    pub fn from_dbm(dbm: f32) -> Self {
        let mut best = POWER_TABLE[0];
        let mut best_distance = (best.1 - dbm).abs();
        for entry in &POWER_TABLE[1..] {
            let distance = (entry.1 - dbm).abs();
            if distance < best_distance {
                best = *entry;
                best_distance = distance;
            }
        }
        Self(best.0)
    }
}

impl Default for RfTxPower {
    /// Firmware default of 0.04 dBm.
    fn default() -> Self {
        Self(169)
    }
}

impl From<u8> for RfTxPower {
    fn from(code: u8) -> Self {
        Self(code)
    }
}

impl From<RfTxPower> for u8 {
    fn from(power: RfTxPower) -> Self {
        power.0
    }
}

impl fmt::Display for RfTxPower {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.dbm() {
            Some(dbm) => write!(f, "{dbm:.2} dBm"),
            None => write!(f, "unknown power code {}", self.0),
        }
    }
}
