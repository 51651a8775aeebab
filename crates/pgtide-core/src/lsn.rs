//! LSN (Log Sequence Number) type for PostgreSQL replication positions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A position in the PostgreSQL write-ahead log.
///
/// Held as a single 64-bit value; displayed in the server's split "X/Y"
/// hex form. Ordering follows WAL order, and a persisted checkpoint must
/// never move backwards.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Lsn(pub u64);

impl Lsn {
    /// The zero position, used before any position is known.
    pub const ZERO: Lsn = Lsn(0);

    /// Parse an LSN from "X/Y" format.
    pub fn parse(s: &str) -> Result<Lsn> {
        let parts: Vec<&str> = s.split('/').collect();
        if parts.len() != 2 {
            return Err(Error::InvalidLsn(s.to_string()));
        }

        let high =
            u64::from_str_radix(parts[0], 16).map_err(|_| Error::InvalidLsn(s.to_string()))?;
        let low =
            u64::from_str_radix(parts[1], 16).map_err(|_| Error::InvalidLsn(s.to_string()))?;
        if high > u32::MAX as u64 || low > u32::MAX as u64 {
            return Err(Error::InvalidLsn(s.to_string()));
        }

        Ok(Lsn((high << 32) | low))
    }

    /// The raw 64-bit value.
    pub fn value(self) -> u64 {
        self.0
    }

    /// Advance by a byte offset, saturating at the top of the range.
    pub fn advance(self, bytes: u64) -> Lsn {
        Lsn(self.0.saturating_add(bytes))
    }

    /// Distance in bytes from an earlier position (zero if `earlier` is ahead).
    pub fn delta(self, earlier: Lsn) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl FromStr for Lsn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Lsn> {
        Lsn::parse(s)
    }
}

impl From<u64> for Lsn {
    fn from(v: u64) -> Lsn {
        Lsn(v)
    }
}

impl From<Lsn> for u64 {
    fn from(lsn: Lsn) -> u64 {
        lsn.0
    }
}
