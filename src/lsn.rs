//! Log Sequence Number parsing and rendering
//!
//! A byte offset in PostgreSQL's WAL. Accepts a plain decimal/hex integer
//! literal on input, or the canonical `HH.../LL...` form (1-8 hex digits per
//! half, `(high << 32) | low`). `0` means "invalid / not yet known".

use crate::errors::{ReplicationError, ReplicationResult};
use std::fmt;
use std::str::FromStr;

/// A 64-bit WAL position. `Lsn(0)` is the "no explicit request" sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const INVALID: Lsn = Lsn(0);

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// The value the server should be asked to acknowledge: one past this
    /// position, or `0` if this LSN is the sentinel.
    pub fn succ_or_zero(self) -> Lsn {
        if self.0 == 0 { Lsn(0) } else { Lsn(self.0 + 1) }
    }

    /// Render in canonical `HH/LL` form, as required for `START_REPLICATION`
    /// and Standby Status Update logging.
    pub fn to_canonical(self) -> String {
        format!("{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_canonical())
    }
}

impl From<u64> for Lsn {
    fn from(v: u64) -> Self {
        Lsn(v)
    }
}

impl FromStr for Lsn {
    type Err = ReplicationError;

    fn from_str(s: &str) -> ReplicationResult<Self> {
        let s = s.trim();
        if let Some((hi, lo)) = s.split_once('/') {
            if hi.is_empty()
                || lo.is_empty()
                || hi.len() > 8
                || lo.len() > 8
                || !hi.chars().all(|c| c.is_ascii_hexdigit())
                || !lo.chars().all(|c| c.is_ascii_hexdigit())
            {
                return Err(ReplicationError::config(format!(
                    "malformed LSN literal: {s:?}"
                )));
            }
            let hi = u32::from_str_radix(hi, 16)
                .map_err(|_| ReplicationError::config(format!("malformed LSN literal: {s:?}")))?;
            let lo = u32::from_str_radix(lo, 16)
                .map_err(|_| ReplicationError::config(format!("malformed LSN literal: {s:?}")))?;
            return Ok(Lsn(((hi as u64) << 32) | lo as u64));
        }

        if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            let v = u64::from_str_radix(hex, 16)
                .map_err(|_| ReplicationError::config(format!("malformed LSN literal: {s:?}")))?;
            return Ok(Lsn(v));
        }

        s.parse::<u64>()
            .map(Lsn)
            .map_err(|_| ReplicationError::config(format!("malformed LSN literal: {s:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_parses_as_invalid_sentinel() {
        assert_eq!("0/0".parse::<Lsn>().unwrap(), Lsn(0));
        assert!(!Lsn(0).is_valid());
    }

    #[test]
    fn max_value_round_trips() {
        let lsn: Lsn = "FFFFFFFF/FFFFFFFF".parse().unwrap();
        assert_eq!(lsn.0, u64::MAX);
    }

    #[test]
    fn mixed_width_canonical_form() {
        let lsn: Lsn = "3B/6C036B08".parse().unwrap();
        assert_eq!(lsn.0, 255_215_233_800);
    }

    #[test]
    fn decimal_and_hex_integer_literals_parse() {
        assert_eq!("1234".parse::<Lsn>().unwrap(), Lsn(1234));
        assert_eq!("0x4d2".parse::<Lsn>().unwrap(), Lsn(1234));
    }

    #[test]
    fn parse_round_trip_property() {
        // Parsing the canonical rendering of any 64-bit value yields it back.
        for n in [0u64, 1, u32::MAX as u64, u64::MAX, 255_215_233_800] {
            let rendered = Lsn(n).to_canonical();
            let parsed: Lsn = rendered.parse().unwrap();
            assert_eq!(parsed.0, n);
        }
    }

    #[test]
    fn rejects_malformed_literals() {
        assert!("not-an-lsn".parse::<Lsn>().is_err());
        assert!("/ABC".parse::<Lsn>().is_err());
        assert!("123456789/0".parse::<Lsn>().is_err()); // hi half too long
    }

    #[test]
    fn succ_or_zero_matches_ack_rule() {
        assert_eq!(Lsn(0).succ_or_zero(), Lsn(0));
        assert_eq!(Lsn(41).succ_or_zero(), Lsn(42));
    }
}
